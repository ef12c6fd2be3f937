use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::service::Registry;

impl Registry {
    /// 每隔 `interval` 续约一次 `name`/`id`，直到返回的令牌被取消或注册中心停止
    ///
    /// 续约失败上报给错误 sink。任务只持有弱句柄，不会让注册中心常驻。
    pub fn spawn_keepalive(&self, name: &str, id: &str, interval: Duration) -> CancellationToken {
        let stop = self.token().child_token();
        let handle = self.downgrade();
        let name = name.to_string();
        let id = id.to_string();
        let cancelled = stop.clone();

        self.tracker().spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            // 第一次 tick 立即返回，注册时刚写入过租约
            ticker.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(registry) = handle.upgrade() else {
                    break;
                };

                tracing::debug!(service_name = %name, service_id = %id, "Keep-alive renewing lease");
                if let Err(e) = registry.renew(&name, &id).await {
                    registry.sink().report("keepalive", &e);
                }
            }

            tracing::debug!(service_name = %name, service_id = %id, "Keep-alive stopped");
        });

        stop
    }
}
