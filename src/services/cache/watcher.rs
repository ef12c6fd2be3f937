use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::local::LocalCache;
use crate::services::registry::RegistryError;
use crate::services::registry::types::SERVICES_SEGMENT;
use crate::services::retry::Backoff;
use crate::services::sink::ErrorSink;
use crate::services::store::{KeyValueStore, StoreError};

/// 让 [`LocalCache`] 与存储保持一致
///
/// 每个变更事件都触发一次全量重载。通道错误上报给 sink 后不会终止循环：
/// 订阅丢失或重载失败时缓存视为脏数据，按退避间隔重新订阅并全量重载。
/// 只有取消令牌能结束 watcher。
#[derive(Debug)]
pub struct ChangeWatcher {
    store: Arc<dyn KeyValueStore>,
    cache: Arc<LocalCache>,
    sink: Arc<dyn ErrorSink>,
    reconnect: Backoff,
    token: CancellationToken,
}

impl ChangeWatcher {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        cache: Arc<LocalCache>,
        sink: Arc<dyn ErrorSink>,
        reconnect: Backoff,
        token: CancellationToken,
    ) -> Self {
        Self {
            store,
            cache,
            sink,
            reconnect,
            token,
        }
    }

    pub fn spawn(self, tracker: &TaskTracker) {
        tracker.spawn(self.run());
    }

    pub async fn run(self) {
        // 不带斜杠，同时覆盖 services/ 与 services-options/
        let prefix = SERVICES_SEGMENT;
        let mut failures: u32 = 0;

        loop {
            if self.token.is_cancelled() {
                break;
            }

            match self.store.watch(prefix).await {
                Ok(mut events) => {
                    tracing::debug!(prefix = %prefix, "Watching registry namespace");
                    // 订阅期间错过的事件只能靠全量重载补齐
                    if self.reload().await {
                        failures = 0;

                        loop {
                            let next = tokio::select! {
                                biased;
                                _ = self.token.cancelled() => return,
                                next = events.next() => next,
                            };

                            let reloaded = match next {
                                Some(Ok(event)) => {
                                    tracing::debug!(
                                        key = %event.key,
                                        kind = ?event.kind,
                                        "Registry change detected"
                                    );
                                    self.reload().await
                                }
                                Some(Err(StoreError::WatchClosed)) | None => {
                                    self.sink
                                        .report("watch", &RegistryError::from(StoreError::WatchClosed));
                                    break;
                                }
                                Some(Err(e)) => {
                                    self.sink.report("watch", &RegistryError::from(e));
                                    self.reload().await
                                }
                            };

                            // 缓存已脏，走重连路径
                            if !reloaded {
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    self.sink.report("watch subscribe", &RegistryError::from(e));
                }
            }

            failures = failures.saturating_add(1);
            let delay = self.reconnect.delay(failures);
            tracing::warn!(
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "Watch channel lost or cache stale, reconnecting"
            );

            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        tracing::debug!("Change watcher stopped");
    }

    async fn reload(&self) -> bool {
        match self.cache.reload(self.store.as_ref(), self.sink.as_ref()).await {
            Ok(_) => true,
            Err(e) => {
                self.sink.report("cache reload", &e);
                false
            }
        }
    }
}
