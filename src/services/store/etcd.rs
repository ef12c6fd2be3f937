//! etcd v3 存储适配器

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, ConnectOptions, DeleteOptions, EventType, GetOptions, PutOptions, WatchOptions,
};
use futures::{StreamExt, stream};

use super::{KeyValueStore, StoreError, StoreNode, WatchEvent, WatchEventKind, WatchStream};

/// etcd 客户端封装
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore").finish_non_exhaustive()
    }
}

fn unavailable(error: etcd_client::Error) -> StoreError {
    StoreError::Unavailable(error.to_string())
}

impl EtcdStore {
    pub async fn connect(endpoints: &[String]) -> Result<Self, StoreError> {
        let options = ConnectOptions::new()
            .with_timeout(Duration::from_secs(5))
            .with_keep_alive(Duration::from_secs(30), Duration::from_secs(10));

        let client = Client::connect(endpoints, Some(options))
            .await
            .map_err(unavailable)?;

        tracing::info!(endpoints = ?endpoints, "Connected to etcd");
        Ok(Self { client })
    }

    // etcd 租约以秒为单位，不足一秒向上取整
    fn lease_seconds(ttl: Duration) -> i64 {
        let secs = ttl.as_secs().saturating_add(u64::from(ttl.subsec_nanos() > 0));
        i64::try_from(secs.max(1)).unwrap_or(i64::MAX)
    }
}

#[async_trait]
impl KeyValueStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut client = self.client.clone();
        let response = client.get(key, None).await.map_err(unavailable)?;

        match response.kvs().first() {
            Some(kv) => {
                let value = kv
                    .value_str()
                    .map_err(|e| StoreError::Backend(format!("Non UTF-8 value at {key}: {e}")))?;
                Ok(Some(value.to_string()))
            }
            None => Ok(None),
        }
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<StoreNode>, StoreError> {
        let mut client = self.client.clone();
        let response = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(unavailable)?;

        let mut nodes = Vec::with_capacity(response.kvs().len());
        for kv in response.kvs() {
            let key = kv
                .key_str()
                .map_err(|e| StoreError::Backend(format!("Non UTF-8 key: {e}")))?;
            let value = kv
                .value_str()
                .map_err(|e| StoreError::Backend(format!("Non UTF-8 value at {key}: {e}")))?;
            nodes.push(StoreNode {
                key: key.to_string(),
                value: value.to_string(),
            });
        }
        Ok(nodes)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut client = self.client.clone();

        let options = match ttl {
            Some(ttl) => {
                let lease = client
                    .lease_grant(Self::lease_seconds(ttl), None)
                    .await
                    .map_err(unavailable)?;
                Some(PutOptions::new().with_lease(lease.id()))
            }
            None => None,
        };

        client.put(key, value, options).await.map_err(unavailable)?;
        Ok(())
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<(), StoreError> {
        let mut client = self.client.clone();
        let options = recursive.then(|| DeleteOptions::new().with_prefix());
        client.delete(key, options).await.map_err(unavailable)?;
        Ok(())
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream, StoreError> {
        let mut client = self.client.clone();
        let (watcher, watch_stream) = client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(unavailable)?;

        // watcher 需与流同生命周期，否则服务端会取消监听
        let events = stream::unfold(
            Some((watcher, watch_stream)),
            |state| async move {
                let (watcher, mut watch_stream) = state?;
                match watch_stream.message().await {
                    Ok(Some(response)) => {
                        let events: Vec<Result<WatchEvent, StoreError>> = response
                            .events()
                            .iter()
                            .filter_map(|event| {
                                let key = event.kv()?.key_str().ok()?.to_string();
                                let kind = match event.event_type() {
                                    EventType::Put => WatchEventKind::Put,
                                    EventType::Delete => WatchEventKind::Delete,
                                };
                                Some(Ok(WatchEvent { kind, key }))
                            })
                            .collect();
                        Some((stream::iter(events), Some((watcher, watch_stream))))
                    }
                    Ok(None) => Some((stream::iter(vec![Err(StoreError::WatchClosed)]), None)),
                    Err(e) => Some((stream::iter(vec![Err(unavailable(e))]), None)),
                }
            },
        )
        .flatten();

        Ok(events.boxed())
    }
}
