use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{StreamExt, future, stream};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;

use super::{KeyValueStore, StoreError, StoreNode, WatchEvent, WatchEventKind, WatchStream};

/// 内存存储配置
#[derive(Debug, Clone)]
pub struct MemoryStoreConfig {
    /// 过期键扫描间隔
    pub reap_interval: Duration,
    /// 变更广播通道容量
    pub channel_capacity: usize,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            reap_interval: Duration::from_millis(50),
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

#[derive(Debug)]
struct Inner {
    entries: DashMap<String, Entry>,
    events: broadcast::Sender<WatchEvent>,
    available: AtomicBool,
    // 取消后所有已打开的 watch 流以 WatchClosed 结束
    disconnect: Mutex<CancellationToken>,
}

impl Inner {
    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store marked unavailable".to_string()))
        }
    }

    fn emit(&self, kind: WatchEventKind, key: &str) {
        // 没有订阅者时发送失败，忽略即可
        let _ = self.events.send(WatchEvent {
            kind,
            key: key.to_string(),
        });
    }

    fn live_value(&self, key: &str, now: Instant) -> Option<String> {
        let entry = self.entries.get(key).map(|e| e.value().clone())?;
        (!entry.is_expired(now)).then_some(entry.value)
    }

    fn reap_expired(&self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();

        for key in expired {
            if self
                .entries
                .remove_if(&key, |_, entry| entry.is_expired(now))
                .is_some()
            {
                tracing::debug!(key = %key, "Key lease expired");
                self.emit(WatchEventKind::Expire, &key);
            }
        }
    }
}

/// 带 TTL 租约与前缀监听的进程内键值存储
///
/// 所有克隆共享同一份数据，多个基于克隆构建的注册中心相当于共享同一集群的实例。
/// 必须在 Tokio 运行时内创建，过期扫描任务在最后一个克隆释放后退出。
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default())
    }

    pub fn with_config(config: MemoryStoreConfig) -> Self {
        let (events, _) = broadcast::channel(config.channel_capacity.max(1));
        let inner = Arc::new(Inner {
            entries: DashMap::new(),
            events,
            available: AtomicBool::new(true),
            disconnect: Mutex::new(CancellationToken::new()),
        });

        Self::start_reaper(Arc::downgrade(&inner), config.reap_interval);

        Self { inner }
    }

    // 启动过期清理任务
    fn start_reaper(inner: Weak<Inner>, reap_interval: Duration) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(reap_interval.max(Duration::from_millis(1)));
            loop {
                interval.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.reap_expired();
            }
        });
    }

    /// 故障注入开关，不可用期间所有操作返回 [`StoreError::Unavailable`]，租约照常计时
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// 以 [`StoreError::WatchClosed`] 结束所有已打开的 watch 流
    pub fn disconnect_watchers(&self) {
        let mut guard = self
            .inner
            .disconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let previous = std::mem::replace(&mut *guard, CancellationToken::new());
        previous.cancel();
    }

    /// 未过期的键，按字典序排列
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .inner
            .entries
            .iter()
            .filter(|entry| !entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.ensure_available()?;
        Ok(self.inner.live_value(key, Instant::now()))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<Vec<StoreNode>, StoreError> {
        self.inner.ensure_available()?;
        let now = Instant::now();
        let mut nodes: Vec<StoreNode> = self
            .inner
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && !entry.value().is_expired(now))
            .map(|entry| StoreNode {
                key: entry.key().clone(),
                value: entry.value().value.clone(),
            })
            .collect();
        nodes.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(nodes)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.inner.ensure_available()?;
        let entry = Entry {
            value: value.to_string(),
            // 溢出的 TTL 视为永不过期
            expires_at: ttl.and_then(|ttl| Instant::now().checked_add(ttl)),
        };
        self.inner.entries.insert(key.to_string(), entry);
        self.inner.emit(WatchEventKind::Put, key);
        Ok(())
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<(), StoreError> {
        self.inner.ensure_available()?;

        let mut removed = Vec::new();
        if recursive {
            let dir = format!("{}/", key.trim_end_matches('/'));
            let matching: Vec<String> = self
                .inner
                .entries
                .iter()
                .filter(|entry| entry.key() == key || entry.key().starts_with(&dir))
                .map(|entry| entry.key().clone())
                .collect();
            for candidate in matching {
                if self.inner.entries.remove(&candidate).is_some() {
                    removed.push(candidate);
                }
            }
        } else if self.inner.entries.remove(key).is_some() {
            removed.push(key.to_string());
        }

        for key in removed {
            self.inner.emit(WatchEventKind::Delete, &key);
        }
        Ok(())
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream, StoreError> {
        self.inner.ensure_available()?;

        let receiver = self.inner.events.subscribe();
        let disconnect = self
            .inner
            .disconnect
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let prefix = prefix.to_string();

        let events = BroadcastStream::new(receiver)
            .take_until(disconnect.cancelled_owned())
            .filter_map(move |item| {
                let event = match item {
                    Ok(event) if event.key.starts_with(prefix.as_str()) => Some(Ok(event)),
                    Ok(_) => None,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        Some(Err(StoreError::WatchLagged(skipped)))
                    }
                };
                future::ready(event)
            })
            .chain(stream::once(future::ready(Err(StoreError::WatchClosed))));

        Ok(events.boxed())
    }
}
