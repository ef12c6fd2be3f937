use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;

use super::error::RegistryError;
use super::types::{
    RegistryOptions, ServiceRecord, options_key, parse_record_key, record_key, service_prefix,
    validate_name,
};
use crate::services::cache::{ChangeWatcher, LocalCache};
use crate::services::sink::{ErrorSink, TracingSink};
use crate::services::store::KeyValueStore;

/// 基于 TTL 键值存储的服务注册中心
///
/// 查询优先走本地缓存（由变更监听保持同步），未命中时按重试策略读取存储。
/// 存活只由存储租约决定，未续约的记录到期即消失。
/// 克隆开销很小，所有克隆共享缓存与后台任务；最后一个克隆释放时后台任务随之停止。
#[derive(Debug, Clone)]
pub struct Registry {
    store: Arc<dyn KeyValueStore>,
    cache: Arc<LocalCache>,
    sink: Arc<dyn ErrorSink>,
    options: RegistryOptions,
    token: CancellationToken,
    tracker: TaskTracker,
    guard: Arc<DropGuard>,
}

/// 不阻止后台任务停止的注册中心句柄，供续约任务持有
#[derive(Debug, Clone)]
pub(super) struct WeakRegistry {
    store: Arc<dyn KeyValueStore>,
    cache: Arc<LocalCache>,
    sink: Arc<dyn ErrorSink>,
    options: RegistryOptions,
    token: CancellationToken,
    tracker: TaskTracker,
    guard: Weak<DropGuard>,
}

impl WeakRegistry {
    pub(super) fn upgrade(&self) -> Option<Registry> {
        let guard = self.guard.upgrade()?;
        Some(Registry {
            store: self.store.clone(),
            cache: self.cache.clone(),
            sink: self.sink.clone(),
            options: self.options.clone(),
            token: self.token.clone(),
            tracker: self.tracker.clone(),
            guard,
        })
    }
}

impl Registry {
    /// 加载命名空间到缓存并启动监听，错误通过 [`TracingSink`] 记录日志
    pub async fn new(store: Arc<dyn KeyValueStore>, options: RegistryOptions) -> Self {
        Self::with_sink(store, options, Arc::new(TracingSink)).await
    }

    pub async fn with_sink(
        store: Arc<dyn KeyValueStore>,
        options: RegistryOptions,
        sink: Arc<dyn ErrorSink>,
    ) -> Self {
        let token = CancellationToken::new();
        let registry = Self {
            store,
            cache: Arc::new(LocalCache::new()),
            sink,
            options,
            // 最后一个克隆释放时取消令牌，停止 watcher 与续约任务
            guard: Arc::new(token.clone().drop_guard()),
            token,
            tracker: TaskTracker::new(),
        };

        // 初始全量加载，失败时由回退读取兜底
        if let Err(e) = registry
            .cache
            .reload(registry.store.as_ref(), registry.sink.as_ref())
            .await
        {
            registry.sink.report("initial load", &e);
        }

        ChangeWatcher::new(
            registry.store.clone(),
            registry.cache.clone(),
            registry.sink.clone(),
            registry.options.watch_reconnect,
            registry.token.clone(),
        )
        .spawn(&registry.tracker);

        tracing::info!(
            cached_services = registry.cache.len(),
            ttl_secs = registry.options.ttl.as_secs_f64(),
            "Service registry started"
        );

        registry
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    /// 本地缓存中的服务名
    pub fn services(&self) -> Vec<String> {
        self.cache.names()
    }

    /// 注册 `name` 的一个实例，返回生成的 id
    ///
    /// 写入在后台执行，返回时记录未必已对读者可见；写入失败上报给错误 sink。
    /// 必须在 Tokio 运行时内调用。
    pub fn register(
        &self,
        name: &str,
        connection: Value,
        options: Option<Value>,
    ) -> Result<String, RegistryError> {
        validate_name(name)?;

        let record = ServiceRecord::new(name, connection);
        let value = serde_json::to_string(&record).map_err(RegistryError::Serialization)?;
        let options_value = options
            .map(|options| serde_json::to_string(&options))
            .transpose()
            .map_err(RegistryError::Serialization)?;

        let id = record.id().to_string();
        tracing::info!(service_name = %name, service_id = %id, "Registering service");

        let store = self.store.clone();
        let sink = self.sink.clone();
        let ttl = self.options.ttl;
        let key = record.key();
        let options_key = options_key(name);

        self.tracker.spawn(async move {
            if let Err(e) = store.set(&key, &value, Some(ttl)).await {
                sink.report("register", &RegistryError::from(e));
            }
            // 选项按服务名共享，不设置租约
            if let Some(options_value) = options_value {
                if let Err(e) = store.set(&options_key, &options_value, None).await {
                    sink.report("register options", &RegistryError::from(e));
                }
            }
        });

        Ok(id)
    }

    /// `name` 的全部存活记录
    ///
    /// 缓存中有记录时直接返回，否则按查询重试策略读取存储。
    /// 不会返回空列表，不存在时返回 [`RegistryError::NotFound`]。
    pub async fn get_service(&self, name: &str) -> Result<Vec<ServiceRecord>, RegistryError> {
        self.lookup(name, None).await
    }

    /// 可取消的 [`get_service`](Self::get_service)，`token` 取消后停止重试
    pub async fn get_service_cancellable(
        &self,
        name: &str,
        token: &CancellationToken,
    ) -> Result<Vec<ServiceRecord>, RegistryError> {
        self.lookup(name, Some(token)).await
    }

    pub async fn get_service_timeout(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Vec<ServiceRecord>, RegistryError> {
        tokio::time::timeout(timeout, self.lookup(name, None))
            .await
            .map_err(|_| RegistryError::Timeout)?
    }

    /// `name` 的第一条记录，不存在时返回 `None`
    pub async fn get_service_node(
        &self,
        name: &str,
    ) -> Result<Option<ServiceRecord>, RegistryError> {
        match self.get_service(name).await {
            Ok(records) => Ok(records.into_iter().next()),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// `name` 的注册选项，总是按选项重试策略读取存储（选项在记录之后写入）
    pub async fn get_service_options(&self, name: &str) -> Result<Value, RegistryError> {
        validate_name(name)?;

        let key = options_key(name);
        let key = key.as_str();
        self.options
            .options_retry
            .run(move |_| self.read_options(key))
            .await?
            .ok_or_else(|| RegistryError::not_found(name))
    }

    /// 用新租约重写 `name` 的记录 `id`
    ///
    /// 未知的名称、id 或存储中已过期的记录都直接忽略。
    /// 非事务操作，并发重写同一记录时以存储端顺序为准。
    pub async fn renew(&self, name: &str, id: &str) -> Result<(), RegistryError> {
        let records = match self.get_service(name).await {
            Ok(records) => records,
            Err(RegistryError::NotFound { .. } | RegistryError::InvalidName(_)) => {
                tracing::debug!(service_name = %name, service_id = %id, "Renew target not registered");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let Some(record) = records.into_iter().find(|record| record.id() == id) else {
            tracing::debug!(service_name = %name, service_id = %id, "Renew target not registered");
            return Ok(());
        };

        // 缓存可能滞后于存储，已过期的记录不能被续约复活
        if self.store.get(&record.key()).await?.is_none() {
            tracing::debug!(service_name = %name, service_id = %id, "Renew target already expired");
            return Ok(());
        }

        let value = serde_json::to_string(&record).map_err(RegistryError::Serialization)?;
        self.store
            .set(&record.key(), &value, Some(self.options.ttl))
            .await?;

        tracing::info!(service_name = %name, service_id = %id, "Renewed service lease");
        Ok(())
    }

    /// 立即删除一条记录而不等租约到期，用于实例优雅退出
    pub async fn unregister(&self, name: &str, id: &str) -> Result<(), RegistryError> {
        validate_name(name)?;
        self.store.delete(&record_key(name, id), false).await?;
        tracing::info!(service_name = %name, service_id = %id, "Unregistered service");
        Ok(())
    }

    /// 停止 watcher 与续约任务，并等待未完成的写入
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Service registry stopped");
    }

    pub(super) fn sink(&self) -> &Arc<dyn ErrorSink> {
        &self.sink
    }

    pub(super) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(super) fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub(super) fn downgrade(&self) -> WeakRegistry {
        WeakRegistry {
            store: self.store.clone(),
            cache: self.cache.clone(),
            sink: self.sink.clone(),
            options: self.options.clone(),
            token: self.token.clone(),
            tracker: self.tracker.clone(),
            guard: Arc::downgrade(&self.guard),
        }
    }

    async fn lookup(
        &self,
        name: &str,
        token: Option<&CancellationToken>,
    ) -> Result<Vec<ServiceRecord>, RegistryError> {
        validate_name(name)?;

        if let Some(records) = self.cache.get(name) {
            return Ok(records);
        }

        tracing::debug!(service_name = %name, "Cache miss, reading from store");
        let policy = self.options.lookup_retry;
        let read = move |_: u32| self.read_records(name);
        let found = match token {
            Some(token) => policy.run_until_cancelled(token, read).await?,
            None => policy.run(read).await?,
        };

        found.ok_or_else(|| RegistryError::not_found(name))
    }

    async fn read_records(&self, name: &str) -> Result<Option<Vec<ServiceRecord>>, RegistryError> {
        let nodes = self.store.get_prefix(&service_prefix(name)).await?;

        let mut records = Vec::with_capacity(nodes.len());
        for node in nodes {
            if parse_record_key(&node.key).is_none() {
                continue;
            }
            let record = serde_json::from_str::<ServiceRecord>(&node.value).map_err(|source| {
                RegistryError::MalformedRecord {
                    key: node.key.clone(),
                    source,
                }
            })?;
            records.push(record);
        }

        Ok((!records.is_empty()).then_some(records))
    }

    async fn read_options(&self, key: &str) -> Result<Option<Value>, RegistryError> {
        let Some(raw) = self.store.get(key).await? else {
            return Ok(None);
        };
        let options = serde_json::from_str(&raw).map_err(|source| RegistryError::MalformedRecord {
            key: key.to_string(),
            source,
        })?;
        Ok(Some(options))
    }
}
