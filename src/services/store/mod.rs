//! 键值存储适配层
//!
//! 注册中心只通过 [`KeyValueStore`] 访问底层存储：
//! - `memory`: 带 TTL 过期与变更通知的进程内存储
//! - `etcd`: etcd v3 适配器（需启用 `etcd` feature）

pub mod error;
pub mod memory;
#[cfg(feature = "etcd")]
pub mod etcd;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

pub use error::StoreError;
pub use memory::{MemoryStore, MemoryStoreConfig};
#[cfg(feature = "etcd")]
pub use etcd::EtcdStore;

/// 前缀读取返回的叶子节点
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreNode {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
    Expire,
}

/// 被监听前缀下的一次变更
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub key: String,
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, StoreError>>;

/// 注册中心对底层存储的约定
///
/// 写入必须线性一致，监听事件最终送达，TTL 租约完全由存储负责。
#[async_trait]
pub trait KeyValueStore: Send + Sync + std::fmt::Debug + 'static {
    /// 读取单个键，不存在时返回 `Ok(None)`
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// 递归读取 `prefix` 下的所有叶子节点并展平
    async fn get_prefix(&self, prefix: &str) -> Result<Vec<StoreNode>, StoreError>;

    /// 写入 `key`，覆盖原有的值与租约
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn delete(&self, key: &str, recursive: bool) -> Result<(), StoreError>;

    /// 订阅 `prefix` 下的创建、更新、删除与过期事件
    async fn watch(&self, prefix: &str) -> Result<WatchStream, StoreError>;
}
