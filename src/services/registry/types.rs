use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::error::RegistryError;
use crate::services::retry::{Backoff, RetryPolicy};

/// 服务记录所在的命名空间
pub const SERVICES_SEGMENT: &str = "services";
/// 服务选项所在的命名空间
pub const OPTIONS_SEGMENT: &str = "services-options";

/// 记录写入时默认使用的租约时长
pub const DEFAULT_TTL: Duration = Duration::from_secs(120);

// 服务实例记录：一个运行中的服务实例
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    id: String,
    name: String,
    connection: Value,
}

impl ServiceRecord {
    /// 为 `name` 创建记录并生成新 id
    pub fn new(name: impl Into<String>, connection: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            connection,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 注册时提供的连接信息，原样保存
    pub fn connection(&self) -> &Value {
        &self.connection
    }

    pub fn key(&self) -> String {
        record_key(&self.name, &self.id)
    }
}

/// `services/<name>/`
pub fn service_prefix(name: &str) -> String {
    format!("{SERVICES_SEGMENT}/{name}/")
}

/// `services/<name>/<id>`
pub fn record_key(name: &str, id: &str) -> String {
    format!("{SERVICES_SEGMENT}/{name}/{id}")
}

/// `services-options/<name>`
pub fn options_key(name: &str) -> String {
    format!("{OPTIONS_SEGMENT}/{name}")
}

/// 将记录键拆分为 `(name, id)`
pub fn parse_record_key(key: &str) -> Option<(&str, &str)> {
    let rest = key.strip_prefix(SERVICES_SEGMENT)?.strip_prefix('/')?;
    let (name, id) = rest.split_once('/')?;
    if name.is_empty() || id.is_empty() || id.contains('/') {
        return None;
    }
    Some((name, id))
}

// 服务名作为键的一段，不能为空或包含分隔符
pub(crate) fn validate_name(name: &str) -> Result<(), RegistryError> {
    if name.is_empty() || name.contains('/') {
        return Err(RegistryError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// 注册中心运行时配置
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// 每次写入记录时使用的租约时长
    pub ttl: Duration,
    /// getService 回退读取的重试策略
    pub lookup_retry: RetryPolicy,
    /// getServiceOptions 的重试策略
    pub options_retry: RetryPolicy,
    /// watch 断开后的重连间隔
    pub watch_reconnect: Backoff,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            lookup_retry: RetryPolicy::linear(5, Duration::from_millis(100)),
            options_retry: RetryPolicy::fixed(5, Duration::from_millis(100)),
            watch_reconnect: Backoff::Exponential {
                base: Duration::from_millis(200),
                max: Duration::from_secs(10),
            },
        }
    }
}
