use thiserror::Error;

use crate::services::store::StoreError;

/// 注册中心错误类型
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Service not found: {name}")]
    NotFound { name: String },

    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    #[error("Malformed record at {key}: {source}")]
    MalformedRecord {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("Invalid service name: {0:?}")]
    InvalidName(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out")]
    Timeout,
}

impl RegistryError {
    /// 可由重试策略吸收的临时错误
    pub fn is_transient(&self) -> bool {
        matches!(self, RegistryError::StoreUnavailable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound { .. })
    }

    pub(crate) fn not_found(name: &str) -> Self {
        RegistryError::NotFound {
            name: name.to_string(),
        }
    }
}
