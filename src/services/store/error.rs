use thiserror::Error;

/// 存储后端错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Watch channel closed")]
    WatchClosed,

    #[error("Watch channel lagged, {0} events skipped")]
    WatchLagged(u64),

    #[error("Store backend error: {0}")]
    Backend(String),
}
