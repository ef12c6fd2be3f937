use std::sync::{Arc, Mutex, PoisonError};

use crate::services::registry::RegistryError;

/// 接收后台任务的错误（监听循环、缓存重载、后台写入、续约），这些错误没有调用方可以返回
pub trait ErrorSink: Send + Sync + std::fmt::Debug {
    fn report(&self, context: &str, error: &RegistryError);
}

/// 默认实现：写入 tracing 日志
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ErrorSink for TracingSink {
    fn report(&self, context: &str, error: &RegistryError) {
        tracing::error!(context = %context, error = %error, "Registry background failure");
    }
}

/// 记录所有上报的错误，便于检查
#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    reports: Arc<Mutex<Vec<(String, String)>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按上报顺序排列的 `(context, 错误信息)`
    pub fn reports(&self) -> Vec<(String, String)> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn contexts(&self) -> Vec<String> {
        self.reports().into_iter().map(|(context, _)| context).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

impl ErrorSink for CollectingSink {
    fn report(&self, context: &str, error: &RegistryError) {
        tracing::debug!(context = %context, error = %error, "Collected registry failure");
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((context.to_string(), error.to_string()));
    }
}
