//! 服务注册模块
//!
//! 按职责拆分为以下组件：
//! - `types`: 服务记录、键布局与运行时选项
//! - `error`: 注册中心错误类型
//! - `service`: 注册、查询与续约
//! - `keepalive`: 定期续约任务

pub mod error;
pub mod keepalive;
pub mod service;
pub mod types;

// Re-export public types for easier access
pub use error::RegistryError;
pub use service::Registry;
pub use types::{DEFAULT_TTL, OPTIONS_SEGMENT, RegistryOptions, SERVICES_SEGMENT, ServiceRecord};
