pub mod cache;
pub mod registry;
pub mod retry;
pub mod sink;
pub mod store;

pub use registry::{Registry, RegistryError, RegistryOptions, ServiceRecord};
