//! 注册命名空间的本地缓存及其变更监听

pub mod local;
pub mod watcher;

pub use local::{LocalCache, Snapshot, build_snapshot};
pub use watcher::ChangeWatcher;
