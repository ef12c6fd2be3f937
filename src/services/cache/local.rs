use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use crate::services::registry::types::{SERVICES_SEGMENT, ServiceRecord, parse_record_key};
use crate::services::registry::RegistryError;
use crate::services::sink::ErrorSink;
use crate::services::store::{KeyValueStore, StoreNode};

/// 服务名 -> 服务实例列表
pub type Snapshot = HashMap<String, Vec<ServiceRecord>>;

/// `services/` 命名空间的内存镜像
///
/// 从不回写存储。每次变更都全量重建，再一次性替换，读者只会看到完整的旧映射或新映射。
#[derive(Debug, Default)]
pub struct LocalCache {
    snapshot: RwLock<Arc<Snapshot>>,
}

impl LocalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `name` 的记录，缓存中没有时返回 `None`
    pub fn get(&self, name: &str) -> Option<Vec<ServiceRecord>> {
        self.snapshot()
            .get(name)
            .filter(|records| !records.is_empty())
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.snapshot().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn replace(&self, snapshot: Snapshot) {
        *self
            .snapshot
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(snapshot);
    }

    /// 重新扫描整个命名空间并替换快照，返回缓存的服务名数量
    ///
    /// 格式错误的记录上报给 `sink`，对应的服务名不进入快照，直接读取时由调用方看到错误。
    /// 扫描失败时保留原快照。
    pub async fn reload(
        &self,
        store: &dyn KeyValueStore,
        sink: &dyn ErrorSink,
    ) -> Result<usize, RegistryError> {
        let nodes = store.get_prefix(&format!("{SERVICES_SEGMENT}/")).await?;
        let (snapshot, malformed) = build_snapshot(nodes);

        for error in &malformed {
            sink.report("cache reload", error);
        }

        let names = snapshot.len();
        self.replace(snapshot);

        tracing::debug!(
            service_count = names,
            malformed_count = malformed.len(),
            "Local cache reloaded"
        );
        Ok(names)
    }
}

/// 将存储节点按服务名分组并反序列化
pub fn build_snapshot(nodes: Vec<StoreNode>) -> (Snapshot, Vec<RegistryError>) {
    let mut snapshot = Snapshot::new();
    let mut broken = HashSet::new();
    let mut malformed = Vec::new();

    for node in nodes {
        let Some((name, _id)) = parse_record_key(&node.key) else {
            tracing::debug!(key = %node.key, "Ignoring key outside the record layout");
            continue;
        };

        match serde_json::from_str::<ServiceRecord>(&node.value) {
            Ok(record) => snapshot
                .entry(name.to_string())
                .or_insert_with(Vec::new)
                .push(record),
            Err(source) => {
                broken.insert(name.to_string());
                malformed.push(RegistryError::MalformedRecord {
                    key: node.key.clone(),
                    source,
                });
            }
        }
    }

    for name in broken {
        snapshot.remove(&name);
    }

    (snapshot, malformed)
}
