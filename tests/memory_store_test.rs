use std::time::Duration;

use futures::StreamExt;
use tokio::time::{sleep, timeout};

use service_discovery::services::store::{
    KeyValueStore, MemoryStore, MemoryStoreConfig, StoreError, StoreNode, WatchEventKind,
};

#[tokio::test]
async fn test_set_get_delete() {
    let store = MemoryStore::new();

    store.set("services/a/1", "one", None).await.expect("set failed");
    assert_eq!(
        store.get("services/a/1").await.expect("get failed"),
        Some("one".to_string())
    );

    store.set("services/a/1", "uno", None).await.expect("overwrite failed");
    assert_eq!(
        store.get("services/a/1").await.expect("get failed"),
        Some("uno".to_string())
    );

    store.delete("services/a/1", false).await.expect("delete failed");
    assert_eq!(store.get("services/a/1").await.expect("get failed"), None);
}

#[tokio::test]
async fn test_get_prefix_is_sorted_and_scoped() {
    let store = MemoryStore::new();
    store.set("services/b/2", "b2", None).await.expect("set failed");
    store.set("services/a/1", "a1", None).await.expect("set failed");
    store.set("services-options/a", "opts", None).await.expect("set failed");

    let nodes = store.get_prefix("services/").await.expect("get_prefix failed");
    assert_eq!(
        nodes,
        vec![
            StoreNode {
                key: "services/a/1".to_string(),
                value: "a1".to_string()
            },
            StoreNode {
                key: "services/b/2".to_string(),
                value: "b2".to_string()
            },
        ]
    );
}

#[tokio::test]
async fn test_recursive_delete() {
    let store = MemoryStore::new();
    store.set("services/a/1", "x", None).await.expect("set failed");
    store.set("services/a/2", "y", None).await.expect("set failed");
    store.set("services/ab/1", "z", None).await.expect("set failed");

    store.delete("services/a", true).await.expect("delete failed");

    assert_eq!(store.keys(), vec!["services/ab/1".to_string()]);
}

#[tokio::test]
async fn test_ttl_expiry() {
    let store = MemoryStore::new();
    store
        .set("services/a/1", "short", Some(Duration::from_millis(100)))
        .await
        .expect("set failed");
    store.set("services/a/2", "forever", None).await.expect("set failed");

    assert!(store.get("services/a/1").await.expect("get failed").is_some());

    sleep(Duration::from_millis(200)).await;

    assert!(store.get("services/a/1").await.expect("get failed").is_none());
    assert_eq!(store.keys(), vec!["services/a/2".to_string()]);
}

#[tokio::test]
async fn test_huge_ttl_never_expires() {
    let store = MemoryStore::new();
    store
        .set("services/a/1", "long", Some(Duration::MAX))
        .await
        .expect("set with an overflowing ttl must succeed");
    store
        .set("services/a/2", "long", Some(Duration::from_secs(u64::MAX)))
        .await
        .expect("set failed");

    sleep(Duration::from_millis(100)).await;

    assert_eq!(
        store.get("services/a/1").await.expect("get failed"),
        Some("long".to_string())
    );
    assert_eq!(store.keys().len(), 2);
}

#[tokio::test]
async fn test_zero_reap_interval_still_reaps() {
    let store = MemoryStore::with_config(MemoryStoreConfig {
        reap_interval: Duration::ZERO,
        ..MemoryStoreConfig::default()
    });
    let mut events = store.watch("services").await.expect("watch failed");

    store
        .set("services/a/1", "short", Some(Duration::from_millis(50)))
        .await
        .expect("set failed");

    // 过期事件只由后台清理任务发出
    let expired = timeout(Duration::from_secs(2), async {
        while let Some(event) = events.next().await {
            let event = event.expect("watch error");
            if event.kind == WatchEventKind::Expire {
                return event.key;
            }
        }
        String::new()
    })
    .await
    .expect("expire event not delivered");

    assert_eq!(expired, "services/a/1");
    assert!(store.keys().is_empty());
}

#[tokio::test]
async fn test_rewrite_replaces_lease() {
    let store = MemoryStore::new();
    store
        .set("k", "v", Some(Duration::from_millis(150)))
        .await
        .expect("set failed");
    sleep(Duration::from_millis(100)).await;
    store
        .set("k", "v", Some(Duration::from_millis(150)))
        .await
        .expect("set failed");
    sleep(Duration::from_millis(100)).await;

    assert!(store.get("k").await.expect("get failed").is_some());
}

#[tokio::test]
async fn test_watch_reports_changes_under_prefix() {
    let store = MemoryStore::new();
    let mut events = store.watch("services/").await.expect("watch failed");

    store.set("other/key", "ignored", None).await.expect("set failed");
    store
        .set("services/a/1", "v", Some(Duration::from_millis(50)))
        .await
        .expect("set failed");

    let put = timeout(Duration::from_secs(1), events.next())
        .await
        .expect("timeout waiting for put event")
        .expect("stream ended")
        .expect("stream error");
    assert_eq!(put.kind, WatchEventKind::Put);
    assert_eq!(put.key, "services/a/1");

    let expired = timeout(Duration::from_secs(1), events.next())
        .await
        .expect("timeout waiting for expire event")
        .expect("stream ended")
        .expect("stream error");
    assert_eq!(expired.kind, WatchEventKind::Expire);
    assert_eq!(expired.key, "services/a/1");
}

#[tokio::test]
async fn test_disconnect_ends_watch_streams() {
    let store = MemoryStore::new();
    let mut events = store.watch("services").await.expect("watch failed");

    store.disconnect_watchers();

    let item = timeout(Duration::from_secs(1), events.next())
        .await
        .expect("timeout waiting for close")
        .expect("stream ended without an error");
    assert_eq!(item, Err(StoreError::WatchClosed));
    assert!(events.next().await.is_none());

    // 断开后新的订阅正常工作
    let mut fresh = store.watch("services").await.expect("watch failed");
    store.set("services/a/1", "v", None).await.expect("set failed");
    let event = timeout(Duration::from_secs(1), fresh.next())
        .await
        .expect("timeout waiting for event")
        .expect("stream ended")
        .expect("stream error");
    assert_eq!(event.key, "services/a/1");
}

#[tokio::test]
async fn test_unavailable_store_fails_every_operation() {
    let store = MemoryStore::new();
    store.set_available(false);

    assert!(matches!(store.get("k").await, Err(StoreError::Unavailable(_))));
    assert!(matches!(store.get_prefix("").await, Err(StoreError::Unavailable(_))));
    assert!(matches!(store.set("k", "v", None).await, Err(StoreError::Unavailable(_))));
    assert!(matches!(store.delete("k", false).await, Err(StoreError::Unavailable(_))));
    assert!(store.watch("services").await.is_err());

    store.set_available(true);
    store.set("k", "v", None).await.expect("store should recover");
}

#[tokio::test]
async fn test_clones_share_data() {
    let store = MemoryStore::new();
    let other = store.clone();

    store.set("services/a/1", "v", None).await.expect("set failed");
    assert_eq!(
        other.get("services/a/1").await.expect("get failed"),
        Some("v".to_string())
    );
}
