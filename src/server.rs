use std::sync::Arc;

use crate::config::{Config, StoreBackend, StoreConfig};
use crate::services::Registry;
use crate::services::store::{KeyValueStore, MemoryStore};

pub async fn build_store(
    config: &StoreConfig,
) -> Result<Arc<dyn KeyValueStore>, Box<dyn std::error::Error>> {
    match config.backend {
        StoreBackend::Memory => {
            tracing::warn!("Using in-process memory store, registrations are not shared across processes");
            Ok(Arc::new(MemoryStore::new()))
        }
        #[cfg(feature = "etcd")]
        StoreBackend::Etcd => {
            let store = crate::services::store::EtcdStore::connect(&config.endpoints).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "etcd"))]
        StoreBackend::Etcd => Err("etcd backend requires building with the `etcd` feature".into()),
    }
}

pub async fn start(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let store = build_store(&config.store).await?;
    let registry = Registry::new(store, config.registry_options()).await;

    // 按配置自注册并定期续约
    let announced = match &config.announce {
        Some(announce) => {
            let id = registry.register(
                &announce.name,
                announce.connection.clone(),
                announce.options.clone(),
            )?;
            let keepalive = registry.spawn_keepalive(&announce.name, &id, config.renew_interval());
            tracing::info!(
                service_name = %announce.name,
                service_id = %id,
                renew_interval_secs = config.renew_interval().as_secs(),
                "Announced service"
            );
            Some((announce.name.clone(), id, keepalive))
        }
        None => None,
    };

    tracing::info!(backend = ?config.store.backend, "Service discovery running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    if let Some((name, id, keepalive)) = announced {
        keepalive.cancel();
        if let Err(e) = registry.unregister(&name, &id).await {
            tracing::warn!(service_name = %name, error = %e, "Failed to unregister on shutdown");
        }
    }

    registry.shutdown().await;
    Ok(())
}
