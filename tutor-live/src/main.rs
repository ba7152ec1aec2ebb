use std::error::Error;
use std::sync::Arc;

use tutor_live::config::ServerConfig;
use tutor_live::gateway::Gateway;
use tutor_live::identity::JwtIdentity;
use tutor_live::storage::{MemoryStore, RocksStore, RoomStore, StoreConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env()?;

    let store: Arc<dyn RoomStore> = match &config.storage_path {
        Some(path) => {
            let rocks = RocksStore::open(StoreConfig::new(path.clone()))?;
            log::info!("Room store open at {}", rocks.path().display());
            Arc::new(rocks)
        }
        None => {
            log::warn!("TUTOR_LIVE_STORAGE_PATH not set; rooms are kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let secret = config
        .jwt_secret
        .clone()
        .ok_or("TUTOR_LIVE_JWT_SECRET must be set")?;
    let identity = Arc::new(JwtIdentity::from_secret(secret.as_bytes()));

    let gateway = Arc::new(Gateway::new(config, Arc::clone(&store), identity));
    let maintenance = gateway.spawn_maintenance();

    tokio::select! {
        result = Arc::clone(&gateway).run() => result?,
        _ = tokio::signal::ctrl_c() => log::info!("Shutting down"),
    }

    maintenance.abort();
    if let Err(e) = store.flush() {
        log::error!("Room store flush failed: {e}");
    }
    let stats = gateway.stats().await;
    log::info!(
        "Served {} connection(s), {} refused, {} dropped as slow, {} room event(s) broadcast",
        stats.total_connections,
        stats.refused_handshakes,
        stats.slow_disconnects,
        stats.broadcasts_sent
    );
    Ok(())
}
