//! Shared test harness for the integration suite: a tracing subscriber
//! initializer and a small farm-of-nodes builder over one shared
//! [`InProcessBackend`].

use regen_cache::backends::memory::InProcessBackend;
use regen_cache::{
    DistributedLockFactory, ExternalCache, FanOutBus, RegenerativeCacheManager,
    RegenerativeCacheManagerConfig,
};
use std::sync::{Arc, Once};

static TRACING: Once = Once::new();

/// Install a `tracing` subscriber once per test process. Reads `RUST_LOG`,
/// defaulting to `info`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_target(false)
            .with_test_writer()
            .init();
    });
}

/// Build a fresh shared backend standing in for the farm's external store,
/// distributed lock service, and fan-out bus.
pub fn shared_backend() -> Arc<InProcessBackend> {
    Arc::new(InProcessBackend::new())
}

/// Give the executor enough turns to drain a chain of spawned tasks (the
/// scheduler's background loop, the callback it spawns, the regeneration
/// it drives) after advancing a paused virtual clock past one or more
/// trigger firings.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Construct one node of a simulated farm: an independent
/// `RegenerativeCacheManager` sharing `backend` and `keyspace` with any
/// other node built the same way.
pub async fn node(backend: &Arc<InProcessBackend>, keyspace: &str, host: &str) -> Arc<RegenerativeCacheManager> {
    let mut config = RegenerativeCacheManagerConfig::new(keyspace);
    config.host = host.to_string();
    RegenerativeCacheManager::new(
        config,
        Arc::clone(backend) as Arc<dyn ExternalCache>,
        Arc::clone(backend) as Arc<dyn DistributedLockFactory>,
        Arc::clone(backend) as Arc<dyn FanOutBus>,
        None,
    )
    .await
    .expect("manager construction subscribes to its topic and should not fail against InProcessBackend")
}
