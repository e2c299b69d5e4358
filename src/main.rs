//! instance-broker - per-visitor cloud instances with hexagonal architecture
//!
//! This is the composition root that wires together all the components.

use instance_broker::adapters::inbound::{Gateway, GatewayState};
use instance_broker::adapters::outbound::{
    DigitalOceanConfig, DigitalOceanProvider, InMemoryStore, JsonFileStore,
};
use instance_broker::application::{ClientRegistry, LifecycleManager};
use instance_broker::config::load_config;
use instance_broker::domain::ports::{SnapshotStore, SystemClock};
use instance_broker::infrastructure::{
    shutdown_signal, spawn_periodic, RateLimiter, ShutdownController,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::fmt::format::FmtSpan;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    tracing::info!(
        "starting instance-broker listen={} ttl={}s",
        cfg.listen_addr,
        cfg.instance_ttl_secs
    );

    if cfg.do_api_token.is_empty() {
        tracing::error!("CRITICAL: DO_API_TOKEN is not set, instance creation will fail");
    }
    if cfg.admin_key.is_none() {
        tracing::warn!("ADMIN_KEY is not set, admin API disabled");
    }

    // ===== COMPOSITION ROOT =====

    // 1. Outbound adapters
    let store: Arc<dyn SnapshotStore> = match &cfg.state_path {
        Some(path) => {
            tracing::info!("registry snapshot at {}", path);
            Arc::new(JsonFileStore::new(path))
        }
        None => {
            tracing::warn!("BROKER_STATE_PATH is empty, sessions will not survive restarts");
            Arc::new(InMemoryStore::new())
        }
    };

    let provider = Arc::new(DigitalOceanProvider::new(DigitalOceanConfig {
        api_url: cfg.do_api_url.clone(),
        token: cfg.do_api_token.clone(),
        ssh_key_ids: cfg.ssh_key_ids.clone(),
        ..Default::default()
    })?);

    let catalog = Arc::new(cfg.load_catalog()?);
    tracing::info!("serving applications: {}", catalog.names().join(", "));

    // 2. Application services
    let registry = Arc::new(ClientRegistry::open(store));
    let manager = Arc::new(LifecycleManager::new(
        registry.clone(),
        provider,
        catalog,
        Arc::new(SystemClock),
        cfg.policy(),
    ));

    // 3. Background tasks
    let shutdown = ShutdownController::new();

    let sweeper = manager.clone();
    let sweep_task = spawn_periodic("sweep", cfg.sweep_interval(), shutdown.clone(), move || {
        let manager = sweeper.clone();
        async move {
            manager.sweep_expired().await;
        }
    });

    let flusher = registry.clone();
    let flush_task = spawn_periodic("flush", cfg.flush_interval(), shutdown.clone(), move || {
        let registry = flusher.clone();
        async move {
            registry.flush();
        }
    });

    let limiter = Arc::new(RateLimiter::new(cfg.rate_limit()));
    let pruned = limiter.clone();
    let prune_task = spawn_periodic(
        "rate-limit-prune",
        Duration::from_secs(300),
        shutdown.clone(),
        move || {
            let limiter = pruned.clone();
            async move {
                limiter.cleanup(Duration::from_secs(600));
            }
        },
    );

    tokio::spawn(shutdown_signal(shutdown.clone()));

    // 4. Inbound adapter
    let gateway = Gateway::new(
        cfg.listen_addr.clone(),
        GatewayState::new(manager, limiter, cfg.admin_key.clone()),
    );
    let served = gateway.run(shutdown.clone()).await;

    // 5. Drain and final flush
    shutdown.shutdown();
    shutdown.wait_for_drain(DRAIN_TIMEOUT).await;
    for task in [sweep_task, flush_task, prune_task] {
        if let Err(e) = task.await {
            tracing::warn!("background task ended abnormally: {}", e);
        }
    }
    registry.flush();
    tracing::info!("registry flushed, bye");

    served
}
