use aggregator::StreamAggregator;
use alerter::{NotificationService, OutboundHub};
use anyhow::Result;
use configuration::Settings;
use database::DbRepository;
use engine::{GeoCheckService, PassthroughCipher, ProxyScheduler, Supervisor};
use event_bus::EventBus;
use std::path::PathBuf;
use std::sync::Arc;
use strategies::{StrategyRegistry, StrategyServices};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!("lattice trading engine starting");
    let settings = Settings::from_env()?;

    // --- Shared collaborators, constructed once and passed by reference ---
    let pool = database::connect(&settings.database_url).await?;
    let repo = DbRepository::new(pool);

    let bus = EventBus::new(&settings.redis_url)?;
    let hub = Arc::new(OutboundHub::new(1024));
    let notifier = NotificationService::new(Some(repo.clone()), Arc::clone(&hub));

    let services = StrategyServices {
        repo: Some(repo.clone()),
        bus: Some(bus.clone()),
        notifier: Some(notifier.clone()),
    };

    let aggregator = Arc::new(StreamAggregator::new());
    let proxies = Arc::new(ProxyScheduler::new(settings.proxy_list()));
    let geo = GeoCheckService::new(settings.ignore_geo_check);
    let registry = StrategyRegistry::with_defaults(PathBuf::from(&settings.state_dir));

    // The envelope cipher is owned by the key-management service; the
    // engine binary falls back to the pass-through seam until one is wired.
    if settings.master_encryption_key.is_empty() {
        tracing::warn!("MASTER_ENCRYPTION_KEY is empty");
    }
    let cipher = Arc::new(PassthroughCipher);

    let supervisor = Supervisor::new(
        registry,
        Arc::clone(&aggregator),
        services,
        proxies,
        geo,
        cipher,
    );

    let kill_switch_task = supervisor.spawn_kill_switch_listener(bus.clone());

    let resumed = supervisor.init_and_resume_all().await?;
    tracing::info!(resumed, "startup recovery complete, engine is live");

    // The admin API gateway drives the supervisor from here; this binary
    // just keeps the engine alive until the process is told to stop.
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, stopping all bots");

    kill_switch_task.abort();
    supervisor.stop_all_bots().await;
    aggregator.stop().await;
    tracing::info!("lattice trading engine stopped");
    Ok(())
}
