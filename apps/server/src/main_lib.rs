//! Application state and background task wiring.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use dairysync_core::entities::EntityService;
use dairysync_core::gateway::OfflineGateway;
use dairysync_core::sync::{
    spawn_connectivity_probe, ConnectivityMonitor, RemoteAuthorityTrait, SyncEngine,
    SyncQueueRepositoryTrait, SyncScheduler,
};
use dairysync_remote::RemoteClient;
use dairysync_storage_sqlite::{
    create_pool, init, run_migrations, spawn_writer, EntityRepository, GatewayRepository,
    SyncQueueRepository,
};

use crate::config::Config;

pub struct AppState {
    pub entities: EntityService,
    pub queue: Arc<dyn SyncQueueRepositoryTrait>,
    pub engine: Arc<SyncEngine>,
    pub scheduler: SyncScheduler,
    pub gateway: Arc<OfflineGateway>,
    pub connectivity: ConnectivityMonitor,
    pub remote: Arc<RemoteClient>,
}

/// Opens the database, runs migrations and wires every service.
///
/// Connectivity starts offline; `start_background` runs the first probe.
pub fn build_state(config: &Config) -> anyhow::Result<Arc<AppState>> {
    let data_dir = config.db_path.to_string_lossy().to_string();
    let db_path = init(&data_dir)?;
    run_migrations(&db_path)?;
    let pool = create_pool(&db_path)?;
    let writer = spawn_writer(pool.as_ref().clone());
    info!("Database ready at {}", db_path);

    let entity_repo = Arc::new(EntityRepository::new(pool.clone(), writer.clone()));
    let queue_repo = Arc::new(SyncQueueRepository::new(pool.clone(), writer.clone()));
    let gateway_repo = Arc::new(GatewayRepository::new(pool, writer));
    let remote = Arc::new(RemoteClient::new(&config.remote_url)?);
    let connectivity = ConnectivityMonitor::new(false);

    let engine = Arc::new(
        SyncEngine::new(
            queue_repo.clone(),
            entity_repo.clone(),
            remote.clone(),
            connectivity.clone(),
            config.engine.clone(),
        )
        .with_request_replay(gateway_repo.clone(), remote.clone()),
    );
    let gateway = Arc::new(OfflineGateway::new(
        remote.clone(),
        gateway_repo.clone(),
        gateway_repo,
        connectivity.clone(),
        config.cache_ttl(),
    ));

    Ok(Arc::new(AppState {
        entities: EntityService::new(entity_repo, config.center_id.clone()),
        queue: queue_repo,
        scheduler: SyncScheduler::new(engine.clone(), config.sync_interval),
        engine,
        gateway,
        connectivity,
        remote,
    }))
}

/// Probes once, then starts the scheduler, the connectivity probe and the cache janitor.
pub async fn start_background(state: &Arc<AppState>, config: &Config) -> Vec<JoinHandle<()>> {
    let online = state.remote.probe().await;
    state.connectivity.set_online(online);
    info!(
        "Remote authority {} is {}",
        state.remote.base_url(),
        if online { "reachable" } else { "unreachable" }
    );

    state.scheduler.start().await;

    let probe = spawn_connectivity_probe(
        state.remote.clone(),
        state.connectivity.clone(),
        config.probe_interval,
    );

    let gateway = state.gateway.clone();
    let janitor_every = config.sync_interval.max(config.probe_interval);
    let janitor = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(janitor_every);
        loop {
            ticker.tick().await;
            if let Err(err) = gateway.cleanup_expired().await {
                warn!("Response cache cleanup failed: {}", err);
            }
        }
    });

    vec![probe, janitor]
}
