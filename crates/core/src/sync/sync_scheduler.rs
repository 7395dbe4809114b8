//! Background scheduling for drain passes and connectivity probes.

use log::{debug, warn};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use super::connectivity::{ConnectivityMonitor, ConnectivityState};
use super::sync_engine::SyncEngine;
use super::sync_queue_model::SyncPassTrigger;
use super::sync_traits::RemoteAuthorityTrait;

/// Default cadence of periodic drain passes.
pub const SYNC_INTERVAL_SECS: u64 = 30;

/// Maximum jitter (seconds) added to periodic pass intervals.
pub const SYNC_INTERVAL_JITTER_SECS: u64 = 5;

/// Default cadence of remote health probes.
pub const CONNECTIVITY_PROBE_INTERVAL_SECS: u64 = 15;

fn jittered(interval: Duration, jitter_secs: u64) -> Duration {
    let jitter_ms = jitter_secs.saturating_mul(1000);
    if jitter_ms == 0 {
        return interval;
    }
    interval + Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
}

/// Waits out one interval, returning early when connectivity is restored.
/// Transitions to offline do not restart the interval. `None` once the monitor is gone.
async fn wait_for_trigger(
    connectivity: &mut watch::Receiver<ConnectivityState>,
    delay: Duration,
) -> Option<SyncPassTrigger> {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return Some(SyncPassTrigger::Periodic),
            changed = connectivity.changed() => {
                changed.ok()?;
                if connectivity.borrow_and_update().online {
                    return Some(SyncPassTrigger::ConnectivityRestored);
                }
            }
        }
    }
}

/// Owns the background loop that re-invokes the engine on a timer and whenever
/// connectivity comes back.
pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    interval: Duration,
    jitter_secs: u64,
    background_task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn new(engine: Arc<SyncEngine>, interval: Duration) -> Self {
        Self {
            engine,
            interval,
            jitter_secs: SYNC_INTERVAL_JITTER_SECS,
            background_task: Mutex::new(None),
        }
    }

    pub fn with_jitter_secs(mut self, jitter_secs: u64) -> Self {
        self.jitter_secs = jitter_secs;
        self
    }

    /// Starts the loop unless it is already running.
    pub async fn start(&self) {
        let mut guard = self.background_task.lock().await;
        if let Some(handle) = guard.as_ref() {
            if !handle.is_finished() {
                return;
            }
            guard.take();
        }

        let engine = Arc::clone(&self.engine);
        let interval = self.interval;
        let jitter_secs = self.jitter_secs;
        let mut connectivity = engine.connectivity().subscribe();

        let handle = tokio::spawn(async move {
            let mut trigger = SyncPassTrigger::Startup;
            loop {
                if let Err(err) = engine.request_sync(trigger).await {
                    warn!("[SyncScheduler] Pass failed: {}", err);
                }

                let delay = jittered(interval, jitter_secs);
                trigger = match wait_for_trigger(&mut connectivity, delay).await {
                    Some(trigger) => trigger,
                    None => {
                        debug!("[SyncScheduler] Connectivity monitor dropped; stopping");
                        return;
                    }
                };
            }
        });
        *guard = Some(handle);
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.background_task.lock().await.take() {
            handle.abort();
        }
    }

    pub async fn is_running(&self) -> bool {
        self.background_task
            .lock()
            .await
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

/// Periodically probes the remote authority and feeds the result to `monitor`.
pub fn spawn_connectivity_probe(
    remote: Arc<dyn RemoteAuthorityTrait>,
    monitor: ConnectivityMonitor,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let online = remote.probe().await;
            monitor.set_online(online);
        }
    })
}
