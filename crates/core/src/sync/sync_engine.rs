//! Queue drain engine: delivery, conflict handling, retry bookkeeping.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use super::connectivity::ConnectivityMonitor;
use super::sync_conflict::{is_remote_newer, remote_matches_local, ConflictStrategy};
use super::sync_queue_model::{
    DeliveryOutcome, SyncEngineStatus, SyncPassResult, SyncPassStatus, SyncPassTrigger,
    SyncQueueEntry,
};
use super::sync_retry::{retry_decision, DeliveryError, RetryDecision};
use super::sync_traits::{RemoteAuthorityTrait, SyncQueueRepositoryTrait};
use crate::entities::{EntityRepositoryTrait, EntityTable, SyncableRecord};
use crate::errors::Result;
use crate::gateway::{GatewayTransportTrait, RequestQueueEntry, RequestQueueRepositoryTrait};
use crate::utils::time_utils::{add_seconds, now_millis};

/// Default ceiling on delivery attempts before an entry is dead-lettered.
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: i32 = 12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncEngineConfig {
    pub conflict_strategy: ConflictStrategy,
    /// Zero disables dead-lettering of retryable failures.
    pub max_delivery_attempts: i32,
}

impl Default for SyncEngineConfig {
    fn default() -> Self {
        Self {
            conflict_strategy: ConflictStrategy::default(),
            max_delivery_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
        }
    }
}

/// Snapshot of engine and queue state for status endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusReport {
    pub online: bool,
    pub draining: bool,
    pub conflict_strategy: ConflictStrategy,
    pub engine: SyncEngineStatus,
}

/// Clears the draining flag when the pass ends, including on early return or unwind.
struct DrainGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> DrainGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

enum EntryOutcome {
    Delivered,
    Conflict { settled: bool },
    Failed { dead: bool, unreachable: bool },
}

/// Mutable counters for one pass.
#[derive(Default)]
struct PassCounters {
    processed: usize,
    failed: usize,
    conflicts: usize,
    dead_lettered: usize,
    deferred: usize,
    interrupted: bool,
}

impl PassCounters {
    fn record_failure(&mut self, dead: bool) {
        self.failed += 1;
        if dead {
            self.dead_lettered += 1;
        }
    }

    fn into_result(self, duration_ms: i64) -> SyncPassResult {
        let clean = self.failed == 0 && self.deferred == 0 && !self.interrupted;
        SyncPassResult {
            status: if clean {
                SyncPassStatus::Ok
            } else {
                SyncPassStatus::Partial
            },
            processed: self.processed,
            failed: self.failed,
            conflicts: self.conflicts,
            dead_lettered: self.dead_lettered,
            deferred: self.deferred,
            duration_ms,
        }
    }
}

/// Optional request-queue replay for gateway writes.
struct RequestReplay {
    queue: Arc<dyn RequestQueueRepositoryTrait>,
    transport: Arc<dyn GatewayTransportTrait>,
}

/// Drains the sync queue against the remote authority.
///
/// One instance owns one draining flag: at most one pass runs at a time per
/// engine, and a pass never blocks local writes.
pub struct SyncEngine {
    queue: Arc<dyn SyncQueueRepositoryTrait>,
    entities: Arc<dyn EntityRepositoryTrait>,
    remote: Arc<dyn RemoteAuthorityTrait>,
    connectivity: ConnectivityMonitor,
    config: SyncEngineConfig,
    requests: Option<RequestReplay>,
    draining: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        queue: Arc<dyn SyncQueueRepositoryTrait>,
        entities: Arc<dyn EntityRepositoryTrait>,
        remote: Arc<dyn RemoteAuthorityTrait>,
        connectivity: ConnectivityMonitor,
        config: SyncEngineConfig,
    ) -> Self {
        Self {
            queue,
            entities,
            remote,
            connectivity,
            config,
            requests: None,
            draining: AtomicBool::new(false),
        }
    }

    /// Also replays queued gateway writes at the end of each pass.
    pub fn with_request_replay(
        mut self,
        queue: Arc<dyn RequestQueueRepositoryTrait>,
        transport: Arc<dyn GatewayTransportTrait>,
    ) -> Self {
        self.requests = Some(RequestReplay { queue, transport });
        self
    }

    pub fn config(&self) -> &SyncEngineConfig {
        &self.config
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    pub fn status(&self) -> Result<SyncStatusReport> {
        Ok(SyncStatusReport {
            online: self.connectivity.is_online(),
            draining: self.is_draining(),
            conflict_strategy: self.config.conflict_strategy,
            engine: self.queue.get_engine_status()?,
        })
    }

    /// Runs one drain pass over the queue snapshot taken at its start.
    ///
    /// Skipped passes (`offline`, `in_progress`) are not persisted. Local
    /// storage failures abort the pass and are returned.
    pub async fn request_sync(&self, trigger: SyncPassTrigger) -> Result<SyncPassResult> {
        if !self.connectivity.is_online() {
            debug!("[SyncEngine] Pass skipped ({:?}): offline", trigger);
            return Ok(SyncPassResult::skipped(SyncPassStatus::Offline));
        }
        let _guard = match DrainGuard::acquire(&self.draining) {
            Some(guard) => guard,
            None => {
                debug!("[SyncEngine] Pass skipped ({:?}): already draining", trigger);
                return Ok(SyncPassResult::skipped(SyncPassStatus::InProgress));
            }
        };

        let started_at = Instant::now();
        let mut counters = PassCounters::default();
        let drained = self.drain_entities(&mut counters).await;
        let drained = match drained {
            Ok(()) => self.drain_requests(&mut counters).await,
            Err(err) => Err(err),
        };
        let duration_ms = started_at.elapsed().as_millis() as i64;

        match drained {
            Ok(()) => {
                let result = counters.into_result(duration_ms);
                self.queue
                    .record_pass_outcome(result.clone(), None)
                    .await?;
                info!(
                    "[SyncEngine] Pass complete trigger={:?} status={} processed={} failed={} conflicts={} dead={} deferred={}",
                    trigger,
                    result.status.as_str(),
                    result.processed,
                    result.failed,
                    result.conflicts,
                    result.dead_lettered,
                    result.deferred
                );
                Ok(result)
            }
            Err(err) => {
                warn!("[SyncEngine] Pass aborted by storage failure: {}", err);
                let mut result = counters.into_result(duration_ms);
                result.status = SyncPassStatus::Error;
                if let Err(record_err) = self
                    .queue
                    .record_pass_outcome(result, Some(err.to_string()))
                    .await
                {
                    warn!("[SyncEngine] Failed to record pass outcome: {}", record_err);
                }
                Err(err)
            }
        }
    }

    async fn drain_entities(&self, counters: &mut PassCounters) -> Result<()> {
        let snapshot = self.queue.list_pending()?;
        if snapshot.is_empty() {
            return Ok(());
        }
        let now = now_millis();

        // A dead entry holds back everything queued after it for the same record.
        let mut blocked: HashSet<(EntityTable, String)> = self
            .queue
            .list_dead()?
            .into_iter()
            .map(|entry| (entry.table, entry.record_id().to_string()))
            .collect();

        let mut entries = snapshot.into_iter();
        for entry in entries.by_ref() {
            let key = (entry.table, entry.record_id().to_string());
            if blocked.contains(&key) || !entry.is_due(now) {
                blocked.insert(key);
                counters.deferred += 1;
                continue;
            }

            match self.deliver_entry(&entry).await? {
                EntryOutcome::Delivered => counters.processed += 1,
                EntryOutcome::Conflict { settled } => {
                    counters.conflicts += 1;
                    if settled {
                        counters.processed += 1;
                    } else {
                        counters.failed += 1;
                        blocked.insert(key);
                    }
                }
                EntryOutcome::Failed { dead, unreachable } => {
                    counters.record_failure(dead);
                    blocked.insert(key);
                    if unreachable {
                        counters.interrupted = true;
                        break;
                    }
                }
            }
        }

        if counters.interrupted {
            counters.deferred += entries.count();
        }
        Ok(())
    }

    async fn deliver_entry(&self, entry: &SyncQueueEntry) -> Result<EntryOutcome> {
        debug!(
            "[SyncEngine] Delivering {} {:?} '{}' (entry {})",
            entry.table,
            entry.operation(),
            entry.record_id(),
            entry.id
        );
        match self.remote.deliver(entry).await {
            Ok(DeliveryOutcome::Applied) => {
                self.queue.mark_delivered(entry.id.clone()).await?;
                Ok(EntryOutcome::Delivered)
            }
            Ok(DeliveryOutcome::Conflict { remote }) => self.handle_conflict(entry, remote).await,
            Err(err) => self.handle_failure(entry, err).await,
        }
    }

    async fn handle_conflict(
        &self,
        entry: &SyncQueueEntry,
        remote: SyncableRecord,
    ) -> Result<EntryOutcome> {
        if !is_remote_newer(entry.base_last_modified, &remote) {
            let err = DeliveryError::retryable(format!(
                "Remote reported a conflict on {} '{}' without a newer version",
                entry.table,
                entry.record_id()
            ))
            .with_code("stale_conflict");
            return self.handle_failure(entry, err).await;
        }

        if let Some(local) = self.entities.get_by_id(entry.table, entry.record_id())? {
            if remote_matches_local(&local, &remote) {
                debug!(
                    "[SyncEngine] Remote already holds entry {}; treating as delivered",
                    entry.id
                );
                self.queue.mark_delivered(entry.id.clone()).await?;
                return Ok(EntryOutcome::Delivered);
            }
            self.queue
                .mark_conflict(entry.table, entry.record_id().to_string())
                .await?;
        }

        let strategy = self.config.conflict_strategy;
        let rebased = self
            .queue
            .resolve_entry_conflict(entry.id.clone(), remote, strategy, now_millis())
            .await?;
        info!(
            "[SyncEngine] Conflict on {} '{}' resolved with strategy={}",
            entry.table,
            entry.record_id(),
            strategy.as_str()
        );

        let Some(rebased) = rebased else {
            return Ok(EntryOutcome::Conflict { settled: true });
        };

        match self.remote.deliver(&rebased).await {
            Ok(DeliveryOutcome::Applied) => {
                self.queue.mark_delivered(rebased.id.clone()).await?;
                Ok(EntryOutcome::Conflict { settled: true })
            }
            Ok(DeliveryOutcome::Conflict { .. }) => {
                warn!(
                    "[SyncEngine] Remote changed again while re-delivering entry {}; retrying next pass",
                    rebased.id
                );
                Ok(EntryOutcome::Conflict { settled: false })
            }
            Err(err) => {
                self.handle_failure(&rebased, err).await?;
                Ok(EntryOutcome::Conflict { settled: false })
            }
        }
    }

    async fn handle_failure(
        &self,
        entry: &SyncQueueEntry,
        err: DeliveryError,
    ) -> Result<EntryOutcome> {
        let unreachable = err.is_network();
        let ceiling = if unreachable {
            0
        } else {
            self.config.max_delivery_attempts
        };

        match retry_decision(err.class, entry.retry_count, ceiling) {
            RetryDecision::RetryAfter { seconds } => {
                self.queue
                    .schedule_retry(
                        entry.id.clone(),
                        entry.retry_count.saturating_add(1),
                        add_seconds(now_millis(), seconds),
                        err.message.clone(),
                        err.error_code(),
                    )
                    .await?;
                warn!(
                    "[SyncEngine] Delivery of entry {} failed ({}), retry in {}s: {}",
                    entry.id,
                    err.class.code(),
                    seconds,
                    err.message
                );
                if unreachable {
                    self.connectivity.set_online(false);
                }
                Ok(EntryOutcome::Failed {
                    dead: false,
                    unreachable,
                })
            }
            RetryDecision::DeadLetter => {
                self.queue
                    .mark_dead(entry.id.clone(), err.message.clone(), err.error_code())
                    .await?;
                warn!(
                    "[SyncEngine] Entry {} moved to dead-letter after {} attempt(s): {}",
                    entry.id,
                    entry.retry_count.saturating_add(1),
                    err.message
                );
                Ok(EntryOutcome::Failed {
                    dead: true,
                    unreachable: false,
                })
            }
        }
    }

    async fn drain_requests(&self, counters: &mut PassCounters) -> Result<()> {
        let replay = match &self.requests {
            Some(replay) if !counters.interrupted => replay,
            _ => return Ok(()),
        };
        let snapshot = replay.queue.list_pending_requests()?;
        let now = now_millis();

        let mut entries = snapshot.into_iter();
        for entry in entries.by_ref() {
            if !entry.is_due(now) {
                counters.deferred += 1;
                continue;
            }
            match replay.transport.send(&entry.request).await {
                Ok(_) => {
                    replay.queue.mark_request_delivered(entry.id.clone()).await?;
                    counters.processed += 1;
                }
                Err(err) => {
                    let (dead, unreachable) = self.handle_request_failure(replay, &entry, err).await?;
                    counters.record_failure(dead);
                    if unreachable {
                        counters.interrupted = true;
                        break;
                    }
                }
            }
        }
        if counters.interrupted {
            counters.deferred += entries.count();
        }
        Ok(())
    }

    async fn handle_request_failure(
        &self,
        replay: &RequestReplay,
        entry: &RequestQueueEntry,
        err: DeliveryError,
    ) -> Result<(bool, bool)> {
        let unreachable = err.is_network();
        let ceiling = if unreachable {
            0
        } else {
            self.config.max_delivery_attempts
        };
        match retry_decision(err.class, entry.retry_count, ceiling) {
            RetryDecision::RetryAfter { seconds } => {
                replay
                    .queue
                    .schedule_request_retry(
                        entry.id.clone(),
                        entry.retry_count.saturating_add(1),
                        add_seconds(now_millis(), seconds),
                        err.message.clone(),
                        err.error_code(),
                    )
                    .await?;
                if unreachable {
                    self.connectivity.set_online(false);
                }
                Ok((false, unreachable))
            }
            RetryDecision::DeadLetter => {
                replay
                    .queue
                    .mark_request_dead(entry.id.clone(), err.message.clone(), err.error_code())
                    .await?;
                warn!(
                    "[SyncEngine] Gateway write {} {} dead-lettered: {}",
                    entry.request.method, entry.request.endpoint, err.message
                );
                Ok((true, false))
            }
        }
    }
}
