use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use super::*;
use crate::entities::{
    EntityRepositoryTrait, EntityTable, FieldBag, RecordQuery, SyncStatus, SyncableRecord,
};
use crate::errors::{Error, Result};
use crate::utils::ids::{new_entry_id, new_record_id};
use crate::utils::time_utils::now_millis;

fn bag(value: Value) -> FieldBag {
    value.as_object().cloned().expect("object")
}

#[derive(Default)]
struct StoreState {
    records: BTreeMap<(EntityTable, String), SyncableRecord>,
    queue: Vec<SyncQueueEntry>,
    status: SyncEngineStatus,
    /// Local edit applied as soon as the engine flags a conflict.
    write_during_conflict: Option<(EntityTable, String, RecordDelta)>,
}

impl StoreState {
    fn enqueue(&mut self, table: EntityTable, mutation: SyncMutation, base: Option<i64>, lm: i64) {
        self.queue.push(SyncQueueEntry {
            id: new_entry_id(),
            table,
            mutation,
            base_last_modified: base,
            last_modified: lm,
            timestamp: now_millis(),
            status: QueueEntryStatus::Pending,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
            last_error_code: None,
        });
    }

    fn has_entries_for(&self, table: EntityTable, record_id: &str) -> bool {
        self.queue
            .iter()
            .any(|e| e.table == table && e.record_id() == record_id)
    }

    fn entry_mut(&mut self, entry_id: &str) -> Result<&mut SyncQueueEntry> {
        self.queue
            .iter_mut()
            .find(|e| e.id == entry_id)
            .ok_or_else(|| Error::not_found(entry_id.to_string()))
    }
}

/// In-memory store implementing both the entity and queue contracts.
#[derive(Default, Clone)]
struct MemoryStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryStore {
    fn queue(&self) -> Vec<SyncQueueEntry> {
        self.state.lock().unwrap().queue.clone()
    }

    fn record(&self, table: EntityTable, id: &str) -> SyncableRecord {
        self.get_by_id(table, id).unwrap().expect("record")
    }
}

#[async_trait]
impl EntityRepositoryTrait for MemoryStore {
    async fn put(&self, table: EntityTable, record: SyncableRecord) -> Result<SyncableRecord> {
        let mut state = self.state.lock().unwrap();
        let key = (table, record.id.clone());
        let mut stored = match state.records.get(&key) {
            Some(existing) => {
                let mut merged = existing.clone();
                merged.merge_fields(&record.fields);
                merged
            }
            None => record,
        };
        stored.stamp_local_write(now_millis());
        state.records.insert(key, stored.clone());
        Ok(stored)
    }

    fn query(&self, table: EntityTable, query: &RecordQuery) -> Result<Vec<SyncableRecord>> {
        let state = self.state.lock().unwrap();
        let rows = state
            .records
            .iter()
            .filter(|((t, _), _)| *t == table)
            .map(|(_, r)| r.clone())
            .collect();
        Ok(query.apply(rows))
    }

    fn get_by_id(&self, table: EntityTable, id: &str) -> Result<Option<SyncableRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state.records.get(&(table, id.to_string())).cloned())
    }

    async fn remove(&self, table: EntityTable, id: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        Ok(state.records.remove(&(table, id.to_string())).is_some())
    }

    async fn create_with_sync(
        &self,
        table: EntityTable,
        center_id: String,
        fields: FieldBag,
    ) -> Result<SyncableRecord> {
        let mut state = self.state.lock().unwrap();
        let mut record = SyncableRecord::new(new_record_id(), center_id, fields);
        record.stamp_local_write(now_millis());
        state
            .records
            .insert((table, record.id.clone()), record.clone());
        let lm = record.last_modified;
        state.enqueue(
            table,
            SyncMutation::Create {
                record: record.clone(),
            },
            None,
            lm,
        );
        Ok(record)
    }

    async fn update_with_sync(
        &self,
        table: EntityTable,
        id: &str,
        delta: RecordDelta,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .records
            .get_mut(&(table, id.to_string()))
            .ok_or_else(|| Error::not_found(id.to_string()))?;
        let base = record.last_modified;
        delta.apply_to(&mut record.fields);
        record.stamp_local_write(now_millis());
        let lm = record.last_modified;
        state.enqueue(
            table,
            SyncMutation::Update {
                id: id.to_string(),
                changes: delta,
            },
            Some(base),
            lm,
        );
        Ok(())
    }

    async fn delete_with_sync(&self, table: EntityTable, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .records
            .get_mut(&(table, id.to_string()))
            .ok_or_else(|| Error::not_found(id.to_string()))?;
        let base = record.last_modified;
        record.is_deleted = true;
        record.stamp_local_write(now_millis());
        let lm = record.last_modified;
        state.enqueue(table, SyncMutation::Delete { id: id.to_string() }, Some(base), lm);
        Ok(())
    }
}

#[async_trait]
impl SyncQueueRepositoryTrait for MemoryStore {
    fn list_pending(&self) -> Result<Vec<SyncQueueEntry>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .queue
            .iter()
            .filter(|e| e.status == QueueEntryStatus::Pending)
            .cloned()
            .collect())
    }

    fn list_dead(&self) -> Result<Vec<SyncQueueEntry>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .queue
            .iter()
            .filter(|e| e.status == QueueEntryStatus::Dead)
            .cloned()
            .collect())
    }

    fn get_entry(&self, entry_id: &str) -> Result<Option<SyncQueueEntry>> {
        let state = self.state.lock().unwrap();
        Ok(state.queue.iter().find(|e| e.id == entry_id).cloned())
    }

    fn queue_depth(&self) -> Result<QueueDepth> {
        let state = self.state.lock().unwrap();
        let dead = state
            .queue
            .iter()
            .filter(|e| e.status == QueueEntryStatus::Dead)
            .count() as i64;
        Ok(QueueDepth {
            pending: state.queue.len() as i64 - dead,
            dead,
        })
    }

    async fn mark_delivered(&self, entry_id: String) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(pos) = state.queue.iter().position(|e| e.id == entry_id) else {
            return Ok(());
        };
        let entry = state.queue.remove(pos);
        let record_id = entry.record_id().to_string();
        if !state.has_entries_for(entry.table, &record_id) {
            if let Some(record) = state.records.get_mut(&(entry.table, record_id)) {
                record.sync_status = SyncStatus::Synced;
            }
        }
        Ok(())
    }

    async fn schedule_retry(
        &self,
        entry_id: String,
        retry_count: i32,
        next_retry_at: i64,
        error: String,
        error_code: String,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state.entry_mut(&entry_id)?;
        entry.retry_count = retry_count;
        entry.next_retry_at = Some(next_retry_at);
        entry.last_error = Some(error);
        entry.last_error_code = Some(error_code);
        Ok(())
    }

    async fn mark_dead(&self, entry_id: String, error: String, error_code: String) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state.entry_mut(&entry_id)?;
        entry.status = QueueEntryStatus::Dead;
        entry.last_error = Some(error);
        entry.last_error_code = Some(error_code);
        Ok(())
    }

    async fn mark_conflict(&self, table: EntityTable, record_id: String) -> Result<()> {
        let concurrent = self.state.lock().unwrap().write_during_conflict.take();
        if let Some((table, id, delta)) = concurrent {
            self.update_with_sync(table, &id, delta).await?;
        }
        let mut state = self.state.lock().unwrap();
        if let Some(record) = state.records.get_mut(&(table, record_id)) {
            record.sync_status = SyncStatus::Conflict;
        }
        Ok(())
    }

    async fn resolve_entry_conflict(
        &self,
        entry_id: String,
        remote: SyncableRecord,
        strategy: ConflictStrategy,
        now_ms: i64,
    ) -> Result<Option<SyncQueueEntry>> {
        let mut state = self.state.lock().unwrap();
        let entry = state.entry_mut(&entry_id)?.clone();
        let key = (entry.table, entry.record_id().to_string());
        let local = state.records.get(&key).cloned();
        let queued_after: Vec<SyncQueueEntry> = state
            .queue
            .iter()
            .filter(|e| e.id != entry_id && e.table == entry.table && e.record_id() == key.1)
            .cloned()
            .collect();

        let resolution = settle_conflict(local.as_ref(), &remote, &queued_after, strategy, now_ms);
        let last_modified = resolution.record.last_modified;
        let mutation = rebased_mutation(&resolution.record);
        state.records.insert(key, resolution.record);
        if !resolution.push_upstream {
            state.queue.retain(|e| e.id != entry_id);
            return Ok(None);
        }

        let entry = state.entry_mut(&entry_id)?;
        entry.mutation = mutation;
        entry.base_last_modified = Some(remote.last_modified);
        entry.last_modified = last_modified;
        entry.next_retry_at = None;
        Ok(Some(entry.clone()))
    }

    async fn requeue_dead(&self, entry_id: String) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        match state
            .queue
            .iter_mut()
            .find(|e| e.id == entry_id && e.status == QueueEntryStatus::Dead)
        {
            Some(entry) => {
                entry.status = QueueEntryStatus::Pending;
                entry.retry_count = 0;
                entry.next_retry_at = None;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn discard_dead(&self, entry_id: String) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        let before = state.queue.len();
        state
            .queue
            .retain(|e| !(e.id == entry_id && e.status == QueueEntryStatus::Dead));
        Ok(state.queue.len() != before)
    }

    fn get_engine_status(&self) -> Result<SyncEngineStatus> {
        let depth = self.queue_depth()?;
        let mut status = self.state.lock().unwrap().status.clone();
        status.pending_entries = depth.pending;
        status.dead_entries = depth.dead;
        Ok(status)
    }

    async fn record_pass_outcome(
        &self,
        result: SyncPassResult,
        error: Option<String>,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let now = now_millis();
        let status = &mut state.status;
        status.last_pass_at = Some(now);
        status.last_pass_status = Some(result.status.as_str().to_string());
        status.last_pass_duration_ms = Some(result.duration_ms);
        if error.is_none() && result.failed == 0 {
            status.last_success_at = Some(now);
            status.consecutive_failures = 0;
        } else {
            status.consecutive_failures += 1;
        }
        status.last_error = error;
        Ok(())
    }
}

/// Remote authority double with version-based conflict detection.
#[derive(Default)]
struct FakeRemote {
    records: Mutex<HashMap<(EntityTable, String), SyncableRecord>>,
    applied_keys: Mutex<HashSet<String>>,
    applied: Mutex<Vec<(String, SyncOperation, FieldBag)>>,
    failures: Mutex<VecDeque<DeliveryError>>,
    hold: Mutex<Option<Arc<Notify>>>,
    calls: AtomicUsize,
}

impl FakeRemote {
    fn seed(&self, table: EntityTable, record: SyncableRecord) {
        self.records
            .lock()
            .unwrap()
            .insert((table, record.id.clone()), record);
    }

    fn fail_next(&self, err: DeliveryError) {
        self.failures.lock().unwrap().push_back(err);
    }

    fn remote_record(&self, table: EntityTable, id: &str) -> Option<SyncableRecord> {
        self.records
            .lock()
            .unwrap()
            .get(&(table, id.to_string()))
            .cloned()
    }

    fn applied_for(&self, record_id: &str) -> Vec<(SyncOperation, FieldBag)> {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _, _)| id == record_id)
            .map(|(_, op, fields)| (*op, fields.clone()))
            .collect()
    }
}

#[async_trait]
impl RemoteAuthorityTrait for FakeRemote {
    async fn deliver(
        &self,
        entry: &SyncQueueEntry,
    ) -> std::result::Result<DeliveryOutcome, DeliveryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let hold = self.hold.lock().unwrap().clone();
        if let Some(hold) = hold {
            hold.notified().await;
        }
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        if self.applied_keys.lock().unwrap().contains(&entry.id) {
            return Ok(DeliveryOutcome::Applied);
        }

        let key = (entry.table, entry.record_id().to_string());
        let mut records = self.records.lock().unwrap();
        if let Some(current) = records.get(&key) {
            if is_remote_newer(entry.base_last_modified, current) {
                return Ok(DeliveryOutcome::Conflict {
                    remote: current.clone(),
                });
            }
        }

        let mut record = match (&entry.mutation, records.get(&key)) {
            (SyncMutation::Create { record }, _) => record.clone(),
            (_, Some(current)) => current.clone(),
            (_, None) => SyncableRecord::new(entry.record_id(), "remote", FieldBag::new()),
        };
        match &entry.mutation {
            SyncMutation::Create { .. } => {}
            SyncMutation::Update { changes, .. } => changes.apply_to(&mut record.fields),
            SyncMutation::Delete { .. } => record.is_deleted = true,
        }
        record.last_modified = entry.last_modified;
        record.sync_status = SyncStatus::Synced;
        self.applied.lock().unwrap().push((
            record.id.clone(),
            entry.operation(),
            record.fields.clone(),
        ));
        records.insert(key, record);
        self.applied_keys.lock().unwrap().insert(entry.id.clone());
        Ok(DeliveryOutcome::Applied)
    }

    async fn probe(&self) -> bool {
        true
    }
}

struct Harness {
    store: MemoryStore,
    remote: Arc<FakeRemote>,
    connectivity: ConnectivityMonitor,
    engine: Arc<SyncEngine>,
}

fn harness(online: bool, strategy: ConflictStrategy) -> Harness {
    let store = MemoryStore::default();
    let remote = Arc::new(FakeRemote::default());
    let connectivity = ConnectivityMonitor::new(online);
    let engine = Arc::new(SyncEngine::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        remote.clone(),
        connectivity.clone(),
        SyncEngineConfig {
            conflict_strategy: strategy,
            max_delivery_attempts: 3,
        },
    ));
    Harness {
        store,
        remote,
        connectivity,
        engine,
    }
}

#[tokio::test]
async fn offline_mutations_drain_to_empty_queue() {
    let h = harness(false, ConflictStrategy::Merge);
    let a = h
        .store
        .create_with_sync(EntityTable::Customers, "north".into(), bag(json!({ "name": "A" })))
        .await
        .unwrap();
    let b = h
        .store
        .create_with_sync(EntityTable::Customers, "north".into(), bag(json!({ "name": "B" })))
        .await
        .unwrap();
    h.store
        .update_with_sync(
            EntityTable::Customers,
            &a.id,
            RecordDelta::new().set("phone", "98450"),
        )
        .await
        .unwrap();
    h.store
        .delete_with_sync(EntityTable::Customers, &b.id)
        .await
        .unwrap();

    let skipped = h.engine.request_sync(SyncPassTrigger::Manual).await.unwrap();
    assert_eq!(skipped.status, SyncPassStatus::Offline);
    assert_eq!(h.store.queue().len(), 4);

    h.connectivity.set_online(true);
    let result = h
        .engine
        .request_sync(SyncPassTrigger::ConnectivityRestored)
        .await
        .unwrap();
    assert_eq!(result.status, SyncPassStatus::Ok);
    assert_eq!(result.processed, 4);
    assert!(h.store.queue().is_empty());
    for id in [&a.id, &b.id] {
        assert_eq!(
            h.store.record(EntityTable::Customers, id).sync_status,
            SyncStatus::Synced
        );
    }
    assert!(h.remote.remote_record(EntityTable::Customers, &b.id).unwrap().is_deleted);

    let status = h.engine.status().unwrap();
    assert_eq!(status.engine.last_pass_status.as_deref(), Some("ok"));
    assert_eq!(status.engine.pending_entries, 0);
}

#[tokio::test]
async fn offline_customer_becomes_synced_after_one_pass() {
    let h = harness(false, ConflictStrategy::Merge);
    let created = h
        .store
        .create_with_sync(EntityTable::Customers, "north".into(), bag(json!({ "name": "A" })))
        .await
        .unwrap();

    let local = h.store.record(EntityTable::Customers, &created.id);
    assert_eq!(local.sync_status, SyncStatus::Pending);
    assert_eq!(local.fields["name"], "A");

    h.connectivity.set_online(true);
    h.engine.request_sync(SyncPassTrigger::Manual).await.unwrap();

    let synced = h.store.record(EntityTable::Customers, &created.id);
    assert_eq!(synced.sync_status, SyncStatus::Synced);
    assert_eq!(synced.fields, local.fields);
    assert!(!h
        .store
        .queue()
        .iter()
        .any(|entry| entry.record_id() == created.id));
}

#[tokio::test]
async fn updates_to_one_order_are_delivered_in_order() {
    let h = harness(false, ConflictStrategy::Merge);
    let order = h
        .store
        .create_with_sync(EntityTable::Orders, "north".into(), bag(json!({ "status": "new" })))
        .await
        .unwrap();
    for status in ["pending", "delivered"] {
        h.store
            .update_with_sync(EntityTable::Orders, &order.id, RecordDelta::new().set("status", status))
            .await
            .unwrap();
    }

    h.connectivity.set_online(true);
    let result = h.engine.request_sync(SyncPassTrigger::Manual).await.unwrap();
    assert_eq!(result.processed, 3);

    let statuses = h
        .remote
        .applied_for(&order.id)
        .into_iter()
        .map(|(_, fields)| fields["status"].clone())
        .collect::<Vec<_>>();
    assert_eq!(statuses, vec![json!("new"), json!("pending"), json!("delivered")]);
}

#[tokio::test]
async fn replayed_delivery_leaves_state_unchanged() {
    let h = harness(true, ConflictStrategy::Merge);
    let created = h
        .store
        .create_with_sync(EntityTable::Products, "north".into(), bag(json!({ "price": 27 })))
        .await
        .unwrap();
    let entry = h.store.queue().remove(0);

    h.engine.request_sync(SyncPassTrigger::Manual).await.unwrap();
    let local_after_first = h.store.record(EntityTable::Products, &created.id);
    let remote_after_first = h.remote.remote_record(EntityTable::Products, &created.id);

    let replay = h.remote.deliver(&entry).await.unwrap();
    assert_eq!(replay, DeliveryOutcome::Applied);
    h.store.mark_delivered(entry.id.clone()).await.unwrap();

    assert_eq!(h.store.record(EntityTable::Products, &created.id), local_after_first);
    assert_eq!(
        h.remote.remote_record(EntityTable::Products, &created.id),
        remote_after_first
    );
    assert_eq!(h.remote.applied_for(&created.id).len(), 1);
}

async fn synced_product(h: &Harness) -> SyncableRecord {
    let product = h
        .store
        .create_with_sync(
            EntityTable::Products,
            "north".into(),
            bag(json!({ "price": 9, "stock": 4 })),
        )
        .await
        .unwrap();
    h.engine.request_sync(SyncPassTrigger::Manual).await.unwrap();
    h.store.record(EntityTable::Products, &product.id)
}

fn remote_edit(h: &Harness, local: &SyncableRecord, fields: Value) -> SyncableRecord {
    let mut remote = h
        .remote
        .remote_record(EntityTable::Products, &local.id)
        .expect("remote copy");
    remote.fields = bag(fields);
    remote.last_modified = local.last_modified + 60_000;
    h.remote.seed(EntityTable::Products, remote.clone());
    remote
}

#[tokio::test]
async fn merge_conflict_keeps_local_values_and_syncs() {
    let h = harness(true, ConflictStrategy::Merge);
    let product = synced_product(&h).await;
    remote_edit(&h, &product, json!({ "price": 12, "stock": 8 }));

    h.store
        .update_with_sync(
            EntityTable::Products,
            &product.id,
            RecordDelta::new().set("price", 10).set("stock", 5),
        )
        .await
        .unwrap();
    let result = h.engine.request_sync(SyncPassTrigger::Manual).await.unwrap();

    assert_eq!(result.conflicts, 1);
    assert_eq!(result.processed, 1);
    assert_eq!(result.status, SyncPassStatus::Ok);
    let local = h.store.record(EntityTable::Products, &product.id);
    assert_eq!(local.fields, bag(json!({ "price": 10, "stock": 5 })));
    assert_eq!(local.sync_status, SyncStatus::Synced);
    assert!(h.store.queue().is_empty());

    let remote = h.remote.remote_record(EntityTable::Products, &product.id).unwrap();
    assert_eq!(remote.fields, local.fields);
}

#[tokio::test]
async fn server_strategy_replaces_local_copy() {
    let h = harness(true, ConflictStrategy::Server);
    let product = synced_product(&h).await;
    let remote = remote_edit(&h, &product, json!({ "price": 12, "stock": 8 }));

    h.store
        .update_with_sync(EntityTable::Products, &product.id, RecordDelta::new().set("price", 10))
        .await
        .unwrap();
    let result = h.engine.request_sync(SyncPassTrigger::Manual).await.unwrap();

    assert_eq!(result.conflicts, 1);
    let local = h.store.record(EntityTable::Products, &product.id);
    assert_eq!(local.fields, remote.fields);
    assert_eq!(local.last_modified, remote.last_modified);
    assert_eq!(local.sync_status, SyncStatus::Synced);
    assert!(h.store.queue().is_empty());
}

#[tokio::test]
async fn client_strategy_overwrites_remote() {
    let h = harness(true, ConflictStrategy::Client);
    let product = synced_product(&h).await;
    remote_edit(&h, &product, json!({ "price": 12, "stock": 8, "unit": "kg" }));

    h.store
        .update_with_sync(EntityTable::Products, &product.id, RecordDelta::new().set("price", 10))
        .await
        .unwrap();
    h.engine.request_sync(SyncPassTrigger::Manual).await.unwrap();

    let remote = h.remote.remote_record(EntityTable::Products, &product.id).unwrap();
    assert_eq!(remote.fields["price"], 10);
    assert_eq!(remote.fields["stock"], 4);
    assert_eq!(
        h.store.record(EntityTable::Products, &product.id).sync_status,
        SyncStatus::Synced
    );
}

#[tokio::test]
async fn retryable_failure_backs_off_and_blocks_later_entries() {
    let h = harness(true, ConflictStrategy::Merge);
    let order = h
        .store
        .create_with_sync(EntityTable::Orders, "north".into(), bag(json!({ "status": "new" })))
        .await
        .unwrap();
    h.store
        .update_with_sync(EntityTable::Orders, &order.id, RecordDelta::new().set("status", "pending"))
        .await
        .unwrap();
    let other = h
        .store
        .create_with_sync(EntityTable::Customers, "north".into(), bag(json!({ "name": "C" })))
        .await
        .unwrap();

    h.remote.fail_next(DeliveryError::retryable("503 service unavailable"));
    let before = now_millis();
    let result = h.engine.request_sync(SyncPassTrigger::Manual).await.unwrap();

    assert_eq!(result.status, SyncPassStatus::Partial);
    assert_eq!(result.failed, 1);
    assert_eq!(result.deferred, 1);
    assert_eq!(result.processed, 1);
    assert!(h.remote.applied_for(&order.id).is_empty());
    assert_eq!(
        h.store.record(EntityTable::Customers, &other.id).sync_status,
        SyncStatus::Synced
    );

    let queue = h.store.queue();
    assert_eq!(queue.len(), 2);
    assert_eq!(queue[0].retry_count, 1);
    assert!(queue[0].next_retry_at.unwrap() >= before + 5_000);
    assert_eq!(queue[0].last_error_code.as_deref(), Some("retryable"));

    // Still backing off: the whole record stays deferred.
    let result = h.engine.request_sync(SyncPassTrigger::Periodic).await.unwrap();
    assert_eq!(result.deferred, 2);
    assert_eq!(result.processed, 0);
}

#[tokio::test]
async fn permanent_failure_dead_letters_and_can_be_requeued() {
    let h = harness(true, ConflictStrategy::Merge);
    let created = h
        .store
        .create_with_sync(EntityTable::Payments, "north".into(), bag(json!({ "amount": -5 })))
        .await
        .unwrap();
    h.store
        .update_with_sync(EntityTable::Payments, &created.id, RecordDelta::new().set("amount", 5))
        .await
        .unwrap();

    h.remote
        .fail_next(DeliveryError::permanent("amount must be positive").with_code("http_422"));
    let result = h.engine.request_sync(SyncPassTrigger::Manual).await.unwrap();
    assert_eq!(result.dead_lettered, 1);
    assert_eq!(result.deferred, 1);

    let dead = h.store.list_dead().unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].last_error_code.as_deref(), Some("http_422"));
    assert_eq!(
        h.store.record(EntityTable::Payments, &created.id).sync_status,
        SyncStatus::Pending
    );

    // The dead entry keeps holding back the later update.
    let result = h.engine.request_sync(SyncPassTrigger::Manual).await.unwrap();
    assert_eq!(result.deferred, 1);
    assert_eq!(result.processed, 0);

    assert!(h.store.requeue_dead(dead[0].id.clone()).await.unwrap());
    let result = h.engine.request_sync(SyncPassTrigger::Manual).await.unwrap();
    assert_eq!(result.processed, 2);
    assert!(h.store.queue().is_empty());
}

#[tokio::test]
async fn retryable_failures_dead_letter_at_attempt_ceiling() {
    let h = harness(true, ConflictStrategy::Merge);
    h.store
        .create_with_sync(EntityTable::Invoices, "north".into(), bag(json!({ "amount": 10 })))
        .await
        .unwrap();

    for attempt in 0..3 {
        {
            let mut state = h.store.state.lock().unwrap();
            state.queue[0].next_retry_at = None;
        }
        h.remote.fail_next(DeliveryError::retryable("502 bad gateway"));
        let result = h.engine.request_sync(SyncPassTrigger::Manual).await.unwrap();
        assert_eq!(result.dead_lettered, usize::from(attempt == 2));
    }
    assert_eq!(h.store.queue_depth().unwrap(), QueueDepth { pending: 0, dead: 1 });
}

#[tokio::test]
async fn unreachable_remote_stops_the_pass_and_goes_offline() {
    let h = harness(true, ConflictStrategy::Merge);
    for name in ["A", "B"] {
        h.store
            .create_with_sync(EntityTable::Customers, "north".into(), bag(json!({ "name": name })))
            .await
            .unwrap();
    }
    h.remote.fail_next(DeliveryError::network("connection refused"));

    let result = h.engine.request_sync(SyncPassTrigger::Manual).await.unwrap();
    assert_eq!(result.status, SyncPassStatus::Partial);
    assert_eq!(result.failed, 1);
    assert_eq!(result.deferred, 1);
    assert_eq!(h.remote.calls.load(Ordering::SeqCst), 1);
    assert!(!h.connectivity.is_online());
    assert_eq!(h.store.queue().len(), 2);
}

#[tokio::test]
async fn second_pass_while_draining_is_rejected() {
    let h = harness(true, ConflictStrategy::Merge);
    h.store
        .create_with_sync(EntityTable::TripSheets, "north".into(), bag(json!({ "route": "R1" })))
        .await
        .unwrap();
    let gate = Arc::new(Notify::new());
    *h.remote.hold.lock().unwrap() = Some(gate.clone());

    let engine = h.engine.clone();
    let first = tokio::spawn(async move { engine.request_sync(SyncPassTrigger::Manual).await });
    while !h.engine.is_draining() {
        tokio::task::yield_now().await;
    }

    let second = h.engine.request_sync(SyncPassTrigger::Periodic).await.unwrap();
    assert_eq!(second.status, SyncPassStatus::InProgress);

    gate.notify_one();
    let first = first.await.expect("join").unwrap();
    assert_eq!(first.status, SyncPassStatus::Ok);
    assert!(!h.engine.is_draining());
}

#[tokio::test]
async fn reads_do_not_depend_on_connectivity() {
    let h = harness(true, ConflictStrategy::Merge);
    let created = h
        .store
        .create_with_sync(EntityTable::Customers, "north".into(), bag(json!({ "name": "A" })))
        .await
        .unwrap();

    let online_rows = h.store.query(EntityTable::Customers, &RecordQuery::all()).unwrap();
    h.connectivity.set_online(false);
    let offline_rows = h.store.query(EntityTable::Customers, &RecordQuery::all()).unwrap();
    assert_eq!(online_rows, offline_rows);
    assert_eq!(
        h.store.get_by_id(EntityTable::Customers, &created.id).unwrap(),
        Some(created)
    );
}

#[tokio::test]
async fn scheduler_runs_pass_when_connectivity_returns() {
    let h = harness(false, ConflictStrategy::Merge);
    let created = h
        .store
        .create_with_sync(EntityTable::Customers, "north".into(), bag(json!({ "name": "A" })))
        .await
        .unwrap();

    let scheduler = SyncScheduler::new(h.engine.clone(), std::time::Duration::from_secs(3600))
        .with_jitter_secs(0);
    scheduler.start().await;
    assert!(scheduler.is_running().await);

    h.connectivity.set_online(true);
    for _ in 0..100 {
        if h.store.queue().is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(
        h.store.record(EntityTable::Customers, &created.id).sync_status,
        SyncStatus::Synced
    );

    scheduler.stop().await;
    assert!(!scheduler.is_running().await);
}

#[tokio::test]
async fn entity_service_stamps_center_and_round_trips_typed_entities() {
    use crate::entities::{Customer, EntityService};

    let store = MemoryStore::default();
    let service = EntityService::new(Arc::new(store.clone()), "north");

    let customer = Customer {
        name: "Asha Dairy".to_string(),
        phone: None,
        address: Some("12 Mill Rd".to_string()),
        route: Some("R1".to_string()),
        is_active: true,
    };
    let record = service.create_entity(&customer).await.unwrap();
    assert_eq!(record.center_id, "north");
    assert_eq!(record.sync_status, SyncStatus::Pending);
    assert_eq!(
        service.get_entity::<Customer>(&record.id).unwrap(),
        Some(customer)
    );

    let err = service
        .update_with_sync(EntityTable::Customers, &record.id, RecordDelta::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(store.queue().len(), 1);

    service
        .delete_with_sync(EntityTable::Customers, &record.id)
        .await
        .unwrap();
    assert_eq!(service.get_entity::<Customer>(&record.id).unwrap(), None);
    assert_eq!(store.queue().len(), 2);
}

#[tokio::test]
async fn local_write_during_conflict_survives_resolution() {
    let h = harness(true, ConflictStrategy::Merge);
    let product = synced_product(&h).await;
    remote_edit(&h, &product, json!({ "price": 12, "stock": 8 }));

    h.store
        .update_with_sync(EntityTable::Products, &product.id, RecordDelta::new().set("price", 10))
        .await
        .unwrap();
    h.store.state.lock().unwrap().write_during_conflict = Some((
        EntityTable::Products,
        product.id.clone(),
        RecordDelta::new().set("note", "typed during sync"),
    ));

    let first = h.engine.request_sync(SyncPassTrigger::Manual).await.unwrap();
    assert_eq!(first.conflicts, 1);
    let local = h.store.record(EntityTable::Products, &product.id);
    assert_eq!(local.fields["note"], "typed during sync");
    assert_eq!(local.fields["price"], 10);

    h.engine.request_sync(SyncPassTrigger::Manual).await.unwrap();
    let local = h.store.record(EntityTable::Products, &product.id);
    assert_eq!(local.fields["note"], "typed during sync");
    assert_eq!(local.sync_status, SyncStatus::Synced);
    assert!(h.store.queue().is_empty());

    let remote = h.remote.remote_record(EntityTable::Products, &product.id).unwrap();
    assert_eq!(remote.fields, local.fields);
}

#[tokio::test]
async fn adopted_remote_replays_local_write_made_during_conflict() {
    let h = harness(true, ConflictStrategy::Server);
    let product = synced_product(&h).await;
    remote_edit(&h, &product, json!({ "price": 12, "stock": 8 }));

    h.store
        .update_with_sync(EntityTable::Products, &product.id, RecordDelta::new().set("price", 10))
        .await
        .unwrap();
    h.store.state.lock().unwrap().write_during_conflict = Some((
        EntityTable::Products,
        product.id.clone(),
        RecordDelta::new().set("note", "typed during sync"),
    ));

    h.engine.request_sync(SyncPassTrigger::Manual).await.unwrap();
    let local = h.store.record(EntityTable::Products, &product.id);
    assert_eq!(local.fields["price"], 12);
    assert_eq!(local.fields["note"], "typed during sync");
    assert_eq!(local.sync_status, SyncStatus::Pending);
    assert_eq!(h.store.queue().len(), 1);
}

/// Answers every delivery with a 409 carrying a fixed remote copy.
struct ConflictingRemote {
    remote: SyncableRecord,
}

#[async_trait]
impl RemoteAuthorityTrait for ConflictingRemote {
    async fn deliver(
        &self,
        _entry: &SyncQueueEntry,
    ) -> std::result::Result<DeliveryOutcome, DeliveryError> {
        Ok(DeliveryOutcome::Conflict {
            remote: self.remote.clone(),
        })
    }

    async fn probe(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn conflict_without_newer_remote_version_is_retried() {
    let store = MemoryStore::default();
    let product = store
        .create_with_sync(EntityTable::Products, "north".into(), bag(json!({ "price": 9 })))
        .await
        .unwrap();
    store.state.lock().unwrap().queue.clear();
    store
        .update_with_sync(EntityTable::Products, &product.id, RecordDelta::new().set("price", 10))
        .await
        .unwrap();

    let mut remote = product.clone();
    remote.last_modified = product.last_modified - 1;
    remote.fields = bag(json!({ "price": 3 }));
    let engine = SyncEngine::new(
        Arc::new(store.clone()),
        Arc::new(store.clone()),
        Arc::new(ConflictingRemote { remote }),
        ConnectivityMonitor::new(true),
        SyncEngineConfig::default(),
    );

    let result = engine.request_sync(SyncPassTrigger::Manual).await.unwrap();
    assert_eq!(result.conflicts, 0);
    assert_eq!(result.failed, 1);
    assert_eq!(result.status, SyncPassStatus::Partial);

    let entry = store.queue().remove(0);
    assert_eq!(entry.retry_count, 1);
    assert_eq!(entry.last_error_code.as_deref(), Some("stale_conflict"));
    assert!(entry.next_retry_at.is_some());
    let local = store.record(EntityTable::Products, &product.id);
    assert_eq!(local.fields["price"], 10);
    assert_eq!(local.sync_status, SyncStatus::Pending);
}
