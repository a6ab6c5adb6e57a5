//! Offline sync engine.
//!
//! `SyncCoordinator` owns everything the offline mutation flow needs: the
//! local database holding the queue, the remote backend, the connectivity
//! flag, the read cache and the event channel the UI listens on. It is
//! created once per process and shared through an `Arc`.
//!
//! A drain pass replays queued mutations in insertion order. Local ids are
//! rewritten to server ids as creates resolve; anything still depending on
//! an unresolved local id is deferred to a later pass rather than failed.
//! Only one pass runs at a time.

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, RemoteApi};
use crate::cache::QueryCache;
use crate::config::ClientConfig;
use crate::connectivity::Connectivity;
use crate::db::{self, DbState};
use crate::envelope::extract_server_id;
use crate::error::{ApiError, SyncResult};
use crate::local_id::{is_local_id, rewrite_local_ids};
use crate::queue::{self, FailureOutcome, NewQueueItem, Operation, QueueItem};
use crate::storage;

const EVENT_CHANNEL_CAPACITY: usize = 64;
const SETTINGS_CATEGORY: &str = "sync";
const LAST_SYNC_KEY: &str = "last_sync";

// ---------------------------------------------------------------------------
// Status and events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub pending: i64,
    /// Dead-lettered items waiting for a manual retry or discard.
    pub failed: i64,
    pub last_sync: Option<String>,
    pub is_draining: bool,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    /// Items dispatched to the backend.
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
    /// Items held back because they depend on an unresolved local id or on
    /// an earlier item for the same record that did not go through.
    pub deferred: usize,
    /// Items still inside their retry backoff window.
    pub waiting: usize,
    /// Items moved to the dead-letter list this pass, cascades included.
    pub dead_lettered: usize,
    /// Another pass was already running; nothing was done.
    pub skipped: bool,
    /// The backend became unreachable mid-pass; remaining items were left
    /// untouched.
    pub interrupted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    StatusChanged(SyncStatus),
    NetworkStatus {
        is_online: bool,
        latency_ms: Option<u64>,
    },
    ItemSynced {
        queue_id: String,
        entity: String,
        op: Operation,
        local_id: Option<String>,
        server_id: Option<String>,
    },
    ItemDeadLettered {
        queue_id: String,
        entity: String,
        op: Operation,
        error: String,
    },
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct SyncCoordinator {
    db: Arc<DbState>,
    remote: Arc<dyn RemoteApi>,
    connectivity: Connectivity,
    cache: QueryCache,
    config: ClientConfig,
    events: broadcast::Sender<SyncEvent>,
    drain_lock: AsyncMutex<()>,
    draining: AtomicBool,
    last_sync: std::sync::Mutex<Option<String>>,
}

impl SyncCoordinator {
    pub fn new(
        db: Arc<DbState>,
        remote: Arc<dyn RemoteApi>,
        connectivity: Connectivity,
        config: ClientConfig,
    ) -> Self {
        let last_sync = db
            .conn
            .lock()
            .ok()
            .and_then(|conn| db::get_setting(&conn, SETTINGS_CATEGORY, LAST_SYNC_KEY));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            db,
            remote,
            connectivity,
            cache: QueryCache::new(),
            config,
            events,
            drain_lock: AsyncMutex::new(()),
            draining: AtomicBool::new(false),
            last_sync: std::sync::Mutex::new(last_sync),
        }
    }

    /// Open the on-disk database and the HTTP backend described by `config`,
    /// using the session token from the credential store.
    pub fn open(config: ClientConfig) -> SyncResult<Self> {
        let db = Arc::new(db::init(&config.data_dir)?);
        let client = ApiClient::new(&config.api_base_url, config.request_timeout)?
            .with_auth_token(storage::load_auth_token());
        Ok(Self::new(
            db,
            Arc::new(client),
            Connectivity::default(),
            config,
        ))
    }

    pub fn db(&self) -> &DbState {
        &self.db
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn cache(&self) -> &QueryCache {
        &self.cache
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn remote(&self) -> &dyn RemoteApi {
        self.remote.as_ref()
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.is_online()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // -- queue access used by the bindings ---------------------------------

    pub(crate) fn enqueue(&self, item: NewQueueItem) -> SyncResult<QueueItem> {
        let queued = queue::enqueue(
            &self.db,
            item,
            self.config.max_retries,
            self.config.base_retry_delay_ms,
        )?;
        if let Ok(status) = self.status() {
            self.emit(SyncEvent::StatusChanged(status));
        }
        Ok(queued)
    }

    /// Server id for `id` if it is a local id whose create already synced,
    /// otherwise `id` unchanged.
    pub fn resolve_id(&self, id: &str) -> SyncResult<String> {
        if !is_local_id(id) {
            return Ok(id.to_string());
        }
        Ok(queue::resolve_mapping(&self.db, id)?.unwrap_or_else(|| id.to_string()))
    }

    /// Rewrite every already-resolved local id inside `payload`.
    pub(crate) fn resolve_payload(&self, payload: &mut Value) -> SyncResult<usize> {
        let mappings = queue::load_mappings(&self.db)?;
        Ok(rewrite_local_ids(payload, &mappings))
    }

    // -- status and dead letters --------------------------------------------

    pub fn status(&self) -> SyncResult<SyncStatus> {
        let counts = queue::counts(&self.db)?;
        let last_sync = self.last_sync.lock()?.clone();
        Ok(SyncStatus {
            is_online: self.is_online(),
            pending: counts.pending,
            failed: counts.failed,
            last_sync,
            is_draining: self.draining.load(Ordering::SeqCst),
        })
    }

    pub fn pending(&self) -> SyncResult<Vec<QueueItem>> {
        queue::pending_items(&self.db)
    }

    pub fn dead_letters(&self) -> SyncResult<Vec<QueueItem>> {
        queue::dead_letters(&self.db)
    }

    pub fn retry_dead_letter(&self, queue_id: &str) -> SyncResult<bool> {
        let requeued =
            queue::retry_dead_letter(&self.db, queue_id, self.config.base_retry_delay_ms)?;
        if requeued {
            self.emit(SyncEvent::StatusChanged(self.status()?));
        }
        Ok(requeued)
    }

    /// Drop a queued item (and, for a create, everything depending on it).
    pub fn discard(&self, queue_id: &str) -> SyncResult<Vec<String>> {
        let removed = queue::discard(&self.db, queue_id)?;
        if !removed.is_empty() {
            self.emit(SyncEvent::StatusChanged(self.status()?));
        }
        Ok(removed)
    }

    // -- connectivity -------------------------------------------------------

    /// Probe the backend's health endpoint and update the connectivity flag.
    pub async fn probe_connectivity(&self) -> bool {
        let result = self.remote.health().await;
        self.connectivity.set_online(result.success);
        self.emit(SyncEvent::NetworkStatus {
            is_online: result.success,
            latency_ms: result.latency_ms,
        });
        result.success
    }

    // -- drain --------------------------------------------------------------

    /// Run one drain pass over the queue.
    pub async fn drain(&self) -> SyncResult<DrainReport> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            debug!("drain pass already running; skipping");
            return Ok(DrainReport {
                skipped: true,
                ..Default::default()
            });
        };
        let draining = DrainingFlag::raise(&self.draining);

        let mut report = DrainReport::default();
        if !self.is_online() {
            debug!("offline; drain pass deferred");
            return Ok(report);
        }

        let items = queue::pending_items(&self.db)?;
        if !items.is_empty() {
            self.replay(items, &mut report).await?;
        }

        let retired = queue::retire_mappings(&self.db, self.config.mapping_grace_secs)?;
        if report.attempted > 0 || retired > 0 {
            info!(
                attempted = report.attempted,
                synced = report.synced,
                failed = report.failed,
                deferred = report.deferred,
                dead_lettered = report.dead_lettered,
                "drain pass complete"
            );
        }

        if !report.interrupted {
            self.touch_last_sync()?;
        }
        drop(draining);
        self.emit(SyncEvent::StatusChanged(self.status()?));
        Ok(report)
    }

    async fn replay(&self, items: Vec<QueueItem>, report: &mut DrainReport) -> SyncResult<()> {
        let mut mappings = queue::load_mappings(&self.db)?;
        let mut blocked: HashSet<String> = HashSet::new();
        let mut cascaded: HashSet<String> = HashSet::new();
        let now = queue::now_ms();

        for item in items {
            if cascaded.contains(&item.id) {
                continue;
            }
            if !self.is_online() {
                info!("network lost mid-pass; remaining items stay queued");
                report.interrupted = true;
                break;
            }

            let key = item.entity_key(&mappings);
            if !item.is_due(now) {
                report.waiting += 1;
                blocked.extend(key);
                continue;
            }

            let unresolved: Vec<String> = item
                .dependencies()
                .into_iter()
                .filter(|dep| !mappings.contains_key(dep))
                .collect();
            let key_blocked = key.as_ref().is_some_and(|k| blocked.contains(k));
            if !unresolved.is_empty() || key_blocked {
                debug!(
                    queue_id = %item.id,
                    entity = %item.entity,
                    op = %item.op,
                    unresolved = ?unresolved,
                    "queued mutation deferred"
                );
                report.deferred += 1;
                blocked.extend(key);
                continue;
            }

            let target = item
                .target_id
                .as_ref()
                .map(|t| mappings.get(t).cloned().unwrap_or_else(|| t.clone()));
            let mut data = item.data.clone();
            rewrite_local_ids(&mut data, &mappings);

            report.attempted += 1;
            let result = self.dispatch(&item, target.as_deref(), &data).await;
            let result = result.and_then(|response| {
                let server_id = match item.op {
                    Operation::Create => Some(extract_server_id(&response).ok_or_else(|| {
                        ApiError::InvalidResponse("create response carried no id".into())
                    })?),
                    Operation::Update | Operation::Delete => target.clone(),
                };
                Ok(server_id)
            });

            match result {
                Ok(server_id) => {
                    self.mark_synced(&item, server_id, &mut mappings)?;
                    report.synced += 1;
                }
                Err(ApiError::Unreachable(message)) => {
                    // No connection at all: leave this item and everything
                    // after it for the next pass without burning a retry.
                    warn!(queue_id = %item.id, error = %message, "backend unreachable; stopping drain pass");
                    report.interrupted = true;
                    break;
                }
                Err(err) => {
                    report.failed += 1;
                    blocked.extend(key);
                    let error = err.to_string();
                    let outcome = queue::record_failure(
                        &self.db,
                        &item,
                        &error,
                        !err.is_transient(),
                        now,
                    )?;
                    match outcome {
                        FailureOutcome::Retrying { next_retry_at } => {
                            warn!(
                                queue_id = %item.id,
                                entity = %item.entity,
                                op = %item.op,
                                retries = item.retries + 1,
                                next_retry_at,
                                error = %error,
                                "queued mutation failed; will retry"
                            );
                        }
                        FailureOutcome::DeadLettered => {
                            report.dead_lettered += 1;
                            self.emit(SyncEvent::ItemDeadLettered {
                                queue_id: item.id.clone(),
                                entity: item.entity.to_string(),
                                op: item.op,
                                error,
                            });
                            report.dead_lettered += self.cascade_dead_letter(&item, &mut cascaded)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        item: &QueueItem,
        target: Option<&str>,
        data: &Value,
    ) -> Result<Value, ApiError> {
        if item.op == Operation::Create {
            return self.remote.create(item.entity, data).await;
        }
        let Some(target) = target else {
            return Err(ApiError::InvalidResponse(format!(
                "queued {} has no target id",
                item.op
            )));
        };
        match item.op {
            Operation::Update => self.remote.update(item.entity, target, data).await,
            _ => match self.remote.delete(item.entity, target).await {
                // Already gone on the server: the delete has taken effect.
                Err(ApiError::Http { status: 404, .. }) => Ok(Value::Null),
                other => other,
            },
        }
    }

    fn mark_synced(
        &self,
        item: &QueueItem,
        server_id: Option<String>,
        mappings: &mut HashMap<String, String>,
    ) -> SyncResult<()> {
        if let (Some(local_id), Some(server_id)) = (item.local_id.as_deref(), server_id.as_deref())
        {
            queue::record_mapping(&self.db, local_id, server_id, item.entity)?;
            mappings.insert(local_id.to_string(), server_id.to_string());
        }
        queue::remove(&self.db, &item.id)?;

        self.cache.invalidate_entity(item.entity);
        if item.op == Operation::Delete {
            if let Some(id) = server_id.as_deref() {
                self.cache.remove_detail(item.entity, id);
            }
        }

        debug!(
            queue_id = %item.id,
            entity = %item.entity,
            op = %item.op,
            server_id = ?server_id,
            "queued mutation synced"
        );
        self.emit(SyncEvent::ItemSynced {
            queue_id: item.id.clone(),
            entity: item.entity.to_string(),
            op: item.op,
            local_id: item.local_id.clone(),
            server_id,
        });
        Ok(())
    }

    /// A dead-lettered create can never produce its server id, so every
    /// item depending on its local id is dead-lettered with it.
    fn cascade_dead_letter(
        &self,
        item: &QueueItem,
        cascaded: &mut HashSet<String>,
    ) -> SyncResult<usize> {
        let Some(root) = item.local_id.clone() else {
            return Ok(0);
        };
        let mut frontier = vec![root];
        let mut count = 0;
        while let Some(local_id) = frontier.pop() {
            for dep in queue::dependents_of(&self.db, &local_id)? {
                let reason = format!("dependency {local_id} failed to sync");
                if !queue::dead_letter(&self.db, &dep.id, &reason)? {
                    continue;
                }
                count += 1;
                cascaded.insert(dep.id.clone());
                if let Some(dep_local) = dep.local_id.clone() {
                    frontier.push(dep_local);
                }
                self.emit(SyncEvent::ItemDeadLettered {
                    queue_id: dep.id,
                    entity: dep.entity.to_string(),
                    op: dep.op,
                    error: reason,
                });
            }
        }
        Ok(count)
    }

    fn touch_last_sync(&self) -> SyncResult<()> {
        let now = Utc::now().to_rfc3339();
        {
            let conn = self.db.conn.lock()?;
            db::set_setting(&conn, SETTINGS_CATEGORY, LAST_SYNC_KEY, &now)?;
        }
        *self.last_sync.lock()? = Some(now);
        Ok(())
    }
}

/// Marks a drain pass as running for `status()`; lowered on drop so an
/// early return or error also clears it.
struct DrainingFlag<'a>(&'a AtomicBool);

impl<'a> DrainingFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for DrainingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Background sync loop
// ---------------------------------------------------------------------------

/// Handle to the background drain loop.
pub struct SyncLoopHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SyncLoopHandle {
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the loop and wait for the in-flight pass, if any, to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("sync loop task ended abnormally: {e}");
        }
    }
}

async fn run_pass(coordinator: &SyncCoordinator) {
    match coordinator.drain().await {
        Ok(report) if report.synced > 0 => {
            info!("Sync pass complete: {} items synced", report.synced);
        }
        Ok(_) => {}
        Err(e) => warn!("Sync pass failed: {e}"),
    }
}

/// Start the background loop: drains every `sync_interval` and whenever the
/// connectivity flag goes from offline to online.
pub fn start_sync_loop(coordinator: Arc<SyncCoordinator>) -> SyncLoopHandle {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let interval = coordinator.config.sync_interval.max(Duration::from_millis(10));

    let task = tokio::spawn(async move {
        info!("Sync loop started (interval: {}ms)", interval.as_millis());
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut network = coordinator.connectivity.subscribe();

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Sync loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if coordinator.config.probe_connectivity {
                        coordinator.probe_connectivity().await;
                    }
                }
                reconnected = Connectivity::wait_for_reconnect(&mut network) => {
                    if !reconnected {
                        break;
                    }
                    info!("Network restored; resuming queued sync");
                }
            }
            run_pass(&coordinator).await;
        }
    });

    SyncLoopHandle { cancel, task }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::EntityKind;
    use crate::local_id::generate_local_id;
    use crate::queue::ItemStatus;
    use crate::test_support::{coordinator, Call, FakeRemote};
    use serde_json::json;

    fn http(status: u16) -> ApiError {
        ApiError::Http {
            status,
            message: format!("status {status}"),
        }
    }

    fn queue_create(sync: &SyncCoordinator, kind: EntityKind, data: Value) -> String {
        let local_id = generate_local_id();
        sync.enqueue(NewQueueItem::create(kind, local_id.clone(), data))
            .expect("enqueue create");
        local_id
    }

    fn dispatched(remote: &FakeRemote) -> Vec<(&'static str, Option<String>)> {
        remote.calls().into_iter().map(|c| (c.op, c.id)).collect()
    }

    #[tokio::test]
    async fn test_update_on_local_id_uses_server_id_after_create_syncs() {
        let remote = FakeRemote::new();
        remote.respond_with(|call| {
            (call.op == "create").then(|| Ok(json!({ "id": "srv-1", "name": "Widget" })))
        });
        let sync = coordinator(remote.clone(), false);

        let local = queue_create(&sync, EntityKind::Product, json!({ "name": "Widget" }));
        sync.enqueue(NewQueueItem::update(
            EntityKind::Product,
            local.clone(),
            json!({ "quantity": 5 }),
        ))
        .unwrap();

        sync.connectivity().set_online(true);
        let report = sync.drain().await.unwrap();

        assert_eq!(report.synced, 2);
        let calls = remote.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].op, "create");
        assert_eq!(
            calls[1],
            Call {
                op: "update",
                kind: EntityKind::Product,
                id: Some("srv-1".into()),
                data: json!({ "quantity": 5 }),
            }
        );
        assert!(queue::is_empty(sync.db()).unwrap());
        assert_eq!(sync.resolve_id(&local).unwrap(), "srv-1");
    }

    #[tokio::test]
    async fn test_payload_references_are_rewritten_before_dispatch() {
        let remote = FakeRemote::new();
        let sync = coordinator(remote.clone(), false);

        let customer = queue_create(&sync, EntityKind::Customer, json!({ "name": "Ana" }));
        let product = queue_create(&sync, EntityKind::Product, json!({ "name": "Tea" }));
        queue_create(
            &sync,
            EntityKind::Order,
            json!({
                "customerId": customer,
                "items": [{ "productId": product, "quantity": 1, "unitPrice": 2.0 }]
            }),
        );

        sync.connectivity().set_online(true);
        sync.drain().await.unwrap();

        let calls = remote.calls();
        assert_eq!(calls.len(), 3);
        let order = &calls[2].data;
        assert_eq!(order["customerId"], "srv-1");
        assert_eq!(order["items"][0]["productId"], "srv-2");
    }

    #[tokio::test]
    async fn test_draining_empty_queue_makes_no_calls() {
        let remote = FakeRemote::new();
        let sync = coordinator(remote.clone(), true);

        let first = sync.drain().await.unwrap();
        let second = sync.drain().await.unwrap();

        assert_eq!(first, DrainReport::default());
        assert_eq!(second, DrainReport::default());
        assert!(remote.calls().is_empty());
        assert!(sync.status().unwrap().last_sync.is_some());
    }

    #[tokio::test]
    async fn test_unrelated_items_dispatch_in_fifo_order() {
        let remote = FakeRemote::new();
        let sync = coordinator(remote.clone(), false);

        sync.enqueue(NewQueueItem::delete(EntityKind::Coupon, "c1")).unwrap();
        sync.enqueue(NewQueueItem::update(
            EntityKind::Order,
            "o1",
            json!({ "status": "ready" }),
        ))
        .unwrap();
        sync.enqueue(NewQueueItem::delete(EntityKind::Category, "k1"))
            .unwrap();

        sync.connectivity().set_online(true);
        sync.drain().await.unwrap();

        assert_eq!(
            dispatched(&remote),
            vec![
                ("delete", Some("c1".into())),
                ("update", Some("o1".into())),
                ("delete", Some("k1".into())),
            ]
        );
    }

    #[tokio::test]
    async fn test_dependent_update_deferred_when_create_fails() {
        let remote = FakeRemote::new();
        remote.respond_with(|call| (call.op == "create").then(|| Err(http(503))));
        let sync = coordinator(remote.clone(), false);

        let local = queue_create(&sync, EntityKind::Product, json!({ "name": "Widget" }));
        sync.enqueue(NewQueueItem::update(
            EntityKind::Product,
            local.clone(),
            json!({ "quantity": 5 }),
        ))
        .unwrap();
        sync.enqueue(NewQueueItem::delete(EntityKind::Coupon, "c1")).unwrap();

        sync.connectivity().set_online(true);
        let report = sync.drain().await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.synced, 1);
        // The update never reached the network with a placeholder id.
        assert!(remote
            .calls()
            .iter()
            .all(|c| c.id.as_deref().map_or(true, |id| !is_local_id(id))));

        let pending = sync.pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].retries, 1);
        assert_eq!(pending[1].retries, 0, "deferral must not burn a retry");
    }

    #[tokio::test]
    async fn test_mapping_survives_across_passes() {
        let remote = FakeRemote::new();
        remote.respond_with(|call| (call.op == "update").then(|| Err(http(500))));
        let sync = coordinator(remote.clone(), false);

        let local = queue_create(&sync, EntityKind::Customer, json!({ "name": "Ana" }));
        let update = sync
            .enqueue(NewQueueItem::update(
                EntityKind::Customer,
                local.clone(),
                json!({ "phone": "555" }),
            ))
            .unwrap();

        sync.connectivity().set_online(true);
        let first = sync.drain().await.unwrap();
        assert_eq!((first.synced, first.failed), (1, 1));

        // Backend recovers; make the retry due now.
        remote.respond_with(|_| None);
        sync.db()
            .conn
            .lock()
            .unwrap()
            .execute(
                "UPDATE sync_queue SET next_retry_at = 0 WHERE id = ?1",
                [&update.id],
            )
            .unwrap();

        let second = sync.drain().await.unwrap();
        assert_eq!(second.synced, 1);
        let last = remote.calls().pop().unwrap();
        assert_eq!(last.op, "update");
        assert_eq!(last.id.as_deref(), Some("srv-1"));
    }

    #[tokio::test]
    async fn test_items_in_backoff_wait_and_block_their_record() {
        let remote = FakeRemote::new();
        remote.respond_with(|call| (call.op == "update").then(|| Err(http(502))));
        let sync = coordinator(remote.clone(), true);

        sync.enqueue(NewQueueItem::update(EntityKind::Order, "o1", json!({ "status": "ready" })))
            .unwrap();
        sync.enqueue(NewQueueItem::delete(EntityKind::Order, "o1")).unwrap();

        let first = sync.drain().await.unwrap();
        assert_eq!((first.failed, first.deferred), (1, 1));

        let second = sync.drain().await.unwrap();
        assert_eq!(second.waiting, 1);
        assert_eq!(second.deferred, 1);
        assert_eq!(second.attempted, 0);
        assert_eq!(remote.calls().len(), 1, "delete must not overtake the update");
    }

    #[tokio::test]
    async fn test_permanent_create_failure_dead_letters_dependents() {
        let remote = FakeRemote::new();
        remote.respond_with(|call| (call.op == "create").then(|| Err(http(422))));
        let sync = coordinator(remote.clone(), false);
        let mut events = sync.subscribe();

        let local = queue_create(&sync, EntityKind::Category, json!({ "name": "" }));
        sync.enqueue(NewQueueItem::update(
            EntityKind::Category,
            local,
            json!({ "sortOrder": 2 }),
        ))
        .unwrap();

        sync.connectivity().set_online(true);
        let report = sync.drain().await.unwrap();

        assert_eq!(report.dead_lettered, 2);
        assert_eq!(remote.calls().len(), 1);
        let status = sync.status().unwrap();
        assert_eq!((status.pending, status.failed), (0, 2));
        assert!(sync
            .dead_letters()
            .unwrap()
            .iter()
            .all(|i| i.status == ItemStatus::Failed));

        let mut dead_lettered = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SyncEvent::ItemDeadLettered { .. }) {
                dead_lettered += 1;
            }
        }
        assert_eq!(dead_lettered, 2);
    }

    #[tokio::test]
    async fn test_retry_dead_letter_replays_on_next_pass() {
        let remote = FakeRemote::new();
        remote.respond_with(|call| (call.op == "delete").then(|| Err(http(400))));
        let sync = coordinator(remote.clone(), true);
        let item = sync.enqueue(NewQueueItem::delete(EntityKind::Product, "p1")).unwrap();

        sync.drain().await.unwrap();
        assert_eq!(sync.dead_letters().unwrap().len(), 1);

        remote.respond_with(|_| None);
        assert!(sync.retry_dead_letter(&item.id).unwrap());
        let report = sync.drain().await.unwrap();
        assert_eq!(report.synced, 1);
        assert!(queue::is_empty(sync.db()).unwrap());
    }

    #[tokio::test]
    async fn test_delete_of_missing_record_counts_as_synced() {
        let remote = FakeRemote::new();
        remote.respond_with(|call| (call.op == "delete").then(|| Err(http(404))));
        let sync = coordinator(remote.clone(), true);
        sync.enqueue(NewQueueItem::delete(EntityKind::Customer, "cu1")).unwrap();

        let report = sync.drain().await.unwrap();
        assert_eq!(report.synced, 1);
        assert!(queue::is_empty(sync.db()).unwrap());
    }

    #[tokio::test]
    async fn test_create_without_server_id_is_dead_lettered() {
        let remote = FakeRemote::new();
        remote.respond_with(|call| (call.op == "create").then(|| Ok(json!({ "ok": true }))));
        let sync = coordinator(remote.clone(), true);
        queue_create(&sync, EntityKind::Coupon, json!({ "code": "X" }));

        let report = sync.drain().await.unwrap();
        assert_eq!(report.dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_unreachable_backend_interrupts_pass_without_retry() {
        let remote = FakeRemote::new();
        remote.respond_with(|_| Some(Err(ApiError::Unreachable("refused".into()))));
        let sync = coordinator(remote.clone(), true);
        sync.enqueue(NewQueueItem::delete(EntityKind::Product, "p1")).unwrap();
        sync.enqueue(NewQueueItem::delete(EntityKind::Product, "p2")).unwrap();

        let report = sync.drain().await.unwrap();

        assert!(report.interrupted);
        assert_eq!(remote.calls().len(), 1);
        assert!(sync.pending().unwrap().iter().all(|i| i.retries == 0));
    }

    #[tokio::test]
    async fn test_broken_exchange_fails_only_its_own_item() {
        let remote = FakeRemote::new();
        remote.respond_with(|call| {
            (call.id.as_deref() == Some("p1"))
                .then(|| Err(ApiError::Network("connection reset".into())))
        });
        let sync = coordinator(remote.clone(), true);
        sync.enqueue(NewQueueItem::delete(EntityKind::Product, "p1")).unwrap();
        sync.enqueue(NewQueueItem::delete(EntityKind::Category, "c2"))
            .unwrap();

        let report = sync.drain().await.unwrap();

        assert!(!report.interrupted);
        assert_eq!(report.failed, 1);
        assert_eq!(report.synced, 1);
        assert_eq!(
            dispatched(&remote),
            vec![("delete", Some("p1".into())), ("delete", Some("c2".into()))]
        );
        let pending = sync.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].target_id.as_deref(), Some("p1"));
        assert_eq!(pending[0].retries, 1);
    }

    #[tokio::test]
    async fn test_offline_drain_is_a_no_op() {
        let remote = FakeRemote::new();
        let sync = coordinator(remote.clone(), false);
        sync.enqueue(NewQueueItem::delete(EntityKind::Product, "p1")).unwrap();

        let report = sync.drain().await.unwrap();
        assert_eq!(report.attempted, 0);
        assert!(remote.calls().is_empty());
        assert_eq!(sync.pending().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_overlapping_drain_is_skipped() {
        let remote = FakeRemote::new();
        let sync = coordinator(remote.clone(), true);
        sync.enqueue(NewQueueItem::delete(EntityKind::Product, "p1")).unwrap();

        let _held = sync.drain_lock.lock().await;
        let report = sync.drain().await.unwrap();

        assert!(report.skipped);
        assert!(remote.calls().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_status_reports_a_running_pass() {
        let remote = FakeRemote::new();
        remote.respond_with(|_| {
            std::thread::sleep(Duration::from_millis(200));
            None
        });
        let sync = Arc::new(coordinator(remote.clone(), true));
        sync.enqueue(NewQueueItem::delete(EntityKind::Product, "p1")).unwrap();

        let running = tokio::spawn({
            let sync = sync.clone();
            async move { sync.drain().await }
        });
        let mut seen = false;
        for _ in 0..100 {
            if sync.status().unwrap().is_draining {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(seen, "status never showed the pass running");
        assert!(sync.drain().await.unwrap().skipped);

        let report = running.await.unwrap().unwrap();
        assert_eq!(report.synced, 1);
        assert!(!sync.status().unwrap().is_draining);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_status_polling_never_skips_a_drain() {
        let remote = FakeRemote::new();
        let sync = Arc::new(coordinator(remote.clone(), true));
        let stop = CancellationToken::new();

        let poller = tokio::spawn({
            let sync = sync.clone();
            let stop = stop.clone();
            async move {
                while !stop.is_cancelled() {
                    sync.status().unwrap();
                    tokio::task::yield_now().await;
                }
            }
        });

        for n in 0..20 {
            sync.enqueue(NewQueueItem::delete(EntityKind::Product, format!("p{n}")))
                .unwrap();
            let report = sync.drain().await.unwrap();
            assert!(!report.skipped, "pass {n} was skipped");
            assert_eq!(report.synced, 1);
        }
        stop.cancel();
        poller.await.unwrap();
    }

    #[tokio::test]
    async fn test_sync_invalidates_cached_queries() {
        let remote = FakeRemote::new();
        let sync = coordinator(remote.clone(), true);
        let key = crate::cache::QueryKey::list(EntityKind::Product, &[]);
        sync.cache().insert(key.clone(), json!([]));

        sync.enqueue(NewQueueItem::delete(EntityKind::Product, "p1")).unwrap();
        sync.drain().await.unwrap();

        assert!(sync.cache().get_fresh(&key, Duration::from_secs(60)).is_none());
    }

    #[tokio::test]
    async fn test_probe_drives_connectivity_flag() {
        let remote = FakeRemote::new();
        let sync = coordinator(remote.clone(), true);

        remote.set_healthy(false);
        assert!(!sync.probe_connectivity().await);
        assert!(!sync.is_online());

        remote.set_healthy(true);
        assert!(sync.probe_connectivity().await);
        assert!(sync.is_online());
    }

    #[tokio::test]
    async fn test_sync_loop_drains_on_reconnect() {
        let remote = FakeRemote::new();
        let mut config = crate::test_support::test_config();
        config.sync_interval = Duration::from_secs(3600);
        let sync = Arc::new(SyncCoordinator::new(
            Arc::new(db::open_in_memory().unwrap()),
            remote.clone(),
            Connectivity::new(false),
            config,
        ));
        sync.enqueue(NewQueueItem::delete(EntityKind::Order, "o1")).unwrap();

        let handle = start_sync_loop(sync.clone());
        assert!(handle.is_running());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(remote.calls().is_empty());

        sync.connectivity().set_online(true);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !queue::is_empty(sync.db()).unwrap() {
            assert!(tokio::time::Instant::now() < deadline, "queue never drained");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        handle.shutdown().await;
        assert_eq!(remote.calls().len(), 1);
    }
}
