//! Typed entity bindings on top of the sync coordinator.
//!
//! Mutations go straight to the backend while online. When the device is
//! offline, or the mutation touches a record that only exists locally so
//! far, the mutation is queued and a locally shaped record is returned
//! instead. A failed online attempt is reported to the caller and never
//! silently queued.

use serde_json::{json, Value};
use std::marker::PhantomData;
use tracing::debug;

use crate::cache::QueryKey;
use crate::entities::{Categories, Coupons, Customers, Entity, EntityKind, Orders, Payload, Products};
use crate::envelope::Unwrapped;
use crate::error::{SyncError, SyncResult};
use crate::local_id::{collect_local_ids, generate_local_id, is_local_id};
use crate::queue::{self, NewQueueItem, Operation};
use crate::sync::SyncCoordinator;

/// Binding for one entity type.
pub struct EntityBinding<'a, E: Entity> {
    sync: &'a SyncCoordinator,
    _entity: PhantomData<E>,
}

impl SyncCoordinator {
    pub fn products(&self) -> EntityBinding<'_, Products> {
        EntityBinding::new(self)
    }

    pub fn orders(&self) -> EntityBinding<'_, Orders> {
        EntityBinding::new(self)
    }

    pub fn categories(&self) -> EntityBinding<'_, Categories> {
        EntityBinding::new(self)
    }

    pub fn customers(&self) -> EntityBinding<'_, Customers> {
        EntityBinding::new(self)
    }

    pub fn coupons(&self) -> EntityBinding<'_, Coupons> {
        EntityBinding::new(self)
    }
}

fn to_payload<P: Payload>(payload: &P) -> SyncResult<Value> {
    payload.validate()?;
    Ok(serde_json::to_value(payload)?)
}

fn with_id(mut record: Value, id: &str) -> Value {
    match &mut record {
        Value::Object(map) => {
            map.insert("id".into(), json!(id));
            record
        }
        _ => json!({ "id": id }),
    }
}

impl<'a, E: Entity> EntityBinding<'a, E> {
    fn new(sync: &'a SyncCoordinator) -> Self {
        Self {
            sync,
            _entity: PhantomData,
        }
    }

    pub fn kind(&self) -> EntityKind {
        E::KIND
    }

    /// Whether a mutation with this payload must go through the queue.
    fn must_queue(&self, target: Option<&str>, payload: &Value) -> bool {
        !self.sync.is_online()
            || target.is_some_and(is_local_id)
            || !collect_local_ids(payload).is_empty()
    }

    pub async fn create(&self, payload: &E::New) -> SyncResult<Value> {
        let mut data = to_payload(payload)?;
        self.sync.resolve_payload(&mut data)?;

        if self.must_queue(None, &data) {
            let local_id = generate_local_id();
            let record = with_id(data.clone(), &local_id);
            self.sync
                .enqueue(NewQueueItem::create(E::KIND, local_id, data))?;
            return Ok(record);
        }

        let created = self.sync.remote().create(E::KIND, &data).await?;
        self.sync.cache().invalidate_entity(E::KIND);
        Ok(created)
    }

    pub async fn update(&self, id: &str, patch: &E::Patch) -> SyncResult<Value> {
        let mut data = to_payload(patch)?;
        self.sync.resolve_payload(&mut data)?;

        if self.must_queue(Some(id), &data) {
            let target = self.sync.resolve_id(id)?;
            let record = with_id(data.clone(), id);
            self.sync
                .enqueue(NewQueueItem::update(E::KIND, target, data))?;
            return Ok(record);
        }

        let updated = self.sync.remote().update(E::KIND, id, &data).await?;
        self.sync.cache().invalidate_entity(E::KIND);
        Ok(updated)
    }

    pub async fn delete(&self, id: &str) -> SyncResult<Value> {
        if self.must_queue(Some(id), &Value::Null) {
            let target = self.sync.resolve_id(id)?;
            self.sync.enqueue(NewQueueItem::delete(E::KIND, target))?;
            return Ok(Value::Null);
        }

        let deleted = self.sync.remote().delete(E::KIND, id).await?;
        self.sync.cache().invalidate_entity(E::KIND);
        self.sync.cache().remove_detail(E::KIND, id);
        Ok(deleted)
    }

    /// Fetch one record. Records that only exist in the queue are served
    /// from their queued create.
    pub async fn get(&self, id: &str) -> SyncResult<Value> {
        let id = self.sync.resolve_id(id)?;
        if is_local_id(&id) {
            return self.queued_record(&id);
        }

        let key = QueryKey::detail(E::KIND, &id);
        if let Some(hit) = self.sync.cache().get_fresh(&key, self.sync.config().stale_time) {
            return Ok(hit);
        }
        if !self.sync.is_online() {
            return self.sync.cache().get_any(&key).ok_or_else(|| {
                SyncError::Offline(format!("{} {id}", E::KIND))
            });
        }

        let record = self.sync.remote().get(E::KIND, &id).await?;
        self.sync.cache().insert(key, record.clone());
        Ok(record)
    }

    pub async fn list(&self, query: &[(String, String)]) -> SyncResult<Unwrapped> {
        let key = QueryKey::list(E::KIND, query);
        let cached = if self.sync.is_online() {
            self.sync.cache().get_fresh(&key, self.sync.config().stale_time)
        } else {
            self.sync.cache().get_any(&key)
        };
        if let Some(hit) = cached {
            return Ok(serde_json::from_value(hit)?);
        }
        if !self.sync.is_online() {
            return Err(SyncError::Offline(format!("{} list", E::KIND)));
        }

        let page = self.sync.remote().list(E::KIND, query).await?;
        self.sync.cache().insert(key, serde_json::to_value(&page)?);
        Ok(page)
    }

    fn queued_record(&self, local_id: &str) -> SyncResult<Value> {
        let create = queue::all_items(self.sync.db())?.into_iter().find(|item| {
            item.op == Operation::Create
                && item.entity == E::KIND
                && item.local_id.as_deref() == Some(local_id)
        });
        match create {
            Some(item) => {
                debug!(local_id, "serving record from its queued create");
                Ok(with_id(item.data, local_id))
            }
            None => Err(SyncError::NotFound(format!("{} {local_id}", E::KIND))),
        }
    }
}
