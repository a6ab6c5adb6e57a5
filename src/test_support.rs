//! Scripted in-process backend used by the sync and binding tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::api::{ConnectivityResult, RemoteApi};
use crate::config::ClientConfig;
use crate::connectivity::Connectivity;
use crate::db;
use crate::entities::EntityKind;
use crate::envelope::Unwrapped;
use crate::error::ApiError;
use crate::sync::SyncCoordinator;

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub op: &'static str,
    pub kind: EntityKind,
    pub id: Option<String>,
    pub data: Value,
}

type Responder = Box<dyn Fn(&Call) -> Result<Value, ApiError> + Send + Sync>;

pub struct FakeRemote {
    calls: Mutex<Vec<Call>>,
    responder: Mutex<Responder>,
    healthy: Mutex<bool>,
    next_id: AtomicUsize,
}

impl FakeRemote {
    /// Backend that accepts everything; creates get ids `srv-1`, `srv-2`, ...
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            responder: Mutex::new(Box::new(|_| Ok(Value::Null))),
            healthy: Mutex::new(true),
            next_id: AtomicUsize::new(1),
        })
    }

    /// Override the answer for matching calls. Returning `None` falls back
    /// to the default accept-everything behaviour.
    pub fn respond_with<F>(&self, f: F)
    where
        F: Fn(&Call) -> Option<Result<Value, ApiError>> + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap() = Box::new(move |call| f(call).unwrap_or(Ok(Value::Null)));
    }

    pub fn set_healthy(&self, healthy: bool) {
        *self.healthy.lock().unwrap() = healthy;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn handle(&self, call: Call) -> Result<Value, ApiError> {
        self.calls.lock().unwrap().push(call.clone());
        let scripted = {
            let responder = self.responder.lock().unwrap();
            (*responder)(&call)?
        };
        if !scripted.is_null() {
            return Ok(scripted);
        }
        match call.op {
            "create" => {
                let n = self.next_id.fetch_add(1, Ordering::SeqCst);
                let mut record = call.data.clone();
                if let Value::Object(map) = &mut record {
                    map.insert("id".into(), json!(format!("srv-{n}")));
                }
                Ok(record)
            }
            "update" => {
                let mut record = call.data.clone();
                if let (Value::Object(map), Some(id)) = (&mut record, call.id.clone()) {
                    map.insert("id".into(), json!(id));
                }
                Ok(record)
            }
            "list" => Ok(json!([])),
            "get" => Ok(json!({ "id": call.id })),
            _ => Ok(Value::Null),
        }
    }
}

#[async_trait]
impl RemoteApi for FakeRemote {
    async fn create(&self, kind: EntityKind, data: &Value) -> Result<Value, ApiError> {
        self.handle(Call {
            op: "create",
            kind,
            id: None,
            data: data.clone(),
        })
    }

    async fn update(&self, kind: EntityKind, id: &str, data: &Value) -> Result<Value, ApiError> {
        self.handle(Call {
            op: "update",
            kind,
            id: Some(id.to_string()),
            data: data.clone(),
        })
    }

    async fn delete(&self, kind: EntityKind, id: &str) -> Result<Value, ApiError> {
        self.handle(Call {
            op: "delete",
            kind,
            id: Some(id.to_string()),
            data: Value::Null,
        })
    }

    async fn get(&self, kind: EntityKind, id: &str) -> Result<Value, ApiError> {
        self.handle(Call {
            op: "get",
            kind,
            id: Some(id.to_string()),
            data: Value::Null,
        })
    }

    async fn list(
        &self,
        kind: EntityKind,
        query: &[(String, String)],
    ) -> Result<Unwrapped, ApiError> {
        let data = self.handle(Call {
            op: "list",
            kind,
            id: None,
            data: json!(query),
        })?;
        Ok(Unwrapped {
            data,
            pagination: None,
        })
    }

    async fn health(&self) -> ConnectivityResult {
        let healthy = *self.healthy.lock().unwrap();
        ConnectivityResult {
            success: healthy,
            latency_ms: healthy.then_some(1),
            error: (!healthy).then(|| "unreachable".to_string()),
        }
    }
}

pub fn test_config() -> ClientConfig {
    ClientConfig {
        probe_connectivity: false,
        ..ClientConfig::new("http://backend.test")
    }
}

/// Coordinator over an in-memory database and the given fake backend.
pub fn coordinator(remote: Arc<FakeRemote>, online: bool) -> SyncCoordinator {
    let db = Arc::new(db::open_in_memory().expect("in-memory db"));
    SyncCoordinator::new(db, remote, Connectivity::new(online), test_config())
}
