//! POS offline sync core.
//!
//! Headless client core shared by the POS and delivery apps: typed entity
//! bindings for products, orders, categories, customers and coupons that
//! keep working offline, the persistent mutation queue that replays them on
//! reconnect, a read cache, and the delivery-routing helpers.

use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;

mod api;
mod bindings;
mod cache;
mod config;
mod connectivity;
mod db;
mod entities;
mod envelope;
mod error;
mod local_id;
mod logging;
mod queue;
mod routing;
mod storage;
mod sync;
#[cfg(test)]
mod test_support;

pub use api::{ApiClient, ConnectivityResult, RemoteApi};
pub use bindings::EntityBinding;
pub use cache::{QueryCache, QueryKey};
pub use config::ClientConfig;
pub use connectivity::Connectivity;
pub use db::DbState;
pub use entities::*;
pub use envelope::{extract_server_id, unwrap_envelope, Pagination, Unwrapped};
pub use error::{ApiError, SyncError, SyncResult, ValidationError};
pub use local_id::{generate_local_id, is_local_id, LOCAL_ID_PREFIX};
pub use logging::{init_logging, prune_old_logs};
pub use queue::{ItemStatus, Operation, QueueCounts, QueueItem};
pub use routing::{
    compare_routes, decode_polyline, estimate_arrival, haversine_m, path_length_m,
    remaining_on_route, Coordinate, DirectionsClient, PolylineError, Remaining, Route,
    RouteComparison,
};
pub use storage::{clear_all as clear_credentials, clear_auth_token, save_auth_token};
pub use sync::{
    start_sync_loop, DrainReport, SyncCoordinator, SyncEvent, SyncLoopHandle, SyncStatus,
};

/// A running client: the shared coordinator, its background sync loop, and
/// the log writer guard.
pub struct SyncClient {
    pub coordinator: Arc<SyncCoordinator>,
    pub sync_loop: SyncLoopHandle,
    _log_guard: WorkerGuard,
}

impl SyncClient {
    pub async fn shutdown(self) {
        self.sync_loop.shutdown().await;
    }
}

/// Initialise logging, open the local database and backend client, and
/// start the background sync loop. Must be called inside a tokio runtime.
pub fn start(config: ClientConfig) -> SyncResult<SyncClient> {
    let log_guard = logging::init_logging(&logging::log_dir(&config.data_dir))?;

    let coordinator = Arc::new(SyncCoordinator::open(config)?);
    let status = coordinator.status()?;
    info!(
        pending = status.pending,
        failed = status.failed,
        "sync coordinator ready"
    );

    let sync_loop = start_sync_loop(coordinator.clone());
    Ok(SyncClient {
        coordinator,
        sync_loop,
        _log_guard: log_guard,
    })
}
