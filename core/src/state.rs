use std::sync::Arc;

use matchcore_shared::clients::db::DbPool;
use metrics_exporter_prometheus::PrometheusHandle;

use crate::collision::CollisionDetector;
use crate::config::AppConfig;

/// Shared state for the HTTP/Socket.IO surface. Background workers
/// (`StabilityWorker`, `Janitor`, `InterviewRunner`) are spawned directly
/// from `main` with their own collaborators and do not need a handle on
/// this struct.
pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    pub metrics_handle: PrometheusHandle,
    pub collision_detector: Arc<CollisionDetector>,
}
