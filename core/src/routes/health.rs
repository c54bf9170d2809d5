use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use diesel::RunQueryDsl;
use matchcore_shared::types::api::{HealthCheck, HealthResponse, HealthStatus};

use crate::state::AppState;

/// Liveness plus a database reachability probe. Redis and the broker are
/// not probed; the service keeps running without either.
pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let db = state.db.clone();
    let probe = tokio::task::spawn_blocking(move || -> Result<(), String> {
        let mut conn = db.get().map_err(|e| e.to_string())?;
        diesel::sql_query("SELECT 1")
            .execute(&mut conn)
            .map_err(|e| e.to_string())?;
        Ok(())
    })
    .await
    .unwrap_or_else(|e| Err(e.to_string()));

    let postgres = match probe {
        Ok(()) => HealthCheck {
            name: "postgres".into(),
            status: HealthStatus::Healthy,
            message: None,
        },
        Err(e) => HealthCheck {
            name: "postgres".into(),
            status: HealthStatus::Unhealthy,
            message: Some(e),
        },
    };

    Json(
        HealthResponse::healthy("matchcore", env!("CARGO_PKG_VERSION"))
            .with_checks(vec![postgres]),
    )
}

pub async fn metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}
