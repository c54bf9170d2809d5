use std::sync::Arc;

use chrono::{TimeZone, Utc};
use matchcore_shared::CoreError;
use serde::{Deserialize, Serialize};
use socketioxide::extract::{Data, SocketRef, State};
use uuid::Uuid;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PositionUpdatePayload {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub accuracy_m: Option<f64>,
    pub device_timestamp: i64,
}

#[derive(Debug, Serialize)]
pub struct PositionUpdateAck {
    pub skipped: bool,
    pub collisions: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Socket.IO connection handler: the one realtime entrypoint into
/// `CollisionDetector::ingest`. The user id is resolved once from the JWT at
/// handshake time and is never re-read from event payloads.
pub async fn on_connect(socket: SocketRef, state: State<Arc<AppState>>) {
    let user_id = match authenticate_socket(&socket, &state) {
        Ok(id) => id,
        Err(msg) => {
            tracing::warn!(error = %msg, "socket auth failed");
            let _ = socket.emit(
                "error",
                &ErrorPayload {
                    code: "E0004".into(),
                    message: msg,
                },
            );
            socket.disconnect().ok();
            return;
        }
    };

    socket.extensions.insert(user_id);

    // Register handlers before any async work: the client may emit
    // position:update immediately after the handshake completes.
    socket.on("position:update", on_position_update);
    socket.on_disconnect(on_disconnect);

    tracing::info!(user_id = %user_id, sid = %socket.id, "socket connected");
    let _ = socket.emit("connected", &serde_json::json!({ "user_id": user_id }));
}

async fn on_position_update(
    socket: SocketRef,
    state: State<Arc<AppState>>,
    Data(payload): Data<PositionUpdatePayload>,
) {
    let Some(user_id) = get_user_id(&socket) else {
        return;
    };

    let device_instant = match Utc.timestamp_millis_opt(payload.device_timestamp).single() {
        Some(instant) => instant,
        None => {
            let _ = socket.emit(
                "error",
                &ErrorPayload {
                    code: "E0007".into(),
                    message: "invalid device_timestamp".into(),
                },
            );
            return;
        }
    };

    match state
        .collision_detector
        .ingest(user_id, payload.lat, payload.lng, payload.accuracy_m, device_instant)
        .await
    {
        Ok(outcome) => {
            let _ = socket.emit(
                "position:update:ack",
                &PositionUpdateAck {
                    skipped: outcome.skipped,
                    collisions: outcome.collisions,
                },
            );
        }
        Err(e) => {
            let (code, message) = error_envelope(&e);
            let _ = socket.emit("error", &ErrorPayload { code, message });
        }
    }
}

async fn on_disconnect(socket: SocketRef) {
    if let Some(user_id) = get_user_id(&socket) {
        tracing::info!(user_id = %user_id, sid = %socket.id, "socket disconnected");
    }
}

fn authenticate_socket(socket: &SocketRef, state: &Arc<AppState>) -> Result<Uuid, String> {
    let connect_info = socket.req_parts();
    let query = connect_info.uri.query().unwrap_or_default();
    let token = query
        .split('&')
        .find_map(|pair| {
            let mut split = pair.splitn(2, '=');
            let key = split.next()?;
            let value = split.next()?;
            (key == "token").then(|| value.to_string())
        })
        .ok_or_else(|| "missing token query parameter".to_string())?;

    let claims = matchcore_shared::middleware::decode_token(&token, &state.config.jwt_secret)
        .map_err(|e| e.to_string())?;

    Ok(claims.sub)
}

fn get_user_id(socket: &SocketRef) -> Option<Uuid> {
    socket.extensions.get::<Uuid>()
}

fn error_envelope(error: &CoreError) -> (String, String) {
    match error {
        CoreError::Known { code, message, .. } => (code.code().to_string(), message.clone()),
        CoreError::Validation(msg) => ("E0002".to_string(), msg.clone()),
        other => ("E0001".to_string(), other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_parsed_from_query_string() {
        let query = "foo=bar&token=abc.def.ghi&baz=qux";
        let token = query
            .split('&')
            .find_map(|pair| {
                let mut split = pair.splitn(2, '=');
                let key = split.next()?;
                let value = split.next()?;
                (key == "token").then(|| value.to_string())
            })
            .unwrap();
        assert_eq!(token, "abc.def.ghi");
    }
}
