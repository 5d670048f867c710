//! The narrow HTTP surface.
//!
//! Two endpoints beyond the WebSocket upgrade:
//!
//! - `GET /api/auth/token` — hands the process token to same-machine
//!   consumers (the extension's launcher page reads it before opening the
//!   socket).
//! - `POST /api/spawn` — programmatic spawn for tooling; requires the
//!   token in the `X-Auth-Token` header (or `token` query parameter) and
//!   always spawns a multiplexer-backed bash terminal.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::server::protocol::SpawnConfig;
use crate::server::Broker;
use crate::spawn::SpawnOutcome;

/// `GET /api/auth/token` — public on the loopback interface; the token
/// gates everything else.
pub async fn token_handler(State(broker): State<Arc<Broker>>) -> Json<serde_json::Value> {
    Json(json!({ "token": broker.auth.token() }))
}

/// Body accepted by `POST /api/spawn`. Everything is optional; the
/// terminal type and multiplexer use are fixed server-side.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnBody {
    /// Tab label.
    #[serde(default)]
    pub name: Option<String>,
    /// Working directory; defaults to the user home.
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Startup command.
    #[serde(default)]
    pub command: Option<String>,
}

/// `POST /api/spawn`.
pub async fn spawn_handler(
    State(broker): State<Arc<Broker>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Option<Json<SpawnBody>>,
) -> Response {
    let presented = headers
        .get("x-auth-token")
        .and_then(|v| v.to_str().ok())
        .or_else(|| query.get("token").map(String::as_str));

    if !presented.is_some_and(|t| broker.auth.validate(t)) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unauthorized" })),
        )
            .into_response();
    }

    let body = body.map(|Json(b)| b).unwrap_or_default();
    let config = SpawnConfig {
        terminal_type: "bash".to_string(),
        name: body.name,
        working_dir: body.working_dir,
        command: body.command,
        use_multiplexer: true,
        is_chrome: true,
    };

    match broker.spawner.spawn(&broker, None, &config, None).await {
        Ok(SpawnOutcome::Spawned(record)) => {
            Json(json!({ "success": true, "terminal": record })).into_response()
        }
        // No requestId on this path, so duplicates cannot occur; covered
        // for completeness.
        Ok(SpawnOutcome::Duplicate) => Json(json!({ "success": true })).into_response(),
        Err(e) => {
            log::warn!("[http] spawn failed: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
