//! Read-mostly HTTP surface plus the token-gated admin endpoints.

use std::sync::Arc;

use arena_shared::PlayerId;
use arena_sim::section_position;
use arena_store::AdminCommand;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::game::GameCommand;
use crate::gateway;
use crate::AppState;

const INTERNAL_TOKEN_HEADER: &str = "x-internal-token";

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(gateway::ws_handler))
        .route("/health", get(health))
        .route("/presence", get(presence))
        .route("/challenges/recent", get(challenges_recent))
        .route("/escrow/events/recent", get(escrow_events_recent))
        .route("/metrics", get(metrics_text))
        .route("/metrics.json", get(metrics_json))
        .route("/leaderboard", get(leaderboard))
        .route("/migrations/status", get(migrations_status))
        .route("/admin/teleport", post(admin_teleport))
        .with_state(state)
}

fn authorized(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(expected) = &state.config.internal_service_token else {
        return false;
    };
    headers
        .get(INTERNAL_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|token| token == expected)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let tick = state.snapshot.read().map(|s| s.tick).unwrap_or(0);
    Json(json!({
        "ok": true,
        "serverId": state.server_id,
        "tick": tick,
        "sessions": state.registry.len(),
    }))
}

#[derive(Deserialize)]
struct PresenceQuery {
    id: Option<String>,
}

async fn presence(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PresenceQuery>,
) -> impl IntoResponse {
    match query.id {
        Some(id) => {
            let entry = state.presence.get(&PlayerId::new(id)).await.ok().flatten();
            Json(json!({ "entry": entry }))
        }
        None => {
            let entries = state.presence.list().await.unwrap_or_default();
            Json(json!({ "entries": entries }))
        }
    }
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

async fn challenges_recent(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(50).min(300);
    let ring = state
        .challenge_store
        .recent_history(limit)
        .await
        .unwrap_or_default();
    if !ring.is_empty() {
        return Json(json!({ "entries": ring, "source": "distributed" }));
    }
    // Store unavailable or empty; serve what this node saw itself.
    let local: Vec<_> = state
        .local_history
        .lock()
        .unwrap()
        .iter()
        .rev()
        .take(limit)
        .cloned()
        .collect();
    Json(json!({ "entries": local, "source": "local" }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EscrowEventsQuery {
    player_id: Option<String>,
    limit: Option<usize>,
}

async fn escrow_events_recent(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<EscrowEventsQuery>,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "ok": false }))).into_response();
    }
    let limit = query.limit.unwrap_or(50);
    let events = match query.player_id {
        Some(id) => state
            .escrow_log
            .recent_for_player(&PlayerId::new(id), limit)
            .await,
        None => state.escrow_log.recent(limit).await,
    }
    .unwrap_or_default();
    Json(json!({ "ok": true, "events": events })).into_response()
}

async fn metrics_text(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.metrics.text()
}

async fn metrics_json(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let mut body = state.metrics.json();
    if let Some(map) = body.as_object_mut() {
        map.insert("serverId".to_owned(), json!(state.server_id));
    }
    Json(body)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaderboardQuery {
    limit: Option<usize>,
    sort_by: Option<String>,
}

async fn leaderboard(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LeaderboardQuery>,
) -> impl IntoResponse {
    let rows = state.leaderboard.top(
        query.limit.unwrap_or(20).min(100),
        query.sort_by.as_deref().unwrap_or("wins"),
    );
    Json(json!({ "entries": rows }))
}

async fn migrations_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "ok": false }))).into_response();
    }
    // Schema management belongs to the relational collaborator; the game
    // server only vouches that it is not involved.
    Json(json!({ "ok": true, "managedBy": "external", "pending": 0 })).into_response()
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TeleportBody {
    player_id: String,
    x: Option<f32>,
    z: Option<f32>,
    section: Option<u8>,
}

async fn admin_teleport(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<TeleportBody>,
) -> impl IntoResponse {
    if !authorized(&state, &headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({ "ok": false }))).into_response();
    }
    let (x, z) = match (body.x, body.z, body.section) {
        (Some(x), Some(z), _) => (x, z),
        (_, _, Some(section)) => section_position(section),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "ok": false, "reason": "missing_target" })),
            )
                .into_response();
        }
    };
    let player_id = PlayerId::new(body.player_id);

    let owner = state
        .presence
        .get(&player_id)
        .await
        .ok()
        .flatten()
        .map(|entry| entry.owner_server_id);
    match owner {
        Some(owner) if owner != state.server_id => {
            let command = AdminCommand::AdminTeleport { player_id, x, z };
            if let Err(e) = state.bus.forward_admin_command(&owner, &command).await {
                log::warn!("admin teleport forward failed: {e}");
                return (StatusCode::BAD_GATEWAY, Json(json!({ "ok": false }))).into_response();
            }
            Json(json!({ "ok": true, "forwardedTo": owner })).into_response()
        }
        _ => {
            let _ = state
                .game_tx
                .send(GameCommand::Teleport { player_id, x, z })
                .await;
            Json(json!({ "ok": true })).into_response()
        }
    }
}
