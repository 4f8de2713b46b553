//! Session gateway: `/ws` upgrade with authentication, frame dispatch, and
//! session lifecycle. A reconnect under the same stable id closes the prior
//! socket with 4000/replaced_by_reconnect before the new welcome goes out.

use std::collections::HashMap;
use std::sync::Arc;

use arena_protocol::auth::{sanitize_client_id, verify_token};
use arena_protocol::{parse_client_frame, ClientFrame, ServerFrame};
use arena_shared::{now_ms, PlayerId, Role};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::config::AuthMode;
use crate::game::GameCommand;
use crate::sessions::{Outbound, SessionMeta};
use crate::AppState;

struct Identity {
    player_id: PlayerId,
    role: Role,
    display_name: String,
    wallet_id: Option<String>,
    spawn_section: Option<u8>,
}

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    match authenticate(&state, &params, &headers).await {
        Ok(identity) => ws.on_upgrade(move |socket| run_session(state, socket, identity)),
        Err((status, reason)) => {
            log::debug!("rejecting session upgrade: {reason}");
            (status, reason).into_response()
        }
    }
}

async fn authenticate(
    state: &AppState,
    params: &HashMap<String, String>,
    headers: &HeaderMap,
) -> Result<Identity, (StatusCode, &'static str)> {
    let role = match params.get("role").map(String::as_str) {
        None | Some("human") => Role::Human,
        Some("agent") => Role::Agent,
        Some(_) => return Err((StatusCode::BAD_REQUEST, "unknown_role")),
    };
    let raw_id = match role {
        Role::Human => params.get("clientId"),
        Role::Agent => params.get("agentId"),
    }
    .filter(|id| !id.is_empty())
    .ok_or((StatusCode::BAD_REQUEST, "missing_client_id"))?;

    let mut display_name = params.get("name").cloned();
    let mut wallet_id = params.get("walletId").cloned();

    match &state.config.auth_mode {
        AuthMode::SignedToken { secret } => {
            let token = params
                .get("wsAuth")
                .ok_or((StatusCode::UNAUTHORIZED, "missing_token"))?;
            let claims = verify_token(secret, token, role, raw_id, now_ms() / 1000)
                .map_err(|e| {
                    log::debug!("token rejected for {raw_id}: {e}");
                    (StatusCode::UNAUTHORIZED, "invalid_token")
                })?;
            if claims.wallet_id.is_some() {
                wallet_id = claims.wallet_id;
            }
        }
        AuthMode::CookieSession { auth_url } => {
            let cookie = headers
                .get(header::COOKIE)
                .and_then(|v| v.to_str().ok())
                .ok_or((StatusCode::UNAUTHORIZED, "missing_session_cookie"))?;
            let session = validate_cookie(state, auth_url, cookie)
                .await
                .ok_or((StatusCode::UNAUTHORIZED, "invalid_session"))?;
            if session.display_name.is_some() {
                display_name = session.display_name;
            }
            if session.wallet_id.is_some() {
                wallet_id = session.wallet_id;
            }
        }
        AuthMode::Open => {}
    }

    let player_id = match role {
        Role::Human => PlayerId::new(format!("u_{}", sanitize_client_id(raw_id))),
        Role::Agent => PlayerId::new(raw_id.clone()),
    };
    Ok(Identity {
        display_name: display_name.unwrap_or_else(|| player_id.to_string()),
        player_id,
        role,
        wallet_id,
        spawn_section: params.get("spawnSection").and_then(|s| s.parse().ok()),
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CookieValidation {
    ok: bool,
    display_name: Option<String>,
    wallet_id: Option<String>,
}

async fn validate_cookie(
    state: &AppState,
    auth_url: &str,
    cookie: &str,
) -> Option<CookieValidation> {
    let url = format!("{}/session/validate", auth_url.trim_end_matches('/'));
    let response = state
        .auth_http
        .post(url)
        .json(&serde_json::json!({ "cookie": cookie }))
        .send()
        .await
        .ok()?;
    if !response.status().is_success() {
        return None;
    }
    let validation: CookieValidation = response.json().await.ok()?;
    validation.ok.then_some(validation)
}

async fn run_session(state: Arc<AppState>, socket: WebSocket, identity: Identity) {
    let Identity {
        player_id,
        role,
        display_name,
        wallet_id,
        spawn_section,
    } = identity;

    let meta = SessionMeta {
        role,
        display_name: display_name.clone(),
        wallet_id,
    };
    let lease = state.registry.register(player_id.clone(), meta.clone());
    state.metrics.sessions.set(state.registry.len() as i64);
    log::info!("{player_id} connected as {role} ({display_name})");

    // A rejoin lands at the persisted presence position when it is usable.
    let preferred = state
        .presence
        .get(&player_id)
        .await
        .ok()
        .flatten()
        .map(|entry| (entry.x, entry.z));

    let welcome = ServerFrame::Welcome {
        player_id: player_id.clone(),
        role,
        display_name,
        server_id: state.server_id.to_string(),
    };
    state.registry.send_to(&player_id, welcome.to_json());

    let input = lease.input.clone();
    let joined = state
        .game_tx
        .send(GameCommand::Join {
            player_id: player_id.clone(),
            meta,
            input: input.clone(),
            preferred,
            spawn_section,
        })
        .await;
    if joined.is_err() {
        log::error!("game loop unavailable; dropping {player_id}");
        return;
    }

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut outbound = lease.outbound;
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            match message {
                Outbound::Frame(json) => {
                    if ws_tx.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = ws_tx
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if let Some(frame) = parse_client_frame(&text) {
                    handle_frame(&state, &player_id, &input, frame).await;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    if state.registry.remove(&player_id, lease.epoch) {
        let _ = state
            .game_tx
            .send(GameCommand::Leave {
                player_id: player_id.clone(),
            })
            .await;
        log::info!("{player_id} disconnected");
    }
    state.metrics.sessions.set(state.registry.len() as i64);
    writer.abort();
}

async fn handle_frame(
    state: &Arc<AppState>,
    player_id: &PlayerId,
    input: &crate::sessions::InputSlot,
    frame: ClientFrame,
) {
    match frame {
        ClientFrame::Input { move_x, move_z } => input.store(move_x, move_z),
        ClientFrame::ChallengeSend {
            target_id,
            game_type,
            wager,
        } => {
            let _ = state
                .game_tx
                .send(GameCommand::ChallengeSend {
                    actor: player_id.clone(),
                    target: target_id,
                    game_type,
                    wager,
                })
                .await;
        }
        ClientFrame::ChallengeResponse {
            challenge_id,
            accept,
        } => {
            let _ = state
                .game_tx
                .send(GameCommand::ChallengeResponse {
                    actor: player_id.clone(),
                    challenge_id,
                    accept,
                })
                .await;
        }
        ClientFrame::ChallengeCounter {
            challenge_id,
            wager,
        } => {
            let _ = state
                .game_tx
                .send(GameCommand::ChallengeCounter {
                    actor: player_id.clone(),
                    challenge_id,
                    wager,
                })
                .await;
        }
        ClientFrame::ChallengeMove { challenge_id, mv } => {
            let _ = state
                .game_tx
                .send(GameCommand::ChallengeMove {
                    actor: player_id.clone(),
                    challenge_id,
                    mv,
                })
                .await;
        }
        ClientFrame::StationInteract {
            station_id,
            action,
            wager,
            side,
            mv,
            face,
            player_seed,
        } => {
            let pick = side.or(mv).or_else(|| face.map(|f| f.to_string()));
            let frames = state
                .stations
                .interact(player_id, &station_id, &action, wager, pick, player_seed)
                .await;
            for frame in frames {
                state.registry.send_to(player_id, frame.to_json());
            }
        }
    }
}
