//! Orphan sweep: any surviving node expires challenges whose owner stopped
//! heartbeating, releases the player locks, and tells both participants.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use arena_protocol::ServerFrame;
use arena_shared::{cancel, now_ms, PlayerId, ServerId};
use arena_store::{Bus, ChallengeMeta, ChallengeStore, HistoryRecord, PresenceStore};
use tokio::select;
use tokio::time::interval;

const SWEEP_INTERVAL: Duration = Duration::from_secs(3);
const NON_TERMINAL: [&str; 5] = ["created", "accepted", "pending", "active", "move_submitted"];
const REASON: &str = "owner_failover_expired";

pub async fn run_sweeper(
    presence: Arc<PresenceStore>,
    challenge_store: Arc<ChallengeStore>,
    bus: Arc<Bus>,
    grace_ms: u64,
    cancel: cancel::Token,
) {
    let mut ticker = interval(SWEEP_INTERVAL);
    loop {
        select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = ticker.tick() => sweep(&presence, &challenge_store, &bus, grace_ms).await,
        }
    }
}

async fn sweep(
    presence: &PresenceStore,
    challenge_store: &ChallengeStore,
    bus: &Bus,
    grace_ms: u64,
) {
    let live: HashSet<ServerId> = match presence.live_servers().await {
        Ok(servers) => servers.into_iter().collect(),
        Err(e) => {
            log::warn!("sweeper cannot read live servers: {e}");
            return;
        }
    };
    let metas = match challenge_store.list_metas().await {
        Ok(metas) => metas,
        Err(e) => {
            log::warn!("sweeper cannot list challenge metas: {e}");
            return;
        }
    };

    let now = now_ms();
    for meta in metas {
        if !NON_TERMINAL.contains(&meta.status.as_str()) {
            continue;
        }
        if live.contains(&meta.owner_server_id) {
            continue;
        }
        if now.saturating_sub(meta.updated_at) < grace_ms {
            continue;
        }
        expire_orphan(challenge_store, bus, &meta, now).await;
    }
}

async fn expire_orphan(challenge_store: &ChallengeStore, bus: &Bus, meta: &ChallengeMeta, now: u64) {
    log::info!(
        "expiring orphan {} (owner {} gone)",
        meta.id,
        meta.owner_server_id
    );

    let mut snapshot = meta.json.clone();
    if let Some(object) = snapshot.as_object_mut() {
        object.insert("status".to_owned(), "expired".into());
    }

    let participants: Vec<PlayerId> = [&meta.challenger_id, &meta.opponent_id]
        .into_iter()
        .filter(|p| !p.is_house())
        .cloned()
        .collect();

    if let Err(e) = challenge_store
        .append_history(&HistoryRecord {
            at: now,
            event: "expired".to_owned(),
            reason: Some(REASON.to_owned()),
            challenge: snapshot.clone(),
        })
        .await
    {
        log::warn!("orphan history append for {} failed: {e}", meta.id);
    }
    if let Err(e) = challenge_store
        .force_release_players(&meta.id, &participants)
        .await
    {
        log::warn!("orphan lock release for {} failed: {e}", meta.id);
    }
    if let Err(e) = challenge_store.clear(&meta.id).await {
        log::warn!("orphan meta clear for {} failed: {e}", meta.id);
    }

    let frame = ServerFrame::Challenge {
        event: "expired".to_owned(),
        reason: Some(REASON.to_owned()),
        challenge: Some(snapshot),
    }
    .to_json();
    for player in &participants {
        match serde_json::from_str(&frame) {
            Ok(value) => {
                if let Err(e) = bus.publish_to_player(player, value).await {
                    log::warn!("orphan notice to {player} failed: {e}");
                }
            }
            Err(e) => log::warn!("orphan frame serialization failed: {e}"),
        }
    }
}
