//! Cross-node routing: player-direct deliveries fan out to every node and
//! the session owner forwards them locally; challenge and admin commands go
//! to the named owner node only.

use std::sync::Arc;

use arena_shared::{ChallengeId, PlayerId, ServerId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::kv::{Kv, StoreError};

const PLAYER_CHANNEL: &str = "arena:player";
const CHALLENGE_CHANNEL_PREFIX: &str = "arena:challenge:";
const ADMIN_CHANNEL_PREFIX: &str = "arena:admin:";

/// Commands forwarded to a challenge's owner node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChallengeCommand {
    #[serde(rename_all = "camelCase")]
    ChallengeResponse {
        challenge_id: ChallengeId,
        actor_id: PlayerId,
        accept: bool,
    },
    #[serde(rename_all = "camelCase")]
    ChallengeCounter {
        challenge_id: ChallengeId,
        actor_id: PlayerId,
        wager: u32,
    },
    #[serde(rename_all = "camelCase")]
    ChallengeMove {
        challenge_id: ChallengeId,
        actor_id: PlayerId,
        #[serde(rename = "move")]
        mv: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdminCommand {
    #[serde(rename_all = "camelCase")]
    AdminTeleport { player_id: PlayerId, x: f32, z: f32 },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlayerEnvelope {
    player_id: PlayerId,
    payload: Value,
}

/// A parsed inbound delivery. Consumers feed these into the same dispatch
/// queue as session messages and must tolerate replay and reordering; the
/// state machine guards decide legality.
#[derive(Clone, Debug)]
pub enum BusEvent {
    PlayerDirect { player_id: PlayerId, payload: Value },
    Challenge(ChallengeCommand),
    Admin(AdminCommand),
}

pub struct Bus {
    kv: Arc<dyn Kv>,
    server_id: ServerId,
}

impl Bus {
    pub fn new(kv: Arc<dyn Kv>, server_id: ServerId) -> Self {
        Self { kv, server_id }
    }

    pub async fn publish_to_player(
        &self,
        player_id: &PlayerId,
        payload: Value,
    ) -> Result<(), StoreError> {
        let envelope = PlayerEnvelope {
            player_id: player_id.clone(),
            payload,
        };
        let json =
            serde_json::to_string(&envelope).map_err(|e| StoreError::Transport(e.to_string()))?;
        self.kv.publish(PLAYER_CHANNEL, &json).await
    }

    pub async fn forward_challenge_command(
        &self,
        owner: &ServerId,
        command: &ChallengeCommand,
    ) -> Result<(), StoreError> {
        let json =
            serde_json::to_string(command).map_err(|e| StoreError::Transport(e.to_string()))?;
        self.kv
            .publish(&format!("{CHALLENGE_CHANNEL_PREFIX}{owner}"), &json)
            .await
    }

    pub async fn forward_admin_command(
        &self,
        owner: &ServerId,
        command: &AdminCommand,
    ) -> Result<(), StoreError> {
        let json =
            serde_json::to_string(command).map_err(|e| StoreError::Transport(e.to_string()))?;
        self.kv
            .publish(&format!("{ADMIN_CHANNEL_PREFIX}{owner}"), &json)
            .await
    }

    /// Subscribes to the player fan-out plus this node's command channels.
    /// Malformed payloads are dropped with a debug log.
    pub fn subscribe(&self) -> mpsc::Receiver<BusEvent> {
        let challenge_channel = format!("{CHALLENGE_CHANNEL_PREFIX}{}", self.server_id);
        let admin_channel = format!("{ADMIN_CHANNEL_PREFIX}{}", self.server_id);
        let mut raw = self.kv.subscribe(vec![
            PLAYER_CHANNEL.to_owned(),
            challenge_channel.clone(),
            admin_channel.clone(),
        ]);

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            while let Some((channel, payload)) = raw.recv().await {
                let event = if channel == PLAYER_CHANNEL {
                    serde_json::from_str::<PlayerEnvelope>(&payload)
                        .ok()
                        .map(|e| BusEvent::PlayerDirect {
                            player_id: e.player_id,
                            payload: e.payload,
                        })
                } else if channel == challenge_channel {
                    serde_json::from_str(&payload).ok().map(BusEvent::Challenge)
                } else if channel == admin_channel {
                    serde_json::from_str(&payload).ok().map(BusEvent::Admin)
                } else {
                    None
                };
                match event {
                    Some(event) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    None => log::debug!("Dropping malformed bus payload on {channel}"),
                }
            }
        });
        rx
    }
}
