use arena_shared::{ChallengeId, PlayerId, Role};
use arena_sim::Station;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages a client may send. Game-type and move fields stay as strings
/// here; the challenge layer owns their validation so the actor gets a
/// semantic error back instead of a silently dropped frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Input { move_x: f32, move_z: f32 },
    #[serde(rename_all = "camelCase")]
    StationInteract {
        station_id: String,
        action: String,
        #[serde(default)]
        wager: Option<u32>,
        #[serde(default)]
        side: Option<String>,
        #[serde(default, rename = "move")]
        mv: Option<String>,
        #[serde(default)]
        face: Option<u8>,
        #[serde(default)]
        player_seed: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ChallengeSend {
        target_id: PlayerId,
        game_type: String,
        #[serde(default)]
        wager: u32,
    },
    #[serde(rename_all = "camelCase")]
    ChallengeResponse {
        challenge_id: ChallengeId,
        accept: bool,
    },
    #[serde(rename_all = "camelCase")]
    ChallengeCounter {
        challenge_id: ChallengeId,
        wager: u32,
    },
    #[serde(rename_all = "camelCase")]
    ChallengeMove {
        challenge_id: ChallengeId,
        #[serde(rename = "move")]
        mv: String,
    },
}

/// Defensive parse: anything malformed is dropped with a debug log and
/// never terminates the session.
pub fn parse_client_frame(text: &str) -> Option<ClientFrame> {
    match serde_json::from_str(text) {
        Ok(frame) => Some(frame),
        Err(e) => {
            log::debug!("Dropping invalid client frame: {e}");
            None
        }
    }
}

/// One player entry in the per-tick snapshot, merged from the local sim and
/// remote presence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotPlayer {
    pub id: PlayerId,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub yaw: f32,
    pub speed: f32,
    pub role: Role,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wallet_id: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    Welcome {
        player_id: PlayerId,
        role: Role,
        display_name: String,
        server_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Snapshot {
        tick: u64,
        players: Vec<SnapshotPlayer>,
        stations: Vec<Station>,
    },
    #[serde(rename_all = "camelCase")]
    Proximity {
        event: &'static str,
        other_id: PlayerId,
        other_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        distance: Option<f32>,
    },
    #[serde(rename_all = "camelCase")]
    Challenge {
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        challenge: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    ChallengeFeed {
        event: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        challenge: Option<Value>,
    },
    #[serde(rename_all = "camelCase")]
    ChallengeEscrow {
        phase: &'static str,
        challenge_id: ChallengeId,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        tx_hash: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        fee: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        payout: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    StationUi { station_id: String, view: Value },
    #[serde(rename_all = "camelCase")]
    ProvablyFair {
        phase: &'static str,
        challenge_id: ChallengeId,
        commit_hash: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        player_seed: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        house_seed: Option<String>,
        method: String,
    },
}

impl ServerFrame {
    pub fn to_json(&self) -> String {
        // Every variant serializes; the fallback covers a poisoned Value.
        serde_json::to_string(self).unwrap_or_else(|_| "{\"type\":\"error\"}".to_owned())
    }
}
