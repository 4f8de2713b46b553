//! Append-only escrow event ring, global and per player. Relational
//! persistence lives outside the game server; this ring backs the HTTP
//! read surface and failure forensics.

use std::sync::Arc;

use arena_shared::{ChallengeId, PlayerId};
use serde::{Deserialize, Serialize};

use crate::kv::{Kv, StoreError};

const GLOBAL_KEY: &str = "escrow:events";
const PLAYER_PREFIX: &str = "escrow:events:";
const GLOBAL_CAP: usize = 500;
const PLAYER_CAP: usize = 100;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowEventRecord {
    pub challenge_id: ChallengeId,
    /// lock | resolve | refund
    pub phase: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payout: Option<f64>,
    pub players: Vec<PlayerId>,
    pub at: u64,
}

pub struct EscrowLog {
    kv: Arc<dyn Kv>,
}

impl EscrowLog {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    pub async fn append(&self, record: &EscrowEventRecord) -> Result<(), StoreError> {
        let json =
            serde_json::to_string(record).map_err(|e| StoreError::Transport(e.to_string()))?;
        self.kv.lpush_trim(GLOBAL_KEY, &json, GLOBAL_CAP).await?;
        for player in &record.players {
            if player.is_house() {
                continue;
            }
            self.kv
                .lpush_trim(&format!("{PLAYER_PREFIX}{player}"), &json, PLAYER_CAP)
                .await?;
        }
        Ok(())
    }

    pub async fn recent(&self, limit: usize) -> Result<Vec<EscrowEventRecord>, StoreError> {
        self.read(GLOBAL_KEY, limit.min(GLOBAL_CAP)).await
    }

    pub async fn recent_for_player(
        &self,
        player: &PlayerId,
        limit: usize,
    ) -> Result<Vec<EscrowEventRecord>, StoreError> {
        self.read(&format!("{PLAYER_PREFIX}{player}"), limit.min(PLAYER_CAP))
            .await
    }

    async fn read(&self, key: &str, limit: usize) -> Result<Vec<EscrowEventRecord>, StoreError> {
        let raw = self.kv.lrange(key, limit).await?;
        Ok(raw
            .iter()
            .filter_map(|json| serde_json::from_str(json).ok())
            .collect())
    }
}
