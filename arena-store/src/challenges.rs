//! Distributed challenge metadata, per-player locks, and the history ring.

use std::sync::Arc;

use arena_shared::{ChallengeId, PlayerId, ServerId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::kv::{Kv, StoreError};

const META_PREFIX: &str = "challenge:meta:";
const LOCK_PREFIX: &str = "challenge:lock:";
const HISTORY_KEY: &str = "challenge:history";
const HISTORY_CAP: usize = 300;
// Metas linger long enough for the sweeper to find orphans, then age out.
const META_TTL_MS: u64 = 6 * 60 * 60 * 1000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeMeta {
    pub id: ChallengeId,
    pub owner_server_id: ServerId,
    pub challenger_id: PlayerId,
    pub opponent_id: PlayerId,
    pub status: String,
    pub updated_at: u64,
    #[serde(default)]
    pub json: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub at: u64,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub challenge: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    PlayerBusy,
}

pub struct ChallengeStore {
    kv: Arc<dyn Kv>,
    server_id: ServerId,
}

impl ChallengeStore {
    pub fn new(kv: Arc<dyn Kv>, server_id: ServerId) -> Self {
        Self { kv, server_id }
    }

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    /// Writes meta owned by this node.
    pub async fn register(
        &self,
        id: &ChallengeId,
        challenger: &PlayerId,
        opponent: &PlayerId,
        status: &str,
        json: Value,
        now: u64,
    ) -> Result<(), StoreError> {
        let meta = ChallengeMeta {
            id: id.clone(),
            owner_server_id: self.server_id.clone(),
            challenger_id: challenger.clone(),
            opponent_id: opponent.clone(),
            status: status.to_owned(),
            updated_at: now,
            json,
        };
        self.write_meta(&meta).await
    }

    /// Bumps status and timestamp without touching ownership.
    pub async fn update_status(
        &self,
        id: &ChallengeId,
        status: &str,
        json: Option<Value>,
        now: u64,
    ) -> Result<(), StoreError> {
        let Some(mut meta) = self.get_meta(id).await? else {
            return Ok(());
        };
        meta.status = status.to_owned();
        meta.updated_at = now;
        if let Some(json) = json {
            meta.json = json;
        }
        self.write_meta(&meta).await
    }

    pub async fn get_meta(&self, id: &ChallengeId) -> Result<Option<ChallengeMeta>, StoreError> {
        let raw = self.kv.get(&format!("{META_PREFIX}{id}")).await?;
        Ok(raw.and_then(|json| serde_json::from_str(&json).ok()))
    }

    pub async fn owner_server_id(&self, id: &ChallengeId) -> Result<Option<ServerId>, StoreError> {
        Ok(self.get_meta(id).await?.map(|m| m.owner_server_id))
    }

    pub async fn list_metas(&self) -> Result<Vec<ChallengeMeta>, StoreError> {
        let keys = self.kv.keys(&format!("{META_PREFIX}*")).await?;
        let mut metas = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(json) = self.kv.get(&key).await? {
                if let Ok(meta) = serde_json::from_str::<ChallengeMeta>(&json) {
                    metas.push(meta);
                }
            }
        }
        Ok(metas)
    }

    pub async fn clear(&self, id: &ChallengeId) -> Result<(), StoreError> {
        self.kv.del(&format!("{META_PREFIX}{id}")).await
    }

    /// All-or-nothing: every player lock is set-if-absent; on any conflict
    /// the locks already taken are rolled back and the caller sees
    /// `PlayerBusy`. The house id never appears here.
    pub async fn try_lock_players(
        &self,
        id: &ChallengeId,
        players: &[PlayerId],
        ttl_ms: u64,
    ) -> Result<LockOutcome, StoreError> {
        let value = self.lock_value(id);
        let mut acquired: Vec<&PlayerId> = Vec::new();
        for player in players {
            let key = format!("{LOCK_PREFIX}{player}");
            match self.kv.set_nx_px(&key, &value, ttl_ms).await {
                Ok(true) => acquired.push(player),
                Ok(false) => {
                    for taken in acquired {
                        let _ = self
                            .kv
                            .del_if_value(&format!("{LOCK_PREFIX}{taken}"), &value)
                            .await;
                    }
                    return Ok(LockOutcome::PlayerBusy);
                }
                Err(e) => {
                    for taken in acquired {
                        let _ = self
                            .kv
                            .del_if_value(&format!("{LOCK_PREFIX}{taken}"), &value)
                            .await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(LockOutcome::Acquired)
    }

    /// Value-matched deletes, safe to call from any node.
    pub async fn release_players(
        &self,
        id: &ChallengeId,
        players: &[PlayerId],
    ) -> Result<(), StoreError> {
        let value = self.lock_value(id);
        for player in players {
            self.kv
                .del_if_value(&format!("{LOCK_PREFIX}{player}"), &value)
                .await?;
        }
        Ok(())
    }

    /// Releases a lock held for `id` by whichever node owns it. Used by the
    /// orphan sweeper where the owner is gone.
    pub async fn force_release_players(
        &self,
        id: &ChallengeId,
        players: &[PlayerId],
    ) -> Result<(), StoreError> {
        for player in players {
            let key = format!("{LOCK_PREFIX}{player}");
            if let Some(value) = self.kv.get(&key).await? {
                if value.starts_with(&format!("{id}:")) {
                    self.kv.del_if_value(&key, &value).await?;
                }
            }
        }
        Ok(())
    }

    pub async fn append_history(&self, record: &HistoryRecord) -> Result<(), StoreError> {
        let json =
            serde_json::to_string(record).map_err(|e| StoreError::Transport(e.to_string()))?;
        self.kv.lpush_trim(HISTORY_KEY, &json, HISTORY_CAP).await
    }

    pub async fn recent_history(&self, limit: usize) -> Result<Vec<HistoryRecord>, StoreError> {
        let raw = self.kv.lrange(HISTORY_KEY, limit.min(HISTORY_CAP)).await?;
        Ok(raw
            .iter()
            .filter_map(|json| serde_json::from_str(json).ok())
            .collect())
    }

    fn lock_value(&self, id: &ChallengeId) -> String {
        format!("{id}:{}", self.server_id)
    }

    fn meta_key(id: &ChallengeId) -> String {
        format!("{META_PREFIX}{id}")
    }

    async fn write_meta(&self, meta: &ChallengeMeta) -> Result<(), StoreError> {
        let json = serde_json::to_string(meta).map_err(|e| StoreError::Transport(e.to_string()))?;
        self.kv
            .set_px(&Self::meta_key(&meta.id), &json, Some(META_TTL_MS))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory;
    use serde_json::json;

    fn store(kv: Arc<dyn Kv>, server: &str) -> ChallengeStore {
        ChallengeStore::new(kv, ServerId::new(server))
    }

    fn cid(s: &str) -> ChallengeId {
        ChallengeId::new(s)
    }

    fn pid(s: &str) -> PlayerId {
        PlayerId::new(s)
    }

    #[tokio::test]
    async fn register_and_owner_lookup() {
        let kv = memory();
        let n1 = store(kv.clone(), "n1");
        let n2 = store(kv, "n2");

        n1.register(&cid("c_n1_1"), &pid("a"), &pid("b"), "pending", json!({}), 1)
            .await
            .unwrap();
        assert_eq!(
            n2.owner_server_id(&cid("c_n1_1")).await.unwrap(),
            Some(ServerId::new("n1"))
        );

        // Status updates from the owner keep ownership intact.
        n1.update_status(&cid("c_n1_1"), "active", None, 2)
            .await
            .unwrap();
        let meta = n2.get_meta(&cid("c_n1_1")).await.unwrap().unwrap();
        assert_eq!(meta.status, "active");
        assert_eq!(meta.owner_server_id, ServerId::new("n1"));
        assert_eq!(meta.updated_at, 2);
    }

    #[tokio::test]
    async fn lock_conflict_rolls_back_partial_acquisition() {
        let kv = memory();
        let n1 = store(kv.clone(), "n1");
        let n2 = store(kv, "n2");

        assert_eq!(
            n1.try_lock_players(&cid("c_n1_1"), &[pid("a"), pid("b")], 60_000)
                .await
                .unwrap(),
            LockOutcome::Acquired
        );
        // b is taken, so locking (c, b) must not leave c locked behind.
        assert_eq!(
            n2.try_lock_players(&cid("c_n2_1"), &[pid("c"), pid("b")], 60_000)
                .await
                .unwrap(),
            LockOutcome::PlayerBusy
        );
        assert_eq!(
            n2.try_lock_players(&cid("c_n2_2"), &[pid("c")], 60_000)
                .await
                .unwrap(),
            LockOutcome::Acquired
        );
    }

    #[tokio::test]
    async fn release_only_removes_matching_locks() {
        let kv = memory();
        let n1 = store(kv.clone(), "n1");

        n1.try_lock_players(&cid("c_n1_1"), &[pid("a")], 60_000)
            .await
            .unwrap();
        // A release for a different challenge is a no-op.
        n1.release_players(&cid("c_n1_2"), &[pid("a")]).await.unwrap();
        assert_eq!(
            n1.try_lock_players(&cid("c_n1_3"), &[pid("a")], 60_000)
                .await
                .unwrap(),
            LockOutcome::PlayerBusy
        );

        n1.release_players(&cid("c_n1_1"), &[pid("a")]).await.unwrap();
        assert_eq!(
            n1.try_lock_players(&cid("c_n1_3"), &[pid("a")], 60_000)
                .await
                .unwrap(),
            LockOutcome::Acquired
        );
    }

    #[tokio::test]
    async fn force_release_works_across_owners() {
        let kv = memory();
        let n1 = store(kv.clone(), "n1");
        let n2 = store(kv, "n2");

        n1.try_lock_players(&cid("c_n1_1"), &[pid("a")], 60_000)
            .await
            .unwrap();
        // The sweeper on n2 can free locks held for n1's orphan.
        n2.force_release_players(&cid("c_n1_1"), &[pid("a")])
            .await
            .unwrap();
        assert_eq!(
            n2.try_lock_players(&cid("c_n2_1"), &[pid("a")], 60_000)
                .await
                .unwrap(),
            LockOutcome::Acquired
        );
    }

    #[tokio::test]
    async fn history_ring_is_shared_and_bounded() {
        let kv = memory();
        let n1 = store(kv.clone(), "n1");
        let n2 = store(kv, "n2");

        for n in 0..350 {
            n1.append_history(&HistoryRecord {
                at: n,
                event: "resolved".to_owned(),
                reason: None,
                challenge: json!({ "n": n }),
            })
            .await
            .unwrap();
        }
        let recent = n2.recent_history(1_000).await.unwrap();
        assert_eq!(recent.len(), 300);
        assert_eq!(recent[0].at, 349);
    }

    #[tokio::test]
    async fn clear_removes_meta() {
        let kv = memory();
        let n1 = store(kv, "n1");
        n1.register(&cid("c_n1_1"), &pid("a"), &pid("b"), "pending", json!({}), 1)
            .await
            .unwrap();
        n1.clear(&cid("c_n1_1")).await.unwrap();
        assert!(n1.get_meta(&cid("c_n1_1")).await.unwrap().is_none());
        assert!(n1.list_metas().await.unwrap().is_empty());
    }
}
