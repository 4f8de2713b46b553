//! Cross-node player presence with TTL, plus the live-server heartbeat.

use std::sync::Arc;

use arena_shared::{PlayerId, Role, ServerId};
use serde::{Deserialize, Serialize};

use crate::kv::{Kv, StoreError};

const PRESENCE_PREFIX: &str = "presence:";
const SERVER_PREFIX: &str = "server:";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    pub player_id: PlayerId,
    pub role: Role,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_id: Option<String>,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub yaw: f32,
    pub speed: f32,
    pub updated_at: u64,
    pub owner_server_id: ServerId,
}

/// Best-effort by design: every failure is reported as a `StoreError` the
/// caller logs and moves past; the next refresh heals the entry.
pub struct PresenceStore {
    kv: Arc<dyn Kv>,
    ttl_ms: u64,
}

impl PresenceStore {
    pub fn new(kv: Arc<dyn Kv>, ttl_seconds: u64) -> Self {
        Self {
            kv,
            ttl_ms: ttl_seconds * 1000,
        }
    }

    pub async fn upsert(&self, entry: &PresenceEntry) -> Result<(), StoreError> {
        let key = format!("{PRESENCE_PREFIX}{}", entry.player_id);
        let json = serde_json::to_string(entry)
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        self.kv.set_px(&key, &json, Some(self.ttl_ms)).await
    }

    pub async fn remove(&self, player_id: &PlayerId) -> Result<(), StoreError> {
        self.kv.del(&format!("{PRESENCE_PREFIX}{player_id}")).await
    }

    pub async fn get(&self, player_id: &PlayerId) -> Result<Option<PresenceEntry>, StoreError> {
        let raw = self.kv.get(&format!("{PRESENCE_PREFIX}{player_id}")).await?;
        Ok(raw.and_then(|json| serde_json::from_str(&json).ok()))
    }

    pub async fn list(&self) -> Result<Vec<PresenceEntry>, StoreError> {
        let keys = self.kv.keys(&format!("{PRESENCE_PREFIX}*")).await?;
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(json) = self.kv.get(&key).await? {
                // Entries written by a newer node revision may not parse;
                // skip them instead of failing the whole read.
                if let Ok(entry) = serde_json::from_str::<PresenceEntry>(&json) {
                    entries.push(entry);
                }
            }
        }
        Ok(entries)
    }

    pub async fn heartbeat_server(&self, server_id: &ServerId) -> Result<(), StoreError> {
        self.kv
            .set_px(
                &format!("{SERVER_PREFIX}{server_id}"),
                server_id.as_str(),
                Some(self.ttl_ms),
            )
            .await
    }

    pub async fn live_servers(&self) -> Result<Vec<ServerId>, StoreError> {
        let keys = self.kv.keys(&format!("{SERVER_PREFIX}*")).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(SERVER_PREFIX).map(ServerId::from))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::memory;

    fn entry(id: &str, server: &str) -> PresenceEntry {
        PresenceEntry {
            player_id: PlayerId::new(id),
            role: Role::Human,
            display_name: id.to_owned(),
            wallet_id: None,
            x: 1.0,
            y: 0.9,
            z: 2.0,
            yaw: 0.0,
            speed: 0.0,
            updated_at: 123,
            owner_server_id: ServerId::new(server),
        }
    }

    #[tokio::test]
    async fn upsert_get_remove_round_trip() {
        let store = PresenceStore::new(memory(), 10);
        let e = entry("u_alice", "n1");
        store.upsert(&e).await.unwrap();
        assert_eq!(store.get(&e.player_id).await.unwrap(), Some(e.clone()));
        store.remove(&e.player_id).await.unwrap();
        assert_eq!(store.get(&e.player_id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_sees_entries_from_other_nodes() {
        let kv = memory();
        let a = PresenceStore::new(kv.clone(), 10);
        let b = PresenceStore::new(kv, 10);
        a.upsert(&entry("u_alice", "n1")).await.unwrap();
        b.upsert(&entry("agent_7", "n2")).await.unwrap();
        let mut ids: Vec<String> = a
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.player_id.to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["agent_7", "u_alice"]);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_without_refresh() {
        let store = PresenceStore::new(memory(), 1);
        store.upsert(&entry("u_alice", "n1")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1_100)).await;
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn server_heartbeats_are_listed() {
        let kv = memory();
        let store = PresenceStore::new(kv, 10);
        store.heartbeat_server(&ServerId::new("n1")).await.unwrap();
        store.heartbeat_server(&ServerId::new("n2")).await.unwrap();
        let mut servers: Vec<String> = store
            .live_servers()
            .await
            .unwrap()
            .iter()
            .map(|s| s.to_string())
            .collect();
        servers.sort();
        assert_eq!(servers, vec!["n1", "n2"]);
    }
}
