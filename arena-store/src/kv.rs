//! The storage seam: a small command set over a KV with TTL, pattern scans,
//! capped lists, and pub/sub. Two implementations, chosen at construction.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
// The tokio clock honors paused test time, unlike std's.
use tokio::time::Instant;

const SUBSCRIBE_BUFFER: usize = 256;
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store transport: {0}")]
    Transport(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Transport(e.to_string())
    }
}

#[async_trait]
pub trait Kv: Send + Sync {
    async fn set_px(&self, key: &str, value: &str, ttl_ms: Option<u64>) -> Result<(), StoreError>;
    /// SET if absent, with TTL. Returns whether the key was taken.
    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool, StoreError>;
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;
    /// Deletes only when the stored value matches; the cross-node-safe
    /// unlock primitive.
    async fn del_if_value(&self, key: &str, value: &str) -> Result<bool, StoreError>;
    /// Pattern scan; only trailing-`*` prefixes are used here.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError>;
    /// Prepend and cap, newest first.
    async fn lpush_trim(&self, key: &str, value: &str, cap: usize) -> Result<(), StoreError>;
    async fn lrange(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError>;
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError>;
    /// Exact-name channel subscriptions, delivered as (channel, payload).
    /// The receiver stays live across transport reconnects.
    fn subscribe(&self, channels: Vec<String>) -> mpsc::Receiver<(String, String)>;
}

/// Redis when a URL is configured, otherwise a fresh in-process store.
pub async fn connect(redis_url: Option<&str>) -> Result<Arc<dyn Kv>, StoreError> {
    match redis_url {
        Some(url) => Ok(Arc::new(RedisKv::connect(url).await?)),
        None => Ok(memory()),
    }
}

/// A standalone in-process store. Clone the `Arc` into several node
/// instances to emulate a shared cluster store in tests.
pub fn memory() -> Arc<dyn Kv> {
    Arc::new(MemoryKv::default())
}

pub struct RedisKv {
    client: redis::Client,
    conn: redis::aio::ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl Kv for RedisKv {
    async fn set_px(&self, key: &str, value: &str, ttl_ms: Option<u64>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl_ms {
            cmd.arg("PX").arg(ttl);
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(set.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("GET").arg(key).query_async(&mut conn).await?)
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn del_if_value(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        const UNLOCK: &str = r#"
            if redis.call('get', KEYS[1]) == ARGV[1] then
                return redis.call('del', KEYS[1])
            else
                return 0
            end"#;
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::cmd("EVAL")
            .arg(UNLOCK)
            .arg(1)
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("KEYS")
            .arg(pattern)
            .query_async(&mut conn)
            .await?)
    }

    async fn lpush_trim(&self, key: &str, value: &str, cap: usize) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let push = redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async::<_, i64>(&mut conn)
            .await;
        if push.is_err() {
            // A key of the wrong type (left over from an older layout)
            // gets cleared and the push retried once.
            redis::cmd("DEL")
                .arg(key)
                .query_async::<_, ()>(&mut conn)
                .await?;
            redis::cmd("LPUSH")
                .arg(key)
                .arg(value)
                .query_async::<_, i64>(&mut conn)
                .await?;
        }
        redis::cmd("LTRIM")
            .arg(key)
            .arg(0)
            .arg(cap as i64 - 1)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn lrange(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(limit as i64 - 1)
            .query_async(&mut conn)
            .await?)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    fn subscribe(&self, channels: Vec<String>) -> mpsc::Receiver<(String, String)> {
        let (tx, rx) = mpsc::channel(SUBSCRIBE_BUFFER);
        let client = self.client.clone();
        tokio::spawn(async move {
            loop {
                match client.get_async_connection().await {
                    Ok(conn) => {
                        let mut pubsub = conn.into_pubsub();
                        let mut subscribed = true;
                        for channel in &channels {
                            if let Err(e) = pubsub.subscribe(channel).await {
                                log::warn!("pubsub subscribe {channel} failed: {e}");
                                subscribed = false;
                                break;
                            }
                        }
                        if subscribed {
                            let mut stream = pubsub.on_message();
                            while let Some(msg) = stream.next().await {
                                let channel = msg.get_channel_name().to_owned();
                                let payload: String = match msg.get_payload() {
                                    Ok(p) => p,
                                    Err(_) => continue,
                                };
                                if tx.send((channel, payload)).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => log::warn!("pubsub connect failed: {e}"),
                }
                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            }
        });
        rx
    }
}

/// In-process backend. Strings expire lazily; pub/sub is a process-local
/// fan-out, so several node instances sharing one `MemoryKv` behave like a
/// cluster on a shared store.
#[derive(Default)]
pub struct MemoryKv {
    strings: Mutex<HashMap<String, (String, Option<Instant>)>>,
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    subscribers: Mutex<Vec<(Vec<String>, mpsc::Sender<(String, String)>)>>,
}

impl MemoryKv {
    fn live_value(&self, key: &str) -> Option<String> {
        let mut strings = self.strings.lock().unwrap();
        match strings.get(key) {
            Some((_, Some(deadline))) if *deadline <= Instant::now() => {
                strings.remove(key);
                None
            }
            Some((value, _)) => Some(value.clone()),
            None => None,
        }
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn set_px(&self, key: &str, value: &str, ttl_ms: Option<u64>) -> Result<(), StoreError> {
        let deadline = ttl_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        self.strings
            .lock()
            .unwrap()
            .insert(key.to_owned(), (value.to_owned(), deadline));
        Ok(())
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool, StoreError> {
        if self.live_value(key).is_some() {
            return Ok(false);
        }
        self.set_px(key, value, Some(ttl_ms)).await?;
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.live_value(key))
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.strings.lock().unwrap().remove(key);
        Ok(())
    }

    async fn del_if_value(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        if self.live_value(key).as_deref() == Some(value) {
            self.strings.lock().unwrap().remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
        let now = Instant::now();
        let mut strings = self.strings.lock().unwrap();
        strings.retain(|_, (_, deadline)| deadline.map_or(true, |d| d > now));
        Ok(strings
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn lpush_trim(&self, key: &str, value: &str, cap: usize) -> Result<(), StoreError> {
        let mut lists = self.lists.lock().unwrap();
        let list = lists.entry(key.to_owned()).or_default();
        list.push_front(value.to_owned());
        list.truncate(cap);
        Ok(())
    }

    async fn lrange(&self, key: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lists
            .lock()
            .unwrap()
            .get(key)
            .map(|list| list.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<(), StoreError> {
        let targets: Vec<mpsc::Sender<(String, String)>> = {
            let mut subscribers = self.subscribers.lock().unwrap();
            subscribers.retain(|(_, tx)| !tx.is_closed());
            subscribers
                .iter()
                .filter(|(channels, _)| channels.iter().any(|c| c == channel))
                .map(|(_, tx)| tx.clone())
                .collect()
        };
        for tx in targets {
            let _ = tx.send((channel.to_owned(), payload.to_owned())).await;
        }
        Ok(())
    }

    fn subscribe(&self, channels: Vec<String>) -> mpsc::Receiver<(String, String)> {
        let (tx, rx) = mpsc::channel(SUBSCRIBE_BUFFER);
        self.subscribers.lock().unwrap().push((channels, tx));
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn memory_ttl_expires() {
        let kv = MemoryKv::default();
        kv.set_px("k", "v", Some(50)).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_nx_respects_existing() {
        let kv = MemoryKv::default();
        assert!(kv.set_nx_px("lock", "a", 10_000).await.unwrap());
        assert!(!kv.set_nx_px("lock", "b", 10_000).await.unwrap());
        assert_eq!(kv.get("lock").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn memory_del_if_value_is_owner_safe() {
        let kv = MemoryKv::default();
        kv.set_px("lock", "mine", None).await.unwrap();
        assert!(!kv.del_if_value("lock", "theirs").await.unwrap());
        assert!(kv.del_if_value("lock", "mine").await.unwrap());
        assert!(!kv.del_if_value("lock", "mine").await.unwrap());
    }

    #[tokio::test]
    async fn memory_keys_prefix_scan() {
        let kv = MemoryKv::default();
        kv.set_px("presence:a", "1", None).await.unwrap();
        kv.set_px("presence:b", "2", None).await.unwrap();
        kv.set_px("server:x", "3", None).await.unwrap();
        let mut keys = kv.keys("presence:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["presence:a", "presence:b"]);
    }

    #[tokio::test]
    async fn memory_list_caps_and_orders_newest_first() {
        let kv = MemoryKv::default();
        for n in 0..10 {
            kv.lpush_trim("ring", &n.to_string(), 5).await.unwrap();
        }
        let items = kv.lrange("ring", 10).await.unwrap();
        assert_eq!(items, vec!["9", "8", "7", "6", "5"]);
    }

    #[tokio::test]
    async fn memory_pubsub_routes_by_channel() {
        let kv = MemoryKv::default();
        let mut a = kv.subscribe(vec!["ch:a".to_owned()]);
        let mut both = kv.subscribe(vec!["ch:a".to_owned(), "ch:b".to_owned()]);

        kv.publish("ch:a", "one").await.unwrap();
        kv.publish("ch:b", "two").await.unwrap();

        assert_eq!(a.recv().await.unwrap().1, "one");
        assert_eq!(both.recv().await.unwrap().1, "one");
        assert_eq!(both.recv().await.unwrap().1, "two");
        assert!(a.try_recv().is_err());
    }
}
