//! Live session registry: one entry per stable player id, with a lock-free
//! input slot written by the session task and read by the tick task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arena_shared::{PlayerId, Role};
use tokio::sync::mpsc;

pub const CLOSE_REPLACED: u16 = 4000;
pub const CLOSE_REPLACED_REASON: &str = "replaced_by_reconnect";

/// Last-write-wins movement input, packed into one atomic so the tick task
/// never takes a lock on the hot path.
#[derive(Debug, Default)]
pub struct InputSlot {
    packed: AtomicU64,
}

impl InputSlot {
    pub fn store(&self, move_x: f32, move_z: f32) {
        let packed = ((move_x.to_bits() as u64) << 32) | move_z.to_bits() as u64;
        self.packed.store(packed, Ordering::Relaxed);
    }

    pub fn load(&self) -> (f32, f32) {
        let packed = self.packed.load(Ordering::Relaxed);
        (
            f32::from_bits((packed >> 32) as u32),
            f32::from_bits(packed as u32),
        )
    }
}

#[derive(Clone, Debug)]
pub struct SessionMeta {
    pub role: Role,
    pub display_name: String,
    pub wallet_id: Option<String>,
}

/// What a session task pulls off its outbound queue.
#[derive(Clone, Debug, PartialEq)]
pub enum Outbound {
    Frame(String),
    Close { code: u16, reason: &'static str },
}

struct Session {
    meta: SessionMeta,
    outbound: mpsc::UnboundedSender<Outbound>,
    input: Arc<InputSlot>,
    epoch: u64,
}

/// Handed to the owning session task.
pub struct SessionLease {
    pub player_id: PlayerId,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    pub input: Arc<InputSlot>,
    pub epoch: u64,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<PlayerId, Session>>,
    epochs: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a session under a stable id. An existing session for the
    /// same id is closed with 4000/replaced_by_reconnect first, so at most
    /// one live session exists per id.
    pub fn register(&self, player_id: PlayerId, meta: SessionMeta) -> SessionLease {
        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let input = Arc::new(InputSlot::default());
        let session = Session {
            meta,
            outbound: tx,
            input: input.clone(),
            epoch,
        };
        let replaced = self
            .sessions
            .lock()
            .unwrap()
            .insert(player_id.clone(), session);
        if let Some(old) = replaced {
            log::info!("{player_id} reconnected; closing the previous session");
            let _ = old.outbound.send(Outbound::Close {
                code: CLOSE_REPLACED,
                reason: CLOSE_REPLACED_REASON,
            });
        }
        SessionLease {
            player_id,
            outbound: rx,
            input,
            epoch,
        }
    }

    /// Removes the session only if it is still the lease's incarnation, so
    /// a replaced session's teardown never evicts its successor.
    pub fn remove(&self, player_id: &PlayerId, epoch: u64) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.get(player_id).is_some_and(|s| s.epoch == epoch) {
            sessions.remove(player_id);
            true
        } else {
            false
        }
    }

    pub fn send_to(&self, player_id: &PlayerId, frame: String) -> bool {
        let sessions = self.sessions.lock().unwrap();
        match sessions.get(player_id) {
            Some(session) => session.outbound.send(Outbound::Frame(frame)).is_ok(),
            None => false,
        }
    }

    pub fn broadcast(&self, frame: &str) {
        let sessions = self.sessions.lock().unwrap();
        for session in sessions.values() {
            let _ = session.outbound.send(Outbound::Frame(frame.to_owned()));
        }
    }

    pub fn contains(&self, player_id: &PlayerId) -> bool {
        self.sessions.lock().unwrap().contains_key(player_id)
    }

    pub fn meta_of(&self, player_id: &PlayerId) -> Option<SessionMeta> {
        self.sessions
            .lock()
            .unwrap()
            .get(player_id)
            .map(|s| s.meta.clone())
    }

    pub fn wallet_of(&self, player_id: &PlayerId) -> Option<String> {
        self.sessions
            .lock()
            .unwrap()
            .get(player_id)
            .and_then(|s| s.meta.wallet_id.clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> SessionMeta {
        SessionMeta {
            role: Role::Human,
            display_name: "Alice".to_owned(),
            wallet_id: Some("0xa".to_owned()),
        }
    }

    #[test]
    fn input_slot_round_trips() {
        let slot = InputSlot::default();
        slot.store(0.5, -1.0);
        assert_eq!(slot.load(), (0.5, -1.0));
        slot.store(-0.25, 0.75);
        assert_eq!(slot.load(), (-0.25, 0.75));
    }

    #[tokio::test]
    async fn reconnect_closes_the_prior_session() {
        let registry = SessionRegistry::new();
        let id = PlayerId::new("u_alice");
        let mut first = registry.register(id.clone(), meta());
        let _second = registry.register(id.clone(), meta());

        assert_eq!(
            first.outbound.recv().await,
            Some(Outbound::Close {
                code: CLOSE_REPLACED,
                reason: CLOSE_REPLACED_REASON,
            })
        );
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn stale_epoch_cannot_remove_the_successor() {
        let registry = SessionRegistry::new();
        let id = PlayerId::new("u_alice");
        let first = registry.register(id.clone(), meta());
        let second = registry.register(id.clone(), meta());

        assert!(!registry.remove(&id, first.epoch));
        assert!(registry.contains(&id));
        assert!(registry.remove(&id, second.epoch));
        assert!(!registry.contains(&id));
    }

    #[tokio::test]
    async fn send_and_broadcast() {
        let registry = SessionRegistry::new();
        let mut a = registry.register(PlayerId::new("u_a"), meta());
        let mut b = registry.register(PlayerId::new("u_b"), meta());

        assert!(registry.send_to(&PlayerId::new("u_a"), "one".to_owned()));
        assert!(!registry.send_to(&PlayerId::new("u_ghost"), "x".to_owned()));
        registry.broadcast("all");

        assert_eq!(a.outbound.recv().await, Some(Outbound::Frame("one".into())));
        assert_eq!(a.outbound.recv().await, Some(Outbound::Frame("all".into())));
        assert_eq!(b.outbound.recv().await, Some(Outbound::Frame("all".into())));
    }
}
