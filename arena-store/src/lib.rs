//! Distributed state shared across server nodes: presence with TTL,
//! challenge ownership and locks, the pub/sub bus, and the escrow event
//! ring.
//!
//! Everything is written against the [`kv::Kv`] seam. The Redis backend is
//! the production path; the in-process backend mirrors its semantics so a
//! single node (or a test spinning up several nodes in one process) runs
//! without any external store. Callers pick a backend once at construction
//! and never branch on it again.

pub mod bus;
pub mod challenges;
pub mod escrow_log;
pub mod kv;
pub mod presence;

pub use bus::{AdminCommand, Bus, BusEvent, ChallengeCommand};
pub use challenges::{ChallengeMeta, ChallengeStore, HistoryRecord, LockOutcome};
pub use escrow_log::{EscrowEventRecord, EscrowLog};
pub use kv::{connect, memory, Kv, StoreError};
pub use presence::{PresenceEntry, PresenceStore};
