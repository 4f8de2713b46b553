//! Wire surface of the game server: JSON frames exchanged with clients over
//! the session transport, and the signed session token.

pub mod auth;
pub mod frames;

pub use frames::{parse_client_frame, ClientFrame, ServerFrame, SnapshotPlayer};
