//! Authoritative world state: kinematic integration, collision, bounds,
//! spawn placement, proximity tracking, and the static station catalogue.
//!
//! Nothing in this crate performs I/O or reads the clock; the game loop owns
//! an instance exclusively and steps it at a fixed rate.

pub mod proximity;
pub mod stations;
pub mod world;

pub use proximity::{ProximityDelta, ProximityKind, ProximityTracker};
pub use stations::{default_obstacles, default_stations, Station, StationKind};
pub use world::{section_position, Aabb, PlayerState, SimSnapshot, WorldSim};
