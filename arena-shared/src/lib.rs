//! Types shared by every arena crate: identifiers, game enums, world tuning
//! constants, cancellation, and the provably-fair derivations.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod cancel;
pub mod fair;

/// Virtual opponent used by dealer stations. Never locked, never has a
/// session or a presence entry.
pub const SYSTEM_HOUSE: &str = "system_house";

pub const TICK_RATE_HZ: u32 = 20;
pub const TICK_MILLIS: u64 = 1000 / TICK_RATE_HZ as u64;

pub const WORLD_BOUND: f32 = 120.0;
pub const MAX_SPEED: f32 = 8.0;
pub const ACCEL: f32 = 30.0;
pub const DRAG: f32 = 6.0;
pub const PLAYER_RADIUS: f32 = 0.6;
/// Presentation height; the simulation itself is a flat plane.
pub const PLAYER_Y: f32 = 0.9;

pub const DEFAULT_PROXIMITY_THRESHOLD: f32 = 12.0;
pub const DEFAULT_STATION_PROXIMITY: f32 = 4.0;

pub const MAX_WAGER: u32 = 10_000;
pub const DEFAULT_PENDING_TIMEOUT_MS: u64 = 30_000;
pub const ACTIVE_RESOLVE_MS: u64 = 60_000;
pub const DEALER_ROUND_TTL_MS: u64 = 60_000;
pub const DEFAULT_ORPHAN_GRACE_MS: u64 = 15_000;
pub const DEFAULT_AGENT_HUMAN_COOLDOWN_MS: u64 = 20_000;
pub const DEFAULT_PRESENCE_TTL_SECONDS: u64 = 10;

/// Wall clock in milliseconds since the epoch. All deadlines in the
/// challenge layer are expressed in these units so tests can drive time
/// explicitly.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut Formatter) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

string_id! {
    /// Stable player identity: `u_<clientId>` for humans, the agent id for
    /// agents, or [`SYSTEM_HOUSE`].
    PlayerId
}

string_id! {
    /// Identity of one server instance, used for ownership and heartbeats.
    ServerId
}

string_id! {
    /// Globally unique challenge id, `c_<serverPrefix>_<monotonicBase36>`.
    ChallengeId
}

impl PlayerId {
    pub fn house() -> Self {
        Self::new(SYSTEM_HOUSE)
    }

    pub fn is_house(&self) -> bool {
        self.0 == SYSTEM_HOUSE
    }
}

/// Mints challenge ids with a per-server prefix and a monotonic base36
/// suffix, so ids never collide across nodes.
pub struct ChallengeIdAllocator {
    prefix: String,
    next: u64,
}

impl ChallengeIdAllocator {
    pub fn new(server_prefix: impl Into<String>) -> Self {
        Self {
            prefix: server_prefix.into(),
            next: 1,
        }
    }

    pub fn mint(&mut self) -> ChallengeId {
        let id = ChallengeId::new(format!("c_{}_{}", self.prefix, to_base36(self.next)));
        self.next += 1;
        id
    }
}

fn to_base36(mut n: u64) -> String {
    const DIGITS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    if n == 0 {
        return "0".to_owned();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(DIGITS[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Human,
    Agent,
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(match self {
            Role::Human => "human",
            Role::Agent => "agent",
        })
    }
}

impl FromStr for Role {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "human" => Ok(Role::Human),
            "agent" => Ok(Role::Agent),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameKind {
    Rps,
    Coinflip,
    DiceDuel,
}

impl GameKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GameKind::Rps => "rps",
            GameKind::Coinflip => "coinflip",
            GameKind::DiceDuel => "dice_duel",
        }
    }
}

impl Display for GameKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GameKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "rps" => Ok(GameKind::Rps),
            "coinflip" => Ok(GameKind::Coinflip),
            "dice_duel" => Ok(GameKind::DiceDuel),
            _ => Err(()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoinSide {
    Heads,
    Tails,
}

impl CoinSide {
    pub fn as_str(self) -> &'static str {
        match self {
            CoinSide::Heads => "heads",
            CoinSide::Tails => "tails",
        }
    }
}

/// One declared move in any of the three micro-games. The wire form is a
/// plain string: `rock`/`paper`/`scissors`, `heads`/`tails`, or `1`..`6`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GameMove {
    Rock,
    Paper,
    Scissors,
    Heads,
    Tails,
    Face(u8),
}

impl GameMove {
    pub fn legal_for(self, kind: GameKind) -> bool {
        matches!(
            (kind, self),
            (GameKind::Rps, GameMove::Rock)
                | (GameKind::Rps, GameMove::Paper)
                | (GameKind::Rps, GameMove::Scissors)
                | (GameKind::Coinflip, GameMove::Heads)
                | (GameKind::Coinflip, GameMove::Tails)
                | (GameKind::DiceDuel, GameMove::Face(1..=6))
        )
    }

    pub fn as_wire(self) -> String {
        match self {
            GameMove::Rock => "rock".to_owned(),
            GameMove::Paper => "paper".to_owned(),
            GameMove::Scissors => "scissors".to_owned(),
            GameMove::Heads => "heads".to_owned(),
            GameMove::Tails => "tails".to_owned(),
            GameMove::Face(n) => n.to_string(),
        }
    }

    pub fn coin_side(self) -> Option<CoinSide> {
        match self {
            GameMove::Heads => Some(CoinSide::Heads),
            GameMove::Tails => Some(CoinSide::Tails),
            _ => None,
        }
    }
}

impl FromStr for GameMove {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "rock" => Ok(GameMove::Rock),
            "paper" => Ok(GameMove::Paper),
            "scissors" => Ok(GameMove::Scissors),
            "heads" => Ok(GameMove::Heads),
            "tails" => Ok(GameMove::Tails),
            _ => match s.parse::<u8>() {
                Ok(n @ 1..=6) => Ok(GameMove::Face(n)),
                _ => Err(()),
            },
        }
    }
}

impl Display for GameMove {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(&self.as_wire())
    }
}

impl Serialize for GameMove {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_wire())
    }
}

impl<'de> Deserialize<'de> for GameMove {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse()
            .map_err(|()| serde::de::Error::custom(format!("unknown move {s:?}")))
    }
}
