//! Runtime configuration, read once at startup from the environment.

use std::env;

use arena_shared::{
    DEFAULT_AGENT_HUMAN_COOLDOWN_MS, DEFAULT_ORPHAN_GRACE_MS, DEFAULT_PENDING_TIMEOUT_MS,
    DEFAULT_PRESENCE_TTL_SECONDS, DEFAULT_PROXIMITY_THRESHOLD, DEFAULT_STATION_PROXIMITY,
};

const DEFAULT_PORT: u16 = 8090;
const DEFAULT_FEE_BPS: u32 = 250;

#[derive(Clone, Debug, PartialEq)]
pub enum AuthMode {
    /// `wsAuth` signed-token query parameter, HMAC over a shared secret.
    SignedToken { secret: String },
    /// Session cookie validated against the web auth service.
    CookieSession { auth_url: String },
    /// No authentication; development only.
    Open,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub server_instance_id: String,
    pub redis_url: Option<String>,
    pub presence_ttl_seconds: u64,
    pub proximity_threshold: f32,
    pub station_proximity: f32,
    pub pending_timeout_ms: u64,
    pub orphan_grace_ms: u64,
    pub agent_human_cooldown_ms: u64,
    pub auth_mode: AuthMode,
    pub internal_service_token: Option<String>,
    pub agent_runtime_url: Option<String>,
    pub escrow_execution_mode: String,
    pub escrow_fee_bps: u32,
    pub house_wallet_id: Option<String>,
    pub dice_duel_enabled: bool,
    pub agent_locomotion_enabled: bool,
    pub station_router_enabled: bool,
}

impl Config {
    pub fn from_env() -> Self {
        let auth_mode = if let Some(secret) = env_nonempty("GAME_WS_AUTH_SECRET") {
            AuthMode::SignedToken { secret }
        } else if let Some(auth_url) = env_nonempty("WEB_AUTH_URL") {
            AuthMode::CookieSession { auth_url }
        } else {
            AuthMode::Open
        };

        Self {
            port: env_nonempty("SERVER_PORT")
                .or_else(|| env_nonempty("PORT"))
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            server_instance_id: env_nonempty("SERVER_INSTANCE_ID")
                .unwrap_or_else(default_instance_id),
            redis_url: env_nonempty("REDIS_URL"),
            presence_ttl_seconds: env_parsed("PRESENCE_TTL_SECONDS", DEFAULT_PRESENCE_TTL_SECONDS),
            proximity_threshold: env_nonempty("PROXIMITY_RADIUS")
                .or_else(|| env_nonempty("PROXIMITY_THRESHOLD"))
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_PROXIMITY_THRESHOLD),
            station_proximity: env_parsed("STATION_PROXIMITY_THRESHOLD", DEFAULT_STATION_PROXIMITY),
            pending_timeout_ms: env_parsed("CHALLENGE_PENDING_TIMEOUT_MS", DEFAULT_PENDING_TIMEOUT_MS),
            orphan_grace_ms: env_parsed("CHALLENGE_ORPHAN_GRACE_MS", DEFAULT_ORPHAN_GRACE_MS),
            agent_human_cooldown_ms: env_parsed(
                "AGENT_TO_HUMAN_CHALLENGE_COOLDOWN_MS",
                DEFAULT_AGENT_HUMAN_COOLDOWN_MS,
            ),
            auth_mode,
            internal_service_token: env_nonempty("INTERNAL_SERVICE_TOKEN"),
            agent_runtime_url: env_nonempty("AGENT_RUNTIME_URL"),
            escrow_execution_mode: env_nonempty("ESCROW_EXECUTION_MODE")
                .unwrap_or_else(|| "simulated".to_owned()),
            escrow_fee_bps: env_parsed("ESCROW_FEE_BPS", DEFAULT_FEE_BPS),
            house_wallet_id: env_nonempty("ESCROW_HOUSE_WALLET_ID"),
            dice_duel_enabled: env_flag("DICE_DUEL_ENABLED", true),
            agent_locomotion_enabled: env_flag("AGENT_LOCOMOTION_ENABLED", true),
            station_router_enabled: env_flag("STATION_PLUGIN_ROUTER_ENABLED", true),
        }
    }

    /// The only fatal validation site: a production escrow mode with no way
    /// to reach the runtime must stop the process before the listener binds.
    pub fn validate(&self) -> Result<(), String> {
        if self.escrow_execution_mode == "onchain" {
            if self.agent_runtime_url.is_none() {
                return Err("ESCROW_EXECUTION_MODE=onchain requires AGENT_RUNTIME_URL".to_owned());
            }
            if self.internal_service_token.is_none() {
                return Err(
                    "ESCROW_EXECUTION_MODE=onchain requires INTERNAL_SERVICE_TOKEN".to_owned(),
                );
            }
            if self.house_wallet_id.is_none() {
                return Err(
                    "ESCROW_EXECUTION_MODE=onchain requires ESCROW_HOUSE_WALLET_ID".to_owned(),
                );
            }
        }
        Ok(())
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_nonempty(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match env_nonempty(key).as_deref() {
        Some("1") | Some("true") | Some("yes") | Some("on") => true,
        Some("0") | Some("false") | Some("no") | Some("off") => false,
        _ => default,
    }
}

fn default_instance_id() -> String {
    use rand::Rng;
    let suffix: u32 = rand::thread_rng().gen_range(0x1000..0xffff);
    format!("srv-{suffix:x}")
}
