//! The game server: authoritative tick loop, session gateway, challenge
//! pipeline with escrow, distributed presence/ownership, and the orphan
//! sweeper. `ArenaNode::spawn` wires every task together; the binary only
//! binds the listener.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use arena_escrow::{EscrowBackend, EscrowOrchestrator, HttpRuntime};
use arena_shared::{cancel, ServerId};
use arena_sim::{default_obstacles, default_stations, SimSnapshot};
use arena_store::{
    AdminCommand, Bus, BusEvent, ChallengeStore, EscrowLog, HistoryRecord, Kv, PresenceStore,
};
use axum::Router;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::interval;

pub mod config;
pub mod dispatch;
pub mod game;
pub mod gateway;
pub mod http;
pub mod leaderboard;
pub mod metrics;
pub mod sessions;
pub mod station;
pub mod sweeper;

#[cfg(test)]
mod tests;

pub use config::{AuthMode, Config};
pub use game::GameCommand;
pub use sessions::SessionRegistry;

use dispatch::{DispatchJob, Dispatcher, PresenceJob};
use game::{GameLoop, GameLoopConfig};
use leaderboard::Leaderboard;
use metrics::Metrics;
use station::StationRouter;

const GAME_COMMAND_BUFFER: usize = 512;
const PRESENCE_JOB_BUFFER: usize = 512;
const PRESENCE_SYNC_INTERVAL: Duration = Duration::from_millis(500);
// Heartbeat every fourth sync pass (2 s against a TTL of several seconds).
const HEARTBEAT_EVERY: u32 = 4;

pub struct AppState {
    pub config: Config,
    pub server_id: ServerId,
    pub registry: Arc<SessionRegistry>,
    pub game_tx: mpsc::Sender<GameCommand>,
    pub stations: Arc<StationRouter>,
    pub presence: Arc<PresenceStore>,
    pub challenge_store: Arc<ChallengeStore>,
    pub escrow_log: Arc<EscrowLog>,
    pub bus: Arc<Bus>,
    pub metrics: Arc<Metrics>,
    pub leaderboard: Arc<Leaderboard>,
    pub snapshot: Arc<RwLock<SimSnapshot>>,
    pub local_history: Arc<Mutex<VecDeque<HistoryRecord>>>,
    pub auth_http: reqwest::Client,
}

/// One running server instance. Dropping the node cancels every task it
/// spawned.
pub struct ArenaNode {
    pub state: Arc<AppState>,
    pub router: Router,
    cancel_guard: cancel::Guard,
}

impl ArenaNode {
    pub fn spawn(config: Config, kv: Arc<dyn Kv>) -> Result<ArenaNode, String> {
        let backend: Option<Arc<dyn EscrowBackend>> = match &config.agent_runtime_url {
            Some(url) => Some(Arc::new(
                HttpRuntime::new(
                    url.clone(),
                    config.internal_service_token.clone(),
                    config.escrow_execution_mode.clone(),
                )
                .map_err(|e| e.to_string())?,
            )),
            None => None,
        };
        Self::spawn_with_escrow(config, kv, backend)
    }

    /// Same wiring with the escrow backend supplied by the caller; tests
    /// substitute a scripted runtime here.
    pub fn spawn_with_escrow(
        config: Config,
        kv: Arc<dyn Kv>,
        backend: Option<Arc<dyn EscrowBackend>>,
    ) -> Result<ArenaNode, String> {
        config.validate()?;

        let server_id = ServerId::new(config.server_instance_id.clone());
        let presence = Arc::new(PresenceStore::new(kv.clone(), config.presence_ttl_seconds));
        let challenge_store = Arc::new(ChallengeStore::new(kv.clone(), server_id.clone()));
        let bus = Arc::new(Bus::new(kv.clone(), server_id.clone()));
        let escrow_log = Arc::new(EscrowLog::new(kv.clone()));

        let escrow = Arc::new(EscrowOrchestrator::new(
            backend,
            EscrowLog::new(kv),
            config.escrow_fee_bps,
            config.house_wallet_id.clone(),
        ));

        let registry = SessionRegistry::new();
        let metrics = Arc::new(Metrics::new());
        let leaderboard = Arc::new(Leaderboard::default());
        let rounds = Arc::new(Mutex::new(HashMap::new()));
        let snapshot = Arc::new(RwLock::new(SimSnapshot {
            tick: 0,
            players: Vec::new(),
        }));
        let local_history = Arc::new(Mutex::new(VecDeque::new()));

        let (game_tx, game_rx) = mpsc::channel(GAME_COMMAND_BUFFER);
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (presence_tx, presence_rx) = mpsc::channel(PRESENCE_JOB_BUFFER);

        let cancel_token = cancel::Token::new();

        let mut stations = default_stations();
        for station in &mut stations {
            station.radius = config.station_proximity;
        }
        let game_loop = GameLoop::new(
            GameLoopConfig {
                server_id: server_id.clone(),
                proximity_threshold: config.proximity_threshold,
                pending_timeout_ms: config.pending_timeout_ms,
                active_resolve_ms: arena_shared::ACTIVE_RESOLVE_MS,
                agent_human_cooldown_ms: config.agent_human_cooldown_ms,
                dice_duel_enabled: config.dice_duel_enabled,
                agent_locomotion_enabled: config.agent_locomotion_enabled,
            },
            game_rx,
            jobs_tx,
            presence_tx,
            registry.clone(),
            metrics.clone(),
            stations.clone(),
            default_obstacles(),
            rounds.clone(),
            snapshot.clone(),
        );
        tokio::spawn(game_loop.run(cancel_token.clone()));

        let dispatcher = Dispatcher {
            registry: registry.clone(),
            bus: bus.clone(),
            challenge_store: challenge_store.clone(),
            presence: presence.clone(),
            escrow: escrow.clone(),
            leaderboard: leaderboard.clone(),
            metrics: metrics.clone(),
            game_tx: game_tx.clone(),
            server_id: server_id.clone(),
            local_history: local_history.clone(),
        };
        tokio::spawn(dispatcher.run(jobs_rx, cancel_token.clone()));

        tokio::spawn(dispatch::run_presence_writer(
            presence.clone(),
            presence_rx,
            cancel_token.clone(),
        ));
        tokio::spawn(run_presence_sync(
            presence.clone(),
            server_id.clone(),
            game_tx.clone(),
            cancel_token.clone(),
        ));
        tokio::spawn(run_bus_consumer(
            bus.clone(),
            registry.clone(),
            game_tx.clone(),
            metrics.clone(),
            cancel_token.clone(),
        ));
        tokio::spawn(sweeper::run_sweeper(
            presence.clone(),
            challenge_store.clone(),
            bus.clone(),
            config.orphan_grace_ms,
            cancel_token.clone(),
        ));

        let station_router = Arc::new(StationRouter::new(
            config.station_router_enabled,
            stations,
            rounds,
            snapshot.clone(),
            game_tx.clone(),
            escrow,
            registry.clone(),
        ));

        let state = Arc::new(AppState {
            config,
            server_id,
            registry,
            game_tx,
            stations: station_router,
            presence,
            challenge_store,
            escrow_log,
            bus,
            metrics,
            leaderboard,
            snapshot,
            local_history,
            auth_http: reqwest::Client::new(),
        });
        let router = http::router(state.clone());

        Ok(ArenaNode {
            state,
            router,
            cancel_guard: cancel_token.guard(),
        })
    }

    /// A token handle that observes shutdown without owning it.
    pub fn cancel_token(&self) -> cancel::Token {
        (*self.cancel_guard).clone()
    }
}

/// Pushes remote presence into the loop twice a second and heartbeats this
/// node's liveness key.
async fn run_presence_sync(
    presence: Arc<PresenceStore>,
    server_id: ServerId,
    game_tx: mpsc::Sender<GameCommand>,
    cancel: cancel::Token,
) {
    let mut ticker = interval(PRESENCE_SYNC_INTERVAL);
    let mut passes: u32 = 0;
    loop {
        select! {
            biased;

            _ = cancel.cancelled() => break,

            _ = ticker.tick() => {
                if passes % HEARTBEAT_EVERY == 0 {
                    if let Err(e) = presence.heartbeat_server(&server_id).await {
                        log::warn!("server heartbeat failed: {e}");
                    }
                }
                passes = passes.wrapping_add(1);

                match presence.list().await {
                    Ok(entries) => {
                        let remote: Vec<_> = entries
                            .into_iter()
                            .filter(|e| e.owner_server_id != server_id)
                            .collect();
                        let _ = game_tx.try_send(GameCommand::RemotePresence(remote));
                    }
                    Err(e) => log::warn!("presence read failed: {e}"),
                }
            }
        }
    }
}

/// Feeds bus deliveries into the same dispatch queue as session commands,
/// preserving the single-writer discipline over the game state.
async fn run_bus_consumer(
    bus: Arc<Bus>,
    registry: Arc<SessionRegistry>,
    game_tx: mpsc::Sender<GameCommand>,
    metrics: Arc<Metrics>,
    cancel: cancel::Token,
) {
    let mut deliveries = bus.subscribe();
    loop {
        select! {
            biased;

            _ = cancel.cancelled() => break,

            delivery = deliveries.recv() => {
                let Some(delivery) = delivery else { break };
                metrics.bus_messages.inc();
                match delivery {
                    BusEvent::PlayerDirect { player_id, payload } => {
                        // Only the node holding the live session forwards;
                        // everyone else drops silently.
                        if registry.contains(&player_id) {
                            registry.send_to(&player_id, payload.to_string());
                        }
                    }
                    BusEvent::Challenge(command) => {
                        use arena_store::ChallengeCommand as Cmd;
                        let mapped = match command {
                            Cmd::ChallengeResponse { challenge_id, actor_id, accept } => {
                                GameCommand::ChallengeResponse { actor: actor_id, challenge_id, accept }
                            }
                            Cmd::ChallengeCounter { challenge_id, actor_id, wager } => {
                                GameCommand::ChallengeCounter { actor: actor_id, challenge_id, wager }
                            }
                            Cmd::ChallengeMove { challenge_id, actor_id, mv } => {
                                GameCommand::ChallengeMove { actor: actor_id, challenge_id, mv }
                            }
                        };
                        let _ = game_tx.send(mapped).await;
                    }
                    BusEvent::Admin(AdminCommand::AdminTeleport { player_id, x, z }) => {
                        let _ = game_tx.send(GameCommand::Teleport { player_id, x, z }).await;
                    }
                }
            }
        }
    }
}
