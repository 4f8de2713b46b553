//! The tick task: sole writer of the world simulation, the proximity set,
//! and the challenge state machine. Commands arrive from session tasks, the
//! bus consumer, and the admin surface; anything that needs external I/O is
//! handed to the dispatcher so a slow store or runtime can never stall a
//! tick.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use arena_challenge::{
    Challenge, ChallengeEvent, ChallengeReject, ChallengeService, ProvablyFair,
};
use arena_protocol::{ServerFrame, SnapshotPlayer};
use arena_shared::{
    cancel, now_ms, ChallengeId, CoinSide, GameMove, PlayerId, Role, ServerId, TICK_MILLIS,
};
use arena_sim::{ProximityDelta, ProximityKind, ProximityTracker, SimSnapshot, Station, WorldSim};
use arena_store::{ChallengeCommand, PresenceEntry};
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};

use crate::dispatch::{DispatchJob, PresenceJob};
use crate::metrics::Metrics;
use crate::sessions::{InputSlot, SessionMeta, SessionRegistry};
use crate::station::DealerRound;

const PRESENCE_WRITE_INTERVAL: Duration = Duration::from_millis(500);

/// How a dealer round fixes the outcome before the house move lands.
#[derive(Clone, Copy, Debug)]
pub enum HouseOutcome {
    Coin(CoinSide),
    Dice(u8),
}

#[derive(Debug)]
pub enum GameCommand {
    Join {
        player_id: PlayerId,
        meta: SessionMeta,
        input: Arc<InputSlot>,
        preferred: Option<(f32, f32)>,
        spawn_section: Option<u8>,
    },
    Leave {
        player_id: PlayerId,
    },
    ChallengeSend {
        actor: PlayerId,
        target: PlayerId,
        game_type: String,
        wager: u32,
    },
    ChallengeResponse {
        actor: PlayerId,
        challenge_id: ChallengeId,
        accept: bool,
    },
    ChallengeCounter {
        actor: PlayerId,
        challenge_id: ChallengeId,
        wager: u32,
    },
    ChallengeMove {
        actor: PlayerId,
        challenge_id: ChallengeId,
        mv: String,
    },
    /// Escrow or distributed-lock failure rolling an event back.
    EscrowAbort {
        challenge_id: ChallengeId,
        reason: String,
    },
    Teleport {
        player_id: PlayerId,
        x: f32,
        z: f32,
    },
    RemotePresence(Vec<PresenceEntry>),
    /// Dealer flow: create the house challenge and accept it on the house's
    /// behalf in one step.
    HouseCreate {
        player_id: PlayerId,
        game_type: String,
        wager: u32,
        provably_fair: ProvablyFair,
        reply: oneshot::Sender<Result<Challenge, ChallengeReject>>,
    },
    /// Dealer flow: fix the outcome where the game needs one, record the
    /// reveal, and land both moves.
    HouseFinish {
        challenge_id: ChallengeId,
        outcome: Option<HouseOutcome>,
        player_move: GameMove,
        house_move: GameMove,
        reveal_seed: String,
        reply: oneshot::Sender<Option<Challenge>>,
    },
}

pub struct GameLoopConfig {
    pub server_id: ServerId,
    pub proximity_threshold: f32,
    pub pending_timeout_ms: u64,
    pub active_resolve_ms: u64,
    pub agent_human_cooldown_ms: u64,
    pub dice_duel_enabled: bool,
    pub agent_locomotion_enabled: bool,
}

pub struct GameLoop {
    server_id: ServerId,
    commands: mpsc::Receiver<GameCommand>,
    jobs: mpsc::UnboundedSender<DispatchJob>,
    presence_jobs: mpsc::Sender<PresenceJob>,
    registry: Arc<SessionRegistry>,
    metrics: Arc<Metrics>,
    sim: WorldSim,
    proximity: ProximityTracker,
    challenges: ChallengeService,
    stations: Vec<Station>,
    local: HashMap<PlayerId, LocalPlayer>,
    remote: HashMap<PlayerId, PresenceEntry>,
    cooldowns: HashMap<(PlayerId, PlayerId), u64>,
    last_presence_write: HashMap<PlayerId, Instant>,
    rounds: Arc<Mutex<HashMap<PlayerId, DealerRound>>>,
    snapshot: Arc<RwLock<SimSnapshot>>,
    cooldown_ms: u64,
    next_tick: Instant,
}

struct LocalPlayer {
    meta: SessionMeta,
    input: Arc<InputSlot>,
}

impl GameLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: GameLoopConfig,
        commands: mpsc::Receiver<GameCommand>,
        jobs: mpsc::UnboundedSender<DispatchJob>,
        presence_jobs: mpsc::Sender<PresenceJob>,
        registry: Arc<SessionRegistry>,
        metrics: Arc<Metrics>,
        stations: Vec<Station>,
        obstacles: Vec<arena_sim::Aabb>,
        rounds: Arc<Mutex<HashMap<PlayerId, DealerRound>>>,
        snapshot: Arc<RwLock<SimSnapshot>>,
    ) -> Self {
        Self {
            commands,
            jobs,
            presence_jobs,
            registry,
            metrics,
            sim: WorldSim::new(obstacles, config.agent_locomotion_enabled),
            proximity: ProximityTracker::new(config.proximity_threshold),
            challenges: ChallengeService::new(
                config.server_id.as_str(),
                config.pending_timeout_ms,
                config.active_resolve_ms,
                config.dice_duel_enabled,
            ),
            stations,
            local: HashMap::new(),
            remote: HashMap::new(),
            cooldowns: HashMap::new(),
            last_presence_write: HashMap::new(),
            rounds,
            snapshot,
            cooldown_ms: config.agent_human_cooldown_ms,
            server_id: config.server_id,
            next_tick: Instant::now() + Duration::from_millis(TICK_MILLIS),
        }
    }

    pub async fn run(mut self, cancel: cancel::Token) {
        log::info!("game loop running on {}", self.server_id);
        while !cancel.is_cancelled() {
            select! {
                biased;

                _ = cancel.cancelled() => break,

                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },

                _ = sleep_until(self.next_tick) => self.handle_tick(),
            }
        }
        log::info!("game loop stopped on {}", self.server_id);
    }

    fn handle_command(&mut self, command: GameCommand) {
        match command {
            GameCommand::Join {
                player_id,
                meta,
                input,
                preferred,
                spawn_section,
            } => {
                self.sim
                    .join(player_id.clone(), meta.role, preferred, spawn_section);
                self.local.insert(player_id, LocalPlayer { meta, input });
            }
            GameCommand::Leave { player_id } => self.handle_leave(player_id),
            GameCommand::ChallengeSend {
                actor,
                target,
                game_type,
                wager,
            } => self.handle_challenge_send(actor, target, &game_type, wager),
            GameCommand::ChallengeResponse {
                actor,
                challenge_id,
                accept,
            } => self.handle_challenge_response(actor, challenge_id, accept),
            GameCommand::ChallengeCounter {
                actor,
                challenge_id,
                wager,
            } => self.handle_challenge_counter(actor, challenge_id, wager),
            GameCommand::ChallengeMove {
                actor,
                challenge_id,
                mv,
            } => self.handle_challenge_move(actor, challenge_id, &mv),
            GameCommand::EscrowAbort {
                challenge_id,
                reason,
            } => {
                if let Some(event) = self.challenges.abort(&challenge_id, &reason, now_ms()) {
                    self.emit(event, true);
                }
            }
            GameCommand::Teleport { player_id, x, z } => {
                if !self.sim.teleport(&player_id, x, z) {
                    log::debug!("teleport ignored for unknown player {player_id}");
                }
            }
            GameCommand::RemotePresence(entries) => {
                self.remote = entries
                    .into_iter()
                    .filter(|e| !self.sim.contains(&e.player_id))
                    .map(|e| (e.player_id.clone(), e))
                    .collect();
            }
            GameCommand::HouseCreate {
                player_id,
                game_type,
                wager,
                provably_fair,
                reply,
            } => {
                let result = self.handle_house_create(player_id, &game_type, wager, provably_fair);
                let _ = reply.send(result);
            }
            GameCommand::HouseFinish {
                challenge_id,
                outcome,
                player_move,
                house_move,
                reveal_seed,
                reply,
            } => {
                let result = self.handle_house_finish(
                    &challenge_id,
                    outcome,
                    player_move,
                    house_move,
                    &reveal_seed,
                );
                let _ = reply.send(result);
            }
        }
    }

    fn handle_leave(&mut self, player_id: PlayerId) {
        self.sim.leave(&player_id);
        self.local.remove(&player_id);

        // Survivors get their exit immediately; nothing is addressed to the
        // session that just went away.
        for (a, b) in self.proximity.purge(&player_id) {
            let survivor = if a == player_id { b } else { a };
            self.send_local(
                &survivor,
                &ServerFrame::Proximity {
                    event: "exit",
                    other_id: player_id.clone(),
                    other_name: self.display_name(&player_id),
                    distance: None,
                },
            );
        }

        if let Some(event) = self.challenges.clear_disconnected(&player_id, now_ms()) {
            self.emit(event, true);
        }
        if self
            .presence_jobs
            .try_send(PresenceJob::Remove(player_id.clone()))
            .is_err()
        {
            log::warn!("presence remove for {player_id} dropped: queue full");
        }
        self.rounds.lock().unwrap().remove(&player_id);
    }

    fn handle_challenge_send(
        &mut self,
        actor: PlayerId,
        target: PlayerId,
        game_type: &str,
        wager: u32,
    ) {
        let known = self.sim.contains(&target) || self.remote.contains_key(&target);
        if !known {
            self.reject(&actor, "target_not_found");
            return;
        }
        if !self.proximity.is_near(&actor, &target) {
            self.reject(&actor, "target_not_nearby");
            return;
        }

        let actor_role = self.role_of(&actor);
        let target_role = self.role_of(&target);
        let now = now_ms();
        if actor_role == Some(Role::Agent) && target_role == Some(Role::Human) {
            let key = (actor.clone(), target.clone());
            if let Some(&last) = self.cooldowns.get(&key) {
                if now < last + self.cooldown_ms {
                    self.reject(&actor, "human_challenge_cooldown");
                    return;
                }
            }
            self.cooldowns.insert(key, now);
        }

        match self
            .challenges
            .create_challenge(actor.clone(), target, game_type, wager, now)
        {
            Ok(event) => self.emit(event, true),
            Err(reject) => self.reject(&actor, reject.reason_code()),
        }
    }

    fn handle_challenge_response(
        &mut self,
        actor: PlayerId,
        challenge_id: ChallengeId,
        accept: bool,
    ) {
        if self.challenges.get(&challenge_id).is_none() {
            self.forward(
                actor.clone(),
                ChallengeCommand::ChallengeResponse {
                    challenge_id,
                    actor_id: actor,
                    accept,
                },
            );
            return;
        }
        match self.challenges.respond(&challenge_id, &actor, accept, now_ms()) {
            Ok(event) => self.emit(event, true),
            Err(reject) => self.reject(&actor, reject.reason_code()),
        }
    }

    fn handle_challenge_counter(&mut self, actor: PlayerId, challenge_id: ChallengeId, wager: u32) {
        let Some(original) = self.challenges.get(&challenge_id).cloned() else {
            self.forward(
                actor.clone(),
                ChallengeCommand::ChallengeCounter {
                    challenge_id,
                    actor_id: actor,
                    wager,
                },
            );
            return;
        };

        // A counter is a decline plus a fresh challenge back at the sender
        // with the new stake.
        let now = now_ms();
        match self.challenges.respond(&challenge_id, &actor, false, now) {
            Ok(event) => self.emit(event, true),
            Err(reject) => {
                self.reject(&actor, reject.reason_code());
                return;
            }
        }
        match self.challenges.create_challenge(
            actor.clone(),
            original.challenger_id.clone(),
            original.game_type.as_str(),
            wager,
            now,
        ) {
            Ok(event) => self.emit(event, true),
            Err(reject) => self.reject(&actor, reject.reason_code()),
        }
    }

    fn handle_challenge_move(&mut self, actor: PlayerId, challenge_id: ChallengeId, mv: &str) {
        if self.challenges.get(&challenge_id).is_none() {
            self.forward(
                actor.clone(),
                ChallengeCommand::ChallengeMove {
                    challenge_id,
                    actor_id: actor,
                    mv: mv.to_owned(),
                },
            );
            return;
        }
        let Ok(mv) = mv.parse::<GameMove>() else {
            self.reject(&actor, ChallengeReject::IllegalMove.reason_code());
            return;
        };
        match self.challenges.submit_move(&challenge_id, &actor, mv, now_ms()) {
            Ok(event) => self.emit(event, true),
            Err(reject) => self.reject(&actor, reject.reason_code()),
        }
    }

    fn handle_house_create(
        &mut self,
        player_id: PlayerId,
        game_type: &str,
        wager: u32,
        provably_fair: ProvablyFair,
    ) -> Result<Challenge, ChallengeReject> {
        let now = now_ms();
        let created = self.challenges.create_challenge(
            player_id,
            PlayerId::house(),
            game_type,
            wager,
            now,
        )?;
        let id = created.challenge.id.clone();
        self.challenges.attach_provably_fair(&id, provably_fair);
        self.emit(created, true);

        // The house always accepts its own table.
        let accepted = self
            .challenges
            .respond(&id, &PlayerId::house(), true, now)?;
        let challenge = accepted.challenge.clone();
        // Station flows settle escrow inline, so the dispatcher must not
        // run the lock again for this accept.
        self.emit(accepted, false);
        Ok(challenge)
    }

    fn handle_house_finish(
        &mut self,
        id: &ChallengeId,
        outcome: Option<HouseOutcome>,
        player_move: GameMove,
        house_move: GameMove,
        reveal_seed: &str,
    ) -> Option<Challenge> {
        match outcome {
            Some(HouseOutcome::Coin(side)) => self.challenges.set_coinflip_override(id, side),
            Some(HouseOutcome::Dice(roll)) => self.challenges.set_dice_override(id, roll),
            None => {}
        }
        self.challenges.set_reveal_seed(id, reveal_seed);

        let now = now_ms();
        let challenger = self.challenges.get(id)?.challenger_id.clone();
        match self.challenges.submit_move(id, &challenger, player_move, now) {
            Ok(event) => self.emit(event, false),
            Err(reject) => {
                log::warn!("dealer player move rejected on {id}: {}", reject.reason_code());
                return None;
            }
        }
        match self
            .challenges
            .submit_move(id, &PlayerId::house(), house_move, now)
        {
            Ok(event) => {
                let challenge = event.challenge.clone();
                // Escrow for dealer rounds is settled by the station task.
                self.emit(event, false);
                Some(challenge)
            }
            Err(reject) => {
                log::warn!("dealer house move rejected on {id}: {}", reject.reason_code());
                None
            }
        }
    }

    fn handle_tick(&mut self) {
        let now = now_ms();

        for (id, player) in &self.local {
            let (move_x, move_z) = player.input.load();
            self.sim.set_input(id, move_x, move_z);
        }
        let snap = self.sim.step(TICK_MILLIS as f32 / 1000.0);
        self.metrics.ticks.inc();
        if let Ok(mut cell) = self.snapshot.write() {
            *cell = snap.clone();
        }

        // Merged proximity set: local bodies plus everything remote.
        let mut positions: Vec<(PlayerId, f32, f32)> = snap
            .players
            .iter()
            .map(|p| (p.id.clone(), p.x, p.z))
            .collect();
        for entry in self.remote.values() {
            // The remote cache can lag a join by up to one refresh.
            if !self.sim.contains(&entry.player_id) {
                positions.push((entry.player_id.clone(), entry.x, entry.z));
            }
        }
        for delta in self.proximity.observe(&positions) {
            self.send_proximity(&delta);
        }

        for event in self.challenges.tick(now) {
            self.emit(event, true);
        }

        self.rounds
            .lock()
            .unwrap()
            .retain(|_, round| !round.expired(now));

        self.push_presence(&snap);
        self.broadcast_snapshot(&snap);

        self.next_tick += Duration::from_millis(TICK_MILLIS);
        let now_instant = Instant::now();
        if self.next_tick < now_instant {
            // Fell behind (suspended laptop, debugger); jump forward rather
            // than burning CPU on catch-up ticks.
            self.next_tick = now_instant + Duration::from_millis(TICK_MILLIS);
        }
    }

    fn push_presence(&mut self, snap: &SimSnapshot) {
        let now = Instant::now();
        for player in &snap.players {
            let due = self
                .last_presence_write
                .get(&player.id)
                .map_or(true, |last| now.duration_since(*last) >= PRESENCE_WRITE_INTERVAL);
            if !due {
                continue;
            }
            let Some(local) = self.local.get(&player.id) else {
                continue;
            };
            let entry = PresenceEntry {
                player_id: player.id.clone(),
                role: player.role,
                display_name: local.meta.display_name.clone(),
                wallet_id: local.meta.wallet_id.clone(),
                x: player.x,
                y: player.y,
                z: player.z,
                yaw: player.yaw,
                speed: player.speed,
                updated_at: now_ms(),
                owner_server_id: self.server_id.clone(),
            };
            if self.presence_jobs.try_send(PresenceJob::Upsert(entry)).is_ok() {
                self.last_presence_write.insert(player.id.clone(), now);
            }
        }
        let sim = &self.sim;
        self.last_presence_write.retain(|id, _| sim.contains(id));
    }

    fn broadcast_snapshot(&self, snap: &SimSnapshot) {
        let mut players: Vec<SnapshotPlayer> = Vec::with_capacity(snap.players.len());
        for p in &snap.players {
            let meta = self.local.get(&p.id);
            players.push(SnapshotPlayer {
                id: p.id.clone(),
                x: p.x,
                y: p.y,
                z: p.z,
                yaw: p.yaw,
                speed: p.speed,
                role: p.role,
                display_name: meta
                    .map(|m| m.meta.display_name.clone())
                    .unwrap_or_else(|| p.id.to_string()),
                wallet_id: meta.and_then(|m| m.meta.wallet_id.clone()),
            });
        }
        for entry in self.remote.values() {
            if self.sim.contains(&entry.player_id) {
                continue;
            }
            players.push(SnapshotPlayer {
                id: entry.player_id.clone(),
                x: entry.x,
                y: entry.y,
                z: entry.z,
                yaw: entry.yaw,
                speed: entry.speed,
                role: entry.role,
                display_name: entry.display_name.clone(),
                wallet_id: entry.wallet_id.clone(),
            });
        }

        let frame = ServerFrame::Snapshot {
            tick: snap.tick,
            players,
            stations: self.stations.clone(),
        };
        self.registry.broadcast(&frame.to_json());
        self.metrics
            .frames_out
            .inc_by(self.registry.len() as u64);
    }

    fn send_proximity(&self, delta: &ProximityDelta) {
        let (event, distance) = match delta.kind {
            ProximityKind::Enter => ("enter", Some(delta.distance)),
            ProximityKind::Exit => ("exit", None),
        };
        for (me, other) in [(&delta.a, &delta.b), (&delta.b, &delta.a)] {
            self.send_local(
                me,
                &ServerFrame::Proximity {
                    event,
                    other_id: other.clone(),
                    other_name: self.display_name(other),
                    distance,
                },
            );
        }
    }

    fn display_name(&self, id: &PlayerId) -> String {
        if let Some(local) = self.local.get(id) {
            return local.meta.display_name.clone();
        }
        if let Some(entry) = self.remote.get(id) {
            return entry.display_name.clone();
        }
        id.to_string()
    }

    fn role_of(&self, id: &PlayerId) -> Option<Role> {
        if let Some(local) = self.local.get(id) {
            return Some(local.meta.role);
        }
        self.remote.get(id).map(|e| e.role)
    }

    /// Local, non-blocking delivery; off-node players are reached through
    /// the dispatcher instead.
    fn send_local(&self, player_id: &PlayerId, frame: &ServerFrame) {
        self.registry.send_to(player_id, frame.to_json());
    }

    /// Semantic rejection back to the actor only.
    fn reject(&self, actor: &PlayerId, reason: &str) {
        self.send_local(
            actor,
            &ServerFrame::Challenge {
                event: "error".to_owned(),
                reason: Some(reason.to_owned()),
                challenge: None,
            },
        );
    }

    fn emit(&mut self, event: ChallengeEvent, escrow: bool) {
        let _ = self.jobs.send(DispatchJob::Event { event, escrow });
    }

    fn forward(&mut self, actor: PlayerId, command: ChallengeCommand) {
        let _ = self.jobs.send(DispatchJob::Forward { actor, command });
    }
}
