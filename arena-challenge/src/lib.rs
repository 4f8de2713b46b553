//! Local challenge state machine.
//!
//! One instance per server, owned by the game loop. Every transition is a
//! plain method call that either returns a [`ChallengeEvent`] (state moved)
//! or a [`ChallengeReject`] (reported to the actor only, state untouched).
//! Nothing here performs I/O; escrow and distribution consume the returned
//! events.

use std::collections::{HashMap, VecDeque};

use arena_shared::{
    fair, ChallengeId, ChallengeIdAllocator, CoinSide, GameKind, GameMove, PlayerId, MAX_WAGER,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

const LOCAL_HISTORY_CAP: usize = 400;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeStatus {
    Pending,
    Active,
    Resolved,
    Declined,
    Expired,
}

impl ChallengeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ChallengeStatus::Resolved | ChallengeStatus::Declined | ChallengeStatus::Expired
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChallengeStatus::Pending => "pending",
            ChallengeStatus::Active => "active",
            ChallengeStatus::Resolved => "resolved",
            ChallengeStatus::Declined => "declined",
            ChallengeStatus::Expired => "expired",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvablyFair {
    pub commit_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_seed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reveal_seed: Option<String>,
    pub method: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub id: ChallengeId,
    pub challenger_id: PlayerId,
    pub opponent_id: PlayerId,
    pub game_type: GameKind,
    pub wager: u32,
    pub status: ChallengeStatus,
    pub created_at: u64,
    pub expires_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner_id: Option<PlayerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenger_move: Option<GameMove>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opponent_move: Option<GameMove>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coinflip_result: Option<CoinSide>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dice_result: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provably_fair: Option<ProvablyFair>,
}

impl Challenge {
    pub fn participants(&self) -> [&PlayerId; 2] {
        [&self.challenger_id, &self.opponent_id]
    }

    pub fn is_participant(&self, player: &PlayerId) -> bool {
        &self.challenger_id == player || &self.opponent_id == player
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Copy with both moves hidden, for events that fire mid-game.
    fn redacted(&self) -> Challenge {
        let mut c = self.clone();
        c.challenger_move = None;
        c.opponent_move = None;
        c
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChallengeEventKind {
    Created,
    Accepted,
    Declined,
    Expired,
    Resolved,
    MoveSubmitted,
}

impl ChallengeEventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChallengeEventKind::Created => "created",
            ChallengeEventKind::Accepted => "accepted",
            ChallengeEventKind::Declined => "declined",
            ChallengeEventKind::Expired => "expired",
            ChallengeEventKind::Resolved => "resolved",
            ChallengeEventKind::MoveSubmitted => "move_submitted",
        }
    }
}

/// A committed transition, carrying the snapshot to broadcast and the
/// players it is addressed to (the house is never addressed).
#[derive(Clone, Debug, PartialEq)]
pub struct ChallengeEvent {
    pub kind: ChallengeEventKind,
    pub reason: Option<String>,
    pub challenge: Challenge,
    pub to: Vec<PlayerId>,
}

/// Semantic rejection returned to the acting player only. Never mutates
/// state and never maps to a transport error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChallengeReject {
    SelfChallenge,
    PlayerBusy,
    UnknownGameType,
    GameDisabled,
    NotFound,
    NotPending,
    NotOpponent,
    NotActive,
    NotParticipant,
    IllegalMove,
    AlreadyMoved,
}

impl ChallengeReject {
    pub fn reason_code(self) -> &'static str {
        match self {
            ChallengeReject::SelfChallenge => "self_challenge",
            ChallengeReject::PlayerBusy => "player_busy",
            ChallengeReject::UnknownGameType => "unknown_game_type",
            ChallengeReject::GameDisabled => "game_disabled",
            ChallengeReject::NotFound => "challenge_not_found",
            ChallengeReject::NotPending => "challenge_not_pending",
            ChallengeReject::NotOpponent => "not_opponent",
            ChallengeReject::NotActive => "challenge_not_active",
            ChallengeReject::NotParticipant => "not_participant",
            ChallengeReject::IllegalMove => "invalid_move",
            ChallengeReject::AlreadyMoved => "move_already_submitted",
        }
    }
}

#[derive(Clone, Debug)]
pub struct HistoryEntry {
    pub at: u64,
    pub event: &'static str,
    pub reason: Option<String>,
    pub challenge: Challenge,
}

pub struct ChallengeService {
    challenges: HashMap<ChallengeId, Challenge>,
    active_by_player: HashMap<PlayerId, ChallengeId>,
    history: VecDeque<HistoryEntry>,
    ids: ChallengeIdAllocator,
    pending_timeout_ms: u64,
    active_resolve_ms: u64,
    coin_overrides: HashMap<ChallengeId, CoinSide>,
    dice_overrides: HashMap<ChallengeId, u8>,
    // Seeds minted for player-vs-player dice duels, revealed at resolution.
    house_seeds: HashMap<ChallengeId, String>,
    dice_enabled: bool,
}

impl ChallengeService {
    pub fn new(
        server_prefix: impl Into<String>,
        pending_timeout_ms: u64,
        active_resolve_ms: u64,
        dice_enabled: bool,
    ) -> Self {
        Self {
            challenges: HashMap::new(),
            active_by_player: HashMap::new(),
            history: VecDeque::new(),
            ids: ChallengeIdAllocator::new(server_prefix),
            pending_timeout_ms,
            active_resolve_ms,
            coin_overrides: HashMap::new(),
            dice_overrides: HashMap::new(),
            house_seeds: HashMap::new(),
            dice_enabled,
        }
    }

    pub fn get(&self, id: &ChallengeId) -> Option<&Challenge> {
        self.challenges.get(id)
    }

    pub fn is_busy(&self, player: &PlayerId) -> bool {
        !player.is_house() && self.active_by_player.contains_key(player)
    }

    pub fn create_challenge(
        &mut self,
        challenger: PlayerId,
        opponent: PlayerId,
        game_type: &str,
        wager: u32,
        now: u64,
    ) -> Result<ChallengeEvent, ChallengeReject> {
        let kind: GameKind = game_type
            .parse()
            .map_err(|()| ChallengeReject::UnknownGameType)?;
        if kind == GameKind::DiceDuel && !self.dice_enabled {
            return Err(ChallengeReject::GameDisabled);
        }
        if challenger == opponent {
            return Err(ChallengeReject::SelfChallenge);
        }
        if self.is_busy(&challenger) || self.is_busy(&opponent) {
            return Err(ChallengeReject::PlayerBusy);
        }

        let id = self.ids.mint();
        let challenge = Challenge {
            id: id.clone(),
            challenger_id: challenger.clone(),
            opponent_id: opponent.clone(),
            game_type: kind,
            wager: wager.min(MAX_WAGER),
            status: ChallengeStatus::Pending,
            created_at: now,
            expires_at: now + self.pending_timeout_ms,
            accepted_at: None,
            resolved_at: None,
            winner_id: None,
            challenger_move: None,
            opponent_move: None,
            coinflip_result: None,
            dice_result: None,
            provably_fair: None,
        };
        self.lock_participants(&challenge);
        self.challenges.insert(id.clone(), challenge);
        Ok(self.commit(&id, ChallengeEventKind::Created, None, now))
    }

    pub fn respond(
        &mut self,
        id: &ChallengeId,
        responder: &PlayerId,
        accept: bool,
        now: u64,
    ) -> Result<ChallengeEvent, ChallengeReject> {
        let challenge = self.challenges.get_mut(id).ok_or(ChallengeReject::NotFound)?;
        if challenge.status != ChallengeStatus::Pending {
            return Err(ChallengeReject::NotPending);
        }
        if &challenge.opponent_id != responder {
            return Err(ChallengeReject::NotOpponent);
        }

        if accept {
            challenge.status = ChallengeStatus::Active;
            challenge.accepted_at = Some(now);
            challenge.expires_at = now + self.active_resolve_ms;
            if challenge.game_type == GameKind::DiceDuel && challenge.provably_fair.is_none() {
                let seed = fair::random_house_seed();
                challenge.provably_fair = Some(ProvablyFair {
                    commit_hash: fair::commit_hash(&seed),
                    player_seed: None,
                    reveal_seed: None,
                    method: fair::DICE_METHOD.to_owned(),
                });
                self.house_seeds.insert(id.clone(), seed);
            }
            Ok(self.commit(id, ChallengeEventKind::Accepted, None, now))
        } else {
            challenge.status = ChallengeStatus::Declined;
            self.unlock_participants(id);
            Ok(self.commit(id, ChallengeEventKind::Declined, None, now))
        }
    }

    pub fn submit_move(
        &mut self,
        id: &ChallengeId,
        actor: &PlayerId,
        mv: GameMove,
        now: u64,
    ) -> Result<ChallengeEvent, ChallengeReject> {
        let challenge = self.challenges.get_mut(id).ok_or(ChallengeReject::NotFound)?;
        if challenge.status != ChallengeStatus::Active {
            return Err(ChallengeReject::NotActive);
        }
        if !challenge.is_participant(actor) {
            return Err(ChallengeReject::NotParticipant);
        }
        if !mv.legal_for(challenge.game_type) {
            return Err(ChallengeReject::IllegalMove);
        }

        let slot = if actor == &challenge.challenger_id {
            &mut challenge.challenger_move
        } else {
            &mut challenge.opponent_move
        };
        if slot.is_some() {
            return Err(ChallengeReject::AlreadyMoved);
        }
        *slot = Some(mv);

        if challenge.challenger_move.is_some() && challenge.opponent_move.is_some() {
            self.resolve(id, None, now);
            Ok(self.commit(id, ChallengeEventKind::Resolved, None, now))
        } else {
            Ok(self.commit(id, ChallengeEventKind::MoveSubmitted, None, now))
        }
    }

    /// Escrow-driven rollback: force-declines a pending or active challenge.
    pub fn abort(
        &mut self,
        id: &ChallengeId,
        reason: &str,
        now: u64,
    ) -> Option<ChallengeEvent> {
        let challenge = self.challenges.get_mut(id)?;
        if challenge.status.is_terminal() {
            return None;
        }
        challenge.status = ChallengeStatus::Declined;
        self.unlock_participants(id);
        Some(self.commit(id, ChallengeEventKind::Declined, Some(reason.to_owned()), now))
    }

    /// Sweeps timeouts. Pending past its deadline expires; active past its
    /// deadline resolves to the sole mover, or to a draw (refund path) when
    /// neither side moved.
    pub fn tick(&mut self, now: u64) -> Vec<ChallengeEvent> {
        let due: Vec<ChallengeId> = self
            .challenges
            .iter()
            .filter(|(_, c)| !c.status.is_terminal() && now >= c.expires_at)
            .map(|(id, _)| id.clone())
            .collect();

        let mut events = Vec::new();
        for id in due {
            let challenge = self.challenges.get_mut(&id).unwrap();
            match challenge.status {
                ChallengeStatus::Pending => {
                    challenge.status = ChallengeStatus::Expired;
                    self.unlock_participants(&id);
                    events.push(self.commit(
                        &id,
                        ChallengeEventKind::Expired,
                        Some("timeout".to_owned()),
                        now,
                    ));
                }
                ChallengeStatus::Active => {
                    let reason = match (&challenge.challenger_move, &challenge.opponent_move) {
                        (Some(_), None) | (None, Some(_)) => "opponent_timeout",
                        _ => "timeout_draw",
                    };
                    self.resolve(&id, Some(now), now);
                    events.push(self.commit(
                        &id,
                        ChallengeEventKind::Resolved,
                        Some(reason.to_owned()),
                        now,
                    ));
                }
                _ => {}
            }
        }
        events
    }

    /// A participant's session closed. Pending challenges they are locked
    /// into expire immediately; active ones run out on their own clock.
    pub fn clear_disconnected(&mut self, player: &PlayerId, now: u64) -> Option<ChallengeEvent> {
        let id = self.active_by_player.get(player)?.clone();
        let challenge = self.challenges.get_mut(&id)?;
        if challenge.status != ChallengeStatus::Pending {
            return None;
        }
        challenge.status = ChallengeStatus::Expired;
        self.unlock_participants(&id);
        Some(self.commit(
            &id,
            ChallengeEventKind::Expired,
            Some("player_disconnected".to_owned()),
            now,
        ))
    }

    /// Installed by the dealer path before the house move lands, so the
    /// commit/reveal derivation decides the flip instead of server RNG.
    pub fn set_coinflip_override(&mut self, id: &ChallengeId, side: CoinSide) {
        self.coin_overrides.insert(id.clone(), side);
    }

    pub fn set_dice_override(&mut self, id: &ChallengeId, roll: u8) {
        self.dice_overrides.insert(id.clone(), roll.clamp(1, 6));
    }

    pub fn attach_provably_fair(&mut self, id: &ChallengeId, pf: ProvablyFair) {
        if let Some(challenge) = self.challenges.get_mut(id) {
            challenge.provably_fair = Some(pf);
        }
    }

    pub fn set_reveal_seed(&mut self, id: &ChallengeId, seed: &str) {
        if let Some(pf) = self
            .challenges
            .get_mut(id)
            .and_then(|c| c.provably_fair.as_mut())
        {
            pf.reveal_seed = Some(seed.to_owned());
        }
    }

    pub fn recent_history(&self, limit: usize) -> Vec<HistoryEntry> {
        self.history.iter().rev().take(limit).cloned().collect()
    }

    fn lock_participants(&mut self, challenge: &Challenge) {
        for p in challenge.participants() {
            if !p.is_house() {
                self.active_by_player
                    .insert(p.clone(), challenge.id.clone());
            }
        }
    }

    fn unlock_participants(&mut self, id: &ChallengeId) {
        let Some(challenge) = self.challenges.get(id) else {
            return;
        };
        let participants: Vec<PlayerId> = challenge
            .participants()
            .into_iter()
            .cloned()
            .collect();
        for p in participants {
            if self.active_by_player.get(&p) == Some(id) {
                self.active_by_player.remove(&p);
            }
        }
    }

    /// Computes the winner and moves the challenge to `resolved`.
    /// `timeout_at` marks the auto-resolution path where one or both moves
    /// may be missing.
    fn resolve(&mut self, id: &ChallengeId, timeout_at: Option<u64>, now: u64) {
        let house_seed = self.house_seeds.remove(id);
        let coin_override = self.coin_overrides.remove(id);
        let dice_override = self.dice_overrides.remove(id);
        let challenge = self.challenges.get_mut(id).unwrap();

        challenge.status = ChallengeStatus::Resolved;
        challenge.resolved_at = Some(timeout_at.unwrap_or(now));

        challenge.winner_id = match (&challenge.challenger_move, &challenge.opponent_move) {
            (Some(_), None) => Some(challenge.challenger_id.clone()),
            (None, Some(_)) => Some(challenge.opponent_id.clone()),
            (None, None) => None,
            (Some(cm), Some(om)) => match challenge.game_type {
                GameKind::Rps => rps_winner(*cm, *om).map(|side| match side {
                    Side::Challenger => challenge.challenger_id.clone(),
                    Side::Opponent => challenge.opponent_id.clone(),
                }),
                GameKind::Coinflip => {
                    let result = coin_override
                        .unwrap_or_else(|| {
                            if rand::thread_rng().gen::<bool>() {
                                CoinSide::Heads
                            } else {
                                CoinSide::Tails
                            }
                        });
                    challenge.coinflip_result = Some(result);
                    if cm.coin_side() == om.coin_side() {
                        None
                    } else if cm.coin_side() == Some(result) {
                        Some(challenge.challenger_id.clone())
                    } else {
                        Some(challenge.opponent_id.clone())
                    }
                }
                GameKind::DiceDuel => {
                    let roll = dice_override.unwrap_or_else(|| {
                        let seed = house_seed.as_deref().unwrap_or("");
                        let player_seed = challenge
                            .provably_fair
                            .as_ref()
                            .and_then(|pf| pf.player_seed.as_deref())
                            .unwrap_or("");
                        fair::dice_roll(seed, player_seed, id)
                    });
                    challenge.dice_result = Some(roll);
                    let (GameMove::Face(cf), GameMove::Face(of)) = (cm, om) else {
                        unreachable!("legality was checked at submit");
                    };
                    // Declared face nearest the roll wins, wrapping around
                    // the die; the challenger takes equal distances.
                    if dice_distance(*of, roll) < dice_distance(*cf, roll) {
                        Some(challenge.opponent_id.clone())
                    } else {
                        Some(challenge.challenger_id.clone())
                    }
                }
            },
        };

        if let (Some(seed), Some(pf)) = (house_seed, challenge.provably_fair.as_mut()) {
            pf.reveal_seed = Some(seed);
        }
        self.unlock_participants(id);
    }

    fn commit(
        &mut self,
        id: &ChallengeId,
        kind: ChallengeEventKind,
        reason: Option<String>,
        now: u64,
    ) -> ChallengeEvent {
        let challenge = &self.challenges[id];
        let snapshot = if kind == ChallengeEventKind::MoveSubmitted {
            challenge.redacted()
        } else {
            challenge.clone()
        };
        let to: Vec<PlayerId> = challenge
            .participants()
            .into_iter()
            .filter(|p| !p.is_house())
            .cloned()
            .collect();
        let event = ChallengeEvent {
            kind,
            reason,
            challenge: snapshot,
            to,
        };
        self.history.push_back(HistoryEntry {
            at: now,
            event: kind.as_str(),
            reason: event.reason.clone(),
            challenge: event.challenge.clone(),
        });
        while self.history.len() > LOCAL_HISTORY_CAP {
            self.history.pop_front();
        }
        event
    }
}

enum Side {
    Challenger,
    Opponent,
}

fn rps_winner(cm: GameMove, om: GameMove) -> Option<Side> {
    use GameMove::{Paper, Rock, Scissors};
    match (cm, om) {
        (Rock, Scissors) | (Paper, Rock) | (Scissors, Paper) => Some(Side::Challenger),
        (Scissors, Rock) | (Rock, Paper) | (Paper, Scissors) => Some(Side::Opponent),
        _ => None,
    }
}

fn dice_distance(face: u8, roll: u8) -> u8 {
    let d = face.abs_diff(roll);
    d.min(6 - d)
}
