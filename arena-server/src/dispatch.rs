//! Side-effect worker fed by the game loop. Challenge transitions pass
//! through escrow before any frame reaches a client, distributed state is
//! updated, and off-node recipients are reached over the bus. One consumer
//! task keeps per-challenge ordering total.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use arena_challenge::{ChallengeEvent, ChallengeEventKind};
use arena_escrow::{EscrowDisposition, EscrowOrchestrator, EscrowPhaseReport};
use arena_protocol::ServerFrame;
use arena_shared::{cancel, now_ms, ChallengeId, PlayerId, ServerId};
use arena_store::{Bus, ChallengeCommand, ChallengeStore, HistoryRecord, LockOutcome, PresenceStore};
use tokio::select;
use tokio::sync::mpsc;

use crate::leaderboard::Leaderboard;
use crate::metrics::Metrics;
use crate::sessions::SessionRegistry;

const PLAYER_LOCK_TTL_MS: u64 = 10 * 60 * 1000;
const LOCAL_HISTORY_CAP: usize = 400;

#[derive(Debug)]
pub enum DispatchJob {
    /// A committed transition. `escrow: false` marks dealer-flow events
    /// whose escrow the station task settles inline.
    Event {
        event: ChallengeEvent,
        escrow: bool,
    },
    /// A command for a challenge this node does not own.
    Forward {
        actor: PlayerId,
        command: ChallengeCommand,
    },
}

#[derive(Debug)]
pub enum PresenceJob {
    Upsert(arena_store::PresenceEntry),
    Remove(PlayerId),
}

pub struct Dispatcher {
    pub registry: Arc<SessionRegistry>,
    pub bus: Arc<Bus>,
    pub challenge_store: Arc<ChallengeStore>,
    pub presence: Arc<PresenceStore>,
    pub escrow: Arc<EscrowOrchestrator>,
    pub leaderboard: Arc<Leaderboard>,
    pub metrics: Arc<Metrics>,
    pub game_tx: mpsc::Sender<crate::game::GameCommand>,
    pub server_id: ServerId,
    /// Mirror of the distributed history ring, served when the store is
    /// unreachable.
    pub local_history: Arc<Mutex<VecDeque<HistoryRecord>>>,
}

impl Dispatcher {
    pub async fn run(
        self,
        mut jobs: mpsc::UnboundedReceiver<DispatchJob>,
        cancel: cancel::Token,
    ) {
        loop {
            select! {
                biased;

                _ = cancel.cancelled() => break,

                job = jobs.recv() => match job {
                    Some(job) => self.handle(job).await,
                    None => break,
                },
            }
        }
    }

    async fn handle(&self, job: DispatchJob) {
        match job {
            DispatchJob::Event { event, escrow } => self.handle_event(event, escrow).await,
            DispatchJob::Forward { actor, command } => self.handle_forward(actor, command).await,
        }
    }

    async fn handle_event(&self, event: ChallengeEvent, escrow_enabled: bool) {
        let challenge = &event.challenge;
        let id = challenge.id.clone();
        self.metrics
            .challenge_events
            .with_label_values(&[event.kind.as_str()])
            .inc();

        match event.kind {
            ChallengeEventKind::Created => {
                match self
                    .challenge_store
                    .try_lock_players(&id, &event.to, PLAYER_LOCK_TTL_MS)
                    .await
                {
                    Ok(LockOutcome::Acquired) => {}
                    Ok(LockOutcome::PlayerBusy) => {
                        // Busy on another node; roll the local create back
                        // before anyone hears about it.
                        self.deliver_to(
                            &challenge.challenger_id,
                            &ServerFrame::Challenge {
                                event: "error".to_owned(),
                                reason: Some("player_busy".to_owned()),
                                challenge: None,
                            }
                            .to_json(),
                        )
                        .await;
                        let _ = self
                            .game_tx
                            .send(crate::game::GameCommand::EscrowAbort {
                                challenge_id: id,
                                reason: "player_busy".to_owned(),
                            })
                            .await;
                        return;
                    }
                    Err(e) => log::warn!("distributed lock for {id} failed: {e}"),
                }
                if let Err(e) = self
                    .challenge_store
                    .register(
                        &id,
                        &challenge.challenger_id,
                        &challenge.opponent_id,
                        challenge.status.as_str(),
                        challenge.to_value(),
                        now_ms(),
                    )
                    .await
                {
                    log::warn!("challenge meta register for {id} failed: {e}");
                }
                self.append_history(&event).await;
                self.deliver_event(&event).await;
            }
            ChallengeEventKind::Accepted => {
                if escrow_enabled && challenge.wager > 0 {
                    let challenger_wallet = self.wallet_of(&challenge.challenger_id).await;
                    let opponent_wallet = self.wallet_of(&challenge.opponent_id).await;
                    let outcome = self
                        .escrow
                        .on_accepted(
                            &id,
                            challenge.wager,
                            &event.to,
                            challenger_wallet.as_deref(),
                            opponent_wallet.as_deref(),
                        )
                        .await;
                    self.deliver_escrow(&id, &event.to, &outcome.reports).await;
                    if let EscrowDisposition::Abort { reason } = outcome.disposition {
                        let _ = self
                            .game_tx
                            .send(crate::game::GameCommand::EscrowAbort {
                                challenge_id: id,
                                reason,
                            })
                            .await;
                        return;
                    }
                }
                self.update_status(&id, &event, None).await;
                self.append_history(&event).await;
                self.deliver_event(&event).await;
            }
            ChallengeEventKind::MoveSubmitted => {
                self.update_status(&id, &event, Some("move_submitted")).await;
                self.deliver_event(&event).await;
            }
            ChallengeEventKind::Declined | ChallengeEventKind::Expired => {
                if escrow_enabled {
                    let reports = self
                        .escrow
                        .on_terminated(&id, challenge.wager, &event.to)
                        .await;
                    self.deliver_escrow(&id, &event.to, &reports).await;
                }
                self.finish(&event).await;
            }
            ChallengeEventKind::Resolved => {
                if escrow_enabled && challenge.wager > 0 {
                    let winner_wallet = match &challenge.winner_id {
                        Some(winner) => self.wallet_of(winner).await,
                        None => None,
                    };
                    let reports = self
                        .escrow
                        .on_resolved(&id, challenge.wager, &event.to, winner_wallet.as_deref())
                        .await;
                    self.deliver_escrow(&id, &event.to, &reports).await;
                }
                let participants: Vec<PlayerId> =
                    challenge.participants().into_iter().cloned().collect();
                self.leaderboard.record_resolution(
                    &participants,
                    challenge.winner_id.as_ref(),
                    challenge.wager,
                );
                self.finish(&event).await;
            }
        }
    }

    /// Terminal bookkeeping shared by resolved/declined/expired: release
    /// locks, record history, drop the meta, then tell everyone.
    async fn finish(&self, event: &ChallengeEvent) {
        let id = &event.challenge.id;
        if let Err(e) = self.challenge_store.release_players(id, &event.to).await {
            log::warn!("lock release for {id} failed: {e}");
        }
        self.append_history(event).await;
        if let Err(e) = self.challenge_store.clear(id).await {
            log::warn!("meta clear for {id} failed: {e}");
        }
        self.deliver_event(event).await;
    }

    async fn handle_forward(&self, actor: PlayerId, command: ChallengeCommand) {
        let id = match &command {
            ChallengeCommand::ChallengeResponse { challenge_id, .. }
            | ChallengeCommand::ChallengeCounter { challenge_id, .. }
            | ChallengeCommand::ChallengeMove { challenge_id, .. } => challenge_id.clone(),
        };
        match self.challenge_store.owner_server_id(&id).await {
            Ok(Some(owner)) if owner != self.server_id => {
                log::debug!("forwarding command for {id} to owner {owner}");
                if let Err(e) = self.bus.forward_challenge_command(&owner, &command).await {
                    log::warn!("forward for {id} failed: {e}");
                }
            }
            Ok(_) => {
                // Either nobody knows this challenge or the meta says this
                // node owns it and the local machine disagrees (stale meta
                // after a restart). Both read as not-found to the actor.
                self.deliver_to(
                    &actor,
                    &ServerFrame::Challenge {
                        event: "error".to_owned(),
                        reason: Some("challenge_not_found".to_owned()),
                        challenge: None,
                    }
                    .to_json(),
                )
                .await;
            }
            Err(e) => log::warn!("owner lookup for {id} failed: {e}"),
        }
    }

    async fn update_status(
        &self,
        id: &ChallengeId,
        event: &ChallengeEvent,
        status_override: Option<&str>,
    ) {
        let status = status_override.unwrap_or_else(|| event.challenge.status.as_str());
        if let Err(e) = self
            .challenge_store
            .update_status(id, status, Some(event.challenge.to_value()), now_ms())
            .await
        {
            log::warn!("status update for {id} failed: {e}");
        }
    }

    async fn append_history(&self, event: &ChallengeEvent) {
        let record = HistoryRecord {
            at: now_ms(),
            event: event.kind.as_str().to_owned(),
            reason: event.reason.clone(),
            challenge: event.challenge.to_value(),
        };
        {
            let mut local = self.local_history.lock().unwrap();
            local.push_back(record.clone());
            while local.len() > LOCAL_HISTORY_CAP {
                local.pop_front();
            }
        }
        if let Err(e) = self.challenge_store.append_history(&record).await {
            log::warn!("history append failed: {e}");
        }
    }

    /// Addressed delivery plus the local feed.
    async fn deliver_event(&self, event: &ChallengeEvent) {
        let value = event.challenge.to_value();
        let frame = ServerFrame::Challenge {
            event: event.kind.as_str().to_owned(),
            reason: event.reason.clone(),
            challenge: Some(value.clone()),
        }
        .to_json();
        for player in &event.to {
            self.deliver_to(player, &frame).await;
        }

        let feed = ServerFrame::ChallengeFeed {
            event: event.kind.as_str().to_owned(),
            reason: event.reason.clone(),
            challenge: Some(value),
        };
        self.registry.broadcast(&feed.to_json());
    }

    async fn deliver_escrow(
        &self,
        id: &ChallengeId,
        to: &[PlayerId],
        reports: &[EscrowPhaseReport],
    ) {
        for report in reports {
            self.metrics
                .escrow_calls
                .with_label_values(&[report.phase, if report.ok { "true" } else { "false" }])
                .inc();
            let frame = ServerFrame::ChallengeEscrow {
                phase: report.phase,
                challenge_id: id.clone(),
                ok: report.ok,
                reason: report.reason.clone(),
                tx_hash: report.tx_hash.clone(),
                fee: report.fee,
                payout: report.payout,
            }
            .to_json();
            for player in to {
                self.deliver_to(player, &frame).await;
            }
        }
    }

    /// Local session first; otherwise the player-direct channel finds the
    /// owning node.
    async fn deliver_to(&self, player: &PlayerId, frame: &str) {
        if player.is_house() {
            return;
        }
        if self.registry.send_to(player, frame.to_owned()) {
            self.metrics.frames_out.inc();
            return;
        }
        match serde_json::from_str(frame) {
            Ok(value) => {
                if let Err(e) = self.bus.publish_to_player(player, value).await {
                    log::warn!("bus delivery to {player} failed: {e}");
                }
            }
            Err(e) => log::warn!("unserializable frame for {player}: {e}"),
        }
    }

    async fn wallet_of(&self, player: &PlayerId) -> Option<String> {
        if player.is_house() {
            return self.escrow.house_wallet_id().map(str::to_owned);
        }
        if let Some(wallet) = self.registry.wallet_of(player) {
            return Some(wallet);
        }
        match self.presence.get(player).await {
            Ok(Some(entry)) => entry.wallet_id,
            _ => None,
        }
    }
}

/// Presence writes get their own consumer so a slow store never backs up
/// behind an escrow call.
pub async fn run_presence_writer(
    presence: Arc<PresenceStore>,
    mut jobs: mpsc::Receiver<PresenceJob>,
    cancel: cancel::Token,
) {
    loop {
        select! {
            biased;

            _ = cancel.cancelled() => break,

            job = jobs.recv() => match job {
                Some(PresenceJob::Upsert(entry)) => {
                    if let Err(e) = presence.upsert(&entry).await {
                        log::warn!("presence upsert failed: {e}");
                    }
                }
                Some(PresenceJob::Remove(player_id)) => {
                    if let Err(e) = presence.remove(&player_id).await {
                        log::warn!("presence remove failed: {e}");
                    }
                }
                None => break,
            },
        }
    }
}
