//! In-world station interactions. Dealer rounds run the commit/reveal
//! protocol: the house seed is committed before the player's pick binds the
//! outcome, the outcome derives from both seeds plus the challenge id, and
//! the seed is revealed with the result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use arena_challenge::ProvablyFair;
use arena_escrow::{EscrowDisposition, EscrowOrchestrator, EscrowPhaseReport};
use arena_protocol::ServerFrame;
use arena_shared::{fair, now_ms, CoinSide, GameKind, GameMove, PlayerId, DEALER_ROUND_TTL_MS, MAX_WAGER};
use arena_sim::{SimSnapshot, Station, StationKind};
use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use crate::game::{GameCommand, HouseOutcome};
use crate::sessions::SessionRegistry;

#[derive(Clone, Debug)]
pub struct DealerRound {
    pub station_id: String,
    pub game: GameKind,
    pub wager: u32,
    pub house_seed: String,
    pub commit_hash: String,
    pub method: &'static str,
    pub created_at: u64,
    pub preflight_approved: bool,
}

impl DealerRound {
    pub fn expired(&self, now: u64) -> bool {
        now >= self.created_at + DEALER_ROUND_TTL_MS
    }
}

pub struct StationRouter {
    enabled: bool,
    stations: Vec<Station>,
    rounds: Arc<Mutex<HashMap<PlayerId, DealerRound>>>,
    snapshot: Arc<RwLock<SimSnapshot>>,
    game_tx: mpsc::Sender<GameCommand>,
    escrow: Arc<EscrowOrchestrator>,
    registry: Arc<SessionRegistry>,
}

impl StationRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        enabled: bool,
        stations: Vec<Station>,
        rounds: Arc<Mutex<HashMap<PlayerId, DealerRound>>>,
        snapshot: Arc<RwLock<SimSnapshot>>,
        game_tx: mpsc::Sender<GameCommand>,
        escrow: Arc<EscrowOrchestrator>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            enabled,
            stations,
            rounds,
            snapshot,
            game_tx,
            escrow,
            registry,
        }
    }

    /// Runs one interaction and returns the frames addressed to the actor.
    pub async fn interact(
        &self,
        actor: &PlayerId,
        station_id: &str,
        action: &str,
        wager: Option<u32>,
        pick: Option<String>,
        player_seed: Option<String>,
    ) -> Vec<ServerFrame> {
        if !self.enabled {
            return vec![self.error(station_id, "stations_disabled")];
        }
        let Some(station) = self.stations.iter().find(|s| s.id == station_id) else {
            return vec![self.error(station_id, "unknown_station")];
        };
        if !self.actor_in_range(actor, station) {
            return vec![self.error(station_id, "not_near_station")];
        }

        match station.kind {
            StationKind::WorldInteractable => vec![ServerFrame::StationUi {
                station_id: station.id.clone(),
                view: json!({ "state": "station_info", "stationId": station.id }),
            }],
            StationKind::CashierBank => self.cashier(station).await,
            StationKind::DealerCoinflip | StationKind::DealerRps | StationKind::DealerDiceDuel => {
                let game = match station.kind {
                    StationKind::DealerCoinflip => GameKind::Coinflip,
                    StationKind::DealerRps => GameKind::Rps,
                    _ => GameKind::DiceDuel,
                };
                match action {
                    "start" => self.start(actor, station, game, wager.unwrap_or(0)).await,
                    "pick" => self.pick(actor, station, game, pick, player_seed).await,
                    _ => vec![self.error(&station.id, "unknown_action")],
                }
            }
        }
    }

    fn actor_in_range(&self, actor: &PlayerId, station: &Station) -> bool {
        let Ok(snapshot) = self.snapshot.read() else {
            return false;
        };
        snapshot
            .players
            .iter()
            .find(|p| &p.id == actor)
            .is_some_and(|p| station.contains(p.x, p.z))
    }

    async fn cashier(&self, station: &Station) -> Vec<ServerFrame> {
        let house = match self.escrow.backend() {
            Some(backend) => match backend.house_status().await {
                Ok(response) => json!({ "ok": response.ok, "reason": response.reason }),
                Err(e) => json!({ "ok": false, "reason": e.reason_code() }),
            },
            None => json!({ "ok": false, "reason": "wallet_policy_disabled" }),
        };
        vec![ServerFrame::StationUi {
            station_id: station.id.clone(),
            view: json!({ "state": "cashier", "house": house }),
        }]
    }

    async fn start(
        &self,
        actor: &PlayerId,
        station: &Station,
        game: GameKind,
        wager: u32,
    ) -> Vec<ServerFrame> {
        let wager = wager.min(MAX_WAGER);
        let mut preflight_approved = false;

        if wager > 0 && self.escrow.enabled() {
            let Some(player_wallet) = self.registry.wallet_of(actor) else {
                return vec![self.error(&station.id, "wallet_required")];
            };
            let Some(house_wallet) = self.escrow.house_wallet_id().map(str::to_owned) else {
                return vec![self.error(&station.id, "HOUSE_SIGNER_UNAVAILABLE")];
            };
            let preflight = self
                .escrow
                .preflight(&[player_wallet, house_wallet], wager)
                .await;
            if !preflight.ok {
                let reason = preflight
                    .reason
                    .unwrap_or_else(|| "UNKNOWN_PRECHECK_FAILURE".to_owned());
                if reason != "wallet_policy_disabled" {
                    return vec![ServerFrame::StationUi {
                        station_id: station.id.clone(),
                        view: json!({
                            "state": "dealer_error",
                            "reasonCode": reason,
                            "reasonText": "stake cannot be escrowed right now",
                        }),
                    }];
                }
            } else {
                preflight_approved = true;
            }
        }

        let house_seed = fair::random_house_seed();
        let commit_hash = fair::commit_hash(&house_seed);
        let method = match game {
            GameKind::Coinflip => fair::COINFLIP_METHOD,
            GameKind::Rps => fair::RPS_METHOD,
            GameKind::DiceDuel => fair::DICE_METHOD,
        };
        let round = DealerRound {
            station_id: station.id.clone(),
            game,
            wager,
            house_seed,
            commit_hash: commit_hash.clone(),
            method,
            created_at: now_ms(),
            preflight_approved,
        };
        self.rounds.lock().unwrap().insert(actor.clone(), round);

        vec![ServerFrame::StationUi {
            station_id: station.id.clone(),
            view: json!({
                "state": "dealer_ready",
                "game": game.as_str(),
                "wager": wager,
                "commitHash": commit_hash,
                "method": method,
            }),
        }]
    }

    async fn pick(
        &self,
        actor: &PlayerId,
        station: &Station,
        game: GameKind,
        pick: Option<String>,
        player_seed: Option<String>,
    ) -> Vec<ServerFrame> {
        let round = {
            let rounds = self.rounds.lock().unwrap();
            rounds.get(actor).cloned()
        };
        let Some(round) = round else {
            return vec![self.error(&station.id, "no_active_round")];
        };
        if round.station_id != station.id || round.game != game {
            return vec![self.error(&station.id, "no_active_round")];
        }
        if round.expired(now_ms()) {
            self.rounds.lock().unwrap().remove(actor);
            return vec![self.error(&station.id, "round_expired")];
        }

        let player_move = match pick.as_deref().and_then(|p| p.parse::<GameMove>().ok()) {
            Some(mv) if mv.legal_for(game) => mv,
            _ => return vec![self.error(&station.id, "invalid_pick")],
        };
        // The round is consumed once the pick is valid.
        self.rounds.lock().unwrap().remove(actor);

        let player_seed = player_seed.unwrap_or_default();
        let pf = ProvablyFair {
            commit_hash: round.commit_hash.clone(),
            player_seed: (!player_seed.is_empty()).then(|| player_seed.clone()),
            reveal_seed: None,
            method: round.method.to_owned(),
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self
            .game_tx
            .send(GameCommand::HouseCreate {
                player_id: actor.clone(),
                game_type: game.as_str().to_owned(),
                wager: round.wager,
                provably_fair: pf,
                reply: reply_tx,
            })
            .await;
        if sent.is_err() {
            return vec![self.error(&station.id, "server_unavailable")];
        }
        let challenge = match reply_rx.await {
            Ok(Ok(challenge)) => challenge,
            Ok(Err(reject)) => return vec![self.error(&station.id, reject.reason_code())],
            Err(_) => return vec![self.error(&station.id, "server_unavailable")],
        };
        let id = challenge.id.clone();

        let mut frames = vec![ServerFrame::ProvablyFair {
            phase: "commit",
            challenge_id: id.clone(),
            commit_hash: round.commit_hash.clone(),
            player_seed: (!player_seed.is_empty()).then(|| player_seed.clone()),
            house_seed: None,
            method: round.method.to_owned(),
        }];

        // Stake handling before any outcome is derived.
        let player_wallet = self.registry.wallet_of(actor);
        if round.wager > 0 && self.escrow.enabled() {
            let house_wallet = self.escrow.house_wallet_id().map(str::to_owned);
            let outcome = self
                .escrow
                .on_accepted(
                    &id,
                    round.wager,
                    std::slice::from_ref(actor),
                    player_wallet.as_deref(),
                    house_wallet.as_deref(),
                )
                .await;
            frames.extend(escrow_frames(&id, &outcome.reports));
            if let EscrowDisposition::Abort { reason } = outcome.disposition {
                let _ = self
                    .game_tx
                    .send(GameCommand::EscrowAbort {
                        challenge_id: id.clone(),
                        reason: reason.clone(),
                    })
                    .await;
                frames.push(self.error(&station.id, &reason));
                return frames;
            }
        }

        let (outcome, house_move, result_label) = match game {
            GameKind::Coinflip => {
                let result = fair::coinflip_outcome(&round.house_seed, &player_seed, &id);
                let house_move = match player_move {
                    GameMove::Heads => GameMove::Tails,
                    _ => GameMove::Heads,
                };
                (
                    Some(HouseOutcome::Coin(result)),
                    house_move,
                    match result {
                        CoinSide::Heads => "heads".to_owned(),
                        CoinSide::Tails => "tails".to_owned(),
                    },
                )
            }
            GameKind::Rps => {
                let house_move = fair::rps_house_move(&round.house_seed, &player_seed, &id);
                (None, house_move, house_move.as_wire())
            }
            GameKind::DiceDuel => {
                let roll = fair::dice_roll(&round.house_seed, &player_seed, &id);
                let house_face = fair::dice_house_face(&round.house_seed, &player_seed, &id);
                (
                    Some(HouseOutcome::Dice(roll)),
                    GameMove::Face(house_face),
                    roll.to_string(),
                )
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let sent = self
            .game_tx
            .send(GameCommand::HouseFinish {
                challenge_id: id.clone(),
                outcome,
                player_move,
                house_move,
                reveal_seed: round.house_seed.clone(),
                reply: reply_tx,
            })
            .await;
        if sent.is_err() {
            return vec![self.error(&station.id, "server_unavailable")];
        }
        let Ok(Some(resolved)) = reply_rx.await else {
            frames.push(self.error(&station.id, "dealer_failed"));
            return frames;
        };

        let mut tx_hash = None;
        let mut payout = None;
        if round.wager > 0 && self.escrow.enabled() {
            let winner_wallet = match &resolved.winner_id {
                Some(w) if w.is_house() => self.escrow.house_wallet_id().map(str::to_owned),
                Some(_) => player_wallet.clone(),
                None => None,
            };
            let reports = self
                .escrow
                .on_resolved(
                    &id,
                    round.wager,
                    std::slice::from_ref(actor),
                    winner_wallet.as_deref(),
                )
                .await;
            if let Some(ok_report) = reports.iter().find(|r| r.ok) {
                tx_hash = ok_report.tx_hash.clone();
                payout = ok_report.payout;
            }
            frames.extend(escrow_frames(&id, &reports));
        }

        frames.push(ServerFrame::ProvablyFair {
            phase: "reveal",
            challenge_id: id.clone(),
            commit_hash: round.commit_hash.clone(),
            player_seed: (!player_seed.is_empty()).then(|| player_seed.clone()),
            house_seed: Some(round.house_seed.clone()),
            method: round.method.to_owned(),
        });

        let payout_delta = match &resolved.winner_id {
            Some(w) if w == actor => payout.unwrap_or(f64::from(round.wager)),
            Some(_) => -f64::from(round.wager),
            None => 0.0,
        };
        frames.push(ServerFrame::StationUi {
            station_id: station.id.clone(),
            view: json!({
                "state": "dealer_reveal",
                "challengeId": id,
                "result": result_label,
                "winnerId": resolved.winner_id,
                "wager": round.wager,
                "payoutDelta": payout_delta,
                "txHash": tx_hash,
                "commitHash": round.commit_hash,
                "houseSeed": round.house_seed,
                "method": round.method,
            }),
        });
        frames
    }

    fn error(&self, station_id: &str, reason: &str) -> ServerFrame {
        ServerFrame::StationUi {
            station_id: station_id.to_owned(),
            view: json!({ "state": "dealer_error", "reason": reason }),
        }
    }
}

fn escrow_frames(id: &arena_shared::ChallengeId, reports: &[EscrowPhaseReport]) -> Vec<ServerFrame> {
    reports
        .iter()
        .map(|report| ServerFrame::ChallengeEscrow {
            phase: report.phase,
            challenge_id: id.clone(),
            ok: report.ok,
            reason: report.reason.clone(),
            tx_hash: report.tx_hash.clone(),
            fee: report.fee,
            payout: report.payout,
        })
        .collect()
}
