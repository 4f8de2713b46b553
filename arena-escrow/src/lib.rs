//! Escrow orchestration.
//!
//! Interposes between the challenge state machine and dispatch: every
//! monetary event triggers a strictly ordered preflight/lock/resolve/refund
//! workflow against the runtime, failures roll the state machine back
//! through an abort disposition, and every phase lands in the escrow event
//! ring. Only the node that owns a challenge calls in here.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arena_shared::{now_ms, ChallengeId, PlayerId};
use arena_store::{EscrowEventRecord, EscrowLog};
use tokio::sync::watch;
use tokio::time::Instant;

pub mod runtime;

pub use runtime::{EscrowBackend, HttpRuntime, RuntimeError, RuntimeResponse, WalletStatus};

const PREFLIGHT_TTL: Duration = Duration::from_millis(2_500);

pub const REASON_WALLET_REQUIRED: &str = "wallet_required";
pub const REASON_POLICY_DISABLED: &str = "wallet_policy_disabled";
pub const REASON_NOT_LOCKED: &str = "escrow_not_locked";
const REASON_UNKNOWN_PRECHECK: &str = "UNKNOWN_PRECHECK_FAILURE";
const REASON_ONCHAIN_ERROR: &str = "ONCHAIN_EXECUTION_ERROR";

#[derive(Clone, Debug, PartialEq)]
pub struct PreflightResult {
    pub ok: bool,
    pub reason: Option<String>,
}

enum PreflightSlot {
    Ready {
        at: Instant,
        result: PreflightResult,
    },
    InFlight(watch::Receiver<Option<PreflightResult>>),
}

/// One escrow phase as broadcast to clients and appended to the ring.
#[derive(Clone, Debug, PartialEq)]
pub struct EscrowPhaseReport {
    pub phase: &'static str,
    pub ok: bool,
    pub reason: Option<String>,
    pub tx_hash: Option<String>,
    pub fee: Option<f64>,
    pub payout: Option<f64>,
}

impl EscrowPhaseReport {
    fn failed(phase: &'static str, reason: impl Into<String>) -> Self {
        Self {
            phase,
            ok: false,
            reason: Some(reason.into()),
            tx_hash: None,
            fee: None,
            payout: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum EscrowDisposition {
    /// Dispatch the original challenge event unchanged.
    Proceed,
    /// The event must not stand; the caller aborts the challenge with this
    /// reason.
    Abort { reason: String },
}

#[derive(Debug)]
pub struct EscrowOutcome {
    pub disposition: EscrowDisposition,
    pub reports: Vec<EscrowPhaseReport>,
}

impl EscrowOutcome {
    fn proceed(reports: Vec<EscrowPhaseReport>) -> Self {
        Self {
            disposition: EscrowDisposition::Proceed,
            reports,
        }
    }
}

pub struct EscrowOrchestrator {
    backend: Option<Arc<dyn EscrowBackend>>,
    log: EscrowLog,
    fee_bps: u32,
    house_wallet_id: Option<String>,
    locked: Mutex<HashSet<ChallengeId>>,
    refunded: Mutex<HashSet<ChallengeId>>,
    preflight: Mutex<HashMap<String, PreflightSlot>>,
}

impl EscrowOrchestrator {
    pub fn new(
        backend: Option<Arc<dyn EscrowBackend>>,
        log: EscrowLog,
        fee_bps: u32,
        house_wallet_id: Option<String>,
    ) -> Self {
        Self {
            backend,
            log,
            fee_bps,
            house_wallet_id,
            locked: Mutex::new(HashSet::new()),
            refunded: Mutex::new(HashSet::new()),
            preflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled(&self) -> bool {
        self.backend.is_some()
    }

    pub fn backend(&self) -> Option<&Arc<dyn EscrowBackend>> {
        self.backend.as_ref()
    }

    pub fn house_wallet_id(&self) -> Option<&str> {
        self.house_wallet_id.as_deref()
    }

    pub fn is_locked(&self, id: &ChallengeId) -> bool {
        self.locked.lock().unwrap().contains(id)
    }

    /// Preflight with a short per-(wallets, amount) cache; concurrent
    /// requests for the same key coalesce onto one runtime call.
    pub async fn preflight(&self, wallets: &[String], amount: u32) -> PreflightResult {
        let Some(backend) = self.backend.clone() else {
            return PreflightResult {
                ok: false,
                reason: Some(REASON_POLICY_DISABLED.to_owned()),
            };
        };

        let mut sorted: Vec<&str> = wallets.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        let key = format!("{}|{amount}", sorted.join(","));

        loop {
            enum Wait {
                Done(PreflightResult),
                Follow(watch::Receiver<Option<PreflightResult>>),
                Lead(watch::Sender<Option<PreflightResult>>),
            }

            let wait = {
                let mut cache = self.preflight.lock().unwrap();
                match cache.get(&key) {
                    Some(PreflightSlot::Ready { at, result }) if at.elapsed() < PREFLIGHT_TTL => {
                        Wait::Done(result.clone())
                    }
                    Some(PreflightSlot::InFlight(rx)) => Wait::Follow(rx.clone()),
                    _ => {
                        let (tx, rx) = watch::channel(None);
                        cache.insert(key.clone(), PreflightSlot::InFlight(rx));
                        Wait::Lead(tx)
                    }
                }
            };

            match wait {
                Wait::Done(result) => return result,
                Wait::Follow(mut rx) => {
                    if rx.changed().await.is_ok() {
                        if let Some(result) = rx.borrow().clone() {
                            return result;
                        }
                    }
                    // The leading request died; clear the stale slot and
                    // try again.
                    let mut cache = self.preflight.lock().unwrap();
                    if matches!(cache.get(&key), Some(PreflightSlot::InFlight(_))) {
                        cache.remove(&key);
                    }
                }
                Wait::Lead(tx) => {
                    let result = run_preflight(backend.as_ref(), wallets, amount).await;
                    self.preflight.lock().unwrap().insert(
                        key,
                        PreflightSlot::Ready {
                            at: Instant::now(),
                            result: result.clone(),
                        },
                    );
                    let _ = tx.send(Some(result.clone()));
                    return result;
                }
            }
        }
    }

    /// Accepted with a stake: preflight then lock. The outcome tells the
    /// caller whether the accept stands or rolls back.
    pub async fn on_accepted(
        &self,
        id: &ChallengeId,
        wager: u32,
        players: &[PlayerId],
        challenger_wallet: Option<&str>,
        opponent_wallet: Option<&str>,
    ) -> EscrowOutcome {
        if wager == 0 {
            return EscrowOutcome::proceed(Vec::new());
        }
        let Some(backend) = self.backend.clone() else {
            let report = EscrowPhaseReport::failed("lock", REASON_POLICY_DISABLED);
            self.append(id, players, &report).await;
            return EscrowOutcome::proceed(vec![report]);
        };

        let (Some(challenger_wallet), Some(opponent_wallet)) =
            (challenger_wallet, opponent_wallet)
        else {
            let report = EscrowPhaseReport::failed("lock", REASON_WALLET_REQUIRED);
            self.append(id, players, &report).await;
            return EscrowOutcome {
                disposition: EscrowDisposition::Abort {
                    reason: REASON_WALLET_REQUIRED.to_owned(),
                },
                reports: vec![report],
            };
        };

        let wallets = vec![challenger_wallet.to_owned(), opponent_wallet.to_owned()];
        let preflight = self.preflight(&wallets, wager).await;
        if !preflight.ok {
            let reason = preflight
                .reason
                .unwrap_or_else(|| REASON_UNKNOWN_PRECHECK.to_owned());
            let report = EscrowPhaseReport::failed("lock", reason.clone());
            self.append(id, players, &report).await;
            let disposition = if reason == REASON_POLICY_DISABLED {
                EscrowDisposition::Proceed
            } else {
                EscrowDisposition::Abort { reason }
            };
            return EscrowOutcome {
                disposition,
                reports: vec![report],
            };
        }

        match backend.lock_stake(id, &wallets, wager).await {
            Ok(response) if response.ok => {
                self.locked.lock().unwrap().insert(id.clone());
                let report = EscrowPhaseReport {
                    phase: "lock",
                    ok: true,
                    reason: None,
                    tx_hash: response.tx_hash,
                    fee: None,
                    payout: None,
                };
                self.append(id, players, &report).await;
                EscrowOutcome::proceed(vec![report])
            }
            Ok(response) => {
                let reason = response
                    .reason
                    .unwrap_or_else(|| REASON_ONCHAIN_ERROR.to_owned());
                let report = EscrowPhaseReport::failed("lock", reason.clone());
                self.append(id, players, &report).await;
                EscrowOutcome {
                    disposition: EscrowDisposition::Abort { reason },
                    reports: vec![report],
                }
            }
            Err(e) => {
                let reason = e.reason_code().to_owned();
                let report = EscrowPhaseReport::failed("lock", reason.clone());
                self.append(id, players, &report).await;
                EscrowOutcome {
                    disposition: EscrowDisposition::Abort { reason },
                    reports: vec![report],
                }
            }
        }
    }

    /// Resolution: pay the winner, or refund on a draw. A resolve failure
    /// immediately compensates with a refund.
    pub async fn on_resolved(
        &self,
        id: &ChallengeId,
        wager: u32,
        players: &[PlayerId],
        winner_wallet: Option<&str>,
    ) -> Vec<EscrowPhaseReport> {
        if wager == 0 {
            return Vec::new();
        }
        let was_locked = self.locked.lock().unwrap().remove(id);
        if !was_locked {
            let report = EscrowPhaseReport::failed("resolve", REASON_NOT_LOCKED);
            self.append(id, players, &report).await;
            return vec![report];
        }
        let Some(backend) = self.backend.clone() else {
            return Vec::new();
        };

        let Some(winner_wallet) = winner_wallet else {
            return self.do_refund(backend.as_ref(), id, players).await;
        };

        match backend.resolve(id, winner_wallet, self.fee_bps).await {
            Ok(response) if response.ok => {
                let report = EscrowPhaseReport {
                    phase: "resolve",
                    ok: true,
                    reason: None,
                    tx_hash: response.tx_hash,
                    fee: response.fee,
                    payout: response.payout,
                };
                self.append(id, players, &report).await;
                vec![report]
            }
            Ok(response) => {
                let reason = response
                    .reason
                    .unwrap_or_else(|| REASON_ONCHAIN_ERROR.to_owned());
                self.fail_and_refund(backend.as_ref(), id, players, reason)
                    .await
            }
            Err(e) => {
                self.fail_and_refund(backend.as_ref(), id, players, e.reason_code().to_owned())
                    .await
            }
        }
    }

    /// Declined or expired after a successful lock: give the stakes back.
    pub async fn on_terminated(
        &self,
        id: &ChallengeId,
        wager: u32,
        players: &[PlayerId],
    ) -> Vec<EscrowPhaseReport> {
        if wager == 0 {
            return Vec::new();
        }
        let was_locked = self.locked.lock().unwrap().remove(id);
        if !was_locked {
            return Vec::new();
        }
        let Some(backend) = self.backend.clone() else {
            return Vec::new();
        };
        self.do_refund(backend.as_ref(), id, players).await
    }

    async fn fail_and_refund(
        &self,
        backend: &dyn EscrowBackend,
        id: &ChallengeId,
        players: &[PlayerId],
        reason: String,
    ) -> Vec<EscrowPhaseReport> {
        let report = EscrowPhaseReport::failed("resolve", reason);
        self.append(id, players, &report).await;
        let mut reports = vec![report];
        reports.extend(self.do_refund(backend, id, players).await);
        reports
    }

    async fn do_refund(
        &self,
        backend: &dyn EscrowBackend,
        id: &ChallengeId,
        players: &[PlayerId],
    ) -> Vec<EscrowPhaseReport> {
        // The runtime is idempotent by challenge id; this guard just keeps
        // duplicate frames out of the stream.
        if !self.refunded.lock().unwrap().insert(id.clone()) {
            return Vec::new();
        }
        let report = match backend.refund(id).await {
            Ok(response) if response.ok => EscrowPhaseReport {
                phase: "refund",
                ok: true,
                reason: None,
                tx_hash: response.tx_hash,
                fee: None,
                payout: None,
            },
            Ok(response) => EscrowPhaseReport::failed(
                "refund",
                response
                    .reason
                    .unwrap_or_else(|| REASON_ONCHAIN_ERROR.to_owned()),
            ),
            Err(e) => EscrowPhaseReport::failed("refund", e.reason_code()),
        };
        self.append(id, players, &report).await;
        vec![report]
    }

    async fn append(&self, id: &ChallengeId, players: &[PlayerId], report: &EscrowPhaseReport) {
        let record = EscrowEventRecord {
            challenge_id: id.clone(),
            phase: report.phase.to_owned(),
            ok: report.ok,
            reason: report.reason.clone(),
            tx_hash: report.tx_hash.clone(),
            fee: report.fee,
            payout: report.payout,
            players: players.to_vec(),
            at: now_ms(),
        };
        if let Err(e) = self.log.append(&record).await {
            log::warn!("escrow event append failed: {e}");
        }
    }
}

async fn run_preflight(
    backend: &dyn EscrowBackend,
    wallets: &[String],
    amount: u32,
) -> PreflightResult {
    match backend.preflight(wallets, amount).await {
        Ok(response) if response.ok => PreflightResult {
            ok: true,
            reason: None,
        },
        Ok(response) => {
            let reason = response
                .reason
                .or_else(|| {
                    response
                        .results
                        .as_ref()
                        .and_then(|rs| rs.iter().find(|r| !r.ok))
                        .and_then(|r| r.reason.clone())
                })
                .unwrap_or_else(|| REASON_UNKNOWN_PRECHECK.to_owned());
            PreflightResult {
                ok: false,
                reason: Some(reason),
            }
        }
        Err(e) => PreflightResult {
            ok: false,
            reason: Some(e.reason_code().to_owned()),
        },
    }
}

#[cfg(test)]
mod tests;
