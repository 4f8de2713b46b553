use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arena_shared::{ChallengeId, PlayerId};
use arena_store::{memory, EscrowLog};
use async_trait::async_trait;

use crate::runtime::{EscrowBackend, RuntimeError, RuntimeResponse};
use crate::{EscrowDisposition, EscrowOrchestrator, REASON_NOT_LOCKED, REASON_WALLET_REQUIRED};

#[derive(Default)]
struct Calls {
    preflight: AtomicU32,
    lock: AtomicU32,
    resolve: AtomicU32,
    refund: AtomicU32,
}

/// Scripted runtime: each phase either succeeds with a canned tx hash or
/// fails with the configured reason.
#[derive(Default)]
struct ScriptedBackend {
    calls: Calls,
    preflight_reason: Option<String>,
    lock_reason: Option<String>,
    resolve_reason: Option<String>,
    refund_fails: bool,
    preflight_delay: Option<Duration>,
}

impl ScriptedBackend {
    fn ok_response(tx: &str) -> RuntimeResponse {
        RuntimeResponse {
            ok: true,
            tx_hash: Some(tx.to_owned()),
            fee: Some(0.1),
            payout: Some(3.9),
            ..RuntimeResponse::default()
        }
    }

    fn fail_response(reason: &str) -> RuntimeResponse {
        RuntimeResponse {
            ok: false,
            reason: Some(reason.to_owned()),
            ..RuntimeResponse::default()
        }
    }
}

#[async_trait]
impl EscrowBackend for ScriptedBackend {
    async fn preflight(&self, _: &[String], _: u32) -> Result<RuntimeResponse, RuntimeError> {
        self.calls.preflight.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.preflight_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(match &self.preflight_reason {
            Some(reason) => Self::fail_response(reason),
            None => Self::ok_response("0xpf"),
        })
    }

    async fn lock_stake(
        &self,
        _: &ChallengeId,
        _: &[String],
        _: u32,
    ) -> Result<RuntimeResponse, RuntimeError> {
        self.calls.lock.fetch_add(1, Ordering::SeqCst);
        Ok(match &self.lock_reason {
            Some(reason) => Self::fail_response(reason),
            None => Self::ok_response("0xlock"),
        })
    }

    async fn resolve(
        &self,
        _: &ChallengeId,
        _: &str,
        _: u32,
    ) -> Result<RuntimeResponse, RuntimeError> {
        self.calls.resolve.fetch_add(1, Ordering::SeqCst);
        Ok(match &self.resolve_reason {
            Some(reason) => Self::fail_response(reason),
            None => Self::ok_response("0xresolve"),
        })
    }

    async fn refund(&self, _: &ChallengeId) -> Result<RuntimeResponse, RuntimeError> {
        self.calls.refund.fetch_add(1, Ordering::SeqCst);
        Ok(if self.refund_fails {
            Self::fail_response("BET_NOT_LOCKED")
        } else {
            Self::ok_response("0xrefund")
        })
    }

    async fn wallets(&self) -> Result<RuntimeResponse, RuntimeError> {
        Ok(RuntimeResponse::default())
    }

    async fn house_status(&self) -> Result<RuntimeResponse, RuntimeError> {
        Ok(RuntimeResponse::default())
    }
}

fn orchestrator(backend: Arc<ScriptedBackend>) -> (EscrowOrchestrator, EscrowLog) {
    let kv = memory();
    (
        EscrowOrchestrator::new(
            Some(backend as Arc<dyn EscrowBackend>),
            EscrowLog::new(kv.clone()),
            250,
            Some("0xhouse".to_owned()),
        ),
        EscrowLog::new(kv),
    )
}

fn cid(s: &str) -> ChallengeId {
    ChallengeId::new(s)
}

fn players() -> Vec<PlayerId> {
    vec![PlayerId::new("u_a"), PlayerId::new("u_b")]
}

#[tokio::test]
async fn zero_wager_skips_escrow_entirely() {
    let backend = Arc::new(ScriptedBackend::default());
    let (orch, _) = orchestrator(backend.clone());
    let outcome = orch
        .on_accepted(&cid("c_1"), 0, &players(), Some("wa"), Some("wb"))
        .await;
    assert_eq!(outcome.disposition, EscrowDisposition::Proceed);
    assert!(outcome.reports.is_empty());
    assert_eq!(backend.calls.preflight.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn lock_then_resolve_happy_path() {
    let backend = Arc::new(ScriptedBackend::default());
    let (orch, log) = orchestrator(backend.clone());
    let id = cid("c_1");

    let outcome = orch
        .on_accepted(&id, 4, &players(), Some("wa"), Some("wb"))
        .await;
    assert_eq!(outcome.disposition, EscrowDisposition::Proceed);
    assert_eq!(outcome.reports.len(), 1);
    assert!(outcome.reports[0].ok);
    assert_eq!(outcome.reports[0].phase, "lock");
    assert_eq!(outcome.reports[0].tx_hash.as_deref(), Some("0xlock"));
    assert!(orch.is_locked(&id));

    let reports = orch.on_resolved(&id, 4, &players(), Some("wa")).await;
    assert_eq!(reports.len(), 1);
    assert!(reports[0].ok);
    assert_eq!(reports[0].phase, "resolve");
    assert_eq!(reports[0].payout, Some(3.9));
    assert!(!orch.is_locked(&id));

    // The ring holds the lock before the resolve, newest first.
    let events = log.recent(10).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].phase, "resolve");
    assert_eq!(events[1].phase, "lock");
    assert!(events.iter().all(|e| e.ok));
}

#[tokio::test]
async fn missing_wallet_aborts() {
    let backend = Arc::new(ScriptedBackend::default());
    let (orch, _) = orchestrator(backend.clone());
    let outcome = orch
        .on_accepted(&cid("c_1"), 4, &players(), Some("wa"), None)
        .await;
    assert_eq!(
        outcome.disposition,
        EscrowDisposition::Abort {
            reason: REASON_WALLET_REQUIRED.to_owned()
        }
    );
    assert_eq!(backend.calls.preflight.load(Ordering::SeqCst), 0);
    assert_eq!(backend.calls.lock.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn disabled_escrow_passes_the_event_through() {
    let orch = EscrowOrchestrator::new(None, EscrowLog::new(memory()), 250, None);
    let outcome = orch
        .on_accepted(&cid("c_1"), 4, &players(), Some("wa"), Some("wb"))
        .await;
    assert_eq!(outcome.disposition, EscrowDisposition::Proceed);
    assert_eq!(
        outcome.reports[0].reason.as_deref(),
        Some("wallet_policy_disabled")
    );
}

#[tokio::test]
async fn preflight_failure_aborts_before_lock() {
    let backend = Arc::new(ScriptedBackend {
        preflight_reason: Some("PLAYER_ALLOWANCE_LOW".to_owned()),
        ..ScriptedBackend::default()
    });
    let (orch, _) = orchestrator(backend.clone());
    let outcome = orch
        .on_accepted(&cid("c_1"), 4, &players(), Some("wa"), Some("wb"))
        .await;
    assert_eq!(
        outcome.disposition,
        EscrowDisposition::Abort {
            reason: "PLAYER_ALLOWANCE_LOW".to_owned()
        }
    );
    assert_eq!(backend.calls.lock.load(Ordering::SeqCst), 0);
    assert!(!orch.is_locked(&cid("c_1")));
}

#[tokio::test]
async fn resolve_failure_compensates_with_refund() {
    let backend = Arc::new(ScriptedBackend {
        resolve_reason: Some("WINNER_NOT_PARTICIPANT".to_owned()),
        ..ScriptedBackend::default()
    });
    let (orch, log) = orchestrator(backend.clone());
    let id = cid("c_1");

    orch.on_accepted(&id, 4, &players(), Some("wa"), Some("wb"))
        .await;
    let reports = orch.on_resolved(&id, 4, &players(), Some("wa")).await;

    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].phase, "resolve");
    assert!(!reports[0].ok);
    assert_eq!(reports[1].phase, "refund");
    assert!(reports[1].ok);
    assert_eq!(backend.calls.refund.load(Ordering::SeqCst), 1);

    let events = log.recent(10).await.unwrap();
    let phases: Vec<&str> = events.iter().map(|e| e.phase.as_str()).collect();
    assert_eq!(phases, vec!["refund", "resolve", "lock"]);
}

#[tokio::test]
async fn draw_resolution_refunds() {
    let backend = Arc::new(ScriptedBackend::default());
    let (orch, _) = orchestrator(backend.clone());
    let id = cid("c_1");

    orch.on_accepted(&id, 4, &players(), Some("wa"), Some("wb"))
        .await;
    let reports = orch.on_resolved(&id, 4, &players(), None).await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].phase, "refund");
    assert!(reports[0].ok);
    assert_eq!(backend.calls.resolve.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn resolve_without_lock_reports_and_passes() {
    let backend = Arc::new(ScriptedBackend::default());
    let (orch, _) = orchestrator(backend.clone());
    let reports = orch
        .on_resolved(&cid("c_1"), 4, &players(), Some("wa"))
        .await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].reason.as_deref(), Some(REASON_NOT_LOCKED));
    assert_eq!(backend.calls.resolve.load(Ordering::SeqCst), 0);
    assert_eq!(backend.calls.refund.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn termination_refunds_once() {
    let backend = Arc::new(ScriptedBackend::default());
    let (orch, _) = orchestrator(backend.clone());
    let id = cid("c_1");

    orch.on_accepted(&id, 4, &players(), Some("wa"), Some("wb"))
        .await;
    let reports = orch.on_terminated(&id, 4, &players()).await;
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].phase, "refund");

    // Termination is idempotent; no second refund frame.
    assert!(orch.on_terminated(&id, 4, &players()).await.is_empty());
    assert_eq!(backend.calls.refund.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn termination_without_lock_is_silent() {
    let backend = Arc::new(ScriptedBackend::default());
    let (orch, _) = orchestrator(backend.clone());
    assert!(orch.on_terminated(&cid("c_1"), 4, &players()).await.is_empty());
    assert_eq!(backend.calls.refund.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn preflight_results_are_cached_briefly() {
    let backend = Arc::new(ScriptedBackend::default());
    let (orch, _) = orchestrator(backend.clone());
    let wallets = vec!["wa".to_owned(), "wb".to_owned()];

    orch.preflight(&wallets, 4).await;
    orch.preflight(&wallets, 4).await;
    // Same key regardless of wallet ordering.
    orch.preflight(&["wb".to_owned(), "wa".to_owned()], 4).await;
    assert_eq!(backend.calls.preflight.load(Ordering::SeqCst), 1);

    // A different amount is a different key.
    orch.preflight(&wallets, 5).await;
    assert_eq!(backend.calls.preflight.load(Ordering::SeqCst), 2);

    tokio::time::sleep(Duration::from_secs(3)).await;
    orch.preflight(&wallets, 4).await;
    assert_eq!(backend.calls.preflight.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn concurrent_preflights_coalesce() {
    let backend = Arc::new(ScriptedBackend {
        preflight_delay: Some(Duration::from_millis(200)),
        ..ScriptedBackend::default()
    });
    let orch = Arc::new(
        EscrowOrchestrator::new(
            Some(backend.clone() as Arc<dyn EscrowBackend>),
            EscrowLog::new(memory()),
            250,
            None,
        ),
    );

    let wallets = vec!["wa".to_owned(), "wb".to_owned()];
    let a = tokio::spawn({
        let orch = orch.clone();
        let wallets = wallets.clone();
        async move { orch.preflight(&wallets, 4).await }
    });
    let b = tokio::spawn({
        let orch = orch.clone();
        let wallets = wallets.clone();
        async move { orch.preflight(&wallets, 4).await }
    });

    let (ra, rb) = (a.await.unwrap(), b.await.unwrap());
    assert!(ra.ok && rb.ok);
    assert_eq!(backend.calls.preflight.load(Ordering::SeqCst), 1);
}
