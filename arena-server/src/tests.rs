use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arena_escrow::{EscrowBackend, RuntimeError, RuntimeResponse};
use arena_shared::{fair, ChallengeId, PlayerId, Role};
use arena_store::{memory, LockOutcome};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use crate::config::AuthMode;
use crate::game::GameCommand;
use crate::sessions::{InputSlot, Outbound, SessionMeta};
use crate::{ArenaNode, Config};

const WAIT: Duration = Duration::from_secs(60);

fn test_config(instance: &str) -> Config {
    Config {
        port: 0,
        server_instance_id: instance.to_owned(),
        redis_url: None,
        presence_ttl_seconds: 3,
        proximity_threshold: 12.0,
        station_proximity: 4.0,
        pending_timeout_ms: 30_000,
        orphan_grace_ms: 0,
        agent_human_cooldown_ms: 20_000,
        auth_mode: AuthMode::Open,
        internal_service_token: Some("internal".to_owned()),
        agent_runtime_url: None,
        escrow_execution_mode: "simulated".to_owned(),
        escrow_fee_bps: 250,
        house_wallet_id: Some("0xhouse".to_owned()),
        dice_duel_enabled: true,
        agent_locomotion_enabled: true,
        station_router_enabled: true,
    }
}

#[derive(Default)]
struct ScriptedBackend {
    preflight_reason: Option<String>,
    lock_calls: AtomicU32,
    resolve_calls: AtomicU32,
    refund_calls: AtomicU32,
}

impl ScriptedBackend {
    fn ok(tx: &str) -> RuntimeResponse {
        RuntimeResponse {
            ok: true,
            tx_hash: Some(tx.to_owned()),
            payout: Some(3.8),
            fee: Some(0.2),
            ..RuntimeResponse::default()
        }
    }
}

#[async_trait]
impl EscrowBackend for ScriptedBackend {
    async fn preflight(&self, _: &[String], _: u32) -> Result<RuntimeResponse, RuntimeError> {
        Ok(match &self.preflight_reason {
            Some(reason) => RuntimeResponse {
                ok: false,
                reason: Some(reason.clone()),
                ..RuntimeResponse::default()
            },
            None => Self::ok("0xpf"),
        })
    }

    async fn lock_stake(
        &self,
        _: &ChallengeId,
        _: &[String],
        _: u32,
    ) -> Result<RuntimeResponse, RuntimeError> {
        self.lock_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Self::ok("0xlock"))
    }

    async fn resolve(
        &self,
        _: &ChallengeId,
        _: &str,
        _: u32,
    ) -> Result<RuntimeResponse, RuntimeError> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Self::ok("0xresolve"))
    }

    async fn refund(&self, _: &ChallengeId) -> Result<RuntimeResponse, RuntimeError> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Self::ok("0xrefund"))
    }

    async fn wallets(&self) -> Result<RuntimeResponse, RuntimeError> {
        Ok(RuntimeResponse::default())
    }

    async fn house_status(&self) -> Result<RuntimeResponse, RuntimeError> {
        Ok(Self::ok("0xhouse"))
    }
}

struct TestClient {
    player_id: PlayerId,
    rx: mpsc::UnboundedReceiver<Outbound>,
    #[allow(dead_code)]
    input: Arc<InputSlot>,
    epoch: u64,
}

async fn connect(
    node: &ArenaNode,
    id: &str,
    role: Role,
    wallet: Option<&str>,
    position: (f32, f32),
) -> TestClient {
    let player_id = PlayerId::new(id);
    let meta = SessionMeta {
        role,
        display_name: id.to_owned(),
        wallet_id: wallet.map(str::to_owned),
    };
    let lease = node.state.registry.register(player_id.clone(), meta.clone());
    node.state
        .game_tx
        .send(GameCommand::Join {
            player_id: player_id.clone(),
            meta,
            input: lease.input.clone(),
            preferred: Some(position),
            spawn_section: None,
        })
        .await
        .unwrap();
    TestClient {
        player_id,
        rx: lease.outbound,
        input: lease.input,
        epoch: lease.epoch,
    }
}

async fn disconnect(node: &ArenaNode, client: &TestClient) {
    if node.state.registry.remove(&client.player_id, client.epoch) {
        node.state
            .game_tx
            .send(GameCommand::Leave {
                player_id: client.player_id.clone(),
            })
            .await
            .unwrap();
    }
}

async fn expect_frame(client: &mut TestClient, pred: impl Fn(&Value) -> bool) -> Value {
    timeout(WAIT, async {
        loop {
            match client.rx.recv().await {
                Some(Outbound::Frame(json)) => {
                    let value: Value = serde_json::from_str(&json).unwrap();
                    if pred(&value) {
                        return value;
                    }
                }
                Some(Outbound::Close { .. }) => panic!("unexpected close"),
                None => panic!("session channel closed"),
            }
        }
    })
    .await
    .expect("expected frame did not arrive")
}

fn is_challenge(v: &Value, event: &str) -> bool {
    v["type"] == "challenge" && v["event"] == event
}

fn is_escrow(v: &Value, phase: &str, ok: bool) -> bool {
    v["type"] == "challenge_escrow" && v["phase"] == phase && v["ok"] == ok
}

async fn send(node: &ArenaNode, command: GameCommand) {
    node.state.game_tx.send(command).await.unwrap();
}

/// E1: proximity enter, rps round with a wager, lock then resolve.
#[tokio::test(start_paused = true)]
async fn full_wagered_rps_round_between_neighbors() {
    let backend = Arc::new(ScriptedBackend::default());
    let node = ArenaNode::spawn_with_escrow(
        test_config("n1"),
        memory(),
        Some(backend.clone() as Arc<dyn EscrowBackend>),
    )
    .unwrap();

    let mut a = connect(&node, "u_a", Role::Human, Some("0xa"), (60.0, 0.0)).await;
    let mut b = connect(&node, "u_b", Role::Human, Some("0xb"), (64.0, 0.0)).await;

    let enter = expect_frame(&mut a, |v| v["type"] == "proximity" && v["event"] == "enter").await;
    assert_eq!(enter["otherId"], "u_b");
    assert!(enter["distance"].as_f64().unwrap() <= 12.0);
    expect_frame(&mut b, |v| v["type"] == "proximity" && v["event"] == "enter").await;

    send(
        &node,
        GameCommand::ChallengeSend {
            actor: a.player_id.clone(),
            target: b.player_id.clone(),
            game_type: "rps".to_owned(),
            wager: 2,
        },
    )
    .await;
    let created = expect_frame(&mut b, |v| is_challenge(v, "created")).await;
    let challenge_id = ChallengeId::new(created["challenge"]["id"].as_str().unwrap());

    send(
        &node,
        GameCommand::ChallengeResponse {
            actor: b.player_id.clone(),
            challenge_id: challenge_id.clone(),
            accept: true,
        },
    )
    .await;
    expect_frame(&mut a, |v| is_escrow(v, "lock", true)).await;
    expect_frame(&mut a, |v| is_challenge(v, "accepted")).await;

    send(
        &node,
        GameCommand::ChallengeMove {
            actor: a.player_id.clone(),
            challenge_id: challenge_id.clone(),
            mv: "rock".to_owned(),
        },
    )
    .await;
    send(
        &node,
        GameCommand::ChallengeMove {
            actor: b.player_id.clone(),
            challenge_id: challenge_id.clone(),
            mv: "scissors".to_owned(),
        },
    )
    .await;

    let resolve = expect_frame(&mut a, |v| is_escrow(v, "resolve", true)).await;
    assert_eq!(resolve["txHash"], "0xresolve");
    let resolved = expect_frame(&mut a, |v| is_challenge(v, "resolved")).await;
    assert_eq!(resolved["challenge"]["winnerId"], "u_a");
    let resolved_b = expect_frame(&mut b, |v| is_challenge(v, "resolved")).await;
    assert_eq!(resolved_b["challenge"]["winnerId"], "u_a");

    assert_eq!(backend.lock_calls.load(Ordering::SeqCst), 1);
    assert_eq!(backend.resolve_calls.load(Ordering::SeqCst), 1);
    assert_eq!(backend.refund_calls.load(Ordering::SeqCst), 0);
}

/// E2: the challenger disconnects before a response; the pending challenge
/// expires with player_disconnected and escrow is never touched.
#[tokio::test(start_paused = true)]
async fn disconnect_expires_pending_without_escrow() {
    let backend = Arc::new(ScriptedBackend::default());
    let node = ArenaNode::spawn_with_escrow(
        test_config("n1"),
        memory(),
        Some(backend.clone() as Arc<dyn EscrowBackend>),
    )
    .unwrap();

    let mut a = connect(&node, "u_a", Role::Human, Some("0xa"), (60.0, 0.0)).await;
    let mut b = connect(&node, "u_b", Role::Human, Some("0xb"), (64.0, 0.0)).await;
    expect_frame(&mut a, |v| v["type"] == "proximity").await;

    send(
        &node,
        GameCommand::ChallengeSend {
            actor: a.player_id.clone(),
            target: b.player_id.clone(),
            game_type: "coinflip".to_owned(),
            wager: 5,
        },
    )
    .await;
    expect_frame(&mut b, |v| is_challenge(v, "created")).await;

    disconnect(&node, &a).await;

    let expired = expect_frame(&mut b, |v| is_challenge(v, "expired")).await;
    assert_eq!(expired["reason"], "player_disconnected");
    assert_eq!(backend.lock_calls.load(Ordering::SeqCst), 0);
}

/// E3: dealer coinflip commit/reveal is recomputable from the reveal.
#[tokio::test(start_paused = true)]
async fn dealer_coinflip_is_provably_fair() {
    let backend = Arc::new(ScriptedBackend::default());
    let node = ArenaNode::spawn_with_escrow(
        test_config("n1"),
        memory(),
        Some(backend.clone() as Arc<dyn EscrowBackend>),
    )
    .unwrap();

    let a = connect(&node, "u_a", Role::Human, Some("0xa"), (20.0, 20.0)).await;
    // Let a tick publish the position the station router checks.
    sleep(Duration::from_millis(200)).await;

    let frames = node
        .state
        .stations
        .interact(&a.player_id, "dealer_coinflip_1", "start", Some(3), None, None)
        .await;
    let ready: Value = serde_json::from_str(&frames[0].to_json()).unwrap();
    assert_eq!(ready["view"]["state"], "dealer_ready");
    let commit = ready["view"]["commitHash"].as_str().unwrap().to_owned();

    let frames = node
        .state
        .stations
        .interact(
            &a.player_id,
            "dealer_coinflip_1",
            "pick",
            None,
            Some("heads".to_owned()),
            Some("seed1".to_owned()),
        )
        .await;
    let frames: Vec<Value> = frames
        .iter()
        .map(|f| serde_json::from_str(&f.to_json()).unwrap())
        .collect();

    let reveal = frames
        .iter()
        .find(|v| v["type"] == "provably_fair" && v["phase"] == "reveal")
        .expect("reveal frame");
    let house_seed = reveal["houseSeed"].as_str().unwrap();
    assert!(fair::verify_commit(house_seed, &commit));

    let ui = frames
        .iter()
        .find(|v| v["view"]["state"] == "dealer_reveal")
        .expect("dealer reveal");
    let challenge_id = ChallengeId::new(ui["view"]["challengeId"].as_str().unwrap());
    let expected = fair::coinflip_outcome(house_seed, "seed1", &challenge_id);
    assert_eq!(ui["view"]["result"], expected.as_str());

    let winner = ui["view"]["winnerId"].as_str();
    if winner == Some("u_a") {
        assert_eq!(expected.as_str(), "heads");
    } else {
        assert_eq!(winner, Some("system_house"));
        assert_eq!(expected.as_str(), "tails");
    }
    assert_eq!(backend.lock_calls.load(Ordering::SeqCst), 1);
    assert_eq!(backend.resolve_calls.load(Ordering::SeqCst), 1);
}

/// E4/E6: two nodes over one shared store. The response to a remotely-owned
/// challenge is forwarded to the owner; when the owner dies, any survivor
/// sweeps the orphan.
#[tokio::test(start_paused = true)]
async fn cross_node_forwarding_and_orphan_sweep() {
    let kv = memory();
    let node1 = ArenaNode::spawn_with_escrow(test_config("n1"), kv.clone(), None).unwrap();
    let node2 = ArenaNode::spawn_with_escrow(test_config("n2"), kv.clone(), None).unwrap();

    let mut a = connect(&node1, "u_a", Role::Human, None, (60.0, 0.0)).await;
    let mut b = connect(&node2, "u_b", Role::Human, None, (64.0, 0.0)).await;

    // Presence has to propagate before the nodes see each other.
    expect_frame(&mut a, |v| v["type"] == "proximity" && v["event"] == "enter").await;
    expect_frame(&mut b, |v| v["type"] == "proximity" && v["event"] == "enter").await;

    send(
        &node1,
        GameCommand::ChallengeSend {
            actor: a.player_id.clone(),
            target: b.player_id.clone(),
            game_type: "rps".to_owned(),
            wager: 0,
        },
    )
    .await;
    // B is remote to n1; the created frame arrives over the bus.
    let created = expect_frame(&mut b, |v| is_challenge(v, "created")).await;
    let challenge_id = ChallengeId::new(created["challenge"]["id"].as_str().unwrap());

    // B responds on its own node, which does not own the challenge.
    send(
        &node2,
        GameCommand::ChallengeResponse {
            actor: b.player_id.clone(),
            challenge_id: challenge_id.clone(),
            accept: true,
        },
    )
    .await;
    let accepted = expect_frame(&mut b, |v| is_challenge(v, "accepted")).await;
    assert_eq!(accepted["challenge"]["status"], "active");
    expect_frame(&mut a, |v| is_challenge(v, "accepted")).await;

    // Owner node dies mid-game; the survivor expires the orphan.
    drop(node1);
    drop(a);
    let expired = expect_frame(&mut b, |v| is_challenge(v, "expired")).await;
    assert_eq!(expired["reason"], "owner_failover_expired");

    // The orphan's player locks are free again.
    let outcome = node2
        .state
        .challenge_store
        .try_lock_players(
            &ChallengeId::new("c_probe_1"),
            &[b.player_id.clone()],
            60_000,
        )
        .await
        .unwrap();
    assert_eq!(outcome, LockOutcome::Acquired);
}

/// E5: a failed preflight declines the challenge and releases the locks.
#[tokio::test(start_paused = true)]
async fn preflight_failure_declines_and_unlocks() {
    let backend = Arc::new(ScriptedBackend {
        preflight_reason: Some("PLAYER_ALLOWANCE_LOW".to_owned()),
        ..ScriptedBackend::default()
    });
    let node = ArenaNode::spawn_with_escrow(
        test_config("n1"),
        memory(),
        Some(backend.clone() as Arc<dyn EscrowBackend>),
    )
    .unwrap();

    let mut a = connect(&node, "u_a", Role::Human, Some("0xa"), (60.0, 0.0)).await;
    let mut b = connect(&node, "u_b", Role::Human, Some("0xb"), (64.0, 0.0)).await;
    expect_frame(&mut a, |v| v["type"] == "proximity").await;

    send(
        &node,
        GameCommand::ChallengeSend {
            actor: a.player_id.clone(),
            target: b.player_id.clone(),
            game_type: "rps".to_owned(),
            wager: 4,
        },
    )
    .await;
    let created = expect_frame(&mut b, |v| is_challenge(v, "created")).await;
    let challenge_id = ChallengeId::new(created["challenge"]["id"].as_str().unwrap());

    send(
        &node,
        GameCommand::ChallengeResponse {
            actor: b.player_id.clone(),
            challenge_id,
            accept: true,
        },
    )
    .await;

    let lock_fail = expect_frame(&mut a, |v| is_escrow(v, "lock", false)).await;
    assert_eq!(lock_fail["reason"], "PLAYER_ALLOWANCE_LOW");
    let declined = expect_frame(&mut a, |v| is_challenge(v, "declined")).await;
    assert_eq!(declined["reason"], "PLAYER_ALLOWANCE_LOW");
    assert_eq!(backend.lock_calls.load(Ordering::SeqCst), 0);

    // Locks released: the pair can match again immediately.
    send(
        &node,
        GameCommand::ChallengeSend {
            actor: a.player_id.clone(),
            target: b.player_id.clone(),
            game_type: "rps".to_owned(),
            wager: 0,
        },
    )
    .await;
    expect_frame(&mut b, |v| is_challenge(v, "created")).await;
}

#[tokio::test(start_paused = true)]
async fn challenge_guards_reject_missing_and_far_targets() {
    let node = ArenaNode::spawn_with_escrow(test_config("n1"), memory(), None).unwrap();
    let mut a = connect(&node, "u_a", Role::Human, None, (60.0, 0.0)).await;
    let _b = connect(&node, "u_b", Role::Human, None, (-60.0, 0.0)).await;
    sleep(Duration::from_millis(200)).await;

    send(
        &node,
        GameCommand::ChallengeSend {
            actor: a.player_id.clone(),
            target: PlayerId::new("u_ghost"),
            game_type: "rps".to_owned(),
            wager: 0,
        },
    )
    .await;
    let err = expect_frame(&mut a, |v| is_challenge(v, "error")).await;
    assert_eq!(err["reason"], "target_not_found");

    send(
        &node,
        GameCommand::ChallengeSend {
            actor: a.player_id.clone(),
            target: PlayerId::new("u_b"),
            game_type: "rps".to_owned(),
            wager: 0,
        },
    )
    .await;
    let err = expect_frame(&mut a, |v| is_challenge(v, "error")).await;
    assert_eq!(err["reason"], "target_not_nearby");
}

#[tokio::test(start_paused = true)]
async fn agent_to_human_challenges_cool_down() {
    let node = ArenaNode::spawn_with_escrow(test_config("n1"), memory(), None).unwrap();
    let mut agent = connect(&node, "agent_7", Role::Agent, None, (60.0, 0.0)).await;
    let mut human = connect(&node, "u_b", Role::Human, None, (64.0, 0.0)).await;
    expect_frame(&mut agent, |v| v["type"] == "proximity").await;

    send(
        &node,
        GameCommand::ChallengeSend {
            actor: agent.player_id.clone(),
            target: human.player_id.clone(),
            game_type: "rps".to_owned(),
            wager: 0,
        },
    )
    .await;
    let created = expect_frame(&mut human, |v| is_challenge(v, "created")).await;
    let challenge_id = ChallengeId::new(created["challenge"]["id"].as_str().unwrap());

    // Clear the pending lock, then retry inside the cooldown window.
    send(
        &node,
        GameCommand::ChallengeResponse {
            actor: human.player_id.clone(),
            challenge_id,
            accept: false,
        },
    )
    .await;
    expect_frame(&mut agent, |v| is_challenge(v, "declined")).await;

    send(
        &node,
        GameCommand::ChallengeSend {
            actor: agent.player_id.clone(),
            target: human.player_id.clone(),
            game_type: "rps".to_owned(),
            wager: 0,
        },
    )
    .await;
    let err = expect_frame(&mut agent, |v| is_challenge(v, "error")).await;
    assert_eq!(err["reason"], "human_challenge_cooldown");
}

#[tokio::test(start_paused = true)]
async fn snapshots_are_monotonic_and_merged() {
    let node = ArenaNode::spawn_with_escrow(test_config("n1"), memory(), None).unwrap();
    let mut a = connect(&node, "u_a", Role::Human, None, (0.0, 10.0)).await;

    let first = expect_frame(&mut a, |v| v["type"] == "snapshot").await;
    let second = expect_frame(&mut a, |v| v["type"] == "snapshot").await;
    assert!(second["tick"].as_u64() > first["tick"].as_u64());
    let players = second["players"].as_array().unwrap();
    assert!(players.iter().any(|p| p["id"] == "u_a"));
    assert!(second["stations"].as_array().is_some_and(|s| !s.is_empty()));
}

/// Full transport pass: upgrade, welcome, snapshots, and replacement with
/// close code 4000 on reconnect.
#[tokio::test(flavor = "multi_thread")]
async fn websocket_sessions_replace_on_reconnect() {
    use futures::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    let node = ArenaNode::spawn_with_escrow(test_config("ws1"), memory(), None).unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = node.router.clone();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let url = format!("ws://{addr}/ws?role=human&clientId=alice&name=Alice");
    let (mut first, _) = timeout(WAIT, tokio_tungstenite::connect_async(url.as_str()))
        .await
        .unwrap()
        .unwrap();

    let welcome = timeout(WAIT, async {
        loop {
            match first.next().await {
                Some(Ok(Message::Text(text))) => {
                    let v: Value = serde_json::from_str(&text).unwrap();
                    if v["type"] == "welcome" {
                        return v;
                    }
                }
                Some(Ok(_)) => {}
                other => panic!("socket ended early: {other:?}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(welcome["playerId"], "u_alice");
    assert_eq!(welcome["role"], "human");

    // Movement input flows into the authoritative snapshot.
    first
        .send(Message::Text(
            r#"{"type":"input","moveX":1.0,"moveZ":0.0}"#.to_owned(),
        ))
        .await
        .unwrap();
    timeout(WAIT, async {
        loop {
            if let Some(Ok(Message::Text(text))) = first.next().await {
                let v: Value = serde_json::from_str(&text).unwrap();
                if v["type"] == "snapshot"
                    && v["players"]
                        .as_array()
                        .is_some_and(|ps| ps.iter().any(|p| {
                            p["id"] == "u_alice" && p["speed"].as_f64().unwrap_or(0.0) > 0.0
                        }))
                {
                    return;
                }
            }
        }
    })
    .await
    .unwrap();

    // A reconnect with the same clientId closes the old socket with 4000.
    let (mut second, _) = timeout(WAIT, tokio_tungstenite::connect_async(url.as_str()))
        .await
        .unwrap()
        .unwrap();
    timeout(WAIT, async {
        loop {
            match first.next().await {
                Some(Ok(Message::Close(Some(frame)))) => {
                    assert_eq!(u16::from(frame.code), 4000);
                    assert_eq!(frame.reason, "replaced_by_reconnect");
                    return;
                }
                Some(Ok(_)) => {}
                Some(Err(_)) | None => panic!("old socket ended without a close frame"),
            }
        }
    })
    .await
    .unwrap();

    let welcome2 = timeout(WAIT, async {
        loop {
            if let Some(Ok(Message::Text(text))) = second.next().await {
                let v: Value = serde_json::from_str(&text).unwrap();
                if v["type"] == "welcome" {
                    return v;
                }
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(welcome2["playerId"], "u_alice");
}
