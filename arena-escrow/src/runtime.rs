//! HTTP client for the agent runtime's escrow surface. Every call is
//! JSON-in/JSON-out with a hard deadline; the shared internal token rides
//! on a header when configured.

use std::time::Duration;

use arena_shared::ChallengeId;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

const REQUEST_DEADLINE: Duration = Duration::from_secs(10);
const INTERNAL_TOKEN_HEADER: &str = "x-internal-token";

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeResponse {
    pub ok: bool,
    pub reason: Option<String>,
    pub tx_hash: Option<String>,
    pub fee: Option<f64>,
    pub payout: Option<f64>,
    pub results: Option<Vec<WalletStatus>>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct WalletStatus {
    pub wallet_id: String,
    pub ok: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime transport: {0}")]
    Transport(String),
    #[error("runtime rejected the internal token")]
    Auth,
}

impl RuntimeError {
    pub fn reason_code(&self) -> &'static str {
        match self {
            RuntimeError::Transport(_) => "INTERNAL_TRANSPORT_ERROR",
            RuntimeError::Auth => "INTERNAL_AUTH_FAILED",
        }
    }
}

/// The seam the orchestrator calls through; tests substitute a scripted
/// backend the way the connection layer substitutes a fake socket.
#[async_trait]
pub trait EscrowBackend: Send + Sync {
    async fn preflight(
        &self,
        wallets: &[String],
        amount: u32,
    ) -> Result<RuntimeResponse, RuntimeError>;
    async fn lock_stake(
        &self,
        id: &ChallengeId,
        wallets: &[String],
        amount: u32,
    ) -> Result<RuntimeResponse, RuntimeError>;
    async fn resolve(
        &self,
        id: &ChallengeId,
        winner_wallet: &str,
        fee_bps: u32,
    ) -> Result<RuntimeResponse, RuntimeError>;
    async fn refund(&self, id: &ChallengeId) -> Result<RuntimeResponse, RuntimeError>;
    async fn wallets(&self) -> Result<RuntimeResponse, RuntimeError>;
    async fn house_status(&self) -> Result<RuntimeResponse, RuntimeError>;
}

pub struct HttpRuntime {
    http: reqwest::Client,
    base_url: String,
    internal_token: Option<String>,
    execution_mode: String,
}

impl HttpRuntime {
    pub fn new(
        base_url: impl Into<String>,
        internal_token: Option<String>,
        execution_mode: impl Into<String>,
    ) -> Result<Self, RuntimeError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_DEADLINE)
            .build()
            .map_err(|e| RuntimeError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            internal_token,
            execution_mode: execution_mode.into(),
        })
    }

    async fn call(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<RuntimeResponse, RuntimeError> {
        let mut request = request;
        if let Some(token) = &self.internal_token {
            request = request.header(INTERNAL_TOKEN_HEADER, token);
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                RuntimeError::Transport("deadline exceeded".to_owned())
            } else {
                RuntimeError::Transport(e.to_string())
            }
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RuntimeError::Auth);
        }
        // Failure bodies still carry a structured reason; fall back to a
        // bare not-ok when they don't parse.
        Ok(response
            .json::<RuntimeResponse>()
            .await
            .unwrap_or_else(|_| RuntimeResponse {
                ok: status.is_success(),
                ..RuntimeResponse::default()
            }))
    }

    fn post(&self, path: &str, body: serde_json::Value) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{}{path}", self.base_url))
            .json(&body)
    }
}

#[async_trait]
impl EscrowBackend for HttpRuntime {
    async fn preflight(
        &self,
        wallets: &[String],
        amount: u32,
    ) -> Result<RuntimeResponse, RuntimeError> {
        self.call(self.post(
            "/wallets/onchain/prepare-escrow",
            json!({ "walletIds": wallets, "amount": amount, "mode": self.execution_mode }),
        ))
        .await
    }

    async fn lock_stake(
        &self,
        id: &ChallengeId,
        wallets: &[String],
        amount: u32,
    ) -> Result<RuntimeResponse, RuntimeError> {
        self.call(self.post(
            "/wallets/escrow/lock",
            json!({
                "challengeId": id,
                "walletIds": wallets,
                "amount": amount,
                "mode": self.execution_mode,
            }),
        ))
        .await
    }

    async fn resolve(
        &self,
        id: &ChallengeId,
        winner_wallet: &str,
        fee_bps: u32,
    ) -> Result<RuntimeResponse, RuntimeError> {
        self.call(self.post(
            "/wallets/escrow/resolve",
            json!({ "challengeId": id, "winnerWalletId": winner_wallet, "feeBps": fee_bps }),
        ))
        .await
    }

    async fn refund(&self, id: &ChallengeId) -> Result<RuntimeResponse, RuntimeError> {
        self.call(self.post("/wallets/escrow/refund", json!({ "challengeId": id })))
            .await
    }

    async fn wallets(&self) -> Result<RuntimeResponse, RuntimeError> {
        self.call(self.http.get(format!("{}/wallets", self.base_url)))
            .await
    }

    async fn house_status(&self) -> Result<RuntimeResponse, RuntimeError> {
        self.call(self.http.get(format!("{}/house/status", self.base_url)))
            .await
    }
}
