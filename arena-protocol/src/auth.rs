//! Signed session tokens for the `/ws` upgrade.
//!
//! A token is `base64url(payload) . base64url(hmac_sha256(secret, base64url(payload)))`
//! with no padding. The payload is a JSON claims object; verification checks
//! the signature before anything else so claim errors never leak timing.

use arena_shared::Role;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const TOKEN_VERSION: u8 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthClaims {
    pub v: u8,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_id: Option<String>,
    pub iat: u64,
    pub exp: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,
    #[error("bad signature")]
    BadSignature,
    #[error("unsupported token version {0}")]
    WrongVersion(u8),
    #[error("token role does not match connection role")]
    RoleMismatch,
    #[error("token subject does not match presented id")]
    IdMismatch,
    #[error("token expired")]
    Expired,
}

pub fn sign_token(secret: &str, claims: &AuthClaims) -> String {
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).expect("claims serialize"));
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload.as_bytes());
    let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    format!("{payload}.{sig}")
}

/// Full verification: signature, version, expiry, role, and the id claim
/// against the id the connection presented.
pub fn verify_token(
    secret: &str,
    token: &str,
    expected_role: Role,
    presented_id: &str,
    now_secs: u64,
) -> Result<AuthClaims, AuthError> {
    let (payload, sig) = token.split_once('.').ok_or(AuthError::Malformed)?;
    let sig = URL_SAFE_NO_PAD
        .decode(sig)
        .map_err(|_| AuthError::Malformed)?;

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload.as_bytes());
    mac.verify_slice(&sig).map_err(|_| AuthError::BadSignature)?;

    let payload = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| AuthError::Malformed)?;
    let claims: AuthClaims = serde_json::from_slice(&payload).map_err(|_| AuthError::Malformed)?;

    if claims.v != TOKEN_VERSION {
        return Err(AuthError::WrongVersion(claims.v));
    }
    if claims.exp <= now_secs {
        return Err(AuthError::Expired);
    }
    if claims.role != expected_role {
        return Err(AuthError::RoleMismatch);
    }
    let subject = match expected_role {
        Role::Human => claims.client_id.as_deref(),
        Role::Agent => claims.agent_id.as_deref(),
    };
    if subject != Some(presented_id) {
        return Err(AuthError::IdMismatch);
    }
    Ok(claims)
}

/// Stable-id sanitizer for human client ids: anything outside
/// `[A-Za-z0-9_-]` becomes `_`, capped at 64 chars.
pub fn sanitize_client_id(raw: &str) -> String {
    raw.chars()
        .take(64)
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
