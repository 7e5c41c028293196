use base64::prelude::*;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::errors::{WireError, WireResult};

type HmacSha256 = Hmac<Sha256>;

/// Signed bearer-token payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    pub email: String,
    pub handle: String,
    pub exp: i64,
}

impl TokenClaims {
    pub fn new(sub: &str, email: &str, handle: &str, ttl: Duration) -> Self {
        Self {
            sub: sub.to_string(),
            email: email.to_string(),
            handle: handle.to_string(),
            exp: (Utc::now() + ttl).timestamp(),
        }
    }
}

fn mac(secret: &str, payload: &str) -> WireResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|err| WireError::Internal(anyhow::anyhow!("bad token secret: {}", err)))?;
    mac.update(payload.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// `base64url(claims).base64url(hmac-sha256(secret, base64url(claims)))`
pub fn sign_token(secret: &str, claims: &TokenClaims) -> WireResult<String> {
    let payload = BASE64_URL_SAFE_NO_PAD.encode(serde_json::to_string(claims)?);
    let signature = BASE64_URL_SAFE_NO_PAD.encode(mac(secret, &payload)?);
    Ok(format!("{}.{}", payload, signature))
}

pub fn verify_token(secret: &str, token: &str) -> WireResult<TokenClaims> {
    let (payload, signature) = token
        .split_once('.')
        .ok_or_else(|| WireError::auth("malformed token"))?;

    let provided = BASE64_URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| WireError::auth("malformed token"))?;

    let mut verifier = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|err| WireError::Internal(anyhow::anyhow!("bad token secret: {}", err)))?;
    verifier.update(payload.as_bytes());
    if verifier.verify_slice(&provided).is_err() {
        return Err(WireError::auth("invalid token signature"));
    }

    let raw = BASE64_URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| WireError::auth("malformed token"))?;
    let claims: TokenClaims =
        serde_json::from_slice(&raw).map_err(|_| WireError::auth("malformed token"))?;

    if claims.exp <= Utc::now().timestamp() {
        return Err(WireError::auth("token expired"));
    }
    Ok(claims)
}

pub fn new_salt() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub fn new_reset_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Salted digest for credential storage. Credential policy beyond this
/// lives with the identity collaborator.
pub fn hash_password(password: &str, salt: &str) -> WireResult<String> {
    Ok(hex::encode(mac(salt, password)?))
}

pub fn verify_password(password: &str, salt: &str, expected_hash: &str) -> WireResult<bool> {
    let mut verifier = HmacSha256::new_from_slice(salt.as_bytes())
        .map_err(|err| WireError::Internal(anyhow::anyhow!("bad salt: {}", err)))?;
    verifier.update(password.as_bytes());
    let expected = hex::decode(expected_hash)
        .map_err(|err| WireError::Internal(anyhow::anyhow!("bad stored hash: {}", err)))?;
    Ok(verifier.verify_slice(&expected).is_ok())
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetToken {
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
}

const MIN_HANDLE: usize = 3;
const MAX_HANDLE: usize = 15;
const MIN_PASSWORD: usize = 8;

const RESERVED_HANDLES: &[&str] = &[
    "about", "admin", "api", "auth", "explore", "feed", "help", "home", "login", "logout",
    "posts", "root", "settings", "signup", "support", "users", "wire",
];

/// Handle rules: lowercased, 3-15 chars of `[a-z0-9_]`, no leading
/// underscore, not reserved. Callers lowercase before storing; validation
/// accepts the already-lowercased form.
pub fn validate_handle(handle: &str) -> WireResult<()> {
    let len = handle.chars().count();
    if !(MIN_HANDLE..=MAX_HANDLE).contains(&len) {
        return Err(WireError::validation(format!(
            "handle must be {}-{} characters",
            MIN_HANDLE, MAX_HANDLE
        )));
    }
    if handle.starts_with('_') {
        return Err(WireError::validation(
            "handle must not start with an underscore",
        ));
    }
    if !handle
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(WireError::validation(
            "handle may only contain a-z, 0-9 and underscore",
        ));
    }
    if RESERVED_HANDLES.contains(&handle) {
        return Err(WireError::validation("handle is reserved"));
    }
    Ok(())
}

pub fn validate_email(email: &str) -> WireResult<()> {
    let Some((local, domain)) = email.split_once('@') else {
        return Err(WireError::validation("invalid email address"));
    };
    if local.is_empty() || domain.is_empty() || !domain.contains('.') {
        return Err(WireError::validation("invalid email address"));
    }
    Ok(())
}

pub fn validate_password(password: &str) -> WireResult<()> {
    if password.chars().count() < MIN_PASSWORD {
        return Err(WireError::validation(format!(
            "password must be at least {} characters",
            MIN_PASSWORD
        )));
    }
    Ok(())
}
