//! Session signatures: JWTs that admit a user to a named session with a role.
//!
//! Tokens are signed with HS256 over the app key/secret pair. Desktop clients
//! normally ask the signature server for one and fall back to signing locally
//! when the server cannot be reached.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{encode, EncodingKey, Header};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use std::time::Duration;
use tracing::{info, warn};

use crate::roster::Role;

pub const DEFAULT_TOKEN_TTL_SECS: i64 = 2 * 60 * 60;
/// Issue-time backdating that tolerates clock drift between peers.
const CLOCK_SKEW_SECS: i64 = 30;
const SIGNATURE_VERSION: u8 = 1;
const REMOTE_TIMEOUT: Duration = Duration::from_secs(5);

pub const PLACEHOLDER_SDK_KEY: &str = "your_sdk_key_here";
pub const PLACEHOLDER_SDK_SECRET: &str = "your_sdk_secret_here";

/// Media permissions understood by LiveKit servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoGrant {
    pub room_join: bool,
    pub room: String,
    pub can_publish: bool,
    pub can_subscribe: bool,
    pub can_publish_data: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub app_key: String,
    /// Session topic.
    pub tpc: String,
    pub role_type: u8,
    pub version: u8,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    /// Participant identity, unique per join.
    pub sub: String,
    pub name: String,
    /// JSON object carrying the role flag, read back by other participants.
    pub metadata: String,
    pub video: VideoGrant,
}

impl SessionClaims {
    pub fn role(&self) -> Role {
        Role::from_role_type(self.role_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureRequest {
    pub session_name: String,
    pub role: Role,
    pub user_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Body returned by `GET /getSignature`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureResponse {
    pub success: bool,
    pub signature: String,
    pub session_name: String,
    pub role: u8,
    pub expires_at: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    /// Key or secret missing, or still the placeholder values.
    #[error("SDK key and secret are not configured")]
    NotConfigured,
    #[error("failed to sign session token: {0}")]
    Signing(String),
    #[error("signature server error: {0}")]
    Remote(String),
    /// Neither the signature server nor local signing produced a token.
    #[error("could not obtain a session signature (server: {remote}; local: {local})")]
    Exhausted { remote: String, local: String },
}

/// True when both values are set and are not the shipped placeholders.
pub fn credentials_configured(key: &str, secret: &str) -> bool {
    !key.trim().is_empty()
        && !secret.trim().is_empty()
        && key != PLACEHOLDER_SDK_KEY
        && secret != PLACEHOLDER_SDK_SECRET
}

/// Sign a session token for `request`, valid for `ttl_secs` after issue.
pub fn generate_signature(
    key: &str,
    secret: &str,
    request: &SignatureRequest,
    ttl_secs: i64,
) -> Result<Signature, TokenError> {
    if !credentials_configured(key, secret) {
        return Err(TokenError::NotConfigured);
    }
    if request.session_name.trim().is_empty() {
        return Err(TokenError::Signing("session name is empty".to_string()));
    }

    let iat = Utc::now().timestamp() - CLOCK_SKEW_SECS;
    let exp = iat + ttl_secs;
    let role_type = request.role.role_type();
    let claims = SessionClaims {
        app_key: key.to_string(),
        tpc: request.session_name.clone(),
        role_type,
        version: SIGNATURE_VERSION,
        iat,
        exp,
        iss: key.to_string(),
        sub: participant_identity(&request.user_name),
        name: request.user_name.clone(),
        metadata: serde_json::json!({ "role": role_type }).to_string(),
        video: VideoGrant {
            room_join: true,
            room: request.session_name.clone(),
            can_publish: true,
            can_subscribe: true,
            can_publish_data: true,
        },
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| TokenError::Signing(e.to_string()))?;

    let expires_at = Utc
        .timestamp_opt(exp, 0)
        .single()
        .ok_or_else(|| TokenError::Signing(format!("expiry {exp} out of range")))?;

    Ok(Signature { token, expires_at })
}

fn participant_identity(user_name: &str) -> String {
    let suffix: u16 = rand::thread_rng().gen();
    let base: String = user_name
        .trim()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    if base.is_empty() {
        format!("guest-{suffix:04x}")
    } else {
        format!("{base}-{suffix:04x}")
    }
}

/// Anything that can hand out session signatures.
#[async_trait]
pub trait SignatureSource: Send + Sync {
    async fn fetch(&self, request: &SignatureRequest) -> Result<Signature, TokenError>;
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub key: String,
    pub secret: String,
}

/// Obtains signatures from the signature server with a local fallback.
#[derive(Debug, Clone)]
pub struct TokenClient {
    http: reqwest::Client,
    server_url: Option<String>,
    credentials: Option<Credentials>,
    ttl_secs: i64,
}

impl TokenClient {
    pub fn new(
        server_url: Option<String>,
        credentials: Option<Credentials>,
        ttl_secs: i64,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REMOTE_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!("failed to build HTTP client with timeout, using defaults: {e}");
                reqwest::Client::new()
            });
        Self {
            http,
            server_url: server_url
                .map(|url| url.trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty()),
            credentials,
            ttl_secs,
        }
    }

    async fn fetch_remote(
        &self,
        base: &str,
        request: &SignatureRequest,
    ) -> Result<Signature, TokenError> {
        let role = request.role.role_type().to_string();
        let response = self
            .http
            .get(format!("{base}/getSignature"))
            .query(&[
                ("sessionName", request.session_name.as_str()),
                ("role", role.as_str()),
                ("userName", request.user_name.as_str()),
            ])
            .send()
            .await
            .map_err(|e| TokenError::Remote(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TokenError::Remote(format!("HTTP {status}: {body}")));
        }

        let body: SignatureResponse = response
            .json()
            .await
            .map_err(|e| TokenError::Remote(format!("invalid response: {e}")))?;
        if !body.success || body.signature.is_empty() {
            return Err(TokenError::Remote("server returned no signature".to_string()));
        }
        Ok(Signature {
            token: body.signature,
            expires_at: body.expires_at,
        })
    }
}

#[async_trait]
impl SignatureSource for TokenClient {
    async fn fetch(&self, request: &SignatureRequest) -> Result<Signature, TokenError> {
        let remote_err = match &self.server_url {
            Some(base) => match self.fetch_remote(base, request).await {
                Ok(signature) => {
                    info!(session = %request.session_name, "signature obtained from server");
                    return Ok(signature);
                }
                Err(e) => {
                    warn!(session = %request.session_name, "signature server failed, signing locally: {e}");
                    e.to_string()
                }
            },
            None => "no signature server configured".to_string(),
        };

        let local = match &self.credentials {
            Some(creds) => generate_signature(&creds.key, &creds.secret, request, self.ttl_secs),
            None => Err(TokenError::NotConfigured),
        };
        local.map_err(|local_err| TokenError::Exhausted {
            remote: remote_err,
            local: local_err.to_string(),
        })
    }
}
