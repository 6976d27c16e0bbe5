//! HTTP service that signs session tokens for desktop clients.
//!
//! Keeps the SDK secret off client machines: clients call `/getSignature`
//! and only fall back to local signing when they hold the secret themselves.

use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::Utc;
use http::StatusCode;
use serde::Deserialize;
use serde_json::json;
use std::env;
use std::sync::Arc;

use crate::roster::Role;
use crate::token::{
    credentials_configured, generate_signature, SignatureRequest, SignatureResponse,
    TokenError, DEFAULT_TOKEN_TTL_SECS, PLACEHOLDER_SDK_KEY, PLACEHOLDER_SDK_SECRET,
};

pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:4000";
const USAGE_EXAMPLE: &str = "/getSignature?sessionName=MEETING123&role=0&userName=John";
const AVAILABLE_ROUTES: [&str; 2] = ["/health", "/getSignature"];

#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the HTTP server (e.g. "0.0.0.0:4000").
    pub listen_addr: String,
    pub sdk_key: String,
    pub sdk_secret: String,
    pub token_ttl_secs: i64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All optional; unset credentials leave the server running but every
    /// signature request fails with 500 until they are configured.
    /// - `SDK_KEY`, `SDK_SECRET`
    /// - `LISTEN_ADDR` (default: `"0.0.0.0:4000"`)
    /// - `TOKEN_TTL_SECS` (default: `"7200"`)
    pub fn from_env() -> Result<Self, String> {
        let sdk_key = env::var("SDK_KEY").unwrap_or_else(|_| PLACEHOLDER_SDK_KEY.to_string());
        let sdk_secret =
            env::var("SDK_SECRET").unwrap_or_else(|_| PLACEHOLDER_SDK_SECRET.to_string());
        let listen_addr =
            env::var("LISTEN_ADDR").unwrap_or_else(|_| DEFAULT_LISTEN_ADDR.to_string());
        let token_ttl_secs = match env::var("TOKEN_TTL_SECS") {
            Ok(raw) => raw
                .parse::<i64>()
                .ok()
                .filter(|ttl| *ttl > 0)
                .ok_or("TOKEN_TTL_SECS must be a positive integer")?,
            Err(_) => DEFAULT_TOKEN_TTL_SECS,
        };

        Ok(Self {
            listen_addr,
            sdk_key,
            sdk_secret,
            token_ttl_secs,
        })
    }

    pub fn sdk_configured(&self) -> bool {
        credentials_configured(&self.sdk_key, &self.sdk_secret)
    }
}

#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

/// Error body paired with a status code.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub body: serde_json::Value,
}

impl AppError {
    fn missing_session_name() -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: json!({
                "error": "sessionName is required",
                "example": USAGE_EXAMPLE,
            }),
        }
    }

    fn invalid_role(raw: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: json!({
                "error": format!("role must be 0 or 1, got {raw:?}"),
                "example": USAGE_EXAMPLE,
            }),
        }
    }

    fn not_configured() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: json!({
                "error": "Video SDK not configured. Please set SDK_KEY and SDK_SECRET.",
            }),
        }
    }

    fn signing_failed(detail: &str) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: json!({
                "error": "Failed to generate signature",
                "details": detail,
            }),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::NotConfigured => Self::not_configured(),
            other => {
                tracing::error!("Failed to sign session token: {other}");
                Self::signing_failed(&other.to_string())
            }
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/getSignature", get(get_signature))
        .fallback(not_found)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "OK",
        "timestamp": Utc::now(),
        "sdkConfigured": state.config.sdk_configured(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignatureQuery {
    session_name: Option<String>,
    role: Option<String>,
    user_name: Option<String>,
}

async fn get_signature(
    State(state): State<AppState>,
    Query(query): Query<SignatureQuery>,
) -> Result<Json<SignatureResponse>, AppError> {
    let session_name = query
        .session_name
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(AppError::missing_session_name)?;

    let role_type = match query.role.as_deref().map(str::trim) {
        None | Some("") => 0,
        Some(raw) => match raw.parse::<u8>() {
            Ok(flag @ (0 | 1)) => flag,
            _ => return Err(AppError::invalid_role(raw)),
        },
    };

    let config = &state.config;
    if !config.sdk_configured() {
        return Err(AppError::not_configured());
    }

    let user_name = query.user_name.unwrap_or_default();
    let request = SignatureRequest {
        session_name: session_name.clone(),
        role: Role::from_role_type(role_type),
        user_name,
    };
    let signature = generate_signature(
        &config.sdk_key,
        &config.sdk_secret,
        &request,
        config.token_ttl_secs,
    )?;

    let user = if request.user_name.is_empty() {
        "unknown"
    } else {
        request.user_name.as_str()
    };
    tracing::info!(session = %session_name, user, role = role_type, "Generated signature");

    Ok(Json(SignatureResponse {
        success: true,
        signature: signature.token,
        session_name,
        role: role_type,
        expires_at: signature.expires_at,
        generated_at: Utc::now(),
    }))
}

async fn not_found() -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        body: json!({
            "error": "Endpoint not found",
            "available": AVAILABLE_ROUTES,
        }),
    }
}
