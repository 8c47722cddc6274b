use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use utoipa::ToSchema;

/// Every failure the token and session core can report.
///
/// Client-caused variants map to 4xx and are never retried server-side.
/// Upstream variants are only produced after the provider call wrapper has
/// exhausted its retries.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),
    #[error("OAuth state is invalid or expired")]
    InvalidOrExpiredState,
    #[error("OAuth state has already been used")]
    StateAlreadyConsumed,
    #[error("Upstream provider rejected the request with HTTP {status}")]
    UpstreamRejected { status: u16 },
    #[error("Upstream provider did not answer within {0:?}")]
    UpstreamTimeout(Duration),
    #[error("Upstream provider sent an unusable response: {0}")]
    UpstreamInvalidResponse(String),
    #[error("Token has expired")]
    TokenExpired,
    #[error("Token signature is invalid")]
    TokenInvalidSignature,
    #[error("No verification key for kid {0:?}")]
    UnknownKey(String),
    #[error("Refresh token reuse detected")]
    RefreshReuseDetected,
    #[error("Session has been revoked")]
    SessionRevoked,
    #[error("Refresh token is not recognised")]
    InvalidRefreshToken,
    #[error("Missing or malformed credentials: {0}")]
    MissingCredentials(String),
    #[error("Key store has no active signing key")]
    KeyStoreUninitialized,
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Too many login flows in progress")]
    TooManyPendingFlows,
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),
    #[error("Signing key storage failed: {0}")]
    KeyStorage(String),
    #[error("Storage error: {0}")]
    Storage(#[from] sea_orm::DbErr),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// Stable machine-readable code used in error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::UnknownProvider(_) => "unknown_provider",
            AuthError::InvalidOrExpiredState => "invalid_or_expired_state",
            AuthError::StateAlreadyConsumed => "state_already_consumed",
            AuthError::UpstreamRejected { .. } => "upstream_rejected",
            AuthError::UpstreamTimeout(_) => "upstream_timeout",
            AuthError::UpstreamInvalidResponse(_) => "upstream_invalid_response",
            AuthError::TokenExpired => "token_expired",
            AuthError::TokenInvalidSignature => "token_invalid_signature",
            AuthError::UnknownKey(_) => "unknown_key",
            AuthError::RefreshReuseDetected => "refresh_reuse_detected",
            AuthError::SessionRevoked => "session_revoked",
            AuthError::InvalidRefreshToken => "invalid_refresh_token",
            AuthError::MissingCredentials(_) => "invalid_token",
            AuthError::KeyStoreUninitialized => "key_store_uninitialized",
            AuthError::InvalidRequest(_) => "invalid_request",
            AuthError::TooManyPendingFlows => "temporarily_unavailable",
            AuthError::KeyGeneration(_)
            | AuthError::KeyStorage(_)
            | AuthError::Storage(_)
            | AuthError::Internal(_) => "server_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::UnknownProvider(_)
            | AuthError::InvalidOrExpiredState
            | AuthError::StateAlreadyConsumed
            | AuthError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AuthError::TokenExpired
            | AuthError::TokenInvalidSignature
            | AuthError::UnknownKey(_)
            | AuthError::RefreshReuseDetected
            | AuthError::SessionRevoked
            | AuthError::InvalidRefreshToken
            | AuthError::MissingCredentials(_) => StatusCode::UNAUTHORIZED,
            AuthError::UpstreamRejected { .. } | AuthError::UpstreamInvalidResponse(_) => {
                StatusCode::BAD_GATEWAY
            }
            AuthError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AuthError::TooManyPendingFlows => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::KeyStoreUninitialized
            | AuthError::KeyGeneration(_)
            | AuthError::KeyStorage(_)
            | AuthError::Storage(_)
            | AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether a caller may reasonably try the same request again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AuthError::UpstreamTimeout(_) | AuthError::TooManyPendingFlows
        )
    }
}

/// JSON error body.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// Error code (e.g. "token_expired", "refresh_reuse_detected")
    pub error: String,
    /// Human-readable error description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_description = if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
            // Internal details stay in the logs.
            match self {
                AuthError::UpstreamRejected { .. }
                | AuthError::UpstreamTimeout(_)
                | AuthError::UpstreamInvalidResponse(_)
                | AuthError::TooManyPendingFlows => Some(self.to_string()),
                _ => None,
            }
        } else {
            Some(self.to_string())
        };
        (
            status,
            Json(ErrorResponse {
                error: self.code().to_string(),
                error_description,
            }),
        )
            .into_response()
    }
}
