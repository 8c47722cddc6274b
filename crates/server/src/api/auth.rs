//! Login, token rotation, introspection and signout endpoints.

use crate::AppResources;
use crate::error::{AuthError, ErrorResponse};
use crate::oauth2::AUTH_TAG;
use crate::session::RevokeTarget;
use crate::tokens::AccessClaims;
use axum::{
    Extension, Json,
    extract::{FromRequestParts, Path, Query, rejection::JsonRejection},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{AUTHORIZATION, COOKIE, LOCATION, SET_COOKIE},
        request::Parts,
    },
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::{router::OpenApiRouter, routes};

pub fn router() -> OpenApiRouter {
    OpenApiRouter::new()
        .routes(routes!(start))
        .routes(routes!(callback))
        .routes(routes!(token))
        .routes(routes!(session))
        .routes(routes!(signout))
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct StartParams {
    /// Configured provider id, e.g. `google`
    pub provider: Option<String>,
    /// Path or allowed URL to return to after login
    pub redirect: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    /// Set by the provider when the user denied access
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CallbackResponse {
    pub ok: bool,
    pub provider: String,
    pub access_token: String,
    pub refresh_token: String,
    /// Always "Bearer"
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: i64,
    pub session_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    /// Epoch seconds after which the refresh token is unusable
    pub refresh_expires_at: i64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SessionResponse {
    pub authenticated: bool,
    /// Verified access token claims
    #[schema(value_type = Object)]
    pub payload: AccessClaims,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SignoutResponse {
    pub ok: bool,
}

/// Verified access token from `Authorization: Bearer <token>`.
pub struct BearerClaims(pub AccessClaims);

impl<S> FromRequestParts<S> for BearerClaims
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let resources = parts
            .extensions
            .get::<AppResources>()
            .cloned()
            .ok_or_else(|| {
                tracing::error!("AppResources not found in extensions");
                AuthError::Internal("missing application resources".into())
            })?;
        let token = bearer_token(&parts.headers)?;
        let claims = resources.tokens.verify_access_token(token)?;
        Ok(BearerClaims(claims))
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let header = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| AuthError::MissingCredentials("Missing Authorization header".into()))?
        .to_str()
        .map_err(|_| AuthError::MissingCredentials("Unreadable Authorization header".into()))?;
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| {
            AuthError::MissingCredentials("Authorization header must use Bearer scheme".into())
        })
}

fn session_cookie(name: &str, session_id: &str, max_age: i64, secure: bool) -> String {
    let secure_flag = if secure { "; Secure" } else { "" };
    format!("{name}={session_id}; HttpOnly{secure_flag}; SameSite=Lax; Path=/; Max-Age={max_age}")
}

fn cleared_cookie(name: &str, secure: bool) -> String {
    session_cookie(name, "", 0, secure)
}

fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let prefix = format!("{name}=");
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .find_map(|part| part.trim().strip_prefix(&prefix).map(str::to_string))
        .filter(|v| !v.is_empty())
}

fn with_cookie(mut response: Response, cookie: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(cookie) {
        response.headers_mut().append(SET_COOKIE, value);
    }
    response
}

/// Start a federated login.
#[tracing::instrument(skip(resources))]
#[utoipa::path(
    get,
    path = "/auth/start",
    params(StartParams),
    tag = AUTH_TAG,
    operation_id = "Start Login",
    summary = "Redirect to an upstream provider",
    responses(
        (status = 302, description = "Redirect to the provider authorize endpoint"),
        (status = 400, description = "Unknown or missing provider", body = ErrorResponse, content_type = "application/json"),
        (status = 503, description = "Too many login flows in progress", body = ErrorResponse, content_type = "application/json")
    )
)]
async fn start(
    Query(params): Query<StartParams>,
    Extension(resources): Extension<AppResources>,
) -> Result<Response, AuthError> {
    let provider = params
        .provider
        .as_deref()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| AuthError::InvalidRequest("provider is required".into()))?;
    let redirect = resources
        .broker
        .start_authorization(provider, params.redirect.as_deref())?;
    let location = HeaderValue::from_str(redirect.url.as_str())
        .map_err(|e| AuthError::Internal(format!("unencodable redirect: {e}")))?;
    Ok((StatusCode::FOUND, [(LOCATION, location)]).into_response())
}

/// Complete a federated login.
#[tracing::instrument(skip(params, resources))]
#[utoipa::path(
    get,
    path = "/auth/callback/{provider}",
    params(
        ("provider" = String, Path, description = "Provider id"),
        CallbackParams
    ),
    tag = AUTH_TAG,
    operation_id = "Login Callback",
    summary = "Provider redirect target",
    description = "Consumes the authorization state, exchanges the code with the provider, links the account and opens a session. \
                   The session id is also set as an HttpOnly cookie.",
    responses(
        (status = 200, description = "Login completed", body = CallbackResponse, content_type = "application/json"),
        (status = 400, description = "Invalid, expired or reused state", body = ErrorResponse, content_type = "application/json"),
        (status = 502, description = "Provider rejected the exchange", body = ErrorResponse, content_type = "application/json"),
        (status = 504, description = "Provider did not answer in time", body = ErrorResponse, content_type = "application/json")
    )
)]
async fn callback(
    Path(provider): Path<String>,
    Query(params): Query<CallbackParams>,
    Extension(resources): Extension<AppResources>,
) -> Result<Response, AuthError> {
    let state = params
        .state
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AuthError::InvalidRequest("state is required".into()))?;
    if let Some(error) = params.error {
        // Burn the state; the flow is over either way.
        let _ = resources.broker.states().consume(state, &provider);
        return Err(AuthError::InvalidRequest(format!(
            "provider returned error: {error}"
        )));
    }
    let code = params
        .code
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AuthError::InvalidRequest("code is required".into()))?;

    let outcome = resources
        .broker
        .handle_callback(&provider, code, state)
        .await?;

    let sessions = &resources.config.sessions;
    let cookie = session_cookie(
        &sessions.cookie_name,
        &outcome.session_id,
        sessions.max_lifetime_secs,
        sessions.cookie_secure,
    );
    let body = CallbackResponse {
        ok: true,
        provider: outcome.provider,
        access_token: outcome.access_token,
        refresh_token: outcome.refresh_token,
        token_type: "Bearer".to_string(),
        expires_in: outcome.expires_in,
        session_id: outcome.session_id,
        user_id: outcome.user_id,
        redirect: outcome.redirect,
    };
    Ok(with_cookie(Json(body).into_response(), &cookie))
}

/// Rotate a refresh token.
#[tracing::instrument(skip(resources, body))]
#[utoipa::path(
    post,
    path = "/auth/token",
    request_body = RefreshRequest,
    tag = AUTH_TAG,
    operation_id = "Refresh Token",
    summary = "Exchange a refresh token for a new token pair",
    description = "Each refresh token is single-use. Presenting a spent token revokes the whole session.",
    responses(
        (status = 200, description = "New token pair", body = TokenResponse, content_type = "application/json"),
        (status = 400, description = "Missing refresh token", body = ErrorResponse, content_type = "application/json"),
        (status = 401, description = "Reused, expired, revoked or unknown refresh token", body = ErrorResponse, content_type = "application/json")
    )
)]
async fn token(
    Extension(resources): Extension<AppResources>,
    body: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Json<TokenResponse>, AuthError> {
    let Json(request) = body.map_err(|e| AuthError::InvalidRequest(e.body_text()))?;
    let refresh_token = request
        .refresh_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AuthError::InvalidRequest("refreshToken is required".into()))?;

    let pair = resources.sessions.rotate_refresh(&refresh_token)?;
    Ok(Json(TokenResponse {
        access_token: pair.access.token,
        refresh_token: pair.refresh_token,
        token_type: "Bearer".to_string(),
        expires_in: pair.access.expires_in,
        refresh_expires_at: pair.refresh_expires_at,
    }))
}

/// Introspect the caller's access token.
#[tracing::instrument(skip_all)]
#[utoipa::path(
    get,
    path = "/auth/session",
    tag = AUTH_TAG,
    operation_id = "Current Session",
    summary = "Verify the bearer token and return its claims",
    security(("Authorization" = [])),
    responses(
        (status = 200, description = "Token is valid", body = SessionResponse, content_type = "application/json"),
        (status = 401, description = "Missing, expired or invalid token", body = ErrorResponse, content_type = "application/json")
    )
)]
async fn session(
    Extension(resources): Extension<AppResources>,
    BearerClaims(claims): BearerClaims,
) -> Result<Json<SessionResponse>, AuthError> {
    if let Some(sid) = claims.sid.as_deref() {
        if resources
            .sessions
            .session(sid)
            .is_some_and(|s| s.revoked)
        {
            return Err(AuthError::SessionRevoked);
        }
    }
    Ok(Json(SessionResponse {
        authenticated: true,
        payload: claims,
    }))
}

/// End the caller's session.
#[tracing::instrument(skip_all)]
#[utoipa::path(
    post,
    path = "/auth/signout",
    tag = AUTH_TAG,
    operation_id = "Sign Out",
    summary = "Revoke the current session and clear the session cookie",
    description = "The session is taken from the bearer token's `sid` claim, or from the session cookie. \
                   Signing out without a session is not an error.",
    responses(
        (status = 200, description = "Signed out", body = SignoutResponse, content_type = "application/json")
    )
)]
async fn signout(
    headers: HeaderMap,
    Extension(resources): Extension<AppResources>,
) -> Response {
    let sessions = &resources.config.sessions;
    let from_bearer = bearer_token(&headers)
        .ok()
        .and_then(|t| resources.tokens.verify_access_token(t).ok())
        .and_then(|claims| claims.sid);
    let session_id = from_bearer.or_else(|| read_cookie(&headers, &sessions.cookie_name));

    match session_id.as_deref() {
        Some(id) => {
            resources.sessions.revoke(RevokeTarget::Session(id));
            tracing::info!(session_id = id, "Signed out");
        }
        None => tracing::debug!("Signout without a session"),
    }

    with_cookie(
        Json(SignoutResponse { ok: true }).into_response(),
        &cleared_cookie(&sessions.cookie_name, sessions.cookie_secure),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_cookie_attributes() {
        let cookie = session_cookie("openpass_session", "abc", 60, true);
        assert_eq!(
            cookie,
            "openpass_session=abc; HttpOnly; Secure; SameSite=Lax; Path=/; Max-Age=60"
        );
        let cleared = cleared_cookie("openpass_session", false);
        assert!(cleared.starts_with("openpass_session=;"));
        assert!(cleared.ends_with("Max-Age=0"));
        assert!(!cleared.contains("Secure"));
    }

    #[test]
    fn test_read_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(
            COOKIE,
            HeaderValue::from_static("theme=dark; openpass_session=s-1; other=x"),
        );
        assert_eq!(
            read_cookie(&headers, "openpass_session").as_deref(),
            Some("s-1")
        );
        assert!(read_cookie(&headers, "missing").is_none());
    }

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert!(matches!(
            bearer_token(&headers),
            Err(AuthError::MissingCredentials(_))
        ));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(bearer_token(&headers).is_err());
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer abc.def.ghi"));
        assert_eq!(bearer_token(&headers).unwrap(), "abc.def.ghi");
    }
}
