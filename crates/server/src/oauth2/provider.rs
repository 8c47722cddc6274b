//! Upstream OAuth/OIDC providers and the HTTP client that talks to them.

use serde::Deserialize;
use serde_json::Value;
use time::{Duration as TimeDuration, OffsetDateTime};
use url::Url;

use crate::config::{ConfigError, ProviderConfig};
use crate::error::AuthError;
use crate::oauth2::retry::{CallError, RetryPolicy, with_retry};

const USER_AGENT: &str = concat!("openpass/", env!("CARGO_PKG_VERSION"));

struct KnownProvider {
    id: &'static str,
    authorize_url: &'static str,
    token_url: &'static str,
    userinfo_url: &'static str,
    scope: &'static str,
}

const KNOWN_PROVIDERS: &[KnownProvider] = &[
    KnownProvider {
        id: "google",
        authorize_url: "https://accounts.google.com/o/oauth2/v2/auth",
        token_url: "https://oauth2.googleapis.com/token",
        userinfo_url: "https://openidconnect.googleapis.com/v1/userinfo",
        scope: "openid email profile",
    },
    KnownProvider {
        id: "github",
        authorize_url: "https://github.com/login/oauth/authorize",
        token_url: "https://github.com/login/oauth/access_token",
        userinfo_url: "https://api.github.com/user",
        scope: "read:user user:email",
    },
];

/// A configured upstream provider with resolved endpoints.
#[derive(Clone)]
pub struct Provider {
    pub id: String,
    pub client_id: String,
    client_secret: String,
    pub authorize_url: Url,
    pub token_url: Url,
    pub userinfo_url: Url,
    pub scope: String,
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("authorize_url", &self.authorize_url.as_str())
            .field("token_url", &self.token_url.as_str())
            .field("userinfo_url", &self.userinfo_url.as_str())
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl Provider {
    /// Resolves a provider entry, filling unset endpoints from the built-in
    /// defaults for `google` and `github`.
    pub fn from_config(id: &str, cfg: &ProviderConfig) -> Result<Self, ConfigError> {
        if cfg.client_id.is_empty() {
            return Err(ConfigError::Validation(format!(
                "providers.{id}.client_id is required"
            )));
        }
        let known = KNOWN_PROVIDERS.iter().find(|p| p.id == id);
        let endpoint = |field: &str,
                        configured: &Option<String>,
                        fallback: Option<&'static str>|
         -> Result<Url, ConfigError> {
            let raw = configured
                .as_deref()
                .or(fallback)
                .ok_or_else(|| ConfigError::Validation(format!("providers.{id}.{field} is required")))?;
            Url::parse(raw).map_err(|e| {
                ConfigError::Validation(format!("providers.{id}.{field} is not a valid URL: {e}"))
            })
        };

        Ok(Self {
            id: id.to_string(),
            client_id: cfg.client_id.clone(),
            client_secret: cfg.client_secret.clone(),
            authorize_url: endpoint("authorize_url", &cfg.authorize_url, known.map(|k| k.authorize_url))?,
            token_url: endpoint("token_url", &cfg.token_url, known.map(|k| k.token_url))?,
            userinfo_url: endpoint("userinfo_url", &cfg.userinfo_url, known.map(|k| k.userinfo_url))?,
            scope: cfg
                .scope
                .clone()
                .or_else(|| known.map(|k| k.scope.to_string()))
                .unwrap_or_else(|| "openid email profile".to_string()),
        })
    }

    /// Provider authorize URL for one flow.
    pub fn authorization_url(&self, state: &str, redirect_uri: &str, code_challenge: &str) -> Url {
        let mut url = self.authorize_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.scope)
            .append_pair("state", state)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", "S256");
        url
    }
}

/// Token endpoint response.
#[derive(Clone, Deserialize)]
pub struct ProviderTokens {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl std::fmt::Debug for ProviderTokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderTokens")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

/// Who the provider says the user is.
#[derive(Clone, PartialEq)]
pub struct ProviderIdentity {
    pub provider: String,
    pub provider_account_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<OffsetDateTime>,
    pub scope: Option<String>,
}

impl std::fmt::Debug for ProviderIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderIdentity")
            .field("provider", &self.provider)
            .field("provider_account_id", &self.provider_account_id)
            .field("email", &self.email)
            .field("name", &self.name)
            .field("token_expires_at", &self.token_expires_at)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl ProviderIdentity {
    pub fn new(provider: impl Into<String>, provider_account_id: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            provider_account_id: provider_account_id.into(),
            email: None,
            name: None,
            access_token: None,
            refresh_token: None,
            token_expires_at: None,
            scope: None,
        }
    }

    /// Reads `sub` (OIDC) or `id` (GitHub, string or number) plus optional
    /// `email` and `name` from a userinfo document.
    pub fn from_userinfo(provider: &str, userinfo: &Value) -> Result<Self, AuthError> {
        let account_id = match userinfo.get("sub").or_else(|| userinfo.get("id")) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(AuthError::UpstreamInvalidResponse(
                    "userinfo has no subject".to_string(),
                ));
            }
        };
        let text = |field: &str| {
            userinfo
                .get(field)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Ok(Self {
            email: text("email"),
            name: text("name"),
            ..Self::new(provider, account_id)
        })
    }

    fn with_tokens(mut self, tokens: &ProviderTokens, now: OffsetDateTime) -> Self {
        self.access_token = Some(tokens.access_token.clone());
        self.refresh_token = tokens.refresh_token.clone();
        // Out-of-range lifetimes are dropped rather than trusted.
        self.token_expires_at = tokens
            .expires_in
            .filter(|secs| *secs > 0)
            .and_then(|secs| now.checked_add(TimeDuration::seconds(secs)));
        self.scope = tokens.scope.clone();
        self
    }
}

/// HTTP client for token exchange and userinfo calls.
#[derive(Clone, Debug)]
pub struct ProviderClient {
    http: reqwest::Client,
    policy: RetryPolicy,
}

impl ProviderClient {
    pub fn new(policy: RetryPolicy) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(policy.deadline)
            .build()
            .map_err(|e| AuthError::Internal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, policy })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Authorization code exchange with PKCE.
    #[tracing::instrument(skip(self, provider, code, code_verifier), fields(provider = %provider.id))]
    pub async fn exchange_code(
        &self,
        provider: &Provider,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<ProviderTokens, AuthError> {
        let form = &[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", provider.client_id.as_str()),
            ("client_secret", provider.client_secret.as_str()),
            ("code_verifier", code_verifier),
        ];
        with_retry(&self.policy, "token_exchange", move || async move {
            let response = self
                .http
                .post(provider.token_url.clone())
                .header(reqwest::header::ACCEPT, "application/json")
                .form(form)
                .send()
                .await?;
            let body: Value = read_json(response).await?;
            if let Some(error) = body.get("error").and_then(Value::as_str) {
                // GitHub reports failures with 200 and an error field.
                tracing::debug!(error, "Token endpoint returned an error document");
                return Err(CallError::Fatal(AuthError::UpstreamRejected { status: 400 }));
            }
            serde_json::from_value::<ProviderTokens>(body).map_err(|e| {
                CallError::Fatal(AuthError::UpstreamInvalidResponse(format!(
                    "token response: {e}"
                )))
            })
        })
        .await
    }

    /// Fetches the userinfo document with the provider access token.
    #[tracing::instrument(skip(self, provider, tokens), fields(provider = %provider.id))]
    pub async fn fetch_identity(
        &self,
        provider: &Provider,
        tokens: &ProviderTokens,
        now: OffsetDateTime,
    ) -> Result<ProviderIdentity, AuthError> {
        let userinfo = with_retry(&self.policy, "userinfo", move || async move {
            let response = self
                .http
                .get(provider.userinfo_url.clone())
                .header(reqwest::header::ACCEPT, "application/json")
                .bearer_auth(&tokens.access_token)
                .send()
                .await?;
            read_json(response).await
        })
        .await?;
        Ok(ProviderIdentity::from_userinfo(&provider.id, &userinfo)?.with_tokens(tokens, now))
    }
}

async fn read_json(response: reqwest::Response) -> Result<Value, CallError> {
    let status = response.status();
    if !status.is_success() {
        return Err(CallError::Fatal(AuthError::UpstreamRejected {
            status: status.as_u16(),
        }));
    }
    response.json::<Value>().await.map_err(|e| {
        if e.is_timeout() {
            CallError::Transient(e.to_string())
        } else {
            CallError::Fatal(AuthError::UpstreamInvalidResponse(e.to_string()))
        }
    })
}
