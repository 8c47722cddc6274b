//! Authorization code flow against the configured providers.

use std::collections::HashMap;
use std::sync::Arc;

use url::Url;

use crate::clock::{SharedClock, datetime};
use crate::config::AppConfig;
use crate::error::AuthError;
use crate::oauth2::identity::AccountLinker;
use crate::oauth2::provider::{Provider, ProviderClient};
use crate::oauth2::retry::RetryPolicy;
use crate::oauth2::state::StateStore;
use crate::session::{SessionContext, SessionManager};

/// Where to send the browser to start a login.
#[derive(Debug, Clone)]
pub struct AuthorizationRedirect {
    pub url: Url,
    pub state: String,
}

/// Tokens and identity produced by a completed login.
#[derive(Debug, Clone)]
pub struct CallbackOutcome {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub refresh_expires_at: i64,
    pub session_id: String,
    pub user_id: String,
    pub provider: String,
    /// Post-login destination requested at start
    pub redirect: Option<String>,
}

#[derive(Debug)]
pub struct OAuthBroker {
    providers: HashMap<String, Provider>,
    states: StateStore,
    client: ProviderClient,
    linker: AccountLinker,
    sessions: Arc<SessionManager>,
    clock: SharedClock,
    callback_base: String,
    allowed_redirect_origins: Vec<String>,
}

impl OAuthBroker {
    pub fn new(
        config: &AppConfig,
        clock: SharedClock,
        linker: AccountLinker,
        sessions: Arc<SessionManager>,
    ) -> Result<Self, AuthError> {
        let providers = config
            .providers
            .iter()
            .map(|(id, cfg)| Ok((id.clone(), Provider::from_config(id, cfg)?)))
            .collect::<Result<HashMap<_, _>, crate::config::ConfigError>>()
            .map_err(|e| AuthError::Internal(e.to_string()))?;
        let client = ProviderClient::new(RetryPolicy::from_config(&config.oauth))?;

        Ok(Self {
            providers,
            states: StateStore::new(
                config.oauth.state_ttl_secs,
                config.oauth.max_pending_states,
                clock.clone(),
            ),
            client,
            linker,
            sessions,
            clock,
            callback_base: config.callback_base_url().to_string(),
            allowed_redirect_origins: config
                .oauth
                .allowed_redirect_origins
                .iter()
                .map(|o| o.trim_end_matches('/').to_string())
                .collect(),
        })
    }

    pub fn provider(&self, id: &str) -> Result<&Provider, AuthError> {
        self.providers
            .get(id)
            .ok_or_else(|| AuthError::UnknownProvider(id.to_string()))
    }

    pub fn provider_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn states(&self) -> &StateStore {
        &self.states
    }

    /// URL the provider sends the browser back to.
    pub fn callback_url(&self, provider: &str) -> String {
        format!("{}/auth/callback/{}", self.callback_base, provider)
    }

    /// Creates a pending flow and returns the provider authorize URL.
    #[tracing::instrument(skip(self))]
    pub fn start_authorization(
        &self,
        provider: &str,
        redirect: Option<&str>,
    ) -> Result<AuthorizationRedirect, AuthError> {
        let provider = self.provider(provider)?;
        let redirect = redirect
            .filter(|r| !r.is_empty())
            .map(|r| self.check_redirect(r))
            .transpose()?;

        let state = self.states.create(&provider.id, redirect)?;
        let url = provider.authorization_url(
            &state.state,
            &self.callback_url(&provider.id),
            &state.code_challenge(),
        );
        tracing::debug!(provider = %provider.id, "Authorization started");
        Ok(AuthorizationRedirect {
            url,
            state: state.state,
        })
    }

    /// Completes a flow: consumes the state, exchanges the code, resolves the
    /// user and opens a session.
    #[tracing::instrument(skip(self, code, state))]
    pub async fn handle_callback(
        &self,
        provider: &str,
        code: &str,
        state: &str,
    ) -> Result<CallbackOutcome, AuthError> {
        let provider = self.provider(provider)?;
        if code.is_empty() {
            return Err(AuthError::InvalidRequest("missing code".to_string()));
        }
        // Consumed before the exchange so a replay can never reach the
        // provider twice.
        let pending = self.states.consume(state, &provider.id)?;

        let redirect_uri = self.callback_url(&provider.id);
        let tokens = self
            .client
            .exchange_code(provider, code, &redirect_uri, &pending.pkce_verifier)
            .await?;
        let identity = self
            .client
            .fetch_identity(provider, &tokens, datetime(self.clock.now()))
            .await?;
        let user = self.linker.resolve(&identity).await?;

        let pair = self.sessions.create_session(SessionContext {
            user_id: user.id.clone(),
            provider: Some(provider.id.clone()),
            tenant: None,
        })?;
        tracing::info!(
            provider = %provider.id,
            user_id = %user.id,
            session_id = %pair.session.id,
            "Login completed"
        );

        Ok(CallbackOutcome {
            access_token: pair.access.token,
            refresh_token: pair.refresh_token,
            expires_in: pair.access.expires_in,
            refresh_expires_at: pair.refresh_expires_at,
            session_id: pair.session.id,
            user_id: user.id,
            provider: provider.id.clone(),
            redirect: pending.redirect_uri,
        })
    }

    pub fn purge_expired_states(&self) -> usize {
        self.states.purge_expired()
    }

    /// Accepts a path on this host, or an absolute http(s) URL whose origin
    /// is allowed.
    fn check_redirect(&self, redirect: &str) -> Result<String, AuthError> {
        if redirect.starts_with('/') && !redirect.starts_with("//") {
            return Ok(redirect.to_string());
        }
        let url = Url::parse(redirect)
            .map_err(|_| AuthError::InvalidRequest("redirect must be a path or URL".into()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(AuthError::InvalidRequest(
                "redirect must use http or https".into(),
            ));
        }
        let origin = url.origin().ascii_serialization();
        if !self.allowed_redirect_origins.is_empty()
            && !self.allowed_redirect_origins.iter().any(|o| *o == origin)
        {
            return Err(AuthError::InvalidRequest(format!(
                "redirect origin {origin} is not allowed"
            )));
        }
        Ok(redirect.to_string())
    }
}
