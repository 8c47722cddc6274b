//! An identity broker.
//!
//! Users log in through upstream OAuth2/OIDC providers; the broker issues its
//! own RS256 access tokens and single-use refresh tokens and publishes its
//! verification keys as a JWKS.

use std::sync::Arc;

use sea_orm::DatabaseConnection;

use crate::clock::SharedClock;
use crate::config::AppConfig;
use crate::error::AuthError;
use crate::keys::KeyStore;
use crate::keys::storage::KeyRepository;
use crate::oauth2::{AccountLinker, OAuthBroker};
use crate::session::SessionManager;
use crate::session::store::{SessionStore, spawn_journal};
use crate::tokens::TokenService;

pub mod api;
pub mod clock;
pub mod config;
pub mod entity;
pub mod error;
pub mod keys;
pub mod maintenance;
pub mod oauth2;
pub mod session;
pub mod tokens;

/// Everything request handlers and background tasks share.
#[derive(Clone, Debug)]
pub struct AppResources {
    pub config: Arc<AppConfig>,
    pub db: Arc<DatabaseConnection>,
    pub clock: SharedClock,
    pub keys: Arc<KeyStore>,
    pub key_storage: KeyRepository,
    pub tokens: TokenService,
    pub sessions: Arc<SessionManager>,
    pub session_store: SessionStore,
    pub broker: Arc<OAuthBroker>,
}

/// What [`AppResources::start_persistence`] loaded back.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub active_kid: Option<String>,
    pub sessions: usize,
}

impl AppResources {
    /// Wires the services together. The key store is created empty; call
    /// [`AppResources::start_persistence`] and then [`KeyStore::initialize`]
    /// (or `initialize_from_pem`) before serving.
    pub fn new(
        config: Arc<AppConfig>,
        db: Arc<DatabaseConnection>,
        clock: SharedClock,
    ) -> Result<Self, AuthError> {
        let keys = Arc::new(KeyStore::new(config.keys.clone(), clock.clone()));
        let key_storage = KeyRepository::new(db.clone(), &config.keys)?;
        let tokens = TokenService::new(
            keys.clone(),
            clock.clone(),
            config.issuer_url.clone(),
            &config.tokens,
        );
        let sessions = Arc::new(SessionManager::new(
            tokens.clone(),
            clock.clone(),
            &config.sessions,
        ));
        let session_store = SessionStore::new(db.clone());
        let linker = AccountLinker::new(db.clone(), clock.clone());
        let broker = Arc::new(OAuthBroker::new(
            &config,
            clock.clone(),
            linker,
            sessions.clone(),
        )?);

        Ok(Self {
            config,
            db,
            clock,
            keys,
            key_storage,
            tokens,
            sessions,
            session_store,
            broker,
        })
    }

    /// Loads stored signing keys and sessions and starts writing session
    /// changes back. Call once, inside the runtime, before serving; then make
    /// sure a key is active and [`KeyRepository::save`] it.
    pub async fn start_persistence(&self) -> Result<RestoreReport, AuthError> {
        let active_kid = self.key_storage.load_into(&self.keys).await?;
        let families = self.session_store.load(self.clock.now()).await?;
        let sessions = self.sessions.restore(families);
        if spawn_journal(&self.sessions, self.session_store.clone()).is_none() {
            tracing::warn!("Session journal was already running");
        }
        Ok(RestoreReport {
            active_kid,
            sessions,
        })
    }
}
