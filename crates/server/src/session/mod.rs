//! Sessions and their refresh token families.
//!
//! Every login creates one session with one family of refresh tokens. Each
//! refresh token can be exchanged exactly once; presenting a spent token
//! revokes the whole family. All checks for one family run under its
//! `DashMap` entry guard, so concurrent rotations of the same token cannot
//! both succeed.
//!
//! Memory is authoritative while the process runs. Every change is also
//! emitted, in order, as a [`SessionEvent`] to an attached journal which
//! [`store::SessionStore`] writes to the database; on startup the stored
//! families are loaded back with [`SessionManager::restore`].

pub mod store;

use std::collections::HashMap;
use std::sync::OnceLock;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::config::SessionConfig;
use crate::error::AuthError;
use crate::tokens::{ClaimSet, IssuedAccessToken, RefreshRecord, TokenService, fingerprint};

/// Dead families are kept this long past session expiry so late replays are
/// still recognised.
pub(crate) const PURGE_GRACE_SECS: i64 = 3600;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub family_id: String,
    pub provider: Option<String>,
    pub tenant: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
    pub last_rotated_at: i64,
    pub revoked: bool,
}

/// Who the session is for.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub user_id: String,
    pub provider: Option<String>,
    pub tenant: Option<String>,
}

impl SessionContext {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum RevokeTarget<'a> {
    Session(&'a str),
    Family(&'a str),
}

/// Result of a login or a rotation.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub session: Session,
    pub access: IssuedAccessToken,
    pub refresh_token: String,
    pub refresh_expires_at: i64,
    pub generation: u64,
}

/// A family as persisted: its session, newest generation and every refresh
/// token record still known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyState {
    pub session: Session,
    pub generation: u64,
    pub tokens: Vec<RefreshRecord>,
}

/// One change to a family, emitted after it was applied in memory. Events for
/// the same family are emitted in the order they were applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created {
        session: Session,
        token: RefreshRecord,
    },
    Rotated {
        session: Session,
        generation: u64,
        /// Fingerprint of the token that was exchanged
        spent: String,
        used_at: i64,
        token: RefreshRecord,
    },
    Revoked {
        family_id: String,
    },
    Purged {
        family_ids: Vec<String>,
    },
}

#[derive(Debug)]
struct Family {
    session: Session,
    generation: u64,
    tokens: HashMap<String, RefreshRecord>,
}

impl Family {
    fn claims(&self) -> ClaimSet {
        ClaimSet::new(self.session.user_id.clone())
            .session(self.session.id.clone())
            .tenant(self.session.tenant.clone())
            .provider(self.session.provider.clone())
    }
}

#[derive(Debug)]
pub struct SessionManager {
    tokens: TokenService,
    clock: SharedClock,
    max_lifetime: i64,
    families: DashMap<String, Family>,
    by_token: DashMap<String, String>,
    by_session: DashMap<String, String>,
    journal: OnceLock<UnboundedSender<SessionEvent>>,
}

impl SessionManager {
    pub fn new(tokens: TokenService, clock: SharedClock, config: &SessionConfig) -> Self {
        Self {
            tokens,
            clock,
            max_lifetime: config.max_lifetime_secs,
            families: DashMap::new(),
            by_token: DashMap::new(),
            by_session: DashMap::new(),
            journal: OnceLock::new(),
        }
    }

    /// Sends every later change to `journal`. Only the first journal is
    /// kept; returns false if one was already attached.
    pub fn attach_journal(&self, journal: UnboundedSender<SessionEvent>) -> bool {
        self.journal.set(journal).is_ok()
    }

    fn record(&self, event: SessionEvent) {
        if let Some(journal) = self.journal.get() {
            if journal.send(event).is_err() {
                tracing::error!("Session journal is closed, change not persisted");
            }
        }
    }

    /// Loads persisted families. Families already in memory with the same id
    /// are replaced. Returns the number loaded.
    pub fn restore(&self, families: Vec<FamilyState>) -> usize {
        let count = families.len();
        for state in families {
            let family_id = state.session.family_id.clone();
            let mut tokens = HashMap::with_capacity(state.tokens.len());
            for record in state.tokens {
                self.by_token
                    .insert(record.fingerprint.clone(), family_id.clone());
                tokens.insert(record.fingerprint.clone(), record);
            }
            self.by_session
                .insert(state.session.id.clone(), family_id.clone());
            self.families.insert(
                family_id,
                Family {
                    session: state.session,
                    generation: state.generation,
                    tokens,
                },
            );
        }
        if count > 0 {
            info!(count, "Restored sessions");
        }
        count
    }

    pub fn token_service(&self) -> &TokenService {
        &self.tokens
    }

    /// Starts a session and issues generation 0 of its refresh family.
    #[tracing::instrument(skip(self, context), fields(user_id = %context.user_id))]
    pub fn create_session(&self, context: SessionContext) -> Result<TokenPair, AuthError> {
        let now = self.clock.now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            user_id: context.user_id,
            family_id: Uuid::new_v4().to_string(),
            provider: context.provider,
            tenant: context.tenant,
            created_at: now,
            expires_at: now + self.max_lifetime,
            last_rotated_at: now,
            revoked: false,
        };
        let mut family = Family {
            session,
            generation: 0,
            tokens: HashMap::new(),
        };

        let access = self.tokens.issue_access_token(family.claims())?;
        let refresh = self.tokens.issue_refresh_token(
            &family.session.id,
            &family.session.family_id,
            0,
            family.session.expires_at,
        )?;
        let fp = refresh.record.fingerprint.clone();
        let refresh_expires_at = refresh.record.expires_at;
        self.record(SessionEvent::Created {
            session: family.session.clone(),
            token: refresh.record.clone(),
        });
        family.tokens.insert(fp.clone(), refresh.record);

        let session = family.session.clone();
        self.by_session
            .insert(session.id.clone(), session.family_id.clone());
        self.by_token.insert(fp, session.family_id.clone());
        self.families.insert(session.family_id.clone(), family);

        info!(session_id = %session.id, family_id = %session.family_id, "Session created");
        Ok(TokenPair {
            session,
            access,
            refresh_token: refresh.token,
            refresh_expires_at,
            generation: 0,
        })
    }

    /// Exchanges a refresh token for the next generation.
    pub fn rotate_refresh(&self, token: &str) -> Result<TokenPair, AuthError> {
        let fp = fingerprint(token);
        let family_id = self
            .by_token
            .get(&fp)
            .map(|e| e.value().clone())
            .ok_or(AuthError::InvalidRefreshToken)?;

        let mut family = self
            .families
            .get_mut(&family_id)
            .ok_or(AuthError::InvalidRefreshToken)?;
        let now = self.clock.now();
        let record = family
            .tokens
            .get(&fp)
            .cloned()
            .ok_or(AuthError::InvalidRefreshToken)?;

        if record.used_at.is_some() {
            if !family.session.revoked {
                family.session.revoked = true;
                self.record(SessionEvent::Revoked {
                    family_id: family_id.clone(),
                });
            }
            warn!(
                target: "openpass::security",
                session_id = %family.session.id,
                family_id = %family.session.family_id,
                user_id = %family.session.user_id,
                generation = record.generation,
                "Refresh token reuse detected, family revoked"
            );
            return Err(AuthError::RefreshReuseDetected);
        }
        if family.session.revoked {
            return Err(AuthError::SessionRevoked);
        }
        if record.expires_at <= now || family.session.expires_at <= now {
            family.session.revoked = true;
            self.record(SessionEvent::Revoked {
                family_id: family_id.clone(),
            });
            info!(
                session_id = %family.session.id,
                family_id = %family.session.family_id,
                "Expired refresh token presented, family revoked"
            );
            return Err(AuthError::TokenExpired);
        }
        // Nothing may be spent if no access token can be signed afterwards.
        self.tokens.keys().current_signing_key()?;

        let generation = family.generation + 1;
        let refresh = self.tokens.issue_refresh_token(
            &family.session.id,
            &family.session.family_id,
            generation,
            family.session.expires_at,
        )?;

        if let Some(spent) = family.tokens.get_mut(&fp) {
            spent.used_at = Some(now);
        }
        let next_fp = refresh.record.fingerprint.clone();
        let refresh_expires_at = refresh.record.expires_at;
        family.tokens.insert(next_fp.clone(), refresh.record.clone());
        family.generation = generation;
        family.session.last_rotated_at = now;
        let session = family.session.clone();
        let claims = family.claims();
        self.record(SessionEvent::Rotated {
            session: session.clone(),
            generation,
            spent: fp,
            used_at: now,
            token: refresh.record,
        });
        drop(family);

        // Signing is the slow part and runs outside the family guard.
        self.by_token.insert(next_fp, family_id);
        let access = self.tokens.issue_access_token(claims)?;
        tracing::debug!(session_id = %session.id, generation, "Refresh token rotated");
        Ok(TokenPair {
            session,
            access,
            refresh_token: refresh.token,
            refresh_expires_at,
            generation,
        })
    }

    /// Revokes a session or family. Unknown ids are ignored.
    pub fn revoke(&self, target: RevokeTarget<'_>) {
        let family_id = match target {
            RevokeTarget::Family(id) => Some(id.to_string()),
            RevokeTarget::Session(id) => self.by_session.get(id).map(|e| e.value().clone()),
        };
        let Some(family_id) = family_id else {
            return;
        };
        if let Some(mut family) = self.families.get_mut(&family_id) {
            if !family.session.revoked {
                family.session.revoked = true;
                self.record(SessionEvent::Revoked {
                    family_id: family_id.clone(),
                });
                info!(
                    session_id = %family.session.id,
                    family_id = %family_id,
                    "Session revoked"
                );
            }
        }
    }

    /// Read-only check of a refresh token. Never consumes or revokes.
    pub fn validate(&self, token: &str) -> Result<Session, AuthError> {
        let fp = fingerprint(token);
        let family_id = self
            .by_token
            .get(&fp)
            .map(|e| e.value().clone())
            .ok_or(AuthError::InvalidRefreshToken)?;
        let family = self
            .families
            .get(&family_id)
            .ok_or(AuthError::InvalidRefreshToken)?;
        let record = family
            .tokens
            .get(&fp)
            .ok_or(AuthError::InvalidRefreshToken)?;

        let now = self.clock.now();
        if record.used_at.is_some() {
            return Err(AuthError::RefreshReuseDetected);
        }
        if family.session.revoked {
            return Err(AuthError::SessionRevoked);
        }
        if record.expires_at <= now || family.session.expires_at <= now {
            return Err(AuthError::TokenExpired);
        }
        Ok(family.session.clone())
    }

    pub fn session(&self, session_id: &str) -> Option<Session> {
        let family_id = self.by_session.get(session_id)?.value().clone();
        self.families.get(&family_id).map(|f| f.session.clone())
    }

    /// Session is known, unrevoked and unexpired.
    pub fn is_active(&self, session_id: &str) -> bool {
        let now = self.clock.now();
        self.session(session_id)
            .is_some_and(|s| !s.revoked && s.expires_at > now)
    }

    /// Drops families whose session ended more than a grace period ago.
    pub fn purge_expired(&self) -> usize {
        let cutoff = self.clock.now() - PURGE_GRACE_SECS;
        let mut dead: Vec<(String, String, Vec<String>)> = Vec::new();
        self.families.retain(|family_id, family| {
            if family.session.expires_at > cutoff {
                return true;
            }
            dead.push((
                family_id.clone(),
                family.session.id.clone(),
                family.tokens.keys().cloned().collect(),
            ));
            false
        });
        if dead.is_empty() {
            return 0;
        }

        let mut family_ids = Vec::with_capacity(dead.len());
        for (family_id, session_id, fingerprints) in dead {
            self.by_session.remove(&session_id);
            for fp in &fingerprints {
                self.by_token.remove(fp);
            }
            family_ids.push(family_id);
        }
        let count = family_ids.len();
        self.record(SessionEvent::Purged { family_ids });
        info!(count, "Purged expired sessions");
        count
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }
}
