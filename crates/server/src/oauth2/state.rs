//! Pending authorization flows.
//!
//! One [`OAuthState`] is created per `/auth/start` and accepted at most once
//! by the matching callback. Consumed entries are kept until they expire so a
//! replayed callback is reported as such instead of as an unknown state.
//!
//! Anyone can start a flow, so the store is bounded: once `capacity` entries
//! are held, expired ones are purged inline and new flows are refused until
//! there is room again.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use dashmap::DashMap;
use sha2::{Digest, Sha256};

use crate::clock::SharedClock;
use crate::error::AuthError;
use crate::tokens::random_token;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthState {
    /// The opaque `state` value sent to the provider
    pub state: String,
    pub provider: String,
    /// Where the client goes after login
    pub redirect_uri: Option<String>,
    pub pkce_verifier: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub consumed: bool,
}

impl OAuthState {
    /// S256 PKCE challenge for the stored verifier.
    pub fn code_challenge(&self) -> String {
        pkce_challenge(&self.pkce_verifier)
    }
}

pub fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

#[derive(Debug)]
pub struct StateStore {
    states: DashMap<String, OAuthState>,
    ttl: i64,
    capacity: usize,
    clock: SharedClock,
}

impl StateStore {
    pub fn new(ttl: i64, capacity: usize, clock: SharedClock) -> Self {
        Self {
            states: DashMap::new(),
            ttl,
            capacity,
            clock,
        }
    }

    pub fn create(
        &self,
        provider: &str,
        redirect_uri: Option<String>,
    ) -> Result<OAuthState, AuthError> {
        if self.states.len() >= self.capacity {
            let purged = self.purge_expired();
            if self.states.len() >= self.capacity {
                tracing::warn!(
                    target: "openpass::security",
                    pending = self.states.len(),
                    capacity = self.capacity,
                    purged,
                    "Refusing new authorization flow, state store is full"
                );
                return Err(AuthError::TooManyPendingFlows);
            }
        }
        let now = self.clock.now();
        let state = OAuthState {
            state: random_token()?,
            provider: provider.to_string(),
            redirect_uri,
            pkce_verifier: random_token()?,
            created_at: now,
            expires_at: now + self.ttl,
            consumed: false,
        };
        self.states.insert(state.state.clone(), state.clone());
        Ok(state)
    }

    /// Marks `state` consumed and returns it, if it is live and belongs to
    /// `provider`. A state presented for the wrong provider is burned.
    pub fn consume(&self, state: &str, provider: &str) -> Result<OAuthState, AuthError> {
        let now = self.clock.now();
        let mut entry = self
            .states
            .get_mut(state)
            .ok_or(AuthError::InvalidOrExpiredState)?;

        if entry.consumed {
            return Err(AuthError::StateAlreadyConsumed);
        }
        if entry.expires_at <= now {
            drop(entry);
            self.states.remove(state);
            return Err(AuthError::InvalidOrExpiredState);
        }
        entry.consumed = true;
        if entry.provider != provider {
            tracing::warn!(
                target: "openpass::security",
                expected = %entry.provider,
                presented = %provider,
                "OAuth state presented for the wrong provider"
            );
            return Err(AuthError::InvalidOrExpiredState);
        }
        Ok(entry.clone())
    }

    /// Drops expired entries, consumed or not.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.states.len();
        self.states.retain(|_, s| s.expires_at > now);
        before.saturating_sub(self.states.len())
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use std::sync::Arc;

    fn store(clock: &MockClock) -> StateStore {
        StateStore::new(600, 1_000, Arc::new(clock.clone()))
    }

    #[test]
    fn state_is_single_use() {
        let clock = MockClock::new(10_000);
        let states = store(&clock);
        let created = states.create("google", None).unwrap();
        assert_eq!(created.state.len(), 43);

        let consumed = states.consume(&created.state, "google").unwrap();
        assert!(consumed.consumed);
        assert_eq!(consumed.pkce_verifier, created.pkce_verifier);
        assert!(matches!(
            states.consume(&created.state, "google"),
            Err(AuthError::StateAlreadyConsumed)
        ));
    }

    #[test]
    fn expired_and_unknown_states_are_rejected() {
        let clock = MockClock::new(10_000);
        let states = store(&clock);
        let created = states.create("google", None).unwrap();
        clock.advance(600);
        assert!(matches!(
            states.consume(&created.state, "google"),
            Err(AuthError::InvalidOrExpiredState)
        ));
        assert!(matches!(
            states.consume("bogus", "google"),
            Err(AuthError::InvalidOrExpiredState)
        ));
    }

    #[test]
    fn wrong_provider_burns_the_state() {
        let clock = MockClock::new(10_000);
        let states = store(&clock);
        let created = states.create("google", None).unwrap();
        assert!(matches!(
            states.consume(&created.state, "github"),
            Err(AuthError::InvalidOrExpiredState)
        ));
        assert!(matches!(
            states.consume(&created.state, "google"),
            Err(AuthError::StateAlreadyConsumed)
        ));
    }

    #[test]
    fn purge_drops_only_expired() {
        let clock = MockClock::new(10_000);
        let states = store(&clock);
        states.create("google", None).unwrap();
        clock.advance(300);
        states.create("github", Some("/home".into())).unwrap();
        clock.advance(301);
        assert_eq!(states.purge_expired(), 1);
        assert_eq!(states.len(), 1);
    }

    #[test]
    fn full_store_refuses_until_entries_expire() {
        let clock = MockClock::new(10_000);
        let states = StateStore::new(600, 2, Arc::new(clock.clone()));
        states.create("google", None).unwrap();
        clock.advance(100);
        states.create("google", None).unwrap();
        assert!(matches!(
            states.create("google", None),
            Err(AuthError::TooManyPendingFlows)
        ));
        assert_eq!(states.len(), 2);

        // The first entry expires; creating purges it inline.
        clock.advance(500);
        assert!(states.create("github", None).is_ok());
        assert_eq!(states.len(), 2);
    }

    #[test]
    fn pkce_challenge_matches_rfc7636_example() {
        assert_eq!(
            pkce_challenge("dBjftJeZ4CVP-1mB92K27uhbUJU1p1r_wW1gXFG2CDo"),
            "E9Melhoa2OwvFWTDC8ZAFq-S4pxPDZSS5ZD8jZKDd5k"
        );
    }
}
