//! Refresh token rotation, reuse detection and revocation.

use openpass::clock::{MockClock, SharedClock};
use openpass::config::{KeyConfig, SessionConfig, TokenConfig};
use openpass::error::AuthError;
use openpass::keys::KeyStore;
use openpass::session::{RevokeTarget, SessionContext, SessionManager};
use openpass::tokens::TokenService;
use std::sync::Arc;

fn create_test_sessions(clock: &MockClock, tokens: TokenConfig, sessions: SessionConfig) -> SessionManager {
    let shared: SharedClock = Arc::new(clock.clone());
    let keys = Arc::new(KeyStore::new(KeyConfig::default(), shared.clone()));
    keys.initialize().expect("initial key");
    let service = TokenService::new(keys, shared.clone(), "https://auth.example.com", &tokens);
    SessionManager::new(service, shared, &sessions)
}

fn default_sessions(clock: &MockClock) -> SessionManager {
    create_test_sessions(clock, TokenConfig::default(), SessionConfig::default())
}

#[test]
fn test_login_issues_verifiable_access_token() {
    let clock = MockClock::new(1_700_000_000);
    let sessions = default_sessions(&clock);

    let pair = sessions
        .create_session(SessionContext {
            user_id: "user:google:1".into(),
            provider: Some("google".into()),
            tenant: Some("acme".into()),
        })
        .expect("session");
    assert_eq!(pair.generation, 0);

    let claims = sessions
        .token_service()
        .verify_access_token(&pair.access.token)
        .expect("valid access token");
    assert_eq!(claims.sub, "user:google:1");
    assert_eq!(claims.sid.as_deref(), Some(pair.session.id.as_str()));
    assert_eq!(claims.tid.as_deref(), Some("acme"));
    assert_eq!(claims.provider.as_deref(), Some("google"));
    assert!(sessions.is_active(&pair.session.id));
}

#[test]
fn test_rotation_chain_and_reuse_revokes_family() {
    let clock = MockClock::new(1_700_000_000);
    let sessions = default_sessions(&clock);
    let first = sessions
        .create_session(SessionContext::for_user("u"))
        .expect("session");

    clock.advance(10);
    let second = sessions.rotate_refresh(&first.refresh_token).expect("rotate 1");
    assert_eq!(second.generation, 1);
    let third = sessions.rotate_refresh(&second.refresh_token).expect("rotate 2");
    assert_eq!(third.generation, 2);
    assert_eq!(third.session.id, first.session.id);

    // Replaying generation 0 burns the whole family.
    assert!(matches!(
        sessions.rotate_refresh(&first.refresh_token),
        Err(AuthError::RefreshReuseDetected)
    ));
    assert!(matches!(
        sessions.rotate_refresh(&third.refresh_token),
        Err(AuthError::SessionRevoked)
    ));
    assert!(!sessions.is_active(&first.session.id));
}

#[test]
fn test_signout_then_refresh_is_revoked() {
    let clock = MockClock::new(1_700_000_000);
    let sessions = default_sessions(&clock);
    let pair = sessions
        .create_session(SessionContext::for_user("u"))
        .expect("session");

    sessions.revoke(RevokeTarget::Session(&pair.session.id));
    assert!(matches!(
        sessions.rotate_refresh(&pair.refresh_token),
        Err(AuthError::SessionRevoked)
    ));
    assert!(matches!(
        sessions.validate(&pair.refresh_token),
        Err(AuthError::SessionRevoked)
    ));

    // Revoking twice, or something unknown, is harmless.
    sessions.revoke(RevokeTarget::Session(&pair.session.id));
    sessions.revoke(RevokeTarget::Family("no-such-family"));
}

#[test]
fn test_revoking_one_session_leaves_others() {
    let clock = MockClock::new(1_700_000_000);
    let sessions = default_sessions(&clock);
    let a = sessions.create_session(SessionContext::for_user("u")).unwrap();
    let b = sessions.create_session(SessionContext::for_user("u")).unwrap();

    sessions.revoke(RevokeTarget::Family(&a.session.family_id));
    assert!(!sessions.is_active(&a.session.id));
    sessions.rotate_refresh(&b.refresh_token).expect("other session unaffected");
}

#[test]
fn test_refresh_expiry_bounded_by_session_lifetime() {
    let clock = MockClock::new(1_700_000_000);
    let sessions = create_test_sessions(
        &clock,
        TokenConfig {
            refresh_token_ttl_secs: 3600,
            ..TokenConfig::default()
        },
        SessionConfig {
            max_lifetime_secs: 5000,
            ..SessionConfig::default()
        },
    );
    let pair = sessions.create_session(SessionContext::for_user("u")).unwrap();
    assert_eq!(pair.refresh_expires_at, 1_700_000_000 + 3600);

    clock.advance(3000);
    let next = sessions.rotate_refresh(&pair.refresh_token).unwrap();
    // now + 3600 would pass the session end
    assert_eq!(next.refresh_expires_at, pair.session.expires_at);

    clock.set(pair.session.expires_at);
    assert!(matches!(
        sessions.rotate_refresh(&next.refresh_token),
        Err(AuthError::TokenExpired)
    ));
    assert!(!sessions.is_active(&pair.session.id));
}

#[test]
fn test_unknown_refresh_token() {
    let clock = MockClock::new(1_700_000_000);
    let sessions = default_sessions(&clock);
    assert!(matches!(
        sessions.rotate_refresh("made-up"),
        Err(AuthError::InvalidRefreshToken)
    ));
    assert!(matches!(
        sessions.validate(""),
        Err(AuthError::InvalidRefreshToken)
    ));
}

#[test]
fn test_validate_does_not_consume() {
    let clock = MockClock::new(1_700_000_000);
    let sessions = default_sessions(&clock);
    let pair = sessions.create_session(SessionContext::for_user("u")).unwrap();

    for _ in 0..3 {
        let session = sessions.validate(&pair.refresh_token).expect("valid");
        assert_eq!(session.id, pair.session.id);
    }
    sessions.rotate_refresh(&pair.refresh_token).expect("still usable");
}

#[test]
fn test_concurrent_rotation_has_single_winner() {
    let clock = MockClock::new(1_700_000_000);
    let sessions = default_sessions(&clock);
    let pair = sessions.create_session(SessionContext::for_user("u")).unwrap();

    let results: Vec<Result<_, AuthError>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let sessions = &sessions;
                let token = pair.refresh_token.as_str();
                scope.spawn(move || sessions.rotate_refresh(token))
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rotation thread"))
            .collect()
    });

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, AuthError::RefreshReuseDetected | AuthError::SessionRevoked))
    );
    assert!(!sessions.is_active(&pair.session.id));
}

#[test]
fn test_purge_keeps_recent_sessions() {
    let clock = MockClock::new(1_700_000_000);
    let sessions = default_sessions(&clock);
    let old = sessions.create_session(SessionContext::for_user("old")).unwrap();

    clock.advance(SessionConfig::default().max_lifetime_secs);
    let fresh = sessions.create_session(SessionContext::for_user("new")).unwrap();
    assert_eq!(sessions.purge_expired(), 0, "still inside the purge grace");

    clock.advance(2 * 3600);
    assert_eq!(sessions.purge_expired(), 1);
    assert!(sessions.session(&old.session.id).is_none());
    assert!(matches!(
        sessions.rotate_refresh(&old.refresh_token),
        Err(AuthError::InvalidRefreshToken)
    ));
    assert!(sessions.is_active(&fresh.session.id));
}
