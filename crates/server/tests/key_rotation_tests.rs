//! Signing key lifecycle as seen by token verification.

use openpass::clock::{MockClock, SharedClock};
use openpass::config::{KeyConfig, TokenConfig};
use openpass::error::AuthError;
use openpass::keys::{KeyStatus, KeyStore};
use openpass::tokens::{ClaimSet, TokenService};
use std::sync::Arc;

const ISSUER: &str = "https://auth.example.com";

fn create_test_services(clock: &MockClock) -> (Arc<KeyStore>, TokenService) {
    let shared: SharedClock = Arc::new(clock.clone());
    let keys = Arc::new(KeyStore::new(KeyConfig::default(), shared.clone()));
    keys.initialize().expect("initial key");
    let tokens = TokenService::new(keys.clone(), shared, ISSUER, &TokenConfig::default());
    (keys, tokens)
}

#[test]
fn test_token_signed_before_rotation_still_verifies() {
    let clock = MockClock::new(1_700_000_000);
    let (keys, tokens) = create_test_services(&clock);

    let old = tokens
        .issue_access_token(ClaimSet::new("user:google:1"))
        .expect("issue");
    let old_kid = keys.current_signing_key().unwrap().kid().to_string();

    clock.advance(60);
    let new_kid = keys.rotate().expect("rotate");
    assert_ne!(old_kid, new_kid);

    let claims = tokens.verify_access_token(&old.token).expect("old token valid");
    assert_eq!(claims.sub, "user:google:1");

    let fresh = tokens
        .issue_access_token(ClaimSet::new("user:google:2"))
        .expect("issue after rotation");
    let header = jsonwebtoken::decode_header(&fresh.token).expect("header");
    assert_eq!(header.kid.as_deref(), Some(new_kid.as_str()));
    tokens.verify_access_token(&fresh.token).expect("new token valid");

    let jwks = keys.public_key_set();
    assert_eq!(jwks.keys.len(), 2);
    assert!(jwks.find(&old_kid).is_some());
    assert!(jwks.find(&new_kid).is_some());
}

#[test]
fn test_retired_key_no_longer_verifies() {
    let clock = MockClock::new(1_700_000_000);
    let (keys, tokens) = create_test_services(&clock);
    let old = tokens
        .issue_access_token(ClaimSet::new("user:github:7"))
        .expect("issue");
    let old_kid = keys.current_signing_key().unwrap().kid().to_string();

    keys.rotate().expect("rotate");
    clock.advance(KeyConfig::default().grace_period_secs);
    assert_eq!(keys.expire_retiring(), 1);

    match tokens.verify_access_token(&old.token) {
        Err(AuthError::UnknownKey(kid)) => assert_eq!(kid, old_kid),
        other => panic!("expected UnknownKey, got {other:?}"),
    }
    assert!(keys.public_key_set().find(&old_kid).is_none());

    let infos = keys.keys();
    let retired = infos
        .iter()
        .find(|k| k.kid == old_kid)
        .expect("retired key metadata kept");
    assert_eq!(retired.status, KeyStatus::Retired);
}

#[test]
fn test_grace_period_not_yet_over() {
    let clock = MockClock::new(1_700_000_000);
    let (keys, tokens) = create_test_services(&clock);
    let old = tokens.issue_access_token(ClaimSet::new("u")).expect("issue");

    keys.rotate().expect("rotate");
    clock.advance(KeyConfig::default().grace_period_secs - 1);
    assert_eq!(keys.expire_retiring(), 0);
    // Past its own exp by now, but still signed by a known key.
    assert!(matches!(
        tokens.verify_access_token(&old.token),
        Err(AuthError::TokenExpired)
    ));
}

#[test]
fn test_expiry_honours_clock_skew() {
    let clock = MockClock::new(1_700_000_000);
    let (_keys, tokens) = create_test_services(&clock);
    let config = TokenConfig::default();
    let issued = tokens.issue_access_token(ClaimSet::new("u")).expect("issue");

    clock.advance(config.access_token_ttl_secs + config.clock_skew_secs);
    tokens
        .verify_access_token(&issued.token)
        .expect("within skew");

    clock.advance(1);
    assert!(matches!(
        tokens.verify_access_token(&issued.token),
        Err(AuthError::TokenExpired)
    ));
}

#[test]
fn test_token_from_another_key_store_is_unknown() {
    let clock = MockClock::new(1_700_000_000);
    let (_keys, tokens) = create_test_services(&clock);
    let (_other_keys, other_tokens) = create_test_services(&clock);

    let foreign = other_tokens
        .issue_access_token(ClaimSet::new("u"))
        .expect("issue");
    assert!(matches!(
        tokens.verify_access_token(&foreign.token),
        Err(AuthError::UnknownKey(_))
    ));
}

#[test]
fn test_tampered_payload_fails_signature() {
    let clock = MockClock::new(1_700_000_000);
    let (_keys, tokens) = create_test_services(&clock);
    let issued = tokens.issue_access_token(ClaimSet::new("alice")).expect("issue");

    let parts: Vec<&str> = issued.token.split('.').collect();
    let other = tokens.issue_access_token(ClaimSet::new("mallory")).expect("issue");
    let other_payload = other.token.split('.').nth(1).expect("payload");
    let forged = format!("{}.{}.{}", parts[0], other_payload, parts[2]);

    assert!(matches!(
        tokens.verify_access_token(&forged),
        Err(AuthError::TokenInvalidSignature)
    ));
    assert!(matches!(
        tokens.verify_access_token("not-a-jwt"),
        Err(AuthError::TokenInvalidSignature)
    ));
}

#[test]
fn test_uninitialized_store_cannot_sign() {
    let clock = MockClock::new(1_700_000_000);
    let shared: SharedClock = Arc::new(clock);
    let keys = Arc::new(KeyStore::new(KeyConfig::default(), shared.clone()));
    let tokens = TokenService::new(keys.clone(), shared, ISSUER, &TokenConfig::default());

    assert!(!keys.is_initialized());
    assert!(keys.public_key_set().keys.is_empty());
    assert!(matches!(
        tokens.issue_access_token(ClaimSet::new("u")),
        Err(AuthError::KeyStoreUninitialized)
    ));
}

#[test]
fn test_verification_during_rotation_never_fails() {
    let clock = MockClock::new(1_700_000_000);
    let (keys, tokens) = create_test_services(&clock);
    let issued = tokens.issue_access_token(ClaimSet::new("u")).expect("issue");

    std::thread::scope(|scope| {
        let verifiers: Vec<_> = (0..4)
            .map(|_| {
                let tokens = &tokens;
                let token = issued.token.as_str();
                scope.spawn(move || {
                    for _ in 0..50 {
                        tokens.verify_access_token(token).expect("verifies");
                    }
                })
            })
            .collect();
        keys.rotate().expect("rotate");
        for verifier in verifiers {
            verifier.join().expect("verifier thread");
        }
    });
}
