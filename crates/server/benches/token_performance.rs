use criterion::{Criterion, black_box, criterion_group, criterion_main};
use openpass::clock::{SharedClock, SystemClock};
use openpass::config::{KeyConfig, SessionConfig, TokenConfig};
use openpass::keys::KeyStore;
use openpass::session::{SessionContext, SessionManager};
use openpass::tokens::{ClaimSet, TokenService, fingerprint, random_token};
use std::sync::Arc;

fn token_service() -> TokenService {
    let clock: SharedClock = Arc::new(SystemClock);
    let keys = Arc::new(KeyStore::new(KeyConfig::default(), clock.clone()));
    keys.initialize().unwrap();
    TokenService::new(
        keys,
        clock,
        "https://auth.example.com",
        &TokenConfig::default(),
    )
}

fn benchmark_access_tokens(c: &mut Criterion) {
    let tokens = token_service();

    c.bench_function("issue_access_token", |b| {
        b.iter(|| {
            let claims = ClaimSet::new("user:google:1")
                .session("bench-session")
                .provider(Some("google".to_string()));
            black_box(tokens.issue_access_token(black_box(claims)).unwrap());
        });
    });

    let issued = tokens
        .issue_access_token(ClaimSet::new("user:google:1"))
        .unwrap();
    c.bench_function("verify_access_token", |b| {
        b.iter(|| {
            black_box(tokens.verify_access_token(black_box(&issued.token)).unwrap());
        });
    });
}

fn benchmark_refresh_tokens(c: &mut Criterion) {
    c.bench_function("random_token_and_fingerprint", |b| {
        b.iter(|| {
            let token = random_token().unwrap();
            black_box(fingerprint(&token));
        });
    });

    let tokens = token_service();
    let clock: SharedClock = Arc::new(SystemClock);
    let sessions = SessionManager::new(tokens, clock, &SessionConfig::default());

    // Each rotation signs a new access token, so this includes one RS256 signature.
    c.bench_function("rotate_refresh", |b| {
        let mut current = sessions
            .create_session(SessionContext::for_user("user:google:1"))
            .unwrap()
            .refresh_token;
        b.iter(|| {
            let pair = sessions.rotate_refresh(black_box(&current)).unwrap();
            current = pair.refresh_token;
        });
    });
}

fn benchmark_key_lookup(c: &mut Criterion) {
    let tokens = token_service();
    let kid = tokens.keys().current_signing_key().unwrap().kid().to_string();

    c.bench_function("jwks_snapshot", |b| {
        b.iter(|| black_box(tokens.keys().public_key_set()));
    });

    c.bench_function("lookup_verification_key", |b| {
        b.iter(|| black_box(tokens.keys().lookup_verification_key(black_box(&kid)).unwrap()));
    });
}

criterion_group!(
    benches,
    benchmark_access_tokens,
    benchmark_refresh_tokens,
    benchmark_key_lookup
);
criterion_main!(benches);
