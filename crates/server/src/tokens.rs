//! Access token signing/verification and opaque refresh token minting.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jsonwebtoken::{Algorithm, Header, Validation, decode, decode_header, encode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::clock::SharedClock;
use crate::config::TokenConfig;
use crate::error::AuthError;
use crate::keys::KeyStore;

/// Claims managed by the service; never taken from caller-supplied extras.
const REGISTERED_CLAIMS: &[&str] = &["sub", "iss", "iat", "exp", "sid", "tid", "provider"];

/// Payload of an access token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    /// Session id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    /// Tenant id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Caller-controlled part of an access token.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClaimSet {
    pub sub: String,
    pub sid: Option<String>,
    pub tid: Option<String>,
    pub provider: Option<String>,
    pub extra: Map<String, Value>,
}

impl ClaimSet {
    pub fn new(sub: impl Into<String>) -> Self {
        Self {
            sub: sub.into(),
            ..Default::default()
        }
    }

    pub fn session(mut self, sid: impl Into<String>) -> Self {
        self.sid = Some(sid.into());
        self
    }

    pub fn tenant(mut self, tid: Option<String>) -> Self {
        self.tid = tid;
        self
    }

    pub fn provider(mut self, provider: Option<String>) -> Self {
        self.provider = provider;
        self
    }

    pub fn claim(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct IssuedAccessToken {
    pub token: String,
    pub claims: AccessClaims,
    /// Seconds until `exp`
    pub expires_in: i64,
}

/// Server-side state of one refresh token. The token itself is only ever
/// stored as its fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshRecord {
    pub fingerprint: String,
    pub family_id: String,
    pub generation: u64,
    pub session_id: String,
    pub issued_at: i64,
    pub expires_at: i64,
    pub used_at: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct IssuedRefreshToken {
    pub token: String,
    pub record: RefreshRecord,
}

/// 256 random bits, base64url encoded.
pub fn random_token() -> Result<String, AuthError> {
    let mut bytes = [0u8; 32];
    getrandom::fill(&mut bytes)
        .map_err(|e| AuthError::Internal(format!("failed to generate random bytes: {e}")))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Lookup key for a refresh token.
pub fn fingerprint(token: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(token.as_bytes()))
}

#[derive(Clone, Debug)]
pub struct TokenService {
    keys: Arc<KeyStore>,
    clock: SharedClock,
    issuer: String,
    access_ttl: i64,
    refresh_ttl: i64,
    skew: i64,
}

impl TokenService {
    pub fn new(
        keys: Arc<KeyStore>,
        clock: SharedClock,
        issuer: impl Into<String>,
        config: &TokenConfig,
    ) -> Self {
        Self {
            keys,
            clock,
            issuer: issuer.into(),
            access_ttl: config.access_token_ttl_secs,
            refresh_ttl: config.refresh_token_ttl_secs,
            skew: config.clock_skew_secs,
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn access_token_ttl(&self) -> i64 {
        self.access_ttl
    }

    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    /// Signs `claims` with the active key.
    #[tracing::instrument(skip(self, claims), fields(sub = %claims.sub))]
    pub fn issue_access_token(&self, claims: ClaimSet) -> Result<IssuedAccessToken, AuthError> {
        let key = self.keys.current_signing_key()?;
        let now = self.clock.now();

        let mut extra = claims.extra;
        extra.retain(|name, _| !REGISTERED_CLAIMS.contains(&name.as_str()));
        let claims = AccessClaims {
            sub: claims.sub,
            iss: self.issuer.clone(),
            iat: now,
            exp: now + self.access_ttl,
            sid: claims.sid,
            tid: claims.tid,
            provider: claims.provider,
            extra,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(key.kid().to_string());
        header.typ = Some("JWT".to_string());

        let token = encode(&header, &claims, key.encoding_key())
            .map_err(|e| AuthError::Internal(format!("failed to sign access token: {e}")))?;
        Ok(IssuedAccessToken {
            token,
            claims,
            expires_in: self.access_ttl,
        })
    }

    /// Checks kid, signature, issuer and expiry, in that order.
    pub fn verify_access_token(&self, token: &str) -> Result<AccessClaims, AuthError> {
        let header = decode_header(token).map_err(|_| AuthError::TokenInvalidSignature)?;
        if header.alg != Algorithm::RS256 {
            return Err(AuthError::TokenInvalidSignature);
        }
        let kid = header.kid.ok_or(AuthError::TokenInvalidSignature)?;
        let key = self.keys.lookup_verification_key(&kid)?;

        let mut validation = Validation::new(Algorithm::RS256);
        // Expiry is checked below against the injected clock.
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["sub", "iss", "exp"]);
        validation.set_issuer(&[self.issuer.as_str()]);

        let data = decode::<AccessClaims>(token, key.decoding_key(), &validation).map_err(|e| {
            tracing::debug!(error = %e, kid = %kid, "Access token rejected");
            AuthError::TokenInvalidSignature
        })?;

        if data.claims.exp + self.skew < self.clock.now() {
            return Err(AuthError::TokenExpired);
        }
        Ok(data.claims)
    }

    /// Mints a refresh token for `session_id`. It never outlives the session.
    pub fn issue_refresh_token(
        &self,
        session_id: &str,
        family_id: &str,
        generation: u64,
        session_expires_at: i64,
    ) -> Result<IssuedRefreshToken, AuthError> {
        let token = random_token()?;
        let now = self.clock.now();
        let record = RefreshRecord {
            fingerprint: fingerprint(&token),
            family_id: family_id.to_string(),
            generation,
            session_id: session_id.to_string(),
            issued_at: now,
            expires_at: (now + self.refresh_ttl).min(session_expires_at),
            used_at: None,
        };
        Ok(IssuedRefreshToken { token, record })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::config::KeyConfig;

    fn service(clock: &MockClock) -> TokenService {
        let keys = Arc::new(KeyStore::new(KeyConfig::default(), Arc::new(clock.clone())));
        keys.initialize().unwrap();
        TokenService::new(
            keys,
            Arc::new(clock.clone()),
            "https://auth.example.com",
            &TokenConfig::default(),
        )
    }

    #[test]
    fn issued_token_verifies_with_same_claims() {
        let clock = MockClock::new(1_700_000_000);
        let tokens = service(&clock);
        let issued = tokens
            .issue_access_token(
                ClaimSet::new("user:google:1")
                    .session("sess-1")
                    .tenant(Some("acme".into()))
                    .claim("role", "admin"),
            )
            .unwrap();

        let claims = tokens.verify_access_token(&issued.token).unwrap();
        assert_eq!(claims, issued.claims);
        assert_eq!(claims.iss, "https://auth.example.com");
        assert_eq!(claims.exp - claims.iat, 900);
        assert_eq!(claims.extra["role"], "admin");
    }

    #[test]
    fn header_carries_kid_and_type() {
        let clock = MockClock::new(1_700_000_000);
        let tokens = service(&clock);
        let issued = tokens.issue_access_token(ClaimSet::new("u")).unwrap();
        let header = decode_header(&issued.token).unwrap();
        assert_eq!(header.alg, Algorithm::RS256);
        assert_eq!(header.typ.as_deref(), Some("JWT"));
        assert_eq!(
            header.kid.as_deref(),
            Some(tokens.keys().current_signing_key().unwrap().kid())
        );
    }

    #[test]
    fn extras_cannot_override_registered_claims() {
        let clock = MockClock::new(1_700_000_000);
        let tokens = service(&clock);
        let issued = tokens
            .issue_access_token(ClaimSet::new("u").claim("exp", 1).claim("iss", "evil"))
            .unwrap();
        let claims = tokens.verify_access_token(&issued.token).unwrap();
        assert_eq!(claims.exp, 1_700_000_900);
        assert!(claims.extra.is_empty());
    }

    #[test]
    fn skew_applies_to_expiry() {
        let clock = MockClock::new(1_700_000_000);
        let tokens = service(&clock);
        let issued = tokens.issue_access_token(ClaimSet::new("u")).unwrap();

        clock.advance(900 + 5);
        assert!(tokens.verify_access_token(&issued.token).is_ok());
        clock.advance(1);
        assert!(matches!(
            tokens.verify_access_token(&issued.token),
            Err(AuthError::TokenExpired)
        ));
    }

    #[test]
    fn garbage_is_an_invalid_signature() {
        let clock = MockClock::new(1_700_000_000);
        let tokens = service(&clock);
        assert!(matches!(
            tokens.verify_access_token("not.a.jwt"),
            Err(AuthError::TokenInvalidSignature)
        ));
    }

    #[test]
    fn tampered_payload_fails_signature() {
        let clock = MockClock::new(1_700_000_000);
        let tokens = service(&clock);
        let issued = tokens.issue_access_token(ClaimSet::new("alice")).unwrap();
        let other = tokens.issue_access_token(ClaimSet::new("mallory")).unwrap();

        let parts: Vec<&str> = issued.token.split('.').collect();
        let other_parts: Vec<&str> = other.token.split('.').collect();
        let forged = format!("{}.{}.{}", parts[0], other_parts[1], parts[2]);
        assert!(matches!(
            tokens.verify_access_token(&forged),
            Err(AuthError::TokenInvalidSignature)
        ));
    }

    #[test]
    fn refresh_expiry_is_capped_by_session() {
        let clock = MockClock::new(1_000);
        let tokens = service(&clock);
        let refresh = tokens.issue_refresh_token("s", "f", 0, 1_500).unwrap();
        assert_eq!(refresh.record.expires_at, 1_500);
        assert_eq!(refresh.record.fingerprint, fingerprint(&refresh.token));
        assert_eq!(refresh.token.len(), 43);
    }
}
