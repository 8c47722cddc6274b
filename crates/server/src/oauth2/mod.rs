//! Federated login through upstream OAuth2/OIDC providers.
//!
//! ## Flow
//!
//! - `GET /auth/start` creates a pending [`state::OAuthState`] with a PKCE
//!   verifier and redirects to the provider.
//! - `GET /auth/callback/{provider}` consumes that state, exchanges the code,
//!   fetches userinfo, links the account and opens a session.

pub mod broker;
pub mod identity;
pub mod provider;
pub mod retry;
pub mod state;

pub use broker::{AuthorizationRedirect, CallbackOutcome, OAuthBroker};
pub use identity::AccountLinker;
pub use provider::{Provider, ProviderClient, ProviderIdentity};

/// OpenAPI tag for the login endpoints
pub const AUTH_TAG: &str = "Auth";
