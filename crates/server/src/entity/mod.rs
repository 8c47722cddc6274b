pub mod app_user;
pub mod auth_session;
pub mod linked_identity;
pub mod refresh_token;
pub mod signing_key;
