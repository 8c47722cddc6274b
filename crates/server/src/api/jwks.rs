//! Public key discovery.

use crate::AppResources;
use crate::keys::jwk::JwkSet;
use axum::{
    Extension, Json,
    http::header::{CACHE_CONTROL, HeaderValue},
    response::IntoResponse,
};

/// Tag for OpenAPI documentation.
pub const KEYS_TAG: &str = "Keys";

/// JWKS with the active and retiring signing keys.
#[tracing::instrument(skip_all)]
#[utoipa::path(
    get,
    path = "/.well-known/jwks.json",
    tag = KEYS_TAG,
    operation_id = "JWKS",
    summary = "Public signing keys",
    description = "Keys able to verify access tokens issued by this broker. A rotated-out key stays listed \
                   until every token it signed has expired.",
    responses(
        (status = 200, description = "JSON Web Key Set", body = JwkSet, content_type = "application/json")
    )
)]
pub async fn jwks(Extension(resources): Extension<AppResources>) -> impl IntoResponse {
    (
        [(CACHE_CONTROL, HeaderValue::from_static("public, max-age=300"))],
        Json(resources.keys.public_key_set()),
    )
}
