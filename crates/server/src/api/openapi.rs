//! OpenAPI/Utoipa configuration.

use crate::api::{health::MISC_TAG, jwks::KEYS_TAG};
use crate::oauth2::AUTH_TAG;
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};

/// Security addon for OpenAPI documentation.
pub struct SecurityAddon;

impl Modify for SecurityAddon {
    #[tracing::instrument(skip(self, openapi))]
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        let bearer = HttpBuilder::new()
            .scheme(HttpAuthScheme::Bearer)
            .bearer_format("JWT")
            .description(Some(
                "Access token returned by `/auth/callback/{provider}` or `/auth/token`.",
            ))
            .build();
        components.add_security_scheme("Authorization", SecurityScheme::Http(bearer));
    }
}

/// OpenAPI documentation configuration.
#[derive(OpenApi)]
#[openapi(
    modifiers(&SecurityAddon),
    info(
        title = "openpass API",
        version = "0.1.0",
        description = "Identity broker: federated login, RS256 access tokens, rotating refresh tokens and JWKS."
    ),
    tags(
        (name = MISC_TAG, description = "Miscellaneous endpoints"),
        (name = KEYS_TAG, description = "Signing key discovery"),
        (name = AUTH_TAG, description = "Login, token and session endpoints")
    )
)]
pub struct ApiDoc;
