//! HTTP API.
//!
//! - `health` - liveness (`/healthz`) and banner (`/`)
//! - `jwks` - public keys (`/.well-known/jwks.json`)
//! - `auth` - login flow, token rotation, introspection, signout (`/auth/*`)
//! - `openapi` - OpenAPI/Utoipa configuration, served as Redoc at `/api-docs`

pub mod auth;
pub mod health;
pub mod jwks;
pub mod openapi;

pub use health::MISC_TAG;
pub use jwks::KEYS_TAG;

use crate::AppResources;
use axum::Router;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::OpenApi;
use utoipa_axum::{router::OpenApiRouter, routes};
use utoipa_redoc::{Redoc, Servable};

/// Builds the full application router, documentation included.
pub fn app(resources: AppResources) -> Router {
    let (router, api) = OpenApiRouter::with_openapi(openapi::ApiDoc::openapi())
        .routes(routes!(health::health))
        .routes(routes!(health::root))
        .routes(routes!(jwks::jwks))
        .merge(auth::router())
        .layer(axum::Extension(resources))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .split_for_parts();

    router.merge(Redoc::with_url("/api-docs", api))
}

/// Starts the web server with all configured routes.
#[tracing::instrument(skip(resources))]
pub async fn start_webserver(resources: AppResources) -> color_eyre::Result<()> {
    let addr = resources.config.listen_addr.clone();
    let router = app(resources);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "Server running");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .map_err(|e| color_eyre::Report::msg(format!("Failed to start server: {e}")))?;

    Ok(())
}
