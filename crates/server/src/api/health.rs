//! Liveness and banner endpoints.

use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Tag for OpenAPI documentation.
pub const MISC_TAG: &str = "Miscellaneous";

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct Banner {
    pub hello: String,
}

/// Health check endpoint.
#[tracing::instrument()]
#[utoipa::path(
    method(get, head),
    path = "/healthz",
    tag = MISC_TAG,
    operation_id = "Health Check",
    summary = "Service health check",
    description = "Returns `ok` while the process is accepting requests. Supports GET and HEAD.",
    responses(
        (status = 200, description = "Service is healthy", body = str, content_type = "text/plain", example = "ok")
    )
)]
pub async fn health() -> &'static str {
    "ok"
}

/// Service banner.
#[tracing::instrument()]
#[utoipa::path(
    get,
    path = "/",
    tag = MISC_TAG,
    operation_id = "Banner",
    responses(
        (status = 200, description = "Service name", body = Banner, content_type = "application/json")
    )
)]
pub async fn root() -> Json<Banner> {
    Json(Banner {
        hello: "openpass".to_string(),
    })
}
