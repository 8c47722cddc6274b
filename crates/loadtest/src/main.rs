use goose::prelude::*;
use std::env;

async fn health_check(user: &mut GooseUser) -> TransactionResult {
    let _goose_metrics = user.get("/healthz").await?;
    Ok(())
}

async fn fetch_jwks(user: &mut GooseUser) -> TransactionResult {
    let _goose_metrics = user.get("/.well-known/jwks.json").await?;
    Ok(())
}

/// Hits the callback with a state that was never issued. Covers the state
/// lookup and error path without leaving the broker.
async fn callback_with_unknown_state(user: &mut GooseUser) -> TransactionResult {
    let provider = env::var("PROVIDER").unwrap_or_else(|_| "google".to_string());
    let path = format!("/auth/callback/{provider}?code=loadtest&state=unknown");
    let request_builder = user.get_request_builder(&GooseMethod::Get, &path)?;
    let goose_request = GooseRequest::builder()
        .set_request_builder(request_builder)
        .expect_status_code(400)
        .build();
    let _goose_metrics = user.request(goose_request).await?;
    Ok(())
}

async fn session_without_token(user: &mut GooseUser) -> TransactionResult {
    let request_builder = user.get_request_builder(&GooseMethod::Get, "/auth/session")?;
    let goose_request = GooseRequest::builder()
        .set_request_builder(request_builder)
        .expect_status_code(401)
        .build();
    let _goose_metrics = user.request(goose_request).await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), GooseError> {
    println!(
        "Provider for callback requests: {}",
        env::var("PROVIDER").unwrap_or_else(|_| "google".to_string())
    );

    GooseAttack::initialize()?
        .register_scenario(
            scenario!("HealthCheck").register_transaction(transaction!(health_check)),
        )
        .register_scenario(
            scenario!("KeyDiscovery").register_transaction(transaction!(fetch_jwks)),
        )
        .register_scenario(
            scenario!("LoginFlow")
                .register_transaction(transaction!(callback_with_unknown_state))
                .register_transaction(transaction!(session_without_token)),
        )
        .execute()
        .await?;

    Ok(())
}
