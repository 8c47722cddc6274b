use color_eyre::eyre::{WrapErr, eyre};
use openpass::AppResources;
use openpass::api::start_webserver;
use openpass::clock::{SharedClock, SystemClock};
use openpass::config::load_config_or_panic;
use openpass::maintenance::spawn_maintenance_task;
use sea_orm::Database;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn initialize_standard_tracing() {
    let default_directives = "openpass=info,tower_http=info,sea_orm=warn";
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));

    let registry = tracing_subscriber::registry().with(env_filter);
    let layer = fmt::layer().with_target(true).with_level(true);

    registry.with(layer).init();
}

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install()?;
    // A missing .env is fine.
    dotenvy::dotenv().ok();

    initialize_standard_tracing();

    let config = Arc::new(load_config_or_panic());

    let db = Arc::new(
        Database::connect(&config.database_url)
            .await
            .wrap_err("Failed to connect to database")?,
    );

    let clock: SharedClock = Arc::new(SystemClock);
    let resources = AppResources::new(config.clone(), db, clock)?;

    let restored = resources
        .start_persistence()
        .await
        .wrap_err("Failed to load persisted keys and sessions")?;
    tracing::info!(
        kid = restored.active_kid.as_deref(),
        sessions = restored.sessions,
        "Persisted state loaded"
    );

    // No signing key means no tokens; refuse to start.
    let kid = match config.keys.private_key_path.as_deref() {
        Some(path) => {
            let pem = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("Failed to read signing key from {path}"))?;
            resources.keys.initialize_from_pem(&pem)?
        }
        None => {
            let keys = resources.keys.clone();
            tokio::task::spawn_blocking(move || keys.initialize())
                .await
                .map_err(|e| eyre!("Key generation task failed: {e}"))??
        }
    };
    resources
        .key_storage
        .save(&resources.keys)
        .await
        .wrap_err("Failed to store signing keys")?;
    tracing::info!(
        kid = %kid,
        issuer = %config.issuer_url,
        providers = ?resources.broker.provider_ids(),
        "Signing key ready"
    );

    spawn_maintenance_task(Arc::new(resources.clone()));

    start_webserver(resources).await?;
    Ok(())
}
