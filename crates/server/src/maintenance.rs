//! Periodic housekeeping: key rotation, key expiry, and purging of stale
//! OAuth states and sessions.

use std::sync::Arc;
use std::time::Duration;

use crate::AppResources;

/// Counts from one maintenance pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// kid of a key activated by this pass
    pub rotated: Option<String>,
    pub keys_retired: usize,
    pub states_purged: usize,
    pub sessions_purged: usize,
}

/// Runs every housekeeping step once.
///
/// Key generation runs on the blocking pool.
pub async fn run_once(resources: &AppResources) -> MaintenanceReport {
    let mut report = MaintenanceReport::default();

    if resources.keys.rotation_due() {
        let keys = resources.keys.clone();
        match tokio::task::spawn_blocking(move || keys.rotate()).await {
            Ok(Ok(kid)) => report.rotated = Some(kid),
            Ok(Err(e)) => tracing::error!(error = %e, "Scheduled key rotation failed"),
            Err(e) => tracing::error!(error = %e, "Key rotation task panicked"),
        }
    }
    report.keys_retired = resources.keys.expire_retiring();
    if report.rotated.is_some() || report.keys_retired > 0 {
        if let Err(e) = resources.key_storage.save(&resources.keys).await {
            tracing::error!(error = %e, "Failed to store signing keys");
        }
    }
    report.states_purged = resources.broker.purge_expired_states();
    report.sessions_purged = resources.sessions.purge_expired();

    if report != MaintenanceReport::default() {
        tracing::info!(
            rotated = report.rotated.as_deref(),
            keys_retired = report.keys_retired,
            states_purged = report.states_purged,
            sessions_purged = report.sessions_purged,
            "Maintenance pass"
        );
    }
    report
}

/// Spawns the maintenance loop on the configured interval.
pub fn spawn_maintenance_task(resources: Arc<AppResources>) -> tokio::task::JoinHandle<()> {
    let period = Duration::from_secs(resources.config.keys.maintenance_interval_secs.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            run_once(&resources).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{MockClock, SharedClock};
    use crate::config::AppConfig;
    use crate::session::SessionContext;
    use sea_orm::Database;

    async fn resources(clock: &MockClock) -> AppResources {
        let db = Database::connect("sqlite::memory:").await.expect("connect");
        let shared: SharedClock = Arc::new(clock.clone());
        let resources =
            AppResources::new(Arc::new(AppConfig::default()), Arc::new(db), shared).unwrap();
        resources.keys.initialize().unwrap();
        resources
    }

    #[tokio::test]
    async fn idle_pass_does_nothing() {
        let clock = MockClock::new(1_700_000_000);
        let resources = resources(&clock).await;
        assert_eq!(run_once(&resources).await, MaintenanceReport::default());
    }

    #[tokio::test]
    async fn rotates_when_due_and_retires_after_grace() {
        let clock = MockClock::new(1_700_000_000);
        let resources = resources(&clock).await;
        let first = resources.keys.current_signing_key().unwrap().kid().to_string();

        clock.advance(resources.config.keys.rotation_interval_secs);
        let report = run_once(&resources).await;
        let rotated = report.rotated.expect("rotation");
        assert_ne!(rotated, first);
        assert_eq!(resources.keys.public_key_set().keys.len(), 2);

        clock.advance(resources.config.keys.grace_period_secs);
        let report = run_once(&resources).await;
        assert_eq!(report.keys_retired, 1);
        assert!(resources.keys.public_key_set().find(&first).is_none());
    }

    #[tokio::test]
    async fn purges_dead_sessions_and_states() {
        let clock = MockClock::new(1_700_000_000);
        let mut config = AppConfig::default();
        config.providers.insert(
            "google".into(),
            crate::config::ProviderConfig {
                client_id: "gid".into(),
                ..Default::default()
            },
        );
        let db = Database::connect("sqlite::memory:").await.expect("connect");
        let resources =
            AppResources::new(Arc::new(config), Arc::new(db), Arc::new(clock.clone())).unwrap();
        resources.keys.initialize().unwrap();

        resources
            .sessions
            .create_session(SessionContext::for_user("u"))
            .unwrap();
        resources
            .broker
            .start_authorization("google", None)
            .unwrap();

        clock.advance(resources.config.sessions.max_lifetime_secs + 2 * 3600);
        let report = run_once(&resources).await;
        assert_eq!(report.states_purged, 1);
        assert_eq!(report.sessions_purged, 1);
        assert!(resources.sessions.is_empty());
    }
}
