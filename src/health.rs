//! Connection health for provider instances.
//!
//! A WhatsApp session can silently drift away from what the local record
//! says about it. The health manager compares both sides, repairs the local
//! record when the provider is authoritative, walks a two-step recovery
//! ladder for sessions that look salvageable, and tears down sessions the
//! provider can no longer account for.

use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::breaker::{self, CircuitBreaker};
use crate::config;
use crate::db::{self, Pool};
use crate::error::{Error, Result};
use crate::model::Instance;
use crate::provider::model::SessionState;
use crate::provider::ProviderGateway;

/// Classified condition of one provider instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceHealth {
    /// Session connected and the local record agrees (possibly after repair).
    Healthy,
    /// Mid-connection, recently observed; worth waiting or a light recovery.
    Degraded,
    /// State the provider cannot account for; the session must be rebuilt.
    Corrupted,
    /// Connecting for longer than the stuck window.
    Stuck,
    /// Cleanly logged out or awaiting QR pairing.
    Disconnected,
    /// No local record for this session name.
    NotFound,
}

/// Outcome of a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    pub health: InstanceHealth,
    pub should_cleanup: bool,
}

impl HealthReport {
    fn of(health: InstanceHealth) -> Self {
        Self {
            health,
            should_cleanup: false,
        }
    }

    fn cleanup(health: InstanceHealth) -> Self {
        Self {
            health,
            should_cleanup: true,
        }
    }
}

pub struct HealthManager {
    /// Pause between a recovery action and the re-check that judges it.
    settle: Duration,
    /// How long a session may sit in Connecting before it counts as stuck.
    stuck_after_secs: i64,
}

impl HealthManager {
    pub fn new(cfg: &config::Health) -> Self {
        Self::with_windows(
            Duration::from_millis(cfg.settle_ms),
            cfg.stuck_after_secs,
        )
    }

    pub fn with_windows(settle: Duration, stuck_after_secs: i64) -> Self {
        Self {
            settle,
            stuck_after_secs,
        }
    }

    /// Compare the provider's view of a session with the local record and
    /// classify. The provider status and the local row are fetched
    /// concurrently. A local record that lags a connected session is
    /// repaired in place here.
    #[instrument(skip_all, fields(provider_ref = provider_ref))]
    pub async fn check_health(
        &self,
        pool: &Pool,
        provider: &dyn ProviderGateway,
        provider_ref: &str,
    ) -> Result<HealthReport> {
        let (status, local) = tokio::join!(
            provider.get_status(provider_ref),
            db::fetch_instance_by_ref(pool, provider_ref),
        );

        let Some(instance) = local? else {
            return Ok(HealthReport::of(InstanceHealth::NotFound));
        };

        let status = match status {
            Ok(status) => status,
            Err(err) => {
                warn!(error = %err, "session status query failed");
                return Ok(HealthReport::cleanup(InstanceHealth::Corrupted));
            }
        };

        let report = match status.state {
            SessionState::Connected => match status.phone_number {
                Some(ref phone) => {
                    let in_sync = instance.status_connection == 1
                        && instance.phone.as_deref() == Some(phone.as_str());
                    if !in_sync {
                        db::set_instance_connection(pool, instance.id, true, Some(phone)).await?;
                        debug!("local record synchronized with provider");
                    }
                    HealthReport::of(InstanceHealth::Healthy)
                }
                // Connected without a number is the fake-connected anomaly;
                // the session is unusable and must never pass as healthy.
                None => {
                    warn!("session reports connected without a phone number");
                    HealthReport::cleanup(InstanceHealth::Corrupted)
                }
            },
            SessionState::Disconnected | SessionState::AwaitingScan => {
                HealthReport::of(InstanceHealth::Disconnected)
            }
            SessionState::Connecting => {
                if self.connecting_too_long(&instance) {
                    HealthReport::of(InstanceHealth::Stuck)
                } else {
                    HealthReport::of(InstanceHealth::Degraded)
                }
            }
            SessionState::Failed => {
                warn!("session reports a failed state");
                HealthReport::cleanup(InstanceHealth::Corrupted)
            }
            SessionState::Other(ref raw) => {
                warn!(status = %raw, "session in unrecognized state");
                HealthReport::cleanup(InstanceHealth::Corrupted)
            }
        };
        Ok(report)
    }

    fn connecting_too_long(&self, instance: &Instance) -> bool {
        match instance.synced_at {
            Some(synced_at) => (Utc::now() - synced_at).num_seconds() >= self.stuck_after_secs,
            // Never synced: give the session the benefit of the doubt once.
            None => false,
        }
    }

    /// Two-step recovery ladder. First a plain reconnect; if the session
    /// still is not usable, a logout followed by a fresh reconnect. Returns
    /// whether the session ended up usable (connected or cleanly
    /// disconnected).
    #[instrument(skip_all, fields(provider_ref = provider_ref))]
    pub async fn try_recover(
        &self,
        pool: &Pool,
        provider: &dyn ProviderGateway,
        provider_ref: &str,
    ) -> Result<bool> {
        info!("attempting session reconnect");
        match provider.reconnect(provider_ref).await {
            Ok(()) => {
                sleep(self.settle).await;
                if self.recheck_usable(pool, provider, provider_ref).await? {
                    return Ok(true);
                }
            }
            Err(err) => warn!(error = %err, "reconnect failed"),
        }

        info!("attempting logout and reconnect");
        if let Err(err) = provider.disconnect(provider_ref).await {
            warn!(error = %err, "logout failed");
        }
        sleep(self.settle).await;
        if let Err(err) = provider.reconnect(provider_ref).await {
            warn!(error = %err, "reconnect after logout failed");
            return Ok(false);
        }
        sleep(self.settle).await;
        self.recheck_usable(pool, provider, provider_ref).await
    }

    async fn recheck_usable(
        &self,
        pool: &Pool,
        provider: &dyn ProviderGateway,
        provider_ref: &str,
    ) -> Result<bool> {
        let report = self.check_health(pool, provider, provider_ref).await?;
        Ok(matches!(
            report.health,
            InstanceHealth::Healthy | InstanceHealth::Disconnected
        ))
    }

    /// Tear down a session the provider cannot account for: logout (failure
    /// tolerated), provider-side delete (failure propagated), then reset the
    /// local record to disconnected with phone and pairing QR cleared.
    #[instrument(skip_all, fields(provider_ref = %instance.provider_ref))]
    pub async fn cleanup(
        &self,
        pool: &Pool,
        provider: &dyn ProviderGateway,
        instance: &Instance,
    ) -> Result<()> {
        if let Err(err) = provider.disconnect(&instance.provider_ref).await {
            warn!(error = %err, "logout during cleanup failed");
        }
        provider
            .delete_instance(&instance.provider_ref)
            .await
            .map_err(|err| Error::ProviderUnavailable(err.to_string()))?;
        db::reset_instance_connection(pool, instance.id).await?;
        info!("session cleaned up and local record reset");
        Ok(())
    }

    /// Gate a send on the session being in a clean, known state, recovering
    /// or cleaning up along the way. `Ok` covers healthy, cleanly
    /// disconnected, and a session this call just reset; `Err` means
    /// circuit-broken, unknown, or a teardown that itself failed.
    #[instrument(skip_all, fields(provider_ref = provider_ref))]
    pub async fn ensure_healthy(
        &self,
        pool: &Pool,
        provider: &dyn ProviderGateway,
        breaker: &CircuitBreaker,
        provider_ref: &str,
    ) -> Result<()> {
        let key = breaker::instance_key(provider_ref);
        if breaker.is_open(&key) {
            return Err(Error::ProviderUnavailable(format!(
                "instance {provider_ref} is circuit-broken"
            )));
        }

        let report = self.check_health(pool, provider, provider_ref).await?;
        match report.health {
            InstanceHealth::NotFound => Err(Error::NotFound("instance")),
            InstanceHealth::Healthy => {
                breaker.record_success(&key);
                Ok(())
            }
            InstanceHealth::Disconnected => Ok(()),
            InstanceHealth::Degraded | InstanceHealth::Stuck => {
                if self.try_recover(pool, provider, provider_ref).await? {
                    breaker.record_success(&key);
                    return Ok(());
                }
                match self.cleanup_by_ref(pool, provider, provider_ref).await {
                    Ok(()) => {
                        info!("session reset after failed recovery, awaiting re-scan");
                        Ok(())
                    }
                    Err(err) => {
                        breaker.record_failure(&key);
                        Err(err)
                    }
                }
            }
            InstanceHealth::Corrupted => {
                match self.cleanup_by_ref(pool, provider, provider_ref).await {
                    Ok(()) => {
                        info!("corrupted session reset, awaiting re-scan");
                        Ok(())
                    }
                    Err(err) => {
                        breaker.record_failure(&key);
                        Err(err)
                    }
                }
            }
        }
    }

    async fn cleanup_by_ref(
        &self,
        pool: &Pool,
        provider: &dyn ProviderGateway,
        provider_ref: &str,
    ) -> Result<()> {
        let instance = db::fetch_instance_by_ref(pool, provider_ref)
            .await?
            .ok_or(Error::NotFound("instance"))?;
        self.cleanup(pool, provider, &instance).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::model::{InstanceStatus, SendMedia, SendReceipt, SendText};
    use anyhow::anyhow;
    use async_trait::async_trait;
    use sqlx::Row;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StubProvider {
        statuses: Mutex<VecDeque<anyhow::Result<InstanceStatus>>>,
        reconnects: AtomicUsize,
        disconnects: AtomicUsize,
        deletes: AtomicUsize,
        fail_deletes: bool,
    }

    impl StubProvider {
        fn with_statuses(statuses: Vec<anyhow::Result<InstanceStatus>>) -> Self {
            Self {
                statuses: Mutex::new(statuses.into()),
                reconnects: AtomicUsize::new(0),
                disconnects: AtomicUsize::new(0),
                deletes: AtomicUsize::new(0),
                fail_deletes: false,
            }
        }

        fn status(state: SessionState, phone: Option<&str>) -> anyhow::Result<InstanceStatus> {
            Ok(InstanceStatus {
                state,
                phone_number: phone.map(str::to_string),
            })
        }
    }

    #[async_trait]
    impl ProviderGateway for StubProvider {
        async fn create_instance(&self, _name: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn delete_instance(&self, _name: &str) -> anyhow::Result<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            if self.fail_deletes {
                return Err(anyhow!("delete rejected"));
            }
            Ok(())
        }
        async fn connect(&self, _name: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn disconnect(&self, _name: &str) -> anyhow::Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn restart(&self, _name: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn reconnect(&self, _name: &str) -> anyhow::Result<()> {
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn get_status(&self, _name: &str) -> anyhow::Result<InstanceStatus> {
            self.statuses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow!("no scripted status")))
        }
        async fn send_text(&self, _name: &str, _req: &SendText) -> anyhow::Result<SendReceipt> {
            Err(anyhow!("not a send test"))
        }
        async fn send_media(&self, _name: &str, _req: &SendMedia) -> anyhow::Result<SendReceipt> {
            Err(anyhow!("not a send test"))
        }
    }

    async fn setup_pool() -> Pool {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    async fn seed_instance(pool: &Pool, provider_ref: &str, synced_secs_ago: Option<i64>) -> i64 {
        let id: i64 = sqlx::query(
            "INSERT INTO instances (owner_id, provider_ref) VALUES (1, ?) RETURNING id",
        )
        .bind(provider_ref)
        .fetch_one(pool)
        .await
        .unwrap()
        .get("id");
        if let Some(secs) = synced_secs_ago {
            sqlx::query(
                "UPDATE instances SET synced_at = datetime('now', ? || ' seconds') WHERE id = ?",
            )
            .bind(-secs)
            .bind(id)
            .execute(pool)
            .await
            .unwrap();
        }
        id
    }

    fn manager() -> HealthManager {
        HealthManager::with_windows(Duration::ZERO, 30)
    }

    #[tokio::test]
    async fn connected_session_repairs_local_record() {
        let pool = setup_pool().await;
        let id = seed_instance(&pool, "main", None).await;
        let provider = StubProvider::with_statuses(vec![StubProvider::status(
            SessionState::Connected,
            Some("5511912345678"),
        )]);

        let report = manager()
            .check_health(&pool, &provider, "main")
            .await
            .unwrap();
        assert_eq!(report.health, InstanceHealth::Healthy);
        assert!(!report.should_cleanup);

        let instance = db::fetch_instance_by_ref(&pool, "main")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(instance.id, id);
        assert_eq!(instance.status_connection, 1);
        assert_eq!(instance.phone.as_deref(), Some("5511912345678"));
    }

    #[tokio::test]
    async fn connected_without_phone_is_corrupted() {
        let pool = setup_pool().await;
        seed_instance(&pool, "main", None).await;
        let provider = StubProvider::with_statuses(vec![StubProvider::status(
            SessionState::Connected,
            None,
        )]);

        let report = manager()
            .check_health(&pool, &provider, "main")
            .await
            .unwrap();
        assert_eq!(report.health, InstanceHealth::Corrupted);
        assert!(report.should_cleanup);
    }

    #[tokio::test]
    async fn connecting_is_degraded_then_stuck() {
        let pool = setup_pool().await;
        seed_instance(&pool, "fresh", Some(5)).await;
        seed_instance(&pool, "stale", Some(120)).await;
        let provider = StubProvider::with_statuses(vec![
            StubProvider::status(SessionState::Connecting, None),
            StubProvider::status(SessionState::Connecting, None),
        ]);

        let report = manager()
            .check_health(&pool, &provider, "fresh")
            .await
            .unwrap();
        assert_eq!(report.health, InstanceHealth::Degraded);

        let report = manager()
            .check_health(&pool, &provider, "stale")
            .await
            .unwrap();
        assert_eq!(report.health, InstanceHealth::Stuck);
    }

    #[tokio::test]
    async fn status_error_and_unknown_state_require_cleanup() {
        let pool = setup_pool().await;
        seed_instance(&pool, "main", None).await;
        let provider = StubProvider::with_statuses(vec![
            Err(anyhow!("connection refused")),
            StubProvider::status(SessionState::Other("BANNED".into()), None),
        ]);

        let report = manager()
            .check_health(&pool, &provider, "main")
            .await
            .unwrap();
        assert_eq!(report.health, InstanceHealth::Corrupted);
        assert!(report.should_cleanup);

        let report = manager()
            .check_health(&pool, &provider, "main")
            .await
            .unwrap();
        assert_eq!(report.health, InstanceHealth::Corrupted);
        assert!(report.should_cleanup);
    }

    #[tokio::test]
    async fn missing_record_is_not_found() {
        let pool = setup_pool().await;
        let provider = StubProvider::with_statuses(vec![StubProvider::status(
            SessionState::Connected,
            Some("5511912345678"),
        )]);

        let report = manager()
            .check_health(&pool, &provider, "ghost")
            .await
            .unwrap();
        assert_eq!(report.health, InstanceHealth::NotFound);

        let err = manager()
            .ensure_healthy(&pool, &provider, &CircuitBreaker::new(), "ghost")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound("instance")));
    }

    #[tokio::test]
    async fn recover_succeeds_when_recheck_is_usable() {
        let pool = setup_pool().await;
        seed_instance(&pool, "main", Some(120)).await;
        // First status feeds the recheck after the reconnect.
        let provider = StubProvider::with_statuses(vec![StubProvider::status(
            SessionState::Connected,
            Some("5511912345678"),
        )]);

        let recovered = manager()
            .try_recover(&pool, &provider, "main")
            .await
            .unwrap();
        assert!(recovered);
        assert_eq!(provider.reconnects.load(Ordering::SeqCst), 1);
        assert_eq!(provider.disconnects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn corrupted_session_teardown_reports_success() {
        let pool = setup_pool().await;
        let id = seed_instance(&pool, "main", None).await;
        sqlx::query("UPDATE instances SET status_connection = 1, phone = '55119', qr_code = 'data' WHERE id = ?")
            .bind(id)
            .execute(&pool)
            .await
            .unwrap();
        let provider = StubProvider::with_statuses(vec![StubProvider::status(
            SessionState::Connected,
            None,
        )]);
        let breaker = CircuitBreaker::new();

        manager()
            .ensure_healthy(&pool, &provider, &breaker, "main")
            .await
            .unwrap();
        assert_eq!(provider.deletes.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.failure_count(&breaker::instance_key("main")), 0);

        let instance = db::fetch_instance_by_ref(&pool, "main")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(instance.status_connection, 0);
        assert!(instance.phone.is_none());
        assert!(instance.qr_code.is_none());
    }

    #[tokio::test]
    async fn failed_recovery_falls_back_to_a_clean_teardown() {
        let pool = setup_pool().await;
        seed_instance(&pool, "main", Some(120)).await;
        sqlx::query("UPDATE instances SET status_connection = 1, phone = '55119' WHERE provider_ref = 'main'")
            .execute(&pool)
            .await
            .unwrap();
        // Stuck on the first check and still stuck on both recovery rechecks.
        let provider = StubProvider::with_statuses(vec![
            StubProvider::status(SessionState::Connecting, None),
            StubProvider::status(SessionState::Connecting, None),
            StubProvider::status(SessionState::Connecting, None),
        ]);
        let breaker = CircuitBreaker::new();

        manager()
            .ensure_healthy(&pool, &provider, &breaker, "main")
            .await
            .unwrap();
        assert_eq!(provider.reconnects.load(Ordering::SeqCst), 2);
        assert_eq!(provider.deletes.load(Ordering::SeqCst), 1);
        assert_eq!(breaker.failure_count(&breaker::instance_key("main")), 0);

        let instance = db::fetch_instance_by_ref(&pool, "main")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(instance.status_connection, 0);
        assert!(instance.phone.is_none());
    }

    #[tokio::test]
    async fn failed_teardown_is_an_overall_failure() {
        let pool = setup_pool().await;
        seed_instance(&pool, "main", None).await;
        let mut provider = StubProvider::with_statuses(vec![StubProvider::status(
            SessionState::Connected,
            None,
        )]);
        provider.fail_deletes = true;
        let breaker = CircuitBreaker::new();

        let err = manager()
            .ensure_healthy(&pool, &provider, &breaker, "main")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProviderUnavailable(_)));
        assert_eq!(breaker.failure_count(&breaker::instance_key("main")), 1);
    }
}
