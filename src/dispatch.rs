//! Durable dispatch queue worker and the recovery sweep.
//!
//! Jobs live in `dispatch_jobs` and are claimed under a lease, so several
//! workers can poll the same database. A failed run backs the job off
//! exponentially until its attempts are exhausted, at which point the row
//! is dead-lettered in place.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::breaker::{self, CircuitBreaker};
use crate::config;
use crate::db::{self, Pool};
use crate::error::{Error, Result};
use crate::health::HealthManager;
use crate::model::{CampaignStatus, DispatchJob, JobKind};
use crate::provider::model::{SendMedia, SendReceipt, SendText};
use crate::provider::ProviderGateway;

/// Backoff base for jobs enqueued by campaign creation and the sweep.
pub const DEFAULT_BACKOFF_BASE_SECS: i64 = 5;
/// Backoff base for jobs enqueued by a pause -> resume transition.
pub const RESUME_BACKOFF_BASE_SECS: i64 = 2;

pub struct Dispatcher {
    pool: Pool,
    provider: Arc<dyn ProviderGateway>,
    breaker: Arc<CircuitBreaker>,
    health: HealthManager,
    queue_cfg: config::Queue,
}

impl Dispatcher {
    pub fn new(
        pool: Pool,
        provider: Arc<dyn ProviderGateway>,
        breaker: Arc<CircuitBreaker>,
        cfg: &config::Config,
    ) -> Self {
        Self {
            pool,
            provider,
            breaker,
            health: HealthManager::new(&cfg.health),
            queue_cfg: cfg.queue.clone(),
        }
    }

    /// Claim and run one due job. Returns whether a job was found, so the
    /// worker loop knows when to idle.
    #[instrument(skip_all)]
    pub async fn process_next_job(&self) -> Result<bool> {
        let Some(job) = db::claim_next_due_job(&self.pool, self.queue_cfg.lease_seconds).await?
        else {
            return Ok(false);
        };

        let res = match job.kind {
            JobKind::ProcessCampaign => self.process_campaign(&job).await,
            JobKind::ProcessMessage => self.process_message(&job).await,
        };

        match res {
            Ok(()) => {
                db::delete_job(&self.pool, job.id).await?;
                info!(
                    id = job.id,
                    kind = job.kind.as_str(),
                    campaign_id = job.campaign_id,
                    "dispatch job succeeded"
                );
            }
            Err(err) => {
                if job.attempt + 1 >= job.max_attempts {
                    warn!(
                        ?err,
                        id = job.id,
                        kind = job.kind.as_str(),
                        attempt = job.attempt,
                        "dispatch job exhausted"
                    );
                    self.on_job_exhausted(&job, &err).await?;
                } else {
                    warn!(
                        ?err,
                        id = job.id,
                        kind = job.kind.as_str(),
                        attempt = job.attempt,
                        "dispatch job failed; backoff"
                    );
                    db::backoff_job(
                        &self.pool,
                        job.id,
                        job.attempt,
                        job.backoff_base_secs,
                        self.queue_cfg.max_backoff_seconds as i64,
                        &err.to_string(),
                    )
                    .await?;
                }
            }
        }
        Ok(true)
    }

    /// Terminal failure: dead-letter the row, trip the job's circuit, and
    /// for direct sends mark the message failed.
    async fn on_job_exhausted(&self, job: &DispatchJob, err: &Error) -> Result<()> {
        db::fail_job(&self.pool, job.id, &err.to_string()).await?;
        self.breaker
            .record_failure(&breaker::queue_key(job.kind.as_str(), job.id));
        if job.kind == JobKind::ProcessMessage {
            if let Some(delivery) = db::fetch_delivery_dispatch(&self.pool, job.ref_id).await? {
                db::mark_message_status(&self.pool, delivery.message_id, "failed").await?;
            }
        }
        Ok(())
    }

    /// Fan a campaign out to every recipient the provider has not yet
    /// accepted. Pause/cancel wins between contacts; a partial failure ends
    /// the run with an error so the retry policy picks up the remainder.
    #[instrument(skip_all, fields(campaign_id = job.campaign_id))]
    async fn process_campaign(&self, job: &DispatchJob) -> Result<()> {
        let campaign_key = breaker::campaign_key(job.campaign_id);
        if self.breaker.is_open(&campaign_key) {
            return Err(Error::ProviderUnavailable(format!(
                "campaign {} is circuit-broken",
                job.campaign_id
            )));
        }

        let Some(campaign) = db::fetch_campaign_dispatch(&self.pool, job.campaign_id).await?
        else {
            info!("campaign gone; nothing to dispatch");
            return Ok(());
        };
        if campaign.status != CampaignStatus::Pending {
            info!(
                status = campaign.status.label(),
                "campaign not pending; dispatch abandoned"
            );
            return Ok(());
        }

        let pending = db::pending_deliveries(&self.pool, job.campaign_id).await?;
        if pending.is_empty() {
            debug!("no undelivered recipients left");
            return Ok(());
        }

        let mut failures = 0usize;
        for delivery in &pending {
            // Cancel and pause win between contacts.
            match db::campaign_status(&self.pool, job.campaign_id).await? {
                Some(CampaignStatus::Pending) => {}
                other => {
                    info!(status = ?other, "campaign no longer pending; fan-out stopped");
                    return Ok(());
                }
            }

            self.health
                .ensure_healthy(
                    &self.pool,
                    self.provider.as_ref(),
                    &self.breaker,
                    &campaign.provider_ref,
                )
                .await?;

            let message_key = breaker::message_key(&delivery.phone);
            if self.breaker.is_open(&message_key) {
                debug!(phone = %delivery.phone, "recipient circuit open; skipped");
                continue;
            }

            match self
                .send_one(
                    &campaign.provider_ref,
                    &delivery.phone,
                    &delivery.body,
                    delivery.media_url.as_deref(),
                    delivery.media_kind.as_deref(),
                )
                .await
            {
                Ok(receipt) => {
                    // Only the provider's message id is stored; the sent
                    // flag waits for the webhook acknowledgment.
                    db::record_provider_acceptance(
                        &self.pool,
                        delivery.delivery_id,
                        &receipt.message_id,
                    )
                    .await?;
                }
                Err(err) => {
                    warn!(phone = %delivery.phone, error = %err, "send failed");
                    db::record_delivery_failure(
                        &self.pool,
                        delivery.delivery_id,
                        &err.to_string(),
                    )
                    .await?;
                    self.breaker.record_failure(&message_key);
                    failures += 1;
                }
            }

            if self.queue_cfg.send_delay_ms > 0 {
                sleep(Duration::from_millis(self.queue_cfg.send_delay_ms)).await;
            }
        }

        if failures > 0 {
            self.breaker.record_failure(&campaign_key);
            return Err(Error::ProviderUnavailable(format!(
                "{failures} of {} sends failed",
                pending.len()
            )));
        }
        self.breaker.record_success(&campaign_key);
        Ok(())
    }

    /// Direct send of a single delivery, outside any fan-out.
    #[instrument(skip_all, fields(delivery_id = job.ref_id))]
    async fn process_message(&self, job: &DispatchJob) -> Result<()> {
        let Some(delivery) = db::fetch_delivery_dispatch(&self.pool, job.ref_id).await? else {
            info!("delivery gone; nothing to send");
            return Ok(());
        };
        if delivery.campaign_status == CampaignStatus::Canceled {
            info!("campaign canceled; send abandoned");
            return Ok(());
        }

        self.health
            .ensure_healthy(
                &self.pool,
                self.provider.as_ref(),
                &self.breaker,
                &delivery.provider_ref,
            )
            .await?;

        let message_key = breaker::message_key(&delivery.phone);
        if self.breaker.is_open(&message_key) {
            return Err(Error::ProviderUnavailable(format!(
                "recipient {} is circuit-broken",
                delivery.phone
            )));
        }

        match self
            .send_one(
                &delivery.provider_ref,
                &delivery.phone,
                &delivery.body,
                delivery.media_url.as_deref(),
                delivery.media_kind.as_deref(),
            )
            .await
        {
            Ok(receipt) => {
                db::record_provider_acceptance(&self.pool, delivery.delivery_id, &receipt.message_id)
                    .await?;
                db::mark_delivery_sent(&self.pool, delivery.delivery_id, delivery.campaign_id)
                    .await?;
                if let Some(audience_id) = delivery.audience_id {
                    db::mark_audience_link_sent(&self.pool, audience_id, delivery.contact_id)
                        .await?;
                }
                db::mark_message_status(&self.pool, delivery.message_id, "sent").await?;
                self.breaker.record_success(&message_key);
                Ok(())
            }
            Err(err) => {
                db::record_delivery_failure(&self.pool, delivery.delivery_id, &err.to_string())
                    .await?;
                self.breaker.record_failure(&message_key);
                Err(Error::ProviderUnavailable(err.to_string()))
            }
        }
    }

    async fn send_one(
        &self,
        provider_ref: &str,
        phone: &str,
        body: &str,
        media_url: Option<&str>,
        media_kind: Option<&str>,
    ) -> anyhow::Result<SendReceipt> {
        match media_url {
            Some(url) => {
                self.provider
                    .send_media(
                        provider_ref,
                        &SendMedia {
                            phone: phone.to_string(),
                            media_url: url.to_string(),
                            media_kind: media_kind.unwrap_or("document").to_string(),
                            caption: (!body.is_empty()).then(|| body.to_string()),
                        },
                    )
                    .await
            }
            None => {
                self.provider
                    .send_text(
                        provider_ref,
                        &SendText {
                            phone: phone.to_string(),
                            body: body.to_string(),
                        },
                    )
                    .await
            }
        }
    }

    /// One pass of the recovery sweep: campaigns that should have a live
    /// job but lost it (a crashed enqueue, a wiped queue) get a fresh one.
    /// Idempotent; running it twice queues nothing extra.
    #[instrument(skip_all)]
    pub async fn recovery_sweep(&self) -> Result<u64> {
        let mut queued = 0u64;

        for campaign_id in db::campaigns_needing_requeue(&self.pool).await? {
            db::enqueue_job(
                &self.pool,
                JobKind::ProcessCampaign,
                campaign_id,
                campaign_id,
                DEFAULT_BACKOFF_BASE_SECS,
                Utc::now(),
            )
            .await?;
            info!(campaign_id, "recovery sweep re-enqueued campaign");
            queued += 1;
        }

        for (campaign_id, schedule_at) in db::scheduled_campaigns_without_jobs(&self.pool).await? {
            let due_at = schedule_at
                .map(|at| at.max(Utc::now()))
                .unwrap_or_else(Utc::now);
            db::enqueue_job(
                &self.pool,
                JobKind::ProcessCampaign,
                campaign_id,
                campaign_id,
                DEFAULT_BACKOFF_BASE_SECS,
                due_at,
            )
            .await?;
            info!(campaign_id, "recovery sweep re-enqueued scheduled campaign");
            queued += 1;
        }

        Ok(queued)
    }
}
