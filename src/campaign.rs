//! Campaign lifecycle: creation, the status state machine, and the views
//! callers read.
//!
//! The stored integer status is the single source of truth; the
//! paused/canceled booleans callers see are derived in [`CampaignView`].
//! Canceled is a sink: no transition leads out of it.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config;
use crate::db::{self, NewCampaignRow, NewMessageRow, Pool};
use crate::dispatch::{DEFAULT_BACKOFF_BASE_SECS, RESUME_BACKOFF_BASE_SECS};
use crate::error::{Error, Result};
use crate::model::{Campaign, CampaignStatus, CampaignView, JobKind};

/// How a new campaign's recipients are chosen.
#[derive(Debug, Clone)]
pub enum AudienceRef {
    /// An existing audience owned by the caller.
    Existing(i64),
    /// The owner's default all-contacts audience, created on first use.
    New,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub body: String,
    pub media_url: Option<String>,
    pub media_kind: Option<String>,
}

/// Input for campaign creation.
#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub instance_id: i64,
    pub audience: AudienceRef,
    pub name: String,
    pub kind: String,
    pub messages: Vec<NewMessage>,
    pub schedule_at: Option<DateTime<Utc>>,
    /// With [`AudienceRef::New`], restrict to contacts carrying any of
    /// these labels. Empty means every active contact.
    pub labels: Vec<String>,
}

/// Answer to a liveness query about one campaign.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveReport {
    pub active: bool,
    pub status: &'static str,
    pub progress: i64,
}

/// Whether the state machine allows `from -> to`. Only the Canceled sink
/// rejects, and it rejects every target, a second cancel included.
fn can_transition(from: CampaignStatus, _to: CampaignStatus) -> bool {
    from != CampaignStatus::Canceled
}

/// Create a campaign with its messages, resolve the audience into one
/// delivery row per contact, and enqueue the dispatch job. Everything up to
/// the enqueue is one transaction; a failed enqueue is logged and left for
/// the recovery sweep, the created campaign stands.
#[instrument(skip_all, fields(owner_id))]
pub async fn create(
    pool: &Pool,
    cfg: &config::CampaignPolicy,
    owner_id: i64,
    new: NewCampaign,
) -> Result<Campaign> {
    let instance = db::fetch_instance(pool, owner_id, new.instance_id)
        .await?
        .ok_or(Error::NotFound("instance"))?;

    let (audience_id, contacts) = match new.audience {
        AudienceRef::New => {
            let audience_id = db::get_or_create_default_audience(pool, owner_id).await?;
            let contacts = db::active_contacts_for_owner(pool, owner_id, &new.labels).await?;
            (audience_id, contacts)
        }
        AudienceRef::Existing(id) => {
            if !db::audience_exists(pool, owner_id, id).await? {
                return Err(Error::NotFound("audience"));
            }
            (id, db::active_contacts_in_audience(pool, id).await?)
        }
    };
    if contacts.is_empty() {
        return Err(Error::InsufficientContacts);
    }

    let status = if new.schedule_at.is_some() {
        CampaignStatus::Scheduled
    } else {
        CampaignStatus::Pending
    };

    let mut messages: Vec<NewMessageRow> = new
        .messages
        .iter()
        .enumerate()
        .map(|(ord, message)| NewMessageRow {
            ord: ord as i64,
            body: message.body.clone(),
            media_url: message.media_url.clone(),
            media_kind: message.media_kind.clone(),
        })
        .collect();
    if messages.is_empty() {
        // A campaign always carries at least one message row.
        messages.push(NewMessageRow {
            ord: 0,
            body: String::new(),
            media_url: None,
            media_kind: None,
        });
    }

    let row = NewCampaignRow {
        public_id: Uuid::new_v4(),
        owner_id,
        instance_id: instance.id,
        audience_id: Some(audience_id),
        name: new.name.clone(),
        kind: new.kind.clone(),
        status,
        schedule_at: new.schedule_at,
        total_contacts: contacts.len() as i64,
        date_end: Utc::now() + Duration::days(cfg.horizon_days),
    };
    let campaign_id = db::insert_campaign_bundle(pool, &row, &messages, &contacts).await?;
    info!(
        campaign_id,
        contacts = contacts.len(),
        scheduled = new.schedule_at.is_some(),
        "campaign created"
    );

    // Scheduled campaigns get their job dated at the schedule time, clamped
    // so a past schedule fires immediately.
    let due_at = new
        .schedule_at
        .map(|at| at.max(Utc::now()))
        .unwrap_or_else(Utc::now);
    if let Err(err) = db::enqueue_job(
        pool,
        JobKind::ProcessCampaign,
        campaign_id,
        campaign_id,
        DEFAULT_BACKOFF_BASE_SECS,
        due_at,
    )
    .await
    {
        // Creation is authoritative; the recovery sweep re-enqueues.
        warn!(campaign_id, error = %err, "failed to enqueue dispatch job");
    }

    db::fetch_campaign(pool, owner_id, campaign_id)
        .await?
        .ok_or(Error::NotFound("campaign"))
}

/// Move a campaign to `to`, enforcing the state machine, and kick the
/// dispatcher when the change makes the campaign runnable again. Returns
/// the label of the new status.
#[instrument(skip_all, fields(campaign_id))]
pub async fn change_status(
    pool: &Pool,
    owner_id: i64,
    campaign_id: i64,
    to: CampaignStatus,
) -> Result<&'static str> {
    let campaign = db::fetch_campaign(pool, owner_id, campaign_id)
        .await?
        .ok_or(Error::NotFound("campaign"))?;
    let from = campaign.status;

    if !can_transition(from, to) {
        return Err(Error::InvalidTransition {
            from: from.label(),
            to: to.label(),
        });
    }
    if from == to {
        return Ok(to.label());
    }

    let changed = db::update_campaign_status(pool, owner_id, campaign_id, from, to).await?;
    if !changed {
        // Lost a race with a concurrent status change.
        return Err(Error::InvalidTransition {
            from: from.label(),
            to: to.label(),
        });
    }
    info!(from = from.label(), to = to.label(), "campaign status changed");

    match (from, to) {
        (CampaignStatus::Paused, CampaignStatus::Pending) => {
            // Resumed campaigns retry on a tighter backoff base so they
            // catch up quickly.
            if db::live_job_exists(pool, campaign_id).await? {
                debug!("live dispatch job present, no resume enqueue");
            } else {
                db::enqueue_job(
                    pool,
                    JobKind::ProcessCampaign,
                    campaign_id,
                    campaign_id,
                    RESUME_BACKOFF_BASE_SECS,
                    Utc::now(),
                )
                .await?;
            }
        }
        (CampaignStatus::Scheduled, CampaignStatus::Pending) => {
            // Manual activation: pull the waiting job forward rather than
            // stacking a second one.
            let expedited = db::expedite_campaign_jobs(pool, campaign_id).await?;
            if expedited == 0 {
                db::enqueue_job(
                    pool,
                    JobKind::ProcessCampaign,
                    campaign_id,
                    campaign_id,
                    DEFAULT_BACKOFF_BASE_SECS,
                    Utc::now(),
                )
                .await?;
            }
        }
        _ => {}
    }

    Ok(to.label())
}

pub async fn cancel(pool: &Pool, owner_id: i64, campaign_id: i64) -> Result<&'static str> {
    change_status(pool, owner_id, campaign_id, CampaignStatus::Canceled).await
}

/// Cancel every owned campaign in `ids` atomically. Errors with NotFound
/// when none of the ids belongs to the owner.
#[instrument(skip_all, fields(owner_id))]
pub async fn cancel_multiple(pool: &Pool, owner_id: i64, ids: &[i64]) -> Result<u64> {
    let count = db::cancel_campaigns(pool, owner_id, ids).await?;
    if count == 0 {
        return Err(Error::NotFound("campaign"));
    }
    info!(count, "campaigns canceled");
    Ok(count)
}

pub async fn get(pool: &Pool, owner_id: i64, campaign_id: i64) -> Result<CampaignView> {
    let campaign = db::fetch_campaign(pool, owner_id, campaign_id)
        .await?
        .ok_or(Error::NotFound("campaign"))?;
    Ok(CampaignView::from(&campaign))
}

/// A campaign is active while it is Pending with undone progress.
pub async fn check_active(pool: &Pool, owner_id: i64, campaign_id: i64) -> Result<ActiveReport> {
    let campaign: Campaign = db::fetch_campaign(pool, owner_id, campaign_id)
        .await?
        .ok_or(Error::NotFound("campaign"))?;
    Ok(ActiveReport {
        active: campaign.is_active(),
        status: campaign.status.label(),
        progress: campaign.progress,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canceled_is_a_sink() {
        use CampaignStatus::*;
        for to in [Pending, Paused, Scheduled, Canceled] {
            assert!(!can_transition(Canceled, to));
        }
    }

    #[test]
    fn everything_else_may_move() {
        use CampaignStatus::*;
        assert!(can_transition(Pending, Paused));
        assert!(can_transition(Paused, Pending));
        assert!(can_transition(Scheduled, Pending));
        assert!(can_transition(Pending, Canceled));
        assert!(can_transition(Scheduled, Canceled));
    }
}
