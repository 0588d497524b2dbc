//! Database entity and view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::model::CampaignStatus;

/// Column values for a new campaign row. Totals and timestamps are filled
/// by the insert.
#[derive(Debug, Clone)]
pub struct NewCampaignRow {
    pub public_id: Uuid,
    pub owner_id: i64,
    pub instance_id: i64,
    pub audience_id: Option<i64>,
    pub name: String,
    pub kind: String,
    pub status: CampaignStatus,
    pub schedule_at: Option<DateTime<Utc>>,
    pub total_contacts: i64,
    pub date_end: DateTime<Utc>,
}

/// Column values for one campaign message, ordinal included.
#[derive(Debug, Clone)]
pub struct NewMessageRow {
    pub ord: i64,
    pub body: String,
    pub media_url: Option<String>,
    pub media_kind: Option<String>,
}

/// Contact slice used when resolving a campaign's audience.
#[derive(Debug, Clone)]
pub struct ContactRef {
    pub id: i64,
    pub phone: String,
}

/// Campaign slice the dispatcher works from, instance session included.
#[derive(Debug, Clone)]
pub struct CampaignDispatch {
    pub campaign_id: i64,
    pub status: CampaignStatus,
    pub audience_id: Option<i64>,
    pub instance_id: i64,
    pub provider_ref: String,
}

/// One undelivered recipient of a campaign fan-out, message content joined
/// in.
#[derive(Debug, Clone)]
pub struct DeliveryForDispatch {
    pub delivery_id: i64,
    pub contact_id: i64,
    pub phone: String,
    pub message_id: i64,
    pub body: String,
    pub media_url: Option<String>,
    pub media_kind: Option<String>,
}

/// Everything a direct-send job needs, joined across delivery, message,
/// campaign and instance.
#[derive(Debug, Clone)]
pub struct DeliveryDispatch {
    pub delivery_id: i64,
    pub message_id: i64,
    pub campaign_id: i64,
    pub campaign_status: CampaignStatus,
    pub audience_id: Option<i64>,
    pub contact_id: i64,
    pub provider_ref: String,
    pub phone: String,
    pub body: String,
    pub media_url: Option<String>,
    pub media_kind: Option<String>,
}

/// Delivery located by provider message id when an acknowledgment arrives.
#[derive(Debug, Clone)]
pub struct AckTarget {
    pub delivery_id: i64,
    pub campaign_id: i64,
    pub contact_id: i64,
    pub audience_id: Option<i64>,
    pub phone: String,
}

/// Dead-lettered job row surfaced to the monitoring path.
#[derive(Debug, Clone)]
pub struct FailedJob {
    pub id: i64,
    pub kind: String,
    pub campaign_id: i64,
    pub ref_id: i64,
    pub last_error: Option<String>,
    pub failed_at: DateTime<Utc>,
}
