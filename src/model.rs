use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

static NON_DIGITS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\D+").unwrap());

/// Strip formatting from a phone number, keeping digits only. Provider
/// payloads and stored contacts disagree on punctuation; comparisons and
/// breaker keys go through this.
pub fn normalize_phone(raw: &str) -> String {
    NON_DIGITS.replace_all(raw, "").into_owned()
}

/// Lifecycle state of a campaign, stored as an integer code.
///
/// `paused` and `canceled` are not separate columns; they are derived from
/// this status when a campaign is serialized for callers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CampaignStatus {
    Pending,
    Paused,
    Canceled,
    Scheduled,
}

impl CampaignStatus {
    pub fn code(self) -> i64 {
        match self {
            CampaignStatus::Pending => 0,
            CampaignStatus::Paused => 1,
            CampaignStatus::Canceled => 2,
            CampaignStatus::Scheduled => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(CampaignStatus::Pending),
            1 => Some(CampaignStatus::Paused),
            2 => Some(CampaignStatus::Canceled),
            3 => Some(CampaignStatus::Scheduled),
            _ => None,
        }
    }

    /// Label reported to callers. `Pending` reads as "active" because a
    /// pending campaign is the one the dispatcher is working through.
    pub fn label(self) -> &'static str {
        match self {
            CampaignStatus::Pending => "active",
            CampaignStatus::Paused => "paused",
            CampaignStatus::Canceled => "canceled",
            CampaignStatus::Scheduled => "scheduled",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobKind {
    ProcessCampaign,
    ProcessMessage,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ProcessCampaign => "process_campaign",
            JobKind::ProcessMessage => "process_message",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "process_campaign" => Some(JobKind::ProcessCampaign),
            "process_message" => Some(JobKind::ProcessMessage),
            _ => None,
        }
    }
}

/// Acknowledgment codes delivered by the provider webhook.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AckStatus {
    Error,
    Pending,
    ServerAck,
    DeliveryAck,
    Read,
    Played,
}

impl AckStatus {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(AckStatus::Error),
            1 => Some(AckStatus::Pending),
            2 => Some(AckStatus::ServerAck),
            3 => Some(AckStatus::DeliveryAck),
            4 => Some(AckStatus::Read),
            5 => Some(AckStatus::Played),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: i64,
    pub public_id: Uuid,
    pub owner_id: i64,
    pub instance_id: i64,
    pub audience_id: Option<i64>,
    pub name: String,
    pub kind: String,
    pub status: CampaignStatus,
    pub schedule_at: Option<DateTime<Utc>>,
    pub total_contacts: i64,
    pub total_sent: i64,
    pub total_delivered: i64,
    pub total_read: i64,
    pub progress: i64,
    pub date_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    /// An active campaign is one the dispatcher still has work for.
    pub fn is_active(&self) -> bool {
        self.status == CampaignStatus::Pending && self.progress < 100
    }
}

/// Caller-facing shape of a campaign. The paused/canceled flags exist only
/// here, derived from the stored status.
#[derive(Debug, Clone, Serialize)]
pub struct CampaignView {
    pub id: Uuid,
    pub name: String,
    pub kind: String,
    pub status: &'static str,
    pub paused: bool,
    pub canceled: bool,
    pub schedule_at: Option<DateTime<Utc>>,
    pub total_contacts: i64,
    pub total_sent: i64,
    pub total_delivered: i64,
    pub total_read: i64,
    pub progress: i64,
    pub date_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&Campaign> for CampaignView {
    fn from(c: &Campaign) -> Self {
        CampaignView {
            id: c.public_id,
            name: c.name.clone(),
            kind: c.kind.clone(),
            status: c.status.label(),
            paused: c.status == CampaignStatus::Paused,
            canceled: c.status == CampaignStatus::Canceled,
            schedule_at: c.schedule_at,
            total_contacts: c.total_contacts,
            total_sent: c.total_sent,
            total_delivered: c.total_delivered,
            total_read: c.total_read,
            progress: c.progress,
            date_end: c.date_end,
            created_at: c.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignMessage {
    pub id: i64,
    pub campaign_id: i64,
    pub ord: i64,
    pub body: String,
    pub media_url: Option<String>,
    pub media_kind: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: i64,
    pub owner_id: i64,
    pub audience_id: Option<i64>,
    pub phone: String,
    pub name: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: i64,
    pub campaign_id: i64,
    pub message_id: i64,
    pub contact_id: i64,
    pub phone: String,
    pub provider_message_id: Option<String>,
    pub sent: i64,
    pub delivered: i64,
    pub read: i64,
    pub error: Option<String>,
    pub failure_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: i64,
    pub owner_id: i64,
    pub provider_ref: String,
    pub phone: Option<String>,
    pub status_connection: i64,
    pub qr_code: Option<String>,
    pub synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchJob {
    pub id: i64,
    pub kind: JobKind,
    pub campaign_id: i64,
    pub ref_id: i64,
    pub attempt: i64,
    pub max_attempts: i64,
    pub backoff_base_secs: i64,
    pub due_at: DateTime<Utc>,
}
