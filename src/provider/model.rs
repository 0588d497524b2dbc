//! Wire-level types for the WhatsApp provider API.
//!
//! Keep these structs focused on what actually crosses the wire; domain
//! decisions belong to the callers.

use serde::Deserialize;

use crate::model::normalize_phone;

/// Connection state of a provider session, parsed leniently from the wire
/// string so unknown vendor spellings survive as `Other`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Disconnected,
    AwaitingScan,
    Connecting,
    Failed,
    Other(String),
}

impl SessionState {
    pub fn parse(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "WORKING" | "CONNECTED" | "OPEN" => SessionState::Connected,
            "STOPPED" | "DISCONNECTED" | "CLOSED" | "LOGGED_OUT" => SessionState::Disconnected,
            "SCAN_QR_CODE" | "QR_CODE" | "AWAITING_SCAN" => SessionState::AwaitingScan,
            "STARTING" | "CONNECTING" | "OPENING" => SessionState::Connecting,
            "FAILED" => SessionState::Failed,
            _ => SessionState::Other(raw.to_string()),
        }
    }
}

/// Provider-reported status of a session.
#[derive(Debug, Clone)]
pub struct InstanceStatus {
    pub state: SessionState,
    pub phone_number: Option<String>,
}

/// Outbound text message.
#[derive(Debug, Clone)]
pub struct SendText {
    pub phone: String,
    pub body: String,
}

/// Outbound media message.
#[derive(Debug, Clone)]
pub struct SendMedia {
    pub phone: String,
    pub media_url: String,
    pub media_kind: String,
    pub caption: Option<String>,
}

/// Provider acceptance of an outbound message. The id is what later
/// delivery acknowledgments are correlated by.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub message_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionStatusResp {
    pub status: String,
    #[serde(default)]
    pub me: Option<SessionMe>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionMe {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageResp {
    pub id: String,
}

/// Extract the bare phone number from a provider chat id such as
/// `5511912345678@c.us`.
pub fn phone_from_wire_id(id: &str) -> Option<String> {
    let head = id.split('@').next().unwrap_or("");
    let digits = normalize_phone(head);
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}
