//! Webhook ingest for provider acknowledgments and session status pushes.
//!
//! The provider retries deliveries that do not get a 2xx back, so every
//! request is answered with HTTP 200 and a `{success, message}` body; a
//! payload we cannot use is reported in the body, never via the status code.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::breaker::{self, CircuitBreaker};
use crate::db::{self, AckTarget, Pool};
use crate::error::{Error, Result};
use crate::model::AckStatus;
use crate::provider::model::{phone_from_wire_id, SessionState};

/// Error text recorded on a delivery when the provider acks it as failed.
const ACK_FAILURE_TEXT: &str = "message failed to send";

/// Raw webhook envelope. The payload shape differs per event, so it stays
/// untyped until the event name has been matched.
#[derive(Debug, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub payload: Value,
}

/// Body returned for every webhook request.
#[derive(Debug, Serialize)]
pub struct WebhookReply {
    pub success: bool,
    pub message: String,
}

impl WebhookReply {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Events the ingest pipeline understands, decoded from an [`Envelope`].
#[derive(Debug, PartialEq, Eq)]
pub enum WebhookEvent {
    MessageAck {
        message_id: String,
        ack: AckStatus,
        phone: Option<String>,
    },
    MessageSent {
        message_id: String,
    },
    SessionStatus {
        state: SessionState,
        phone: Option<String>,
    },
    MessageAny,
    Ignored(String),
}

/// Decode the envelope into a [`WebhookEvent`]. Only fields the matched
/// event needs are required; everything else in the payload is ignored.
pub fn parse_event(env: &Envelope) -> Result<WebhookEvent> {
    match env.event.as_str() {
        "message.ack" => {
            let message_id = payload_message_id(&env.payload)
                .ok_or_else(|| Error::MalformedWebhook("message.ack without id".into()))?;
            let code = env
                .payload
                .get("ack")
                .and_then(Value::as_i64)
                .ok_or_else(|| Error::MalformedWebhook("message.ack without ack code".into()))?;
            let ack = AckStatus::from_code(code)
                .ok_or_else(|| Error::MalformedWebhook(format!("unknown ack code {code}")))?;
            Ok(WebhookEvent::MessageAck {
                message_id,
                ack,
                phone: payload_phone(&env.payload),
            })
        }
        "message.sent" => {
            let message_id = payload_message_id(&env.payload)
                .ok_or_else(|| Error::MalformedWebhook("message.sent without id".into()))?;
            Ok(WebhookEvent::MessageSent { message_id })
        }
        "session.status" => {
            let status = env
                .payload
                .get("status")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::MalformedWebhook("session.status without status".into()))?;
            let phone = env
                .payload
                .get("me")
                .and_then(|me| me.get("id"))
                .and_then(Value::as_str)
                .and_then(phone_from_wire_id);
            Ok(WebhookEvent::SessionStatus {
                state: SessionState::parse(status),
                phone,
            })
        }
        "message.any" => Ok(WebhookEvent::MessageAny),
        other => Ok(WebhookEvent::Ignored(other.to_string())),
    }
}

/// The provider sends the message id either as a plain string or as an
/// object carrying a `_serialized` form.
fn payload_message_id(payload: &Value) -> Option<String> {
    match payload.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(obj) => obj
            .get("_serialized")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        _ => None,
    }
}

fn payload_phone(payload: &Value) -> Option<String> {
    payload
        .get("to")
        .or_else(|| payload.get("from"))
        .and_then(Value::as_str)
        .and_then(phone_from_wire_id)
}

/// Apply one decoded event against the database. Returns the reply body;
/// storage errors bubble up and become a `success: false` reply upstream.
#[instrument(skip_all, fields(event = %env.event, session = %env.session))]
pub async fn handle_event(
    pool: &Pool,
    breaker: &CircuitBreaker,
    env: &Envelope,
) -> Result<WebhookReply> {
    match parse_event(env)? {
        WebhookEvent::MessageAck {
            message_id,
            ack,
            phone,
        } => {
            let Some(target) = db::find_ack_target(pool, &message_id).await? else {
                debug!(message_id, "ack for a delivery we do not track");
                return Ok(WebhookReply::ok("delivery not tracked"));
            };
            let note = apply_ack(pool, breaker, &target, ack, phone.as_deref()).await?;
            Ok(WebhookReply::ok(note))
        }
        WebhookEvent::MessageSent { message_id } => {
            let Some(target) = db::find_ack_target(pool, &message_id).await? else {
                debug!(message_id, "sent event for a delivery we do not track");
                return Ok(WebhookReply::ok("delivery not tracked"));
            };
            let note = apply_ack(pool, breaker, &target, AckStatus::ServerAck, None).await?;
            Ok(WebhookReply::ok(note))
        }
        WebhookEvent::SessionStatus { state, phone } => {
            let Some(instance) = db::fetch_instance_by_ref(pool, &env.session).await? else {
                warn!("status push for an unknown session");
                return Ok(WebhookReply::failure("unknown session"));
            };
            match state {
                SessionState::Connected => {
                    db::set_instance_connection(pool, instance.id, true, phone.as_deref())
                        .await?;
                    info!(instance_id = instance.id, "session reported connected");
                }
                SessionState::Disconnected | SessionState::AwaitingScan | SessionState::Failed => {
                    db::set_instance_connection(pool, instance.id, false, None).await?;
                    info!(instance_id = instance.id, "session reported offline");
                }
                SessionState::Connecting => {
                    debug!(instance_id = instance.id, "session still connecting");
                }
                SessionState::Other(raw) => {
                    warn!(instance_id = instance.id, status = %raw, "unrecognized session status");
                }
            }
            Ok(WebhookReply::ok("status recorded"))
        }
        WebhookEvent::MessageAny => Ok(WebhookReply::ok("ignored")),
        WebhookEvent::Ignored(event) => {
            debug!(event, "webhook event ignored");
            Ok(WebhookReply::ok("ignored"))
        }
    }
}

/// Per-code ack semantics. The sent/delivered/read flips are conditional
/// UPDATEs, so acks arriving out of order or twice settle on the same row
/// state and counters move at most once.
async fn apply_ack(
    pool: &Pool,
    breaker: &CircuitBreaker,
    target: &AckTarget,
    ack: AckStatus,
    wire_phone: Option<&str>,
) -> Result<&'static str> {
    let phone = wire_phone.unwrap_or(&target.phone);
    match ack {
        AckStatus::Error => {
            db::set_delivery_error(pool, target.delivery_id, ACK_FAILURE_TEXT).await?;
            if let Some(audience_id) = target.audience_id {
                db::mark_audience_link_error(pool, audience_id, target.contact_id).await?;
            }
            breaker.record_failure(&breaker::message_key(phone));
            Ok("failure recorded")
        }
        AckStatus::Pending => Ok("pending ack noted"),
        AckStatus::ServerAck => {
            mark_sent(pool, target).await?;
            breaker.record_success(&breaker::message_key(phone));
            Ok("sent recorded")
        }
        AckStatus::DeliveryAck => {
            mark_sent(pool, target).await?;
            db::mark_delivery_delivered(pool, target.delivery_id, target.campaign_id).await?;
            Ok("delivery recorded")
        }
        AckStatus::Read | AckStatus::Played => {
            mark_sent(pool, target).await?;
            db::mark_delivery_delivered(pool, target.delivery_id, target.campaign_id).await?;
            db::mark_delivery_read(pool, target.delivery_id, target.campaign_id).await?;
            if let Some(audience_id) = target.audience_id {
                db::mark_audience_link_read(pool, audience_id, target.contact_id).await?;
            }
            Ok("read recorded")
        }
    }
}

/// A later ack implies the earlier stages, so every path funnels through
/// the same sent flip. The audience link is set unconditionally: a
/// delivery confirmed at dispatch time already carries sent=1, and its
/// mirror catches up on the first ack.
async fn mark_sent(pool: &Pool, target: &AckTarget) -> Result<()> {
    db::mark_delivery_sent(pool, target.delivery_id, target.campaign_id).await?;
    if let Some(audience_id) = target.audience_id {
        db::mark_audience_link_sent(pool, audience_id, target.contact_id).await?;
    }
    Ok(())
}

// ---- HTTP surface ----

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub breaker: Arc<CircuitBreaker>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/webhook", post(post_webhook))
        .route("/health", get(get_health))
        .with_state(state)
}

/// POST /webhook
///
/// The body is parsed by hand rather than through the Json extractor so a
/// broken payload still gets the 200 + `success: false` contract.
async fn post_webhook(State(state): State<AppState>, body: String) -> Json<WebhookReply> {
    let env: Envelope = match serde_json::from_str(&body) {
        Ok(env) => env,
        Err(err) => {
            warn!(%err, "unparseable webhook body");
            return Json(WebhookReply::failure(format!(
                "malformed webhook payload: {err}"
            )));
        }
    };
    match handle_event(&state.pool, &state.breaker, &env).await {
        Ok(reply) => Json(reply),
        Err(err) => {
            warn!(%err, event = %env.event, "webhook processing failed");
            Json(WebhookReply::failure(err.to_string()))
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthReply {
    status: &'static str,
    pending_jobs: i64,
}

/// GET /health
async fn get_health(State(state): State<AppState>) -> Json<HealthReply> {
    match db::count_pending_jobs(&state.pool).await {
        Ok(pending_jobs) => Json(HealthReply {
            status: "ok",
            pending_jobs,
        }),
        Err(err) => {
            warn!(?err, "health probe could not query the queue");
            Json(HealthReply {
                status: "degraded",
                pending_jobs: 0,
            })
        }
    }
}

/// Bind and serve the webhook listener until the process exits.
pub async fn serve(addr: &str, state: AppState) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding webhook listener on {addr}"))?;
    info!(%addr, "webhook listener ready");
    axum::serve(listener, router(state))
        .await
        .context("webhook server")?;
    Ok(())
}
