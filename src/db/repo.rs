use super::model::{
    AckTarget, CampaignDispatch, ContactRef, DeliveryDispatch, DeliveryForDispatch, FailedJob,
    NewCampaignRow, NewMessageRow,
};
use crate::model::{Campaign, CampaignStatus, Instance, JobKind};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    // Pass through non-sqlite schemes
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }

    // In-memory URLs like sqlite::memory: or sqlite::memory:?cache=shared
    if url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    // Strip prefix and optional //
    let rest = &url["sqlite:".len()..];
    let (_had_slashes, path_with_query) = if let Some(r) = rest.strip_prefix("//") {
        (true, r)
    } else {
        (false, rest)
    };

    // Separate query string if any
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        // nothing to normalize
        return url.to_string();
    }

    // Expand leading ~/ to HOME
    let expanded_path = if let Some(rest) = path_part.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            format!("{}/{}", home.trim_end_matches('/'), rest)
        } else {
            path_part.to_string()
        }
    } else {
        path_part.to_string()
    };

    // Ensure parent directory exists if any
    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    // Rebuild URL, prefer sqlite:// form
    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---- audiences & contacts ----

#[instrument(skip_all)]
pub async fn get_or_create_default_audience(pool: &Pool, owner_id: i64) -> Result<i64> {
    if let Some(id) = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM audiences WHERE owner_id = ? AND is_default = 1 AND deleted_at IS NULL",
    )
    .bind(owner_id)
    .fetch_optional(pool)
    .await?
    {
        return Ok(id);
    }

    let rec = sqlx::query(
        "INSERT INTO audiences (owner_id, name, is_default) VALUES (?, 'All contacts', 1) RETURNING id",
    )
    .bind(owner_id)
    .fetch_one(pool)
    .await?;
    Ok(rec.get::<i64, _>("id"))
}

pub async fn audience_exists(pool: &Pool, owner_id: i64, audience_id: i64) -> Result<bool> {
    let id = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM audiences WHERE id = ? AND owner_id = ? AND deleted_at IS NULL",
    )
    .bind(audience_id)
    .bind(owner_id)
    .fetch_optional(pool)
    .await?;
    Ok(id.is_some())
}

/// Active contacts of an owner, optionally restricted to those carrying any
/// of the given labels.
pub async fn active_contacts_for_owner(
    pool: &Pool,
    owner_id: i64,
    labels: &[String],
) -> Result<Vec<ContactRef>> {
    let rows = if labels.is_empty() {
        sqlx::query(
            "SELECT id, phone FROM contacts \
             WHERE owner_id = ? AND status = 'active' AND deleted_at IS NULL ORDER BY id",
        )
        .bind(owner_id)
        .fetch_all(pool)
        .await?
    } else {
        let placeholders = vec!["?"; labels.len()].join(", ");
        let sql = format!(
            "SELECT c.id, c.phone FROM contacts c \
             WHERE c.owner_id = ? AND c.status = 'active' AND c.deleted_at IS NULL \
               AND EXISTS (SELECT 1 FROM contact_labels l \
                           WHERE l.contact_id = c.id AND l.label IN ({placeholders})) \
             ORDER BY c.id"
        );
        let mut query = sqlx::query(&sql).bind(owner_id);
        for label in labels {
            query = query.bind(label);
        }
        query.fetch_all(pool).await?
    };

    Ok(rows
        .into_iter()
        .map(|row| ContactRef {
            id: row.get("id"),
            phone: row.get("phone"),
        })
        .collect())
}

pub async fn active_contacts_in_audience(pool: &Pool, audience_id: i64) -> Result<Vec<ContactRef>> {
    let rows = sqlx::query(
        "SELECT id, phone FROM contacts \
         WHERE audience_id = ? AND status = 'active' AND deleted_at IS NULL ORDER BY id",
    )
    .bind(audience_id)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|row| ContactRef {
            id: row.get("id"),
            phone: row.get("phone"),
        })
        .collect())
}

// ---- instances ----

fn instance_from_row(row: &SqliteRow) -> Result<Instance> {
    Ok(Instance {
        id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        provider_ref: row.try_get("provider_ref")?,
        phone: row.try_get("phone")?,
        status_connection: row.try_get("status_connection")?,
        qr_code: row.try_get("qr_code")?,
        synced_at: row.try_get("synced_at")?,
    })
}

pub async fn fetch_instance(
    pool: &Pool,
    owner_id: i64,
    instance_id: i64,
) -> Result<Option<Instance>> {
    let row = sqlx::query(
        "SELECT id, owner_id, provider_ref, phone, status_connection, qr_code, synced_at \
         FROM instances WHERE id = ? AND owner_id = ? AND deleted_at IS NULL",
    )
    .bind(instance_id)
    .bind(owner_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(instance_from_row).transpose()
}

pub async fn fetch_instance_by_ref(pool: &Pool, provider_ref: &str) -> Result<Option<Instance>> {
    let row = sqlx::query(
        "SELECT id, owner_id, provider_ref, phone, status_connection, qr_code, synced_at \
         FROM instances WHERE provider_ref = ? AND deleted_at IS NULL",
    )
    .bind(provider_ref)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(instance_from_row).transpose()
}

/// Flip the local connection flag. A `Some` phone replaces the stored one;
/// `None` leaves it as is.
#[instrument(skip_all)]
pub async fn set_instance_connection(
    pool: &Pool,
    instance_id: i64,
    connected: bool,
    phone: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE instances SET status_connection = ?, phone = COALESCE(?, phone), \
         synced_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(i64::from(connected))
    .bind(phone)
    .bind(instance_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Local reset after a corrupted session is cleaned up: disconnected, phone
/// and pairing QR dropped.
#[instrument(skip_all)]
pub async fn reset_instance_connection(pool: &Pool, instance_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE instances SET status_connection = 0, phone = NULL, qr_code = NULL, \
         synced_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(instance_id)
    .execute(pool)
    .await?;
    Ok(())
}

// ---- campaigns ----

fn campaign_from_row(row: &SqliteRow) -> Result<Campaign> {
    let id: i64 = row.try_get("id")?;
    let status_code: i64 = row.try_get("status")?;
    let status = CampaignStatus::from_code(status_code)
        .ok_or_else(|| anyhow!("campaign {} has unknown status {}", id, status_code))?;
    let public_id_raw: String = row.try_get("public_id")?;
    let public_id = uuid::Uuid::parse_str(&public_id_raw)
        .with_context(|| format!("campaign {} has malformed public_id", id))?;

    Ok(Campaign {
        id,
        public_id,
        owner_id: row.try_get("owner_id")?,
        instance_id: row.try_get("instance_id")?,
        audience_id: row.try_get("audience_id")?,
        name: row.try_get("name")?,
        kind: row.try_get("kind")?,
        status,
        schedule_at: row.try_get("schedule_at")?,
        total_contacts: row.try_get("total_contacts")?,
        total_sent: row.try_get("total_sent")?,
        total_delivered: row.try_get("total_delivered")?,
        total_read: row.try_get("total_read")?,
        progress: row.try_get("progress")?,
        date_end: row.try_get("date_end")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn fetch_campaign(
    pool: &Pool,
    owner_id: i64,
    campaign_id: i64,
) -> Result<Option<Campaign>> {
    let row = sqlx::query(
        "SELECT id, public_id, owner_id, instance_id, audience_id, name, kind, status, \
                schedule_at, total_contacts, total_sent, total_delivered, total_read, \
                progress, date_end, created_at, updated_at \
         FROM campaigns WHERE id = ? AND owner_id = ? AND deleted_at IS NULL",
    )
    .bind(campaign_id)
    .bind(owner_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(campaign_from_row).transpose()
}

/// Insert a campaign with its messages and one delivery per contact for the
/// first message, plus the audience membership rows, in one transaction.
/// Returns the campaign id.
#[instrument(skip_all)]
pub async fn insert_campaign_bundle(
    pool: &Pool,
    campaign: &NewCampaignRow,
    messages: &[NewMessageRow],
    contacts: &[ContactRef],
) -> Result<i64> {
    let mut tx = pool.begin().await?;

    let campaign_id: i64 = sqlx::query(
        "INSERT INTO campaigns (public_id, owner_id, instance_id, audience_id, name, kind, \
                                status, schedule_at, total_contacts, date_end) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(campaign.public_id.to_string())
    .bind(campaign.owner_id)
    .bind(campaign.instance_id)
    .bind(campaign.audience_id)
    .bind(&campaign.name)
    .bind(&campaign.kind)
    .bind(campaign.status.code())
    .bind(campaign.schedule_at)
    .bind(campaign.total_contacts)
    .bind(campaign.date_end)
    .fetch_one(&mut *tx)
    .await?
    .get("id");

    let mut first_message_id: Option<i64> = None;
    for message in messages {
        let message_id: i64 = sqlx::query(
            "INSERT INTO messages (campaign_id, ord, body, media_url, media_kind) \
             VALUES (?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(campaign_id)
        .bind(message.ord)
        .bind(&message.body)
        .bind(&message.media_url)
        .bind(&message.media_kind)
        .fetch_one(&mut *tx)
        .await?
        .get("id");
        first_message_id.get_or_insert(message_id);
    }

    let first_message_id =
        first_message_id.ok_or_else(|| anyhow!("campaign bundle has no messages"))?;

    for contact in contacts {
        sqlx::query(
            "INSERT INTO deliveries (campaign_id, message_id, contact_id, phone) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(campaign_id)
        .bind(first_message_id)
        .bind(contact.id)
        .bind(&contact.phone)
        .execute(&mut *tx)
        .await?;

        if let Some(audience_id) = campaign.audience_id {
            sqlx::query(
                "INSERT OR IGNORE INTO audience_contacts (audience_id, contact_id) VALUES (?, ?)",
            )
            .bind(audience_id)
            .bind(contact.id)
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;
    Ok(campaign_id)
}

/// Compare-and-set status change. Returns false when the row was not in
/// `from` anymore (or is not owned), so callers can re-read and decide.
#[instrument(skip_all)]
pub async fn update_campaign_status(
    pool: &Pool,
    owner_id: i64,
    campaign_id: i64,
    from: CampaignStatus,
    to: CampaignStatus,
) -> Result<bool> {
    let rows = sqlx::query(
        "UPDATE campaigns SET status = ?, updated_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND owner_id = ? AND status = ? AND deleted_at IS NULL",
    )
    .bind(to.code())
    .bind(campaign_id)
    .bind(owner_id)
    .bind(from.code())
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows == 1)
}

/// Cancel every owned, non-deleted campaign in `ids` with a single UPDATE.
/// Returns how many rows matched.
#[instrument(skip_all)]
pub async fn cancel_campaigns(pool: &Pool, owner_id: i64, ids: &[i64]) -> Result<u64> {
    if ids.is_empty() {
        return Ok(0);
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let sql = format!(
        "UPDATE campaigns SET status = {}, updated_at = CURRENT_TIMESTAMP \
         WHERE owner_id = ? AND deleted_at IS NULL AND id IN ({placeholders})",
        CampaignStatus::Canceled.code()
    );
    let mut query = sqlx::query(&sql).bind(owner_id);
    for id in ids {
        query = query.bind(id);
    }
    Ok(query.execute(pool).await?.rows_affected())
}

pub async fn campaign_status(pool: &Pool, campaign_id: i64) -> Result<Option<CampaignStatus>> {
    let code = sqlx::query_scalar::<_, i64>(
        "SELECT status FROM campaigns WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(campaign_id)
    .fetch_optional(pool)
    .await?;
    match code {
        None => Ok(None),
        Some(code) => CampaignStatus::from_code(code)
            .map(Some)
            .ok_or_else(|| anyhow!("campaign {} has unknown status {}", campaign_id, code)),
    }
}

pub async fn fetch_campaign_dispatch(
    pool: &Pool,
    campaign_id: i64,
) -> Result<Option<CampaignDispatch>> {
    let row = sqlx::query(
        "SELECT c.id, c.status, c.audience_id, c.instance_id, i.provider_ref \
         FROM campaigns c JOIN instances i ON i.id = c.instance_id \
         WHERE c.id = ? AND c.deleted_at IS NULL",
    )
    .bind(campaign_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let status_code: i64 = row.try_get("status")?;
    let status = CampaignStatus::from_code(status_code)
        .ok_or_else(|| anyhow!("campaign {} has unknown status {}", campaign_id, status_code))?;
    Ok(Some(CampaignDispatch {
        campaign_id: row.try_get("id")?,
        status,
        audience_id: row.try_get("audience_id")?,
        instance_id: row.try_get("instance_id")?,
        provider_ref: row.try_get("provider_ref")?,
    }))
}

// ---- messages & deliveries ----

/// Recipients of a campaign still awaiting their first successful handoff.
/// Rows already accepted by the provider are excluded so a retried fan-out
/// cannot send twice.
pub async fn pending_deliveries(
    pool: &Pool,
    campaign_id: i64,
) -> Result<Vec<DeliveryForDispatch>> {
    let rows = sqlx::query(
        "SELECT d.id, d.contact_id, d.phone, d.message_id, m.body, m.media_url, m.media_kind \
         FROM deliveries d JOIN messages m ON m.id = d.message_id \
         WHERE d.campaign_id = ? AND d.sent = 0 AND d.provider_message_id IS NULL \
         ORDER BY d.id",
    )
    .bind(campaign_id)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(DeliveryForDispatch {
                delivery_id: row.try_get("id")?,
                contact_id: row.try_get("contact_id")?,
                phone: row.try_get("phone")?,
                message_id: row.try_get("message_id")?,
                body: row.try_get("body")?,
                media_url: row.try_get("media_url")?,
                media_kind: row.try_get("media_kind")?,
            })
        })
        .collect()
}

pub async fn fetch_delivery_dispatch(
    pool: &Pool,
    delivery_id: i64,
) -> Result<Option<DeliveryDispatch>> {
    let row = sqlx::query(
        "SELECT d.id, d.message_id, d.campaign_id, c.status AS campaign_status, c.audience_id, \
                d.contact_id, i.provider_ref, d.phone, m.body, m.media_url, m.media_kind \
         FROM deliveries d \
         JOIN messages m ON m.id = d.message_id \
         JOIN campaigns c ON c.id = d.campaign_id \
         JOIN instances i ON i.id = c.instance_id \
         WHERE d.id = ?",
    )
    .bind(delivery_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let status_code: i64 = row.try_get("campaign_status")?;
    let campaign_status = CampaignStatus::from_code(status_code)
        .ok_or_else(|| anyhow!("delivery {} campaign has unknown status", delivery_id))?;
    Ok(Some(DeliveryDispatch {
        delivery_id: row.try_get("id")?,
        message_id: row.try_get("message_id")?,
        campaign_id: row.try_get("campaign_id")?,
        campaign_status,
        audience_id: row.try_get("audience_id")?,
        contact_id: row.try_get("contact_id")?,
        provider_ref: row.try_get("provider_ref")?,
        phone: row.try_get("phone")?,
        body: row.try_get("body")?,
        media_url: row.try_get("media_url")?,
        media_kind: row.try_get("media_kind")?,
    }))
}

/// Store the provider's message id for a delivery handed off to the
/// provider. The sent flag stays 0 until the webhook confirms.
#[instrument(skip_all)]
pub async fn record_provider_acceptance(
    pool: &Pool,
    delivery_id: i64,
    provider_message_id: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE deliveries SET provider_message_id = ?, error = NULL, \
         updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(provider_message_id)
    .bind(delivery_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn record_delivery_failure(pool: &Pool, delivery_id: i64, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE deliveries SET error = ?, failure_count = failure_count + 1, \
         updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(error)
    .bind(delivery_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_message_status(pool: &Pool, message_id: i64, status: &str) -> Result<()> {
    sqlx::query("UPDATE messages SET status = ? WHERE id = ?")
        .bind(status)
        .bind(message_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ---- acknowledgment flips ----

pub async fn find_ack_target(
    pool: &Pool,
    provider_message_id: &str,
) -> Result<Option<AckTarget>> {
    let row = sqlx::query(
        "SELECT d.id, d.campaign_id, d.contact_id, c.audience_id, d.phone \
         FROM deliveries d JOIN campaigns c ON c.id = d.campaign_id \
         WHERE d.provider_message_id = ?",
    )
    .bind(provider_message_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    Ok(Some(AckTarget {
        delivery_id: row.try_get("id")?,
        campaign_id: row.try_get("campaign_id")?,
        contact_id: row.try_get("contact_id")?,
        audience_id: row.try_get("audience_id")?,
        phone: row.try_get("phone")?,
    }))
}

/// Flip `sent` 0 -> 1. The campaign counter and progress move only when this
/// call did the flip, so concurrent acks cannot double-count.
#[instrument(skip_all)]
pub async fn mark_delivery_sent(pool: &Pool, delivery_id: i64, campaign_id: i64) -> Result<bool> {
    let rows = sqlx::query(
        "UPDATE deliveries SET sent = 1, updated_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND sent = 0",
    )
    .bind(delivery_id)
    .execute(pool)
    .await?
    .rows_affected();
    if rows == 0 {
        return Ok(false);
    }
    sqlx::query(
        "UPDATE campaigns SET total_sent = total_sent + 1, \
         progress = CASE WHEN total_contacts > 0 \
                         THEN MIN(100, (100 * (total_sent + 1)) / total_contacts) \
                         ELSE 100 END, \
         updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(campaign_id)
    .execute(pool)
    .await?;
    Ok(true)
}

/// Flip `delivered` 0 -> 1, counter gated the same way as `sent`.
#[instrument(skip_all)]
pub async fn mark_delivery_delivered(
    pool: &Pool,
    delivery_id: i64,
    campaign_id: i64,
) -> Result<bool> {
    let rows = sqlx::query(
        "UPDATE deliveries SET delivered = 1, updated_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND delivered = 0",
    )
    .bind(delivery_id)
    .execute(pool)
    .await?
    .rows_affected();
    if rows == 0 {
        return Ok(false);
    }
    sqlx::query(
        "UPDATE campaigns SET total_delivered = total_delivered + 1, \
         updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(campaign_id)
    .execute(pool)
    .await?;
    Ok(true)
}

/// Flip `read` 0 -> 1, counter gated the same way as `sent`.
#[instrument(skip_all)]
pub async fn mark_delivery_read(pool: &Pool, delivery_id: i64, campaign_id: i64) -> Result<bool> {
    let rows = sqlx::query(
        "UPDATE deliveries SET read = 1, updated_at = CURRENT_TIMESTAMP \
         WHERE id = ? AND read = 0",
    )
    .bind(delivery_id)
    .execute(pool)
    .await?
    .rows_affected();
    if rows == 0 {
        return Ok(false);
    }
    sqlx::query(
        "UPDATE campaigns SET total_read = total_read + 1, \
         updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(campaign_id)
    .execute(pool)
    .await?;
    Ok(true)
}

#[instrument(skip_all)]
pub async fn set_delivery_error(pool: &Pool, delivery_id: i64, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE deliveries SET error = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(error)
    .bind(delivery_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_audience_link_sent(
    pool: &Pool,
    audience_id: i64,
    contact_id: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE audience_contacts SET send = 1, has_error = 0 \
         WHERE audience_id = ? AND contact_id = ?",
    )
    .bind(audience_id)
    .bind(contact_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_audience_link_read(
    pool: &Pool,
    audience_id: i64,
    contact_id: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE audience_contacts SET read = 1 WHERE audience_id = ? AND contact_id = ?",
    )
    .bind(audience_id)
    .bind(contact_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn mark_audience_link_error(
    pool: &Pool,
    audience_id: i64,
    contact_id: i64,
) -> Result<()> {
    sqlx::query(
        "UPDATE audience_contacts SET has_error = 1 WHERE audience_id = ? AND contact_id = ?",
    )
    .bind(audience_id)
    .bind(contact_id)
    .execute(pool)
    .await?;
    Ok(())
}

// ---- dispatch queue ----

#[instrument(skip_all)]
pub async fn enqueue_job(
    pool: &Pool,
    kind: JobKind,
    campaign_id: i64,
    ref_id: i64,
    backoff_base_secs: i64,
    due_at: DateTime<Utc>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO dispatch_jobs (kind, campaign_id, ref_id, attempt, backoff_base_secs, due_at) \
         VALUES (?, ?, ?, 0, ?, ?) RETURNING id",
    )
    .bind(kind.as_str())
    .bind(campaign_id)
    .bind(ref_id)
    .bind(backoff_base_secs)
    .bind(due_at)
    .fetch_one(pool)
    .await?;
    Ok(rec.get("id"))
}

/// Atomically claim the oldest due job that is neither dead-lettered nor
/// under a live lease, stamping the lease in the same statement.
#[instrument(skip_all)]
pub async fn claim_next_due_job(
    pool: &Pool,
    lease_secs: u64,
) -> Result<Option<crate::model::DispatchJob>> {
    let row = sqlx::query(
        "UPDATE dispatch_jobs SET locked_at = CURRENT_TIMESTAMP \
         WHERE id = ( \
             SELECT id FROM dispatch_jobs \
             WHERE failed_at IS NULL \
               AND datetime(due_at) <= CURRENT_TIMESTAMP \
               AND (locked_at IS NULL OR datetime(locked_at) <= datetime('now', ? || ' seconds')) \
             ORDER BY datetime(due_at) ASC LIMIT 1 \
         ) \
         RETURNING id, kind, campaign_id, ref_id, attempt, max_attempts, backoff_base_secs, due_at",
    )
    .bind(-(lease_secs as i64))
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    let kind_raw: String = row.try_get("kind")?;
    let kind = JobKind::from_str(&kind_raw)
        .ok_or_else(|| anyhow!("dispatch job has unknown kind {}", kind_raw))?;
    Ok(Some(crate::model::DispatchJob {
        id: row.try_get("id")?,
        kind,
        campaign_id: row.try_get("campaign_id")?,
        ref_id: row.try_get("ref_id")?,
        attempt: row.try_get("attempt")?,
        max_attempts: row.try_get("max_attempts")?,
        backoff_base_secs: row.try_get("backoff_base_secs")?,
        due_at: row.try_get("due_at")?,
    }))
}

#[instrument(skip_all)]
pub async fn delete_job(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM dispatch_jobs WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Exponential backoff: `base * 2^attempt` seconds, capped. Releases the
/// lease so a later poll can pick the job up again, and records what went
/// wrong on this attempt.
#[instrument(skip_all)]
pub async fn backoff_job(
    pool: &Pool,
    id: i64,
    attempt: i64,
    base_secs: i64,
    max_cap_secs: i64,
    error: &str,
) -> Result<()> {
    let secs = base_secs * (1_i64 << attempt.clamp(0, 10));
    let secs = if max_cap_secs > 0 {
        secs.min(max_cap_secs)
    } else {
        secs
    };
    sqlx::query(
        "UPDATE dispatch_jobs SET attempt = ?, due_at = datetime('now', ? || ' seconds'), \
         last_error = ?, locked_at = NULL WHERE id = ?",
    )
    .bind(attempt + 1)
    .bind(secs)
    .bind(error)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Dead-letter a job that ran out of attempts. The row is kept so failures
/// stay observable.
#[instrument(skip_all)]
pub async fn fail_job(pool: &Pool, id: i64, error: &str) -> Result<()> {
    sqlx::query(
        "UPDATE dispatch_jobs SET failed_at = CURRENT_TIMESTAMP, last_error = ?, \
         locked_at = NULL WHERE id = ?",
    )
    .bind(error)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Pull a campaign's waiting fan-out jobs forward to now. Used when a
/// scheduled campaign is activated by hand.
#[instrument(skip_all)]
pub async fn expedite_campaign_jobs(pool: &Pool, campaign_id: i64) -> Result<u64> {
    let rows = sqlx::query(
        "UPDATE dispatch_jobs SET due_at = CURRENT_TIMESTAMP \
         WHERE campaign_id = ? AND kind = ? AND failed_at IS NULL",
    )
    .bind(campaign_id)
    .bind(JobKind::ProcessCampaign.as_str())
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows)
}

pub async fn count_pending_jobs(pool: &Pool) -> Result<i64> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM dispatch_jobs WHERE failed_at IS NULL")
            .fetch_one(pool)
            .await?;
    Ok(count)
}

pub async fn list_failed_jobs(pool: &Pool) -> Result<Vec<FailedJob>> {
    let rows = sqlx::query(
        "SELECT id, kind, campaign_id, ref_id, last_error, failed_at \
         FROM dispatch_jobs WHERE failed_at IS NOT NULL ORDER BY datetime(failed_at) DESC",
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(FailedJob {
                id: row.try_get("id")?,
                kind: row.try_get("kind")?,
                campaign_id: row.try_get("campaign_id")?,
                ref_id: row.try_get("ref_id")?,
                last_error: row.try_get("last_error")?,
                failed_at: row.try_get("failed_at")?,
            })
        })
        .collect()
}

// ---- recovery sweep ----

pub async fn live_job_exists(pool: &Pool, campaign_id: i64) -> Result<bool> {
    let exists: i64 = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM dispatch_jobs WHERE campaign_id = ? AND failed_at IS NULL)",
    )
    .bind(campaign_id)
    .fetch_one(pool)
    .await?;
    Ok(exists == 1)
}

/// Pending campaigns with undelivered work and no job to do it: the lost
/// enqueues the sweep repairs.
pub async fn campaigns_needing_requeue(pool: &Pool) -> Result<Vec<i64>> {
    let ids = sqlx::query_scalar::<_, i64>(
        "SELECT c.id FROM campaigns c \
         WHERE c.status = 0 AND c.deleted_at IS NULL \
           AND EXISTS (SELECT 1 FROM deliveries d \
                       WHERE d.campaign_id = c.id AND d.sent = 0 \
                         AND d.provider_message_id IS NULL) \
           AND NOT EXISTS (SELECT 1 FROM dispatch_jobs j \
                           WHERE j.campaign_id = c.id AND j.failed_at IS NULL) \
         ORDER BY c.id",
    )
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Scheduled campaigns whose activation job disappeared.
pub async fn scheduled_campaigns_without_jobs(
    pool: &Pool,
) -> Result<Vec<(i64, Option<DateTime<Utc>>)>> {
    let rows = sqlx::query(
        "SELECT c.id, c.schedule_at FROM campaigns c \
         WHERE c.status = 3 AND c.deleted_at IS NULL \
           AND NOT EXISTS (SELECT 1 FROM dispatch_jobs j \
                           WHERE j.campaign_id = c.id AND j.failed_at IS NULL) \
         ORDER BY c.id",
    )
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|row| Ok((row.try_get("id")?, row.try_get("schedule_at")?)))
        .collect()
}
