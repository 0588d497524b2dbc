use sqlx::Row;
use wa_courier::campaign::{self, AudienceRef, NewCampaign, NewMessage};
use wa_courier::config;
use wa_courier::error::Error;
use wa_courier::model::CampaignStatus;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn policy() -> config::CampaignPolicy {
    let cfg: config::Config = serde_yaml::from_str(config::example()).unwrap();
    cfg.campaign
}

async fn seed_instance(pool: &sqlx::SqlitePool, owner_id: i64, provider_ref: &str) -> i64 {
    sqlx::query(
        "INSERT INTO instances (owner_id, provider_ref, status_connection) \
         VALUES (?, ?, 1) RETURNING id",
    )
    .bind(owner_id)
    .bind(provider_ref)
    .fetch_one(pool)
    .await
    .unwrap()
    .get("id")
}

async fn seed_contacts(pool: &sqlx::SqlitePool, owner_id: i64, count: usize) {
    for n in 0..count {
        sqlx::query("INSERT INTO contacts (owner_id, phone) VALUES (?, ?)")
            .bind(owner_id)
            .bind(format!("55119999{owner_id}{n:03}"))
            .execute(pool)
            .await
            .unwrap();
    }
}

fn broadcast(instance_id: i64, messages: Vec<NewMessage>) -> NewCampaign {
    NewCampaign {
        instance_id,
        audience: AudienceRef::New,
        name: "spring promo".into(),
        kind: "broadcast".into(),
        messages,
        schedule_at: None,
        labels: vec![],
    }
}

fn text(body: &str) -> NewMessage {
    NewMessage {
        body: body.into(),
        media_url: None,
        media_kind: None,
    }
}

async fn count(pool: &sqlx::SqlitePool, sql: &str) -> i64 {
    sqlx::query_scalar(sql).fetch_one(pool).await.unwrap()
}

#[tokio::test]
async fn create_builds_messages_deliveries_and_queue() {
    let pool = setup_pool().await;
    let instance_id = seed_instance(&pool, 1, "inst_main").await;
    seed_contacts(&pool, 1, 10).await;

    let created = campaign::create(
        &pool,
        &policy(),
        1,
        broadcast(
            instance_id,
            vec![text("first"), text("second"), text("third")],
        ),
    )
    .await
    .unwrap();

    assert_eq!(created.status, CampaignStatus::Pending);
    assert_eq!(created.status.label(), "active");
    assert_eq!(created.total_contacts, 10);
    assert_eq!(created.total_sent, 0);
    assert_eq!(created.progress, 0);
    assert!(created.date_end.is_some());

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM messages").await, 3);
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM deliveries WHERE sent = 0").await,
        10
    );
    // Deliveries all hang off the first message of the sequence.
    assert_eq!(
        count(
            &pool,
            "SELECT COUNT(DISTINCT message_id) FROM deliveries"
        )
        .await,
        1
    );
    assert_eq!(
        count(&pool, "SELECT COUNT(*) FROM audience_contacts").await,
        10
    );
    assert_eq!(
        count(
            &pool,
            "SELECT COUNT(*) FROM dispatch_jobs WHERE kind = 'process_campaign' \
             AND failed_at IS NULL",
        )
        .await,
        1
    );

    let view = campaign::get(&pool, 1, created.id).await.unwrap();
    assert_eq!(view.status, "active");
    assert!(!view.paused);
    assert!(!view.canceled);
}

#[tokio::test]
async fn creation_without_contacts_persists_nothing() {
    let pool = setup_pool().await;
    let instance_id = seed_instance(&pool, 1, "inst_main").await;

    let err = campaign::create(&pool, &policy(), 1, broadcast(instance_id, vec![text("hi")]))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InsufficientContacts));

    assert_eq!(count(&pool, "SELECT COUNT(*) FROM campaigns").await, 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM messages").await, 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM deliveries").await, 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM dispatch_jobs").await, 0);
}

#[tokio::test]
async fn scheduled_campaign_delays_the_dispatch_job() {
    let pool = setup_pool().await;
    let instance_id = seed_instance(&pool, 1, "inst_main").await;
    seed_contacts(&pool, 1, 2).await;

    let mut input = broadcast(instance_id, vec![text("later")]);
    input.schedule_at = Some(chrono::Utc::now() + chrono::Duration::hours(2));

    let created = campaign::create(&pool, &policy(), 1, input).await.unwrap();
    assert_eq!(created.status, CampaignStatus::Scheduled);
    assert_eq!(created.status.label(), "scheduled");

    // The job exists but is dated at the schedule time, not now.
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM dispatch_jobs").await, 1);
    assert_eq!(
        count(
            &pool,
            "SELECT COUNT(*) FROM dispatch_jobs \
             WHERE datetime(due_at) > datetime('now', '+7000 seconds')",
        )
        .await,
        1
    );
}

#[tokio::test]
async fn canceled_is_a_sink() {
    let pool = setup_pool().await;
    let instance_id = seed_instance(&pool, 1, "inst_main").await;
    seed_contacts(&pool, 1, 3).await;

    let created = campaign::create(&pool, &policy(), 1, broadcast(instance_id, vec![text("x")]))
        .await
        .unwrap();

    assert_eq!(campaign::cancel(&pool, 1, created.id).await.unwrap(), "canceled");

    for target in [
        CampaignStatus::Pending,
        CampaignStatus::Paused,
        CampaignStatus::Scheduled,
        CampaignStatus::Canceled,
    ] {
        let err = campaign::change_status(&pool, 1, created.id, target)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { from: "canceled", .. }));
    }

    // A second cancel is itself a rejected transition.
    let err = campaign::cancel(&pool, 1, created.id).await.unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { from: "canceled", .. }));

    let report = campaign::check_active(&pool, 1, created.id).await.unwrap();
    assert!(!report.active);
    assert_eq!(report.status, "canceled");
}

#[tokio::test]
async fn resume_enqueues_exactly_one_tight_job() {
    let pool = setup_pool().await;
    let instance_id = seed_instance(&pool, 1, "inst_main").await;
    seed_contacts(&pool, 1, 3).await;

    let created = campaign::create(&pool, &policy(), 1, broadcast(instance_id, vec![text("x")]))
        .await
        .unwrap();

    assert_eq!(
        campaign::change_status(&pool, 1, created.id, CampaignStatus::Paused)
            .await
            .unwrap(),
        "paused"
    );

    // Simulate the worker having consumed the creation job meanwhile.
    sqlx::query("DELETE FROM dispatch_jobs")
        .execute(&pool)
        .await
        .unwrap();

    assert_eq!(
        campaign::change_status(&pool, 1, created.id, CampaignStatus::Pending)
            .await
            .unwrap(),
        "active"
    );
    let row = sqlx::query(
        "SELECT backoff_base_secs, attempt FROM dispatch_jobs WHERE failed_at IS NULL",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(row.get::<i64, _>("backoff_base_secs"), 2);
    assert_eq!(row.get::<i64, _>("attempt"), 0);
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM dispatch_jobs").await, 1);

    // A second pause/resume with the job still queued must not stack another.
    campaign::change_status(&pool, 1, created.id, CampaignStatus::Paused)
        .await
        .unwrap();
    campaign::change_status(&pool, 1, created.id, CampaignStatus::Pending)
        .await
        .unwrap();
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM dispatch_jobs").await, 1);
}

#[tokio::test]
async fn activating_a_scheduled_campaign_expedites_its_job() {
    let pool = setup_pool().await;
    let instance_id = seed_instance(&pool, 1, "inst_main").await;
    seed_contacts(&pool, 1, 2).await;

    let mut input = broadcast(instance_id, vec![text("later")]);
    input.schedule_at = Some(chrono::Utc::now() + chrono::Duration::hours(2));
    let created = campaign::create(&pool, &policy(), 1, input).await.unwrap();

    campaign::change_status(&pool, 1, created.id, CampaignStatus::Pending)
        .await
        .unwrap();

    // Still one job, now due immediately.
    assert_eq!(count(&pool, "SELECT COUNT(*) FROM dispatch_jobs").await, 1);
    assert_eq!(
        count(
            &pool,
            "SELECT COUNT(*) FROM dispatch_jobs WHERE datetime(due_at) <= CURRENT_TIMESTAMP",
        )
        .await,
        1
    );
}

#[tokio::test]
async fn cancel_multiple_only_counts_owned_campaigns() {
    let pool = setup_pool().await;
    let mine = seed_instance(&pool, 1, "inst_mine").await;
    let theirs = seed_instance(&pool, 2, "inst_theirs").await;
    seed_contacts(&pool, 1, 2).await;
    seed_contacts(&pool, 2, 2).await;

    let own = campaign::create(&pool, &policy(), 1, broadcast(mine, vec![text("a")]))
        .await
        .unwrap();
    let other = campaign::create(&pool, &policy(), 2, broadcast(theirs, vec![text("b")]))
        .await
        .unwrap();

    let count_canceled = campaign::cancel_multiple(&pool, 1, &[own.id, other.id, 9999])
        .await
        .unwrap();
    assert_eq!(count_canceled, 1);

    let own_status: i64 = sqlx::query_scalar("SELECT status FROM campaigns WHERE id = ?")
        .bind(own.id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(own_status, CampaignStatus::Canceled.code());

    let other_status: i64 = sqlx::query_scalar("SELECT status FROM campaigns WHERE id = ?")
        .bind(other.id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(other_status, CampaignStatus::Pending.code());

    // Nothing owned in the list at all reads as not found.
    let err = campaign::cancel_multiple(&pool, 1, &[other.id]).await.unwrap_err();
    assert!(matches!(err, Error::NotFound("campaign")));
    let err = campaign::cancel_multiple(&pool, 1, &[]).await.unwrap_err();
    assert!(matches!(err, Error::NotFound("campaign")));
}
