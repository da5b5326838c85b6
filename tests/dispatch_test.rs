use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use draftdeck::approval;
use draftdeck::config::Config;
use draftdeck::db::{self, DraftForPublish};
use draftdeck::dispatch::{self, Dispatcher};
use draftdeck::model::{
    DraftKind, DraftStatus, Frequency, Identity, NewPost, Priority, RecurrencePattern,
    ReviewAction, TeamRole,
};
use draftdeck::scheduler;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

fn test_config() -> Config {
    serde_yaml::from_str(draftdeck::config::example()).unwrap()
}

fn member(user: &str) -> Identity {
    Identity {
        user_id: user.into(),
        team_id: "team-1".into(),
        role: TeamRole::Member,
    }
}

fn admin(user: &str) -> Identity {
    Identity {
        user_id: user.into(),
        team_id: "team-1".into(),
        role: TeamRole::Admin,
    }
}

fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

/// Scripted dispatcher: pops a canned response per publish call and records
/// what it was asked to publish.
#[derive(Clone, Default)]
struct RecordingDispatcher {
    responses: Arc<Mutex<VecDeque<Result<String>>>>,
    published: Arc<Mutex<Vec<(i64, usize)>>>,
}

impl RecordingDispatcher {
    fn with_responses(responses: Vec<Result<String>>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::from(responses))),
            ..Default::default()
        }
    }

    async fn published(&self) -> Vec<(i64, usize)> {
        self.published.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn publish(&self, draft: &DraftForPublish) -> Result<String> {
        self.published
            .lock()
            .await
            .push((draft.draft_id, draft.posts.len()));
        let mut guard = self.responses.lock().await;
        guard.pop_front().unwrap_or_else(|| Ok("ext-default".into()))
    }
}

/// Draft taken all the way to `scheduled` on the given slot time.
async fn scheduled_draft(
    pool: &sqlx::SqlitePool,
    cfg: &Config,
    content: &str,
    slot_start: DateTime<Utc>,
    now: DateTime<Utc>,
) -> i64 {
    let author = member("author-1");
    let draft = db::create_draft(
        pool,
        &author,
        DraftKind::Thread,
        &[
            NewPost {
                content: content.into(),
                media_ids: vec![],
            },
            NewPost {
                content: format!("{content} (2/2)"),
                media_ids: vec![],
            },
        ],
    )
    .await
    .unwrap();
    approval::submit_draft(pool, cfg, &author, draft.id)
        .await
        .unwrap();
    approval::review_draft(pool, &admin("admin-1"), draft.id, ReviewAction::Approve)
        .await
        .unwrap();

    db::create_slot(
        pool,
        "team-1",
        slot_start,
        slot_start + chrono::Duration::minutes(30),
    )
    .await
    .unwrap();
    scheduler::reserve_slot(pool, cfg, &author, draft.id, None, Priority::Normal, now)
        .await
        .unwrap();
    draft.id
}

#[tokio::test]
async fn due_draft_is_published_with_external_id() {
    let pool = setup_pool().await;
    let cfg = test_config();
    let now = utc(2030, 1, 1, 8, 0);

    let draft_id = scheduled_draft(&pool, &cfg, "ship it", utc(2030, 1, 2, 10, 0), now).await;

    let dispatcher = RecordingDispatcher::with_responses(vec![Ok("ext-42".into())]);
    let processed = dispatch::process_due_draft(&pool, &dispatcher, &cfg, utc(2030, 1, 2, 10, 5))
        .await
        .unwrap();
    assert!(processed);

    let draft = db::get_draft(&pool, draft_id).await.unwrap();
    assert_eq!(draft.status, DraftStatus::Published);
    assert_eq!(draft.external_post_id.as_deref(), Some("ext-42"));

    // the dispatcher saw the full thread
    assert_eq!(dispatcher.published().await, vec![(draft_id, 2)]);

    // nothing left to do
    let processed = dispatch::process_due_draft(&pool, &dispatcher, &cfg, utc(2030, 1, 2, 10, 6))
        .await
        .unwrap();
    assert!(!processed);
}

#[tokio::test]
async fn nothing_is_dispatched_before_the_slot_time() {
    let pool = setup_pool().await;
    let cfg = test_config();
    let now = utc(2030, 1, 1, 8, 0);

    let draft_id = scheduled_draft(&pool, &cfg, "too early", utc(2030, 1, 2, 10, 0), now).await;

    let dispatcher = RecordingDispatcher::default();
    let processed = dispatch::process_due_draft(&pool, &dispatcher, &cfg, utc(2030, 1, 2, 9, 59))
        .await
        .unwrap();
    assert!(!processed);
    assert!(dispatcher.published().await.is_empty());

    let draft = db::get_draft(&pool, draft_id).await.unwrap();
    assert_eq!(draft.status, DraftStatus::Scheduled);
}

#[tokio::test]
async fn dispatch_failure_requeues_urgent_with_the_error_recorded() {
    let pool = setup_pool().await;
    let cfg = test_config();
    let now = utc(2030, 1, 1, 8, 0);

    let draft_id = scheduled_draft(&pool, &cfg, "flaky api", utc(2030, 1, 2, 10, 0), now).await;

    let dispatcher =
        RecordingDispatcher::with_responses(vec![Err(anyhow!("rate limited by the platform"))]);
    let processed = dispatch::process_due_draft(&pool, &dispatcher, &cfg, utc(2030, 1, 2, 10, 5))
        .await
        .unwrap();
    assert!(processed);

    let draft = db::get_draft(&pool, draft_id).await.unwrap();
    assert_eq!(draft.status, DraftStatus::Approved);
    assert_eq!(draft.publish_attempts, 1);
    assert!(draft
        .publish_error
        .as_deref()
        .unwrap()
        .contains("rate limited"));
    assert_eq!(draft.slot_id, None);

    let entry = db::queue_entry_for_draft(&pool, draft_id)
        .await
        .unwrap()
        .expect("draft should be waiting in the queue");
    assert_eq!(entry.priority, Priority::Urgent);
    assert_eq!(entry.position, 0);
}

#[tokio::test]
async fn requeued_draft_lands_on_the_next_free_occurrence() {
    let pool = setup_pool().await;
    let cfg = test_config();
    let now = utc(2030, 1, 1, 8, 0);

    // weekly template: the failure should roll the draft onto the next week
    db::create_template(
        &pool,
        "team-1",
        utc(2030, 1, 2, 10, 0),
        utc(2030, 1, 2, 10, 30),
        &RecurrencePattern {
            frequency: Frequency::Weekly,
            interval: 1,
            end_date: None,
        },
    )
    .await
    .unwrap();

    let author = member("author-1");
    let draft = db::create_draft(
        &pool,
        &author,
        DraftKind::Tweet,
        &[NewPost {
            content: "retry me".into(),
            media_ids: vec![],
        }],
    )
    .await
    .unwrap();
    approval::submit_draft(&pool, &cfg, &author, draft.id)
        .await
        .unwrap();
    approval::review_draft(&pool, &admin("admin-1"), draft.id, ReviewAction::Approve)
        .await
        .unwrap();
    scheduler::reserve_slot(&pool, &cfg, &author, draft.id, None, Priority::Normal, now)
        .await
        .unwrap();

    let dispatcher = RecordingDispatcher::with_responses(vec![Err(anyhow!("timeout"))]);
    dispatch::process_due_draft(&pool, &dispatcher, &cfg, utc(2030, 1, 2, 10, 5))
        .await
        .unwrap();

    // re-queued urgent, then promoted straight into the next occurrence
    let rescheduled = db::get_draft(&pool, draft.id).await.unwrap();
    assert_eq!(rescheduled.status, DraftStatus::Scheduled);
    assert_eq!(rescheduled.publish_attempts, 1);
    let slot = db::get_slot(&pool, rescheduled.slot_id.unwrap())
        .await
        .unwrap();
    assert_eq!(slot.start_time, utc(2030, 1, 9, 10, 0));
    assert!(db::queue_entry_for_draft(&pool, draft.id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn exhausted_retry_budget_lands_in_failed() {
    let pool = setup_pool().await;
    let mut cfg = test_config();
    cfg.app.max_publish_attempts = 1;
    let now = utc(2030, 1, 1, 8, 0);

    let draft_id = scheduled_draft(&pool, &cfg, "doomed", utc(2030, 1, 2, 10, 0), now).await;

    let dispatcher =
        RecordingDispatcher::with_responses(vec![Err(anyhow!("account suspended"))]);
    dispatch::process_due_draft(&pool, &dispatcher, &cfg, utc(2030, 1, 2, 10, 5))
        .await
        .unwrap();

    let draft = db::get_draft(&pool, draft_id).await.unwrap();
    assert_eq!(draft.status, DraftStatus::Failed);
    assert_eq!(draft.publish_attempts, 1);
    assert!(draft
        .publish_error
        .as_deref()
        .unwrap()
        .contains("account suspended"));
    // not queued again: the failure is surfaced, not retried forever
    assert!(db::queue_entry_for_draft(&pool, draft_id)
        .await
        .unwrap()
        .is_none());
}
