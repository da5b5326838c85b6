use super::model::{DraftForPublish, DuePublication, PublishPost};
use crate::error::{EngineError, Result};
use crate::model::{
    ApprovalRecord, Comment, Draft, DraftKind, DraftStatus, Frequency, Identity, NewPost, Post,
    Priority, QueueSlot, RecurrencePattern, SharedDraft, ShareState, TimeSlot,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Executor, Row, Sqlite, SqlitePool, Transaction};
use tracing::instrument;

pub type Pool = SqlitePool;

const DRAFT_COLUMNS: &str = "id, team_id, author_id, kind, status, content_hash, version, \
     rejection_reason, reviewed_by, slot_id, publish_attempts, publish_error, \
     external_post_id, created_at, updated_at";

const SLOT_COLUMNS: &str =
    "id, team_id, start_time, end_time, is_available, is_recurring, template_id, \
     frequency, interval, end_date";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // WAL plus a bounded busy wait so writers never block indefinitely.
    sqlx::query("PRAGMA journal_mode=WAL;").execute(&pool).await?;
    sqlx::query("PRAGMA synchronous=FULL;").execute(&pool).await?;
    sqlx::query("PRAGMA busy_timeout=5000;").execute(&pool).await?;
    sqlx::query("PRAGMA foreign_keys=ON;").execute(&pool).await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the
/// parent directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = url["sqlite:".len()..].trim_start_matches("//");
    let (path_part, query_part) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match path_part.strip_prefix("~/") {
        Some(tail) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), tail),
            Err(_) => path_part.to_string(),
        },
        None => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{expanded_path}");
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| EngineError::Database(sqlx::Error::Migrate(Box::new(e))))?;
    Ok(())
}

/// Retry `op` on SQLite lock contention with capped exponential backoff.
/// Exhausting the attempts surfaces as a transient [`EngineError::Conflict`]
/// for `draft_id`, which the caller may retry; it never deadlocks.
pub async fn with_busy_retry<T, F, Fut>(draft_id: i64, max_attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Err(err) if err.is_busy() => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(EngineError::Conflict { draft_id });
                }
                let ms = 10u64 << attempt.min(6);
                tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
            }
            other => return other,
        }
    }
}

fn decode_err(msg: String) -> EngineError {
    EngineError::Database(sqlx::Error::Decode(msg.into()))
}

fn media_ids_from_json(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

fn media_ids_to_json(ids: &[String]) -> String {
    serde_json::to_string(ids).expect("media id list serialization")
}

fn draft_from_row(row: &SqliteRow) -> Result<Draft> {
    let status_str: String = row.get("status");
    let status = DraftStatus::parse_state(&status_str)
        .ok_or_else(|| decode_err(format!("unknown draft status '{status_str}'")))?;
    let kind_str: String = row.get("kind");
    let kind = DraftKind::parse_kind(&kind_str)
        .ok_or_else(|| decode_err(format!("unknown draft kind '{kind_str}'")))?;
    Ok(Draft {
        id: row.get("id"),
        team_id: row.get("team_id"),
        author_id: row.get("author_id"),
        kind,
        status,
        content_hash: row.get("content_hash"),
        version: row.get("version"),
        rejection_reason: row.get("rejection_reason"),
        reviewed_by: row.get("reviewed_by"),
        slot_id: row.get("slot_id"),
        publish_attempts: row.get("publish_attempts"),
        publish_error: row.get("publish_error"),
        external_post_id: row.get("external_post_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn post_from_row(row: &SqliteRow) -> Post {
    let raw: String = row.get("media_ids");
    Post {
        id: row.get("id"),
        draft_id: row.get("draft_id"),
        position: row.get("position"),
        content: row.get("content"),
        media_ids: media_ids_from_json(&raw),
        content_hash: row.get("content_hash"),
    }
}

fn slot_from_row(row: &SqliteRow) -> Result<TimeSlot> {
    let is_recurring: bool = row.get("is_recurring");
    let recurrence = if is_recurring {
        let freq_str: String = row.get("frequency");
        let frequency = Frequency::parse_frequency(&freq_str)
            .ok_or_else(|| decode_err(format!("unknown recurrence frequency '{freq_str}'")))?;
        let interval: i64 = row.get("interval");
        Some(RecurrencePattern {
            frequency,
            interval: interval.max(1) as u32,
            end_date: row.get("end_date"),
        })
    } else {
        None
    };
    Ok(TimeSlot {
        id: row.get("id"),
        team_id: row.get("team_id"),
        start_time: row.get("start_time"),
        end_time: row.get("end_time"),
        is_available: row.get("is_available"),
        template_id: row.get("template_id"),
        recurrence,
    })
}

fn queue_from_row(row: &SqliteRow) -> Result<QueueSlot> {
    let priority_str: String = row.get("priority");
    let priority = Priority::parse_priority(&priority_str)
        .ok_or_else(|| decode_err(format!("unknown queue priority '{priority_str}'")))?;
    Ok(QueueSlot {
        id: row.get("id"),
        team_id: row.get("team_id"),
        draft_id: row.get("draft_id"),
        position: row.get("position"),
        priority,
        estimated_time: row.get("estimated_time"),
        enqueued_at: row.get("enqueued_at"),
    })
}

fn share_from_row(row: &SqliteRow) -> Result<SharedDraft> {
    let state_str: String = row.get("share_state");
    let share_state = ShareState::parse_state(&state_str)
        .ok_or_else(|| decode_err(format!("unknown share state '{state_str}'")))?;
    Ok(SharedDraft {
        token: row.get("token"),
        draft_id: row.get("draft_id"),
        can_comment: row.get("can_comment"),
        created_by: row.get("created_by"),
        share_state,
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
    })
}

fn comment_from_row(row: &SqliteRow) -> Comment {
    Comment {
        id: row.get("id"),
        token: row.get("token"),
        content: row.get("content"),
        author_id: row.get("author_id"),
        author_name: row.get("author_name"),
        created_at: row.get("created_at"),
        resolved: row.get("resolved"),
        resolved_at: row.get("resolved_at"),
        resolved_by: row.get("resolved_by"),
    }
}

// ---------------------------------------------------------------------------
// Drafts and posts
// ---------------------------------------------------------------------------

pub async fn draft_by_id<'e, E>(executor: E, draft_id: i64) -> Result<Option<Draft>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(&format!("SELECT {DRAFT_COLUMNS} FROM drafts WHERE id = ?"))
        .bind(draft_id)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(draft_from_row).transpose()
}

pub async fn get_draft(pool: &Pool, draft_id: i64) -> Result<Draft> {
    draft_by_id(pool, draft_id)
        .await?
        .ok_or(EngineError::NotFound("draft", draft_id))
}

pub async fn posts_for_draft<'e, E>(executor: E, draft_id: i64) -> Result<Vec<Post>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        "SELECT id, draft_id, position, content, media_ids, content_hash \
         FROM posts WHERE draft_id = ? ORDER BY position ASC",
    )
    .bind(draft_id)
    .fetch_all(executor)
    .await?;
    Ok(rows.iter().map(post_from_row).collect())
}

#[instrument(skip_all)]
pub async fn create_draft(
    pool: &Pool,
    identity: &Identity,
    kind: DraftKind,
    posts: &[NewPost],
) -> Result<Draft> {
    if posts.is_empty() {
        return Err(EngineError::Validation(
            "a draft requires at least one post".into(),
        ));
    }
    if kind == DraftKind::Tweet && posts.len() != 1 {
        return Err(EngineError::Validation(
            "a tweet draft holds exactly one post".into(),
        ));
    }

    let now = Utc::now();
    let mut tx = pool.begin().await?;
    let draft_id: i64 = sqlx::query(
        "INSERT INTO drafts (team_id, author_id, kind, status, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(&identity.team_id)
    .bind(&identity.user_id)
    .bind(kind.as_str())
    .bind(DraftStatus::Draft.as_str())
    .bind(now)
    .bind(now)
    .fetch_one(&mut *tx)
    .await?
    .get("id");

    insert_posts_tx(&mut tx, draft_id, posts).await?;
    tx.commit().await?;

    get_draft(pool, draft_id).await
}

async fn insert_posts_tx(
    tx: &mut Transaction<'_, Sqlite>,
    draft_id: i64,
    posts: &[NewPost],
) -> Result<()> {
    for (position, post) in posts.iter().enumerate() {
        sqlx::query(
            "INSERT INTO posts (draft_id, position, content, media_ids) VALUES (?, ?, ?, ?)",
        )
        .bind(draft_id)
        .bind(position as i64)
        .bind(&post.content)
        .bind(media_ids_to_json(&post.media_ids))
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Replace a draft's posts. Only the author may do this, and only while the
/// draft has not yet been submitted.
#[instrument(skip_all)]
pub async fn replace_draft_posts(
    pool: &Pool,
    identity: &Identity,
    draft_id: i64,
    posts: &[NewPost],
) -> Result<Draft> {
    if posts.is_empty() {
        return Err(EngineError::Validation(
            "a draft requires at least one post".into(),
        ));
    }

    let mut tx = pool.begin().await?;
    let draft = draft_by_id(&mut *tx, draft_id)
        .await?
        .ok_or(EngineError::NotFound("draft", draft_id))?;
    if draft.team_id != identity.team_id || draft.author_id != identity.user_id {
        return Err(EngineError::Forbidden("the draft author"));
    }
    if draft.status != DraftStatus::Draft {
        return Err(EngineError::Validation(format!(
            "draft {draft_id} is read-only in state '{}'",
            draft.status
        )));
    }
    if draft.kind == DraftKind::Tweet && posts.len() != 1 {
        return Err(EngineError::Validation(
            "a tweet draft holds exactly one post".into(),
        ));
    }

    let result = sqlx::query(
        "UPDATE drafts SET version = version + 1, updated_at = ? \
         WHERE id = ? AND version = ? AND status = 'draft'",
    )
    .bind(Utc::now())
    .bind(draft_id)
    .bind(draft.version)
    .execute(&mut *tx)
    .await?;
    if result.rows_affected() == 0 {
        return Err(EngineError::Conflict { draft_id });
    }

    sqlx::query("DELETE FROM posts WHERE draft_id = ?")
        .bind(draft_id)
        .execute(&mut *tx)
        .await?;
    insert_posts_tx(&mut tx, draft_id, posts).await?;
    tx.commit().await?;

    get_draft(pool, draft_id).await
}

pub async fn set_post_hash_tx(
    tx: &mut Transaction<'_, Sqlite>,
    post_id: i64,
    hash: &str,
) -> Result<()> {
    sqlx::query("UPDATE posts SET content_hash = ? WHERE id = ?")
        .bind(hash)
        .bind(post_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Another non-terminal draft in the team already holding `hash`, if any.
pub async fn fingerprint_owner_tx(
    tx: &mut Transaction<'_, Sqlite>,
    team_id: &str,
    hash: &str,
    exclude_draft_id: i64,
) -> Result<Option<i64>> {
    let id = sqlx::query_scalar::<_, i64>(
        "SELECT id FROM drafts \
         WHERE team_id = ? AND content_hash = ? AND id != ? \
           AND status IN ('pending_approval', 'approved', 'scheduled') \
         ORDER BY id ASC LIMIT 1",
    )
    .bind(team_id)
    .bind(hash)
    .bind(exclude_draft_id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(id)
}

/// Compare-and-swap guard shared by every transition writer: the update only
/// lands when `(id, version, status)` still matched what the caller read.
fn cas_guard(result: &sqlx::sqlite::SqliteQueryResult, draft_id: i64) -> Result<()> {
    if result.rows_affected() == 0 {
        return Err(EngineError::Conflict { draft_id });
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_pending_tx(
    tx: &mut Transaction<'_, Sqlite>,
    draft_id: i64,
    version: i64,
    content_hash: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE drafts SET status = 'pending_approval', content_hash = ?, \
         version = version + 1, updated_at = ? \
         WHERE id = ? AND version = ? AND status = 'draft'",
    )
    .bind(content_hash)
    .bind(now)
    .bind(draft_id)
    .bind(version)
    .execute(&mut **tx)
    .await?;
    cas_guard(&result, draft_id)
}

#[instrument(skip_all)]
pub async fn mark_reviewed_tx(
    tx: &mut Transaction<'_, Sqlite>,
    draft_id: i64,
    version: i64,
    approved: bool,
    reviewer: &str,
    reason: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    let to = if approved { "approved" } else { "rejected" };
    let result = sqlx::query(
        "UPDATE drafts SET status = ?, reviewed_by = ?, rejection_reason = ?, \
         version = version + 1, updated_at = ? \
         WHERE id = ? AND version = ? AND status = 'pending_approval'",
    )
    .bind(to)
    .bind(reviewer)
    .bind(reason)
    .bind(now)
    .bind(draft_id)
    .bind(version)
    .execute(&mut **tx)
    .await?;
    cas_guard(&result, draft_id)
}

#[instrument(skip_all)]
pub async fn mark_scheduled_tx(
    tx: &mut Transaction<'_, Sqlite>,
    draft_id: i64,
    version: i64,
    slot_id: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE drafts SET status = 'scheduled', slot_id = ?, \
         version = version + 1, updated_at = ? \
         WHERE id = ? AND version = ? AND status = 'approved'",
    )
    .bind(slot_id)
    .bind(now)
    .bind(draft_id)
    .bind(version)
    .execute(&mut **tx)
    .await?;
    cas_guard(&result, draft_id)
}

#[instrument(skip_all)]
pub async fn mark_published_tx(
    tx: &mut Transaction<'_, Sqlite>,
    draft_id: i64,
    version: i64,
    external_post_id: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE drafts SET status = 'published', external_post_id = ?, publish_error = NULL, \
         version = version + 1, updated_at = ? \
         WHERE id = ? AND version = ? AND status = 'scheduled'",
    )
    .bind(external_post_id)
    .bind(now)
    .bind(draft_id)
    .bind(version)
    .execute(&mut **tx)
    .await?;
    cas_guard(&result, draft_id)
}

#[instrument(skip_all)]
pub async fn mark_cancelled_tx(
    tx: &mut Transaction<'_, Sqlite>,
    draft_id: i64,
    version: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE drafts SET status = 'cancelled', slot_id = NULL, \
         version = version + 1, updated_at = ? \
         WHERE id = ? AND version = ? AND status = 'scheduled'",
    )
    .bind(now)
    .bind(draft_id)
    .bind(version)
    .execute(&mut **tx)
    .await?;
    cas_guard(&result, draft_id)
}

/// Dispatch failure under the retry budget: back to `approved` for urgent
/// re-queueing, recording the failure.
#[instrument(skip_all)]
pub async fn mark_requeued_tx(
    tx: &mut Transaction<'_, Sqlite>,
    draft_id: i64,
    version: i64,
    error: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE drafts SET status = 'approved', slot_id = NULL, \
         publish_attempts = publish_attempts + 1, publish_error = ?, \
         version = version + 1, updated_at = ? \
         WHERE id = ? AND version = ? AND status = 'scheduled'",
    )
    .bind(error)
    .bind(now)
    .bind(draft_id)
    .bind(version)
    .execute(&mut **tx)
    .await?;
    cas_guard(&result, draft_id)
}

/// Dispatch failure with the retry budget exhausted: terminal `failed`,
/// surfaced to the author for manual resubmission.
#[instrument(skip_all)]
pub async fn mark_failed_tx(
    tx: &mut Transaction<'_, Sqlite>,
    draft_id: i64,
    version: i64,
    error: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE drafts SET status = 'failed', slot_id = NULL, \
         publish_attempts = publish_attempts + 1, publish_error = ?, \
         version = version + 1, updated_at = ? \
         WHERE id = ? AND version = ? AND status = 'scheduled'",
    )
    .bind(error)
    .bind(now)
    .bind(draft_id)
    .bind(version)
    .execute(&mut **tx)
    .await?;
    cas_guard(&result, draft_id)
}

// ---------------------------------------------------------------------------
// Time slots
// ---------------------------------------------------------------------------

pub async fn slot_by_id<'e, E>(executor: E, slot_id: i64) -> Result<Option<TimeSlot>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(&format!("SELECT {SLOT_COLUMNS} FROM time_slots WHERE id = ?"))
        .bind(slot_id)
        .fetch_optional(executor)
        .await?;
    row.as_ref().map(slot_from_row).transpose()
}

pub async fn get_slot(pool: &Pool, slot_id: i64) -> Result<TimeSlot> {
    slot_by_id(pool, slot_id)
        .await?
        .ok_or(EngineError::NotFound("time slot", slot_id))
}

#[instrument(skip_all)]
pub async fn create_slot(
    pool: &Pool,
    team_id: &str,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
) -> Result<TimeSlot> {
    if start_time >= end_time {
        return Err(EngineError::Validation(
            "slot start must precede slot end".into(),
        ));
    }
    let id: i64 = sqlx::query(
        "INSERT INTO time_slots (team_id, start_time, end_time, is_available, is_recurring) \
         VALUES (?, ?, ?, 1, 0) RETURNING id",
    )
    .bind(team_id)
    .bind(start_time)
    .bind(end_time)
    .fetch_one(pool)
    .await?
    .get("id");
    get_slot(pool, id).await
}

#[instrument(skip_all)]
pub async fn create_template(
    pool: &Pool,
    team_id: &str,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    pattern: &RecurrencePattern,
) -> Result<TimeSlot> {
    if start_time >= end_time {
        return Err(EngineError::Validation(
            "slot start must precede slot end".into(),
        ));
    }
    if pattern.interval == 0 {
        return Err(EngineError::Validation(
            "recurrence interval must be >= 1".into(),
        ));
    }
    let id: i64 = sqlx::query(
        "INSERT INTO time_slots \
         (team_id, start_time, end_time, is_available, is_recurring, frequency, interval, end_date) \
         VALUES (?, ?, ?, 0, 1, ?, ?, ?) RETURNING id",
    )
    .bind(team_id)
    .bind(start_time)
    .bind(end_time)
    .bind(pattern.frequency.as_str())
    .bind(pattern.interval as i64)
    .bind(pattern.end_date)
    .fetch_one(pool)
    .await?
    .get("id");
    get_slot(pool, id).await
}

pub async fn templates_for_team_tx(
    tx: &mut Transaction<'_, Sqlite>,
    team_id: &str,
) -> Result<Vec<TimeSlot>> {
    let rows = sqlx::query(&format!(
        "SELECT {SLOT_COLUMNS} FROM time_slots WHERE team_id = ? AND is_recurring = 1 \
         ORDER BY datetime(start_time) ASC"
    ))
    .bind(team_id)
    .fetch_all(&mut **tx)
    .await?;
    rows.iter().map(slot_from_row).collect()
}

/// Materialize one occurrence of a template. Duplicate starts are ignored,
/// so re-expansion over an overlapping range is harmless.
pub async fn insert_occurrence_tx(
    tx: &mut Transaction<'_, Sqlite>,
    team_id: &str,
    template_id: i64,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO time_slots \
         (team_id, start_time, end_time, is_available, is_recurring, template_id) \
         VALUES (?, ?, ?, 1, 0, ?)",
    )
    .bind(team_id)
    .bind(start_time)
    .bind(end_time)
    .bind(template_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Earliest concrete available slot whose start falls inside the window,
/// optionally restricted to the team's working hours.
pub async fn earliest_available_tx(
    tx: &mut Transaction<'_, Sqlite>,
    team_id: &str,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    working_hours: Option<(u32, u32)>,
) -> Result<Option<TimeSlot>> {
    let mut sql = format!(
        "SELECT {SLOT_COLUMNS} FROM time_slots \
         WHERE team_id = ? AND is_recurring = 0 AND is_available = 1 \
           AND datetime(start_time) >= datetime(?) AND datetime(start_time) < datetime(?)"
    );
    if working_hours.is_some() {
        sql.push_str(
            " AND CAST(strftime('%H', start_time) AS INTEGER) >= ? \
              AND CAST(strftime('%H', start_time) AS INTEGER) < ?",
        );
    }
    sql.push_str(" ORDER BY datetime(start_time) ASC, id ASC LIMIT 1");

    let mut query = sqlx::query(&sql)
        .bind(team_id)
        .bind(window_start)
        .bind(window_end);
    if let Some((start_hour, end_hour)) = working_hours {
        query = query.bind(start_hour as i64).bind(end_hour as i64);
    }
    let row = query.fetch_optional(&mut **tx).await?;
    row.as_ref().map(slot_from_row).transpose()
}

/// Claim a concrete slot for `draft_id`. Fails with a conflict when the slot
/// was taken meanwhile or claiming it would overlap another reserved slot of
/// the team, keeping reserved intervals disjoint.
#[instrument(skip_all)]
pub async fn claim_slot_tx(
    tx: &mut Transaction<'_, Sqlite>,
    slot_id: i64,
    draft_id: i64,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE time_slots SET is_available = 0 \
         WHERE id = ? AND is_recurring = 0 AND is_available = 1 \
           AND NOT EXISTS ( \
             SELECT 1 FROM time_slots o \
             WHERE o.team_id = time_slots.team_id AND o.id != time_slots.id \
               AND o.is_recurring = 0 AND o.is_available = 0 \
               AND datetime(o.start_time) < datetime(time_slots.end_time) \
               AND datetime(o.end_time) > datetime(time_slots.start_time))",
    )
    .bind(slot_id)
    .execute(&mut **tx)
    .await?;
    if result.rows_affected() == 0 {
        return Err(EngineError::Conflict { draft_id });
    }
    Ok(())
}

#[instrument(skip_all)]
pub async fn free_slot_tx(tx: &mut Transaction<'_, Sqlite>, slot_id: i64) -> Result<()> {
    sqlx::query("UPDATE time_slots SET is_available = 1 WHERE id = ? AND is_recurring = 0")
        .bind(slot_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Concrete slots (any availability) starting inside the window. Used for
/// the capacity check: zero means the horizon is exhausted.
pub async fn count_concrete_slots_tx(
    tx: &mut Transaction<'_, Sqlite>,
    team_id: &str,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM time_slots \
         WHERE team_id = ? AND is_recurring = 0 \
           AND datetime(start_time) >= datetime(?) AND datetime(start_time) < datetime(?)",
    )
    .bind(team_id)
    .bind(window_start)
    .bind(window_end)
    .fetch_one(&mut **tx)
    .await?;
    Ok(count)
}

/// All concrete slot starts for the team from `from` on, with availability.
/// Feeds the queue `estimated_time` projection.
pub async fn concrete_slot_starts_tx(
    tx: &mut Transaction<'_, Sqlite>,
    team_id: &str,
    from: DateTime<Utc>,
) -> Result<Vec<(DateTime<Utc>, bool)>> {
    let rows = sqlx::query(
        "SELECT start_time, is_available FROM time_slots \
         WHERE team_id = ? AND is_recurring = 0 AND datetime(start_time) >= datetime(?) \
         ORDER BY datetime(start_time) ASC",
    )
    .bind(team_id)
    .bind(from)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows
        .iter()
        .map(|row| (row.get("start_time"), row.get("is_available")))
        .collect())
}

/// Reserved concrete slots of a team, earliest first. Test and audit helper.
pub async fn reserved_slots(pool: &Pool, team_id: &str) -> Result<Vec<TimeSlot>> {
    let rows = sqlx::query(&format!(
        "SELECT {SLOT_COLUMNS} FROM time_slots \
         WHERE team_id = ? AND is_recurring = 0 AND is_available = 0 \
         ORDER BY datetime(start_time) ASC"
    ))
    .bind(team_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(slot_from_row).collect()
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

const QUEUE_ORDER: &str = "CASE priority WHEN 'urgent' THEN 0 WHEN 'high' THEN 1 ELSE 2 END, \
     datetime(enqueued_at) ASC, id ASC";

/// Add a draft to the team queue. Re-enqueueing an already-waiting draft is
/// a no-op that returns the existing entry.
#[instrument(skip_all)]
pub async fn enqueue_tx(
    tx: &mut Transaction<'_, Sqlite>,
    team_id: &str,
    draft_id: i64,
    priority: Priority,
    now: DateTime<Utc>,
) -> Result<i64> {
    let existing: Option<i64> =
        sqlx::query_scalar("SELECT id FROM queue_slots WHERE draft_id = ?")
            .bind(draft_id)
            .fetch_optional(&mut **tx)
            .await?;
    if let Some(id) = existing {
        return Ok(id);
    }
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_slots WHERE team_id = ?")
        .bind(team_id)
        .fetch_one(&mut **tx)
        .await?;
    let id: i64 = sqlx::query(
        "INSERT INTO queue_slots (team_id, draft_id, position, priority, enqueued_at) \
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(team_id)
    .bind(draft_id)
    .bind(count)
    .bind(priority.as_str())
    .bind(now)
    .fetch_one(&mut **tx)
    .await?
    .get("id");
    renumber_queue_tx(tx, team_id).await?;
    Ok(id)
}

pub async fn dequeue_draft_tx(tx: &mut Transaction<'_, Sqlite>, draft_id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM queue_slots WHERE draft_id = ?")
        .bind(draft_id)
        .execute(&mut **tx)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Reassign positions 0..n-1 in priority order (urgent, high, normal; FIFO
/// inside a class), keeping the per-team ordering gap-free.
pub async fn renumber_queue_tx(tx: &mut Transaction<'_, Sqlite>, team_id: &str) -> Result<()> {
    let ids: Vec<i64> = sqlx::query_scalar(&format!(
        "SELECT id FROM queue_slots WHERE team_id = ? ORDER BY {QUEUE_ORDER}"
    ))
    .bind(team_id)
    .fetch_all(&mut **tx)
    .await?;
    for (position, id) in ids.into_iter().enumerate() {
        sqlx::query("UPDATE queue_slots SET position = ? WHERE id = ?")
            .bind(position as i64)
            .bind(id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

pub async fn queue_head_tx(
    tx: &mut Transaction<'_, Sqlite>,
    team_id: &str,
) -> Result<Option<QueueSlot>> {
    let row = sqlx::query(&format!(
        "SELECT id, team_id, draft_id, position, priority, estimated_time, enqueued_at \
         FROM queue_slots WHERE team_id = ? ORDER BY {QUEUE_ORDER} LIMIT 1"
    ))
    .bind(team_id)
    .fetch_optional(&mut **tx)
    .await?;
    row.as_ref().map(queue_from_row).transpose()
}

pub async fn queue_entries_tx(
    tx: &mut Transaction<'_, Sqlite>,
    team_id: &str,
) -> Result<Vec<QueueSlot>> {
    let rows = sqlx::query(
        "SELECT id, team_id, draft_id, position, priority, estimated_time, enqueued_at \
         FROM queue_slots WHERE team_id = ? ORDER BY position ASC",
    )
    .bind(team_id)
    .fetch_all(&mut **tx)
    .await?;
    rows.iter().map(queue_from_row).collect()
}

pub async fn list_queue(pool: &Pool, team_id: &str) -> Result<Vec<QueueSlot>> {
    let rows = sqlx::query(
        "SELECT id, team_id, draft_id, position, priority, estimated_time, enqueued_at \
         FROM queue_slots WHERE team_id = ? ORDER BY position ASC",
    )
    .bind(team_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(queue_from_row).collect()
}

pub async fn queue_entry_for_draft(pool: &Pool, draft_id: i64) -> Result<Option<QueueSlot>> {
    let row = sqlx::query(
        "SELECT id, team_id, draft_id, position, priority, estimated_time, enqueued_at \
         FROM queue_slots WHERE draft_id = ?",
    )
    .bind(draft_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(queue_from_row).transpose()
}

pub async fn set_estimated_time_tx(
    tx: &mut Transaction<'_, Sqlite>,
    queue_id: i64,
    estimated_time: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query("UPDATE queue_slots SET estimated_time = ? WHERE id = ?")
        .bind(estimated_time)
        .bind(queue_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Shares and comments
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn insert_share_tx(
    tx: &mut Transaction<'_, Sqlite>,
    token: &str,
    draft_id: i64,
    can_comment: bool,
    created_by: &str,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO shared_drafts \
         (token, draft_id, can_comment, created_by, share_state, created_at, expires_at) \
         VALUES (?, ?, ?, ?, 'active', ?, ?)",
    )
    .bind(token)
    .bind(draft_id)
    .bind(can_comment)
    .bind(created_by)
    .bind(now)
    .bind(expires_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn share_by_token<'e, E>(executor: E, token: &str) -> Result<Option<SharedDraft>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query(
        "SELECT token, draft_id, can_comment, created_by, share_state, created_at, expires_at \
         FROM shared_drafts WHERE token = ?",
    )
    .bind(token)
    .fetch_optional(executor)
    .await?;
    row.as_ref().map(share_from_row).transpose()
}

/// Active, unexpired share for a draft, if one exists. Submission reuses it
/// instead of minting a second review link.
pub async fn active_share_for_draft_tx(
    tx: &mut Transaction<'_, Sqlite>,
    draft_id: i64,
    now: DateTime<Utc>,
) -> Result<Option<SharedDraft>> {
    let row = sqlx::query(
        "SELECT token, draft_id, can_comment, created_by, share_state, created_at, expires_at \
         FROM shared_drafts \
         WHERE draft_id = ? AND share_state = 'active' AND datetime(expires_at) > datetime(?) \
         ORDER BY datetime(created_at) DESC LIMIT 1",
    )
    .bind(draft_id)
    .bind(now)
    .fetch_optional(&mut **tx)
    .await?;
    row.as_ref().map(share_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn revoke_share(pool: &Pool, token: &str) -> Result<bool> {
    let result =
        sqlx::query("UPDATE shared_drafts SET share_state = 'revoked' WHERE token = ?")
            .bind(token)
            .execute(pool)
            .await?;
    Ok(result.rows_affected() > 0)
}

/// Delete revoked and expired shares; their comments go with them.
#[instrument(skip_all)]
pub async fn purge_expired_shares(pool: &Pool, now: DateTime<Utc>) -> Result<u64> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "DELETE FROM shared_draft_comments WHERE token IN ( \
         SELECT token FROM shared_drafts \
         WHERE share_state = 'revoked' OR datetime(expires_at) <= datetime(?))",
    )
    .bind(now)
    .execute(&mut *tx)
    .await?;
    let result = sqlx::query(
        "DELETE FROM shared_drafts \
         WHERE share_state = 'revoked' OR datetime(expires_at) <= datetime(?)",
    )
    .bind(now)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(result.rows_affected())
}

#[instrument(skip_all)]
pub async fn insert_comment(
    pool: &Pool,
    token: &str,
    content: &str,
    author_id: Option<&str>,
    author_name: &str,
    now: DateTime<Utc>,
) -> Result<Comment> {
    let id: i64 = sqlx::query(
        "INSERT INTO shared_draft_comments (token, content, author_id, author_name, created_at) \
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(token)
    .bind(content)
    .bind(author_id)
    .bind(author_name)
    .bind(now)
    .fetch_one(pool)
    .await?
    .get("id");
    get_comment(pool, id).await
}

pub async fn get_comment(pool: &Pool, comment_id: i64) -> Result<Comment> {
    let row = sqlx::query(
        "SELECT id, token, content, author_id, author_name, created_at, \
                resolved, resolved_at, resolved_by \
         FROM shared_draft_comments WHERE id = ?",
    )
    .bind(comment_id)
    .fetch_optional(pool)
    .await?;
    row.map(|r| comment_from_row(&r))
        .ok_or(EngineError::NotFound("comment", comment_id))
}

/// Comments in creation order — insertion order is the display order.
pub async fn comments_for_share(pool: &Pool, token: &str) -> Result<Vec<Comment>> {
    let rows = sqlx::query(
        "SELECT id, token, content, author_id, author_name, created_at, \
                resolved, resolved_at, resolved_by \
         FROM shared_draft_comments WHERE token = ? \
         ORDER BY datetime(created_at) ASC, id ASC",
    )
    .bind(token)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(comment_from_row).collect())
}

#[instrument(skip_all)]
pub async fn set_comment_resolved(
    pool: &Pool,
    comment_id: i64,
    resolved: bool,
    resolved_by: Option<&str>,
    now: DateTime<Utc>,
) -> Result<()> {
    let (resolved_at, resolved_by) = if resolved {
        (Some(now), resolved_by)
    } else {
        (None, None)
    };
    sqlx::query(
        "UPDATE shared_draft_comments SET resolved = ?, resolved_at = ?, resolved_by = ? \
         WHERE id = ?",
    )
    .bind(resolved)
    .bind(resolved_at)
    .bind(resolved_by)
    .bind(comment_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn delete_comment_row(pool: &Pool, comment_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM shared_draft_comments WHERE id = ?")
        .bind(comment_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Approval audit records
// ---------------------------------------------------------------------------

pub async fn insert_approval_tx(
    tx: &mut Transaction<'_, Sqlite>,
    draft_id: i64,
    submitted_by: &str,
    now: DateTime<Utc>,
) -> Result<i64> {
    let id: i64 = sqlx::query(
        "INSERT INTO approval_records (draft_id, submitted_by, submitted_at, status) \
         VALUES (?, ?, ?, 'pending') RETURNING id",
    )
    .bind(draft_id)
    .bind(submitted_by)
    .bind(now)
    .fetch_one(&mut **tx)
    .await?
    .get("id");
    Ok(id)
}

/// Settle the latest pending record for the draft.
pub async fn settle_approval_tx(
    tx: &mut Transaction<'_, Sqlite>,
    draft_id: i64,
    approved: bool,
    reviewer: &str,
    reason: Option<&str>,
) -> Result<()> {
    let status = if approved { "approved" } else { "rejected" };
    sqlx::query(
        "UPDATE approval_records SET status = ?, reviewed_by = ?, rejection_reason = ? \
         WHERE id = (SELECT id FROM approval_records \
                     WHERE draft_id = ? AND status = 'pending' \
                     ORDER BY id DESC LIMIT 1)",
    )
    .bind(status)
    .bind(reviewer)
    .bind(reason)
    .bind(draft_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn latest_approval(pool: &Pool, draft_id: i64) -> Result<Option<ApprovalRecord>> {
    let row = sqlx::query(
        "SELECT id, draft_id, submitted_by, submitted_at, status, reviewed_by, rejection_reason \
         FROM approval_records WHERE draft_id = ? ORDER BY id DESC LIMIT 1",
    )
    .bind(draft_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| ApprovalRecord {
        id: r.get("id"),
        draft_id: r.get("draft_id"),
        submitted_by: r.get("submitted_by"),
        submitted_at: r.get("submitted_at"),
        status: r.get("status"),
        reviewed_by: r.get("reviewed_by"),
        rejection_reason: r.get("rejection_reason"),
    }))
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// The earliest scheduled draft whose slot trigger time has passed.
#[instrument(skip_all)]
pub async fn next_due_publication(
    pool: &Pool,
    now: DateTime<Utc>,
) -> Result<Option<DuePublication>> {
    let row = sqlx::query(
        "SELECT d.id AS draft_id, d.team_id, s.id AS slot_id, s.start_time \
         FROM drafts d JOIN time_slots s ON d.slot_id = s.id \
         WHERE d.status = 'scheduled' AND datetime(s.start_time) <= datetime(?) \
         ORDER BY datetime(s.start_time) ASC, d.id ASC LIMIT 1",
    )
    .bind(now)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| DuePublication {
        draft_id: r.get("draft_id"),
        slot_id: r.get("slot_id"),
        team_id: r.get("team_id"),
        slot_start: r.get("start_time"),
    }))
}

pub async fn draft_for_publish(pool: &Pool, draft_id: i64) -> Result<DraftForPublish> {
    let draft = get_draft(pool, draft_id).await?;
    let posts = posts_for_draft(pool, draft_id).await?;
    Ok(DraftForPublish {
        draft_id: draft.id,
        team_id: draft.team_id,
        kind: draft.kind,
        posts: posts
            .into_iter()
            .map(|p| PublishPost {
                content: p.content,
                media_ids: p.media_ids,
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_pool() -> Pool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn author() -> Identity {
        Identity {
            user_id: "u-author".into(),
            team_id: "team-1".into(),
            role: crate::model::TeamRole::Member,
        }
    }

    #[tokio::test]
    async fn create_draft_assigns_positions() {
        let pool = setup_pool().await;
        let posts = vec![
            NewPost {
                content: "first".into(),
                media_ids: vec![],
            },
            NewPost {
                content: "second".into(),
                media_ids: vec!["m1".into()],
            },
        ];
        let draft = create_draft(&pool, &author(), DraftKind::Thread, &posts)
            .await
            .unwrap();
        assert_eq!(draft.status, DraftStatus::Draft);
        assert_eq!(draft.version, 0);

        let stored = posts_for_draft(&pool, draft.id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].position, 0);
        assert_eq!(stored[1].position, 1);
        assert_eq!(stored[1].media_ids, vec!["m1".to_string()]);
    }

    #[tokio::test]
    async fn tweet_draft_requires_exactly_one_post() {
        let pool = setup_pool().await;
        let err = create_draft(&pool, &author(), DraftKind::Tweet, &[])
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let posts = vec![
            NewPost {
                content: "a".into(),
                media_ids: vec![],
            },
            NewPost {
                content: "b".into(),
                media_ids: vec![],
            },
        ];
        let err = create_draft(&pool, &author(), DraftKind::Tweet, &posts)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn stale_version_edit_is_a_conflict() {
        let pool = setup_pool().await;
        let posts = vec![NewPost {
            content: "v1".into(),
            media_ids: vec![],
        }];
        let draft = create_draft(&pool, &author(), DraftKind::Tweet, &posts)
            .await
            .unwrap();

        // Simulate a concurrent writer bumping the version.
        sqlx::query("UPDATE drafts SET version = version + 1 WHERE id = ?")
            .bind(draft.id)
            .execute(&pool)
            .await
            .unwrap();

        let mut tx = pool.begin().await.unwrap();
        let err = mark_pending_tx(&mut tx, draft.id, draft.version, "hash", Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict { .. }));
    }

    #[tokio::test]
    async fn renumber_orders_by_priority_then_fifo() {
        let pool = setup_pool().await;
        let identity = author();
        let mut draft_ids = Vec::new();
        for i in 0..3 {
            let d = create_draft(
                &pool,
                &identity,
                DraftKind::Tweet,
                &[NewPost {
                    content: format!("post {i}"),
                    media_ids: vec![],
                }],
            )
            .await
            .unwrap();
            draft_ids.push(d.id);
        }

        let now = Utc::now();
        let mut tx = pool.begin().await.unwrap();
        enqueue_tx(&mut tx, "team-1", draft_ids[0], Priority::Normal, now)
            .await
            .unwrap();
        enqueue_tx(&mut tx, "team-1", draft_ids[1], Priority::Urgent, now)
            .await
            .unwrap();
        enqueue_tx(&mut tx, "team-1", draft_ids[2], Priority::Normal, now)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let queue = list_queue(&pool, "team-1").await.unwrap();
        let ordered: Vec<(i64, i64)> = queue.iter().map(|q| (q.position, q.draft_id)).collect();
        assert_eq!(
            ordered,
            vec![(0, draft_ids[1]), (1, draft_ids[0]), (2, draft_ids[2])]
        );
    }
}
