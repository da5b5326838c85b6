//! Publication boundary and the dispatch worker.
//!
//! The engine never talks to a social platform directly; it hands a
//! due draft to a [`Dispatcher`] and folds the outcome back into the state
//! machine. Failures under the retry budget re-queue the draft at urgent
//! priority; past the budget the draft lands in the terminal `failed`
//! state with the error preserved — it is never silently dropped.

use crate::config::Config;
use crate::db::{self, DraftForPublish, Pool};
use crate::error::Result;
use crate::model::Priority;
use crate::scheduler;
use anyhow::Result as DispatchResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

/// External publication collaborator. Implementations own transport,
/// authentication, and media resolution; the engine only sees the outcome.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Publish the draft, returning the external post id of the first
    /// (or only) published post.
    async fn publish(&self, draft: &DraftForPublish) -> DispatchResult<String>;
}

/// Stand-in dispatcher for local runs: logs the draft and fabricates an
/// external id.
#[derive(Debug, Clone, Default)]
pub struct NoopDispatcher;

#[async_trait]
impl Dispatcher for NoopDispatcher {
    async fn publish(&self, draft: &DraftForPublish) -> DispatchResult<String> {
        info!(
            draft_id = draft.draft_id,
            posts = draft.posts.len(),
            "noop dispatch"
        );
        Ok(format!("noop-{}", draft.draft_id))
    }
}

/// Publish the earliest scheduled draft whose slot time has passed.
/// Returns `Ok(true)` when a draft was processed, `Ok(false)` when nothing
/// was due, so the daemon can sleep-poll.
#[instrument(skip_all)]
pub async fn process_due_draft(
    pool: &Pool,
    dispatcher: &dyn Dispatcher,
    cfg: &Config,
    now: DateTime<Utc>,
) -> Result<bool> {
    let Some(due) = db::next_due_publication(pool, now).await? else {
        return Ok(false);
    };

    let payload = db::draft_for_publish(pool, due.draft_id).await?;
    match dispatcher.publish(&payload).await {
        Ok(external_post_id) => {
            let draft = db::get_draft(pool, due.draft_id).await?;
            let mut tx = pool.begin().await?;
            db::mark_published_tx(&mut tx, due.draft_id, draft.version, &external_post_id, now)
                .await?;
            tx.commit().await?;
            info!(
                draft_id = due.draft_id,
                external_post_id = %external_post_id,
                "draft published"
            );
        }
        Err(err) => {
            let draft = db::get_draft(pool, due.draft_id).await?;
            let error_text = format!("{err:#}");
            let attempts_after = draft.publish_attempts + 1;
            let mut tx = pool.begin().await?;
            if attempts_after < cfg.app.max_publish_attempts as i64 {
                // Re-queue at urgent priority; the spent slot stays consumed.
                db::mark_requeued_tx(&mut tx, due.draft_id, draft.version, &error_text, now)
                    .await?;
                db::enqueue_tx(&mut tx, &due.team_id, due.draft_id, Priority::Urgent, now)
                    .await?;
                scheduler::promote_head_tx(&mut tx, &due.team_id, now, cfg).await?;
                scheduler::refresh_queue_estimates_tx(&mut tx, &due.team_id, now, cfg).await?;
                warn!(
                    draft_id = due.draft_id,
                    attempt = attempts_after,
                    error = %error_text,
                    "dispatch failed; draft re-queued urgent"
                );
            } else {
                db::mark_failed_tx(&mut tx, due.draft_id, draft.version, &error_text, now).await?;
                warn!(
                    draft_id = due.draft_id,
                    attempts = attempts_after,
                    error = %error_text,
                    "dispatch failed; retry budget exhausted"
                );
            }
            tx.commit().await?;
        }
    }
    Ok(true)
}
