//! Draft lifecycle orchestration: submission for review and the reviewer
//! verdict. The duplicate-fingerprint guard runs inside the same
//! transaction as the status flip, so two near-simultaneous submissions of
//! the same content cannot both pass the check.

use crate::config::Config;
use crate::db::{self, Pool};
use crate::error::{EngineError, Result};
use crate::hash;
use crate::model::{Draft, DraftKind, DraftStatus, Identity, ReviewAction};
use chrono::{Duration, Utc};
use tracing::{info, instrument};
use uuid::Uuid;

const BUSY_ATTEMPTS: u32 = 4;

/// Outcome of a successful submission: the pending draft plus the review
/// share token minted (or reused) for it.
#[derive(Debug, Clone)]
pub struct Submission {
    pub draft: Draft,
    pub review_token: String,
}

/// Submit a draft for team review.
///
/// Author-only. Recomputes the content fingerprint from the stored posts,
/// rejects duplicates of any live draft in the team, flips the draft to
/// `pending_approval`, writes the approval audit record, and ensures a
/// commentable review share exists for the reviewers.
#[instrument(skip_all)]
pub async fn submit_draft(
    pool: &Pool,
    cfg: &Config,
    identity: &Identity,
    draft_id: i64,
) -> Result<Submission> {
    db::with_busy_retry(draft_id, BUSY_ATTEMPTS, || {
        submit_draft_once(pool, cfg, identity, draft_id)
    })
    .await
}

async fn submit_draft_once(
    pool: &Pool,
    cfg: &Config,
    identity: &Identity,
    draft_id: i64,
) -> Result<Submission> {
    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let draft = db::draft_by_id(&mut *tx, draft_id)
        .await?
        .ok_or(EngineError::NotFound("draft", draft_id))?;
    if draft.team_id != identity.team_id || draft.author_id != identity.user_id {
        return Err(EngineError::Forbidden("the draft author"));
    }
    if !draft.status.can_transition(DraftStatus::PendingApproval) {
        return Err(EngineError::InvalidTransition {
            from: draft.status,
            to: DraftStatus::PendingApproval,
        });
    }

    let posts = db::posts_for_draft(&mut *tx, draft_id).await?;
    if posts.is_empty() {
        return Err(EngineError::Validation(
            "cannot submit a draft with no posts".into(),
        ));
    }

    let mut member_digests = Vec::with_capacity(posts.len());
    for post in &posts {
        let digest = hash::post_fingerprint(&post.content, &post.media_ids);
        db::set_post_hash_tx(&mut tx, post.id, &digest).await?;
        member_digests.push((Some(post.position), digest));
    }
    let content_hash = match draft.kind {
        DraftKind::Tweet => member_digests[0].1.clone(),
        DraftKind::Thread => hash::thread_fingerprint(&member_digests).ok_or_else(|| {
            EngineError::Validation("cannot submit a draft with no posts".into())
        })?,
    };

    if let Some(other) =
        db::fingerprint_owner_tx(&mut tx, &identity.team_id, &content_hash, draft_id).await?
    {
        return Err(EngineError::DuplicateContent {
            other_draft_id: other,
        });
    }

    db::mark_pending_tx(&mut tx, draft_id, draft.version, &content_hash, now).await?;
    db::insert_approval_tx(&mut tx, draft_id, &identity.user_id, now).await?;

    // Reviewers get a commentable share link; reuse a live one if present.
    let review_token = match db::active_share_for_draft_tx(&mut tx, draft_id, now).await? {
        Some(share) => share.token,
        None => {
            let token = Uuid::new_v4().simple().to_string();
            let ttl = Duration::days(cfg.sharing.default_ttl_days as i64);
            db::insert_share_tx(
                &mut tx,
                &token,
                draft_id,
                true,
                &identity.user_id,
                now,
                now + ttl,
            )
            .await?;
            token
        }
    };

    tx.commit().await?;
    info!(draft_id, "draft submitted for approval");

    Ok(Submission {
        draft: db::get_draft(pool, draft_id).await?,
        review_token,
    })
}

/// Approve or reject a pending draft. Reviewer must hold the team `admin`
/// role. Settling an already-settled draft fails with an invalid-transition
/// error rather than silently succeeding.
#[instrument(skip_all)]
pub async fn review_draft(
    pool: &Pool,
    identity: &Identity,
    draft_id: i64,
    action: ReviewAction,
) -> Result<Draft> {
    db::with_busy_retry(draft_id, BUSY_ATTEMPTS, || {
        review_draft_once(pool, identity, draft_id, action.clone())
    })
    .await
}

async fn review_draft_once(
    pool: &Pool,
    identity: &Identity,
    draft_id: i64,
    action: ReviewAction,
) -> Result<Draft> {
    if !identity.is_admin() {
        return Err(EngineError::Forbidden("the team admin role"));
    }

    let (approved, reason) = match &action {
        ReviewAction::Approve => (true, None),
        ReviewAction::Reject { reason } => (false, reason.as_deref()),
    };
    let target = if approved {
        DraftStatus::Approved
    } else {
        DraftStatus::Rejected
    };

    let now = Utc::now();
    let mut tx = pool.begin().await?;

    let draft = db::draft_by_id(&mut *tx, draft_id)
        .await?
        .ok_or(EngineError::NotFound("draft", draft_id))?;
    if draft.team_id != identity.team_id {
        return Err(EngineError::Forbidden("membership in the draft's team"));
    }
    if !draft.status.can_transition(target) {
        return Err(EngineError::InvalidTransition {
            from: draft.status,
            to: target,
        });
    }

    db::mark_reviewed_tx(
        &mut tx,
        draft_id,
        draft.version,
        approved,
        &identity.user_id,
        reason,
        now,
    )
    .await?;
    db::settle_approval_tx(&mut tx, draft_id, approved, &identity.user_id, reason).await?;
    tx.commit().await?;
    info!(draft_id, approved, "draft reviewed");

    db::get_draft(pool, draft_id).await
}
