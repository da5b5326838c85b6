//! Token-scoped external sharing of a draft with permissioned commenting.
//!
//! Shares live outside the approval pipeline: token holders read (and
//! optionally comment on) a draft without authentication. Comments are
//! append-only; team members may toggle `resolved` but never edit content.

use crate::db::{self, Pool};
use crate::error::{EngineError, Result};
use crate::model::{Comment, Draft, Identity, Post, SharedDraft, ShareState};
use chrono::{DateTime, Duration, Utc};
use tracing::{info, instrument};
use uuid::Uuid;

const ANONYMOUS_NAME: &str = "Anonymous";

/// A resolved share: the grant plus the draft content it exposes.
#[derive(Debug, Clone)]
pub struct SharedView {
    pub share: SharedDraft,
    pub draft: Draft,
    pub posts: Vec<Post>,
}

/// Mint a share token for a draft. Any member of the owning team may share.
#[instrument(skip_all)]
pub async fn create_share_token(
    pool: &Pool,
    identity: &Identity,
    draft_id: i64,
    can_comment: bool,
    ttl: Duration,
    now: DateTime<Utc>,
) -> Result<SharedDraft> {
    if ttl <= Duration::zero() {
        return Err(EngineError::Validation("share ttl must be positive".into()));
    }
    let draft = db::get_draft(pool, draft_id).await?;
    if draft.team_id != identity.team_id {
        return Err(EngineError::Forbidden("membership in the draft's team"));
    }

    let token = Uuid::new_v4().simple().to_string();
    let mut tx = pool.begin().await?;
    db::insert_share_tx(
        &mut tx,
        &token,
        draft_id,
        can_comment,
        &identity.user_id,
        now,
        now + ttl,
    )
    .await?;
    tx.commit().await?;
    info!(draft_id, "share token created");

    db::share_by_token(pool, &token)
        .await?
        .ok_or(EngineError::TokenNotFound)
}

/// Resolve a token into the draft it exposes. Revoked tokens behave like
/// unknown ones; expiry is reported distinctly.
pub async fn resolve_token(pool: &Pool, token: &str, now: DateTime<Utc>) -> Result<SharedView> {
    let share = lookup_live_share(pool, token, now).await?;
    let draft = db::get_draft(pool, share.draft_id).await?;
    let posts = db::posts_for_draft(pool, share.draft_id).await?;
    Ok(SharedView {
        share,
        draft,
        posts,
    })
}

async fn lookup_live_share(pool: &Pool, token: &str, now: DateTime<Utc>) -> Result<SharedDraft> {
    let share = db::share_by_token(pool, token)
        .await?
        .ok_or(EngineError::TokenNotFound)?;
    if share.share_state == ShareState::Revoked {
        return Err(EngineError::TokenNotFound);
    }
    if share.expires_at <= now {
        return Err(EngineError::TokenExpired);
    }
    Ok(share)
}

/// Append a comment through a share token. Anonymous callers are allowed;
/// their display name falls back to a fixed label.
#[instrument(skip_all)]
pub async fn add_comment(
    pool: &Pool,
    token: &str,
    content: &str,
    author_id: Option<&str>,
    author_name: Option<&str>,
    now: DateTime<Utc>,
) -> Result<Comment> {
    if content.trim().is_empty() {
        return Err(EngineError::Validation(
            "comment content must be non-empty".into(),
        ));
    }
    let share = lookup_live_share(pool, token, now).await?;
    if !share.can_comment {
        return Err(EngineError::CommentsDisabled);
    }

    let name = author_name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(ANONYMOUS_NAME);
    let comment = db::insert_comment(pool, token, content, author_id, name, now).await?;
    info!(comment_id = comment.id, "comment added");
    Ok(comment)
}

/// Comments for a share in creation order.
pub async fn list_comments(pool: &Pool, token: &str, now: DateTime<Utc>) -> Result<Vec<Comment>> {
    let share = lookup_live_share(pool, token, now).await?;
    db::comments_for_share(pool, &share.token).await
}

/// Toggle a comment's resolved flag. Team members of the draft's team only;
/// the comment content itself stays immutable.
#[instrument(skip_all)]
pub async fn set_comment_resolved(
    pool: &Pool,
    identity: &Identity,
    comment_id: i64,
    resolved: bool,
    now: DateTime<Utc>,
) -> Result<Comment> {
    let comment = db::get_comment(pool, comment_id).await?;
    let share = db::share_by_token(pool, &comment.token)
        .await?
        .ok_or(EngineError::TokenNotFound)?;
    let draft = db::get_draft(pool, share.draft_id).await?;
    if draft.team_id != identity.team_id {
        return Err(EngineError::Forbidden("membership in the draft's team"));
    }

    db::set_comment_resolved(pool, comment_id, resolved, Some(&identity.user_id), now).await?;
    db::get_comment(pool, comment_id).await
}

/// Delete a comment. Allowed for the comment author and the share creator.
#[instrument(skip_all)]
pub async fn delete_comment(pool: &Pool, identity: &Identity, comment_id: i64) -> Result<()> {
    let comment = db::get_comment(pool, comment_id).await?;
    let share = db::share_by_token(pool, &comment.token)
        .await?
        .ok_or(EngineError::TokenNotFound)?;

    let is_author = comment.author_id.as_deref() == Some(identity.user_id.as_str());
    if !is_author && share.created_by != identity.user_id {
        return Err(EngineError::Forbidden(
            "the comment author or the share creator",
        ));
    }
    db::delete_comment_row(pool, comment_id).await
}

/// Revoke a share. The creator or a team admin may do this; the token then
/// resolves as not found.
#[instrument(skip_all)]
pub async fn revoke_share(pool: &Pool, identity: &Identity, token: &str) -> Result<()> {
    let share = db::share_by_token(pool, token)
        .await?
        .ok_or(EngineError::TokenNotFound)?;
    let draft = db::get_draft(pool, share.draft_id).await?;
    if draft.team_id != identity.team_id {
        return Err(EngineError::Forbidden("membership in the draft's team"));
    }
    if share.created_by != identity.user_id && !identity.is_admin() {
        return Err(EngineError::Forbidden("the share creator or a team admin"));
    }
    db::revoke_share(pool, token).await?;
    info!("share revoked");
    Ok(())
}

/// Drop expired and revoked shares together with their comments. Run
/// periodically by the daemon.
#[instrument(skip_all)]
pub async fn purge_expired(pool: &Pool, now: DateTime<Utc>) -> Result<u64> {
    let purged = db::purge_expired_shares(pool, now).await?;
    if purged > 0 {
        info!(purged, "expired shares purged");
    }
    Ok(purged)
}
