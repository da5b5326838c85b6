//! Engine error taxonomy.
//!
//! Validation and duplicate checks reject before any mutation; `Conflict`
//! is always safe to retry because the losing attempt rolls back whole.

use crate::model::DraftStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("duplicate content: draft {other_draft_id} already holds this fingerprint")]
    DuplicateContent { other_draft_id: i64 },

    #[error("illegal transition from '{from}' to '{to}'")]
    InvalidTransition { from: DraftStatus, to: DraftStatus },

    #[error("draft {draft_id} was modified concurrently, retry the operation")]
    Conflict { draft_id: i64 },

    #[error("no publish slot available within the scheduling horizon")]
    NoCapacity,

    #[error("share token has expired")]
    TokenExpired,

    #[error("share token not found")]
    TokenNotFound,

    #[error("comments are disabled for this share")]
    CommentsDisabled,

    #[error("{0} {1} not found")]
    NotFound(&'static str, i64),

    #[error("operation requires {0}")]
    Forbidden(&'static str),

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

impl EngineError {
    /// Lock-contention errors from the store. These are retried with
    /// bounded backoff before surfacing; see `db::with_busy_retry`.
    pub fn is_busy(&self) -> bool {
        match self {
            EngineError::Database(sqlx::Error::Database(db)) => {
                let msg = db.message();
                msg.contains("database is locked") || msg.contains("database table is locked")
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
