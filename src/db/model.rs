//! View models handed across the dispatch boundary.

use crate::model::DraftKind;
use chrono::{DateTime, Utc};

/// A scheduled draft whose slot trigger time has passed.
#[derive(Debug, Clone)]
pub struct DuePublication {
    pub draft_id: i64,
    pub slot_id: i64,
    pub team_id: String,
    pub slot_start: DateTime<Utc>,
}

/// One member post, flattened for the dispatcher.
#[derive(Debug, Clone)]
pub struct PublishPost {
    pub content: String,
    pub media_ids: Vec<String>,
}

/// Everything the dispatcher needs to publish a draft.
#[derive(Debug, Clone)]
pub struct DraftForPublish {
    pub draft_id: i64,
    pub team_id: String,
    pub kind: DraftKind,
    pub posts: Vec<PublishPost>,
}
