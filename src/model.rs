use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a draft from authoring to publication.
///
/// The legal edges are encoded once in [`DraftStatus::can_transition`];
/// call sites never hand-check status strings.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DraftStatus {
    Draft,
    PendingApproval,
    Approved,
    Rejected,
    Scheduled,
    Published,
    Cancelled,
    Failed,
}

impl DraftStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DraftStatus::Draft => "draft",
            DraftStatus::PendingApproval => "pending_approval",
            DraftStatus::Approved => "approved",
            DraftStatus::Rejected => "rejected",
            DraftStatus::Scheduled => "scheduled",
            DraftStatus::Published => "published",
            DraftStatus::Cancelled => "cancelled",
            DraftStatus::Failed => "failed",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(DraftStatus::Draft),
            "pending_approval" => Some(DraftStatus::PendingApproval),
            "approved" => Some(DraftStatus::Approved),
            "rejected" => Some(DraftStatus::Rejected),
            "scheduled" => Some(DraftStatus::Scheduled),
            "published" => Some(DraftStatus::Published),
            "cancelled" => Some(DraftStatus::Cancelled),
            "failed" => Some(DraftStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DraftStatus::Rejected
                | DraftStatus::Published
                | DraftStatus::Cancelled
                | DraftStatus::Failed
        )
    }

    /// A draft in one of these states holds its content fingerprint against
    /// new submissions in the same team.
    pub fn holds_fingerprint(&self) -> bool {
        matches!(
            self,
            DraftStatus::PendingApproval | DraftStatus::Approved | DraftStatus::Scheduled
        )
    }

    /// The complete transition table. Anything not listed is illegal.
    pub fn can_transition(&self, to: DraftStatus) -> bool {
        use DraftStatus::*;
        matches!(
            (self, to),
            (Draft, PendingApproval)
                | (PendingApproval, Approved)
                | (PendingApproval, Rejected)
                | (Approved, Scheduled)
                | (Scheduled, Published)
                | (Scheduled, Cancelled)
                // dispatch failure under the retry budget re-queues the draft
                | (Scheduled, Approved)
                | (Scheduled, Failed)
        )
    }
}

impl fmt::Display for DraftStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DraftKind {
    Tweet,
    Thread,
}

impl DraftKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DraftKind::Tweet => "tweet",
            DraftKind::Thread => "thread",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "tweet" => Some(DraftKind::Tweet),
            "thread" => Some(DraftKind::Thread),
            _ => None,
        }
    }
}

/// Queue priority. `rank` gives the sort key used for queue ordering:
/// urgent drafts drain first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Urgent => "urgent",
        }
    }

    pub fn parse_priority(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "urgent" => Some(Priority::Urgent),
            _ => None,
        }
    }

    pub fn rank(&self) -> i64 {
        match self {
            Priority::Urgent => 0,
            Priority::High => 1,
            Priority::Normal => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
    Monthly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
            Frequency::Monthly => "monthly",
        }
    }

    pub fn parse_frequency(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(Frequency::Daily),
            "weekly" => Some(Frequency::Weekly),
            "monthly" => Some(Frequency::Monthly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShareState {
    Active,
    Revoked,
}

impl ShareState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShareState::Active => "active",
            ShareState::Revoked => "revoked",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ShareState::Active),
            "revoked" => Some(ShareState::Revoked),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TeamRole {
    Member,
    Admin,
}

/// Caller identity supplied by the authentication layer. The engine trusts
/// it and performs no credential verification of its own.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub team_id: String,
    pub role: TeamRole,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == TeamRole::Admin
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Draft {
    pub id: i64,
    pub team_id: String,
    pub author_id: String,
    pub kind: DraftKind,
    pub status: DraftStatus,
    pub content_hash: Option<String>,
    pub version: i64,
    pub rejection_reason: Option<String>,
    pub reviewed_by: Option<String>,
    pub slot_id: Option<i64>,
    pub publish_attempts: i64,
    pub publish_error: Option<String>,
    pub external_post_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: i64,
    pub draft_id: i64,
    pub position: i64,
    pub content: String,
    pub media_ids: Vec<String>,
    pub content_hash: Option<String>,
}

/// Input shape for creating or replacing the posts of a draft.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPost {
    pub content: String,
    pub media_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecurrencePattern {
    pub frequency: Frequency,
    pub interval: u32,
    pub end_date: Option<DateTime<Utc>>,
}

/// A publish window. Template rows (`recurrence` set) expand into concrete
/// occurrence rows; only concrete rows are ever reserved.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSlot {
    pub id: i64,
    pub team_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub is_available: bool,
    pub template_id: Option<i64>,
    pub recurrence: Option<RecurrencePattern>,
}

impl TimeSlot {
    pub fn is_recurring(&self) -> bool {
        self.recurrence.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSlot {
    pub id: i64,
    pub team_id: String,
    pub draft_id: i64,
    pub position: i64,
    pub priority: Priority,
    pub estimated_time: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedDraft {
    pub token: String,
    pub draft_id: i64,
    pub can_comment: bool,
    pub created_by: String,
    pub share_state: ShareState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub token: String,
    pub content: String,
    pub author_id: Option<String>,
    pub author_name: String,
    pub created_at: DateTime<Utc>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
}

/// Audit row written per submission and settled on review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: i64,
    pub draft_id: i64,
    pub submitted_by: String,
    pub submitted_at: DateTime<Utc>,
    pub status: String,
    pub reviewed_by: Option<String>,
    pub rejection_reason: Option<String>,
}

/// Reviewer verdict for `review_draft`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewAction {
    Approve,
    Reject { reason: Option<String> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table_covers_the_graph() {
        use DraftStatus::*;
        let legal = [
            (Draft, PendingApproval),
            (PendingApproval, Approved),
            (PendingApproval, Rejected),
            (Approved, Scheduled),
            (Scheduled, Published),
            (Scheduled, Cancelled),
            (Scheduled, Approved),
            (Scheduled, Failed),
        ];
        let all = [
            Draft,
            PendingApproval,
            Approved,
            Rejected,
            Scheduled,
            Published,
            Cancelled,
            Failed,
        ];
        for from in all {
            for to in all {
                let expected = legal.contains(&(from, to));
                assert_eq!(
                    from.can_transition(to),
                    expected,
                    "transition {from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        use DraftStatus::*;
        let all = [
            Draft,
            PendingApproval,
            Approved,
            Rejected,
            Scheduled,
            Published,
            Cancelled,
            Failed,
        ];
        for from in all.into_iter().filter(DraftStatus::is_terminal) {
            for to in all {
                assert!(!from.can_transition(to));
            }
        }
    }

    #[test]
    fn status_round_trips_through_strings() {
        use DraftStatus::*;
        for status in [
            Draft,
            PendingApproval,
            Approved,
            Rejected,
            Scheduled,
            Published,
            Cancelled,
            Failed,
        ] {
            assert_eq!(DraftStatus::parse_state(status.as_str()), Some(status));
        }
        assert_eq!(DraftStatus::parse_state("unknown"), None);
    }
}
