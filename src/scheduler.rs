//! Time-slot allocation: recurrence expansion, reservation, and the
//! per-team priority queue.
//!
//! Reservation and release both run inside a single transaction so the
//! duplicate claim check, the draft transition, and the queue bookkeeping
//! commit together or not at all.

use crate::config::Config;
use crate::db::{self, Pool};
use crate::error::{EngineError, Result};
use crate::model::{
    Draft, DraftStatus, Frequency, Identity, Priority, QueueSlot, TimeSlot,
};
use chrono::{DateTime, Duration, Months, Utc};
use sqlx::{Sqlite, Transaction};
use tracing::{info, instrument};

/// Bounded lock-wait retries before a reservation surfaces as a conflict.
const BUSY_ATTEMPTS: u32 = 4;

/// Hard cap on occurrences expanded from one template in one query, far
/// beyond any real horizon.
const MAX_OCCURRENCES: usize = 1024;

/// A half-open `[start, end)` window to search for a publish slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// One concrete expansion of a recurrence template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Occurrence {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Outcome of a reservation request: either a concrete slot was claimed or
/// the draft now waits in the team queue.
#[derive(Debug, Clone)]
pub enum Reservation {
    Scheduled(TimeSlot),
    Queued(QueueSlot),
}

/// Expand a recurrence template into concrete occurrences inside
/// `[range_start, range_end)`.
///
/// Stepping starts at the template's own start so the phase is stable no
/// matter which range is queried. `end_date` bounds the series
/// date-inclusively; each occurrence inherits the template duration.
pub fn expand_recurrence(
    template: &TimeSlot,
    range_start: DateTime<Utc>,
    range_end: DateTime<Utc>,
) -> Vec<Occurrence> {
    let Some(pattern) = &template.recurrence else {
        return Vec::new();
    };
    let duration = template.end_time - template.start_time;
    let interval = pattern.interval.max(1);

    let mut occurrences = Vec::new();
    for step in 0..MAX_OCCURRENCES as u32 {
        let Some(offset) = step.checked_mul(interval) else {
            break;
        };
        let start = match pattern.frequency {
            Frequency::Daily => template.start_time + Duration::days(offset as i64),
            Frequency::Weekly => template.start_time + Duration::weeks(offset as i64),
            Frequency::Monthly => match template.start_time.checked_add_months(Months::new(offset))
            {
                Some(start) => start,
                None => break,
            },
        };
        if start >= range_end {
            break;
        }
        if let Some(end_date) = pattern.end_date {
            if start.date_naive() > end_date.date_naive() {
                break;
            }
        }
        if start >= range_start {
            occurrences.push(Occurrence {
                start_time: start,
                end_time: start + duration,
            });
        }
    }
    occurrences
}

fn horizon_end(cfg: &Config, now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::days(cfg.scheduling.horizon_days as i64)
}

/// Materialize every template occurrence inside the team's lookahead window
/// as a concrete, claimable slot row. Idempotent across calls.
async fn materialize_occurrences_tx(
    tx: &mut Transaction<'_, Sqlite>,
    team_id: &str,
    now: DateTime<Utc>,
    horizon: DateTime<Utc>,
) -> Result<()> {
    let templates = db::templates_for_team_tx(tx, team_id).await?;
    for template in &templates {
        for occurrence in expand_recurrence(template, now, horizon) {
            db::insert_occurrence_tx(
                tx,
                team_id,
                template.id,
                occurrence.start_time,
                occurrence.end_time,
            )
            .await?;
        }
    }
    Ok(())
}

/// Reserve a publish slot for an approved draft.
///
/// Finds the earliest available concrete slot in the preferred window (or
/// the team's working hours over the whole horizon), claims it, and moves
/// the draft to `scheduled`. With no free slot the draft joins the team
/// queue instead; `NoCapacityError` only fires when the horizon holds no
/// slot at all.
#[instrument(skip_all)]
pub async fn reserve_slot(
    pool: &Pool,
    cfg: &Config,
    identity: &Identity,
    draft_id: i64,
    preferred: Option<Window>,
    priority: Priority,
    now: DateTime<Utc>,
) -> Result<Reservation> {
    db::with_busy_retry(draft_id, BUSY_ATTEMPTS, || {
        reserve_slot_once(pool, cfg, identity, draft_id, preferred, priority, now)
    })
    .await
}

async fn reserve_slot_once(
    pool: &Pool,
    cfg: &Config,
    identity: &Identity,
    draft_id: i64,
    preferred: Option<Window>,
    priority: Priority,
    now: DateTime<Utc>,
) -> Result<Reservation> {
    let horizon = horizon_end(cfg, now);
    let mut tx = pool.begin().await?;

    let draft = db::draft_by_id(&mut *tx, draft_id)
        .await?
        .ok_or(EngineError::NotFound("draft", draft_id))?;
    if draft.team_id != identity.team_id {
        return Err(EngineError::Forbidden("membership in the draft's team"));
    }
    if !draft.status.can_transition(DraftStatus::Scheduled) {
        return Err(EngineError::InvalidTransition {
            from: draft.status,
            to: DraftStatus::Scheduled,
        });
    }

    materialize_occurrences_tx(&mut tx, &identity.team_id, now, horizon).await?;

    let (window_start, window_end, hours) = match preferred {
        Some(window) => (window.start.max(now), window.end, None),
        None => {
            let hours = cfg.scheduling.working_hours;
            (now, horizon, Some((hours.start, hours.end)))
        }
    };

    let candidate =
        db::earliest_available_tx(&mut tx, &identity.team_id, window_start, window_end, hours)
            .await?;

    if let Some(slot) = candidate {
        db::claim_slot_tx(&mut tx, slot.id, draft_id).await?;
        db::mark_scheduled_tx(&mut tx, draft_id, draft.version, slot.id, now).await?;
        if db::dequeue_draft_tx(&mut tx, draft_id).await? {
            db::renumber_queue_tx(&mut tx, &identity.team_id).await?;
        }
        refresh_queue_estimates_tx(&mut tx, &identity.team_id, now, cfg).await?;
        tx.commit().await?;
        info!(draft_id, slot_id = slot.id, "draft scheduled");
        return Ok(Reservation::Scheduled(db::get_slot(pool, slot.id).await?));
    }

    // Horizon exhausted: not a single concrete slot exists in the lookahead
    // window, so queueing would never drain.
    if db::count_concrete_slots_tx(&mut tx, &identity.team_id, now, horizon).await? == 0 {
        return Err(EngineError::NoCapacity);
    }

    db::enqueue_tx(&mut tx, &identity.team_id, draft_id, priority, now).await?;
    refresh_queue_estimates_tx(&mut tx, &identity.team_id, now, cfg).await?;
    let entry = db::queue_entries_tx(&mut tx, &identity.team_id)
        .await?
        .into_iter()
        .find(|q| q.draft_id == draft_id)
        .ok_or(EngineError::NotFound("queue entry", draft_id))?;
    tx.commit().await?;
    info!(draft_id, position = entry.position, "draft queued");
    Ok(Reservation::Queued(entry))
}

/// Cancel a scheduled draft: release its slot and synchronously offer the
/// freed capacity to the queue head before returning.
#[instrument(skip_all)]
pub async fn cancel_schedule(
    pool: &Pool,
    cfg: &Config,
    identity: &Identity,
    draft_id: i64,
    now: DateTime<Utc>,
) -> Result<Draft> {
    db::with_busy_retry(draft_id, BUSY_ATTEMPTS, || {
        cancel_schedule_once(pool, cfg, identity, draft_id, now)
    })
    .await
}

async fn cancel_schedule_once(
    pool: &Pool,
    cfg: &Config,
    identity: &Identity,
    draft_id: i64,
    now: DateTime<Utc>,
) -> Result<Draft> {
    let mut tx = pool.begin().await?;

    let draft = db::draft_by_id(&mut *tx, draft_id)
        .await?
        .ok_or(EngineError::NotFound("draft", draft_id))?;
    if draft.team_id != identity.team_id {
        return Err(EngineError::Forbidden("membership in the draft's team"));
    }
    if draft.author_id != identity.user_id && !identity.is_admin() {
        return Err(EngineError::Forbidden("the draft author or a team admin"));
    }
    if !draft.status.can_transition(DraftStatus::Cancelled) {
        return Err(EngineError::InvalidTransition {
            from: draft.status,
            to: DraftStatus::Cancelled,
        });
    }

    db::mark_cancelled_tx(&mut tx, draft_id, draft.version, now).await?;
    if let Some(slot_id) = draft.slot_id {
        db::free_slot_tx(&mut tx, slot_id).await?;
    }
    promote_head_tx(&mut tx, &identity.team_id, now, cfg).await?;
    refresh_queue_estimates_tx(&mut tx, &identity.team_id, now, cfg).await?;
    tx.commit().await?;
    info!(draft_id, "schedule cancelled");

    db::get_draft(pool, draft_id).await
}

/// Offer the earliest free future slot to the head of the team queue.
/// Called after a cancellation or a dispatch re-queue frees capacity.
pub async fn promote_head_tx(
    tx: &mut Transaction<'_, Sqlite>,
    team_id: &str,
    now: DateTime<Utc>,
    cfg: &Config,
) -> Result<()> {
    let Some(head) = db::queue_head_tx(tx, team_id).await? else {
        return Ok(());
    };
    let horizon = horizon_end(cfg, now);
    let Some(slot) = db::earliest_available_tx(tx, team_id, now, horizon, None).await? else {
        return Ok(());
    };

    let draft = db::draft_by_id(&mut **tx, head.draft_id)
        .await?
        .ok_or(EngineError::NotFound("draft", head.draft_id))?;
    if !draft.status.can_transition(DraftStatus::Scheduled) {
        // Stale queue entry (draft settled elsewhere); drop it and stop.
        db::dequeue_draft_tx(tx, head.draft_id).await?;
        db::renumber_queue_tx(tx, team_id).await?;
        return Ok(());
    }

    db::claim_slot_tx(tx, slot.id, head.draft_id).await?;
    db::mark_scheduled_tx(tx, head.draft_id, draft.version, slot.id, now).await?;
    db::dequeue_draft_tx(tx, head.draft_id).await?;
    db::renumber_queue_tx(tx, team_id).await?;
    info!(
        draft_id = head.draft_id,
        slot_id = slot.id,
        "queued draft promoted into freed slot"
    );
    Ok(())
}

/// Recompute `estimated_time` for every queue entry by projecting entries,
/// in position order, onto the upcoming slot starts: free concrete slots
/// first, then future template occurrences that are not materialized as
/// claimed rows. Entries past the projectable range get no estimate.
pub async fn refresh_queue_estimates_tx(
    tx: &mut Transaction<'_, Sqlite>,
    team_id: &str,
    now: DateTime<Utc>,
    cfg: &Config,
) -> Result<()> {
    let entries = db::queue_entries_tx(tx, team_id).await?;
    if entries.is_empty() {
        return Ok(());
    }

    let concrete = db::concrete_slot_starts_tx(tx, team_id, now).await?;
    let mut candidates: Vec<DateTime<Utc>> = concrete
        .iter()
        .filter(|(_, available)| *available)
        .map(|(start, _)| *start)
        .collect();

    // Project template occurrences past the materialized horizon so deep
    // queue positions still get an estimate.
    let projection_end = now + Duration::days(4 * cfg.scheduling.horizon_days as i64);
    let templates = db::templates_for_team_tx(tx, team_id).await?;
    for template in &templates {
        for occurrence in expand_recurrence(template, now, projection_end) {
            let taken = concrete
                .iter()
                .any(|(start, available)| *start == occurrence.start_time && !available);
            if !taken && !candidates.contains(&occurrence.start_time) {
                candidates.push(occurrence.start_time);
            }
        }
    }
    candidates.sort_unstable();
    candidates.dedup();

    for (index, entry) in entries.iter().enumerate() {
        let estimate = candidates.get(index).copied();
        db::set_estimated_time_tx(tx, entry.id, estimate).await?;
    }
    Ok(())
}
