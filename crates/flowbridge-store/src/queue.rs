//! The pending flow queue.
//!
//! A row is written whenever a form prompt is dispatched to a user. A later
//! submission claims the most recent matching row exactly once. Claiming is
//! a single `UPDATE … WHERE id = (SELECT …) AND consumed = 0 RETURNING …`
//! statement: SQLite serializes writers, so two callers can never both
//! observe and mark the same unconsumed row.
//!
//! Validity windows are enforced at read time. A row older than the
//! caller's `max_age` is invisible even while it is still present and
//! unconsumed; physical removal is [`reap`]'s job.

use flowbridge_types::{normalize_phone, ScopeId};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::{age_modifier, StoreError};

/// A "prompt dispatched" event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingFlowEntry {
    pub id: i64,
    /// Normalized phone number the prompt was sent to.
    pub phone_number: String,
    pub display_name: Option<String>,
    /// Chat conversation the prompt was posted in.
    pub conversation_id: Option<i64>,
    /// Chat message carrying the prompt.
    pub message_id: Option<i64>,
    pub scope_id: ScopeId,
    /// Insertion time, `YYYY-MM-DD HH:MM:SS.SSS` UTC.
    pub created_at: String,
    pub consumed: bool,
}

/// Parameters for [`enqueue`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueParams {
    pub phone_number: String,
    pub display_name: Option<String>,
    pub conversation_id: Option<i64>,
    pub message_id: Option<i64>,
    pub scope_id: ScopeId,
}

/// Columns returned by every claiming statement, plus the entry age.
const RETURNING: &str = "RETURNING id, phone_number, display_name, conversation_id, \
     message_id, scope_id, created_at, consumed, \
     (julianday('now') - julianday(created_at)) * 86400.0";

/// Inserts a new unconsumed entry and returns its id.
///
/// # Errors
///
/// Returns `StoreError::InvalidPhone` if the phone number cannot be
/// normalized, or `StoreError::Database` on SQL failure.
pub fn enqueue(conn: &Connection, params: &EnqueueParams) -> Result<i64, StoreError> {
    let phone = normalize_phone(&params.phone_number)
        .ok_or_else(|| StoreError::InvalidPhone(params.phone_number.clone()))?;
    let display_name = params
        .display_name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty());

    let id: i64 = conn.query_row(
        "INSERT INTO flow_queue (phone_number, display_name, conversation_id, message_id, scope_id)
         VALUES (?1, ?2, ?3, ?4, ?5)
         RETURNING id",
        params![
            phone,
            display_name,
            params.conversation_id,
            params.message_id,
            params.scope_id,
        ],
        |row| row.get(0),
    )?;

    tracing::info!(
        queue_id = id,
        phone = %phone,
        scope_id = params.scope_id,
        "added pending flow to queue"
    );

    Ok(id)
}

/// Claims the most recent unconsumed entry for `phone` created within
/// `max_age`.
///
/// Returns `Ok(None)` when nothing matches, including when `phone` is not a
/// valid phone number.
///
/// # Errors
///
/// Returns `StoreError::Database` on SQL failure.
pub fn consume_latest_for_phone(
    conn: &Connection,
    phone: &str,
    scope_id: ScopeId,
    max_age: Duration,
) -> Result<Option<PendingFlowEntry>, StoreError> {
    let Some(phone) = normalize_phone(phone) else {
        tracing::debug!(phone, "not a phone number, skipping queue lookup");
        return Ok(None);
    };

    let sql = format!(
        "UPDATE flow_queue SET consumed = 1
         WHERE id = (
             SELECT id FROM flow_queue
             WHERE phone_number = ?1
               AND scope_id = ?2
               AND consumed = 0
               AND created_at > strftime('%Y-%m-%d %H:%M:%f', 'now', ?3)
             ORDER BY created_at DESC, id DESC
             LIMIT 1
         )
         AND consumed = 0
         {RETURNING}"
    );

    let claimed = conn
        .query_row(
            &sql,
            params![phone, scope_id, age_modifier(max_age)],
            map_claimed_row,
        )
        .optional()?;

    log_claim(claimed.as_ref(), Some(&phone));
    Ok(claimed.map(|(entry, _)| entry))
}

/// Claims the most recent unconsumed entry in `scope_id` created within
/// `max_age`, whatever its phone number.
///
/// Used when the flow token carries no identity signal at all.
///
/// # Errors
///
/// Returns `StoreError::Database` on SQL failure.
pub fn consume_latest_any(
    conn: &Connection,
    scope_id: ScopeId,
    max_age: Duration,
) -> Result<Option<PendingFlowEntry>, StoreError> {
    let sql = format!(
        "UPDATE flow_queue SET consumed = 1
         WHERE id = (
             SELECT id FROM flow_queue
             WHERE scope_id = ?1
               AND consumed = 0
               AND created_at > strftime('%Y-%m-%d %H:%M:%f', 'now', ?2)
             ORDER BY created_at DESC, id DESC
             LIMIT 1
         )
         AND consumed = 0
         {RETURNING}"
    );

    let claimed = conn
        .query_row(&sql, params![scope_id, age_modifier(max_age)], map_claimed_row)
        .optional()?;

    log_claim(claimed.as_ref(), None);
    Ok(claimed.map(|(entry, _)| entry))
}

/// Retention horizons applied by [`reap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapPolicy {
    /// Entries older than this are deleted whatever their state.
    pub max_age: Duration,
    /// Consumed entries older than this are deleted.
    pub consumed_max_age: Duration,
}

impl Default for ReapPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(24 * 60 * 60),
            consumed_max_age: Duration::from_secs(60 * 60),
        }
    }
}

/// Deletes entries that can no longer be claimed by anyone.
///
/// Only rows outside every validity window or already consumed are
/// removed, so this needs no coordination with [`enqueue`] or the
/// consumers.
///
/// # Errors
///
/// Returns `StoreError::Database` on SQL failure.
pub fn reap(conn: &Connection, policy: &ReapPolicy) -> Result<usize, StoreError> {
    let deleted = conn.execute(
        "DELETE FROM flow_queue
         WHERE created_at < strftime('%Y-%m-%d %H:%M:%f', 'now', ?1)
            OR (consumed = 1 AND created_at < strftime('%Y-%m-%d %H:%M:%f', 'now', ?2))",
        params![
            age_modifier(policy.max_age),
            age_modifier(policy.consumed_max_age)
        ],
    )?;

    if deleted > 0 {
        tracing::info!(count = deleted, "reaped flow queue entries");
    } else {
        tracing::debug!("no flow queue entries to reap");
    }

    Ok(deleted)
}

/// Lets at most one caller per interval run [`reap`].
///
/// Request handlers call [`ReapThrottle::try_acquire`] on their way through;
/// the winner reaps, everyone else carries on. This bounds storage growth
/// without a dedicated scheduler.
#[derive(Debug)]
pub struct ReapThrottle {
    interval: Duration,
    origin: Instant,
    /// Milliseconds since `origin` of the last granted run, or `NEVER`.
    last_run_ms: AtomicU64,
}

const NEVER: u64 = u64::MAX;

impl ReapThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            origin: Instant::now(),
            last_run_ms: AtomicU64::new(NEVER),
        }
    }

    /// Returns `true` if the caller should reap now.
    pub fn try_acquire(&self) -> bool {
        let now_ms = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(NEVER - 1);
        let interval_ms = u64::try_from(self.interval.as_millis()).unwrap_or(NEVER);
        let last = self.last_run_ms.load(Ordering::Acquire);

        if last != NEVER && now_ms.saturating_sub(last) < interval_ms {
            return false;
        }

        self.last_run_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

fn map_claimed_row(row: &Row<'_>) -> rusqlite::Result<(PendingFlowEntry, f64)> {
    Ok((
        PendingFlowEntry {
            id: row.get(0)?,
            phone_number: row.get(1)?,
            display_name: row.get(2)?,
            conversation_id: row.get(3)?,
            message_id: row.get(4)?,
            scope_id: row.get(5)?,
            created_at: row.get(6)?,
            consumed: row.get(7)?,
        },
        row.get(8)?,
    ))
}

fn log_claim(claimed: Option<&(PendingFlowEntry, f64)>, phone: Option<&str>) {
    match (claimed, phone) {
        (Some((entry, age_secs)), _) => tracing::info!(
            queue_id = entry.id,
            phone = %entry.phone_number,
            name = entry.display_name.as_deref().unwrap_or("<none>"),
            age_seconds = age_secs.round() as i64,
            "consumed pending flow from queue"
        ),
        (None, Some(phone)) => {
            tracing::info!(phone, "no pending flow in queue for phone")
        }
        (None, None) => tracing::info!("no recent pending flow in queue"),
    }
}
