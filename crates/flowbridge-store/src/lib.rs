//! Persistent state for flowbridge.
//!
//! Three tables back the identity-resolution cascade:
//!
//! | Module | Table | Role |
//! |--------|-------|------|
//! | [`queue`] | `flow_queue` | "prompt dispatched" events, consumed at most once |
//! | [`mapping`] | `flow_token_mappings` | phones observed alongside a flow token |
//! | [`submission`] | `survey_submissions` | minimal submission record with resolved identity |
//!
//! All operations take a plain `rusqlite::Connection`; callers on the async
//! side run them inside `tokio::task::spawn_blocking`. Cross-request
//! coordination is left to SQLite itself: every state transition that must
//! be exclusive is a single conditional statement.

mod error;
pub mod mapping;
pub mod queue;
pub mod submission;

pub use error::StoreError;
pub use mapping::{phone_for_token, record_mapping, RecordMappingParams, TokenMapping};
pub use queue::{
    consume_latest_any, consume_latest_for_phone, enqueue, reap, EnqueueParams,
    PendingFlowEntry, ReapPolicy, ReapThrottle,
};
pub use submission::{
    attach_identity_by_token, get_submission, save_submission, NewSubmission, SubmissionRecord,
};

/// SQLite expression producing the current time in the format stored in
/// every `created_at` column (millisecond resolution, lexically ordered).
pub(crate) const NOW_MS: &str = "strftime('%Y-%m-%d %H:%M:%f', 'now')";

/// Builds a `strftime` modifier that moves "now" back by `age`.
pub(crate) fn age_modifier(age: std::time::Duration) -> String {
    format!("-{:.3} seconds", age.as_secs_f64())
}
