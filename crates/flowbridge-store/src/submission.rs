//! Minimal submission records.
//!
//! Only what the resolution flow needs is kept: the token, the answers as
//! JSON, and whatever identity was resolved. A submission saved without an
//! identity is flagged `identity_complete = 0` and can be back-filled later
//! by [`attach_identity_by_token`] once a token→phone mapping shows up.

use flowbridge_types::{IdentitySource, ResolvedIdentity, ScopeId};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{StoreError, NOW_MS};

/// A stored submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub id: i64,
    pub flow_token: String,
    pub phone_number: Option<String>,
    pub display_name: Option<String>,
    pub identity_source: Option<IdentitySource>,
    pub identity_complete: bool,
    pub scope_id: ScopeId,
    pub answers: Map<String, Value>,
    pub created_at: String,
    pub updated_at: String,
}

/// Parameters for [`save_submission`].
#[derive(Debug, Clone)]
pub struct NewSubmission<'a> {
    pub flow_token: &'a str,
    pub scope_id: ScopeId,
    pub answers: &'a Map<String, Value>,
    pub identity: Option<&'a ResolvedIdentity>,
}

/// Persists a submission and returns its id.
///
/// # Errors
///
/// Returns `StoreError::Serialization` if the answers cannot be encoded or
/// `StoreError::Database` on SQL failure.
pub fn save_submission(conn: &Connection, new: &NewSubmission<'_>) -> Result<i64, StoreError> {
    let answers_json = serde_json::to_string(new.answers)?;
    let identity = new.identity;

    let id: i64 = conn.query_row(
        "INSERT INTO survey_submissions
            (flow_token, phone_number, display_name, identity_source, identity_complete,
             scope_id, answers_json)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         RETURNING id",
        params![
            new.flow_token,
            identity.map(|i| i.phone_number.as_str()),
            identity.and_then(|i| i.display_name.as_deref()),
            identity.map(|i| i.source.as_str()),
            identity.is_some(),
            new.scope_id,
            answers_json,
        ],
        |row| row.get(0),
    )?;

    match identity {
        Some(identity) => tracing::info!(
            submission_id = id,
            phone = %identity.phone_number,
            source = %identity.source,
            "submission saved"
        ),
        None => tracing::warn!(
            submission_id = id,
            token = %flowbridge_types::token_preview(new.flow_token),
            "submission saved without identity, flagged for reconciliation"
        ),
    }

    Ok(id)
}

/// Fills in the identity of every identity-incomplete submission carrying
/// `flow_token`. Returns the number of rows updated.
///
/// # Errors
///
/// Returns `StoreError::Database` on SQL failure.
pub fn attach_identity_by_token(
    conn: &Connection,
    flow_token: &str,
    scope_id: ScopeId,
    identity: &ResolvedIdentity,
) -> Result<usize, StoreError> {
    let updated = conn.execute(
        &format!(
            "UPDATE survey_submissions
             SET phone_number = ?3,
                 display_name = COALESCE(display_name, ?4),
                 identity_source = ?5,
                 identity_complete = 1,
                 updated_at = {NOW_MS}
             WHERE flow_token = ?1 AND scope_id = ?2 AND identity_complete = 0"
        ),
        params![
            flow_token,
            scope_id,
            identity.phone_number,
            identity.display_name,
            identity.source.as_str(),
        ],
    )?;

    if updated > 0 {
        tracing::info!(
            count = updated,
            token = %flowbridge_types::token_preview(flow_token),
            phone = %identity.phone_number,
            "reconciled identity-incomplete submissions"
        );
    }

    Ok(updated)
}

/// Fetches a submission by id.
///
/// # Errors
///
/// Returns `StoreError::Database` on SQL failure or
/// `StoreError::Serialization` if the stored answers are not valid JSON.
pub fn get_submission(conn: &Connection, id: i64) -> Result<Option<SubmissionRecord>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, flow_token, phone_number, display_name, identity_source,
                    identity_complete, scope_id, answers_json, created_at, updated_at
             FROM survey_submissions WHERE id = ?1",
            [id],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, bool>(5)?,
                    row.get::<_, ScopeId>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, String>(9)?,
                ))
            },
        )
        .optional()?;

    let Some((
        id,
        flow_token,
        phone_number,
        display_name,
        source,
        identity_complete,
        scope_id,
        answers_json,
        created_at,
        updated_at,
    )) = row
    else {
        return Ok(None);
    };

    Ok(Some(SubmissionRecord {
        id,
        flow_token,
        phone_number,
        display_name,
        identity_source: source.and_then(|s| s.parse().ok()),
        identity_complete,
        scope_id,
        answers: serde_json::from_str(&answers_json)?,
        created_at,
        updated_at,
    }))
}
