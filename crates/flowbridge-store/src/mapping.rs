//! Durable token→phone mappings.
//!
//! Written whenever a phone is observed next to a flow token (for example
//! when the messaging platform reports that a user opened a flow), read by
//! the resolution cascade. Multiple rows per token are allowed; the most
//! recent one wins.

use flowbridge_types::{normalize_phone, ScopeId};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::StoreError;

/// A recorded token→phone observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenMapping {
    pub flow_token: String,
    pub phone_number: String,
    pub display_name: Option<String>,
    pub scope_id: ScopeId,
    pub created_at: String,
}

/// Parameters for [`record_mapping`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMappingParams {
    pub flow_token: String,
    pub phone_number: String,
    pub display_name: Option<String>,
    pub scope_id: ScopeId,
}

/// Stores a token→phone observation and returns its row id.
///
/// # Errors
///
/// Returns `StoreError::InvalidPhone` if the phone cannot be normalized, or
/// `StoreError::Database` on SQL failure.
pub fn record_mapping(conn: &Connection, params: &RecordMappingParams) -> Result<i64, StoreError> {
    let phone = normalize_phone(&params.phone_number)
        .ok_or_else(|| StoreError::InvalidPhone(params.phone_number.clone()))?;

    conn.execute(
        "INSERT INTO flow_token_mappings (flow_token, phone_number, display_name, scope_id)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            params.flow_token,
            phone,
            params.display_name.as_deref().filter(|n| !n.trim().is_empty()),
            params.scope_id,
        ],
    )?;
    let id = conn.last_insert_rowid();

    tracing::info!(
        token = %flowbridge_types::token_preview(&params.flow_token),
        phone = %phone,
        "flow token mapping stored"
    );

    Ok(id)
}

/// Returns the most recent mapping recorded for `flow_token` in `scope_id`.
///
/// # Errors
///
/// Returns `StoreError::Database` on SQL failure.
pub fn phone_for_token(
    conn: &Connection,
    flow_token: &str,
    scope_id: ScopeId,
) -> Result<Option<TokenMapping>, StoreError> {
    let mapping = conn
        .query_row(
            "SELECT flow_token, phone_number, display_name, scope_id, created_at
             FROM flow_token_mappings
             WHERE flow_token = ?1 AND scope_id = ?2
             ORDER BY created_at DESC, id DESC
             LIMIT 1",
            params![flow_token, scope_id],
            |row| {
                Ok(TokenMapping {
                    flow_token: row.get(0)?,
                    phone_number: row.get(1)?,
                    display_name: row.get(2)?,
                    scope_id: row.get(3)?,
                    created_at: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(mapping)
}
