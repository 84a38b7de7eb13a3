//! Write paths that feed the resolution cascade.
//!
//! - `POST /api/flow/dispatches` records that a form prompt was sent to a
//!   phone, so a later submission can claim it.
//! - `POST /api/flow/tokens` records a phone observed next to a flow token
//!   and back-fills submissions that were saved without an identity.

use axum::{extract::Extension, Json};
use flowbridge_store::{
    attach_identity_by_token, enqueue, record_mapping, EnqueueParams, RecordMappingParams,
};
use flowbridge_types::{normalize_phone, IdentitySource, ResolvedIdentity};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::api::ApiError;
use crate::api_flow::maybe_reap;
use crate::AppState;

/// Request body for `POST /api/flow/dispatches`.
#[derive(Debug, Deserialize)]
pub struct DispatchRequest {
    pub phone_number: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<i64>,
    #[serde(default)]
    pub message_id: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DispatchResponse {
    pub id: i64,
}

/// Request body for `POST /api/flow/tokens`.
#[derive(Debug, Deserialize)]
pub struct TokenObservation {
    pub flow_token: String,
    pub phone_number: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenObservationResponse {
    /// Identity-incomplete submissions updated by this observation.
    pub reconciled: usize,
}

/// Handler for `POST /api/flow/dispatches`.
pub async fn dispatch_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<DispatchRequest>,
) -> Result<Json<DispatchResponse>, ApiError> {
    maybe_reap(&state);

    let params = EnqueueParams {
        phone_number: payload.phone_number,
        display_name: payload.display_name,
        conversation_id: payload.conversation_id,
        message_id: payload.message_id,
        scope_id: state.settings.scope_id,
    };

    let pool = state.pool.clone();
    let id = tokio::task::spawn_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| ApiError::InternalServerError(format!("db connection failed: {}", e)))?;
        enqueue(&conn, &params).map_err(ApiError::from)
    })
    .await
    .map_err(|e| ApiError::InternalServerError(format!("task join error: {}", e)))??;

    Ok(Json(DispatchResponse { id }))
}

/// Handler for `POST /api/flow/tokens`.
pub async fn token_observation_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<TokenObservation>,
) -> Result<Json<TokenObservationResponse>, ApiError> {
    let flow_token = payload.flow_token.trim().to_string();
    if flow_token.is_empty() {
        return Err(ApiError::BadRequest("flow_token is required".to_string()));
    }
    let phone = normalize_phone(&payload.phone_number).ok_or_else(|| {
        ApiError::BadRequest(format!("invalid phone number: {}", payload.phone_number))
    })?;

    let scope_id = state.settings.scope_id;
    let identity = ResolvedIdentity::new(phone.clone(), IdentitySource::TokenMapping)
        .with_display_name(payload.display_name.clone());
    let params = RecordMappingParams {
        flow_token: flow_token.clone(),
        phone_number: phone,
        display_name: payload.display_name,
        scope_id,
    };

    let pool = state.pool.clone();
    let reconciled = tokio::task::spawn_blocking(move || {
        let conn = pool
            .get()
            .map_err(|e| ApiError::InternalServerError(format!("db connection failed: {}", e)))?;
        record_mapping(&conn, &params)?;
        attach_identity_by_token(&conn, &flow_token, scope_id, &identity).map_err(ApiError::from)
    })
    .await
    .map_err(|e| ApiError::InternalServerError(format!("task join error: {}", e)))??;

    Ok(Json(TokenObservationResponse { reconciled }))
}
