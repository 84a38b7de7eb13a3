//! The flow data-exchange endpoint.
//!
//! `POST /api/flow` carries either a plain `{"action":"ping"}` health probe
//! or an encrypted envelope. Encrypted requests are answered with a bare
//! base64 string sealed under the request's session key.

use axum::{
    body::Bytes,
    extract::Extension,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use flowbridge_crypto::{CryptoChannel, EncryptedEnvelope, OpenedRequest};
use flowbridge_store::{reap, save_submission, NewSubmission};
use flowbridge_types::{
    token_preview, DecryptedRequest, FlowAction, ResolvedIdentity, ScreenResponse,
    StatusResponse,
};
use serde_json::Value;
use std::sync::Arc;

use crate::api::ApiError;
use crate::resolver::ResolveRequest;
use crate::AppState;

/// Liveness text for `GET /api/flow`.
pub const LIVENESS_TEXT: &str = "flowbridge endpoint is running";

/// Handler for `GET /api/flow`.
pub async fn liveness_handler() -> &'static str {
    LIVENESS_TEXT
}

/// Fallback for any other method on `/api/flow`.
pub async fn method_not_allowed_handler() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        Json(serde_json::json!({ "error": "method not allowed" })),
    )
        .into_response()
}

/// Handler for `POST /api/flow`.
pub async fn flow_handler(
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let crypto = state
        .crypto
        .clone()
        .ok_or_else(|| ApiError::Configuration("no private key configured".to_string()))?;

    let value: Value = serde_json::from_slice(&body)
        .map_err(|_| ApiError::BadRequest("invalid request format".to_string()))?;

    if value.get("action").and_then(Value::as_str) == Some("ping") {
        tracing::debug!("plain ping received");
        return Ok(Json(StatusResponse::active()).into_response());
    }

    let envelope = parse_envelope(value)?;
    let OpenedRequest { plaintext, session } = open_envelope(crypto, envelope).await?;

    let request: DecryptedRequest = serde_json::from_slice(&plaintext)
        .map_err(|e| ApiError::BadRequest(format!("invalid decrypted request: {}", e)))?;

    tracing::info!(
        action = ?request.action,
        token = %token_preview(&request.flow_token),
        version = request.version.as_deref().unwrap_or("-"),
        "flow request decrypted"
    );

    let sealed = match request.action {
        FlowAction::Ping => session.seal_response(&StatusResponse::active())?,
        FlowAction::DataExchange => {
            let screen = handle_data_exchange(&state, &request).await;
            session.seal_response(&screen)?
        }
        FlowAction::Unknown => return Err(ApiError::BadRequest("unknown action".to_string())),
    };

    Ok(([(header::CONTENT_TYPE, "text/plain")], sealed).into_response())
}

fn parse_envelope(value: Value) -> Result<EncryptedEnvelope, ApiError> {
    let envelope: EncryptedEnvelope = serde_json::from_value(value)
        .map_err(|_| ApiError::BadRequest("invalid request format".to_string()))?;

    if envelope.encrypted_aes_key.is_empty()
        || envelope.encrypted_flow_data.is_empty()
        || envelope.initial_vector.is_empty()
    {
        return Err(ApiError::BadRequest("invalid request format".to_string()));
    }
    Ok(envelope)
}

/// RSA unwrap is CPU-bound; keep it off the async workers.
async fn open_envelope(
    crypto: Arc<CryptoChannel>,
    envelope: EncryptedEnvelope,
) -> Result<OpenedRequest, ApiError> {
    tokio::task::spawn_blocking(move || crypto.open(&envelope))
        .await
        .map_err(|e| ApiError::InternalServerError(format!("decrypt task failed: {}", e)))?
        .map_err(ApiError::from)
}

/// Resolve, persist, notify. A persistence failure is logged and the
/// success screen is still returned.
async fn handle_data_exchange(
    state: &Arc<AppState>,
    request: &DecryptedRequest,
) -> ScreenResponse {
    maybe_reap(state);

    let scope_id = state.settings.scope_id;
    let identity = state
        .resolver
        .resolve(&ResolveRequest {
            flow_token: &request.flow_token,
            payload_phone: request.payload_phone(),
            scope_id,
        })
        .await;

    persist_submission(state, request, identity.as_ref()).await;

    if let Some(identity) = &identity {
        state.notifier.dispatch(identity, &request.data);
    }

    ScreenResponse::success(state.settings.confirmation_message.clone())
}

async fn persist_submission(
    state: &Arc<AppState>,
    request: &DecryptedRequest,
    identity: Option<&ResolvedIdentity>,
) {
    let pool = state.pool.clone();
    let scope_id = state.settings.scope_id;
    let flow_token = request.flow_token.clone();
    let answers = request.data.clone();
    let identity = identity.cloned();

    let result = tokio::task::spawn_blocking(move || {
        let conn = pool.get().map_err(|e| e.to_string())?;
        save_submission(
            &conn,
            &NewSubmission {
                flow_token: &flow_token,
                scope_id,
                answers: &answers,
                identity: identity.as_ref(),
            },
        )
        .map_err(|e| e.to_string())
    })
    .await;

    match result {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            tracing::error!(
                token = %token_preview(&request.flow_token),
                "failed to save submission: {}",
                e
            );
        }
        Err(e) => {
            tracing::error!("submission save task join error: {}", e);
        }
    }
}

/// Runs a queue reap in the background if the throttle allows one now.
pub(crate) fn maybe_reap(state: &Arc<AppState>) {
    if !state.reap_throttle.try_acquire() {
        return;
    }

    let pool = state.pool.clone();
    let policy = state.settings.reap_policy;
    tokio::spawn(async move {
        let res = tokio::task::spawn_blocking(move || {
            let conn = pool.get().map_err(|e| e.to_string())?;
            reap(&conn, &policy).map_err(|e| e.to_string())
        })
        .await;

        match res {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::error!("failed to reap flow queue: {}", e);
            }
            Err(e) => {
                tracing::error!("reap task join error: {}", e);
            }
        }
    });
}
