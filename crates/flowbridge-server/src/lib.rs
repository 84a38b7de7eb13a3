//! Flowbridge server library logic.

pub mod api;
pub mod api_dispatch;
pub mod api_flow;
pub mod collaborators;
pub mod config;
pub mod notify;
pub mod resolver;
pub mod strategies;

use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use collaborators::{ChatApiClient, ChatDirectory, CloudApiRelay, MessageRelay};
use config::{Config, ConfigError, FlowConfig};
use flowbridge_crypto::{CryptoChannel, CryptoError};
use flowbridge_db::DbPool;
use flowbridge_store::{ReapPolicy, ReapThrottle};
use flowbridge_types::ScopeId;
use notify::Notifier;
use resolver::{IdentityResolver, ResolverSettings};
use serde_json::{json, Value};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

/// Per-deployment flow settings read by the handlers.
#[derive(Debug, Clone)]
pub struct FlowSettings {
    pub scope_id: ScopeId,
    pub confirmation_message: String,
    pub reap_policy: ReapPolicy,
}

impl FlowSettings {
    pub fn from_config(flow: &FlowConfig) -> Self {
        Self {
            scope_id: flow.scope_id,
            confirmation_message: flow.confirmation_message.clone(),
            reap_policy: ReapPolicy {
                max_age: Duration::from_secs(flow.reap_max_age_secs),
                consumed_max_age: Duration::from_secs(flow.reap_consumed_age_secs),
            },
        }
    }
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self::from_config(&FlowConfig::default())
    }
}

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool.
    pub pool: DbPool,
    /// `None` when no private key is configured; encrypted traffic is then
    /// refused with a configuration error.
    pub crypto: Option<Arc<CryptoChannel>>,
    pub resolver: Arc<IdentityResolver>,
    pub notifier: Arc<Notifier>,
    pub settings: Arc<FlowSettings>,
    pub reap_throttle: Arc<ReapThrottle>,
}

/// Errors that can occur while assembling [`AppState`] from configuration.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("private key error: {0}")]
    PrivateKey(#[from] CryptoError),
}

impl AppState {
    /// Wires the crypto channel, collaborators, resolver and notifier from
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns `StartupError` if a configured private key cannot be read or
    /// parsed. A missing key is not an error.
    pub fn from_config(config: &Config, pool: DbPool) -> Result<Self, StartupError> {
        let flow = &config.flow;

        let crypto = match flow.load_private_key()? {
            Some(pem) => Some(Arc::new(CryptoChannel::from_pem(&pem)?)),
            None => {
                tracing::warn!("no private key configured, encrypted flow requests will be refused");
                None
            }
        };

        let timeout = flow.collaborator_timeout();
        let directory: Option<Arc<dyn ChatDirectory>> =
            match ChatApiClient::from_config(&config.chat, timeout) {
                Some(client) => Some(Arc::new(client)),
                None => {
                    tracing::info!("chat platform not configured, conversation search disabled");
                    None
                }
            };
        let relay: Option<Arc<dyn MessageRelay>> =
            match CloudApiRelay::from_config(&config.relay, timeout) {
                Some(relay) => Some(Arc::new(relay)),
                None => {
                    tracing::info!("messaging relay not configured, confirmations disabled");
                    None
                }
            };

        let resolver = IdentityResolver::standard(
            pool.clone(),
            directory.clone(),
            &ResolverSettings {
                generic_tokens: flow.generic_tokens.clone(),
                token_namespaces: flow.token_namespaces.clone(),
                generic_window: flow.generic_window(),
                phone_window: flow.phone_window(),
                deadline: timeout,
                recent_scan_limit: config.chat.recent_scan_limit,
            },
        );
        let notifier = Notifier::new(directory, relay, flow.confirmation_message.clone(), timeout);

        Ok(Self {
            pool,
            crypto,
            resolver: Arc::new(resolver),
            notifier: Arc::new(notifier),
            settings: Arc::new(FlowSettings::from_config(flow)),
            reap_throttle: Arc::new(ReapThrottle::new(Duration::from_secs(
                flow.reap_interval_secs,
            ))),
        })
    }
}

/// Maximum request body size (1 MiB).
const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Converts a handler panic into a generic JSON 500.
pub fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic payload".to_string()
    };
    tracing::error!(detail = %detail, "request handler panicked");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "internal server error" })),
    )
        .into_response()
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/flow",
            post(api_flow::flow_handler)
                .get(api_flow::liveness_handler)
                .fallback(api_flow::method_not_allowed_handler),
        )
        .route(
            "/api/flow/dispatches",
            post(api_dispatch::dispatch_handler),
        )
        .route(
            "/api/flow/tokens",
            post(api_dispatch::token_observation_handler),
        )
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}
