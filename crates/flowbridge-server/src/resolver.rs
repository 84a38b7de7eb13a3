//! Identity resolution cascade.
//!
//! A submission carries only a flow token. The resolver runs an ordered list
//! of [`ResolutionStrategy`] tiers and stops at the first one that yields a
//! phone number. Every tier is bounded by a deadline; an error or a timeout
//! counts as a miss and the cascade moves on.
//!
//! Once a phone is known from any tier other than the queue itself, the
//! phone's pending queue entry is claimed so a later generic-token
//! submission cannot pick it up. The claim and a final contact-name lookup
//! are both best-effort.

use async_trait::async_trait;
use flowbridge_db::DbPool;
use flowbridge_store::{consume_latest_for_phone, StoreError};
use flowbridge_types::{IdentitySource, ResolvedIdentity, ScopeId};
use rusqlite::Connection;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;

use crate::collaborators::{ChatDirectory, CollaboratorError};
use crate::strategies::{
    ConversationSearch, GenericTokenQueue, PayloadPhone, TokenMappingLookup, TokenPattern,
};

/// Errors raised inside a tier. Logged by the cascade, never surfaced.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("database pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("blocking task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// What a tier gets to work with.
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
    pub flow_token: &'a str,
    /// `phone_number` field of the submitted form, if present.
    pub payload_phone: Option<&'a str>,
    pub scope_id: ScopeId,
}

/// One tier of the cascade.
#[async_trait]
pub trait ResolutionStrategy: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// `Ok(None)` is a miss; the cascade continues either way.
    async fn attempt(
        &self,
        request: &ResolveRequest<'_>,
    ) -> Result<Option<ResolvedIdentity>, ResolveError>;
}

/// Runs `f` against a pooled connection on the blocking thread pool.
pub(crate) async fn with_conn<T, F>(pool: &DbPool, f: F) -> Result<T, ResolveError>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || -> Result<T, ResolveError> {
        let conn = pool.get()?;
        Ok(f(&conn)?)
    })
    .await?
}

/// Tunables for [`IdentityResolver::standard`].
#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub generic_tokens: Vec<String>,
    pub token_namespaces: Vec<String>,
    pub generic_window: Duration,
    pub phone_window: Duration,
    /// Applied to each tier and to the contact-name lookup.
    pub deadline: Duration,
    pub recent_scan_limit: usize,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            generic_tokens: vec!["test".to_string(), "unused".to_string()],
            token_namespaces: Vec::new(),
            generic_window: Duration::from_secs(60),
            phone_window: Duration::from_secs(600),
            deadline: Duration::from_secs(4),
            recent_scan_limit: 20,
        }
    }
}

pub struct IdentityResolver {
    strategies: Vec<Box<dyn ResolutionStrategy>>,
    pool: DbPool,
    directory: Option<Arc<dyn ChatDirectory>>,
    phone_window: Duration,
    deadline: Duration,
}

impl IdentityResolver {
    /// Builds a resolver over an explicit tier list.
    pub fn new(
        strategies: Vec<Box<dyn ResolutionStrategy>>,
        pool: DbPool,
        directory: Option<Arc<dyn ChatDirectory>>,
        phone_window: Duration,
        deadline: Duration,
    ) -> Self {
        Self {
            strategies,
            pool,
            directory,
            phone_window,
            deadline,
        }
    }

    /// The production cascade: generic-token queue, conversation search
    /// (when a chat directory is configured), token mapping, token pattern,
    /// payload.
    pub fn standard(
        pool: DbPool,
        directory: Option<Arc<dyn ChatDirectory>>,
        settings: &ResolverSettings,
    ) -> Self {
        let mut strategies: Vec<Box<dyn ResolutionStrategy>> = vec![Box::new(
            GenericTokenQueue::new(
                pool.clone(),
                settings.generic_tokens.iter().cloned(),
                settings.generic_window,
            ),
        )];
        if let Some(directory) = &directory {
            strategies.push(Box::new(ConversationSearch::new(
                directory.clone(),
                settings.recent_scan_limit,
            )));
        }
        strategies.push(Box::new(TokenMappingLookup::new(pool.clone())));
        strategies.push(Box::new(TokenPattern::new(settings.token_namespaces.clone())));
        strategies.push(Box::new(PayloadPhone));

        Self::new(
            strategies,
            pool,
            directory,
            settings.phone_window,
            settings.deadline,
        )
    }

    /// Runs the cascade. `None` when every tier missed.
    pub async fn resolve(&self, request: &ResolveRequest<'_>) -> Option<ResolvedIdentity> {
        let token = flowbridge_types::token_preview(request.flow_token);
        let mut found = None;

        for strategy in &self.strategies {
            match timeout(self.deadline, strategy.attempt(request)).await {
                Ok(Ok(Some(identity))) => {
                    tracing::info!(
                        tier = strategy.name(),
                        token = %token,
                        phone = %identity.phone_number,
                        "identity resolved"
                    );
                    found = Some(identity);
                    break;
                }
                Ok(Ok(None)) => {
                    tracing::debug!(tier = strategy.name(), token = %token, "tier missed");
                }
                Ok(Err(e)) => {
                    tracing::warn!(tier = strategy.name(), token = %token, "tier failed: {}", e);
                }
                Err(_) => {
                    tracing::warn!(
                        tier = strategy.name(),
                        token = %token,
                        deadline_ms = self.deadline.as_millis() as u64,
                        "tier timed out"
                    );
                }
            }
        }

        let Some(mut identity) = found else {
            tracing::warn!(token = %token, "no tier could resolve an identity");
            return None;
        };

        if identity.source != IdentitySource::Queue {
            self.claim_pending_entry(&mut identity, request.scope_id)
                .await;
        }
        if identity.display_name.is_none() {
            self.enrich_display_name(&mut identity).await;
        }

        Some(identity)
    }

    /// Marks the phone's pending entry consumed and borrows its name and
    /// conversation when the tier had none.
    async fn claim_pending_entry(&self, identity: &mut ResolvedIdentity, scope_id: ScopeId) {
        let phone = identity.phone_number.clone();
        let window = self.phone_window;
        let claimed = with_conn(&self.pool, move |conn| {
            consume_latest_for_phone(conn, &phone, scope_id, window)
        })
        .await;

        match claimed {
            Ok(Some(entry)) => {
                if identity.display_name.is_none() {
                    identity.display_name = entry.display_name.filter(|n| !n.trim().is_empty());
                }
                if identity.conversation_ref.is_none() {
                    identity.conversation_ref = entry.conversation_id;
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(phone = %identity.phone_number, "failed to claim pending entry: {}", e);
            }
        }
    }

    /// One contact lookup by phone. Failure leaves the name empty.
    async fn enrich_display_name(&self, identity: &mut ResolvedIdentity) {
        let Some(directory) = &self.directory else {
            return;
        };

        match timeout(
            self.deadline,
            directory.search_contacts(&identity.phone_number),
        )
        .await
        {
            Ok(Ok(contacts)) => {
                identity.display_name = contacts
                    .iter()
                    .find(|c| c.phone().as_deref() == Some(identity.phone_number.as_str()))
                    .and_then(|c| c.display_name());
            }
            Ok(Err(e)) => {
                tracing::warn!(phone = %identity.phone_number, "contact lookup failed: {}", e);
            }
            Err(_) => {
                tracing::warn!(phone = %identity.phone_number, "contact lookup timed out");
            }
        }
    }
}
