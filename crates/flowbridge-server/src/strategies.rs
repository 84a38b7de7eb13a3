//! The tiers of the identity resolution cascade, in cascade order.

use async_trait::async_trait;
use flowbridge_db::DbPool;
use flowbridge_store::{consume_latest_any, phone_for_token};
use flowbridge_types::{normalize_phone, IdentitySource, ResolvedIdentity};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::collaborators::{ChatDirectory, Conversation};
use crate::resolver::{with_conn, ResolutionStrategy, ResolveError, ResolveRequest};

/// Placeholder tokens claim the newest pending entry in the scope.
pub struct GenericTokenQueue {
    pool: DbPool,
    tokens: HashSet<String>,
    window: Duration,
}

impl GenericTokenQueue {
    pub fn new(pool: DbPool, tokens: impl IntoIterator<Item = String>, window: Duration) -> Self {
        Self {
            pool,
            tokens: tokens.into_iter().collect(),
            window,
        }
    }
}

#[async_trait]
impl ResolutionStrategy for GenericTokenQueue {
    fn name(&self) -> &'static str {
        "generic_token_queue"
    }

    async fn attempt(
        &self,
        request: &ResolveRequest<'_>,
    ) -> Result<Option<ResolvedIdentity>, ResolveError> {
        if !self.tokens.contains(request.flow_token) {
            return Ok(None);
        }

        let scope_id = request.scope_id;
        let window = self.window;
        let entry = with_conn(&self.pool, move |conn| {
            consume_latest_any(conn, scope_id, window)
        })
        .await?;

        Ok(entry.map(|entry| {
            ResolvedIdentity::new(entry.phone_number, IdentitySource::Queue)
                .with_display_name(entry.display_name)
                .with_conversation_ref(entry.conversation_id)
        }))
    }
}

/// Finds the conversation in which the token was sent.
///
/// Search first; when no match carries a phone, scan the newest
/// conversations' messages for the token.
pub struct ConversationSearch {
    directory: Arc<dyn ChatDirectory>,
    recent_scan_limit: usize,
}

impl ConversationSearch {
    pub fn new(directory: Arc<dyn ChatDirectory>, recent_scan_limit: usize) -> Self {
        Self {
            directory,
            recent_scan_limit,
        }
    }

    async fn scan_recent(&self, flow_token: &str) -> Result<Option<ResolvedIdentity>, ResolveError> {
        let recent = self.directory.recent_conversations().await?;

        for conversation in recent.iter().take(self.recent_scan_limit) {
            if identity_from(conversation).is_none() {
                continue;
            }
            let messages = match self.directory.conversation_messages(conversation.id).await {
                Ok(messages) => messages,
                Err(e) => {
                    tracing::debug!(
                        conversation_id = conversation.id,
                        "skipping conversation, messages unavailable: {}",
                        e
                    );
                    continue;
                }
            };
            if messages.iter().any(|m| m.mentions(flow_token)) {
                return Ok(identity_from(conversation));
            }
        }

        Ok(None)
    }
}

fn identity_from(conversation: &Conversation) -> Option<ResolvedIdentity> {
    let sender = conversation.sender()?;
    let phone = sender.phone()?;
    Some(
        ResolvedIdentity::new(phone, IdentitySource::ConversationSearch)
            .with_display_name(sender.display_name())
            .with_conversation_ref(Some(conversation.id)),
    )
}

#[async_trait]
impl ResolutionStrategy for ConversationSearch {
    fn name(&self) -> &'static str {
        "conversation_search"
    }

    async fn attempt(
        &self,
        request: &ResolveRequest<'_>,
    ) -> Result<Option<ResolvedIdentity>, ResolveError> {
        if request.flow_token.trim().is_empty() {
            return Ok(None);
        }

        let matches = self.directory.search_conversations(request.flow_token).await?;
        if let Some(identity) = matches.iter().find_map(identity_from) {
            return Ok(Some(identity));
        }
        if !matches.is_empty() {
            tracing::debug!(
                count = matches.len(),
                "matching conversations carry no phone, scanning recent conversations"
            );
        }

        self.scan_recent(request.flow_token).await
    }
}

/// Durable token→phone mappings.
pub struct TokenMappingLookup {
    pool: DbPool,
}

impl TokenMappingLookup {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResolutionStrategy for TokenMappingLookup {
    fn name(&self) -> &'static str {
        "token_mapping"
    }

    async fn attempt(
        &self,
        request: &ResolveRequest<'_>,
    ) -> Result<Option<ResolvedIdentity>, ResolveError> {
        if request.flow_token.is_empty() {
            return Ok(None);
        }

        let token = request.flow_token.to_string();
        let scope_id = request.scope_id;
        let mapping =
            with_conn(&self.pool, move |conn| phone_for_token(conn, &token, scope_id)).await?;

        Ok(mapping.map(|m| {
            ResolvedIdentity::new(m.phone_number, IdentitySource::TokenMapping)
                .with_display_name(m.display_name)
        }))
    }
}

/// Phone digits embedded in the token itself.
pub struct TokenPattern {
    namespaces: Vec<String>,
}

impl TokenPattern {
    /// `namespaces` lists accepted `<namespace>-<digits>-<rest>` prefixes;
    /// empty accepts any.
    pub fn new(namespaces: Vec<String>) -> Self {
        Self { namespaces }
    }
}

#[async_trait]
impl ResolutionStrategy for TokenPattern {
    fn name(&self) -> &'static str {
        "token_pattern"
    }

    async fn attempt(
        &self,
        request: &ResolveRequest<'_>,
    ) -> Result<Option<ResolvedIdentity>, ResolveError> {
        Ok(extract_phone_from_token(request.flow_token, &self.namespaces)
            .map(|phone| ResolvedIdentity::new(phone, IdentitySource::TokenPattern)))
    }
}

/// The `phone_number` field of the submitted form.
pub struct PayloadPhone;

#[async_trait]
impl ResolutionStrategy for PayloadPhone {
    fn name(&self) -> &'static str {
        "payload"
    }

    async fn attempt(
        &self,
        request: &ResolveRequest<'_>,
    ) -> Result<Option<ResolvedIdentity>, ResolveError> {
        Ok(request
            .payload_phone
            .and_then(normalize_phone)
            .map(|phone| ResolvedIdentity::new(phone, IdentitySource::Payload)))
    }
}

/// Digit-run bounds for the permissive scan.
const SCAN_MIN_DIGITS: usize = 10;
const SCAN_MAX_DIGITS: usize = 15;

/// Extracts a normalized phone from a flow token.
///
/// `<namespace>-<digits>-<rest>` yields the digits segment when the
/// namespace is accepted. Otherwise the first run of at least 10 digits
/// (optionally `+`-prefixed) is taken, capped at 15 digits.
pub fn extract_phone_from_token(token: &str, namespaces: &[String]) -> Option<String> {
    let mut parts = token.splitn(3, '-');
    if let (Some(namespace), Some(digits), Some(_rest)) = (parts.next(), parts.next(), parts.next())
    {
        let accepted = namespaces.is_empty()
            || namespaces
                .iter()
                .any(|n| n.eq_ignore_ascii_case(namespace));
        if accepted && !namespace.is_empty() {
            if let Some(phone) = normalize_phone(digits) {
                return Some(phone);
            }
        }
    }

    scan_digit_run(token)
}

fn scan_digit_run(token: &str) -> Option<String> {
    let bytes = token.as_bytes();
    let mut start = 0;
    while start < bytes.len() {
        if !bytes[start].is_ascii_digit() {
            start += 1;
            continue;
        }
        let run = bytes[start..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count();
        if run >= SCAN_MIN_DIGITS {
            let digits = &token[start..start + run.min(SCAN_MAX_DIGITS)];
            return normalize_phone(digits);
        }
        start += run;
    }
    None
}
