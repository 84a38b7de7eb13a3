//! Outbound collaborators: the chat platform and the messaging relay.
//!
//! Both sit behind async traits so the resolver and the notification path
//! can be exercised against in-process fakes. The reqwest implementations
//! carry a request timeout; callers additionally wrap every call in
//! `tokio::time::timeout`.

use async_trait::async_trait;
use flowbridge_types::normalize_phone;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

use crate::config::{ChatConfig, RelayConfig};

/// Errors from a collaborator call. Never fatal to a request.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },
}

// ---------------------------------------------------------------------------
// Chat platform wire types
// ---------------------------------------------------------------------------

/// A conversation as listed by the chat platform.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Conversation {
    pub id: i64,
    #[serde(default)]
    pub meta: ConversationMeta,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConversationMeta {
    #[serde(default)]
    pub sender: Option<ChatContact>,
}

/// A contact record, either standalone or as a conversation's sender.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatContact {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub identifier: Option<String>,
}

impl ChatContact {
    /// Normalized phone from `phone_number`, falling back to `identifier`.
    pub fn phone(&self) -> Option<String> {
        self.phone_number
            .as_deref()
            .and_then(normalize_phone)
            .or_else(|| self.identifier.as_deref().and_then(normalize_phone))
    }

    pub fn display_name(&self) -> Option<String> {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
    }
}

impl Conversation {
    pub fn sender(&self) -> Option<&ChatContact> {
        self.meta.sender.as_ref()
    }
}

/// A message inside a conversation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub content_attributes: Value,
}

impl ChatMessage {
    /// Whether the text or the structured attributes contain `needle`.
    pub fn mentions(&self, needle: &str) -> bool {
        if self.content.as_deref().is_some_and(|c| c.contains(needle)) {
            return true;
        }
        !self.content_attributes.is_null() && self.content_attributes.to_string().contains(needle)
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Read and annotate access to the chat platform.
#[async_trait]
pub trait ChatDirectory: Send + Sync {
    /// Full-text conversation search.
    async fn search_conversations(&self, query: &str)
        -> Result<Vec<Conversation>, CollaboratorError>;

    /// The most recent conversations, newest first.
    async fn recent_conversations(&self) -> Result<Vec<Conversation>, CollaboratorError>;

    async fn conversation_messages(
        &self,
        conversation_id: i64,
    ) -> Result<Vec<ChatMessage>, CollaboratorError>;

    async fn search_contacts(&self, query: &str) -> Result<Vec<ChatContact>, CollaboratorError>;

    /// Posts a note visible to agents only.
    async fn post_private_note(
        &self,
        conversation_id: i64,
        content: &str,
    ) -> Result<(), CollaboratorError>;
}

/// Outbound text messages to end users.
#[async_trait]
pub trait MessageRelay: Send + Sync {
    async fn send_text(&self, to: &str, body: &str) -> Result<(), CollaboratorError>;
}

// ---------------------------------------------------------------------------
// Reqwest implementations
// ---------------------------------------------------------------------------

fn build_http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("flowbridge/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default()
}

async fn read_json(resp: reqwest::Response) -> Result<Value, CollaboratorError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(CollaboratorError::Upstream {
            status: status.as_u16(),
            body,
        });
    }
    Ok(resp.json().await?)
}

/// Pulls the item list out of a chat platform response. Lists arrive as
/// `{"payload": [...]}`, `{"data": {"payload": [...]}}` or a bare array.
/// Items that do not deserialize are skipped.
fn payload_items<T: DeserializeOwned>(body: Value) -> Vec<T> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("payload") {
            Some(Value::Array(items)) => items,
            _ => match map.remove("data") {
                Some(Value::Object(mut data)) => match data.remove("payload") {
                    Some(Value::Array(items)) => items,
                    _ => Vec::new(),
                },
                _ => Vec::new(),
            },
        },
        _ => Vec::new(),
    };

    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::debug!("skipping unparseable chat payload item: {}", e);
                None
            }
        })
        .collect()
}

/// Chat platform REST client (`api_access_token` header auth).
pub struct ChatApiClient {
    client: reqwest::Client,
    accounts_url: String,
    access_token: String,
}

impl ChatApiClient {
    pub fn new(
        base_url: &str,
        account_id: i64,
        access_token: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client: build_http_client(timeout),
            accounts_url: format!(
                "{}/api/v1/accounts/{}",
                base_url.trim_end_matches('/'),
                account_id
            ),
            access_token: access_token.into(),
        }
    }

    /// Builds a client from config, or `None` when the chat platform is not
    /// configured.
    pub fn from_config(config: &ChatConfig, timeout: Duration) -> Option<Self> {
        let base_url = config.base_url.as_deref().filter(|u| !u.trim().is_empty())?;
        let token = config
            .access_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())?;
        Some(Self::new(base_url, config.account_id, token, timeout))
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value, CollaboratorError> {
        let resp = self
            .client
            .get(format!("{}/{}", self.accounts_url, path))
            .header("api_access_token", &self.access_token)
            .query(query)
            .send()
            .await?;
        read_json(resp).await
    }
}

#[async_trait]
impl ChatDirectory for ChatApiClient {
    async fn search_conversations(
        &self,
        query: &str,
    ) -> Result<Vec<Conversation>, CollaboratorError> {
        let body = self
            .get("conversations/search", &[("q", query), ("page", "1")])
            .await?;
        Ok(payload_items(body))
    }

    async fn recent_conversations(&self) -> Result<Vec<Conversation>, CollaboratorError> {
        let body = self
            .get("conversations", &[("status", "all"), ("page", "1")])
            .await?;
        Ok(payload_items(body))
    }

    async fn conversation_messages(
        &self,
        conversation_id: i64,
    ) -> Result<Vec<ChatMessage>, CollaboratorError> {
        let body = self
            .get(&format!("conversations/{conversation_id}/messages"), &[])
            .await?;
        Ok(payload_items(body))
    }

    async fn search_contacts(&self, query: &str) -> Result<Vec<ChatContact>, CollaboratorError> {
        let body = self.get("contacts/search", &[("q", query)]).await?;
        Ok(payload_items(body))
    }

    async fn post_private_note(
        &self,
        conversation_id: i64,
        content: &str,
    ) -> Result<(), CollaboratorError> {
        let resp = self
            .client
            .post(format!(
                "{}/conversations/{}/messages",
                self.accounts_url, conversation_id
            ))
            .header("api_access_token", &self.access_token)
            .json(&json!({
                "content": content,
                "message_type": "outgoing",
                "private": true
            }))
            .send()
            .await?;
        read_json(resp).await?;
        Ok(())
    }
}

/// Cloud messaging API relay (bearer token auth).
pub struct CloudApiRelay {
    client: reqwest::Client,
    messages_url: String,
    access_token: String,
}

impl CloudApiRelay {
    pub fn new(
        base_url: &str,
        phone_number_id: &str,
        access_token: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client: build_http_client(timeout),
            messages_url: format!(
                "{}/{}/messages",
                base_url.trim_end_matches('/'),
                phone_number_id
            ),
            access_token: access_token.into(),
        }
    }

    /// Builds a relay from config, or `None` when it is not configured.
    pub fn from_config(config: &RelayConfig, timeout: Duration) -> Option<Self> {
        let base_url = config.base_url.as_deref().filter(|u| !u.trim().is_empty())?;
        let phone_number_id = config
            .phone_number_id
            .as_deref()
            .filter(|p| !p.trim().is_empty())?;
        let token = config
            .access_token
            .as_deref()
            .filter(|t| !t.trim().is_empty())?;
        Some(Self::new(base_url, phone_number_id, token, timeout))
    }
}

#[async_trait]
impl MessageRelay for CloudApiRelay {
    async fn send_text(&self, to: &str, body: &str) -> Result<(), CollaboratorError> {
        let resp = self
            .client
            .post(&self.messages_url)
            .bearer_auth(&self.access_token)
            .json(&json!({
                "messaging_product": "whatsapp",
                "to": to,
                "type": "text",
                "text": { "body": body }
            }))
            .send()
            .await?;
        let result = read_json(resp).await?;
        tracing::info!(
            message_id = result["messages"][0]["id"].as_str().unwrap_or("<unknown>"),
            "relay message sent"
        );
        Ok(())
    }
}
