//! Shared fixtures for the server integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use flowbridge_crypto::{aead, flip_iv, CryptoChannel};
use flowbridge_db::{create_pool, run_migrations, DbPool, DbRuntimeSettings};
use flowbridge_server::collaborators::{
    ChatContact, ChatDirectory, ChatMessage, CollaboratorError, Conversation, ConversationMeta,
    MessageRelay,
};
use flowbridge_server::notify::Notifier;
use flowbridge_server::resolver::{IdentityResolver, ResolverSettings};
use flowbridge_server::{AppState, FlowSettings};
use flowbridge_store::ReapThrottle;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde_json::{json, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tower::ServiceExt;

pub const SCOPE: i64 = 1;

/// Key generation is slow in debug builds; share one key across tests.
pub fn private_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        RsaPrivateKey::new(&mut rand::thread_rng(), 1024).expect("key generation failed")
    })
}

/// File-backed pool so every pooled connection sees the same database.
pub fn test_pool() -> (tempfile::TempDir, DbPool) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("flowbridge.db");
    let pool = create_pool(
        path.to_str().expect("utf-8 path"),
        DbRuntimeSettings {
            busy_timeout_ms: 5_000,
            pool_max_size: 4,
        },
    )
    .expect("failed to create pool");
    run_migrations(&pool.get().expect("failed to get connection"))
        .expect("failed to run migrations");
    (dir, pool)
}

pub fn resolver_settings() -> ResolverSettings {
    ResolverSettings {
        deadline: Duration::from_millis(500),
        ..ResolverSettings::default()
    }
}

pub fn build_resolver(
    pool: &DbPool,
    directory: Option<Arc<FakeChatDirectory>>,
) -> IdentityResolver {
    let directory = directory.map(|d| d as Arc<dyn ChatDirectory>);
    IdentityResolver::standard(pool.clone(), directory, &resolver_settings())
}

/// Assembles an [`AppState`] around fakes. `with_key = false` leaves the
/// endpoint without a private key.
pub fn build_state(
    pool: &DbPool,
    with_key: bool,
    directory: Option<Arc<FakeChatDirectory>>,
    relay: Option<Arc<FakeRelay>>,
) -> AppState {
    let settings = FlowSettings::default();
    let notifier = Notifier::new(
        directory.clone().map(|d| d as Arc<dyn ChatDirectory>),
        relay.map(|r| r as Arc<dyn MessageRelay>),
        settings.confirmation_message.clone(),
        Duration::from_millis(500),
    );

    AppState {
        pool: pool.clone(),
        crypto: with_key.then(|| Arc::new(CryptoChannel::new(private_key().clone()))),
        resolver: Arc::new(build_resolver(pool, directory)),
        notifier: Arc::new(notifier),
        settings: Arc::new(settings),
        reap_throttle: Arc::new(ReapThrottle::new(Duration::from_secs(300))),
    }
}

/// Sends one request through the router and returns status and body.
pub async fn send(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, String) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

/// Plays the messaging platform's side of the envelope protocol.
pub struct Peer {
    key: [u8; 16],
    iv: [u8; 16],
}

impl Peer {
    pub fn new() -> Self {
        Self {
            key: rand::random(),
            iv: rand::random(),
        }
    }

    pub fn envelope(&self, body: &Value) -> Value {
        let public = RsaPublicKey::from(private_key());
        let wrapped = public
            .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), &self.key)
            .expect("wrap failed");
        let sealed = aead::seal(&self.key, &self.iv, body.to_string().as_bytes()).unwrap();
        json!({
            "encrypted_aes_key": BASE64.encode(wrapped),
            "encrypted_flow_data": BASE64.encode(sealed),
            "initial_vector": BASE64.encode(self.iv),
        })
    }

    pub fn open_response(&self, body: &str) -> Value {
        let raw = BASE64.decode(body.trim()).expect("response should be base64");
        let plaintext = aead::open(&self.key, &flip_iv(&self.iv), &raw)
            .expect("response should open under the inverted IV");
        serde_json::from_slice(&plaintext).unwrap()
    }
}

pub fn data_exchange(flow_token: &str, data: Value) -> Value {
    json!({
        "action": "data_exchange",
        "flow_token": flow_token,
        "version": "3.0",
        "data": data,
    })
}

pub fn count_rows(pool: &DbPool, table: &str) -> i64 {
    pool.get()
        .unwrap()
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .unwrap()
}

// ---------------------------------------------------------------------------
// Collaborator fakes
// ---------------------------------------------------------------------------

pub fn conversation(id: i64, phone: Option<&str>, name: Option<&str>) -> Conversation {
    Conversation {
        id,
        meta: ConversationMeta {
            sender: Some(ChatContact {
                name: name.map(str::to_string),
                phone_number: phone.map(str::to_string),
                identifier: None,
            }),
        },
    }
}

pub fn message(content: &str) -> ChatMessage {
    ChatMessage {
        content: Some(content.to_string()),
        content_attributes: Value::Null,
    }
}

#[derive(Default)]
pub struct FakeChatDirectory {
    pub search_results: HashMap<String, Vec<Conversation>>,
    pub recent: Vec<Conversation>,
    pub messages: HashMap<i64, Vec<ChatMessage>>,
    pub contacts: Vec<ChatContact>,
    pub fail_search: bool,
    pub search_delay: Option<Duration>,
    pub notes: Mutex<Vec<(i64, String)>>,
    pub message_fetches: Mutex<Vec<i64>>,
}

impl FakeChatDirectory {
    pub fn notes(&self) -> Vec<(i64, String)> {
        self.notes.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatDirectory for FakeChatDirectory {
    async fn search_conversations(
        &self,
        query: &str,
    ) -> Result<Vec<Conversation>, CollaboratorError> {
        if let Some(delay) = self.search_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_search {
            return Err(CollaboratorError::Upstream {
                status: 500,
                body: "search unavailable".to_string(),
            });
        }
        Ok(self.search_results.get(query).cloned().unwrap_or_default())
    }

    async fn recent_conversations(&self) -> Result<Vec<Conversation>, CollaboratorError> {
        Ok(self.recent.clone())
    }

    async fn conversation_messages(
        &self,
        conversation_id: i64,
    ) -> Result<Vec<ChatMessage>, CollaboratorError> {
        self.message_fetches.lock().unwrap().push(conversation_id);
        Ok(self.messages.get(&conversation_id).cloned().unwrap_or_default())
    }

    async fn search_contacts(&self, query: &str) -> Result<Vec<ChatContact>, CollaboratorError> {
        Ok(self
            .contacts
            .iter()
            .filter(|c| c.phone().as_deref() == Some(query))
            .cloned()
            .collect())
    }

    async fn post_private_note(
        &self,
        conversation_id: i64,
        content: &str,
    ) -> Result<(), CollaboratorError> {
        self.notes
            .lock()
            .unwrap()
            .push((conversation_id, content.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRelay {
    pub sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl MessageRelay for FakeRelay {
    async fn send_text(&self, to: &str, body: &str) -> Result<(), CollaboratorError> {
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), body.to_string()));
        Ok(())
    }
}

/// Polls `check` until it holds or a second has passed.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
