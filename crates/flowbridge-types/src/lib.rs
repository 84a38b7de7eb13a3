//! Shared types for the flowbridge workspace.
//!
//! This crate holds the protocol-level request and response shapes that
//! travel inside the encrypted envelope, the identity types produced by the
//! resolution cascade, and the phone-number normalization used on every
//! write and lookup path. No crate in the workspace depends on anything
//! *except* `flowbridge-types` for cross-cutting definitions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Tenant partition key isolating queue and mapping rows between deployments.
pub type ScopeId = i64;

/// Screen name returned to the messaging client after a successful submission.
pub const SUCCESS_SCREEN: &str = "SUCCESS_SCREEN";

/// Smallest digit count accepted as a phone number.
pub const MIN_PHONE_DIGITS: usize = 6;

/// Largest digit count accepted as a phone number (E.164 limit).
pub const MAX_PHONE_DIGITS: usize = 15;

/// Actions carried in the decrypted request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowAction {
    /// Health probe issued by the messaging platform.
    Ping,
    /// A form submission.
    DataExchange,
    /// Any action this backend does not handle.
    #[serde(other)]
    Unknown,
}

/// The plaintext request recovered from an encrypted envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecryptedRequest {
    pub action: FlowAction,
    /// Opaque correlation token, the only link to the earlier prompt.
    #[serde(default)]
    pub flow_token: String,
    /// Submitted form fields.
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default)]
    pub version: Option<String>,
}

impl DecryptedRequest {
    /// Returns the phone number embedded in the submitted payload, if any.
    pub fn payload_phone(&self) -> Option<&str> {
        self.data
            .get("phone_number")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// `{ "data": { "status": "active" } }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub data: StatusData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusData {
    pub status: String,
}

impl StatusResponse {
    /// The fixed payload answered to every ping.
    pub fn active() -> Self {
        Self {
            data: StatusData {
                status: "active".to_string(),
            },
        }
    }
}

/// `{ "screen": "SUCCESS_SCREEN", "data": { "confirmation_message": … } }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenResponse {
    pub screen: String,
    pub data: ConfirmationData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmationData {
    pub confirmation_message: String,
}

impl ScreenResponse {
    /// Builds the success screen shown after a data exchange.
    pub fn success(confirmation_message: impl Into<String>) -> Self {
        Self {
            screen: SUCCESS_SCREEN.to_string(),
            data: ConfirmationData {
                confirmation_message: confirmation_message.into(),
            },
        }
    }
}

/// Which tier of the resolution cascade produced an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    /// A pending "prompt dispatched" queue entry.
    Queue,
    /// Metadata of a chat conversation whose transcript contains the token.
    ConversationSearch,
    /// A previously recorded token→phone mapping.
    TokenMapping,
    /// Digits extracted from the token itself.
    TokenPattern,
    /// The phone number field of the submitted form.
    Payload,
}

impl IdentitySource {
    /// Returns the stable string stored alongside submissions.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::ConversationSearch => "conversation_search",
            Self::TokenMapping => "token_mapping",
            Self::TokenPattern => "token_pattern",
            Self::Payload => "payload",
        }
    }
}

impl fmt::Display for IdentitySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown identity source string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown identity source: {0}")]
pub struct ParseIdentitySourceError(pub String);

impl FromStr for IdentitySource {
    type Err = ParseIdentitySourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queue" => Ok(Self::Queue),
            "conversation_search" => Ok(Self::ConversationSearch),
            "token_mapping" => Ok(Self::TokenMapping),
            "token_pattern" => Ok(Self::TokenPattern),
            "payload" => Ok(Self::Payload),
            other => Err(ParseIdentitySourceError(other.to_string())),
        }
    }
}

/// The identity recovered for one submission.
///
/// Transient: it is folded into the submission record and never persisted
/// as its own entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    /// Normalized phone number (`+` followed by digits).
    pub phone_number: String,
    pub display_name: Option<String>,
    pub source: IdentitySource,
    /// Chat conversation the prompt was sent in, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_ref: Option<i64>,
}

impl ResolvedIdentity {
    pub fn new(phone_number: impl Into<String>, source: IdentitySource) -> Self {
        Self {
            phone_number: phone_number.into(),
            display_name: None,
            source,
            conversation_ref: None,
        }
    }

    pub fn with_display_name(mut self, name: Option<String>) -> Self {
        self.display_name = name.filter(|n| !n.trim().is_empty());
        self
    }

    pub fn with_conversation_ref(mut self, conversation_ref: Option<i64>) -> Self {
        self.conversation_ref = conversation_ref;
        self
    }
}

/// Normalizes a phone number to `+<digits>`.
///
/// Whitespace, dashes, dots and parentheses are dropped. Returns `None` if
/// anything else remains or the digit count falls outside
/// [`MIN_PHONE_DIGITS`]..=[`MAX_PHONE_DIGITS`].
pub fn normalize_phone(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '-' | '.' | '(' | ')'))
        .collect();
    let digits = cleaned.strip_prefix('+').unwrap_or(&cleaned);

    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if !(MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits.len()) {
        return None;
    }
    Some(format!("+{digits}"))
}

/// Shortens a flow token for log output.
pub fn token_preview(token: &str) -> String {
    const PREVIEW_CHARS: usize = 24;
    if token.chars().count() <= PREVIEW_CHARS {
        token.to_string()
    } else {
        let head: String = token.chars().take(PREVIEW_CHARS).collect();
        format!("{head}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identity_source_round_trip() {
        for source in [
            IdentitySource::Queue,
            IdentitySource::ConversationSearch,
            IdentitySource::TokenMapping,
            IdentitySource::TokenPattern,
            IdentitySource::Payload,
        ] {
            assert_eq!(source.as_str().parse::<IdentitySource>(), Ok(source));
        }
        assert!("chatwoot".parse::<IdentitySource>().is_err());
    }

    #[test]
    fn normalize_phone_variants() {
        assert_eq!(
            normalize_phone("+212 600-000.001").as_deref(),
            Some("+212600000001")
        );
        assert_eq!(
            normalize_phone("(212) 600000001").as_deref(),
            Some("+212600000001")
        );
        assert_eq!(normalize_phone("212600000001").as_deref(), Some("+212600000001"));
        assert_eq!(normalize_phone("unknown"), None);
        assert_eq!(normalize_phone("+"), None);
        assert_eq!(normalize_phone("12345"), None);
        assert_eq!(normalize_phone("1234567890123456"), None);
    }

    #[test]
    fn unknown_action_deserializes() {
        let req: DecryptedRequest = serde_json::from_value(json!({
            "action": "INIT",
            "flow_token": "abc",
            "version": "3.0"
        }))
        .expect("unknown actions should still parse");
        assert_eq!(req.action, FlowAction::Unknown);
        assert!(req.data.is_empty());
    }

    #[test]
    fn payload_phone_reads_string_field() {
        let req: DecryptedRequest = serde_json::from_value(json!({
            "action": "data_exchange",
            "flow_token": "abc",
            "data": { "phone_number": " +212600000009 ", "q1_rating": "5_etoiles" },
            "version": "3.0"
        }))
        .expect("request should parse");
        assert_eq!(req.action, FlowAction::DataExchange);
        assert_eq!(req.payload_phone(), Some("+212600000009"));
    }

    #[test]
    fn response_shapes() {
        assert_eq!(
            serde_json::to_value(StatusResponse::active()).unwrap(),
            json!({ "data": { "status": "active" } })
        );
        assert_eq!(
            serde_json::to_value(ScreenResponse::success("merci")).unwrap(),
            json!({ "screen": "SUCCESS_SCREEN", "data": { "confirmation_message": "merci" } })
        );
    }

    #[test]
    fn token_preview_truncates() {
        assert_eq!(token_preview("short"), "short");
        let long = "deepal-212600000002-aaaaaaaa-bbbb-cccc";
        assert!(token_preview(long).ends_with('…'));
    }
}
