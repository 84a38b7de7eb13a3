//! Fire-and-forget notifications after a submission.
//!
//! Two side effects, each spawned on its own task and bounded by a
//! deadline: a private note on the user's chat conversation listing the
//! submitted fields, and a confirmation message through the relay. Neither
//! can affect the response already computed for the submission.

use flowbridge_types::ResolvedIdentity;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::collaborators::{ChatDirectory, MessageRelay};

pub struct Notifier {
    directory: Option<Arc<dyn ChatDirectory>>,
    relay: Option<Arc<dyn MessageRelay>>,
    confirmation_message: String,
    deadline: Duration,
}

impl Notifier {
    pub fn new(
        directory: Option<Arc<dyn ChatDirectory>>,
        relay: Option<Arc<dyn MessageRelay>>,
        confirmation_message: impl Into<String>,
        deadline: Duration,
    ) -> Self {
        Self {
            directory,
            relay,
            confirmation_message: confirmation_message.into(),
            deadline,
        }
    }

    /// Spawns the annotation and confirmation tasks. The returned handles
    /// are only useful to tests; production callers drop them.
    pub fn dispatch(
        &self,
        identity: &ResolvedIdentity,
        answers: &Map<String, Value>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        if let Some(directory) = self.directory.clone() {
            let identity = identity.clone();
            let note = format_annotation(answers);
            let deadline = self.deadline;
            handles.push(tokio::spawn(async move {
                match timeout(deadline, annotate(directory.as_ref(), &identity, &note)).await {
                    Ok(Ok(Some(conversation_id))) => {
                        tracing::info!(conversation_id, "submission posted to conversation");
                    }
                    Ok(Ok(None)) => {
                        tracing::warn!(
                            phone = %identity.phone_number,
                            "no conversation found for submission note"
                        );
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(
                            phone = %identity.phone_number,
                            "failed to post submission note: {}",
                            e
                        );
                    }
                    Err(_) => {
                        tracing::warn!(phone = %identity.phone_number, "submission note timed out");
                    }
                }
            }));
        }

        if let Some(relay) = self.relay.clone() {
            let to = identity.phone_number.clone();
            let body = self.confirmation_message.clone();
            let deadline = self.deadline;
            handles.push(tokio::spawn(async move {
                match timeout(deadline, relay.send_text(&to, &body)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(phone = %to, "confirmation message failed: {}", e),
                    Err(_) => tracing::warn!(phone = %to, "confirmation message timed out"),
                }
            }));
        }

        handles
    }
}

/// Posts `note` on the identity's conversation, locating it by phone when
/// the identity carries no conversation reference.
async fn annotate(
    directory: &dyn ChatDirectory,
    identity: &ResolvedIdentity,
    note: &str,
) -> Result<Option<i64>, crate::collaborators::CollaboratorError> {
    let conversation_id = match identity.conversation_ref {
        Some(id) => Some(id),
        None => directory
            .search_conversations(&identity.phone_number)
            .await?
            .into_iter()
            .find(|c| {
                c.sender().and_then(|s| s.phone()).as_deref()
                    == Some(identity.phone_number.as_str())
            })
            .map(|c| c.id),
    };

    let Some(conversation_id) = conversation_id else {
        return Ok(None);
    };
    directory.post_private_note(conversation_id, note).await?;
    Ok(Some(conversation_id))
}

/// Renders the submitted fields as `key: value` lines.
pub fn format_annotation(answers: &Map<String, Value>) -> String {
    answers
        .iter()
        .map(|(key, value)| match value {
            Value::String(s) => format!("{key}: {s}"),
            Value::Null => format!("{key}:"),
            other => format!("{key}: {other}"),
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn annotation_lists_fields_verbatim() {
        let answers = match json!({
            "q1_rating": "5_etoiles",
            "q1_comment": "parfait",
            "q5_score": 9,
            "final_comments": null
        }) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let note = format_annotation(&answers);
        let lines: Vec<&str> = note.lines().collect();
        assert!(lines.contains(&"q1_rating: 5_etoiles"));
        assert!(lines.contains(&"q1_comment: parfait"));
        assert!(lines.contains(&"q5_score: 9"));
        assert!(lines.contains(&"final_comments:"));
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn empty_answers_render_nothing() {
        assert_eq!(format_annotation(&Map::new()), "");
    }
}
