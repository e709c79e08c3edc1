//! Legacy per-conversation settings that need rewriting on fetch.

use serde::Serialize;

use crate::model::{Conversation, ConversationId};

/// Renamed model identifiers, old to new.
const MODEL_RENAMES: &[(&str, &str)] = &[
    ("gpt-3.5-turbo", "gpt-4o-mini"),
    ("gpt-3.5-turbo-16k", "gpt-4o-mini"),
    ("gpt-4", "gpt-4o"),
    ("gpt-4-turbo", "gpt-4o"),
    ("gpt-4-turbo-preview", "gpt-4o"),
    ("gpt-4-32k", "gpt-4o"),
    ("claude-2", "claude-3-5-sonnet"),
    ("claude-instant-1", "claude-3-5-haiku"),
];

/// A corrected field value to write back to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConversationPatch {
    #[serde(skip)]
    pub id: ConversationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

pub fn current_model(model: &str) -> Option<&'static str> {
    MODEL_RENAMES
        .iter()
        .find(|(old, _)| *old == model)
        .map(|(_, new)| *new)
}

/// Rewrite legacy fields in place and return what changed.
pub fn migrate(conversations: &mut [Conversation]) -> Vec<ConversationPatch> {
    let mut patches = Vec::new();
    for conv in conversations.iter_mut() {
        let Some(model) = conv.model.as_deref() else {
            continue;
        };
        if let Some(renamed) = current_model(model) {
            conv.model = Some(renamed.to_string());
            patches.push(ConversationPatch {
                id: conv.id.clone(),
                model: Some(renamed.to_string()),
            });
        }
    }
    patches
}
