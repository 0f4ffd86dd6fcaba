//! Prompt construction: system prompt, retrieved context, history and the
//! user's text.

use crate::config::LlmConfig;
use crate::session::turn::{ConversationTurn, Role};
use serde::{Deserialize, Serialize};

/// Role of a chat message as understood by the model server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl From<Role> for MessageRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => Self::User,
            Role::Assistant => Self::Assistant,
        }
    }
}

/// A single message sent to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Wrap a query with its retrieved context.
pub fn format_user_message(context: &str, query: &str) -> String {
    format!(
        "Please answer based on the following context and query:\n[CONTEXT]\n{context}\n[QUERY]\n{query}"
    )
}

/// Build the message list for one generation.
///
/// Order: system prompt (extended with the context prompt when `context` is
/// non-empty), prior turns (unless history is disabled, trimmed to
/// `max_history_messages`), then the user's text, wrapped with the context
/// when there is any.
pub fn build_messages(
    config: &LlmConfig,
    history: &[ConversationTurn],
    context: &str,
    user_text: &str,
) -> Vec<ChatMessage> {
    let has_context = !context.trim().is_empty();

    let mut system = config.system_prompt.trim().to_owned();
    if has_context && !config.context_prompt.trim().is_empty() {
        if !system.is_empty() {
            system.push_str("\n\n");
        }
        system.push_str(config.context_prompt.trim());
    }

    let mut messages = Vec::with_capacity(history.len() + 2);
    if !system.is_empty() {
        messages.push(ChatMessage::new(MessageRole::System, system));
    }

    if !config.disable_chat_history {
        let max = config.max_history_messages;
        let skip = if max == 0 {
            0
        } else {
            history.len().saturating_sub(max)
        };
        messages.extend(
            history[skip..]
                .iter()
                .filter(|t| !t.text.is_empty())
                .map(|t| ChatMessage::new(t.role.into(), t.text.clone())),
        );
    }

    let content = if has_context {
        format_user_message(context, user_text)
    } else {
        user_text.to_owned()
    };
    messages.push(ChatMessage::new(MessageRole::User, content));
    messages
}
