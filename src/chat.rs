//! Chat messages and the template that flattens them into a single string

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// One turn of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }

    pub fn user(content: &str) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: &str) -> Self {
        Self::new("assistant", content)
    }
}

impl Display for ChatMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.role, self.content)
    }
}

/// How a conversation is rendered into text before tokenization
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatTemplate {
    /// Each message content prefixed by a single space, then the eos token.
    #[default]
    Concat,
    /// `### Role:\ncontent` blocks separated by blank lines, then the eos token.
    RoleHeaders,
}

impl ChatTemplate {
    /// Renders `messages` into a single string ending in `eos_token`.
    pub fn apply(&self, messages: &[ChatMessage], eos_token: &str) -> String {
        let mut rendered = String::new();
        match self {
            Self::Concat => {
                for message in messages {
                    rendered.push(' ');
                    rendered.push_str(&message.content);
                }
            }
            Self::RoleHeaders => {
                let blocks = messages
                    .iter()
                    .map(|m| format!("### {}:\n{}", capitalize(&m.role), m.content))
                    .join("\n\n");
                rendered.push_str(&blocks);
            }
        }
        rendered.push_str(eos_token);
        rendered
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[fixture]
    fn conversation() -> Vec<ChatMessage> {
        vec![
            ChatMessage::user("What is 2 + 2?"),
            ChatMessage::assistant("It is 4."),
        ]
    }

    #[rstest]
    fn test_concat_template(conversation: Vec<ChatMessage>) {
        let rendered = ChatTemplate::Concat.apply(&conversation, "<|endoftext|>");
        assert_eq!(rendered, " What is 2 + 2? It is 4.<|endoftext|>");
    }

    #[rstest]
    fn test_role_headers_template(conversation: Vec<ChatMessage>) {
        let rendered = ChatTemplate::RoleHeaders.apply(&conversation, "</s>");
        assert_eq!(
            rendered,
            "### User:\nWhat is 2 + 2?\n\n### Assistant:\nIt is 4.</s>"
        );
    }

    #[rstest]
    fn test_empty_conversation_renders_eos_only() {
        assert_eq!(ChatTemplate::Concat.apply(&[], "<eos>"), "<eos>");
    }

    #[rstest]
    fn test_chat_message_deserialize() -> anyhow::Result<()> {
        let msg: ChatMessage = serde_json::from_str(r#"{"role": "user", "content": "hi"}"#)?;
        assert_eq!(msg, ChatMessage::user("hi"));
        Ok(())
    }
}
