//! Conversation threads and messages.
//!
//! A thread is an ordered list of message ids in one chat mode. A message carries an ordered
//! list of content blocks (text, tool use, tool result). Both are mirrored to the entity
//! persistence collaborator (`crate::persist`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Placeholder text used when a stopped message would otherwise have no content.
pub const STOPPED_PLACEHOLDER: &str = "[Generation stopped]";

/// Chat mode; one thread is current per mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatMode {
    Chat,
    Create,
    Editor,
    Exp1,
}

impl ChatMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatMode::Chat => "chat",
            ChatMode::Create => "create",
            ChatMode::Editor => "editor",
            ChatMode::Exp1 => "exp1",
        }
    }

    /// Display name for a thread created explicitly ("new chat") in this mode.
    pub fn default_thread_name(&self) -> &'static str {
        match self {
            ChatMode::Chat => "New Chat",
            ChatMode::Create => "New Conversation",
            ChatMode::Editor => "New Document",
            ChatMode::Exp1 => "New Experiment",
        }
    }
}

impl fmt::Display for ChatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ChatMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chat" => Ok(ChatMode::Chat),
            "create" => Ok(ChatMode::Create),
            "editor" => Ok(ChatMode::Editor),
            "exp1" => Ok(ChatMode::Exp1),
            other => Err(format!("unknown chat mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Assistant,
}

/// A tool invocation requested by the model mid-stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub input: serde_json::Value,
}

/// One block of message content. Wire shape: `{ "type": "text" | "tool_use" | "tool_result", ... }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse(ToolUse),
    ToolResult { tool_use_id: String, content: String },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        ContentBlock::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
        }
    }
}

/// Opaque entity id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Conversation container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    pub user_id: String,
    pub mode: ChatMode,
    pub name: String,
    pub message_ids: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl Thread {
    pub fn new(user_id: impl Into<String>, mode: ChatMode, name: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            user_id: user_id.into(),
            mode,
            name: name.into(),
            message_ids: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Append a message id unless it is already linked. Returns true if it was added.
    pub fn link(&mut self, message_id: &str) -> bool {
        if self.message_ids.iter().any(|id| id == message_id) {
            return false;
        }
        self.message_ids.push(message_id.to_string());
        true
    }
}

/// A single message in a thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub user_id: String,
    pub sender: Sender,
    pub content: Vec<ContentBlock>,
    pub thread_id: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        user_id: impl Into<String>,
        sender: Sender,
        content: Vec<ContentBlock>,
        thread_id: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            user_id: user_id.into(),
            sender,
            content,
            thread_id: thread_id.into(),
            created_at: Utc::now(),
        }
    }

    pub fn user(user_id: &str, block: ContentBlock, thread_id: &str) -> Self {
        Self::new(user_id, Sender::User, vec![block], thread_id)
    }

    /// Empty assistant message that streaming fills in.
    pub fn assistant_placeholder(user_id: &str, thread_id: &str) -> Self {
        Self::new(user_id, Sender::Assistant, Vec::new(), thread_id)
    }

    /// Replace the message's single text block with `full`, inserting it first if absent.
    pub fn set_text(&mut self, full: &str) {
        for block in self.content.iter_mut() {
            if let ContentBlock::Text { text } = block {
                *text = full.to_string();
                return;
            }
        }
        self.content.insert(0, ContentBlock::text(full));
    }

    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_uses(&self) -> impl Iterator<Item = &ToolUse> {
        self.content.iter().filter_map(|b| match b {
            ContentBlock::ToolUse(t) => Some(t),
            _ => None,
        })
    }

    pub fn tool_result_ids(&self) -> impl Iterator<Item = &str> {
        self.content.iter().filter_map(|b| match b {
            ContentBlock::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
            _ => None,
        })
    }

    /// Drop tool_use blocks whose id is not in `answered`. Returns how many were removed.
    pub fn strip_unanswered_tool_uses(&mut self, answered: &[String]) -> usize {
        let before = self.content.len();
        self.content.retain(|b| match b {
            ContentBlock::ToolUse(t) => answered.iter().any(|id| id == &t.id),
            _ => true,
        });
        before - self.content.len()
    }
}
