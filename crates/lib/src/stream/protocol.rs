//! Wire types for the streaming generation endpoint.
//!
//! The response is NDJSON: one `{ "type": ..., ... }` record per line. Only `text`, `tool_use`,
//! `done` and `error` matter; the rest are advisory and ignored.

use serde::{Deserialize, Serialize};

use crate::context::SpaceContext;
use crate::thread::{ContentBlock, Message, Sender, ToolUse};
use crate::tools::ToolDefinition;

/// Line marker the provider emits under backpressure. Checked before JSON parsing.
pub const OVERLOAD_MARKER: &str = "overloaded_error";

/// One event record from the stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Text {
        #[serde(default)]
        content: String,
    },
    ToolUse {
        content: ToolUse,
    },
    Done {
        #[serde(default)]
        conversation_title: Option<String>,
    },
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    MessageStart,
    ContentBlockStart,
    ContentBlockStop,
    MessageDelta,
    MessageStop,
    Ping,
    /// Any type this client does not know about.
    #[serde(other)]
    Unknown,
}

/// Which endpoint a request goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// Fresh user query.
    Query,
    /// Continuation carrying a tool result.
    ToolOutput,
}

/// One prior message in the request's conversation history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryMessage {
    pub role: Sender,
    pub content: Vec<ContentBlock>,
}

impl HistoryMessage {
    /// None for messages with no content (e.g. an unfilled assistant placeholder).
    pub fn from_message(message: &Message) -> Option<Self> {
        if message.content.is_empty() {
            return None;
        }
        Some(Self {
            role: message.sender,
            content: message.content.clone(),
        })
    }
}

/// Request body for both endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub context: SpaceContext,
    pub conversation_history: Vec<HistoryMessage>,
    pub tools: Vec<ToolDefinition>,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

impl GenerationRequest {
    /// Build the body for a text or tool_result block. None for tool_use blocks, which are
    /// never sent by the client.
    pub fn for_block(
        block: &ContentBlock,
        context: SpaceContext,
        conversation_history: Vec<HistoryMessage>,
        tools: Vec<ToolDefinition>,
        model: impl Into<String>,
    ) -> Option<Self> {
        let mut req = Self {
            context,
            conversation_history,
            tools,
            model: model.into(),
            query: None,
            output: None,
            tool_use_id: None,
            stream: None,
        };
        match block {
            ContentBlock::Text { text } => req.query = Some(text.clone()),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
            } => {
                req.output = Some(content.clone());
                req.tool_use_id = Some(tool_use_id.clone());
                req.stream = Some(true);
            }
            ContentBlock::ToolUse(_) => return None,
        }
        Some(req)
    }

    pub fn endpoint(&self) -> EndpointKind {
        if self.tool_use_id.is_some() {
            EndpointKind::ToolOutput
        } else {
            EndpointKind::Query
        }
    }
}
