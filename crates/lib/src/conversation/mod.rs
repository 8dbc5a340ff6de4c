//! Conversation turn state machine.
//!
//! One [`ConversationController`] runs at most one turn at a time. A turn moves
//! `Idle -> Sending -> Streaming -> (ToolPending <-> Streaming) -> Idle`; errors and user stops
//! return straight to `Idle`. Every exit path persists the assistant message and its thread.

mod controller;
mod error;
mod turn;

use serde::Serialize;
use serde_json::{json, Value};

pub use controller::{ConversationController, PendingTool, StateDump, TextDelta};
pub use error::{ControllerError, ErrorKind};

use crate::context::SpaceContext;
use crate::thread::{ChatMode, ContentBlock, ToolUse};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    Idle,
    Sending,
    Streaming,
    ToolPending,
}

/// Input to [`ConversationController::send_message`].
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub content: ContentBlock,
    /// Unknown or absent ids start a new thread.
    pub thread_id: Option<String>,
    pub mode: ChatMode,
    pub context: SpaceContext,
    /// Falls back to the configured default model.
    pub model: Option<String>,
}

impl SendRequest {
    pub fn text(text: impl Into<String>, mode: ChatMode, context: SpaceContext) -> Self {
        Self {
            content: ContentBlock::text(text),
            thread_id: None,
            mode,
            context,
            model: None,
        }
    }

    pub fn in_thread(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = Some(thread_id.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// Why a send was a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Another stream is open on this controller.
    Busy,
    EmptyMessage,
    /// Only text and tool_result blocks can be sent.
    UnsupportedContent,
    /// The tool result does not answer the pending tool call.
    StaleToolResult,
}

/// How a turn's stream ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEnd {
    Done {
        thread_id: String,
        message_id: String,
        title: Option<String>,
    },
    ToolPending {
        thread_id: String,
        message_id: String,
        tool_use: ToolUse,
    },
    Failed {
        thread_id: String,
        /// Message holding the user-facing error text.
        message_id: String,
        error: ErrorKind,
    },
    Stopped {
        thread_id: String,
        message_id: String,
    },
}

impl TurnEnd {
    pub fn thread_id(&self) -> &str {
        match self {
            TurnEnd::Done { thread_id, .. }
            | TurnEnd::ToolPending { thread_id, .. }
            | TurnEnd::Failed { thread_id, .. }
            | TurnEnd::Stopped { thread_id, .. } => thread_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Rejected(RejectReason),
    Finished(TurnEnd),
}

/// Normalize a raw tool output into `{status, message, data}`. Payloads that already carry a
/// `status` pass through unchanged.
pub fn tool_result_envelope(payload: Value) -> Value {
    if is_truthy(payload.get("status")) {
        return payload;
    }
    let error_text = payload
        .get("error")
        .filter(|e| is_truthy(Some(e)))
        .map(|err| match err {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
    match error_text {
        Some(text) => {
            json!({ "status": "error", "message": format!("Error: {}", text), "data": payload })
        }
        None => json!({ "status": "success", "message": "Tool executed successfully", "data": payload }),
    }
}

fn is_truthy(v: Option<&Value>) -> bool {
    match v {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_wraps_raw_output() {
        let v = tool_result_envelope(json!({ "page": 3 }));
        assert_eq!(v["status"], "success");
        assert_eq!(v["message"], "Tool executed successfully");
        assert_eq!(v["data"]["page"], 3);

        let v = tool_result_envelope(json!({ "error": "window closed" }));
        assert_eq!(v["status"], "error");
        assert_eq!(v["message"], "Error: window closed");
    }

    #[test]
    fn envelope_passes_structured_payload() {
        let payload = json!({ "status": "error", "message": "No PDF windows found", "data": null });
        assert_eq!(tool_result_envelope(payload.clone()), payload);
    }

    #[test]
    fn envelope_for_non_object_payload() {
        let v = tool_result_envelope(json!("plain text"));
        assert_eq!(v["status"], "success");
        assert_eq!(v["data"], "plain text");
    }
}
