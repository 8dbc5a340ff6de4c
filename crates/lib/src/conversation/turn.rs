use async_trait::async_trait;

use super::{ConversationController, ErrorKind, TurnEnd};
use crate::stream::{StreamError, StreamHandler};
use crate::thread::ToolUse;

/// Applies one stream's events to the controller. Events from a stream the user already
/// stopped are dropped by the controller's turn check.
pub(super) struct TurnHandler {
    controller: ConversationController,
    turn: u64,
    thread_id: String,
    message_id: String,
    outcome: Option<TurnEnd>,
}

impl TurnHandler {
    pub(super) fn new(
        controller: ConversationController,
        turn: u64,
        thread_id: String,
        message_id: String,
    ) -> Self {
        Self {
            controller,
            turn,
            thread_id,
            message_id,
            outcome: None,
        }
    }

    pub(super) fn take_outcome(&mut self) -> Option<TurnEnd> {
        self.outcome.take()
    }
}

#[async_trait]
impl StreamHandler for TurnHandler {
    async fn on_text(&mut self, delta: &str, full: &str) {
        self.controller
            .apply_text(self.turn, &self.message_id, delta, full);
    }

    async fn on_tool_use(&mut self, tool_use: ToolUse) {
        log::info!(
            "conversation: model requested tool {} ({})",
            tool_use.name,
            tool_use.id
        );
        if self
            .controller
            .apply_tool_use(self.turn, &self.message_id, tool_use.clone())
            .await
        {
            self.outcome = Some(TurnEnd::ToolPending {
                thread_id: self.thread_id.clone(),
                message_id: self.message_id.clone(),
                tool_use,
            });
        }
    }

    async fn on_done(&mut self, full: &str, conversation_title: Option<String>) {
        if self
            .controller
            .apply_done(self.turn, &self.message_id, full, conversation_title.as_deref())
            .await
        {
            self.outcome = Some(TurnEnd::Done {
                thread_id: self.thread_id.clone(),
                message_id: self.message_id.clone(),
                title: conversation_title,
            });
        }
    }

    async fn on_error(&mut self, error: StreamError) {
        let kind = ErrorKind::from_stream_error(&error);
        log::warn!("conversation: turn failed ({:?}): {}", kind, error);
        if let Some(holder) = self
            .controller
            .apply_error(self.turn, &self.message_id, &kind)
            .await
        {
            self.outcome = Some(TurnEnd::Failed {
                thread_id: self.thread_id.clone(),
                message_id: holder,
                error: kind,
            });
        }
    }
}
