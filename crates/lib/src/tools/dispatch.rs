//! Runs the pending tool call and feeds its output back into the conversation.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::context::{ContextStore, SpaceContext};
use crate::conversation::{ControllerError, ConversationController, SendOutcome};
use crate::window::WindowTargetResolver;

/// Executes a tool against the host application. Returns the tool's raw output.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, tool_name: &str, input: Value, context: &SpaceContext) -> Result<Value, String>;
}

/// Tools whose success changes what a window shows.
pub fn changes_content(tool_name: &str) -> bool {
    let lower = tool_name.to_ascii_lowercase();
    lower.starts_with("docs_open")
        || lower.starts_with("pdf_open")
        || lower.contains("create")
        || lower.contains("edit")
}

#[derive(Clone)]
pub struct ToolDispatcher {
    executor: Arc<dyn CommandExecutor>,
    resolver: WindowTargetResolver,
}

impl ToolDispatcher {
    pub fn new(executor: Arc<dyn CommandExecutor>, resolver: WindowTargetResolver) -> Self {
        Self { executor, resolver }
    }

    pub fn resolver(&self) -> &WindowTargetResolver {
        &self.resolver
    }

    /// Execute the controller's pending tool call and continue the thread with its result.
    /// Returns None when nothing was pending or the user stopped the turn while the tool ran.
    pub async fn run_pending(
        &self,
        controller: &ConversationController,
        context_store: &ContextStore,
        model: Option<String>,
    ) -> Result<Option<SendOutcome>, ControllerError> {
        let Some(pending) = controller.pending_tool() else {
            return Ok(None);
        };
        let tool = pending.tool_use;
        let context = context_store.snapshot();
        let registry = context_store.registry();
        let active_window = registry.active_window_id();
        let targeting = self.resolver.enhance_tool_input(
            &tool.name,
            &tool.input,
            &context,
            registry.as_ref(),
            active_window.as_deref(),
            Some(context.space_id.as_str()),
        );
        if let Some(reason) = &targeting.reason {
            log::info!("tools: {} retargeted: {}", tool.name, reason);
        }

        let payload = match targeting.error {
            Some(message) => {
                log::warn!("tools: {} not executed: {}", tool.name, message);
                json!({ "status": "error", "message": message, "data": null })
            }
            None => {
                let executor = self.executor.clone();
                let name = tool.name.clone();
                let input = targeting.input.clone();
                let exec_context = context.clone();
                // Detached so a stop abandons the continuation without killing the tool.
                let task = tokio::spawn(async move { executor.execute(&name, input, &exec_context).await });
                let joined = tokio::select! {
                    biased;
                    _ = pending.cancel.cancelled() => {
                        log::info!("tools: turn stopped while {} was running; its result will be dropped", tool.name);
                        return Ok(None);
                    }
                    joined = task => joined,
                };
                let output = match joined {
                    Ok(output) => output,
                    Err(e) => Err(format!("tool task failed: {}", e)),
                };
                match output {
                    Ok(value) => {
                        if changes_content(&tool.name) {
                            self.refresh_target(context_store, &targeting.input);
                        }
                        log::debug!("tools: {} succeeded", tool.name);
                        value
                    }
                    Err(e) => {
                        log::warn!("tools: {} failed: {}", tool.name, e);
                        json!({ "error": e })
                    }
                }
            }
        };

        if pending.cancel.is_cancelled() {
            return Ok(None);
        }
        let outcome = controller
            .handle_tool_result(
                &tool.id,
                payload,
                context_store.snapshot(),
                &pending.thread_id,
                model,
            )
            .await?;
        Ok(Some(outcome))
    }

    fn refresh_target(&self, context_store: &ContextStore, input: &Value) {
        if let Some(window_id) = input.get("windowId").and_then(Value::as_str) {
            context_store.add_window_to_context(window_id);
        }
        let stamp = context_store.bump_refresh();
        log::debug!("tools: context refreshed at {}", stamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_changing_tools() {
        assert!(changes_content("docs_openDocument"));
        assert!(changes_content("pdf_openFile"));
        assert!(changes_content("notes_create"));
        assert!(changes_content("docs_createDocument"));
        assert!(changes_content("notes_editLine"));
        assert!(!changes_content("pdf_getPage"));
        assert!(!changes_content("docs_insertText"));
    }
}
