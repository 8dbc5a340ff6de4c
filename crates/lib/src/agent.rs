//! Agent turn: send the user's message, then run tool calls and continue until the model stops
//! asking for tools.

use crate::context::ContextStore;
use crate::conversation::{
    ControllerError, ConversationController, SendOutcome, SendRequest, TurnEnd,
};
use crate::tools::ToolDispatcher;

/// Run one user turn to completion. Tool round trips are capped by the controller's
/// `max_tool_rounds`; hitting the cap stops the turn and returns `Stopped`.
pub async fn run_turn(
    controller: &ConversationController,
    dispatcher: &ToolDispatcher,
    context_store: &ContextStore,
    request: SendRequest,
) -> Result<SendOutcome, ControllerError> {
    let model = request.model.clone();
    let mut outcome = controller.send_message(request).await?;
    let max_rounds = controller.config().max_tool_rounds;
    let mut rounds = 0;

    loop {
        let (thread_id, message_id) = match &outcome {
            SendOutcome::Finished(TurnEnd::ToolPending {
                thread_id,
                message_id,
                ..
            }) => (thread_id.clone(), message_id.clone()),
            _ => return Ok(outcome),
        };
        if rounds >= max_rounds {
            log::warn!("agent: tool round limit ({}) reached, stopping", max_rounds);
            let message_id = controller.stop_stream().await.unwrap_or(message_id);
            return Ok(SendOutcome::Finished(TurnEnd::Stopped {
                thread_id,
                message_id,
            }));
        }
        rounds += 1;
        match dispatcher
            .run_pending(controller, context_store, model.clone())
            .await?
        {
            Some(next) => outcome = next,
            None => {
                log::debug!("agent: turn stopped during tool round {}", rounds);
                return Ok(SendOutcome::Finished(TurnEnd::Stopped {
                    thread_id,
                    message_id,
                }));
            }
        }
    }
}
