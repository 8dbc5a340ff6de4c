use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use super::turn::TurnHandler;
use super::{
    tool_result_envelope, ControllerError, ErrorKind, RejectReason, SendOutcome, SendRequest,
    TurnEnd, TurnPhase,
};
use crate::config::ConversationConfig;
use crate::context::SpaceContext;
use crate::persist::{Entity, EntityFilter, EntityStore};
use crate::stream::{
    GenerationRequest, GenerationTransport, HistoryMessage, SessionEnd, StreamHandler,
    StreamSession,
};
use crate::thread::{
    ChatMode, ContentBlock, Message, Sender, Thread, ToolUse, STOPPED_PLACEHOLDER,
};
use crate::tools::ToolCatalog;

struct ControllerState {
    phase: TurnPhase,
    /// True from send until the turn fully ends, including while a tool runs.
    generating: bool,
    threads: HashMap<String, Thread>,
    messages: HashMap<String, Message>,
    current_threads: BTreeMap<ChatMode, String>,
    pending_tool_message_id: Option<String>,
    pending_tool_use: Option<ToolUse>,
    streaming_message_id: Option<String>,
    /// Shared by every stream of one user turn and by its tool executions.
    cancel: Option<CancellationToken>,
    /// Bumped on every stream start and on stop; stream callbacks carrying an older value are ignored.
    turn: u64,
    last_error: Option<ErrorKind>,
    initialized: bool,
    initializing: bool,
}

/// A tool call waiting for its result.
#[derive(Debug, Clone)]
pub struct PendingTool {
    pub thread_id: String,
    pub message_id: String,
    pub tool_use: ToolUse,
    /// Cancelled when the user stops the turn.
    pub cancel: CancellationToken,
}

/// Diagnostics snapshot.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDump {
    pub phase: TurnPhase,
    pub is_generating: bool,
    pub is_streaming: bool,
    pub is_processing: bool,
    pub pending_tool_message_id: Option<String>,
    pub pending_tool_use_id: Option<String>,
    pub current_streaming_message_id: Option<String>,
    pub current_thread_ids: BTreeMap<ChatMode, String>,
    pub thread_count: usize,
    pub message_count: usize,
    pub initialized: bool,
    pub last_error: Option<ErrorKind>,
}

/// A chunk of assistant text, published as it streams in.
#[derive(Debug, Clone, PartialEq)]
pub struct TextDelta {
    pub message_id: String,
    pub delta: String,
}

struct TurnStart {
    thread_id: String,
    message_id: String,
    turn: u64,
    cancel: CancellationToken,
    history: Vec<HistoryMessage>,
    persist: Vec<Entity>,
}

/// Drives turns for one user. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConversationController {
    state: Arc<Mutex<ControllerState>>,
    store: Arc<dyn EntityStore>,
    transport: Arc<dyn GenerationTransport>,
    catalog: Arc<ToolCatalog>,
    config: ConversationConfig,
    text_tx: broadcast::Sender<TextDelta>,
    /// Serializes writes to the store. Taken before an entity snapshot is built and held until
    /// the batch lands, so writes reach the store in the order the state changed.
    persist_gate: Arc<AsyncMutex<()>>,
}

impl ConversationController {
    pub fn new(
        config: ConversationConfig,
        store: Arc<dyn EntityStore>,
        transport: Arc<dyn GenerationTransport>,
        catalog: Arc<ToolCatalog>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(ControllerState {
                phase: TurnPhase::Idle,
                generating: false,
                threads: HashMap::new(),
                messages: HashMap::new(),
                current_threads: BTreeMap::new(),
                pending_tool_message_id: None,
                pending_tool_use: None,
                streaming_message_id: None,
                cancel: None,
                turn: 0,
                last_error: None,
                initialized: false,
                initializing: false,
            })),
            store,
            transport,
            catalog,
            config,
            text_tx: broadcast::channel(256).0,
            persist_gate: Arc::new(AsyncMutex::new(())),
        }
    }

    /// Live text deltas of every turn. Slow receivers lag and skip chunks.
    pub fn subscribe_text(&self) -> broadcast::Receiver<TextDelta> {
        self.text_tx.subscribe()
    }

    pub fn config(&self) -> &ConversationConfig {
        &self.config
    }

    /// Load the user's threads, then the messages of the threads in `restored` (the saved
    /// per-mode selection). Runs once; later calls return immediately.
    pub async fn initialize(&self, restored: &BTreeMap<ChatMode, String>) -> Result<(), ControllerError> {
        {
            let mut s = self.state.lock();
            if s.initialized || s.initializing {
                return Ok(());
            }
            s.initializing = true;
        }

        let found = match self
            .store
            .query_entities(&EntityFilter::ThreadsForUser(self.config.user_id.clone()))
            .await
        {
            Ok(found) => found,
            Err(e) => {
                log::error!("conversation: loading threads failed: {}", e);
                self.state.lock().initializing = false;
                return Err(e.into());
            }
        };
        let threads: HashMap<String, Thread> = found
            .into_iter()
            .filter_map(|e| match e {
                Entity::Thread(t) => Some((t.id.clone(), t)),
                _ => None,
            })
            .collect();

        let mut messages = Vec::new();
        let mut current = BTreeMap::new();
        for (mode, thread_id) in restored {
            if !threads.contains_key(thread_id) {
                log::debug!("conversation: saved {} thread {} no longer exists", mode, thread_id);
                continue;
            }
            current.insert(*mode, thread_id.clone());
            match self
                .store
                .query_entities(&EntityFilter::MessagesInThread(thread_id.clone()))
                .await
            {
                Ok(found) => messages.extend(found.into_iter().filter_map(|e| match e {
                    Entity::Message(m) => Some(m),
                    _ => None,
                })),
                Err(e) => log::error!("conversation: loading messages for {} failed: {}", thread_id, e),
            }
        }

        let mut s = self.state.lock();
        let thread_count = threads.len();
        for (id, thread) in threads {
            s.threads.entry(id).or_insert(thread);
        }
        for m in messages {
            s.messages.entry(m.id.clone()).or_insert(m);
        }
        for (mode, id) in current {
            s.current_threads.entry(mode).or_insert(id);
        }
        s.initialized = true;
        s.initializing = false;
        log::info!("conversation: loaded {} threads", thread_count);
        Ok(())
    }

    /// Start an empty thread and make it current for `mode`. Persisted on first send.
    pub fn create_thread(&self, mode: ChatMode) -> String {
        let thread = Thread::new(&self.config.user_id, mode, mode.default_thread_name());
        let id = thread.id.clone();
        let mut s = self.state.lock();
        s.threads.insert(id.clone(), thread);
        s.current_threads.insert(mode, id.clone());
        id
    }

    /// Load a thread's messages and select it for `mode`.
    pub async fn set_current_thread(&self, mode: ChatMode, thread_id: &str) -> Result<(), ControllerError> {
        if !self.state.lock().threads.contains_key(thread_id) {
            return Err(ControllerError::UnknownThread(thread_id.to_string()));
        }
        self.fetch_messages(thread_id).await?;
        self.state
            .lock()
            .current_threads
            .insert(mode, thread_id.to_string());
        Ok(())
    }

    /// Merge a thread's persisted messages into memory. The message being streamed is left alone.
    pub async fn fetch_messages(&self, thread_id: &str) -> Result<Vec<Message>, ControllerError> {
        let found = self
            .store
            .query_entities(&EntityFilter::MessagesInThread(thread_id.to_string()))
            .await?;
        let messages: Vec<Message> = found
            .into_iter()
            .filter_map(|e| match e {
                Entity::Message(m) => Some(m),
                _ => None,
            })
            .collect();
        let mut s = self.state.lock();
        for m in &messages {
            if s.streaming_message_id.as_deref() == Some(m.id.as_str())
                || s.pending_tool_message_id.as_deref() == Some(m.id.as_str())
            {
                continue;
            }
            s.messages.insert(m.id.clone(), m.clone());
        }
        Ok(messages)
    }

    pub fn current_thread(&self, mode: ChatMode) -> Option<String> {
        self.state.lock().current_threads.get(&mode).cloned()
    }

    pub fn thread(&self, thread_id: &str) -> Option<Thread> {
        self.state.lock().threads.get(thread_id).cloned()
    }

    pub fn message(&self, message_id: &str) -> Option<Message> {
        self.state.lock().messages.get(message_id).cloned()
    }

    /// Messages of a thread in thread order. Ids without a loaded message are skipped.
    pub fn thread_messages(&self, thread_id: &str) -> Vec<Message> {
        let s = self.state.lock();
        match s.threads.get(thread_id) {
            Some(t) => t
                .message_ids
                .iter()
                .filter_map(|id| s.messages.get(id).cloned())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Conversation history in request form.
    pub fn history(&self, thread_id: &str) -> Vec<HistoryMessage> {
        self.thread_messages(thread_id)
            .iter()
            .filter_map(HistoryMessage::from_message)
            .collect()
    }

    pub fn phase(&self) -> TurnPhase {
        self.state.lock().phase
    }

    pub fn is_generating(&self) -> bool {
        self.state.lock().generating
    }

    pub fn is_streaming(&self) -> bool {
        self.state.lock().phase == TurnPhase::Streaming
    }

    pub fn last_error(&self) -> Option<ErrorKind> {
        self.state.lock().last_error.clone()
    }

    pub fn pending_tool(&self) -> Option<PendingTool> {
        let s = self.state.lock();
        let message_id = s.pending_tool_message_id.clone()?;
        let tool_use = s.pending_tool_use.clone()?;
        let thread_id = s.messages.get(&message_id)?.thread_id.clone();
        Some(PendingTool {
            thread_id,
            message_id,
            tool_use,
            cancel: s.cancel.clone().unwrap_or_default(),
        })
    }

    pub fn dump_state(&self) -> StateDump {
        let s = self.state.lock();
        StateDump {
            phase: s.phase,
            is_generating: s.generating,
            is_streaming: s.phase == TurnPhase::Streaming,
            is_processing: matches!(s.phase, TurnPhase::Sending | TurnPhase::Streaming),
            pending_tool_message_id: s.pending_tool_message_id.clone(),
            pending_tool_use_id: s.pending_tool_use.as_ref().map(|t| t.id.clone()),
            current_streaming_message_id: s.streaming_message_id.clone(),
            current_thread_ids: s.current_threads.clone(),
            thread_count: s.threads.len(),
            message_count: s.messages.len(),
            initialized: s.initialized,
            last_error: s.last_error.clone(),
        }
    }

    /// Run one stream to its end. Returns `Rejected` without side effects when another stream is
    /// open, the text is blank, or a tool result does not match the pending call. A new text
    /// message while a tool is pending abandons that tool call first.
    pub async fn send_message(&self, request: SendRequest) -> Result<SendOutcome, ControllerError> {
        let SendRequest {
            content,
            thread_id,
            mode,
            context,
            model,
        } = request;
        if let ContentBlock::Text { text } = &content {
            if text.trim().is_empty() {
                return Ok(SendOutcome::Rejected(RejectReason::EmptyMessage));
            }
            if self.phase() == TurnPhase::ToolPending {
                log::info!("conversation: new message while a tool is pending, abandoning the tool call");
                self.stop_stream().await;
            }
        }

        let model = model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.config.default_model.clone());
        let tools = self.catalog.tools_for_context(&context);
        let Some(mut request) = GenerationRequest::for_block(&content, context, Vec::new(), tools, model)
        else {
            return Ok(SendOutcome::Rejected(RejectReason::UnsupportedContent));
        };

        let gate = self.persist_gate.lock().await;
        let start = match self.begin_turn(&content, thread_id.as_deref(), mode) {
            Ok(start) => start,
            Err(reason) => {
                log::info!("conversation: send rejected ({:?})", reason);
                return Ok(SendOutcome::Rejected(reason));
            }
        };
        request.conversation_history = start.history;
        self.persist(start.persist).await;
        drop(gate);

        {
            let mut s = self.state.lock();
            if s.turn == start.turn {
                s.phase = TurnPhase::Streaming;
            }
        }

        let mut handler = TurnHandler::new(
            self.clone(),
            start.turn,
            start.thread_id.clone(),
            start.message_id.clone(),
        );
        let mut session = StreamSession::new(start.cancel);
        let end = session
            .open_and_run(self.transport.as_ref(), &request, &mut handler)
            .await;
        let outcome = match end {
            SessionEnd::Exhausted => {
                handler.on_done(session.full_text(), None).await;
                handler.take_outcome()
            }
            SessionEnd::Cancelled => None,
            _ => handler.take_outcome(),
        };
        Ok(SendOutcome::Finished(outcome.unwrap_or(TurnEnd::Stopped {
            thread_id: start.thread_id,
            message_id: start.message_id,
        })))
    }

    fn begin_turn(
        &self,
        content: &ContentBlock,
        thread_id: Option<&str>,
        mode: ChatMode,
    ) -> Result<TurnStart, RejectReason> {
        let mut guard = self.state.lock();
        let s = &mut *guard;
        if matches!(s.phase, TurnPhase::Sending | TurnPhase::Streaming) {
            return Err(RejectReason::Busy);
        }
        let continuing = match content {
            ContentBlock::ToolResult { tool_use_id, .. } => {
                let matches_pending = s.phase == TurnPhase::ToolPending
                    && s.pending_tool_use.as_ref().map(|t| t.id.as_str()) == Some(tool_use_id.as_str());
                if !matches_pending {
                    return Err(RejectReason::StaleToolResult);
                }
                true
            }
            ContentBlock::Text { .. } if s.phase == TurnPhase::ToolPending => {
                return Err(RejectReason::Busy)
            }
            ContentBlock::Text { .. } => false,
            ContentBlock::ToolUse(_) => return Err(RejectReason::UnsupportedContent),
        };

        let user_id = self.config.user_id.clone();
        let mut thread = match thread_id.and_then(|id| s.threads.get(id)) {
            Some(t) => t.clone(),
            None => {
                log::debug!("conversation: starting a new {} thread", mode);
                Thread::new(&user_id, mode, format!("New {} thread", mode))
            }
        };
        let history: Vec<HistoryMessage> = thread
            .message_ids
            .iter()
            .filter_map(|id| s.messages.get(id))
            .filter_map(HistoryMessage::from_message)
            .collect();

        let user = Message::user(&user_id, content.clone(), &thread.id);
        let assistant = Message::assistant_placeholder(&user_id, &thread.id);
        thread.link(&user.id);

        let cancel = match (&s.cancel, continuing) {
            (Some(token), true) => token.clone(),
            _ => CancellationToken::new(),
        };
        s.turn += 1;
        s.phase = TurnPhase::Sending;
        s.generating = true;
        s.pending_tool_message_id = None;
        s.pending_tool_use = None;
        s.streaming_message_id = Some(assistant.id.clone());
        s.cancel = Some(cancel.clone());
        s.last_error = None;
        s.current_threads.insert(mode, thread.id.clone());

        let persist = vec![
            Entity::Message(user.clone()),
            Entity::Message(assistant.clone()),
            Entity::Thread(thread.clone()),
        ];
        let start = TurnStart {
            thread_id: thread.id.clone(),
            message_id: assistant.id.clone(),
            turn: s.turn,
            cancel,
            history,
            persist,
        };
        s.messages.insert(user.id.clone(), user);
        s.messages.insert(assistant.id.clone(), assistant);
        s.threads.insert(thread.id.clone(), thread);
        Ok(start)
    }

    /// Abort the open stream and finalize the in-progress assistant message. An unanswered
    /// tool call is removed; an empty message gets a placeholder. Returns the finalized id.
    /// A tool already handed to the executor keeps running; only the continuation is dropped.
    pub async fn stop_stream(&self) -> Option<String> {
        // Cancel first so the stream ends while earlier writes drain.
        let early = self.state.lock().cancel.clone();
        if let Some(token) = early {
            token.cancel();
        }
        let _gate = self.persist_gate.lock().await;
        let (finalized, persist) = {
            let mut guard = self.state.lock();
            let s = &mut *guard;
            if let Some(token) = s.cancel.take() {
                token.cancel();
            }
            let had_pending = s.pending_tool_message_id.is_some();
            let target = s
                .pending_tool_message_id
                .clone()
                .or_else(|| s.streaming_message_id.clone());

            let mut persist = Vec::new();
            let mut finalized = None;
            if let (Some(id), true) = (target, s.generating) {
                if let Some(mut message) = s.messages.get(&id).cloned() {
                    if had_pending {
                        let answered: Vec<String> = s
                            .threads
                            .get(&message.thread_id)
                            .map(|t| {
                                t.message_ids
                                    .iter()
                                    .filter_map(|mid| s.messages.get(mid))
                                    .flat_map(|m| m.tool_result_ids().map(String::from).collect::<Vec<_>>())
                                    .collect()
                            })
                            .unwrap_or_default();
                        let removed = message.strip_unanswered_tool_uses(&answered);
                        log::info!("conversation: stop removed {} unanswered tool call(s) from {}", removed, id);
                    }
                    if message.content.is_empty() {
                        message.content.push(ContentBlock::text(STOPPED_PLACEHOLDER));
                    }
                    if let Some(thread) = s.threads.get_mut(&message.thread_id) {
                        thread.link(&id);
                        persist.push(Entity::Thread(thread.clone()));
                    }
                    persist.insert(0, Entity::Message(message.clone()));
                    s.messages.insert(id.clone(), message);
                    finalized = Some(id);
                }
            }

            s.phase = TurnPhase::Idle;
            s.generating = false;
            s.pending_tool_message_id = None;
            s.pending_tool_use = None;
            s.streaming_message_id = None;
            s.turn += 1;
            (finalized, persist)
        };
        if !persist.is_empty() {
            self.persist(persist).await;
        }
        log::info!(
            "conversation: stopped, kept partial response {}",
            finalized.as_deref().unwrap_or("none")
        );
        finalized
    }

    /// Feed a tool's output back and continue the thread. Results that do not answer the
    /// pending call are dropped (`Rejected(StaleToolResult)`).
    pub async fn handle_tool_result(
        &self,
        tool_use_id: &str,
        payload: Value,
        mut context: SpaceContext,
        thread_id: &str,
        model: Option<String>,
    ) -> Result<SendOutcome, ControllerError> {
        let (mode, pending_name) = {
            let s = self.state.lock();
            let thread = s
                .threads
                .get(thread_id)
                .ok_or_else(|| ControllerError::UnknownThread(thread_id.to_string()))?;
            let name = s
                .pending_tool_use
                .as_ref()
                .filter(|t| t.id == tool_use_id)
                .map(|t| t.name.clone());
            (thread.mode, name)
        };
        let tool_name = pending_name
            .or_else(|| payload.get("name").and_then(Value::as_str).map(String::from))
            .unwrap_or_default();
        let envelope = tool_result_envelope(payload);

        if tool_name.starts_with("docs_") || tool_use_id.starts_with("docs_") {
            let now = Utc::now().timestamp_millis();
            context.refresh_timestamp = Some(match context.refresh_timestamp {
                Some(prev) if prev >= now => prev + 1,
                _ => now,
            });
        }

        self.send_message(SendRequest {
            content: ContentBlock::tool_result(tool_use_id, envelope.to_string()),
            thread_id: Some(thread_id.to_string()),
            mode,
            context,
            model,
        })
        .await
    }

    pub(super) fn apply_text(&self, turn: u64, message_id: &str, delta: &str, full: &str) -> bool {
        {
            let mut guard = self.state.lock();
            let s = &mut *guard;
            if s.turn != turn {
                return false;
            }
            let Some(message) = s.messages.get_mut(message_id) else {
                return false;
            };
            message.set_text(full);
            if let Some(thread) = s.threads.get_mut(&message.thread_id) {
                thread.link(message_id);
            }
            s.phase = TurnPhase::Streaming;
        }
        // No receivers is fine.
        let _ = self.text_tx.send(TextDelta {
            message_id: message_id.to_string(),
            delta: delta.to_string(),
        });
        true
    }

    pub(super) async fn apply_tool_use(&self, turn: u64, message_id: &str, tool_use: ToolUse) -> bool {
        let _gate = self.persist_gate.lock().await;
        let persist = {
            let mut guard = self.state.lock();
            let s = &mut *guard;
            if s.turn != turn {
                return false;
            }
            let Some(message) = s.messages.get_mut(message_id) else {
                return false;
            };
            message.content.push(ContentBlock::ToolUse(tool_use.clone()));
            let mut persist = vec![Entity::Message(message.clone())];
            if let Some(thread) = s.threads.get_mut(&message.thread_id) {
                thread.link(message_id);
                persist.push(Entity::Thread(thread.clone()));
            }
            s.pending_tool_message_id = Some(message_id.to_string());
            s.pending_tool_use = Some(tool_use);
            s.phase = TurnPhase::ToolPending;
            s.streaming_message_id = None;
            persist
        };
        self.persist(persist).await;
        true
    }

    pub(super) async fn apply_done(
        &self,
        turn: u64,
        message_id: &str,
        full: &str,
        title: Option<&str>,
    ) -> bool {
        let _gate = self.persist_gate.lock().await;
        let persist = {
            let mut guard = self.state.lock();
            let s = &mut *guard;
            if s.turn != turn {
                return false;
            }
            let Some(message) = s.messages.get_mut(message_id) else {
                return false;
            };
            if !full.is_empty() {
                message.set_text(full);
            }
            let mut persist = vec![Entity::Message(message.clone())];
            if let Some(thread) = s.threads.get_mut(&message.thread_id) {
                if !message.content.is_empty() {
                    thread.link(message_id);
                }
                if let Some(title) = title {
                    thread.name = title.to_string();
                }
                persist.push(Entity::Thread(thread.clone()));
            }
            if s.pending_tool_message_id.is_none() {
                s.phase = TurnPhase::Idle;
                s.generating = false;
                s.streaming_message_id = None;
                s.cancel = None;
            }
            persist
        };
        self.persist(persist).await;
        true
    }

    /// Record a failure as assistant text. Returns the id of the message holding it.
    pub(super) async fn apply_error(&self, turn: u64, message_id: &str, kind: &ErrorKind) -> Option<String> {
        let _gate = self.persist_gate.lock().await;
        let (holder, persist) = {
            let mut guard = self.state.lock();
            let s = &mut *guard;
            if s.turn != turn {
                return None;
            }
            let thread_id = s.messages.get(message_id)?.thread_id.clone();
            let text = kind.user_message();
            let placeholder_empty = s
                .messages
                .get(message_id)
                .map(|m| m.content.is_empty())
                .unwrap_or(false);
            let holder = if placeholder_empty {
                let message = s.messages.get_mut(message_id)?;
                message.set_text(&text);
                message.clone()
            } else {
                // Keep the partial reply; the error goes in a message of its own.
                let m = Message::new(
                    self.config.user_id.clone(),
                    Sender::Assistant,
                    vec![ContentBlock::text(text)],
                    thread_id.clone(),
                );
                s.messages.insert(m.id.clone(), m.clone());
                m
            };
            let mut persist = vec![Entity::Message(holder.clone())];
            if let Some(thread) = s.threads.get_mut(&thread_id) {
                thread.link(message_id);
                thread.link(&holder.id);
                persist.push(Entity::Thread(thread.clone()));
            }
            if holder.id != message_id {
                if let Some(original) = s.messages.get(message_id) {
                    persist.insert(0, Entity::Message(original.clone()));
                }
            }
            s.phase = TurnPhase::Idle;
            s.generating = false;
            s.pending_tool_message_id = None;
            s.pending_tool_use = None;
            s.streaming_message_id = None;
            s.cancel = None;
            s.last_error = Some(kind.clone());
            (holder.id.clone(), persist)
        };
        self.persist(persist).await;
        Some(holder)
    }

    /// Write a batch. Callers hold `persist_gate`.
    async fn persist(&self, entities: Vec<Entity>) {
        let count = entities.len();
        if let Err(e) = self.store.batch_upsert(entities).await {
            log::error!("conversation: persisting {} entities failed: {}", count, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::InMemoryEntityStore;
    use crate::stream::{ByteStream, EndpointKind, StreamError};
    use async_trait::async_trait;
    use futures_util::{stream, StreamExt};
    use std::collections::VecDeque;
    use std::time::Duration;

    enum Script {
        Lines(Vec<&'static str>),
        /// Emit lines, then never finish.
        Hang(Vec<&'static str>),
        Fail(&'static str),
    }

    #[derive(Default)]
    struct ScriptedTransport {
        scripts: Mutex<VecDeque<Script>>,
        requests: Mutex<Vec<(EndpointKind, Value)>>,
    }

    impl ScriptedTransport {
        fn new(scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: Mutex::new(scripts.into()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    fn lines_stream(lines: Vec<&'static str>) -> impl futures_util::Stream<Item = Result<Vec<u8>, StreamError>> {
        stream::iter(
            lines
                .into_iter()
                .map(|l| Ok::<Vec<u8>, StreamError>(format!("{}\n", l).into_bytes()))
                .collect::<Vec<_>>(),
        )
    }

    #[async_trait]
    impl GenerationTransport for ScriptedTransport {
        async fn open(
            &self,
            endpoint: EndpointKind,
            request: &GenerationRequest,
        ) -> Result<ByteStream, StreamError> {
            let body = serde_json::to_value(request).unwrap_or(Value::Null);
            self.requests.lock().push((endpoint, body));
            let script = self.scripts.lock().pop_front();
            match script {
                Some(Script::Lines(lines)) => Ok(Box::pin(lines_stream(lines))),
                Some(Script::Hang(lines)) => Ok(Box::pin(lines_stream(lines).chain(stream::pending()))),
                Some(Script::Fail(msg)) => Err(StreamError::Api(msg.to_string())),
                None => Err(StreamError::Transport("no script".into())),
            }
        }
    }

    fn controller(transport: Arc<ScriptedTransport>) -> (ConversationController, Arc<InMemoryEntityStore>) {
        let store = Arc::new(InMemoryEntityStore::new());
        let c = ConversationController::new(
            ConversationConfig::default(),
            store.clone(),
            transport,
            Arc::new(ToolCatalog::builtin()),
        );
        (c, store)
    }

    /// Store whose writes of matching batches take a while to land.
    struct SlowStore {
        inner: InMemoryEntityStore,
        slow_when: fn(&Entity) -> bool,
    }

    #[async_trait]
    impl EntityStore for SlowStore {
        async fn query_entities(&self, filter: &EntityFilter) -> Result<Vec<Entity>, crate::persist::PersistError> {
            self.inner.query_entities(filter).await
        }

        async fn batch_upsert(&self, entities: Vec<Entity>) -> Result<(), crate::persist::PersistError> {
            if entities.iter().any(|e| (self.slow_when)(e)) {
                tokio::time::sleep(Duration::from_millis(150)).await;
            }
            self.inner.batch_upsert(entities).await
        }
    }

    fn slow_controller(
        transport: Arc<ScriptedTransport>,
        slow_when: fn(&Entity) -> bool,
    ) -> (ConversationController, Arc<SlowStore>) {
        let store = Arc::new(SlowStore {
            inner: InMemoryEntityStore::new(),
            slow_when,
        });
        let c = ConversationController::new(
            ConversationConfig::default(),
            store.clone(),
            transport,
            Arc::new(ToolCatalog::builtin()),
        );
        (c, store)
    }

    fn finished(outcome: SendOutcome) -> TurnEnd {
        match outcome {
            SendOutcome::Finished(end) => end,
            other => panic!("expected finished turn, got {:?}", other),
        }
    }

    const TOOL_USE: &str =
        r#"{"type":"tool_use","content":{"id":"toolu_1","name":"pdf_getPage","input":{"page":2}}}"#;

    #[tokio::test]
    async fn text_turn_persists_concatenated_reply() {
        let transport = ScriptedTransport::new(vec![Script::Lines(vec![
            r#"{"type":"text","content":"Hel"}"#,
            r#"{"type":"text","content":"lo"}"#,
            r#"{"type":"done","conversation_title":"Greeting"}"#,
        ])]);
        let (c, store) = controller(transport.clone());
        let end = finished(
            c.send_message(SendRequest::text("hi", ChatMode::Chat, SpaceContext::new("s1")))
                .await
                .unwrap(),
        );
        let TurnEnd::Done { thread_id, message_id, title } = end else {
            panic!("expected done");
        };
        assert_eq!(title.as_deref(), Some("Greeting"));
        let saved = store.message(&message_id).await.unwrap();
        assert_eq!(saved.text(), "Hello");
        let thread = store.thread(&thread_id).await.unwrap();
        assert_eq!(thread.name, "Greeting");
        assert_eq!(thread.message_ids.len(), 2);
        assert_eq!(c.phase(), TurnPhase::Idle);
        assert!(!c.is_generating());
        assert_eq!(c.current_thread(ChatMode::Chat), Some(thread_id));

        let requests = transport.requests.lock();
        assert_eq!(requests[0].0, EndpointKind::Query);
        assert_eq!(requests[0].1["query"], "hi");
        assert_eq!(requests[0].1["model"], "claude-sonnet-4-20250514");
    }

    #[tokio::test]
    async fn text_deltas_are_published() {
        let transport = ScriptedTransport::new(vec![Script::Lines(vec![
            r#"{"type":"text","content":"a"}"#,
            r#"{"type":"text","content":"b"}"#,
            r#"{"type":"done"}"#,
        ])]);
        let (c, _) = controller(transport);
        let mut rx = c.subscribe_text();
        c.send_message(SendRequest::text("x", ChatMode::Chat, SpaceContext::new("s")))
            .await
            .unwrap();
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!((first.delta.as_str(), second.delta.as_str()), ("a", "b"));
        assert_eq!(first.message_id, second.message_id);
    }

    #[tokio::test]
    async fn blank_text_is_rejected() {
        let (c, store) = controller(ScriptedTransport::new(vec![]));
        let out = c
            .send_message(SendRequest::text("   ", ChatMode::Chat, SpaceContext::new("s")))
            .await
            .unwrap();
        assert_eq!(out, SendOutcome::Rejected(RejectReason::EmptyMessage));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn second_send_while_streaming_is_rejected() {
        let transport = ScriptedTransport::new(vec![Script::Hang(vec![r#"{"type":"text","content":"wait"}"#])]);
        let (c, _) = controller(transport);
        let first = {
            let c = c.clone();
            tokio::spawn(async move {
                c.send_message(SendRequest::text("one", ChatMode::Chat, SpaceContext::new("s")))
                    .await
            })
        };
        while !c.is_streaming() {
            tokio::task::yield_now().await;
        }
        let second = c
            .send_message(SendRequest::text("two", ChatMode::Chat, SpaceContext::new("s")))
            .await
            .unwrap();
        assert_eq!(second, SendOutcome::Rejected(RejectReason::Busy));

        c.stop_stream().await;
        let end = finished(first.await.unwrap().unwrap());
        assert!(matches!(end, TurnEnd::Stopped { .. }));
    }

    #[tokio::test]
    async fn stop_while_streaming_keeps_partial_text() {
        let transport = ScriptedTransport::new(vec![Script::Hang(vec![r#"{"type":"text","content":"partial"}"#])]);
        let (c, store) = controller(transport);
        let task = {
            let c = c.clone();
            tokio::spawn(async move {
                c.send_message(SendRequest::text("go", ChatMode::Chat, SpaceContext::new("s")))
                    .await
            })
        };
        loop {
            let dump = c.dump_state();
            if let Some(id) = dump.current_streaming_message_id.as_deref() {
                if c.message(id).map(|m| !m.content.is_empty()).unwrap_or(false) {
                    break;
                }
            }
            tokio::task::yield_now().await;
        }
        let id = c.stop_stream().await.unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(store.message(&id).await.unwrap().text(), "partial");
        assert_eq!(c.phase(), TurnPhase::Idle);
    }

    #[tokio::test]
    async fn tool_use_pauses_and_stop_strips_it() {
        let transport = ScriptedTransport::new(vec![Script::Lines(vec![TOOL_USE])]);
        let (c, store) = controller(transport);
        let end = finished(
            c.send_message(SendRequest::text("page 2?", ChatMode::Chat, SpaceContext::new("s")))
                .await
                .unwrap(),
        );
        let TurnEnd::ToolPending { message_id, tool_use, .. } = end else {
            panic!("expected tool pending");
        };
        assert_eq!(tool_use.name, "pdf_getPage");
        assert_eq!(c.phase(), TurnPhase::ToolPending);
        assert!(c.is_generating());
        assert!(!c.is_streaming());
        let persisted = store.message(&message_id).await.unwrap();
        assert_eq!(persisted.tool_uses().count(), 1);
        let pending = c.pending_tool().unwrap();
        assert!(!pending.cancel.is_cancelled());

        assert_eq!(c.stop_stream().await.as_deref(), Some(message_id.as_str()));
        assert!(pending.cancel.is_cancelled());
        let saved = store.message(&message_id).await.unwrap();
        assert_eq!(saved.content, vec![ContentBlock::text(STOPPED_PLACEHOLDER)]);
        assert!(!c.is_generating());
        assert!(c.pending_tool().is_none());
    }

    #[tokio::test]
    async fn stop_during_slow_opening_write_keeps_the_placeholder() {
        let (c, store) = slow_controller(
            ScriptedTransport::new(vec![Script::Hang(vec![])]),
            |e| matches!(e, Entity::Message(m) if m.content.is_empty()),
        );
        let task = {
            let c = c.clone();
            tokio::spawn(async move {
                c.send_message(SendRequest::text("go", ChatMode::Chat, SpaceContext::new("s")))
                    .await
            })
        };
        while c.phase() != TurnPhase::Sending {
            tokio::task::yield_now().await;
        }
        let id = c.stop_stream().await.unwrap();
        let end = finished(task.await.unwrap().unwrap());
        assert!(matches!(end, TurnEnd::Stopped { .. }));

        let in_memory = c.message(&id).unwrap().content;
        assert_eq!(in_memory, vec![ContentBlock::text(STOPPED_PLACEHOLDER)]);
        assert_eq!(store.inner.message(&id).await.unwrap().content, in_memory);
        assert_eq!(c.phase(), TurnPhase::Idle);
    }

    #[tokio::test]
    async fn stop_during_slow_tool_use_write_keeps_the_stripped_message() {
        let (c, store) = slow_controller(
            ScriptedTransport::new(vec![Script::Lines(vec![TOOL_USE])]),
            |e| matches!(e, Entity::Message(m) if m.tool_uses().count() > 0),
        );
        let task = {
            let c = c.clone();
            tokio::spawn(async move {
                c.send_message(SendRequest::text("page 2?", ChatMode::Chat, SpaceContext::new("s")))
                    .await
            })
        };
        while c.phase() != TurnPhase::ToolPending {
            tokio::task::yield_now().await;
        }
        let id = c.stop_stream().await.unwrap();
        task.await.unwrap().unwrap();

        let saved = store.inner.message(&id).await.unwrap();
        assert_eq!(saved.tool_uses().count(), 0);
        assert_eq!(saved.content, vec![ContentBlock::text(STOPPED_PLACEHOLDER)]);
        assert_eq!(c.message(&id).unwrap().content, saved.content);
    }

    #[tokio::test]
    async fn tool_result_continues_the_thread() {
        let transport = ScriptedTransport::new(vec![
            Script::Lines(vec![r#"{"type":"text","content":"Checking. "}"#, TOOL_USE]),
            Script::Lines(vec![r#"{"type":"text","content":"Page 2 says hi."}"#, r#"{"type":"done"}"#]),
        ]);
        let (c, store) = controller(transport.clone());
        let end = finished(
            c.send_message(SendRequest::text("page 2?", ChatMode::Editor, SpaceContext::new("s")))
                .await
                .unwrap(),
        );
        let thread_id = end.thread_id().to_string();
        let out = c
            .handle_tool_result("toolu_1", serde_json::json!({ "text": "hi" }), SpaceContext::new("s"), &thread_id, None)
            .await
            .unwrap();
        let TurnEnd::Done { message_id, .. } = finished(out) else {
            panic!("expected done");
        };
        assert_eq!(store.message(&message_id).await.unwrap().text(), "Page 2 says hi.");

        let messages = c.thread_messages(&thread_id);
        assert_eq!(messages.len(), 4);
        let result_msg = &messages[2];
        match &result_msg.content[0] {
            ContentBlock::ToolResult { tool_use_id, content } => {
                assert_eq!(tool_use_id, "toolu_1");
                let v: Value = serde_json::from_str(content).unwrap();
                assert_eq!(v["status"], "success");
            }
            other => panic!("unexpected block {:?}", other),
        }

        let requests = transport.requests.lock();
        assert_eq!(requests[1].0, EndpointKind::ToolOutput);
        assert_eq!(requests[1].1["tool_use_id"], "toolu_1");
        assert_eq!(requests[1].1["stream"], true);
        assert_eq!(requests[1].1["conversation_history"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stale_tool_result_is_dropped() {
        let transport = ScriptedTransport::new(vec![Script::Lines(vec![TOOL_USE])]);
        let (c, _) = controller(transport);
        let end = finished(
            c.send_message(SendRequest::text("x", ChatMode::Chat, SpaceContext::new("s")))
                .await
                .unwrap(),
        );
        let thread_id = end.thread_id().to_string();
        let wrong = c
            .handle_tool_result("toolu_other", Value::Null, SpaceContext::new("s"), &thread_id, None)
            .await
            .unwrap();
        assert_eq!(wrong, SendOutcome::Rejected(RejectReason::StaleToolResult));

        c.stop_stream().await;
        let late = c
            .handle_tool_result("toolu_1", Value::Null, SpaceContext::new("s"), &thread_id, None)
            .await
            .unwrap();
        assert_eq!(late, SendOutcome::Rejected(RejectReason::StaleToolResult));
        assert!(matches!(
            c.handle_tool_result("toolu_1", Value::Null, SpaceContext::new("s"), "nope", None).await,
            Err(ControllerError::UnknownThread(_))
        ));
    }

    #[tokio::test]
    async fn errors_become_assistant_messages() {
        let transport = ScriptedTransport::new(vec![
            Script::Lines(vec![r#"{"type":"error","message":"rate limit reached"}"#]),
            Script::Lines(vec![r#"{"type":"text","content":"so far"}"#, "overloaded_error"]),
            Script::Fail("request timed out"),
        ]);
        let (c, store) = controller(transport);

        let end = finished(
            c.send_message(SendRequest::text("a", ChatMode::Chat, SpaceContext::new("s")))
                .await
                .unwrap(),
        );
        let TurnEnd::Failed { message_id, error, thread_id } = end else {
            panic!("expected failure");
        };
        assert_eq!(error, ErrorKind::UsageLimit);
        assert!(store.message(&message_id).await.unwrap().text().contains("usage limit"));
        assert!(!c.is_generating());

        let end = finished(
            c.send_message(SendRequest::text("b", ChatMode::Chat, SpaceContext::new("s")).in_thread(&thread_id))
                .await
                .unwrap(),
        );
        let TurnEnd::Failed { message_id, error, .. } = end else {
            panic!("expected failure");
        };
        assert_eq!(error, ErrorKind::Overloaded);
        let holder = store.message(&message_id).await.unwrap();
        assert!(holder.text().contains("busy right now"));
        assert_eq!(c.thread_messages(&thread_id).iter().filter(|m| m.text() == "so far").count(), 1);

        let end = finished(
            c.send_message(SendRequest::text("c", ChatMode::Chat, SpaceContext::new("s")).in_thread(&thread_id))
                .await
                .unwrap(),
        );
        assert!(matches!(end, TurnEnd::Failed { error: ErrorKind::Timeout, .. }));
        assert_eq!(c.last_error(), Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn initialize_restores_selected_threads() {
        let store = Arc::new(InMemoryEntityStore::new());
        let mut thread = Thread::new("local", ChatMode::Create, "Saved");
        let msg = Message::user("local", ContentBlock::text("earlier"), &thread.id);
        thread.link(&msg.id);
        let other = Thread::new("someone-else", ChatMode::Chat, "Theirs");
        store
            .batch_upsert(vec![
                Entity::Thread(thread.clone()),
                Entity::Message(msg.clone()),
                Entity::Thread(other),
            ])
            .await
            .unwrap();

        let c = ConversationController::new(
            ConversationConfig::default(),
            store,
            ScriptedTransport::new(vec![]),
            Arc::new(ToolCatalog::builtin()),
        );
        let mut restored = BTreeMap::new();
        restored.insert(ChatMode::Create, thread.id.clone());
        restored.insert(ChatMode::Chat, "gone".to_string());
        c.initialize(&restored).await.unwrap();
        c.initialize(&restored).await.unwrap();

        let dump = c.dump_state();
        assert!(dump.initialized);
        assert_eq!(dump.thread_count, 1);
        assert_eq!(c.current_thread(ChatMode::Create), Some(thread.id.clone()));
        assert_eq!(c.current_thread(ChatMode::Chat), None);
        assert_eq!(c.thread_messages(&thread.id)[0].text(), "earlier");
        assert_eq!(c.history(&thread.id).len(), 1);
    }

    #[tokio::test]
    async fn create_and_select_threads() {
        let (c, _) = controller(ScriptedTransport::new(vec![]));
        let id = c.create_thread(ChatMode::Exp1);
        assert_eq!(c.thread(&id).unwrap().name, "New Experiment");
        assert_eq!(c.current_thread(ChatMode::Exp1), Some(id.clone()));
        c.set_current_thread(ChatMode::Chat, &id).await.unwrap();
        assert_eq!(c.current_thread(ChatMode::Chat), Some(id));
        assert!(matches!(
            c.set_current_thread(ChatMode::Chat, "missing").await,
            Err(ControllerError::UnknownThread(_))
        ));
        let v = serde_json::to_value(c.dump_state()).unwrap();
        assert_eq!(v["phase"], "idle");
        assert!(v["currentThreadIds"]["exp1"].is_string());
    }
}
