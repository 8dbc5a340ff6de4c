//! One request/response exchange with the generation endpoint.
//!
//! [`StreamSession::run`] reads chunks, splits them on newlines, and turns each line into a
//! handler callback. The next chunk read is raced against the cancellation token so a stop is
//! honored promptly. A `tool_use`, `done` or `error` event ends the session; the byte stream is
//! dropped on every exit, which closes the underlying transport.

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

use super::protocol::{EndpointKind, GenerationRequest, StreamEvent, OVERLOAD_MARKER};
use super::StreamError;
use crate::thread::ToolUse;

/// Raw response body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, StreamError>> + Send>>;

/// Opens the long-lived response stream for a request.
#[async_trait]
pub trait GenerationTransport: Send + Sync {
    async fn open(
        &self,
        endpoint: EndpointKind,
        request: &GenerationRequest,
    ) -> Result<ByteStream, StreamError>;
}

/// Receives the semantically significant events of one session.
#[async_trait]
pub trait StreamHandler: Send {
    async fn on_text(&mut self, delta: &str, full: &str);
    async fn on_tool_use(&mut self, tool_use: ToolUse);
    async fn on_done(&mut self, full: &str, conversation_title: Option<String>);
    async fn on_error(&mut self, error: StreamError);
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    Done,
    ToolUse,
    Error,
    Cancelled,
    /// The body ended without a terminal event.
    Exhausted,
}

pub struct StreamSession {
    cancel: CancellationToken,
    full: String,
}

impl StreamSession {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            full: String::new(),
        }
    }

    /// Text accumulated so far.
    pub fn full_text(&self) -> &str {
        &self.full
    }

    /// Open `request` on `transport` and run it. Open failures go to `on_error`.
    pub async fn open_and_run<H>(
        &mut self,
        transport: &dyn GenerationTransport,
        request: &GenerationRequest,
        handler: &mut H,
    ) -> SessionEnd
    where
        H: StreamHandler + ?Sized,
    {
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                log::info!("stream: cancelled before the response arrived");
                return SessionEnd::Cancelled;
            }
            opened = transport.open(request.endpoint(), request) => opened,
        };
        match opened {
            Ok(stream) => self.run(stream, handler).await,
            Err(e) => {
                log::warn!("stream: open failed: {}", e);
                handler.on_error(e).await;
                SessionEnd::Error
            }
        }
    }

    /// Consume `stream` until a terminal event, cancellation, or end of body.
    pub async fn run<H>(&mut self, mut stream: ByteStream, handler: &mut H) -> SessionEnd
    where
        H: StreamHandler + ?Sized,
    {
        let mut buffer: Vec<u8> = Vec::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    log::info!("stream: cancelled");
                    return SessionEnd::Cancelled;
                }
                next = stream.next() => next,
            };
            let chunk = match next {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    if self.cancel.is_cancelled() {
                        return SessionEnd::Cancelled;
                    }
                    log::warn!("stream: transport error: {}", e);
                    handler.on_error(e).await;
                    return SessionEnd::Error;
                }
                None => break,
            };
            buffer.extend_from_slice(&chunk);
            while let Some(i) = buffer.iter().position(|&b| b == b'\n') {
                let line_bytes: Vec<u8> = buffer.drain(..i).collect();
                buffer.drain(..1);
                if self.cancel.is_cancelled() {
                    log::info!("stream: cancelled between lines");
                    return SessionEnd::Cancelled;
                }
                let line = String::from_utf8_lossy(&line_bytes);
                if let Some(end) = self.handle_line(line.trim(), handler).await {
                    return end;
                }
            }
        }

        let rest = String::from_utf8_lossy(&buffer).to_string();
        if let Some(end) = self.handle_line(rest.trim(), handler).await {
            return end;
        }
        log::debug!("stream: body ended without a terminal event");
        SessionEnd::Exhausted
    }

    async fn handle_line<H>(&mut self, line: &str, handler: &mut H) -> Option<SessionEnd>
    where
        H: StreamHandler + ?Sized,
    {
        if line.is_empty() {
            return None;
        }
        if line.contains(OVERLOAD_MARKER) {
            log::warn!("stream: provider overloaded: {}", line);
            handler.on_error(StreamError::Overloaded).await;
            return Some(SessionEnd::Error);
        }
        let event: StreamEvent = match serde_json::from_str(line) {
            Ok(e) => e,
            Err(e) => {
                log::warn!("stream: skipping malformed line ({}): {}", e, line);
                return None;
            }
        };
        match event {
            StreamEvent::Text { content } => {
                self.full.push_str(&content);
                handler.on_text(&content, &self.full).await;
                None
            }
            StreamEvent::ToolUse { content } => {
                log::debug!("stream: tool_use {} ({})", content.name, content.id);
                handler.on_tool_use(content).await;
                Some(SessionEnd::ToolUse)
            }
            StreamEvent::Done { conversation_title } => {
                let title = conversation_title.filter(|t| !t.trim().is_empty());
                handler.on_done(&self.full, title).await;
                Some(SessionEnd::Done)
            }
            StreamEvent::Error { message } => {
                let message = message.unwrap_or_else(|| "Unknown error in stream".to_string());
                handler.on_error(StreamError::Server(message)).await;
                Some(SessionEnd::Error)
            }
            other => {
                log::trace!("stream: advisory event {:?}", other);
                None
            }
        }
    }
}
