//! Streaming exchange with the remote generation endpoint.

mod client;
mod protocol;
mod session;

pub use client::HttpTransport;
pub use protocol::{EndpointKind, GenerationRequest, HistoryMessage, StreamEvent, OVERLOAD_MARKER};
pub use session::{ByteStream, GenerationTransport, SessionEnd, StreamHandler, StreamSession};

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("generation request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// Non-2xx response; carries the server's `error.message` when it sent one.
    #[error("{0}")]
    Api(String),
    #[error("Claude's servers are currently experiencing high traffic. Please try again in a few moments.")]
    Overloaded,
    /// `{"type":"error"}` event from the stream.
    #[error("{0}")]
    Server(String),
    #[error("stream read failed: {0}")]
    Transport(String),
}
