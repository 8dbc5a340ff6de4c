//! SpaceChat core library: streaming generation client, window targeting for tool calls,
//! the conversation context store, and the turn state machine used by the CLI.

pub mod agent;
pub mod config;
pub mod context;
pub mod conversation;
pub mod persist;
pub mod stream;
pub mod thread;
pub mod tools;
pub mod window;
