//! Tool layer: the catalog sent to the model and the dispatcher that runs tool calls.

mod catalog;
mod dispatch;

pub use catalog::{ToolCatalog, ToolDefinition};
pub use dispatch::{changes_content, CommandExecutor, ToolDispatcher};
