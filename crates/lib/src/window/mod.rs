//! Windows: the live registry the UI owns, normalized context entries, and tool targeting.

mod content;
mod registry;
mod targeting;

pub use content::{content_hash, format_app_type, AppFamily, ContentKind, WindowContent};
pub use registry::{
    ApplicationState, DocsState, EntityIndex, EntityRef, InMemoryEntityIndex,
    InMemoryWindowRegistry, IndexedEntity, NotesState, PdfiumState, RecentDoc, WindowEntity,
    WindowRegistry,
};
pub use targeting::{
    describe_context, infer_tool_family, is_compatible, tool_type_label, CandidateSource,
    TargetingResult, WindowTarget, WindowTargetResolver,
};
