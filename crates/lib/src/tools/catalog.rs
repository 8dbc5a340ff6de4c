use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;

use crate::context::SpaceContext;
use crate::window::AppFamily;

/// A tool the model may call. Serialized as-is into the request's `tools` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// Tool definitions grouped by the app family they operate on.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    by_family: HashMap<AppFamily, Vec<ToolDefinition>>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, family: AppFamily, tool: ToolDefinition) {
        let tools = self.by_family.entry(family).or_default();
        tools.retain(|t| t.name != tool.name);
        tools.push(tool);
    }

    pub fn family(&self, family: AppFamily) -> &[ToolDefinition] {
        self.by_family.get(&family).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.by_family.values().flatten().find(|t| t.name == name)
    }

    pub fn len(&self) -> usize {
        self.by_family.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tools for the families present in `context`, each family once. An empty context gets
    /// the note and document tools so the model can create something to work in.
    pub fn tools_for_context(&self, context: &SpaceContext) -> Vec<ToolDefinition> {
        let families = if context.is_empty() {
            vec![AppFamily::Note, AppFamily::Document]
        } else {
            context.families()
        };
        families
            .into_iter()
            .flat_map(|f| self.family(f).iter().cloned())
            .collect()
    }

    /// The stock PDF, document and note tools.
    pub fn builtin() -> Self {
        let mut c = Self::new();
        c.register(
            AppFamily::Pdf,
            ToolDefinition::new(
                "pdf_getPage",
                "Read the text of a page in an open PDF window.",
                window_schema(json!({ "page": { "type": "integer", "minimum": 1 } }), &["page"]),
            ),
        );
        c.register(
            AppFamily::Pdf,
            ToolDefinition::new(
                "pdf_zoomIn",
                "Zoom in on the PDF shown in a window.",
                window_schema(json!({ "amount": { "type": "number" } }), &[]),
            ),
        );
        c.register(
            AppFamily::Pdf,
            ToolDefinition::new(
                "pdf_openFile",
                "Open a PDF file in a window.",
                window_schema(json!({ "fileId": { "type": "string" } }), &["fileId"]),
            ),
        );
        c.register(
            AppFamily::Document,
            ToolDefinition::new(
                "docs_getContent",
                "Read the full content of the document loaded in a docs window.",
                window_schema(json!({}), &[]),
            ),
        );
        c.register(
            AppFamily::Document,
            ToolDefinition::new(
                "docs_insertText",
                "Insert text into the loaded document at a position (end of document if omitted).",
                window_schema(
                    json!({ "text": { "type": "string" }, "position": { "type": "integer" } }),
                    &["text"],
                ),
            ),
        );
        c.register(
            AppFamily::Document,
            ToolDefinition::new(
                "docs_openDocument",
                "Open an existing document in a docs window.",
                window_schema(json!({ "docId": { "type": "string" } }), &["docId"]),
            ),
        );
        c.register(
            AppFamily::Document,
            ToolDefinition::new(
                "docs_createDocument",
                "Create a new document and open it in a docs window.",
                window_schema(
                    json!({ "title": { "type": "string" }, "content": { "type": "string" } }),
                    &["title"],
                ),
            ),
        );
        c.register(
            AppFamily::Note,
            ToolDefinition::new(
                "notes_getContent",
                "Read the note shown in a notes window.",
                window_schema(json!({}), &[]),
            ),
        );
        c.register(
            AppFamily::Note,
            ToolDefinition::new(
                "notes_append",
                "Append text to the note shown in a notes window.",
                window_schema(json!({ "text": { "type": "string" } }), &["text"]),
            ),
        );
        c.register(
            AppFamily::Note,
            ToolDefinition::new(
                "notes_create",
                "Create a new note.",
                window_schema(
                    json!({ "title": { "type": "string" }, "content": { "type": "string" } }),
                    &[],
                ),
            ),
        );
        c
    }
}

// windowId and spaceId are filled in by the targeting resolver when missing.
fn window_schema(properties: Value, required: &[&str]) -> Value {
    let mut props = match properties {
        Value::Object(m) => m,
        _ => serde_json::Map::new(),
    };
    props.insert(
        "windowId".to_string(),
        json!({ "type": "string", "description": "Target window id" }),
    );
    props.insert(
        "spaceId".to_string(),
        json!({ "type": "string", "description": "Space containing the window" }),
    );
    json!({ "type": "object", "properties": props, "required": required })
}
