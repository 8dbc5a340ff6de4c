//! Normalized context entries.
//!
//! A [`WindowContent`] is the stable view of a window that is sent with each turn. App types are
//! folded into a closed set of kinds; anything unrecognized is carried through as `Generic`.

use serde::ser::{Serialize, SerializeMap, Serializer};
use sha2::{Digest, Sha256};

use super::registry::{IndexedEntity, WindowEntity};

/// Tool/window family derived from naming conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppFamily {
    Pdf,
    Document,
    Note,
}

impl AppFamily {
    /// Classify a window app type (case-insensitive).
    pub fn from_app_type(app_type: &str) -> Option<Self> {
        match app_type.trim().to_ascii_lowercase().as_str() {
            "pdf" | "pdfium" => Some(AppFamily::Pdf),
            "docs" | "doc" => Some(AppFamily::Document),
            "notes" | "note" => Some(AppFamily::Note),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AppFamily::Pdf => "PDF",
            AppFamily::Document => "Document",
            AppFamily::Note => "Note",
        }
    }
}

/// Display label for an app type (PDF, Document, Note, Browser, or capitalized passthrough).
pub fn format_app_type(app_type: &str) -> String {
    if app_type.is_empty() {
        return "Unknown".to_string();
    }
    if let Some(family) = AppFamily::from_app_type(app_type) {
        return family.label().to_string();
    }
    let lower = app_type.to_ascii_lowercase();
    if lower == "browser" {
        return "Browser".to_string();
    }
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// SHA-256 hex digest used to detect document changes between turns.
pub fn content_hash(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

/// App-specific part of a context entry.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentKind {
    Pdf {
        entity_id: Option<String>,
    },
    Docs {
        screen: String,
        doc_id: String,
        content: String,
        content_hash: String,
    },
    Notes {
        note_id: Option<String>,
        content: Option<String>,
        content_hash: Option<String>,
    },
    Generic {
        app_type: String,
    },
}

/// One window as seen by the conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowContent {
    pub window_id: String,
    /// Key that survives window-id churn for the same document.
    pub stable_id: String,
    pub title: String,
    pub is_active: bool,
    pub kind: ContentKind,
}

impl WindowContent {
    /// Normalized app type tag: "PDF", "docs", "notes", or the passthrough string.
    pub fn app_type(&self) -> &str {
        match &self.kind {
            ContentKind::Pdf { .. } => "PDF",
            ContentKind::Docs { .. } => "docs",
            ContentKind::Notes { .. } => "notes",
            ContentKind::Generic { app_type } => app_type,
        }
    }

    pub fn family(&self) -> Option<AppFamily> {
        AppFamily::from_app_type(self.app_type())
    }

    /// Entity id of a PDF entry, if known.
    pub fn entity_id(&self) -> Option<&str> {
        match &self.kind {
            ContentKind::Pdf { entity_id } => entity_id.as_deref(),
            _ => None,
        }
    }

    /// Build an entry from a live window. `is_active` starts false; the caller sets it.
    pub fn from_window(window: &WindowEntity) -> Self {
        let window_id = window.id.clone();
        let title = window.display_title();
        let app_type = window.app_type.clone().unwrap_or_default();
        let state = &window.application_state;

        let is_pdf = AppFamily::from_app_type(&app_type) == Some(AppFamily::Pdf)
            || state.pdfium.is_some()
            || window
                .title
                .as_deref()
                .map(|t| t.to_ascii_lowercase().contains(".pdf"))
                .unwrap_or(false);
        if is_pdf {
            let entity_id = state
                .pdfium
                .as_ref()
                .and_then(|p| p.entity_id.clone())
                .or_else(|| window.entity.as_ref().and_then(|e| e.any_id()).map(String::from));
            log::debug!(
                "context: window {} classified as PDF (entity {})",
                window_id,
                entity_id.as_deref().unwrap_or("unknown")
            );
            return Self {
                stable_id: format!("pdf-{}", entity_id.as_deref().unwrap_or(&window_id)),
                window_id,
                title,
                is_active: false,
                kind: ContentKind::Pdf { entity_id },
            };
        }

        if AppFamily::from_app_type(&app_type) == Some(AppFamily::Document) || state.docs.is_some() {
            let docs = state.docs.clone().unwrap_or_default();
            let doc_id = docs.active_doc_id.unwrap_or_default();
            let content = docs.content.unwrap_or_default();
            let hash = if content.is_empty() {
                String::new()
            } else {
                content_hash(&content)
            };
            let stable_key = if doc_id.is_empty() { &window_id } else { &doc_id };
            return Self {
                stable_id: format!("docs-{}", stable_key),
                window_id,
                title,
                is_active: false,
                kind: ContentKind::Docs {
                    screen: "doc".to_string(),
                    doc_id,
                    content,
                    content_hash: hash,
                },
            };
        }

        if AppFamily::from_app_type(&app_type) == Some(AppFamily::Note) {
            let notes = state.notes.clone().unwrap_or_default();
            let hash = notes.content.as_deref().map(content_hash);
            return Self {
                stable_id: format!(
                    "notes-{}",
                    notes.active_note_id.as_deref().unwrap_or(&window_id)
                ),
                window_id,
                title,
                is_active: false,
                kind: ContentKind::Notes {
                    note_id: notes.active_note_id,
                    content: notes.content,
                    content_hash: hash,
                },
            };
        }

        log::debug!("context: window {} kept as generic '{}'", window_id, app_type);
        Self {
            stable_id: format!("window-{}", window_id),
            window_id,
            title,
            is_active: false,
            kind: ContentKind::Generic {
                app_type: if app_type.is_empty() {
                    "unknown".to_string()
                } else {
                    app_type
                },
            },
        }
    }

    /// Build an entry from an indexed entity by treating it as a window of its entity type.
    pub fn from_entity(entity: &IndexedEntity) -> Self {
        let pseudo = WindowEntity {
            id: entity.id.clone(),
            title: Some(entity.name.clone()),
            app_type: Some(entity.entity_type.to_ascii_lowercase()),
            entity: Some(super::registry::EntityRef {
                object_id: None,
                id: Some(entity.id.clone()),
                name: Some(entity.name.clone()),
            }),
            ..Default::default()
        };
        Self::from_window(&pseudo)
    }
}

impl Serialize for WindowContent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("appType", self.app_type())?;
        map.serialize_entry("windowId", &self.window_id)?;
        map.serialize_entry("stableId", &self.stable_id)?;
        map.serialize_entry("title", &self.title)?;
        map.serialize_entry("isActive", &self.is_active)?;
        match &self.kind {
            ContentKind::Pdf { entity_id } => {
                map.serialize_entry("entityId", entity_id)?;
            }
            ContentKind::Docs {
                screen,
                doc_id,
                content,
                content_hash,
            } => {
                map.serialize_entry("screen", screen)?;
                map.serialize_entry("docId", doc_id)?;
                map.serialize_entry("content", content)?;
                map.serialize_entry("contentHash", content_hash)?;
            }
            ContentKind::Notes {
                note_id,
                content,
                content_hash,
            } => {
                if let Some(v) = note_id {
                    map.serialize_entry("noteId", v)?;
                }
                if let Some(v) = content {
                    map.serialize_entry("content", v)?;
                }
                if let Some(v) = content_hash {
                    map.serialize_entry("contentHash", v)?;
                }
            }
            ContentKind::Generic { .. } => {}
        }
        map.end()
    }
}
