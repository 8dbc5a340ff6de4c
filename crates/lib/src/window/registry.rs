//! Window registry and entity index collaborators.
//!
//! The live window map is owned by the UI layer; the core only reads it. [`InMemoryWindowRegistry`]
//! is a standalone implementation for the CLI and tests that also publishes active-window
//! changes on a `tokio::sync::watch` channel.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::watch;

/// Metadata of one open window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowEntity {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Application tag (e.g. "pdfium", "docs", "notes", "browser").
    #[serde(default)]
    pub app_type: Option<String>,
    /// Entity shown in the window, when the app is backed by one.
    #[serde(default)]
    pub entity: Option<EntityRef>,
    #[serde(default)]
    pub application_state: ApplicationState,
}

/// Reference to a backing entity (either id form).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    #[serde(default, rename = "_id")]
    pub object_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl EntityRef {
    pub fn any_id(&self) -> Option<&str> {
        self.object_id.as_deref().or(self.id.as_deref())
    }
}

/// App-specific state published by each app.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdfium: Option<PdfiumState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docs: Option<DocsState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<NotesState>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PdfiumState {
    #[serde(default)]
    pub entity_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocsState {
    /// Set only while a document is loaded.
    #[serde(default)]
    pub active_doc_id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub current_doc_name: Option<String>,
    #[serde(default)]
    pub recent_docs: Vec<RecentDoc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecentDoc {
    pub doc_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotesState {
    #[serde(default)]
    pub active_note_id: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

impl WindowEntity {
    pub fn new(id: impl Into<String>, app_type: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: Some(title.into()),
            app_type: Some(app_type.into()),
            ..Default::default()
        }
    }

    /// True when a docs window has a document loaded.
    pub fn has_loaded_document(&self) -> bool {
        self.application_state
            .docs
            .as_ref()
            .and_then(|d| d.active_doc_id.as_deref())
            .map(|id| !id.is_empty())
            .unwrap_or(false)
    }

    /// Title shown to users and the model. Docs windows are named after their document.
    pub fn display_title(&self) -> String {
        if let Some(docs) = &self.application_state.docs {
            if let Some(name) = docs.current_doc_name.as_deref().filter(|n| !n.is_empty()) {
                return name.to_string();
            }
            if let Some(active) = docs.active_doc_id.as_deref() {
                if let Some(doc) = docs.recent_docs.iter().find(|d| d.doc_id == active) {
                    if !doc.name.is_empty() {
                        return doc.name.clone();
                    }
                }
            }
            return "Documents".to_string();
        }
        if let Some(t) = self.title.as_deref().filter(|t| !t.trim().is_empty()) {
            return t.to_string();
        }
        app_title(self.app_type.as_deref().unwrap_or(""))
    }
}

fn app_title(app_type: &str) -> String {
    match app_type {
        "chat" => "Chat".to_string(),
        "pdf" | "pdfium" => "PDF Viewer".to_string(),
        "docs" => "Documents".to_string(),
        "notes" => "Notes".to_string(),
        "browser" => "Browser".to_string(),
        _ => "Untitled".to_string(),
    }
}

/// Generic entity (file, note, etc.) that can be added to context without an open window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedEntity {
    pub id: String,
    pub name: String,
    pub entity_type: String,
}

/// Read-only view of the live window map.
pub trait WindowRegistry: Send + Sync {
    fn window(&self, id: &str) -> Option<WindowEntity>;
    /// All windows, in registry order.
    fn windows(&self) -> Vec<WindowEntity>;
    fn active_window_id(&self) -> Option<String>;
}

/// Read-only lookup of entities by id.
pub trait EntityIndex: Send + Sync {
    fn entity(&self, id: &str) -> Option<IndexedEntity>;
}

/// Window map kept in process, with an active-window watch channel.
pub struct InMemoryWindowRegistry {
    windows: RwLock<Vec<WindowEntity>>,
    active_tx: watch::Sender<Option<String>>,
}

impl Default for InMemoryWindowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryWindowRegistry {
    pub fn new() -> Self {
        let (active_tx, _) = watch::channel(None);
        Self {
            windows: RwLock::new(Vec::new()),
            active_tx,
        }
    }

    pub fn with_windows(windows: Vec<WindowEntity>, active: Option<String>) -> Self {
        let registry = Self::new();
        *registry.windows.write() = windows;
        registry.active_tx.send_replace(active);
        registry
    }

    /// Insert or replace a window (keeps its position when replacing).
    pub fn open(&self, window: WindowEntity) {
        let mut g = self.windows.write();
        match g.iter_mut().find(|w| w.id == window.id) {
            Some(existing) => *existing = window,
            None => g.push(window),
        }
    }

    /// Remove a window; clears the active id if it pointed at it.
    pub fn close(&self, id: &str) {
        self.windows.write().retain(|w| w.id != id);
        if self.active_tx.borrow().as_deref() == Some(id) {
            self.active_tx.send_replace(None);
        }
    }

    /// Apply an in-place edit to a window. Returns false if the id is unknown.
    pub fn update(&self, id: &str, f: impl FnOnce(&mut WindowEntity)) -> bool {
        let mut g = self.windows.write();
        match g.iter_mut().find(|w| w.id == id) {
            Some(w) => {
                f(w);
                true
            }
            None => false,
        }
    }

    pub fn set_active(&self, id: Option<String>) {
        self.active_tx.send_if_modified(|current| {
            if *current == id {
                false
            } else {
                *current = id;
                true
            }
        });
    }

    /// Receiver that yields on each active-window change.
    pub fn subscribe_active(&self) -> watch::Receiver<Option<String>> {
        self.active_tx.subscribe()
    }
}

impl WindowRegistry for InMemoryWindowRegistry {
    fn window(&self, id: &str) -> Option<WindowEntity> {
        self.windows.read().iter().find(|w| w.id == id).cloned()
    }

    fn windows(&self) -> Vec<WindowEntity> {
        self.windows.read().clone()
    }

    fn active_window_id(&self) -> Option<String> {
        self.active_tx.borrow().clone()
    }
}

/// Entity index kept in process.
#[derive(Default)]
pub struct InMemoryEntityIndex {
    entities: RwLock<HashMap<String, IndexedEntity>>,
}

impl InMemoryEntityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entity: IndexedEntity) {
        self.entities.write().insert(entity.id.clone(), entity);
    }
}

impl EntityIndex for InMemoryEntityIndex {
    fn entity(&self, id: &str) -> Option<IndexedEntity> {
        self.entities.read().get(id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docs_title_prefers_document_name() {
        let mut w = WindowEntity::new("w1", "docs", "ignored");
        w.application_state.docs = Some(DocsState {
            active_doc_id: Some("d1".into()),
            recent_docs: vec![RecentDoc {
                doc_id: "d1".into(),
                name: "Draft".into(),
            }],
            ..Default::default()
        });
        assert_eq!(w.display_title(), "Draft");
        assert!(w.has_loaded_document());

        w.application_state.docs.as_mut().unwrap().active_doc_id = None;
        assert_eq!(w.display_title(), "Documents");
        assert!(!w.has_loaded_document());
    }

    #[test]
    fn title_falls_back_to_app_name() {
        let mut w = WindowEntity::new("w1", "pdfium", "");
        assert_eq!(w.display_title(), "PDF Viewer");
        w.title = Some("paper.pdf".into());
        assert_eq!(w.display_title(), "paper.pdf");
    }

    #[tokio::test]
    async fn set_active_notifies_only_on_change() {
        let registry = InMemoryWindowRegistry::new();
        registry.open(WindowEntity::new("w1", "notes", "Notes"));
        let mut rx = registry.subscribe_active();

        registry.set_active(Some("w1".into()));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().as_deref(), Some("w1"));

        registry.set_active(Some("w1".into()));
        assert!(!rx.has_changed().unwrap());

        registry.close("w1");
        assert!(rx.has_changed().unwrap());
        assert_eq!(registry.active_window_id(), None);
        assert!(registry.window("w1").is_none());
    }

    #[test]
    fn open_replaces_in_place() {
        let registry = InMemoryWindowRegistry::new();
        registry.open(WindowEntity::new("a", "notes", "A"));
        registry.open(WindowEntity::new("b", "notes", "B"));
        registry.open(WindowEntity::new("a", "notes", "A2"));
        let ids: Vec<_> = registry.windows().into_iter().map(|w| w.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(registry.window("a").unwrap().title.as_deref(), Some("A2"));
    }
}
