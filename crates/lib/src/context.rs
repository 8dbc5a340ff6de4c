//! Conversation context: the windows explicitly added to the active conversation.
//!
//! [`ContextStore`] is a cheap-to-clone handle; entries are kept behind `Arc` so that an
//! active-window flip replaces only the entries whose `isActive` actually changed.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::window::{AppFamily, EntityIndex, WindowContent, WindowRegistry};

/// Text the user pasted from a window, carried with the next turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub text: String,
    pub source: SelectionSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionSource {
    pub window_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// The context aggregate sent with every generation request.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceContext {
    pub space_id: String,
    pub window_contents: BTreeMap<String, Arc<WindowContent>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_selection: Option<Selection>,
    /// Cache-busting marker set after a tool changed a window's content.
    #[serde(rename = "_refreshTimestamp", skip_serializing_if = "Option::is_none")]
    pub refresh_timestamp: Option<i64>,
}

impl SpaceContext {
    pub fn new(space_id: impl Into<String>) -> Self {
        Self {
            space_id: space_id.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.window_contents.is_empty()
    }

    /// Distinct app families present, in first-seen order.
    pub fn families(&self) -> Vec<AppFamily> {
        let mut out = Vec::new();
        for family in self.window_contents.values().filter_map(|c| c.family()) {
            if !out.contains(&family) {
                out.push(family);
            }
        }
        out
    }
}

struct Inner {
    space_id: String,
    contents: BTreeMap<String, Arc<WindowContent>>,
    pasted: Option<Selection>,
    refresh_timestamp: Option<i64>,
}

/// Owner of the context map for one space.
#[derive(Clone)]
pub struct ContextStore {
    inner: Arc<RwLock<Inner>>,
    registry: Arc<dyn WindowRegistry>,
    entities: Option<Arc<dyn EntityIndex>>,
}

impl ContextStore {
    pub fn new(registry: Arc<dyn WindowRegistry>, space_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                space_id: space_id.into(),
                contents: BTreeMap::new(),
                pasted: None,
                refresh_timestamp: None,
            })),
            registry,
            entities: None,
        }
    }

    /// Also look ids up in `index` when they are not open windows.
    pub fn with_entity_index(mut self, index: Arc<dyn EntityIndex>) -> Self {
        self.entities = Some(index);
        self
    }

    pub fn registry(&self) -> &Arc<dyn WindowRegistry> {
        &self.registry
    }

    pub fn space_id(&self) -> String {
        self.inner.read().space_id.clone()
    }

    /// Switch spaces. Entries from the previous space are dropped. Returns true if the space changed.
    pub fn set_active_space(&self, space_id: &str) -> bool {
        let mut g = self.inner.write();
        if g.space_id == space_id {
            return false;
        }
        log::info!(
            "context: space {} -> {}, dropping {} entries",
            g.space_id,
            space_id,
            g.contents.len()
        );
        g.space_id = space_id.to_string();
        g.contents.clear();
        g.pasted = None;
        g.refresh_timestamp = None;
        true
    }

    /// Add (or refresh) a window or indexed entity. Returns false when the id is unknown to both.
    pub fn add_window_to_context(&self, window_id: &str) -> bool {
        let mut content = match self.registry.window(window_id) {
            Some(window) => WindowContent::from_window(&window),
            None => match self.entities.as_ref().and_then(|idx| idx.entity(window_id)) {
                Some(entity) => WindowContent::from_entity(&entity),
                None => {
                    log::warn!("context: {} is neither an open window nor a known entity", window_id);
                    return false;
                }
            },
        };
        content.is_active = self.registry.active_window_id().as_deref() == Some(window_id);

        let mut g = self.inner.write();
        match g.contents.get(window_id) {
            Some(existing) if **existing == content => {}
            _ => {
                log::debug!("context: added {} as {}", window_id, content.app_type());
                g.contents.insert(window_id.to_string(), Arc::new(content));
            }
        }
        true
    }

    /// Drop an entry. Returns whether it was present.
    pub fn remove_window_content(&self, window_id: &str) -> bool {
        self.inner.write().contents.remove(window_id).is_some()
    }

    /// Apply a partial update to an existing entry.
    pub fn set_window_content(&self, window_id: &str, update: impl FnOnce(&mut WindowContent)) -> bool {
        let mut g = self.inner.write();
        match g.contents.get_mut(window_id) {
            Some(entry) => {
                update(Arc::make_mut(entry));
                true
            }
            None => false,
        }
    }

    /// Mirror the registry's active window onto `isActive`. Only entries whose flag changes are
    /// replaced. Returns how many were flipped.
    pub fn apply_active_window(&self, active_window_id: Option<&str>) -> usize {
        let mut g = self.inner.write();
        let mut flipped = 0;
        for (id, entry) in g.contents.iter_mut() {
            let should_be_active = active_window_id == Some(id.as_str());
            if entry.is_active != should_be_active {
                Arc::make_mut(entry).is_active = should_be_active;
                flipped += 1;
            }
        }
        flipped
    }

    pub fn contains(&self, window_id: &str) -> bool {
        self.inner.read().contents.contains_key(window_id)
    }

    pub fn entry(&self, window_id: &str) -> Option<Arc<WindowContent>> {
        self.inner.read().contents.get(window_id).cloned()
    }

    pub fn window_ids(&self) -> Vec<String> {
        self.inner.read().contents.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().contents.is_empty()
    }

    pub fn clear(&self) {
        self.inner.write().contents.clear();
    }

    pub fn set_pasted_context(&self, selection: Selection) {
        self.inner.write().pasted = Some(selection);
    }

    pub fn pasted_context(&self) -> Option<Selection> {
        self.inner.read().pasted.clone()
    }

    pub fn clear_pasted_context(&self) {
        self.inner.write().pasted = None;
    }

    /// Mark the context as changed by a tool. Timestamps strictly increase.
    pub fn bump_refresh(&self) -> i64 {
        let mut g = self.inner.write();
        let now = chrono::Utc::now().timestamp_millis();
        let next = match g.refresh_timestamp {
            Some(prev) if prev >= now => prev + 1,
            _ => now,
        };
        g.refresh_timestamp = Some(next);
        next
    }

    /// Copy of the current context for a request. Entries are shared, not deep-cloned.
    pub fn snapshot(&self) -> SpaceContext {
        let g = self.inner.read();
        SpaceContext {
            space_id: g.space_id.clone(),
            window_contents: g.contents.clone(),
            current_selection: g.pasted.clone(),
            refresh_timestamp: g.refresh_timestamp,
        }
    }
}

/// Follow the registry's active window until the sender is dropped.
pub fn spawn_active_window_sync(
    store: ContextStore,
    mut active: watch::Receiver<Option<String>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let current = active.borrow_and_update().clone();
            let flipped = store.apply_active_window(current.as_deref());
            if flipped > 0 {
                log::debug!(
                    "context: active window {} ({} entries updated)",
                    current.as_deref().unwrap_or("none"),
                    flipped
                );
            }
            if active.changed().await.is_err() {
                break;
            }
        }
    })
}
