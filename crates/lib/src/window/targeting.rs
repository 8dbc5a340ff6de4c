//! Window targeting for tool calls.
//!
//! Tools are matched to windows by naming convention (`pdf_*`, `docs_*`, `notes_*`). Windows that
//! were explicitly added to the conversation context are always preferred; the full registry is
//! only scanned when no context window fits.

use serde_json::{Map, Value};

use super::content::{format_app_type, AppFamily};
use super::registry::{WindowEntity, WindowRegistry};
use crate::config::TargetingConfig;
use crate::context::SpaceContext;

/// Family a tool needs, from its name. `None` means the tool is not tied to a window type.
pub fn infer_tool_family(tool_name: &str) -> Option<AppFamily> {
    let name = tool_name.to_ascii_lowercase();
    if name.contains("pdf") {
        Some(AppFamily::Pdf)
    } else if name.contains("doc") {
        Some(AppFamily::Document)
    } else if name.contains("note") {
        Some(AppFamily::Note)
    } else {
        None
    }
}

/// Label used in user-facing messages ("PDF", "Document", "Note", or "compatible").
pub fn tool_type_label(tool_name: &str) -> &'static str {
    infer_tool_family(tool_name)
        .map(|f| f.label())
        .unwrap_or("compatible")
}

/// Whether a tool may run against a window of `app_type`. Document tools additionally require
/// the registry window to have a document loaded.
pub fn is_compatible(tool_name: &str, app_type: &str, window: Option<&WindowEntity>) -> bool {
    let Some(needed) = infer_tool_family(tool_name) else {
        return true;
    };
    if AppFamily::from_app_type(app_type) != Some(needed) {
        return false;
    }
    if needed == AppFamily::Document {
        let loaded = window.map(|w| w.has_loaded_document()).unwrap_or(false);
        if !loaded {
            log::debug!(
                "targeting: docs window {} has no document loaded",
                window.map(|w| w.id.as_str()).unwrap_or("?")
            );
        }
        return loaded;
    }
    true
}

/// Where a candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateSource {
    Context,
    Registry,
}

impl CandidateSource {
    fn as_str(&self) -> &'static str {
        match self {
            CandidateSource::Context => "context",
            CandidateSource::Registry => "space",
        }
    }
}

/// The chosen window for a tool call.
#[derive(Debug, Clone)]
pub struct WindowTarget {
    pub window_id: String,
    pub window: WindowEntity,
    pub score: u32,
    pub source: CandidateSource,
    pub reason: String,
}

/// Outcome of [`WindowTargetResolver::enhance_tool_input`].
#[derive(Debug, Clone, PartialEq)]
pub struct TargetingResult {
    pub input: Value,
    pub was_modified: bool,
    pub reason: Option<String>,
    pub error: Option<String>,
}

/// Scores candidates and repairs tool inputs.
#[derive(Debug, Clone, Copy, Default)]
pub struct WindowTargetResolver {
    scores: TargetingConfig,
}

impl WindowTargetResolver {
    pub fn new(scores: TargetingConfig) -> Self {
        Self { scores }
    }

    pub fn scores(&self) -> &TargetingConfig {
        &self.scores
    }

    /// Pick the best window for `tool_name`, or None when no compatible window exists.
    pub fn resolve(
        &self,
        tool_name: &str,
        context: &SpaceContext,
        registry: &dyn WindowRegistry,
        active_window_id: Option<&str>,
    ) -> Option<WindowTarget> {
        let windows = registry.windows();
        let lookup = |id: &str| windows.iter().find(|w| w.id == id);
        let mut candidates: Vec<WindowTarget> = Vec::new();

        for (window_id, content) in &context.window_contents {
            let Some(window) = lookup(window_id) else {
                continue;
            };
            if !is_compatible(tool_name, content.app_type(), Some(window)) {
                continue;
            }
            let mut score = self.scores.context_base;
            let mut reason = format!("context {}", format_app_type(content.app_type()));
            if active_window_id == Some(window_id.as_str()) {
                score += self.scores.active_bonus;
                reason = format!("active {}", reason);
            }
            if content.family() == Some(AppFamily::Pdf) && content.entity_id().is_some() {
                score += self.scores.entity_bonus;
            }
            candidates.push(WindowTarget {
                window_id: window_id.clone(),
                window: window.clone(),
                score,
                source: CandidateSource::Context,
                reason,
            });
        }

        if candidates.is_empty() {
            log::debug!(
                "targeting: no compatible context window for {}, scanning registry",
                tool_name
            );
            for window in &windows {
                if context.window_contents.contains_key(&window.id) {
                    continue;
                }
                let app_type = window.app_type.as_deref().unwrap_or("unknown");
                if !is_compatible(tool_name, app_type, Some(window)) {
                    continue;
                }
                let mut score = self.scores.registry_base;
                let mut reason = format!("space {}", format_app_type(app_type));
                if active_window_id == Some(window.id.as_str()) {
                    score += self.scores.active_bonus;
                    reason = format!("active {}", reason);
                }
                let has_entity = window.entity.is_some()
                    || window
                        .application_state
                        .pdfium
                        .as_ref()
                        .and_then(|p| p.entity_id.as_ref())
                        .is_some();
                if AppFamily::from_app_type(app_type) == Some(AppFamily::Pdf) && has_entity {
                    score += self.scores.entity_bonus;
                    reason.push_str(" (with entity)");
                }
                candidates.push(WindowTarget {
                    window_id: window.id.clone(),
                    window: window.clone(),
                    score,
                    source: CandidateSource::Registry,
                    reason,
                });
            }
        }

        // Stable sort: equal scores keep encounter order.
        candidates.sort_by(|a, b| b.score.cmp(&a.score));
        let best = candidates.into_iter().next()?;
        log::debug!(
            "targeting: {} -> {} (score {}, {}, from {})",
            tool_name,
            best.window_id,
            best.score,
            best.reason,
            best.source.as_str()
        );
        Some(best)
    }

    /// Force `spaceId` to the active space and make sure `windowId` names a compatible window.
    /// Never fails: resolution problems come back in `error`.
    pub fn enhance_tool_input(
        &self,
        tool_name: &str,
        original_input: &Value,
        context: &SpaceContext,
        registry: &dyn WindowRegistry,
        active_window_id: Option<&str>,
        active_space_id: Option<&str>,
    ) -> TargetingResult {
        let mut input: Map<String, Value> = match original_input {
            Value::Object(m) => m.clone(),
            _ => Map::new(),
        };
        let mut was_modified = !original_input.is_object() && !original_input.is_null();
        let mut reason: Option<String> = None;
        let mut error: Option<String> = None;

        if let Some(space_id) = active_space_id.filter(|s| !s.is_empty()) {
            if input.get("spaceId").and_then(Value::as_str) != Some(space_id) {
                log::debug!(
                    "targeting: spaceId {:?} replaced with active space {}",
                    input.get("spaceId"),
                    space_id
                );
                input.insert("spaceId".to_string(), Value::String(space_id.to_string()));
                was_modified = true;
            }
        }

        let current: Option<String> = input
            .get("windowId")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty() && *s != "undefined")
            .map(String::from);
        let in_context = current
            .as_deref()
            .and_then(|id| context.window_contents.get(id));
        let family = infer_tool_family(tool_name);

        match (current.as_deref(), in_context) {
            (Some(id), Some(content)) => {
                if !is_compatible(tool_name, content.app_type(), registry.window(id).as_ref()) {
                    log::debug!(
                        "targeting: window {} ({}) incompatible with {}",
                        id,
                        content.app_type(),
                        tool_name
                    );
                    match self.resolve(tool_name, context, registry, active_window_id) {
                        Some(target) => {
                            reason = Some(format!("Switched to compatible {} window", target.reason));
                            input.insert("windowId".to_string(), Value::String(target.window_id));
                            was_modified = true;
                        }
                        None => {
                            error = Some(if family == Some(AppFamily::Document)
                                && content.family() == Some(AppFamily::Document)
                            {
                                "The specified docs window has no document loaded. Please open a document first, or specify a different docs window with an active document.".to_string()
                            } else {
                                format!(
                                    "Tool {} requires a {} window, but the specified window is {}.",
                                    tool_name,
                                    tool_type_label(tool_name),
                                    format_app_type(content.app_type())
                                )
                            });
                        }
                    }
                }
            }
            _ => match self.resolve(tool_name, context, registry, active_window_id) {
                Some(target) => {
                    if current.as_deref() != Some(target.window_id.as_str()) {
                        reason = Some(format!(
                            "Selected {} window: {}",
                            target.reason,
                            target.window.display_title()
                        ));
                        input.insert("windowId".to_string(), Value::String(target.window_id));
                        was_modified = true;
                    }
                }
                None if family.is_none() => {}
                None => {
                    error = Some(no_window_error(tool_name, family, context));
                }
            },
        }

        if let Some(e) = &error {
            log::warn!("targeting: {}", e);
        }

        TargetingResult {
            input: Value::Object(input),
            was_modified,
            reason,
            error,
        }
    }
}

fn no_window_error(tool_name: &str, family: Option<AppFamily>, context: &SpaceContext) -> String {
    if family == Some(AppFamily::Document) {
        let docs_windows = context
            .window_contents
            .values()
            .filter(|c| c.family() == Some(AppFamily::Document))
            .count();
        if docs_windows > 0 {
            return format!(
                "Found {} docs window(s) in context, but none have documents loaded. Please open a document in one of the docs windows first.",
                docs_windows
            );
        }
        return "No document windows found in context. Please add a document window to context first.".to_string();
    }
    let label = tool_type_label(tool_name);
    format!(
        "No {} windows found in context. Please add a {} window to context first.",
        label, label
    )
}

/// Summary of the context for the model: active window first, then the rest, then usage hints.
pub fn describe_context(
    context: &SpaceContext,
    registry: &dyn WindowRegistry,
    active_window_id: Option<&str>,
) -> String {
    if context.window_contents.is_empty() {
        return "No windows currently in context. Ask the user to add relevant windows to the context first.".to_string();
    }

    let mut out = String::from("Workspace Context:\n");
    if let Some(active) = active_window_id {
        if let (Some(content), Some(window)) =
            (context.window_contents.get(active), registry.window(active))
        {
            out.push_str(&format!(
                "Active: \"{}\" ({}) [{}]\n",
                window.display_title(),
                format_app_type(content.app_type()),
                active
            ));
        }
    }

    let others: Vec<String> = context
        .window_contents
        .iter()
        .filter(|(id, _)| Some(id.as_str()) != active_window_id)
        .filter_map(|(id, content)| {
            registry.window(id).map(|w| {
                format!(
                    "- \"{}\" ({}) [{}]\n",
                    w.display_title(),
                    format_app_type(content.app_type()),
                    id
                )
            })
        })
        .collect();
    if !others.is_empty() {
        out.push_str("\nAvailable:\n");
        for line in others {
            out.push_str(&line);
        }
    }

    out.push_str("\nTool Usage:\n");
    out.push_str("- Always use the exact windowId from brackets above (e.g., [window-123])\n");
    out.push_str("- Use the Active window when user refers to 'this' or 'current' content\n");
    out.push_str("- If a tool fails due to wrong window type, request the user to open the correct type\n");
    out
}
