//! Execution-context classification.
//!
//! Each manifest role runs in its own isolated runtime with different rules
//! about DOM access, memory lifetime and dynamic code. Those rules are
//! captured once here as a [`Capabilities`] value so that injection and
//! update routing never re-derive them from the manifest.

use serde::Serialize;

use crate::manifest::{
    ContextId, EntryId, EntryRole, MatchPattern, ResolvedManifest, BACKGROUND,
};

/// The closed set of extension runtimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContextKind {
    Background,
    ContentScript,
    Popup,
    OptionsPage,
}

impl ContextKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextKind::Background => "background",
            ContextKind::ContentScript => "content-script",
            ContextKind::Popup => "popup",
            ContextKind::OptionsPage => "options-page",
        }
    }
}

/// How the background context is hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundModel {
    /// MV2 `persistent: true` (or unspecified) background page.
    PersistentPage,
    /// MV2 `persistent: false` event page.
    EventPage,
    /// MV3 service worker, terminated by the host at will.
    EphemeralWorker,
}

/// What code running in a context is allowed to rely on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub can_access_dom: bool,
    /// In-memory state survives for the whole session.
    pub can_persist_memory: bool,
    /// Code delivered at runtime may be executed.
    pub can_eval_dynamic_code: bool,
}

impl Capabilities {
    pub const PAGE: Capabilities = Capabilities {
        can_access_dom: true,
        can_persist_memory: true,
        can_eval_dynamic_code: true,
    };

    pub const CONTENT_SCRIPT: Capabilities = Capabilities {
        can_access_dom: true,
        can_persist_memory: false,
        can_eval_dynamic_code: false,
    };

    pub const EVENT_PAGE: Capabilities = Capabilities {
        can_access_dom: true,
        can_persist_memory: false,
        can_eval_dynamic_code: true,
    };

    pub const EPHEMERAL_WORKER: Capabilities = Capabilities {
        can_access_dom: false,
        can_persist_memory: false,
        can_eval_dynamic_code: false,
    };
}

/// One isolated runtime of the extension, derived from the manifest.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub id: ContextId,
    pub kind: ContextKind,
    pub capabilities: Capabilities,
    pub entries: Vec<EntryId>,
    /// Pages this context runs on (content scripts only).
    pub matches: Vec<MatchPattern>,
    pub exclude_matches: Vec<MatchPattern>,
    /// Set for the background context only.
    pub background_model: Option<BackgroundModel>,
}

impl ExecutionContext {
    /// Whether a page at `url` hosts this context.
    ///
    /// Non-content-script contexts are not tied to pages and always match.
    pub fn runs_on(&self, url: &str) -> bool {
        if self.kind != ContextKind::ContentScript {
            return true;
        }
        self.matches.iter().any(|p| p.matches(url))
            && !self.exclude_matches.iter().any(|p| p.matches(url))
    }

    pub fn is_ephemeral_worker(&self) -> bool {
        self.background_model == Some(BackgroundModel::EphemeralWorker)
    }
}

/// Classify every context declared by `resolved`.
///
/// Pure: the same manifest always yields the same contexts, in declaration
/// order.
pub fn classify(resolved: &ResolvedManifest) -> Vec<ExecutionContext> {
    let descriptor = &resolved.descriptor;
    let mut contexts: Vec<ExecutionContext> = Vec::new();

    for entry in &resolved.entries {
        let Some(context_id) = &entry.context else {
            continue;
        };

        if let Some(existing) = contexts.iter_mut().find(|c| &c.id == context_id) {
            existing.entries.push(entry.id.clone());
            continue;
        }

        let (kind, capabilities, background_model) = match entry.role {
            EntryRole::Background => {
                let model = background_model(resolved);
                let caps = match model {
                    BackgroundModel::EphemeralWorker => Capabilities::EPHEMERAL_WORKER,
                    BackgroundModel::EventPage => Capabilities::EVENT_PAGE,
                    BackgroundModel::PersistentPage => Capabilities::PAGE,
                };
                (ContextKind::Background, caps, Some(model))
            }
            EntryRole::ContentScript { .. } => {
                (ContextKind::ContentScript, Capabilities::CONTENT_SCRIPT, None)
            }
            EntryRole::Popup => (ContextKind::Popup, Capabilities::PAGE, None),
            EntryRole::Options => (ContextKind::OptionsPage, Capabilities::PAGE, None),
            EntryRole::Icon => continue,
        };

        let (matches, exclude_matches) = match entry.role {
            EntryRole::ContentScript { rule } => {
                let spec = &descriptor.content_scripts[rule];
                (parse_patterns(&spec.matches), parse_patterns(&spec.exclude_matches))
            }
            _ => (Vec::new(), Vec::new()),
        };

        contexts.push(ExecutionContext {
            id: context_id.clone(),
            kind,
            capabilities,
            entries: vec![entry.id.clone()],
            matches,
            exclude_matches,
            background_model,
        });
    }

    contexts
}

fn background_model(resolved: &ResolvedManifest) -> BackgroundModel {
    let descriptor = &resolved.descriptor;
    if descriptor.manifest_version >= 3 {
        return BackgroundModel::EphemeralWorker;
    }
    match descriptor.background.as_ref().and_then(|bg| bg.persistent) {
        Some(false) => BackgroundModel::EventPage,
        _ => BackgroundModel::PersistentPage,
    }
}

// Patterns were validated by the resolver.
fn parse_patterns(raw: &[String]) -> Vec<MatchPattern> {
    raw.iter()
        .filter_map(|p| MatchPattern::parse(p).ok())
        .collect()
}

/// Id of the background context, if the manifest declares one.
pub fn background_context(contexts: &[ExecutionContext]) -> Option<&ExecutionContext> {
    contexts.iter().find(|c| c.id == BACKGROUND)
}
