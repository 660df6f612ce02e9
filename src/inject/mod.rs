//! Dev bootstrap injection.
//!
//! Each script chunk gets the client that fits its context's capabilities.
//! Capability mismatches are caught here, at build time, instead of failing
//! silently inside the browser.
//!
//! A client evaluates to the context's hot handle, bound as [`HOT_BINDING`].
//! Bundled code reaches it through `import.meta.hot`. The binding is module
//! scoped in ES module chunks and block scoped in classic scripts, so it
//! never lands on a global object.

mod fragments;

use std::collections::HashMap;

use crate::bundler::{Chunk, OutputFormat};
use crate::context::{Capabilities, ContextKind, ExecutionContext};
use crate::error::{CrxError, CrxResult};
use crate::manifest::{EntryKind, HMR_DIR};

/// Name the bundler substitutes for `import.meta.hot` in chunks that carry
/// a client.
pub const HOT_BINDING: &str = "__crxkit_hot";

/// What a fragment needs from its host context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Requirements {
    pub dynamic_code: bool,
    pub dom: bool,
    pub persistent_memory: bool,
}

impl Requirements {
    /// First requirement `caps` does not satisfy.
    fn unmet(&self, caps: &Capabilities) -> Option<&'static str> {
        if self.dynamic_code && !caps.can_eval_dynamic_code {
            Some("fragment requires dynamic code execution")
        } else if self.dom && !caps.can_access_dom {
            Some("fragment requires DOM access")
        } else if self.persistent_memory && !caps.can_persist_memory {
            Some("fragment requires persistent memory")
        } else {
            None
        }
    }
}

/// A bootstrap client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub name: String,
    pub source: String,
    pub requires: Requirements,
}

impl Fragment {
    pub fn new(name: impl Into<String>, source: impl Into<String>, requires: Requirements) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            requires,
        }
    }

    pub fn content_script() -> Self {
        Self::new(
            "content-script",
            fragments::CONTENT_SCRIPT_CLIENT,
            Requirements {
                dom: true,
                ..Default::default()
            },
        )
    }

    pub fn worker() -> Self {
        Self::new("worker", fragments::WORKER_CLIENT, Requirements::default())
    }

    pub fn page() -> Self {
        Self::new(
            "page",
            fragments::PAGE_CLIENT,
            Requirements {
                dynamic_code: true,
                dom: true,
                persistent_memory: false,
            },
        )
    }
}

/// Values substituted into the fragments.
#[derive(Debug, Clone)]
pub struct BootstrapSettings {
    /// WebSocket URL of the dev channel.
    pub hmr_url: String,
    /// HTTP origin of the dev server.
    pub origin: String,
}

/// Prepends bootstrap clients to chunks. A production injector is a no-op.
#[derive(Debug, Clone, Default)]
pub struct Injector {
    settings: Option<BootstrapSettings>,
    overrides: HashMap<ContextKind, Fragment>,
}

impl Injector {
    /// Injector for production builds: chunks pass through untouched.
    pub fn production() -> Self {
        Self::default()
    }

    pub fn dev(settings: BootstrapSettings) -> Self {
        Self {
            settings: Some(settings),
            overrides: HashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.is_some()
    }

    /// Use `fragment` for every context of `kind`. Custom fragments get the
    /// same checks as the built-in ones.
    pub fn with_fragment(mut self, kind: ContextKind, fragment: Fragment) -> Self {
        self.overrides.insert(kind, fragment);
        self
    }

    pub fn fragment_for(&self, context: &ExecutionContext) -> Fragment {
        if let Some(fragment) = self.overrides.get(&context.kind) {
            return fragment.clone();
        }
        match context.kind {
            ContextKind::ContentScript => Fragment::content_script(),
            ContextKind::Background if context.is_ephemeral_worker() => Fragment::worker(),
            _ => Fragment::page(),
        }
    }

    /// Rendered and checked bootstrap for `context`, or `None` in production.
    pub fn bootstrap(&self, context: &ExecutionContext) -> CrxResult<Option<String>> {
        let Some(settings) = &self.settings else {
            return Ok(None);
        };

        let fragment = self.fragment_for(context);
        let violation = |reason: String| CrxError::InjectionCapabilityViolation {
            context: context.id.clone(),
            fragment: fragment.name.clone(),
            reason,
        };

        if let Some(reason) = fragment.requires.unmet(&context.capabilities) {
            return Err(violation(reason.to_string()));
        }

        // Scanned before rendering: substituted values are string literals
        if !context.capabilities.can_eval_dynamic_code {
            if let Some(construct) = find_dynamic_code(&fragment.source) {
                return Err(violation(format!("contains {}", construct)));
            }
        }
        if !context.capabilities.can_persist_memory {
            if let Some(global) = find_global_write(&fragment.source) {
                return Err(violation(format!("writes global state through `{}`", global)));
            }
        }

        let source = render(&fragment.source, settings, &context.id)?;

        Ok(Some(format!(
            "/* crxkit:{} */\nconst {} = (() => {{\n{}\n}})();\n",
            fragment.name, HOT_BINDING, source
        )))
    }

    /// Chunk code with the context's bootstrap prepended.
    ///
    /// Styles and production chunks are returned unchanged.
    pub fn inject(&self, context: &ExecutionContext, chunk: &Chunk) -> CrxResult<String> {
        if chunk.kind != EntryKind::Script {
            return Ok(chunk.code.clone());
        }
        match (self.bootstrap(context)?, chunk.format) {
            (Some(bootstrap), OutputFormat::Esm) => Ok(format!("{}{}", bootstrap, chunk.code)),
            // Classic scripts share one global scope per world
            (Some(bootstrap), OutputFormat::Iife) => {
                Ok(format!("{{\n{}{}\n}}\n", bootstrap, chunk.code))
            }
            (None, _) => Ok(chunk.code.clone()),
        }
    }
}

fn render(source: &str, settings: &BootstrapSettings, context_id: &str) -> CrxResult<String> {
    let values = [
        ("__CRXKIT_HMR_URL__", settings.hmr_url.as_str()),
        ("__CRXKIT_ORIGIN__", settings.origin.as_str()),
        ("__CRXKIT_CONTEXT_ID__", context_id),
        ("__CRXKIT_HMR_DIR__", HMR_DIR),
    ];

    let mut rendered = source.to_string();
    for (placeholder, value) in values {
        if rendered.contains(placeholder) {
            rendered = rendered.replace(placeholder, &serde_json::to_string(value)?);
        }
    }
    Ok(rendered)
}

/// First construct in `source` that executes code built from a string.
///
/// `import()` is allowed only with a string literal or a
/// `chrome.runtime.getURL(...)` packaged-file URL.
pub fn find_dynamic_code(source: &str) -> Option<&'static str> {
    if find_call(source, "eval").is_some() {
        return Some("`eval`");
    }
    if source.contains("new Function") || find_call(source, "Function").is_some() {
        return Some("`Function` constructor");
    }
    for timer in ["setTimeout", "setInterval"] {
        let mut rest = source;
        while let Some(args) = find_call(rest, timer) {
            if args.trim_start().starts_with(['"', '\'', '`']) {
                return Some("string timer callback");
            }
            rest = args;
        }
    }

    let mut rest = source;
    while let Some(args) = find_call(rest, "import") {
        let arg = args.trim_start();
        let literal = arg.starts_with(['"', '\'']);
        let packaged = arg.starts_with("chrome.runtime.getURL(");
        if !literal && !packaged {
            return Some("`import()` of a runtime URL");
        }
        rest = args;
    }
    None
}

/// Text after `name(` for the first standalone call of `name`.
fn find_call<'a>(source: &'a str, name: &str) -> Option<&'a str> {
    let mut offset = 0;
    while let Some(pos) = source[offset..].find(name) {
        let start = offset + pos;
        let end = start + name.len();
        offset = end;

        let before = source[..start].chars().next_back();
        if before.is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '$' || c == '.') {
            continue;
        }
        let after = source[end..].trim_start();
        if let Some(args) = after.strip_prefix('(') {
            return Some(args);
        }
    }
    None
}

/// First assignment to a property of a global object.
fn find_global_write(source: &str) -> Option<&'static str> {
    for global in ["globalThis", "self", "window"] {
        let prefix = format!("{}.", global);
        let mut offset = 0;
        while let Some(pos) = source[offset..].find(&prefix) {
            let start = offset + pos;
            offset = start + prefix.len();

            let before = source[..start].chars().next_back();
            if before.is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '$' || c == '.') {
                continue;
            }
            let rest = &source[offset..];
            let property_end = rest
                .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '$'))
                .unwrap_or(rest.len());
            let after = rest[property_end..].trim_start();
            if after.starts_with('=') && !after.starts_with("==") && !after.starts_with("=>") {
                return Some(global);
            }
        }
    }
    None
}
