//! Manifest validation and entry-point resolution.
//!
//! Every file the manifest references becomes an [`EntryPoint`] whose id is
//! derived from its role (`background`, `content-script[0].js[1]`, `popup`),
//! never from its path, so ids survive file moves between rebuilds.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use super::descriptor::ManifestDescriptor;
use super::match_pattern::MatchPattern;
use crate::error::{CrxError, CrxResult};

/// Stable role-derived identifier of a build entry point.
pub type EntryId = String;

/// Identifier of an execution context (`background`, `content-script[2]`, ...).
pub type ContextId = String;

pub const BACKGROUND: &str = "background";
pub const POPUP: &str = "popup";
pub const OPTIONS: &str = "options";

/// Context id for the content-script rule at `index`.
pub fn content_script_context(index: usize) -> ContextId {
    format!("content-script[{}]", index)
}

/// What kind of file an entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryKind {
    Script,
    Style,
    Html,
    Asset,
}

/// The manifest role an entry was declared under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryRole {
    Background,
    ContentScript { rule: usize },
    Popup,
    Options,
    Icon,
}

/// A manifest file reference resolved against the project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub id: EntryId,
    /// Owning execution context; `None` for manifest-level assets (icons).
    pub context: Option<ContextId>,
    pub role: EntryRole,
    pub kind: EntryKind,
    /// Path relative to the root, `/`-separated.
    pub source: PathBuf,
    /// The reference exactly as written, for rewriting HTML and the manifest.
    pub reference: String,
    /// The HTML page that pulled this script in, if any.
    pub parent: Option<EntryId>,
}

/// A validated manifest together with all of its entry points.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    pub descriptor: ManifestDescriptor,
    pub root: PathBuf,
    pub entries: Vec<EntryPoint>,
}

impl ResolvedManifest {
    pub fn entry(&self, id: &str) -> Option<&EntryPoint> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn entries_for_context<'a>(
        &'a self,
        context: &'a str,
    ) -> impl Iterator<Item = &'a EntryPoint> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.context.as_deref() == Some(context))
    }

    /// Context ids in declaration order, without duplicates.
    pub fn context_ids(&self) -> Vec<ContextId> {
        let mut ids: Vec<ContextId> = Vec::new();
        for ctx in self.entries.iter().filter_map(|e| e.context.as_ref()) {
            if !ids.contains(ctx) {
                ids.push(ctx.clone());
            }
        }
        ids
    }

    /// Entries the bundler has to compile (scripts and styles).
    pub fn bundle_entries(&self) -> impl Iterator<Item = &EntryPoint> {
        self.entries
            .iter()
            .filter(|e| matches!(e.kind, EntryKind::Script | EntryKind::Style))
    }

    /// Whether `path` (relative to the root) is referenced by the manifest
    /// as something other than a bundled module.
    pub fn is_manifest_asset(&self, path: &Path) -> bool {
        self.entries
            .iter()
            .any(|e| e.source == path && matches!(e.kind, EntryKind::Html | EntryKind::Asset))
    }
}

/// Resolves manifest descriptors against a project root.
#[derive(Debug, Clone)]
pub struct ManifestResolver {
    root: PathBuf,
}

impl ManifestResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read, parse, validate and resolve the manifest at `path`.
    pub fn load(&self, path: &Path) -> CrxResult<ResolvedManifest> {
        if !path.exists() {
            return Err(CrxError::ManifestNotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path)?;
        let descriptor = ManifestDescriptor::parse(&content)?;
        self.resolve(descriptor)
    }

    /// Validate `descriptor` and resolve each file reference to an entry.
    pub fn resolve(&self, descriptor: ManifestDescriptor) -> CrxResult<ResolvedManifest> {
        validate(&descriptor)?;

        let mut entries = Vec::new();

        if let Some(bg) = &descriptor.background {
            if let Some(worker) = &bg.service_worker {
                entries.push(self.entry(
                    BACKGROUND,
                    Some(BACKGROUND),
                    EntryRole::Background,
                    EntryKind::Script,
                    worker,
                    "background.service_worker",
                )?);
            }
            for (j, script) in bg.scripts.iter().enumerate() {
                entries.push(self.entry(
                    &format!("background.scripts[{}]", j),
                    Some(BACKGROUND),
                    EntryRole::Background,
                    EntryKind::Script,
                    script,
                    &format!("background.scripts[{}]", j),
                )?);
            }
            if let Some(page) = &bg.page {
                self.push_page(&mut entries, "background.page", BACKGROUND, EntryRole::Background, page)?;
            }
        }

        for (i, rule) in descriptor.content_scripts.iter().enumerate() {
            let context = content_script_context(i);
            for (j, js) in rule.js.iter().enumerate() {
                let key = format!("content_scripts[{}].js[{}]", i, j);
                entries.push(self.entry(
                    &format!("{}.js[{}]", context, j),
                    Some(&context),
                    EntryRole::ContentScript { rule: i },
                    EntryKind::Script,
                    js,
                    &key,
                )?);
            }
            for (j, css) in rule.css.iter().enumerate() {
                let key = format!("content_scripts[{}].css[{}]", i, j);
                entries.push(self.entry(
                    &format!("{}.css[{}]", context, j),
                    Some(&context),
                    EntryRole::ContentScript { rule: i },
                    EntryKind::Style,
                    css,
                    &key,
                )?);
            }
        }

        if let Some(popup) = descriptor.popup() {
            self.push_page(&mut entries, POPUP, POPUP, EntryRole::Popup, popup)?;
        }

        if let Some(options) = descriptor.options() {
            self.push_page(&mut entries, OPTIONS, OPTIONS, EntryRole::Options, options)?;
        }

        for (size, icon) in &descriptor.icons {
            entries.push(self.entry(
                &format!("icons.{}", size),
                None,
                EntryRole::Icon,
                EntryKind::Asset,
                icon,
                &format!("icons.{}", size),
            )?);
        }

        Ok(ResolvedManifest {
            descriptor,
            root: self.root.clone(),
            entries,
        })
    }

    fn entry(
        &self,
        id: &str,
        context: Option<&str>,
        role: EntryRole,
        kind: EntryKind,
        reference: &str,
        key_path: &str,
    ) -> CrxResult<EntryPoint> {
        let source = normalize_reference(Path::new(""), reference, key_path)?;
        self.check_exists(id, &source)?;

        Ok(EntryPoint {
            id: id.to_string(),
            context: context.map(str::to_string),
            role,
            kind,
            source,
            reference: reference.to_string(),
            parent: None,
        })
    }

    /// Push an HTML page entry plus one script entry per `<script src>`.
    fn push_page(
        &self,
        entries: &mut Vec<EntryPoint>,
        id: &str,
        context: &str,
        role: EntryRole,
        reference: &str,
    ) -> CrxResult<()> {
        let page = self.entry(id, Some(context), role, EntryKind::Html, reference, id)?;
        let html = fs::read_to_string(self.root.join(&page.source))?;
        let page_dir = page.source.parent().unwrap_or(Path::new("")).to_path_buf();

        let mut scripts = Vec::new();
        for (k, src) in extract_script_sources(&html).into_iter().enumerate() {
            let script_id = format!("{}.script[{}]", id, k);
            let source = normalize_reference(&page_dir, &src, &script_id)?;
            self.check_exists(&script_id, &source)?;
            scripts.push(EntryPoint {
                id: script_id,
                context: Some(context.to_string()),
                role,
                kind: EntryKind::Script,
                source,
                reference: src,
                parent: Some(page.id.clone()),
            });
        }

        entries.push(page);
        entries.extend(scripts);
        Ok(())
    }

    fn check_exists(&self, id: &str, source: &Path) -> CrxResult<()> {
        let full = self.root.join(source);
        if full.is_file() {
            Ok(())
        } else {
            Err(CrxError::EntryResolution {
                entry: id.to_string(),
                path: full,
            })
        }
    }
}

/// Check schema-version-dependent rules.
pub fn validate(manifest: &ManifestDescriptor) -> CrxResult<()> {
    let mv = manifest.manifest_version;
    if mv != 2 && mv != 3 {
        return Err(CrxError::manifest(
            "manifest_version",
            format!("unsupported version {} (expected 2 or 3)", mv),
        ));
    }

    if manifest.name.trim().is_empty() {
        return Err(CrxError::manifest("name", "must not be empty"));
    }
    validate_version(&manifest.version)?;

    if let Some(bg) = &manifest.background {
        if mv == 3 {
            if !bg.scripts.is_empty() {
                return Err(CrxError::manifest(
                    "background.scripts",
                    "not allowed in manifest_version 3; use background.service_worker",
                ));
            }
            if bg.page.is_some() {
                return Err(CrxError::manifest(
                    "background.page",
                    "not allowed in manifest_version 3; use background.service_worker",
                ));
            }
            if bg.persistent.is_some() {
                return Err(CrxError::manifest(
                    "background.persistent",
                    "service workers are never persistent",
                ));
            }
            if bg.service_worker.is_none() {
                return Err(CrxError::manifest(
                    "background.service_worker",
                    "required when background is declared",
                ));
            }
            if let Some(kind) = &bg.worker_type {
                if kind != "module" && kind != "classic" {
                    return Err(CrxError::manifest(
                        "background.type",
                        format!("expected \"module\" or \"classic\", got \"{}\"", kind),
                    ));
                }
            }
        } else {
            if bg.service_worker.is_some() {
                return Err(CrxError::manifest(
                    "background.service_worker",
                    "requires manifest_version 3",
                ));
            }
            if !bg.scripts.is_empty() && bg.page.is_some() {
                return Err(CrxError::manifest(
                    "background",
                    "scripts and page are mutually exclusive",
                ));
            }
            if bg.scripts.is_empty() && bg.page.is_none() {
                return Err(CrxError::manifest(
                    "background",
                    "expected background.scripts or background.page",
                ));
            }
        }
    }

    if mv == 3 && manifest.browser_action.is_some() {
        return Err(CrxError::manifest(
            "browser_action",
            "replaced by action in manifest_version 3",
        ));
    }
    if mv == 2 && manifest.action.is_some() {
        return Err(CrxError::manifest("action", "requires manifest_version 3"));
    }

    for (i, rule) in manifest.content_scripts.iter().enumerate() {
        if rule.matches.is_empty() {
            return Err(CrxError::manifest(
                format!("content_scripts[{}].matches", i),
                "must list at least one match pattern",
            ));
        }
        for (j, pattern) in rule.matches.iter().enumerate() {
            MatchPattern::parse(pattern).map_err(|reason| {
                CrxError::manifest(format!("content_scripts[{}].matches[{}]", i, j), reason)
            })?;
        }
        for (j, pattern) in rule.exclude_matches.iter().enumerate() {
            MatchPattern::parse(pattern).map_err(|reason| {
                CrxError::manifest(
                    format!("content_scripts[{}].exclude_matches[{}]", i, j),
                    reason,
                )
            })?;
        }
        if rule.js.is_empty() && rule.css.is_empty() {
            return Err(CrxError::manifest(
                format!("content_scripts[{}]", i),
                "must declare at least one js or css file",
            ));
        }
    }

    for size in manifest.icons.keys() {
        if size.parse::<u32>().map_or(true, |px| px == 0) {
            return Err(CrxError::manifest(
                format!("icons.{}", size),
                "icon keys must be pixel sizes",
            ));
        }
    }

    if manifest.options_page.is_some() && manifest.options_ui.is_some() {
        return Err(CrxError::manifest(
            "options_ui",
            "options_page and options_ui.page are mutually exclusive",
        ));
    }

    Ok(())
}

fn validate_version(version: &str) -> CrxResult<()> {
    let parts: Vec<&str> = version.split('.').collect();
    let valid = (1..=4).contains(&parts.len())
        && parts.iter().all(|p| {
            !p.is_empty()
                && p.chars().all(|c| c.is_ascii_digit())
                && (p.len() == 1 || !p.starts_with('0'))
                && p.parse::<u32>().map_or(false, |n| n <= 65535)
        });

    if valid {
        Ok(())
    } else {
        Err(CrxError::manifest(
            "version",
            format!("'{}' must be 1-4 dot-separated integers (0-65535)", version),
        ))
    }
}

/// Turn a manifest or HTML reference into a root-relative path.
///
/// A leading `/` means root-relative; anything else is relative to `base`.
fn normalize_reference(base: &Path, reference: &str, key_path: &str) -> CrxResult<PathBuf> {
    if reference.trim().is_empty() {
        return Err(CrxError::manifest(key_path, "file reference is empty"));
    }

    let (start, rest) = match reference.strip_prefix('/') {
        Some(rest) => (PathBuf::new(), rest),
        None => (base.to_path_buf(), reference),
    };

    let mut out = start;
    for component in Path::new(rest).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return Err(CrxError::manifest(
                        key_path,
                        format!("'{}' escapes the project root", reference),
                    ));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(CrxError::manifest(
                    key_path,
                    format!("'{}' must be a relative path", reference),
                ));
            }
        }
    }

    Ok(out)
}

/// Collect local `src` attributes of `<script>` tags.
pub(crate) fn extract_script_sources(html: &str) -> Vec<String> {
    let lower = html.to_ascii_lowercase();
    let mut sources = Vec::new();
    let mut cursor = 0;

    while let Some(start) = lower[cursor..].find("<script") {
        let tag_start = cursor + start;
        let Some(end) = lower[tag_start..].find('>') else {
            break;
        };
        let tag_end = tag_start + end;
        let tag = &html[tag_start..tag_end];

        if let Some(src) = attribute(tag, "src") {
            let remote = src.starts_with("http:")
                || src.starts_with("https:")
                || src.starts_with("//")
                || src.starts_with("data:");
            if !remote && !src.is_empty() {
                sources.push(src);
            }
        }
        cursor = tag_end;
    }

    sources
}

/// Point `<script src>` references at their emitted files.
///
/// `replacements` maps the original `src` value to the new one. Rewritten tags
/// are marked `type="module"`.
pub(crate) fn rewrite_script_sources(html: &str, replacements: &BTreeMap<String, String>) -> String {
    let lower = html.to_ascii_lowercase();
    let mut out = String::with_capacity(html.len());
    let mut cursor = 0;

    while let Some(start) = lower[cursor..].find("<script") {
        let tag_start = cursor + start;
        let Some(end) = lower[tag_start..].find('>') else {
            break;
        };
        let tag_end = tag_start + end;
        let tag = &html[tag_start..tag_end];

        out.push_str(&html[cursor..tag_start]);
        match attribute(tag, "src").and_then(|src| replacements.get(&src).map(|new| (src, new))) {
            Some((src, new)) => {
                let mut rewritten = tag.replacen(&src, new, 1);
                if attribute(tag, "type").as_deref() != Some("module") {
                    rewritten = rewritten.replacen("<script", "<script type=\"module\"", 1);
                }
                out.push_str(&rewritten);
            }
            None => out.push_str(tag),
        }
        cursor = tag_end;
    }

    out.push_str(&html[cursor..]);
    out
}

/// Value of `name="..."` / `name='...'` inside a tag.
fn attribute(tag: &str, name: &str) -> Option<String> {
    let lower = tag.to_ascii_lowercase();
    let needle = format!("{}=", name);
    let mut search = 0;

    while let Some(pos) = lower[search..].find(&needle) {
        let at = search + pos;
        let boundary = at == 0 || lower.as_bytes()[at - 1].is_ascii_whitespace();
        let value_start = at + needle.len();
        search = value_start;
        if !boundary {
            continue;
        }

        let rest = &tag[value_start..];
        let quote = rest.chars().next()?;
        if quote == '"' || quote == '\'' {
            let inner = &rest[1..];
            return inner.find(quote).map(|end| inner[..end].to_string());
        }
        let end = rest
            .find(|c: char| c.is_ascii_whitespace())
            .unwrap_or(rest.len());
        return Some(rest[..end].to_string());
    }
    None
}
