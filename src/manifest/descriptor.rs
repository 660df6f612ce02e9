//! Typed view of `manifest.json`.
//!
//! Parsing goes section by section so that a malformed value produces a
//! diagnostic naming the exact key path instead of a line/column.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CrxError, CrxResult};

/// Parsed extension manifest.
///
/// `raw` keeps the original document so the emitter can preserve keys this
/// struct does not model.
#[derive(Debug, Clone, PartialEq)]
pub struct ManifestDescriptor {
    pub manifest_version: u8,
    pub name: String,
    pub version: String,
    pub background: Option<BackgroundSpec>,
    pub content_scripts: Vec<ContentScriptSpec>,
    /// MV3 `action`.
    pub action: Option<ActionSpec>,
    /// MV2 `browser_action`.
    pub browser_action: Option<ActionSpec>,
    pub options_page: Option<String>,
    pub options_ui: Option<OptionsUiSpec>,
    /// Pixel size (as written in the manifest) to image path.
    pub icons: BTreeMap<String, String>,
    pub permissions: Vec<String>,
    pub host_permissions: Vec<String>,
    pub raw: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackgroundSpec {
    #[serde(default)]
    pub service_worker: Option<String>,

    #[serde(default)]
    pub scripts: Vec<String>,

    #[serde(default)]
    pub page: Option<String>,

    #[serde(default)]
    pub persistent: Option<bool>,

    /// `"module"` for an ES module service worker.
    #[serde(rename = "type", default)]
    pub worker_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentScriptSpec {
    #[serde(default)]
    pub matches: Vec<String>,

    #[serde(default)]
    pub exclude_matches: Vec<String>,

    #[serde(default)]
    pub js: Vec<String>,

    #[serde(default)]
    pub css: Vec<String>,

    #[serde(default)]
    pub run_at: Option<RunAt>,

    #[serde(default)]
    pub all_frames: Option<bool>,
}

/// When a content script is injected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunAt {
    DocumentStart,
    DocumentEnd,
    #[default]
    DocumentIdle,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(default)]
    pub default_popup: Option<String>,

    #[serde(default)]
    pub default_title: Option<String>,

    /// Either a single path or a size map.
    #[serde(default)]
    pub default_icon: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionsUiSpec {
    pub page: String,

    #[serde(default)]
    pub open_in_tab: Option<bool>,
}

impl ManifestDescriptor {
    /// Parse a manifest from JSON text.
    pub fn parse(content: &str) -> CrxResult<Self> {
        let value: Value = serde_json::from_str(content)
            .map_err(|e| CrxError::manifest("$", format!("not valid JSON: {}", e)))?;
        Self::from_value(value)
    }

    /// Parse a manifest from an already-decoded JSON document.
    pub fn from_value(raw: Value) -> CrxResult<Self> {
        let obj = raw
            .as_object()
            .ok_or_else(|| CrxError::manifest("$", "manifest must be a JSON object"))?;

        let manifest_version: u8 = required(obj, "manifest_version")?;
        let name: String = required(obj, "name")?;
        let version: String = required(obj, "version")?;

        let content_scripts = match obj.get("content_scripts") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .enumerate()
                .map(|(i, item)| decode(item, &format!("content_scripts[{}]", i)))
                .collect::<CrxResult<Vec<_>>>()?,
            Some(_) => return Err(CrxError::manifest("content_scripts", "expected an array")),
        };

        Ok(Self {
            manifest_version,
            name,
            version,
            background: optional(obj, "background")?,
            content_scripts,
            action: optional(obj, "action")?,
            browser_action: optional(obj, "browser_action")?,
            options_page: optional(obj, "options_page")?,
            options_ui: optional(obj, "options_ui")?,
            icons: optional(obj, "icons")?.unwrap_or_default(),
            permissions: optional(obj, "permissions")?.unwrap_or_default(),
            host_permissions: optional(obj, "host_permissions")?.unwrap_or_default(),
            raw,
        })
    }

    /// The popup declared for this schema version, if any.
    pub fn popup(&self) -> Option<&str> {
        let action = if self.manifest_version >= 3 {
            self.action.as_ref()
        } else {
            self.browser_action.as_ref()
        };
        action.and_then(|a| a.default_popup.as_deref())
    }

    /// The options page from either `options_ui.page` or `options_page`.
    pub fn options(&self) -> Option<&str> {
        self.options_ui
            .as_ref()
            .map(|ui| ui.page.as_str())
            .or(self.options_page.as_deref())
    }
}

fn decode<T: DeserializeOwned>(value: &Value, key_path: &str) -> CrxResult<T> {
    T::deserialize(value).map_err(|e| CrxError::manifest(key_path, e.to_string()))
}

fn required<T: DeserializeOwned>(obj: &Map<String, Value>, key: &str) -> CrxResult<T> {
    match obj.get(key) {
        None | Some(Value::Null) => Err(CrxError::manifest(key, "required key is missing")),
        Some(value) => decode(value, key),
    }
}

fn optional<T: DeserializeOwned>(obj: &Map<String, Value>, key: &str) -> CrxResult<Option<T>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => decode(value, key).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_manifest() {
        let manifest = ManifestDescriptor::parse(
            r#"{"manifest_version": 3, "name": "Test", "version": "1.0.0"}"#,
        )
        .unwrap();

        assert_eq!(manifest.manifest_version, 3);
        assert_eq!(manifest.name, "Test");
        assert!(manifest.background.is_none());
        assert!(manifest.content_scripts.is_empty());
        assert!(manifest.icons.is_empty());
    }

    #[test]
    fn test_parse_full_manifest() {
        let manifest = ManifestDescriptor::parse(
            r#"{
                "manifest_version": 3,
                "name": "Reader",
                "version": "1.2.3",
                "background": { "service_worker": "src/background.ts", "type": "module" },
                "content_scripts": [
                    { "matches": ["*://example.com/*"], "js": ["src/content.ts"], "run_at": "document_start" }
                ],
                "action": { "default_popup": "popup.html" },
                "options_ui": { "page": "options.html", "open_in_tab": true },
                "icons": { "16": "icons/16.png", "128": "icons/128.png" },
                "permissions": ["storage", "tabs"],
                "host_permissions": ["https://api.example.com/*"],
                "minimum_chrome_version": "110"
            }"#,
        )
        .unwrap();

        let bg = manifest.background.as_ref().unwrap();
        assert_eq!(bg.service_worker.as_deref(), Some("src/background.ts"));
        assert_eq!(bg.worker_type.as_deref(), Some("module"));
        assert_eq!(manifest.content_scripts[0].run_at, Some(RunAt::DocumentStart));
        assert_eq!(manifest.popup(), Some("popup.html"));
        assert_eq!(manifest.options(), Some("options.html"));
        assert_eq!(manifest.icons.len(), 2);
        assert_eq!(manifest.permissions, vec!["storage", "tabs"]);
        assert_eq!(manifest.raw["minimum_chrome_version"], "110");
    }

    #[test]
    fn test_missing_required_key_names_path() {
        let err = ManifestDescriptor::parse(r#"{"manifest_version": 3, "version": "1"}"#)
            .unwrap_err();
        match err {
            CrxError::ManifestValidation { key_path, .. } => assert_eq!(key_path, "name"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_malformed_nested_key_names_path() {
        let err = ManifestDescriptor::parse(
            r#"{
                "manifest_version": 3, "name": "x", "version": "1",
                "content_scripts": [
                    { "matches": ["<all_urls>"], "js": ["a.js"] },
                    { "matches": "not-a-list", "js": ["b.js"] }
                ]
            }"#,
        )
        .unwrap_err();

        match err {
            CrxError::ManifestValidation { key_path, .. } => {
                assert_eq!(key_path, "content_scripts[1]")
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_mv2_popup_uses_browser_action() {
        let manifest = ManifestDescriptor::parse(
            r#"{
                "manifest_version": 2, "name": "x", "version": "1",
                "browser_action": { "default_popup": "popup.html" },
                "options_page": "options.html"
            }"#,
        )
        .unwrap();
        assert_eq!(manifest.popup(), Some("popup.html"));
        assert_eq!(manifest.options(), Some("options.html"));
    }

    #[test]
    fn test_not_an_object() {
        assert!(ManifestDescriptor::parse("[1, 2]").is_err());
        assert!(ManifestDescriptor::parse("{").is_err());
    }
}
