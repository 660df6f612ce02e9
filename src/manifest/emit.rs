//! Writes the output `manifest.json`.
//!
//! File references are rewritten to the emitted files. Dev builds also open
//! the manifest up to the dev server; production output never carries those
//! keys.

use std::collections::BTreeMap;

use serde_json::{json, Map, Value};

use super::resolver::{EntryId, ResolvedManifest};

/// Directory (inside the bundle) holding hot-applied module files.
pub const HMR_DIR: &str = "crxkit-hmr";

/// Dev-only additions to the emitted manifest.
#[derive(Debug, Clone)]
pub struct DevManifest {
    /// Dev server origin, e.g. `http://localhost:5173`.
    pub origin: String,
}

/// Build the output manifest.
///
/// `outputs` maps entry ids to bundle-relative output paths. References
/// without an output entry are left untouched.
pub fn emit_manifest(
    resolved: &ResolvedManifest,
    outputs: &BTreeMap<EntryId, String>,
    dev: Option<&DevManifest>,
) -> Value {
    let mut manifest = resolved.descriptor.raw.clone();
    let Some(obj) = manifest.as_object_mut() else {
        return manifest;
    };

    let out = |id: &str| outputs.get(id).cloned();

    if let Some(bg) = obj.get_mut("background").and_then(Value::as_object_mut) {
        if bg.contains_key("service_worker") {
            if let Some(path) = out("background") {
                bg.insert("service_worker".into(), json!(path));
                // Classic workers are bundled as classic scripts
                bg.entry("type").or_insert_with(|| json!("module"));
            }
        }
        if let Some(scripts) = bg.get_mut("scripts").and_then(Value::as_array_mut) {
            for (j, script) in scripts.iter_mut().enumerate() {
                if let Some(path) = out(&format!("background.scripts[{}]", j)) {
                    *script = json!(path);
                }
            }
        }
        if let Some(path) = out("background.page") {
            if bg.contains_key("page") {
                bg.insert("page".into(), json!(path));
            }
        }
    }

    if let Some(rules) = obj.get_mut("content_scripts").and_then(Value::as_array_mut) {
        for (i, rule) in rules.iter_mut().enumerate() {
            for field in ["js", "css"] {
                if let Some(files) = rule.get_mut(field).and_then(Value::as_array_mut) {
                    for (j, file) in files.iter_mut().enumerate() {
                        if let Some(path) = out(&format!("content-script[{}].{}[{}]", i, field, j))
                        {
                            *file = json!(path);
                        }
                    }
                }
            }
        }
    }

    for action_key in ["action", "browser_action"] {
        if let Some(action) = obj.get_mut(action_key).and_then(Value::as_object_mut) {
            if action.contains_key("default_popup") {
                if let Some(path) = out("popup") {
                    action.insert("default_popup".into(), json!(path));
                }
            }
        }
    }

    if let Some(path) = out("options") {
        if obj.contains_key("options_page") {
            obj.insert("options_page".into(), json!(path));
        }
        if let Some(ui) = obj.get_mut("options_ui").and_then(Value::as_object_mut) {
            ui.insert("page".into(), json!(path));
        }
    }

    if let Some(icons) = obj.get_mut("icons").and_then(Value::as_object_mut) {
        for (size, icon) in icons.iter_mut() {
            if let Some(path) = out(&format!("icons.{}", size)) {
                *icon = json!(path);
            }
        }
    }

    if let Some(dev) = dev {
        apply_dev_keys(obj, resolved, dev);
    }

    manifest
}

fn apply_dev_keys(obj: &mut Map<String, Value>, resolved: &ResolvedManifest, dev: &DevManifest) {
    let mv3 = resolved.descriptor.manifest_version >= 3;
    let default_csp = "script-src 'self'; object-src 'self'";

    // Page clients import hot modules from the dev server.
    if mv3 {
        let current = obj
            .get("content_security_policy")
            .and_then(|csp| csp.get("extension_pages"))
            .and_then(Value::as_str)
            .unwrap_or(default_csp)
            .to_string();
        let mut csp = match obj.remove("content_security_policy") {
            Some(Value::Object(map)) => map,
            _ => Map::new(),
        };
        csp.insert(
            "extension_pages".into(),
            json!(allow_script_origin(&current, &dev.origin)),
        );
        obj.insert("content_security_policy".into(), Value::Object(csp));
    } else {
        let current = obj
            .get("content_security_policy")
            .and_then(Value::as_str)
            .unwrap_or(default_csp)
            .to_string();
        obj.insert(
            "content_security_policy".into(),
            json!(allow_script_origin(&current, &dev.origin)),
        );
    }

    // Content scripts re-import packaged module files, which must be
    // web-accessible on the pages they run in.
    let matches: Vec<String> = resolved
        .descriptor
        .content_scripts
        .iter()
        .flat_map(|rule| rule.matches.iter().cloned())
        .collect();
    if matches.is_empty() {
        return;
    }

    let pattern = format!("{}/*", HMR_DIR);
    let resources = obj
        .entry("web_accessible_resources")
        .or_insert_with(|| json!([]));
    if let Some(list) = resources.as_array_mut() {
        if mv3 {
            list.push(json!({ "resources": [pattern], "matches": matches }));
        } else {
            list.push(json!(pattern));
        }
    }
}

/// Add `origin` to the `script-src` directive of a CSP string.
fn allow_script_origin(csp: &str, origin: &str) -> String {
    let mut found = false;
    let directives: Vec<String> = csp
        .split(';')
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| {
            if d.starts_with("script-src") {
                found = true;
                if d.split_whitespace().any(|s| s == origin) {
                    d.to_string()
                } else {
                    format!("{} {}", d, origin)
                }
            } else {
                d.to_string()
            }
        })
        .collect();

    let mut out = directives.join("; ");
    if !found {
        if !out.is_empty() {
            out.push_str("; ");
        }
        out.push_str(&format!("script-src 'self' {}", origin));
    }
    out
}
