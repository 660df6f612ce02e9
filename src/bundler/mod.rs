//! Interface to the external module bundler.
//!
//! crxkit does not bundle code itself. It hands entry points to a
//! [`Bundler`] and consumes the resulting chunk graph and module edges.

mod esbuild;
#[cfg(test)]
pub(crate) mod testing;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::CrxResult;
use crate::manifest::{EntryId, EntryKind};

pub use esbuild::EsbuildBundler;

/// Root-relative, `/`-separated module path.
pub type ModuleId = String;

/// Chunks are keyed by the entry id they were built from.
pub type ChunkId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Esm,
    /// Classic script wrapped in a function scope (content scripts).
    Iife,
}

/// One entry point handed to the bundler.
#[derive(Debug, Clone)]
pub struct BundleEntry {
    pub entry_id: EntryId,
    pub source: PathBuf,
    pub kind: EntryKind,
    pub format: OutputFormat,
    /// Bind `import.meta.hot` to the injected client. Otherwise it compiles
    /// to `undefined`.
    pub hot: bool,
}

#[derive(Debug, Clone)]
pub struct BundleRequest {
    pub root: PathBuf,
    pub entries: Vec<BundleEntry>,
    pub minify: bool,
}

/// Bundled output for one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub id: ChunkId,
    pub entry: EntryId,
    pub code: String,
    pub content_hash: String,
    pub format: OutputFormat,
    pub kind: EntryKind,
}

/// A source module seen by the bundler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRecord {
    pub id: ModuleId,
    pub content_hash: String,
    /// Module runs statements at the top level beyond declarations.
    pub side_effects: bool,
    /// Modules this one registers `import.meta.hot.accept` handlers for.
    pub accepts: Vec<ModuleId>,
}

/// `from` imports `to`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ModuleEdge {
    pub from: ModuleId,
    pub to: ModuleId,
}

#[derive(Debug, Clone, Default)]
pub struct BundleOutput {
    pub chunks: BTreeMap<ChunkId, Chunk>,
    pub modules: Vec<ModuleRecord>,
    pub edges: Vec<ModuleEdge>,
}

impl BundleOutput {
    pub fn chunk_for_entry(&self, entry: &str) -> Option<&Chunk> {
        self.chunks.values().find(|c| c.entry == entry)
    }
}

/// The bundler collaborator.
pub trait Bundler: Send {
    /// Bundle every entry in `request`.
    fn bundle(&mut self, request: &BundleRequest) -> CrxResult<BundleOutput>;

    /// Compile `module` and its imports into one self-contained ES module
    /// for hot replacement.
    fn module_source(&mut self, root: &Path, module: &ModuleId) -> CrxResult<String>;
}

/// Short content hash used for chunk names and change detection.
pub fn content_hash(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..8])
}

/// Module id for a root-relative path.
pub fn module_id(path: &Path) -> ModuleId {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether a script file has statements that run on import.
///
/// Line-based: a line starting in column 0 that is not an import, export,
/// declaration, comment or closing bracket counts as a top-level statement.
pub fn has_top_level_side_effects(source: &str) -> bool {
    const DECLARATIONS: &[&str] = &[
        "import ",
        "import{",
        "import(",
        "export ",
        "export{",
        "const ",
        "let ",
        "var ",
        "function ",
        "function*",
        "async function",
        "class ",
        "abstract class",
        "type ",
        "interface ",
        "enum ",
        "declare ",
        "namespace ",
        "//",
        "/*",
        "*",
        "}",
        ")",
        "]",
        "@",
        "'use strict'",
        "\"use strict\"",
    ];

    let mut in_block_comment = false;
    for line in source.lines() {
        if in_block_comment {
            if line.contains("*/") {
                in_block_comment = false;
            }
            continue;
        }
        if line.trim().is_empty() || line.starts_with(char::is_whitespace) {
            continue;
        }
        if line.starts_with("/*") && !line.contains("*/") {
            in_block_comment = true;
            continue;
        }
        if !DECLARATIONS.iter().any(|d| line.starts_with(d)) {
            return true;
        }
    }
    false
}

/// Module ids passed to `import.meta.hot.accept` with a string literal.
///
/// Ids are root-relative, the same form the module graph uses:
/// `import.meta.hot?.accept('src/util.ts', (next) => ...)`.
pub fn hot_accepts(source: &str) -> Vec<ModuleId> {
    const HANDLE: &str = "import.meta.hot";

    let mut accepts = Vec::new();
    let mut rest = source;
    while let Some(pos) = rest.find(HANDLE) {
        rest = &rest[pos + HANDLE.len()..];
        let call = rest.strip_prefix('?').unwrap_or(rest);
        let Some(args) = call.strip_prefix(".accept(") else {
            continue;
        };
        let args = args.trim_start();
        let Some(quote) = args.chars().next().filter(|c| matches!(c, '\'' | '"' | '`')) else {
            continue;
        };
        if let Some(end) = args[1..].find(quote) {
            let id = args[1..1 + end].trim_start_matches("./");
            if !id.is_empty() && !accepts.iter().any(|a| a == id) {
                accepts.push(id.to_string());
            }
        }
    }
    accepts
}

/// Turn an entry id into a file stem: `content-script[0].js[1]` → `content-script-0-js-1`.
pub(crate) fn entry_stem(entry_id: &str) -> String {
    let mut out = String::with_capacity(entry_id.len());
    for c in entry_id.chars() {
        if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_end_matches('-').to_string()
}

pub(crate) fn is_script_path(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("js" | "mjs" | "cjs" | "jsx" | "ts" | "mts" | "tsx" | "vue" | "svelte")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash(b"abc"), content_hash(b"abc"));
        assert_ne!(content_hash(b"abc"), content_hash(b"abd"));
        assert_eq!(content_hash(b"abc").len(), 16);
    }

    #[test]
    fn test_module_id_uses_forward_slashes() {
        assert_eq!(module_id(Path::new("src/utils/dom.ts")), "src/utils/dom.ts");
    }

    #[test]
    fn test_pure_module_has_no_side_effects() {
        let source = r#"
import { a } from './a';
/* leading
   comment */
export const double = (x: number) => x * 2;

export function greet(name: string) {
  console.log(name);
}
"#;
        assert!(!has_top_level_side_effects(source));
    }

    #[test]
    fn test_top_level_call_is_side_effect() {
        let source = "import { boot } from './boot';\n\nboot();\n";
        assert!(has_top_level_side_effects(source));

        let listener = "chrome.runtime.onMessage.addListener(() => {});";
        assert!(has_top_level_side_effects(listener));
    }

    #[test]
    fn test_hot_accepts() {
        let source = r#"
import { highlight } from './util';
import.meta.hot?.accept('src/util.ts', (next) => next.highlight(document.body));
import.meta.hot.accept("src/view.ts", () => {});
import.meta.hot?.accept('src/util.ts', () => {});
import.meta.hot?.accept(dynamicId, () => {});
if (import.meta.hot) console.log('dev');
"#;
        assert_eq!(hot_accepts(source), vec!["src/util.ts", "src/view.ts"]);
        assert!(hot_accepts("export const x = 1;").is_empty());
    }

    #[test]
    fn test_entry_stem() {
        assert_eq!(entry_stem("background"), "background");
        assert_eq!(entry_stem("content-script[0].js[1]"), "content-script-0-js-1");
        assert_eq!(entry_stem("popup.script[0]"), "popup-script-0");
    }

    #[test]
    fn test_script_paths() {
        assert!(is_script_path(Path::new("a/b.tsx")));
        assert!(is_script_path(Path::new("App.vue")));
        assert!(!is_script_path(Path::new("icon.png")));
        assert!(!is_script_path(Path::new("style.css")));
    }
}
