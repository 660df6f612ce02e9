//! [`Bundler`] backed by the esbuild CLI.
//!
//! Each entry is bundled separately with `--metafile`; the metafile's
//! `inputs` section supplies the module graph.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde::Deserialize;

use super::{
    content_hash, entry_stem, has_top_level_side_effects, hot_accepts, is_script_path,
    BundleEntry, BundleOutput, BundleRequest, Bundler, Chunk, ModuleEdge, ModuleId, ModuleRecord,
    OutputFormat,
};
use crate::error::{CrxError, CrxResult};
use crate::inject::HOT_BINDING;
use crate::manifest::EntryKind;

/// Bundler that shells out to `esbuild`.
#[derive(Debug, Clone)]
pub struct EsbuildBundler {
    /// `npx` runs the project-local esbuild; anything else is the binary.
    program: String,
    /// Scratch directory for output files and metafiles.
    staging_dir: PathBuf,
}

#[derive(Debug, Deserialize)]
struct Metafile {
    #[serde(default)]
    inputs: BTreeMap<String, MetaInput>,
}

#[derive(Debug, Deserialize)]
struct MetaInput {
    #[serde(default)]
    imports: Vec<MetaImport>,
}

#[derive(Debug, Deserialize)]
struct MetaImport {
    path: String,
    #[serde(default)]
    external: bool,
}

impl EsbuildBundler {
    pub fn new(program: impl Into<String>, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            staging_dir: staging_dir.into(),
        }
    }

    fn command(&self, cwd: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        if self.program == "npx" {
            cmd.arg("--no-install").arg("esbuild");
        }
        cmd.current_dir(cwd);
        cmd
    }

    fn run(&self, mut cmd: Command) -> CrxResult<Output> {
        let output = cmd
            .output()
            .map_err(|e| CrxError::Bundler(format!("failed to run esbuild: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);

            // esbuild errors go to stderr, wrapper errors sometimes to stdout
            let message = if !stderr.trim().is_empty() {
                stderr.to_string()
            } else {
                stdout.to_string()
            };
            return Err(CrxError::Bundler(message.trim().to_string()));
        }

        Ok(output)
    }

    fn bundle_entry(
        &self,
        root: &Path,
        entry: &BundleEntry,
        minify: bool,
    ) -> CrxResult<(String, Metafile)> {
        let stem = entry_stem(&entry.entry_id);
        let ext = if entry.kind == EntryKind::Style { "css" } else { "js" };
        let outfile = self.staging_dir.join(format!("{}.{}", stem, ext));
        let metafile = self.staging_dir.join(format!("{}.meta.json", stem));

        let mut cmd = self.command(root);
        cmd.arg(&entry.source)
            .arg("--bundle")
            .arg(format!("--outfile={}", outfile.display()))
            .arg(format!("--metafile={}", metafile.display()))
            .arg("--log-level=warning");

        if entry.kind == EntryKind::Script {
            let format = match entry.format {
                OutputFormat::Esm => "esm",
                OutputFormat::Iife => "iife",
            };
            cmd.arg(format!("--format={}", format))
                .arg("--platform=browser")
                .arg(hot_define(entry.hot));
        }
        if minify {
            cmd.arg("--minify");
        }

        self.run(cmd)?;

        let code = fs::read_to_string(&outfile)?;
        let meta: Metafile = serde_json::from_str(&fs::read_to_string(&metafile)?)?;
        Ok((code, meta))
    }
}

impl Bundler for EsbuildBundler {
    fn bundle(&mut self, request: &BundleRequest) -> CrxResult<BundleOutput> {
        fs::create_dir_all(&self.staging_dir)?;

        let mut output = BundleOutput::default();
        let mut modules: BTreeMap<ModuleId, ModuleRecord> = BTreeMap::new();
        let mut edges: BTreeSet<ModuleEdge> = BTreeSet::new();

        for entry in &request.entries {
            let (code, meta) = self.bundle_entry(&request.root, entry, request.minify)?;
            tracing::debug!(entry = %entry.entry_id, bytes = code.len(), "bundled entry");

            for (path, input) in &meta.inputs {
                if !modules.contains_key(path) {
                    modules.insert(path.clone(), read_module(&request.root, path));
                }
                for import in input.imports.iter().filter(|i| !i.external) {
                    edges.insert(ModuleEdge {
                        from: path.clone(),
                        to: import.path.clone(),
                    });
                }
            }

            output.chunks.insert(
                entry.entry_id.clone(),
                Chunk {
                    id: entry.entry_id.clone(),
                    entry: entry.entry_id.clone(),
                    content_hash: content_hash(code.as_bytes()),
                    code,
                    format: entry.format,
                    kind: entry.kind,
                },
            );
        }

        output.modules = modules.into_values().collect();
        output.edges = edges.into_iter().collect();
        Ok(output)
    }

    fn module_source(&mut self, root: &Path, module: &ModuleId) -> CrxResult<String> {
        let mut cmd = self.command(root);
        cmd.args(module_args(module));

        let output = self.run(cmd)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Hot modules are bundled with their imports: they are loaded from
/// `crxkit-hmr/` where relative specifiers resolve to nothing.
fn module_args(module: &ModuleId) -> Vec<String> {
    vec![
        module.clone(),
        "--bundle".to_string(),
        "--format=esm".to_string(),
        "--platform=browser".to_string(),
        hot_define(false),
        "--log-level=warning".to_string(),
    ]
}

fn hot_define(hot: bool) -> String {
    let value = if hot { HOT_BINDING } else { "undefined" };
    format!("--define:import.meta.hot={}", value)
}

/// Build a module record from the file on disk.
///
/// Virtual modules (esbuild namespaces) have no file and hash their id.
fn read_module(root: &Path, id: &str) -> ModuleRecord {
    let path = root.join(id);
    match fs::read(&path) {
        Ok(bytes) => {
            let source = String::from_utf8_lossy(&bytes);
            let script = is_script_path(&path);
            ModuleRecord {
                id: id.to_string(),
                content_hash: content_hash(&bytes),
                side_effects: script && has_top_level_side_effects(&source),
                accepts: if script { hot_accepts(&source) } else { Vec::new() },
            }
        }
        Err(_) => ModuleRecord {
            id: id.to_string(),
            content_hash: content_hash(id.as_bytes()),
            side_effects: false,
            accepts: Vec::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_hot_modules_are_bundled_without_client() {
        let args = module_args(&"src/util.ts".to_string());
        assert_eq!(args[0], "src/util.ts");
        assert!(args.contains(&"--bundle".to_string()));
        assert!(args.contains(&"--format=esm".to_string()));
        assert!(args.contains(&"--define:import.meta.hot=undefined".to_string()));
        assert_eq!(hot_define(true), "--define:import.meta.hot=__crxkit_hot");
    }

    #[test]
    fn test_parse_metafile_inputs() {
        let meta: Metafile = serde_json::from_str(
            r#"{
                "inputs": {
                    "src/util.ts": { "bytes": 20, "imports": [] },
                    "src/content.ts": {
                        "bytes": 80,
                        "imports": [
                            { "path": "src/util.ts", "kind": "import-statement", "original": "./util" },
                            { "path": "chrome", "kind": "import-statement", "external": true }
                        ]
                    }
                },
                "outputs": {}
            }"#,
        )
        .unwrap();

        let content = &meta.inputs["src/content.ts"];
        assert_eq!(content.imports.len(), 2);
        assert!(content.imports[1].external);
    }

    #[test]
    fn test_read_module_detects_side_effects() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("boot.ts"), "init();\n").unwrap();
        fs::write(dir.path().join("pure.ts"), "export const x = 1;\n").unwrap();

        assert!(read_module(dir.path(), "boot.ts").side_effects);
        assert!(!read_module(dir.path(), "pure.ts").side_effects);

        let virtual_module = read_module(dir.path(), "virtual:icons");
        assert!(!virtual_module.side_effects);
    }

    #[test]
    fn test_read_module_collects_accepts() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("content.ts"),
            "import { mark } from './mark';\nimport.meta.hot?.accept('mark.ts', (next) => next.mark());\nmark();\n",
        )
        .unwrap();
        fs::write(dir.path().join("notes.css"), "/* import.meta.hot.accept('x.ts') */\n").unwrap();

        assert_eq!(read_module(dir.path(), "content.ts").accepts, vec!["mark.ts"]);
        assert!(read_module(dir.path(), "notes.css").accepts.is_empty());
    }
}
