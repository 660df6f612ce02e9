//! Resolve → classify → bundle → inject → emit.
//!
//! One pipeline serves both modes. Production builds are written to a staging
//! directory and swapped in only when everything succeeded.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::Value;
use walkdir::WalkDir;

use crate::bundler::{entry_stem, BundleEntry, BundleRequest, Bundler, Chunk, OutputFormat};
use crate::config::Config;
use crate::context::{classify, ExecutionContext};
use crate::error::{CrxError, CrxResult};
use crate::graph::ModuleGraph;
use crate::hmr::{PacketKind, UpdatePacket};
use crate::inject::{BootstrapSettings, Injector};
use crate::manifest::{
    emit_manifest, rewrite_script_sources, DevManifest, EntryId, EntryKind, EntryPoint, EntryRole,
    ManifestResolver, ResolvedManifest, HMR_DIR,
};

/// Build mode.
#[derive(Debug, Clone)]
pub enum Mode {
    /// Production bundle: no dev artifacts.
    Build,
    /// Dev bundle wired to the dev server.
    Dev(BootstrapSettings),
}

impl Mode {
    pub fn is_dev(&self) -> bool {
        matches!(self, Mode::Dev(_))
    }
}

/// Manifest, contexts and module graph of one build.
#[derive(Debug, Clone)]
pub struct BuildState {
    pub resolved: ResolvedManifest,
    pub contexts: Vec<ExecutionContext>,
    pub graph: ModuleGraph,
}

impl BuildState {
    pub fn context(&self, id: &str) -> Option<&ExecutionContext> {
        self.contexts.iter().find(|c| c.id == id)
    }
}

/// Everything a build writes.
#[derive(Debug, Clone)]
pub struct BuildArtifacts {
    pub state: BuildState,
    /// Generated files keyed by bundle-relative path.
    pub files: BTreeMap<String, Vec<u8>>,
    /// Files copied verbatim: (source, bundle-relative path).
    pub copies: Vec<(PathBuf, String)>,
    pub manifest: Value,
}

impl BuildArtifacts {
    /// Total size of generated files in bytes.
    pub fn generated_size(&self) -> u64 {
        self.files.values().map(|f| f.len() as u64).sum()
    }
}

pub struct Pipeline<B: Bundler> {
    root: PathBuf,
    config: Config,
    mode: Mode,
    bundler: B,
}

impl<B: Bundler> Pipeline<B> {
    pub fn new(root: impl Into<PathBuf>, config: Config, mode: Mode, bundler: B) -> Self {
        Self {
            root: root.into(),
            config,
            mode,
            bundler,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    pub fn bundler_mut(&mut self) -> &mut B {
        &mut self.bundler
    }

    /// Run one full pass. Reads the project, writes nothing.
    pub fn build(&mut self) -> CrxResult<BuildArtifacts> {
        let resolver = ManifestResolver::new(&self.root);
        let resolved = resolver.load(&self.config.manifest_path(&self.root))?;
        let contexts = classify(&resolved);
        tracing::debug!(
            "Resolved {} entries in {} contexts",
            resolved.entries.len(),
            contexts.len()
        );

        let hosts = if self.mode.is_dev() {
            client_hosts(&resolved)
        } else {
            BTreeSet::new()
        };
        let request = BundleRequest {
            root: self.root.clone(),
            entries: resolved
                .bundle_entries()
                .map(|entry| BundleEntry {
                    entry_id: entry.id.clone(),
                    source: entry.source.clone(),
                    kind: entry.kind,
                    format: output_format(&resolved, entry),
                    hot: hosts.contains(&entry.id),
                })
                .collect(),
            minify: self.config.build.minify && !self.mode.is_dev(),
        };
        let bundle = self.bundler.bundle(&request)?;

        let injector = match &self.mode {
            Mode::Build => Injector::production(),
            Mode::Dev(settings) => Injector::dev(settings.clone()),
        };

        let mut outputs: BTreeMap<EntryId, String> = BTreeMap::new();
        let mut files: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        let mut copies = Vec::new();
        let shared = shared_sources(&resolved);

        for entry in resolved.bundle_entries() {
            let chunk = bundle.chunk_for_entry(&entry.id).ok_or_else(|| {
                CrxError::Bundler(format!("No output for entry '{}'", entry.id))
            })?;

            let context = entry
                .context
                .as_deref()
                .and_then(|id| contexts.iter().find(|c| c.id == id));

            let code = match context {
                Some(ctx) if hosts.contains(&entry.id) => injector.inject(ctx, chunk)?,
                _ => chunk.code.clone(),
            };

            let name = output_name(entry, chunk, self.mode.is_dev(), shared.contains(&entry.source));
            outputs.insert(entry.id.clone(), name.clone());
            files.insert(name, code.into_bytes());
        }

        for entry in &resolved.entries {
            match entry.kind {
                EntryKind::Html => {
                    let html = fs::read_to_string(self.root.join(&entry.source))?;
                    let replacements: BTreeMap<String, String> = resolved
                        .entries
                        .iter()
                        .filter(|e| e.parent.as_deref() == Some(entry.id.as_str()))
                        .filter_map(|e| {
                            outputs
                                .get(&e.id)
                                .map(|out| (e.reference.clone(), format!("/{}", out)))
                        })
                        .collect();

                    let name = bundle_path(&entry.source);
                    files.insert(
                        name.clone(),
                        rewrite_script_sources(&html, &replacements).into_bytes(),
                    );
                    outputs.insert(entry.id.clone(), name);
                }
                EntryKind::Asset => {
                    copies.push((self.root.join(&entry.source), bundle_path(&entry.source)));
                }
                EntryKind::Script | EntryKind::Style => {}
            }
        }

        let public_dir = self.config.public_dir(&self.root);
        if public_dir.is_dir() {
            for file in WalkDir::new(&public_dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                if let Ok(rel) = file.path().strip_prefix(&public_dir) {
                    copies.push((file.path().to_path_buf(), bundle_path(rel)));
                }
            }
        }

        let dev = match &self.mode {
            Mode::Build => None,
            Mode::Dev(settings) => Some(DevManifest {
                origin: settings.origin.clone(),
            }),
        };
        let manifest = emit_manifest(&resolved, &outputs, dev.as_ref());
        files.insert(
            "manifest.json".to_string(),
            serde_json::to_vec_pretty(&manifest)?,
        );

        let graph = ModuleGraph::build(&resolved, &bundle);

        Ok(BuildArtifacts {
            state: BuildState {
                resolved,
                contexts,
                graph,
            },
            files,
            copies,
            manifest,
        })
    }
}

/// One client per context, in its first script.
fn client_hosts(resolved: &ResolvedManifest) -> BTreeSet<EntryId> {
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    resolved
        .bundle_entries()
        .filter(|entry| entry.kind == EntryKind::Script)
        .filter_map(|entry| {
            let context = entry.context.as_deref()?;
            seen.insert(context).then(|| entry.id.clone())
        })
        .collect()
}

/// Sources bundled for more than one entry.
fn shared_sources(resolved: &ResolvedManifest) -> BTreeSet<PathBuf> {
    let mut counts: BTreeMap<&Path, usize> = BTreeMap::new();
    for entry in resolved.bundle_entries() {
        *counts.entry(entry.source.as_path()).or_default() += 1;
    }
    counts
        .into_iter()
        .filter(|(_, n)| *n > 1)
        .map(|(source, _)| source.to_path_buf())
        .collect()
}

/// Content scripts, MV2 background scripts and classic service workers run
/// as classic scripts.
fn output_format(resolved: &ResolvedManifest, entry: &EntryPoint) -> OutputFormat {
    let descriptor = &resolved.descriptor;
    match entry.role {
        EntryRole::ContentScript { .. } => OutputFormat::Iife,
        EntryRole::Background if entry.parent.is_none() => {
            let classic_worker = descriptor
                .background
                .as_ref()
                .and_then(|bg| bg.worker_type.as_deref())
                == Some("classic");
            if descriptor.manifest_version == 2 || classic_worker {
                OutputFormat::Iife
            } else {
                OutputFormat::Esm
            }
        }
        _ => OutputFormat::Esm,
    }
}

/// Hashed names in production, source-mirroring names in dev so the manifest
/// stays stable across rebuilds.
///
/// A dev source bundled for several entries gets one file per entry, each
/// carrying its own context's client.
fn output_name(entry: &EntryPoint, chunk: &Chunk, dev: bool, shared: bool) -> String {
    let ext = match entry.kind {
        EntryKind::Style => "css",
        _ => "js",
    };

    if dev && shared {
        let stem = entry.source.with_extension("");
        return format!("{}.{}.{}", bundle_path(&stem), entry_stem(&entry.id), ext);
    }
    if dev {
        return bundle_path(&entry.source.with_extension(ext));
    }

    let stem = entry
        .source
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "chunk".to_string());
    let hash = chunk.content_hash.get(..8).unwrap_or(&chunk.content_hash);
    format!("assets/{}-{}.{}", stem, hash, ext)
}

fn bundle_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Write a bundle into `out_dir`, replacing it only if every write succeeds.
pub fn write_bundle(artifacts: &BuildArtifacts, out_dir: &Path) -> CrxResult<()> {
    let name = out_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| CrxError::Config(format!("Invalid output directory: {}", out_dir.display())))?;
    let staging = out_dir.with_file_name(format!(".{}.staging", name));

    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    if let Err(e) = write_files(artifacts, &staging) {
        let _ = fs::remove_dir_all(&staging);
        return Err(e);
    }

    if out_dir.exists() {
        fs::remove_dir_all(out_dir)?;
    }
    fs::rename(&staging, out_dir)?;
    Ok(())
}

/// Overwrite files in an existing dev bundle.
pub fn write_in_place(artifacts: &BuildArtifacts, out_dir: &Path) -> CrxResult<()> {
    write_files(artifacts, out_dir)?;
    fs::create_dir_all(out_dir.join(HMR_DIR))?;
    Ok(())
}

/// Write hot-apply module bodies under `<out>/crxkit-hmr/`. Returns the
/// number of files written.
pub fn write_hot_modules(out_dir: &Path, packets: &[UpdatePacket]) -> CrxResult<usize> {
    let dir = out_dir.join(HMR_DIR);
    let mut written = 0;

    for module in packets
        .iter()
        .filter(|p| p.kind == PacketKind::HotApply)
        .flat_map(|p| &p.modules)
    {
        let path = dir.join(&module.url);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &module.code)?;
        written += 1;
    }
    Ok(written)
}

fn write_files(artifacts: &BuildArtifacts, dir: &Path) -> CrxResult<()> {
    fs::create_dir_all(dir)?;

    for (rel, contents) in &artifacts.files {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
    }

    for (source, rel) in &artifacts.copies {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source, path)?;
    }
    Ok(())
}
