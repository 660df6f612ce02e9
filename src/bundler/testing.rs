//! In-process bundler for tests: follows relative `import ... from './x'`
//! lines and concatenates sources.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{
    content_hash, has_top_level_side_effects, hot_accepts, is_script_path, module_id, BundleOutput,
    BundleRequest, Bundler, Chunk, ModuleEdge, ModuleId, ModuleRecord,
};
use crate::error::{CrxError, CrxResult};

#[derive(Default)]
pub(crate) struct FakeBundler {
    pub bundles: usize,
    pub fail_next: bool,
    /// Called on every `module_source`.
    pub on_load: Option<Arc<dyn Fn(&ModuleId) + Send + Sync>>,
}

impl Bundler for FakeBundler {
    fn bundle(&mut self, request: &BundleRequest) -> CrxResult<BundleOutput> {
        if std::mem::take(&mut self.fail_next) {
            return Err(CrxError::Bundler("syntax error".into()));
        }
        self.bundles += 1;

        let mut output = BundleOutput::default();
        let mut modules: BTreeMap<ModuleId, ModuleRecord> = BTreeMap::new();
        let mut edges: BTreeSet<ModuleEdge> = BTreeSet::new();

        for entry in &request.entries {
            let mut order = Vec::new();
            visit(&request.root, &entry.source, &mut modules, &mut edges, &mut order)?;

            let code = order
                .iter()
                .map(|id| fs::read_to_string(request.root.join(id)))
                .collect::<Result<Vec<_>, _>>()?
                .join("\n");

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
        if let Some(on_load) = &self.on_load {
            on_load(module);
        }
        Ok(format!("// compiled\n{}", fs::read_to_string(root.join(module))?))
    }
}

fn visit(
    root: &Path,
    rel: &Path,
    modules: &mut BTreeMap<ModuleId, ModuleRecord>,
    edges: &mut BTreeSet<ModuleEdge>,
    order: &mut Vec<ModuleId>,
) -> CrxResult<()> {
    let id = module_id(rel);
    if order.contains(&id) {
        return Ok(());
    }
    order.push(id.clone());

    let source = fs::read_to_string(root.join(rel))?;
    modules.entry(id.clone()).or_insert_with(|| ModuleRecord {
        id: id.clone(),
        content_hash: content_hash(source.as_bytes()),
        side_effects: is_script_path(rel) && has_top_level_side_effects(&source),
        accepts: hot_accepts(&source),
    });

    for spec in relative_imports(&source) {
        let dir = rel.parent().unwrap_or(Path::new(""));
        let Some(target) = resolve(root, dir, &spec) else {
            continue;
        };
        edges.insert(ModuleEdge {
            from: id.clone(),
            to: module_id(&target),
        });
        visit(root, &target, modules, edges, order)?;
    }
    Ok(())
}

fn relative_imports(source: &str) -> Vec<String> {
    source
        .lines()
        .filter(|l| l.starts_with("import"))
        .filter_map(|l| {
            let quote = l.find(['\'', '"'])?;
            let rest = &l[quote + 1..];
            let end = rest.find(['\'', '"'])?;
            let spec = &rest[..end];
            spec.starts_with('.').then(|| spec.to_string())
        })
        .collect()
}

fn resolve(root: &Path, dir: &Path, spec: &str) -> Option<PathBuf> {
    let mut base = dir.to_path_buf();
    for part in spec.split('/') {
        match part {
            "." | "" => {}
            ".." => {
                base.pop();
            }
            p => base.push(p),
        }
    }
    ["", ".ts", ".js", ".tsx"].iter().find_map(|ext| {
        let candidate = PathBuf::from(format!("{}{}", base.display(), ext));
        root.join(&candidate).is_file().then_some(candidate)
    })
}
