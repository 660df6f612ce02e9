//! Performance benchmarks for crxkit.
//!
//! Run with: cargo bench
//!
//! Target performance:
//! - Affected set on a 2k module graph: < 1ms
//! - Match pattern test: < 1us

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use crxkit::bundler::{content_hash, BundleOutput, ModuleEdge, ModuleRecord};
use crxkit::context::classify;
use crxkit::hmr::{plan_updates, ChangeSet};
use crxkit::manifest::{ManifestResolver, MatchPattern, ResolvedManifest};
use crxkit::pipeline::BuildState;
use crxkit::ModuleGraph;

const MANIFEST: &str = r#"{
  "manifest_version": 3,
  "name": "Bench",
  "version": "1.0.0",
  "background": { "service_worker": "src/background.js" },
  "content_scripts": [{ "matches": ["*://*.example.com/*"], "js": ["src/content.js"] }]
}"#;

fn resolved_fixture(root: &Path) -> ResolvedManifest {
    fs::create_dir_all(root.join("src")).unwrap();
    fs::write(root.join("manifest.json"), MANIFEST).unwrap();
    fs::write(root.join("src/background.js"), "").unwrap();
    fs::write(root.join("src/content.js"), "").unwrap();
    ManifestResolver::new(root)
        .load(&root.join("manifest.json"))
        .unwrap()
}

/// Both entries import a binary tree of `size` library modules and accept
/// its root.
fn synthetic_bundle(size: usize) -> BundleOutput {
    let module = |i: usize| format!("src/lib/m{}.js", i);
    let mut output = BundleOutput::default();

    for id in ["src/background.js", "src/content.js"] {
        output.modules.push(ModuleRecord {
            id: id.to_string(),
            content_hash: content_hash(id.as_bytes()),
            side_effects: true,
            accepts: vec![module(0)],
        });
        output.edges.push(ModuleEdge {
            from: id.to_string(),
            to: module(0),
        });
    }
    for i in 0..size {
        output.modules.push(ModuleRecord {
            id: module(i),
            content_hash: content_hash(module(i).as_bytes()),
            side_effects: false,
            accepts: Vec::new(),
        });
        for child in [2 * i + 1, 2 * i + 2] {
            if child < size {
                output.edges.push(ModuleEdge {
                    from: module(i),
                    to: module(child),
                });
            }
        }
    }
    output
}

/// Benchmark graph construction and change propagation.
fn bench_module_graph(c: &mut Criterion) {
    let dir = tempfile::TempDir::new().unwrap();
    let resolved = resolved_fixture(dir.path());

    let mut group = c.benchmark_group("module_graph");

    for size in [100usize, 2000] {
        let bundle = synthetic_bundle(size);

        group.bench_with_input(BenchmarkId::new("build", size), &bundle, |b, bundle| {
            b.iter(|| black_box(ModuleGraph::build(&resolved, bundle)))
        });

        let graph = ModuleGraph::build(&resolved, &bundle);
        let leaf: BTreeSet<String> = [format!("src/lib/m{}.js", size - 1)].into();
        group.bench_with_input(BenchmarkId::new("affected_leaf", size), &leaf, |b, leaf| {
            b.iter(|| black_box(graph.affected_set(leaf)))
        });
        group.bench_with_input(BenchmarkId::new("boundaries_leaf", size), &leaf, |b, leaf| {
            b.iter(|| black_box(graph.hot_boundaries("content-script[0]", leaf)))
        });
    }

    group.finish();
}

/// Benchmark manifest resolution and context classification.
fn bench_manifest(c: &mut Criterion) {
    let dir = tempfile::TempDir::new().unwrap();
    let resolved = resolved_fixture(dir.path());

    c.bench_function("classify_contexts", |b| {
        b.iter(|| black_box(classify(&resolved)))
    });

    let pattern = MatchPattern::parse("*://*.example.com/*").unwrap();
    let mut group = c.benchmark_group("match_pattern");
    for (name, url) in [
        ("host_match", "https://docs.example.com/guide"),
        ("host_miss", "https://example.org/"),
    ] {
        group.bench_with_input(BenchmarkId::from_parameter(name), &url, |b, url| {
            b.iter(|| black_box(pattern.matches(black_box(url))))
        });
    }
    group.finish();
}

fn build_state(resolved: &ResolvedManifest, bundle: &BundleOutput) -> BuildState {
    BuildState {
        resolved: resolved.clone(),
        contexts: classify(resolved),
        graph: ModuleGraph::build(resolved, bundle),
    }
}

/// Benchmark update planning for a one-module edit.
fn bench_plan(c: &mut Criterion) {
    let dir = tempfile::TempDir::new().unwrap();
    let resolved = resolved_fixture(dir.path());

    let mut group = c.benchmark_group("plan");

    for size in [100usize, 2000] {
        let before = synthetic_bundle(size);
        let leaf = format!("src/lib/m{}.js", size - 1);
        let mut after = before.clone();
        if let Some(record) = after.modules.iter_mut().find(|m| m.id == leaf) {
            record.content_hash = content_hash(b"edited");
        }

        let changes = ChangeSet {
            modules: [leaf.clone()].into(),
            ..ChangeSet::default()
        };
        let previous = build_state(&resolved, &before);
        let next = build_state(&resolved, &after);

        group.bench_function(BenchmarkId::new("leaf_edit", size), |b| {
            b.iter(|| {
                black_box(plan_updates(&changes, &previous, &next, &mut |_: &String| {
                    Ok(String::new())
                }))
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_module_graph, bench_manifest, bench_plan);
criterion_main!(benches);
