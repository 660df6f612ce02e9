//! Build command for `crxkit build`.
//!
//! Bundles an extension for distribution.

use anyhow::{Context, Result};
use console::style;

use super::{esbuild, format_size, load_project};
use crate::pipeline::{write_bundle, Mode, Pipeline};

/// Build extension for distribution.
pub fn run_build(root: &str, out_dir: Option<String>) -> Result<()> {
    let (root, config) = load_project(root, out_dir)?;
    let out_dir = config.out_dir(&root);
    let out_label = config.build.out_dir.clone();

    let bundler = esbuild(&root, &config);
    let mut pipeline = Pipeline::new(&root, config, Mode::Build, bundler);
    let artifacts = pipeline.build().context("Build failed")?;

    println!(
        "{} {} {}",
        style("✓").green().bold(),
        style("Loaded manifest:").cyan(),
        style(&artifacts.state.resolved.descriptor.name).bold()
    );
    println!(
        "{} {} {}",
        style("✓").green().bold(),
        style("Bundled entries").cyan(),
        style(format!(
            "({} contexts, {} modules)",
            artifacts.state.contexts.len(),
            artifacts.state.graph.len()
        ))
        .dim()
    );

    write_bundle(&artifacts, &out_dir)
        .with_context(|| format!("Failed to write {}", out_dir.display()))?;

    // Print summary
    println!();
    println!("{}", style(format!("Output: {}/", out_label)).bold());
    let generated = artifacts.files.len();
    for (i, (name, contents)) in artifacts.files.iter().enumerate() {
        let branch = if i + 1 == generated && artifacts.copies.is_empty() {
            "└──"
        } else {
            "├──"
        };
        println!(
            "  {} {} {}",
            branch,
            name,
            style(format!("({})", format_size(contents.len() as u64))).dim()
        );
    }
    if !artifacts.copies.is_empty() {
        println!(
            "  └── {}",
            style(format!("{} copied files", artifacts.copies.len())).dim()
        );
    }
    println!();
    println!(
        "{} {}",
        style("Ready for distribution!").green().bold(),
        style(format_size(artifacts.generated_size())).dim()
    );

    Ok(())
}
