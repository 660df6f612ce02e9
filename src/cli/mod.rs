//! CLI commands for crxkit.
//!
//! `build` writes a production bundle, `dev` serves a live-reloading one.

pub mod build;
pub mod dev;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::bundler::EsbuildBundler;
use crate::config::Config;

#[derive(Parser)]
#[command(name = "crxkit")]
#[command(about = "Build and live-reload browser extensions", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build the extension for distribution
    Build {
        /// Project directory containing manifest.json
        #[arg(long, default_value = ".")]
        root: String,

        /// Output directory (default: from crxkit.toml, else dist)
        #[arg(long)]
        out_dir: Option<String>,
    },

    /// Build, watch and push live updates to the running extension
    Dev {
        /// Project directory containing manifest.json
        #[arg(long, default_value = ".")]
        root: String,

        /// Output directory (default: from crxkit.toml, else dist)
        #[arg(long)]
        out_dir: Option<String>,

        /// Dev server port
        #[arg(long)]
        port: Option<u16>,

        /// Dev server host
        #[arg(long)]
        host: Option<String>,
    },
}

/// Parse arguments and run the selected command.
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build { root, out_dir } => build::run_build(&root, out_dir),
        Commands::Dev {
            root,
            out_dir,
            port,
            host,
        } => dev::run_dev(&root, out_dir, port, host),
    }
}

/// Canonical project root plus its configuration.
fn load_project(root: &str, out_dir: Option<String>) -> Result<(PathBuf, Config)> {
    let root = PathBuf::from(root)
        .canonicalize()
        .context(format!("Project directory not found: {}", root))?;

    let mut config = Config::load(&root).context("Failed to load crxkit.toml")?;
    if let Some(out_dir) = out_dir {
        config.build.out_dir = out_dir;
    }

    Ok((root, config))
}

fn esbuild(root: &Path, config: &Config) -> EsbuildBundler {
    EsbuildBundler::new(&config.build.esbuild, root.join(".crxkit").join("esbuild"))
}

/// Format file size in human-readable format.
fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{}B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1}KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1}MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
