//! crxkit - browser extension bundler with live reload.
//!
//! crxkit reads an extension's `manifest.json`, bundles every entry point
//! it names, and during development keeps each running context (background
//! worker, content scripts, extension pages) in sync with the sources.
//!
//! # Architecture
//!
//! - [`manifest`] - Manifest parsing, validation and entry resolution
//! - [`context`] - Execution context classification
//! - [`bundler`] - Bundler interface and the esbuild driver
//! - [`graph`] - Module graph and change propagation
//! - [`inject`] - Dev bootstrap injection
//! - [`pipeline`] - Build pipeline and bundle output
//! - [`hmr`] - Update planning and the dev channel protocol
//! - [`worker`] - Background worker lifecycle and persisted state
//! - [`dev`] - Dev session, file watcher and server
//!
//! # Example
//!
//! ```ignore
//! use crxkit::bundler::EsbuildBundler;
//! use crxkit::pipeline::{write_bundle, Mode, Pipeline};
//! use crxkit::Config;
//!
//! let config = Config::load(root)?;
//! let out_dir = config.out_dir(root);
//! let bundler = EsbuildBundler::new(&config.build.esbuild, root.join(".crxkit"));
//! let artifacts = Pipeline::new(root, config, Mode::Build, bundler).build()?;
//! write_bundle(&artifacts, &out_dir)?;
//! ```

pub mod bundler;
pub mod cli;
pub mod config;
pub mod context;
pub mod dev;
pub mod error;
pub mod graph;
pub mod hmr;
pub mod inject;
pub mod manifest;
pub mod pipeline;
pub mod worker;

#[cfg(test)]
mod testing;

// Re-export commonly used types for convenience
pub use config::Config;
pub use context::{ContextKind, ExecutionContext};
pub use error::{CrxError, CrxResult};
pub use graph::ModuleGraph;
pub use manifest::{ManifestDescriptor, ResolvedManifest};
