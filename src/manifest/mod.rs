//! Manifest loading, validation, entry resolution and output.
//!
//! ```text
//! manifest.json ──parse──▶ ManifestDescriptor ──resolve──▶ ResolvedManifest
//!                                                         └─ entries: Vec<EntryPoint>
//! ResolvedManifest + output paths ──emit──▶ dist/manifest.json
//! ```

mod descriptor;
mod emit;
mod match_pattern;
mod resolver;

pub use descriptor::{
    ActionSpec, BackgroundSpec, ContentScriptSpec, ManifestDescriptor, OptionsUiSpec, RunAt,
};
pub use emit::{emit_manifest, DevManifest, HMR_DIR};
pub use match_pattern::MatchPattern;
pub use resolver::{
    content_script_context, validate, ContextId, EntryId, EntryKind, EntryPoint, EntryRole,
    ManifestResolver, ResolvedManifest, BACKGROUND, OPTIONS, POPUP,
};
pub(crate) use resolver::rewrite_script_sources;
