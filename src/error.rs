//! Error types for crxkit.
//!
//! One taxonomy covers the whole pipeline. Build-fatal kinds abort a
//! production build; recoverable kinds are logged and the dev session keeps
//! running.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while resolving, bundling or serving an extension.
#[derive(Debug, Error)]
pub enum CrxError {
    /// A required manifest key is missing or malformed.
    #[error("Invalid manifest at `{key_path}`: {reason}")]
    ManifestValidation { key_path: String, reason: String },

    #[error("Manifest not found: {0}")]
    ManifestNotFound(PathBuf),

    /// A manifest file reference points at a file that does not exist.
    #[error("Entry '{entry}' references a missing file: {path}")]
    EntryResolution { entry: String, path: PathBuf },

    /// A bootstrap fragment needs capabilities the target context lacks.
    #[error("Cannot inject '{fragment}' bootstrap into {context}: {reason}")]
    InjectionCapabilityViolation {
        context: String,
        fragment: String,
        reason: String,
    },

    /// A dev channel went away while a packet was being sent.
    #[error("Channel {connection} dropped: {message}")]
    ChannelDelivery { connection: String, message: String },

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("Bundler failed: {0}")]
    Bundler(String),

    #[error("Storage error: {0}")]
    Storage(String),

    /// A worker lifecycle operation was called in the wrong state.
    #[error("Invalid worker transition: {0}")]
    Lifecycle(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl CrxError {
    /// Shorthand for a manifest diagnostic at `key_path`.
    pub fn manifest(key_path: impl Into<String>, reason: impl Into<String>) -> Self {
        CrxError::ManifestValidation {
            key_path: key_path.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error must abort a production build.
    ///
    /// Channel, watch and worker lifecycle failures are recovered from inside
    /// the dev session.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            CrxError::ChannelDelivery { .. } | CrxError::Watch(_) | CrxError::Lifecycle(_)
        )
    }
}

/// Result type alias for crxkit operations.
pub type CrxResult<T> = Result<T, CrxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_error_carries_key_path() {
        let err = CrxError::manifest("content_scripts[0].matches", "must not be empty");
        assert_eq!(
            err.to_string(),
            "Invalid manifest at `content_scripts[0].matches`: must not be empty"
        );
    }

    #[test]
    fn test_fatality() {
        assert!(CrxError::manifest("name", "required").is_fatal());
        assert!(CrxError::InjectionCapabilityViolation {
            context: "content-script[0]".into(),
            fragment: "page".into(),
            reason: "eval".into(),
        }
        .is_fatal());
        assert!(!CrxError::Watch("inotify limit".into()).is_fatal());
        assert!(!CrxError::ChannelDelivery {
            connection: "#3".into(),
            message: "closed".into(),
        }
        .is_fatal());
    }
}
