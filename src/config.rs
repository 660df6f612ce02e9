//! Project configuration loaded from `crxkit.toml`.
//!
//! Every section is optional; missing keys fall back to defaults so a bare
//! extension directory with only a `manifest.json` builds as-is.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CrxError, CrxResult};

/// Name of the optional config file in the project root.
pub const CONFIG_FILE: &str = "crxkit.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub build: BuildConfig,
    pub dev: DevConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Manifest path relative to the project root.
    pub manifest: String,
    /// Output directory relative to the project root.
    pub out_dir: String,
    /// Directory copied verbatim into the bundle.
    pub public_dir: String,
    /// Program used to launch esbuild (`npx` runs the local install).
    pub esbuild: String,
    pub minify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DevConfig {
    pub host: String,
    pub port: u16,
    /// Window in which file events are coalesced into one batch.
    pub debounce_ms: u64,
    pub watch_retry_initial_ms: u64,
    pub watch_retry_max_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Where the dev session persists background worker state.
    pub state_dir: Option<PathBuf>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            manifest: "manifest.json".to_string(),
            out_dir: "dist".to_string(),
            public_dir: "public".to_string(),
            esbuild: "npx".to_string(),
            minify: true,
        }
    }
}

impl Default for DevConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5173,
            debounce_ms: 300,
            watch_retry_initial_ms: 500,
            watch_retry_max_ms: 8000,
        }
    }
}

impl WorkerConfig {
    /// State directory, defaulting to the user data dir.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|d| d.join("crxkit").join("worker"))
                .unwrap_or_else(|| PathBuf::from(".crxkit/worker"))
        })
    }
}

impl DevConfig {
    /// WebSocket URL injected into dev bootstraps.
    pub fn hmr_url(&self) -> String {
        format!("ws://{}:{}/crx-hmr", self.host, self.port)
    }

    /// HTTP origin of the dev server.
    pub fn origin(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl Config {
    /// Load `crxkit.toml` from `root`, or return defaults if it is absent.
    ///
    /// Unlike a missing file, a malformed file is an error: silently building
    /// with defaults would write to the wrong place.
    pub fn load(root: &Path) -> CrxResult<Self> {
        let path = root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> CrxResult<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate and clamp values to acceptable ranges.
    fn validate(&mut self) -> CrxResult<()> {
        if self.build.out_dir.trim().is_empty() {
            return Err(CrxError::Config("build.out_dir must not be empty".into()));
        }
        if self.build.manifest.trim().is_empty() {
            return Err(CrxError::Config("build.manifest must not be empty".into()));
        }

        // Clamp debounce to 10ms - 5s
        self.dev.debounce_ms = self.dev.debounce_ms.clamp(10, 5000);

        self.dev.watch_retry_initial_ms = self.dev.watch_retry_initial_ms.max(50);
        self.dev.watch_retry_max_ms = self
            .dev
            .watch_retry_max_ms
            .max(self.dev.watch_retry_initial_ms);

        Ok(())
    }

    pub fn manifest_path(&self, root: &Path) -> PathBuf {
        root.join(&self.build.manifest)
    }

    pub fn out_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.build.out_dir)
    }

    pub fn public_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.build.public_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_without_file() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.build.manifest, "manifest.json");
        assert_eq!(config.build.out_dir, "dist");
        assert_eq!(config.dev.port, 5173);
        assert_eq!(config.dev.debounce_ms, 300);
        assert_eq!(config.dev.hmr_url(), "ws://localhost:5173/crx-hmr");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::from_toml(
            r#"
[dev]
port = 4000
debounce_ms = 1
"#,
        )
        .unwrap();

        assert_eq!(config.dev.port, 4000);
        assert_eq!(config.dev.host, "localhost");
        // Clamped
        assert_eq!(config.dev.debounce_ms, 10);
        assert_eq!(config.build.public_dir, "public");
    }

    #[test]
    fn test_empty_out_dir_rejected() {
        let err = Config::from_toml("[build]\nout_dir = \"\"\n").unwrap_err();
        assert!(matches!(err, CrxError::Config(_)));
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "[dev\nport = ").unwrap();
        assert!(matches!(
            Config::load(dir.path()),
            Err(CrxError::TomlParse(_))
        ));
    }

    #[test]
    fn test_retry_bounds_are_ordered() {
        let config = Config::from_toml(
            "[dev]\nwatch_retry_initial_ms = 2000\nwatch_retry_max_ms = 100\n",
        )
        .unwrap();
        assert_eq!(config.dev.watch_retry_max_ms, 2000);
    }
}
