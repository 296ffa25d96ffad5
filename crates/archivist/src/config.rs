//! Archivist configuration with environment variable and file-based loading.
//!
//! Environment variables:
//! - `ARCHIVIST_ROOT`: Repository root holding the `archive/` directory
//! - `ARCHIVIST_CHUNK_SIZE_BYTES`: Maximum chunk size for new pushes
//! - `ARCHIVIST_LATEST_N`: Number of entries in `latest.json`
//! - `ARCHIVIST_BACKEND_KIND`: `cli` (default) or `dir`
//! - `ARCHIVIST_BACKEND_PROGRAM`: Backend CLI binary (default `gh`)
//! - `ARCHIVIST_BACKEND_REPO` / `GH_REPO`: Backend collection id
//! - `ARCHIVIST_BACKEND_DIR`: Root of the directory backend
//! - `ARCHIVIST_CLAIMS_FILE`: Coordination claims file
//!
//! Layout under `root`:
//! ```text
//! {root}/archive/
//! ├── manifest.jsonl        # append-only journal (source of truth)
//! ├── manifest.jsonl.lock   # advisory lock sidecar
//! ├── summary.log           # human-readable, best effort
//! └── index/
//!     ├── latest.json
//!     └── by_tag/<tag>.json
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};

use crate::error::ArchiveError;

/// Default chunk bound, under the common 2 GiB per-asset ceiling.
pub const DEFAULT_CHUNK_SIZE_BYTES: u64 = 1_900_000_000;
pub const DEFAULT_LATEST_N: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Shell out to an external release/asset CLI.
    #[default]
    Cli,
    /// Mirror buckets as subdirectories of a local directory.
    Dir,
}

/// Where chunks go.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,

    /// Program invoked by the CLI backend.
    #[serde(default = "default_program")]
    pub program: String,

    /// Collection id for the CLI backend (e.g. `owner/name`).
    #[serde(default)]
    pub repo: Option<String>,

    /// Root directory for the directory backend.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

fn default_program() -> String {
    "gh".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Cli,
            program: default_program(),
            repo: None,
            dir: None,
        }
    }
}

/// Configuration for the archival core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Repository root. The manifest and index live under `{root}/archive/`.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: u64,

    #[serde(default = "default_latest_n")]
    pub latest_n: usize,

    /// Rebuild the derived index after each successful push.
    #[serde(default = "default_true")]
    pub refresh_index: bool,

    #[serde(default)]
    pub backend: BackendConfig,

    /// Coordination claims file; `None` means nothing is ever claimed.
    #[serde(default)]
    pub claims_file: Option<PathBuf>,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE_BYTES
}

fn default_latest_n() -> usize {
    DEFAULT_LATEST_N
}

fn default_true() -> bool {
    true
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
            latest_n: DEFAULT_LATEST_N,
            refresh_index: true,
            backend: BackendConfig::default(),
            claims_file: None,
        }
    }
}

impl ArchiveConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_overrides(|key| env::var(key).ok())?;
        Ok(config)
    }

    /// Load configuration from a TOML file, then apply environment overrides.
    ///
    /// The file should contain an `[archive]` section:
    /// ```toml
    /// [archive]
    /// root = "~/src/episodes"
    /// chunk_size_bytes = 1900000000
    /// latest_n = 50
    ///
    /// [archive.backend]
    /// kind = "cli"
    /// program = "gh"
    /// repo = "studio/episode-archive"
    /// ```
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let table: toml::Table = contents
            .parse()
            .with_context(|| format!("failed to parse TOML: {}", path.display()))?;

        let mut config = if let Some(section) = table.get("archive") {
            let mut config: ArchiveConfig = section
                .clone()
                .try_into()
                .context("failed to parse [archive] section")?;
            config.root = expand_path(&config.root.to_string_lossy());
            config.backend.dir = config
                .backend
                .dir
                .map(|d| expand_path(&d.to_string_lossy()));
            config.claims_file = config
                .claims_file
                .map(|c| expand_path(&c.to_string_lossy()));
            config
        } else {
            Self::default()
        };

        config.apply_overrides(|key| env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay values from a key lookup (the process environment in practice).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("ARCHIVIST_ROOT") {
            self.root = expand_path(&v);
        }
        if let Some(v) = lookup("ARCHIVIST_CHUNK_SIZE_BYTES") {
            self.chunk_size_bytes = v
                .trim()
                .parse()
                .with_context(|| format!("ARCHIVIST_CHUNK_SIZE_BYTES is not an integer: {v}"))?;
        }
        if let Some(v) = lookup("ARCHIVIST_LATEST_N") {
            self.latest_n = v
                .trim()
                .parse()
                .with_context(|| format!("ARCHIVIST_LATEST_N is not an integer: {v}"))?;
        }
        if let Some(v) = lookup("ARCHIVIST_BACKEND_KIND") {
            self.backend.kind = match v.to_lowercase().as_str() {
                "cli" => BackendKind::Cli,
                "dir" => BackendKind::Dir,
                other => anyhow::bail!("unknown ARCHIVIST_BACKEND_KIND: {other}"),
            };
        }
        if let Some(v) = lookup("ARCHIVIST_BACKEND_PROGRAM") {
            self.backend.program = v;
        }
        if let Some(v) = lookup("ARCHIVIST_BACKEND_REPO").or_else(|| lookup("GH_REPO")) {
            self.backend.repo = Some(v);
        }
        if let Some(v) = lookup("ARCHIVIST_BACKEND_DIR") {
            self.backend.dir = Some(expand_path(&v));
        }
        if let Some(v) = lookup("ARCHIVIST_CLAIMS_FILE") {
            self.claims_file = Some(expand_path(&v));
        }
        Ok(())
    }

    /// Create a config rooted at a specific path.
    pub fn with_root(path: impl Into<PathBuf>) -> Self {
        Self {
            root: path.into(),
            ..Self::default()
        }
    }

    /// Builder: use the directory backend rooted at `dir`.
    pub fn with_dir_backend(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backend.kind = BackendKind::Dir;
        self.backend.dir = Some(dir.into());
        self
    }

    /// Builder: override the chunk bound.
    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size_bytes = bytes;
        self
    }

    /// Reject settings no operation could run with.
    pub fn validate(&self) -> Result<(), ArchiveError> {
        if self.chunk_size_bytes == 0 {
            return Err(ArchiveError::Configuration(
                "chunk_size_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join("archive")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.archive_dir().join("manifest.jsonl")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.archive_dir().join("index")
    }
}

/// Expand `~/` to the home directory.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}
