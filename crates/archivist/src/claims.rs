//! Coordination claims: is someone else working on this path right now?
//!
//! The registry itself lives outside this crate. Before writing anywhere in
//! the repository tree (manifest, index, pull destination) the pipelines
//! ask a [`ClaimRegistry`] about the target and refuse to proceed on a hit.
//!
//! [`ClaimsFile`] reads a JSON array of claims:
//! ```json
//! [{"id": "L-17", "owner": "agent-3", "mode": "exclusive", "path": "archive"}]
//! ```
//! A claim covers its path and everything below it.

use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::ArchiveConfig;
use crate::error::{ArchiveError, IoContext, Result};

/// An active claim on part of the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub id: String,
    pub owner: String,
    pub mode: String,
    pub path: PathBuf,
}

impl Claim {
    pub fn covers(&self, target: &Path) -> bool {
        normalize(target).starts_with(normalize(&self.path))
    }

    fn into_error(self, target: &Path) -> ArchiveError {
        ArchiveError::Claimed {
            id: self.id,
            owner: self.owner,
            mode: self.mode,
            path: target.to_path_buf(),
        }
    }
}

/// Source of truth for claims.
pub trait ClaimRegistry: Send + Sync {
    /// The claim covering `target`, if any.
    fn claim_for(&self, target: &Path) -> Result<Option<Claim>>;

    /// Fail with a concurrency error if `target` is claimed.
    fn ensure_unclaimed(&self, target: &Path) -> Result<()> {
        match self.claim_for(target)? {
            Some(claim) => Err(claim.into_error(target)),
            None => Ok(()),
        }
    }
}

/// Registry with no claims at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoClaims;

impl ClaimRegistry for NoClaims {
    fn claim_for(&self, _target: &Path) -> Result<Option<Claim>> {
        Ok(None)
    }
}

/// Claims read from a JSON file on every query, so updates by the
/// coordinator are seen without restarting.
///
/// Relative claim paths are resolved against `base`; relative targets are
/// resolved against the working directory, like any other path the caller
/// hands us. Both sides are then made absolute, with symlinks in their
/// existing ancestors resolved, before matching.
#[derive(Debug, Clone)]
pub struct ClaimsFile {
    path: PathBuf,
    base: PathBuf,
}

impl ClaimsFile {
    pub fn new(path: impl Into<PathBuf>, base: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            base: base.into(),
        }
    }

    fn load(&self) -> Result<Vec<Claim>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).io_context(|| format!("failed to read {}", self.path.display()))
            }
        };
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        let mut claims: Vec<Claim> = serde_json::from_str(&contents).map_err(|e| {
            ArchiveError::Configuration(format!(
                "claims file {} is invalid: {e}",
                self.path.display()
            ))
        })?;
        for claim in &mut claims {
            claim.path = resolve(&self.base.join(&claim.path))?;
        }
        Ok(claims)
    }
}

impl ClaimRegistry for ClaimsFile {
    fn claim_for(&self, target: &Path) -> Result<Option<Claim>> {
        let claims = self.load()?;
        if claims.is_empty() {
            return Ok(None);
        }
        let target = resolve(target)?;
        Ok(claims.into_iter().find(|claim| claim.covers(&target)))
    }
}

/// The registry configured for `config`: its claims file resolved against
/// the repository root, or [`NoClaims`].
pub fn from_config(config: &ArchiveConfig) -> Box<dyn ClaimRegistry> {
    match &config.claims_file {
        Some(path) => Box::new(ClaimsFile::new(path, &config.root)),
        None => Box::new(NoClaims),
    }
}

/// Lexical normalization: drops `.` and resolves `..` without touching the
/// filesystem.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Absolute form of `path`: joined onto the working directory if relative,
/// normalized, and canonicalized as far as it exists on disk.
fn resolve(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_relative() {
        std::env::current_dir()
            .io_context(|| "failed to read the working directory")?
            .join(path)
    } else {
        path.to_path_buf()
    };
    let absolute = normalize(&absolute);

    let mut existing = absolute.as_path();
    let mut missing = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            return Ok(missing
                .iter()
                .rev()
                .fold(canonical, |acc: PathBuf, part| acc.join(part)));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return Ok(absolute),
        }
    }
}
