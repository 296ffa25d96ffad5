//! Derived read views over the manifest.
//!
//! ```text
//! {index_dir}/
//! ├── latest.json            # newest `latest_n` entries, newest first
//! └── by_tag/<tag>.json      # every entry carrying <tag>, newest first
//! ```
//!
//! Both are slim projections (no chunk list) and are rebuilt from scratch
//! on every run. Nothing here is authoritative; deleting the index loses no
//! data. No lock is taken: readers may see the previous version while a
//! rebuild is in flight, and each file is replaced atomically.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ArchiveError, IoContext, Result};
use crate::manifest::{ArchiveId, BackendRef, ManifestEntry, OriginalInfo};
use crate::store::ManifestStore;

pub const LATEST_FILE: &str = "latest.json";
pub const BY_TAG_DIR: &str = "by_tag";

/// Display projection of a manifest entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRecord {
    pub archive_id: ArchiveId,
    pub created_at: DateTime<Utc>,
    pub backend_ref: BackendRef,
    pub original: OriginalInfo,
    pub tags: BTreeSet<String>,
    pub note: String,
}

impl From<&ManifestEntry> for IndexRecord {
    fn from(entry: &ManifestEntry) -> Self {
        Self {
            archive_id: entry.archive_id.clone(),
            created_at: entry.created_at,
            backend_ref: entry.backend_ref.clone(),
            original: entry.original.clone(),
            tags: entry.tags.clone(),
            note: entry.note.clone(),
        }
    }
}

/// Both views, in memory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexViews {
    pub latest: Vec<IndexRecord>,
    /// Keyed by sanitized tag (the file stem).
    pub by_tag: BTreeMap<String, Vec<IndexRecord>>,
}

/// What a write changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexReport {
    pub latest: usize,
    pub tag_files: usize,
    pub removed_tag_files: usize,
}

/// Build both views from entries in journal order.
///
/// Sorting is by `created_at` and stable, so equal timestamps keep journal
/// order before the newest-first reversal.
pub fn rebuild(entries: &[ManifestEntry], latest_n: usize) -> IndexViews {
    let mut ordered: Vec<&ManifestEntry> = entries.iter().collect();
    ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    let skip = ordered.len().saturating_sub(latest_n);
    let latest: Vec<IndexRecord> = ordered[skip..]
        .iter()
        .rev()
        .map(|e| IndexRecord::from(*e))
        .collect();

    let mut by_tag: BTreeMap<String, Vec<IndexRecord>> = BTreeMap::new();
    for entry in &ordered {
        let stems: BTreeSet<String> = entry.tags.iter().map(|t| sanitize_tag(t)).collect();
        for stem in stems {
            by_tag.entry(stem).or_default().push(IndexRecord::from(*entry));
        }
    }
    for records in by_tag.values_mut() {
        records.reverse();
    }

    IndexViews { latest, by_tag }
}

/// File stem for a tag: `[A-Za-z0-9._-]` kept, everything else `_`, and
/// never starting with a dot.
pub fn sanitize_tag(tag: &str) -> String {
    let mut stem: String = tag
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() || stem.starts_with('.') {
        stem.insert(0, '_');
    }
    stem
}

impl IndexViews {
    /// Every file this index consists of, relative to the index dir, with
    /// its exact content.
    pub fn render(&self) -> Result<Vec<(PathBuf, String)>> {
        let mut files = Vec::with_capacity(self.by_tag.len() + 1);
        files.push((PathBuf::from(LATEST_FILE), to_json(&self.latest)?));
        for (stem, records) in &self.by_tag {
            files.push((
                Path::new(BY_TAG_DIR).join(format!("{stem}.json")),
                to_json(records)?,
            ));
        }
        Ok(files)
    }

    /// Replace the index under `index_dir` with these views.
    pub fn write(&self, index_dir: &Path) -> Result<IndexReport> {
        let tag_dir = index_dir.join(BY_TAG_DIR);
        fs::create_dir_all(&tag_dir)
            .io_context(|| format!("failed to create {}", tag_dir.display()))?;

        for (relative, content) in self.render()? {
            write_atomic(&index_dir.join(relative), content.as_bytes())?;
        }

        let mut removed = 0;
        let entries = fs::read_dir(&tag_dir)
            .io_context(|| format!("failed to list {}", tag_dir.display()))?;
        for dir_entry in entries {
            let dir_entry =
                dir_entry.io_context(|| format!("failed to list {}", tag_dir.display()))?;
            let path = dir_entry.path();
            let stale = path.extension().is_some_and(|ext| ext == "json")
                && path
                    .file_stem()
                    .map(|stem| !self.by_tag.contains_key(&*stem.to_string_lossy()))
                    .unwrap_or(false);
            if stale {
                fs::remove_file(&path)
                    .io_context(|| format!("failed to remove {}", path.display()))?;
                debug!(path = %path.display(), "removed stale tag index");
                removed += 1;
            }
        }

        let report = IndexReport {
            latest: self.latest.len(),
            tag_files: self.by_tag.len(),
            removed_tag_files: removed,
        };
        info!(
            latest = report.latest,
            tag_files = report.tag_files,
            removed = report.removed_tag_files,
            "index rebuilt"
        );
        Ok(report)
    }
}

/// Rebuild and write in one go.
pub fn rebuild_into(
    entries: &[ManifestEntry],
    latest_n: usize,
    index_dir: &Path,
) -> Result<IndexReport> {
    rebuild(entries, latest_n).write(index_dir)
}

/// Read every valid entry from `store` and rewrite the index.
pub fn refresh(store: &ManifestStore, latest_n: usize, index_dir: &Path) -> Result<IndexReport> {
    let entries = store.entries()?;
    rebuild_into(&entries, latest_n, index_dir)
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    let mut json = serde_json::to_string_pretty(value)?;
    json.push('\n');
    Ok(json)
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| ArchiveError::InvalidInput(format!("{} has no parent", path.display())))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".index-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .io_context(|| format!("failed to create temp file in {}", dir.display()))?;
    temp.write_all(content)
        .io_context(|| format!("failed to write {}", path.display()))?;
    temp.persist(path).map_err(|e| ArchiveError::Io {
        context: format!("failed to replace {}", path.display()),
        source: e.error,
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::tests::sample_entry;
    use tempfile::TempDir;

    fn ids(records: &[IndexRecord]) -> Vec<&str> {
        records.iter().map(|r| r.archive_id.as_str()).collect()
    }

    fn fixture() -> Vec<ManifestEntry> {
        vec![
            sample_entry("A-2026-03-01-0001", "2026-03-01T10:00:00Z", &["ep1", "audio"]),
            sample_entry("A-2026-03-03-0001", "2026-03-03T10:00:00Z", &["ep2"]),
            sample_entry("A-2026-03-02-0001", "2026-03-02T10:00:00Z", &["ep1"]),
            sample_entry("A-2026-03-02-0002", "2026-03-02T10:00:00Z", &["audio"]),
        ]
    }

    #[test]
    fn test_latest_is_newest_first_and_capped() {
        let views = rebuild(&fixture(), 3);
        assert_eq!(
            ids(&views.latest),
            ["A-2026-03-03-0001", "A-2026-03-02-0002", "A-2026-03-02-0001"]
        );
    }

    #[test]
    fn test_latest_zero() {
        assert!(rebuild(&fixture(), 0).latest.is_empty());
    }

    #[test]
    fn test_by_tag_groups_each_tag() {
        let views = rebuild(&fixture(), 10);
        assert_eq!(views.by_tag.len(), 3);
        assert_eq!(
            ids(&views.by_tag["ep1"]),
            ["A-2026-03-02-0001", "A-2026-03-01-0001"]
        );
        assert_eq!(
            ids(&views.by_tag["audio"]),
            ["A-2026-03-02-0002", "A-2026-03-01-0001"]
        );
        assert_eq!(ids(&views.by_tag["ep2"]), ["A-2026-03-03-0001"]);
    }

    #[test]
    fn test_slim_projection_has_no_chunks() -> anyhow::Result<()> {
        let views = rebuild(&fixture(), 1);
        let json = serde_json::to_value(&views.latest[0])?;
        assert!(json.get("chunks").is_none());
        assert!(json.get("chunk_size_bytes").is_none());
        assert!(json.get("original").is_some());
        Ok(())
    }

    #[test]
    fn test_sanitize_tag() {
        assert_eq!(sanitize_tag("ep-12.final"), "ep-12.final");
        assert_eq!(sanitize_tag("season 2/ep 3"), "season_2_ep_3");
        assert_eq!(sanitize_tag("../etc"), "_.._etc");
        assert_eq!(sanitize_tag(""), "_");
    }

    #[test]
    fn test_colliding_sanitized_tags_do_not_duplicate() {
        let entries = vec![sample_entry(
            "A-2026-03-01-0001",
            "2026-03-01T10:00:00Z",
            &["a b", "a/b"],
        )];
        let views = rebuild(&entries, 10);
        assert_eq!(views.by_tag.len(), 1);
        assert_eq!(views.by_tag["a_b"].len(), 1);
    }

    #[test]
    fn test_write_is_idempotent() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let dir = temp.path().join("index");

        rebuild_into(&fixture(), 2, &dir)?;
        let first_latest = fs::read(dir.join(LATEST_FILE))?;
        let first_tag = fs::read(dir.join(BY_TAG_DIR).join("ep1.json"))?;

        rebuild_into(&fixture(), 2, &dir)?;
        assert_eq!(fs::read(dir.join(LATEST_FILE))?, first_latest);
        assert_eq!(fs::read(dir.join(BY_TAG_DIR).join("ep1.json"))?, first_tag);

        let parsed: Vec<IndexRecord> = serde_json::from_slice(&first_latest)?;
        assert_eq!(parsed.len(), 2);
        Ok(())
    }

    #[test]
    fn test_write_removes_stale_tag_files() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let dir = temp.path().join("index");
        fs::create_dir_all(dir.join(BY_TAG_DIR))?;
        fs::write(dir.join(BY_TAG_DIR).join("retired.json"), "[]")?;
        fs::write(dir.join(BY_TAG_DIR).join("notes.txt"), "keep me")?;

        let report = rebuild_into(&fixture(), 2, &dir)?;
        assert_eq!(report.removed_tag_files, 1);
        assert!(!dir.join(BY_TAG_DIR).join("retired.json").exists());
        assert!(dir.join(BY_TAG_DIR).join("notes.txt").exists());
        Ok(())
    }
}
