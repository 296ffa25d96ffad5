//! ManifestStore: the append-only JSON Lines journal.
//!
//! Layout:
//! ```text
//! {archive_dir}/
//! ├── manifest.jsonl       # one ManifestEntry per line, oldest first
//! ├── manifest.jsonl.lock  # advisory lock sidecar, never has content
//! └── summary.log          # human-readable echo of each append
//! ```
//!
//! Writers serialize through an exclusive advisory lock on the sidecar. The
//! lock covers the whole read-scan-then-append section so that id
//! allocation and the append are one atomic step across processes. The OS
//! drops the lock when the holding process exits, so a crashed writer
//! cannot wedge the journal.
//!
//! Readers take no lock. A line that is not a valid entry is skipped; the
//! journal is hand-edited in the wild and may end in a torn write.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Split, Write};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use tracing::{debug, warn};

use crate::error::{ArchiveError, IoContext, Result};
use crate::manifest::{archive_id_of_line, entry_from_value, ArchiveId, ManifestEntry, ParseError};

/// Held while the journal is being scanned and appended to.
///
/// Closing the descriptor releases the lock, so dropping this guard is the
/// unlock on every exit path.
#[derive(Debug)]
pub struct ManifestLock {
    _file: File,
}

/// Ids present in the journal at the moment the lock was taken.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    ids: Vec<String>,
}

impl Snapshot {
    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|existing| existing == id)
    }

    /// Next id for `today` (see [`ArchiveId::allocate`]).
    pub fn allocate(&self, today: chrono::NaiveDate) -> ArchiveId {
        ArchiveId::allocate(self.ids.iter().map(String::as_str), today)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// The journal on disk.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl ManifestStore {
    /// Open (or prepare to create) the journal at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .io_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");
        Ok(Self {
            lock_path: PathBuf::from(lock_name),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Block until this process holds the exclusive journal lock.
    pub fn lock(&self) -> Result<ManifestLock> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .io_context(|| format!("failed to open lock {}", self.lock_path.display()))?;
        file.lock_exclusive()
            .io_context(|| format!("failed to lock {}", self.lock_path.display()))?;
        debug!(lock = %self.lock_path.display(), "acquired manifest lock");
        Ok(ManifestLock { _file: file })
    }

    /// Every line of the journal, parsed. Bad lines surface as `ParseError`
    /// so the caller decides what to do with them.
    pub fn lines(&self) -> Result<Lines> {
        let inner = match File::open(&self.path) {
            Ok(file) => Some(BufReader::new(file).split(b'\n')),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(ArchiveError::Io {
                    context: format!("failed to open {}", self.path.display()),
                    source: e,
                })
            }
        };
        Ok(Lines {
            inner,
            path: self.path.clone(),
            line_no: 0,
        })
    }

    /// Valid entries in append order (oldest first). Lazy.
    pub fn iterate(&self) -> Result<impl Iterator<Item = Result<ManifestEntry>>> {
        Ok(self.lines()?.filter_map(|item| match item {
            Ok((_, Ok(entry))) => Some(Ok(entry)),
            Ok((line_no, Err(e))) => {
                debug!(line = line_no, error = %e, "skipping malformed manifest line");
                None
            }
            Err(e) => Some(Err(e)),
        }))
    }

    /// All valid entries, collected.
    pub fn entries(&self) -> Result<Vec<ManifestEntry>> {
        self.iterate()?.collect()
    }

    /// Linear scan for `archive_id`. With duplicate ids, the oldest wins.
    pub fn find_by_id(&self, archive_id: &str) -> Result<Option<ManifestEntry>> {
        for entry in self.iterate()? {
            let entry = entry?;
            if entry.archive_id.as_str() == archive_id {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    /// Ids of every object line, including lines that fail the schema.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let mut ids = Vec::new();
        for item in self.raw_lines()? {
            let line = item?;
            if let Some(id) = archive_id_of_line(&line) {
                ids.push(id);
            }
        }
        Ok(Snapshot { ids })
    }

    /// Append a fully formed entry under the lock.
    pub fn append(&self, entry: &ManifestEntry) -> Result<()> {
        let _lock = self.lock()?;
        self.append_locked(entry)
    }

    /// Take the lock, snapshot the journal, let `build` produce the entry
    /// from that snapshot, append it, release the lock.
    ///
    /// Nothing is written if `build` fails.
    pub fn append_with<F>(&self, build: F) -> Result<ManifestEntry>
    where
        F: FnOnce(&Snapshot) -> Result<ManifestEntry>,
    {
        let _lock = self.lock()?;
        let snapshot = self.snapshot()?;
        let entry = build(&snapshot)?;
        self.append_locked(&entry)?;
        Ok(entry)
    }

    fn append_locked(&self, entry: &ManifestEntry) -> Result<()> {
        let mut line = entry.to_line()?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&self.path)
            .io_context(|| format!("failed to open {}", self.path.display()))?;

        // A torn final line from a crashed writer must not swallow ours.
        if needs_separator(&mut file)
            .io_context(|| format!("failed to inspect {}", self.path.display()))?
        {
            line.insert(0, '\n');
        }

        file.write_all(line.as_bytes())
            .io_context(|| format!("failed to append to {}", self.path.display()))?;
        file.sync_data()
            .io_context(|| format!("failed to sync {}", self.path.display()))?;
        debug!(archive_id = %entry.archive_id, "appended manifest entry");
        Ok(())
    }

    /// Echo an appended entry to `summary.log` next to the journal.
    ///
    /// Best effort: failures are logged and dropped. The journal is the
    /// record; this file is only for humans.
    pub fn write_summary(&self, entry: &ManifestEntry) {
        let summary_path = self.path.with_file_name("summary.log");
        let tags: Vec<&str> = entry.tags.iter().map(String::as_str).collect();
        let line = format!(
            "{} {} {} {} bytes in {} chunk(s) bucket={} tags=[{}] {}\n",
            entry.created_at.to_rfc3339(),
            entry.archive_id,
            entry.original.name,
            entry.original.size_bytes,
            entry.chunks.len(),
            entry.backend_ref.release_tag,
            tags.join(","),
            entry.note,
        );
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&summary_path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
        if let Err(e) = result {
            warn!(path = %summary_path.display(), error = %e, "failed to write archive summary");
        }
    }

    fn raw_lines(&self) -> Result<impl Iterator<Item = Result<String>>> {
        Ok(self.lines_bytes()?.filter_map(|item| match item {
            Ok(bytes) => String::from_utf8(bytes).ok().map(Ok),
            Err(e) => Some(Err(e)),
        }))
    }

    fn lines_bytes(&self) -> Result<Box<dyn Iterator<Item = Result<Vec<u8>>>>> {
        let path = self.path.clone();
        match File::open(&self.path) {
            Ok(file) => Ok(Box::new(BufReader::new(file).split(b'\n').map(move |r| {
                r.io_context(|| format!("failed to read {}", path.display()))
            }))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Box::new(std::iter::empty())),
            Err(e) => Err(ArchiveError::Io {
                context: format!("failed to open {}", self.path.display()),
                source: e,
            }),
        }
    }
}

fn needs_separator(file: &mut File) -> std::io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] != b'\n')
}

/// Lazy iterator over journal lines: `(line_number, parse result)`.
///
/// Blank lines are skipped. Lines that are not UTF-8 come out as
/// `ParseError::NotJson` like any other garbage; I/O failures as `Err`.
pub struct Lines {
    inner: Option<Split<BufReader<File>>>,
    path: PathBuf,
    line_no: usize,
}

impl Iterator for Lines {
    type Item = Result<(usize, std::result::Result<ManifestEntry, ParseError>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let inner = self.inner.as_mut()?;
        loop {
            let bytes = match inner.next()? {
                Ok(bytes) => bytes,
                Err(e) => {
                    return Some(Err(ArchiveError::Io {
                        context: format!("failed to read {}", self.path.display()),
                        source: e,
                    }))
                }
            };
            self.line_no += 1;
            if bytes.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let parsed = match serde_json::from_slice(&bytes) {
                Ok(value) => entry_from_value(value),
                Err(e) => Err(ParseError::NotJson(e)),
            };
            return Some(Ok((self.line_no, parsed)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::tests::sample_entry;
    use chrono::NaiveDate;
    use tempfile::TempDir;

    fn store_in(temp: &TempDir) -> Result<ManifestStore> {
        ManifestStore::open(temp.path().join("archive").join("manifest.jsonl"))
    }

    #[test]
    fn test_missing_journal_is_empty() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let store = store_in(&temp)?;
        assert!(store.entries()?.is_empty());
        assert!(store.snapshot()?.is_empty());
        assert!(store.find_by_id("A-2026-03-04-0001")?.is_none());
        Ok(())
    }

    #[test]
    fn test_append_and_iterate_in_order() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let store = store_in(&temp)?;

        store.append(&sample_entry("A-2026-03-04-0001", "2026-03-04T10:00:00Z", &[]))?;
        store.append(&sample_entry("A-2026-03-04-0002", "2026-03-04T09:00:00Z", &[]))?;

        let ids: Vec<String> = store
            .entries()?
            .into_iter()
            .map(|e| e.archive_id.to_string())
            .collect();
        assert_eq!(ids, ["A-2026-03-04-0001", "A-2026-03-04-0002"]);
        Ok(())
    }

    #[test]
    fn test_malformed_lines_are_skipped() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let store = store_in(&temp)?;
        let good = sample_entry("A-2026-03-04-0001", "2026-03-04T10:00:00Z", &[]);

        let mut content = String::new();
        content.push_str("not json at all\n");
        content.push_str("[1,2,3]\n");
        content.push('\n');
        content.push_str(&good.to_line()?);
        content.push_str("\n{\"archive_id\": \"A-2026-03-04-0005\"}\n");
        fs::write(store.path(), content)?;

        let entries = store.entries()?;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0], good);

        let bad: usize = store
            .lines()?
            .filter(|item| matches!(item, Ok((_, Err(_)))))
            .count();
        assert_eq!(bad, 3);
        Ok(())
    }

    #[test]
    fn test_snapshot_sees_schema_invalid_ids() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let store = store_in(&temp)?;
        fs::write(store.path(), "{\"archive_id\": \"A-2026-03-04-0005\"}\n")?;

        let snapshot = store.snapshot()?;
        assert!(snapshot.contains("A-2026-03-04-0005"));
        let today = NaiveDate::from_ymd_opt(2026, 3, 4).unwrap();
        assert_eq!(snapshot.allocate(today).as_str(), "A-2026-03-04-0006");
        Ok(())
    }

    #[test]
    fn test_append_after_torn_line() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let store = store_in(&temp)?;
        fs::write(store.path(), "{\"archive_id\": \"A-2026-03-0")?;

        let entry = sample_entry("A-2026-03-04-0001", "2026-03-04T10:00:00Z", &[]);
        store.append(&entry)?;

        assert_eq!(store.entries()?, vec![entry]);
        Ok(())
    }

    #[test]
    fn test_append_with_failed_build_writes_nothing() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let store = store_in(&temp)?;

        let result = store.append_with(|_| Err(ArchiveError::InvalidInput("nope".to_string())));
        assert!(result.is_err());
        assert!(store.entries()?.is_empty());

        // lock released: a second append goes through
        store.append(&sample_entry("A-2026-03-04-0001", "2026-03-04T10:00:00Z", &[]))?;
        assert_eq!(store.entries()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_find_by_id_prefers_oldest_duplicate() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let store = store_in(&temp)?;

        let mut first = sample_entry("A-2026-03-04-0001", "2026-03-04T10:00:00Z", &[]);
        first.note = "first".to_string();
        let mut second = first.clone();
        second.note = "second".to_string();
        store.append(&first)?;
        store.append(&second)?;

        let found = store.find_by_id("A-2026-03-04-0001")?.expect("should exist");
        assert_eq!(found.note, "first");
        Ok(())
    }

    #[test]
    fn test_summary_is_written() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let store = store_in(&temp)?;
        let entry = sample_entry("A-2026-03-04-0001", "2026-03-04T10:00:00Z", &["ep1"]);
        store.write_summary(&entry);

        let summary = fs::read_to_string(temp.path().join("archive").join("summary.log"))?;
        assert!(summary.contains("A-2026-03-04-0001"));
        assert!(summary.contains("tags=[ep1]"));
        Ok(())
    }
}
