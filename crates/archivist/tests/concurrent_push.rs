//! Concurrent writers against one manifest.
//!
//! Every thread opens its own store (and so its own lock descriptor), which
//! is how independent processes contend for the journal.

use anyhow::Result;
use archivist::{Archive, ArchiveConfig, ArchiveId, DirBackend, NoClaims, PushRequest};
use chrono::Utc;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

const WRITERS: usize = 8;

fn open_archive(root: &Path) -> Result<Archive> {
    let mut config = ArchiveConfig::with_root(root.join("repo")).with_chunk_size(256);
    config.refresh_index = false;
    let backend = DirBackend::new(root.join("blobs"));
    Ok(Archive::with_parts(config, Box::new(backend), Box::new(NoClaims))?)
}

#[test]
fn test_concurrent_pushes_get_distinct_contiguous_ids() -> Result<()> {
    let temp = TempDir::new()?;
    let root = temp.path().to_path_buf();
    let barrier = Arc::new(Barrier::new(WRITERS));

    let handles: Vec<_> = (0..WRITERS)
        .map(|n| {
            let root = root.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || -> Result<String> {
                let archive = open_archive(&root)?;
                let source = root.join(format!("render-{n}.wav"));
                fs::write(&source, format!("writer {n} ").repeat(100 + n))?;
                barrier.wait();
                let outcome = archive.push(&PushRequest::new(&source))?;
                Ok(outcome.archive_id().to_string())
            })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        let id = handle
            .join()
            .map_err(|_| anyhow::anyhow!("writer thread panicked"))??;
        ids.push(id);
    }

    let unique: HashSet<&String> = ids.iter().collect();
    assert_eq!(unique.len(), WRITERS, "ids must not collide: {ids:?}");

    let today = Utc::now().date_naive();
    let mut sequences: Vec<u64> = ids
        .iter()
        .filter_map(|id| ArchiveId::from_raw(id.as_str()).sequence_on(today))
        .collect();
    sequences.sort_unstable();
    let expected: Vec<u64> = (1..=WRITERS as u64).collect();
    assert_eq!(sequences, expected);

    let archive = open_archive(&root)?;
    let journaled = archive.store().entries()?;
    assert_eq!(journaled.len(), WRITERS);
    Ok(())
}

#[test]
fn test_lock_is_released_after_each_append() -> Result<()> {
    let temp = TempDir::new()?;
    let archive = open_archive(temp.path())?;
    let source = temp.path().join("take.wav");
    fs::write(&source, b"take")?;

    for _ in 0..3 {
        archive.push(&PushRequest::new(&source))?;
    }
    // A fresh handle can still take the lock.
    let other = open_archive(temp.path())?;
    let _guard = other.store().lock()?;
    assert_eq!(other.store().entries()?.len(), 3);
    Ok(())
}
