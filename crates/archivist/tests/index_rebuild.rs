//! Index rebuilds from a real journal.

use anyhow::Result;
use archivist::index::{self, IndexRecord, BY_TAG_DIR, LATEST_FILE};
use archivist::{Archive, ArchiveConfig, DirBackend, NoClaims, PushRequest};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn read_tree(dir: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let mut files = vec![(LATEST_FILE.to_string(), fs::read(dir.join(LATEST_FILE))?)];
    let mut tags: Vec<_> = fs::read_dir(dir.join(BY_TAG_DIR))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .collect();
    tags.sort();
    for path in tags {
        files.push((path.display().to_string(), fs::read(&path)?));
    }
    Ok(files)
}

#[test]
fn test_rebuild_twice_is_byte_identical() -> Result<()> {
    let temp = TempDir::new()?;
    let mut config = ArchiveConfig::with_root(temp.path().join("repo"));
    config.refresh_index = false;
    config.latest_n = 3;
    let archive = Archive::with_parts(
        config,
        Box::new(DirBackend::new(temp.path().join("blobs"))),
        Box::new(NoClaims),
    )?;

    for (n, tags) in [&["ep1"][..], &["ep1", "stems"], &[], &["ep2"], &["ep2", "final cut"]]
        .iter()
        .enumerate()
    {
        let source = temp.path().join(format!("take-{n}.wav"));
        fs::write(&source, format!("take {n}"))?;
        archive.push(&PushRequest::new(&source).with_tags(tags.iter().copied()))?;
    }

    archive.rebuild_index()?;
    let index_dir = archive.config().index_dir();
    let first = read_tree(&index_dir)?;

    archive.rebuild_index()?;
    assert_eq!(read_tree(&index_dir)?, first);

    let latest: Vec<IndexRecord> = serde_json::from_slice(&fs::read(index_dir.join(LATEST_FILE))?)?;
    assert_eq!(latest.len(), 3);
    assert!(latest.windows(2).all(|w| w[0].created_at >= w[1].created_at));

    let ep1: Vec<IndexRecord> =
        serde_json::from_slice(&fs::read(index_dir.join(BY_TAG_DIR).join("ep1.json"))?)?;
    assert_eq!(ep1.len(), 2);
    assert!(index_dir.join(BY_TAG_DIR).join("final_cut.json").is_file());
    Ok(())
}

#[test]
fn test_index_survives_garbage_lines() -> Result<()> {
    let temp = TempDir::new()?;
    let config = ArchiveConfig::with_root(temp.path().join("repo"));
    let archive = Archive::with_parts(
        config,
        Box::new(DirBackend::new(temp.path().join("blobs"))),
        Box::new(NoClaims),
    )?;
    let source = temp.path().join("take.wav");
    fs::write(&source, b"take")?;
    archive.push(&PushRequest::new(&source).with_tags(["ep1"]))?;

    let manifest = archive.store().path().to_path_buf();
    let mut content = fs::read_to_string(&manifest)?;
    content.push_str("{\"archive_id\": \"half written\n");
    content.push_str("\"just a string\"\n");
    fs::write(&manifest, content)?;
    archive.push(&PushRequest::new(&source).with_tags(["ep1"]))?;

    let report = index::refresh(archive.store(), 10, &archive.config().index_dir())?;
    assert_eq!(report.latest, 2);
    assert_eq!(report.tag_files, 1);
    Ok(())
}
