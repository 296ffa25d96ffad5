//! CLI command implementations.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use archivist::claims;
use archivist::index;
use archivist::query::{self, ListFilter};
use archivist::{
    Archive, ArchiveConfig, ManifestStore, PullOutcome, PullRequest, PushOutcome, PushRequest,
};

pub fn load_config(path: Option<&Path>) -> Result<ArchiveConfig> {
    let config = match path {
        Some(path) => ArchiveConfig::from_file(path)?,
        None => ArchiveConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

pub struct PushArgs {
    pub file: PathBuf,
    pub tags: Vec<String>,
    pub note: String,
    pub chunk_size_bytes: Option<u64>,
    pub archive_id: Option<String>,
    pub dry_run: bool,
}

pub fn push(config: ArchiveConfig, args: PushArgs) -> Result<()> {
    let archive = Archive::open(config)?;
    let mut request = PushRequest::new(args.file)
        .with_tags(args.tags.into_iter().map(|t| t.trim().to_string()).filter(|t| !t.is_empty()))
        .with_note(args.note);
    request.chunk_size_bytes = args.chunk_size_bytes;
    request.archive_id = args.archive_id;
    request.dry_run = args.dry_run;

    match archive.push(&request)? {
        PushOutcome::Planned(plan) => {
            println!("DRY RUN: nothing uploaded or journaled");
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        PushOutcome::Journaled(entry) => {
            println!(
                "{} {} ({} bytes, {} chunk(s), bucket {})",
                entry.archive_id,
                entry.original.name,
                entry.original.size_bytes,
                entry.chunks.len(),
                entry.backend_ref.release_tag
            );
        }
    }
    Ok(())
}

pub fn pull(
    config: ArchiveConfig,
    archive_id: &str,
    outdir: PathBuf,
    dry_run: bool,
    extract_to: Option<PathBuf>,
) -> Result<()> {
    let archive = Archive::open(config)?;
    let mut request = PullRequest::new(archive_id, outdir);
    request.dry_run = dry_run;
    request.extract_to = extract_to;

    match archive.pull(&request)? {
        PullOutcome::Planned(plan) => {
            println!("DRY RUN: nothing downloaded");
            println!("{}", serde_json::to_string_pretty(&plan)?);
        }
        PullOutcome::Restored(report) => {
            println!(
                "{} -> {} ({} bytes, sha256 {})",
                report.entry.archive_id,
                report.path.display(),
                report.entry.original.size_bytes,
                report.entry.original.sha256
            );
            if let (Some(extracted), Some(dir)) = (&report.extracted, &request.extract_to) {
                println!(
                    "extracted {} file(s), {} dir(s) into {}",
                    extracted.files,
                    extracted.dirs,
                    dir.display()
                );
            }
        }
    }
    Ok(())
}

pub fn build_index(config: ArchiveConfig, latest_n: Option<usize>, dry_run: bool) -> Result<()> {
    let latest_n = latest_n.unwrap_or(config.latest_n);
    let store = ManifestStore::open(config.manifest_path())?;
    let index_dir = config.index_dir();
    let entries = store.entries()?;
    let views = index::rebuild(&entries, latest_n);

    claims::from_config(&config).ensure_unclaimed(&index_dir)?;
    if dry_run {
        println!("DRY RUN: would write into {}", index_dir.display());
        for (relative, content) in views.render()? {
            println!("  {} ({} bytes)", relative.display(), content.len());
        }
        return Ok(());
    }

    let report = views
        .write(&index_dir)
        .with_context(|| format!("failed to write index into {}", index_dir.display()))?;
    println!(
        "index rebuilt: {} latest, {} tag file(s), {} stale removed",
        report.latest, report.tag_files, report.removed_tag_files
    );
    Ok(())
}

pub fn list(
    config: ArchiveConfig,
    tag: Option<String>,
    query: Option<String>,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    let store = ManifestStore::open(config.manifest_path())?;
    let filter = ListFilter { tag, query, limit };
    let entries = query::list(store.entries()?, &filter);

    for entry in &entries {
        if json {
            println!("{}", entry.to_line()?);
            continue;
        }
        let tags: Vec<&str> = entry.tags.iter().map(String::as_str).collect();
        println!(
            "{}  {}  {:>12}  {}  [{}]  {}",
            entry.archive_id,
            entry.created_at.format("%Y-%m-%d %H:%M:%S"),
            entry.original.size_bytes,
            entry.original.name,
            tags.join(","),
            entry.note
        );
    }
    Ok(())
}

pub fn extract(bundle: &Path, dest: &Path) -> Result<()> {
    let report = archivist::extract(bundle, dest)?;
    println!(
        "extracted {} file(s), {} dir(s), {} link(s), {} bytes into {}",
        report.files,
        report.dirs,
        report.links,
        report.bytes,
        dest.display()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use archivist::{ArchiveError, ErrorKind};
    use std::fs;
    use tempfile::TempDir;

    fn claimed_index(temp: &TempDir) -> Result<ArchiveConfig> {
        let mut config = ArchiveConfig::with_root(temp.path().join("repo"));
        let claims = temp.path().join("claims.json");
        fs::write(
            &claims,
            format!(
                r#"[{{"id": "L-4", "owner": "agent-1", "mode": "exclusive", "path": "{}"}}]"#,
                config.index_dir().display()
            ),
        )?;
        config.claims_file = Some(claims);
        Ok(config)
    }

    #[test]
    fn test_build_index_dry_run_honours_claims() -> Result<()> {
        let temp = TempDir::new()?;
        for dry_run in [true, false] {
            let err = build_index(claimed_index(&temp)?, None, dry_run).unwrap_err();
            let cause = err
                .downcast_ref::<ArchiveError>()
                .context("expected an archive error")?;
            assert_eq!(cause.kind(), ErrorKind::Concurrency);
        }
        Ok(())
    }
}
