//! Pull: journal entry -> downloaded chunks -> verified file.
//!
//! ```text
//! RESOLVED -> DOWNLOADED -> CHUNKS_VERIFIED -> CONCATENATED -> WHOLE_VERIFIED
//! ```
//!
//! Chunks land in a private temporary directory. The output is assembled
//! under a hidden temporary name in the destination directory and renamed
//! to its final name only after the whole-file hash matches, so a failed
//! pull never leaves a file at the requested path.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::archive::Archive;
use crate::error::{ArchiveError, IoContext, PullError, PullStage, Result};
use crate::extract::{self, ExtractReport};
use crate::hash::{Sha256Hex, StreamingHasher, READ_BLOCK_BYTES};
use crate::manifest::{ChunkInfo, ManifestEntry, OriginalInfo};

#[derive(Debug, Clone)]
pub struct PullRequest {
    pub archive_id: String,
    pub outdir: PathBuf,
    pub dry_run: bool,
    /// Unpack the restored bundle here after verification.
    pub extract_to: Option<PathBuf>,
}

impl PullRequest {
    pub fn new(archive_id: impl Into<String>, outdir: impl Into<PathBuf>) -> Self {
        Self {
            archive_id: archive_id.into(),
            outdir: outdir.into(),
            dry_run: false,
            extract_to: None,
        }
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn extract_to(mut self, dir: impl Into<PathBuf>) -> Self {
        self.extract_to = Some(dir.into());
        self
    }
}

/// What a pull would fetch and where it would write.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PullPlan {
    pub archive_id: String,
    pub collection_id: String,
    pub bucket: String,
    pub original: OriginalInfo,
    pub chunks: Vec<ChunkInfo>,
    pub destination: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PullReport {
    pub entry: ManifestEntry,
    pub path: PathBuf,
    pub extracted: Option<ExtractReport>,
}

#[derive(Debug, Clone)]
pub enum PullOutcome {
    Planned(PullPlan),
    Restored(PullReport),
}

impl Archive {
    /// Run the pull pipeline for `request`.
    pub fn pull(&self, request: &PullRequest) -> std::result::Result<PullOutcome, PullError> {
        let mut stage = None;
        match self.pull_stages(request, &mut stage) {
            Ok(outcome) => Ok(outcome),
            Err(source) => {
                let err = PullError {
                    archive_id: request.archive_id.clone(),
                    stage,
                    source,
                };
                warn!(error = %err, cause = %err.source, "pull failed");
                Err(err)
            }
        }
    }

    fn pull_stages(
        &self,
        request: &PullRequest,
        stage: &mut Option<PullStage>,
    ) -> Result<PullOutcome> {
        let mut reached = |s: PullStage| {
            debug!(stage = %s, archive_id = %request.archive_id, "pull stage reached");
            *stage = Some(s);
        };

        // RESOLVED
        let entry = self
            .store()
            .find_by_id(&request.archive_id)?
            .ok_or_else(|| ArchiveError::NotFound(request.archive_id.clone()))?;
        entry.validate_chunks()?;
        let name = destination_name(&entry.original.name)?;
        let destination = request.outdir.join(&name);
        self.claims().ensure_unclaimed(&destination)?;
        if let Some(dir) = &request.extract_to {
            self.claims().ensure_unclaimed(dir)?;
        }
        if entry.backend_ref.collection_id != self.backend().collection_id() {
            warn!(
                archive_id = %entry.archive_id,
                recorded = %entry.backend_ref.collection_id,
                configured = %self.backend().collection_id(),
                "entry was pushed to a different collection"
            );
        }
        reached(PullStage::Resolved);

        if request.dry_run {
            let plan = PullPlan {
                archive_id: entry.archive_id.to_string(),
                collection_id: entry.backend_ref.collection_id.clone(),
                bucket: entry.backend_ref.release_tag.clone(),
                original: entry.original.clone(),
                chunks: entry.chunks.clone(),
                destination,
            };
            info!(
                archive_id = %plan.archive_id,
                chunks = plan.chunks.len(),
                destination = %plan.destination.display(),
                "pull planned"
            );
            return Ok(PullOutcome::Planned(plan));
        }

        // DOWNLOADED
        let bucket = &entry.backend_ref.release_tag;
        let downloads = tempfile::Builder::new()
            .prefix("archivist-pull-")
            .tempdir()
            .io_context(|| "failed to create download directory")?;
        let mut local = Vec::with_capacity(entry.chunks.len());
        for chunk in &entry.chunks {
            debug!(chunk = %chunk.name, bucket = %bucket, "downloading chunk");
            local.push(self.backend().download(bucket, &chunk.name, downloads.path())?);
        }
        reached(PullStage::Downloaded);

        // CHUNKS_VERIFIED
        for (chunk, path) in entry.chunks.iter().zip(&local) {
            verify_chunk(chunk, path)?;
        }
        reached(PullStage::ChunksVerified);

        // CONCATENATED
        fs::create_dir_all(&request.outdir)
            .io_context(|| format!("failed to create {}", request.outdir.display()))?;
        let mut assembled = tempfile::Builder::new()
            .prefix(&format!(".{name}."))
            .suffix(".partial")
            .tempfile_in(&request.outdir)
            .io_context(|| format!("failed to create temp file in {}", request.outdir.display()))?;
        let mut whole = StreamingHasher::new();
        let mut buf = vec![0u8; READ_BLOCK_BYTES];
        for path in &local {
            let mut reader =
                File::open(path).io_context(|| format!("failed to open {}", path.display()))?;
            loop {
                let n = reader
                    .read(&mut buf)
                    .io_context(|| format!("failed to read {}", path.display()))?;
                if n == 0 {
                    break;
                }
                whole.update(&buf[..n]);
                assembled
                    .write_all(&buf[..n])
                    .io_context(|| format!("failed to write {}", assembled.path().display()))?;
            }
        }
        assembled
            .as_file()
            .sync_all()
            .io_context(|| format!("failed to sync {}", assembled.path().display()))?;
        reached(PullStage::Concatenated);

        // WHOLE_VERIFIED. On mismatch the temp file is removed when dropped.
        let size = whole.bytes();
        if size != entry.original.size_bytes {
            return Err(ArchiveError::integrity(
                format!("{} size", entry.original.name),
                entry.original.size_bytes,
                size,
            ));
        }
        let digest = whole.finish();
        if digest != entry.original.sha256 {
            return Err(ArchiveError::integrity(
                entry.original.name.clone(),
                &entry.original.sha256,
                digest,
            ));
        }
        assembled.persist(&destination).map_err(|e| ArchiveError::Io {
            context: format!("failed to move into place {}", destination.display()),
            source: e.error,
        })?;
        reached(PullStage::WholeVerified);
        info!(
            archive_id = %entry.archive_id,
            path = %destination.display(),
            size_bytes = size,
            "pull verified"
        );

        let extracted = match &request.extract_to {
            Some(dir) => Some(extract::extract(&destination, dir)?),
            None => None,
        };

        Ok(PullOutcome::Restored(PullReport {
            entry,
            path: destination,
            extracted,
        }))
    }
}

fn verify_chunk(chunk: &ChunkInfo, path: &Path) -> Result<()> {
    let (digest, size) =
        Sha256Hex::from_file(path).io_context(|| format!("failed to hash {}", path.display()))?;
    if size != chunk.size_bytes {
        return Err(ArchiveError::integrity(
            format!("chunk {} size", chunk.name),
            chunk.size_bytes,
            size,
        ));
    }
    if digest != chunk.sha256 {
        return Err(ArchiveError::integrity(
            format!("chunk {}", chunk.name),
            &chunk.sha256,
            digest,
        ));
    }
    debug!(chunk = %chunk.name, "chunk verified");
    Ok(())
}

/// Only the final component of the recorded name is ever used.
fn destination_name(original: &str) -> Result<String> {
    match Path::new(original).components().next_back() {
        Some(Component::Normal(name)) => Ok(name.to_string_lossy().into_owned()),
        _ => Err(ArchiveError::InvalidInput(format!(
            "recorded file name {original:?} is not usable as a destination"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DirBackend;
    use crate::claims::NoClaims;
    use crate::config::ArchiveConfig;
    use crate::error::ErrorKind;
    use crate::manifest::ArchiveId;
    use crate::push::{PushOutcome, PushRequest};
    use tempfile::TempDir;

    fn archive_in(temp: &TempDir) -> anyhow::Result<Archive> {
        let config = ArchiveConfig::with_root(temp.path().join("repo")).with_chunk_size(1000);
        let backend = DirBackend::new(temp.path().join("blobs"));
        Ok(Archive::with_parts(config, Box::new(backend), Box::new(NoClaims))?)
    }

    fn pushed(archive: &Archive, temp: &TempDir, len: usize) -> anyhow::Result<ManifestEntry> {
        let path = temp.path().join("take.wav");
        let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
        fs::write(&path, data)?;
        match archive.push(&PushRequest::new(&path))? {
            PushOutcome::Journaled(entry) => Ok(entry),
            PushOutcome::Planned(_) => anyhow::bail!("push was a dry run"),
        }
    }

    #[test]
    fn test_pull_restores_bytes() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let archive = archive_in(&temp)?;
        let entry = pushed(&archive, &temp, 2345)?;

        let out = temp.path().join("out");
        let outcome = archive.pull(&PullRequest::new(entry.archive_id.as_str(), &out))?;
        let PullOutcome::Restored(report) = outcome else {
            panic!("expected a restored file");
        };
        assert_eq!(report.path, out.join("take.wav"));
        assert_eq!(fs::read(&report.path)?, fs::read(temp.path().join("take.wav"))?);

        let leftovers: Vec<_> = fs::read_dir(&out)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".partial"))
            .collect();
        assert!(leftovers.is_empty());
        Ok(())
    }

    #[test]
    fn test_unknown_id_is_not_found_before_resolve() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let archive = archive_in(&temp)?;

        let err = archive
            .pull(&PullRequest::new("A-1999-01-01-0001", temp.path()))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.stage, None);
        assert!(err.to_string().contains("A-1999-01-01-0001"));
        Ok(())
    }

    #[test]
    fn test_corrupt_chunk_fails_and_leaves_no_file() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let archive = archive_in(&temp)?;
        let entry = pushed(&archive, &temp, 2500)?;

        let backend = DirBackend::new(temp.path().join("blobs"));
        let victim = backend.asset_path(&entry.backend_ref.release_tag, &entry.chunks[1].name)?;
        let mut bytes = fs::read(&victim)?;
        bytes[17] ^= 0xff;
        fs::write(&victim, bytes)?;

        let out = temp.path().join("out");
        let err = archive
            .pull(&PullRequest::new(entry.archive_id.as_str(), &out))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert_eq!(err.stage, Some(PullStage::Downloaded));
        assert!(!out.join("take.wav").exists());
        Ok(())
    }

    #[test]
    fn test_whole_file_mismatch_leaves_nothing_behind() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let archive = archive_in(&temp)?;
        let mut entry = pushed(&archive, &temp, 2200)?;

        // Chunks still verify; only the recorded whole-file digest is wrong.
        entry.archive_id = ArchiveId::from_raw("A-2026-01-01-0042");
        entry.original.sha256 = Sha256Hex::from_data(b"some other take");
        archive.store().append(&entry)?;

        let out = temp.path().join("out");
        let err = archive
            .pull(&PullRequest::new("A-2026-01-01-0042", &out))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert_eq!(err.stage, Some(PullStage::Concatenated));
        assert!(!out.join("take.wav").exists());
        let leftovers: Vec<_> = fs::read_dir(&out)?.filter_map(|e| e.ok()).collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
        Ok(())
    }

    #[test]
    fn test_missing_chunk_is_backend_error() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let archive = archive_in(&temp)?;
        let entry = pushed(&archive, &temp, 1500)?;

        let backend = DirBackend::new(temp.path().join("blobs"));
        fs::remove_file(backend.asset_path(&entry.backend_ref.release_tag, &entry.chunks[0].name)?)?;

        let out = temp.path().join("out");
        let err = archive
            .pull(&PullRequest::new(entry.archive_id.as_str(), &out))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);
        assert_eq!(err.stage, Some(PullStage::Resolved));
        assert!(!out.join("take.wav").exists());
        Ok(())
    }

    #[test]
    fn test_dry_run_reports_plan_only() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let archive = archive_in(&temp)?;
        let entry = pushed(&archive, &temp, 3000)?;

        let out = temp.path().join("out");
        let outcome = archive.pull(&PullRequest::new(entry.archive_id.as_str(), &out).dry_run())?;
        let PullOutcome::Planned(plan) = outcome else {
            panic!("expected a plan");
        };
        assert_eq!(plan.chunks.len(), 3);
        assert_eq!(plan.destination, out.join("take.wav"));
        assert!(!out.exists());
        Ok(())
    }

    #[test]
    fn test_destination_name_uses_last_component() -> anyhow::Result<()> {
        assert_eq!(destination_name("bundle.tar.gz")?, "bundle.tar.gz");
        assert_eq!(destination_name("renders/ep1/mix.wav")?, "mix.wav");
        assert_eq!(destination_name("../../etc/passwd")?, "passwd");
        assert!(destination_name("").is_err());
        assert!(destination_name("..").is_err());
        assert!(destination_name("/").is_err());
        Ok(())
    }
}
