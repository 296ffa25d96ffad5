//! Push: local file -> chunks -> backend -> one journal line.
//!
//! ```text
//! PLANNED -> CHUNKED -> BUCKET_READY -> UPLOADED -> JOURNALED
//! ```
//!
//! The journal is only touched in the last step, under the manifest lock,
//! so any failure before `JOURNALED` leaves zero manifest rows. The id is
//! allocated twice: once at planning time for reporting (and dry runs), and
//! again inside the lock at append time. A concurrent writer can make the
//! two differ; the journaled id is the one that counts.

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::archive::Archive;
use crate::chunker;
use crate::error::{ArchiveError, IoContext, PushError, PushStage, Result};
use crate::manifest::{bucket_for, ArchiveId, BackendRef, ChunkInfo, ManifestEntry, OriginalInfo};

/// What to push and how.
#[derive(Debug, Clone, Default)]
pub struct PushRequest {
    pub source: PathBuf,
    pub tags: BTreeSet<String>,
    pub note: String,
    /// Overrides the configured chunk bound.
    pub chunk_size_bytes: Option<u64>,
    /// Use this id verbatim instead of allocating one.
    pub archive_id: Option<String>,
    /// Plan and chunk, but upload and journal nothing.
    pub dry_run: bool,
}

impl PushRequest {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            ..Self::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }

    pub fn with_chunk_size(mut self, bytes: u64) -> Self {
        self.chunk_size_bytes = Some(bytes);
        self
    }

    pub fn with_archive_id(mut self, id: impl Into<String>) -> Self {
        self.archive_id = Some(id.into());
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }
}

/// Everything a push would do, computed without side effects on the
/// journal or backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PushPlan {
    pub archive_id: ArchiveId,
    pub bucket: String,
    pub collection_id: String,
    pub original: OriginalInfo,
    pub chunks: Vec<ChunkInfo>,
    pub chunk_size_bytes: u64,
}

#[derive(Debug, Clone)]
pub enum PushOutcome {
    /// Dry run: the plan only.
    Planned(PushPlan),
    /// The entry as appended to the journal.
    Journaled(ManifestEntry),
}

impl PushOutcome {
    pub fn archive_id(&self) -> &ArchiveId {
        match self {
            PushOutcome::Planned(plan) => &plan.archive_id,
            PushOutcome::Journaled(entry) => &entry.archive_id,
        }
    }
}

/// Last stage reached and the id, for error reports.
#[derive(Debug, Default)]
struct Progress {
    archive_id: Option<String>,
    stage: Option<PushStage>,
}

impl Progress {
    fn reached(&mut self, stage: PushStage) {
        debug!(stage = %stage, archive_id = ?self.archive_id, "push stage reached");
        self.stage = Some(stage);
    }

    fn fail(self, source: ArchiveError) -> PushError {
        PushError {
            archive_id: self.archive_id,
            stage: self.stage,
            source,
        }
    }
}

impl Archive {
    /// Run the push pipeline for `request`.
    pub fn push(&self, request: &PushRequest) -> std::result::Result<PushOutcome, PushError> {
        let mut progress = Progress::default();
        match self.push_stages(request, &mut progress) {
            Ok(outcome) => Ok(outcome),
            Err(source) => {
                let err = progress.fail(source);
                warn!(error = %err, cause = %err.source, "push failed");
                Err(err)
            }
        }
    }

    fn push_stages(&self, request: &PushRequest, progress: &mut Progress) -> Result<PushOutcome> {
        // PLANNED
        let chunk_size_bytes = request
            .chunk_size_bytes
            .unwrap_or(self.config().chunk_size_bytes);
        if chunk_size_bytes == 0 {
            return Err(ArchiveError::Configuration(
                "chunk_size_bytes must be greater than zero".to_string(),
            ));
        }
        let metadata = fs::metadata(&request.source)
            .io_context(|| format!("cannot read {}", request.source.display()))?;
        if !metadata.is_file() {
            return Err(ArchiveError::InvalidInput(format!(
                "{} is not a regular file",
                request.source.display()
            )));
        }
        self.claims().ensure_unclaimed(self.store().path())?;

        let today = Utc::now().date_naive();
        let snapshot = self.store().snapshot()?;
        let planned_id = match request.archive_id.as_deref() {
            Some(id) => {
                let id = explicit_id(id)?;
                if snapshot.contains(id.as_str()) {
                    warn!(archive_id = %id, "explicit archive id already exists in the manifest");
                }
                id
            }
            None => snapshot.allocate(today),
        };
        let bucket = bucket_for(today);
        progress.archive_id = Some(planned_id.to_string());
        progress.reached(PushStage::Planned);

        // CHUNKED
        let staging = tempfile::Builder::new()
            .prefix("archivist-push-")
            .tempdir()
            .io_context(|| "failed to create staging directory")?;
        let set = chunker::chunk(&request.source, chunk_size_bytes, staging.path())?;
        progress.reached(PushStage::Chunked);

        let plan = PushPlan {
            archive_id: planned_id,
            bucket,
            collection_id: self.backend().collection_id().to_string(),
            original: set.original.clone(),
            chunks: set.chunks.clone(),
            chunk_size_bytes,
        };
        info!(
            archive_id = %plan.archive_id,
            bucket = %plan.bucket,
            chunks = plan.chunks.len(),
            size_bytes = plan.original.size_bytes,
            sha256 = %plan.original.sha256,
            dry_run = request.dry_run,
            "push planned"
        );
        if request.dry_run {
            return Ok(PushOutcome::Planned(plan));
        }

        // BUCKET_READY
        self.backend().ensure_bucket_exists(&plan.bucket)?;
        progress.reached(PushStage::BucketReady);

        // UPLOADED
        for (info, path) in set.staged() {
            debug!(
                chunk = %info.name,
                size_bytes = info.size_bytes,
                bucket = %plan.bucket,
                "uploading chunk"
            );
            self.backend().upload(&plan.bucket, path)?;
        }
        progress.reached(PushStage::Uploaded);

        // JOURNALED
        let PushPlan {
            bucket,
            collection_id,
            original,
            chunks,
            ..
        } = plan;
        let entry = self.store().append_with(|snapshot| {
            let archive_id = match request.archive_id.as_deref() {
                Some(id) => explicit_id(id)?,
                None => snapshot.allocate(today),
            };
            Ok(ManifestEntry {
                archive_id,
                created_at: Utc::now(),
                backend_ref: BackendRef {
                    collection_id,
                    release_tag: bucket,
                },
                original,
                chunks,
                chunk_size_bytes,
                tags: request.tags.clone(),
                note: request.note.clone(),
                extra: Default::default(),
            })
        })?;
        progress.archive_id = Some(entry.archive_id.to_string());
        progress.reached(PushStage::Journaled);
        info!(
            archive_id = %entry.archive_id,
            bucket = %entry.backend_ref.release_tag,
            chunks = entry.chunks.len(),
            "push journaled"
        );

        self.store().write_summary(&entry);
        self.refresh_index_best_effort();
        Ok(PushOutcome::Journaled(entry))
    }
}

fn explicit_id(id: &str) -> Result<ArchiveId> {
    let id = id.trim();
    if id.is_empty() {
        return Err(ArchiveError::InvalidInput(
            "explicit archive id is empty".to_string(),
        ));
    }
    Ok(ArchiveId::from_raw(id))
}
