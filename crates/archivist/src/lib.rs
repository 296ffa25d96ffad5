//! Chunked, content-verified archival of large artifacts.
//!
//! Payloads (rendered audio, bundled project trees) are split into chunks
//! small enough for a size-limited blob backend, uploaded into a per-day
//! bucket, and recorded as one line in an append-only JSON Lines journal.
//! Pulling an archive downloads the chunks, verifies every hash, and only
//! then moves the reassembled file into place.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use archivist::{Archive, ArchiveConfig, PullRequest, PushRequest};
//!
//! // Reads ARCHIVIST_ROOT, ARCHIVIST_BACKEND_REPO / GH_REPO, ...
//! let config = ArchiveConfig::from_env().unwrap();
//! let archive = Archive::open(config).unwrap();
//!
//! let pushed = archive
//!     .push(&PushRequest::new("renders/ep12.tar.gz").with_tags(["ep12"]))
//!     .unwrap();
//! println!("archived as {}", pushed.archive_id());
//!
//! archive
//!     .pull(&PullRequest::new(pushed.archive_id().as_str(), "restore/"))
//!     .unwrap();
//! ```
//!
//! # Layout
//!
//! ```text
//! {root}/archive/
//! ├── manifest.jsonl        # source of truth, one entry per line
//! ├── manifest.jsonl.lock   # advisory lock for writers
//! ├── summary.log
//! └── index/                # derived, safe to delete
//!     ├── latest.json
//!     └── by_tag/<tag>.json
//! ```
//!
//! # Concurrency
//!
//! Any number of processes may push and pull against the same root. Writers
//! serialize on an OS advisory lock held across id allocation and append;
//! readers never lock and skip lines they cannot parse.

pub mod archive;
pub mod backend;
pub mod chunker;
pub mod claims;
pub mod config;
pub mod error;
pub mod extract;
pub mod hash;
pub mod index;
pub mod manifest;
pub mod pull;
pub mod push;
pub mod query;
pub mod store;

// Re-exports for convenience
pub use archive::Archive;
pub use backend::{BlobBackend, CliBackend, DirBackend};
pub use claims::{Claim, ClaimRegistry, ClaimsFile, NoClaims};
pub use config::{ArchiveConfig, BackendConfig, BackendKind};
pub use error::{ArchiveError, ErrorKind, PullError, PullStage, PushError, PushStage};
pub use extract::{extract, ExtractReport};
pub use hash::{HashError, Sha256Hex};
pub use index::{IndexRecord, IndexReport, IndexViews};
pub use manifest::{ArchiveId, BackendRef, ChunkInfo, ManifestEntry, OriginalInfo, ParseError};
pub use pull::{PullOutcome, PullPlan, PullReport, PullRequest};
pub use push::{PushOutcome, PushPlan, PushRequest};
pub use query::ListFilter;
pub use store::ManifestStore;
