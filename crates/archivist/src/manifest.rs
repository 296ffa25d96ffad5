//! Manifest entry types and the line format of the journal.
//!
//! Each successful push appends exactly one [`ManifestEntry`] as a single
//! JSON line. Entries are immutable once written. Fields this version does
//! not know about are kept in [`ManifestEntry::extra`] and written back out
//! unchanged, so older binaries never strip data added by newer ones.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

use crate::error::ArchiveError;
use crate::hash::Sha256Hex;

pub const FULL_SUFFIX: &str = "__full.bin";
const PART_MARKER: &str = "__part-";

/// Primary key of a manifest entry, `A-YYYY-MM-DD-####`.
///
/// The sequence is zero-padded to four digits but is not bounded by them;
/// sequence 10000 renders as `A-YYYY-MM-DD-10000`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArchiveId(String);

impl ArchiveId {
    pub fn new(date: NaiveDate, sequence: u64) -> Self {
        Self(format!("{}{:04}", Self::day_prefix(date), sequence))
    }

    /// Use a caller-supplied id verbatim. No format or uniqueness check.
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn day_prefix(date: NaiveDate) -> String {
        format!("A-{}-", date.format("%Y-%m-%d"))
    }

    /// Sequence number if this id was allocated on `date`.
    pub fn sequence_on(&self, date: NaiveDate) -> Option<u64> {
        parse_sequence(&self.0, &Self::day_prefix(date))
    }

    /// Next id for `today` given every id already journaled.
    ///
    /// Pure: the caller is responsible for running this and the append that
    /// follows inside one critical section.
    pub fn allocate<'a, I>(existing: I, today: NaiveDate) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let prefix = Self::day_prefix(today);
        let max = existing
            .into_iter()
            .filter_map(|id| parse_sequence(id, &prefix))
            .max()
            .unwrap_or(0);
        Self::new(today, max + 1)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn parse_sequence(id: &str, prefix: &str) -> Option<u64> {
    let rest = id.strip_prefix(prefix)?;
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok()
}

impl fmt::Display for ArchiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ArchiveId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Bucket name for a calendar day, `arch-YYYY-MM-DD`.
pub fn bucket_for(date: NaiveDate) -> String {
    format!("arch-{}", date.format("%Y-%m-%d"))
}

/// Where the backend keeps the chunks of one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendRef {
    pub collection_id: String,
    pub release_tag: String,
}

/// The whole, unchunked payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginalInfo {
    pub name: String,
    pub size_bytes: u64,
    pub sha256: Sha256Hex,
}

/// One uploaded asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub name: String,
    pub size_bytes: u64,
    pub sha256: Sha256Hex,
}

/// One journaled archive operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub archive_id: ArchiveId,
    pub created_at: DateTime<Utc>,
    pub backend_ref: BackendRef,
    pub original: OriginalInfo,
    /// Authoritative concatenation order.
    pub chunks: Vec<ChunkInfo>,
    pub chunk_size_bytes: u64,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub note: String,
    /// Unknown top-level fields, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ManifestEntry {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Check that the chunk list has exactly one valid naming shape and
    /// that the chunk sizes add up to the original size.
    pub fn validate_chunks(&self) -> Result<(), ArchiveError> {
        validate_chunk_names(&self.chunks)?;
        let total: u64 = self.chunks.iter().map(|c| c.size_bytes).sum();
        if total != self.original.size_bytes {
            return Err(ArchiveError::integrity(
                format!("{} chunk sizes", self.archive_id),
                self.original.size_bytes,
                total,
            ));
        }
        Ok(())
    }

    /// Serialize as one journal line, without the trailing newline.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Name of the single chunk of a payload that fits in one chunk.
pub fn full_chunk_name(prefix: &str) -> String {
    format!("{prefix}{FULL_SUFFIX}")
}

/// Name of part `number` (1-based) of a split payload.
pub fn part_chunk_name(prefix: &str, number: usize) -> String {
    format!("{prefix}{PART_MARKER}{number:04}.bin")
}

/// Either one `__full.bin`, or `__part-0001.bin` onward with no gaps and a
/// shared prefix. Never mixed.
pub fn validate_chunk_names(chunks: &[ChunkInfo]) -> Result<(), ArchiveError> {
    let first = chunks
        .first()
        .ok_or_else(|| ArchiveError::integrity("chunk list", "at least one chunk", "none"))?;
    if let Some(bad) = chunks.iter().find(|c| c.name.contains(['/', '\\'])) {
        return Err(ArchiveError::integrity("chunk name", "a bare file name", &bad.name));
    }

    if let Some(prefix) = first.name.strip_suffix(FULL_SUFFIX) {
        if chunks.len() != 1 {
            return Err(ArchiveError::integrity(
                format!("chunk layout of {prefix}"),
                "a single __full.bin chunk",
                format!("{} chunks", chunks.len()),
            ));
        }
        return Ok(());
    }

    let prefix = first
        .name
        .rsplit_once(PART_MARKER)
        .map(|(prefix, _)| prefix)
        .ok_or_else(|| {
            ArchiveError::integrity("chunk name", "__full.bin or __part-NNNN.bin", &first.name)
        })?;

    for (i, chunk) in chunks.iter().enumerate() {
        let expected = part_chunk_name(prefix, i + 1);
        if chunk.name != expected {
            return Err(ArchiveError::integrity(
                format!("chunk {}", i + 1),
                expected,
                &chunk.name,
            ));
        }
    }
    Ok(())
}

/// Why a journal line was not an entry.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("line is not JSON: {0}")]
    NotJson(#[source] serde_json::Error),

    #[error("line is JSON but not an object")]
    NotObject,

    #[error("object does not match the entry schema: {0}")]
    Schema(#[source] serde_json::Error),
}

/// Parse one journal line.
pub fn parse_line(line: &str) -> Result<ManifestEntry, ParseError> {
    let value: Value = serde_json::from_str(line).map_err(ParseError::NotJson)?;
    entry_from_value(value)
}

/// Validate an already-decoded JSON value as an entry.
pub fn entry_from_value(value: Value) -> Result<ManifestEntry, ParseError> {
    if !value.is_object() {
        return Err(ParseError::NotObject);
    }
    serde_json::from_value(value).map_err(ParseError::Schema)
}

/// The `archive_id` of any JSON object line, even one that fails the full
/// schema. Id allocation must see these too.
pub fn archive_id_of_line(line: &str) -> Option<String> {
    let value: Value = serde_json::from_str(line).ok()?;
    value.get("archive_id")?.as_str().map(str::to_string)
}
