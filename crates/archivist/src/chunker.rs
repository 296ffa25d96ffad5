//! Chunker: split a file into backend-sized pieces in one streaming pass.
//!
//! The source is read in fixed blocks of [`READ_BLOCK_BYTES`] regardless of
//! the chunk bound. Bytes feed two hashers at once: the running whole-file
//! hash and the hash of the chunk currently being staged. Chunks are written
//! under temporary names and renamed once the whole-file hash is known,
//! since the chunk-name prefix is derived from it:
//!
//! ```text
//! {staging_dir}/
//! ├── <sha16>__full.bin          # payload <= chunk bound
//! └── <sha16>__part-0001.bin ... # otherwise, contiguous from 1
//! ```
//!
//! On failure the staging directory may hold partial files. It is expected
//! to be a scoped temporary directory owned by the caller.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ArchiveError, IoContext, Result};
use crate::hash::{Sha256Hex, StreamingHasher, READ_BLOCK_BYTES};
use crate::manifest::{full_chunk_name, part_chunk_name, ChunkInfo, OriginalInfo};

/// Result of chunking one source file.
#[derive(Debug, Clone)]
pub struct ChunkSet {
    pub original: OriginalInfo,
    /// In concatenation order.
    pub chunks: Vec<ChunkInfo>,
    /// Local staged file for each entry of `chunks`, same order.
    pub paths: Vec<PathBuf>,
    pub chunk_size_bytes: u64,
}

impl ChunkSet {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Chunks paired with their staged files.
    pub fn staged(&self) -> impl Iterator<Item = (&ChunkInfo, &Path)> {
        self.chunks.iter().zip(self.paths.iter().map(PathBuf::as_path))
    }
}

/// A chunk being written.
#[derive(Debug)]
struct StagingChunk {
    path: PathBuf,
    file: File,
    hasher: StreamingHasher,
}

impl StagingChunk {
    fn create(path: PathBuf) -> Result<Self> {
        let file = File::create(&path)
            .io_context(|| format!("failed to create staging chunk {}", path.display()))?;
        Ok(Self {
            path,
            file,
            hasher: StreamingHasher::new(),
        })
    }

    fn bytes_written(&self) -> u64 {
        self.hasher.bytes()
    }

    fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file
            .write_all(data)
            .io_context(|| format!("failed to write staging chunk {}", self.path.display()))?;
        self.hasher.update(data);
        Ok(())
    }

    fn seal(mut self) -> Result<(PathBuf, Sha256Hex, u64)> {
        self.file
            .flush()
            .io_context(|| format!("failed to flush staging chunk {}", self.path.display()))?;
        let size = self.hasher.bytes();
        Ok((self.path, self.hasher.finish(), size))
    }
}

/// Split `source` into chunks of at most `chunk_size_bytes` inside
/// `staging_dir`.
pub fn chunk(source: &Path, chunk_size_bytes: u64, staging_dir: &Path) -> Result<ChunkSet> {
    if chunk_size_bytes == 0 {
        return Err(ArchiveError::Configuration(
            "chunk_size_bytes must be greater than zero".to_string(),
        ));
    }
    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            ArchiveError::InvalidInput(format!("{} has no file name", source.display()))
        })?;

    let mut reader =
        File::open(source).io_context(|| format!("failed to open {}", source.display()))?;
    fs::create_dir_all(staging_dir)
        .io_context(|| format!("failed to create {}", staging_dir.display()))?;

    let mut whole = StreamingHasher::new();
    let mut sealed: Vec<(PathBuf, Sha256Hex, u64)> = Vec::new();
    let mut current: Option<StagingChunk> = None;
    let mut buf = vec![0u8; READ_BLOCK_BYTES];

    loop {
        let n = reader
            .read(&mut buf)
            .io_context(|| format!("failed to read {}", source.display()))?;
        if n == 0 {
            break;
        }
        whole.update(&buf[..n]);

        let mut block = &buf[..n];
        while !block.is_empty() {
            let mut staging = match current.take() {
                Some(staging) => staging,
                None => {
                    let temp = staging_dir.join(format!(".chunk-{:04}.partial", sealed.len() + 1));
                    StagingChunk::create(temp)?
                }
            };
            let room = chunk_size_bytes - staging.bytes_written();
            let take = block.len().min(usize::try_from(room).unwrap_or(usize::MAX));
            staging.write(&block[..take])?;
            block = &block[take..];

            if staging.bytes_written() == chunk_size_bytes {
                sealed.push(staging.seal()?);
            } else {
                current = Some(staging);
            }
        }
    }

    if let Some(tail) = current.take() {
        sealed.push(tail.seal()?);
    }
    // An empty source still produces one (empty) chunk.
    if sealed.is_empty() {
        let temp = staging_dir.join(".chunk-0001.partial");
        sealed.push(StagingChunk::create(temp)?.seal()?);
    }

    let original = OriginalInfo {
        name,
        size_bytes: whole.bytes(),
        sha256: whole.finish(),
    };

    let total: u64 = sealed.iter().map(|(_, _, size)| size).sum();
    if total != original.size_bytes {
        return Err(ArchiveError::integrity(
            format!("chunks of {}", source.display()),
            original.size_bytes,
            total,
        ));
    }

    let prefix = original.sha256.short().to_string();
    let single = sealed.len() == 1;
    let mut chunks = Vec::with_capacity(sealed.len());
    let mut paths = Vec::with_capacity(sealed.len());
    for (i, (temp, sha256, size_bytes)) in sealed.into_iter().enumerate() {
        let name = if single {
            full_chunk_name(&prefix)
        } else {
            part_chunk_name(&prefix, i + 1)
        };
        let path = staging_dir.join(&name);
        fs::rename(&temp, &path)
            .io_context(|| format!("failed to rename {} to {}", temp.display(), path.display()))?;
        debug!(chunk = %name, size_bytes, "staged chunk");
        chunks.push(ChunkInfo {
            name,
            size_bytes,
            sha256,
        });
        paths.push(path);
    }

    Ok(ChunkSet {
        original,
        chunks,
        paths,
        chunk_size_bytes,
    })
}
