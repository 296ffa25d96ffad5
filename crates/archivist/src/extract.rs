//! Safe extraction of tar and tar.gz bundles.
//!
//! Two passes over the bundle. The first validates every member and writes
//! nothing; a single unsafe member fails the whole extraction. Only then
//! is the bundle reopened and unpacked. A member is unsafe when:
//!
//! - its path is absolute or climbs out of the destination with `..`
//! - it lies below a symlink member of the same bundle
//! - it is a symlink or hardlink whose target resolves outside, following
//!   the other symlinks of the bundle
//! - it is a device node or fifo
//!
//! While unpacking, a member whose parent directory is a symlink already
//! present under the destination is refused as well.
//!
//! Compression is detected from the gzip magic bytes, not the file name.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use serde::Serialize;
use tar::{Archive, EntryType};
use tracing::{error, info};

use crate::error::{ArchiveError, IoContext, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Links followed before a chain is treated as a loop.
const MAX_LINK_DEPTH: usize = 40;

/// What an extraction wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractReport {
    pub files: usize,
    pub dirs: usize,
    pub links: usize,
    pub bytes: u64,
}

/// Unpack `archive_file` into `dest_dir`, refusing the whole bundle if any
/// member would land outside `dest_dir`.
pub fn extract(archive_file: &Path, dest_dir: &Path) -> Result<ExtractReport> {
    let report = validate(archive_file)?;

    fs::create_dir_all(dest_dir)
        .io_context(|| format!("failed to create {}", dest_dir.display()))?;
    let mut archive = open(archive_file)?;
    let entries = archive
        .entries()
        .io_context(|| format!("failed to read {}", archive_file.display()))?;
    for entry in entries {
        let mut entry =
            entry.io_context(|| format!("failed to read {}", archive_file.display()))?;
        let raw = entry
            .path()
            .io_context(|| format!("unreadable member path in {}", archive_file.display()))?
            .into_owned();
        let member = raw.display().to_string();
        let relative = contained(&raw).map_err(|reason| unsafe_member(&member, reason))?;
        let kind = entry.header().entry_type();
        if matches!(kind, EntryType::XGlobalHeader | EntryType::XHeader) {
            continue;
        }
        let target = on_disk(dest_dir, &relative, &member)?;

        if kind == EntryType::Directory {
            fs::create_dir_all(&target)
                .io_context(|| format!("failed to create {}", target.display()))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .io_context(|| format!("failed to create {}", parent.display()))?;
        }
        if is_symlink(&target) {
            fs::remove_file(&target)
                .io_context(|| format!("failed to replace {}", target.display()))?;
        }
        if kind == EntryType::Link {
            let source = contained(&link_target(&entry, &member)?)
                .map_err(|reason| unsafe_member(&member, reason))?;
            let source = on_disk(dest_dir, &source, &member)?;
            fs::hard_link(&source, &target).io_context(|| format!("failed to link {member}"))?;
        } else {
            entry
                .unpack(&target)
                .io_context(|| format!("failed to unpack {member}"))?;
        }
    }

    info!(
        bundle = %archive_file.display(),
        dest = %dest_dir.display(),
        files = report.files,
        dirs = report.dirs,
        bytes = report.bytes,
        "bundle extracted"
    );
    Ok(report)
}

/// A member read in the first pass.
struct Member {
    name: String,
    path: PathBuf,
    kind: EntryType,
    size: u64,
    link: Option<PathBuf>,
}

/// Check every member without writing anything.
///
/// All symlink members are collected before any is judged, so a link is
/// resolved through every other link in the bundle regardless of order.
pub fn validate(archive_file: &Path) -> Result<ExtractReport> {
    let mut archive = open(archive_file)?;
    let mut members = Vec::new();
    let mut symlinks: HashMap<PathBuf, PathBuf> = HashMap::new();

    let entries = archive
        .entries()
        .io_context(|| format!("failed to read {}", archive_file.display()))?;
    for entry in entries {
        let entry = entry.io_context(|| format!("failed to read {}", archive_file.display()))?;
        let raw = entry
            .path()
            .io_context(|| format!("unreadable member path in {}", archive_file.display()))?
            .into_owned();
        let name = raw.display().to_string();
        let path = contained(&raw).map_err(|reason| unsafe_member(&name, reason))?;
        let kind = entry.header().entry_type();
        let link = match kind {
            EntryType::Symlink | EntryType::Link => Some(link_target(&entry, &name)?),
            _ => None,
        };
        if let (EntryType::Symlink, Some(target)) = (kind, &link) {
            symlinks.insert(path.clone(), target.clone());
        }
        members.push(Member {
            name,
            path,
            kind,
            size: entry.size(),
            link,
        });
    }

    let mut report = ExtractReport::default();
    for member in &members {
        check_member(member, &symlinks, &mut report)?;
    }
    Ok(report)
}

fn check_member(
    member: &Member,
    symlinks: &HashMap<PathBuf, PathBuf>,
    report: &mut ExtractReport,
) -> Result<()> {
    let name = member.name.as_str();
    let path = member.path.as_path();
    if through_symlink(path, symlinks) {
        return Err(unsafe_member(name, "path passes through a symlink member"));
    }
    let metadata_only = matches!(
        member.kind,
        EntryType::Directory | EntryType::XGlobalHeader | EntryType::XHeader
    );
    if path.as_os_str().is_empty() && !metadata_only {
        return Err(unsafe_member(name, "member resolves to the destination itself"));
    }

    match (member.kind, &member.link) {
        (EntryType::Regular | EntryType::Continuous | EntryType::GNUSparse, _) => {
            report.files += 1;
            report.bytes += member.size;
        }
        (EntryType::Directory, _) => report.dirs += 1,
        (EntryType::Symlink, Some(target)) => {
            let parent = path.parent().unwrap_or_else(|| Path::new(""));
            resolve_link(parent, target, symlinks, 0)
                .map_err(|reason| unsafe_member(name, reason))?;
            report.links += 1;
        }
        (EntryType::Link, Some(target)) => {
            let resolved = contained(target)
                .map_err(|_| unsafe_member(name, "hardlink target escapes destination"))?;
            if through_symlink(&resolved, symlinks) || symlinks.contains_key(&resolved) {
                return Err(unsafe_member(name, "hardlink target is a symlink member"));
            }
            report.links += 1;
        }
        (EntryType::Char | EntryType::Block | EntryType::Fifo, _) => {
            return Err(unsafe_member(name, "device and fifo members are not supported"));
        }
        (EntryType::XGlobalHeader | EntryType::XHeader, _) => {}
        (other, _) => {
            return Err(unsafe_member(name, &format!("unsupported entry type {other:?}")));
        }
    }
    Ok(())
}

fn open(archive_file: &Path) -> Result<Archive<Box<dyn Read>>> {
    let file = File::open(archive_file)
        .io_context(|| format!("failed to open {}", archive_file.display()))?;
    let mut reader = BufReader::new(file);
    let gzip = reader
        .fill_buf()
        .io_context(|| format!("failed to read {}", archive_file.display()))?
        .starts_with(&GZIP_MAGIC);
    let inner: Box<dyn Read> = if gzip {
        Box::new(GzDecoder::new(reader))
    } else {
        Box::new(reader)
    };
    Ok(Archive::new(inner))
}

/// Normalize a member path relative to the destination, or explain why it
/// is not contained in it.
fn contained(path: &Path) -> std::result::Result<PathBuf, &'static str> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => return Err("absolute path"),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return Err("path escapes destination");
                }
            }
            Component::Normal(part) => out.push(part),
        }
    }
    Ok(out)
}

fn through_symlink(path: &Path, symlinks: &HashMap<PathBuf, PathBuf>) -> bool {
    path.ancestors()
        .skip(1)
        .any(|ancestor| symlinks.contains_key(ancestor))
}

/// Follow `target` from `dir` the way the filesystem will once every
/// symlink member exists, substituting each link met along the way.
fn resolve_link(
    dir: &Path,
    target: &Path,
    symlinks: &HashMap<PathBuf, PathBuf>,
    depth: usize,
) -> std::result::Result<PathBuf, &'static str> {
    if depth > MAX_LINK_DEPTH {
        return Err("symlink chain is too deep or circular");
    }
    let mut out = dir.to_path_buf();
    for component in target.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => return Err("symlink target is absolute"),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return Err("symlink target escapes destination");
                }
            }
            Component::Normal(part) => {
                out.push(part);
                if let Some(next) = symlinks.get(&out) {
                    let parent = out.parent().map(Path::to_path_buf).unwrap_or_default();
                    out = resolve_link(&parent, next, symlinks, depth + 1)?;
                }
            }
        }
    }
    Ok(out)
}

/// Where `relative` lands under `dest_dir`, refusing paths whose parents
/// are symlinks already on disk.
fn on_disk(dest_dir: &Path, relative: &Path, member: &str) -> Result<PathBuf> {
    for ancestor in relative.ancestors().skip(1) {
        if !ancestor.as_os_str().is_empty() && is_symlink(&dest_dir.join(ancestor)) {
            return Err(unsafe_member(member, "path passes through an existing symlink"));
        }
    }
    Ok(dest_dir.join(relative))
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|m| m.file_type().is_symlink())
}

fn link_target<R: Read>(entry: &tar::Entry<'_, R>, member: &str) -> Result<PathBuf> {
    entry
        .link_name()
        .io_context(|| format!("unreadable link target for {member}"))?
        .map(|target| target.into_owned())
        .ok_or_else(|| unsafe_member(member, "link has no target"))
}

fn unsafe_member(member: &str, reason: &str) -> ArchiveError {
    error!(member, reason, "unsafe archive member, refusing to extract");
    ArchiveError::UnsafeMember {
        member: member.to_string(),
        reason: reason.to_string(),
    }
}
