//! Backend gateway: the blob store that holds uploaded chunks.
//!
//! Three blocking operations and nothing else. No retries happen here; a
//! failed push is retried by re-running it, which is safe because uploads
//! overwrite and the manifest is only appended after every upload succeeds.
//!
//! Implementations:
//! - [`CliBackend`] shells out to a release/asset CLI (`gh` by default):
//!   a bucket is a release tag, a chunk is a release asset.
//! - [`DirBackend`] mirrors buckets as subdirectories of a local root, for
//!   offline use and tests.

use std::ffi::OsStr;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use crate::config::{BackendConfig, BackendKind};
use crate::error::{ArchiveError, IoContext, Result};

/// Trait for chunk storage backends.
pub trait BlobBackend: Send + Sync {
    /// Identity recorded as `backend_ref.collection_id`.
    fn collection_id(&self) -> &str;

    /// Create the bucket if it does not exist yet.
    fn ensure_bucket_exists(&self, bucket: &str) -> Result<()>;

    /// Upload a local chunk as an asset named after its file name,
    /// replacing any asset of the same name.
    fn upload(&self, bucket: &str, local_chunk: &Path) -> Result<()>;

    /// Download `asset_name` into `dest_dir`, returning the local path.
    fn download(&self, bucket: &str, asset_name: &str, dest_dir: &Path) -> Result<PathBuf>;
}

/// Build the backend described by `config`.
///
/// Fails with a configuration error when the backend identity cannot be
/// resolved.
pub fn from_config(config: &BackendConfig) -> Result<Box<dyn BlobBackend>> {
    match config.kind {
        BackendKind::Cli => {
            let repo = config.repo.clone().filter(|r| !r.trim().is_empty()).ok_or_else(|| {
                ArchiveError::Configuration(
                    "backend repo is not set (ARCHIVIST_BACKEND_REPO, GH_REPO, or [archive.backend] repo)"
                        .to_string(),
                )
            })?;
            Ok(Box::new(CliBackend::new(&config.program, repo)))
        }
        BackendKind::Dir => {
            let dir = config.dir.clone().ok_or_else(|| {
                ArchiveError::Configuration(
                    "backend dir is not set (ARCHIVIST_BACKEND_DIR or [archive.backend] dir)"
                        .to_string(),
                )
            })?;
            Ok(Box::new(DirBackend::new(dir)))
        }
    }
}

/// Backend driven through an external CLI.
#[derive(Debug, Clone)]
pub struct CliBackend {
    program: String,
    repo: String,
}

impl CliBackend {
    pub fn new(program: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            repo: repo.into(),
        }
    }

    /// Run the CLI, returning stdout on a zero exit.
    fn run<I, S>(&self, operation: &str, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut command = Command::new(&self.program);
        command.args(args).arg("--repo").arg(&self.repo);
        debug!(program = %self.program, operation, "running backend command");

        let output = command.output().map_err(|e| {
            ArchiveError::Configuration(format!(
                "cannot run backend program {:?}: {e}",
                self.program
            ))
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }
        Err(ArchiveError::Backend {
            operation: operation.to_string(),
            status: output.status.code(),
            stdout,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl BlobBackend for CliBackend {
    fn collection_id(&self) -> &str {
        &self.repo
    }

    fn ensure_bucket_exists(&self, bucket: &str) -> Result<()> {
        if self.run("release view", ["release", "view", bucket]).is_ok() {
            return Ok(());
        }
        let notes = format!("Archive chunks for {bucket}");
        let created = self.run(
            "release create",
            ["release", "create", bucket, "--title", bucket, "--notes", notes.as_str()],
        );
        match created {
            Ok(_) => {
                info!(bucket, "created backend bucket");
                Ok(())
            }
            // Another writer may have created it between our view and create.
            Err(e) => match self.run("release view", ["release", "view", bucket]) {
                Ok(_) => Ok(()),
                Err(_) => Err(e),
            },
        }
    }

    fn upload(&self, bucket: &str, local_chunk: &Path) -> Result<()> {
        let operation = format!("upload of {}", local_chunk.display());
        let args: [&OsStr; 5] = [
            OsStr::new("release"),
            OsStr::new("upload"),
            OsStr::new(bucket),
            local_chunk.as_os_str(),
            OsStr::new("--clobber"),
        ];
        self.run(&operation, args)?;
        Ok(())
    }

    fn download(&self, bucket: &str, asset_name: &str, dest_dir: &Path) -> Result<PathBuf> {
        let asset_name = single_component(asset_name, "asset name")?;
        let operation = format!("download of {asset_name}");
        let args: [&OsStr; 8] = [
            OsStr::new("release"),
            OsStr::new("download"),
            OsStr::new(bucket),
            OsStr::new("--pattern"),
            OsStr::new(asset_name),
            OsStr::new("--dir"),
            dest_dir.as_os_str(),
            OsStr::new("--clobber"),
        ];
        self.run(&operation, args)?;

        let path = dest_dir.join(asset_name);
        if !path.is_file() {
            return Err(ArchiveError::Backend {
                operation,
                status: Some(0),
                stdout: String::new(),
                stderr: format!("backend reported success but {} is missing", path.display()),
            });
        }
        Ok(path)
    }
}

/// Backend that keeps each bucket as a directory under `root`.
#[derive(Debug, Clone)]
pub struct DirBackend {
    root: PathBuf,
    collection_id: String,
}

impl DirBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let collection_id = format!("dir:{}", root.display());
        Self {
            root,
            collection_id,
        }
    }

    /// Filesystem location of an asset.
    pub fn asset_path(&self, bucket: &str, asset_name: &str) -> Result<PathBuf> {
        Ok(self
            .bucket_dir(bucket)?
            .join(single_component(asset_name, "asset name")?))
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf> {
        Ok(self.root.join(single_component(bucket, "bucket")?))
    }

    fn missing(operation: &str, what: String) -> ArchiveError {
        ArchiveError::Backend {
            operation: operation.to_string(),
            status: None,
            stdout: String::new(),
            stderr: what,
        }
    }
}

/// A bucket or asset name must not walk out of its parent directory.
fn single_component<'a>(name: &'a str, what: &str) -> Result<&'a str> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(name),
        _ => Err(ArchiveError::InvalidInput(format!("invalid {what}: {name:?}"))),
    }
}

impl BlobBackend for DirBackend {
    fn collection_id(&self) -> &str {
        &self.collection_id
    }

    fn ensure_bucket_exists(&self, bucket: &str) -> Result<()> {
        let dir = self.bucket_dir(bucket)?;
        fs::create_dir_all(&dir).io_context(|| format!("failed to create {}", dir.display()))
    }

    fn upload(&self, bucket: &str, local_chunk: &Path) -> Result<()> {
        let name = local_chunk
            .file_name()
            .and_then(OsStr::to_str)
            .ok_or_else(|| {
                ArchiveError::InvalidInput(format!("{} has no file name", local_chunk.display()))
            })?;
        let dir = self.bucket_dir(bucket)?;
        if !dir.is_dir() {
            return Err(Self::missing("upload", format!("bucket {bucket} does not exist")));
        }
        let target = self.asset_path(bucket, name)?;

        let temp = tempfile::Builder::new()
            .prefix(".upload-")
            .tempfile_in(&dir)
            .io_context(|| format!("failed to create temp file in {}", dir.display()))?;
        fs::copy(local_chunk, temp.path())
            .io_context(|| format!("failed to copy {}", local_chunk.display()))?;
        temp.persist(&target).map_err(|e| ArchiveError::Io {
            context: format!("failed to replace {}", target.display()),
            source: e.error,
        })?;
        Ok(())
    }

    fn download(&self, bucket: &str, asset_name: &str, dest_dir: &Path) -> Result<PathBuf> {
        let source = self.asset_path(bucket, asset_name)?;
        if !source.is_file() {
            return Err(Self::missing(
                "download",
                format!("asset {asset_name} not found in bucket {bucket}"),
            ));
        }
        let target = dest_dir.join(asset_name);
        fs::copy(&source, &target)
            .io_context(|| format!("failed to copy {}", source.display()))?;
        Ok(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tempfile::TempDir;

    #[test]
    fn test_dir_backend_upload_download() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let backend = DirBackend::new(temp.path().join("blobs"));
        let chunk = temp.path().join("abc__full.bin");
        fs::write(&chunk, b"chunk bytes")?;

        backend.ensure_bucket_exists("arch-2026-03-04")?;
        backend.ensure_bucket_exists("arch-2026-03-04")?;
        backend.upload("arch-2026-03-04", &chunk)?;

        let dest = temp.path().join("dest");
        fs::create_dir_all(&dest)?;
        let path = backend.download("arch-2026-03-04", "abc__full.bin", &dest)?;
        assert_eq!(fs::read(path)?, b"chunk bytes");
        Ok(())
    }

    #[test]
    fn test_dir_backend_upload_overwrites() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let backend = DirBackend::new(temp.path().join("blobs"));
        let chunk = temp.path().join("abc__full.bin");
        backend.ensure_bucket_exists("b")?;

        fs::write(&chunk, b"first")?;
        backend.upload("b", &chunk)?;
        fs::write(&chunk, b"second")?;
        backend.upload("b", &chunk)?;

        assert_eq!(fs::read(backend.asset_path("b", "abc__full.bin")?)?, b"second");
        Ok(())
    }

    #[test]
    fn test_dir_backend_missing_asset_is_backend_error() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let backend = DirBackend::new(temp.path());
        backend.ensure_bucket_exists("b")?;

        let err = backend.download("b", "nope.bin", temp.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);
        assert!(err.to_string().contains("nope.bin"));
        Ok(())
    }

    #[test]
    fn test_dir_backend_upload_without_bucket_fails() -> anyhow::Result<()> {
        let temp = TempDir::new()?;
        let backend = DirBackend::new(temp.path().join("blobs"));
        let chunk = temp.path().join("x.bin");
        fs::write(&chunk, b"x")?;
        assert!(backend.upload("never-created", &chunk).is_err());
        Ok(())
    }

    #[test]
    fn test_dir_backend_rejects_traversal() {
        let backend = DirBackend::new("/tmp/blobs");
        assert!(backend.asset_path("..", "x").is_err());
        assert!(backend.asset_path("b", "../x").is_err());
        assert!(backend.asset_path("b/c", "x").is_err());
    }

    #[test]
    fn test_from_config_requires_identity() {
        let config = BackendConfig::default();
        let err = from_config(&config).err().expect("repo is unset");
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let config = BackendConfig {
            kind: BackendKind::Dir,
            ..BackendConfig::default()
        };
        assert!(from_config(&config).is_err());
    }

    #[test]
    fn test_from_config_cli_collection_id() -> anyhow::Result<()> {
        let config = BackendConfig {
            repo: Some("studio/archive".to_string()),
            ..BackendConfig::default()
        };
        let backend = from_config(&config)?;
        assert_eq!(backend.collection_id(), "studio/archive");
        Ok(())
    }

    #[test]
    fn test_cli_backend_missing_program_is_configuration_error() {
        let backend = CliBackend::new("/nonexistent/archivist-test-backend", "studio/archive");
        let err = backend.ensure_bucket_exists("arch-2026-03-04").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[cfg(unix)]
    #[test]
    fn test_cli_backend_surfaces_exit_code_and_stderr() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new()?;
        let script = temp.path().join("fake-gh");
        fs::write(&script, "#!/bin/sh\necho 'HTTP 403: quota exhausted' >&2\nexit 3\n")?;
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755))?;

        let backend = CliBackend::new(script.to_string_lossy(), "studio/archive");
        let chunk = temp.path().join("abc__full.bin");
        fs::write(&chunk, b"x")?;

        match backend.upload("arch-2026-03-04", &chunk) {
            Err(ArchiveError::Backend { status, stderr, .. }) => {
                assert_eq!(status, Some(3));
                assert!(stderr.contains("quota exhausted"));
            }
            other => panic!("expected backend error, got {other:?}"),
        }
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_cli_backend_passes_repo_and_clobber() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new()?;
        let log = temp.path().join("calls.log");
        let script = temp.path().join("fake-gh");
        fs::write(
            &script,
            format!("#!/bin/sh\necho \"$@\" >> '{}'\nexit 0\n", log.display()),
        )?;
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755))?;

        let backend = CliBackend::new(script.to_string_lossy(), "studio/archive");
        let chunk = temp.path().join("abc__full.bin");
        fs::write(&chunk, b"x")?;
        backend.ensure_bucket_exists("arch-2026-03-04")?;
        backend.upload("arch-2026-03-04", &chunk)?;

        let calls = fs::read_to_string(&log)?;
        let lines: Vec<&str> = calls.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("release view arch-2026-03-04"));
        assert!(lines[1].contains("release upload arch-2026-03-04"));
        assert!(lines[1].contains("--clobber"));
        assert!(lines[1].ends_with("--repo studio/archive"));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_cli_backend_download_rejects_traversal() -> anyhow::Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new()?;
        let log = temp.path().join("calls.log");
        let script = temp.path().join("fake-gh");
        fs::write(
            &script,
            format!("#!/bin/sh\necho \"$@\" >> '{}'\nexit 0\n", log.display()),
        )?;
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755))?;

        let backend = CliBackend::new(script.to_string_lossy(), "studio/archive");
        let dest = temp.path().join("dest");
        fs::create_dir_all(&dest)?;
        for name in ["../escape__full.bin", "nested/abc__full.bin", ""] {
            let err = backend.download("arch-2026-03-04", name, &dest).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Input, "{name}");
        }
        assert!(!log.exists());
        Ok(())
    }
}
