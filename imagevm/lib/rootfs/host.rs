use std::{
    io::Read,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tokio::{fs::OpenOptions, process::Command};

use crate::{ImageVmError, ImageVmResult};

use super::{layer, FilesystemKind};

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// The host operations a rootfs build needs.
///
/// [`SystemHost`] runs them against the real system. Tests substitute hosts that track mounts in
/// memory so pipeline failure paths can be exercised without root.
#[async_trait]
pub trait RootfsHost: Send + Sync {
    /// Creates a sparse file of `size_bytes` at `path`. An existing file is only replaced when
    /// `overwrite` is set.
    async fn allocate(&self, path: &Path, size_bytes: u64, overwrite: bool) -> ImageVmResult<()>;

    /// Creates a filesystem on the file at `path`.
    async fn format(&self, path: &Path, filesystem: FilesystemKind) -> ImageVmResult<()>;

    /// Loop-mounts the file at `path` on `mount_point`.
    async fn mount(&self, path: &Path, mount_point: &Path) -> ImageVmResult<()>;

    /// Detaches whatever is mounted on `mount_point`. Fails with
    /// [`NotMounted`][ImageVmError::NotMounted] if nothing is.
    async fn unmount(&self, mount_point: &Path) -> ImageVmResult<()>;

    /// Extracts a layer archive onto `mount_point` on a blocking thread.
    async fn apply_layer(
        &self,
        layer: Box<dyn Read + Send>,
        mount_point: &Path,
        digest: &str,
        preserve_ownership: bool,
    ) -> ImageVmResult<()> {
        let dest = mount_point.to_path_buf();
        let result = tokio::task::spawn_blocking(move || {
            layer::apply_layer(layer, &dest, preserve_ownership)
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ImageVmError::LayerApplyFailed {
                digest: digest.to_string(),
                reason: e.to_string(),
            }),
            Err(e) => Err(ImageVmError::LayerApplyFailed {
                digest: digest.to_string(),
                reason: format!("extraction task failed: {e}"),
            }),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The real host: sparse files, `mkfs.<fs>`, `mount -o loop` and `umount`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHost;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Runs a command to completion and returns its trimmed stderr on failure.
async fn run_command(program: &str, args: &[&std::ffi::OsStr]) -> Result<(), String> {
    tracing::debug!("running {program} {args:?}");

    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| format!("failed to run {program}: {e}"))?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    Err(if stderr.is_empty() {
        format!("{program} exited with {}", output.status)
    } else {
        stderr
    })
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl RootfsHost for SystemHost {
    async fn allocate(&self, path: &Path, size_bytes: u64, overwrite: bool) -> ImageVmResult<()> {
        let failed = |reason: String| ImageVmError::AllocationFailed {
            path: path.to_path_buf(),
            reason,
        };

        if size_bytes == 0 {
            return Err(failed("size must be greater than zero".into()));
        }

        let mut options = OpenOptions::new();
        options.write(true);
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }

        let file = options.open(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => {
                failed("file already exists, pass --force to overwrite it".into())
            }
            _ => failed(e.to_string()),
        })?;

        file.set_len(size_bytes)
            .await
            .map_err(|e| failed(e.to_string()))?;

        tracing::info!("allocated {} ({size_bytes} bytes)", path.display());
        Ok(())
    }

    async fn format(&self, path: &Path, filesystem: FilesystemKind) -> ImageVmResult<()> {
        run_command(
            &filesystem.mkfs_program(),
            &["-F".as_ref(), "-q".as_ref(), path.as_os_str()],
        )
        .await
        .map_err(|reason| ImageVmError::FormatFailed {
            path: path.to_path_buf(),
            reason,
        })
    }

    async fn mount(&self, path: &Path, mount_point: &Path) -> ImageVmResult<()> {
        let failed = |reason: String| ImageVmError::MountFailed {
            path: path.to_path_buf(),
            mount_point: mount_point.to_path_buf(),
            reason,
        };

        match tokio::fs::metadata(mount_point).await {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => return Err(failed("mount point is not a directory".into())),
            Err(e) => return Err(failed(format!("mount point is unusable: {e}"))),
        }

        run_command(
            "mount",
            &[
                "-o".as_ref(),
                "loop".as_ref(),
                path.as_os_str(),
                mount_point.as_os_str(),
            ],
        )
        .await
        .map_err(failed)
    }

    async fn unmount(&self, mount_point: &Path) -> ImageVmResult<()> {
        run_command("umount", &[mount_point.as_os_str()])
            .await
            .map_err(|reason| {
                if reason.contains("not mounted") {
                    ImageVmError::NotMounted(mount_point.to_path_buf())
                } else {
                    ImageVmError::UnmountFailed {
                        mount_point: mount_point.to_path_buf(),
                        reason,
                    }
                }
            })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::os::unix::fs::MetadataExt;

    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_system_host_allocate_is_sparse_and_refuses_reuse() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("disk.img");
        let host = SystemHost;

        host.allocate(&path, 64 * 1024 * 1024, false).await?;
        let metadata = std::fs::metadata(&path)?;
        assert_eq!(metadata.len(), 64 * 1024 * 1024);
        assert!(metadata.blocks() * 512 < metadata.len());

        let again = host.allocate(&path, 64 * 1024 * 1024, false).await;
        assert!(matches!(again, Err(ImageVmError::AllocationFailed { .. })));

        host.allocate(&path, 32 * 1024 * 1024, true).await?;
        assert_eq!(std::fs::metadata(&path)?.len(), 32 * 1024 * 1024);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_system_host_allocate_unwritable_path() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path: PathBuf = dir.path().join("missing/dir/disk.img");

        let result = SystemHost.allocate(&path, 1024, false).await;
        assert!(matches!(result, Err(ImageVmError::AllocationFailed { .. })));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_system_host_mount_requires_directory() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let result = SystemHost
            .mount(&dir.path().join("disk.img"), &dir.path().join("nope"))
            .await;
        assert!(matches!(result, Err(ImageVmError::MountFailed { .. })));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    #[ignore = "requires root and mkfs.ext4"]
    async fn test_system_host_format_mount_unmount() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("disk.img");
        let mount_point = dir.path().join("mnt");
        std::fs::create_dir(&mount_point)?;
        let host = SystemHost;

        host.allocate(&path, 64 * 1024 * 1024, false).await?;
        host.format(&path, FilesystemKind::Ext4).await?;
        host.mount(&path, &mount_point).await?;
        assert!(mount_point.join("lost+found").exists());
        host.unmount(&mount_point).await?;

        let again = host.unmount(&mount_point).await;
        assert!(matches!(again, Err(ImageVmError::NotMounted(_))));

        Ok(())
    }
}
