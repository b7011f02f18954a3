use crate::{
    rootfs::{RootfsBuilder, RootfsHost},
    vm::VmSupervisor,
    ImageVmError,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A host-state change that must be reverted if the run fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    /// The disk image file was created by this run.
    DiskImage,

    /// The disk image is mounted.
    Mount,

    /// A Firecracker process may be running.
    Vm,
}

/// Guards pushed as stages succeed, unwound in reverse when a later stage fails.
#[derive(Debug, Default)]
pub struct CleanupStack {
    guards: Vec<Guard>,
}

/// The resources a run has acquired, which guards act on.
pub struct RunResources<'h, H: RootfsHost + ?Sized> {
    /// The rootfs under construction.
    pub rootfs: RootfsBuilder<'h, H>,

    /// The VM supervisor, once one exists.
    pub vm: Option<VmSupervisor>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CleanupStack {
    /// Registers a guard.
    pub fn push(&mut self, guard: Guard) {
        tracing::debug!("registered cleanup guard {guard:?}");
        self.guards.push(guard);
    }

    /// Drops the most recent `guard` once the change it reverts was finalized.
    pub fn disarm(&mut self, guard: Guard) {
        if let Some(position) = self.guards.iter().rposition(|g| *g == guard) {
            self.guards.remove(position);
        }
    }

    /// The guards currently armed, oldest first.
    pub fn guards(&self) -> &[Guard] {
        &self.guards
    }

    /// Reverts every armed guard, newest first.
    ///
    /// Every guard is attempted even if an earlier one fails. The failures are logged and
    /// returned so they can be reported next to the error that caused the unwind.
    pub async fn unwind<H: RootfsHost + ?Sized>(
        &mut self,
        resources: &mut RunResources<'_, H>,
    ) -> Vec<ImageVmError> {
        let mut failures = Vec::new();

        while let Some(guard) = self.guards.pop() {
            tracing::debug!("unwinding cleanup guard {guard:?}");
            let result = match guard {
                Guard::Vm => match resources.vm.as_mut() {
                    Some(vm) => vm.stop().await,
                    None => Ok(()),
                },
                Guard::Mount if resources.rootfs.image().is_mounted() => {
                    match resources.rootfs.unmount().await {
                        Err(ImageVmError::NotMounted(_)) => Ok(()),
                        other => other,
                    }
                }
                Guard::Mount => Ok(()),
                Guard::DiskImage => remove_disk_image(resources.rootfs.image().get_path()).await,
            };

            if let Err(e) = result {
                tracing::error!("cleanup of {guard:?} failed: {e}");
                failures.push(e);
            }
        }

        failures
    }
}

impl<'h, H: RootfsHost + ?Sized> RunResources<'h, H> {
    /// Creates the resources of a run around its rootfs builder.
    pub fn new(rootfs: RootfsBuilder<'h, H>) -> Self {
        Self { rootfs, vm: None }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

async fn remove_disk_image(path: &std::path::Path) -> Result<(), ImageVmError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            tracing::info!("removed incomplete disk image {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{
        path::{Path, PathBuf},
        sync::Mutex,
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{
        rootfs::{FilesystemKind, RootfsImage},
        ImageVmResult,
    };

    #[derive(Default)]
    struct FlakyHost {
        mounted: Mutex<bool>,
        fail_unmount: bool,
    }

    #[async_trait]
    impl RootfsHost for FlakyHost {
        async fn allocate(&self, path: &Path, _: u64, _: bool) -> ImageVmResult<()> {
            std::fs::write(path, b"")?;
            Ok(())
        }

        async fn format(&self, _: &Path, _: FilesystemKind) -> ImageVmResult<()> {
            Ok(())
        }

        async fn mount(&self, _: &Path, _: &Path) -> ImageVmResult<()> {
            *self.mounted.lock().unwrap() = true;
            Ok(())
        }

        async fn unmount(&self, mount_point: &Path) -> ImageVmResult<()> {
            if self.fail_unmount {
                return Err(ImageVmError::UnmountFailed {
                    mount_point: mount_point.to_path_buf(),
                    reason: "device busy".into(),
                });
            }
            *self.mounted.lock().unwrap() = false;
            Ok(())
        }
    }

    async fn mounted_resources<'h>(
        host: &'h FlakyHost,
        disk: PathBuf,
    ) -> anyhow::Result<RunResources<'h, FlakyHost>> {
        let image = RootfsImage::new(disk, 1024, FilesystemKind::Ext4, "/mnt");
        let mut builder = RootfsBuilder::new(host, image, false, false);
        builder.allocate().await?;
        builder.format().await?;
        builder.mount().await?;
        Ok(RunResources::new(builder))
    }

    #[test_log::test(tokio::test)]
    async fn test_cleanup_unwinds_in_reverse_order() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let disk = dir.path().join("disk.img");
        let host = FlakyHost::default();
        let mut resources = mounted_resources(&host, disk.clone()).await?;

        let mut cleanup = CleanupStack::default();
        cleanup.push(Guard::DiskImage);
        cleanup.push(Guard::Mount);
        cleanup.push(Guard::Vm);

        let failures = cleanup.unwind(&mut resources).await;
        assert!(failures.is_empty());
        assert!(cleanup.guards().is_empty());
        assert!(!*host.mounted.lock().unwrap());
        assert!(!resources.rootfs.image().is_mounted());
        assert!(!disk.exists());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_cleanup_collects_failures_and_keeps_going() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let disk = dir.path().join("disk.img");
        let host = FlakyHost {
            fail_unmount: true,
            ..Default::default()
        };
        let mut resources = mounted_resources(&host, disk.clone()).await?;

        let mut cleanup = CleanupStack::default();
        cleanup.push(Guard::DiskImage);
        cleanup.push(Guard::Mount);

        let failures = cleanup.unwind(&mut resources).await;
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], ImageVmError::UnmountFailed { .. }));
        assert!(!disk.exists());

        Ok(())
    }

    #[test]
    fn test_cleanup_disarm_removes_latest_guard() {
        let mut cleanup = CleanupStack::default();
        cleanup.push(Guard::Mount);
        cleanup.push(Guard::Vm);
        cleanup.push(Guard::Mount);

        cleanup.disarm(Guard::Mount);
        assert_eq!(cleanup.guards(), [Guard::Mount, Guard::Vm]);

        cleanup.disarm(Guard::DiskImage);
        assert_eq!(cleanup.guards().len(), 2);
    }
}
