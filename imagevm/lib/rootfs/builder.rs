use tokio_util::sync::CancellationToken;

use crate::{
    oci::{ContentStore, LayerDescriptor},
    ImageVmError, ImageVmResult,
};

use super::{BootInitScript, MountState, RootfsHost, RootfsImage};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Drives a [`RootfsImage`] through allocation, formatting, mounting, layer application,
/// boot-init writing and unmounting.
///
/// Each step checks the mount state machine before touching the host. The builder performs no
/// cleanup of its own; callers that need the "never left mounted" guarantee register
/// [`unmount`][Self::unmount] as a cleanup action once [`mount`][Self::mount] succeeds.
pub struct RootfsBuilder<'h, H: RootfsHost + ?Sized> {
    host: &'h H,
    image: RootfsImage,
    overwrite: bool,
    preserve_ownership: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<'h, H: RootfsHost + ?Sized> RootfsBuilder<'h, H> {
    /// Creates a builder for `image` on `host`.
    pub fn new(host: &'h H, image: RootfsImage, overwrite: bool, preserve_ownership: bool) -> Self {
        Self {
            host,
            image,
            overwrite,
            preserve_ownership,
        }
    }

    /// The image being built.
    pub fn image(&self) -> &RootfsImage {
        &self.image
    }

    /// Consumes the builder, returning the image.
    pub fn into_image(self) -> RootfsImage {
        self.image
    }

    /// Creates the disk image file.
    pub async fn allocate(&mut self) -> ImageVmResult<()> {
        self.host
            .allocate(
                self.image.get_path(),
                *self.image.get_capacity(),
                self.overwrite,
            )
            .await
    }

    /// Creates the filesystem.
    pub async fn format(&mut self) -> ImageVmResult<()> {
        self.image.check_transition(MountState::Formatted)?;
        self.host
            .format(self.image.get_path(), *self.image.get_filesystem())
            .await?;
        self.image.transition(MountState::Formatted)
    }

    /// Loop-mounts the image on its mount point.
    pub async fn mount(&mut self) -> ImageVmResult<()> {
        self.image.check_transition(MountState::Mounted)?;
        self.host
            .mount(self.image.get_path(), self.image.get_mount_point())
            .await?;
        self.image.transition(MountState::Mounted)
    }

    /// Applies `layers` in ascending manifest order, each exactly once.
    ///
    /// Cancellation is checked before each layer. A cancelled build stops with
    /// [`CancelledByCaller`][ImageVmError::CancelledByCaller] and leaves the image mounted so the
    /// caller's cleanup can unmount it.
    pub async fn apply_layers<S: ContentStore + ?Sized>(
        &mut self,
        store: &S,
        namespace: &str,
        layers: &[LayerDescriptor],
        cancel: &CancellationToken,
    ) -> ImageVmResult<()> {
        self.require_mounted()?;

        let mut ordered = layers.iter().collect::<Vec<_>>();
        ordered.sort_by_key(|layer| *layer.get_index());

        let total = ordered.len();
        for (position, layer) in ordered.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ImageVmError::CancelledByCaller);
            }

            let digest = layer.digest().to_string();
            tracing::info!(digest = %digest, "unpacking layer {}/{total}", position + 1);

            let reader = store
                .open_blob(namespace, layer.get_descriptor())
                .await
                .map_err(|e| ImageVmError::LayerApplyFailed {
                    digest: digest.clone(),
                    reason: e.to_string(),
                })?;

            self.host
                .apply_layer(
                    reader,
                    self.image.get_mount_point(),
                    &digest,
                    self.preserve_ownership,
                )
                .await?;
        }

        Ok(())
    }

    /// Writes the boot-init script into the mounted image.
    pub async fn write_boot_init(&mut self, script: &BootInitScript) -> ImageVmResult<()> {
        self.require_mounted()?;
        let path = script.write(self.image.get_mount_point()).await?;
        tracing::info!(path = %path.display(), "wrote boot init script");
        Ok(())
    }

    /// Detaches the image.
    ///
    /// If the host reports that nothing is mounted, the image is marked unmounted and the
    /// [`NotMounted`][ImageVmError::NotMounted] error is still returned. Any other failure leaves
    /// the image marked mounted.
    pub async fn unmount(&mut self) -> ImageVmResult<()> {
        self.image.check_transition(MountState::Unmounted)?;
        match self.host.unmount(self.image.get_mount_point()).await {
            Ok(()) => self.image.transition(MountState::Unmounted),
            Err(e @ ImageVmError::NotMounted(_)) => {
                self.image.transition(MountState::Unmounted)?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    fn require_mounted(&self) -> ImageVmResult<()> {
        if self.image.is_mounted() {
            Ok(())
        } else {
            Err(ImageVmError::NotMounted(
                self.image.get_mount_point().to_path_buf(),
            ))
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{
        collections::HashSet,
        path::{Path, PathBuf},
        sync::Mutex,
    };

    use async_trait::async_trait;

    use super::*;
    use crate::rootfs::FilesystemKind;

    #[derive(Default)]
    struct RecordingHost {
        calls: Mutex<Vec<String>>,
        mounted: Mutex<HashSet<PathBuf>>,
    }

    impl RecordingHost {
        fn record(&self, call: &str) {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(call.to_string());
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl RootfsHost for RecordingHost {
        async fn allocate(&self, _: &Path, _: u64, _: bool) -> ImageVmResult<()> {
            self.record("allocate");
            Ok(())
        }

        async fn format(&self, _: &Path, _: FilesystemKind) -> ImageVmResult<()> {
            self.record("format");
            Ok(())
        }

        async fn mount(&self, _: &Path, mount_point: &Path) -> ImageVmResult<()> {
            self.record("mount");
            self.mounted.lock().unwrap().insert(mount_point.to_path_buf());
            Ok(())
        }

        async fn unmount(&self, mount_point: &Path) -> ImageVmResult<()> {
            self.record("unmount");
            if self.mounted.lock().unwrap().remove(mount_point) {
                Ok(())
            } else {
                Err(ImageVmError::NotMounted(mount_point.to_path_buf()))
            }
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_rootfs_builder_enforces_step_order() -> anyhow::Result<()> {
        let host = RecordingHost::default();
        let image = RootfsImage::new("disk.img", 1024, FilesystemKind::Ext4, "/mnt");
        let mut builder = RootfsBuilder::new(&host, image, false, false);

        assert!(matches!(
            builder.mount().await,
            Err(ImageVmError::InvalidMountTransition { .. })
        ));
        assert!(builder.unmount().await.is_err());

        builder.allocate().await?;
        builder.format().await?;
        builder.mount().await?;
        assert!(builder.image().is_mounted());
        builder.unmount().await?;

        assert_eq!(
            builder.image().get_state(),
            &MountState::Unmounted
        );
        assert_eq!(host.calls(), ["allocate", "format", "mount", "unmount"]);

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_rootfs_builder_boot_init_requires_mount() -> anyhow::Result<()> {
        let host = RecordingHost::default();
        let image = RootfsImage::new("disk.img", 1024, FilesystemKind::Ext4, "/mnt");
        let mut builder = RootfsBuilder::new(&host, image, false, false);

        let script = BootInitScript::new("custom.init", &[], &[])?;
        assert!(matches!(
            builder.write_boot_init(&script).await,
            Err(ImageVmError::NotMounted(_))
        ));

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_rootfs_builder_unmount_of_unmounted_host_marks_state() -> anyhow::Result<()> {
        let host = RecordingHost::default();
        let image = RootfsImage::new("disk.img", 1024, FilesystemKind::Ext4, "/mnt");
        let mut builder = RootfsBuilder::new(&host, image, false, false);

        builder.format().await?;
        builder.mount().await?;
        host.mounted.lock().unwrap().clear();

        assert!(matches!(
            builder.unmount().await,
            Err(ImageVmError::NotMounted(_))
        ));
        assert_eq!(builder.image().get_state(), &MountState::Unmounted);

        Ok(())
    }
}
