use std::{fmt, path::PathBuf, str::FromStr};

use getset::Getters;

use crate::{ImageVmError, ImageVmResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The filesystem a disk image is formatted with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FilesystemKind {
    /// ext4
    #[default]
    Ext4,

    /// ext3
    Ext3,

    /// ext2
    Ext2,
}

/// Where a disk image is in its build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    /// The file is allocated but holds no filesystem yet.
    Unformatted,

    /// The file holds an empty filesystem.
    Formatted,

    /// The filesystem is loop-mounted on the mount point.
    Mounted,

    /// The filesystem was populated and detached.
    Unmounted,
}

/// A disk image backing a microVM's root drive.
#[derive(Debug, Clone, Getters)]
#[getset(get = "pub with_prefix")]
pub struct RootfsImage {
    /// The host path of the disk image file.
    path: PathBuf,

    /// The capacity of the disk image in bytes.
    capacity: u64,

    /// The filesystem the image is formatted with.
    filesystem: FilesystemKind,

    /// Where the image is mounted while it is populated.
    mount_point: PathBuf,

    /// The current mount state.
    state: MountState,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FilesystemKind {
    /// The name used by `mkfs.<name>` and `mount -t <name>`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ext4 => "ext4",
            Self::Ext3 => "ext3",
            Self::Ext2 => "ext2",
        }
    }

    /// The program that creates this filesystem.
    pub fn mkfs_program(&self) -> String {
        format!("mkfs.{}", self.name())
    }
}

impl MountState {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: MountState) -> bool {
        matches!(
            (self, next),
            (Self::Unformatted, Self::Formatted)
                | (Self::Formatted, Self::Mounted)
                | (Self::Mounted, Self::Unmounted)
                | (Self::Unmounted, Self::Mounted)
        )
    }
}

impl RootfsImage {
    /// Creates a disk image description. The file itself is not touched.
    pub fn new(
        path: impl Into<PathBuf>,
        capacity: u64,
        filesystem: FilesystemKind,
        mount_point: impl Into<PathBuf>,
    ) -> Self {
        Self {
            path: path.into(),
            capacity,
            filesystem,
            mount_point: mount_point.into(),
            state: MountState::Unformatted,
        }
    }

    /// Moves the image to `next`, rejecting transitions the state machine does not allow.
    pub fn transition(&mut self, next: MountState) -> ImageVmResult<()> {
        self.check_transition(next)?;
        self.state = next;
        Ok(())
    }

    /// Checks that the image may move to `next` without moving it.
    pub fn check_transition(&self, next: MountState) -> ImageVmResult<()> {
        if self.state.can_transition_to(next) {
            Ok(())
        } else {
            Err(ImageVmError::InvalidMountTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            })
        }
    }

    /// Whether the filesystem is currently mounted.
    pub fn is_mounted(&self) -> bool {
        self.state == MountState::Mounted
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FilesystemKind {
    type Err = ImageVmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ext4" => Ok(Self::Ext4),
            "ext3" => Ok(Self::Ext3),
            "ext2" => Ok(Self::Ext2),
            other => Err(ImageVmError::ConfigurationInvalid(format!(
                "unsupported filesystem: {other}"
            ))),
        }
    }
}

impl fmt::Display for MountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unformatted => "unformatted",
            Self::Formatted => "formatted",
            Self::Mounted => "mounted",
            Self::Unmounted => "unmounted",
        };
        f.write_str(name)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rootfs_image_state_machine() -> anyhow::Result<()> {
        let mut image = RootfsImage::new("disk.img", 1024, FilesystemKind::Ext4, "/mnt");
        assert_eq!(image.get_state(), &MountState::Unformatted);

        assert!(image.transition(MountState::Mounted).is_err());

        image.transition(MountState::Formatted)?;
        image.transition(MountState::Mounted)?;
        assert!(image.is_mounted());

        assert!(matches!(
            image.transition(MountState::Formatted),
            Err(ImageVmError::InvalidMountTransition { .. })
        ));

        image.transition(MountState::Unmounted)?;
        assert!(!image.is_mounted());
        assert!(image.transition(MountState::Unmounted).is_err());

        Ok(())
    }

    #[test]
    fn test_filesystem_kind_parse() -> anyhow::Result<()> {
        assert_eq!("ext4".parse::<FilesystemKind>()?, FilesystemKind::Ext4);
        assert_eq!(FilesystemKind::Ext3.mkfs_program(), "mkfs.ext3");
        assert!("btrfs".parse::<FilesystemKind>().is_err());
        Ok(())
    }
}
