use std::{path::PathBuf, sync::LazyLock, time::Duration};

use crate::utils::IMAGEVM_HOME_DIR;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The content-store namespace images are kept under.
pub const DEFAULT_NAMESPACE: &str = "docker-to-firecracker";

/// The scratch directory the disk image is mounted on while it is populated.
pub const DEFAULT_MOUNT_POINT: &str = "/mnt";

/// Where the disk image is written.
pub const DEFAULT_ROOTFS_PATH: &str = "./disk.img";

/// The capacity of the disk image in MiB.
pub const DEFAULT_ROOTFS_SIZE_MIB: u64 = 1024;

/// Whether a boot-init script is generated by default.
pub const DEFAULT_GENERATE_BOOT_INIT: bool = true;

/// The file name of the boot-init script, relative to the root of the disk image.
pub const DEFAULT_BOOT_INIT_FILE_NAME: &str = "custom.init";

/// The guest path passed to the kernel as `init=` when a boot-init script is generated.
pub const DEFAULT_BOOT_INIT_ARG: &str = "/custom.init";

/// The guest kernel image.
pub const DEFAULT_KERNEL_PATH: &str = "./hello-vmlinux.bin";

/// The Firecracker binary.
pub const DEFAULT_FIRECRACKER_PATH: &str = "./firecracker";

/// The Firecracker API socket.
pub const DEFAULT_FIRECRACKER_SOCKET: &str = "./firecracker.sock";

/// Kernel arguments that always precede `init=`.
pub const DEFAULT_KERNEL_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

/// The default number of vCPUs to give the microVM.
pub const DEFAULT_NUM_VCPUS: u8 = 1;

/// The default amount of RAM in MiB to give the microVM.
pub const DEFAULT_MEM_SIZE_MIB: u32 = 512;

/// How long to wait for the Firecracker API socket to appear.
pub const DEFAULT_SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the guest to shut down after Ctrl-Alt-Del before killing Firecracker.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// The registry used when a reference names none.
pub const DEFAULT_OCI_REGISTRY: &str = "docker.io";

/// The tag used when a reference names none.
pub const DEFAULT_OCI_REFERENCE_TAG: &str = "latest";

/// The namespace prepended to single-segment Docker Hub repositories.
pub const DEFAULT_OCI_REFERENCE_REPO_NAMESPACE: &str = "library";

/// The path where imagevm keeps its data when `IMAGEVM_HOME` is unset.
pub static DEFAULT_IMAGEVM_HOME: LazyLock<PathBuf> = LazyLock::new(|| {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(IMAGEVM_HOME_DIR)
});
