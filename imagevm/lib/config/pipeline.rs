use std::{path::PathBuf, time::Duration};

use getset::Getters;
use oci_spec::image::Platform;
use typed_builder::TypedBuilder;
use typed_path::{Utf8UnixComponent, Utf8UnixPath};

use crate::{
    rootfs::FilesystemKind,
    utils::{self, OCI_SUBDIR},
    vm::{MachineResources, VmmStdio},
    ImageVmError, ImageVmResult,
};

use super::{
    DEFAULT_BOOT_INIT_ARG, DEFAULT_BOOT_INIT_FILE_NAME, DEFAULT_FIRECRACKER_PATH,
    DEFAULT_FIRECRACKER_SOCKET, DEFAULT_GENERATE_BOOT_INIT, DEFAULT_KERNEL_ARGS,
    DEFAULT_KERNEL_PATH, DEFAULT_MOUNT_POINT, DEFAULT_NAMESPACE, DEFAULT_ROOTFS_PATH,
    DEFAULT_ROOTFS_SIZE_MIB, DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_SOCKET_WAIT_TIMEOUT,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Everything a pipeline run needs to know about the host, the image store and the microVM.
///
/// A config is passed by value into [`PipelineController::new`][crate::pipeline::PipelineController::new].
/// Runs that execute concurrently must use distinct mount points, disk image paths and sockets.
#[derive(Debug, Clone, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct PipelineConfig {
    /// The content-store namespace images are kept under.
    #[builder(default = DEFAULT_NAMESPACE.to_string(), setter(into))]
    namespace: String,

    /// The root of the on-disk OCI content store.
    #[builder(default = utils::get_imagevm_home().join(OCI_SUBDIR), setter(into))]
    store_path: PathBuf,

    /// The scratch directory the disk image is mounted on.
    #[builder(default = PathBuf::from(DEFAULT_MOUNT_POINT), setter(into))]
    mount_point: PathBuf,

    /// Where the disk image is written.
    #[builder(default = PathBuf::from(DEFAULT_ROOTFS_PATH), setter(into))]
    rootfs_path: PathBuf,

    /// The capacity of the disk image in bytes.
    #[builder(default = DEFAULT_ROOTFS_SIZE_MIB * 1024 * 1024)]
    rootfs_size_bytes: u64,

    /// The filesystem the disk image is formatted with.
    #[builder(default)]
    filesystem: FilesystemKind,

    /// Whether an existing file at `rootfs_path` may be overwritten.
    #[builder(default)]
    overwrite_rootfs: bool,

    /// Whether layer file ownership is kept when extracting.
    #[builder(default)]
    preserve_ownership: bool,

    /// Whether a boot-init script is written into the disk image.
    #[builder(default = DEFAULT_GENERATE_BOOT_INIT)]
    generate_boot_init: bool,

    /// The boot-init script's path relative to the root of the disk image.
    #[builder(default = DEFAULT_BOOT_INIT_FILE_NAME.to_string(), setter(into))]
    boot_init_file_name: String,

    /// The guest path handed to the kernel as `init=` when a boot-init script is written.
    #[builder(default = DEFAULT_BOOT_INIT_ARG.to_string(), setter(into))]
    boot_init_arg: String,

    /// The guest kernel image.
    #[builder(default = PathBuf::from(DEFAULT_KERNEL_PATH), setter(into))]
    kernel_path: PathBuf,

    /// Kernel arguments placed ahead of `init=`.
    #[builder(default = DEFAULT_KERNEL_ARGS.to_string(), setter(into))]
    kernel_args: String,

    /// The Firecracker binary.
    #[builder(default = PathBuf::from(DEFAULT_FIRECRACKER_PATH), setter(into))]
    firecracker_path: PathBuf,

    /// The Firecracker API socket.
    #[builder(default = PathBuf::from(DEFAULT_FIRECRACKER_SOCKET), setter(into))]
    firecracker_socket: PathBuf,

    /// vCPU, memory and CPU template settings of the microVM.
    #[builder(default)]
    resources: MachineResources,

    /// The platform to pick from multi-platform images.
    #[builder(default)]
    platform: Platform,

    /// Where Firecracker's stdout and stderr go.
    #[builder(default)]
    vmm_stdio: VmmStdio,

    /// Whether a missing image is pulled from its registry.
    #[builder(default = true)]
    pull: bool,

    /// How long to wait for the Firecracker API socket to appear.
    #[builder(default = DEFAULT_SOCKET_WAIT_TIMEOUT)]
    socket_wait_timeout: Duration,

    /// How long to wait for the guest to shut down before killing Firecracker.
    #[builder(default = DEFAULT_SHUTDOWN_TIMEOUT)]
    shutdown_timeout: Duration,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PipelineConfig {
    /// Checks the configuration for values no stage could work with.
    ///
    /// All problems are collected and reported together as a
    /// [`ConfigurationInvalid`][ImageVmError::ConfigurationInvalid] error.
    pub fn validate(&self) -> ImageVmResult<()> {
        let mut errors = Vec::new();

        if self.namespace.is_empty() || self.namespace.contains('/') || self.namespace == ".." {
            errors.push(format!("invalid namespace: {:?}", self.namespace));
        }

        if self.rootfs_path.as_os_str().is_empty() {
            errors.push("rootfs path is empty".to_string());
        }

        if self.rootfs_size_bytes == 0 {
            errors.push("rootfs size must be greater than zero".to_string());
        }

        if self.mount_point.as_os_str().is_empty() {
            errors.push("mount point is empty".to_string());
        }

        if self.generate_boot_init {
            if !is_relative_guest_path(&self.boot_init_file_name) {
                errors.push(format!(
                    "boot init file name must be a relative path inside the rootfs: {:?}",
                    self.boot_init_file_name
                ));
            }

            if self.boot_init_arg.is_empty() {
                errors.push("boot init arg is empty".to_string());
            } else if !is_same_guest_path(
                &self.boot_init_arg,
                &format!("/{}", self.boot_init_file_name),
            ) {
                errors.push(format!(
                    "boot init arg {:?} does not point at the boot init file {:?}",
                    self.boot_init_arg, self.boot_init_file_name
                ));
            }
        }

        if self.resources.get_vcpu_count() == &0 {
            errors.push("vcpu count must be greater than zero".to_string());
        }

        if self.resources.get_mem_size_mib() == &0 {
            errors.push("memory size must be greater than zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ImageVmError::ConfigurationInvalid(errors.join("; ")))
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn is_relative_guest_path(path: &str) -> bool {
    let path = Utf8UnixPath::new(path);
    let mut components = path.components().peekable();
    if components.peek().is_none() {
        return false;
    }

    components.all(|c| matches!(c, Utf8UnixComponent::Normal(_)))
}

fn is_same_guest_path(a: &str, b: &str) -> bool {
    guest_components(a) == guest_components(b)
}

fn guest_components(path: &str) -> Vec<Utf8UnixComponent<'_>> {
    Utf8UnixPath::new(path)
        .components()
        .filter(|c| !matches!(c, Utf8UnixComponent::CurDir))
        .collect()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_config_defaults() {
        let config = PipelineConfig::builder().build();

        assert_eq!(config.get_namespace(), "docker-to-firecracker");
        assert_eq!(config.get_mount_point(), &PathBuf::from("/mnt"));
        assert_eq!(config.get_rootfs_path(), &PathBuf::from("./disk.img"));
        assert_eq!(*config.get_rootfs_size_bytes(), 1024 * 1024 * 1024);
        assert!(*config.get_generate_boot_init());
        assert!(!*config.get_preserve_ownership());
        assert!(!*config.get_overwrite_rootfs());
        assert_eq!(config.get_boot_init_file_name(), "custom.init");
        assert_eq!(config.get_boot_init_arg(), "/custom.init");
        assert_eq!(config.get_kernel_path(), &PathBuf::from("./hello-vmlinux.bin"));
        assert_eq!(config.get_firecracker_path(), &PathBuf::from("./firecracker"));
        assert_eq!(
            config.get_firecracker_socket(),
            &PathBuf::from("./firecracker.sock")
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pipeline_config_rejects_escaping_boot_init_path() {
        for name in ["../custom.init", "/custom.init", "", "a/../../b"] {
            let config = PipelineConfig::builder().boot_init_file_name(name).build();
            assert!(
                matches!(config.validate(), Err(ImageVmError::ConfigurationInvalid(_))),
                "expected {name:?} to be rejected"
            );
        }

        let config = PipelineConfig::builder()
            .boot_init_file_name("sbin/custom.init")
            .boot_init_arg("/sbin/custom.init")
            .build();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pipeline_config_rejects_boot_init_arg_mismatch() {
        let config = PipelineConfig::builder()
            .boot_init_file_name("sbin/custom.init")
            .build();
        let Err(ImageVmError::ConfigurationInvalid(message)) = config.validate() else {
            panic!("expected a mismatched boot init arg to be rejected");
        };
        assert!(message.contains("does not point at"), "{message}");

        let config = PipelineConfig::builder()
            .boot_init_file_name("sbin/custom.init")
            .boot_init_arg("/sbin/./custom.init")
            .build();
        assert!(config.validate().is_ok());

        let config = PipelineConfig::builder()
            .generate_boot_init(false)
            .boot_init_file_name("sbin/custom.init")
            .build();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pipeline_config_collects_all_errors() {
        let config = PipelineConfig::builder()
            .namespace("")
            .rootfs_size_bytes(0)
            .build();

        let Err(ImageVmError::ConfigurationInvalid(message)) = config.validate() else {
            panic!("expected configuration to be invalid");
        };
        assert!(message.contains("namespace"));
        assert!(message.contains("rootfs size"));
    }
}
