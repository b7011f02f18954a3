use std::path::PathBuf;

use clap::{ArgAction, Args, Parser};

use crate::{
    cli::styles,
    config::{
        PipelineConfig, DEFAULT_BOOT_INIT_FILE_NAME,
        DEFAULT_FIRECRACKER_PATH, DEFAULT_FIRECRACKER_SOCKET, DEFAULT_GENERATE_BOOT_INIT,
        DEFAULT_KERNEL_PATH, DEFAULT_MEM_SIZE_MIB, DEFAULT_MOUNT_POINT, DEFAULT_NAMESPACE,
        DEFAULT_NUM_VCPUS, DEFAULT_ROOTFS_PATH, DEFAULT_ROOTFS_SIZE_MIB,
    },
    utils::{self, OCI_SUBDIR},
    vm::{MachineResources, VmmStdio},
};

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// `imagevm` boots container images as Firecracker microVMs
#[derive(Debug, Parser)]
#[command(name = "imagevm", author, version, styles = styles::styles())]
pub struct ImageVmArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: ImageVmSubcommand,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available subcommands
#[derive(Debug, Parser)]
pub enum ImageVmSubcommand {
    /// Build a rootfs from an image and boot it
    #[command(name = "run")]
    Run {
        /// The image reference, e.g. `alpine:latest`
        #[arg(name = "IMAGE")]
        image: String,

        /// Pipeline options
        #[command(flatten)]
        options: PipelineOptions,
    },

    /// Fetch an image into the content store and show its layers and init command
    #[command(name = "pull")]
    Pull {
        /// The image reference, e.g. `alpine:latest`
        #[arg(name = "IMAGE")]
        image: String,

        /// Pipeline options
        #[command(flatten)]
        options: PipelineOptions,
    },

    /// Build a rootfs from an image without booting it
    #[command(name = "build")]
    Build {
        /// The image reference, e.g. `alpine:latest`
        #[arg(name = "IMAGE")]
        image: String,

        /// Pipeline options
        #[command(flatten)]
        options: PipelineOptions,
    },
}

/// Options shared by every subcommand.
#[derive(Debug, Clone, Args)]
pub struct PipelineOptions {
    /// Content-store namespace
    #[arg(long, default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Content-store location [default: $IMAGEVM_HOME/oci]
    #[arg(long)]
    pub store_path: Option<PathBuf>,

    /// Scratch directory the disk image is mounted on
    #[arg(long = "tmp-mnt", default_value = DEFAULT_MOUNT_POINT)]
    pub mount_point: PathBuf,

    /// Where to write the disk image
    #[arg(long, default_value = DEFAULT_ROOTFS_PATH)]
    pub rootfs_path: PathBuf,

    /// Disk image size in MiB
    #[arg(long, default_value_t = DEFAULT_ROOTFS_SIZE_MIB)]
    pub rootfs_size_mib: u64,

    /// Overwrite an existing disk image
    #[arg(long)]
    pub force: bool,

    /// Write a boot-init script that exports the image environment and runs its command
    #[arg(long, default_value_t = DEFAULT_GENERATE_BOOT_INIT, action = ArgAction::Set)]
    pub generate_boot_init: bool,

    /// Boot-init script path inside the rootfs
    #[arg(long, default_value = DEFAULT_BOOT_INIT_FILE_NAME)]
    pub boot_init_file_name: String,

    /// Guest path passed to the kernel as `init=` when a boot-init script is written
    /// [default: `/` followed by the boot-init file name]
    #[arg(long)]
    pub boot_init_arg: Option<String>,

    /// Guest kernel image
    #[arg(long, default_value = DEFAULT_KERNEL_PATH)]
    pub kernel_path: PathBuf,

    /// Firecracker binary
    #[arg(long, default_value = DEFAULT_FIRECRACKER_PATH)]
    pub firecracker_path: PathBuf,

    /// Firecracker API socket
    #[arg(long = "firecracker-sock", default_value = DEFAULT_FIRECRACKER_SOCKET)]
    pub firecracker_socket: PathBuf,

    /// Number of vCPUs
    #[arg(long, default_value_t = DEFAULT_NUM_VCPUS)]
    pub vcpus: u8,

    /// Guest memory in MiB
    #[arg(long = "mem-mib", default_value_t = DEFAULT_MEM_SIZE_MIB)]
    pub mem_mib: u32,

    /// Keep file ownership from the image layers
    #[arg(long)]
    pub preserve_ownership: bool,

    /// Only use images already in the content store
    #[arg(long)]
    pub no_pull: bool,

    /// Append Firecracker output to this file instead of the terminal
    #[arg(long)]
    pub vmm_log: Option<PathBuf>,
}

//-------------------------------------------------------------------------------------------------
// Methods
//-------------------------------------------------------------------------------------------------

impl ImageVmSubcommand {
    /// The image reference and options of the subcommand.
    pub fn parts(&self) -> (&str, &PipelineOptions) {
        match self {
            Self::Run { image, options }
            | Self::Pull { image, options }
            | Self::Build { image, options } => (image, options),
        }
    }
}

impl PipelineOptions {
    /// Turns the options into a pipeline configuration.
    pub fn to_config(&self) -> PipelineConfig {
        let store_path = self
            .store_path
            .clone()
            .unwrap_or_else(|| utils::get_imagevm_home().join(OCI_SUBDIR));

        let vmm_stdio = match &self.vmm_log {
            Some(path) => VmmStdio::File(path.clone()),
            None => VmmStdio::Inherit,
        };

        PipelineConfig::builder()
            .namespace(self.namespace.clone())
            .store_path(store_path)
            .mount_point(self.mount_point.clone())
            .rootfs_path(self.rootfs_path.clone())
            .rootfs_size_bytes(self.rootfs_size_mib * 1024 * 1024)
            .overwrite_rootfs(self.force)
            .preserve_ownership(self.preserve_ownership)
            .generate_boot_init(self.generate_boot_init)
            .boot_init_file_name(self.boot_init_file_name.clone())
            .boot_init_arg(
                self.boot_init_arg
                    .clone()
                    .unwrap_or_else(|| format!("/{}", self.boot_init_file_name)),
            )
            .kernel_path(self.kernel_path.clone())
            .firecracker_path(self.firecracker_path.clone())
            .firecracker_socket(self.firecracker_socket.clone())
            .resources(
                MachineResources::builder()
                    .vcpu_count(self.vcpus)
                    .mem_size_mib(self.mem_mib)
                    .build(),
            )
            .vmm_stdio(vmm_stdio)
            .pull(!self.no_pull)
            .build()
    }
}

//-------------------------------------------------------------------------------------------------
// Tests
//-------------------------------------------------------------------------------------------------
