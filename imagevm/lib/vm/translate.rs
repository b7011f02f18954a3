use crate::{
    config::PipelineConfig,
    rootfs::{MountState, RootfsImage},
    ImageVmError, ImageVmResult,
};

use super::{Drive, MachineConfig};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What the guest kernel runs as process 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitCommand {
    /// A boot-init script written into the rootfs, named by its guest path.
    Script(String),

    /// The image command, run directly.
    Command(Vec<String>),
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds the machine configuration for booting `rootfs`.
///
/// The kernel command line is the configured kernel arguments followed by `init="<...>"`, where
/// the init value is either the boot-init script's guest path or the image command joined by
/// spaces. An empty command leaves `init=` out so the kernel falls back to its default init.
///
/// Fails with [`ConfigurationInvalid`][ImageVmError::ConfigurationInvalid] when the kernel, disk
/// or socket path is empty, when the rootfs is still mounted, or when the init value cannot be
/// quoted.
pub fn translate(
    init: &InitCommand,
    rootfs: &RootfsImage,
    config: &PipelineConfig,
) -> ImageVmResult<MachineConfig> {
    let invalid = |reason: &str| Err(ImageVmError::ConfigurationInvalid(reason.to_string()));

    if config.get_kernel_path().as_os_str().is_empty() {
        return invalid("kernel path is empty");
    }

    if rootfs.get_path().as_os_str().is_empty() {
        return invalid("rootfs path is empty");
    }

    if config.get_firecracker_socket().as_os_str().is_empty() {
        return invalid("firecracker socket path is empty");
    }

    if rootfs.get_state() != &MountState::Unmounted {
        return Err(ImageVmError::ConfigurationInvalid(format!(
            "rootfs must be unmounted before boot, it is {}",
            rootfs.get_state()
        )));
    }

    let init_value = match init {
        InitCommand::Script(guest_path) => {
            if guest_path.is_empty() {
                return invalid("boot init arg is empty");
            }
            Some(guest_path.clone())
        }
        InitCommand::Command(command) if command.is_empty() => None,
        InitCommand::Command(command) => Some(command.join(" ")),
    };

    let mut kernel_args = config.get_kernel_args().trim().to_string();
    if let Some(value) = init_value {
        if value.contains('"') {
            return Err(ImageVmError::ConfigurationInvalid(format!(
                "init command cannot be passed on the kernel command line: {value}"
            )));
        }

        if !kernel_args.is_empty() {
            kernel_args.push(' ');
        }
        kernel_args.push_str(&format!("init=\"{value}\""));
    }

    Ok(MachineConfig::builder()
        .socket_path(config.get_firecracker_socket().clone())
        .kernel_image_path(config.get_kernel_path().clone())
        .kernel_args(kernel_args)
        .drives(vec![Drive::root(rootfs.get_path().clone())])
        .resources(config.get_resources().clone())
        .build())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
