use std::path::PathBuf;

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::config::{DEFAULT_MEM_SIZE_MIB, DEFAULT_NUM_VCPUS};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The drive id of the root drive.
pub const ROOT_DRIVE_ID: &str = "1";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Everything Firecracker needs to boot a microVM from a rootfs.
///
/// Assembled once by [`translate`][super::translate] and consumed by
/// [`VmSupervisor::start`][super::VmSupervisor::start].
#[derive(Debug, Clone, PartialEq, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct MachineConfig {
    /// The Firecracker API socket.
    #[builder(setter(into))]
    socket_path: PathBuf,

    /// The guest kernel image.
    #[builder(setter(into))]
    kernel_image_path: PathBuf,

    /// The full kernel command line.
    #[builder(setter(into))]
    kernel_args: String,

    /// The block devices attached to the guest.
    drives: Vec<Drive>,

    /// vCPU, memory and CPU template settings.
    #[builder(default)]
    resources: MachineResources,
}

/// A block device attached to the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct Drive {
    /// The drive id, also used in the API route.
    drive_id: String,

    /// The host path of the backing file.
    path_on_host: PathBuf,

    /// Whether the guest boots from this drive.
    is_root_device: bool,

    /// Whether the guest may only read the drive.
    is_read_only: bool,
}

/// The sizing of a microVM.
#[derive(Debug, Clone, PartialEq, Eq, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct MachineResources {
    /// The number of vCPUs.
    #[builder(default = DEFAULT_NUM_VCPUS)]
    vcpu_count: u8,

    /// The guest memory in MiB.
    #[builder(default = DEFAULT_MEM_SIZE_MIB)]
    mem_size_mib: u32,

    /// The CPU template applied to the vCPUs.
    #[builder(default)]
    cpu_template: CpuTemplate,

    /// Whether simultaneous multithreading is exposed to the guest.
    #[builder(default = true)]
    smt: bool,
}

/// A Firecracker CPU template.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuTemplate {
    /// Intel C3 instance family.
    #[default]
    C3,

    /// Intel T2 instance family.
    T2,

    /// T2 with Intel AMX and AVX-512 features masked.
    T2S,

    /// T2 for mixed Intel/AMD fleets, Intel side.
    T2CL,

    /// T2 for mixed Intel/AMD fleets, AMD side.
    T2A,

    /// Graviton2 with Neoverse V1 features masked.
    V1N1,

    /// No template.
    None,
}

/// The body of `PUT /machine-config`.
#[derive(Debug, Serialize)]
pub(crate) struct MachineConfigurationBody {
    pub(crate) vcpu_count: u8,
    pub(crate) mem_size_mib: u32,
    pub(crate) smt: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) cpu_template: Option<CpuTemplate>,
}

/// The body of `PUT /boot-source`.
#[derive(Debug, Serialize)]
pub(crate) struct BootSourceBody {
    pub(crate) kernel_image_path: PathBuf,
    pub(crate) boot_args: String,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Drive {
    /// A writable root drive backed by `path_on_host`.
    pub fn root(path_on_host: impl Into<PathBuf>) -> Self {
        Self {
            drive_id: ROOT_DRIVE_ID.to_string(),
            path_on_host: path_on_host.into(),
            is_root_device: true,
            is_read_only: false,
        }
    }
}

impl MachineConfig {
    pub(crate) fn machine_configuration_body(&self) -> MachineConfigurationBody {
        let cpu_template = match self.resources.cpu_template {
            CpuTemplate::None => None,
            template => Some(template),
        };

        MachineConfigurationBody {
            vcpu_count: self.resources.vcpu_count,
            mem_size_mib: self.resources.mem_size_mib,
            smt: self.resources.smt,
            cpu_template,
        }
    }

    pub(crate) fn boot_source_body(&self) -> BootSourceBody {
        BootSourceBody {
            kernel_image_path: self.kernel_image_path.clone(),
            boot_args: self.kernel_args.clone(),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for MachineResources {
    fn default() -> Self {
        Self::builder().build()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
