use std::fmt;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A step of a pipeline run, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Checking the pipeline configuration.
    Validate,

    /// Parsing the reference and resolving the image.
    Resolve,

    /// Creating the disk image file.
    Allocate,

    /// Creating the filesystem.
    Format,

    /// Loop-mounting the disk image.
    Mount,

    /// Applying the image layers.
    ApplyLayers,

    /// Writing the boot-init script.
    WriteBootInit,

    /// Detaching the disk image.
    Unmount,

    /// Building the machine configuration.
    Translate,

    /// Launching and booting the microVM.
    StartVm,

    /// Waiting for the microVM to exit.
    WaitVm,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Stage {
    /// The stage name as shown in errors and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Resolve => "resolve",
            Self::Allocate => "allocate",
            Self::Format => "format",
            Self::Mount => "mount",
            Self::ApplyLayers => "apply layers",
            Self::WriteBootInit => "write boot init",
            Self::Unmount => "unmount",
            Self::Translate => "translate",
            Self::StartVm => "start vm",
            Self::WaitVm => "wait vm",
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
