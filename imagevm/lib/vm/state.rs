use std::fmt;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The lifecycle of a supervised Firecracker process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VmState {
    /// No process has been launched.
    #[default]
    NotStarted,

    /// The process is launched and being configured.
    Starting,

    /// The guest is booted.
    Running,

    /// The process exited or was stopped.
    Stopped,

    /// Launching or configuring the process failed.
    Failed,
}

/// Something that happened to a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmEvent {
    /// The process was spawned.
    Launched,

    /// Firecracker accepted `InstanceStart`.
    Booted,

    /// The process exited, or a stop request completed.
    Exited,

    /// Spawning, socket binding or configuration failed.
    Faulted,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmState {
    /// The state after `event`, or `None` when the event is not valid in this state.
    pub fn transition(self, event: VmEvent) -> Option<VmState> {
        use VmEvent::*;
        use VmState::*;

        match (self, event) {
            (NotStarted, Launched) => Some(Starting),
            (Starting, Booted) => Some(Running),
            (Starting | Running, Exited) => Some(Stopped),
            (NotStarted | Starting | Running, Faulted) => Some(Failed),
            // A stop after the process is gone is a no-op
            (NotStarted | Stopped | Failed, Exited) => Some(self),
            _ => None,
        }
    }

    /// Whether a process may still be alive in this state.
    pub fn has_process(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NotStarted => "not started",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
