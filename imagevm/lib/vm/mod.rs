//! Booting a rootfs as a Firecracker microVM.
//!
//! [`translate`] turns a built rootfs and the image command into a [`MachineConfig`].
//! [`VmSupervisor`] launches Firecracker, applies the config over the [`FirecrackerApi`] and
//! owns the process until it exits.

mod api;
mod config;
mod state;
mod supervisor;
mod translate;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use api::*;
pub use config::*;
pub use state::*;
pub use supervisor::*;
pub use translate::*;
