//! The stage pipeline that turns an image reference into a running microVM.
//!
//! ```text
//! validate -> resolve -> allocate -> format -> mount -> apply layers -> write boot init
//!          -> unmount -> translate -> start vm -> wait vm
//! ```
//!
//! [`PipelineController`] runs the stages in order. Host-state changes register guards on a
//! [`CleanupStack`], which is unwound in reverse when a stage fails.

mod cleanup;
mod controller;
mod stage;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use cleanup::*;
pub use controller::*;
pub use stage::*;
