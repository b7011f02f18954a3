//! Building the root filesystem disk image.
//!
//! [`RootfsBuilder`] drives a [`RootfsImage`] through its mount-state machine on a [`RootfsHost`].
//! [`SystemHost`] is the host that touches the real system.

mod builder;
mod host;
mod image;
mod init;
mod layer;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use builder::*;
pub use host::*;
pub use image::*;
pub use init::*;
pub use layer::*;
