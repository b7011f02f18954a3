//! Command-line arguments and terminal styles of the `imagevm` binary.

mod args;
mod styles;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use args::*;
pub use styles::*;
