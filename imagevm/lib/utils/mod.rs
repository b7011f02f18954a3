//! Utility functions and types.

mod conversion;
mod env;
mod file;
mod path;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use conversion::*;
pub use env::*;
pub use file::*;
pub use path::*;
