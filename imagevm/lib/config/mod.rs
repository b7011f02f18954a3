//! Configuration types and defaults.

mod defaults;
mod pipeline;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use defaults::*;
pub use pipeline::*;
