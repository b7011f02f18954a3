//! OCI image handling: references, the content store, registry pulls and image resolution.
//!
//! The resolver only talks to a [`ContentStore`]. [`OciStore`] is the on-disk implementation and
//! fetches missing images through a [`DockerRegistry`].

mod reference;
mod registry;
mod resolver;
mod store;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use reference::*;
pub use registry::*;
pub use resolver::*;
pub use store::*;
