//! `imagevm` turns a container image into a running Firecracker microVM.
//!
//! # Overview
//!
//! Given an image reference, imagevm:
//! - resolves the image's manifest and configuration from a local OCI content store, pulling it
//!   from a registry when it is missing
//! - allocates a raw disk image, formats it and loop-mounts it
//! - applies the image layers onto the mounted filesystem in manifest order
//! - optionally writes a boot-init script that exports the image environment and runs its command
//! - unmounts the disk and boots it as the root drive of a Firecracker microVM
//!
//! Every stage that changes host state registers a cleanup guard. When a later stage fails, or the
//! run is cancelled, the guards are unwound in reverse so the host is never left with a mounted
//! loop device or a stray hypervisor process.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use imagevm::{
//!     config::PipelineConfig,
//!     oci::{DockerRegistry, OciStore},
//!     pipeline::PipelineController,
//!     rootfs::SystemHost,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::builder()
//!         .kernel_path("./hello-vmlinux.bin")
//!         .firecracker_path("./firecracker")
//!         .build();
//!
//!     let store = OciStore::new(config.get_store_path()).with_registry(DockerRegistry::new());
//!     let controller = PipelineController::new(config, store, SystemHost);
//!
//!     controller.run("alpine:latest").await?;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`cli`] - Command-line arguments and styles
//! - [`config`] - Pipeline configuration and defaults
//! - [`oci`] - Image references, the content store, registry pulls and image resolution
//! - [`rootfs`] - Disk image allocation, mounting and layer application
//! - [`vm`] - Machine configuration and Firecracker supervision
//! - [`pipeline`] - The stage controller and its cleanup guards
//! - [`utils`] - Common utilities and helpers

#![warn(missing_docs)]

mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod cli;
pub mod config;
pub mod oci;
pub mod pipeline;
pub mod rootfs;
pub mod utils;
pub mod vm;

pub use error::*;
