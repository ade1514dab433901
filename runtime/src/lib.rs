//! Dockboot Runtime - container image to bootable disk conversion.
//!
//! This crate provides the conversion engine: registry access, layer
//! assembly, disk image construction and the resource tracking that keeps
//! loop devices and mounts from leaking.

#![allow(clippy::result_large_err)]

pub mod convert;
pub mod disk;
pub mod host_check;
pub mod oci;
pub mod retry;
pub mod tracker;
pub mod workspace;

// Re-export common types
pub use convert::{ConversionOutput, ConversionRequest, Converter};
pub use disk::{BuildState, DiskBackend, DiskImage, DiskImageBuilder, DiskLayout, HostBackend};
pub use host_check::{check_disk_support, Capability, HostCapabilities};
pub use oci::{AssembledRoot, ImageInfo, ImageReference, LayerAssembler, Manifest, Platform};
pub use oci::{CredentialStore, RegistryAuth, RegistryClient};
pub use retry::RetryConfig;
pub use tracker::{ResourceId, ResourceKind, ResourceTracker};
pub use workspace::Workspace;

/// Dockboot runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
