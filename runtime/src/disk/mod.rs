//! Bootable disk image construction.
//!
//! - `layout`: size rounding, partition plan, capacity check
//! - `mbr`: partition table encoding
//! - `backend`: privileged host operations (loop devices, mkfs, mount)
//! - `attach` / `mount`: tracked, exclusive OS resources
//! - `populate`: copying the assembled root in
//! - `bootloader`: kernel policy and GRUB
//! - `builder`: the state machine tying them together

pub mod attach;
pub mod backend;
pub mod bootloader;
pub mod builder;
pub mod layout;
pub mod mbr;
pub mod mount;
pub mod populate;

#[cfg(test)]
pub(crate) mod fake;

pub use attach::{AttachmentLock, BlockAttachment};
pub use backend::{AttachedDevice, DiskBackend, HostBackend, HostCommand};
pub use bootloader::{BootConfig, KernelImage};
pub use builder::{BuildState, DiskImage, DiskImageBuilder};
pub use layout::{DiskLayout, FilesystemKind, PartitionRole, PartitionSpec};
pub use mbr::{PartitionEntry, PartitionTable};
pub use mount::MountSession;
pub use populate::PopulateStats;
