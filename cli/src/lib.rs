//! Dockboot CLI - turn container images into bootable disk images.

pub mod commands;
pub mod output;
