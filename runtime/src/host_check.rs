//! Host capability detection.
//!
//! Building a disk image needs privileges and tools the process cannot
//! assume:
//! - root (loop devices, mount(2), mknod, chown)
//! - /dev/loop-control
//! - losetup, mkfs.ext4, mkfs.vfat (separate boot only)
//! - grub-install on the host, unless the image ships its own

use std::path::{Path, PathBuf};

use dockboot_core::error::{ConvertError, Result};

/// Directories searched in addition to `PATH`; sbin is often missing from it.
const EXTRA_TOOL_DIRS: &[&str] = &["/usr/local/sbin", "/usr/sbin", "/sbin"];

/// One OS capability a disk operation depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Effective uid 0.
    Privileged,
    /// Loop device control node.
    LoopDevices,
    /// Named host program.
    Tool(&'static str),
}

/// Result of probing the host.
#[derive(Debug, Clone)]
pub struct HostCapabilities {
    pub privileged: bool,
    pub loop_control: bool,
    pub tools: Vec<(&'static str, Option<PathBuf>)>,
}

impl HostCapabilities {
    /// Probe the running host.
    pub fn probe() -> Self {
        let tools = ["losetup", "mkfs.ext4", "mkfs.vfat", "grub-install", "chroot"]
            .into_iter()
            .map(|name| (name, find_program(name)))
            .collect();
        Self {
            privileged: nix::unistd::geteuid().is_root(),
            loop_control: Path::new("/dev/loop-control").exists(),
            tools,
        }
    }

    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::Privileged => self.privileged,
            Capability::LoopDevices => self.loop_control,
            Capability::Tool(name) => self
                .tools
                .iter()
                .any(|(tool, path)| *tool == name && path.is_some()),
        }
    }

    /// Fail fast with a message naming what is missing.
    pub fn require(&self, capability: Capability) -> Result<()> {
        if self.has(capability) {
            return Ok(());
        }
        let message = match capability {
            Capability::Privileged => {
                "Building disk images requires root (loop devices, mount, mknod)".to_string()
            }
            Capability::LoopDevices => {
                "Loop devices are not available: /dev/loop-control not found. \
                 Load the loop module (modprobe loop)."
                    .to_string()
            }
            Capability::Tool(name) => format!("Required host tool '{}' not found", name),
        };
        Err(ConvertError::Internal(message))
    }
}

/// Check everything a disk build needs before any work starts.
pub fn check_disk_support(separate_boot: bool) -> Result<HostCapabilities> {
    let caps = HostCapabilities::probe();
    caps.require(Capability::Privileged)?;
    caps.require(Capability::LoopDevices)?;
    caps.require(Capability::Tool("losetup"))?;
    caps.require(Capability::Tool("mkfs.ext4"))?;
    caps.require(Capability::Tool("chroot"))?;
    if separate_boot {
        caps.require(Capability::Tool("mkfs.vfat"))?;
    }
    if !caps.has(Capability::Tool("grub-install")) {
        tracing::warn!("grub-install not found on host; the image must provide its own");
    }
    Ok(caps)
}

/// Locate a program on `PATH` or in the sbin directories.
pub fn find_program(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&path_var)
        .chain(EXTRA_TOOL_DIRS.iter().map(PathBuf::from))
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
