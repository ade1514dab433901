//! Privileged host operations behind one trait.
//!
//! The builder never touches loop devices, mount(2) or external programs
//! directly; it goes through a [`DiskBackend`]. [`HostBackend`] is the real
//! implementation, tests use a recording fake.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use dockboot_core::error::{ConvertError, Result};

use super::layout::{DiskLayout, FilesystemKind};
use crate::host_check;

/// `PATH` for programs run inside the target root.
const TARGET_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// How long to wait for partition nodes after attaching.
const PARTITION_WAIT: Duration = Duration::from_secs(5);
const PARTITION_POLL: Duration = Duration::from_millis(50);

const UNMOUNT_RETRIES: u32 = 5;

/// What `losetup` prints when no loop device is free, across util-linux
/// releases, plus the kernel error when the loop driver has no more minors.
const LOOP_EXHAUSTED_MESSAGES: &[&str] = &[
    "cannot find an unused loop device",
    "could not find any free loop device",
    "No such device",
    "No space left on device",
];

/// A block device bound to a backing file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedDevice {
    /// Whole-disk node, e.g. `/dev/loop3`.
    pub device: PathBuf,
    /// Partition nodes in partition-number order.
    pub partitions: Vec<PathBuf>,
}

impl AttachedDevice {
    /// Node of the 1-based partition `number`.
    pub fn partition(&self, number: u32) -> Result<&Path> {
        (number as usize)
            .checked_sub(1)
            .and_then(|i| self.partitions.get(i))
            .map(PathBuf::as_path)
            .ok_or_else(|| {
                ConvertError::Internal(format!(
                    "{} has no partition {}",
                    self.device.display(),
                    number
                ))
            })
    }
}

/// An external program invocation, optionally inside a target root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Run via chroot into this directory.
    pub root: Option<PathBuf>,
}

impl HostCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            root: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Run inside `root` instead of on the host.
    pub fn in_root(mut self, root: &Path) -> Self {
        self.root = Some(root.to_path_buf());
        self
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(root) = &self.root {
            write!(f, "[chroot {}] ", root.display())?;
        }
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Privileged disk operations.
///
/// All methods block; callers run them on the blocking pool.
pub trait DiskBackend: Send + Sync {
    /// Fail fast if the host cannot build `layout`.
    fn check(&self, layout: &DiskLayout) -> Result<()>;

    /// Whether ownership and device nodes can be applied.
    fn privileged(&self) -> bool;

    /// Bind `image` to a block device exposing `partitions` partition nodes.
    fn attach(&self, image: &Path, partitions: usize) -> Result<AttachedDevice>;

    fn detach(&self, device: &Path) -> Result<()>;

    fn format(&self, partition: &Path, filesystem: FilesystemKind, label: &str) -> Result<()>;

    fn mount(&self, source: &Path, target: &Path, filesystem: FilesystemKind) -> Result<()>;

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<()>;

    fn unmount(&self, target: &Path) -> Result<()>;

    /// Run a program to completion, returning its stdout.
    fn run(&self, command: &HostCommand) -> Result<String>;
}

/// Loop devices, mount(2) and host programs.
#[derive(Debug, Clone)]
pub struct HostBackend {
    privileged: bool,
    tool_dir: Option<PathBuf>,
}

impl HostBackend {
    pub fn new() -> Self {
        Self {
            privileged: nix::unistd::geteuid().is_root(),
            tool_dir: None,
        }
    }

    /// Look for host programs in `dir` before `PATH`.
    pub fn with_tool_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.tool_dir = Some(dir.into());
        self
    }

    fn program(&self, name: &str) -> PathBuf {
        self.tool_dir
            .as_ref()
            .map(|dir| dir.join(name))
            .filter(|candidate| candidate.is_file())
            .unwrap_or_else(|| PathBuf::from(name))
    }

    fn wait_for_partitions(&self, device: &Path, count: usize) -> Result<Vec<PathBuf>> {
        let base = device.display().to_string();
        let nodes: Vec<PathBuf> = (1..=count)
            .map(|n| PathBuf::from(format!("{}p{}", base, n)))
            .collect();

        let deadline = std::time::Instant::now() + PARTITION_WAIT;
        loop {
            if nodes.iter().all(|n| n.exists()) {
                return Ok(nodes);
            }
            if std::time::Instant::now() >= deadline {
                return Err(ConvertError::Internal(format!(
                    "Partition nodes for {} did not appear",
                    base
                )));
            }
            std::thread::sleep(PARTITION_POLL);
        }
    }
}

impl Default for HostBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskBackend for HostBackend {
    fn check(&self, layout: &DiskLayout) -> Result<()> {
        host_check::check_disk_support(layout.boot().is_some()).map(|_| ())
    }

    fn privileged(&self) -> bool {
        self.privileged
    }

    fn attach(&self, image: &Path, partitions: usize) -> Result<AttachedDevice> {
        let command = HostCommand::new("losetup")
            .args(["--find", "--show", "--partscan"])
            .arg(image.display().to_string());
        let stdout = self.run(&command).map_err(|e| match e {
            ConvertError::Internal(msg) if is_loop_exhaustion(&msg) => {
                ConvertError::ResourceExhausted(format!("No free loop device: {}", msg))
            }
            other => other,
        })?;

        let device = PathBuf::from(stdout.trim());
        if !device.starts_with("/dev") {
            return Err(ConvertError::Internal(format!(
                "losetup returned unexpected device '{}'",
                stdout.trim()
            )));
        }
        tracing::info!(image = %image.display(), device = %device.display(), "Attached loop device");

        match self.wait_for_partitions(&device, partitions) {
            Ok(nodes) => Ok(AttachedDevice {
                device,
                partitions: nodes,
            }),
            Err(e) => {
                // Never leave a half-attached device behind
                if let Err(detach_err) = self.detach(&device) {
                    tracing::warn!(device = %device.display(), error = %detach_err, "Detach after failed attach");
                }
                Err(e)
            }
        }
    }

    fn detach(&self, device: &Path) -> Result<()> {
        self.run(&HostCommand::new("losetup").arg("-d").arg(device.display().to_string()))?;
        tracing::info!(device = %device.display(), "Detached loop device");
        Ok(())
    }

    fn format(&self, partition: &Path, filesystem: FilesystemKind, label: &str) -> Result<()> {
        let node = partition.display().to_string();
        let command = match filesystem {
            FilesystemKind::Ext4 => HostCommand::new("mkfs.ext4")
                .args(["-F", "-q", "-L"])
                .arg(label)
                .arg(node),
            FilesystemKind::Vfat => HostCommand::new("mkfs.vfat")
                .args(["-F", "32", "-n"])
                .arg(label.to_ascii_uppercase().chars().take(11).collect::<String>())
                .arg(node),
        };
        self.run(&command)?;
        tracing::info!(partition = %partition.display(), filesystem = filesystem.mount_type(), "Formatted partition");
        Ok(())
    }

    fn mount(&self, source: &Path, target: &Path, filesystem: FilesystemKind) -> Result<()> {
        use nix::mount::{mount, MsFlags};
        mount(
            Some(source),
            target,
            Some(filesystem.mount_type()),
            MsFlags::empty(),
            None::<&str>,
        )
        .map_err(|e| {
            ConvertError::io(
                format!("mounting {} at {}", source.display(), target.display()),
                std::io::Error::from(e),
            )
        })
    }

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<()> {
        use nix::mount::{mount, MsFlags};
        mount(
            Some(source),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| {
            ConvertError::io(
                format!("bind mounting {} at {}", source.display(), target.display()),
                std::io::Error::from(e),
            )
        })
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        use nix::errno::Errno;
        use nix::mount::{umount2, MntFlags};

        let mut attempt = 0;
        loop {
            match umount2(target, MntFlags::empty()) {
                Ok(()) => return Ok(()),
                Err(Errno::EBUSY) if attempt < UNMOUNT_RETRIES => {
                    attempt += 1;
                    std::thread::sleep(Duration::from_millis(100 * attempt as u64));
                }
                Err(Errno::EBUSY) => {
                    tracing::warn!(target = %target.display(), "Mount busy; detaching lazily");
                    return umount2(target, MntFlags::MNT_DETACH).map_err(|e| {
                        ConvertError::io(
                            format!("unmounting {}", target.display()),
                            std::io::Error::from(e),
                        )
                    });
                }
                Err(e) => {
                    return Err(ConvertError::io(
                        format!("unmounting {}", target.display()),
                        std::io::Error::from(e),
                    ))
                }
            }
        }
    }

    fn run(&self, command: &HostCommand) -> Result<String> {
        let mut cmd = match &command.root {
            Some(root) => {
                let mut cmd = Command::new(self.program("chroot"));
                cmd.arg(root).arg(&command.program);
                cmd.env_clear();
                cmd.env("PATH", TARGET_PATH);
                cmd.env("HOME", "/root");
                cmd.env("DEBIAN_FRONTEND", "noninteractive");
                cmd
            }
            None => Command::new(self.program(&command.program)),
        };
        cmd.args(&command.args);

        tracing::debug!(command = %command, "Running");
        let output = cmd
            .output()
            .map_err(|e| ConvertError::Internal(format!("Failed to execute {}: {}", command, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConvertError::Internal(format!(
                "{} failed (exit {}): {}",
                command,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn is_loop_exhaustion(message: &str) -> bool {
    LOOP_EXHAUSTED_MESSAGES.iter().any(|m| message.contains(m))
}
