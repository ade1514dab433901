//! Kernel discovery and GRUB installation.
//!
//! The bootloader is installed with the populated root mounted and `/dev`,
//! `/proc` and `/sys` bound into it, so tooling run through chroot resolves
//! paths against the target system.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dockboot_core::config::{ConvertConfig, KernelPolicy};
use dockboot_core::error::{ConvertError, Result};

use super::backend::{AttachedDevice, DiskBackend, HostCommand};
use super::layout::DiskLayout;
use super::mount::MountSession;
use super::populate;
use crate::oci::layers;
use crate::tracker::ResourceTracker;

/// Label used for errors about paths inside the target root.
const ROOT_LABEL: &str = "target root";

/// Kernel paths where grub.cfg expects them when no kernel is present.
const GENERIC_KERNEL: &str = "vmlinuz";
const GENERIC_INITRD: &str = "initrd.img";

/// Places a target's own grub-install may live.
const TARGET_GRUB_INSTALL: &[&str] = &["usr/sbin/grub-install", "usr/bin/grub-install", "sbin/grub-install"];

/// A kernel inside the target root (absolute target paths).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelImage {
    pub kernel: PathBuf,
    pub initrd: Option<PathBuf>,
}

/// Everything grub.cfg needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootConfig {
    /// Kernel path on the boot-capable partition.
    pub kernel: PathBuf,
    pub initrd: Option<PathBuf>,
    pub cmdline: String,
    /// Root device the kernel mounts, e.g. `/dev/sda1`.
    pub root_device: String,
    /// 1-based number of the partition GRUB reads.
    pub boot_partition: u32,
    /// GRUB module for the boot partition's filesystem.
    pub boot_module: &'static str,
    pub timeout_secs: u32,
    pub title: String,
    /// No kernel was found; the entry points at the generic paths.
    pub generic: bool,
}

impl BootConfig {
    pub fn render_grub_cfg(&self) -> String {
        let mut cfg = String::new();
        cfg.push_str("# Generated by dockboot\n");
        cfg.push_str(&format!("set timeout={}\n", self.timeout_secs));
        cfg.push_str("set default=0\n\n");
        cfg.push_str("insmod part_msdos\n");
        cfg.push_str(&format!("insmod {}\n\n", self.boot_module));
        cfg.push_str(&format!("menuentry '{}' {{\n", self.title.replace('\'', "")));
        cfg.push_str(&format!("\tset root='(hd0,msdos{})'\n", self.boot_partition));
        cfg.push_str(&format!(
            "\tlinux {} root={} {}\n",
            self.kernel.display(),
            self.root_device,
            self.cmdline
        ));
        if let Some(initrd) = &self.initrd {
            cfg.push_str(&format!("\tinitrd {}\n", initrd.display()));
        }
        cfg.push_str("}\n");
        cfg
    }
}

/// Parsed `/etc/os-release`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsRelease {
    pub id: String,
    pub id_like: Vec<String>,
    pub pretty_name: Option<String>,
}

impl OsRelease {
    pub fn parse(content: &str) -> Self {
        let mut release = OsRelease::default();
        for line in content.lines() {
            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').trim_matches('\'');
            match key {
                "ID" => release.id = value.to_ascii_lowercase(),
                "ID_LIKE" => {
                    release.id_like = value.split_whitespace().map(str::to_ascii_lowercase).collect()
                }
                "PRETTY_NAME" => release.pretty_name = Some(value.to_string()),
                _ => {}
            }
        }
        release
    }

    /// Read from the target root; `None` if neither location exists.
    pub fn read(root: &Path) -> Option<Self> {
        ["etc/os-release", "usr/lib/os-release"]
            .iter()
            .filter_map(|rel| resolve_in(root, Path::new(rel)))
            .find_map(|path| fs::read_to_string(path).ok())
            .map(|content| Self::parse(&content))
    }

    fn is(&self, id: &str) -> bool {
        self.id == id || self.id_like.iter().any(|like| like == id)
    }
}

/// Distributions whose kernel packages we know how to install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distro {
    Alpine,
    Debian,
    Ubuntu,
}

impl Distro {
    pub fn detect(release: &OsRelease) -> Option<Self> {
        // ubuntu carries ID_LIKE=debian, so check it first
        if release.is("ubuntu") {
            Some(Distro::Ubuntu)
        } else if release.is("debian") {
            Some(Distro::Debian)
        } else if release.is("alpine") {
            Some(Distro::Alpine)
        } else {
            None
        }
    }

    /// Commands that install a kernel and GRUB, run inside the target.
    pub fn kernel_install_commands(&self, root: &Path) -> Vec<HostCommand> {
        match self {
            Distro::Alpine => vec![HostCommand::new("apk")
                .args(["add", "--no-cache", "linux-lts", "grub", "grub-bios"])
                .in_root(root)],
            Distro::Debian | Distro::Ubuntu => {
                let kernel = if *self == Distro::Ubuntu {
                    "linux-image-generic"
                } else {
                    "linux-image-amd64"
                };
                vec![
                    HostCommand::new("apt-get").arg("update").in_root(root),
                    HostCommand::new("apt-get")
                        .args(["install", "-y", "--no-install-recommends", kernel, "grub-pc"])
                        .in_root(root),
                ]
            }
        }
    }
}

/// Find the kernel the image ships.
///
/// Looks at `/boot/vmlinuz*`, `/vmlinuz` and `/lib/modules/*/vmlinuz`, in
/// that order, and pairs it with a matching initrd.
pub fn discover_kernel(root: &Path) -> Option<KernelImage> {
    let mut boot_kernels: Vec<String> = list_dir(root, "boot")
        .into_iter()
        .filter(|name| name.starts_with("vmlinuz"))
        .filter(|name| resolve_in(root, &Path::new("boot").join(name)).is_some())
        .collect();
    // Versioned names sort after the bare one; prefer them.
    boot_kernels.sort();
    if let Some(name) = boot_kernels.pop() {
        let suffix = &name["vmlinuz".len()..];
        let candidates = [
            format!("initrd.img{}", suffix),
            format!("initramfs{}", suffix),
            format!("initramfs{}.img", suffix),
            format!("initrd{}", suffix),
            "initrd.img".to_string(),
            "initramfs.img".to_string(),
        ];
        let initrd = candidates
            .iter()
            .map(|c| Path::new("boot").join(c))
            .find(|rel| resolve_in(root, rel).is_some());
        return Some(KernelImage {
            kernel: Path::new("/boot").join(&name),
            initrd: initrd.map(|rel| Path::new("/").join(rel)),
        });
    }

    if resolve_in(root, Path::new("vmlinuz")).is_some() {
        let initrd = resolve_in(root, Path::new("initrd.img")).map(|_| PathBuf::from("/initrd.img"));
        return Some(KernelImage {
            kernel: PathBuf::from("/vmlinuz"),
            initrd,
        });
    }

    let mut versions: Vec<String> = list_dir(root, "lib/modules")
        .into_iter()
        .filter(|v| resolve_in(root, &Path::new("lib/modules").join(v).join("vmlinuz")).is_some())
        .collect();
    versions.sort();
    let version = versions.pop()?;
    let initrd = [
        format!("initramfs-{}.img", version),
        format!("initrd.img-{}", version),
    ]
    .iter()
    .map(|c| Path::new("boot").join(c))
    .find(|rel| resolve_in(root, rel).is_some());
    Some(KernelImage {
        kernel: Path::new("/lib/modules").join(&version).join("vmlinuz"),
        initrd: initrd.map(|rel| Path::new("/").join(rel)),
    })
}

/// Host path of a regular file at `rel` inside `root`, following symlinks
/// as the target would see them.
fn resolve_in(root: &Path, rel: &Path) -> Option<PathBuf> {
    let host = root.join(layers::resolve_beneath(root, rel, ROOT_LABEL).ok()?);
    let meta = fs::symlink_metadata(&host).ok()?;
    meta.is_file().then_some(host)
}

/// File names in directory `rel` inside `root`.
fn list_dir(root: &Path, rel: &str) -> Vec<String> {
    let Ok(resolved) = layers::resolve_beneath(root, Path::new(rel), ROOT_LABEL) else {
        return Vec::new();
    };
    fs::read_dir(root.join(resolved))
        .into_iter()
        .flatten()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect()
}

/// Directory `name` inside `root` for a mount, never `root` itself.
fn mount_point(root: &Path, name: &str) -> Result<PathBuf> {
    let target = populate::dir_beneath(root, Path::new(name))?;
    if target == root {
        return Err(ConvertError::PathTraversal {
            layer: ROOT_LABEL.to_string(),
            path: name.to_string(),
        });
    }
    Ok(target)
}

/// Copy kernel and initrd to the top of a separate boot partition.
///
/// Returns their paths as GRUB sees them on that partition.
pub fn stage_boot_artifacts(root: &Path, boot_mount: &Path, kernel: &KernelImage) -> Result<KernelImage> {
    let copy = |target_path: &Path| -> Result<PathBuf> {
        let rel = target_path.strip_prefix("/").unwrap_or(target_path);
        let source = resolve_in(root, rel).ok_or_else(|| {
            ConvertError::BootloaderInstall(format!("{} vanished from the image", target_path.display()))
        })?;
        let name = target_path
            .file_name()
            .ok_or_else(|| ConvertError::Internal(format!("bad kernel path {}", target_path.display())))?;
        let dest = boot_mount.join(name);
        fs::copy(&source, &dest)
            .map_err(|e| ConvertError::io(format!("copying {} to boot partition", target_path.display()), e))?;
        Ok(Path::new("/").join(name))
    };

    let staged = KernelImage {
        kernel: copy(kernel.kernel.as_path())?,
        initrd: kernel.initrd.as_deref().map(copy).transpose()?,
    };
    tracing::info!(kernel = %staged.kernel.display(), "Staged kernel on boot partition");
    Ok(staged)
}

/// Installs GRUB into an attached, populated image.
pub struct Bootloader {
    backend: Arc<dyn DiskBackend>,
    policy: KernelPolicy,
    cmdline: String,
    timeout_secs: u32,
    layout: DiskLayout,
}

impl Bootloader {
    pub fn new(backend: Arc<dyn DiskBackend>, config: &ConvertConfig, layout: &DiskLayout) -> Self {
        Self {
            backend,
            policy: config.kernel_policy,
            cmdline: config.kernel_cmdline.clone(),
            timeout_secs: config.bootloader_timeout_secs,
            layout: layout.clone(),
        }
    }

    /// Resolve the kernel, install GRUB and write its configuration.
    ///
    /// Bind mounts made here are released before returning.
    pub fn install(
        &self,
        tracker: &ResourceTracker,
        device: &AttachedDevice,
        root: &Path,
        boot_mount: Option<&Path>,
    ) -> Result<BootConfig> {
        let mark = tracker.checkpoint();
        let result = self.install_scoped(tracker, device, root, boot_mount);
        let release_errors = tracker.release_to(mark);
        let config = result?;
        if let Some(err) = release_errors.into_iter().next() {
            return Err(err);
        }
        Ok(config)
    }

    fn install_scoped(
        &self,
        tracker: &ResourceTracker,
        device: &AttachedDevice,
        root: &Path,
        boot_mount: Option<&Path>,
    ) -> Result<BootConfig> {
        for dir in ["dev", "proc", "sys"] {
            let target = mount_point(root, dir)?;
            MountSession::bind(tracker, self.backend.clone(), &Path::new("/").join(dir), &target)?;
        }

        let (kernel, generic) = match self.resolve_kernel(root)? {
            Some(kernel) => (kernel, false),
            None => {
                tracing::warn!("No kernel in image; writing generic boot entry");
                let generic = KernelImage {
                    kernel: PathBuf::from("/boot").join(GENERIC_KERNEL),
                    initrd: Some(PathBuf::from("/boot").join(GENERIC_INITRD)),
                };
                (generic, true)
            }
        };

        let boot_kernel = match boot_mount {
            Some(boot) if !generic => stage_boot_artifacts(root, boot, &kernel)?,
            Some(_) => KernelImage {
                kernel: PathBuf::from("/").join(GENERIC_KERNEL),
                initrd: Some(PathBuf::from("/").join(GENERIC_INITRD)),
            },
            None => kernel,
        };
        if let Some(boot) = boot_mount {
            // /boot inside the target is the boot partition from here on
            MountSession::bind(tracker, self.backend.clone(), boot, &mount_point(root, "boot")?)?;
        }

        self.run_grub_install(device, root)?;

        let boot_part = self.layout.boot_capable();
        let config = BootConfig {
            kernel: boot_kernel.kernel,
            initrd: boot_kernel.initrd,
            cmdline: self.cmdline.clone(),
            root_device: format!("/dev/sda{}", self.layout.root().number),
            boot_partition: boot_part.number,
            boot_module: boot_part.filesystem.grub_module(),
            timeout_secs: self.timeout_secs,
            title: OsRelease::read(root)
                .and_then(|r| r.pretty_name)
                .unwrap_or_else(|| "Linux".to_string()),
            generic,
        };

        let grub_cfg = config.render_grub_cfg();
        populate::write_beneath(root, Path::new("boot/grub/grub.cfg"), grub_cfg.as_bytes())?;
        tracing::info!(kernel = %config.kernel.display(), root = %config.root_device, "Wrote GRUB configuration");

        Ok(config)
    }

    /// Apply the kernel policy. `Ok(None)` means use the generic stage.
    fn resolve_kernel(&self, root: &Path) -> Result<Option<KernelImage>> {
        if let Some(kernel) = discover_kernel(root) {
            tracing::info!(kernel = %kernel.kernel.display(), "Found kernel in image");
            return Ok(Some(kernel));
        }

        match self.policy {
            KernelPolicy::Require => Err(ConvertError::BootloaderInstall(
                "No kernel found in image (looked in /boot, /vmlinuz, /lib/modules)".to_string(),
            )),
            KernelPolicy::GenericStage => Ok(None),
            KernelPolicy::DistroPackages => {
                let release = OsRelease::read(root).unwrap_or_default();
                let distro = Distro::detect(&release).ok_or_else(|| {
                    ConvertError::BootloaderInstall(format!(
                        "No kernel found and no known package manager for distribution '{}'",
                        release.id
                    ))
                })?;
                tracing::info!(distro = ?distro, "Installing distribution kernel");
                provide_resolv_conf(root)?;
                for command in distro.kernel_install_commands(root) {
                    self.backend
                        .run(&command)
                        .map_err(|e| ConvertError::BootloaderInstall(format!("Kernel install failed: {}", e)))?;
                }
                discover_kernel(root).map(Some).ok_or_else(|| {
                    ConvertError::BootloaderInstall(
                        "Kernel package installed but no kernel image appeared".to_string(),
                    )
                })
            }
        }
    }

    fn run_grub_install(&self, device: &AttachedDevice, root: &Path) -> Result<()> {
        let disk = device.device.display().to_string();
        let in_target = TARGET_GRUB_INSTALL
            .iter()
            .any(|rel| resolve_in(root, Path::new(rel)).is_some());

        let command = if in_target {
            HostCommand::new("grub-install")
                .args(["--target=i386-pc", "--boot-directory=/boot"])
                .arg(disk)
                .in_root(root)
        } else {
            tracing::info!("Image has no grub-install; using the host's");
            let boot = mount_point(root, "boot")?;
            HostCommand::new("grub-install")
                .arg("--target=i386-pc")
                .arg(format!("--boot-directory={}", boot.display()))
                .arg(disk)
        };

        self.backend
            .run(&command)
            .map_err(|e| ConvertError::BootloaderInstall(e.to_string()))?;
        Ok(())
    }
}

/// Give package managers in the target working DNS.
///
/// An image's own resolv.conf is kept when it resolves to a regular file
/// inside the root. Anything else at that path is replaced with the host's.
fn provide_resolv_conf(root: &Path) -> Result<()> {
    provide_resolv_conf_from(root, Path::new("/etc/resolv.conf"))
}

fn provide_resolv_conf_from(root: &Path, host_conf: &Path) -> Result<()> {
    let rel = Path::new("etc/resolv.conf");
    if resolve_in(root, rel).is_some() {
        return Ok(());
    }
    let contents = match fs::read(host_conf) {
        Ok(contents) => contents,
        Err(e) => {
            tracing::warn!(error = %e, "Host has no resolv.conf to share with target");
            return Ok(());
        }
    };
    populate::write_beneath(root, rel, &contents)?;
    tracing::debug!("Provided resolv.conf to target");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::fake::FakeBackend;
    use crate::tracker::ResourceKind;
    use dockboot_core::config::Partitioning;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    fn write(root: &Path, rel: &str, data: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    fn device() -> AttachedDevice {
        AttachedDevice {
            device: PathBuf::from("/dev/fakeloop0"),
            partitions: vec![PathBuf::from("/dev/fakeloop0p1"), PathBuf::from("/dev/fakeloop0p2")],
        }
    }

    #[test]
    fn test_discover_versioned_kernel_with_initrd() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "boot/vmlinuz-6.1.0-13-amd64", b"k");
        write(dir.path(), "boot/initrd.img-6.1.0-13-amd64", b"i");
        std::os::unix::fs::symlink("vmlinuz-6.1.0-13-amd64", dir.path().join("boot/vmlinuz")).unwrap();

        let kernel = discover_kernel(dir.path()).unwrap();
        assert_eq!(kernel.kernel, PathBuf::from("/boot/vmlinuz-6.1.0-13-amd64"));
        assert_eq!(kernel.initrd, Some(PathBuf::from("/boot/initrd.img-6.1.0-13-amd64")));
    }

    #[test]
    fn test_discover_alpine_flavor() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "boot/vmlinuz-lts", b"k");
        write(dir.path(), "boot/initramfs-lts", b"i");
        let kernel = discover_kernel(dir.path()).unwrap();
        assert_eq!(kernel.kernel, PathBuf::from("/boot/vmlinuz-lts"));
        assert_eq!(kernel.initrd, Some(PathBuf::from("/boot/initramfs-lts")));
    }

    #[test]
    fn test_discover_root_symlink_absolute() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "boot/kernel-x", b"k");
        std::os::unix::fs::symlink("/boot/kernel-x", dir.path().join("vmlinuz")).unwrap();
        let kernel = discover_kernel(dir.path()).unwrap();
        assert_eq!(kernel.kernel, PathBuf::from("/vmlinuz"));
        assert_eq!(kernel.initrd, None);
    }

    #[test]
    fn test_discover_lib_modules() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "lib/modules/6.5.6-300.fc39.x86_64/vmlinuz", b"k");
        write(dir.path(), "boot/initramfs-6.5.6-300.fc39.x86_64.img", b"i");
        let kernel = discover_kernel(dir.path()).unwrap();
        assert_eq!(
            kernel.kernel,
            PathBuf::from("/lib/modules/6.5.6-300.fc39.x86_64/vmlinuz")
        );
        assert!(kernel.initrd.is_some());
    }

    #[test]
    fn test_dangling_kernel_link_ignored() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("boot")).unwrap();
        std::os::unix::fs::symlink("/nowhere", dir.path().join("boot/vmlinuz")).unwrap();
        assert!(discover_kernel(dir.path()).is_none());
    }

    #[test]
    fn test_os_release_and_distro() {
        let ubuntu = OsRelease::parse("ID=ubuntu\nID_LIKE=debian\nPRETTY_NAME=\"Ubuntu 22.04.3 LTS\"\n");
        assert_eq!(Distro::detect(&ubuntu), Some(Distro::Ubuntu));
        assert_eq!(ubuntu.pretty_name.as_deref(), Some("Ubuntu 22.04.3 LTS"));

        let alpine = OsRelease::parse("NAME=\"Alpine Linux\"\nID=alpine\n");
        assert_eq!(Distro::detect(&alpine), Some(Distro::Alpine));

        let mint = OsRelease::parse("ID=linuxmint\nID_LIKE=\"ubuntu debian\"\n");
        assert_eq!(Distro::detect(&mint), Some(Distro::Ubuntu));

        assert_eq!(Distro::detect(&OsRelease::parse("ID=arch\n")), None);
    }

    #[test]
    fn test_grub_cfg_render() {
        let config = BootConfig {
            kernel: PathBuf::from("/boot/vmlinuz-lts"),
            initrd: Some(PathBuf::from("/boot/initramfs-lts")),
            cmdline: "ro console=ttyS0".to_string(),
            root_device: "/dev/sda1".to_string(),
            boot_partition: 1,
            boot_module: "ext2",
            timeout_secs: 5,
            title: "Alpine Linux v3.19".to_string(),
            generic: false,
        };
        let cfg = config.render_grub_cfg();
        assert!(cfg.contains("set timeout=5"));
        assert!(cfg.contains("insmod ext2"));
        assert!(cfg.contains("set root='(hd0,msdos1)'"));
        assert!(cfg.contains("linux /boot/vmlinuz-lts root=/dev/sda1 ro console=ttyS0"));
        assert!(cfg.contains("initrd /boot/initramfs-lts"));
    }

    #[test]
    fn test_install_with_kernel_in_image() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        write(root, "boot/vmlinuz-lts", b"k");
        write(root, "usr/sbin/grub-install", b"#!");
        write(root, "etc/os-release", b"PRETTY_NAME=\"Alpine\"\n");

        let backend = Arc::new(FakeBackend::new());
        let tracker = ResourceTracker::new();
        let layout = DiskLayout::plan(&ConvertConfig::default(), 512 * MIB).unwrap();
        let bootloader = Bootloader::new(backend.clone(), &ConvertConfig::default(), &layout);

        let config = bootloader.install(&tracker, &device(), root, None).unwrap();
        assert!(!config.generic);
        assert_eq!(config.root_device, "/dev/sda1");
        assert_eq!(config.title, "Alpine");

        let commands = backend.commands();
        assert_eq!(commands.len(), 1);
        assert!(commands[0].starts_with("[chroot "));
        assert!(commands[0].ends_with("grub-install --target=i386-pc --boot-directory=/boot /dev/fakeloop0"));

        let cfg = fs::read_to_string(root.join("boot/grub/grub.cfg")).unwrap();
        assert!(cfg.contains("linux /boot/vmlinuz-lts root=/dev/sda1"));

        // bind mounts released
        assert!(tracker.active(ResourceKind::BindMount).is_empty());
        assert!(backend.mounts().is_empty());
    }

    #[test]
    fn test_host_grub_fallback() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "boot/vmlinuz", b"k");

        let backend = Arc::new(FakeBackend::new());
        let tracker = ResourceTracker::new();
        let layout = DiskLayout::plan(&ConvertConfig::default(), 512 * MIB).unwrap();
        Bootloader::new(backend.clone(), &ConvertConfig::default(), &layout)
            .install(&tracker, &device(), dir.path(), None)
            .unwrap();

        let commands = backend.commands();
        assert!(!commands[0].starts_with("[chroot"));
        assert!(commands[0].contains(&format!("--boot-directory={}", dir.path().join("boot").display())));
    }

    #[test]
    fn test_require_policy_fails_without_kernel() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(FakeBackend::new());
        let tracker = ResourceTracker::new();
        let config = ConvertConfig {
            kernel_policy: KernelPolicy::Require,
            ..Default::default()
        };
        let layout = DiskLayout::plan(&config, 512 * MIB).unwrap();
        let err = Bootloader::new(backend.clone(), &config, &layout)
            .install(&tracker, &device(), dir.path(), None)
            .unwrap_err();
        assert!(matches!(err, ConvertError::BootloaderInstall(_)));
        assert!(backend.mounts().is_empty());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_generic_stage_without_kernel() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(FakeBackend::new());
        let tracker = ResourceTracker::new();
        let layout = DiskLayout::plan(&ConvertConfig::default(), 512 * MIB).unwrap();
        let config = Bootloader::new(backend, &ConvertConfig::default(), &layout)
            .install(&tracker, &device(), dir.path(), None)
            .unwrap();
        assert!(config.generic);
        assert_eq!(config.kernel, PathBuf::from("/boot/vmlinuz"));
        assert_eq!(config.initrd, Some(PathBuf::from("/boot/initrd.img")));
    }

    #[test]
    fn test_distro_packages_installs_kernel() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_path_buf();
        write(&root, "etc/os-release", b"ID=alpine\n");
        write(&root, "etc/resolv.conf", b"nameserver 10.0.0.1\n");

        let hook_root = root.clone();
        let backend = Arc::new(FakeBackend::new().with_run_hook(move |cmd| {
            if cmd.program == "apk" {
                write(&hook_root, "boot/vmlinuz-lts", b"k");
                write(&hook_root, "boot/initramfs-lts", b"i");
            }
            Ok(String::new())
        }));
        let tracker = ResourceTracker::new();
        let config = ConvertConfig {
            kernel_policy: KernelPolicy::DistroPackages,
            ..Default::default()
        };
        let layout = DiskLayout::plan(&config, 512 * MIB).unwrap();
        let boot = Bootloader::new(backend.clone(), &config, &layout)
            .install(&tracker, &device(), &root, None)
            .unwrap();
        assert_eq!(boot.kernel, PathBuf::from("/boot/vmlinuz-lts"));
        assert!(backend.commands()[0].contains("apk add --no-cache linux-lts grub grub-bios"));
    }

    #[test]
    fn test_distro_packages_unknown_distro() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "etc/os-release", b"ID=arch\n");
        let backend = Arc::new(FakeBackend::new());
        let tracker = ResourceTracker::new();
        let config = ConvertConfig {
            kernel_policy: KernelPolicy::DistroPackages,
            ..Default::default()
        };
        let layout = DiskLayout::plan(&config, 512 * MIB).unwrap();
        let err = Bootloader::new(backend, &config, &layout)
            .install(&tracker, &device(), dir.path(), None)
            .unwrap_err();
        assert!(err.to_string().contains("arch"));
    }

    #[test]
    fn test_separate_boot_stages_kernel() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        let boot = dir.path().join("boot");
        fs::create_dir_all(&boot).unwrap();
        write(&root, "boot/vmlinuz-lts", b"kernel");
        write(&root, "boot/initramfs-lts", b"initrd");

        let backend = Arc::new(FakeBackend::new());
        let tracker = ResourceTracker::new();
        let config = ConvertConfig {
            partitioning: Partitioning::SeparateBoot {
                boot_size_bytes: 64 * MIB,
            },
            ..Default::default()
        };
        let layout = DiskLayout::plan(&config, 1024 * MIB).unwrap();
        let boot_config = Bootloader::new(backend.clone(), &config, &layout)
            .install(&tracker, &device(), &root, Some(&boot))
            .unwrap();

        assert_eq!(fs::read(boot.join("vmlinuz-lts")).unwrap(), b"kernel");
        assert_eq!(boot_config.kernel, PathBuf::from("/vmlinuz-lts"));
        assert_eq!(boot_config.boot_partition, 1);
        assert_eq!(boot_config.boot_module, "fat");
        assert_eq!(boot_config.root_device, "/dev/sda2");
        assert!(backend
            .calls()
            .iter()
            .any(|c| c.starts_with("bind") && c.ends_with("root/boot")));
    }

    #[test]
    fn test_grub_failure_is_bootloader_error() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "boot/vmlinuz", b"k");
        let backend = Arc::new(FakeBackend::new());
        backend.fail_on(crate::disk::fake::Op::Run);
        let tracker = ResourceTracker::new();
        let layout = DiskLayout::plan(&ConvertConfig::default(), 512 * MIB).unwrap();
        let err = Bootloader::new(backend.clone(), &ConvertConfig::default(), &layout)
            .install(&tracker, &device(), dir.path(), None)
            .unwrap_err();
        assert_eq!(err.kind(), dockboot_core::error::ErrorKind::BootloaderInstallFailure);
        assert!(backend.mounts().is_empty());
    }

    #[test]
    fn test_symlinked_boot_paths_stay_inside_root() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        let host = dir.path().join("host");
        fs::create_dir_all(host.join("grub")).unwrap();
        fs::create_dir_all(host.join("dev")).unwrap();
        write(&root, "boot/vmlinuz", b"k");
        std::os::unix::fs::symlink(host.join("grub"), root.join("boot/grub")).unwrap();
        std::os::unix::fs::symlink(host.join("dev"), root.join("dev")).unwrap();

        let backend = Arc::new(FakeBackend::new());
        let tracker = ResourceTracker::new();
        let layout = DiskLayout::plan(&ConvertConfig::default(), 512 * MIB).unwrap();
        Bootloader::new(backend.clone(), &ConvertConfig::default(), &layout)
            .install(&tracker, &device(), &root, None)
            .unwrap();

        assert!(!host.join("grub/grub.cfg").exists());
        let inside = root.join(host.strip_prefix("/").unwrap());
        assert!(inside.join("grub/grub.cfg").is_file());

        let binds: Vec<String> = backend
            .calls()
            .into_iter()
            .filter(|c| c.starts_with("bind"))
            .collect();
        assert_eq!(binds.len(), 3);
        for call in &binds {
            let target = call.split(' ').nth(2).unwrap();
            assert!(Path::new(target).starts_with(&root), "{}", call);
        }
        assert!(binds.contains(&format!("bind /dev {}", inside.join("dev").display())));
    }

    #[test]
    fn test_bind_target_resolving_to_root_rejected() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "boot/vmlinuz", b"k");
        std::os::unix::fs::symlink("/", dir.path().join("proc")).unwrap();

        let backend = Arc::new(FakeBackend::new());
        let tracker = ResourceTracker::new();
        let layout = DiskLayout::plan(&ConvertConfig::default(), 512 * MIB).unwrap();
        let err = Bootloader::new(backend.clone(), &ConvertConfig::default(), &layout)
            .install(&tracker, &device(), dir.path(), None)
            .unwrap_err();
        assert!(matches!(err, ConvertError::PathTraversal { .. }));
        assert!(backend.mounts().is_empty());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_resolv_conf_link_is_replaced_not_followed() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("root");
        let outside = dir.path().join("outside.conf");
        let host_conf = dir.path().join("host.conf");
        fs::write(&outside, b"nameserver 192.0.2.1\n").unwrap();
        fs::write(&host_conf, b"nameserver 10.0.0.53\n").unwrap();
        fs::create_dir_all(root.join("etc")).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("etc/resolv.conf")).unwrap();

        provide_resolv_conf_from(&root, &host_conf).unwrap();
        assert_eq!(fs::read(&outside).unwrap(), b"nameserver 192.0.2.1\n");
        let meta = fs::symlink_metadata(root.join("etc/resolv.conf")).unwrap();
        assert!(meta.is_file());
        assert_eq!(fs::read(root.join("etc/resolv.conf")).unwrap(), b"nameserver 10.0.0.53\n");
    }

    #[test]
    fn test_resolv_conf_inside_root_kept() {
        let dir = TempDir::new().unwrap();
        let host_conf = dir.path().join("host.conf");
        fs::write(&host_conf, b"nameserver 10.0.0.53\n").unwrap();
        let root = dir.path().join("root");
        write(&root, "run/resolv.conf", b"nameserver 127.0.0.53\n");
        fs::create_dir_all(root.join("etc")).unwrap();
        std::os::unix::fs::symlink("/run/resolv.conf", root.join("etc/resolv.conf")).unwrap();

        provide_resolv_conf_from(&root, &host_conf).unwrap();
        assert!(fs::symlink_metadata(root.join("etc/resolv.conf")).unwrap().file_type().is_symlink());
        assert_eq!(fs::read(root.join("run/resolv.conf")).unwrap(), b"nameserver 127.0.0.53\n");
    }

    #[test]
    fn test_resolv_conf_write_error_propagates() {
        let dir = TempDir::new().unwrap();
        let host_conf = dir.path().join("host.conf");
        fs::write(&host_conf, b"nameserver 10.0.0.53\n").unwrap();
        let root = dir.path().join("root");
        fs::create_dir_all(&root).unwrap();
        std::os::unix::fs::symlink("../../..", root.join("etc")).unwrap();

        let err = provide_resolv_conf_from(&root, &host_conf).unwrap_err();
        assert!(matches!(err, ConvertError::PathTraversal { .. }));
    }
}
