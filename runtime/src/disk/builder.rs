//! Disk image construction.
//!
//! ```text
//! Created ─▶ Partitioned ─▶ Formatted ─▶ Populated ─▶ Bootloaded ─▶ Finalized
//!    └────────────┴─────────────┴────────────┴─────────────┴──────▶ Failed
//! ```
//!
//! Every resource a step acquires is registered with the tracker before the
//! next step starts. A failed builder is never resumed; the owner unwinds the
//! tracker, which detaches, unmounts and deletes the `.partial` file.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dockboot_core::config::ConvertConfig;
use dockboot_core::error::{ConvertError, Result};
use dockboot_core::event::Phase;
use tokio_util::sync::CancellationToken;

use super::attach::BlockAttachment;
use super::backend::DiskBackend;
use super::bootloader::{self, BootConfig, Bootloader};
use super::layout::DiskLayout;
use super::mbr::PartitionTable;
use super::mount::MountSession;
use super::populate::{self, PopulateOptions, PopulateStats};
use crate::oci::layers::AssembledRoot;
use crate::tracker::{ResourceId, ResourceKind, ResourceTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Created,
    Partitioned,
    Formatted,
    Populated,
    Bootloaded,
    Finalized,
    Failed,
}

/// A finished disk image.
#[derive(Debug, Clone)]
pub struct DiskImage {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub layout: DiskLayout,
    pub boot: Option<BootConfig>,
}

/// Builds one disk image from an assembled root.
pub struct DiskImageBuilder {
    config: ConvertConfig,
    backend: Arc<dyn DiskBackend>,
    tracker: Arc<ResourceTracker>,
    layout: DiskLayout,
    output: PathBuf,
    partial: PathBuf,
    mount_dir: PathBuf,
    state: BuildState,
    cancel: Option<CancellationToken>,
    partial_id: Option<ResourceId>,
    attachment: Option<BlockAttachment>,
    root_mount: Option<MountSession>,
    boot_mount: Option<MountSession>,
    boot_config: Option<BootConfig>,
}

impl DiskImageBuilder {
    /// Plan the image and check that `root` fits.
    ///
    /// Fails with `InsufficientSpace` before anything is written.
    pub fn plan(
        config: &ConvertConfig,
        backend: Arc<dyn DiskBackend>,
        tracker: Arc<ResourceTracker>,
        root: &AssembledRoot,
        size_bytes: u64,
        output: &Path,
        mount_dir: &Path,
    ) -> Result<Self> {
        let layout = DiskLayout::plan(config, size_bytes)?;
        layout.check_capacity(root, config.filesystem_overhead_percent)?;
        backend.check(&layout)?;

        let file_name = output
            .file_name()
            .ok_or_else(|| ConvertError::Config(format!("Invalid output path {}", output.display())))?;
        let mut partial_name = file_name.to_os_string();
        partial_name.push(".partial");

        tracing::info!(
            output = %output.display(),
            size = layout.total_bytes,
            partitions = layout.partitions.len(),
            "Planned disk image"
        );

        Ok(Self {
            config: config.clone(),
            backend,
            tracker,
            layout,
            output: output.to_path_buf(),
            partial: output.with_file_name(partial_name),
            mount_dir: mount_dir.to_path_buf(),
            state: BuildState::Created,
            cancel: None,
            partial_id: None,
            attachment: None,
            root_mount: None,
            boot_mount: None,
            boot_config: None,
        })
    }

    /// Check `token` before each step and while populating.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn layout(&self) -> &DiskLayout {
        &self.layout
    }

    /// Path of the image while it is being built.
    pub fn partial_path(&self) -> &Path {
        &self.partial
    }

    /// Allocate the backing file and write the partition table.
    pub fn partition(&mut self) -> Result<()> {
        self.begin(BuildState::Created, Phase::Partition)?;
        let result = self.write_partition_table();
        self.settle(result, BuildState::Partitioned)
    }

    /// Attach the image and create a filesystem on every partition.
    pub fn format(&mut self) -> Result<()> {
        self.begin(BuildState::Partitioned, Phase::Format)?;
        let result = self.attach_and_format();
        self.settle(result, BuildState::Formatted)
    }

    /// Mount and copy the root filesystem in.
    pub fn populate(&mut self, root: &AssembledRoot) -> Result<PopulateStats> {
        self.begin(BuildState::Formatted, Phase::Populate)?;
        let result = self.mount_and_populate(root);
        self.settle(result, BuildState::Populated)
    }

    /// Install GRUB and its configuration.
    pub fn install_bootloader(&mut self) -> Result<BootConfig> {
        self.begin(BuildState::Populated, Phase::Bootloader)?;
        let result = self.run_bootloader();
        self.settle(result, BuildState::Bootloaded)
    }

    /// Unmount, detach and move the image to its final name.
    pub fn finalize(&mut self) -> Result<DiskImage> {
        self.begin(BuildState::Bootloaded, Phase::Finalize)?;
        let result = self.release_and_commit();
        self.settle(result, BuildState::Finalized)
    }

    fn begin(&mut self, expected: BuildState, phase: Phase) -> Result<()> {
        if self.state != expected {
            return Err(ConvertError::Internal(format!(
                "Cannot start {} from state {:?}",
                phase, self.state
            )));
        }
        if self.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            self.state = BuildState::Failed;
            return Err(ConvertError::Cancelled(phase));
        }
        tracing::debug!(phase = %phase, "Disk step");
        Ok(())
    }

    fn settle<T>(&mut self, result: Result<T>, next: BuildState) -> Result<T> {
        match result {
            Ok(value) => {
                self.state = next;
                Ok(value)
            }
            Err(e) => {
                self.state = BuildState::Failed;
                Err(e)
            }
        }
    }

    fn write_partition_table(&mut self) -> Result<()> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.partial)
            .map_err(|e| ConvertError::io(format!("creating {}", self.partial.display()), e))?;

        let path = self.partial.clone();
        let keep = self.config.preserve_failed_image;
        self.partial_id = Some(self.tracker.acquire(
            ResourceKind::PartialImage,
            path.display().to_string(),
            move || {
                if keep {
                    tracing::warn!(image = %path.display(), "Keeping incomplete image");
                    return Ok(());
                }
                match std::fs::remove_file(&path) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(ConvertError::io(format!("removing {}", path.display()), e)),
                }
            },
        ));

        // Fixed size from the start; never grown later.
        file.set_len(self.layout.total_bytes)
            .map_err(|e| ConvertError::io(format!("sizing {}", self.partial.display()), e))?;
        PartitionTable::from_layout(&self.layout)?.write_to(&mut file)?;
        file.sync_all()
            .map_err(|e| ConvertError::io(format!("syncing {}", self.partial.display()), e))?;

        tracing::info!(image = %self.partial.display(), "Wrote partition table");
        Ok(())
    }

    fn attach_and_format(&mut self) -> Result<()> {
        let attachment = BlockAttachment::acquire(
            &self.tracker,
            self.backend.clone(),
            &self.partial,
            self.layout.partitions.len(),
        )?;
        let device = attachment.device().clone();
        self.attachment = Some(attachment);

        for part in &self.layout.partitions {
            let node = device.partition(part.number)?;
            self.backend.format(node, part.filesystem, &part.label)?;
        }
        Ok(())
    }

    fn mount_and_populate(&mut self, root: &AssembledRoot) -> Result<PopulateStats> {
        let device = self.device()?.clone();

        let root_part = self.layout.root().clone();
        let root_dir = self.mount_dir.join("root");
        self.root_mount = Some(MountSession::mount(
            &self.tracker,
            self.backend.clone(),
            device.partition(root_part.number)?,
            &root_dir,
            root_part.filesystem,
        )?);

        let options = PopulateOptions {
            privileged: self.backend.privileged(),
            cancel: self.cancel.clone(),
        };
        let stats = populate::populate(root, &root_dir, &options)?;
        populate::write_fstab(&root_dir, &self.layout)?;

        if let Some(boot_part) = self.layout.boot().cloned() {
            let boot_dir = self.mount_dir.join("boot");
            self.boot_mount = Some(MountSession::mount(
                &self.tracker,
                self.backend.clone(),
                device.partition(boot_part.number)?,
                &boot_dir,
                boot_part.filesystem,
            )?);
            if let Some(kernel) = bootloader::discover_kernel(&root_dir) {
                bootloader::stage_boot_artifacts(&root_dir, &boot_dir, &kernel)?;
            }
        }
        Ok(stats)
    }

    fn run_bootloader(&mut self) -> Result<BootConfig> {
        let device = self.device()?.clone();
        let root_dir = self
            .root_mount
            .as_ref()
            .map(|m| m.target().to_path_buf())
            .ok_or_else(|| ConvertError::Internal("Root partition is not mounted".to_string()))?;
        let boot_dir = self.boot_mount.as_ref().map(|m| m.target().to_path_buf());

        let config = Bootloader::new(self.backend.clone(), &self.config, &self.layout).install(
            &self.tracker,
            &device,
            &root_dir,
            boot_dir.as_deref(),
        )?;
        self.boot_config = Some(config.clone());
        Ok(config)
    }

    fn release_and_commit(&mut self) -> Result<DiskImage> {
        // Mounts before the device they live on.
        if let Some(boot) = self.boot_mount.take() {
            boot.release(&self.tracker)?;
        }
        if let Some(root) = self.root_mount.take() {
            root.release(&self.tracker)?;
        }
        if let Some(attachment) = self.attachment.take() {
            attachment.release(&self.tracker)?;
        }

        File::open(&self.partial)
            .and_then(|f| f.sync_all())
            .map_err(|e| ConvertError::io(format!("syncing {}", self.partial.display()), e))?;
        std::fs::rename(&self.partial, &self.output).map_err(|e| {
            ConvertError::io(
                format!("renaming {} -> {}", self.partial.display(), self.output.display()),
                e,
            )
        })?;
        if let Some(id) = self.partial_id.take() {
            self.tracker.forget(id);
        }

        tracing::info!(image = %self.output.display(), size = self.layout.total_bytes, "Disk image finalized");
        Ok(DiskImage {
            path: self.output.clone(),
            size_bytes: self.layout.total_bytes,
            layout: self.layout.clone(),
            boot: self.boot_config.clone(),
        })
    }

    fn device(&self) -> Result<&super::backend::AttachedDevice> {
        self.attachment
            .as_ref()
            .map(BlockAttachment::device)
            .ok_or_else(|| ConvertError::Internal("Image is not attached".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::attach::AttachmentLock;
    use crate::disk::fake::{FakeBackend, Op};
    use crate::oci::layers::test_support::{tar_bytes, Item};
    use crate::oci::layers::LayerAssembler;
    use dockboot_core::error::ErrorKind;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    struct Fixture {
        dir: TempDir,
        root: AssembledRoot,
        backend: Arc<FakeBackend>,
        tracker: Arc<ResourceTracker>,
    }

    impl Fixture {
        fn new(backend: FakeBackend) -> Self {
            let dir = TempDir::new().unwrap();
            let mut asm = LayerAssembler::new(&dir.path().join("rootfs")).unwrap();
            asm.apply_layer(
                "base",
                &tar_bytes(&[
                    Item::File("bin/sh", b"#!/bin/sh"),
                    Item::File("etc/os-release", b"ID=alpine\nPRETTY_NAME=\"Alpine\"\n"),
                    Item::File("var/.wh.cache", b""),
                ])[..],
            )
            .unwrap();
            Self {
                root: asm.finish(),
                dir,
                backend: Arc::new(backend),
                tracker: Arc::new(ResourceTracker::new()),
            }
        }

        fn output(&self) -> PathBuf {
            self.dir.path().join("disk.img")
        }

        fn builder(&self, config: &ConvertConfig, size: u64) -> Result<DiskImageBuilder> {
            DiskImageBuilder::plan(
                config,
                self.backend.clone(),
                self.tracker.clone(),
                &self.root,
                size,
                &self.output(),
                &self.dir.path().join("mnt"),
            )
        }

        fn run(&self, builder: &mut DiskImageBuilder) -> Result<DiskImage> {
            builder.partition()?;
            builder.format()?;
            builder.populate(&self.root)?;
            builder.install_bootloader()?;
            builder.finalize()
        }

        fn assert_nothing_held(&self) {
            assert!(self.backend.mounts().is_empty(), "mounts: {:?}", self.backend.mounts());
            assert!(self.backend.attached().is_empty());
            assert!(self.tracker.active(ResourceKind::Mount).is_empty());
            assert!(self.tracker.active(ResourceKind::BlockAttachment).is_empty());
        }
    }

    #[test]
    fn test_end_to_end_512_mib() {
        let fx = Fixture::new(FakeBackend::new());
        let mut builder = fx.builder(&ConvertConfig::default(), 512 * MIB).unwrap();
        assert_eq!(builder.state(), BuildState::Created);

        let image = fx.run(&mut builder).unwrap();
        assert_eq!(builder.state(), BuildState::Finalized);
        assert_eq!(image.size_bytes, 512 * MIB);
        assert_eq!(std::fs::metadata(&image.path).unwrap().len(), 512 * MIB);
        assert!(!builder.partial_path().exists());

        let mut file = File::open(&image.path).unwrap();
        let table = PartitionTable::read_from(&mut file).unwrap();
        assert_eq!(table.entries.len(), 1);
        assert_eq!(table.bootable().count(), 1);
        assert_eq!(table.entries[0].partition_type, 0x83);

        let root = fx.dir.path().join("mnt/root");
        assert!(root.join("bin/sh").is_file());
        assert!(root.join("etc/fstab").is_file());
        assert!(root.join("boot/grub/grub.cfg").is_file());
        assert!(!root.join("var/cache").exists());

        fx.assert_nothing_held();
        assert!(fx.tracker.is_empty());
    }

    #[test]
    fn test_insufficient_space_before_any_disk_work() {
        let dir = TempDir::new().unwrap();
        let mut asm = LayerAssembler::new(&dir.path().join("rootfs")).unwrap();
        let big = vec![7u8; 8 * MIB as usize];
        asm.apply_layer("big", &tar_bytes(&[Item::File("blob", &big)])[..]).unwrap();
        let root = asm.finish();

        let backend = Arc::new(FakeBackend::new());
        let config = ConvertConfig {
            filesystem_overhead_percent: 99,
            ..Default::default()
        };
        let output = dir.path().join("disk.img");
        let err = DiskImageBuilder::plan(
            &config,
            backend.clone(),
            Arc::new(ResourceTracker::new()),
            &root,
            512 * MIB,
            &output,
            &dir.path().join("mnt"),
        )
        .err()
        .unwrap();

        assert!(matches!(err, ConvertError::InsufficientSpace { .. }));
        assert!(backend.calls().is_empty());
        assert!(!output.exists());
        assert!(!dir.path().join("disk.img.partial").exists());
    }

    #[test]
    fn test_failure_at_each_boundary_releases_everything() {
        for op in [Op::Attach, Op::Format, Op::Mount, Op::Run] {
            let fx = Fixture::new(FakeBackend::new());
            fx.backend.fail_on(op);
            let config = ConvertConfig {
                preserve_failed_image: true,
                ..Default::default()
            };
            let mut builder = fx.builder(&config, 512 * MIB).unwrap();

            assert!(fx.run(&mut builder).is_err(), "{:?} should fail", op);
            assert_eq!(builder.state(), BuildState::Failed);

            let errors = fx.tracker.release_all();
            assert!(errors.is_empty(), "{:?}: {:?}", op, errors);
            fx.assert_nothing_held();

            // Kept for debugging under the .partial name, and free to attach.
            let partial = builder.partial_path().to_path_buf();
            assert!(partial.exists());
            assert!(!fx.output().exists());
            AttachmentLock::acquire(&partial).unwrap();
        }
    }

    #[test]
    fn test_partition_failure_leaves_nothing() {
        let fx = Fixture::new(FakeBackend::new());
        let mut builder = fx.builder(&ConvertConfig::default(), 512 * MIB).unwrap();
        // Something that cannot be opened as a file sits at the partial path.
        std::fs::create_dir(builder.partial_path()).unwrap();

        let err = builder.partition().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InternalIOFailure);
        assert_eq!(builder.state(), BuildState::Failed);
        assert!(fx.tracker.is_empty());
        assert!(!fx.backend.calls().iter().any(|c| c.starts_with("attach")));
        assert!(!fx.output().exists());
        assert!(builder.format().is_err());
    }

    #[test]
    fn test_attach_exhaustion_is_reported_and_unwound() {
        let fx = Fixture::new(FakeBackend::new());
        fx.backend.fail_with(
            Op::Attach,
            ConvertError::ResourceExhausted("No free loop device".to_string()),
        );
        let mut builder = fx.builder(&ConvertConfig::default(), 512 * MIB).unwrap();
        builder.partition().unwrap();

        let err = builder.format().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(builder.state(), BuildState::Failed);
        assert_eq!(fx.tracker.active(ResourceKind::PartialImage).len(), 1);

        assert!(fx.tracker.release_all().is_empty());
        fx.assert_nothing_held();
        assert!(!builder.partial_path().exists());
        assert!(!fx.output().exists());
    }

    #[test]
    fn test_finalize_failures_unwind_in_reverse_order() {
        for op in [Op::Unmount, Op::Detach] {
            let fx = Fixture::new(FakeBackend::new());
            let mut builder = fx.builder(&ConvertConfig::default(), 512 * MIB).unwrap();
            builder.partition().unwrap();
            builder.format().unwrap();
            builder.populate(&fx.root).unwrap();
            builder.install_bootloader().unwrap();
            let before = fx.backend.calls().len();

            fx.backend.fail_on(op);
            let err = builder.finalize().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InternalIOFailure, "{:?}", op);
            assert_eq!(builder.state(), BuildState::Failed);

            let errors = fx.tracker.release_all();
            assert!(errors.is_empty(), "{:?}: {:?}", op, errors);
            assert!(fx.tracker.is_empty());

            // Root unmount is attempted before the device under it is detached.
            let calls = fx.backend.calls()[before..].to_vec();
            let unmount = calls.iter().position(|c| c.starts_with("unmount") && c.ends_with("mnt/root"));
            let detach = calls.iter().position(|c| c.starts_with("detach"));
            assert!(unmount.is_some() && detach.is_some(), "{:?}: {:?}", op, calls);
            assert!(unmount < detach, "{:?}: {:?}", op, calls);

            assert!(!fx.output().exists());
            assert!(!builder.partial_path().exists());
            if op == Op::Unmount {
                assert!(fx.backend.attached().is_empty());
            }
        }
    }

    #[test]
    fn test_failed_finalize_keeps_partial_when_asked() {
        let fx = Fixture::new(FakeBackend::new());
        let config = ConvertConfig {
            preserve_failed_image: true,
            ..Default::default()
        };
        let mut builder = fx.builder(&config, 512 * MIB).unwrap();
        builder.partition().unwrap();
        builder.format().unwrap();
        builder.populate(&fx.root).unwrap();
        builder.install_bootloader().unwrap();

        fx.backend.fail_on(Op::Detach);
        assert!(builder.finalize().is_err());
        assert!(fx.tracker.release_all().is_empty());

        let partial = builder.partial_path().to_path_buf();
        assert!(partial.exists());
        assert!(!fx.output().exists());
        AttachmentLock::acquire(&partial).unwrap();
    }

    #[test]
    fn test_failed_image_removed_by_default() {
        let fx = Fixture::new(FakeBackend::new());
        fx.backend.fail_on(Op::Format);
        let mut builder = fx.builder(&ConvertConfig::default(), 512 * MIB).unwrap();
        assert!(fx.run(&mut builder).is_err());

        fx.tracker.release_all();
        assert!(!builder.partial_path().exists());
        assert!(!fx.output().exists());
    }

    #[test]
    fn test_cancel_mid_populate() {
        let fx = Fixture::new(FakeBackend::new());
        let token = CancellationToken::new();
        let mut builder = fx
            .builder(&ConvertConfig::default(), 512 * MIB)
            .unwrap()
            .with_cancellation(token.clone());

        builder.partition().unwrap();
        builder.format().unwrap();
        token.cancel();
        let err = builder.populate(&fx.root).unwrap_err();
        assert!(matches!(err, ConvertError::Cancelled(Phase::Populate)));

        fx.tracker.release_all();
        fx.assert_nothing_held();
        assert!(!builder.partial_path().exists());
        assert!(!fx.output().exists());
    }

    #[test]
    fn test_steps_must_run_in_order() {
        let fx = Fixture::new(FakeBackend::new());
        let mut builder = fx.builder(&ConvertConfig::default(), 512 * MIB).unwrap();
        let err = builder.format().unwrap_err();
        assert!(matches!(err, ConvertError::Internal(_)));
        assert_eq!(builder.state(), BuildState::Created);
    }

    #[test]
    fn test_capability_check_runs_at_plan() {
        let fx = Fixture::new(FakeBackend::new());
        fx.backend.fail_on(Op::Check);
        assert!(fx.builder(&ConvertConfig::default(), 512 * MIB).is_err());
        assert!(!fx.dir.path().join("disk.img.partial").exists());
    }
}
