//! Partition planning and capacity checks.

use dockboot_core::config::{ConvertConfig, Partitioning};
use dockboot_core::error::{ConvertError, Result};

use crate::oci::layers::{AssembledRoot, EntryKind};

/// Logical sector size of the produced image.
pub const SECTOR_SIZE: u64 = 512;

/// Partition start alignment (1 MiB).
pub const ALIGNMENT: u64 = 1024 * 1024;

/// Filesystem block size assumed by the capacity estimate.
pub const FS_BLOCK_SIZE: u64 = 4096;

/// Smallest root partition worth formatting.
const MIN_ROOT_BYTES: u64 = 64 * 1024 * 1024;

/// MBR addresses at most 2^32 sectors.
const MAX_MBR_SECTORS: u64 = u32::MAX as u64;

/// Filesystem placed on a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilesystemKind {
    Ext4,
    Vfat,
}

impl FilesystemKind {
    /// MBR partition type byte.
    pub fn partition_type(&self) -> u8 {
        match self {
            FilesystemKind::Ext4 => 0x83,
            FilesystemKind::Vfat => 0x0c,
        }
    }

    /// Filesystem type as passed to mount(2).
    pub fn mount_type(&self) -> &'static str {
        match self {
            FilesystemKind::Ext4 => "ext4",
            FilesystemKind::Vfat => "vfat",
        }
    }

    /// GRUB module needed to read the filesystem.
    pub fn grub_module(&self) -> &'static str {
        match self {
            FilesystemKind::Ext4 => "ext2",
            FilesystemKind::Vfat => "fat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionRole {
    Boot,
    Root,
}

/// One planned partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    /// 1-based partition number as the kernel names it.
    pub number: u32,
    pub role: PartitionRole,
    pub filesystem: FilesystemKind,
    pub start_sector: u64,
    pub sectors: u64,
    pub bootable: bool,
    pub label: String,
}

impl PartitionSpec {
    pub fn offset_bytes(&self) -> u64 {
        self.start_sector * SECTOR_SIZE
    }

    pub fn size_bytes(&self) -> u64 {
        self.sectors * SECTOR_SIZE
    }

    pub fn end_sector(&self) -> u64 {
        self.start_sector + self.sectors
    }
}

/// Full geometry of one disk image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskLayout {
    pub total_bytes: u64,
    pub partitions: Vec<PartitionSpec>,
}

impl DiskLayout {
    /// Plan the disk for `requested_bytes`, rounded up to whole sectors.
    pub fn plan(config: &ConvertConfig, requested_bytes: u64) -> Result<Self> {
        let total_bytes = round_to_sectors(requested_bytes);
        config.check_disk_size(total_bytes)?;

        let total_sectors = total_bytes / SECTOR_SIZE;
        if total_sectors > MAX_MBR_SECTORS {
            return Err(ConvertError::Config(format!(
                "Disk size {} bytes exceeds the MBR limit",
                total_bytes
            )));
        }

        let align = ALIGNMENT / SECTOR_SIZE;
        let mut partitions = Vec::new();
        let mut next = align;

        if let Partitioning::SeparateBoot { boot_size_bytes } = config.partitioning {
            let sectors = align_up(boot_size_bytes, ALIGNMENT) / SECTOR_SIZE;
            partitions.push(PartitionSpec {
                number: 1,
                role: PartitionRole::Boot,
                filesystem: FilesystemKind::Vfat,
                start_sector: next,
                sectors,
                bootable: true,
                label: config.boot_label.clone(),
            });
            next += sectors;
        }

        if next >= total_sectors || (total_sectors - next) * SECTOR_SIZE < MIN_ROOT_BYTES {
            return Err(ConvertError::Config(format!(
                "Disk size {} bytes leaves no room for a root partition",
                total_bytes
            )));
        }
        let separate_boot = !partitions.is_empty();
        partitions.push(PartitionSpec {
            number: partitions.len() as u32 + 1,
            role: PartitionRole::Root,
            filesystem: FilesystemKind::Ext4,
            start_sector: next,
            sectors: total_sectors - next,
            bootable: !separate_boot,
            label: config.root_label.clone(),
        });

        Ok(Self {
            total_bytes,
            partitions,
        })
    }

    pub fn root(&self) -> &PartitionSpec {
        // plan() always adds the root partition last
        &self.partitions[self.partitions.len() - 1]
    }

    pub fn boot(&self) -> Option<&PartitionSpec> {
        self.partitions.iter().find(|p| p.role == PartitionRole::Boot)
    }

    /// Partition holding kernel and bootloader files.
    pub fn boot_capable(&self) -> &PartitionSpec {
        self.boot().unwrap_or_else(|| self.root())
    }

    /// Bytes of the root partition usable for content.
    pub fn root_capacity(&self, overhead_percent: u8) -> u64 {
        let size = self.root().size_bytes();
        size - size / 100 * overhead_percent as u64
    }

    /// Fail with `InsufficientSpace` if `root` cannot fit.
    pub fn check_capacity(&self, root: &AssembledRoot, overhead_percent: u8) -> Result<()> {
        let required = required_bytes(root);
        let available = self.root_capacity(overhead_percent);
        tracing::debug!(required, available, "Checked root partition capacity");
        if required > available {
            return Err(ConvertError::InsufficientSpace {
                required,
                available,
            });
        }
        Ok(())
    }
}

/// Round up to the next sector boundary.
pub fn round_to_sectors(bytes: u64) -> u64 {
    align_up(bytes, SECTOR_SIZE)
}

fn align_up(value: u64, align: u64) -> u64 {
    value.div_ceil(align) * align
}

/// Space the tree needs on the root filesystem.
///
/// File content rounds up to whole blocks; every directory, symlink and
/// device node costs one block. Hardlinks share their target's blocks.
pub fn required_bytes(root: &AssembledRoot) -> u64 {
    root.entries()
        .values()
        .map(|entry| match entry.kind {
            EntryKind::File => align_up(entry.size, FS_BLOCK_SIZE),
            EntryKind::Hardlink { .. } => 0,
            _ => FS_BLOCK_SIZE,
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::layers::test_support::{tar_bytes, Item};
    use crate::oci::layers::LayerAssembler;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_single_root_layout() {
        let layout = DiskLayout::plan(&ConvertConfig::default(), 512 * MIB).unwrap();
        assert_eq!(layout.total_bytes, 512 * MIB);
        assert_eq!(layout.partitions.len(), 1);

        let root = layout.root();
        assert_eq!(root.number, 1);
        assert_eq!(root.start_sector, 2048);
        assert_eq!(root.end_sector(), 512 * MIB / SECTOR_SIZE);
        assert!(root.bootable);
        assert_eq!(root.filesystem.partition_type(), 0x83);
        assert!(layout.boot().is_none());
        assert_eq!(layout.boot_capable(), root);
    }

    #[test]
    fn test_separate_boot_layout() {
        let config = ConvertConfig {
            partitioning: Partitioning::SeparateBoot {
                boot_size_bytes: 100 * MIB + 1,
            },
            ..Default::default()
        };
        let layout = DiskLayout::plan(&config, 1024 * MIB).unwrap();
        assert_eq!(layout.partitions.len(), 2);

        let boot = layout.boot().unwrap();
        assert_eq!(boot.number, 1);
        assert_eq!(boot.size_bytes(), 101 * MIB);
        assert!(boot.bootable);
        assert_eq!(boot.filesystem, FilesystemKind::Vfat);

        let root = layout.root();
        assert_eq!(root.number, 2);
        assert_eq!(root.start_sector, boot.end_sector());
        assert_eq!(root.offset_bytes() % ALIGNMENT, 0);
        assert!(!root.bootable);
        assert_eq!(layout.boot_capable().role, PartitionRole::Boot);
    }

    #[test]
    fn test_size_rounds_to_sector() {
        let layout = DiskLayout::plan(&ConvertConfig::default(), 512 * MIB + 1).unwrap();
        assert_eq!(layout.total_bytes, 512 * MIB + 512);
        assert_eq!(round_to_sectors(0), 0);
        assert_eq!(round_to_sectors(512), 512);
        assert_eq!(round_to_sectors(513), 1024);
    }

    #[test]
    fn test_size_out_of_range() {
        let config = ConvertConfig::default();
        assert!(matches!(
            DiskLayout::plan(&config, 100 * MIB),
            Err(ConvertError::Config(_))
        ));
        assert!(matches!(
            DiskLayout::plan(&config, 65 * 1024 * MIB),
            Err(ConvertError::Config(_))
        ));
    }

    #[test]
    fn test_capacity_check() {
        let dir = TempDir::new().unwrap();
        let mut asm = LayerAssembler::new(&dir.path().join("rootfs")).unwrap();
        let big = vec![0u8; 3 * 4096 + 1];
        asm.apply_layer(
            "l",
            &tar_bytes(&[
                Item::File("bin/big", &big),
                Item::Hardlink("bin/big2", "bin/big"),
                Item::Symlink("bin/link", "big"),
            ])[..],
        )
        .unwrap();
        let root = asm.finish();
        // bin/ + 4 blocks of content + symlink
        assert_eq!(required_bytes(&root), 6 * 4096);

        let layout = DiskLayout::plan(&ConvertConfig::default(), 512 * MIB).unwrap();
        layout.check_capacity(&root, 8).unwrap();

        let tiny = DiskLayout {
            total_bytes: 2 * MIB,
            partitions: vec![PartitionSpec {
                number: 1,
                role: PartitionRole::Root,
                filesystem: FilesystemKind::Ext4,
                start_sector: 2048,
                sectors: 8,
                bootable: true,
                label: "rootfs".to_string(),
            }],
        };
        let err = tiny.check_capacity(&root, 0).unwrap_err();
        assert!(matches!(
            err,
            ConvertError::InsufficientSpace {
                required: 24576,
                available: 4096
            }
        ));
    }

    #[test]
    fn test_overhead_reduces_capacity() {
        let layout = DiskLayout::plan(&ConvertConfig::default(), 512 * MIB).unwrap();
        let full = layout.root_capacity(0);
        assert_eq!(full, 511 * MIB);
        assert!(layout.root_capacity(8) < full);
    }
}
