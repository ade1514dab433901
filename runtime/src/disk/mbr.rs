//! MBR ("msdos") partition table.

use std::io::{Read, Seek, SeekFrom, Write};

use dockboot_core::error::{ConvertError, Result};

use super::layout::DiskLayout;

const SIGNATURE_OFFSET: usize = 510;
const TABLE_OFFSET: usize = 446;
const DISK_SIGNATURE_OFFSET: usize = 440;
const ENTRY_SIZE: usize = 16;
const MAX_PRIMARY: usize = 4;

/// CHS value meaning "use LBA".
const CHS_LBA_ONLY: [u8; 3] = [0xfe, 0xff, 0xff];

/// One primary partition entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionEntry {
    pub bootable: bool,
    pub partition_type: u8,
    pub start_lba: u32,
    pub sectors: u32,
}

/// Primary partition table of sector 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionTable {
    pub disk_signature: u32,
    pub entries: Vec<PartitionEntry>,
}

impl PartitionTable {
    /// Table for `layout` with a random disk signature.
    pub fn from_layout(layout: &DiskLayout) -> Result<Self> {
        if layout.partitions.len() > MAX_PRIMARY {
            return Err(ConvertError::Internal(format!(
                "{} partitions do not fit in an MBR",
                layout.partitions.len()
            )));
        }
        let entries = layout
            .partitions
            .iter()
            .map(|p| {
                Ok(PartitionEntry {
                    bootable: p.bootable,
                    partition_type: p.filesystem.partition_type(),
                    start_lba: to_u32(p.start_sector)?,
                    sectors: to_u32(p.sectors)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            disk_signature: rand::random::<u32>() | 1,
            entries,
        })
    }

    /// Encode as a full boot sector with empty boot code.
    pub fn to_bytes(&self) -> [u8; 512] {
        let mut sector = [0u8; 512];
        sector[DISK_SIGNATURE_OFFSET..DISK_SIGNATURE_OFFSET + 4]
            .copy_from_slice(&self.disk_signature.to_le_bytes());

        for (i, entry) in self.entries.iter().take(MAX_PRIMARY).enumerate() {
            let off = TABLE_OFFSET + i * ENTRY_SIZE;
            let raw = &mut sector[off..off + ENTRY_SIZE];
            raw[0] = if entry.bootable { 0x80 } else { 0x00 };
            raw[1..4].copy_from_slice(&CHS_LBA_ONLY);
            raw[4] = entry.partition_type;
            raw[5..8].copy_from_slice(&CHS_LBA_ONLY);
            raw[8..12].copy_from_slice(&entry.start_lba.to_le_bytes());
            raw[12..16].copy_from_slice(&entry.sectors.to_le_bytes());
        }

        sector[SIGNATURE_OFFSET] = 0x55;
        sector[SIGNATURE_OFFSET + 1] = 0xaa;
        sector
    }

    /// Decode sector 0. Fails if the 0x55AA signature is missing.
    pub fn parse(sector: &[u8; 512]) -> Result<Self> {
        if sector[SIGNATURE_OFFSET] != 0x55 || sector[SIGNATURE_OFFSET + 1] != 0xaa {
            return Err(ConvertError::Internal(
                "No MBR signature in sector 0".to_string(),
            ));
        }
        let mut signature = [0u8; 4];
        signature.copy_from_slice(&sector[DISK_SIGNATURE_OFFSET..DISK_SIGNATURE_OFFSET + 4]);

        let mut entries = Vec::new();
        for i in 0..MAX_PRIMARY {
            let off = TABLE_OFFSET + i * ENTRY_SIZE;
            let raw = &sector[off..off + ENTRY_SIZE];
            if raw[4] == 0 {
                continue;
            }
            entries.push(PartitionEntry {
                bootable: raw[0] == 0x80,
                partition_type: raw[4],
                start_lba: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
                sectors: u32::from_le_bytes([raw[12], raw[13], raw[14], raw[15]]),
            });
        }

        Ok(Self {
            disk_signature: u32::from_le_bytes(signature),
            entries,
        })
    }

    /// Write the table into sector 0, keeping the rest of the device intact.
    pub fn write_to<W: Write + Seek>(&self, device: &mut W) -> Result<()> {
        device
            .seek(SeekFrom::Start(0))
            .and_then(|_| device.write_all(&self.to_bytes()))
            .and_then(|_| device.flush())
            .map_err(|e| ConvertError::io("writing partition table", e))
    }

    pub fn read_from<R: Read + Seek>(device: &mut R) -> Result<Self> {
        let mut sector = [0u8; 512];
        device
            .seek(SeekFrom::Start(0))
            .and_then(|_| device.read_exact(&mut sector))
            .map_err(|e| ConvertError::io("reading partition table", e))?;
        Self::parse(&sector)
    }

    pub fn bootable(&self) -> impl Iterator<Item = &PartitionEntry> {
        self.entries.iter().filter(|e| e.bootable)
    }
}

fn to_u32(value: u64) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| ConvertError::Internal(format!("Sector {} beyond MBR range", value)))
}
