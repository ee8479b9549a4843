use std::sync::Arc;

use serde::Serialize;

use crate::util::sectors_to_bytes;
use crate::{
    read_fully_at, write_fully_at, DiskError, Geometry, Result, SharedStream, Stream, SubStream,
    SECTOR_SIZE,
};

const MBR_DISK_SIGNATURE_OFFSET: usize = 440;
const MBR_TABLE_OFFSET: usize = 446;
const MBR_ENTRY_SIZE: usize = 16;
const MBR_ENTRY_COUNT: usize = 4;
const MBR_BOOT_SIGNATURE: [u8; 2] = [0x55, 0xaa];

/// Well-known MBR partition type bytes.
pub mod partition_type {
    pub const EMPTY: u8 = 0x00;
    pub const FAT16: u8 = 0x06;
    pub const NTFS: u8 = 0x07;
    pub const FAT32_LBA: u8 = 0x0c;
    pub const LINUX: u8 = 0x83;
    pub const GPT_PROTECTIVE: u8 = 0xee;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionInfo {
    /// Slot in the table (0-based).
    pub index: usize,
    pub bootable: bool,
    pub partition_type: u8,
    pub first_sector: u64,
    pub sector_count: u64,
}

impl PartitionInfo {
    pub fn last_sector(&self) -> u64 {
        (self.first_sector + self.sector_count).saturating_sub(1)
    }

    fn overlaps(&self, first_sector: u64, sector_count: u64) -> bool {
        first_sector < self.first_sector + self.sector_count
            && self.first_sector < first_sector + sector_count
    }
}

/// A partition-table view over a disk's content stream.
pub trait PartitionTable {
    fn partitions(&self) -> &[PartitionInfo];

    /// Opens partition `index` as a window over the disk content.
    fn open(&self, index: usize) -> Result<SubStream>;
}

/// Classic MBR partition table (primary entries only).
pub struct BiosPartitionTable {
    content: SharedStream,
    geometry: Geometry,
    disk_signature: u32,
    entries: Vec<PartitionInfo>,
}

impl BiosPartitionTable {
    /// Parses the MBR currently stored in sector 0 of `content`.
    pub fn open(content: SharedStream, geometry: Geometry) -> Result<Self> {
        let sector = read_mbr(&content)?;
        if sector[510..512] != MBR_BOOT_SIGNATURE {
            return Err(DiskError::CorruptImage("missing MBR boot signature"));
        }
        Ok(Self {
            disk_signature: le_u32_at(&sector, MBR_DISK_SIGNATURE_OFFSET),
            entries: parse_entries(&sector),
            content,
            geometry,
        })
    }

    /// Returns true when sector 0 carries an MBR boot signature.
    pub fn is_valid(content: &SharedStream) -> bool {
        read_mbr(content)
            .map(|sector| sector[510..512] == MBR_BOOT_SIGNATURE)
            .unwrap_or(false)
    }

    /// Writes an empty MBR to sector 0 and returns the (empty) table.
    pub fn initialize(content: SharedStream, geometry: Geometry, disk_signature: u32) -> Result<Self> {
        let mut sector = [0u8; SECTOR_SIZE];
        sector[MBR_DISK_SIGNATURE_OFFSET..MBR_DISK_SIGNATURE_OFFSET + 4]
            .copy_from_slice(&disk_signature.to_le_bytes());
        sector[510..512].copy_from_slice(&MBR_BOOT_SIGNATURE);
        write_fully_at(&content, 0, &sector)?;
        Ok(Self {
            content,
            geometry,
            disk_signature,
            entries: Vec::new(),
        })
    }

    pub fn disk_signature(&self) -> u32 {
        self.disk_signature
    }

    /// Adds a primary partition and returns its slot index.
    pub fn create(
        &mut self,
        first_sector: u64,
        sector_count: u64,
        partition_type: u8,
        bootable: bool,
    ) -> Result<usize> {
        if first_sector == 0 {
            return Err(DiskError::InvalidArgument(
                "partition may not overlap the MBR sector".into(),
            ));
        }
        if sector_count == 0 || partition_type == partition_type::EMPTY {
            return Err(DiskError::InvalidArgument(
                "partition needs a size and a non-empty type".into(),
            ));
        }
        let start = u32::try_from(first_sector)
            .map_err(|_| DiskError::InvalidArgument("partition start exceeds MBR range".into()))?;
        let count = u32::try_from(sector_count)
            .map_err(|_| DiskError::InvalidArgument("partition size exceeds MBR range".into()))?;

        let end = first_sector
            .checked_add(sector_count)
            .ok_or(DiskError::OffsetOverflow)?;
        let capacity = crate::lock(&self.content).len()?;
        if sectors_to_bytes(end)? > capacity {
            return Err(DiskError::OutOfRange("partition extends beyond end of disk"));
        }
        if self
            .entries
            .iter()
            .any(|p| p.overlaps(first_sector, sector_count))
        {
            return Err(DiskError::InvalidArgument(
                "partition overlaps an existing partition".into(),
            ));
        }

        let used: Vec<usize> = self.entries.iter().map(|p| p.index).collect();
        let index = (0..MBR_ENTRY_COUNT)
            .find(|i| !used.contains(i))
            .ok_or_else(|| DiskError::InvalidState("partition table is full".into()))?;

        let mut entry = [0u8; MBR_ENTRY_SIZE];
        entry[0] = if bootable { 0x80 } else { 0x00 };
        entry[1..4].copy_from_slice(&self.geometry.to_chs(first_sector).to_mbr_bytes());
        entry[4] = partition_type;
        entry[5..8].copy_from_slice(&self.geometry.to_chs(end - 1).to_mbr_bytes());
        entry[8..12].copy_from_slice(&start.to_le_bytes());
        entry[12..16].copy_from_slice(&count.to_le_bytes());

        let offset = (MBR_TABLE_OFFSET + index * MBR_ENTRY_SIZE) as u64;
        write_fully_at(&self.content, offset, &entry)?;

        self.entries.push(PartitionInfo {
            index,
            bootable,
            partition_type,
            first_sector,
            sector_count,
        });
        self.entries.sort_by_key(|p| p.index);
        Ok(index)
    }
}

impl PartitionTable for BiosPartitionTable {
    fn partitions(&self) -> &[PartitionInfo] {
        &self.entries
    }

    fn open(&self, index: usize) -> Result<SubStream> {
        let info = self
            .entries
            .iter()
            .find(|p| p.index == index)
            .ok_or_else(|| DiskError::ResourceNotFound(format!("partition {index}")))?;
        SubStream::new(
            Arc::clone(&self.content),
            sectors_to_bytes(info.first_sector)?,
            sectors_to_bytes(info.sector_count)?,
        )
    }
}

fn read_mbr(content: &SharedStream) -> Result<[u8; SECTOR_SIZE]> {
    let mut sector = [0u8; SECTOR_SIZE];
    read_fully_at(content, 0, &mut sector)?;
    Ok(sector)
}

fn parse_entries(sector: &[u8; SECTOR_SIZE]) -> Vec<PartitionInfo> {
    (0..MBR_ENTRY_COUNT)
        .filter_map(|index| {
            let raw = &sector[MBR_TABLE_OFFSET + index * MBR_ENTRY_SIZE..][..MBR_ENTRY_SIZE];
            let partition_type = raw[4];
            if partition_type == partition_type::EMPTY {
                return None;
            }
            Some(PartitionInfo {
                index,
                bootable: raw[0] & 0x80 != 0,
                partition_type,
                first_sector: u64::from(le_u32_at(raw, 8)),
                sector_count: u64::from(le_u32_at(raw, 12)),
            })
        })
        .collect()
}

fn le_u32_at(bytes: &[u8], offset: usize) -> u32 {
    crate::util::le_u32(&bytes[offset..offset + 4])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{lock, shared, BackendStream, MemBackend};

    fn blank_disk(sectors: u64) -> SharedStream {
        shared(BackendStream::new(
            MemBackend::with_len(sectors * SECTOR_SIZE as u64).unwrap(),
        ))
    }

    #[test]
    fn blank_disk_has_no_table() {
        let content = blank_disk(64);
        assert!(!BiosPartitionTable::is_valid(&content));
        assert!(matches!(
            BiosPartitionTable::open(content, Geometry::from_capacity(64 * 512)).err(),
            Some(DiskError::CorruptImage(_))
        ));
    }

    #[test]
    fn created_partitions_are_visible_to_a_fresh_open() {
        let content = blank_disk(2048);
        let geometry = Geometry::from_capacity(2048 * 512);
        let mut table =
            BiosPartitionTable::initialize(Arc::clone(&content), geometry, 0x1234_5678).unwrap();
        let idx = table
            .create(63, 1000, partition_type::LINUX, true)
            .unwrap();
        assert_eq!(idx, 0);

        let reopened = BiosPartitionTable::open(Arc::clone(&content), geometry).unwrap();
        assert_eq!(reopened.disk_signature(), 0x1234_5678);
        assert_eq!(
            reopened.partitions(),
            &[PartitionInfo {
                index: 0,
                bootable: true,
                partition_type: partition_type::LINUX,
                first_sector: 63,
                sector_count: 1000,
            }]
        );
        assert_eq!(reopened.partitions()[0].last_sector(), 1062);
    }

    #[test]
    fn create_rejects_overlap_and_out_of_range() {
        let content = blank_disk(2048);
        let geometry = Geometry::from_capacity(2048 * 512);
        let mut table = BiosPartitionTable::initialize(content, geometry, 0).unwrap();
        table.create(100, 100, partition_type::FAT32_LBA, false).unwrap();

        assert!(matches!(
            table.create(150, 10, partition_type::NTFS, false).unwrap_err(),
            DiskError::InvalidArgument(_)
        ));
        assert!(matches!(
            table.create(2000, 100, partition_type::NTFS, false).unwrap_err(),
            DiskError::OutOfRange(_)
        ));
        assert!(matches!(
            table.create(0, 10, partition_type::NTFS, false).unwrap_err(),
            DiskError::InvalidArgument(_)
        ));
    }

    #[test]
    fn open_partition_is_a_window_over_the_content() {
        let content = blank_disk(256);
        let geometry = Geometry::from_capacity(256 * 512);
        let mut table = BiosPartitionTable::initialize(Arc::clone(&content), geometry, 0).unwrap();
        table.create(8, 16, partition_type::LINUX, false).unwrap();

        let mut part = table.open(0).unwrap();
        assert_eq!(part.len().unwrap(), 16 * 512);
        part.write(b"inside").unwrap();

        let mut check = [0u8; 6];
        read_fully_at(&content, 8 * 512, &mut check).unwrap();
        assert_eq!(&check, b"inside");
        assert_eq!(lock(&content).position(), 0);

        assert!(matches!(
            table.open(3).err(),
            Some(DiskError::ResourceNotFound(_))
        ));
    }
}
