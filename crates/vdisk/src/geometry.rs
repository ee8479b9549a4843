use std::fmt;

use serde::{Deserialize, Serialize};

use crate::SECTOR_SIZE;

const TWO_GIB: u64 = 2 * 1024 * 1024 * 1024;

// BIOS INT 13h can address at most 1024 cylinders.
const BIOS_MAX_CYLINDERS: u64 = 1024;
const BIOS_SECTORS_PER_TRACK: u32 = 63;

/// Cylinder/head/sector layout of a disk.
///
/// Geometry is a plain value: disks and descriptors hold a copy, so it cannot change once
/// attached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Geometry {
    cylinders: u32,
    heads: u32,
    sectors_per_track: u32,
    bytes_per_sector: u32,
}

/// A CHS address as stored in an MBR partition entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChsAddress {
    pub cylinder: u32,
    pub head: u32,
    pub sector: u32,
}

impl Geometry {
    pub fn new(cylinders: u32, heads: u32, sectors_per_track: u32) -> Self {
        Self {
            cylinders,
            heads,
            sectors_per_track,
            bytes_per_sector: SECTOR_SIZE as u32,
        }
    }

    pub fn with_bytes_per_sector(self, bytes_per_sector: u32) -> Self {
        Self {
            bytes_per_sector,
            ..self
        }
    }

    /// Default geometry for a disk of `capacity` bytes.
    ///
    /// Disks under 2 GiB use 64 heads and 32 sectors per track, larger disks 255/63. The cylinder
    /// count is the number of whole cylinders that fit and saturates at `u32::MAX`.
    pub fn from_capacity(capacity: u64) -> Self {
        let (heads, sectors) = if capacity < TWO_GIB {
            (64u32, 32u32)
        } else {
            (255u32, 63u32)
        };
        let cylinder_bytes = u64::from(heads) * u64::from(sectors) * SECTOR_SIZE as u64;
        Self::new(saturate_u32(capacity / cylinder_bytes), heads, sectors)
    }

    /// LBA-assisted translation used by BIOSes for disks of `capacity` bytes.
    pub fn lba_assisted_bios(capacity: u64) -> Self {
        let total_sectors = capacity / SECTOR_SIZE as u64;
        let spt = u64::from(BIOS_SECTORS_PER_TRACK);
        let heads: u32 = [16u32, 32, 64, 128]
            .into_iter()
            .find(|&h| total_sectors <= BIOS_MAX_CYLINDERS * u64::from(h) * spt)
            .unwrap_or(255);
        let cylinders = (total_sectors / (u64::from(heads) * spt)).min(BIOS_MAX_CYLINDERS);
        Self::new(cylinders as u32, heads, BIOS_SECTORS_PER_TRACK)
    }

    pub fn cylinders(&self) -> u32 {
        self.cylinders
    }

    pub fn heads(&self) -> u32 {
        self.heads
    }

    pub fn sectors_per_track(&self) -> u32 {
        self.sectors_per_track
    }

    pub fn bytes_per_sector(&self) -> u32 {
        self.bytes_per_sector
    }

    pub fn total_sectors(&self) -> u64 {
        u64::from(self.cylinders) * u64::from(self.heads) * u64::from(self.sectors_per_track)
    }

    /// Addressable bytes described by the geometry (may be less than the disk capacity).
    pub fn capacity(&self) -> u64 {
        self.total_sectors() * u64::from(self.bytes_per_sector)
    }

    /// Converts a logical block address into CHS, clamping to the largest encodable address.
    pub fn to_chs(&self, lba: u64) -> ChsAddress {
        if self.heads == 0 || self.sectors_per_track == 0 {
            return ChsAddress {
                cylinder: 0,
                head: 0,
                sector: 0,
            };
        }

        let spt = u64::from(self.sectors_per_track);
        let heads = u64::from(self.heads);
        let cylinder = lba / (heads * spt);
        if cylinder > 1023 {
            return ChsAddress {
                cylinder: 1023,
                head: self.heads.min(256) - 1,
                sector: self.sectors_per_track.min(63),
            };
        }
        ChsAddress {
            cylinder: cylinder as u32,
            head: ((lba / spt) % heads) as u32,
            sector: (lba % spt) as u32 + 1,
        }
    }
}

impl ChsAddress {
    /// Packs the address into the three-byte MBR representation.
    pub fn to_mbr_bytes(self) -> [u8; 3] {
        [
            self.head as u8,
            (((self.cylinder >> 2) & 0xc0) as u8) | (self.sector as u8 & 0x3f),
            self.cylinder as u8,
        ]
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}/{}/{}:{})",
            self.cylinders, self.heads, self.sectors_per_track, self.bytes_per_sector
        )
    }
}

fn saturate_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
