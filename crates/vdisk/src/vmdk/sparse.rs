//! VMFS sparse ("COWD") extents.
//!
//! File layout (all integers little-endian, offsets in 512-byte sectors):
//!
//! ```text
//! sector 0..4   header (magic "COWD", version 1, flags, capacity, grain size,
//!               grain directory offset, directory entries, next free sector)
//! sector 4..    grain directory: one u32 per grain table, 0 when the table is absent
//! ...           grain tables: 4096 u32 entries each, 0 when the grain is unallocated
//! ...           grain data, in ascending grain order
//! ```
//!
//! Only grains that contain a non-zero byte are stored. The encoder emits a
//! [`CompositeStream`] whose data regions are windows over the content stream, so
//! producing the extent never buffers more than the metadata.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use super::ExtentType;
use crate::builder::StreamBuilder;
use crate::stream::{read_exact, resolve_seek, seek_base};
use crate::util::{div_ceil_u64, is_all_zero, le_u32, sectors_to_bytes};
use crate::{
    lock, read_fully_at, CompositeStream, DiskError, Region, Result, SeekOrigin, SharedStream,
    Stream, SubStream, SECTOR_SIZE,
};

pub const COWD_MAGIC: u32 = 0x4457_4f43;
const COWD_VERSION: u32 = 1;
const COWD_FLAGS: u32 = 3;
const HEADER_SECTORS: u64 = 4;
const HEADER_BYTES: usize = HEADER_SECTORS as usize * SECTOR_SIZE;

/// Entries per grain table.
pub const GRAIN_TABLE_ENTRIES: u64 = 4096;
const GRAIN_TABLE_SECTORS: u64 = GRAIN_TABLE_ENTRIES * 4 / SECTOR_SIZE as u64;

const DEFAULT_GRAIN_SECTORS: u32 = 1;
const SCAN_CHUNK_BYTES: u64 = 1024 * 1024; // 1 MiB
/// Largest grain the encoder accepts; one grain always fits in a scan chunk.
pub const MAX_GRAIN_SECTORS: u32 = (SCAN_CHUNK_BYTES / SECTOR_SIZE as u64) as u32;
const GT_CACHE_TABLES: usize = 16;
// A 32-bit sector count needs at most 4 MiB of directory; anything larger is corrupt.
const MAX_GD_BYTES: u64 = 4 * 1024 * 1024;

/// Turns a content stream into the file of a sparse extent.
///
/// Implementations differ in on-disk layout; the image builder only relies on this contract.
pub trait SparseExtentEncoder: Send + Sync {
    /// Extent type recorded in the descriptor for extents this encoder produces.
    fn extent_type(&self) -> ExtentType;

    /// Fails when a `length`-byte content stream cannot be stored in one extent.
    fn check_capacity(&self, length: u64) -> Result<()>;

    /// Returns a lazy producer for the extent covering `[0, length)` of `content`.
    fn extent_builder(&self, content: SharedStream, length: u64)
        -> Result<Box<dyn StreamBuilder>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CowdHeader {
    pub capacity_sectors: u32,
    pub grain_sectors: u32,
    pub gd_offset: u32,
    pub gd_entries: u32,
    pub free_sector: u32,
}

impl CowdHeader {
    pub fn encode(&self) -> [u8; HEADER_BYTES] {
        let mut out = [0u8; HEADER_BYTES];
        let fields = [
            COWD_MAGIC,
            COWD_VERSION,
            COWD_FLAGS,
            self.capacity_sectors,
            self.grain_sectors,
            self.gd_offset,
            self.gd_entries,
            self.free_sector,
        ];
        for (slot, value) in out.chunks_exact_mut(4).zip(fields) {
            slot.copy_from_slice(&value.to_le_bytes());
        }
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < 32 {
            return Err(DiskError::CorruptImage("truncated COWD header"));
        }
        if le_u32(&raw[0..4]) != COWD_MAGIC {
            return Err(DiskError::CorruptImage("bad COWD magic"));
        }
        if le_u32(&raw[4..8]) != COWD_VERSION {
            return Err(DiskError::CorruptImage("unsupported COWD version"));
        }
        let header = Self {
            capacity_sectors: le_u32(&raw[12..16]),
            grain_sectors: le_u32(&raw[16..20]),
            gd_offset: le_u32(&raw[20..24]),
            gd_entries: le_u32(&raw[24..28]),
            free_sector: le_u32(&raw[28..32]),
        };
        if header.grain_sectors == 0 {
            return Err(DiskError::CorruptImage("zero grain size"));
        }
        if u64::from(header.gd_entries) < header.required_gd_entries() {
            return Err(DiskError::CorruptImage("grain directory too small for capacity"));
        }
        Ok(header)
    }

    pub fn grain_bytes(&self) -> u64 {
        u64::from(self.grain_sectors) * SECTOR_SIZE as u64
    }

    pub fn capacity_bytes(&self) -> u64 {
        u64::from(self.capacity_sectors) * SECTOR_SIZE as u64
    }

    fn grain_count(&self) -> u64 {
        u64::from(self.capacity_sectors).div_ceil(u64::from(self.grain_sectors))
    }

    fn required_gd_entries(&self) -> u64 {
        self.grain_count().div_ceil(GRAIN_TABLE_ENTRIES)
    }
}

/// Encoder for the VMFS sparse layout.
#[derive(Clone, Copy, Debug)]
pub struct VmfsSparseEncoder {
    grain_sectors: u32,
}

impl Default for VmfsSparseEncoder {
    fn default() -> Self {
        Self {
            grain_sectors: DEFAULT_GRAIN_SECTORS,
        }
    }
}

impl VmfsSparseEncoder {
    pub fn with_grain_sectors(grain_sectors: u32) -> Result<Self> {
        if grain_sectors == 0 || grain_sectors > MAX_GRAIN_SECTORS {
            return Err(DiskError::InvalidArgument(format!(
                "grain size {grain_sectors} must be between 1 and {MAX_GRAIN_SECTORS} sectors"
            )));
        }
        Ok(Self { grain_sectors })
    }

    pub fn grain_sectors(&self) -> u32 {
        self.grain_sectors
    }
}

impl SparseExtentEncoder for VmfsSparseEncoder {
    fn extent_type(&self) -> ExtentType {
        ExtentType::VmfsSparse
    }

    fn check_capacity(&self, length: u64) -> Result<()> {
        capacity_sectors(length).map(|_| ())
    }

    fn extent_builder(
        &self,
        content: SharedStream,
        length: u64,
    ) -> Result<Box<dyn StreamBuilder>> {
        let capacity_sectors = capacity_sectors(length)?;
        Ok(Box::new(VmfsSparseExtentBuilder {
            content,
            capacity_sectors,
            grain_sectors: self.grain_sectors,
        }))
    }
}

fn capacity_sectors(length: u64) -> Result<u32> {
    if length % SECTOR_SIZE as u64 != 0 {
        return Err(DiskError::InvalidArgument(format!(
            "sparse extent length {length} is not a multiple of {SECTOR_SIZE}"
        )));
    }
    u32::try_from(length / SECTOR_SIZE as u64).map_err(|_| {
        DiskError::InvalidArgument(format!(
            "{length} bytes exceeds the VMFS sparse capacity limit"
        ))
    })
}

/// Produces a VMFS sparse extent file from a content stream.
///
/// The zero scan runs on every [`StreamBuilder::build`] call, so the output always reflects
/// the content at that moment.
pub struct VmfsSparseExtentBuilder {
    content: SharedStream,
    capacity_sectors: u32,
    grain_sectors: u32,
}

impl VmfsSparseExtentBuilder {
    /// Indices of grains containing at least one non-zero byte, ascending.
    fn scan_allocated_grains(&self) -> Result<Vec<u64>> {
        let length = u64::from(self.capacity_sectors) * SECTOR_SIZE as u64;
        let grain_bytes = u64::from(self.grain_sectors) * SECTOR_SIZE as u64;
        // Whole grains per chunk; never more than the content itself.
        let chunk_bytes = (SCAN_CHUNK_BYTES / grain_bytes).max(1) * grain_bytes;
        let chunk_bytes = chunk_bytes.min(length);

        let mut allocated = Vec::new();
        let mut buf = vec![0u8; chunk_bytes as usize];
        let mut offset = 0u64;
        while offset < length {
            let n = (length - offset).min(chunk_bytes) as usize;
            read_fully_at(&self.content, offset, &mut buf[..n])?;
            for (i, grain) in buf[..n].chunks(grain_bytes as usize).enumerate() {
                if !is_all_zero(grain) {
                    allocated.push(offset / grain_bytes + i as u64);
                }
            }
            offset += n as u64;
        }
        Ok(allocated)
    }
}

impl StreamBuilder for VmfsSparseExtentBuilder {
    fn build(&self) -> Result<Box<dyn Stream>> {
        let allocated = self.scan_allocated_grains()?;
        let grain_sectors = u64::from(self.grain_sectors);
        let grain_bytes = sectors_to_bytes(grain_sectors)?;
        let length = u64::from(self.capacity_sectors) * SECTOR_SIZE as u64;

        let grain_count = div_ceil_u64(u64::from(self.capacity_sectors), grain_sectors)?;
        let gd_entries = div_ceil_u64(grain_count, GRAIN_TABLE_ENTRIES)?;
        let gd_sectors = div_ceil_u64(gd_entries * 4, SECTOR_SIZE as u64)?;

        let mut tables: Vec<u64> = allocated.iter().map(|g| g / GRAIN_TABLE_ENTRIES).collect();
        tables.dedup();

        let gt_start = HEADER_SECTORS + gd_sectors;
        let data_start = gt_start + tables.len() as u64 * GRAIN_TABLE_SECTORS;
        let free_sector = data_start + allocated.len() as u64 * grain_sectors;
        let too_big =
            |_| DiskError::InvalidArgument("sparse extent exceeds 32-bit sector offsets".into());

        let header = CowdHeader {
            capacity_sectors: self.capacity_sectors,
            grain_sectors: self.grain_sectors,
            gd_offset: HEADER_SECTORS as u32,
            gd_entries: u32::try_from(gd_entries).map_err(too_big)?,
            free_sector: u32::try_from(free_sector).map_err(too_big)?,
        };

        let mut gd = vec![0u32; gd_entries as usize];
        for (k, &table) in tables.iter().enumerate() {
            gd[table as usize] = (gt_start + k as u64 * GRAIN_TABLE_SECTORS) as u32;
        }
        let mut gts = vec![0u32; tables.len() * GRAIN_TABLE_ENTRIES as usize];
        for (j, &grain) in allocated.iter().enumerate() {
            let k = tables.partition_point(|&t| t < grain / GRAIN_TABLE_ENTRIES);
            let slot = k * GRAIN_TABLE_ENTRIES as usize + (grain % GRAIN_TABLE_ENTRIES) as usize;
            gts[slot] = (data_start + j as u64 * grain_sectors) as u32;
        }

        let mut metadata = Vec::with_capacity((data_start as usize) * SECTOR_SIZE);
        metadata.extend_from_slice(&header.encode());
        metadata.extend(gd.iter().flat_map(|e| e.to_le_bytes()));
        metadata.resize((gt_start as usize) * SECTOR_SIZE, 0);
        metadata.extend(gts.iter().flat_map(|e| e.to_le_bytes()));

        let mut stream = CompositeStream::new();
        stream.push(Region::Bytes(Arc::from(metadata)))?;

        // Consecutive allocated grains are contiguous in both the content and the file.
        let mut i = 0;
        while i < allocated.len() {
            let mut j = i + 1;
            while j < allocated.len() && allocated[j] == allocated[j - 1] + 1 {
                j += 1;
            }
            let start = allocated[i] * grain_bytes;
            let stored = (j - i) as u64 * grain_bytes;
            let present = stored.min(length - start);
            stream.push(Region::Stream(Box::new(SubStream::new(
                Arc::clone(&self.content),
                start,
                present,
            )?)))?;
            stream.push(Region::Zero(stored - present))?;
            i = j;
        }

        tracing::debug!(
            grains = grain_count,
            allocated = allocated.len(),
            tables = tables.len(),
            "vmfs sparse extent scan complete"
        );
        Ok(Box::new(stream))
    }
}

/// Read-only view of a VMFS sparse extent.
///
/// Unallocated grains come from `parent` when one is given (a differencing extent) and read
/// as zeros otherwise.
pub struct VmfsSparseStream {
    file: Box<dyn Stream>,
    parent: Option<SharedStream>,
    parent_len: u64,
    header: CowdHeader,
    directory: Vec<u32>,
    tables: LruCache<u32, Arc<[u32]>>,
    position: u64,
}

impl VmfsSparseStream {
    pub fn open(mut file: Box<dyn Stream>, parent: Option<SharedStream>) -> Result<Self> {
        let mut raw = [0u8; HEADER_BYTES];
        file.set_position(0)?;
        read_exact(file.as_mut(), &mut raw)
            .map_err(|_| DiskError::CorruptImage("truncated COWD header"))?;
        let header = CowdHeader::decode(&raw)?;

        // Only the entries covering the capacity are read; `gd_entries` itself is untrusted.
        let gd_bytes = header
            .required_gd_entries()
            .checked_mul(4)
            .ok_or(DiskError::OffsetOverflow)?;
        if gd_bytes > MAX_GD_BYTES {
            return Err(DiskError::CorruptImage("grain directory too large"));
        }
        let gd_start = sectors_to_bytes(u64::from(header.gd_offset))?;
        let gd_end = gd_start
            .checked_add(gd_bytes)
            .ok_or(DiskError::OffsetOverflow)?;
        if gd_start < HEADER_BYTES as u64 || gd_end > file.len()? {
            return Err(DiskError::CorruptImage("grain directory outside extent file"));
        }

        let mut gd_raw = vec![0u8; gd_bytes as usize];
        file.set_position(gd_start)?;
        read_exact(file.as_mut(), &mut gd_raw)
            .map_err(|_| DiskError::CorruptImage("truncated grain directory"))?;
        let directory = gd_raw.chunks_exact(4).map(le_u32).collect();

        let parent_len = match &parent {
            Some(p) => lock(p).len()?,
            None => 0,
        };
        let cache = NonZeroUsize::new(GT_CACHE_TABLES)
            .ok_or_else(|| DiskError::InvalidArgument("grain table cache size".into()))?;

        tracing::debug!(
            capacity_sectors = header.capacity_sectors,
            grain_sectors = header.grain_sectors,
            has_parent = parent.is_some(),
            "opened vmfs sparse extent"
        );
        Ok(Self {
            file,
            parent,
            parent_len,
            header,
            directory,
            tables: LruCache::new(cache),
            position: 0,
        })
    }

    pub fn header(&self) -> &CowdHeader {
        &self.header
    }

    fn grain_table(&mut self, gd_index: u32) -> Result<Arc<[u32]>> {
        if let Some(table) = self.tables.get(&gd_index) {
            return Ok(Arc::clone(table));
        }
        let sector = self.directory[gd_index as usize];
        let mut raw = vec![0u8; GRAIN_TABLE_ENTRIES as usize * 4];
        self.file.set_position(sectors_to_bytes(u64::from(sector))?)?;
        read_exact(self.file.as_mut(), &mut raw)
            .map_err(|_| DiskError::CorruptImage("truncated grain table"))?;
        let table: Arc<[u32]> = raw.chunks_exact(4).map(le_u32).collect();
        self.tables.put(gd_index, Arc::clone(&table));
        Ok(table)
    }

    /// File sector holding `grain`, or `None` when the grain is not stored.
    fn grain_sector(&mut self, grain: u64) -> Result<Option<u32>> {
        let gd_index = (grain / GRAIN_TABLE_ENTRIES) as u32;
        if self.directory[gd_index as usize] == 0 {
            return Ok(None);
        }
        let table = self.grain_table(gd_index)?;
        let entry = table[(grain % GRAIN_TABLE_ENTRIES) as usize];
        Ok((entry != 0).then_some(entry))
    }

    fn read_unallocated(&mut self, abs: u64, buf: &mut [u8]) -> Result<()> {
        let from_parent = match &self.parent {
            Some(parent) if abs < self.parent_len => {
                let n = (self.parent_len - abs).min(buf.len() as u64) as usize;
                read_fully_at(parent, abs, &mut buf[..n])?;
                n
            }
            _ => 0,
        };
        buf[from_parent..].fill(0);
        Ok(())
    }
}

impl Stream for VmfsSparseStream {
    fn can_read(&self) -> bool {
        true
    }

    fn can_write(&self) -> bool {
        false
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn len(&self) -> Result<u64> {
        Ok(self.header.capacity_bytes())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, position: u64) -> Result<()> {
        self.position = position;
        Ok(())
    }

    fn seek(&mut self, offset: i64, origin: SeekOrigin) -> Result<u64> {
        let base = seek_base(origin, self.position, self.header.capacity_bytes());
        self.position = resolve_seek(offset, base)?;
        Ok(self.position)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let available = self.header.capacity_bytes().saturating_sub(self.position);
        let count = available.min(buf.len() as u64) as usize;
        let grain_bytes = self.header.grain_bytes();

        let mut done = 0usize;
        while done < count {
            let abs = self.position + done as u64;
            let grain = abs / grain_bytes;
            let within = abs % grain_bytes;
            let chunk = ((grain_bytes - within) as usize).min(count - done);
            let dst = &mut buf[done..done + chunk];

            match self.grain_sector(grain)? {
                Some(sector) => {
                    let at = sectors_to_bytes(u64::from(sector))? + within;
                    self.file.set_position(at)?;
                    read_exact(self.file.as_mut(), dst)?;
                }
                None => self.read_unallocated(abs, dst)?,
            }
            done += chunk;
        }

        self.position += count as u64;
        Ok(count)
    }

    fn write(&mut self, _buf: &[u8]) -> Result<()> {
        Err(DiskError::NotSupported(
            "vmfs sparse extents are read-only".into(),
        ))
    }

    fn set_len(&mut self, _len: u64) -> Result<()> {
        Err(DiskError::NotSupported(
            "vmfs sparse extents are read-only".into(),
        ))
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
