//! Checked offset arithmetic and little-endian field helpers shared by the image formats.

use crate::{DiskError, Result, SECTOR_SIZE};

pub fn div_ceil_u64(n: u64, d: u64) -> Result<u64> {
    if d == 0 {
        return Err(DiskError::OffsetOverflow);
    }
    Ok(n.div_ceil(d))
}

/// Fails with `OutOfBounds` unless `[offset, offset + len)` lies within `capacity`.
pub fn checked_range(offset: u64, len: usize, capacity: u64) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or(DiskError::OffsetOverflow)?;
    if end > capacity {
        return Err(DiskError::OutOfBounds {
            offset,
            len,
            capacity,
        });
    }
    Ok(())
}

/// Byte offset of `sector`, failing instead of wrapping for absurd sector numbers.
pub fn sectors_to_bytes(sectors: u64) -> Result<u64> {
    sectors
        .checked_mul(SECTOR_SIZE as u64)
        .ok_or(DiskError::OffsetOverflow)
}

/// Zero test used by the sparse encoders; compares a word at a time.
pub fn is_all_zero(buf: &[u8]) -> bool {
    let mut words = buf.chunks_exact(8);
    words.all(|w| u64::from_ne_bytes([w[0], w[1], w[2], w[3], w[4], w[5], w[6], w[7]]) == 0)
        && words.remainder().iter().all(|&b| b == 0)
}

/// Reads a little-endian `u32` from the first four bytes of `bytes`.
pub fn le_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
