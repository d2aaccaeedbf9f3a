//! ATA IDENTIFY DEVICE data (512 bytes, 256 little-endian words).

use alloc::string::String;

use crate::device::ata_string;
use crate::error::{Result, StorageError};

/// IDENTIFY DEVICE data size.
pub const IDENTIFY_LEN: usize = 512;

/// Fields the engine uses from IDENTIFY DEVICE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtaIdentity {
    pub sector_count: u64,
    pub sector_size: u32,
    pub model: String,
    pub serial: String,
    pub firmware: String,
    /// 48-bit LBA feature set supported.
    pub lba48: bool,
    pub ncq: bool,
    /// NCQ queue depth, 0 without NCQ.
    pub ncq_depth: u16,
}

#[inline]
fn word(data: &[u8], n: usize) -> u16 {
    u16::from_le_bytes([data[n * 2], data[n * 2 + 1]])
}

fn words(data: &[u8], first: usize, last: usize) -> &[u8] {
    &data[first * 2..(last + 1) * 2]
}

/// Parse IDENTIFY DEVICE data.
pub fn parse(data: &[u8]) -> Result<AtaIdentity> {
    if data.len() < IDENTIFY_LEN {
        return Err(StorageError::ProtocolError);
    }

    // Word 0 bit 15 set means an ATAPI device.
    if word(data, 0) & (1 << 15) != 0 {
        return Err(StorageError::ProtocolError);
    }
    // Word 49 bit 9: LBA supported.
    if word(data, 49) & (1 << 9) == 0 {
        return Err(StorageError::ProtocolError);
    }

    let lba48 = word(data, 83) & (1 << 10) != 0;
    let sector_count = if lba48 {
        (0..4).fold(0u64, |acc, i| acc | (word(data, 100 + i) as u64) << (16 * i))
    } else {
        word(data, 60) as u64 | (word(data, 61) as u64) << 16
    };
    if sector_count == 0 {
        return Err(StorageError::DeviceNotPresent);
    }

    // Word 106: valid when bit 14 set and bit 15 clear; bit 12 means the
    // logical sector is longer than 256 words (size in words 117-118).
    let w106 = word(data, 106);
    let mut sector_size = 512u32;
    if w106 & 0xC000 == 0x4000 && w106 & (1 << 12) != 0 {
        let words = word(data, 117) as u32 | (word(data, 118) as u32) << 16;
        if words != 0 {
            sector_size = words * 2;
        }
    }
    if !sector_size.is_power_of_two() || !(512..=65536).contains(&sector_size) {
        return Err(StorageError::ProtocolError);
    }

    let ncq = word(data, 76) & (1 << 8) != 0;
    let ncq_depth = if ncq {
        (word(data, 75) & 0x1F) + 1
    } else {
        0
    };

    Ok(AtaIdentity {
        sector_count,
        sector_size,
        serial: ata_string(words(data, 10, 19)),
        firmware: ata_string(words(data, 23, 26)),
        model: ata_string(words(data, 27, 46)),
        lba48,
        ncq,
        ncq_depth,
    })
}
