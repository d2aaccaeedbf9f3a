//! Discovered storage units and identify-string decoding.

use alloc::string::String;

use crate::error::{Result, StorageError};

/// Host interface a unit sits behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Ahci,
    Nvme,
}

/// A port (AHCI) or namespace (NVMe) learned at identification.
///
/// Immutable once built; a re-identify after reset replaces it wholesale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub protocol: Protocol,
    /// Port number (AHCI) or namespace id (NVMe).
    pub unit: u32,
    /// Total capacity in logical sectors.
    pub sector_count: u64,
    /// Logical sector size in bytes.
    pub sector_size: u32,
    pub model: String,
    pub serial: String,
    pub firmware: String,
    /// Device-side command queueing (NCQ for SATA; always set for NVMe).
    pub queued: bool,
    /// Device-reported queue depth, 0 when not reported.
    pub queue_depth: u16,
    /// Largest single transfer the engine will build for this unit.
    pub max_transfer_sectors: u32,
}

impl DeviceInfo {
    pub fn capacity_bytes(&self) -> u64 {
        self.sector_count.saturating_mul(self.sector_size as u64)
    }

    /// Check `count` sectors at `lba` against capacity and transfer limit.
    /// Returns the transfer size in bytes.
    pub fn check_transfer(&self, lba: u64, count: u32) -> Result<usize> {
        let end = lba
            .checked_add(count as u64)
            .ok_or(StorageError::OutOfRange)?;
        if end > self.sector_count {
            return Err(StorageError::OutOfRange);
        }
        if count > self.max_transfer_sectors {
            return Err(StorageError::TransferTooLarge);
        }
        Ok(count as usize * self.sector_size as usize)
    }
}

/// Decode an ATA identify string: each 16-bit word holds two characters
/// with the first character in the high byte. Trailing spaces and NULs
/// are dropped.
pub fn ata_string(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len());
    for pair in raw.chunks(2) {
        if let [lo, hi] = *pair {
            out.push(printable(hi));
            out.push(printable(lo));
        } else {
            out.push(printable(pair[0]));
        }
    }
    trim_padding(out)
}

/// Decode a plain space-padded ASCII field (NVMe identify strings).
pub fn padded_ascii(raw: &[u8]) -> String {
    let out: String = raw.iter().map(|&b| printable(b)).collect();
    trim_padding(out)
}

fn printable(b: u8) -> char {
    match b {
        0 => '\0',
        0x20..=0x7e => b as char,
        _ => '?',
    }
}

fn trim_padding(mut s: String) -> String {
    let keep = s.trim_end_matches(|c| c == ' ' || c == '\0').len();
    s.truncate(keep);
    s
}
