//! ATA command encoding: command header, H2D register FIS and PRDT.
//!
//! # Per-slot layout
//! ```text
//! Command list (1KB, one 32-byte header per slot)
//!   dw0  CFL[4:0] | W[6] | PRDTL[31:16]
//!   dw1  PRDBC (written by HBA)
//!   dw2  CTBA low  (128-byte aligned)
//!   dw3  CTBA high
//!
//! Command table (256 bytes per slot)
//!   0x00  H2D register FIS (20 bytes)
//!   0x80  PRDT, up to 8 entries × 16 bytes
//!           dw0 DBA low, dw1 DBA high, dw3 DBC[21:0] | I[31]
//! ```

use super::regs::{ata, fis, size};
use crate::error::{Result, StorageError};
use crate::hal::DmaTarget;

/// H2D register FIS length in dwords.
pub const FIS_DWORDS: usize = 5;

const LBA28_LIMIT: u64 = 1 << 28;
const LBA48_LIMIT: u64 = 1 << 48;

/// Largest sector count one command can carry.
pub const fn max_sectors(ext: bool) -> u32 {
    if ext {
        65536
    } else {
        256
    }
}

/// One ATA command as the engine issues it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AhciCommand {
    Read { lba: u64, count: u32, ext: bool },
    Write { lba: u64, count: u32, ext: bool },
    Flush { ext: bool },
    Identify,
}

impl AhciCommand {
    pub fn opcode(&self) -> u8 {
        match *self {
            Self::Read { ext: true, .. } => ata::READ_DMA_EXT,
            Self::Read { ext: false, .. } => ata::READ_DMA,
            Self::Write { ext: true, .. } => ata::WRITE_DMA_EXT,
            Self::Write { ext: false, .. } => ata::WRITE_DMA,
            Self::Flush { ext: true } => ata::FLUSH_CACHE_EXT,
            Self::Flush { ext: false } => ata::FLUSH_CACHE,
            Self::Identify => ata::IDENTIFY,
        }
    }

    /// Host-to-device data direction.
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Write { .. })
    }

    pub fn has_data(&self) -> bool {
        !matches!(self, Self::Flush { .. })
    }

    /// Build the H2D register FIS, validating LBA and count against the
    /// addressing mode.
    pub fn fis(&self) -> Result<[u32; FIS_DWORDS]> {
        let (lba, count, device) = match *self {
            Self::Read { lba, count, ext } | Self::Write { lba, count, ext } => {
                if count == 0 || count > max_sectors(ext) {
                    return Err(StorageError::TransferTooLarge);
                }
                let end = lba.checked_add(count as u64).ok_or(StorageError::OutOfRange)?;
                let limit = if ext { LBA48_LIMIT } else { LBA28_LIMIT };
                if end > limit {
                    return Err(StorageError::OutOfRange);
                }
                // Count 0 encodes the maximum.
                if ext {
                    (lba, count & 0xFFFF, ata::DEVICE_LBA)
                } else {
                    let device = ata::DEVICE_LBA | ((lba >> 24) & 0xF) as u8;
                    (lba & 0xFF_FFFF, count & 0xFF, device)
                }
            }
            Self::Flush { .. } => (0, 0, ata::DEVICE_LBA),
            Self::Identify => (0, 0, 0),
        };

        let lba_lo = (lba & 0xFF_FFFF) as u32;
        let lba_hi = ((lba >> 24) & 0xFF_FFFF) as u32;

        Ok([
            fis::REG_H2D as u32 | (1 << 15) | (self.opcode() as u32) << 16,
            lba_lo | (device as u32) << 24,
            lba_hi,
            count,
            0,
        ])
    }
}

/// Command header dword 0.
pub const fn header_dw0(prdtl: u16, write: bool) -> u32 {
    FIS_DWORDS as u32 | (write as u32) << 6 | (prdtl as u32) << 16
}

/// PRDT entry interrupt-on-completion flag.
pub const PRD_IRQ: u32 = 1 << 31;

/// One physical region descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Prd {
    pub addr: u64,
    /// DBC field (byte count minus one) plus flags.
    pub dw3: u32,
}

/// Split `target` into PRDT entries. The last entry requests an
/// interrupt.
pub fn build_prdt(target: DmaTarget) -> Result<([Prd; size::PRDT_ENTRIES], usize)> {
    if target.len == 0 || target.len % 2 != 0 || target.bus_addr % 2 != 0 {
        return Err(StorageError::InvalidConfig);
    }
    if target.len > size::PRDT_ENTRIES * size::PRD_MAX_BYTES {
        return Err(StorageError::TransferTooLarge);
    }

    let mut prds = [Prd::default(); size::PRDT_ENTRIES];
    let mut used = 0;
    let mut offset = 0;
    while offset < target.len {
        let chunk = (target.len - offset).min(size::PRD_MAX_BYTES);
        prds[used] = Prd {
            addr: target.bus_addr + offset as u64,
            dw3: (chunk - 1) as u32,
        };
        used += 1;
        offset += chunk;
    }
    prds[used - 1].dw3 |= PRD_IRQ;
    Ok((prds, used))
}
