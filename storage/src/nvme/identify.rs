//! Identify Controller and Identify Namespace data (4KB each).

use alloc::string::String;

use crate::device::padded_ascii;
use crate::error::{Result, StorageError};

/// Identify data structure size.
pub const IDENTIFY_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerIdentity {
    pub vendor_id: u16,
    pub serial: String,
    pub model: String,
    pub firmware: String,
    /// Maximum Data Transfer Size as a power of two in minimum pages;
    /// 0 means no limit.
    pub mdts: u8,
    /// Number of namespaces.
    pub namespace_count: u32,
}

impl ControllerIdentity {
    /// MDTS in bytes for a `page_size` minimum page, `None` when unlimited.
    pub fn max_transfer_bytes(&self, page_size: usize) -> Option<usize> {
        if self.mdts == 0 {
            return None;
        }
        page_size.checked_shl(self.mdts as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamespaceGeometry {
    pub sector_count: u64,
    pub sector_size: u32,
}

fn le_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn le_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn le_u64(data: &[u8], at: usize) -> u64 {
    le_u32(data, at) as u64 | (le_u32(data, at + 4) as u64) << 32
}

pub fn parse_controller(data: &[u8]) -> Result<ControllerIdentity> {
    if data.len() < IDENTIFY_LEN {
        return Err(StorageError::ProtocolError);
    }
    Ok(ControllerIdentity {
        vendor_id: le_u16(data, 0),
        serial: padded_ascii(&data[4..24]),
        model: padded_ascii(&data[24..64]),
        firmware: padded_ascii(&data[64..72]),
        mdts: data[77],
        namespace_count: le_u32(data, 516),
    })
}

/// Parse Identify Namespace. An inactive namespace (NSZE 0) reads as
/// `DeviceNotPresent`.
pub fn parse_namespace(data: &[u8]) -> Result<NamespaceGeometry> {
    if data.len() < IDENTIFY_LEN {
        return Err(StorageError::ProtocolError);
    }
    let nsze = le_u64(data, 0);
    if nsze == 0 {
        return Err(StorageError::DeviceNotPresent);
    }

    let nlbaf = data[25] as usize;
    let format = (data[26] & 0xF) as usize;
    if format > nlbaf {
        return Err(StorageError::ProtocolError);
    }
    let lbaf = le_u32(data, 128 + format * 4);
    let lbads = (lbaf >> 16) & 0xFF;
    let sector_size = match lbads {
        // Reported as 0 by some controllers for the default format.
        0 => 512,
        9..=16 => 1u32 << lbads,
        _ => return Err(StorageError::ProtocolError),
    };

    Ok(NamespaceGeometry {
        sector_count: nsze,
        sector_size,
    })
}
