//! DMA memory: regions from the page allocator and owned buffers on top.
//!
//! # Ownership State Machine
//! ```text
//!     FREE ──alloc()──> DRIVER_OWNED ──submit()──> DEVICE_OWNED
//!       ▲                     │                         │
//!       └─────drop()──────────┴──────── reap() ─────────┘
//! ```
//!
//! INVARIANT: a DEVICE_OWNED buffer is never read or written by the CPU.
//! Hardware only ever sees a buffer as a (bus address, length) pair.

use alloc::sync::Arc;

use super::Hal;
use crate::error::{Result, StorageError};

/// Page size (4KB).
pub const PAGE_SIZE: usize = 4096;

/// Convert bytes to pages (rounded up).
#[inline]
pub const fn bytes_to_pages(bytes: usize) -> usize {
    (bytes + PAGE_SIZE - 1) / PAGE_SIZE
}

// ═══════════════════════════════════════════════════════════════════════════
// REGION
// ═══════════════════════════════════════════════════════════════════════════

/// DMA-capable memory region.
///
/// Contains both CPU-accessible pointer and device-visible bus address.
#[derive(Clone, Copy)]
pub struct DmaRegion {
    cpu_ptr: *mut u8,
    bus_addr: u64,
    size: usize,
}

impl DmaRegion {
    /// Create a new DMA region.
    ///
    /// # Safety
    /// - `cpu_ptr` must point to `size` bytes of DMA-capable memory
    /// - `bus_addr` must be the corresponding device-visible address
    /// - Memory must be physically contiguous
    pub const unsafe fn new(cpu_ptr: *mut u8, bus_addr: u64, size: usize) -> Self {
        Self {
            cpu_ptr,
            bus_addr,
            size,
        }
    }

    #[inline]
    pub const fn cpu_base(&self) -> *mut u8 {
        self.cpu_ptr
    }

    /// Bus base address (what devices see).
    #[inline]
    pub const fn bus_base(&self) -> u64 {
        self.bus_addr
    }

    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }
}

unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl core::fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaRegion")
            .field("cpu_ptr", &self.cpu_ptr)
            .field("bus_addr", &format_args!("{:#x}", self.bus_addr))
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// OWNERSHIP
// ═══════════════════════════════════════════════════════════════════════════

/// Who may touch a buffer right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOwnership {
    Free,
    DriverOwned,
    DeviceOwned,
}

impl BufferOwnership {
    pub fn can_access(&self) -> bool {
        *self == Self::DriverOwned
    }

    pub fn is_device_owned(&self) -> bool {
        *self == Self::DeviceOwned
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// BUFFER
// ═══════════════════════════════════════════════════════════════════════════

/// Physically contiguous buffer with ownership tracking.
///
/// Pages go back to the HAL on drop. A buffer dropped while the device
/// still owns it is leaked instead, since DMA may still land in it.
pub struct DmaBuffer {
    region: DmaRegion,
    len: usize,
    ownership: BufferOwnership,
    hal: Arc<dyn Hal>,
}

impl DmaBuffer {
    /// Allocate a zeroed buffer of `len` bytes.
    pub fn alloc(hal: &Arc<dyn Hal>, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(StorageError::InvalidConfig);
        }
        let pages = bytes_to_pages(len);
        let region = hal.alloc_pages(pages).ok_or(StorageError::OutOfMemory)?;
        if region.size() < len || region.cpu_base().is_null() {
            // SAFETY: just allocated, never handed to a device.
            unsafe { hal.free_pages(region) };
            return Err(StorageError::OutOfMemory);
        }
        Ok(Self {
            region,
            len,
            ownership: BufferOwnership::DriverOwned,
            hal: Arc::clone(hal),
        })
    }

    /// Usable length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Device-visible address of byte 0.
    pub fn bus_addr(&self) -> u64 {
        self.region.bus_base()
    }

    pub fn ownership(&self) -> BufferOwnership {
        self.ownership
    }

    /// Buffer contents.
    ///
    /// # Panics
    /// Panics if the device owns the buffer.
    pub fn as_slice(&self) -> &[u8] {
        assert!(
            self.ownership.can_access(),
            "BUG: Cannot access buffer not owned by driver (state: {:?})",
            self.ownership
        );
        // SAFETY: region covers len bytes and the driver owns it.
        unsafe { core::slice::from_raw_parts(self.region.cpu_base(), self.len) }
    }

    /// Mutable buffer contents.
    ///
    /// # Panics
    /// Panics if the device owns the buffer.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        assert!(
            self.ownership.can_access(),
            "BUG: Cannot access buffer not owned by driver (state: {:?})",
            self.ownership
        );
        // SAFETY: region covers len bytes and the driver owns it.
        unsafe { core::slice::from_raw_parts_mut(self.region.cpu_base(), self.len) }
    }

    /// Zero the buffer.
    pub fn clear(&mut self) {
        self.as_mut_slice().fill(0);
    }

    /// Volatile dword read, for structures the device writes concurrently
    /// (completion rings, received FIS). Valid in any ownership state.
    #[inline]
    pub(crate) fn read_u32(&self, offset: usize) -> u32 {
        assert!(offset % 4 == 0 && offset + 4 <= self.len, "BUG: DMA read out of bounds");
        // SAFETY: aligned and in bounds.
        unsafe { core::ptr::read_volatile(self.region.cpu_base().add(offset) as *const u32) }
    }

    /// Volatile dword write, for structures the device reads (command
    /// slots, PRDTs, PRP lists).
    #[inline]
    pub(crate) fn write_u32(&self, offset: usize, value: u32) {
        assert!(offset % 4 == 0 && offset + 4 <= self.len, "BUG: DMA write out of bounds");
        // SAFETY: aligned and in bounds.
        unsafe { core::ptr::write_volatile(self.region.cpu_base().add(offset) as *mut u32, value) }
    }

    #[inline]
    pub(crate) fn write_u64(&self, offset: usize, value: u64) {
        self.write_u32(offset, value as u32);
        self.write_u32(offset + 4, (value >> 32) as u32);
    }

    /// Zero `len` bytes at `offset` through volatile stores.
    pub(crate) fn zero_range(&self, offset: usize, len: usize) {
        for off in (offset..offset + len).step_by(4) {
            self.write_u32(off, 0);
        }
    }

    /// Hand the buffer to the device (DriverOwned -> DeviceOwned).
    pub(crate) fn mark_device_owned(&mut self) {
        debug_assert!(
            self.ownership == BufferOwnership::DriverOwned,
            "Buffer must be driver-owned before device transfer"
        );
        self.ownership = BufferOwnership::DeviceOwned;
    }

    /// Take the buffer back after the device is done with it.
    pub(crate) fn mark_driver_owned(&mut self) {
        self.ownership = BufferOwnership::DriverOwned;
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        if self.ownership.is_device_owned() {
            log::warn!(
                "dma: leaking {} bytes at {:#x} still owned by device",
                self.len,
                self.region.bus_base()
            );
            return;
        }
        self.ownership = BufferOwnership::Free;
        // SAFETY: allocated from this HAL; the device no longer targets it.
        unsafe { self.hal.free_pages(self.region) };
    }
}

impl core::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("bus_addr", &format_args!("{:#x}", self.region.bus_base()))
            .field("len", &self.len)
            .field("ownership", &self.ownership)
            .finish()
    }
}

// Safety: the buffer is uniquely owned; the raw pointer is never aliased
// by another DmaBuffer.
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

/// What a command hands to hardware: address and length, nothing more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaTarget {
    pub bus_addr: u64,
    pub len: usize,
}

impl DmaTarget {
    pub fn of(buffer: &DmaBuffer) -> Self {
        Self {
            bus_addr: buffer.bus_addr(),
            len: buffer.len(),
        }
    }
}
