//! Register access.
//!
//! # Safety
//! - Base must be a valid, uncached MMIO mapping of the controller BAR
//! - Offsets must be naturally aligned
//!
//! 64-bit registers are accessed as two 32-bit halves, low first, which
//! both AHCI and NVMe permit.

/// Byte-offset register access to one controller BAR.
pub trait RegisterIo: Send + Sync {
    /// Read the 32-bit register at `offset`.
    fn read32(&self, offset: usize) -> u32;

    /// Write the 32-bit register at `offset`.
    fn write32(&self, offset: usize, value: u32);

    /// Read a 64-bit register as low then high dword.
    fn read64(&self, offset: usize) -> u64 {
        let lo = self.read32(offset) as u64;
        let hi = self.read32(offset + 4) as u64;
        lo | (hi << 32)
    }

    /// Write a 64-bit register as low then high dword.
    fn write64(&self, offset: usize, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset + 4, (value >> 32) as u32);
    }
}

/// Volatile access over a mapped BAR.
#[derive(Debug)]
pub struct MmioRegion {
    base: usize,
    len: usize,
}

impl MmioRegion {
    /// Wrap a mapped register window.
    ///
    /// # Safety
    /// `base..base + len` must be mapped uncached for the lifetime of the
    /// region and belong to exactly one controller.
    pub unsafe fn new(base: usize, len: usize) -> Self {
        Self { base, len }
    }

    /// Base address of the mapping.
    pub fn base(&self) -> usize {
        self.base
    }

    #[inline]
    fn ptr(&self, offset: usize) -> *mut u32 {
        assert!(
            offset % 4 == 0 && offset + 4 <= self.len,
            "BUG: register offset {:#x} outside BAR",
            offset
        );
        (self.base + offset) as *mut u32
    }
}

impl RegisterIo for MmioRegion {
    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        // SAFETY: construction contract plus the bounds check in ptr().
        unsafe { core::ptr::read_volatile(self.ptr(offset)) }
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        // SAFETY: construction contract plus the bounds check in ptr().
        unsafe { core::ptr::write_volatile(self.ptr(offset), value) }
    }
}

// Safety: the mapping is device memory; every access is a single volatile op.
unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}
