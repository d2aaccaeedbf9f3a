//! NVMe controller register definitions and field accessors.

/// Controller Capabilities (64-bit)
pub const CAP: usize = 0x00;
/// Version
pub const VS: usize = 0x08;
/// Interrupt Mask Set
pub const INTMS: usize = 0x0C;
/// Interrupt Mask Clear
pub const INTMC: usize = 0x10;
/// Controller Configuration
pub const CC: usize = 0x14;
/// Controller Status
pub const CSTS: usize = 0x1C;
/// Admin Queue Attributes
pub const AQA: usize = 0x24;
/// Admin Submission Queue Base (64-bit)
pub const ASQ: usize = 0x28;
/// Admin Completion Queue Base (64-bit)
pub const ACQ: usize = 0x30;
/// First doorbell register
pub const DOORBELL_BASE: usize = 0x1000;

/// Controller Capabilities fields
pub mod cap {
    /// Maximum Queue Entries Supported (MQES is zero-based).
    pub const fn max_queue_entries(cap: u64) -> u32 {
        (cap & 0xFFFF) as u32 + 1
    }

    /// Worst-case CSTS.RDY transition time in milliseconds (TO, 500ms units).
    pub const fn ready_timeout_ms(cap: u64) -> u64 {
        ((cap >> 24) & 0xFF) * 500
    }

    /// Doorbell Stride exponent: doorbells are `4 << DSTRD` bytes apart.
    pub const fn doorbell_stride(cap: u64) -> u32 {
        ((cap >> 32) & 0xF) as u32
    }

    /// NVM command set supported (CSS bit 0).
    pub const fn supports_nvm(cap: u64) -> bool {
        (cap >> 37) & 1 != 0
    }

    /// Minimum memory page size as a power of two (4KB << MPSMIN).
    pub const fn min_page_shift(cap: u64) -> u32 {
        12 + ((cap >> 48) & 0xF) as u32
    }
}

/// Controller Configuration fields
pub mod cc {
    pub const EN: u32 = 1 << 0;
    /// I/O Submission Queue Entry Size: 2^6 = 64 bytes
    pub const IOSQES: u32 = 6 << 16;
    /// I/O Completion Queue Entry Size: 2^4 = 16 bytes
    pub const IOCQES: u32 = 4 << 20;

    /// NVM command set, 4KB pages, round-robin arbitration, enabled.
    pub const fn enable_value() -> u32 {
        // CSS = 0 (NVM), MPS = 0 (4KB), AMS = 0 (round robin)
        IOSQES | IOCQES | EN
    }
}

/// Controller Status fields
pub mod csts {
    pub const RDY: u32 = 1 << 0;
    /// Controller Fatal Status
    pub const CFS: u32 = 1 << 1;
}

/// Admin Queue Attributes for the given depths.
pub const fn aqa(sq_depth: u16, cq_depth: u16) -> u32 {
    (sq_depth as u32 - 1) | ((cq_depth as u32 - 1) << 16)
}

/// Submission queue `qid` tail doorbell.
pub const fn sq_tail_doorbell(qid: u16, stride: u32) -> usize {
    DOORBELL_BASE + (2 * qid as usize) * (4 << stride)
}

/// Completion queue `qid` head doorbell.
pub const fn cq_head_doorbell(qid: u16, stride: u32) -> usize {
    DOORBELL_BASE + (2 * qid as usize + 1) * (4 << stride)
}

/// Version register
pub mod vs {
    pub const fn major(vs: u32) -> u16 {
        (vs >> 16) as u16
    }

    pub const fn minor(vs: u32) -> u8 {
        (vs >> 8) as u8
    }
}
