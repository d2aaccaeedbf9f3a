//! AHCI register definitions and field accessors.

/// HBA registers (offset from ABAR)
pub mod hba {
    /// Host Capabilities
    pub const CAP: usize = 0x00;
    /// Global Host Control
    pub const GHC: usize = 0x04;
    /// Interrupt Status
    pub const IS: usize = 0x08;
    /// Ports Implemented
    pub const PI: usize = 0x0C;
    /// Version
    pub const VS: usize = 0x10;
}

/// First port register block and stride between ports.
pub const PORT_BASE: usize = 0x100;
pub const PORT_STRIDE: usize = 0x80;

/// Absolute offset of port register `reg` for `port`.
#[inline]
pub const fn port_reg(port: u32, reg: usize) -> usize {
    PORT_BASE + port as usize * PORT_STRIDE + reg
}

/// Port registers (offset from ABAR + 0x100 + port * 0x80)
pub mod port {
    /// Command List Base Address Low
    pub const CLB: usize = 0x00;
    /// FIS Base Address Low
    pub const FB: usize = 0x08;
    /// Interrupt Status
    pub const IS: usize = 0x10;
    /// Interrupt Enable
    pub const IE: usize = 0x14;
    /// Command and Status
    pub const CMD: usize = 0x18;
    /// Task File Data
    pub const TFD: usize = 0x20;
    /// Signature
    pub const SIG: usize = 0x24;
    /// SATA Status
    pub const SSTS: usize = 0x28;
    /// SATA Error
    pub const SERR: usize = 0x30;
    /// Command Issue
    pub const CI: usize = 0x38;
}

/// Host Capabilities fields
pub mod cap {
    pub const S64A: u32 = 1 << 31;
    pub const SNCQ: u32 = 1 << 30;

    /// Number of ports (NP is zero-based).
    pub const fn num_ports(cap: u32) -> u32 {
        (cap & 0x1F) + 1
    }

    /// Command slots per port (NCS is zero-based).
    pub const fn num_cmd_slots(cap: u32) -> u32 {
        ((cap >> 8) & 0x1F) + 1
    }
}

/// Global Host Control bits
pub mod ghc {
    pub const HR: u32 = 1 << 0; // HBA Reset
    pub const IE: u32 = 1 << 1; // Interrupt Enable
    pub const AE: u32 = 1 << 31; // AHCI Enable
}

/// Version register
pub mod vs {
    pub const fn major(vs: u32) -> u16 {
        (vs >> 16) as u16
    }

    pub const fn minor(vs: u32) -> u16 {
        vs as u16
    }
}

/// Port Command bits
pub mod cmd {
    pub const ST: u32 = 1 << 0; // Start
    pub const SUD: u32 = 1 << 1; // Spin-Up Device
    pub const POD: u32 = 1 << 2; // Power On Device
    pub const FRE: u32 = 1 << 4; // FIS Receive Enable
    pub const FR: u32 = 1 << 14; // FIS Receive Running
    pub const CR: u32 = 1 << 15; // Command List Running

    /// Current Command Slot: the slot the HBA was processing.
    pub const fn current_slot(cmd: u32) -> u32 {
        (cmd >> 8) & 0x1F
    }
}

/// SATA Status fields
pub mod ssts {
    pub const DET_PRESENT: u32 = 3;
    pub const IPM_ACTIVE: u32 = 1;

    pub const fn det(ssts: u32) -> u32 {
        ssts & 0xF
    }

    pub const fn ipm(ssts: u32) -> u32 {
        (ssts >> 8) & 0xF
    }

    /// Device present with PHY communication established and link active.
    pub const fn link_up(ssts: u32) -> bool {
        det(ssts) == DET_PRESENT && ipm(ssts) == IPM_ACTIVE
    }
}

/// Task File Data bits
pub mod tfd {
    pub const STS_ERR: u32 = 1 << 0;
    pub const STS_DRQ: u32 = 1 << 3;
    pub const STS_BSY: u32 = 1 << 7;

    /// ATA status byte.
    pub const fn status(tfd: u32) -> u8 {
        tfd as u8
    }

    /// ATA error byte.
    pub const fn error(tfd: u32) -> u8 {
        (tfd >> 8) as u8
    }
}

/// Port Interrupt Status / Enable bits
pub mod pxis {
    pub const DHRS: u32 = 1 << 0; // Device to Host Register FIS
    pub const PSS: u32 = 1 << 1; // PIO Setup FIS
    pub const DSS: u32 = 1 << 2; // DMA Setup FIS
    pub const SDBS: u32 = 1 << 3; // Set Device Bits FIS
    pub const DPS: u32 = 1 << 5; // Descriptor Processed
    pub const IFS: u32 = 1 << 27; // Interface Fatal Error
    pub const HBDS: u32 = 1 << 28; // Host Bus Data Error
    pub const HBFS: u32 = 1 << 29; // Host Bus Fatal Error
    pub const TFES: u32 = 1 << 30; // Task File Error

    /// Conditions that halt the command engine.
    pub const FATAL: u32 = TFES | HBFS | HBDS | IFS;

    /// What the engine enables on each port.
    pub const ENABLED: u32 = DHRS | PSS | DSS | SDBS | DPS | FATAL;
}

/// ATA commands
pub mod ata {
    pub const READ_DMA: u8 = 0xC8;
    pub const READ_DMA_EXT: u8 = 0x25;
    pub const WRITE_DMA: u8 = 0xCA;
    pub const WRITE_DMA_EXT: u8 = 0x35;
    pub const FLUSH_CACHE: u8 = 0xE7;
    pub const FLUSH_CACHE_EXT: u8 = 0xEA;
    pub const IDENTIFY: u8 = 0xEC;

    /// Device register: LBA addressing.
    pub const DEVICE_LBA: u8 = 1 << 6;
}

/// FIS types
pub mod fis {
    pub const REG_H2D: u8 = 0x27;
}

/// DMA structure sizes
pub mod size {
    /// Command List size (32 headers × 32 bytes)
    pub const CMD_LIST: usize = 1024;
    /// FIS Receive buffer size
    pub const FIS: usize = 256;
    /// Command Table size (0x80 header area + 8 PRDT entries)
    pub const CMD_TABLE: usize = 256;
    /// Command Header size
    pub const CMD_HEADER: usize = 32;
    /// Offset of the PRDT inside a command table
    pub const PRDT_OFFSET: usize = 0x80;
    /// PRDT Entry size
    pub const PRDT_ENTRY: usize = 16;
    /// PRDT entries per command table
    pub const PRDT_ENTRIES: usize = (CMD_TABLE - PRDT_OFFSET) / PRDT_ENTRY;
    /// Largest byte count one PRDT entry can describe
    pub const PRD_MAX_BYTES: usize = 4 * 1024 * 1024;
}

/// Device signatures
pub mod signature {
    pub const ATA: u32 = 0x00000101;
    pub const ATAPI: u32 = 0xEB140101;
    pub const SEMB: u32 = 0xC33C0101;
    pub const PM: u32 = 0x96690101;
}
