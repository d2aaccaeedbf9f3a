//! NVMe submission and completion entry formats.
//!
//! ```text
//! SQE (64 bytes)                     CQE (16 bytes)
//!   dw0    opcode | CID[31:16]         dw0  command specific
//!   dw1    NSID                        dw1  reserved
//!   dw6-7  PRP1                        dw2  SQ head[15:0] | SQ id[31:16]
//!   dw8-9  PRP2                        dw3  CID[15:0] | P[16] | status[31:17]
//!   dw10-15 command specific
//! ```

/// Submission queue entry size.
pub const SQE_SIZE: usize = 64;
/// Completion queue entry size.
pub const CQE_SIZE: usize = 16;

pub mod admin {
    pub const CREATE_IO_SQ: u8 = 0x01;
    pub const CREATE_IO_CQ: u8 = 0x05;
    pub const IDENTIFY: u8 = 0x06;
}

pub mod io {
    pub const FLUSH: u8 = 0x00;
    pub const WRITE: u8 = 0x01;
    pub const READ: u8 = 0x02;
}

/// Identify CNS values.
pub mod cns {
    pub const NAMESPACE: u32 = 0x00;
    pub const CONTROLLER: u32 = 0x01;
}

/// One NVMe command as the engine issues it.
///
/// Queue creation carries the bus address of the new ring itself; every
/// other data pointer comes from the command's `DmaBuffer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmeCommand {
    Read { nsid: u32, lba: u64, count: u32 },
    Write { nsid: u32, lba: u64, count: u32 },
    Flush { nsid: u32 },
    IdentifyController,
    IdentifyNamespace { nsid: u32 },
    CreateIoCq { qid: u16, depth: u16, vector: u16, base: u64 },
    CreateIoSq { qid: u16, depth: u16, cqid: u16, base: u64 },
}

/// 64-byte submission entry as dwords.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sqe(pub [u32; 16]);

impl Sqe {
    pub fn set_prp(&mut self, prp1: u64, prp2: u64) {
        self.0[6] = prp1 as u32;
        self.0[7] = (prp1 >> 32) as u32;
        self.0[8] = prp2 as u32;
        self.0[9] = (prp2 >> 32) as u32;
    }

    pub fn prp1(&self) -> u64 {
        self.0[6] as u64 | (self.0[7] as u64) << 32
    }

    pub fn prp2(&self) -> u64 {
        self.0[8] as u64 | (self.0[9] as u64) << 32
    }
}

impl NvmeCommand {
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Read { .. } => io::READ,
            Self::Write { .. } => io::WRITE,
            Self::Flush { .. } => io::FLUSH,
            Self::IdentifyController | Self::IdentifyNamespace { .. } => admin::IDENTIFY,
            Self::CreateIoCq { .. } => admin::CREATE_IO_CQ,
            Self::CreateIoSq { .. } => admin::CREATE_IO_SQ,
        }
    }

    /// Whether the command moves data through a caller buffer.
    pub fn has_data(&self) -> bool {
        matches!(
            self,
            Self::Read { .. }
                | Self::Write { .. }
                | Self::IdentifyController
                | Self::IdentifyNamespace { .. }
        )
    }

    /// Encode with command identifier `cid`. PRP fields are left for the
    /// queue to fill, except for queue creation.
    pub fn encode(&self, cid: u16) -> Sqe {
        let mut sqe = Sqe::default();
        sqe.0[0] = self.opcode() as u32 | (cid as u32) << 16;

        match *self {
            Self::Read { nsid, lba, count } | Self::Write { nsid, lba, count } => {
                sqe.0[1] = nsid;
                sqe.0[10] = lba as u32;
                sqe.0[11] = (lba >> 32) as u32;
                // NLB is zero-based.
                sqe.0[12] = count.saturating_sub(1) & 0xFFFF;
            }
            Self::Flush { nsid } => sqe.0[1] = nsid,
            Self::IdentifyController => sqe.0[10] = cns::CONTROLLER,
            Self::IdentifyNamespace { nsid } => {
                sqe.0[1] = nsid;
                sqe.0[10] = cns::NAMESPACE;
            }
            Self::CreateIoCq {
                qid,
                depth,
                vector,
                base,
            } => {
                sqe.set_prp(base, 0);
                sqe.0[10] = qid as u32 | (depth as u32 - 1) << 16;
                // PC | IEN
                sqe.0[11] = 0b11 | (vector as u32) << 16;
            }
            Self::CreateIoSq {
                qid,
                depth,
                cqid,
                base,
            } => {
                sqe.set_prp(base, 0);
                sqe.0[10] = qid as u32 | (depth as u32 - 1) << 16;
                // PC, QPRIO 0
                sqe.0[11] = 1 | (cqid as u32) << 16;
            }
        }
        sqe
    }
}

/// Completion entry as read from the ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cqe {
    pub dw0: u32,
    pub dw2: u32,
    pub dw3: u32,
}

impl Cqe {
    pub fn sq_head(&self) -> u16 {
        self.dw2 as u16
    }

    pub fn sq_id(&self) -> u16 {
        (self.dw2 >> 16) as u16
    }

    pub fn cid(&self) -> u16 {
        self.dw3 as u16
    }

    pub fn phase(&self) -> bool {
        phase_of(self.dw3)
    }

    /// Status field without the phase bit: SC[7:0], SCT[10:8], CRD, M, DNR[14].
    pub fn status(&self) -> u16 {
        (self.dw3 >> 17) as u16
    }

    pub fn is_success(&self) -> bool {
        self.status() & 0x7FF == 0
    }
}

/// Phase tag of a raw dw3.
#[inline]
pub const fn phase_of(dw3: u32) -> bool {
    dw3 & (1 << 16) != 0
}
