//! One NVMe submission/completion queue pair as a queue transport.
//!
//! The CID written into each entry is the engine's tag. It has no relation
//! to the ring index: completions arrive in any order and the SQ tail only
//! moves forward.

use alloc::sync::Arc;
use core::sync::atomic::{fence, Ordering};

use super::command::{phase_of, Cqe, NvmeCommand, CQE_SIZE, SQE_SIZE};
use super::regs;
use crate::error::{Result, StorageError};
use crate::hal::{bytes_to_pages, DmaBuffer, DmaTarget, Hal, RegisterIo, PAGE_SIZE};
use crate::queue::ring::{CompletionRing, SubmissionRing};
use crate::queue::{QueueTransport, RawCompletion, RawStatus};

/// PRP entries in one list page. Lists are never chained.
pub const PRP_LIST_ENTRIES: usize = PAGE_SIZE / 8;

/// Largest transfer one command can describe with a single list page.
pub const PRP_MAX_BYTES: usize = PRP_LIST_ENTRIES * PAGE_SIZE;

pub struct NvmeQueue {
    regs: Arc<dyn RegisterIo>,
    qid: u16,
    sq: DmaBuffer,
    cq: DmaBuffer,
    /// One PRP list page per tag.
    prp_lists: DmaBuffer,
    sq_ring: SubmissionRing,
    cq_ring: CompletionRing,
    sq_doorbell: usize,
    cq_doorbell: usize,
}

impl NvmeQueue {
    /// Allocate ring memory for queue `qid`. Does not touch the controller.
    pub fn new(
        regs: Arc<dyn RegisterIo>,
        hal: &Arc<dyn Hal>,
        qid: u16,
        depth: u16,
        doorbell_stride: u32,
    ) -> Result<Self> {
        if depth < 2 || !depth.is_power_of_two() {
            return Err(StorageError::InvalidConfig);
        }
        let sq = DmaBuffer::alloc(hal, depth as usize * SQE_SIZE)?;
        let cq = DmaBuffer::alloc(hal, depth as usize * CQE_SIZE)?;
        let prp_lists = DmaBuffer::alloc(hal, depth as usize * PAGE_SIZE)?;

        Ok(Self {
            regs,
            qid,
            sq,
            cq,
            prp_lists,
            sq_ring: SubmissionRing::new(depth),
            cq_ring: CompletionRing::new(depth),
            sq_doorbell: regs::sq_tail_doorbell(qid, doorbell_stride),
            cq_doorbell: regs::cq_head_doorbell(qid, doorbell_stride),
        })
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    pub fn sq_bus_addr(&self) -> u64 {
        self.sq.bus_addr()
    }

    pub fn cq_bus_addr(&self) -> u64 {
        self.cq.bus_addr()
    }

    /// Completion ring laps since bring-up or the last reset.
    pub fn cq_laps(&self) -> u64 {
        self.cq_ring.laps()
    }

    /// PRP1/PRP2 for `target`, building the list page for `tag` when the
    /// transfer spans more than two pages.
    fn build_prp(&mut self, tag: u16, target: DmaTarget) -> Result<(u64, u64)> {
        if target.len == 0 || target.bus_addr % 4 != 0 {
            return Err(StorageError::InvalidConfig);
        }
        let offset = target.bus_addr as usize & (PAGE_SIZE - 1);
        let first = PAGE_SIZE - offset;
        if target.len <= first {
            return Ok((target.bus_addr, 0));
        }

        let next = target.bus_addr + first as u64;
        let pages = bytes_to_pages(target.len - first);
        if pages == 1 {
            return Ok((target.bus_addr, next));
        }
        if pages > PRP_LIST_ENTRIES {
            return Err(StorageError::TransferTooLarge);
        }

        let list = tag as usize * PAGE_SIZE;
        for i in 0..pages {
            self.prp_lists
                .write_u64(list + i * 8, next + (i * PAGE_SIZE) as u64);
        }
        Ok((target.bus_addr, self.prp_lists.bus_addr() + list as u64))
    }
}

impl QueueTransport for NvmeQueue {
    type Command = NvmeCommand;

    fn depth(&self) -> u16 {
        self.sq_ring.depth()
    }

    /// One ring slot stays empty to tell full from empty.
    fn capacity(&self) -> u16 {
        self.sq_ring.depth() - 1
    }

    fn has_room(&self) -> bool {
        !self.sq_ring.is_full()
    }

    fn encode(&mut self, tag: u16, command: &NvmeCommand, data: Option<DmaTarget>) -> Result<()> {
        if self.sq_ring.is_full() {
            return Err(StorageError::QueueFull);
        }
        let mut sqe = command.encode(tag);
        match (command.has_data(), data) {
            (true, Some(target)) => {
                let (prp1, prp2) = self.build_prp(tag, target)?;
                sqe.set_prp(prp1, prp2);
            }
            (false, None) => {}
            _ => return Err(StorageError::InvalidConfig),
        }

        let slot = self.sq_ring.tail() as usize * SQE_SIZE;
        for (i, dw) in sqe.0.iter().enumerate() {
            self.sq.write_u32(slot + i * 4, *dw);
        }
        Ok(())
    }

    fn ring_doorbell(&mut self, _tag: u16) {
        self.sq_ring.advance();
        self.regs
            .write32(self.sq_doorbell, self.sq_ring.tail() as u32);
    }

    fn drain(&mut self, sink: &mut dyn FnMut(RawCompletion)) -> usize {
        let mut consumed = 0;
        loop {
            let at = self.cq_ring.head() as usize * CQE_SIZE;
            let dw3 = self.cq.read_u32(at + 12);
            if !self.cq_ring.is_new(phase_of(dw3)) {
                break;
            }
            // Entry body is valid once its phase tag is.
            fence(Ordering::Acquire);
            let cqe = Cqe {
                dw0: self.cq.read_u32(at),
                dw2: self.cq.read_u32(at + 8),
                dw3,
            };

            self.sq_ring.set_head(cqe.sq_head());
            let status = if cqe.is_success() {
                RawStatus::Success
            } else {
                RawStatus::Error(cqe.status() as u32)
            };
            sink(RawCompletion {
                tag: cqe.cid(),
                status,
                value: cqe.dw0,
                bytes: None,
            });

            if self.cq_ring.advance() {
                log::trace!("nvme: q{} completion ring lap {}", self.qid, self.cq_ring.laps());
            }
            consumed += 1;
        }

        if consumed > 0 {
            self.regs
                .write32(self.cq_doorbell, self.cq_ring.head() as u32);
        }
        consumed
    }

    fn rearm(&mut self) -> Result<()> {
        self.sq.zero_range(0, self.sq.len());
        self.cq.zero_range(0, self.cq.len());
        self.sq_ring.reset();
        self.cq_ring.reset();
        Ok(())
    }
}
