//! Simulated NVMe controller.
//!
//! Fetches submission entries when the tail doorbell is written, walks
//! PRP1/PRP2/PRP lists against identity-mapped memory and posts completions
//! with the phase tag written last. Clearing CC.EN deletes every queue, like
//! a controller reset.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use morpheus_storage::hal::PAGE_SIZE;
use morpheus_storage::nvme::command::{admin, cns, io};
use morpheus_storage::nvme::regs::{self, cc, csts};
use morpheus_storage::RegisterIo;

use super::{dma_read, dma_read_u32, dma_read_u64, dma_write, dma_write_u32, set_half};

/// Generic status: Invalid Command Opcode.
const SC_INVALID_OPCODE: u16 = 0x01;
/// Generic status: Invalid Namespace or Format.
const SC_INVALID_NAMESPACE: u16 = 0x0B;
/// Generic status: LBA Out of Range.
const SC_LBA_RANGE: u16 = 0x80;
/// Command specific: Completion Queue Invalid.
const SC_CQ_INVALID: u16 = 0x100;
/// Command specific: Invalid Queue Identifier.
const SC_QID_INVALID: u16 = 0x101;

/// One namespace. `sectors == 0` makes it inactive.
#[derive(Debug, Clone)]
pub struct SimNamespace {
    pub sectors: u64,
    pub sector_size: u32,
}

impl SimNamespace {
    pub fn new(sectors: u64, sector_size: u32) -> Self {
        Self {
            sectors,
            sector_size,
        }
    }

    pub fn inactive() -> Self {
        Self::new(0, 512)
    }
}

/// Submission entry as the controller fetched it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeenSqe {
    pub qid: u16,
    pub opcode: u8,
    pub cid: u16,
    pub nsid: u32,
    pub lba: u64,
    pub nlb: u32,
    pub prp1: u64,
    pub prp2: u64,
    pub dw10: u32,
    pub dw11: u32,
}

impl SeenSqe {
    fn decode(qid: u16, sqe: &[u32; 16]) -> Self {
        Self {
            qid,
            opcode: sqe[0] as u8,
            cid: (sqe[0] >> 16) as u16,
            nsid: sqe[1],
            lba: sqe[10] as u64 | (sqe[11] as u64) << 32,
            nlb: (sqe[12] & 0xFFFF) + 1,
            prp1: sqe[6] as u64 | (sqe[7] as u64) << 32,
            prp2: sqe[8] as u64 | (sqe[9] as u64) << 32,
            dw10: sqe[10],
            dw11: sqe[11],
        }
    }
}

struct SimSq {
    base: u64,
    depth: u16,
    head: u16,
    cqid: u16,
}

struct SimCq {
    base: u64,
    depth: u16,
    tail: u16,
    phase: bool,
}

struct Held {
    qid: u16,
    sqe: [u32; 16],
    sq_head: u16,
}

struct NvmeState {
    mqes: u16,
    timeout_units: u8,
    mdts: u8,
    cc: u32,
    ready: bool,
    fatal: bool,
    never_ready: bool,
    stuck_ready: bool,
    aqa: u32,
    asq: u64,
    acq: u64,
    intmask: u32,

    sqs: BTreeMap<u16, SimSq>,
    cqs: BTreeMap<u16, SimCq>,
    namespaces: Vec<SimNamespace>,
    media: Vec<Vec<u8>>,

    stall_io: bool,
    held: Vec<Held>,
    fail_next_io: Option<u16>,
    /// Survives resets.
    fail_admin: Option<(u8, u16)>,
    resets: u32,
    seen: Vec<SeenSqe>,
}

impl NvmeState {
    fn cap(&self) -> u64 {
        // MQES | TO | DSTRD 0 | CSS NVM | MPSMIN 0
        self.mqes as u64 | (self.timeout_units as u64) << 24 | 1 << 37
    }

    fn write_cc(&mut self, value: u32) {
        let was = self.cc & cc::EN != 0;
        let now = value & cc::EN != 0;
        self.cc = value;

        if !was && now && !self.never_ready {
            self.sqs.insert(
                0,
                SimSq {
                    base: self.asq,
                    depth: (self.aqa & 0xFFF) as u16 + 1,
                    head: 0,
                    cqid: 0,
                },
            );
            self.cqs.insert(
                0,
                SimCq {
                    base: self.acq,
                    depth: ((self.aqa >> 16) & 0xFFF) as u16 + 1,
                    tail: 0,
                    phase: true,
                },
            );
            self.ready = true;
        }
        if was && !now && !self.stuck_ready {
            self.ready = false;
            self.sqs.clear();
            self.cqs.clear();
            self.held.clear();
            self.stall_io = false;
            self.fail_next_io = None;
            self.resets += 1;
        }
    }

    fn ring_sq(&mut self, qid: u16, tail: u16) {
        loop {
            let (sqe, sq_head) = {
                let Some(sq) = self.sqs.get_mut(&qid) else {
                    return;
                };
                if sq.head == tail % sq.depth {
                    return;
                }
                let at = sq.base + sq.head as u64 * 64;
                let mut sqe = [0u32; 16];
                for (i, dw) in sqe.iter_mut().enumerate() {
                    *dw = dma_read_u32(at + i as u64 * 4);
                }
                sq.head = (sq.head + 1) % sq.depth;
                (sqe, sq.head)
            };
            self.seen.push(SeenSqe::decode(qid, &sqe));

            if qid != 0 && self.stall_io {
                self.held.push(Held { qid, sqe, sq_head });
                continue;
            }
            self.run(qid, &sqe, sq_head);
        }
    }

    fn run(&mut self, qid: u16, sqe: &[u32; 16], sq_head: u16) {
        let (status, dw0) = if qid == 0 {
            self.admin(sqe)
        } else {
            (self.io(sqe), 0)
        };
        self.post(qid, (sqe[0] >> 16) as u16, status, dw0, sq_head);
    }

    fn post(&mut self, qid: u16, cid: u16, status: u16, dw0: u32, sq_head: u16) {
        let Some(cqid) = self.sqs.get(&qid).map(|sq| sq.cqid) else {
            return;
        };
        let Some(cq) = self.cqs.get_mut(&cqid) else {
            return;
        };
        let at = cq.base + cq.tail as u64 * 16;
        dma_write_u32(at, dw0);
        dma_write_u32(at + 4, 0);
        dma_write_u32(at + 8, sq_head as u32 | (qid as u32) << 16);
        // Phase tag last: the host polls on it.
        let dw3 = cid as u32 | (cq.phase as u32) << 16 | (status as u32) << 17;
        dma_write_u32(at + 12, dw3);

        cq.tail += 1;
        if cq.tail == cq.depth {
            cq.tail = 0;
            cq.phase = !cq.phase;
        }
    }

    fn admin(&mut self, sqe: &[u32; 16]) -> (u16, u32) {
        let seen = SeenSqe::decode(0, sqe);
        if let Some((opcode, status)) = self.fail_admin {
            if opcode == seen.opcode {
                return (status, 0);
            }
        }
        let status = match seen.opcode {
            admin::IDENTIFY => {
                let data = match seen.dw10 & 0xFF {
                    cns::CONTROLLER => self.controller_identify(),
                    cns::NAMESPACE => self.namespace_identify(seen.nsid),
                    _ => return (SC_INVALID_OPCODE, 0),
                };
                scatter(&prp_segments(seen.prp1, seen.prp2, data.len()), &data);
                0
            }
            admin::CREATE_IO_CQ => {
                let qid = seen.dw10 as u16;
                if qid == 0 || self.cqs.contains_key(&qid) {
                    SC_QID_INVALID
                } else {
                    self.cqs.insert(
                        qid,
                        SimCq {
                            base: seen.prp1,
                            depth: (seen.dw10 >> 16) as u16 + 1,
                            tail: 0,
                            phase: true,
                        },
                    );
                    0
                }
            }
            admin::CREATE_IO_SQ => {
                let qid = seen.dw10 as u16;
                let cqid = (seen.dw11 >> 16) as u16;
                if !self.cqs.contains_key(&cqid) {
                    SC_CQ_INVALID
                } else if qid == 0 || self.sqs.contains_key(&qid) {
                    SC_QID_INVALID
                } else {
                    self.sqs.insert(
                        qid,
                        SimSq {
                            base: seen.prp1,
                            depth: (seen.dw10 >> 16) as u16 + 1,
                            head: 0,
                            cqid,
                        },
                    );
                    0
                }
            }
            _ => SC_INVALID_OPCODE,
        };
        (status, 0)
    }

    fn io(&mut self, sqe: &[u32; 16]) -> u16 {
        let seen = SeenSqe::decode(1, sqe);
        let index = seen.nsid as usize;
        if index == 0 || index > self.namespaces.len() || self.namespaces[index - 1].sectors == 0 {
            return SC_INVALID_NAMESPACE;
        }
        if let Some(status) = self.fail_next_io.take() {
            return status;
        }

        let ns = &self.namespaces[index - 1];
        let ss = ns.sector_size as usize;
        match seen.opcode {
            io::READ | io::WRITE => {
                if seen.lba + seen.nlb as u64 > ns.sectors {
                    return SC_LBA_RANGE;
                }
                let start = seen.lba as usize * ss;
                let len = seen.nlb as usize * ss;
                let segments = prp_segments(seen.prp1, seen.prp2, len);
                let media = &mut self.media[index - 1][start..start + len];
                if seen.opcode == io::READ {
                    scatter(&segments, media);
                } else {
                    gather(&segments, media);
                }
                0
            }
            io::FLUSH => 0,
            _ => SC_INVALID_OPCODE,
        }
    }

    fn controller_identify(&self) -> Vec<u8> {
        let mut data = vec![0u8; 4096];
        data[0..2].copy_from_slice(&0x1b36u16.to_le_bytes());
        put_str(&mut data[4..24], "SIMNVME0");
        put_str(&mut data[24..64], "MORPHEUS SIM NVME");
        put_str(&mut data[64..72], "1.0");
        data[77] = self.mdts;
        data[516..520].copy_from_slice(&(self.namespaces.len() as u32).to_le_bytes());
        data
    }

    fn namespace_identify(&self, nsid: u32) -> Vec<u8> {
        let mut data = vec![0u8; 4096];
        let Some(ns) = (nsid as usize)
            .checked_sub(1)
            .and_then(|i| self.namespaces.get(i))
        else {
            return data;
        };
        for at in [0usize, 8, 16] {
            data[at..at + 8].copy_from_slice(&ns.sectors.to_le_bytes());
        }
        let lbads = ns.sector_size.trailing_zeros();
        data[128..132].copy_from_slice(&(lbads << 16).to_le_bytes());
        data
    }
}

fn put_str(field: &mut [u8], s: &str) {
    field.fill(b' ');
    field[..s.len()].copy_from_slice(s.as_bytes());
}

/// Data segments described by PRP1/PRP2 for a `len` byte transfer.
fn prp_segments(prp1: u64, prp2: u64, len: usize) -> Vec<(u64, usize)> {
    let first = len.min(PAGE_SIZE - (prp1 as usize % PAGE_SIZE));
    let mut segments = vec![(prp1, first)];
    let mut remaining = len - first;
    if remaining == 0 {
        return segments;
    }
    if remaining <= PAGE_SIZE {
        segments.push((prp2, remaining));
        return segments;
    }
    let mut entry = prp2;
    while remaining > 0 {
        let n = remaining.min(PAGE_SIZE);
        segments.push((dma_read_u64(entry), n));
        remaining -= n;
        entry += 8;
    }
    segments
}

fn scatter(segments: &[(u64, usize)], src: &[u8]) {
    let mut done = 0;
    for &(addr, len) in segments {
        dma_write(addr, &src[done..done + len]);
        done += len;
    }
}

fn gather(segments: &[(u64, usize)], dst: &mut [u8]) {
    let mut done = 0;
    for &(addr, len) in segments {
        dma_read(addr, &mut dst[done..done + len]);
        done += len;
    }
}

/// Simulated NVMe controller with doorbell stride 0.
pub struct SimNvme {
    state: Mutex<NvmeState>,
}

impl SimNvme {
    pub fn new(namespaces: Vec<SimNamespace>) -> Arc<Self> {
        let media = namespaces
            .iter()
            .map(|ns| vec![0u8; (ns.sectors * ns.sector_size as u64) as usize])
            .collect();
        Arc::new(Self {
            state: Mutex::new(NvmeState {
                mqes: 1023,
                timeout_units: 1,
                mdts: 5,
                cc: 0,
                ready: false,
                fatal: false,
                never_ready: false,
                stuck_ready: false,
                aqa: 0,
                asq: 0,
                acq: 0,
                intmask: 0,
                sqs: BTreeMap::new(),
                cqs: BTreeMap::new(),
                namespaces,
                media,
                stall_io: false,
                held: Vec::new(),
                fail_next_io: None,
                fail_admin: None,
                resets: 0,
                seen: Vec::new(),
            }),
        })
    }

    pub fn regs(self: &Arc<Self>) -> Arc<dyn RegisterIo> {
        Arc::clone(self) as Arc<dyn RegisterIo>
    }

    /// MDTS as a power of two in 4KB pages, 0 for unlimited.
    pub fn set_mdts(&self, mdts: u8) {
        self.state.lock().unwrap().mdts = mdts;
    }

    /// Zero-based maximum queue entries.
    pub fn set_mqes(&self, mqes: u16) {
        self.state.lock().unwrap().mqes = mqes;
    }

    /// CSTS.RDY never follows CC.EN.
    pub fn set_never_ready(&self, never: bool) {
        self.state.lock().unwrap().never_ready = never;
    }

    /// CSTS.RDY stays set once CC.EN is cleared.
    pub fn set_stuck_ready(&self, stuck: bool) {
        self.state.lock().unwrap().stuck_ready = stuck;
    }

    pub fn set_fatal(&self, fatal: bool) {
        self.state.lock().unwrap().fatal = fatal;
    }

    /// Fetch I/O commands without completing them.
    pub fn stall_io(&self) {
        self.state.lock().unwrap().stall_io = true;
    }

    /// Complete held I/O commands and stop stalling.
    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        state.stall_io = false;
        let held = std::mem::take(&mut state.held);
        for h in held {
            state.run(h.qid, &h.sqe, h.sq_head);
        }
    }

    /// Complete the next I/O command with raw status `status`.
    pub fn fail_next_io(&self, status: u16) {
        self.state.lock().unwrap().fail_next_io = Some(status);
    }

    /// Complete every admin command with `opcode` with raw status `status`.
    pub fn fail_admin(&self, opcode: u8, status: u16) {
        self.state.lock().unwrap().fail_admin = Some((opcode, status));
    }

    /// CC.EN as last written.
    pub fn enabled(&self) -> bool {
        self.state.lock().unwrap().cc & cc::EN != 0
    }

    /// Controller resets (CC.EN 1 -> 0) observed.
    pub fn resets(&self) -> u32 {
        self.state.lock().unwrap().resets
    }

    pub fn held(&self) -> usize {
        self.state.lock().unwrap().held.len()
    }

    pub fn io_queue_count(&self) -> usize {
        self.state.lock().unwrap().sqs.keys().filter(|&&q| q != 0).count()
    }

    pub fn seen(&self) -> Vec<SeenSqe> {
        self.state.lock().unwrap().seen.clone()
    }

    pub fn seen_io(&self) -> Vec<SeenSqe> {
        self.seen().into_iter().filter(|s| s.qid != 0).collect()
    }

    pub fn media(&self, nsid: u32, lba: u64, sectors: u32) -> Vec<u8> {
        let state = self.state.lock().unwrap();
        let ss = state.namespaces[nsid as usize - 1].sector_size as usize;
        let start = lba as usize * ss;
        state.media[nsid as usize - 1][start..start + sectors as usize * ss].to_vec()
    }

    pub fn fill_media(&self, nsid: u32, lba: u64, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let ss = state.namespaces[nsid as usize - 1].sector_size as usize;
        let start = lba as usize * ss;
        state.media[nsid as usize - 1][start..start + data.len()].copy_from_slice(data);
    }
}

impl RegisterIo for SimNvme {
    fn read32(&self, offset: usize) -> u32 {
        let state = self.state.lock().unwrap();
        match offset {
            regs::CAP => state.cap() as u32,
            0x04 => (state.cap() >> 32) as u32,
            regs::VS => 0x0001_0400,
            regs::INTMS | regs::INTMC => state.intmask,
            regs::CC => state.cc,
            regs::CSTS => {
                let mut value = 0;
                if state.ready {
                    value |= csts::RDY;
                }
                if state.fatal {
                    value |= csts::CFS;
                }
                value
            }
            regs::AQA => state.aqa,
            regs::ASQ => state.asq as u32,
            0x2C => (state.asq >> 32) as u32,
            regs::ACQ => state.acq as u32,
            0x34 => (state.acq >> 32) as u32,
            _ => 0,
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut state = self.state.lock().unwrap();
        match offset {
            regs::INTMS => state.intmask |= value,
            regs::INTMC => state.intmask &= !value,
            regs::CC => state.write_cc(value),
            regs::AQA => state.aqa = value,
            regs::ASQ => set_half(&mut state.asq, false, value),
            0x2C => set_half(&mut state.asq, true, value),
            regs::ACQ => set_half(&mut state.acq, false, value),
            0x34 => set_half(&mut state.acq, true, value),
            off if off >= regs::DOORBELL_BASE => {
                let index = (off - regs::DOORBELL_BASE) / 4;
                let qid = (index / 2) as u16;
                // CQ head doorbells need no action: the simulator never
                // fills a completion ring.
                if index % 2 == 0 {
                    state.ring_sq(qid, value as u16);
                }
            }
            _ => {}
        }
    }
}
