//! Simulated AHCI HBA.
//!
//! Models the register behaviour the engine depends on: GHC.HR, port
//! start/stop (`CR`/`FR` follow `ST`/`FRE`), write-1-to-set `PxCI`,
//! write-1-to-clear `PxIS`/`PxSERR`/`IS`, and the task file error halt
//! where remaining slots stay in `PxCI` until the port is restarted.

use std::sync::{Arc, Mutex};

use morpheus_storage::ahci::regs::{ata, cap, cmd, ghc, hba, port as pxreg, pxis, signature};
use morpheus_storage::ahci::regs::{PORT_BASE, PORT_STRIDE};
use morpheus_storage::RegisterIo;

use super::{dma_read, dma_read_u32, dma_read_u64, dma_write, dma_write_u32, set_half};

/// DRDY | DSC
const TFD_IDLE: u32 = 0x50;
/// IDNF in error, ERR | DRDY in status.
const TFD_IDNF: u32 = 0x1051;
/// ABRT in error, ERR | DRDY | DSC in status.
const TFD_ABRT: u32 = 0x0451;
/// BSY
const TFD_BUSY: u32 = 0x80;

/// One device behind a simulated port.
#[derive(Debug, Clone)]
pub struct SimAhciDisk {
    pub sectors: u64,
    pub sector_size: u32,
    pub lba48: bool,
    pub signature: u32,
}

impl SimAhciDisk {
    pub fn ata(sectors: u64) -> Self {
        Self {
            sectors,
            sector_size: 512,
            lba48: true,
            signature: signature::ATA,
        }
    }

    pub fn lba28(sectors: u64) -> Self {
        Self {
            lba48: false,
            ..Self::ata(sectors)
        }
    }

    pub fn atapi() -> Self {
        Self {
            signature: signature::ATAPI,
            ..Self::ata(1024)
        }
    }
}

fn put_word(data: &mut [u8], n: usize, value: u16) {
    data[n * 2..n * 2 + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_string(data: &mut [u8], first: usize, last: usize, s: &str) {
    let field = &mut data[first * 2..(last + 1) * 2];
    field.fill(b' ');
    for (i, b) in s.bytes().enumerate() {
        // ATA strings swap the bytes of each word.
        field[i ^ 1] = b;
    }
}

/// IDENTIFY DEVICE data for `disk`.
pub fn ata_identify(disk: &SimAhciDisk, port: u32) -> Vec<u8> {
    let mut data = vec![0u8; 512];
    put_word(&mut data, 0, 0x0040);
    put_string(&mut data, 10, 19, &format!("SIM{:04}", port));
    put_string(&mut data, 23, 26, "1.0");
    put_string(&mut data, 27, 46, "MORPHEUS SIM DISK");
    put_word(&mut data, 49, 1 << 9 | 1 << 8);
    let low = disk.sectors.min(0x0FFF_FFFF);
    put_word(&mut data, 60, low as u16);
    put_word(&mut data, 61, (low >> 16) as u16);
    put_word(&mut data, 75, 31);
    put_word(&mut data, 76, 1 << 8);
    put_word(&mut data, 83, 1 << 14 | if disk.lba48 { 1 << 10 } else { 0 });
    if disk.lba48 {
        for i in 0..4 {
            put_word(&mut data, 100 + i, (disk.sectors >> (16 * i)) as u16);
        }
    }
    if disk.sector_size == 512 {
        put_word(&mut data, 106, 0x4000);
    } else {
        let words = disk.sector_size / 2;
        put_word(&mut data, 106, 0x4000 | 1 << 12);
        put_word(&mut data, 117, words as u16);
        put_word(&mut data, 118, (words >> 16) as u16);
    }
    data
}

/// Command as the device saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeenCommand {
    pub opcode: u8,
    pub lba: u64,
    pub count: u32,
    pub prdtl: u32,
    pub write: bool,
}

struct SimPort {
    disk: SimAhciDisk,
    linked: bool,
    media: Vec<u8>,
    identify: Vec<u8>,

    clb: u64,
    fb: u64,
    is: u32,
    ie: u32,
    cmd: u32,
    ccs: u32,
    tfd: u32,
    serr: u32,
    ci: u32,

    stall: bool,
    halted: bool,
    held: Vec<u32>,
    fail_next: Option<u32>,
    seen: Vec<SeenCommand>,

    // Survive a hard reset.
    busy: bool,
    reject_identify: bool,
}

impl SimPort {
    fn new(disk: SimAhciDisk, port: u32) -> Self {
        let media = vec![0u8; (disk.sectors * disk.sector_size as u64) as usize];
        let identify = ata_identify(&disk, port);
        Self {
            disk,
            linked: true,
            media,
            identify,
            clb: 0,
            fb: 0,
            is: 0,
            ie: 0,
            cmd: 0,
            ccs: 0,
            tfd: TFD_IDLE,
            serr: 0,
            ci: 0,
            stall: false,
            halted: false,
            held: Vec::new(),
            fail_next: None,
            seen: Vec::new(),
            busy: false,
            reject_identify: false,
        }
    }

    fn hard_reset(&mut self) {
        self.is = 0;
        self.ie = 0;
        self.cmd = 0;
        self.ccs = 0;
        self.tfd = TFD_IDLE;
        self.serr = 0;
        self.ci = 0;
        self.stall = false;
        self.halted = false;
        self.held.clear();
        self.fail_next = None;
    }

    fn read_cmd(&self) -> u32 {
        let mut value = self.cmd | self.ccs << 8;
        if self.cmd & cmd::ST != 0 {
            value |= cmd::CR;
        }
        if self.cmd & cmd::FRE != 0 {
            value |= cmd::FR;
        }
        value
    }

    fn write_cmd(&mut self, value: u32) {
        let was_running = self.cmd & cmd::ST != 0;
        self.cmd = value & (cmd::ST | cmd::SUD | cmd::POD | cmd::FRE);
        let running = self.cmd & cmd::ST != 0;
        if was_running && !running {
            self.ci = 0;
            self.held.clear();
            self.halted = false;
        }
        if !was_running && running {
            self.tfd = TFD_IDLE;
        }
    }

    /// Returns true when the HBA-level interrupt bit should be raised.
    fn issue(&mut self, value: u32) -> bool {
        if self.cmd & cmd::ST == 0 {
            return false;
        }
        let new = value & !self.ci;
        self.ci |= new;
        let mut raised = false;
        for slot in 0..32 {
            if new & (1 << slot) == 0 {
                continue;
            }
            if self.stall || self.halted {
                self.held.push(slot);
            } else {
                raised |= self.execute(slot);
            }
        }
        raised
    }

    fn release(&mut self) -> bool {
        self.stall = false;
        let held = std::mem::take(&mut self.held);
        let mut raised = false;
        for slot in held {
            if self.ci & (1 << slot) == 0 {
                continue;
            }
            if self.halted {
                self.held.push(slot);
            } else {
                raised |= self.execute(slot);
            }
        }
        raised
    }

    fn execute(&mut self, slot: u32) -> bool {
        let header = self.clb + slot as u64 * 32;
        let dw0 = dma_read_u32(header);
        let prdtl = dw0 >> 16;
        let write = dw0 & (1 << 6) != 0;
        let ctba = dma_read_u64(header + 8);

        let fis: Vec<u32> = (0..5).map(|i| dma_read_u32(ctba + i * 4)).collect();
        let opcode = (fis[0] >> 16) as u8;
        let device = (fis[1] >> 24) as u8;
        let ext = matches!(opcode, ata::READ_DMA_EXT | ata::WRITE_DMA_EXT);
        let (lba, count) = if ext {
            let lba = (fis[1] & 0xFF_FFFF) as u64 | ((fis[2] & 0xFF_FFFF) as u64) << 24;
            let count = match fis[3] & 0xFFFF {
                0 => 65536,
                n => n,
            };
            (lba, count)
        } else {
            let lba = (fis[1] & 0xFF_FFFF) as u64 | ((device & 0xF) as u64) << 24;
            let count = match fis[3] & 0xFF {
                0 => 256,
                n => n,
            };
            (lba, count)
        };

        let prds: Vec<(u64, usize)> = (0..prdtl as u64)
            .map(|i| {
                let entry = ctba + 0x80 + i * 16;
                let dbc = (dma_read_u32(entry + 12) & 0x3F_FFFF) as usize + 1;
                (dma_read_u64(entry), dbc)
            })
            .collect();

        self.seen.push(SeenCommand {
            opcode,
            lba,
            count,
            prdtl,
            write,
        });

        if let Some(tfd) = self.fail_next.take() {
            return self.fail(slot, tfd);
        }
        if opcode == ata::IDENTIFY && self.reject_identify {
            return self.fail(slot, TFD_ABRT);
        }

        let ss = self.disk.sector_size as u64;
        let result = match opcode {
            ata::IDENTIFY => Some(scatter(&prds, &self.identify)),
            ata::READ_DMA | ata::READ_DMA_EXT => {
                if lba + count as u64 > self.disk.sectors {
                    None
                } else {
                    let range = (lba * ss) as usize..((lba + count as u64) * ss) as usize;
                    Some(scatter(&prds, &self.media[range]))
                }
            }
            ata::WRITE_DMA | ata::WRITE_DMA_EXT => {
                if lba + count as u64 > self.disk.sectors {
                    None
                } else {
                    let range = (lba * ss) as usize..((lba + count as u64) * ss) as usize;
                    Some(gather(&prds, &mut self.media[range]))
                }
            }
            ata::FLUSH_CACHE | ata::FLUSH_CACHE_EXT => Some(0),
            _ => None,
        };

        match result {
            Some(bytes) => {
                dma_write_u32(header + 4, bytes as u32);
                self.ci &= !(1 << slot);
                self.tfd = TFD_IDLE;
                self.is |= pxis::DHRS;
                true
            }
            None => self.fail(slot, TFD_IDNF),
        }
    }

    fn fail(&mut self, slot: u32, tfd: u32) -> bool {
        self.tfd = tfd;
        self.ccs = slot;
        self.is |= pxis::TFES;
        self.halted = true;
        true
    }
}

fn scatter(prds: &[(u64, usize)], src: &[u8]) -> usize {
    let mut done = 0;
    for &(addr, len) in prds {
        let n = len.min(src.len() - done);
        dma_write(addr, &src[done..done + n]);
        done += n;
        if done == src.len() {
            break;
        }
    }
    done
}

fn gather(prds: &[(u64, usize)], dst: &mut [u8]) -> usize {
    let mut done = 0;
    for &(addr, len) in prds {
        let n = len.min(dst.len() - done);
        dma_read(addr, &mut dst[done..done + n]);
        done += n;
        if done == dst.len() {
            break;
        }
    }
    done
}

struct HbaState {
    cap: u32,
    ghc: u32,
    is: u32,
    pi: u32,
    ports: Vec<Option<SimPort>>,
    resets: u32,
    hang_reset: bool,
}

impl HbaState {
    fn write_ghc(&mut self, value: u32) {
        if value & ghc::HR != 0 {
            if self.hang_reset {
                self.ghc = value;
                return;
            }
            for port in self.ports.iter_mut().flatten() {
                port.hard_reset();
            }
            self.ghc = 0;
            self.is = 0;
            self.resets += 1;
            return;
        }
        self.ghc = value & (ghc::AE | ghc::IE);
    }

    fn read_port(&self, port: usize, reg: usize) -> u32 {
        let Some(p) = self.ports.get(port).and_then(Option::as_ref) else {
            return 0;
        };
        match reg {
            pxreg::CLB => p.clb as u32,
            0x04 => (p.clb >> 32) as u32,
            pxreg::FB => p.fb as u32,
            0x0C => (p.fb >> 32) as u32,
            pxreg::IS => p.is,
            pxreg::IE => p.ie,
            pxreg::CMD => p.read_cmd(),
            pxreg::TFD => {
                if p.busy {
                    p.tfd | TFD_BUSY
                } else {
                    p.tfd
                }
            }
            pxreg::SIG => p.disk.signature,
            pxreg::SSTS => {
                if p.linked {
                    0x113
                } else {
                    0
                }
            }
            pxreg::SERR => p.serr,
            pxreg::CI => p.ci,
            _ => 0,
        }
    }

    fn write_port(&mut self, port: usize, reg: usize, value: u32) {
        let Some(p) = self.ports.get_mut(port).and_then(Option::as_mut) else {
            return;
        };
        let raised = match reg {
            pxreg::CLB => {
                set_half(&mut p.clb, false, value);
                false
            }
            0x04 => {
                set_half(&mut p.clb, true, value);
                false
            }
            pxreg::FB => {
                set_half(&mut p.fb, false, value);
                false
            }
            0x0C => {
                set_half(&mut p.fb, true, value);
                false
            }
            pxreg::IS => {
                p.is &= !value;
                false
            }
            pxreg::IE => {
                p.ie = value;
                false
            }
            pxreg::CMD => {
                p.write_cmd(value);
                false
            }
            pxreg::SERR => {
                p.serr &= !value;
                false
            }
            pxreg::CI => p.issue(value),
            _ => false,
        };
        if raised {
            self.is |= 1 << port;
        }
    }
}

/// Simulated HBA with devices on selected ports.
pub struct SimAhci {
    state: Mutex<HbaState>,
}

impl SimAhci {
    /// HBA with `slots` command slots per port and `disks` attached.
    pub fn new(slots: u32, disks: &[(u32, SimAhciDisk)]) -> Arc<Self> {
        let mut ports: Vec<Option<SimPort>> = (0..32).map(|_| None).collect();
        let mut pi = 0u32;
        let mut highest = 0u32;
        for (port, disk) in disks {
            ports[*port as usize] = Some(SimPort::new(disk.clone(), *port));
            pi |= 1 << port;
            highest = highest.max(*port);
        }
        let cap_raw = cap::S64A | cap::SNCQ | (slots - 1) << 8 | highest;
        Arc::new(Self {
            state: Mutex::new(HbaState {
                cap: cap_raw,
                ghc: 0,
                is: 0,
                pi,
                ports,
                resets: 0,
                hang_reset: false,
            }),
        })
    }

    pub fn regs(self: &Arc<Self>) -> Arc<dyn RegisterIo> {
        Arc::clone(self) as Arc<dyn RegisterIo>
    }

    fn with_port<R>(&self, port: u32, f: impl FnOnce(&mut SimPort) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        let p = state.ports[port as usize]
            .as_mut()
            .expect("no device on simulated port");
        f(p)
    }

    /// Hold newly issued commands without completing them.
    pub fn stall(&self, port: u32) {
        self.with_port(port, |p| p.stall = true);
    }

    /// Complete held commands and stop stalling.
    pub fn release(&self, port: u32) {
        let mut state = self.state.lock().unwrap();
        let raised = state.ports[port as usize]
            .as_mut()
            .map_or(false, |p| p.release());
        if raised {
            state.is |= 1 << port;
        }
    }

    /// Fail the next executed command with task file `tfd`.
    pub fn fail_next(&self, port: u32, tfd: u32) {
        self.with_port(port, |p| p.fail_next = Some(tfd));
    }

    /// Task file reports BSY from now on, through resets.
    pub fn set_busy(&self, port: u32, busy: bool) {
        self.with_port(port, |p| p.busy = busy);
    }

    /// Abort every IDENTIFY DEVICE, through resets.
    pub fn reject_identify(&self, port: u32) {
        self.with_port(port, |p| p.reject_identify = true);
    }

    /// PxCMD as the engine reads it.
    pub fn port_cmd(&self, port: u32) -> u32 {
        self.with_port(port, |p| p.read_cmd())
    }

    pub fn set_link(&self, port: u32, up: bool) {
        self.with_port(port, |p| p.linked = up);
    }

    /// GHC.HR never self-clears.
    pub fn hang_reset(&self, hang: bool) {
        self.state.lock().unwrap().hang_reset = hang;
    }

    /// HBA resets performed.
    pub fn resets(&self) -> u32 {
        self.state.lock().unwrap().resets
    }

    pub fn interrupt_pending(&self) -> bool {
        self.state.lock().unwrap().is != 0
    }

    pub fn seen(&self, port: u32) -> Vec<SeenCommand> {
        self.with_port(port, |p| p.seen.clone())
    }

    pub fn held(&self, port: u32) -> usize {
        self.with_port(port, |p| p.held.len())
    }

    pub fn media(&self, port: u32, lba: u64, sectors: u32) -> Vec<u8> {
        self.with_port(port, |p| {
            let ss = p.disk.sector_size as usize;
            let start = lba as usize * ss;
            p.media[start..start + sectors as usize * ss].to_vec()
        })
    }

    pub fn fill_media(&self, port: u32, lba: u64, data: &[u8]) {
        self.with_port(port, |p| {
            let start = lba as usize * p.disk.sector_size as usize;
            p.media[start..start + data.len()].copy_from_slice(data);
        })
    }
}

impl RegisterIo for SimAhci {
    fn read32(&self, offset: usize) -> u32 {
        let state = self.state.lock().unwrap();
        if offset >= PORT_BASE {
            let port = (offset - PORT_BASE) / PORT_STRIDE;
            return state.read_port(port, (offset - PORT_BASE) % PORT_STRIDE);
        }
        match offset {
            hba::CAP => state.cap,
            hba::GHC => state.ghc,
            hba::IS => state.is,
            hba::PI => state.pi,
            hba::VS => 0x0001_0301,
            _ => 0,
        }
    }

    fn write32(&self, offset: usize, value: u32) {
        let mut state = self.state.lock().unwrap();
        if offset >= PORT_BASE {
            let port = (offset - PORT_BASE) / PORT_STRIDE;
            state.write_port(port, (offset - PORT_BASE) % PORT_STRIDE, value);
            return;
        }
        match offset {
            hba::GHC => state.write_ghc(value),
            hba::IS => state.is &= !value,
            _ => {}
        }
    }
}
