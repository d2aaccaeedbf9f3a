//! One AHCI port as a queue transport.
//!
//! Tags map one-to-one onto command slots. A command is in flight while
//! its bit is set in `PxCI`; the HBA clears the bit when the device
//! finishes.
//!
//! # Task file errors
//! On `PxIS.TFES` the HBA stops processing the command list. The slot in
//! `PxCMD.CCS` is the one that failed; slots already cleared in `PxCI`
//! completed normally. Recovery stops and restarts the command engine,
//! reports the failing slot with the task file as its status and re-issues
//! every other slot that was still pending.

use alloc::sync::Arc;

use super::command::{build_prdt, header_dw0, AhciCommand, Prd};
use super::regs::{cmd, port, port_reg, pxis, size, ssts, tfd};
use crate::config::EngineConfig;
use crate::error::{Result, StorageError};
use crate::hal::{poll_until, DmaBuffer, DmaTarget, Hal, RegisterIo};
use crate::queue::{QueueTransport, RawCompletion, RawStatus};

/// Offset of the received-FIS area inside the command list buffer.
const FIS_OFFSET: usize = size::CMD_LIST;

pub struct AhciPort {
    regs: Arc<dyn RegisterIo>,
    hal: Arc<dyn Hal>,
    port: u32,
    depth: u16,
    s64a: bool,
    /// Command list at 0, received FIS at `FIS_OFFSET`.
    cmd_list: DmaBuffer,
    /// One command table per slot.
    tables: DmaBuffer,
    /// Slots rung and not yet reaped.
    issued: u32,
    ready_timeout_ms: u64,
    max_poll: u32,
}

impl AhciPort {
    /// Allocate the port's DMA structures. Does not touch the hardware.
    pub fn new(
        regs: Arc<dyn RegisterIo>,
        hal: Arc<dyn Hal>,
        port: u32,
        depth: u16,
        s64a: bool,
        config: &EngineConfig,
    ) -> Result<Self> {
        if depth < 2 || depth > 32 || !depth.is_power_of_two() {
            return Err(StorageError::InvalidConfig);
        }
        let cmd_list = DmaBuffer::alloc(&hal, size::CMD_LIST + size::FIS)?;
        let tables = DmaBuffer::alloc(&hal, depth as usize * size::CMD_TABLE)?;

        let end = tables.bus_addr() + tables.len() as u64;
        if !s64a && (cmd_list.bus_addr() >> 32 != 0 || end >> 32 != 0) {
            log::error!("ahci: port {} DMA memory above 4GB and HBA lacks S64A", port);
            return Err(StorageError::OutOfMemory);
        }

        Ok(Self {
            regs,
            hal,
            port,
            depth,
            s64a,
            cmd_list,
            tables,
            issued: 0,
            ready_timeout_ms: config.ready_timeout_ms,
            max_poll: config.max_poll_iterations,
        })
    }

    pub fn port(&self) -> u32 {
        self.port
    }

    #[inline]
    fn read(&self, reg: usize) -> u32 {
        self.regs.read32(port_reg(self.port, reg))
    }

    #[inline]
    fn write(&self, reg: usize, value: u32) {
        self.regs.write32(port_reg(self.port, reg), value)
    }

    pub fn link_up(&self) -> bool {
        ssts::link_up(self.read(port::SSTS))
    }

    /// Task file data (status in bits 0-7, error in bits 8-15).
    pub fn task_file(&self) -> u32 {
        self.read(port::TFD)
    }

    fn wait_clear(&self, reg: usize, mask: u32) -> bool {
        poll_until(self.hal.as_ref(), self.ready_timeout_ms, self.max_poll, || {
            self.read(reg) & mask == 0
        })
    }

    /// Stop the command engine and FIS receive.
    pub fn stop(&self) -> Result<()> {
        let c = self.read(port::CMD);
        self.write(port::CMD, c & !cmd::ST);
        if !self.wait_clear(port::CMD, cmd::CR) {
            log::warn!("ahci: port {} command list still running after stop", self.port);
            return Err(StorageError::EnableTimeout);
        }

        let c = self.read(port::CMD);
        self.write(port::CMD, c & !cmd::FRE);
        if !self.wait_clear(port::CMD, cmd::FR) {
            log::warn!("ahci: port {} FIS receive still running after stop", self.port);
            return Err(StorageError::EnableTimeout);
        }
        Ok(())
    }

    fn start_engine(&self) -> Result<()> {
        let c = self.read(port::CMD);
        self.write(port::CMD, c | cmd::FRE | cmd::POD | cmd::SUD);

        if !self.wait_clear(port::TFD, tfd::STS_BSY | tfd::STS_DRQ) {
            log::warn!(
                "ahci: port {} device busy (TFD {:#x}), not starting",
                self.port,
                self.task_file()
            );
            return Err(StorageError::EnableTimeout);
        }

        let c = self.read(port::CMD);
        self.write(port::CMD, c | cmd::ST);
        Ok(())
    }

    /// Program the command list and FIS area, clear errors, enable
    /// interrupts and start the port.
    pub fn start(&mut self) -> Result<()> {
        self.stop()?;

        self.cmd_list.zero_range(0, size::CMD_LIST + size::FIS);
        self.issued = 0;

        self.regs
            .write64(port_reg(self.port, port::CLB), self.cmd_list.bus_addr());
        self.regs.write64(
            port_reg(self.port, port::FB),
            self.cmd_list.bus_addr() + FIS_OFFSET as u64,
        );

        self.write(port::SERR, u32::MAX);
        self.write(port::IS, u32::MAX);
        self.write(port::IE, pxis::ENABLED);

        self.start_engine()?;
        log::debug!("ahci: port {} started, {} slots", self.port, self.depth);
        Ok(())
    }

    #[inline]
    fn header_offset(tag: u16) -> usize {
        tag as usize * size::CMD_HEADER
    }

    #[inline]
    fn table_offset(tag: u16) -> usize {
        tag as usize * size::CMD_TABLE
    }

    fn complete(&self, tag: u16, sink: &mut dyn FnMut(RawCompletion)) {
        let prdbc = self.cmd_list.read_u32(Self::header_offset(tag) + 4);
        sink(RawCompletion {
            tag,
            status: RawStatus::Success,
            value: 0,
            bytes: Some(prdbc),
        });
    }

    fn complete_mask(&self, mask: u32, sink: &mut dyn FnMut(RawCompletion)) -> usize {
        let mut n = 0;
        for tag in 0..self.depth {
            if mask & (1 << tag) != 0 {
                self.complete(tag, sink);
                n += 1;
            }
        }
        n
    }

    fn recover(&mut self, is: u32, sink: &mut dyn FnMut(RawCompletion)) -> usize {
        let task_file = self.task_file();
        let ci = self.read(port::CI);
        let failing = cmd::current_slot(self.read(port::CMD));
        let failing_bit = 1u32 << failing;

        log::warn!(
            "ahci: port {} error (IS {:#x}, status {:#x}, error {:#x}), slot {} failed",
            self.port,
            is,
            tfd::status(task_file),
            tfd::error(task_file),
            failing
        );

        let mut reaped = self.complete_mask(self.issued & !ci, sink);

        // Stopping the engine clears PxCI.
        if let Err(e) = self.stop() {
            log::error!("ahci: port {} stop during recovery failed: {}", self.port, e);
        }
        self.write(port::SERR, u32::MAX);
        self.write(port::IS, u32::MAX);
        if let Err(e) = self.start_engine() {
            log::error!("ahci: port {} restart during recovery failed: {}", self.port, e);
        }

        if self.issued & ci & failing_bit != 0 {
            sink(RawCompletion {
                tag: failing as u16,
                status: RawStatus::Error(task_file & 0xFFFF),
                value: 0,
                bytes: None,
            });
            reaped += 1;
        }

        let survivors = self.issued & ci & !failing_bit;
        self.issued = survivors;
        if survivors != 0 {
            for tag in 0..self.depth {
                if survivors & (1 << tag) != 0 {
                    self.cmd_list.write_u32(Self::header_offset(tag) + 4, 0);
                }
            }
            log::debug!("ahci: port {} re-issuing slots {:#x}", self.port, survivors);
            self.write(port::CI, survivors);
        }
        reaped
    }
}

impl QueueTransport for AhciPort {
    type Command = AhciCommand;

    fn depth(&self) -> u16 {
        self.depth
    }

    /// Same full rule as a ring: one slot of `depth` stays unused.
    fn capacity(&self) -> u16 {
        self.depth - 1
    }

    fn encode(&mut self, tag: u16, command: &AhciCommand, data: Option<DmaTarget>) -> Result<()> {
        if tag >= self.depth {
            return Err(StorageError::InvalidConfig);
        }
        let fis = command.fis()?;
        let (prds, used) = match (command.has_data(), data) {
            (true, Some(target)) => {
                if !self.s64a && (target.bus_addr + target.len as u64) >> 32 != 0 {
                    return Err(StorageError::OutOfMemory);
                }
                build_prdt(target)?
            }
            (false, None) => ([Prd::default(); size::PRDT_ENTRIES], 0),
            _ => return Err(StorageError::InvalidConfig),
        };

        let table = Self::table_offset(tag);
        self.tables.zero_range(table, size::CMD_TABLE);
        for (i, dw) in fis.iter().enumerate() {
            self.tables.write_u32(table + i * 4, *dw);
        }
        for (i, prd) in prds[..used].iter().enumerate() {
            let entry = table + size::PRDT_OFFSET + i * size::PRDT_ENTRY;
            self.tables.write_u64(entry, prd.addr);
            self.tables.write_u32(entry + 12, prd.dw3);
        }

        let header = Self::header_offset(tag);
        self.cmd_list
            .write_u32(header, header_dw0(used as u16, command.is_write()));
        self.cmd_list.write_u32(header + 4, 0);
        self.cmd_list
            .write_u64(header + 8, self.tables.bus_addr() + table as u64);
        self.cmd_list.zero_range(header + 16, 16);
        Ok(())
    }

    fn ring_doorbell(&mut self, tag: u16) {
        let bit = 1u32 << tag;
        self.issued |= bit;
        // PxCI is write-1-to-set.
        self.write(port::CI, bit);
    }

    fn drain(&mut self, sink: &mut dyn FnMut(RawCompletion)) -> usize {
        let is = self.read(port::IS);
        if is != 0 {
            self.write(port::IS, is);
        }

        if is & pxis::FATAL != 0 {
            return self.recover(is, sink);
        }

        if self.issued == 0 {
            return 0;
        }
        let ci = self.read(port::CI);
        let done = self.issued & !ci;
        self.issued &= ci;
        self.complete_mask(done, sink)
    }

    fn rearm(&mut self) -> Result<()> {
        self.issued = 0;
        if !poll_until(self.hal.as_ref(), self.ready_timeout_ms, self.max_poll, || {
            self.link_up()
        }) {
            log::warn!("ahci: port {} link did not come back after reset", self.port);
            return Err(StorageError::DeviceNotPresent);
        }
        self.start()
    }
}
