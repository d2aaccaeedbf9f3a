//! AHCI (SATA) host controller.
//!
//! Each port with an attached ATA device becomes one `CommandQueue` whose
//! tags are the port's command slots.
//!
//! # DMA Memory Layout
//!
//! Per-port structures, allocated from the HAL page allocator:
//! - Command List: 1KB aligned, 32 × 32-byte command headers
//! - FIS Receive: 256-byte aligned, 256 bytes (same page as the list)
//! - Command Tables: 256 bytes per slot, PRDT at 0x80
//!
//! # Bring-up
//!
//! AHCI enable → HBA reset (bounded) → re-enable → read CAP/PI/VS →
//! per implemented port: link check, signature check, stop, program
//! CLB/FB, clear errors, start → IDENTIFY DEVICE → global interrupt enable.

pub mod command;
pub mod identify;
pub mod port;
pub mod regs;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use crate::config::{CompletionMode, EngineConfig};
use crate::controller::{BlockOp, HostController};
use crate::device::{DeviceInfo, Protocol};
use crate::error::{Result, StorageError};
use crate::hal::{poll_until, DmaBuffer, Hal, RegisterIo};
use crate::queue::ring::clamp_depth;
use crate::queue::{CommandQueue, QueueState};

pub use command::AhciCommand;
pub use port::AhciPort;

use regs::port as pxreg;
use regs::{cap, ghc, hba, port_reg, signature, size, ssts, vs};

/// Time a port's PHY gets to report a link after HBA reset.
const LINK_SETTLE_MS: u64 = 10;

struct AhciUnit {
    port: u32,
    queue: CommandQueue<AhciPort>,
    info: Mutex<DeviceInfo>,
    lba48: AtomicBool,
}

/// An initialized AHCI HBA.
pub struct AhciController {
    regs: Arc<dyn RegisterIo>,
    hal: Arc<dyn Hal>,
    config: EngineConfig,
    cap: u32,
    version: u32,
    units: Vec<AhciUnit>,
    reset_lock: Mutex<()>,
    resets: AtomicU32,
}

impl AhciController {
    /// Reset and enable the HBA, start every port with an ATA device and
    /// identify it.
    ///
    /// Ports whose start or IDENTIFY fails are skipped. An HBA that does
    /// not come out of reset, or DMA memory that cannot be allocated, fails
    /// the whole controller.
    pub fn new(regs: Arc<dyn RegisterIo>, hal: Arc<dyn Hal>, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        hba_reset(regs.as_ref(), hal.as_ref(), &config)?;

        let cap_raw = regs.read32(hba::CAP);
        let pi = regs.read32(hba::PI);
        let version = regs.read32(hba::VS);
        let slots = cap::num_cmd_slots(cap_raw);
        let s64a = cap_raw & cap::S64A != 0;
        if slots < 2 {
            log::error!("ahci: HBA reports {} command slot(s), need at least 2", slots);
            return Err(StorageError::ProtocolError);
        }
        let depth = clamp_depth(config.queue_depth, slots);

        log::info!(
            "ahci: HBA {}.{}, {} ports (PI {:#x}), {} slots, NCQ {}, 64-bit {}",
            vs::major(version),
            vs::minor(version),
            cap::num_ports(cap_raw),
            pi,
            slots,
            cap_raw & cap::SNCQ != 0,
            s64a
        );

        let mut units: Vec<AhciUnit> = Vec::new();
        for port in 0..32u32 {
            if pi & (1 << port) == 0 {
                continue;
            }

            let linked = poll_until(hal.as_ref(), LINK_SETTLE_MS, config.max_poll_iterations, || {
                ssts::link_up(regs.read32(port_reg(port, pxreg::SSTS)))
            });
            if !linked {
                log::debug!("ahci: port {} no device", port);
                continue;
            }

            let sig = regs.read32(port_reg(port, pxreg::SIG));
            if sig != signature::ATA {
                log::info!("ahci: port {} {} device, skipped", port, signature_name(sig));
                continue;
            }

            let transport =
                match AhciPort::new(Arc::clone(&regs), Arc::clone(&hal), port, depth, s64a, &config) {
                    Ok(transport) => transport,
                    Err(e) => {
                        for unit in units {
                            retire(unit.port, unit.queue);
                        }
                        return Err(e);
                    }
                };
            let queue = CommandQueue::new(
                "ahci",
                port as u16,
                transport,
                Arc::clone(&hal),
                config.timeout_escalation,
            );

            if let Err(e) = queue.with_transport(|t| t.start()) {
                log::warn!("ahci: port {} failed to start: {}", port, e);
                retire(port, queue);
                continue;
            }

            match identify_port(&queue, &hal, &config, port, CompletionMode::Polled) {
                Ok((info, lba48)) => {
                    log::info!(
                        "ahci: port {} \"{}\" sn {} fw {}, {} sectors of {} bytes{}",
                        port,
                        info.model,
                        info.serial,
                        info.firmware,
                        info.sector_count,
                        info.sector_size,
                        if info.queued { ", NCQ" } else { "" }
                    );
                    units.push(AhciUnit {
                        port,
                        queue,
                        info: Mutex::new(info),
                        lba48: AtomicBool::new(lba48),
                    });
                }
                Err(e) => {
                    log::warn!("ahci: port {} IDENTIFY failed: {}", port, e);
                    retire(port, queue);
                }
            }
        }

        regs.write32(hba::IS, u32::MAX);
        if config.completion_mode == CompletionMode::Interrupt {
            regs.write32(hba::GHC, regs.read32(hba::GHC) | ghc::IE);
        }

        Ok(Self {
            regs,
            hal,
            config,
            cap: cap_raw,
            version,
            units,
            reset_lock: Mutex::new(()),
            resets: AtomicU32::new(0),
        })
    }

    /// AHCI version as (major, minor).
    pub fn version(&self) -> (u16, u16) {
        (vs::major(self.version), vs::minor(self.version))
    }

    /// Raw Host Capabilities register.
    pub fn capabilities(&self) -> u32 {
        self.cap
    }

    fn unit(&self, port: u32) -> Result<&AhciUnit> {
        self.units
            .iter()
            .find(|u| u.port == port)
            .ok_or(StorageError::DeviceNotPresent)
    }

    fn queues(&self) -> impl Iterator<Item = &CommandQueue<AhciPort>> {
        self.units.iter().map(|u| &u.queue)
    }
}

/// Enable AHCI mode, reset the HBA and enable again.
fn hba_reset(regs: &dyn RegisterIo, hal: &dyn Hal, config: &EngineConfig) -> Result<()> {
    regs.write32(hba::GHC, regs.read32(hba::GHC) | ghc::AE);
    regs.write32(hba::GHC, regs.read32(hba::GHC) | ghc::HR);

    if !poll_until(hal, config.ready_timeout_ms, config.max_poll_iterations, || {
        regs.read32(hba::GHC) & ghc::HR == 0
    }) {
        log::error!("ahci: HBA reset did not complete");
        return Err(StorageError::EnableTimeout);
    }

    regs.write32(hba::GHC, ghc::AE);
    if !poll_until(hal, config.ready_timeout_ms, config.max_poll_iterations, || {
        regs.read32(hba::GHC) & ghc::AE != 0
    }) {
        log::error!("ahci: HBA refused AHCI enable");
        return Err(StorageError::EnableTimeout);
    }
    Ok(())
}

/// Stop a port that will not be used and release its queue. A port whose
/// engines do not stop keeps its command list, FIS area and any quarantined
/// buffers: the HBA may still write to them.
fn retire(port: u32, queue: CommandQueue<AhciPort>) {
    match queue.with_transport(|t| t.stop()) {
        Ok(()) => {
            queue.fail_all(StorageError::DeviceNotPresent);
        }
        Err(e) => {
            log::error!("ahci: port {} will not stop ({}), leaking its DMA memory", port, e);
            core::mem::forget(queue);
        }
    }
}

fn signature_name(sig: u32) -> &'static str {
    match sig {
        signature::ATAPI => "ATAPI",
        signature::SEMB => "enclosure bridge",
        signature::PM => "port multiplier",
        _ => "unknown",
    }
}

/// Issue IDENTIFY DEVICE on `queue` and build the unit record.
fn identify_port(
    queue: &CommandQueue<AhciPort>,
    hal: &Arc<dyn Hal>,
    config: &EngineConfig,
    port: u32,
    mode: CompletionMode,
) -> Result<(DeviceInfo, bool)> {
    let buffer = DmaBuffer::alloc(hal, identify::IDENTIFY_LEN)?;
    let completion = queue.execute(
        AhciCommand::Identify,
        Some(buffer),
        config.command_timeout_ms,
        mode,
    )?;
    completion.status?;
    let buffer = completion.buffer.ok_or(StorageError::ProtocolError)?;
    let id = identify::parse(buffer.as_slice())?;

    let sector_size = id.sector_size;
    let mut max = command::max_sectors(id.lba48)
        .min((size::PRDT_ENTRIES * size::PRD_MAX_BYTES / sector_size as usize) as u32);
    if let Some(bytes) = config.max_transfer_bytes {
        max = max.min((bytes / sector_size as usize) as u32);
    }

    let info = DeviceInfo {
        protocol: Protocol::Ahci,
        unit: port,
        sector_count: id.sector_count,
        sector_size,
        model: id.model,
        serial: id.serial,
        firmware: id.firmware,
        queued: id.ncq,
        queue_depth: id.ncq_depth,
        max_transfer_sectors: max.max(1),
    };
    Ok((info, id.lba48))
}

impl HostController for AhciController {
    type Transport = AhciPort;

    fn label(&self) -> &'static str {
        "ahci"
    }

    fn hal(&self) -> &Arc<dyn Hal> {
        &self.hal
    }

    fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn devices(&self) -> Vec<DeviceInfo> {
        self.units.iter().map(|u| u.info.lock().clone()).collect()
    }

    fn device(&self, unit: u32) -> Result<DeviceInfo> {
        Ok(self.unit(unit)?.info.lock().clone())
    }

    fn identify(&self, unit: u32) -> Result<DeviceInfo> {
        let u = self.unit(unit)?;
        if !ssts::link_up(self.regs.read32(port_reg(unit, pxreg::SSTS))) {
            return Err(StorageError::DeviceNotPresent);
        }
        let (info, lba48) =
            identify_port(&u.queue, &self.hal, &self.config, unit, self.config.completion_mode)?;
        *u.info.lock() = info.clone();
        u.lba48.store(lba48, Ordering::Release);
        Ok(info)
    }

    fn io_queue(&self, unit: u32) -> Result<&CommandQueue<AhciPort>> {
        Ok(&self.unit(unit)?.queue)
    }

    fn io_command(&self, unit: u32, op: BlockOp) -> Result<AhciCommand> {
        let ext = self.unit(unit)?.lba48.load(Ordering::Acquire);
        Ok(match op {
            BlockOp::Read { lba, count } => AhciCommand::Read { lba, count, ext },
            BlockOp::Write { lba, count } => AhciCommand::Write { lba, count, ext },
            BlockOp::Flush => AhciCommand::Flush { ext },
        })
    }

    fn handle_interrupt(&self) -> usize {
        let is = self.regs.read32(hba::IS);
        if is == 0 {
            return 0;
        }
        let mut delivered = 0;
        for u in &self.units {
            if is & (1 << u.port) != 0 {
                delivered += u.queue.handle_interrupt();
            }
        }
        // Port IS is cleared by the reap; the HBA bits go last.
        self.regs.write32(hba::IS, is);
        delivered
    }

    fn poll_timeouts(&self) -> usize {
        let expired = self.queues().map(|q| q.poll_timeouts()).sum();
        let escalated = self.queues().fold(false, |any, q| q.take_escalation() | any);
        if escalated {
            if let Err(e) = self.reset() {
                log::error!("ahci: recovery failed: {}", e);
            }
        }
        expired
    }

    fn reset(&self) -> Result<()> {
        let Some(_guard) = self.reset_lock.try_lock() else {
            log::debug!("ahci: reset already in progress");
            return Ok(());
        };
        let n = self.resets.fetch_add(1, Ordering::AcqRel) + 1;
        log::warn!("ahci: resetting HBA (reset #{})", n);

        for q in self.queues() {
            q.begin_reset();
        }
        self.regs
            .write32(hba::GHC, self.regs.read32(hba::GHC) & !ghc::IE);

        if let Err(e) = hba_reset(self.regs.as_ref(), self.hal.as_ref(), &self.config) {
            // Command engines may still be running: keep quarantined buffers.
            log::error!("ahci: HBA did not recover, all ports offline");
            for q in self.queues() {
                q.set_state(QueueState::Offline);
            }
            return Err(e);
        }

        // The HBA reset stopped every command engine; no DMA is in flight.
        let failed: usize = self
            .queues()
            .map(|q| q.fail_all(StorageError::ControllerReset))
            .sum();

        for u in &self.units {
            match u.queue.rearm() {
                Ok(()) => u.queue.set_state(QueueState::Online),
                Err(e) => {
                    log::error!("ahci: port {} offline after reset: {}", u.port, e);
                    u.queue.set_state(QueueState::Offline);
                }
            }
        }

        self.regs.write32(hba::IS, u32::MAX);
        if self.config.completion_mode == CompletionMode::Interrupt {
            self.regs
                .write32(hba::GHC, self.regs.read32(hba::GHC) | ghc::IE);
        }

        log::info!("ahci: reset #{} complete, {} commands failed", n, failed);
        Ok(())
    }

    fn reset_count(&self) -> u32 {
        self.resets.load(Ordering::Acquire)
    }
}
