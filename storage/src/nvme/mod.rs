//! NVMe host controller.
//!
//! # Queues
//!
//! ```text
//!   qid 0      admin SQ/CQ   (identify, queue creation)
//!   qid 1..=N  I/O SQ/CQ     (read, write, flush), one CQ per SQ
//! ```
//!
//! Admin commands always complete in polled mode: they run during bring-up
//! and recovery, when interrupt delivery cannot be relied on.
//!
//! # Bring-up
//!
//! CAP/VS → clear CC.EN, wait RDY=0 → mask interrupts → AQA/ASQ/ACQ →
//! CC (NVM, 4KB pages, 64/16-byte entries, EN) → wait RDY=1 →
//! Identify Controller → create I/O CQ/SQ pairs → Identify Namespace 1..=NN.

pub mod command;
pub mod identify;
pub mod queue;
pub mod regs;

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use spin::Mutex;

use crate::config::{CompletionMode, EngineConfig};
use crate::controller::{BlockOp, HostController};
use crate::device::{DeviceInfo, Protocol};
use crate::error::{Result, StorageError};
use crate::hal::{poll_until, DmaBuffer, Hal, RegisterIo, PAGE_SIZE};
use crate::queue::ring::clamp_depth;
use crate::queue::{CommandQueue, Completion, QueueState, QueueTransport};

pub use command::NvmeCommand;
pub use identify::ControllerIdentity;
pub use queue::NvmeQueue;

use regs::{cap, cc, csts};

/// Some controllers report a CAP.TO of 0; wait at least this long.
const MIN_READY_TIMEOUT_MS: u64 = 500;

/// Largest NLB a read or write can carry (16-bit, zero-based).
const MAX_NLB: u32 = 65536;

/// An initialized NVMe controller.
pub struct NvmeController {
    regs: Arc<dyn RegisterIo>,
    hal: Arc<dyn Hal>,
    config: EngineConfig,
    cap: u64,
    version: u32,
    ready_timeout_ms: u64,
    admin_depth: u16,
    admin: CommandQueue<NvmeQueue>,
    io: Vec<CommandQueue<NvmeQueue>>,
    next_io: AtomicUsize,
    identity: ControllerIdentity,
    max_transfer_bytes: usize,
    namespaces: Mutex<Vec<DeviceInfo>>,
    reset_lock: Mutex<()>,
    resets: AtomicU32,
}

impl NvmeController {
    /// Enable the controller, create the admin and I/O queues and identify
    /// the active namespaces.
    pub fn new(regs: Arc<dyn RegisterIo>, hal: Arc<dyn Hal>, config: EngineConfig) -> Result<Self> {
        config.validate()?;

        let cap_raw = regs.read64(regs::CAP);
        let version = regs.read32(regs::VS);
        if !cap::supports_nvm(cap_raw) {
            log::error!("nvme: controller lacks the NVM command set");
            return Err(StorageError::ProtocolError);
        }
        if cap::min_page_shift(cap_raw) > PAGE_SIZE.trailing_zeros() {
            log::error!(
                "nvme: minimum page size {} above {}",
                1u64 << cap::min_page_shift(cap_raw),
                PAGE_SIZE
            );
            return Err(StorageError::ProtocolError);
        }

        let mqes = cap::max_queue_entries(cap_raw);
        let admin_depth = clamp_depth(config.admin_queue_depth, mqes.min(4096));
        let io_depth = clamp_depth(config.queue_depth, mqes);
        let stride = cap::doorbell_stride(cap_raw);
        let ready_timeout_ms = cap::ready_timeout_ms(cap_raw)
            .max(MIN_READY_TIMEOUT_MS)
            .min(config.ready_timeout_ms);

        log::info!(
            "nvme: controller {}.{}, MQES {}, DSTRD {}, ready timeout {}ms",
            regs::vs::major(version),
            regs::vs::minor(version),
            mqes,
            stride,
            ready_timeout_ms
        );

        let admin_transport = NvmeQueue::new(Arc::clone(&regs), &hal, 0, admin_depth, stride)?;
        let admin = CommandQueue::new(
            "nvme",
            0,
            admin_transport,
            Arc::clone(&hal),
            config.timeout_escalation,
        );

        let mut io = Vec::with_capacity(config.io_queues as usize);
        let setup = QueueSetup {
            regs: &regs,
            hal: &hal,
            config: &config,
            ready_timeout_ms,
            admin_depth,
            io_depth,
            stride,
        };
        let (identity, max_transfer_bytes) = match setup.start(&admin, &mut io) {
            Ok(started) => started,
            Err(e) => {
                setup.abandon(admin, io);
                return Err(e);
            }
        };
        log::info!("nvme: {} I/O queue(s) of depth {}", io.len(), io_depth);

        let mut namespaces = Vec::new();
        let last = identity.namespace_count.min(config.max_namespaces);
        for nsid in 1..=last {
            match identify_namespace(&admin, &hal, &config, &identity, nsid, io_depth, max_transfer_bytes) {
                Ok(info) => {
                    log::info!(
                        "nvme: ns {} {} sectors of {} bytes",
                        nsid,
                        info.sector_count,
                        info.sector_size
                    );
                    namespaces.push(info);
                }
                Err(StorageError::DeviceNotPresent) => log::debug!("nvme: ns {} inactive", nsid),
                Err(e) => log::warn!("nvme: ns {} identify failed: {}", nsid, e),
            }
        }

        Ok(Self {
            regs,
            hal,
            config,
            cap: cap_raw,
            version,
            ready_timeout_ms,
            admin_depth,
            admin,
            io,
            next_io: AtomicUsize::new(0),
            identity,
            max_transfer_bytes,
            namespaces: Mutex::new(namespaces),
            reset_lock: Mutex::new(()),
            resets: AtomicU32::new(0),
        })
    }

    pub fn identity(&self) -> &ControllerIdentity {
        &self.identity
    }

    /// NVMe version as (major, minor).
    pub fn version(&self) -> (u16, u8) {
        (regs::vs::major(self.version), regs::vs::minor(self.version))
    }

    /// Raw Controller Capabilities register.
    pub fn capabilities(&self) -> u64 {
        self.cap
    }

    pub fn admin_queue(&self) -> &CommandQueue<NvmeQueue> {
        &self.admin
    }

    pub fn io_queues(&self) -> &[CommandQueue<NvmeQueue>] {
        &self.io
    }

    fn all_queues(&self) -> impl Iterator<Item = &CommandQueue<NvmeQueue>> {
        core::iter::once(&self.admin).chain(self.io.iter())
    }

    fn io_depth(&self) -> u16 {
        self.io
            .first()
            .map(|q| q.with_transport(|t| t.depth()))
            .unwrap_or(2)
    }

    fn recover(&self) -> Result<usize> {
        for q in self.all_queues() {
            q.begin_reset();
        }

        if let Err(e) = disable(self.regs.as_ref(), self.hal.as_ref(), &self.config, self.ready_timeout_ms) {
            // The controller may still be DMAing: keep quarantined buffers.
            for q in self.all_queues() {
                q.set_state(QueueState::Offline);
            }
            return Err(e);
        }

        let failed = self
            .all_queues()
            .map(|q| q.fail_all(StorageError::ControllerReset))
            .sum();

        for q in self.all_queues() {
            q.rearm()?;
        }

        let (asq, acq) = self.admin.with_transport(|t| (t.sq_bus_addr(), t.cq_bus_addr()));
        enable(
            self.regs.as_ref(),
            self.hal.as_ref(),
            &self.config,
            self.ready_timeout_ms,
            self.admin_depth,
            asq,
            acq,
        )?;
        self.admin.set_state(QueueState::Online);

        for q in &self.io {
            match create_io_queue(&self.admin, &self.config, q) {
                Ok(()) => q.set_state(QueueState::Online),
                Err(e) => {
                    log::error!("nvme: q{} not recreated after reset: {}", q.qid(), e);
                    q.set_state(QueueState::Offline);
                }
            }
        }
        Ok(failed)
    }
}

/// Bring-up parameters shared by the queue setup steps.
struct QueueSetup<'a> {
    regs: &'a Arc<dyn RegisterIo>,
    hal: &'a Arc<dyn Hal>,
    config: &'a EngineConfig,
    ready_timeout_ms: u64,
    admin_depth: u16,
    io_depth: u16,
    stride: u32,
}

impl QueueSetup<'_> {
    /// Enable the controller on `admin`, identify it and create the I/O
    /// queues onto `io`.
    fn start(
        &self,
        admin: &CommandQueue<NvmeQueue>,
        io: &mut Vec<CommandQueue<NvmeQueue>>,
    ) -> Result<(ControllerIdentity, usize)> {
        let (asq, acq) = admin.with_transport(|t| (t.sq_bus_addr(), t.cq_bus_addr()));
        enable(
            self.regs.as_ref(),
            self.hal.as_ref(),
            self.config,
            self.ready_timeout_ms,
            self.admin_depth,
            asq,
            acq,
        )?;

        let identity = identify_controller(admin, self.hal, self.config)?;
        let max_transfer_bytes = [
            Some(queue::PRP_MAX_BYTES),
            identity.max_transfer_bytes(PAGE_SIZE),
            self.config.max_transfer_bytes,
        ]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(queue::PRP_MAX_BYTES);

        log::info!(
            "nvme: \"{}\" sn {} fw {}, {} namespaces, max transfer {} bytes",
            identity.model,
            identity.serial,
            identity.firmware,
            identity.namespace_count,
            max_transfer_bytes
        );

        for qid in 1..=self.config.io_queues {
            let transport = NvmeQueue::new(Arc::clone(self.regs), self.hal, qid, self.io_depth, self.stride)?;
            let queue = CommandQueue::new(
                "nvme",
                qid,
                transport,
                Arc::clone(self.hal),
                self.config.timeout_escalation,
            );
            // A failed SQ create can leave the CQ live on the controller.
            let created = create_io_queue(admin, self.config, &queue);
            io.push(queue);
            created?;
        }
        Ok((identity, max_transfer_bytes))
    }

    /// Release the queues of a failed bring-up. The controller may hold
    /// their addresses, so the memory is only freed once it is disabled.
    fn abandon(&self, admin: CommandQueue<NvmeQueue>, io: Vec<CommandQueue<NvmeQueue>>) {
        match disable(self.regs.as_ref(), self.hal.as_ref(), self.config, self.ready_timeout_ms) {
            Ok(()) => {
                for q in core::iter::once(&admin).chain(io.iter()) {
                    q.fail_all(StorageError::DeviceNotPresent);
                }
            }
            Err(e) => {
                log::error!("nvme: controller will not disable ({}), leaking queue memory", e);
                core::mem::forget(admin);
                core::mem::forget(io);
            }
        }
    }
}

fn disable(regs: &dyn RegisterIo, hal: &dyn Hal, config: &EngineConfig, timeout_ms: u64) -> Result<()> {
    let value = regs.read32(regs::CC);
    if value & cc::EN != 0 {
        regs.write32(regs::CC, value & !cc::EN);
    }
    if !poll_until(hal, timeout_ms, config.max_poll_iterations, || {
        regs.read32(regs::CSTS) & csts::RDY == 0
    }) {
        log::error!("nvme: controller did not clear CSTS.RDY");
        return Err(StorageError::EnableTimeout);
    }
    Ok(())
}

fn enable(
    regs: &dyn RegisterIo,
    hal: &dyn Hal,
    config: &EngineConfig,
    timeout_ms: u64,
    admin_depth: u16,
    asq: u64,
    acq: u64,
) -> Result<()> {
    disable(regs, hal, config, timeout_ms)?;

    regs.write32(regs::INTMS, u32::MAX);
    regs.write32(regs::AQA, regs::aqa(admin_depth, admin_depth));
    regs.write64(regs::ASQ, asq);
    regs.write64(regs::ACQ, acq);
    regs.write32(regs::CC, cc::enable_value());

    let mut fatal = false;
    let ready = poll_until(hal, timeout_ms, config.max_poll_iterations, || {
        let status = regs.read32(regs::CSTS);
        fatal = status & csts::CFS != 0;
        fatal || status & csts::RDY != 0
    });
    if fatal {
        log::error!("nvme: controller fatal status during enable");
        return Err(StorageError::ProtocolError);
    }
    if !ready {
        log::error!("nvme: controller not ready after {}ms", timeout_ms);
        return Err(StorageError::EnableTimeout);
    }

    if config.completion_mode == CompletionMode::Interrupt {
        regs.write32(regs::INTMC, u32::MAX);
    }
    Ok(())
}

/// Run one admin command to completion.
fn run_admin(
    admin: &CommandQueue<NvmeQueue>,
    config: &EngineConfig,
    command: NvmeCommand,
    buffer: Option<DmaBuffer>,
) -> Result<Completion> {
    let completion = admin.execute(command, buffer, config.command_timeout_ms, CompletionMode::Polled)?;
    if let Err(e) = completion.status {
        log::warn!("nvme: admin {:?} failed: {}", command, e);
        return Err(e);
    }
    Ok(completion)
}

fn identify_controller(
    admin: &CommandQueue<NvmeQueue>,
    hal: &Arc<dyn Hal>,
    config: &EngineConfig,
) -> Result<ControllerIdentity> {
    let buffer = DmaBuffer::alloc(hal, identify::IDENTIFY_LEN)?;
    let completion = run_admin(admin, config, NvmeCommand::IdentifyController, Some(buffer))?;
    let buffer = completion.buffer.ok_or(StorageError::ProtocolError)?;
    identify::parse_controller(buffer.as_slice())
}

fn identify_namespace(
    admin: &CommandQueue<NvmeQueue>,
    hal: &Arc<dyn Hal>,
    config: &EngineConfig,
    identity: &ControllerIdentity,
    nsid: u32,
    io_depth: u16,
    max_transfer_bytes: usize,
) -> Result<DeviceInfo> {
    let buffer = DmaBuffer::alloc(hal, identify::IDENTIFY_LEN)?;
    let completion = run_admin(admin, config, NvmeCommand::IdentifyNamespace { nsid }, Some(buffer))?;
    let buffer = completion.buffer.ok_or(StorageError::ProtocolError)?;
    let geometry = identify::parse_namespace(buffer.as_slice())?;

    let max_sectors = (max_transfer_bytes / geometry.sector_size as usize) as u32;
    Ok(DeviceInfo {
        protocol: Protocol::Nvme,
        unit: nsid,
        sector_count: geometry.sector_count,
        sector_size: geometry.sector_size,
        model: identity.model.clone(),
        serial: identity.serial.clone(),
        firmware: identity.firmware.clone(),
        queued: true,
        queue_depth: io_depth - 1,
        max_transfer_sectors: max_sectors.min(MAX_NLB).max(1),
    })
}

/// Create the CQ then the SQ for an I/O queue pair.
fn create_io_queue(
    admin: &CommandQueue<NvmeQueue>,
    config: &EngineConfig,
    queue: &CommandQueue<NvmeQueue>,
) -> Result<()> {
    let (qid, depth, sq, cq) = queue.with_transport(|t| {
        (t.qid(), t.depth(), t.sq_bus_addr(), t.cq_bus_addr())
    });
    run_admin(
        admin,
        config,
        NvmeCommand::CreateIoCq {
            qid,
            depth,
            vector: 0,
            base: cq,
        },
        None,
    )?;
    run_admin(
        admin,
        config,
        NvmeCommand::CreateIoSq {
            qid,
            depth,
            cqid: qid,
            base: sq,
        },
        None,
    )?;
    log::debug!("nvme: q{} created, depth {}", qid, depth);
    Ok(())
}

impl HostController for NvmeController {
    type Transport = NvmeQueue;

    fn label(&self) -> &'static str {
        "nvme"
    }

    fn hal(&self) -> &Arc<dyn Hal> {
        &self.hal
    }

    fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn devices(&self) -> Vec<DeviceInfo> {
        self.namespaces.lock().clone()
    }

    fn device(&self, unit: u32) -> Result<DeviceInfo> {
        self.namespaces
            .lock()
            .iter()
            .find(|ns| ns.unit == unit)
            .cloned()
            .ok_or(StorageError::DeviceNotPresent)
    }

    fn identify(&self, unit: u32) -> Result<DeviceInfo> {
        let info = identify_namespace(
            &self.admin,
            &self.hal,
            &self.config,
            &self.identity,
            unit,
            self.io_depth(),
            self.max_transfer_bytes,
        )?;
        let mut namespaces = self.namespaces.lock();
        match namespaces.iter_mut().find(|ns| ns.unit == unit) {
            Some(slot) => *slot = info.clone(),
            None => namespaces.push(info.clone()),
        }
        Ok(info)
    }

    fn io_queue(&self, unit: u32) -> Result<&CommandQueue<NvmeQueue>> {
        if !self.namespaces.lock().iter().any(|ns| ns.unit == unit) {
            return Err(StorageError::DeviceNotPresent);
        }
        let index = self.next_io.fetch_add(1, Ordering::Relaxed) % self.io.len().max(1);
        self.io.get(index).ok_or(StorageError::DeviceNotPresent)
    }

    fn io_command(&self, unit: u32, op: BlockOp) -> Result<NvmeCommand> {
        Ok(match op {
            BlockOp::Read { lba, count } => NvmeCommand::Read {
                nsid: unit,
                lba,
                count,
            },
            BlockOp::Write { lba, count } => NvmeCommand::Write {
                nsid: unit,
                lba,
                count,
            },
            BlockOp::Flush => NvmeCommand::Flush { nsid: unit },
        })
    }

    fn handle_interrupt(&self) -> usize {
        self.all_queues().map(|q| q.handle_interrupt()).sum()
    }

    fn poll_timeouts(&self) -> usize {
        let expired = self.all_queues().map(|q| q.poll_timeouts()).sum();
        let escalated = self
            .all_queues()
            .fold(false, |any, q| q.take_escalation() | any);
        if escalated {
            if let Err(e) = self.reset() {
                log::error!("nvme: recovery failed: {}", e);
            }
        }
        expired
    }

    fn reset(&self) -> Result<()> {
        let Some(_guard) = self.reset_lock.try_lock() else {
            log::debug!("nvme: reset already in progress");
            return Ok(());
        };
        let n = self.resets.fetch_add(1, Ordering::AcqRel) + 1;
        log::warn!("nvme: resetting controller (reset #{})", n);

        match self.recover() {
            Ok(failed) => {
                log::info!("nvme: reset #{} complete, {} commands failed", n, failed);
                Ok(())
            }
            Err(e) => {
                log::error!("nvme: controller offline after failed reset: {}", e);
                for q in self.all_queues() {
                    q.set_state(QueueState::Offline);
                }
                Err(e)
            }
        }
    }

    fn reset_count(&self) -> u32 {
        self.resets.load(Ordering::Acquire)
    }
}
