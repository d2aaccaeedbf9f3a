//! Protocol-independent command queue engine.
//!
//! One `CommandQueue` drives one hardware queue pair (an AHCI port or an
//! NVMe SQ/CQ pair). The protocol specifics live behind `QueueTransport`;
//! this module owns everything the protocols share:
//!
//! - command identifier allocation and the pending table
//! - submission ordering (record pending, fence, then doorbell)
//! - completion matching, stray/late completion handling
//! - deadlines, quarantine and timeout escalation
//! - failing outstanding work across a controller reset
//!
//! # Locking
//!
//! A single spinlock per queue covers the transport and the pending table.
//! Thread context takes it with `lock()`. The interrupt entry point only
//! ever uses `try_lock()`; when the lock is busy it leaves a deferred-reap
//! flag that the current holder and all waiters pick up.

pub mod completion;
pub(crate) mod pending;
pub mod ring;

use alloc::sync::Arc;
use core::sync::atomic::{fence, AtomicBool, AtomicU8, Ordering};

use spin::Mutex;

use crate::config::CompletionMode;
use crate::error::{Result, StorageError};
use crate::hal::{Deadline, DmaBuffer, DmaTarget, Hal};

pub use completion::{CommandId, Completion, CompletionHandler, Rejected, Ticket};
use completion::CommandCell;
use pending::{CommandState, Notify, PendingCommand, PendingTable};

// ═══════════════════════════════════════════════════════════════════════════
// TRANSPORT SEAM
// ═══════════════════════════════════════════════════════════════════════════

/// Hardware status of one reaped entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawStatus {
    Success,
    /// Protocol-specific error code.
    Error(u32),
}

/// One completion as read from hardware.
#[derive(Debug, Clone, Copy)]
pub struct RawCompletion {
    pub tag: u16,
    pub status: RawStatus,
    /// Protocol result dword.
    pub value: u32,
    /// Bytes the device reports moving, when the protocol reports it.
    pub bytes: Option<u32>,
}

/// Protocol side of a queue pair.
///
/// Called with the queue lock held.
pub trait QueueTransport: Send {
    /// Command format this transport encodes.
    type Command: Copy + core::fmt::Debug;

    /// Number of tags (and hardware slots).
    fn depth(&self) -> u16;

    /// Maximum commands outstanding at once.
    fn capacity(&self) -> u16;

    /// Ring-level space check, on top of the tag limit.
    fn has_room(&self) -> bool {
        true
    }

    /// Write `command` into the hardware slot for `tag`. Must not make it
    /// visible to the device.
    fn encode(&mut self, tag: u16, command: &Self::Command, data: Option<DmaTarget>) -> Result<()>;

    /// Publish the slot encoded for `tag`. This is the doorbell write.
    fn ring_doorbell(&mut self, tag: u16);

    /// Hand every new completion to `sink`, then acknowledge them to the
    /// device. Returns the number of entries consumed.
    fn drain(&mut self, sink: &mut dyn FnMut(RawCompletion)) -> usize;

    /// Forget all hardware-side state after a controller reset.
    fn rearm(&mut self) -> Result<()>;
}

// ═══════════════════════════════════════════════════════════════════════════
// QUEUE
// ═══════════════════════════════════════════════════════════════════════════

/// Lifecycle of a queue with respect to controller recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueState {
    Online = 0,
    Resetting = 1,
    Offline = 2,
}

impl QueueState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Online,
            1 => Self::Resetting,
            _ => Self::Offline,
        }
    }
}

struct QueueInner<T> {
    transport: T,
    pending: PendingTable,
    consecutive_timeouts: u32,
}

/// A queue pair with its pending-command bookkeeping.
pub struct CommandQueue<T: QueueTransport> {
    label: &'static str,
    qid: u16,
    hal: Arc<dyn Hal>,
    inner: Mutex<QueueInner<T>>,
    state: AtomicU8,
    deferred_reap: AtomicBool,
    escalation: AtomicBool,
    escalation_threshold: u32,
}

impl<T: QueueTransport> CommandQueue<T> {
    /// Wrap an initialized transport. `label` prefixes log records.
    pub fn new(
        label: &'static str,
        qid: u16,
        transport: T,
        hal: Arc<dyn Hal>,
        escalation_threshold: u32,
    ) -> Self {
        let pending = PendingTable::new(transport.depth(), transport.capacity());
        Self {
            label,
            qid,
            hal,
            inner: Mutex::new(QueueInner {
                transport,
                pending,
                consecutive_timeouts: 0,
            }),
            state: AtomicU8::new(QueueState::Online as u8),
            deferred_reap: AtomicBool::new(false),
            escalation: AtomicBool::new(false),
            escalation_threshold: escalation_threshold.max(1),
        }
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    pub fn state(&self) -> QueueState {
        QueueState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: QueueState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Commands holding a tag, quarantined ones included.
    pub fn outstanding(&self) -> u16 {
        self.inner.lock().pending.live()
    }

    /// Timed-out or abandoned commands still holding a tag.
    pub fn quarantined(&self) -> usize {
        self.inner.lock().pending.quarantined()
    }

    /// Run `f` against the transport under the queue lock.
    pub fn with_transport<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.inner.lock().transport)
    }

    // ───────────────────────────────────────────────────────────────────────
    // Submission
    // ───────────────────────────────────────────────────────────────────────

    /// Submit a command and get a ticket to wait on.
    pub fn submit(
        &self,
        command: T::Command,
        buffer: Option<DmaBuffer>,
        deadline: Deadline,
    ) -> core::result::Result<Ticket, Rejected> {
        let cell = Arc::new(CommandCell::new());
        let notify = Notify::Waiter(Arc::clone(&cell));
        let (id, seq) = self.submit_with(command, buffer, Some(deadline), notify)?;
        Ok(Ticket {
            id,
            seq,
            deadline,
            cell,
        })
    }

    /// Submit a command whose result goes to `handler`.
    ///
    /// With a deadline, `poll_timeouts` reports `Timeout` to the handler
    /// once it passes.
    pub fn submit_with_handler(
        &self,
        command: T::Command,
        buffer: Option<DmaBuffer>,
        deadline: Option<Deadline>,
        handler: Arc<dyn CompletionHandler>,
    ) -> core::result::Result<CommandId, Rejected> {
        self.submit_with(command, buffer, deadline, Notify::Handler(handler))
            .map(|(id, _)| id)
    }

    fn submit_with(
        &self,
        command: T::Command,
        mut buffer: Option<DmaBuffer>,
        deadline: Option<Deadline>,
        notify: Notify,
    ) -> core::result::Result<(CommandId, u64), Rejected> {
        let reject = |error, buffer| Err(Rejected { error, buffer });

        let mut inner = self.inner.lock();

        // Checked under the lock: recovery flips the state while holding it.
        match self.state() {
            QueueState::Online => {}
            QueueState::Resetting => return reject(StorageError::ControllerReset, buffer),
            QueueState::Offline => return reject(StorageError::Offline, buffer),
        }

        if inner.pending.is_full() || !inner.transport.has_room() {
            return reject(StorageError::QueueFull, buffer);
        }
        let Some((id, seq)) = inner.pending.allocate() else {
            return reject(StorageError::QueueFull, buffer);
        };

        let target = buffer.as_ref().map(DmaTarget::of);
        if let Err(error) = inner.transport.encode(id.0, &command, target) {
            return reject(error, buffer);
        }
        if let Some(b) = buffer.as_mut() {
            b.mark_device_owned();
        }

        inner.pending.insert(PendingCommand {
            id,
            seq,
            state: CommandState::Submitted,
            deadline,
            expected_bytes: target.map_or(0, |t| t.len as u32),
            buffer,
            notify,
        });

        log::trace!("{}: q{} submit tag {} {:?}", self.label, self.qid, id.0, command);

        // Slot contents must be globally visible before the device can
        // observe the doorbell.
        fence(Ordering::SeqCst);
        inner.transport.ring_doorbell(id.0);

        if self.deferred_reap.load(Ordering::Acquire) {
            self.reap_locked(&mut inner);
        }

        Ok((id, seq))
    }

    // ───────────────────────────────────────────────────────────────────────
    // Reaping
    // ───────────────────────────────────────────────────────────────────────

    /// Drain completions from thread context.
    pub fn reap(&self) -> usize {
        let mut inner = self.inner.lock();
        self.reap_locked(&mut inner)
    }

    /// Interrupt entry point. Never spins on the queue lock.
    pub fn handle_interrupt(&self) -> usize {
        match self.inner.try_lock() {
            Some(mut inner) => self.reap_locked(&mut inner),
            None => {
                // A waiter may be suspended behind the holder; let it reap.
                self.deferred_reap.store(true, Ordering::Release);
                self.hal.wake();
                0
            }
        }
    }

    /// Let a waiter make progress: reap in polled mode, or pick up an
    /// interrupt that found the lock busy.
    pub fn service(&self, mode: CompletionMode) {
        if mode == CompletionMode::Polled || self.deferred_reap.load(Ordering::Acquire) {
            self.reap();
        }
    }

    fn reap_locked(&self, inner: &mut QueueInner<T>) -> usize {
        self.deferred_reap.store(false, Ordering::Release);

        let QueueInner {
            transport,
            pending,
            consecutive_timeouts,
        } = inner;
        let label = self.label;
        let qid = self.qid;
        let mut delivered = 0usize;

        transport.drain(&mut |raw| {
            let Some(command) = pending.take(raw.tag) else {
                log::warn!("{}: q{} stray completion for tag {}, discarded", label, qid, raw.tag);
                return;
            };

            match command.state {
                CommandState::Submitted => {
                    *consecutive_timeouts = 0;
                    let status = match raw.status {
                        RawStatus::Success => Ok(raw.bytes.unwrap_or(command.expected_bytes)),
                        RawStatus::Error(code) => {
                            log::debug!("{}: q{} tag {} failed, status {:#x}", label, qid, raw.tag, code);
                            Err(StorageError::DeviceError(code))
                        }
                    };
                    command.finish(status, raw.value);
                    delivered += 1;
                }
                CommandState::TimedOut => {
                    log::warn!("{}: q{} late completion for timed-out tag {}, discarded", label, qid, raw.tag);
                    command.release();
                }
                CommandState::Abandoned => {
                    log::debug!("{}: q{} abandoned tag {} completed", label, qid, raw.tag);
                    command.release();
                }
            }
        });

        if delivered > 0 {
            self.hal.wake();
        }
        delivered
    }

    // ───────────────────────────────────────────────────────────────────────
    // Deadlines and cancellation
    // ───────────────────────────────────────────────────────────────────────

    /// Time out the command behind `ticket` if it is still outstanding.
    pub fn expire(&self, ticket: &Ticket) -> bool {
        let mut inner = self.inner.lock();
        self.time_out_locked(&mut inner, ticket.id.0, ticket.seq)
    }

    /// Time out every command whose deadline has passed. Returns how many.
    pub fn poll_timeouts(&self) -> usize {
        let now = self.hal.ticks();
        let mut inner = self.inner.lock();
        let mut expired = 0;
        for (tag, seq) in inner.pending.overdue(now) {
            if self.time_out_locked(&mut inner, tag, seq) {
                expired += 1;
            }
        }
        expired
    }

    fn time_out_locked(&self, inner: &mut QueueInner<T>, tag: u16, seq: u64) -> bool {
        let Some(command) = inner.pending.get_mut(tag, seq) else {
            return false;
        };
        if command.state != CommandState::Submitted {
            return false;
        }
        command.detach(CommandState::TimedOut, StorageError::Timeout);

        inner.consecutive_timeouts += 1;
        log::warn!(
            "{}: q{} tag {} timed out ({} consecutive), slot quarantined",
            self.label,
            self.qid,
            tag,
            inner.consecutive_timeouts
        );

        if inner.consecutive_timeouts >= self.escalation_threshold {
            inner.consecutive_timeouts = 0;
            self.escalation.store(true, Ordering::Release);
        }
        true
    }

    /// Abandon the command behind `ticket`. Its tag and buffer stay
    /// quarantined until the device completes it or the controller resets.
    pub fn cancel(&self, ticket: &Ticket) -> bool {
        let mut inner = self.inner.lock();
        match inner.pending.get_mut(ticket.id.0, ticket.seq) {
            Some(command) if command.state == CommandState::Submitted => {
                command.detach(CommandState::Abandoned, StorageError::Cancelled);
                true
            }
            _ => false,
        }
    }

    /// Consume a pending escalation request. True at most once per
    /// threshold's worth of consecutive timeouts.
    pub fn take_escalation(&self) -> bool {
        self.escalation.swap(false, Ordering::AcqRel)
    }

    // ───────────────────────────────────────────────────────────────────────
    // Synchronous execution
    // ───────────────────────────────────────────────────────────────────────

    /// Block until `ticket` resolves or its deadline passes.
    pub fn wait(&self, ticket: &Ticket, mode: CompletionMode) -> Completion {
        loop {
            self.service(mode);

            if let Some(completion) = ticket.try_take() {
                return completion;
            }

            if ticket.deadline.expired(self.hal.as_ref()) {
                // Either marks it timed out (and signals the cell) or the
                // completion raced in; both leave a result in the cell.
                self.expire(ticket);
                continue;
            }

            self.hal.wait_until(ticket.deadline.ticks());
        }
    }

    /// Submit and wait.
    pub fn execute(
        &self,
        command: T::Command,
        buffer: Option<DmaBuffer>,
        timeout_ms: u64,
        mode: CompletionMode,
    ) -> core::result::Result<Completion, Rejected> {
        let deadline = Deadline::after_ms(self.hal.as_ref(), timeout_ms);
        let ticket = self.submit(command, buffer, deadline)?;
        Ok(self.wait(&ticket, mode))
    }

    // ───────────────────────────────────────────────────────────────────────
    // Controller recovery
    // ───────────────────────────────────────────────────────────────────────

    /// Stop accepting submissions ahead of a controller reset.
    pub fn begin_reset(&self) {
        let _inner = self.inner.lock();
        self.set_state(QueueState::Resetting);
    }

    /// Fail every outstanding command with `error` and clear quarantine.
    ///
    /// Only call once the hardware can no longer DMA into queue buffers.
    pub fn fail_all(&self, error: StorageError) -> usize {
        let mut inner = self.inner.lock();
        inner.consecutive_timeouts = 0;
        self.escalation.store(false, Ordering::Release);

        let mut failed = 0;
        for command in inner.pending.drain() {
            match command.state {
                CommandState::Submitted => {
                    command.finish(Err(error), 0);
                    failed += 1;
                }
                CommandState::TimedOut | CommandState::Abandoned => command.release(),
            }
        }
        if failed > 0 {
            self.hal.wake();
        }
        failed
    }

    /// Reset the transport after the controller came back.
    pub fn rearm(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.deferred_reap.store(false, Ordering::Release);
        inner.transport.rearm()
    }
}
