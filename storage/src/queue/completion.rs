//! Completion delivery: results, wait cells and caller callbacks.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use crate::error::{Result, StorageError};
use crate::hal::{Deadline, DmaBuffer};

/// Command identifier written into the hardware slot.
///
/// Allocated from a counter modulo the queue depth. For NVMe it is the CID
/// and is independent of the ring index; for AHCI it names the command slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandId(pub(crate) u16);

impl CommandId {
    pub fn tag(&self) -> u16 {
        self.0
    }
}

/// Result of one command, handed back with its data buffer.
#[derive(Debug)]
pub struct Completion {
    pub id: CommandId,
    /// Bytes transferred, or why the command failed.
    pub status: Result<u32>,
    /// Protocol result dword (NVMe DW0, unused by AHCI).
    pub value: u32,
    /// The buffer submitted with the command, back in driver ownership.
    /// `None` while a timed-out command's buffer is still quarantined.
    pub buffer: Option<DmaBuffer>,
}

impl Completion {
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }
}

/// Caller-side completion callback.
///
/// Runs synchronously in reaping context (possibly an interrupt handler)
/// with the queue lock held: it must not block or submit to the same queue.
pub trait CompletionHandler: Send + Sync {
    fn on_complete(&self, completion: Completion);
}

/// Per-command wait primitive, signaled exactly once.
pub(crate) struct CommandCell {
    done: AtomicBool,
    slot: Mutex<Option<Completion>>,
}

impl CommandCell {
    pub(crate) fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            slot: Mutex::new(None),
        }
    }

    pub(crate) fn signal(&self, completion: Completion) {
        let mut slot = self.slot.lock();
        debug_assert!(slot.is_none(), "BUG: command signaled twice");
        *slot = Some(completion);
        self.done.store(true, Ordering::Release);
    }

    fn take(&self) -> Option<Completion> {
        if !self.done.load(Ordering::Acquire) {
            return None;
        }
        self.slot.lock().take()
    }
}

/// Handle to a submitted command awaiting its completion.
pub struct Ticket {
    pub(crate) id: CommandId,
    pub(crate) seq: u64,
    pub(crate) deadline: Deadline,
    pub(crate) cell: Arc<CommandCell>,
}

impl Ticket {
    pub fn id(&self) -> CommandId {
        self.id
    }

    pub fn deadline(&self) -> Deadline {
        self.deadline
    }

    /// Whether a result is ready.
    pub fn is_complete(&self) -> bool {
        self.cell.done.load(Ordering::Acquire)
    }

    /// Take the result if it is ready. Yields `Some` at most once.
    pub fn try_take(&self) -> Option<Completion> {
        self.cell.take()
    }
}

impl core::fmt::Debug for Ticket {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Ticket")
            .field("id", &self.id)
            .field("seq", &self.seq)
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// A submission the queue refused; the buffer goes back to the caller.
#[derive(Debug)]
pub struct Rejected {
    pub error: StorageError,
    pub buffer: Option<DmaBuffer>,
}

impl From<Rejected> for StorageError {
    fn from(rejected: Rejected) -> Self {
        rejected.error
    }
}
