//! Pending command table.
//!
//! # State Machine
//! ```text
//!   SUBMITTED ──completion──> (removed, result delivered)
//!       │
//!       ├──deadline──> TIMED_OUT ──late completion / reset──> (removed, discarded)
//!       │
//!       └──cancel────> ABANDONED ──completion / reset───────> (removed, discarded)
//! ```
//!
//! A TIMED_OUT or ABANDONED entry keeps its tag and its data buffer: the
//! device may still DMA into the buffer, so neither is reused until the
//! hardware answers or the controller is reset.

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::completion::{CommandCell, CommandId, Completion, CompletionHandler};
use crate::error::{Result, StorageError};
use crate::hal::{Deadline, DmaBuffer};

/// How the owner of a command learns its result.
pub(crate) enum Notify {
    Waiter(Arc<CommandCell>),
    Handler(Arc<dyn CompletionHandler>),
    /// Owner already told (timeout, cancel); nothing left to deliver.
    Nobody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommandState {
    Submitted,
    TimedOut,
    Abandoned,
}

pub(crate) struct PendingCommand {
    pub(crate) id: CommandId,
    pub(crate) seq: u64,
    pub(crate) state: CommandState,
    pub(crate) deadline: Option<Deadline>,
    pub(crate) expected_bytes: u32,
    pub(crate) buffer: Option<DmaBuffer>,
    pub(crate) notify: Notify,
}

impl PendingCommand {
    /// Deliver the final result, returning the buffer to the owner.
    pub(crate) fn finish(mut self, status: Result<u32>, value: u32) {
        let buffer = self.buffer.take().map(|mut b| {
            b.mark_driver_owned();
            b
        });
        let completion = Completion {
            id: self.id,
            status,
            value,
            buffer,
        };
        match core::mem::replace(&mut self.notify, Notify::Nobody) {
            Notify::Waiter(cell) => cell.signal(completion),
            Notify::Handler(handler) => handler.on_complete(completion),
            Notify::Nobody => {}
        }
    }

    /// Tell the owner now; the entry and its buffer stay in the table.
    pub(crate) fn detach(&mut self, state: CommandState, error: StorageError) {
        self.state = state;
        let completion = Completion {
            id: self.id,
            status: Err(error),
            value: 0,
            buffer: None,
        };
        match core::mem::replace(&mut self.notify, Notify::Nobody) {
            Notify::Waiter(cell) => cell.signal(completion),
            Notify::Handler(handler) => handler.on_complete(completion),
            Notify::Nobody => {}
        }
    }

    /// Drop a detached entry once the device can no longer touch its buffer.
    pub(crate) fn release(mut self) {
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.mark_driver_owned();
        }
    }
}

/// Tag-indexed table of outstanding commands.
pub(crate) struct PendingTable {
    slots: Vec<Option<PendingCommand>>,
    capacity: u16,
    live: u16,
    next_tag: u16,
    next_seq: u64,
}

impl PendingTable {
    /// `depth` tags, at most `capacity` outstanding at once.
    pub(crate) fn new(depth: u16, capacity: u16) -> Self {
        let mut slots = Vec::with_capacity(depth as usize);
        slots.resize_with(depth as usize, || None);
        Self {
            slots,
            capacity: capacity.min(depth),
            live: 0,
            next_tag: 0,
            next_seq: 1,
        }
    }

    pub(crate) fn live(&self) -> u16 {
        self.live
    }

    pub(crate) fn is_full(&self) -> bool {
        self.live >= self.capacity
    }

    /// Number of timed-out or abandoned entries still holding a tag.
    pub(crate) fn quarantined(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|c| c.state != CommandState::Submitted)
            .count()
    }

    /// Next free tag at or after the rolling counter.
    pub(crate) fn allocate(&mut self) -> Option<(CommandId, u64)> {
        if self.is_full() {
            return None;
        }
        let depth = self.slots.len() as u16;
        for step in 0..depth {
            let tag = (self.next_tag + step) % depth;
            if self.slots[tag as usize].is_none() {
                self.next_tag = (tag + 1) % depth;
                let seq = self.next_seq;
                self.next_seq += 1;
                return Some((CommandId(tag), seq));
            }
        }
        None
    }

    pub(crate) fn insert(&mut self, command: PendingCommand) {
        let slot = &mut self.slots[command.id.0 as usize];
        debug_assert!(slot.is_none(), "BUG: tag {} already pending", command.id.0);
        *slot = Some(command);
        self.live += 1;
    }

    pub(crate) fn take(&mut self, tag: u16) -> Option<PendingCommand> {
        let taken = self.slots.get_mut(tag as usize)?.take();
        if taken.is_some() {
            self.live -= 1;
        }
        taken
    }

    /// Entry for `tag` if it is still the submission numbered `seq`.
    pub(crate) fn get_mut(&mut self, tag: u16, seq: u64) -> Option<&mut PendingCommand> {
        self.slots
            .get_mut(tag as usize)?
            .as_mut()
            .filter(|c| c.seq == seq)
    }

    /// Tags of submitted commands whose deadline has passed.
    pub(crate) fn overdue(&self, now: u64) -> Vec<(u16, u64)> {
        self.slots
            .iter()
            .flatten()
            .filter(|c| c.state == CommandState::Submitted)
            .filter(|c| c.deadline.map_or(false, |d| d.has_passed(now)))
            .map(|c| (c.id.0, c.seq))
            .collect()
    }

    /// Empty the table, yielding every entry.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = PendingCommand> + '_ {
        self.live = 0;
        self.next_tag = 0;
        self.slots.iter_mut().filter_map(Option::take)
    }
}
