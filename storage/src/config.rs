//! Engine configuration.
//!
//! All timeouts are in milliseconds and converted to platform ticks through
//! the HAL's calibrated tick rate.

use crate::error::{Result, StorageError};

/// How completions reach waiting callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    /// The registered interrupt handler reaps; waiters suspend in the HAL.
    Interrupt,
    /// Waiters reap their own queue between suspension points.
    Polled,
}

/// Storage engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Depth of every I/O queue (power of two, >= 2).
    /// AHCI clamps this to the command slots the HBA implements.
    pub queue_depth: u16,
    /// Depth of the NVMe admin queue (power of two, >= 2).
    pub admin_queue_depth: u16,
    /// Number of NVMe I/O queue pairs to create.
    pub io_queues: u16,
    /// Per-command deadline.
    pub command_timeout_ms: u64,
    /// Cap on waiting for enable/ready/reset bits.
    pub ready_timeout_ms: u64,
    /// Hard iteration cap for register polls, independent of the clock.
    pub max_poll_iterations: u32,
    /// Consecutive timeouts on one queue before the controller is reset.
    pub timeout_escalation: u32,
    /// Interrupt-driven or polled completion.
    pub completion_mode: CompletionMode,
    /// Optional cap on bytes per command, below the device limit.
    pub max_transfer_bytes: Option<usize>,
    /// Upper bound on NVMe namespaces enumerated at attach.
    pub max_namespaces: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_depth: 32,
            admin_queue_depth: 16,
            io_queues: 1,
            command_timeout_ms: 5_000,
            ready_timeout_ms: 1_000,
            max_poll_iterations: 10_000_000,
            timeout_escalation: 3,
            completion_mode: CompletionMode::Interrupt,
            max_transfer_bytes: None,
            max_namespaces: 16,
        }
    }
}

impl EngineConfig {
    /// Reject configurations the queue engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        let depth_ok = |d: u16| d >= 2 && d.is_power_of_two();

        if !depth_ok(self.queue_depth) || !depth_ok(self.admin_queue_depth) {
            return Err(StorageError::InvalidConfig);
        }
        if self.io_queues == 0 {
            return Err(StorageError::InvalidConfig);
        }
        if self.command_timeout_ms == 0 || self.ready_timeout_ms == 0 {
            return Err(StorageError::InvalidConfig);
        }
        if self.max_poll_iterations == 0 || self.timeout_escalation == 0 {
            return Err(StorageError::InvalidConfig);
        }
        if let Some(max) = self.max_transfer_bytes {
            if max < 512 {
                return Err(StorageError::InvalidConfig);
            }
        }
        Ok(())
    }

    /// Polled configuration, mostly useful before interrupts are wired.
    pub fn polled() -> Self {
        Self {
            completion_mode: CompletionMode::Polled,
            ..Self::default()
        }
    }
}
