//! Host controller seam shared by the AHCI and NVMe variants.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config::EngineConfig;
use crate::device::DeviceInfo;
use crate::error::Result;
use crate::hal::Hal;
use crate::queue::{CommandQueue, QueueTransport};

/// Protocol-neutral block operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOp {
    Read { lba: u64, count: u32 },
    Write { lba: u64, count: u32 },
    Flush,
}

impl BlockOp {
    /// Sectors moved by this operation.
    pub fn sectors(&self) -> u32 {
        match *self {
            Self::Read { count, .. } | Self::Write { count, .. } => count,
            Self::Flush => 0,
        }
    }
}

/// One initialized controller and the units behind it.
pub trait HostController: Send + Sync {
    type Transport: QueueTransport;

    /// Log prefix (`ahci` / `nvme`).
    fn label(&self) -> &'static str;

    fn hal(&self) -> &Arc<dyn Hal>;

    fn config(&self) -> &EngineConfig;

    /// Units that identified successfully.
    fn devices(&self) -> Vec<DeviceInfo>;

    /// Cached record for `unit`.
    fn device(&self, unit: u32) -> Result<DeviceInfo>;

    /// Re-issue IDENTIFY for `unit` and replace the cached record.
    fn identify(&self, unit: u32) -> Result<DeviceInfo>;

    /// Queue carrying I/O for `unit`.
    fn io_queue(&self, unit: u32) -> Result<&CommandQueue<Self::Transport>>;

    /// Protocol command for `op` on `unit`.
    fn io_command(
        &self,
        unit: u32,
        op: BlockOp,
    ) -> Result<<Self::Transport as QueueTransport>::Command>;

    /// Interrupt entry point. Never blocks; returns completions delivered.
    fn handle_interrupt(&self) -> usize;

    /// Expire overdue commands on every queue and run recovery if any
    /// queue escalated. Returns commands timed out.
    fn poll_timeouts(&self) -> usize;

    /// Reset the controller, failing all outstanding commands with
    /// `ControllerReset`. A reset already in progress makes this a no-op.
    fn reset(&self) -> Result<()>;

    /// Resets performed since bring-up.
    fn reset_count(&self) -> u32;
}
