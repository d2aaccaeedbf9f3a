//! Storage engine error types.

use core::fmt;

pub type Result<T> = core::result::Result<T, StorageError>;

/// Errors surfaced by the command-queue engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageError {
    /// No media / link negotiation at the port, or inactive namespace.
    DeviceNotPresent,
    /// Every command slot is in flight. Retry after a completion.
    QueueFull,
    /// No completion within the command deadline.
    Timeout,
    /// Hardware reported a failure. Raw status is protocol specific:
    /// AHCI `(error << 8) | status` from PxTFD, NVMe the 15-bit status field.
    DeviceError(u32),
    /// Ring or DMA buffer allocation failed.
    OutOfMemory,
    /// Command invalidated by a forced controller reset.
    ControllerReset,
    /// Controller never reported ready/enabled within the poll cap.
    EnableTimeout,
    /// LBA range exceeds the device capacity.
    OutOfRange,
    /// Transfer exceeds the device's maximum transfer size.
    TransferTooLarge,
    /// Caller buffer shorter than `count * sector_size`.
    BufferTooSmall,
    /// Engine configuration rejected.
    InvalidConfig,
    /// Identify data or hardware state made no sense.
    ProtocolError,
    /// Queue is permanently offline after failed recovery.
    Offline,
    /// Command was abandoned by its owner.
    Cancelled,
}

impl StorageError {
    /// Backpressure and timeouts may be retried by the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::QueueFull | Self::Timeout)
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceNotPresent => write!(f, "Device not present"),
            Self::QueueFull => write!(f, "Command queue full"),
            Self::Timeout => write!(f, "Command timed out"),
            Self::DeviceError(status) => write!(f, "Device error: status {:#x}", status),
            Self::OutOfMemory => write!(f, "Out of DMA memory"),
            Self::ControllerReset => write!(f, "Command invalidated by controller reset"),
            Self::EnableTimeout => write!(f, "Controller did not become ready"),
            Self::OutOfRange => write!(f, "LBA range beyond end of device"),
            Self::TransferTooLarge => write!(f, "Transfer exceeds maximum size"),
            Self::BufferTooSmall => write!(f, "Buffer too small"),
            Self::InvalidConfig => write!(f, "Invalid engine configuration"),
            Self::ProtocolError => write!(f, "Protocol error"),
            Self::Offline => write!(f, "Queue offline"),
            Self::Cancelled => write!(f, "Command cancelled"),
        }
    }
}
