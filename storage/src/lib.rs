//! MorpheusX storage engine.
//!
//! Command submission and completion for AHCI (SATA) and NVMe host
//! controllers, with one protocol-independent queue engine underneath.
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │   Disk<C>  (sync read/write/flush,        │
//! │            gpt_disk_io::BlockIo)          │
//! └─────────────────────┬─────────────────────┘
//!                       │ HostController
//!          ┌────────────┴────────────┐
//!          ▼                         ▼
//!   AhciController             NvmeController
//!   (port = queue)             (admin + I/O queue pairs)
//!          │                         │
//!          └──────────┬──────────────┘
//!                     ▼
//!       CommandQueue<T: QueueTransport>
//!   (tags · pending table · deadlines · reset)
//!                     │
//!                     ▼
//!           Hal + RegisterIo
//! ```
//!
//! The kernel provides memory, time and register access through the `hal`
//! traits and routes the controller's interrupt to
//! `HostController::handle_interrupt`.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod ahci;
pub mod config;
pub mod controller;
pub mod device;
pub mod disk;
pub mod error;
pub mod hal;
pub mod nvme;
pub mod queue;


pub use ahci::AhciController;
pub use config::{CompletionMode, EngineConfig};
pub use controller::{BlockOp, HostController};
pub use device::{DeviceInfo, Protocol};
pub use disk::Disk;
pub use error::{Result, StorageError};
pub use hal::{DmaBuffer, DmaRegion, Hal, MmioRegion, RegisterIo};
pub use nvme::NvmeController;
pub use queue::{CommandId, CommandQueue, Completion, CompletionHandler, QueueState, Ticket};
