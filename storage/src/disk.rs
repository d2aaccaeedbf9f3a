//! Synchronous block device over one controller unit.
//!
//! ```text
//! ┌────────────────────────────────────────┐
//! │     FAT32 / ISO9660 / GPT layers       │
//! └───────────────────┬────────────────────┘
//!                     │ gpt_disk_io::BlockIo
//!                     ▼
//! ┌────────────────────────────────────────┐
//! │             Disk<C>                    │
//! │  bounds checks, bounce DmaBuffer,      │
//! │  escalation to controller reset        │
//! └───────────────────┬────────────────────┘
//!                     │ HostController
//!                     ▼
//!           AhciController / NvmeController
//! ```
//!
//! Every transfer goes through a freshly allocated `DmaBuffer`. When a
//! command times out the buffer stays with the quarantined command, so a
//! late DMA can never land in caller memory.

use alloc::sync::Arc;

use gpt_disk_io::BlockIo;
use gpt_disk_types::{BlockSize, Lba};

use crate::controller::{BlockOp, HostController};
use crate::device::DeviceInfo;
use crate::error::{Result, StorageError};
use crate::hal::DmaBuffer;
use crate::queue::Completion;

pub struct Disk<C: HostController> {
    controller: Arc<C>,
    unit: u32,
    info: DeviceInfo,
}

impl<C: HostController> Disk<C> {
    /// Open `unit` (AHCI port or NVMe namespace id).
    pub fn open(controller: Arc<C>, unit: u32) -> Result<Self> {
        let info = controller.device(unit)?;
        Ok(Self {
            controller,
            unit,
            info,
        })
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn unit(&self) -> u32 {
        self.unit
    }

    pub fn controller(&self) -> &Arc<C> {
        &self.controller
    }

    /// Re-identify the unit and refresh the cached record.
    pub fn identify(&mut self) -> Result<&DeviceInfo> {
        self.info = self.controller.identify(self.unit)?;
        Ok(&self.info)
    }

    /// Read `count` sectors at `lba` into `dst`. Returns sectors read.
    pub fn read_sectors(&self, lba: u64, count: u32, dst: &mut [u8]) -> Result<u32> {
        if count == 0 {
            return Ok(0);
        }
        let bytes = self.info.check_transfer(lba, count)?;
        if dst.len() < bytes {
            return Err(StorageError::BufferTooSmall);
        }

        let buffer = DmaBuffer::alloc(self.controller.hal(), bytes)?;
        let completion = self.execute(BlockOp::Read { lba, count }, Some(buffer))?;
        let moved = completion.status?;
        let buffer = completion.buffer.ok_or(StorageError::ProtocolError)?;

        dst[..bytes].copy_from_slice(&buffer.as_slice()[..bytes]);
        Ok(self.sectors(moved, count))
    }

    /// Write `count` sectors from `src` at `lba`. Returns sectors written.
    pub fn write_sectors(&self, lba: u64, count: u32, src: &[u8]) -> Result<u32> {
        if count == 0 {
            return Ok(0);
        }
        let bytes = self.info.check_transfer(lba, count)?;
        if src.len() < bytes {
            return Err(StorageError::BufferTooSmall);
        }

        let mut buffer = DmaBuffer::alloc(self.controller.hal(), bytes)?;
        buffer.as_mut_slice().copy_from_slice(&src[..bytes]);
        let completion = self.execute(BlockOp::Write { lba, count }, Some(buffer))?;
        let moved = completion.status?;
        Ok(self.sectors(moved, count))
    }

    /// Flush the device's volatile write cache.
    pub fn flush(&self) -> Result<()> {
        self.execute(BlockOp::Flush, None)?.status.map(|_| ())
    }

    fn sectors(&self, bytes: u32, requested: u32) -> u32 {
        (bytes / self.info.sector_size).min(requested)
    }

    fn execute(&self, op: BlockOp, buffer: Option<DmaBuffer>) -> Result<Completion> {
        let queue = self.controller.io_queue(self.unit)?;
        let command = self.controller.io_command(self.unit, op)?;
        let config = self.controller.config();

        let completion = queue.execute(
            command,
            buffer,
            config.command_timeout_ms,
            config.completion_mode,
        )?;

        if completion.status == Err(StorageError::Timeout) && queue.take_escalation() {
            log::warn!(
                "{}: unit {} reached {} consecutive timeouts, resetting controller",
                self.controller.label(),
                self.unit,
                config.timeout_escalation
            );
            if let Err(e) = self.controller.reset() {
                log::error!("{}: reset failed: {}", self.controller.label(), e);
            }
        }
        Ok(completion)
    }

    /// Split `len` bytes at `lba` into transfers no larger than the unit's
    /// limit and run `f` on each (lba, sectors, byte range).
    fn for_each_chunk(
        &self,
        lba: u64,
        len: usize,
        mut f: impl FnMut(u64, u32, core::ops::Range<usize>) -> Result<()>,
    ) -> Result<()> {
        let sector_size = self.info.sector_size as usize;
        if len % sector_size != 0 {
            return Err(StorageError::BufferTooSmall);
        }
        let total = (len / sector_size) as u64;
        let chunk = self.info.max_transfer_sectors.max(1) as u64;

        let mut done = 0u64;
        while done < total {
            let sectors = (total - done).min(chunk) as u32;
            let start = done as usize * sector_size;
            let end = start + sectors as usize * sector_size;
            f(lba + done, sectors, start..end)?;
            done += sectors as u64;
        }
        Ok(())
    }
}

impl<C: HostController> BlockIo for Disk<C> {
    type Error = StorageError;

    fn block_size(&self) -> BlockSize {
        BlockSize::new(self.info.sector_size).unwrap_or(BlockSize::BS_512)
    }

    fn num_blocks(&mut self) -> core::result::Result<u64, Self::Error> {
        Ok(self.info.sector_count)
    }

    fn read_blocks(&mut self, start_lba: Lba, dst: &mut [u8]) -> core::result::Result<(), Self::Error> {
        self.for_each_chunk(start_lba.0, dst.len(), |lba, sectors, range| {
            let moved = self.read_sectors(lba, sectors, &mut dst[range])?;
            if moved != sectors {
                return Err(StorageError::ProtocolError);
            }
            Ok(())
        })
    }

    fn write_blocks(&mut self, start_lba: Lba, src: &[u8]) -> core::result::Result<(), Self::Error> {
        self.for_each_chunk(start_lba.0, src.len(), |lba, sectors, range| {
            let moved = self.write_sectors(lba, sectors, &src[range])?;
            if moved != sectors {
                return Err(StorageError::ProtocolError);
            }
            Ok(())
        })
    }

    fn flush(&mut self) -> core::result::Result<(), Self::Error> {
        Disk::flush(self)
    }
}
