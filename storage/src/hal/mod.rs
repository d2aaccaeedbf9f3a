//! Platform collaborators consumed by the engine.
//!
//! The engine never talks to the page allocator, the clock or the scheduler
//! directly. The kernel hands it one `Hal` implementation per controller and
//! one `RegisterIo` per mapped BAR.
//!
//! ```text
//! ┌──────────────────────────┐
//! │  AhciController / Nvme   │
//! └─────┬──────────────┬─────┘
//!       │ RegisterIo   │ Hal
//!       ▼              ▼
//!   MMIO BAR      pages · ticks · wait/wake
//! ```

pub mod dma;
pub mod mmio;
pub mod time;

pub use dma::{bytes_to_pages, BufferOwnership, DmaBuffer, DmaRegion, DmaTarget, PAGE_SIZE};
pub use mmio::{MmioRegion, RegisterIo};
pub use time::{poll_until, Deadline};

/// Kernel services the engine depends on.
pub trait Hal: Send + Sync {
    /// Allocate `pages` physically contiguous, zeroed, page-aligned pages.
    fn alloc_pages(&self, pages: usize) -> Option<DmaRegion>;

    /// Return pages obtained from `alloc_pages`.
    ///
    /// # Safety
    /// `region` must come from this HAL and no device may still target it.
    unsafe fn free_pages(&self, region: DmaRegion);

    /// Monotonic tick counter (TSC or equivalent).
    fn ticks(&self) -> u64;

    /// Calibrated ticks per millisecond.
    fn ticks_per_ms(&self) -> u64;

    /// Suspend the current thread until an interrupt, a `wake()` or the
    /// deadline. Spurious returns are allowed. Waiters call this in a loop,
    /// so an implementation that only spins turns every wait into a busy
    /// poll.
    fn wait_until(&self, deadline_ticks: u64);

    /// Wake threads suspended in `wait_until`. Called from reaping context,
    /// so it must not block.
    fn wake(&self) {}

    /// Yield point between register polls.
    fn relax(&self) {
        core::hint::spin_loop();
    }
}
