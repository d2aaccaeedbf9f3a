//! Ring index bookkeeping.
//!
//! Pure index math for submission and completion rings, kept apart from
//! the DMA memory so the invariants can be tested without hardware:
//!
//! - `0 <= tail, head < depth`, depth a power of two
//! - submission ring is full when `(tail + 1) % depth == head`
//! - the expected completion phase flips exactly once per lap

/// Halve `want` until it fits under `max`, stopping at 2. A power-of-two
/// `want` stays a power of two.
pub fn clamp_depth(want: u16, max: u32) -> u16 {
    let mut depth = want as u32;
    while depth > max && depth > 2 {
        depth /= 2;
    }
    depth as u16
}

/// Producer side of a submission ring.
#[derive(Debug, Clone)]
pub struct SubmissionRing {
    mask: u16,
    tail: u16,
    /// Last consumer position reported by the device.
    head: u16,
}

impl SubmissionRing {
    /// Ring of `depth` slots. `depth` must be a power of two, >= 2.
    pub fn new(depth: u16) -> Self {
        debug_assert!(depth >= 2 && depth.is_power_of_two());
        Self {
            mask: depth - 1,
            tail: 0,
            head: 0,
        }
    }

    pub fn depth(&self) -> u16 {
        self.mask + 1
    }

    pub fn tail(&self) -> u16 {
        self.tail
    }

    pub fn head(&self) -> u16 {
        self.head
    }

    /// Slots the device has not consumed yet.
    pub fn in_use(&self) -> u16 {
        self.tail.wrapping_sub(self.head) & self.mask
    }

    pub fn is_full(&self) -> bool {
        (self.tail.wrapping_add(1) & self.mask) == self.head
    }

    /// Claim the slot at `tail` and advance. Returns the claimed index.
    pub fn advance(&mut self) -> u16 {
        debug_assert!(!self.is_full(), "BUG: advancing a full submission ring");
        let slot = self.tail;
        self.tail = (self.tail + 1) & self.mask;
        slot
    }

    /// Record the consumer position the device reported.
    pub fn set_head(&mut self, head: u16) {
        self.head = head & self.mask;
    }

    pub fn reset(&mut self) {
        self.tail = 0;
        self.head = 0;
    }
}

/// Consumer side of a completion ring.
///
/// The expected phase starts at 1: rings are zeroed, and the device writes
/// phase 1 on its first pass.
#[derive(Debug, Clone)]
pub struct CompletionRing {
    mask: u16,
    head: u16,
    phase: bool,
    laps: u64,
}

impl CompletionRing {
    pub fn new(depth: u16) -> Self {
        debug_assert!(depth >= 2 && depth.is_power_of_two());
        Self {
            mask: depth - 1,
            head: 0,
            phase: true,
            laps: 0,
        }
    }

    pub fn depth(&self) -> u16 {
        self.mask + 1
    }

    pub fn head(&self) -> u16 {
        self.head
    }

    /// Phase tag a fresh entry at `head` carries.
    pub fn expected_phase(&self) -> bool {
        self.phase
    }

    /// Completed passes over the ring.
    pub fn laps(&self) -> u64 {
        self.laps
    }

    /// Whether an entry carrying `phase` at `head` is new.
    pub fn is_new(&self, phase: bool) -> bool {
        phase == self.phase
    }

    /// Consume the entry at `head`. Returns true when the ring wrapped.
    pub fn advance(&mut self) -> bool {
        self.head = (self.head + 1) & self.mask;
        if self.head == 0 {
            self.phase = !self.phase;
            self.laps += 1;
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.phase = true;
        self.laps = 0;
    }
}
