//! # Notification Queue
//!
//! Capacity-bounded FIFO of interrupt notification records, backed by a
//! cyclic chain of fixed-capacity blocks (the reservoir).
//!
//! ## Contexts
//!
//! - The interrupt path appends through [`NoteQueue::append_nonblocking`]:
//!   lock-free, no allocation, at most one producer per queue.
//! - Consumers drain through [`NoteQueue::consume`], serialized by the
//!   queue's internal consumer lock; a queue read mutates cursor state and
//!   therefore counts as a write access.
//! - [`NoteQueue::replace_reservoir`] installs a new block chain. It runs
//!   only while the producer is quiescent, which is the regime interrupt
//!   enable/disable already guarantees.
//!
//! ## Reservoir layout
//!
//! Blocks live in an arena and link to their successor by index; the last
//! block links back to the first, so a single-block reservoir is its own
//! successor. Cursor advance stays within a block while the in-block offset
//! is below the block's maximum index and follows the successor link
//! otherwise, which makes the chain behave as a ring without one contiguous
//! allocation.

use core::cell::UnsafeCell;
use core::mem;
use core::sync::atomic::{fence, AtomicUsize, Ordering};

use alloc::vec::Vec;
use spin::Mutex;

use crate::RegWord;

/// Raw monotonic timestamp supplied by the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Stamp(pub u64);

impl Stamp {
    /// Creates a stamp from raw monotonic ticks.
    pub const fn new(ticks: u64) -> Self {
        Stamp(ticks)
    }
}

/// One interrupt notification: pending-status bits and the time they were
/// observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Note {
    /// Pending-interrupt status bits as read from the device.
    pub bits: RegWord,
    /// When the interrupt path observed them.
    pub stamp: Stamp,
}

/// Records a full block holds.
pub const BLOCK_SLOTS: usize = 16;

/// Blocks needed to hold `capacity` records, for any `capacity` up to
/// `usize::MAX`.
fn blocks_for(capacity: usize) -> usize {
    capacity.div_ceil(BLOCK_SLOTS)
}

/// Fixed-capacity chunk of reservoir storage.
struct Block {
    /// Element array.
    ea: Vec<UnsafeCell<Note>>,
    /// Last usable in-block offset.
    max_index: usize,
    /// Arena index of the successor block.
    next: usize,
}

/// A block chain ready to back a [`NoteQueue`].
pub struct Reservoir {
    blocks: Vec<Block>,
    capacity: usize,
}

impl Reservoir {
    /// A reservoir with no storage; a queue backed by it accepts nothing.
    pub const fn empty() -> Self {
        Reservoir {
            blocks: Vec::new(),
            capacity: 0,
        }
    }

    /// Builds a chain totalling `capacity` record slots: full blocks of
    /// [`BLOCK_SLOTS`] records, a final block holding the remainder, and
    /// the last block linking back to the first.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut blocks = Vec::new();
        if capacity > 0 {
            let count = blocks_for(capacity);
            for index in 0..count {
                let slots = BLOCK_SLOTS.min(capacity - index * BLOCK_SLOTS);
                let mut ea = Vec::new();
                ea.resize_with(slots, || UnsafeCell::new(Note::default()));
                blocks.push(Block {
                    ea,
                    max_index: slots - 1,
                    next: (index + 1) % count,
                });
            }
        }
        Reservoir { blocks, capacity }
    }

    /// Total record slots in the chain.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Position of one queue end within the chain.
#[derive(Debug, Clone, Copy)]
struct Cursor {
    block: usize,
    offset: usize,
}

impl Cursor {
    const fn start() -> Self {
        Cursor {
            block: 0,
            offset: 0,
        }
    }

    /// Advances one slot: within the block while below `max_index`, to the
    /// successor's first slot at the block end.
    fn advance(&mut self, blocks: &[Block]) {
        let block = &blocks[self.block];
        if self.offset < block.max_index {
            self.offset += 1;
        } else {
            self.block = block.next;
            self.offset = 0;
        }
    }
}

/// Capacity-bounded FIFO of [`Note`] records over a block chain.
pub struct NoteQueue {
    /// Producer cursor; only the interrupt path touches it.
    write: UnsafeCell<Cursor>,
    /// Consumer cursor; its mutex doubles as the consumer-side queue lock.
    read: Mutex<Cursor>,
    /// Records currently stored.
    fillpoint: AtomicUsize,
    /// Installed block chain.
    chain: UnsafeCell<Reservoir>,
}

// SAFETY: the queue is shared between the interrupt path and consumer
// contexts. Slot handoff is ordered by `fillpoint` (Release on append,
// Acquire on consume), so producer and consumer never touch the same slot
// concurrently. `write` and the chain are accessed without a lock only by
// the single interrupt path; `replace_reservoir` also touches them but
// runs only while that path is quiescent. Remaining consumer-side state
// sits behind the `read` mutex.
unsafe impl Send for NoteQueue {}
unsafe impl Sync for NoteQueue {}

impl NoteQueue {
    /// Creates a queue with no reservoir installed (capacity 0).
    pub const fn new() -> Self {
        NoteQueue {
            write: UnsafeCell::new(Cursor::start()),
            read: Mutex::new(Cursor::start()),
            fillpoint: AtomicUsize::new(0),
            chain: UnsafeCell::new(Reservoir::empty()),
        }
    }

    /// Maximum records the queue may hold.
    pub fn capacity(&self) -> usize {
        // Chain geometry only changes under producer quiescence.
        unsafe { (*self.chain.get()).capacity }
    }

    /// Records currently queued. Exact from consumer context, best-effort
    /// from the interrupt path.
    pub fn fillpoint(&self) -> usize {
        self.fillpoint.load(Ordering::Acquire)
    }

    /// Appends one record from the interrupt path.
    ///
    /// Returns false, leaving the queue untouched, when the queue is full
    /// or has no reservoir; the caller accounts the drop. Never blocks,
    /// never allocates. At most one producer may call this at a time.
    pub fn append_nonblocking(&self, note: Note) -> bool {
        let chain = unsafe { &*self.chain.get() };
        if self.fillpoint.load(Ordering::Acquire) >= chain.capacity {
            return false;
        }
        let write = unsafe { &mut *self.write.get() };
        let slot = &chain.blocks[write.block].ea[write.offset];
        unsafe { *slot.get() = note };
        write.advance(&chain.blocks);
        // Publish the slot before the new fillpoint becomes visible.
        fence(Ordering::Release);
        self.fillpoint.fetch_add(1, Ordering::Release);
        #[cfg(feature = "debug")]
        assert!(self.fillpoint.load(Ordering::Relaxed) <= chain.capacity);
        true
    }

    /// Copies the oldest record into `out` and removes it.
    ///
    /// Returns false, leaving the cursors unchanged, when the queue is
    /// empty.
    pub fn consume(&self, out: &mut Note) -> bool {
        let mut read = self.read.lock();
        if self.fillpoint.load(Ordering::Acquire) == 0 {
            return false;
        }
        let chain = unsafe { &*self.chain.get() };
        let slot = &chain.blocks[read.block].ea[read.offset];
        *out = unsafe { *slot.get() };
        read.advance(&chain.blocks);
        self.fillpoint.fetch_sub(1, Ordering::Release);
        true
    }

    /// Installs `fresh` as the backing chain, resetting both cursors and
    /// the fillpoint, and hands back the previous chain for the caller to
    /// release, or `None` when no reservoir was installed.
    ///
    /// May only run while the producer is quiescent.
    pub fn replace_reservoir(&self, fresh: Reservoir) -> Option<Reservoir> {
        let mut read = self.read.lock();
        *read = Cursor::start();
        // Producer quiescence makes the write cursor and chain ours.
        let old = unsafe {
            *self.write.get() = Cursor::start();
            mem::replace(&mut *self.chain.get(), fresh)
        };
        self.fillpoint.store(0, Ordering::Release);
        if old.blocks.is_empty() {
            None
        } else {
            Some(old)
        }
    }
}

impl Default for NoteQueue {
    fn default() -> Self {
        Self::new()
    }
}
