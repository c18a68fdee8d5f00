//! # Interrupt Dispatch
//!
//! Splits interrupt handling into a minimal hard-interrupt half and a
//! deferred half that runs in worker context.
//!
//! ## Interrupt half
//!
//! [`Dispatch::interrupt`] probes the wired status register through the
//! try-acquire read path, masks the result, appends a [`Note`] to the
//! queue, and requests the deferred half. It takes no lock other than the
//! one-shot try-acquire of the space lock and never waits. A full queue
//! drops the note and latches the sticky overflow flag; scheduling is
//! idempotent, so a burst of interrupts while the deferred half is still
//! pending requests it exactly once.
//!
//! ## Deferred half
//!
//! [`Dispatch::run_deferred`] drains queued notes and fans them out to the
//! handle arbiter. It clears the pending flag before draining, so an
//! interrupt arriving mid-drain re-requests the worker rather than being
//! lost. Queue consumption and handle delivery each take their own lock;
//! the two are never held together.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::Error;
use crate::handle::HandleArbiter;
use crate::queue::{Note, NoteQueue, Stamp};
use crate::regspace::{RegisterSpace, SpaceId};
use crate::RegWord;

/// Where a device raises its interrupt status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqWiring {
    /// Space holding the status register.
    pub space: SpaceId,
    /// Offset of the status register within that space.
    pub offset: usize,
    /// Status bits belonging to this device.
    pub mask: RegWord,
}

/// What the interrupt half asks of its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqOutcome {
    /// The interrupt was not ours: no masked status bits were set, or the
    /// wiring does not admit the status read at all.
    Unclaimed,
    /// Handled, and the deferred half was already pending.
    Pending,
    /// Handled; the caller must schedule a [`Dispatch::run_deferred`] run.
    Schedule,
}

/// Dispatch counters, updated with relaxed atomics.
#[derive(Debug, Default)]
struct DispatchStats {
    claimed: AtomicU64,
    unclaimed: AtomicU64,
    probe_contended: AtomicU64,
    appended: AtomicU64,
    dropped: AtomicU64,
    drains: AtomicU64,
    delivered: AtomicU64,
}

/// Point-in-time copy of the dispatch counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatchSnapshot {
    /// Interrupts with at least one masked status bit set.
    pub claimed: u64,
    /// Interrupts whose masked status was zero.
    pub unclaimed: u64,
    /// Probes that found the space lock held.
    pub probe_contended: u64,
    /// Notes appended to the queue.
    pub appended: u64,
    /// Notes dropped against a full queue.
    pub dropped: u64,
    /// Deferred-half runs.
    pub drains: u64,
    /// Notes fanned out to handles.
    pub delivered: u64,
}

/// Interrupt-to-deferred coordination state of one device.
pub struct Dispatch {
    /// Set while a deferred run is requested but has not started.
    work_pending: AtomicBool,
    /// Sticky: a note was dropped since the flag was last taken.
    overflowed: AtomicBool,
    stats: DispatchStats,
}

impl Dispatch {
    /// Creates quiescent dispatch state.
    pub fn new() -> Self {
        Dispatch {
            work_pending: AtomicBool::new(false),
            overflowed: AtomicBool::new(false),
            stats: DispatchStats::default(),
        }
    }

    /// Hard-interrupt half. Call only from interrupt context with `now`
    /// taken at entry.
    pub fn interrupt(
        &self,
        space: &RegisterSpace,
        wiring: &IrqWiring,
        queue: &NoteQueue,
        now: Stamp,
    ) -> IrqOutcome {
        let raw = match space.read_one_irq(wiring.offset) {
            Ok(raw) => raw,
            Err(Error::Contended) => {
                // The space lock was held elsewhere. The status register
                // stays asserted, so defer the whole probe to the worker.
                self.stats.probe_contended.fetch_add(1, Ordering::Relaxed);
                return self.schedule();
            }
            Err(_) => {
                // Wiring that does not admit the status read cannot be
                // ours; rescheduling would never make it readable.
                self.stats.unclaimed.fetch_add(1, Ordering::Relaxed);
                return IrqOutcome::Unclaimed;
            }
        };
        let bits = raw & wiring.mask;
        if bits == 0 {
            self.stats.unclaimed.fetch_add(1, Ordering::Relaxed);
            return IrqOutcome::Unclaimed;
        }
        self.stats.claimed.fetch_add(1, Ordering::Relaxed);
        if queue.append_nonblocking(Note { bits, stamp: now }) {
            self.stats.appended.fetch_add(1, Ordering::Relaxed);
        } else {
            self.overflowed.store(true, Ordering::Release);
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.schedule()
    }

    /// Requests the deferred half exactly once per quiet period.
    fn schedule(&self) -> IrqOutcome {
        if self.work_pending.swap(true, Ordering::AcqRel) {
            IrqOutcome::Pending
        } else {
            IrqOutcome::Schedule
        }
    }

    /// Deferred half: drains the queue into the arbiter and returns the
    /// number of notes delivered. Runs in worker context.
    pub fn run_deferred(&self, queue: &NoteQueue, arbiter: &HandleArbiter) -> usize {
        // Clear before draining: an interrupt landing mid-drain must be
        // able to re-request the worker.
        self.work_pending.store(false, Ordering::Release);
        self.stats.drains.fetch_add(1, Ordering::Relaxed);
        let mut delivered = 0;
        let mut note = Note::default();
        while queue.consume(&mut note) {
            arbiter.deliver(note);
            delivered += 1;
        }
        self.stats
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Counts an interrupt turned away before the probe, for callers that
    /// gate the interrupt half on device state.
    pub(crate) fn record_unclaimed(&self) {
        self.stats.unclaimed.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes the sticky overflow flag, clearing it.
    pub fn take_overflow(&self) -> bool {
        self.overflowed.swap(false, Ordering::AcqRel)
    }

    /// Clears the sticky overflow flag without observing it.
    pub fn clear_overflow(&self) {
        self.overflowed.store(false, Ordering::Release);
    }

    /// True while a deferred run is requested but has not started.
    pub fn work_pending(&self) -> bool {
        self.work_pending.load(Ordering::Acquire)
    }

    /// Snapshot of the dispatch counters.
    pub fn stats(&self) -> DispatchSnapshot {
        DispatchSnapshot {
            claimed: self.stats.claimed.load(Ordering::Relaxed),
            unclaimed: self.stats.unclaimed.load(Ordering::Relaxed),
            probe_contended: self.stats.probe_contended.load(Ordering::Relaxed),
            appended: self.stats.appended.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            drains: self.stats.drains.load(Ordering::Relaxed),
            delivered: self.stats.delivered.load(Ordering::Relaxed),
        }
    }
}

impl Default for Dispatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use tally_regmap::{Access, SpaceLayout};

    use crate::queue::Reservoir;
    use crate::regspace::MemoryBus;

    fn status_space(status: RegWord) -> RegisterSpace {
        let mut layout = SpaceLayout::new(4);
        layout.mark(0..4, Access::RW);
        let space = RegisterSpace::new("ctrl", &layout, Box::new(MemoryBus::new(4)));
        space
            .write(1, &[status])
            .expect("should seed the status register");
        space
    }

    fn wiring() -> IrqWiring {
        IrqWiring {
            space: SpaceId::new(0),
            offset: 1,
            mask: 0x0f,
        }
    }

    fn queue(capacity: usize) -> NoteQueue {
        let queue = NoteQueue::new();
        queue.replace_reservoir(Reservoir::with_capacity(capacity));
        queue
    }

    #[test]
    fn test_scheduling_is_idempotent() {
        let dispatch = Dispatch::new();
        let space = status_space(0b0101);
        let queue = queue(8);
        assert_eq!(
            dispatch.interrupt(&space, &wiring(), &queue, Stamp(1)),
            IrqOutcome::Schedule
        );
        assert_eq!(
            dispatch.interrupt(&space, &wiring(), &queue, Stamp(2)),
            IrqOutcome::Pending
        );
        assert!(dispatch.work_pending());
        assert_eq!(queue.fillpoint(), 2);
    }

    #[test]
    fn test_masked_zero_status_is_unclaimed() {
        let dispatch = Dispatch::new();
        // Bits set only outside the wiring mask.
        let space = status_space(0xf0);
        let queue = queue(8);
        assert_eq!(
            dispatch.interrupt(&space, &wiring(), &queue, Stamp(1)),
            IrqOutcome::Unclaimed
        );
        assert!(!dispatch.work_pending());
        assert_eq!(queue.fillpoint(), 0);
        assert_eq!(dispatch.stats().unclaimed, 1);
    }

    #[test]
    fn test_overflow_latches_and_still_schedules() {
        let dispatch = Dispatch::new();
        let space = status_space(0b0001);
        let queue = queue(1);
        assert_eq!(
            dispatch.interrupt(&space, &wiring(), &queue, Stamp(1)),
            IrqOutcome::Schedule
        );
        // Queue full: the note is dropped but the worker is still wanted.
        assert_eq!(
            dispatch.interrupt(&space, &wiring(), &queue, Stamp(2)),
            IrqOutcome::Pending
        );
        assert!(dispatch.take_overflow());
        assert!(!dispatch.take_overflow());
        let stats = dispatch.stats();
        assert_eq!(stats.appended, 1);
        assert_eq!(stats.dropped, 1);
    }

    #[test]
    fn test_deferred_run_delivers_and_clears_pending() {
        let dispatch = Dispatch::new();
        let space = status_space(0b0011);
        let queue = queue(8);
        let arbiter = HandleArbiter::new();
        let a = arbiter.open();
        let b = arbiter.open();
        dispatch.interrupt(&space, &wiring(), &queue, Stamp(5));
        assert_eq!(dispatch.run_deferred(&queue, &arbiter), 1);
        assert!(!dispatch.work_pending());
        assert_eq!(queue.fillpoint(), 0);
        for handle in [a, b] {
            let note = arbiter
                .take_note(handle)
                .expect("handle should exist")
                .expect("note should have been fanned out");
            assert_eq!(note.bits, 0b0011);
            assert_eq!(note.stamp, Stamp(5));
        }
        assert_eq!(dispatch.stats().delivered, 1);
    }

    #[test]
    fn test_contended_probe_defers_to_worker() {
        let dispatch = Dispatch::new();
        let space = status_space(0b0001);
        let queue = queue(8);
        let guard = space.lock_bus();
        assert_eq!(
            dispatch.interrupt(&space, &wiring(), &queue, Stamp(1)),
            IrqOutcome::Schedule
        );
        drop(guard);
        // Nothing was read, so nothing was queued.
        assert_eq!(queue.fillpoint(), 0);
        let stats = dispatch.stats();
        assert_eq!(stats.probe_contended, 1);
        assert_eq!(stats.claimed, 0);
    }

    #[test]
    fn test_unreadable_wiring_is_unclaimed_not_contended() {
        let dispatch = Dispatch::new();
        let space = status_space(0b0001);
        let queue = queue(8);
        // Offset 9 lies outside the 4-register space.
        let unmapped = IrqWiring {
            space: SpaceId::new(0),
            offset: 9,
            mask: 0x0f,
        };
        assert_eq!(
            dispatch.interrupt(&space, &unmapped, &queue, Stamp(1)),
            IrqOutcome::Unclaimed
        );
        assert!(!dispatch.work_pending());
        assert_eq!(queue.fillpoint(), 0);
        let stats = dispatch.stats();
        assert_eq!(stats.unclaimed, 1);
        assert_eq!(stats.probe_contended, 0);
        assert_eq!(stats.claimed, 0);
    }

    #[test]
    fn test_empty_drain_counts_but_delivers_nothing() {
        let dispatch = Dispatch::new();
        let queue = queue(4);
        let arbiter = HandleArbiter::new();
        assert_eq!(dispatch.run_deferred(&queue, &arbiter), 0);
        let stats = dispatch.stats();
        assert_eq!(stats.drains, 1);
        assert_eq!(stats.delivered, 0);
    }
}
