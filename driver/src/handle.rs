//! # Handle and Exclusive-Access Arbiter
//!
//! Tracks the open handles of one device, the single handle blessed with
//! exclusive access, and the per-handle state that accumulates between
//! acknowledgements.
//!
//! ## Exclusivity
//!
//! At most one handle holds exclusive access at a time. Claiming is
//! first-come-first-served and idempotent: re-claiming through the holder
//! succeeds, claiming through any other handle fails without waiting, and
//! there is no queue of waiters. State-changing device operations are
//! gated on [`HandleArbiter::may_change_device_state`], which admits every
//! handle while no claim is outstanding and only the holder otherwise.
//!
//! ## Notes and views
//!
//! Each delivered interrupt note is fanned out to every open handle:
//! source bits accumulate by OR and the stamp of the latest note wins,
//! until [`HandleArbiter::take_note`] consumes the accumulator. Mapped
//! views are counted per handle so a handle with live mappings cannot be
//! closed out from under them.

use alloc::collections::BTreeMap;

use spin::Mutex;

use crate::error::Error;
use crate::queue::{Note, Stamp};
use crate::RegWord;

/// Identifies one open handle on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(pub u64);

impl HandleId {
    /// Creates a handle id from a raw value.
    pub const fn new(id: u64) -> Self {
        HandleId(id)
    }
}

/// Interrupt source bits and stamp pending on one handle.
#[derive(Debug, Clone, Copy, Default)]
struct Accumulator {
    bits: RegWord,
    stamp: Stamp,
}

/// Per-handle bookkeeping.
#[derive(Debug, Default)]
struct HandleState {
    /// Live mapped views created through this handle.
    views: u32,
    acc: Accumulator,
}

#[derive(Debug)]
struct ArbiterInner {
    handles: BTreeMap<HandleId, HandleState>,
    /// Holder of exclusive access, if any.
    blessed: Option<HandleId>,
    /// Live mapped views across all handles.
    total_views: u64,
    next_handle: u64,
}

/// Handle table and exclusive-access state of one device.
pub struct HandleArbiter {
    inner: Mutex<ArbiterInner>,
}

impl HandleArbiter {
    /// Creates an arbiter with no handles and no exclusivity claim.
    pub fn new() -> Self {
        HandleArbiter {
            inner: Mutex::new(ArbiterInner {
                handles: BTreeMap::new(),
                blessed: None,
                total_views: 0,
                next_handle: 0,
            }),
        }
    }

    /// Opens a fresh handle. Ids are never reused within an arbiter.
    pub fn open(&self) -> HandleId {
        let mut inner = self.inner.lock();
        inner.next_handle += 1;
        let id = HandleId(inner.next_handle);
        inner.handles.insert(id, HandleState::default());
        id
    }

    /// Closes `handle`, releasing its exclusivity claim if it is the
    /// holder. Refused while the handle still has mapped views.
    pub fn close(&self, handle: HandleId) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let state = inner.handles.get(&handle).ok_or(Error::HandleNotFound)?;
        if state.views > 0 {
            return Err(Error::ViewsActive);
        }
        if inner.blessed == Some(handle) {
            inner.blessed = None;
        }
        inner.handles.remove(&handle);
        Ok(())
    }

    /// True when `handle` is open.
    pub fn is_open(&self, handle: HandleId) -> bool {
        self.inner.lock().handles.contains_key(&handle)
    }

    /// Claims exclusive access for `handle`. Returns `Ok(true)` when the
    /// claim is held afterwards (including a re-claim by the holder) and
    /// `Ok(false)` when another handle already holds it. Never waits.
    pub fn claim_exclusive(&self, handle: HandleId) -> Result<bool, Error> {
        let mut inner = self.inner.lock();
        if !inner.handles.contains_key(&handle) {
            return Err(Error::HandleNotFound);
        }
        match inner.blessed {
            None => {
                inner.blessed = Some(handle);
                Ok(true)
            }
            Some(holder) => Ok(holder == handle),
        }
    }

    /// Releases the exclusivity claim if `handle` is the holder. Releasing
    /// without holding is a no-op.
    pub fn release_exclusive(&self, handle: HandleId) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        if !inner.handles.contains_key(&handle) {
            return Err(Error::HandleNotFound);
        }
        if inner.blessed == Some(handle) {
            inner.blessed = None;
        }
        Ok(())
    }

    /// True when `handle` currently holds exclusive access.
    pub fn holds_exclusive(&self, handle: HandleId) -> bool {
        self.inner.lock().blessed == Some(handle)
    }

    /// True when `handle` may perform state-changing device operations:
    /// either no claim is outstanding or `handle` is the holder. Unknown
    /// handles may not.
    pub fn may_change_device_state(&self, handle: HandleId) -> bool {
        let inner = self.inner.lock();
        if !inner.handles.contains_key(&handle) {
            return false;
        }
        match inner.blessed {
            None => true,
            Some(holder) => holder == handle,
        }
    }

    /// Records a new mapped view on `handle`.
    pub fn begin_map(&self, handle: HandleId) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let state = inner
            .handles
            .get_mut(&handle)
            .ok_or(Error::HandleNotFound)?;
        state.views += 1;
        inner.total_views += 1;
        Ok(())
    }

    /// Records that a mapped view on `handle` went away.
    pub fn end_map(&self, handle: HandleId) -> Result<(), Error> {
        let mut inner = self.inner.lock();
        let state = inner
            .handles
            .get_mut(&handle)
            .ok_or(Error::HandleNotFound)?;
        if state.views == 0 {
            return Err(Error::NoView);
        }
        state.views -= 1;
        inner.total_views -= 1;
        Ok(())
    }

    /// Live mapped views across all handles.
    pub fn view_count(&self) -> u64 {
        self.inner.lock().total_views
    }

    /// Number of open handles.
    pub fn open_count(&self) -> usize {
        self.inner.lock().handles.len()
    }

    /// Fans `note` out to every open handle: bits accumulate by OR and the
    /// note's stamp replaces the stored one. Returns the number of handles
    /// reached.
    pub fn deliver(&self, note: Note) -> usize {
        let mut inner = self.inner.lock();
        for state in inner.handles.values_mut() {
            state.acc.bits |= note.bits;
            state.acc.stamp = note.stamp;
        }
        inner.handles.len()
    }

    /// Consumes the pending note of `handle`: returns the accumulated bits
    /// and latest stamp and clears them, or `None` when nothing has been
    /// delivered since the last call.
    pub fn take_note(&self, handle: HandleId) -> Result<Option<Note>, Error> {
        let mut inner = self.inner.lock();
        let state = inner
            .handles
            .get_mut(&handle)
            .ok_or(Error::HandleNotFound)?;
        if state.acc.bits == 0 {
            return Ok(None);
        }
        let note = Note {
            bits: state.acc.bits,
            stamp: state.acc.stamp,
        };
        state.acc = Accumulator::default();
        Ok(Some(note))
    }

    /// True when `handle` has an unconsumed note.
    pub fn has_note(&self, handle: HandleId) -> Result<bool, Error> {
        let inner = self.inner.lock();
        let state = inner.handles.get(&handle).ok_or(Error::HandleNotFound)?;
        Ok(state.acc.bits != 0)
    }
}

impl Default for HandleArbiter {
    fn default() -> Self {
        Self::new()
    }
}
