//! # Device
//!
//! One counter/timer acquisition card, composed from its register spaces,
//! its notification queue, its handle arbiter, and its interrupt dispatch
//! state. Every external operation of the coordination layer enters
//! through this type.
//!
//! ## Locking
//!
//! A device carries independent locks plus per-part atomics: each register
//! space serializes its own bus, the queue's read cursor has its own lock,
//! the handle arbiter has its own, and interrupt control has a fourth. The
//! only sanctioned nesting is interrupt control above a space or queue
//! lock, during enable, disable, and reset; no other operation holds two
//! locks at once, and nothing acquires interrupt control while holding any
//! other lock. Interrupt-context code takes none of them outright; it only
//! try-acquires the wired space lock through the probe path.
//!
//! ## Embedding
//!
//! The embedder wires three execution contexts to a device: its interrupt
//! handler calls [`Device::interrupt`] with a stamp taken at entry, its
//! worker calls [`Device::run_deferred`] whenever `interrupt` asked for a
//! schedule, and ordinary callers invoke everything else. Before calling
//! [`Device::disable_interrupts`] the embedder must ensure no call to
//! `interrupt` is still in flight, the same way it quiesces the interrupt
//! line before tearing anything down.

use alloc::string::String;
use alloc::vec::Vec;
use core::mem::size_of;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use bitflags::bitflags;
use spin::Mutex;
use tally_regmap::{Direction, Placement};

use crate::dispatch::{Dispatch, DispatchSnapshot, IrqOutcome, IrqWiring};
use crate::error::Error;
use crate::handle::{HandleArbiter, HandleId};
use crate::queue::{Note, NoteQueue, Reservoir, Stamp};
use crate::regspace::{RegisterSpace, SpaceId};
use crate::RegWord;

/// Registry-assigned device identifier. Zero until the device is added to
/// a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u64);

impl DeviceId {
    /// Creates a device id from a raw value.
    pub const fn new(id: u64) -> Self {
        DeviceId(id)
    }
}

/// Static description of one device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Name used in log messages.
    pub name: String,
    /// Queue capacity installed when interrupts are enabled with a zero
    /// capacity request.
    pub default_queue_capacity: usize,
    /// Where the device raises its interrupt status.
    pub wiring: IrqWiring,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            name: String::from("card0"),
            default_queue_capacity: 32,
            wiring: IrqWiring {
                space: SpaceId::new(0),
                offset: 0,
                mask: RegWord::MAX,
            },
        }
    }
}

/// Result of acknowledging interrupt notifications on a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    /// Interrupt source bits accumulated since the previous
    /// acknowledgement; zero when nothing was pending.
    pub bits: RegWord,
    /// Stamp of the latest accumulated notification, or the caller's stamp
    /// when `bits` is zero.
    pub stamp: Stamp,
    /// A notification was dropped against a full queue since the flag was
    /// last reported.
    pub overflow: bool,
    /// Interrupt delivery is not live.
    pub offline: bool,
}

bitflags! {
    /// What a handle would learn from waiting on the device.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Readiness: u8 {
        /// An unconsumed notification is pending on the handle.
        const NOTE = 1 << 0;
        /// Interrupt delivery is not live; no further notes will arrive.
        const HANGUP = 1 << 1;
    }
}

/// Registration lifecycle of a device, in `membership`.
const MEMBER_FRESH: u8 = 0;
const MEMBER_LINKED: u8 = 1;
const MEMBER_RETIRED: u8 = 2;

/// Interrupt-delivery control state.
struct IrqControl {
    enabled: bool,
    capacity: usize,
}

/// One acquisition card and all of its coordination state.
pub struct Device {
    /// Registry-assigned id; zero while unregistered.
    id: AtomicU64,
    membership: AtomicU8,
    config: DeviceConfig,
    spaces: Vec<RegisterSpace>,
    queue: NoteQueue,
    arbiter: HandleArbiter,
    dispatch: Dispatch,
    irq: Mutex<IrqControl>,
    /// True from interrupt enable to disable; gates the interrupt half.
    delivering: AtomicBool,
}

impl Device {
    /// Creates a device over `spaces`, checking that the interrupt wiring
    /// points at a readable register.
    pub fn new(config: DeviceConfig, spaces: Vec<RegisterSpace>) -> Result<Self, Error> {
        let space = spaces
            .get(config.wiring.space.0)
            .ok_or(Error::SpaceNotFound)?;
        match space.map().classify(Direction::Read, config.wiring.offset, 1) {
            Placement::Admitted(_) => {}
            Placement::Unmapped => return Err(Error::UnmappedAddress),
            Placement::WrongDirection => return Err(Error::WrongDirection),
        }
        Ok(Device {
            id: AtomicU64::new(0),
            membership: AtomicU8::new(MEMBER_FRESH),
            config,
            spaces,
            queue: NoteQueue::new(),
            arbiter: HandleArbiter::new(),
            dispatch: Dispatch::new(),
            irq: Mutex::new(IrqControl {
                enabled: false,
                capacity: 0,
            }),
            delivering: AtomicBool::new(false),
        })
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Registry-assigned id; `DeviceId(0)` while the device has never been
    /// registered.
    pub fn id(&self) -> DeviceId {
        DeviceId(self.id.load(Ordering::Acquire))
    }

    /// Resolves a space name to its id.
    pub fn find_space(&self, name: &str) -> Option<SpaceId> {
        self.spaces
            .iter()
            .position(|space| space.name() == name)
            .map(SpaceId)
    }

    /// Opens a fresh handle on the device.
    pub fn open(&self) -> HandleId {
        let handle = self.arbiter.open();
        log::debug!("{}: handle {} opened", self.config.name, handle.0);
        handle
    }

    /// Closes `handle`. Refused while the handle still has mapped views.
    pub fn close(&self, handle: HandleId) -> Result<(), Error> {
        self.arbiter.close(handle)?;
        log::debug!("{}: handle {} closed", self.config.name, handle.0);
        Ok(())
    }

    /// Claims exclusive access for `handle`; see
    /// [`HandleArbiter::claim_exclusive`].
    pub fn claim_exclusive(&self, handle: HandleId) -> Result<bool, Error> {
        let granted = self.arbiter.claim_exclusive(handle)?;
        if granted {
            log::debug!(
                "{}: handle {} holds exclusive access",
                self.config.name,
                handle.0
            );
        }
        Ok(granted)
    }

    /// Releases `handle`'s exclusivity claim, if it is the holder.
    pub fn release_exclusive(&self, handle: HandleId) -> Result<(), Error> {
        let held = self.arbiter.holds_exclusive(handle);
        self.arbiter.release_exclusive(handle)?;
        if held {
            log::debug!(
                "{}: handle {} released exclusive access",
                self.config.name,
                handle.0
            );
        }
        Ok(())
    }

    /// True when `handle` may perform state-changing operations.
    pub fn may_change_device_state(&self, handle: HandleId) -> bool {
        self.arbiter.may_change_device_state(handle)
    }

    /// Resets the device: stores zero to every writable register of every
    /// space and discards any leftover queue storage. Refused while
    /// interrupt delivery is enabled.
    pub fn reset(&self, handle: HandleId) -> Result<(), Error> {
        self.ensure_open(handle)?;
        if !self.arbiter.may_change_device_state(handle) {
            return Err(Error::AccessDenied);
        }
        // Held to the end so an enable cannot interleave with the wipe.
        let irq = self.irq.lock();
        if irq.enabled {
            return Err(Error::Busy);
        }
        for space in &self.spaces {
            space.reset();
        }
        self.queue.replace_reservoir(Reservoir::empty());
        self.dispatch.clear_overflow();
        log::info!("{}: device reset", self.config.name);
        Ok(())
    }

    /// Enables interrupt delivery with a queue of `capacity` notes, where
    /// zero requests the configured default. Re-enabling with the current
    /// capacity is a no-op; re-enabling with a different one is refused
    /// until delivery is disabled first.
    pub fn enable_interrupts(&self, handle: HandleId, capacity: usize) -> Result<(), Error> {
        self.ensure_open(handle)?;
        if !self.arbiter.may_change_device_state(handle) {
            return Err(Error::AccessDenied);
        }
        let want = if capacity == 0 {
            self.config.default_queue_capacity
        } else {
            capacity
        };
        // Built before taking the control lock; dropped unused when the
        // enable turns out to be a no-op.
        let fresh = Reservoir::with_capacity(want);
        let mut irq = self.irq.lock();
        if irq.enabled {
            if irq.capacity == want {
                return Ok(());
            }
            return Err(Error::Busy);
        }
        self.queue.replace_reservoir(fresh);
        self.dispatch.clear_overflow();
        irq.enabled = true;
        irq.capacity = want;
        self.delivering.store(true, Ordering::Release);
        log::info!(
            "{}: interrupt delivery enabled, queue capacity {}",
            self.config.name,
            want
        );
        Ok(())
    }

    /// Disables interrupt delivery, discarding queued notes that were
    /// never delivered. A no-op when delivery is already off.
    ///
    /// The embedder must ensure no [`Device::interrupt`] call is in flight.
    pub fn disable_interrupts(&self, handle: HandleId) -> Result<(), Error> {
        self.ensure_open(handle)?;
        if !self.arbiter.may_change_device_state(handle) {
            return Err(Error::AccessDenied);
        }
        let mut irq = self.irq.lock();
        if !irq.enabled {
            return Ok(());
        }
        // Stop the interrupt half before tearing the reservoir down.
        self.delivering.store(false, Ordering::Release);
        self.queue.replace_reservoir(Reservoir::empty());
        irq.enabled = false;
        irq.capacity = 0;
        log::info!("{}: interrupt delivery disabled", self.config.name);
        Ok(())
    }

    /// Acknowledges interrupt notifications on `handle`: drains any queued
    /// notes, then returns and clears the handle's accumulated bits and
    /// latest stamp. `now` stamps the acknowledgement when nothing was
    /// pending. The sticky overflow flag is reported and cleared here.
    pub fn acknowledge(&self, handle: HandleId, now: Stamp) -> Result<Ack, Error> {
        self.ensure_open(handle)?;
        self.run_deferred();
        let overflow = self.dispatch.take_overflow();
        if overflow {
            log::warn!("{}: notification queue overflowed", self.config.name);
        }
        let offline = !self.delivering.load(Ordering::Acquire);
        let ack = match self.arbiter.take_note(handle)? {
            Some(note) => Ack {
                bits: note.bits,
                stamp: note.stamp,
                overflow,
                offline,
            },
            None => Ack {
                bits: 0,
                stamp: now,
                overflow,
                offline,
            },
        };
        Ok(ack)
    }

    /// Reads registers from the space `space` of this device. Reads are
    /// never gated by exclusivity.
    pub fn read_registers(
        &self,
        handle: HandleId,
        space: SpaceId,
        offset: usize,
        buf: &mut [RegWord],
    ) -> Result<usize, Error> {
        self.ensure_open(handle)?;
        self.space(space)?.read(offset, buf)
    }

    /// Writes registers to the space `space` of this device. Gated on
    /// [`Device::may_change_device_state`].
    pub fn write_registers(
        &self,
        handle: HandleId,
        space: SpaceId,
        offset: usize,
        values: &[RegWord],
    ) -> Result<usize, Error> {
        self.ensure_open(handle)?;
        if !self.arbiter.may_change_device_state(handle) {
            return Err(Error::AccessDenied);
        }
        self.space(space)?.write(offset, values)
    }

    /// Establishes a mapped view of the notification storage for `handle`
    /// and returns its extent in bytes. Requires `handle` to hold
    /// exclusive access and interrupt delivery to be enabled.
    pub fn map_view(&self, handle: HandleId) -> Result<usize, Error> {
        self.ensure_open(handle)?;
        if !self.arbiter.holds_exclusive(handle) {
            return Err(Error::AccessDenied);
        }
        let extent = self.queue.capacity() * size_of::<Note>();
        if extent == 0 {
            return Err(Error::Busy);
        }
        self.arbiter.begin_map(handle)?;
        Ok(extent)
    }

    /// Tears down one mapped view of `handle`.
    pub fn unmap_view(&self, handle: HandleId) -> Result<(), Error> {
        self.arbiter.end_map(handle)
    }

    /// Reports what `handle` would learn from waiting on the device. Notes
    /// become visible here once the deferred half has delivered them.
    pub fn poll(&self, handle: HandleId) -> Result<Readiness, Error> {
        let mut ready = Readiness::empty();
        if self.arbiter.has_note(handle)? {
            ready |= Readiness::NOTE;
        }
        if !self.delivering.load(Ordering::Acquire) {
            ready |= Readiness::HANGUP;
        }
        Ok(ready)
    }

    /// Hard-interrupt entry point. Call from interrupt context with `now`
    /// taken at entry; returns what the caller should do next.
    pub fn interrupt(&self, now: Stamp) -> IrqOutcome {
        if !self.delivering.load(Ordering::Acquire) {
            // Delivery is off, so a raised line cannot be ours.
            self.dispatch.record_unclaimed();
            return IrqOutcome::Unclaimed;
        }
        // Wiring was validated at construction.
        let space = &self.spaces[self.config.wiring.space.0];
        self.dispatch
            .interrupt(space, &self.config.wiring, &self.queue, now)
    }

    /// Deferred half: drains queued notes into the per-handle
    /// accumulators. Returns the number of notes delivered.
    pub fn run_deferred(&self) -> usize {
        self.dispatch.run_deferred(&self.queue, &self.arbiter)
    }

    /// Snapshot of the interrupt dispatch counters.
    pub fn stats(&self) -> DispatchSnapshot {
        self.dispatch.stats()
    }

    /// Installed queue capacity in notes; zero while delivery is off.
    pub fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Notes currently queued and not yet delivered.
    pub fn queue_fillpoint(&self) -> usize {
        self.queue.fillpoint()
    }

    /// True while the device has open handles, live views, or interrupt
    /// delivery enabled.
    pub fn in_use(&self) -> bool {
        self.arbiter.open_count() > 0
            || self.arbiter.view_count() > 0
            || self.delivering.load(Ordering::Acquire)
    }

    /// Claims the device for a registry. Fails once it has ever been
    /// linked, so a device object cannot be registered twice.
    pub(crate) fn link(&self, id: DeviceId) -> bool {
        if self
            .membership
            .compare_exchange(
                MEMBER_FRESH,
                MEMBER_LINKED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        self.id.store(id.0, Ordering::Release);
        true
    }

    /// Marks the device as removed from its registry. The id is kept for
    /// log correlation.
    pub(crate) fn unlink(&self) {
        self.membership.store(MEMBER_RETIRED, Ordering::Release);
    }

    fn ensure_open(&self, handle: HandleId) -> Result<(), Error> {
        if self.arbiter.is_open(handle) {
            Ok(())
        } else {
            Err(Error::HandleNotFound)
        }
    }

    fn space(&self, id: SpaceId) -> Result<&RegisterSpace, Error> {
        self.spaces.get(id.0).ok_or(Error::SpaceNotFound)
    }
}
