//! # Tally: Counter/Timer Card Coordination
//!
//! Device-coordination layer for counter/timer acquisition cards. The
//! layer is responsible for exactly four things:
//!
//! 1. **Register access** (`regspace`): validated, serialized transfers
//!    over sparse register spaces, with a try-acquire probe for interrupt
//!    context
//! 2. **Notification queueing** (`queue`): a capacity-bounded FIFO of
//!    interrupt notes over a chain of fixed-size blocks
//! 3. **Handle arbitration** (`handle`): open handles, the single
//!    exclusive-access holder, per-handle note accumulation, view counts
//! 4. **Interrupt dispatch** (`dispatch`): the split between a minimal
//!    hard-interrupt half and a deferred worker half
//!
//! [`device`] composes the four into one card and fronts every external
//! operation; [`registry`] tracks registered cards process-wide.
//!
//! ## Execution contexts
//!
//! Three contexts touch a device. Ordinary callers invoke the operations
//! on [`Device`]. The embedder's interrupt handler calls
//! [`Device::interrupt`], which never blocks. The embedder's worker calls
//! [`Device::run_deferred`] whenever the interrupt half asks for it, and
//! that is where queued notes reach the per-handle accumulators.
//!
//! ## Embedding
//!
//! The crate is freestanding and hardware-agnostic: the embedder
//! implements [`RegisterBus`] over the real card, supplies a monotonic
//! [`Stamp`] at each interrupt entry, and wires scheduling of the
//! deferred half to whatever worker mechanism it has. Blocking, waking,
//! and memory-mapping the view extent returned by [`Device::map_view`]
//! are embedder concerns as well.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod device;
pub mod dispatch;
pub mod error;
pub mod handle;
pub mod queue;
pub mod registry;
pub mod regspace;

/// Crate version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = "tally";

/// Width of one device register as moved over the bus.
pub type RegWord = u32;

pub use device::{Ack, Device, DeviceConfig, DeviceId, Readiness};
pub use dispatch::{DispatchSnapshot, IrqOutcome, IrqWiring};
pub use error::Error;
pub use handle::{HandleArbiter, HandleId};
pub use queue::{Note, NoteQueue, Reservoir, Stamp, BLOCK_SLOTS};
pub use registry::DeviceRegistry;
pub use regspace::{MemoryBus, RegisterBus, RegisterSpace, SpaceId};

pub use tally_regmap::{Access, Direction, Placement, RunMap, SpaceLayout};
