//! # Tally Register Run Maps
//!
//! This crate models the address layout of a sparse hardware register space:
//! a range of fixed-width registers in which some offsets are unused
//! ("holes") and the usable offsets are not all accessible in the same
//! direction.
//!
//! ## Model
//!
//! - **`SpaceLayout`**: a builder that marks which offset ranges exist and
//!   with which [`Access`] directions.
//! - **`RunMap`**: the frozen lookup tables derived from a layout. For each
//!   direction and each offset it records the length of the maximum run of
//!   contiguously accessible registers starting there, 0 if the offset is
//!   not accessible in that direction.
//! - **`Placement`**: the verdict for a multi-register transfer request,
//!   distinguishing an unmapped start offset from a wrong-direction one and
//!   truncating requests that cross into a hole.
//!
//! ## Design
//!
//! - Pure Rust, no concurrency concerns; serialization of the actual
//!   hardware access is the caller's job.
//! - A transfer is validated before any hardware access: run lookup is O(1)
//!   per request, the tables are built once per space.

#![no_std]

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::vec::Vec;

use core::ops::Range;

bitflags::bitflags! {
    /// Access directions an offset supports.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u8 {
        /// Offset may be read.
        const RD = 1 << 0;
        /// Offset may be written.
        const WR = 1 << 1;
        /// Offset may be read and written.
        const RW = Self::RD.bits() | Self::WR.bits();
    }
}

/// Direction of a register transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    /// The access flag a transfer in this direction requires.
    pub const fn required(self) -> Access {
        match self {
            Direction::Read => Access::RD,
            Direction::Write => Access::WR,
        }
    }

    /// The opposite transfer direction.
    pub const fn flip(self) -> Direction {
        match self {
            Direction::Read => Direction::Write,
            Direction::Write => Direction::Read,
        }
    }
}

/// Verdict for a transfer request against a [`RunMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// The transfer may proceed for this many registers. The count equals
    /// the request when the whole range lies in one run and is smaller when
    /// the request crosses into a hole.
    Admitted(usize),
    /// The start offset is not a register in any direction, or lies outside
    /// the space.
    Unmapped,
    /// The start offset is a register, but not in the requested direction.
    WrongDirection,
}

/// Builder for a space's register layout.
///
/// Starts with every offset a hole; [`mark`](SpaceLayout::mark) adds access
/// flags for ranges. Flags accumulate, so a range may be declared readable
/// and writable in separate calls.
#[cfg(feature = "alloc")]
#[derive(Debug, Clone)]
pub struct SpaceLayout {
    access: Vec<Access>,
}

#[cfg(feature = "alloc")]
impl SpaceLayout {
    /// Creates a layout of `len` offsets, all holes.
    pub fn new(len: usize) -> Self {
        Self {
            access: alloc::vec![Access::empty(); len],
        }
    }

    /// Number of addressable offsets.
    pub fn len(&self) -> usize {
        self.access.len()
    }

    /// True when the layout has no offsets at all.
    pub fn is_empty(&self) -> bool {
        self.access.is_empty()
    }

    /// Adds `access` to every offset in `range`. Offsets beyond the layout
    /// end are ignored.
    pub fn mark(&mut self, range: Range<usize>, access: Access) -> &mut Self {
        let end = range.end.min(self.access.len());
        for off in range.start..end {
            self.access[off] |= access;
        }
        self
    }

    /// Freezes the layout into per-direction run lookup tables.
    pub fn build(&self) -> RunMap {
        RunMap {
            rd_runs: build_runs(&self.access, Access::RD),
            wr_runs: build_runs(&self.access, Access::WR),
        }
    }
}

/// Computes the run table for one direction: `runs[i]` is the length of the
/// maximum contiguous run of offsets accessible in that direction starting
/// at `i`, so a run spanning `[lower, upper]` yields `upper - lower + 1` at
/// its start, counting down to 1 at its end.
#[cfg(feature = "alloc")]
fn build_runs(access: &[Access], dir: Access) -> Vec<u32> {
    let mut runs = alloc::vec![0u32; access.len()];
    let mut ahead = 0u32;
    for off in (0..access.len()).rev() {
        ahead = if access[off].contains(dir) { ahead + 1 } else { 0 };
        runs[off] = ahead;
    }
    runs
}

/// Frozen per-direction run lookup tables for one register space.
#[cfg(feature = "alloc")]
#[derive(Debug, Clone)]
pub struct RunMap {
    rd_runs: Vec<u32>,
    wr_runs: Vec<u32>,
}

#[cfg(feature = "alloc")]
impl RunMap {
    /// Number of addressable offsets in the space.
    pub fn len(&self) -> usize {
        self.rd_runs.len()
    }

    /// True when the space has no offsets at all.
    pub fn is_empty(&self) -> bool {
        self.rd_runs.is_empty()
    }

    /// The contiguous run length at `offset` in `dir`, 0 when the offset is
    /// a hole in that direction or lies outside the space.
    pub fn run(&self, dir: Direction, offset: usize) -> usize {
        self.runs(dir).get(offset).copied().unwrap_or(0) as usize
    }

    /// Validates a transfer of `count` registers at `offset` in `dir`.
    ///
    /// The start offset is judged before the count: a transfer starting in
    /// a hole is refused even for `count == 0`, while a valid start with a
    /// count beyond the run is admitted for the run prefix only.
    pub fn classify(&self, dir: Direction, offset: usize, count: usize) -> Placement {
        let run = self.run(dir, offset);
        if run == 0 {
            if self.run(dir.flip(), offset) > 0 {
                return Placement::WrongDirection;
            }
            return Placement::Unmapped;
        }
        Placement::Admitted(run.min(count))
    }

    fn runs(&self, dir: Direction) -> &[u32] {
        match dir {
            Direction::Read => &self.rd_runs,
            Direction::Write => &self.wr_runs,
        }
    }
}
