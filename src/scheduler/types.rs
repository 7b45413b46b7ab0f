//! Credit scheduler constants and priority/flag types

use std::fmt;

use bitflags::bitflags;
use serde::Serialize;

/// Default domain weight
pub const DEFAULT_WEIGHT: u32 = 256;

/// Highest accepted domain weight. Keeps the total weight of every active
/// vCPU within `u32`.
pub const MAX_WEIGHT: u32 = u16::MAX as u32;

/// Ticks per timeslice when the timeslice is long enough
pub const TICKS_PER_TSLICE: u32 = 3;

/// Credits burned per millisecond of run time
pub const CREDITS_PER_MSEC: i64 = 10;

/// Highest accepted domain cap, in percent of one pCPU
pub const MAX_CAP: u16 = 100;

/// Scheduling priority. Declaration order is the priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(i8)]
pub enum Priority {
    /// The per-pCPU idle vCPU
    Idle = -64,
    /// Spent its credit for this period
    Over = -2,
    /// Still has credit
    Under = -1,
    /// Just woke up with credit left
    Boost = 0,
}

impl Priority {
    #[inline]
    pub const fn as_raw(self) -> i8 {
        self as i8
    }

    #[inline]
    pub fn from_raw(raw: i8) -> Priority {
        match raw {
            0 => Priority::Boost,
            -1 => Priority::Under,
            -2 => Priority::Over,
            _ => Priority::Idle,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_raw())
    }
}

bitflags! {
    /// Per-vCPU scheduler flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VcpuFlags: u16 {
        /// Paused because its domain went over its cap
        const PARKED = 0x1;
        /// Asked to give up its place in the run queue once
        const YIELD = 0x2;
    }
}
