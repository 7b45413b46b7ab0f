//! Primitives the host runtime provides to the scheduler.

use crate::cpumask::CpuMask;
use crate::types::STime;

/// Clock and inter-processor signalling of the host.
pub trait SchedHost: Send + Sync {
    /// Current system time in nanoseconds
    fn now(&self) -> STime;

    /// Ask every pCPU in `mask` to run the scheduling decision soon
    fn raise_schedule_softirq(&self, mask: &CpuMask);
}
