//! Basic identifiers and time units shared by the whole crate.

/// Physical CPU index.
pub type CpuId = usize;

/// Guest domain identifier.
pub type DomainId = u16;

/// System time in nanoseconds. Signed so that differences can go negative.
pub type STime = i64;

/// Domain id reserved for the per-pCPU idle vCPUs.
pub const IDLE_DOMAIN_ID: DomainId = 0x7FFF;

pub const NSEC_PER_USEC: STime = 1_000;
pub const NSEC_PER_MSEC: STime = 1_000_000;

#[inline]
pub const fn microsecs(us: u64) -> STime {
    us as STime * NSEC_PER_USEC
}

#[inline]
pub const fn millisecs(ms: u64) -> STime {
    ms as STime * NSEC_PER_MSEC
}
