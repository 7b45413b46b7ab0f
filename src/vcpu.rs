//! Host-owned virtual CPU
//!
//! This is the generic vCPU object of the hypervisor's object model. The
//! scheduler keeps a non-owning view of it through
//! [`CreditVcpu`](crate::scheduler::CreditVcpu) and only reads or updates
//! the fields the scheduling framework hands to it.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::cpumask::CpuMask;
use crate::types::{CpuId, DomainId, STime, IDLE_DOMAIN_ID};

pub struct Vcpu {
    domain_id: DomainId,
    vcpu_id: u32,
    /// pCPU whose run queue this vCPU belongs to
    processor: AtomicUsize,
    /// Currently dispatched on `processor`
    is_running: AtomicBool,
    blocked: AtomicBool,
    pause_count: AtomicU32,
    /// Waiting to be moved to another pCPU; not runnable meanwhile
    migrating: AtomicBool,
    affinity: RwLock<CpuMask>,
    /// Time at which it was last descheduled
    last_run_time: AtomicI64,
    /// Time of the last running/runnable/blocked transition
    state_entry_time: AtomicI64,
}

impl Vcpu {
    pub fn new(domain_id: DomainId, vcpu_id: u32, processor: CpuId) -> Self {
        Self {
            domain_id,
            vcpu_id,
            processor: AtomicUsize::new(processor),
            is_running: AtomicBool::new(false),
            blocked: AtomicBool::new(false),
            pause_count: AtomicU32::new(0),
            migrating: AtomicBool::new(false),
            affinity: RwLock::new(CpuMask::all()),
            last_run_time: AtomicI64::new(0),
            state_entry_time: AtomicI64::new(0),
        }
    }

    /// The idle vCPU of `cpu`. It is always running or runnable.
    pub fn new_idle(cpu: CpuId) -> Self {
        let vcpu = Self::new(IDLE_DOMAIN_ID, cpu as u32, cpu);
        *vcpu.affinity.write() = CpuMask::single(cpu);
        vcpu
    }

    pub fn with_affinity(self, affinity: CpuMask) -> Self {
        *self.affinity.write() = affinity;
        self
    }

    pub fn domain_id(&self) -> DomainId {
        self.domain_id
    }

    pub fn vcpu_id(&self) -> u32 {
        self.vcpu_id
    }

    pub fn is_idle(&self) -> bool {
        self.domain_id == IDLE_DOMAIN_ID
    }

    pub fn processor(&self) -> CpuId {
        self.processor.load(Ordering::Acquire)
    }

    pub fn set_processor(&self, cpu: CpuId) {
        self.processor.store(cpu, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    pub fn set_running(&self, running: bool) {
        self.is_running.store(running, Ordering::Release);
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::Acquire)
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::Release);
    }

    pub fn pause_count(&self) -> u32 {
        self.pause_count.load(Ordering::Acquire)
    }

    /// Returns the new pause count
    pub fn inc_pause(&self) -> u32 {
        self.pause_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the new pause count. Unbalanced unpause is a caller bug.
    pub fn dec_pause(&self) -> u32 {
        let prev = self.pause_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "unpause of {} without matching pause", self);
        prev - 1
    }

    pub fn is_migrating(&self) -> bool {
        self.migrating.load(Ordering::Acquire)
    }

    pub fn set_migrating(&self, migrating: bool) {
        self.migrating.store(migrating, Ordering::Release);
    }

    /// Eligible to be queued: not blocked, paused or in migration
    pub fn runnable(&self) -> bool {
        !self.is_blocked() && self.pause_count() == 0 && !self.is_migrating()
    }

    pub fn affinity(&self) -> CpuMask {
        *self.affinity.read()
    }

    pub fn set_affinity(&self, mask: CpuMask) {
        *self.affinity.write() = mask;
    }

    pub fn last_run_time(&self) -> STime {
        self.last_run_time.load(Ordering::Acquire)
    }

    pub fn set_last_run_time(&self, t: STime) {
        self.last_run_time.store(t, Ordering::Release);
    }

    pub fn state_entry_time(&self) -> STime {
        self.state_entry_time.load(Ordering::Acquire)
    }

    pub fn set_state_entry_time(&self, t: STime) {
        self.state_entry_time.store(t, Ordering::Release);
    }
}

impl fmt::Display for Vcpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_idle() {
            write!(f, "[IDLE.{}]", self.vcpu_id)
        } else {
            write!(f, "[{}.{}]", self.domain_id, self.vcpu_id)
        }
    }
}

impl fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vcpu")
            .field("id", &format_args!("{}", self))
            .field("processor", &self.processor())
            .field("running", &self.is_running())
            .field("runnable", &self.runnable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runnable_states() {
        let v = Vcpu::new(1, 0, 0);
        assert!(v.runnable());
        v.set_blocked(true);
        assert!(!v.runnable());
        v.set_blocked(false);
        assert_eq!(v.inc_pause(), 1);
        assert!(!v.runnable());
        assert_eq!(v.dec_pause(), 0);
        v.set_migrating(true);
        assert!(!v.runnable());
    }

    #[test]
    fn test_idle_vcpu() {
        let idle = Vcpu::new_idle(3);
        assert!(idle.is_idle());
        assert_eq!(idle.processor(), 3);
        assert_eq!(idle.affinity(), CpuMask::single(3));
        assert_eq!(idle.to_string(), "[IDLE.3]");
    }

    #[test]
    #[should_panic(expected = "without matching pause")]
    fn test_unbalanced_unpause() {
        Vcpu::new(1, 0, 0).dec_pause();
    }
}
