//! Per-vCPU scheduler state and vCPU event handling
//!
//! Covers the run-queue side of a vCPU's life: insertion when it is first
//! attached, sleep/wake transitions, yield, and the tickle that asks other
//! pCPUs to reschedule when new work shows up. The framework helpers at the
//! bottom (`vcpu_block`, `vcpu_pause`, ...) model the host's generic layer
//! that filters events on `runnable()` before calling into the scheduler.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicI8, AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cpumask::CpuMask;
use crate::types::{CpuId, DomainId, STime};
use crate::vcpu::Vcpu;

use super::percpu::{CreditPcpu, PcpuRunq};
use super::stats::{inc, VcpuStats};
use super::types::{Priority, VcpuFlags};
use super::CreditScheduler;

const NOT_QUEUED: usize = usize::MAX;

// ============================================================================
// CreditVcpu
// ============================================================================

/// Scheduler-private state of one vCPU
pub struct CreditVcpu {
    vcpu: Arc<Vcpu>,
    /// Owning domain; `None` for idle vCPUs
    sdom: Option<DomainId>,
    credit: AtomicI32,
    pri: AtomicI8,
    flags: AtomicU16,
    /// Dispatch time used by the credit burn
    start_time: AtomicI64,
    /// On its domain's active list
    active: AtomicBool,
    /// Slot in the run queue of `vcpu.processor()`
    runq_slot: AtomicUsize,
    pub(crate) stats: VcpuStats,
}

impl CreditVcpu {
    pub(crate) fn new(vcpu: Arc<Vcpu>) -> Self {
        let idle = vcpu.is_idle();
        Self {
            sdom: if idle { None } else { Some(vcpu.domain_id()) },
            credit: AtomicI32::new(0),
            pri: AtomicI8::new(if idle { Priority::Idle } else { Priority::Under }.as_raw()),
            flags: AtomicU16::new(0),
            start_time: AtomicI64::new(0),
            active: AtomicBool::new(false),
            runq_slot: AtomicUsize::new(NOT_QUEUED),
            stats: VcpuStats::default(),
            vcpu,
        }
    }

    pub fn vcpu(&self) -> &Arc<Vcpu> {
        &self.vcpu
    }

    pub fn domain(&self) -> Option<DomainId> {
        self.sdom
    }

    pub fn is_idle(&self) -> bool {
        self.sdom.is_none()
    }

    pub fn credit(&self) -> i32 {
        self.credit.load(Ordering::Acquire)
    }

    pub(crate) fn set_credit(&self, credit: i32) {
        self.credit.store(credit, Ordering::Release);
    }

    /// Returns the new balance
    pub(crate) fn add_credit(&self, delta: i32) -> i32 {
        self.credit.fetch_add(delta, Ordering::AcqRel) + delta
    }

    pub fn priority(&self) -> Priority {
        Priority::from_raw(self.pri.load(Ordering::Acquire))
    }

    pub(crate) fn set_priority(&self, pri: Priority) {
        self.pri.store(pri.as_raw(), Ordering::Release);
    }

    pub fn flags(&self) -> VcpuFlags {
        VcpuFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn is_parked(&self) -> bool {
        self.flags().contains(VcpuFlags::PARKED)
    }

    pub(crate) fn set_flags(&self, flags: VcpuFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn clear_flags(&self, flags: VcpuFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn start_time(&self) -> STime {
        self.start_time.load(Ordering::Acquire)
    }

    pub(crate) fn set_start_time(&self, t: STime) {
        self.start_time.store(t, Ordering::Release);
    }

    pub(crate) fn add_start_time(&self, delta: STime) {
        self.start_time.fetch_add(delta, Ordering::AcqRel);
    }

    /// Credits are tracked by the accounting engine
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn on_runq(&self) -> bool {
        self.runq_slot.load(Ordering::Acquire) != NOT_QUEUED
    }

    pub(crate) fn runq_slot(&self) -> Option<usize> {
        match self.runq_slot.load(Ordering::Acquire) {
            NOT_QUEUED => None,
            slot => Some(slot),
        }
    }

    pub(crate) fn set_runq_slot(&self, slot: Option<usize>) {
        self.runq_slot.store(slot.unwrap_or(NOT_QUEUED), Ordering::Release);
    }

    pub fn stats(&self) -> super::stats::VcpuStatsSnapshot {
        self.stats.snapshot()
    }
}

impl fmt::Display for CreditVcpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} pri={} flags={:x} cpu={}",
            self.vcpu,
            self.priority(),
            self.flags().bits(),
            self.vcpu.processor()
        )?;
        if !self.is_idle() {
            write!(f, " credit={}", self.credit())?;
        }
        Ok(())
    }
}

impl fmt::Debug for CreditVcpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CreditVcpu({})", self)
    }
}

// ============================================================================
// Scheduler hooks
// ============================================================================

impl CreditScheduler {
    /// Run `f` with the run queue lock of the pCPU `svc` currently belongs
    /// to. Retries if the vCPU moves while the lock is being taken.
    ///
    /// A vCPU left behind on a detached pCPU (it was blocked or paused when
    /// the pCPU went away) is first moved to an online one.
    pub(crate) fn with_vcpu_runq<R, F>(&self, svc: &CreditVcpu, f: F) -> R
    where
        F: FnOnce(&Arc<CreditPcpu>, &mut PcpuRunq) -> R,
    {
        loop {
            let cpu = svc.vcpu().processor();
            let pcpu = match self.pcpu(cpu) {
                Some(pcpu) => pcpu,
                None => {
                    self.rehome_detached(svc, cpu);
                    continue;
                }
            };
            let mut rq = pcpu.runq.lock();
            if svc.vcpu().processor() == cpu {
                return f(&pcpu, &mut rq);
            }
        }
    }

    /// Point `svc` at an online pCPU after `gone` was detached. Affinity is
    /// broken if none of the allowed pCPUs is online.
    fn rehome_detached(&self, svc: &CreditVcpu, gone: CpuId) {
        let online = self.online.load();
        let mut target = self.cpu_pick(svc, false);
        if !online.is_set(target) {
            target = match online.cycle(gone) {
                Some(cpu) => cpu,
                None => panic!("{} belongs to detached pcpu {} and no pcpu is online", svc.vcpu(), gone),
            };
            log::warn!(
                "credit: breaking affinity {} of {}, moving to cpu {}",
                svc.vcpu().affinity(),
                svc.vcpu(),
                target
            );
        }
        log::debug!("credit: {} rehomed from detached cpu {} to {}", svc.vcpu(), gone, target);
        svc.vcpu().set_processor(target);
    }

    pub(crate) fn vcpu_insert(&self, svc: &Arc<CreditVcpu>) {
        self.with_vcpu_runq(svc, |_, rq| {
            if !svc.on_runq() && svc.vcpu().runnable() && !svc.vcpu().is_running() {
                rq.insert(svc);
            }
        });
    }

    pub(crate) fn vcpu_remove(&self, svc: &Arc<CreditVcpu>) {
        assert!(!svc.is_idle(), "removing idle vcpu {}", svc.vcpu());
        inc(&self.stats.vcpu_destroy);

        self.with_vcpu_runq(svc, |_, rq| {
            if svc.on_runq() {
                rq.remove(svc);
            }
        });

        let mut prv = self.prv.lock();
        if svc.is_active() {
            self.acct_stop_locked(&mut prv, svc);
        }
        drop(prv);

        assert!(!svc.on_runq(), "{} still queued after remove", svc.vcpu());
    }

    pub(crate) fn vcpu_sleep_locked(&self, rq: &mut PcpuRunq, svc: &CreditVcpu) {
        assert!(!svc.is_idle(), "sleep on idle vcpu {}", svc.vcpu());
        inc(&self.stats.vcpu_sleep);

        if rq.is_curr(svc) {
            self.host.raise_schedule_softirq(&CpuMask::single(rq.cpu()));
        } else if svc.on_runq() {
            rq.remove(svc);
        }
    }

    pub(crate) fn vcpu_wake_locked(&self, pcpu: &CreditPcpu, rq: &mut PcpuRunq, svc: &Arc<CreditVcpu>) {
        assert!(!svc.is_idle(), "wake on idle vcpu {}", svc.vcpu());

        if rq.is_curr(svc) {
            inc(&self.stats.vcpu_wake_running);
            return;
        }
        if svc.on_runq() {
            inc(&self.stats.vcpu_wake_onrunq);
            return;
        }
        if svc.vcpu().runnable() {
            inc(&self.stats.vcpu_wake_runnable);
        } else {
            inc(&self.stats.vcpu_wake_not_runnable);
        }

        // Waking with credit left gets a temporary boost for wake-to-run
        // latency. A vCPU coming back from a cap park does not.
        if svc.priority() == Priority::Under && !svc.is_parked() {
            svc.set_priority(Priority::Boost);
        }

        rq.insert(svc);
        self.runq_tickle(pcpu, rq, svc);
    }

    pub(crate) fn vcpu_yield(&self, svc: &CreditVcpu) {
        if !self.tunables().default_yield {
            svc.set_flags(VcpuFlags::YIELD);
        }
    }

    /// Signal the pCPUs that should reschedule now that `new` is queued on
    /// `pcpu`.
    pub(crate) fn runq_tickle(&self, pcpu: &CreditPcpu, rq: &PcpuRunq, new: &CreditVcpu) {
        let cur = &rq.curr;
        let mut mask = CpuMask::empty();

        if new.priority() > cur.priority() {
            match cur.priority() {
                Priority::Idle => inc(&self.stats.tickle_local_idler),
                Priority::Over => inc(&self.stats.tickle_local_over),
                Priority::Under => inc(&self.stats.tickle_local_under),
                Priority::Boost => inc(&self.stats.tickle_local_other),
            }
            mask.set(pcpu.cpu());
        }

        // The target is busy, so there are at least two runnable vCPUs here;
        // let idlers know there is work they could steal.
        if cur.priority() > Priority::Idle {
            let idlers = self.idlers.load();
            if idlers.is_empty() {
                inc(&self.stats.tickle_idlers_none);
            } else {
                let affinity = new.vcpu().affinity();
                let idle_mask = idlers.and(&affinity);
                if !idle_mask.is_empty() {
                    inc(&self.stats.tickle_idlers_some);
                    if self.tunables().tickle_one_idle {
                        let last = pcpu.last_tickle_cpu();
                        if let Some(next) = idle_mask.cycle(last) {
                            pcpu.set_last_tickle_cpu(next);
                            mask.set(next);
                        }
                    } else {
                        mask = mask.or(&idle_mask);
                    }
                }
                mask = mask.and(&affinity);
            }
        }

        if !mask.is_empty() {
            log::trace!("tickle {} for {}", mask, new);
            self.host.raise_schedule_softirq(&mask);
        }
    }

    // ========================================================================
    // Framework layer
    // ========================================================================

    /// Deschedule `svc` if it is no longer runnable.
    pub fn vcpu_sleep_nosync(&self, svc: &Arc<CreditVcpu>) {
        self.with_vcpu_runq(svc, |_, rq| {
            if !svc.vcpu().runnable() {
                self.vcpu_sleep_locked(rq, svc);
            }
        });
    }

    /// Queue `svc` if it became runnable.
    pub fn vcpu_wake(&self, svc: &Arc<CreditVcpu>) {
        self.with_vcpu_runq(svc, |pcpu, rq| {
            if svc.vcpu().runnable() {
                self.vcpu_wake_locked(pcpu, rq, svc);
            }
        });
    }

    /// The guest blocked (e.g. halted waiting for an event)
    pub fn vcpu_block(&self, svc: &Arc<CreditVcpu>) {
        svc.vcpu().set_blocked(true);
        self.vcpu_sleep_nosync(svc);
    }

    /// An event arrived for a blocked vCPU
    pub fn vcpu_unblock(&self, svc: &Arc<CreditVcpu>) {
        svc.vcpu().set_blocked(false);
        self.vcpu_wake(svc);
    }

    pub fn vcpu_pause(&self, svc: &Arc<CreditVcpu>) {
        svc.vcpu().inc_pause();
        self.vcpu_sleep_nosync(svc);
    }

    pub fn vcpu_unpause(&self, svc: &Arc<CreditVcpu>) {
        if svc.vcpu().dec_pause() == 0 {
            self.vcpu_wake(svc);
        }
    }

    /// Hypercall-style yield: flag the vCPU and reschedule its pCPU.
    pub fn vcpu_yield_now(&self, svc: &Arc<CreditVcpu>) {
        self.vcpu_yield(svc);
        self.host
            .raise_schedule_softirq(&CpuMask::single(svc.vcpu().processor()));
    }

    /// Change the hard affinity and move the vCPU if its pCPU is no longer
    /// allowed.
    pub fn vcpu_set_affinity(&self, svc: &Arc<CreditVcpu>, affinity: CpuMask) -> crate::SchedResult<()> {
        if !affinity.intersects(&self.online.load()) {
            return Err(crate::SchedError::InvalidArgument(format!(
                "affinity {} has no online cpu",
                affinity
            )));
        }
        svc.vcpu().set_affinity(affinity);
        if affinity.is_set(svc.vcpu().processor()) {
            return Ok(());
        }
        svc.vcpu().set_migrating(true);
        self.vcpu_sleep_nosync(svc);
        self.vcpu_migrate(svc);
        Ok(())
    }

    /// Move a vCPU flagged as migrating to the pCPU placement picks for it.
    /// Does nothing while it is still running; the context switch that
    /// takes it off its pCPU calls back in here.
    pub(crate) fn vcpu_migrate(&self, svc: &Arc<CreditVcpu>) {
        let new_cpu = self.cpu_pick(svc, true);
        let moved = self.with_vcpu_runq(svc, |_, rq| {
            if svc.vcpu().is_running() || rq.is_curr(svc) || !svc.vcpu().is_migrating() {
                return None;
            }
            let old_cpu = svc.vcpu().processor();
            svc.vcpu().set_processor(new_cpu);
            svc.vcpu().set_migrating(false);
            Some(old_cpu)
        });

        if let Some(old_cpu) = moved {
            if old_cpu != new_cpu {
                log::debug!("{} migrated cpu {} -> {}", svc.vcpu(), old_cpu, new_cpu);
            }
            self.vcpu_wake(svc);
        }
    }

    pub(crate) fn current_on(&self, cpu: CpuId) -> Option<Arc<CreditVcpu>> {
        self.pcpu(cpu).map(|pcpu| pcpu.runq.lock().curr.clone())
    }
}
