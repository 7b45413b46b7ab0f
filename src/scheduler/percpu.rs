//! Per-pCPU scheduler state and run queues
//!
//! Each pCPU owns a priority-ordered run queue, the vCPU it is currently
//! running, its idle vCPU and a tick timer.
//!
//! ## Lock Hierarchy
//!
//! 1. Per-pCPU run queue lock (local first; peers only via `try_lock`)
//! 2. Global scheduler lock (`CreditScheduler::prv`)
//! 3. Tunables and timer locks (leaf locks)
//!
//! The global lock is never held while acquiring a run queue lock.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::SchedResult;
use crate::timer::Timer;
use crate::types::{CpuId, STime};

use super::runq::{RunQueue, HEAD};
use super::stats::inc;
use super::types::{Priority, VcpuFlags};
use super::vcpu::CreditVcpu;
use super::CreditScheduler;

/// Initial run queue slab size
const RUNQ_INITIAL_SLOTS: usize = 16;

// ============================================================================
// Run Queue
// ============================================================================

/// State protected by the pCPU's run queue lock
pub struct PcpuRunq {
    cpu: CpuId,
    queue: RunQueue<Arc<CreditVcpu>>,
    /// vCPU currently dispatched on this pCPU
    pub(crate) curr: Arc<CreditVcpu>,
    /// Global sort epoch this queue was last sorted for
    pub(crate) sort_last: u32,
}

impl PcpuRunq {
    fn new(cpu: CpuId, idle: Arc<CreditVcpu>, sort_epoch: u32) -> SchedResult<Self> {
        Ok(Self {
            cpu,
            queue: RunQueue::try_with_capacity(RUNQ_INITIAL_SLOTS)?,
            curr: idle,
            sort_last: sort_epoch,
        })
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn is_curr(&self, svc: &CreditVcpu) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.curr), svc)
    }

    pub(crate) fn front(&self) -> Option<&Arc<CreditVcpu>> {
        self.queue.front()
    }

    /// Queue `svc` behind every entry of equal or higher priority. A
    /// yielding vCPU additionally gives up its place to the first
    /// lower-priority entry, unless that entry is the idle vCPU.
    pub(crate) fn insert(&mut self, svc: &Arc<CreditVcpu>) {
        assert!(!svc.on_runq(), "{} inserted while already queued", svc.vcpu());
        assert_eq!(
            svc.vcpu().processor(),
            self.cpu,
            "{} inserted on a foreign run queue",
            svc.vcpu()
        );

        let pri = svc.priority();
        let mut pos = self.queue.first_slot();
        while let Some(entry) = self.queue.get(pos) {
            if pri > entry.priority() {
                break;
            }
            pos = self.queue.next_slot(pos);
        }

        if svc.flags().contains(VcpuFlags::YIELD) {
            if let Some(entry) = self.queue.get(pos) {
                if entry.priority() > Priority::Idle {
                    pos = self.queue.next_slot(pos);
                }
            }
        }

        let slot = self.queue.insert_before(pos, svc.clone());
        svc.set_runq_slot(Some(slot));
    }

    /// Unlink `svc`, which must be queued here.
    pub(crate) fn remove(&mut self, svc: &CreditVcpu) -> Arc<CreditVcpu> {
        let slot = match svc.runq_slot() {
            Some(slot) => slot,
            None => panic!("{} removed while not queued", svc.vcpu()),
        };
        let removed = self.queue.remove(slot);
        assert!(
            std::ptr::eq(Arc::as_ptr(&removed), svc),
            "run queue slot {} of cpu {} held {} instead of {}",
            slot,
            self.cpu,
            removed.vcpu(),
            svc.vcpu()
        );
        svc.set_runq_slot(None);
        removed
    }

    /// Move UNDER and BOOST entries ahead of OVER ones, once per epoch.
    /// Returns false if the queue was already sorted for `epoch`.
    pub(crate) fn sort(&mut self, epoch: u32) -> bool {
        if self.sort_last == epoch {
            return false;
        }
        self.sort_last = epoch;
        self.queue
            .partition_front(|svc| svc.priority() >= Priority::Under);
        true
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<CreditVcpu>> {
        self.queue.iter().map(|(_, svc)| svc)
    }

    /// Slot-level walk used by work stealing
    pub(crate) fn first_slot(&self) -> usize {
        self.queue.first_slot()
    }

    pub(crate) fn next_slot(&self, slot: usize) -> usize {
        self.queue.next_slot(slot)
    }

    pub(crate) fn get(&self, slot: usize) -> Option<&Arc<CreditVcpu>> {
        if slot == HEAD {
            None
        } else {
            self.queue.get(slot)
        }
    }
}

// ============================================================================
// Per-pCPU Data
// ============================================================================

pub struct CreditPcpu {
    cpu: CpuId,
    pub(crate) runq: Mutex<PcpuRunq>,
    idle: Arc<CreditVcpu>,
    pub(crate) ticker: Timer,
    tick: AtomicU64,
    /// Rotating start point for the idle search among this pCPU's siblings
    idle_bias: AtomicUsize,
    last_tickle_cpu: AtomicUsize,
}

impl CreditPcpu {
    pub(crate) fn new(cpu: CpuId, idle: Arc<CreditVcpu>, idle_bias: CpuId, sort_epoch: u32) -> SchedResult<Self> {
        Ok(Self {
            cpu,
            runq: Mutex::new(PcpuRunq::new(cpu, idle.clone(), sort_epoch)?),
            idle,
            ticker: Timer::new(cpu),
            tick: AtomicU64::new(0),
            idle_bias: AtomicUsize::new(idle_bias),
            last_tickle_cpu: AtomicUsize::new(cpu),
        })
    }

    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn idle(&self) -> &Arc<CreditVcpu> {
        &self.idle
    }

    pub fn tick_count(&self) -> u64 {
        self.tick.load(Ordering::Relaxed)
    }

    pub(crate) fn idle_bias(&self) -> CpuId {
        self.idle_bias.load(Ordering::Relaxed)
    }

    pub(crate) fn set_idle_bias(&self, cpu: CpuId) {
        self.idle_bias.store(cpu, Ordering::Relaxed);
    }

    pub(crate) fn last_tickle_cpu(&self) -> CpuId {
        self.last_tickle_cpu.load(Ordering::Relaxed)
    }

    pub(crate) fn set_last_tickle_cpu(&self, cpu: CpuId) {
        self.last_tickle_cpu.store(cpu, Ordering::Relaxed);
    }
}

// ============================================================================
// Tick
// ============================================================================

impl CreditScheduler {
    /// Per-pCPU tick handler: account the running vCPU, resort the queue if
    /// the accounting master asked for it, and re-arm.
    pub(crate) fn tick(&self, pcpu: &CreditPcpu, now: STime) {
        pcpu.tick.fetch_add(1, Ordering::Relaxed);

        let curr = pcpu.runq.lock().curr.clone();
        if !curr.is_idle() {
            self.vcpu_acct(pcpu, &curr, now);
        }

        self.runq_sort(pcpu);

        pcpu.ticker
            .set(now + crate::types::microsecs(u64::from(self.tunables().tick_period_us)));
    }

    /// Resort `pcpu`'s queue if the global epoch moved since last time.
    pub(crate) fn runq_sort(&self, pcpu: &CreditPcpu) -> bool {
        let epoch = self.runq_sort.load(Ordering::Acquire);
        pcpu.runq.lock().sort(epoch)
    }

    /// Account a vCPU seen running at tick time.
    fn vcpu_acct(&self, pcpu: &CreditPcpu, svc: &Arc<CreditVcpu>, now: STime) {
        assert!(svc.domain().is_some(), "accounting idle vcpu {}", svc.vcpu());

        // Consuming real CPU time ends the wake-up boost
        if svc.priority() == Priority::Boost {
            svc.set_priority(Priority::Under);
        }

        // Only the current vCPU burns; it may have been switched out since
        // the tick read it.
        let still_current = {
            let rq = pcpu.runq.lock();
            if rq.is_curr(svc) {
                super::accounting::burn_credits(svc, now);
                true
            } else {
                false
            }
        };
        if !still_current {
            return;
        }

        if !svc.is_active() {
            self.acct_start(svc);
        } else if self.cpu_pick(svc, false) != pcpu.cpu() {
            svc.stats.migrate_r.fetch_add(1, Ordering::Relaxed);
            inc(&self.stats.migrate_running);
            svc.vcpu().set_migrating(true);
            self.host
                .raise_schedule_softirq(&crate::cpumask::CpuMask::single(pcpu.cpu()));
        }
    }
}
