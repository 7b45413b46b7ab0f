//! Scheduling decision
//!
//! `do_schedule` runs on a pCPU whenever its schedule softirq fires or its
//! slice expires. It charges the outgoing vCPU, applies rate limiting,
//! picks the next vCPU (stealing from peers when nothing local is worth
//! running), and performs the framework-side context switch bookkeeping.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::ops::TaskSlice;
use crate::types::{microsecs, CpuId, STime};

use super::accounting::burn_credits;
use super::percpu::{CreditPcpu, PcpuRunq};
use super::stats::inc;
use super::types::{Priority, VcpuFlags};
use super::vcpu::CreditVcpu;
use super::CreditScheduler;

impl CreditScheduler {
    /// Decide what `cpu` runs next and switch to it.
    ///
    /// # Panics
    ///
    /// If `cpu` is not attached to the scheduler.
    pub fn schedule(&self, cpu: CpuId, now: STime, tasklet_work_scheduled: bool) -> TaskSlice<Arc<CreditVcpu>> {
        let pcpu = match self.pcpu(cpu) {
            Some(pcpu) => pcpu,
            None => panic!("schedule on detached cpu {}", cpu),
        };

        let (ret, prev) = {
            let mut rq = pcpu.runq.lock();
            let ret = self.do_schedule_locked(&pcpu, &mut rq, now, tasklet_work_scheduled);
            let prev = context_switch(&mut rq, &ret.task, now);
            (ret, prev)
        };

        // A vCPU flagged for migration while running moves once it is off
        // its pCPU.
        if let Some(prev) = prev {
            if prev.vcpu().is_migrating() {
                self.vcpu_migrate(&prev);
            }
        }

        ret
    }

    fn do_schedule_locked(
        &self,
        pcpu: &CreditPcpu,
        rq: &mut PcpuRunq,
        now: STime,
        tasklet_work_scheduled: bool,
    ) -> TaskSlice<Arc<CreditVcpu>> {
        let cpu = pcpu.cpu();
        let scurr = rq.curr.clone();
        let t = self.tunables();

        inc(&self.stats.schedule);

        let runtime = (now - scurr.vcpu().state_entry_time()).max(0);

        if !scurr.is_idle() {
            burn_credits(&scurr, now);
            // Keep only the unburned remainder while off-CPU
            scurr.add_start_time(-now);
        } else {
            // Undo a tasklet boost
            scurr.set_priority(Priority::Idle);
        }

        // Keep a runnable vCPU that has not yet run for the rate limit
        let ratelimit = microsecs(u64::from(t.ratelimit_us));
        if !tasklet_work_scheduled
            && t.ratelimit_us != 0
            && scurr.vcpu().runnable()
            && !scurr.is_idle()
            && runtime < ratelimit
        {
            scurr.add_start_time(now);
            inc(&self.stats.ratelimited);
            log::trace!("cpu {}: ratelimit keeps {}", cpu, scurr);
            return TaskSlice {
                task: scurr,
                time: Some(ratelimit),
                migrated: false,
            };
        }

        if scurr.vcpu().runnable() {
            rq.insert(&scurr);
        } else {
            assert!(
                !scurr.is_idle() && !rq.is_empty(),
                "cpu {}: idle vcpu not runnable or empty run queue",
                cpu
            );
        }

        let mut snext = match rq.front() {
            Some(front) => front.clone(),
            None => panic!("cpu {}: run queue empty after requeue", cpu),
        };
        let mut migrated = false;

        // Tasklet work runs in idle context and overrides everything
        if tasklet_work_scheduled {
            snext = pcpu.idle().clone();
            snext.set_priority(Priority::Boost);
        }

        scurr.clear_flags(VcpuFlags::YIELD);

        // Nothing urgent locally: look for better work on busy peers
        if snext.priority() > Priority::Over {
            rq.remove(&snext);
        } else {
            let (next, stolen) = self.load_balance(pcpu, rq, &snext, now);
            snext = next;
            migrated = stolen;
        }

        if snext.priority() == Priority::Idle {
            self.idlers.set(cpu);
        } else {
            self.idlers.clear(cpu);
        }

        if !snext.is_idle() {
            snext.add_start_time(now);
        }

        log::trace!("cpu {}: next {}{}", cpu, snext, if migrated { " (stolen)" } else { "" });

        let time = if snext.is_idle() { None } else { Some(t.tslice()) };
        TaskSlice {
            task: snext,
            time,
            migrated,
        }
    }

    /// vCPU currently running on `cpu`
    pub fn current(&self, cpu: CpuId) -> Option<Arc<CreditVcpu>> {
        self.current_on(cpu)
    }

    /// Index of the last global sort request
    pub fn sort_epoch(&self) -> u32 {
        self.runq_sort.load(Ordering::Acquire)
    }
}

/// Make `next` current on the pCPU owning `rq`. Returns the previous vCPU
/// if it changed.
fn context_switch(rq: &mut PcpuRunq, next: &Arc<CreditVcpu>, now: STime) -> Option<Arc<CreditVcpu>> {
    if rq.is_curr(next) {
        return None;
    }

    let prev = std::mem::replace(&mut rq.curr, next.clone());
    prev.vcpu().set_running(false);
    prev.vcpu().set_last_run_time(now);
    prev.vcpu().set_state_entry_time(now);

    next.vcpu().set_processor(rq.cpu());
    next.vcpu().set_running(true);
    next.vcpu().set_state_entry_time(now);

    Some(prev)
}
