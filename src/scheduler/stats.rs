//! Scheduler statistics and debugging functions
//!
//! Event counters are plain relaxed atomics bumped on the paths they name.
//! `dump_cpu_state` and `dump_settings` render the scheduler state in the
//! same shape the hypervisor's debug key handler prints.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use serde::Serialize;

use crate::types::CpuId;

use super::types::CREDITS_PER_MSEC;
use super::CreditScheduler;

#[inline]
pub(crate) fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

macro_rules! sched_counters {
    ($($name:ident),* $(,)?) => {
        /// Live event counters
        #[derive(Debug, Default)]
        pub(crate) struct StatCounters {
            $(pub $name: AtomicU64,)*
        }

        /// Point-in-time copy of the event counters
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
        pub struct SchedStats {
            $(pub $name: u64,)*
        }

        impl StatCounters {
            pub fn snapshot(&self) -> SchedStats {
                SchedStats {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

sched_counters! {
    schedule,
    ratelimited,
    acct_run,
    acct_no_work,
    acct_balance,
    acct_reorder,
    acct_min_credit,
    acct_vcpu_active,
    acct_vcpu_idle,
    vcpu_park,
    vcpu_unpark,
    vcpu_sleep,
    vcpu_wake_running,
    vcpu_wake_onrunq,
    vcpu_wake_runnable,
    vcpu_wake_not_runnable,
    tickle_local_idler,
    tickle_local_over,
    tickle_local_under,
    tickle_local_other,
    tickle_idlers_none,
    tickle_idlers_some,
    load_balance_idle,
    load_balance_over,
    load_balance_other,
    steal_trylock_failed,
    steal_peer_idle,
    migrate_queued,
    migrate_running,
    vcpu_hot,
    dom_init,
    dom_destroy,
    vcpu_init,
    vcpu_destroy,
}

// ============================================================================
// Per-vCPU Statistics
// ============================================================================

#[derive(Debug, Default)]
pub(crate) struct VcpuStats {
    pub credit_last: AtomicI32,
    pub credit_incr: AtomicI32,
    pub state_active: AtomicU32,
    pub state_idle: AtomicU32,
    pub migrate_q: AtomicU32,
    pub migrate_r: AtomicU32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VcpuStatsSnapshot {
    /// Credit after the last accounting pass
    pub credit_last: i32,
    /// Per-vCPU share granted by the last accounting pass
    pub credit_incr: i32,
    pub state_active: u32,
    pub state_idle: u32,
    /// Stolen while queued
    pub migrate_q: u32,
    /// Moved while running
    pub migrate_r: u32,
}

impl VcpuStats {
    pub fn snapshot(&self) -> VcpuStatsSnapshot {
        VcpuStatsSnapshot {
            credit_last: self.credit_last.load(Ordering::Relaxed),
            credit_incr: self.credit_incr.load(Ordering::Relaxed),
            state_active: self.state_active.load(Ordering::Relaxed),
            state_idle: self.state_idle.load(Ordering::Relaxed),
            migrate_q: self.migrate_q.load(Ordering::Relaxed),
            migrate_r: self.migrate_r.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Dumps
// ============================================================================

impl CreditScheduler {
    pub fn stats(&self) -> SchedStats {
        self.stats.snapshot()
    }

    /// Run queue, sibling/core maps and current vCPU of one pCPU
    pub fn dump_pcpu(&self, cpu: CpuId) -> String {
        let mut out = String::new();
        let pcpu = match self.pcpu(cpu) {
            Some(pcpu) => pcpu,
            None => {
                let _ = writeln!(out, "CPU[{:02}] not attached", cpu);
                return out;
            }
        };

        let rq = pcpu.runq.lock();
        let _ = writeln!(
            out,
            "CPU[{:02}] sort={}, sibling={}, core={}",
            cpu,
            rq.sort_last,
            self.topology.sibling_mask(cpu),
            self.topology.core_mask(cpu)
        );
        let _ = writeln!(out, "\trun: {}", self.describe_vcpu(&rq.curr));
        for (n, svc) in rq.iter().enumerate() {
            let _ = writeln!(out, "\t{:3}: {}", n + 1, self.describe_vcpu(svc));
        }
        drop(rq);

        log::info!("{}", out.trim_end());
        out
    }

    /// Global totals, tunables and every active vCPU
    pub fn dump(&self) -> String {
        let t = self.tunables();
        let mut out = String::new();

        let prv = self.prv.lock();
        let _ = writeln!(
            out,
            "info:\n\tncpus              = {}\n\tmaster             = {}\n\tcredit             = {}\n\tcredit balance     = {}\n\tweight             = {}\n\trunq_sort          = {}\n\tdefault-weight     = {}\n\ttslice             = {}ms\n\tratelimit          = {}us\n\tcredits per msec   = {}\n\tticks per tslice   = {}\n\tmigration delay    = {}us",
            prv.ncpus,
            prv.master,
            prv.credit,
            prv.credit_balance,
            prv.weight,
            self.runq_sort.load(Ordering::Acquire),
            super::types::DEFAULT_WEIGHT,
            t.tslice_ms,
            t.ratelimit_us,
            CREDITS_PER_MSEC,
            t.ticks_per_tslice,
            t.migration_delay_us
        );
        let _ = writeln!(out, "idlers: {}", self.idlers.load());

        let _ = writeln!(out, "active vcpus:");
        let mut n = 0;
        for dom in prv.active_sdom.iter() {
            if let Some(sdom) = prv.domains.get(dom) {
                for svc in sdom.active_vcpus.iter() {
                    n += 1;
                    let _ = writeln!(out, "\t{:3}: {} [w={}]", n, svc, sdom.weight);
                }
            }
        }
        drop(prv);

        log::info!("{}", out.trim_end());
        out
    }

    fn describe_vcpu(&self, svc: &super::CreditVcpu) -> String {
        match svc.domain() {
            Some(dom) => {
                let weight = self
                    .prv
                    .lock()
                    .domains
                    .get(&dom)
                    .map(|sdom| sdom.weight)
                    .unwrap_or(0);
                format!("{} [w={}]", svc, weight)
            }
            None => svc.to_string(),
        }
    }
}
