//! SMP placement and work stealing
//!
//! `cpu_pick` chooses where a vCPU should run, preferring idle execution
//! units with the most idle neighbours so that work spreads across sockets
//! and cores before it doubles up on hyperthreads. `load_balance` lets a
//! pCPU with nothing urgent pull queued work from busy peers, using only
//! non-blocking lock attempts on their run queues.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::cpumask::CpuMask;
use crate::types::{microsecs, CpuId, STime};

use super::percpu::{CreditPcpu, PcpuRunq};
use super::stats::inc;
use super::types::Priority;
use super::vcpu::CreditVcpu;
use super::CreditScheduler;

impl CreditScheduler {
    /// Best pCPU for `svc`. With `commit`, the chosen core's idle bias is
    /// updated so the next search starts elsewhere.
    pub(crate) fn cpu_pick(&self, svc: &CreditVcpu, commit: bool) -> CpuId {
        let vc = svc.vcpu();
        let online = self.online.load();
        let mut cpus = online.and(&vc.affinity());

        let processor = vc.processor();
        let mut cpu = if cpus.is_set(processor) {
            processor
        } else {
            match cpus.cycle(processor) {
                Some(cpu) => cpu,
                // No online pCPU in the affinity; stay put
                None => return processor,
            }
        };

        let mut idlers = online.and(&self.idlers.load());
        idlers.set(cpu);
        cpus = cpus.and(&idlers);
        cpus.clear(cpu);

        let smt_power_savings = self.tunables().smt_power_savings;
        let mut bias_owner: Option<Arc<CreditPcpu>> = None;

        while let Some(nxt) = cpus.cycle(cpu) {
            let (migrate_factor, cpu_idlers, nxt_idlers) = if self.topology.core_mask(nxt).is_set(cpu) {
                // Same socket: compare idle threads of the two cores
                (
                    1,
                    idlers.and(&self.topology.sibling_mask(cpu)),
                    idlers.and(&self.topology.sibling_mask(nxt)),
                )
            } else {
                // Different sockets: the other one must be twice as idle
                (
                    2,
                    idlers.and(&self.topology.core_mask(cpu)),
                    idlers.and(&self.topology.core_mask(nxt)),
                )
            };

            let weight_cpu = cpu_idlers.count();
            let weight_nxt = nxt_idlers.count();
            let move_there = if smt_power_savings {
                weight_cpu > weight_nxt
            } else {
                weight_cpu * migrate_factor < weight_nxt
            };

            if move_there {
                let candidates = cpus.and(&nxt_idlers);
                let spc = self.pcpu(nxt);
                let bias = spc.as_ref().map_or(nxt, |p| p.idle_bias());
                cpu = candidates.cycle(bias).unwrap_or(nxt);
                cpus = cpus.andnot(&self.topology.sibling_mask(cpu));
                bias_owner = spc;
            } else {
                cpus = cpus.andnot(&nxt_idlers);
            }
        }

        if commit {
            if let Some(spc) = bias_owner {
                spc.set_idle_bias(cpu);
            }
        }

        cpu
    }

    /// Ran on another pCPU too recently to be worth moving
    fn vcpu_is_cache_hot(&self, svc: &CreditVcpu, now: STime) -> bool {
        let delay = microsecs(u64::from(self.tunables().migration_delay_us));
        let hot = now - svc.vcpu().last_run_time() < delay;
        if hot {
            inc(&self.stats.vcpu_hot);
        }
        hot
    }

    fn vcpu_is_migrateable(&self, svc: &CreditVcpu, dest_cpu: CpuId, now: STime) -> bool {
        !svc.vcpu().is_running()
            && !self.vcpu_is_cache_hot(svc, now)
            && svc.vcpu().affinity().is_set(dest_cpu)
    }

    /// Take the first queued vCPU on `peer` that beats `pri` and may run on
    /// `cpu`. Caller holds both run queue locks.
    fn runq_steal(&self, peer: &mut PcpuRunq, cpu: CpuId, pri: Priority, now: STime) -> Option<Arc<CreditVcpu>> {
        // An idle peer is about to pick its own work
        if !peer.curr.is_idle() {
            let mut slot = peer.first_slot();
            while let Some(speer) = peer.get(slot) {
                // Queue is priority ordered; nothing further can beat `pri`
                if speer.priority() <= pri {
                    break;
                }
                assert!(!speer.is_idle(), "idle vcpu above {:?} on cpu {}", pri, peer.cpu());

                if self.vcpu_is_migrateable(speer, cpu, now) {
                    let speer = speer.clone();
                    speer.stats.migrate_q.fetch_add(1, Ordering::Relaxed);
                    inc(&self.stats.migrate_queued);
                    peer.remove(&speer);
                    speer.vcpu().set_processor(cpu);
                    log::debug!("cpu {}: stole {} from cpu {}", cpu, speer, peer.cpu());
                    return Some(speer);
                }
                slot = peer.next_slot(slot);
            }
        }

        inc(&self.stats.steal_peer_idle);
        None
    }

    /// Look for more urgent work than `snext` on busy peers. Returns the
    /// vCPU to run, already unlinked from its queue, and whether it came
    /// from another pCPU.
    pub(crate) fn load_balance(
        &self,
        pcpu: &CreditPcpu,
        rq: &mut PcpuRunq,
        snext: &Arc<CreditVcpu>,
        now: STime,
    ) -> (Arc<CreditVcpu>, bool) {
        let cpu = pcpu.cpu();
        assert_eq!(snext.vcpu().processor(), cpu, "load balancing a foreign vcpu");

        let online = self.online.load();

        // A pCPU on its way out does not take on work
        if online.is_set(cpu) {
            match snext.priority() {
                Priority::Idle => inc(&self.stats.load_balance_idle),
                Priority::Over => inc(&self.stats.load_balance_over),
                _ => inc(&self.stats.load_balance_other),
            }

            let mut workers = online.andnot(&self.idlers.load());
            workers.clear(cpu);
            let mut peer_cpu = cpu;

            while let Some(next) = workers.cycle(peer_cpu) {
                peer_cpu = next;
                workers.clear(peer_cpu);

                let peer = match self.pcpu(peer_cpu) {
                    Some(peer) => peer,
                    None => continue,
                };

                // Never spin here: the peer may be balancing towards us.
                let mut peer_rq = match peer.runq.try_lock() {
                    Some(guard) => guard,
                    None => {
                        inc(&self.stats.steal_trylock_failed);
                        continue;
                    }
                };

                let stolen = if self.online.is_set(peer_cpu) {
                    self.runq_steal(&mut peer_rq, cpu, snext.priority(), now)
                } else {
                    None
                };
                drop(peer_rq);

                if let Some(speer) = stolen {
                    return (speer, true);
                }
            }
        }

        rq.remove(snext);
        (snext.clone(), false)
    }
}
