//! Credit accounting
//!
//! `burn_credits` charges the running vCPU for elapsed time. Once per
//! timeslice the accounting master runs [`CreditScheduler::acct`], which
//! shares the credit pool among active domains by weight, applies caps, and
//! recomputes every active vCPU's priority.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::types::{STime, NSEC_PER_MSEC};

use super::stats::inc;
use super::table::{CreditPrivate, Tunables};
use super::types::{Priority, VcpuFlags, CREDITS_PER_MSEC};
use super::vcpu::CreditVcpu;
use super::CreditScheduler;

/// Charge `svc` for the time since its start time, rounding to the nearest
/// credit. The start time only advances by what was charged, so the
/// remainder carries over to the next burn.
pub(crate) fn burn_credits(svc: &CreditVcpu, now: STime) {
    let delta = now - svc.start_time();
    if delta <= 0 {
        return;
    }
    let credits = (delta * CREDITS_PER_MSEC + NSEC_PER_MSEC / 2) / NSEC_PER_MSEC;
    svc.add_credit(-(credits as i32));
    svc.add_start_time(credits * NSEC_PER_MSEC / CREDITS_PER_MSEC);
}

/// vCPUs whose pause state must change once the global lock is dropped
#[derive(Default)]
struct ParkChanges {
    park: Vec<Arc<CreditVcpu>>,
    unpark: Vec<Arc<CreditVcpu>>,
}

impl CreditScheduler {
    /// Put `svc` (and its domain) on the active lists.
    pub(crate) fn acct_start(&self, svc: &Arc<CreditVcpu>) {
        let dom = match svc.domain() {
            Some(dom) => dom,
            None => return,
        };
        let mut prv = self.prv.lock();
        if svc.is_active() {
            return;
        }
        let prv = &mut *prv;
        let sdom = match prv.domains.get_mut(&dom) {
            Some(sdom) => sdom,
            None => panic!("{} belongs to unknown domain {}", svc.vcpu(), dom),
        };

        svc.stats.state_active.fetch_add(1, Ordering::Relaxed);
        inc(&self.stats.acct_vcpu_active);

        let was_idle = sdom.active_vcpus.is_empty();
        sdom.active_vcpus.push(svc.clone());
        svc.set_active(true);
        prv.weight += sdom.weight;
        // Newly active domains go to the head, ahead of domains that may
        // hold leftover credit from the last period.
        if was_idle {
            prv.active_sdom.push_front(dom);
        }
    }

    /// Take `svc` off the active lists. Caller holds the global lock.
    pub(crate) fn acct_stop_locked(&self, prv: &mut CreditPrivate, svc: &CreditVcpu) {
        assert!(svc.is_active(), "{} is not active", svc.vcpu());
        let dom = match svc.domain() {
            Some(dom) => dom,
            None => panic!("idle vcpu {} on an active list", svc.vcpu()),
        };
        let sdom = match prv.domains.get_mut(&dom) {
            Some(sdom) => sdom,
            None => panic!("{} belongs to unknown domain {}", svc.vcpu(), dom),
        };

        svc.stats.state_idle.fetch_add(1, Ordering::Relaxed);
        inc(&self.stats.acct_vcpu_idle);

        assert!(
            prv.weight >= sdom.weight,
            "total weight {} below domain {} weight {}",
            prv.weight,
            dom,
            sdom.weight
        );
        let pos = sdom
            .active_vcpus
            .iter()
            .position(|v| std::ptr::eq(Arc::as_ptr(v), svc));
        match pos {
            Some(pos) => {
                sdom.active_vcpus.remove(pos);
            }
            None => panic!("{} flagged active but not on domain {} list", svc.vcpu(), dom),
        }
        svc.set_active(false);
        prv.weight -= sdom.weight;
        if sdom.active_vcpus.is_empty() {
            prv.active_sdom.retain(|d| *d != dom);
        }
    }

    /// Master accounting timer handler.
    pub fn acct(&self, now: STime) {
        let t = self.tunables();
        let changes = {
            let mut prv = self.prv.lock();
            self.acct_locked(&mut prv, &t)
        };

        if let Some(changes) = changes {
            // Every pCPU resorts its queue on its next tick
            self.runq_sort.fetch_add(1, Ordering::AcqRel);
            self.apply_park_changes(changes);
        }

        self.master_ticker.set(now + t.tslice());
    }

    /// One accounting pass. Returns `None` when no domain is active.
    fn acct_locked(&self, prv: &mut CreditPrivate, t: &Tunables) -> Option<ParkChanges> {
        let cpt = i64::from(t.credits_per_tslice);
        let mut changes = ParkChanges::default();

        let weight_total = i64::from(prv.weight);
        let mut credit_total = i64::from(prv.credit);

        // Pull the balance back towards zero when it went negative
        if prv.credit_balance < 0 {
            credit_total -= i64::from(prv.credit_balance);
            inc(&self.stats.acct_balance);
        }

        if weight_total == 0 {
            prv.credit_balance = 0;
            inc(&self.stats.acct_no_work);
            return None;
        }

        inc(&self.stats.acct_run);

        let mut weight_left = weight_total;
        let mut credit_balance: i64 = 0;
        let mut credit_xtra = false;

        // Reordering only ever moves a domain already visited to the front,
        // so walking a snapshot visits every active domain exactly once.
        let order: Vec<_> = prv.active_sdom.iter().copied().collect();
        for dom in order {
            let (weight, cap, n) = {
                let sdom = match prv.domains.get(&dom) {
                    Some(sdom) => sdom,
                    None => panic!("active domain {} has no accounting data", dom),
                };
                (i64::from(sdom.weight), sdom.cap, i64::from(sdom.active_vcpu_count()))
            };
            assert!(n != 0, "accounting domain {} with no active vcpus", dom);
            assert!(weight != 0, "accounting domain {} with zero weight", dom);
            assert!(
                weight * n <= weight_left,
                "domain {} weight {}x{} exceeds remaining {}",
                dom,
                weight,
                n,
                weight_left
            );

            weight_left -= weight * n;

            // A domain may run all its active vCPUs for the whole period;
            // more only while the system as a whole is in debt.
            let mut credit_peak = n * cpt;
            if prv.credit_balance < 0 {
                credit_peak +=
                    (-i64::from(prv.credit_balance) * weight * n + (weight_total - 1)) / weight_total;
            }

            let mut credit_cap = 0;
            if cap != 0 {
                credit_cap = (i64::from(cap) * cpt + 99) / 100;
                credit_peak = credit_peak.min(credit_cap);
                credit_cap = (credit_cap + (n - 1)) / n;
            }

            let mut credit_fair = (credit_total * weight * n + (weight_total - 1)) / weight_total;

            if credit_fair < credit_peak {
                credit_xtra = true;
            } else {
                if weight_left != 0 {
                    // Offer the share this domain cannot use to the rest
                    credit_total += ((credit_fair - credit_peak) * weight_total + (weight_left - 1))
                        / weight_left;
                }
                if credit_xtra {
                    // Domains with room for extra credit stay behind this one
                    inc(&self.stats.acct_reorder);
                    prv.active_sdom.retain(|d| *d != dom);
                    prv.active_sdom.push_front(dom);
                }
                credit_fair = credit_peak;
            }

            // Per-vCPU share
            let credit_fair = (credit_fair + (n - 1)) / n;

            let members: Vec<_> = match prv.domains.get(&dom) {
                Some(sdom) => sdom.active_vcpus.clone(),
                None => Vec::new(),
            };
            for svc in members {
                let mut credit = i64::from(svc.add_credit(credit_fair as i32));

                if credit < 0 {
                    svc.set_priority(Priority::Over);

                    // Park vCPUs of capped domains that overran the cap
                    if cap != 0 && credit < -credit_cap && !svc.is_parked() {
                        inc(&self.stats.vcpu_park);
                        svc.set_flags(VcpuFlags::PARKED);
                        changes.park.push(svc.clone());
                    }

                    if credit < -cpt {
                        inc(&self.stats.acct_min_credit);
                        credit = -cpt;
                        svc.set_credit(credit as i32);
                    }
                } else {
                    svc.set_priority(Priority::Under);

                    if svc.is_parked() {
                        inc(&self.stats.vcpu_unpark);
                        changes.unpark.push(svc.clone());
                    }

                    // Past the ceiling the vCPU stops earning; it keeps a
                    // fraction as a head start for when it comes back.
                    if credit > cpt {
                        self.acct_stop_locked(prv, &svc);
                        credit /= i64::from(t.credit_halving_divisor);
                        svc.set_credit(credit as i32);
                    }
                }

                svc.stats.credit_last.store(credit as i32, Ordering::Relaxed);
                svc.stats.credit_incr.store(credit_fair as i32, Ordering::Relaxed);
                credit_balance += credit;
            }
        }

        prv.credit_balance = credit_balance as i32;
        Some(changes)
    }

    fn apply_park_changes(&self, changes: ParkChanges) {
        for svc in changes.park {
            log::debug!("credit: parking {}", svc);
            self.vcpu_pause(&svc);
        }
        // Unpause before clearing PARKED so the resulting wake is not boosted
        for svc in changes.unpark {
            log::debug!("credit: unparking {}", svc);
            self.vcpu_unpause(&svc);
            svc.clear_flags(VcpuFlags::PARKED);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::millisecs;
    use crate::vcpu::Vcpu;

    fn svc_at(start: STime) -> CreditVcpu {
        let svc = CreditVcpu::new(Arc::new(Vcpu::new(1, 0, 0)));
        svc.set_start_time(start);
        svc
    }

    #[test]
    fn test_burn_rounds_to_nearest_credit() {
        // 10ms = 100 credits
        let svc = svc_at(0);
        burn_credits(&svc, millisecs(10));
        assert_eq!(svc.credit(), -100);
        assert_eq!(svc.start_time(), millisecs(10));

        // 0.14ms rounds down to 1 credit, 0.1ms charged
        let svc = svc_at(0);
        burn_credits(&svc, 140_000);
        assert_eq!(svc.credit(), -1);
        assert_eq!(svc.start_time(), 100_000);

        // 0.04ms rounds to zero; nothing charged, nothing lost
        let svc = svc_at(0);
        burn_credits(&svc, 40_000);
        assert_eq!(svc.credit(), 0);
        assert_eq!(svc.start_time(), 0);
    }

    #[test]
    fn test_burn_keeps_remainder() {
        let svc = svc_at(0);
        burn_credits(&svc, 140_000);
        burn_credits(&svc, 200_000);
        // 0.2ms total = 2 credits
        assert_eq!(svc.credit(), -2);
        assert_eq!(svc.start_time(), 200_000);
    }

    #[test]
    fn test_burn_ignores_non_positive_delta() {
        let svc = svc_at(millisecs(5));
        burn_credits(&svc, millisecs(5));
        burn_credits(&svc, millisecs(4));
        assert_eq!(svc.credit(), 0);
    }
}
