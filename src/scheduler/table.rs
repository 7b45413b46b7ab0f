//! Global scheduler state and allocation of per-pCPU, per-domain and
//! per-vCPU data.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::config::{BootParams, RATELIMIT_MAX_US, RATELIMIT_MIN_US, TSLICE_MAX_MS, TSLICE_MIN_MS};
use crate::error::{SchedError, SchedResult};
use crate::ops::{DomainParams, DomainUpdate, GlobalParams};
use crate::types::{microsecs, millisecs, CpuId, DomainId, STime};
use crate::vcpu::Vcpu;

use super::percpu::CreditPcpu;
use super::stats::inc;
use super::types::{CREDITS_PER_MSEC, DEFAULT_WEIGHT, TICKS_PER_TSLICE};
use super::vcpu::CreditVcpu;
use super::CreditScheduler;

// ============================================================================
// Tunables
// ============================================================================

/// Values read on hot paths without the global lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunables {
    pub tslice_ms: u32,
    pub ratelimit_us: u32,
    pub ticks_per_tslice: u32,
    pub tick_period_us: u32,
    pub credits_per_tslice: i32,
    pub migration_delay_us: u32,
    pub default_yield: bool,
    pub tickle_one_idle: bool,
    pub smt_power_savings: bool,
    pub credit_halving_divisor: u32,
}

impl Tunables {
    pub(crate) fn from_params(params: &BootParams) -> Self {
        let mut t = Self {
            tslice_ms: params.tslice_ms,
            ratelimit_us: params.ratelimit_us,
            ticks_per_tslice: TICKS_PER_TSLICE,
            tick_period_us: 0,
            credits_per_tslice: 0,
            migration_delay_us: params.vcpu_migration_delay_us,
            default_yield: params.default_yield,
            tickle_one_idle: params.tickle_one_idle,
            smt_power_savings: params.smt_power_savings,
            credit_halving_divisor: params.credit_halving_divisor.max(1),
        };
        t.set_tslice(params.tslice_ms);
        t
    }

    /// Derive tick period and credit rate from the timeslice
    fn set_tslice(&mut self, tslice_ms: u32) {
        self.tslice_ms = tslice_ms;
        self.ticks_per_tslice = if tslice_ms < TICKS_PER_TSLICE {
            1
        } else {
            TICKS_PER_TSLICE
        };
        self.tick_period_us = tslice_ms * 1000 / self.ticks_per_tslice;
        self.credits_per_tslice = (CREDITS_PER_MSEC * i64::from(tslice_ms)) as i32;
    }

    pub fn tslice(&self) -> STime {
        millisecs(u64::from(self.tslice_ms))
    }

    pub fn tick_period(&self) -> STime {
        microsecs(u64::from(self.tick_period_us))
    }
}

// ============================================================================
// Global State
// ============================================================================

/// Accounting state of one domain
#[derive(Debug)]
pub(crate) struct DomainAcct {
    pub weight: u32,
    pub cap: u16,
    /// vCPUs currently earning credit. Non-empty iff the domain is on
    /// `CreditPrivate::active_sdom`.
    pub active_vcpus: Vec<Arc<CreditVcpu>>,
    pub nr_vcpus: usize,
}

impl DomainAcct {
    fn new() -> Self {
        Self {
            weight: DEFAULT_WEIGHT,
            cap: 0,
            active_vcpus: Vec::new(),
            nr_vcpus: 0,
        }
    }

    pub fn active_vcpu_count(&self) -> u32 {
        self.active_vcpus.len() as u32
    }
}

/// State protected by the global scheduler lock
#[derive(Debug)]
pub(crate) struct CreditPrivate {
    pub domains: HashMap<DomainId, DomainAcct>,
    /// Domains with at least one active vCPU, in accounting order
    pub active_sdom: VecDeque<DomainId>,
    pub ncpus: u32,
    pub master: CpuId,
    /// Credit handed out per accounting period
    pub credit: i32,
    pub credit_balance: i32,
    /// Sum of weight * active vCPU count over active domains
    pub weight: u32,
}

impl CreditPrivate {
    pub(crate) fn new() -> Self {
        Self {
            domains: HashMap::new(),
            active_sdom: VecDeque::new(),
            ncpus: 0,
            master: 0,
            credit: 0,
            credit_balance: 0,
            weight: 0,
        }
    }
}

// ============================================================================
// Allocation
// ============================================================================

impl CreditScheduler {
    pub(crate) fn pcpu(&self, cpu: CpuId) -> Option<Arc<CreditPcpu>> {
        self.pcpus.read().get(cpu).and_then(|p| p.clone())
    }

    pub fn tunables(&self) -> Tunables {
        *self.tunables.read()
    }

    /// Attach `cpu` to the scheduler and make its idle vCPU current.
    pub(crate) fn alloc_pdata(&self, cpu: CpuId) -> SchedResult<()> {
        if cpu >= self.topology.nr_cpus() {
            return Err(SchedError::InvalidArgument(format!(
                "cpu {} outside topology of {} cpus",
                cpu,
                self.topology.nr_cpus()
            )));
        }
        if self.pcpu(cpu).is_some() {
            return Err(SchedError::AlreadyExists(format!("pcpu {}", cpu)));
        }

        let now = self.host.now();
        let idle = Arc::new(CreditVcpu::new(Arc::new(Vcpu::new_idle(cpu))));
        idle.vcpu().set_running(true);
        idle.vcpu().set_state_entry_time(now);

        let idle_bias = self.topology.nr_cpus() - 1;
        let epoch = self.runq_sort.load(Ordering::Acquire);
        let pcpu = Arc::new(CreditPcpu::new(cpu, idle, idle_bias, epoch)?);

        {
            let mut pcpus = self.pcpus.write();
            if pcpus[cpu].is_some() {
                return Err(SchedError::AlreadyExists(format!("pcpu {}", cpu)));
            }
            pcpus[cpu] = Some(pcpu.clone());
        }

        let t = self.tunables();
        let mut prv = self.prv.lock();
        prv.credit += t.credits_per_tslice;
        prv.ncpus += 1;
        self.online.set(cpu);
        if prv.ncpus == 1 {
            prv.master = cpu;
            self.master_ticker.migrate(cpu);
            self.master_ticker.set(now + t.tslice());
        }
        pcpu.ticker.set(now + t.tick_period());
        self.idlers.set(cpu);
        let ncpus = prv.ncpus;
        drop(prv);

        log::info!("credit: attached cpu {} ({} online)", cpu, ncpus);
        Ok(())
    }

    /// Detach `cpu`. Its run queue must hold no guest vCPUs. Blocked or
    /// paused vCPUs still homed here move to an online pCPU when they wake.
    pub(crate) fn free_pdata(&self, cpu: CpuId) {
        let pcpu = match self.pcpu(cpu) {
            Some(pcpu) => pcpu,
            None => return,
        };
        {
            let rq = pcpu.runq.lock();
            assert!(
                rq.curr.is_idle() && rq.iter().all(|svc| svc.is_idle()),
                "detaching cpu {} with guest vcpus still on it",
                cpu
            );
        }

        let t = self.tunables();
        let mut prv = self.prv.lock();
        prv.credit -= t.credits_per_tslice;
        prv.ncpus -= 1;
        self.idlers.clear(cpu);
        self.online.clear(cpu);
        if prv.master == cpu && prv.ncpus > 0 {
            if let Some(new_master) = self.online.load().first() {
                prv.master = new_master;
                self.master_ticker.migrate(new_master);
                log::info!("credit: accounting master moved {} -> {}", cpu, new_master);
            }
        }
        pcpu.ticker.kill();
        if prv.ncpus == 0 {
            self.master_ticker.stop();
        }
        let ncpus = prv.ncpus;
        drop(prv);

        self.pcpus.write()[cpu] = None;
        log::info!("credit: detached cpu {} ({} online)", cpu, ncpus);
    }

    pub(crate) fn alloc_domdata(&self, dom: DomainId) -> SchedResult<DomainId> {
        if dom == crate::types::IDLE_DOMAIN_ID {
            return Err(SchedError::InvalidArgument("idle domain has no scheduler data".into()));
        }
        let mut prv = self.prv.lock();
        if prv.domains.contains_key(&dom) {
            return Err(SchedError::AlreadyExists(format!("domain {}", dom)));
        }
        prv.domains.try_reserve(1)?;
        prv.active_sdom.try_reserve(1)?;
        prv.domains.insert(dom, DomainAcct::new());
        drop(prv);

        inc(&self.stats.dom_init);
        log::debug!("credit: domain {} initialised", dom);
        Ok(dom)
    }

    pub(crate) fn free_domdata(&self, dom: DomainId) {
        let mut prv = self.prv.lock();
        if let Some(sdom) = prv.domains.get(&dom) {
            assert!(
                sdom.active_vcpus.is_empty(),
                "destroying domain {} with {} active vcpus",
                dom,
                sdom.active_vcpus.len()
            );
            prv.domains.remove(&dom);
            inc(&self.stats.dom_destroy);
        }
    }

    pub(crate) fn alloc_vdata(&self, vcpu: Arc<Vcpu>) -> SchedResult<Arc<CreditVcpu>> {
        if !vcpu.is_idle() {
            let mut prv = self.prv.lock();
            let sdom = prv
                .domains
                .get_mut(&vcpu.domain_id())
                .ok_or_else(|| SchedError::NotFound(format!("domain {}", vcpu.domain_id())))?;
            // Room for every vCPU on the active list, so acct_start never allocates
            sdom.active_vcpus.try_reserve(sdom.nr_vcpus + 1 - sdom.active_vcpus.len())?;
            sdom.nr_vcpus += 1;
        }
        inc(&self.stats.vcpu_init);
        Ok(Arc::new(CreditVcpu::new(vcpu)))
    }

    pub(crate) fn free_vdata(&self, svc: Arc<CreditVcpu>) {
        assert!(!svc.on_runq(), "freeing queued vcpu {}", svc.vcpu());
        assert!(!svc.is_active(), "freeing active vcpu {}", svc.vcpu());
        if let Some(dom) = svc.domain() {
            if let Some(sdom) = self.prv.lock().domains.get_mut(&dom) {
                sdom.nr_vcpus = sdom.nr_vcpus.saturating_sub(1);
            }
        }
    }

    // ========================================================================
    // Adjustment
    // ========================================================================

    pub(crate) fn dom_cntl(&self, dom: DomainId, update: Option<DomainUpdate>) -> SchedResult<DomainParams> {
        let mut prv = self.prv.lock();
        let prv = &mut *prv;
        let sdom = prv
            .domains
            .get_mut(&dom)
            .ok_or_else(|| SchedError::NotFound(format!("domain {}", dom)))?;

        if let Some(update) = update {
            super::validate_domain_update(&update)?;

            if let Some(weight) = update.weight {
                if !sdom.active_vcpus.is_empty() {
                    let n = sdom.active_vcpu_count();
                    prv.weight = prv.weight - sdom.weight * n + weight * n;
                }
                sdom.weight = weight;
            }
            if let Some(cap) = update.cap {
                sdom.cap = cap;
            }
            log::info!(
                "credit: domain {} weight={} cap={}",
                dom,
                sdom.weight,
                sdom.cap
            );
        }

        Ok(DomainParams {
            weight: sdom.weight,
            cap: sdom.cap,
        })
    }

    pub(crate) fn sys_cntl(&self, params: Option<GlobalParams>) -> SchedResult<GlobalParams> {
        if let Some(p) = params {
            let ratelimit_ok =
                p.ratelimit_us == 0 || (RATELIMIT_MIN_US..=RATELIMIT_MAX_US).contains(&p.ratelimit_us);
            if !(TSLICE_MIN_MS..=TSLICE_MAX_MS).contains(&p.tslice_ms)
                || !ratelimit_ok
                || u64::from(p.ratelimit_us) * 1000 > u64::from(p.tslice_ms) * 1_000_000
            {
                log::warn!(
                    "credit: rejected tslice_ms={} ratelimit_us={}",
                    p.tslice_ms,
                    p.ratelimit_us
                );
                return Err(SchedError::InvalidArgument(format!(
                    "tslice_ms={} ratelimit_us={} (tslice {}..={} ms, ratelimit 0 or {}..={} us, ratelimit <= tslice)",
                    p.tslice_ms,
                    p.ratelimit_us,
                    TSLICE_MIN_MS,
                    TSLICE_MAX_MS,
                    RATELIMIT_MIN_US,
                    RATELIMIT_MAX_US
                )));
            }

            let mut prv = self.prv.lock();
            let mut t = self.tunables.write();
            t.set_tslice(p.tslice_ms);
            t.ratelimit_us = p.ratelimit_us;
            prv.credit = t.credits_per_tslice * prv.ncpus as i32;
            drop(t);
            drop(prv);
            log::info!(
                "credit: tslice_ms={} ratelimit_us={}",
                p.tslice_ms,
                p.ratelimit_us
            );
        }

        let t = self.tunables();
        Ok(GlobalParams {
            tslice_ms: t.tslice_ms,
            ratelimit_us: t.ratelimit_us,
        })
    }

    pub fn migration_delay_us(&self) -> u32 {
        self.tunables().migration_delay_us
    }

    pub fn set_migration_delay_us(&self, delay_us: u32) {
        self.tunables.write().migration_delay_us = delay_us;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tunables_derived_values() {
        let t = Tunables::from_params(&BootParams::default());
        assert_eq!(t.ticks_per_tslice, 3);
        assert_eq!(t.tick_period_us, 10_000);
        assert_eq!(t.credits_per_tslice, 300);

        let short = Tunables::from_params(&BootParams {
            tslice_ms: 2,
            ratelimit_us: 500,
            ..Default::default()
        });
        assert_eq!(short.ticks_per_tslice, 1);
        assert_eq!(short.tick_period_us, 2000);
        assert_eq!(short.credits_per_tslice, 20);
    }
}
