//! Credit scheduler
//!
//! Proportional-share scheduler for vCPUs. Every domain has a weight and
//! an optional cap; credit is handed out once per timeslice in proportion
//! to weight and burned while a vCPU runs. vCPUs with credit left run at
//! UNDER priority, those that overspent at OVER, and freshly woken vCPUs
//! get a transient BOOST.
//!
//! ## Per-CPU Architecture
//!
//! - Each pCPU owns a run queue ordered by priority, FIFO within a priority
//! - A per-pCPU tick burns credit of the running vCPU and resorts the queue
//!   after accounting changed priorities
//! - The master pCPU runs the accounting pass once per timeslice
//! - An idle pCPU steals queued work from busy peers with `try_lock` only
//!
//! ## Module Organization
//!
//! - `types`: Priorities, flags and constants
//! - `runq`: Slab-backed run queue list
//! - `table`: Global state, tunables and allocation
//! - `percpu`: Per-pCPU state, tick and sort
//! - `accounting`: Credit burn and the periodic accounting pass
//! - `core`: The scheduling decision
//! - `smp`: CPU placement and work stealing
//! - `vcpu`: Per-vCPU state, sleep/wake/yield and tickling
//! - `stats`: Counters and state dumps

mod accounting;
mod core;
mod percpu;
pub mod runq;
mod smp;
mod stats;
mod table;
mod types;
mod vcpu;


use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::config::BootParams;
use crate::cpumask::{AtomicCpuMask, CpuMask};
use crate::error::{SchedError, SchedResult};
use crate::host::SchedHost;
use crate::ops::{DomainParams, DomainUpdate, GlobalParams, SchedulerOps, TaskSlice};
use crate::timer::Timer;
use crate::topology::Topology;
use crate::types::{CpuId, DomainId, STime};

pub use percpu::{CreditPcpu, PcpuRunq};
pub use stats::{SchedStats, VcpuStatsSnapshot};
pub use table::Tunables;
pub use types::{Priority, VcpuFlags, CREDITS_PER_MSEC, DEFAULT_WEIGHT, MAX_CAP, MAX_WEIGHT, TICKS_PER_TSLICE};
pub use vcpu::CreditVcpu;

use stats::StatCounters;
use table::CreditPrivate;

pub struct CreditScheduler {
    host: Arc<dyn SchedHost>,
    topology: Topology,
    /// Global lock: totals, active lists, master bookkeeping
    prv: Mutex<CreditPrivate>,
    tunables: RwLock<Tunables>,
    pcpus: RwLock<Vec<Option<Arc<CreditPcpu>>>>,
    idlers: AtomicCpuMask,
    online: AtomicCpuMask,
    /// Bumped by every accounting pass; pCPUs resort when it moves
    runq_sort: AtomicU32,
    master_ticker: Timer,
    stats: StatCounters,
}

impl CreditScheduler {
    /// Bring up the scheduler with no pCPUs attached. Out-of-range boot
    /// parameters are replaced by their defaults.
    pub fn new(host: Arc<dyn SchedHost>, topology: Topology, mut params: BootParams) -> SchedResult<Self> {
        params.sanitize();

        let mut pcpus = Vec::new();
        pcpus.try_reserve_exact(topology.nr_cpus())?;
        pcpus.resize_with(topology.nr_cpus(), || None);

        let tunables = Tunables::from_params(&params);
        log::info!(
            "credit: init tslice={}ms ratelimit={}us ticks/tslice={} tick={}us cpus={}",
            tunables.tslice_ms,
            tunables.ratelimit_us,
            tunables.ticks_per_tslice,
            tunables.tick_period_us,
            topology.nr_cpus()
        );

        Ok(Self {
            host,
            topology,
            prv: Mutex::new(CreditPrivate::new()),
            tunables: RwLock::new(tunables),
            pcpus: RwLock::new(pcpus),
            idlers: AtomicCpuMask::new(),
            online: AtomicCpuMask::new(),
            runq_sort: AtomicU32::new(0),
            master_ticker: Timer::new(0),
            stats: StatCounters::default(),
        })
    }

    /// Stop all timers. pCPUs still attached keep their run queues.
    pub fn shutdown(&self) {
        self.master_ticker.kill();
        for pcpu in self.pcpus.read().iter().flatten() {
            pcpu.ticker.kill();
        }
        log::info!("credit: deinit");
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn host(&self) -> &Arc<dyn SchedHost> {
        &self.host
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Fire the timers due on `cpu` at `now`.
    pub fn run_timers(&self, cpu: CpuId, now: STime) {
        if self.master_ticker.take_due(cpu, now) {
            self.acct(now);
        }
        if let Some(pcpu) = self.pcpu(cpu) {
            if pcpu.ticker.take_due(cpu, now) {
                self.tick(&pcpu, now);
            }
        }
    }

    /// Earliest pending timer on `cpu`
    pub fn next_timer(&self, cpu: CpuId) -> Option<STime> {
        let master = self.master_ticker.expires_on(cpu);
        let tick = self.pcpu(cpu).and_then(|pcpu| pcpu.ticker.expires());
        match (master, tick) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub(crate) fn do_tick_suspend(&self, cpu: CpuId) {
        if let Some(pcpu) = self.pcpu(cpu) {
            pcpu.ticker.stop();
        }
    }

    /// Re-arm the tick on the next multiple of the tick period
    pub(crate) fn do_tick_resume(&self, cpu: CpuId) {
        if let Some(pcpu) = self.pcpu(cpu) {
            let now = self.host.now();
            let period = self.tunables().tick_period();
            pcpu.ticker.set(now + period - now % period);
        }
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn idlers(&self) -> CpuMask {
        self.idlers.load()
    }

    pub fn online(&self) -> CpuMask {
        self.online.load()
    }

    pub fn master_cpu(&self) -> Option<CpuId> {
        let prv = self.prv.lock();
        if prv.ncpus > 0 {
            Some(prv.master)
        } else {
            None
        }
    }

    pub fn credit_balance(&self) -> i32 {
        self.prv.lock().credit_balance
    }

    pub fn total_credit(&self) -> i32 {
        self.prv.lock().credit
    }

    pub fn total_weight(&self) -> u32 {
        self.prv.lock().weight
    }

    /// Active domains in accounting order
    pub fn active_domains(&self) -> Vec<DomainId> {
        self.prv.lock().active_sdom.iter().copied().collect()
    }

    pub fn domain_params(&self, dom: DomainId) -> SchedResult<DomainParams> {
        self.dom_cntl(dom, None)
    }

    /// Queued vCPUs of `cpu`, head first
    pub fn runq_snapshot(&self, cpu: CpuId) -> Vec<Arc<CreditVcpu>> {
        self.pcpu(cpu)
            .map(|pcpu| pcpu.runq.lock().iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn tick_count(&self, cpu: CpuId) -> Option<u64> {
        self.pcpu(cpu).map(|pcpu| pcpu.tick_count())
    }

    pub fn master_timer_expiry(&self) -> Option<STime> {
        self.master_ticker.expires()
    }

    pub fn tick_timer_expiry(&self, cpu: CpuId) -> Option<STime> {
        self.pcpu(cpu).and_then(|pcpu| pcpu.ticker.expires())
    }
}

impl SchedulerOps for CreditScheduler {
    type Vcpu = Arc<CreditVcpu>;
    type Domain = DomainId;

    fn init(host: Arc<dyn SchedHost>, topology: Topology, params: BootParams) -> SchedResult<Self> {
        CreditScheduler::new(host, topology, params)
    }

    fn deinit(&self) {
        self.shutdown();
    }

    fn alloc_pdata(&self, cpu: CpuId) -> SchedResult<()> {
        CreditScheduler::alloc_pdata(self, cpu)
    }

    fn free_pdata(&self, cpu: CpuId) {
        CreditScheduler::free_pdata(self, cpu)
    }

    fn alloc_vdata(&self, vcpu: Arc<crate::vcpu::Vcpu>) -> SchedResult<Arc<CreditVcpu>> {
        CreditScheduler::alloc_vdata(self, vcpu)
    }

    fn free_vdata(&self, svc: Arc<CreditVcpu>) {
        CreditScheduler::free_vdata(self, svc)
    }

    fn alloc_domdata(&self, dom: DomainId) -> SchedResult<DomainId> {
        CreditScheduler::alloc_domdata(self, dom)
    }

    fn free_domdata(&self, dom: DomainId) {
        CreditScheduler::free_domdata(self, dom)
    }

    fn insert_vcpu(&self, svc: &Arc<CreditVcpu>) {
        self.vcpu_insert(svc)
    }

    fn remove_vcpu(&self, svc: &Arc<CreditVcpu>) {
        self.vcpu_remove(svc)
    }

    fn sleep(&self, svc: &Arc<CreditVcpu>) {
        self.with_vcpu_runq(svc, |_, rq| self.vcpu_sleep_locked(rq, svc))
    }

    fn wake(&self, svc: &Arc<CreditVcpu>) {
        self.with_vcpu_runq(svc, |pcpu, rq| self.vcpu_wake_locked(pcpu, rq, svc))
    }

    fn yield_vcpu(&self, svc: &Arc<CreditVcpu>) {
        self.vcpu_yield(svc)
    }

    fn adjust(&self, dom: &DomainId, update: Option<DomainUpdate>) -> SchedResult<DomainParams> {
        self.dom_cntl(*dom, update)
    }

    fn adjust_global(&self, params: Option<GlobalParams>) -> SchedResult<GlobalParams> {
        self.sys_cntl(params)
    }

    fn pick_cpu(&self, svc: &Arc<CreditVcpu>) -> CpuId {
        self.cpu_pick(svc, true)
    }

    fn do_schedule(&self, cpu: CpuId, now: STime, tasklet_work_scheduled: bool) -> TaskSlice<Arc<CreditVcpu>> {
        self.schedule(cpu, now, tasklet_work_scheduled)
    }

    fn tick_suspend(&self, cpu: CpuId) {
        self.do_tick_suspend(cpu)
    }

    fn tick_resume(&self, cpu: CpuId) {
        self.do_tick_resume(cpu)
    }

    fn dump_cpu_state(&self, cpu: CpuId) -> String {
        self.dump_pcpu(cpu)
    }

    fn dump_settings(&self) -> String {
        self.dump()
    }
}

impl std::fmt::Debug for CreditScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditScheduler")
            .field("online", &self.online.load())
            .field("idlers", &self.idlers.load())
            .field("tunables", &self.tunables())
            .finish()
    }
}

/// Validate a domain update without applying it
pub fn validate_domain_update(update: &DomainUpdate) -> SchedResult<()> {
    if let Some(weight) = update.weight {
        if weight == 0 {
            return Err(SchedError::InvalidArgument("weight must be at least 1".into()));
        }
        if weight > MAX_WEIGHT {
            return Err(SchedError::InvalidArgument(format!("weight {} above {}", weight, MAX_WEIGHT)));
        }
    }
    if let Some(cap) = update.cap {
        if cap > MAX_CAP {
            return Err(SchedError::InvalidArgument(format!("cap {} above {}", cap, MAX_CAP)));
        }
    }
    Ok(())
}
