//! Deterministic multi-pCPU simulation
//!
//! [`MockHost`] is a manual clock plus a pending-softirq mask. [`Simulator`]
//! drives a [`CreditScheduler`] on top of it: it fires timers, ends slices,
//! plays each vCPU's [`Workload`] and runs the scheduling decision on every
//! pCPU whose softirq was raised, all in virtual time on a single thread.
//!
//! Scenario files describe a whole run:
//!
//! ```yaml
//! params:
//!   tslice_ms: 30
//! topology: { sockets: 1, cores_per_socket: 2, threads_per_core: 1 }
//! duration_ms: 3000
//! domains:
//!   - { id: 1, weight: 512, vcpus: 2 }
//!   - { id: 2, weight: 256, cap: 50, workload: { type: periodic, run_us: 1000, sleep_us: 9000 } }
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::BootParams;
use crate::cpumask::CpuMask;
use crate::error::{SchedError, SchedResult};
use crate::host::SchedHost;
use crate::ops::{DomainParams, DomainUpdate, SchedulerOps};
use crate::scheduler::{CreditScheduler, CreditVcpu, SchedStats, DEFAULT_WEIGHT};
use crate::topology::{Topology, TopologySpec};
use crate::types::{microsecs, millisecs, CpuId, DomainId, STime};
use crate::vcpu::Vcpu;

/// Simulated time at which a simulation starts. Far enough from zero that
/// freshly created vCPUs do not look cache-hot.
pub const SIM_BOOT_TIME: STime = millisecs(1000);

// ============================================================================
// MockHost
// ============================================================================

/// Manually advanced clock that records raised softirqs
#[derive(Debug, Default)]
pub struct MockHost {
    now: AtomicI64,
    pending: Mutex<CpuMask>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(now: STime) -> Self {
        Self {
            now: AtomicI64::new(now),
            pending: Mutex::new(CpuMask::empty()),
        }
    }

    pub fn set_now(&self, now: STime) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, delta: STime) -> STime {
        self.now.fetch_add(delta, Ordering::SeqCst) + delta
    }

    /// pCPUs with a schedule softirq pending
    pub fn pending(&self) -> CpuMask {
        *self.pending.lock()
    }

    /// Drain the pending softirq mask
    pub fn take_pending(&self) -> CpuMask {
        std::mem::take(&mut *self.pending.lock())
    }
}

impl SchedHost for MockHost {
    fn now(&self) -> STime {
        self.now.load(Ordering::SeqCst)
    }

    fn raise_schedule_softirq(&self, mask: &CpuMask) {
        let mut pending = self.pending.lock();
        *pending = pending.or(mask);
    }
}

// ============================================================================
// Scenario
// ============================================================================

/// What a simulated vCPU does with the CPU
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Workload {
    /// Always runnable
    #[default]
    CpuBound,
    /// Runs for `run_us` of CPU time, then blocks for `sleep_us`
    Periodic { run_us: u64, sleep_us: u64 },
}

fn default_weight() -> u32 {
    DEFAULT_WEIGHT
}

fn default_vcpus() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSpec {
    pub id: DomainId,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub cap: u16,
    #[serde(default = "default_vcpus")]
    pub vcpus: u32,
    #[serde(default)]
    pub affinity: Option<CpuMask>,
    #[serde(default)]
    pub workload: Workload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub params: BootParams,
    #[serde(default)]
    pub topology: TopologySpec,
    pub duration_ms: u64,
    pub domains: Vec<DomainSpec>,
}

impl Scenario {
    pub fn from_yaml_str(content: &str) -> SchedResult<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> SchedResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| SchedError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&content)
    }
}

// ============================================================================
// Report
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainReport {
    pub id: DomainId,
    pub weight: u32,
    pub cap: u16,
    pub vcpus: usize,
    pub cpu_time_ns: STime,
    /// Fraction of the total pCPU time available during the run
    pub share: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimReport {
    pub elapsed_ns: STime,
    pub nr_cpus: usize,
    pub domains: Vec<DomainReport>,
    pub cpu_busy_ns: Vec<STime>,
    pub stats: SchedStats,
}

// ============================================================================
// Simulator
// ============================================================================

struct SimVcpu {
    svc: Arc<CreditVcpu>,
    workload: Workload,
    /// CPU time left before a periodic vCPU blocks
    run_left: STime,
    wake_at: Option<STime>,
    cpu_time: STime,
}

pub struct Simulator {
    host: Arc<MockHost>,
    sched: CreditScheduler,
    vcpus: Vec<SimVcpu>,
    domains: Vec<DomainId>,
    /// End of the slice handed out by the last decision, per pCPU
    slice_end: Vec<Option<STime>>,
    cpu_busy: Vec<STime>,
    start: STime,
}

impl Simulator {
    /// Attach every pCPU of `topology` to a fresh scheduler.
    pub fn new(topology: Topology, params: BootParams) -> SchedResult<Self> {
        let host = Arc::new(MockHost::starting_at(SIM_BOOT_TIME));
        let nr_cpus = topology.nr_cpus();
        let sched = CreditScheduler::init(host.clone(), topology, params)?;
        for cpu in 0..nr_cpus {
            sched.alloc_pdata(cpu)?;
        }
        Ok(Self {
            host,
            sched,
            vcpus: Vec::new(),
            domains: Vec::new(),
            slice_end: vec![None; nr_cpus],
            cpu_busy: vec![0; nr_cpus],
            start: SIM_BOOT_TIME,
        })
    }

    /// Build the topology, domains and vCPUs a scenario describes.
    pub fn from_scenario(scenario: &Scenario) -> SchedResult<Self> {
        let topology = Topology::from_spec(&scenario.topology)?;
        let nr_cpus = topology.nr_cpus();
        let mut sim = Self::new(topology, scenario.params.clone())?;

        let mut next_cpu = 0;
        for spec in &scenario.domains {
            sim.add_domain(
                spec.id,
                DomainParams {
                    weight: spec.weight,
                    cap: spec.cap,
                },
            )?;
            for vcpu_id in 0..spec.vcpus {
                // Round-robin initial placement, like domain creation does
                let affinity = spec.affinity.unwrap_or_else(CpuMask::all);
                let cpu = affinity
                    .and(&CpuMask::first_n(nr_cpus))
                    .cycle(next_cpu)
                    .ok_or_else(|| {
                        SchedError::InvalidArgument(format!(
                            "domain {} affinity {} has no cpu below {}",
                            spec.id, affinity, nr_cpus
                        ))
                    })?;
                next_cpu = (cpu + 1) % nr_cpus;
                sim.add_vcpu_on(spec.id, vcpu_id, cpu, affinity, spec.workload)?;
            }
        }
        Ok(sim)
    }

    pub fn scheduler(&self) -> &CreditScheduler {
        &self.sched
    }

    pub fn host(&self) -> &Arc<MockHost> {
        &self.host
    }

    pub fn now(&self) -> STime {
        self.host.now()
    }

    /// Time simulated so far
    pub fn elapsed(&self) -> STime {
        self.now() - self.start
    }

    pub fn add_domain(&mut self, dom: DomainId, params: DomainParams) -> SchedResult<()> {
        self.sched.alloc_domdata(dom)?;
        self.sched.adjust(
            &dom,
            Some(DomainUpdate {
                weight: Some(params.weight),
                cap: Some(params.cap),
            }),
        )?;
        self.domains.push(dom);
        Ok(())
    }

    pub fn adjust_domain(&self, dom: DomainId, update: DomainUpdate) -> SchedResult<DomainParams> {
        self.sched.adjust(&dom, Some(update))
    }

    /// Create a vCPU on `cpu`, wake it and let the scheduler react.
    pub fn add_vcpu_on(
        &mut self,
        dom: DomainId,
        vcpu_id: u32,
        cpu: CpuId,
        affinity: CpuMask,
        workload: Workload,
    ) -> SchedResult<Arc<CreditVcpu>> {
        let vcpu = Vcpu::new(dom, vcpu_id, cpu).with_affinity(affinity);
        // Created blocked; the wake below starts it
        vcpu.set_blocked(true);
        let svc = self.sched.alloc_vdata(Arc::new(vcpu))?;
        self.sched.insert_vcpu(&svc);

        self.vcpus.push(SimVcpu {
            svc: svc.clone(),
            workload,
            run_left: Self::burst(workload),
            wake_at: None,
            cpu_time: 0,
        });

        self.sched.vcpu_unblock(&svc);
        self.process_softirqs();
        Ok(svc)
    }

    pub fn add_vcpu(&mut self, dom: DomainId, vcpu_id: u32, cpu: CpuId, workload: Workload) -> SchedResult<Arc<CreditVcpu>> {
        self.add_vcpu_on(dom, vcpu_id, cpu, CpuMask::all(), workload)
    }

    fn burst(workload: Workload) -> STime {
        match workload {
            Workload::CpuBound => STime::MAX,
            Workload::Periodic { run_us, .. } => microsecs(run_us),
        }
    }

    /// Run the decision on every pCPU with a pending softirq until none is
    /// left.
    pub fn process_softirqs(&mut self) {
        loop {
            let pending = self.host.take_pending();
            if pending.is_empty() {
                return;
            }
            for cpu in pending.iter() {
                self.reschedule(cpu);
            }
        }
    }

    fn reschedule(&mut self, cpu: CpuId) {
        if cpu >= self.slice_end.len() || !self.sched.online().is_set(cpu) {
            return;
        }
        let now = self.now();
        let slice = self.sched.schedule(cpu, now, false);
        self.slice_end[cpu] = slice.time.map(|t| now + t);
    }

    /// Earliest pending event after the current time
    fn next_event(&self) -> Option<STime> {
        let now = self.now();
        let mut next: Option<STime> = None;
        let mut consider = |t: Option<STime>| {
            if let Some(t) = t {
                let t = t.max(now);
                next = Some(next.map_or(t, |n| n.min(t)));
            }
        };

        for cpu in 0..self.slice_end.len() {
            consider(self.sched.next_timer(cpu));
            consider(self.slice_end[cpu]);
        }
        for sv in &self.vcpus {
            let vc = sv.svc.vcpu();
            if vc.is_running() && !vc.is_blocked() && sv.run_left != STime::MAX {
                consider(Some(now + sv.run_left));
            }
            consider(sv.wake_at);
        }
        next
    }

    /// Move the clock to `to`, charging the time to whatever is running.
    fn advance_to(&mut self, to: STime) {
        let delta = to - self.now();
        if delta <= 0 {
            return;
        }
        for sv in &mut self.vcpus {
            let vc = sv.svc.vcpu();
            if vc.is_running() {
                sv.cpu_time += delta;
                self.cpu_busy[vc.processor()] += delta;
                if sv.run_left != STime::MAX && !vc.is_blocked() {
                    sv.run_left = (sv.run_left - delta).max(0);
                }
            }
        }
        self.host.set_now(to);
    }

    fn fire_events(&mut self) {
        let now = self.now();

        for cpu in 0..self.slice_end.len() {
            self.sched.run_timers(cpu, now);
        }
        self.process_softirqs();

        for cpu in 0..self.slice_end.len() {
            if matches!(self.slice_end[cpu], Some(end) if end <= now) {
                self.host.raise_schedule_softirq(&CpuMask::single(cpu));
            }
        }

        for i in 0..self.vcpus.len() {
            let (svc, workload, block, wake) = {
                let sv = &self.vcpus[i];
                let vc = sv.svc.vcpu();
                let block = vc.is_running() && !vc.is_blocked() && sv.run_left == 0;
                let wake = matches!(sv.wake_at, Some(t) if t <= now);
                (sv.svc.clone(), sv.workload, block, wake)
            };
            if block {
                if let Workload::Periodic { sleep_us, .. } = workload {
                    self.vcpus[i].wake_at = Some(now + microsecs(sleep_us));
                    self.vcpus[i].run_left = Self::burst(workload);
                }
                self.sched.vcpu_block(&svc);
            } else if wake {
                self.vcpus[i].wake_at = None;
                self.sched.vcpu_unblock(&svc);
            }
        }

        self.process_softirqs();
    }

    /// Simulate until absolute time `end`.
    pub fn run_until(&mut self, end: STime) {
        self.process_softirqs();
        while let Some(next) = self.next_event() {
            if next > end {
                break;
            }
            self.advance_to(next);
            self.fire_events();
        }
        self.advance_to(end);
    }

    pub fn run_for(&mut self, duration: STime) {
        let end = self.now() + duration;
        self.run_until(end);
    }

    /// CPU time consumed by one domain's vCPUs
    pub fn domain_cpu_time(&self, dom: DomainId) -> STime {
        self.vcpus
            .iter()
            .filter(|sv| sv.svc.domain() == Some(dom))
            .map(|sv| sv.cpu_time)
            .sum()
    }

    pub fn vcpu_cpu_time(&self, svc: &CreditVcpu) -> STime {
        self.vcpus
            .iter()
            .find(|sv| std::ptr::eq(Arc::as_ptr(&sv.svc), svc))
            .map_or(0, |sv| sv.cpu_time)
    }

    pub fn cpu_busy_time(&self, cpu: CpuId) -> STime {
        self.cpu_busy.get(cpu).copied().unwrap_or(0)
    }

    pub fn report(&self) -> SimReport {
        let elapsed = self.elapsed();
        let nr_cpus = self.slice_end.len();
        let capacity = (elapsed * nr_cpus as STime).max(1) as f64;

        let domains = self
            .domains
            .iter()
            .map(|&id| {
                let params = self.sched.domain_params(id).unwrap_or(DomainParams {
                    weight: DEFAULT_WEIGHT,
                    cap: 0,
                });
                let cpu_time = self.domain_cpu_time(id);
                DomainReport {
                    id,
                    weight: params.weight,
                    cap: params.cap,
                    vcpus: self.vcpus.iter().filter(|sv| sv.svc.domain() == Some(id)).count(),
                    cpu_time_ns: cpu_time,
                    share: cpu_time as f64 / capacity,
                }
            })
            .collect();

        SimReport {
            elapsed_ns: elapsed,
            nr_cpus,
            domains,
            cpu_busy_ns: self.cpu_busy.clone(),
            stats: self.sched.stats(),
        }
    }
}
