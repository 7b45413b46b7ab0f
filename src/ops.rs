//! Scheduler operation set
//!
//! The host's generic scheduling framework drives a scheduler only through
//! this trait. Scheduler-private per-vCPU and per-domain data are exposed
//! as associated handle types owned by the framework.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::BootParams;
use crate::error::SchedResult;
use crate::host::SchedHost;
use crate::topology::Topology;
use crate::types::{CpuId, DomainId, STime};
use crate::vcpu::Vcpu;

/// Outcome of one scheduling decision
#[derive(Debug, Clone)]
pub struct TaskSlice<T> {
    /// vCPU to run next
    pub task: T,
    /// How long to run it; `None` runs until preempted (idle vCPU)
    pub time: Option<STime>,
    /// `task` was taken from another pCPU's run queue
    pub migrated: bool,
}

/// Per-domain tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainParams {
    /// Relative share, at least 1
    pub weight: u32,
    /// Percentage of one pCPU, 0 for uncapped
    pub cap: u16,
}

/// Partial update of [`DomainParams`]; `None` leaves a field untouched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainUpdate {
    pub weight: Option<u32>,
    pub cap: Option<u16>,
}

/// Runtime-adjustable global tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalParams {
    pub tslice_ms: u32,
    pub ratelimit_us: u32,
}

pub trait SchedulerOps: Send + Sync {
    /// Scheduler-private vCPU handle
    type Vcpu: Clone;
    /// Scheduler-private domain handle
    type Domain;

    fn init(host: Arc<dyn SchedHost>, topology: Topology, params: BootParams) -> SchedResult<Self>
    where
        Self: Sized;
    fn deinit(&self);

    fn alloc_pdata(&self, cpu: CpuId) -> SchedResult<()>;
    fn free_pdata(&self, cpu: CpuId);

    fn alloc_vdata(&self, vcpu: Arc<Vcpu>) -> SchedResult<Self::Vcpu>;
    fn free_vdata(&self, svc: Self::Vcpu);

    fn alloc_domdata(&self, dom: DomainId) -> SchedResult<Self::Domain>;
    fn free_domdata(&self, dom: Self::Domain);

    fn insert_vcpu(&self, svc: &Self::Vcpu);
    fn remove_vcpu(&self, svc: &Self::Vcpu);

    fn sleep(&self, svc: &Self::Vcpu);
    fn wake(&self, svc: &Self::Vcpu);
    fn yield_vcpu(&self, svc: &Self::Vcpu);

    /// Apply `update` (if any) and return the resulting parameters
    fn adjust(&self, dom: &Self::Domain, update: Option<DomainUpdate>) -> SchedResult<DomainParams>;
    /// Apply `params` (if any) and return the resulting parameters
    fn adjust_global(&self, params: Option<GlobalParams>) -> SchedResult<GlobalParams>;

    fn pick_cpu(&self, svc: &Self::Vcpu) -> CpuId;

    fn do_schedule(&self, cpu: CpuId, now: STime, tasklet_work_scheduled: bool) -> TaskSlice<Self::Vcpu>;

    fn tick_suspend(&self, cpu: CpuId);
    fn tick_resume(&self, cpu: CpuId);

    fn dump_cpu_state(&self, cpu: CpuId) -> String;
    fn dump_settings(&self) -> String;
}
