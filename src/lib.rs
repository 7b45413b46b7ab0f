//! NVM Credit Scheduler
//!
//! Proportional-share vCPU scheduler for the NVM hypervisor. Every physical
//! CPU runs an independent decision loop over its own priority-ordered run
//! queue; a master pCPU periodically redistributes a fixed pool of credit
//! across the active guest domains in proportion to their weight.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                  Host runtime (framework / SchedHost)               │
//! │   clock • schedule softirq • timers • vCPU block/pause/migrate      │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                     SchedulerOps (ops table)                        │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                        CreditScheduler                              │
//! │  ┌────────────┐ ┌────────────┐ ┌────────────┐ ┌─────────────────┐   │
//! │  │ accounting │ │  decision  │ │ placement  │ │ work stealing   │   │
//! │  │ (master)   │ │ + ratelimit│ │ (pick_cpu) │ │ (try-lock only) │   │
//! │  └────────────┘ └────────────┘ └────────────┘ └─────────────────┘   │
//! │  ┌──────────────────────────┐  ┌─────────────────────────────────┐  │
//! │  │ per-pCPU run queue + tick│  │ global totals, idlers, master   │  │
//! │  └──────────────────────────┘  └─────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`types`]: time base and identifiers
//! - [`error`]: error type shared by every fallible operation
//! - [`cpumask`]: fixed-width CPU bitmasks
//! - [`topology`]: sibling/core grouping of host CPUs
//! - [`vcpu`]: the host-owned vCPU object the scheduler operates on
//! - [`host`]: clock and softirq primitives supplied by the host
//! - [`timer`]: one-shot timer bookkeeping
//! - [`ops`]: the scheduler operation set
//! - [`config`]: boot parameters
//! - [`scheduler`]: the credit scheduler
//! - [`sim`]: a deterministic multi-pCPU simulator

pub mod config;
pub mod cpumask;
pub mod error;
pub mod host;
pub mod ops;
pub mod scheduler;
pub mod sim;
pub mod timer;
pub mod topology;
pub mod types;
pub mod vcpu;

pub use config::BootParams;
pub use cpumask::{AtomicCpuMask, CpuMask, MAX_CPUS};
pub use error::{SchedError, SchedResult};
pub use host::SchedHost;
pub use ops::{DomainParams, DomainUpdate, GlobalParams, SchedulerOps, TaskSlice};
pub use scheduler::{CreditScheduler, CreditVcpu, Priority, SchedStats, VcpuFlags};
pub use sim::{MockHost, Simulator, Workload};
pub use timer::Timer;
pub use topology::Topology;
pub use types::{CpuId, DomainId, STime, IDLE_DOMAIN_ID};
pub use vcpu::Vcpu;
