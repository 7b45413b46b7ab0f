//! Host CPU topology
//!
//! The placement heuristic only needs two groupings per CPU: its thread
//! siblings (same core) and its core siblings (same socket).

use serde::{Deserialize, Serialize};

use crate::cpumask::{CpuMask, MAX_CPUS};
use crate::error::{SchedError, SchedResult};
use crate::types::CpuId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    nr_cpus: usize,
    sibling: Vec<CpuMask>,
    core: Vec<CpuMask>,
}

/// Serializable description used by scenario files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySpec {
    pub sockets: usize,
    pub cores_per_socket: usize,
    pub threads_per_core: usize,
}

impl Default for TopologySpec {
    fn default() -> Self {
        Self {
            sockets: 1,
            cores_per_socket: 2,
            threads_per_core: 1,
        }
    }
}

impl Topology {
    /// `nr_cpus` single-threaded cores on one socket
    pub fn flat(nr_cpus: usize) -> SchedResult<Self> {
        Self::smt(1, nr_cpus, 1)
    }

    /// CPUs are numbered socket-major, then core, then thread.
    pub fn smt(sockets: usize, cores_per_socket: usize, threads_per_core: usize) -> SchedResult<Self> {
        let nr_cpus = sockets * cores_per_socket * threads_per_core;
        if nr_cpus == 0 || nr_cpus > MAX_CPUS {
            return Err(SchedError::InvalidArgument(format!(
                "topology with {} cpus (valid: 1..={})",
                nr_cpus, MAX_CPUS
            )));
        }

        let per_socket = cores_per_socket * threads_per_core;
        let mut sibling = Vec::with_capacity(nr_cpus);
        let mut core = Vec::with_capacity(nr_cpus);
        for cpu in 0..nr_cpus {
            let core_base = cpu - cpu % threads_per_core;
            let socket_base = cpu - cpu % per_socket;
            sibling.push(CpuMask::from_cpus(core_base..core_base + threads_per_core));
            core.push(CpuMask::from_cpus(socket_base..socket_base + per_socket));
        }

        Ok(Self {
            nr_cpus,
            sibling,
            core,
        })
    }

    pub fn from_spec(spec: &TopologySpec) -> SchedResult<Self> {
        Self::smt(spec.sockets, spec.cores_per_socket, spec.threads_per_core)
    }

    /// Flat topology sized to the machine running the process
    pub fn host() -> SchedResult<Self> {
        Self::flat(num_cpus::get().min(MAX_CPUS))
    }

    pub fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    pub fn all_cpus(&self) -> CpuMask {
        CpuMask::first_n(self.nr_cpus)
    }

    /// Threads sharing a core with `cpu`, including `cpu`
    pub fn sibling_mask(&self, cpu: CpuId) -> CpuMask {
        self.sibling.get(cpu).copied().unwrap_or_else(|| CpuMask::single(cpu))
    }

    /// CPUs sharing a socket with `cpu`, including `cpu`
    pub fn core_mask(&self, cpu: CpuId) -> CpuMask {
        self.core.get(cpu).copied().unwrap_or_else(|| CpuMask::single(cpu))
    }
}
