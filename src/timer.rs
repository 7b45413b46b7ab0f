//! One-shot timers
//!
//! A timer belongs to a pCPU and holds at most one pending expiry. The host
//! runtime fires due timers through
//! [`CreditScheduler::run_timers`](crate::scheduler::CreditScheduler::run_timers);
//! handlers re-arm themselves.

use parking_lot::Mutex;

use crate::types::{CpuId, STime};

#[derive(Debug, Clone, Copy)]
struct TimerState {
    cpu: CpuId,
    expires: Option<STime>,
    killed: bool,
}

#[derive(Debug)]
pub struct Timer {
    state: Mutex<TimerState>,
}

impl Timer {
    pub fn new(cpu: CpuId) -> Self {
        Self {
            state: Mutex::new(TimerState {
                cpu,
                expires: None,
                killed: false,
            }),
        }
    }

    /// Arm (or re-arm) the timer. Ignored once killed.
    pub fn set(&self, expires: STime) {
        let mut state = self.state.lock();
        if !state.killed {
            state.expires = Some(expires);
        }
    }

    pub fn stop(&self) {
        self.state.lock().expires = None;
    }

    /// Disarm permanently
    pub fn kill(&self) {
        let mut state = self.state.lock();
        state.expires = None;
        state.killed = true;
    }

    /// Move to another pCPU, keeping any pending expiry
    pub fn migrate(&self, cpu: CpuId) {
        self.state.lock().cpu = cpu;
    }

    pub fn cpu(&self) -> CpuId {
        self.state.lock().cpu
    }

    pub fn expires(&self) -> Option<STime> {
        self.state.lock().expires
    }

    /// Pending expiry if the timer lives on `cpu`
    pub fn expires_on(&self, cpu: CpuId) -> Option<STime> {
        let state = self.state.lock();
        if state.cpu == cpu {
            state.expires
        } else {
            None
        }
    }

    pub fn is_killed(&self) -> bool {
        self.state.lock().killed
    }

    /// Disarm and return true if the timer lives on `cpu` and is due at `now`.
    pub fn take_due(&self, cpu: CpuId, now: STime) -> bool {
        let mut state = self.state.lock();
        match state.expires {
            Some(t) if state.cpu == cpu && t <= now => {
                state.expires = None;
                true
            }
            _ => false,
        }
    }
}
