//! Boot-time scheduler parameters
//!
//! Parameters can come from a YAML document or from a hypervisor command
//! line (`sched_credit_tslice_ms=10 tickle_one_idle_cpu=0`). Values outside
//! their bounds are replaced by defaults when the scheduler is brought up;
//! runtime adjustments go through [`GlobalParams`](crate::ops::GlobalParams)
//! and are rejected instead.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{SchedError, SchedResult};

pub const TSLICE_MIN_MS: u32 = 1;
pub const TSLICE_MAX_MS: u32 = 1000;
pub const DEFAULT_TSLICE_MS: u32 = 30;

pub const RATELIMIT_MIN_US: u32 = 100;
pub const RATELIMIT_MAX_US: u32 = 500_000;
pub const DEFAULT_RATELIMIT_US: u32 = 1000;

pub const DEFAULT_MIGRATION_DELAY_US: u32 = 1000;
pub const DEFAULT_CREDIT_HALVING_DIVISOR: u32 = 2;

/// Scheduler parameters fixed at boot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootParams {
    /// Accounting period and nominal dispatch quantum
    pub tslice_ms: u32,
    /// Minimum run time before a runnable vCPU can be preempted; 0 disables
    pub ratelimit_us: u32,
    /// Cache-hot window during which a vCPU is not stolen
    pub vcpu_migration_delay_us: u32,
    /// Ignore yield requests
    pub default_yield: bool,
    /// Wake a single idle pCPU per tickle instead of all of them
    pub tickle_one_idle: bool,
    /// Consolidate work on busy cores instead of spreading it
    pub smt_power_savings: bool,
    /// Credit of a vCPU that stops earning is divided by this
    pub credit_halving_divisor: u32,
}

impl Default for BootParams {
    fn default() -> Self {
        Self {
            tslice_ms: DEFAULT_TSLICE_MS,
            ratelimit_us: DEFAULT_RATELIMIT_US,
            vcpu_migration_delay_us: DEFAULT_MIGRATION_DELAY_US,
            default_yield: false,
            tickle_one_idle: true,
            smt_power_savings: false,
            credit_halving_divisor: DEFAULT_CREDIT_HALVING_DIVISOR,
        }
    }
}

impl BootParams {
    pub fn from_yaml_str(content: &str) -> SchedResult<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> SchedResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| SchedError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&content)
    }

    /// Parse whitespace separated `key=value` boot options on top of the
    /// defaults. A bare boolean key (`sched_smt_power_savings`) means true.
    pub fn from_cmdline(cmdline: &str) -> SchedResult<Self> {
        let mut params = Self::default();
        params.apply_cmdline(cmdline)?;
        Ok(params)
    }

    /// Apply boot options on top of the current values
    pub fn apply_cmdline(&mut self, cmdline: &str) -> SchedResult<()> {
        for opt in cmdline.split_whitespace() {
            let (key, value) = match opt.split_once('=') {
                Some((k, v)) => (k, v),
                None => (opt, "1"),
            };
            self.set(key, value)?;
        }
        Ok(())
    }

    /// Set one option by name. Accepts both the boot option spelling and
    /// the field name.
    pub fn set(&mut self, key: &str, value: &str) -> SchedResult<()> {
        match key {
            "sched_credit_tslice_ms" | "tslice_ms" => {
                self.tslice_ms = parse_num(key, value)?;
            }
            "sched_ratelimit_us" | "ratelimit_us" => {
                self.ratelimit_us = parse_num(key, value)?;
            }
            "vcpu_migration_delay" | "vcpu_migration_delay_us" => {
                self.vcpu_migration_delay_us = parse_num(key, value)?;
            }
            "sched_credit_default_yield" | "default_yield" => {
                self.default_yield = parse_bool(key, value)?;
            }
            "tickle_one_idle_cpu" | "tickle_one_idle" => {
                self.tickle_one_idle = parse_bool(key, value)?;
            }
            "sched_smt_power_savings" | "smt_power_savings" => {
                self.smt_power_savings = parse_bool(key, value)?;
            }
            "credit_halving_divisor" => {
                self.credit_halving_divisor = parse_num(key, value)?;
            }
            _ => {
                return Err(SchedError::Config(format!("Unknown boot option: {}", key)));
            }
        }
        Ok(())
    }

    /// Replace out-of-range values with defaults, logging each substitution.
    pub fn sanitize(&mut self) {
        if !(TSLICE_MIN_MS..=TSLICE_MAX_MS).contains(&self.tslice_ms) {
            log::warn!(
                "sched_credit_tslice_ms {} outside of valid range [{},{}]; resetting to default {}",
                self.tslice_ms,
                TSLICE_MIN_MS,
                TSLICE_MAX_MS,
                DEFAULT_TSLICE_MS
            );
            self.tslice_ms = DEFAULT_TSLICE_MS;
        }

        if self.ratelimit_us != 0
            && !(RATELIMIT_MIN_US..=RATELIMIT_MAX_US).contains(&self.ratelimit_us)
        {
            log::warn!(
                "sched_ratelimit_us {} outside of valid range [{},{}]; resetting to default {}",
                self.ratelimit_us,
                RATELIMIT_MIN_US,
                RATELIMIT_MAX_US,
                DEFAULT_RATELIMIT_US
            );
            self.ratelimit_us = DEFAULT_RATELIMIT_US;
        }

        if u64::from(self.ratelimit_us) > u64::from(self.tslice_ms) * 1000 {
            log::warn!(
                "sched_ratelimit_us {} longer than the timeslice; setting to {}",
                self.ratelimit_us,
                self.tslice_ms * 1000
            );
            self.ratelimit_us = self.tslice_ms * 1000;
        }

        if self.credit_halving_divisor == 0 {
            log::warn!(
                "credit_halving_divisor 0 is invalid; resetting to {}",
                DEFAULT_CREDIT_HALVING_DIVISOR
            );
            self.credit_halving_divisor = DEFAULT_CREDIT_HALVING_DIVISOR;
        }
    }
}

fn parse_num(key: &str, value: &str) -> SchedResult<u32> {
    value
        .parse()
        .map_err(|_| SchedError::Config(format!("{}: expected a number, got '{}'", key, value)))
}

fn parse_bool(key: &str, value: &str) -> SchedResult<bool> {
    match value {
        "1" | "true" | "yes" | "on" | "enable" => Ok(true),
        "0" | "false" | "no" | "off" | "disable" => Ok(false),
        _ => Err(SchedError::Config(format!(
            "{}: expected a boolean, got '{}'",
            key, value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let params = BootParams::default();
        assert_eq!(params.tslice_ms, 30);
        assert_eq!(params.ratelimit_us, 1000);
        assert!(params.tickle_one_idle);
        assert!(!params.default_yield);
    }

    #[test]
    fn test_cmdline() {
        let params = BootParams::from_cmdline(
            "sched_credit_tslice_ms=10 sched_ratelimit_us=0 tickle_one_idle_cpu=0 sched_smt_power_savings",
        )
        .unwrap();
        assert_eq!(params.tslice_ms, 10);
        assert_eq!(params.ratelimit_us, 0);
        assert!(!params.tickle_one_idle);
        assert!(params.smt_power_savings);
    }

    #[test]
    fn test_cmdline_rejects_garbage() {
        assert!(matches!(
            BootParams::from_cmdline("sched_credit_tslice_ms=abc"),
            Err(SchedError::Config(_))
        ));
        assert!(matches!(
            BootParams::from_cmdline("no_such_option=1"),
            Err(SchedError::Config(_))
        ));
    }

    #[test]
    fn test_yaml_partial() {
        let params = BootParams::from_yaml_str("tslice_ms: 5\nvcpu_migration_delay_us: 0\n").unwrap();
        assert_eq!(params.tslice_ms, 5);
        assert_eq!(params.vcpu_migration_delay_us, 0);
        assert_eq!(params.ratelimit_us, DEFAULT_RATELIMIT_US);
    }

    #[test]
    fn test_sanitize_substitutes_defaults() {
        let mut params = BootParams {
            tslice_ms: 5000,
            ratelimit_us: 50,
            credit_halving_divisor: 0,
            ..Default::default()
        };
        params.sanitize();
        assert_eq!(params.tslice_ms, DEFAULT_TSLICE_MS);
        assert_eq!(params.ratelimit_us, DEFAULT_RATELIMIT_US);
        assert_eq!(params.credit_halving_divisor, DEFAULT_CREDIT_HALVING_DIVISOR);
    }

    #[test]
    fn test_sanitize_clamps_ratelimit_to_tslice() {
        let mut params = BootParams {
            tslice_ms: 1,
            ratelimit_us: 5000,
            ..Default::default()
        };
        params.sanitize();
        assert_eq!(params.ratelimit_us, 1000);
    }
}
