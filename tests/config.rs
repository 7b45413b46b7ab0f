//! Boot parameter loading and sanitising

use std::io::Write;
use std::sync::Arc;

use nvm_credit::sim::MockHost;
use nvm_credit::{BootParams, CreditScheduler, SchedError, Topology};

#[test]
fn test_params_from_yaml_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "tslice_ms: 5").unwrap();
    writeln!(file, "ratelimit_us: 0").unwrap();
    writeln!(file, "smt_power_savings: true").unwrap();

    let params = BootParams::from_file(file.path()).unwrap();
    assert_eq!(params.tslice_ms, 5);
    assert_eq!(params.ratelimit_us, 0);
    assert!(params.smt_power_savings);
    // Unspecified keys keep their defaults
    assert!(params.tickle_one_idle);
    assert_eq!(params.vcpu_migration_delay_us, 1000);
}

#[test]
fn test_params_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = BootParams::from_file(dir.path().join("absent.yaml")).unwrap_err();
    assert!(matches!(err, SchedError::Config(_)));
}

#[test]
fn test_params_bad_yaml() {
    let err = BootParams::from_yaml_str("tslice_ms: [1, 2]").unwrap_err();
    assert!(matches!(err, SchedError::Config(_)));
}

#[test]
fn test_cmdline_rejects_unknown_and_malformed() {
    assert!(BootParams::from_cmdline("sched_credit_tslice_ms=abc").is_err());
    assert!(BootParams::from_cmdline("tickle_one_idle_cpu=maybe").is_err());
    assert!(BootParams::from_cmdline("sched_credit_bogus=1").is_err());
}

#[test]
fn test_cmdline_applies_on_top() {
    let mut params = BootParams::from_yaml_str("tslice_ms: 20").unwrap();
    params.apply_cmdline("sched_ratelimit_us=500 vcpu_migration_delay=0").unwrap();
    assert_eq!(params.tslice_ms, 20);
    assert_eq!(params.ratelimit_us, 500);
    assert_eq!(params.vcpu_migration_delay_us, 0);
}

#[test]
fn test_sanitize_replaces_out_of_range_values() {
    let mut params = BootParams {
        tslice_ms: 5000,
        ratelimit_us: 50,
        credit_halving_divisor: 0,
        ..Default::default()
    };
    params.sanitize();
    assert_eq!(params.tslice_ms, 30);
    assert_eq!(params.ratelimit_us, 1000);
    assert_eq!(params.credit_halving_divisor, 2);

    let mut params = BootParams {
        tslice_ms: 1,
        ratelimit_us: 5000,
        ..Default::default()
    };
    params.sanitize();
    assert_eq!(params.ratelimit_us, 1000);
}

#[test]
fn test_scheduler_starts_with_sanitized_params() {
    let params = BootParams {
        tslice_ms: 0,
        ratelimit_us: 1_000_000,
        ..Default::default()
    };
    let sched = CreditScheduler::new(Arc::new(MockHost::new()), Topology::flat(2).unwrap(), params).unwrap();
    let t = sched.tunables();
    assert_eq!(t.tslice_ms, 30);
    assert_eq!(t.ratelimit_us, 1000);
    assert_eq!(t.credits_per_tslice, 300);
}
