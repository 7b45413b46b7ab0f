//! End-to-end scheduling behaviour in simulated time

use std::io::Write;

use nvm_credit::ops::DomainParams;
use nvm_credit::sim::{Scenario, Simulator, Workload};
use nvm_credit::types::millisecs;
use nvm_credit::{BootParams, CpuMask, Topology};

fn sim(nr_cpus: usize) -> Simulator {
    Simulator::new(Topology::flat(nr_cpus).unwrap(), BootParams::default()).unwrap()
}

fn params(weight: u32, cap: u16) -> DomainParams {
    DomainParams { weight, cap }
}

/// Run two CPU-bound domains with weights 512 and 256 for 30 simulated
/// seconds and return how much more CPU the heavier one got.
fn weight_ratio(nr_cpus: usize, vcpus_each: u32) -> f64 {
    let mut sim = sim(nr_cpus);
    sim.add_domain(1, params(512, 0)).unwrap();
    sim.add_domain(2, params(256, 0)).unwrap();
    for id in 0..vcpus_each {
        sim.add_vcpu(1, id, id as usize % nr_cpus, Workload::CpuBound).unwrap();
        sim.add_vcpu(2, id, id as usize % nr_cpus, Workload::CpuBound).unwrap();
    }

    let duration = millisecs(30_000);
    sim.run_for(duration);

    let a = sim.domain_cpu_time(1);
    let b = sim.domain_cpu_time(2);
    assert!(b > 0, "weight 256 starved");
    assert_eq!(a + b, duration * nr_cpus as i64);
    a as f64 / b as f64
}

#[test]
fn test_heavier_domain_gets_more_cpu() {
    let ratio = weight_ratio(1, 1);
    assert!((ratio - 2.0).abs() < 0.1, "weights 2:1 gave cpu ratio {:.3}", ratio);
}

#[test]
fn test_weight_ratio_holds_across_pcpus() {
    let ratio = weight_ratio(2, 2);
    assert!((ratio - 2.0).abs() < 0.1, "weights 2:1 on 2 pcpus gave cpu ratio {:.3}", ratio);
}

#[test]
fn test_cap_limits_share() {
    let mut sim = sim(1);
    sim.add_domain(1, params(256, 50)).unwrap();
    sim.add_vcpu(1, 0, 0, Workload::CpuBound).unwrap();

    sim.run_for(millisecs(3000));

    let share = sim.domain_cpu_time(1) as f64 / millisecs(3000) as f64;
    assert!(share > 0.3 && share < 0.75, "capped domain got {:.2}", share);
    let stats = sim.scheduler().stats();
    assert!(stats.vcpu_park > 0);
    assert!(stats.vcpu_unpark > 0);
}

#[test]
fn test_waking_vcpu_preempts_cpu_hog() {
    let mut sim = sim(1);
    sim.add_domain(1, params(256, 0)).unwrap();
    sim.add_domain(2, params(256, 0)).unwrap();
    sim.add_vcpu(1, 0, 0, Workload::CpuBound).unwrap();
    sim.add_vcpu(
        2,
        0,
        0,
        Workload::Periodic {
            run_us: 1000,
            sleep_us: 9000,
        },
    )
    .unwrap();

    sim.run_for(millisecs(1000));

    // Asks for 10%; boost keeps wake-up latency within the rate limit
    let io = sim.domain_cpu_time(2);
    assert!(io >= millisecs(70), "periodic vcpu only got {}ns", io);
    assert_eq!(sim.cpu_busy_time(0), millisecs(1000));
}

#[test]
fn test_idle_pcpu_pulls_queued_work() {
    let mut sim = sim(2);
    sim.add_domain(1, params(256, 0)).unwrap();
    let a = sim.add_vcpu(1, 0, 0, Workload::CpuBound).unwrap();
    let b = sim.add_vcpu(1, 1, 0, Workload::CpuBound).unwrap();

    assert_eq!(a.vcpu().processor(), 0);
    assert_eq!(b.vcpu().processor(), 1);
    assert!(sim.scheduler().stats().migrate_queued >= 1);

    sim.run_for(millisecs(300));
    assert_eq!(sim.cpu_busy_time(0), millisecs(300));
    assert_eq!(sim.cpu_busy_time(1), millisecs(300));
}

#[test]
fn test_pinned_vcpu_stays_put() {
    let mut sim = sim(2);
    sim.add_domain(1, params(256, 0)).unwrap();
    sim.add_domain(2, params(256, 0)).unwrap();
    let pinned = sim
        .add_vcpu_on(1, 0, 1, CpuMask::single(1), Workload::CpuBound)
        .unwrap();
    sim.add_vcpu(2, 0, 0, Workload::CpuBound).unwrap();
    sim.add_vcpu(2, 1, 0, Workload::CpuBound).unwrap();

    sim.run_for(millisecs(600));

    assert_eq!(pinned.vcpu().processor(), 1);
    assert!(sim.vcpu_cpu_time(&pinned) > 0);
    assert_eq!(
        sim.cpu_busy_time(0) + sim.cpu_busy_time(1),
        sim.domain_cpu_time(1) + sim.domain_cpu_time(2)
    );
}

#[test]
fn test_scenario_file_report() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        "params:\n  tslice_ms: 10\ntopology:\n  sockets: 1\n  cores_per_socket: 2\n  threads_per_core: 1\nduration_ms: 200\ndomains:\n  - id: 1\n    weight: 512\n    vcpus: 2\n  - id: 2\n    cap: 25\n"
    )
    .unwrap();

    let scenario = Scenario::from_file(file.path()).unwrap();
    assert_eq!(scenario.params.tslice_ms, 10);
    assert_eq!(scenario.domains.len(), 2);

    let mut sim = Simulator::from_scenario(&scenario).unwrap();
    assert_eq!(sim.scheduler().tunables().credits_per_tslice, 100);
    sim.run_for(millisecs(scenario.duration_ms));

    let report = sim.report();
    assert_eq!(report.nr_cpus, 2);
    assert_eq!(report.elapsed_ns, millisecs(200));
    assert_eq!(report.domains[0].vcpus, 2);
    assert_eq!(report.domains[1].cap, 25);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["domains"][0]["weight"], 512);
    assert!(json["stats"]["schedule"].as_u64().unwrap() > 0);
}

#[test]
fn test_scenario_rejects_unreachable_affinity() {
    let scenario = Scenario::from_yaml_str(
        "topology: { sockets: 1, cores_per_socket: 2, threads_per_core: 1 }\nduration_ms: 10\ndomains:\n  - id: 1\n    affinity: [5]\n",
    )
    .unwrap();
    assert!(Simulator::from_scenario(&scenario).is_err());
}
