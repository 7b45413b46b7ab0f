//! Driving the scheduler through the generic operation set only

use std::sync::Arc;

use nvm_credit::sim::MockHost;
use nvm_credit::types::millisecs;
use nvm_credit::{
    BootParams, CpuMask, CreditScheduler, DomainParams, DomainUpdate, GlobalParams, SchedError, SchedHost,
    SchedulerOps, Topology, Vcpu,
};

fn bring_up<S: SchedulerOps>(host: Arc<MockHost>, nr_cpus: usize) -> S {
    let sched = S::init(host, Topology::flat(nr_cpus).unwrap(), BootParams::default()).unwrap();
    for cpu in 0..nr_cpus {
        sched.alloc_pdata(cpu).unwrap();
    }
    sched
}

/// Create a domain with one vCPU per pCPU, all woken
fn start_domain<S: SchedulerOps>(sched: &S, dom: u16, nr_vcpus: u32) -> (S::Domain, Vec<S::Vcpu>) {
    let handle = sched.alloc_domdata(dom).unwrap();
    let vcpus = (0..nr_vcpus)
        .map(|id| {
            let vcpu = Arc::new(Vcpu::new(dom, id, 0));
            let svc = sched.alloc_vdata(vcpu).unwrap();
            sched.insert_vcpu(&svc);
            svc
        })
        .collect();
    (handle, vcpus)
}

#[test]
fn test_lifecycle_through_ops() {
    let host = Arc::new(MockHost::starting_at(millisecs(1000)));
    let sched: CreditScheduler = bring_up(host.clone(), 2);
    let (dom, vcpus) = start_domain(&sched, 3, 2);

    assert_eq!(
        sched.adjust(&dom, None).unwrap(),
        DomainParams {
            weight: 256,
            cap: 0
        }
    );
    let updated = sched
        .adjust(
            &dom,
            Some(DomainUpdate {
                weight: Some(100),
                cap: Some(10),
            }),
        )
        .unwrap();
    assert_eq!(updated, DomainParams { weight: 100, cap: 10 });

    // Both vCPUs were queued on pCPU 0
    let slice = sched.do_schedule(0, host.now(), false);
    assert!(Arc::ptr_eq(&slice.task, &vcpus[0]));
    assert_eq!(slice.time, Some(millisecs(30)));

    // pCPU 1 is idle and steals the other one
    let slice = sched.do_schedule(1, host.now(), false);
    assert!(Arc::ptr_eq(&slice.task, &vcpus[1]));
    assert!(slice.migrated);

    sched.sleep(&vcpus[0]);
    assert!(host.take_pending().is_set(0));

    for svc in vcpus {
        svc.vcpu().set_blocked(true);
        sched.sleep(&svc);
        host.take_pending();
    }
    sched.do_schedule(0, host.now() + millisecs(2), false);
    sched.do_schedule(1, host.now() + millisecs(2), false);

    sched.deinit();
    assert_eq!(sched.master_timer_expiry(), None);
}

#[test]
fn test_pick_cpu_honours_affinity() {
    let host = Arc::new(MockHost::new());
    let sched: CreditScheduler = bring_up(host, 4);
    sched.alloc_domdata(1).unwrap();
    let vcpu = Arc::new(Vcpu::new(1, 0, 0).with_affinity(CpuMask::from_cpus([2, 3])));
    let svc = sched.alloc_vdata(vcpu).unwrap();
    let cpu = sched.pick_cpu(&svc);
    assert!(cpu == 2 || cpu == 3, "picked {}", cpu);
}

#[test]
fn test_adjust_global_through_ops() {
    let host = Arc::new(MockHost::new());
    let sched: CreditScheduler = bring_up(host, 1);

    let current = sched.adjust_global(None).unwrap();
    assert_eq!(
        current,
        GlobalParams {
            tslice_ms: 30,
            ratelimit_us: 1000
        }
    );

    let err = sched
        .adjust_global(Some(GlobalParams {
            tslice_ms: 2000,
            ratelimit_us: 1000,
        }))
        .unwrap_err();
    assert!(matches!(err, SchedError::InvalidArgument(_)));
    assert_eq!(sched.adjust_global(None).unwrap(), current);

    let applied = sched
        .adjust_global(Some(GlobalParams {
            tslice_ms: 5,
            ratelimit_us: 0,
        }))
        .unwrap();
    assert_eq!(applied.tslice_ms, 5);
    assert_eq!(applied.ratelimit_us, 0);
    assert!(sched.dump_settings().contains("tslice             = 5ms"));
}

#[test]
fn test_tick_suspend_and_resume() {
    let host = Arc::new(MockHost::starting_at(millisecs(1000)));
    let sched: CreditScheduler = bring_up(host.clone(), 1);
    assert!(sched.tick_timer_expiry(0).is_some());

    sched.tick_suspend(0);
    assert_eq!(sched.tick_timer_expiry(0), None);

    host.advance(millisecs(7));
    sched.tick_resume(0);
    assert_eq!(sched.tick_timer_expiry(0), Some(millisecs(1010)));
    assert!(sched.dump_cpu_state(0).contains("run: [IDLE.0]"));
}
