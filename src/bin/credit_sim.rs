//! credit-sim - run a credit scheduler scenario in virtual time
//!
//! Usage: credit-sim [OPTIONS] <SCENARIO.yaml>

use std::process::ExitCode;

use anyhow::{bail, Context, Result};

use nvm_credit::sim::{Scenario, Simulator};
use nvm_credit::types::{millisecs, NSEC_PER_MSEC};

#[derive(Debug, Default)]
struct Options {
    scenario: String,
    json: bool,
    dump: bool,
    duration_ms: Option<u64>,
    cmdline: Option<String>,
}

fn print_usage() {
    eprintln!("credit-sim {}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    credit-sim [OPTIONS] <SCENARIO.yaml>");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -j, --json              Print the report as JSON");
    eprintln!("    -d, --dump              Dump scheduler state at the end");
    eprintln!("    -t, --duration <MS>     Override the scenario duration");
    eprintln!("    -p, --params <CMDLINE>  Override boot parameters, e.g. \"sched_credit_tslice_ms=10\"");
    eprintln!("    -h, --help              Print help");
    eprintln!("    -V, --version           Print version");
}

/// `Ok(None)` means help or version was printed
fn parse_args(args: &[String]) -> Result<Option<Options>> {
    let mut opts = Options::default();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage();
                return Ok(None);
            }
            "-V" | "--version" => {
                println!("credit-sim {}", env!("CARGO_PKG_VERSION"));
                return Ok(None);
            }
            "-j" | "--json" => opts.json = true,
            "-d" | "--dump" => opts.dump = true,
            "-t" | "--duration" => {
                i += 1;
                let value = args.get(i).context("--duration needs a value")?;
                opts.duration_ms = Some(value.parse().with_context(|| format!("bad duration '{}'", value))?);
            }
            "-p" | "--params" => {
                i += 1;
                opts.cmdline = Some(args.get(i).context("--params needs a value")?.clone());
            }
            arg if arg.starts_with('-') => bail!("unknown option: {}", arg),
            arg => {
                if !opts.scenario.is_empty() {
                    bail!("more than one scenario given");
                }
                opts.scenario = arg.to_string();
            }
        }
        i += 1;
    }

    if opts.scenario.is_empty() {
        print_usage();
        bail!("no scenario given");
    }
    Ok(Some(opts))
}

fn run(opts: Options) -> Result<()> {
    let mut scenario = Scenario::from_file(&opts.scenario)
        .with_context(|| format!("loading scenario {}", opts.scenario))?;
    if let Some(cmdline) = &opts.cmdline {
        scenario.params.apply_cmdline(cmdline)?;
    }
    if let Some(duration_ms) = opts.duration_ms {
        scenario.duration_ms = duration_ms;
    }

    log::info!(
        "running {} for {}ms with {} domains",
        opts.scenario,
        scenario.duration_ms,
        scenario.domains.len()
    );

    let mut sim = Simulator::from_scenario(&scenario).context("building simulation")?;
    sim.run_for(millisecs(scenario.duration_ms));
    let report = sim.report();

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "{} pCPUs, {} ms simulated",
            report.nr_cpus,
            report.elapsed_ns / NSEC_PER_MSEC
        );
        println!("{:>6} {:>7} {:>4} {:>6} {:>12} {:>7}", "domain", "weight", "cap", "vcpus", "cpu ms", "share");
        for dom in &report.domains {
            println!(
                "{:>6} {:>7} {:>4} {:>6} {:>12.3} {:>6.1}%",
                dom.id,
                dom.weight,
                dom.cap,
                dom.vcpus,
                dom.cpu_time_ns as f64 / NSEC_PER_MSEC as f64,
                dom.share * 100.0
            );
        }
        for (cpu, busy) in report.cpu_busy_ns.iter().enumerate() {
            println!("cpu{:<3} busy {:>10.3} ms", cpu, *busy as f64 / NSEC_PER_MSEC as f64);
        }
    }

    if opts.dump {
        let sched = sim.scheduler();
        println!("{}", sched.dump());
        for cpu in sched.online().iter() {
            print!("{}", sched.dump_pcpu(cpu));
        }
    }
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    let opts = match parse_args(&args) {
        Ok(Some(opts)) => opts,
        Ok(None) => return ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::from(2);
        }
    };

    match run(opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
