//! Assembles a run from the topology file, configuration and flags, drives
//! it to completion and writes the reports.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use fabval_core::{
    write_reports, Baseline, BenchRunner, CheckRegistry, DeviceAdapter, Orchestrator, RunSummary,
    SimFabric, TestRun, Topology, TrafficGenerator,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::{Cli, Command, RunArgs};
use crate::config::{RunnerConfig, ScenarioConfig};
use crate::ssh::{IperfGenerator, SshAdapter};

pub const EXIT_PASSED: u8 = 0;
pub const EXIT_FAILED: u8 = 1;
/// The run could not start: bad topology, config or scenario.
pub const EXIT_SETUP: u8 = 2;
pub const EXIT_CANCELLED: u8 = 130;

pub fn exit_code(run: &TestRun) -> u8 {
    if run.cancelled {
        EXIT_CANCELLED
    } else if run.passed() {
        EXIT_PASSED
    } else {
        EXIT_FAILED
    }
}

/// Load the config file (if any) and apply command-line overrides.
pub fn load_config(args: &RunArgs) -> anyhow::Result<RunnerConfig> {
    let mut config = match &args.config {
        Some(path) => RunnerConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RunnerConfig::default(),
    };
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if let Some(secs) = args.bench_duration {
        config.bench_duration_secs = secs;
    }
    if let Some(dir) = &args.output {
        config.report_dir = dir.clone();
    }
    if !args.scenarios.is_empty() {
        config.scenarios = args
            .scenarios
            .iter()
            .cloned()
            .map(ScenarioConfig::Shorthand)
            .collect();
    }
    Ok(config)
}

/// Build the orchestrator for `args`, wired to `cancel`.
pub fn build(
    args: &RunArgs,
    config: &RunnerConfig,
    cancel: CancellationToken,
) -> anyhow::Result<Orchestrator> {
    let topology = Arc::new(
        Topology::from_file(&args.topology)
            .with_context(|| format!("loading topology {}", args.topology.display()))?,
    );
    info!(topology = %topology.summary(), "topology loaded");

    let (adapter, generator): (Arc<dyn DeviceAdapter>, Arc<dyn TrafficGenerator>) = if args.simulate {
        let sim = Arc::new(SimFabric::new(topology.clone()));
        let adapter: Arc<dyn DeviceAdapter> = sim.clone();
        let generator: Arc<dyn TrafficGenerator> = sim;
        (adapter, generator)
    } else {
        (
            Arc::new(SshAdapter::new(config.ssh.clone())),
            Arc::new(IperfGenerator::new(config.ssh.clone())),
        )
    };

    let registry = CheckRegistry::standard(&config.check_defaults());
    let mut orchestrator = Orchestrator::new(
        topology.clone(),
        adapter,
        registry,
        config.orchestrator_config(&args.categories),
    )?
    .with_cancellation(cancel);

    if !config.benchmarks.is_empty() {
        let mut bench = BenchRunner::new(
            generator,
            topology,
            config.benchmarks.clone(),
            config.bench_settings(),
        )
        .context("configuring benchmarks")?;
        if let Some(path) = &config.baseline {
            let baseline = Baseline::from_file(path)
                .with_context(|| format!("loading baseline {}", path.display()))?;
            bench = bench.with_baseline(baseline);
        }
        orchestrator = orchestrator.with_benchmarks(bench);
    }

    let scenarios = config.failure_scenarios().context("parsing failure scenarios")?;
    if !scenarios.is_empty() {
        orchestrator = orchestrator
            .with_scenarios(scenarios)
            .context("validating failure scenarios")?;
    }
    Ok(orchestrator)
}

#[derive(Debug)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub reports: Vec<PathBuf>,
    pub exit_code: u8,
}

/// Execute one validation run. Setup problems come back as errors; check
/// failures are reported through the outcome.
pub async fn run(args: &RunArgs, cancel: CancellationToken) -> anyhow::Result<RunOutcome> {
    let config = load_config(args)?;
    let orchestrator = build(args, &config, cancel)?;

    let run = orchestrator.run().await?;
    let summary = RunSummary::of(&run);
    let reports = write_reports(&summary, &config.report_dir, &args.format)
        .with_context(|| format!("writing reports to {}", config.report_dir.display()))?;

    Ok(RunOutcome {
        exit_code: exit_code(&run),
        summary,
        reports,
    })
}

/// Dispatch a parsed command line, returning the process exit code.
pub async fn dispatch(cli: &Cli) -> anyhow::Result<u8> {
    match &cli.command {
        Command::Run(args) => {
            let cancel = CancellationToken::new();
            let interrupt = {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        warn!("interrupt received, cancelling run");
                        cancel.cancel();
                    }
                })
            };
            let outcome = run(args, cancel).await;
            interrupt.abort();
            let outcome = outcome?;

            print!("{}", outcome.summary.to_text());
            for path in &outcome.reports {
                println!("report: {}", path.display());
            }
            Ok(outcome.exit_code)
        }
        Command::ValidateTopology { topology } => {
            let topology = Topology::from_file(topology)
                .with_context(|| format!("loading topology {}", topology.display()))?;
            println!("{}", topology.summary());
            for segment in topology.segments() {
                let hosts: Vec<String> = topology
                    .hosts_in_segment(segment)
                    .iter()
                    .map(|h| h.id.to_string())
                    .collect();
                println!("  segment {}: {}", segment, hosts.join(", "));
            }
            Ok(EXIT_PASSED)
        }
        Command::ListChecks { category } => {
            let registry = CheckRegistry::standard(&RunnerConfig::default().check_defaults());
            for def in registry.checks() {
                if let Some(wanted) = category {
                    if *wanted != def.category {
                        continue;
                    }
                }
                println!(
                    "{:<32} {:<12} {:<9} {}",
                    def.id,
                    def.category.as_str(),
                    if def.blocking { "blocking" } else { "advisory" },
                    def.description
                );
            }
            Ok(EXIT_PASSED)
        }
    }
}
