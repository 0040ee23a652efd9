//! Performance benchmark runner.
//!
//! A benchmark drives a named traffic pattern between hosts through the
//! [`TrafficGenerator`], summarises the per-flow samples and grades them
//! against targets. Grading never aborts the run: a missed target is a
//! `fail` result, a flow that could not run or an implausible measurement is
//! an `error` result.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapter::{AdapterError, FlowSample, FlowSpec, TrafficGenerator};
use crate::baseline::Baseline;
use crate::check::Category;
use crate::error::{FabricError, Result};
use crate::result::{CheckResult, Status};
use crate::stats::{round3, Summary};
use crate::topology::{DeviceId, Role, Topology};

/// Traffic patterns. Host lists default to every host in the topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Pattern {
    #[serde(alias = "p2p")]
    PointToPoint { src: DeviceId, dst: DeviceId },
    /// One sender, many receivers.
    #[serde(alias = "broadcast")]
    OneToMany {
        root: DeviceId,
        #[serde(default)]
        receivers: Vec<DeviceId>,
    },
    /// Each host sends to the next, the last back to the first.
    Ring {
        #[serde(default)]
        hosts: Vec<DeviceId>,
    },
    /// Every host sends to every other host.
    #[serde(alias = "allreduce")]
    AllToAll {
        #[serde(default)]
        hosts: Vec<DeviceId>,
    },
}

impl Pattern {
    pub fn kind(&self) -> &'static str {
        match self {
            Pattern::PointToPoint { .. } => "point_to_point",
            Pattern::OneToMany { .. } => "one_to_many",
            Pattern::Ring { .. } => "ring",
            Pattern::AllToAll { .. } => "all_to_all",
        }
    }

    /// Human label used as the result target.
    pub fn label(&self) -> String {
        match self {
            Pattern::PointToPoint { src, dst } => format!("{}->{}", src, dst),
            Pattern::OneToMany { root, receivers } if receivers.is_empty() => {
                format!("{}->*", root)
            }
            Pattern::OneToMany { root, receivers } => format!("{}->{}", root, receivers.len()),
            Pattern::Ring { hosts } | Pattern::AllToAll { hosts } if hosts.is_empty() => {
                format!("{}(all hosts)", self.kind())
            }
            Pattern::Ring { hosts } | Pattern::AllToAll { hosts } => {
                format!("{}({})", self.kind(), hosts.len())
            }
        }
    }

    /// Expand into (src, dst) flows, validating every endpoint is a host.
    pub fn flows(&self, topology: &Topology) -> Result<Vec<(DeviceId, DeviceId)>> {
        let all_hosts = || -> Vec<DeviceId> {
            topology
                .by_role(Role::Host)
                .into_iter()
                .map(|h| h.id.clone())
                .collect()
        };
        let or_all = |listed: &[DeviceId]| if listed.is_empty() { all_hosts() } else { listed.to_vec() };

        let flows: Vec<(DeviceId, DeviceId)> = match self {
            Pattern::PointToPoint { src, dst } => vec![(src.clone(), dst.clone())],
            Pattern::OneToMany { root, receivers } => or_all(receivers)
                .into_iter()
                .filter(|r| r != root)
                .map(|r| (root.clone(), r))
                .collect(),
            Pattern::Ring { hosts } => {
                let hosts = or_all(hosts);
                if hosts.len() < 2 {
                    Vec::new()
                } else {
                    (0..hosts.len())
                        .map(|i| (hosts[i].clone(), hosts[(i + 1) % hosts.len()].clone()))
                        .collect()
                }
            }
            Pattern::AllToAll { hosts } => {
                let hosts = or_all(hosts);
                let mut out = Vec::new();
                for src in &hosts {
                    for dst in &hosts {
                        if src != dst {
                            out.push((src.clone(), dst.clone()));
                        }
                    }
                }
                out
            }
        };

        if flows.is_empty() {
            return Err(FabricError::Parse(format!(
                "pattern {} expands to no flows",
                self.label()
            )));
        }
        for (src, dst) in &flows {
            for end in [src, dst] {
                match topology.device(end.as_str()) {
                    Some(d) if d.role == Role::Host => {}
                    Some(d) => {
                        return Err(FabricError::Parse(format!(
                            "benchmark endpoint {} is a {}, not a host",
                            end, d.role
                        )))
                    }
                    None => return Err(FabricError::UnknownDevice(end.to_string())),
                }
            }
            if src == dst {
                return Err(FabricError::Parse(format!("flow from {} to itself", src)));
            }
        }
        Ok(flows)
    }
}

/// Performance targets. Unset targets are not graded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Targets {
    #[serde(default)]
    pub min_aggregate_gbps: Option<f64>,
    #[serde(default)]
    pub min_per_flow_gbps: Option<f64>,
    #[serde(default)]
    pub max_latency_p99_ms: Option<f64>,
}

fn default_true() -> bool {
    true
}

fn default_streams() -> u32 {
    1
}

/// A named benchmark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchSpec {
    pub name: String,
    pub pattern: Pattern,
    #[serde(default)]
    pub targets: Targets,
    #[serde(default = "default_true")]
    pub blocking: bool,
    #[serde(default = "default_streams")]
    pub streams: u32,
}

impl BenchSpec {
    pub fn check_id(&self) -> String {
        format!("performance.{}", self.name)
    }
}

#[derive(Debug, Clone)]
pub struct BenchSettings {
    pub duration: Duration,
    /// Added to the flow duration to bound each traffic generator call.
    pub timeout_slack: Duration,
    pub regression_tolerance_pct: f64,
    pub regression_blocking: bool,
}

impl Default for BenchSettings {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(10),
            timeout_slack: Duration::from_secs(10),
            regression_tolerance_pct: 5.0,
            regression_blocking: false,
        }
    }
}

/// Measurements of one benchmark.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchReport {
    pub name: String,
    pub label: String,
    pub flows: usize,
    pub samples: Vec<FlowSample>,
    pub failed_flows: Vec<String>,
    pub aggregate_gbps: f64,
    pub throughput: Summary,
    pub latency: Summary,
    /// Sum of the capacities of every link any flow may use.
    pub capacity_ceiling_gbps: f64,
}

impl BenchReport {
    fn from_samples(
        spec: &BenchSpec,
        flows: usize,
        samples: Vec<FlowSample>,
        failed_flows: Vec<String>,
        capacity_ceiling_gbps: f64,
    ) -> Self {
        let throughputs: Vec<f64> = samples.iter().map(|s| s.throughput_gbps).collect();
        let latencies: Vec<f64> = samples.iter().flat_map(|s| s.latency_ms.iter().copied()).collect();
        Self {
            name: spec.name.clone(),
            label: spec.pattern.label(),
            flows,
            aggregate_gbps: round3(throughputs.iter().sum()),
            throughput: Summary::of(&throughputs),
            latency: Summary::of(&latencies),
            samples,
            failed_flows,
            capacity_ceiling_gbps,
        }
    }

    pub fn is_implausible(&self) -> bool {
        self.aggregate_gbps > self.capacity_ceiling_gbps + 1e-9
    }

    /// Metrics recorded in baselines, keyed `<name>.<metric>`.
    pub fn metrics(&self) -> BTreeMap<String, f64> {
        let key = |m: &str| format!("{}.{}", self.name, m);
        BTreeMap::from([
            (key("aggregate_gbps"), self.aggregate_gbps),
            (key("throughput_p50_gbps"), round3(self.throughput.p50)),
            (key("latency_p50_ms"), round3(self.latency.p50)),
            (key("latency_p99_ms"), round3(self.latency.p99)),
        ])
    }
}

/// Outcome of grading a report against its targets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Grade {
    pub passed: bool,
    /// Aggregate bandwidth missing to reach the target, 0 when met.
    pub shortfall_gbps: f64,
    pub per_flow_shortfall_gbps: f64,
    pub latency_excess_ms: f64,
    pub reasons: Vec<String>,
}

/// Grade a report. Shortfalls are rounded to three decimals.
pub fn grade(report: &BenchReport, targets: &Targets) -> Grade {
    let mut reasons = Vec::new();
    let mut shortfall = 0.0;
    let mut per_flow_shortfall = 0.0;
    let mut latency_excess = 0.0;

    if let Some(min) = targets.min_aggregate_gbps {
        shortfall = round3((min - report.aggregate_gbps).max(0.0));
        if shortfall > 0.0 {
            reasons.push(format!(
                "aggregate {} Gbps below target {} Gbps",
                report.aggregate_gbps, min
            ));
        }
    }
    if let Some(min) = targets.min_per_flow_gbps {
        per_flow_shortfall = round3((min - report.throughput.min).max(0.0));
        if per_flow_shortfall > 0.0 {
            reasons.push(format!(
                "slowest flow {} Gbps below target {} Gbps",
                round3(report.throughput.min),
                min
            ));
        }
    }
    if let Some(max) = targets.max_latency_p99_ms {
        if report.latency.count == 0 {
            reasons.push(format!("no latency samples to grade p99 against target {} ms", max));
        }
        latency_excess = round3((report.latency.p99 - max).max(0.0));
        if latency_excess > 0.0 {
            reasons.push(format!(
                "p99 latency {} ms above target {} ms",
                round3(report.latency.p99),
                max
            ));
        }
    }

    Grade {
        passed: reasons.is_empty(),
        shortfall_gbps: shortfall,
        per_flow_shortfall_gbps: per_flow_shortfall,
        latency_excess_ms: latency_excess,
        reasons,
    }
}

/// Runs the configured benchmarks one after another.
pub struct BenchRunner {
    generator: Arc<dyn TrafficGenerator>,
    topology: Arc<Topology>,
    specs: Vec<BenchSpec>,
    settings: BenchSettings,
    baseline: Option<Baseline>,
}

impl BenchRunner {
    pub fn new(
        generator: Arc<dyn TrafficGenerator>,
        topology: Arc<Topology>,
        specs: Vec<BenchSpec>,
        settings: BenchSettings,
    ) -> Result<Self> {
        let mut names = BTreeSet::new();
        for spec in &specs {
            if !names.insert(spec.name.as_str()) {
                return Err(FabricError::DuplicateCheck(spec.check_id()));
            }
            spec.pattern.flows(&topology)?;
        }
        Ok(Self {
            generator,
            topology,
            specs,
            settings,
            baseline: None,
        })
    }

    pub fn with_baseline(mut self, baseline: Baseline) -> Self {
        self.baseline = Some(baseline);
        self
    }

    pub fn specs(&self) -> &[BenchSpec] {
        &self.specs
    }

    /// Measure one benchmark. Flows run concurrently.
    pub async fn measure(&self, spec: &BenchSpec) -> Result<BenchReport> {
        let flows = spec.pattern.flows(&self.topology)?;
        let timeout = self.settings.duration + self.settings.timeout_slack;

        let mut path: BTreeSet<String> = BTreeSet::new();
        let mut ceiling = 0.0;
        for (src, dst) in &flows {
            for link in self.topology.path_links(src.as_str(), dst.as_str()) {
                if path.insert(link.label()) {
                    ceiling += link.capacity_gbps;
                }
            }
        }

        let runs = flows.iter().map(|(src, dst)| {
            let flow = FlowSpec {
                src: src.clone(),
                dst: dst.clone(),
                duration: self.settings.duration,
                streams: spec.streams,
            };
            async move {
                let src_dev = self
                    .topology
                    .device(flow.src.as_str())
                    .ok_or_else(|| FabricError::UnknownDevice(flow.src.to_string()))?;
                let dst_dev = self
                    .topology
                    .device(flow.dst.as_str())
                    .ok_or_else(|| FabricError::UnknownDevice(flow.dst.to_string()))?;
                let outcome = tokio::time::timeout(
                    timeout,
                    self.generator.run_flow(src_dev, dst_dev, &flow, timeout),
                )
                .await
                .unwrap_or_else(|_| {
                    Err(AdapterError::Timeout {
                        device: flow.src.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    })
                });
                Ok::<_, FabricError>((flow, outcome))
            }
        });

        let mut samples = Vec::with_capacity(flows.len());
        let mut failed = Vec::new();
        for joined in join_all(runs).await {
            let (flow, outcome) = joined?;
            match outcome {
                Ok(sample) => samples.push(sample),
                Err(e) => {
                    warn!(benchmark = %spec.name, src = %flow.src, dst = %flow.dst, error = %e, "flow failed");
                    failed.push(format!("{}->{}: {}", flow.src, flow.dst, e));
                }
            }
        }

        Ok(BenchReport::from_samples(spec, flows.len(), samples, failed, ceiling))
    }

    /// Run every benchmark and produce its results, plus a regression result
    /// where the baseline knows the benchmark.
    pub async fn run_all(&self, cancel: &CancellationToken) -> Vec<CheckResult> {
        let mut results = Vec::new();
        for spec in &self.specs {
            let id = spec.check_id();
            let label = spec.pattern.label();
            if cancel.is_cancelled() {
                results.push(
                    CheckResult::skipped(&id, Category::Performance, &label, "run cancelled")
                        .with_blocking(spec.blocking),
                );
                continue;
            }
            info!(benchmark = %spec.name, pattern = spec.pattern.kind(), "benchmark started");
            let started = tokio::time::Instant::now();
            let measured = tokio::select! {
                _ = cancel.cancelled() => None,
                r = self.measure(spec) => Some(r),
            };
            let latency_ms = started.elapsed().as_millis() as u64;

            let report = match measured {
                None => {
                    results.push(
                        CheckResult::skipped(&id, Category::Performance, &label, "run cancelled")
                            .with_blocking(spec.blocking),
                    );
                    continue;
                }
                Some(Err(e)) => {
                    results.push(
                        CheckResult::new(&id, Category::Performance, &label, Status::Error)
                            .with_blocking(spec.blocking)
                            .with_message(&e.to_string())
                            .with_latency_ms(latency_ms),
                    );
                    continue;
                }
                Some(Ok(report)) => report,
            };

            results.push(self.grade_result(spec, &report).with_latency_ms(latency_ms));
            if let Some(regression) = self.regression_result(spec, &report) {
                results.push(regression);
            }
        }
        results
    }

    fn grade_result(&self, spec: &BenchSpec, report: &BenchReport) -> CheckResult {
        let id = spec.check_id();
        let grade = grade(report, &spec.targets);
        let observed = json!({
            "pattern": spec.pattern.kind(),
            "flows": report.flows,
            "aggregate_gbps": report.aggregate_gbps,
            "throughput_gbps": report.throughput,
            "latency_ms": report.latency,
            "capacity_ceiling_gbps": report.capacity_ceiling_gbps,
            "targets": spec.targets,
            "shortfall_gbps": grade.shortfall_gbps,
            "per_flow_shortfall_gbps": grade.per_flow_shortfall_gbps,
            "latency_excess_ms": grade.latency_excess_ms,
            "failed_flows": report.failed_flows,
        });
        let base = CheckResult::new(&id, Category::Performance, &report.label, Status::Pass)
            .with_blocking(spec.blocking)
            .with_observed(observed)
            .with_attempts(1);

        if !report.failed_flows.is_empty() {
            let msg = format!("{} of {} flows failed", report.failed_flows.len(), report.flows);
            warn!(benchmark = %spec.name, "{}", msg);
            return CheckResult { status: Status::Error, ..base }.with_message(&msg);
        }
        if report.is_implausible() {
            let msg = format!(
                "implausible measurement: aggregate {} Gbps exceeds path capacity {} Gbps",
                report.aggregate_gbps, report.capacity_ceiling_gbps
            );
            warn!(benchmark = %spec.name, "{}", msg);
            return CheckResult { status: Status::Error, ..base }.with_message(&msg);
        }
        if grade.passed {
            info!(benchmark = %spec.name, aggregate_gbps = report.aggregate_gbps, "benchmark passed");
            base
        } else {
            let msg = grade.reasons.join("; ");
            warn!(benchmark = %spec.name, shortfall_gbps = grade.shortfall_gbps, "{}", msg);
            CheckResult { status: Status::Fail, ..base }.with_message(&msg)
        }
    }

    fn regression_result(&self, spec: &BenchSpec, report: &BenchReport) -> Option<CheckResult> {
        let baseline = self.baseline.as_ref()?;
        if baseline.for_pattern(&spec.name).is_empty() {
            return None;
        }
        let regressions = baseline.compare(&report.metrics(), self.settings.regression_tolerance_pct);
        let id = format!("{}.regression", spec.check_id());
        let observed = json!({
            "tolerance_pct": self.settings.regression_tolerance_pct,
            "regressions": regressions,
        });
        let result = CheckResult::new(&id, Category::Performance, &report.label, Status::Pass)
            .with_blocking(self.settings.regression_blocking)
            .with_observed(observed)
            .with_attempts(1);
        if regressions.is_empty() {
            Some(result)
        } else {
            let msg = format!("{} metrics regressed against baseline", regressions.len());
            warn!(benchmark = %spec.name, "{}", msg);
            Some(CheckResult { status: Status::Fail, ..result }.with_message(&msg))
        }
    }
}
