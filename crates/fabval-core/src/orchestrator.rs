//! Test orchestrator.
//!
//! Categories run strictly in order. Within a category every device gets one
//! worker that executes its checks sequentially, so a device never sees two
//! commands at once; workers for different devices run concurrently, bounded
//! by a semaphore. A blocking failure records every later category as
//! skipped.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::{AdapterError, Command, CommandOutput, DeviceAdapter};
use crate::bench::BenchRunner;
use crate::check::{Category, CheckContext, CheckDef, FaultView, ProbeSettings, Verdict};
use crate::error::{FabricError, Result};
use crate::injector::{FailureInjector, FailureScenario, InjectorSettings};
use crate::registry::CheckRegistry;
use crate::result::{CheckResult, ResultCollector, ResultSink, Status, TestRun};
use crate::retry::{RetryExecutor, RetryOutcome};
use crate::topology::{Device, DeviceId, Topology};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Upper bound on concurrently active device workers.
    pub concurrency: usize,
    pub categories: BTreeSet<Category>,
    pub probe: ProbeSettings,
    pub injector: InjectorSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            categories: Category::ALL.into_iter().collect(),
            probe: ProbeSettings::default(),
            injector: InjectorSettings::default(),
        }
    }
}

/// Executes check plans against devices through the adapter.
#[derive(Clone)]
pub struct CheckExecutor {
    adapter: Arc<dyn DeviceAdapter>,
    topology: Arc<Topology>,
    settings: Arc<ProbeSettings>,
    concurrency: usize,
    cancel: CancellationToken,
}

impl CheckExecutor {
    pub fn new(
        adapter: Arc<dyn DeviceAdapter>,
        topology: Arc<Topology>,
        settings: ProbeSettings,
        concurrency: usize,
        cancel: CancellationToken,
    ) -> Result<Self> {
        if concurrency == 0 {
            return Err(FabricError::WorkerPool(
                "concurrency must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            adapter,
            topology,
            settings: Arc::new(settings),
            concurrency,
            cancel,
        })
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn adapter(&self) -> &Arc<dyn DeviceAdapter> {
        &self.adapter
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// One adapter call bounded by `timeout`.
    pub async fn call(
        &self,
        device: &Device,
        command: &Command,
        timeout: Duration,
    ) -> std::result::Result<CommandOutput, AdapterError> {
        match tokio::time::timeout(timeout, self.adapter.execute(device, command, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::Timeout {
                device: device.id.clone(),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Run `plan` and record one result per unit into `collector`.
    pub async fn execute(
        &self,
        plan: Vec<(CheckDef, Device)>,
        faults: Arc<FaultView>,
        collector: &mut ResultCollector,
    ) -> Result<()> {
        if plan.is_empty() {
            return Ok(());
        }
        let rank: HashMap<(String, String), usize> = plan
            .iter()
            .enumerate()
            .map(|(i, (def, device))| ((def.id.clone(), device.id.to_string()), i))
            .collect();
        let mut per_device: BTreeMap<DeviceId, (Device, Vec<CheckDef>)> = BTreeMap::new();
        for (def, device) in plan {
            per_device
                .entry(device.id.clone())
                .or_insert_with(|| (device, Vec::new()))
                .1
                .push(def);
        }

        collector.sync();
        let start = collector.len();
        let sink = collector.sink();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut workers = JoinSet::new();

        for (device, checks) in per_device.values() {
            let worker = DeviceWorker {
                executor: self.clone(),
                faults: faults.clone(),
                sink: sink.clone(),
                device: device.clone(),
                checks: checks.clone(),
            };
            let permits = semaphore.clone();
            workers.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| FabricError::WorkerPool(e.to_string()))?;
                worker.run().await;
                Ok::<(), FabricError>(())
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    workers.abort_all();
                    return Err(e);
                }
                Err(e) if e.is_panic() => {
                    error!(error = %e, "device worker panicked");
                }
                Err(e) => return Err(FabricError::WorkerPool(e.to_string())),
            }
        }

        // A panicked worker leaves units without results; record them.
        collector.sync();
        let recorded: BTreeSet<(String, String)> = collector.results()[start..]
            .iter()
            .map(|r| (r.check_id.clone(), r.target.clone()))
            .collect();
        for (id, (_, checks)) in &per_device {
            for def in checks {
                if !recorded.contains(&(def.id.clone(), id.to_string())) {
                    collector.push(
                        CheckResult::new(&def.id, def.category, id.as_str(), Status::Error)
                            .with_blocking(def.blocking)
                            .with_message("worker terminated before recording a result"),
                    );
                }
            }
        }
        collector.sort_from(start, |r| {
            rank.get(&(r.check_id.clone(), r.target.clone()))
                .copied()
                .unwrap_or(usize::MAX)
        });
        Ok(())
    }

    /// Run `plan` into a private collector and return its results.
    pub async fn probe(&self, plan: Vec<(CheckDef, Device)>, faults: Arc<FaultView>) -> Result<Vec<CheckResult>> {
        let mut collector = ResultCollector::new();
        self.execute(plan, faults, &mut collector).await?;
        Ok(collector.into_results())
    }

    async fn run_check(&self, def: &CheckDef, device: &Device, faults: &FaultView) -> CheckResult {
        let started = Instant::now();
        let ctx = CheckContext {
            topology: &self.topology,
            faults,
            settings: &self.settings,
        };
        let target = device.id.as_str();
        let commands = def.probe.commands(device, &ctx);
        let retry = RetryExecutor::new(def.retry.clone());
        let mut outputs = Vec::with_capacity(commands.len());
        let mut attempts = 1;

        for command in &commands {
            if self.cancel.is_cancelled() {
                return CheckResult::skipped(&def.id, def.category, target, "run cancelled")
                    .with_blocking(def.blocking);
            }
            match retry
                .execute(&self.cancel, || self.call(device, command, def.timeout))
                .await
            {
                RetryOutcome::Success { value, attempts: n } => {
                    attempts = attempts.max(n);
                    outputs.push(value);
                }
                RetryOutcome::Exhausted { last_error, attempts: n } => {
                    return self.adapter_failure(def, device, last_error, attempts.max(n), started);
                }
                RetryOutcome::Cancelled { attempts: n } => {
                    return CheckResult::skipped(&def.id, def.category, target, "run cancelled")
                        .with_blocking(def.blocking)
                        .with_attempts(n);
                }
            }
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        let base = CheckResult::new(&def.id, def.category, target, Status::Pass)
            .with_blocking(def.blocking)
            .with_attempts(attempts)
            .with_latency_ms(latency_ms);
        match def.probe.assess(device, &outputs, &ctx) {
            Ok(Verdict::Pass { observed }) => {
                debug!(check = %def.id, device = target, "pass");
                base.with_observed(observed)
            }
            Ok(Verdict::Mismatch { observed, reason }) => {
                warn!(check = %def.id, device = target, reason = %reason, "check failed");
                CheckResult {
                    status: Status::Fail,
                    ..base
                }
                .with_observed(observed)
                .with_message(&reason)
            }
            Err(e) => self.adapter_failure(def, device, e, attempts, started),
        }
    }

    fn adapter_failure(
        &self,
        def: &CheckDef,
        device: &Device,
        err: AdapterError,
        attempts: u32,
        started: Instant,
    ) -> CheckResult {
        let observed = match &err {
            AdapterError::MalformedResponse { raw, reason, .. } => {
                warn!(check = %def.id, device = %device.id, reason = %reason, raw = %raw, "malformed response");
                json!({"error": err.kind(), "raw": raw})
            }
            _ => {
                warn!(check = %def.id, device = %device.id, error = %err, attempts, "check errored");
                json!({"error": err.kind()})
            }
        };
        CheckResult::new(&def.id, def.category, device.id.as_str(), Status::Error)
            .with_blocking(def.blocking)
            .with_observed(observed)
            .with_message(&err.to_string())
            .with_attempts(attempts)
            .with_latency_ms(started.elapsed().as_millis() as u64)
    }
}

/// Executes one device's checks in order.
struct DeviceWorker {
    executor: CheckExecutor,
    faults: Arc<FaultView>,
    sink: ResultSink,
    device: Device,
    checks: Vec<CheckDef>,
}

impl DeviceWorker {
    async fn run(self) {
        for def in &self.checks {
            if self.executor.cancel.is_cancelled() {
                self.sink.submit(
                    CheckResult::skipped(&def.id, def.category, self.device.id.as_str(), "run cancelled")
                        .with_blocking(def.blocking),
                );
                continue;
            }
            let result = self.executor.run_check(def, &self.device, &self.faults).await;
            self.sink.submit(result);
        }
    }
}

/// A unit of work known before its category starts; used to record skips.
struct Unit {
    check_id: String,
    category: Category,
    target: String,
    blocking: bool,
}

impl Unit {
    fn skipped(&self, reason: &str) -> CheckResult {
        CheckResult::skipped(&self.check_id, self.category, &self.target, reason).with_blocking(self.blocking)
    }
}

/// Drives a full validation run.
pub struct Orchestrator {
    executor: CheckExecutor,
    registry: Arc<CheckRegistry>,
    categories: BTreeSet<Category>,
    bench: Option<BenchRunner>,
    scenarios: Vec<FailureScenario>,
    injector: FailureInjector,
}

impl Orchestrator {
    /// Fails with [`FabricError::WorkerPool`] when concurrency is zero.
    pub fn new(
        topology: Arc<Topology>,
        adapter: Arc<dyn DeviceAdapter>,
        registry: CheckRegistry,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        let executor = CheckExecutor::new(
            adapter,
            topology,
            config.probe,
            config.concurrency,
            CancellationToken::new(),
        )?;
        Ok(Self {
            executor,
            registry: Arc::new(registry),
            categories: config.categories,
            bench: None,
            scenarios: Vec::new(),
            injector: FailureInjector::new(config.injector),
        })
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.executor.cancel = cancel;
        self
    }

    pub fn with_benchmarks(mut self, runner: BenchRunner) -> Self {
        self.bench = Some(runner);
        self
    }

    /// Attach failure scenarios, validated against the topology and registry.
    pub fn with_scenarios(mut self, scenarios: Vec<FailureScenario>) -> Result<Self> {
        let mut names = BTreeSet::new();
        for s in &scenarios {
            s.validate(&self.executor.topology, &self.registry)?;
            if !names.insert(s.name.clone()) {
                return Err(FabricError::DuplicateCheck(s.check_id()));
            }
        }
        self.scenarios = scenarios;
        Ok(self)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.executor.cancel.clone()
    }

    pub fn topology(&self) -> &Topology {
        &self.executor.topology
    }

    pub fn registry(&self) -> &CheckRegistry {
        &self.registry
    }

    fn units(&self, category: Category) -> Vec<Unit> {
        match category {
            Category::Performance => self
                .bench
                .iter()
                .flat_map(|b| b.specs())
                .map(|s| Unit {
                    check_id: s.check_id(),
                    category,
                    target: s.pattern.label(),
                    blocking: s.blocking,
                })
                .collect(),
            Category::Resilience => self
                .scenarios
                .iter()
                .map(|s| Unit {
                    check_id: s.check_id(),
                    category,
                    target: s.fault.label(),
                    blocking: s.blocking,
                })
                .collect(),
            _ => self
                .registry
                .plan(category, &self.executor.topology)
                .into_iter()
                .map(|(def, device)| Unit {
                    check_id: def.id.clone(),
                    category,
                    target: device.id.to_string(),
                    blocking: def.blocking,
                })
                .collect(),
        }
    }

    /// Execute every requested category and seal the run.
    pub async fn run(&self) -> Result<TestRun> {
        let run = TestRun::new(self.topology().name());
        let cancel = self.cancel_token();
        info!(
            run_id = %run.run_id,
            topology = %self.topology().summary(),
            concurrency = self.executor.concurrency,
            "validation run started"
        );

        let mut collector = ResultCollector::new();
        let mut blocker: Option<String> = None;

        for category in Category::ALL {
            if !self.categories.contains(&category) {
                debug!(category = %category, "category not requested");
                continue;
            }
            let units = self.units(category);
            if let Some(cause) = &blocker {
                warn!(category = %category, blocked_by = %cause, skipped = units.len(), "category skipped");
                for unit in &units {
                    collector.push(unit.skipped("blocked by an earlier failure").with_blocked_by(cause));
                }
                continue;
            }
            if cancel.is_cancelled() {
                for unit in &units {
                    collector.push(unit.skipped("run cancelled"));
                }
                continue;
            }

            info!(category = %category, units = units.len(), "category started");
            collector.sync();
            let start = collector.len();
            match category {
                Category::Performance => {
                    if let Some(bench) = &self.bench {
                        for result in bench.run_all(&cancel).await {
                            collector.push(result);
                        }
                    }
                }
                Category::Resilience => self.run_scenarios(&mut collector).await,
                _ => {
                    let plan = self
                        .registry
                        .plan(category, &self.executor.topology)
                        .into_iter()
                        .map(|(def, device)| (def, device.clone()))
                        .collect();
                    self.executor
                        .execute(plan, Arc::new(FaultView::default()), &mut collector)
                        .await?;
                }
            }
            collector.sync();

            let produced = &collector.results()[start..];
            let count = |s: Status| produced.iter().filter(|r| r.status == s).count();
            info!(
                category = %category,
                pass = count(Status::Pass),
                fail = count(Status::Fail),
                error = count(Status::Error),
                skipped = count(Status::Skipped),
                "category finished"
            );
            if let Some(first) = produced.iter().find(|r| r.is_blocking_failure()) {
                let cause = format!("{} on {}", first.check_id, first.target);
                warn!(category = %category, cause = %cause, "blocking failure");
                blocker = Some(cause);
            }
        }

        let cancelled = cancel.is_cancelled();
        let run = run.seal(collector.into_results(), cancelled);
        info!(
            run_id = %run.run_id,
            status = %run.status,
            results = run.results.len(),
            cancelled,
            "validation run finished"
        );
        Ok(run)
    }

    async fn run_scenarios(&self, collector: &mut ResultCollector) {
        for scenario in &self.scenarios {
            if self.executor.cancel.is_cancelled() {
                collector.push(
                    CheckResult::skipped(
                        &scenario.check_id(),
                        Category::Resilience,
                        &scenario.fault.label(),
                        "run cancelled",
                    )
                    .with_blocking(scenario.blocking),
                );
                continue;
            }
            let report = self.injector.run(scenario, &self.executor, &self.registry).await;
            collector.push(report.into_result(&scenario.check_id(), scenario.blocking));
        }
    }
}
