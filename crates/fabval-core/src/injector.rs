//! Failure injection and convergence timing.
//!
//! A scenario walks `Armed -> Injected -> Recovering -> Recovered` (or
//! `RecoveryTimedOut`). `t0` is the moment the last injection command is
//! acknowledged; detection and recovery times are measured from it. A single
//! deadline monitor (`t0 + recovery_bound`) decides timeout, and restoration of
//! the fault runs on every exit path, including cancellation.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::{Command, CommandOutput, DeviceAdapter};
use crate::check::{Category, CheckDef, FaultView};
use crate::error::{FabricError, Result};
use crate::orchestrator::CheckExecutor;
use crate::probes::find_session;
use crate::registry::CheckRegistry;
use crate::result::{CheckResult, Status};
use crate::retry::{RetryExecutor, RetryOutcome, RetryPolicy};
use crate::topology::{Device, DeviceId, Role, Topology};

pub const DEFAULT_RECOVERY_BOUND: Duration = Duration::from_secs(3);

/// What to break.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Fault {
    /// Take every interface of a spine or leaf down.
    Device { device: DeviceId },
    /// Take a fabric link down (on its `a` side).
    Link { a: DeviceId, b: DeviceId },
    /// Administratively shut the routing session `device` holds to `peer`.
    Session { device: DeviceId, peer: DeviceId },
}

impl Fault {
    pub fn endpoints(&self) -> Vec<&DeviceId> {
        match self {
            Fault::Device { device } => vec![device],
            Fault::Link { a, b } => vec![a, b],
            Fault::Session { device, peer } => vec![device, peer],
        }
    }

    pub fn label(&self) -> String {
        match self {
            Fault::Device { device } => format!("device:{}", device),
            Fault::Link { a, b } => format!("link:{}:{}", a, b),
            Fault::Session { device, peer } => format!("session:{}:{}", device, peer),
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// A named failure scenario.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureScenario {
    pub name: String,
    pub fault: Fault,
    pub recovery_bound: Duration,
    /// Check ids verified after detection. Empty selects the blocking
    /// underlay, overlay and data-plane checks.
    pub recovery_checks: Vec<String>,
    pub blocking: bool,
}

impl FailureScenario {
    pub fn new(name: &str, fault: Fault, recovery_bound: Duration) -> Self {
        Self {
            name: name.to_string(),
            fault,
            recovery_bound,
            recovery_checks: Vec::new(),
            blocking: true,
        }
    }

    pub fn with_recovery_checks(mut self, ids: Vec<String>) -> Self {
        self.recovery_checks = ids;
        self
    }

    pub fn check_id(&self) -> String {
        format!("resilience.{}", self.name)
    }

    /// Reject scenarios naming unknown devices, missing links or unknown
    /// recovery checks.
    pub fn validate(&self, topology: &Topology, registry: &CheckRegistry) -> Result<()> {
        for id in self.fault.endpoints() {
            match topology.device(id.as_str()) {
                Some(d) if d.role.is_fabric() => {}
                Some(d) => {
                    return Err(FabricError::Parse(format!(
                        "scenario {} targets {} {}; faults apply to spines and leaves",
                        self.name, d.role, id
                    )))
                }
                None => return Err(FabricError::UnknownDevice(id.to_string())),
            }
        }
        if let Fault::Link { a, b } | Fault::Session { device: a, peer: b } = &self.fault {
            if topology.link_between(a.as_str(), b.as_str()).is_none() {
                return Err(FabricError::Parse(format!(
                    "scenario {}: no link between {} and {}",
                    self.name, a, b
                )));
            }
        }
        FaultPlan::build(&self.fault, topology)?;
        for id in &self.recovery_checks {
            registry.require(id)?;
        }
        if self.recovery_bound.is_zero() {
            return Err(FabricError::Parse(format!(
                "scenario {} has a zero recovery bound",
                self.name
            )));
        }
        Ok(())
    }
}

impl FromStr for FailureScenario {
    type Err = FabricError;

    /// Shorthand: `device:<id>`, `link:<a>:<b>` or `session:<a>:<b>`,
    /// optionally followed by `@<bound seconds>`.
    fn from_str(s: &str) -> Result<Self> {
        let (spec, bound) = match s.split_once('@') {
            Some((spec, secs)) => {
                let secs: f64 = secs
                    .parse()
                    .map_err(|_| FabricError::Parse(format!("invalid recovery bound in '{}'", s)))?;
                let bound = Duration::try_from_secs_f64(secs)
                    .ok()
                    .filter(|d| !d.is_zero())
                    .ok_or_else(|| FabricError::Parse(format!("invalid recovery bound in '{}'", s)))?;
                (spec, bound)
            }
            None => (s, DEFAULT_RECOVERY_BOUND),
        };
        let parts: Vec<&str> = spec.split(':').collect();
        let fault = match parts.as_slice() {
            ["device", id] => Fault::Device { device: DeviceId::from(*id) },
            ["link", a, b] => Fault::Link {
                a: DeviceId::from(*a),
                b: DeviceId::from(*b),
            },
            ["session", a, b] => Fault::Session {
                device: DeviceId::from(*a),
                peer: DeviceId::from(*b),
            },
            _ => {
                return Err(FabricError::Parse(format!(
                    "invalid scenario '{}' (expected device:<id>, link:<a>:<b> or session:<a>:<b>)",
                    s
                )))
            }
        };
        if fault.endpoints().iter().any(|id| id.as_str().is_empty()) {
            return Err(FabricError::Parse(format!("invalid scenario '{}'", s)));
        }
        Ok(FailureScenario::new(spec, fault, bound))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioState {
    Armed,
    Injected,
    Recovering,
    Recovered,
    RecoveryTimedOut,
    /// Injection failed or the run was cancelled mid-scenario.
    Aborted,
}

impl ScenarioState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScenarioState::Recovered | ScenarioState::RecoveryTimedOut | ScenarioState::Aborted
        )
    }

    pub fn can_move_to(&self, next: ScenarioState) -> bool {
        use ScenarioState::*;
        matches!(
            (self, next),
            (Armed, Injected)
                | (Armed, Aborted)
                | (Injected, Recovering)
                | (Injected, RecoveryTimedOut)
                | (Injected, Aborted)
                | (Recovering, Recovered)
                | (Recovering, RecoveryTimedOut)
                | (Recovering, Aborted)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioState::Armed => "armed",
            ScenarioState::Injected => "injected",
            ScenarioState::Recovering => "recovering",
            ScenarioState::Recovered => "recovered",
            ScenarioState::RecoveryTimedOut => "recovery_timed_out",
            ScenarioState::Aborted => "aborted",
        }
    }
}

impl fmt::Display for ScenarioState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioEvent {
    pub state: ScenarioState,
    /// Milliseconds since the scenario was armed.
    pub elapsed_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Tracks the scenario state machine and its timestamps.
#[derive(Debug, Clone)]
pub struct ConvergenceTimer {
    state: ScenarioState,
    armed_at: Instant,
    injected_at: Option<Instant>,
    detected_at: Option<Instant>,
    recovered_at: Option<Instant>,
    events: Vec<ScenarioEvent>,
}

impl ConvergenceTimer {
    pub fn arm() -> Self {
        let now = Instant::now();
        Self {
            state: ScenarioState::Armed,
            armed_at: now,
            injected_at: None,
            detected_at: None,
            recovered_at: None,
            events: vec![ScenarioEvent {
                state: ScenarioState::Armed,
                elapsed_ms: 0,
                timestamp: Utc::now(),
            }],
        }
    }

    /// Move to `next` at `at`. Invalid transitions are refused.
    pub fn advance(&mut self, next: ScenarioState, at: Instant) -> bool {
        if !self.state.can_move_to(next) {
            warn!(from = %self.state, to = %next, "refusing scenario transition");
            return false;
        }
        match next {
            ScenarioState::Injected => self.injected_at = Some(at),
            ScenarioState::Recovering => self.detected_at = Some(at),
            ScenarioState::Recovered => self.recovered_at = Some(at),
            _ => {}
        }
        self.state = next;
        self.events.push(ScenarioEvent {
            state: next,
            elapsed_ms: at.saturating_duration_since(self.armed_at).as_millis() as u64,
            timestamp: Utc::now(),
        });
        true
    }

    pub fn state(&self) -> ScenarioState {
        self.state
    }

    pub fn injected_at(&self) -> Option<Instant> {
        self.injected_at
    }

    /// Time from injection to first detection.
    pub fn detection_time(&self) -> Option<Duration> {
        Some(self.detected_at?.saturating_duration_since(self.injected_at?))
    }

    /// Time from injection to verified recovery.
    pub fn recovery_time(&self) -> Option<Duration> {
        Some(self.recovered_at?.saturating_duration_since(self.injected_at?))
    }

    pub fn events(&self) -> &[ScenarioEvent] {
        &self.events
    }
}

/// Everything needed to apply, observe and revert a fault.
#[derive(Debug, Clone)]
pub struct FaultPlan {
    /// (device, injection command, restoration command)
    pub steps: Vec<(DeviceId, Command, Command)>,
    /// (watcher, peer): the watcher's session to the peer signals detection.
    pub watchers: Vec<(DeviceId, DeviceId)>,
    pub view: FaultView,
    /// Devices whose checks verify recovery.
    pub scope: BTreeSet<DeviceId>,
}

impl FaultPlan {
    pub fn build(fault: &Fault, topology: &Topology) -> Result<Self> {
        let mut steps = Vec::new();
        let mut watchers = Vec::new();
        let mut down_devices = BTreeSet::new();
        let mut down_links = Vec::new();
        let mut down_pairs = Vec::new();

        match fault {
            Fault::Device { device } => {
                for link in topology.links_of(device.as_str()) {
                    if let Some(port) = link.port_on(device.as_str()) {
                        steps.push((
                            device.clone(),
                            Command::InterfaceDown { port: port.to_string() },
                            Command::InterfaceUp { port: port.to_string() },
                        ));
                    }
                }
                for n in topology.neighbors(device.as_str()) {
                    if n.role.is_fabric() {
                        watchers.push((n.id.clone(), device.clone()));
                    }
                }
                down_devices.insert(device.clone());
            }
            Fault::Link { a, b } => {
                let link = topology
                    .link_between(a.as_str(), b.as_str())
                    .ok_or_else(|| FabricError::Parse(format!("no link between {} and {}", a, b)))?;
                let port = link.port_on(a.as_str()).unwrap_or_default().to_string();
                steps.push((
                    a.clone(),
                    Command::InterfaceDown { port: port.clone() },
                    Command::InterfaceUp { port },
                ));
                watchers.push((a.clone(), b.clone()));
                watchers.push((b.clone(), a.clone()));
                down_links.push((a.clone(), b.clone()));
                down_pairs.push((a.clone(), b.clone()));
            }
            Fault::Session { device, peer } => {
                let (asn, neighbor) = session_address(topology, device, peer)?;
                steps.push((
                    device.clone(),
                    Command::SessionShutdown {
                        asn,
                        neighbor: neighbor.clone(),
                        peer: peer.clone(),
                    },
                    Command::SessionEnable {
                        asn,
                        neighbor,
                        peer: peer.clone(),
                    },
                ));
                watchers.push((device.clone(), peer.clone()));
                watchers.push((peer.clone(), device.clone()));
                down_pairs.push((device.clone(), peer.clone()));
            }
        }

        let excluded = topology.stranded_by(&down_devices, &down_links);

        // Neighbours of the fault plus the hosts behind any affected leaf.
        let mut scope: BTreeSet<DeviceId> = BTreeSet::new();
        for end in fault.endpoints() {
            scope.insert(end.clone());
            for n in topology.neighbors(end.as_str()) {
                scope.insert(n.id.clone());
            }
        }
        let leaves: Vec<DeviceId> = scope
            .iter()
            .filter(|id| topology.device(id.as_str()).map(|d| d.role) == Some(Role::Leaf))
            .cloned()
            .collect();
        for leaf in leaves {
            for host in topology.attached_hosts(leaf.as_str()) {
                scope.insert(host.id.clone());
            }
        }
        scope.retain(|id| !excluded.contains(id));

        Ok(Self {
            steps,
            watchers,
            view: FaultView::new(excluded, &down_pairs),
            scope,
        })
    }
}

/// Local ASN of `device` and the neighbor name its BGP configuration uses for
/// `peer`: the interface facing the peer, else the peer's loopback.
fn session_address(topology: &Topology, device: &DeviceId, peer: &DeviceId) -> Result<(u32, String)> {
    let local = topology
        .device(device.as_str())
        .ok_or_else(|| FabricError::UnknownDevice(device.to_string()))?;
    let asn = local
        .asn
        .ok_or_else(|| FabricError::Parse(format!("{} has no asn to address its BGP sessions", device)))?;
    let port = topology
        .link_between(device.as_str(), peer.as_str())
        .and_then(|l| l.named_port_on(device.as_str()))
        .map(str::to_string);
    let loopback = topology
        .device(peer.as_str())
        .and_then(|p| p.loopback)
        .map(|ip| ip.to_string());
    let neighbor = port
        .or(loopback)
        .ok_or_else(|| FabricError::Parse(format!("no interface or loopback names {} on {}", peer, device)))?;
    Ok((asn, neighbor))
}

/// Holds restoration commands for every applied injection step. Restoration
/// is explicit via [`FaultGuard::restore`]; if the guard is dropped with
/// steps outstanding it spawns the restoration on the current runtime.
pub struct FaultGuard {
    adapter: Arc<dyn DeviceAdapter>,
    topology: Arc<Topology>,
    pending: Vec<(DeviceId, Command)>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl FaultGuard {
    pub fn new(adapter: Arc<dyn DeviceAdapter>, topology: Arc<Topology>, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            adapter,
            topology,
            pending: Vec::new(),
            timeout,
            retry,
        }
    }

    pub fn applied(&mut self, device: DeviceId, restore: Command) {
        self.pending.push((device, restore));
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }

    /// Revert every applied step, newest first. Returns the steps that could
    /// not be reverted.
    pub async fn restore(&mut self) -> Vec<String> {
        let pending = std::mem::take(&mut self.pending);
        restore_steps(
            self.adapter.clone(),
            self.topology.clone(),
            pending,
            self.timeout,
            self.retry.clone(),
        )
        .await
    }
}

impl Drop for FaultGuard {
    fn drop(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(steps = pending.len(), "fault guard dropped with fault applied, restoring in background");
                let adapter = self.adapter.clone();
                let topology = self.topology.clone();
                let timeout = self.timeout;
                let retry = self.retry.clone();
                handle.spawn(async move {
                    restore_steps(adapter, topology, pending, timeout, retry).await;
                });
            }
            Err(_) => {
                error!(steps = pending.len(), "fault left applied: no runtime to restore it");
            }
        }
    }
}

async fn restore_steps(
    adapter: Arc<dyn DeviceAdapter>,
    topology: Arc<Topology>,
    pending: Vec<(DeviceId, Command)>,
    timeout: Duration,
    retry: RetryPolicy,
) -> Vec<String> {
    // Restoration is never cancelled.
    let never = CancellationToken::new();
    let executor = RetryExecutor::new(retry);
    let mut failed = Vec::new();
    for (device_id, command) in pending.into_iter().rev() {
        let Some(device) = topology.device(device_id.as_str()) else {
            failed.push(format!("{}: unknown device", device_id));
            continue;
        };
        let outcome = executor
            .execute(&never, || call(adapter.as_ref(), device, &command, timeout))
            .await;
        match outcome {
            RetryOutcome::Success { .. } => {
                debug!(device = %device_id, command = %command, "restored");
            }
            RetryOutcome::Exhausted { last_error, .. } => {
                error!(device = %device_id, command = %command, error = %last_error, "restoration failed");
                failed.push(format!("{}: {}", device_id, last_error));
            }
            RetryOutcome::Cancelled { .. } => failed.push(format!("{}: cancelled", device_id)),
        }
    }
    failed
}

async fn call(
    adapter: &dyn DeviceAdapter,
    device: &Device,
    command: &Command,
    timeout: Duration,
) -> std::result::Result<CommandOutput, crate::adapter::AdapterError> {
    match tokio::time::timeout(timeout, adapter.execute(device, command, timeout)).await {
        Ok(result) => result,
        Err(_) => Err(crate::adapter::AdapterError::Timeout {
            device: device.id.clone(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

#[derive(Debug, Clone)]
pub struct InjectorSettings {
    pub poll_interval: Duration,
    pub command_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for InjectorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            command_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// Outcome of one scenario.
#[derive(Debug, Clone)]
pub struct ScenarioReport {
    pub name: String,
    pub fault: Fault,
    pub state: ScenarioState,
    pub recovery_bound: Duration,
    pub detection: Option<Duration>,
    pub recovery: Option<Duration>,
    pub events: Vec<ScenarioEvent>,
    pub excluded: Vec<DeviceId>,
    /// Recovery checks still failing when the scenario ended.
    pub pending_checks: Vec<String>,
    pub restore_failures: Vec<String>,
    pub error: Option<String>,
    pub cancelled: bool,
}

impl ScenarioReport {
    pub fn into_result(self, check_id: &str, blocking: bool) -> CheckResult {
        let observed = json!({
            "fault": self.fault,
            "state": self.state,
            "recovery_bound_ms": self.recovery_bound.as_millis() as u64,
            "detection_ms": self.detection.map(|d| d.as_millis() as u64),
            "recovery_ms": self.recovery.map(|d| d.as_millis() as u64),
            "events": self.events,
            "excluded": self.excluded,
            "pending_checks": self.pending_checks,
            "restored": self.restore_failures.is_empty(),
            "restore_failures": self.restore_failures,
        });
        let (status, message) = if self.cancelled {
            (Status::Skipped, Some("run cancelled during scenario".to_string()))
        } else {
            match self.state {
                ScenarioState::Recovered if self.restore_failures.is_empty() => (Status::Pass, None),
                ScenarioState::Recovered => (
                    Status::Error,
                    Some("recovered, but the fault could not be reverted".to_string()),
                ),
                ScenarioState::RecoveryTimedOut => (
                    Status::Fail,
                    Some(format!(
                        "no recovery within {} ms",
                        self.recovery_bound.as_millis()
                    )),
                ),
                _ => (
                    Status::Error,
                    Some(self.error.clone().unwrap_or_else(|| "scenario aborted".to_string())),
                ),
            }
        };
        let result = CheckResult::new(check_id, Category::Resilience, &self.fault.label(), status)
            .with_blocking(blocking)
            .with_observed(observed)
            .with_attempts(1)
            .with_latency_ms(self.recovery.map(|d| d.as_millis() as u64).unwrap_or(0));
        match message {
            Some(msg) => result.with_message(&msg),
            None => result,
        }
    }
}

enum Watch {
    Recovered,
    Failed(String),
}

/// Runs failure scenarios against the fabric.
#[derive(Debug, Clone, Default)]
pub struct FailureInjector {
    settings: InjectorSettings,
}

impl FailureInjector {
    pub fn new(settings: InjectorSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &InjectorSettings {
        &self.settings
    }

    pub async fn run(
        &self,
        scenario: &FailureScenario,
        executor: &CheckExecutor,
        registry: &CheckRegistry,
    ) -> ScenarioReport {
        let topology = executor.topology().clone();
        let cancel = executor.cancel_token().clone();
        let mut timer = ConvergenceTimer::arm();
        let mut report = ScenarioReport {
            name: scenario.name.clone(),
            fault: scenario.fault.clone(),
            state: ScenarioState::Armed,
            recovery_bound: scenario.recovery_bound,
            detection: None,
            recovery: None,
            events: Vec::new(),
            excluded: Vec::new(),
            pending_checks: Vec::new(),
            restore_failures: Vec::new(),
            error: None,
            cancelled: false,
        };

        let plan = match FaultPlan::build(&scenario.fault, &topology) {
            Ok(plan) => plan,
            Err(e) => {
                timer.advance(ScenarioState::Aborted, Instant::now());
                report.error = Some(e.to_string());
                return finish(report, &timer);
            }
        };
        report.excluded = plan.view.excluded().iter().cloned().collect();
        info!(
            scenario = %scenario.name,
            fault = %scenario.fault,
            bound_ms = scenario.recovery_bound.as_millis() as u64,
            excluded = report.excluded.len(),
            "scenario armed"
        );

        let mut guard = FaultGuard::new(
            executor.adapter().clone(),
            topology.clone(),
            self.settings.command_timeout,
            self.settings.retry.clone(),
        );
        let retry = RetryExecutor::new(self.settings.retry.clone());

        for (device_id, inject, restore) in &plan.steps {
            let Some(device) = topology.device(device_id.as_str()) else {
                continue;
            };
            let outcome = retry
                .execute(&cancel, || executor.call(device, inject, self.settings.command_timeout))
                .await;
            match outcome {
                RetryOutcome::Success { .. } => guard.applied(device_id.clone(), restore.clone()),
                RetryOutcome::Exhausted { last_error, .. } => {
                    error!(scenario = %scenario.name, device = %device_id, error = %last_error, "injection failed");
                    report.error = Some(format!("injection on {} failed: {}", device_id, last_error));
                    timer.advance(ScenarioState::Aborted, Instant::now());
                    report.restore_failures = guard.restore().await;
                    return finish(report, &timer);
                }
                RetryOutcome::Cancelled { .. } => {
                    report.cancelled = true;
                    timer.advance(ScenarioState::Aborted, Instant::now());
                    report.restore_failures = guard.restore().await;
                    return finish(report, &timer);
                }
            }
        }

        let t0 = Instant::now();
        timer.advance(ScenarioState::Injected, t0);
        info!(scenario = %scenario.name, steps = plan.steps.len(), "fault injected");

        let checks = self.recovery_plan(scenario, registry, &plan, &topology);
        let view = Arc::new(plan.view.clone());
        let deadline = t0 + scenario.recovery_bound;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            _ = tokio::time::sleep_until(deadline) => Some(None),
            w = self.watch(&plan, &checks, view, executor, &mut timer, &mut report.pending_checks) => Some(Some(w)),
        };

        match outcome {
            None => {
                report.cancelled = true;
                timer.advance(ScenarioState::Aborted, Instant::now());
            }
            Some(None) => {
                warn!(scenario = %scenario.name, state = %timer.state(), "recovery bound exceeded");
                timer.advance(ScenarioState::RecoveryTimedOut, deadline);
            }
            Some(Some(Watch::Recovered)) => {}
            Some(Some(Watch::Failed(reason))) => {
                report.error = Some(reason);
                timer.advance(ScenarioState::Aborted, Instant::now());
            }
        }

        report.restore_failures = guard.restore().await;
        if report.restore_failures.is_empty() {
            info!(scenario = %scenario.name, "fault reverted");
        }
        finish(report, &timer)
    }

    fn recovery_plan(
        &self,
        scenario: &FailureScenario,
        registry: &CheckRegistry,
        plan: &FaultPlan,
        topology: &Topology,
    ) -> Vec<(CheckDef, Device)> {
        let defs: Vec<&CheckDef> = if scenario.recovery_checks.is_empty() {
            registry
                .checks()
                .iter()
                .filter(|c| c.blocking)
                .filter(|c| {
                    matches!(
                        c.category,
                        Category::Underlay | Category::Overlay | Category::DataPlane
                    )
                })
                .collect()
        } else {
            scenario
                .recovery_checks
                .iter()
                .filter_map(|id| registry.get(id))
                .collect()
        };

        let mut units = Vec::new();
        for def in defs {
            // The poll loop is the retry.
            let def = def.clone().with_retry(RetryPolicy::once());
            for device in def.targets(topology) {
                if plan.scope.contains(&device.id) && !plan.view.is_excluded(device.id.as_str()) {
                    units.push((def.clone(), device.clone()));
                }
            }
        }
        units
    }

    async fn watch(
        &self,
        plan: &FaultPlan,
        checks: &[(CheckDef, Device)],
        view: Arc<FaultView>,
        executor: &CheckExecutor,
        timer: &mut ConvergenceTimer,
        pending: &mut Vec<String>,
    ) -> Watch {
        loop {
            if self.detected(plan, executor).await {
                timer.advance(ScenarioState::Recovering, Instant::now());
                info!(
                    detection_ms = timer.detection_time().map(|d| d.as_millis() as u64),
                    "fault detected"
                );
                break;
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }

        loop {
            match executor.probe(checks.to_vec(), view.clone()).await {
                Ok(results) => {
                    *pending = results
                        .iter()
                        .filter(|r| r.status != Status::Pass)
                        .map(|r| format!("{}@{}", r.check_id, r.target))
                        .collect();
                    if pending.is_empty() {
                        let now = Instant::now();
                        timer.advance(ScenarioState::Recovered, now);
                        info!(
                            recovery_ms = timer.recovery_time().map(|d| d.as_millis() as u64),
                            "fabric recovered"
                        );
                        return Watch::Recovered;
                    }
                    debug!(pending = pending.len(), "recovery checks still failing");
                }
                Err(e) => return Watch::Failed(e.to_string()),
            }
            tokio::time::sleep(self.settings.poll_interval).await;
        }
    }

    /// True once any watcher reports its session to the failed peer down.
    async fn detected(&self, plan: &FaultPlan, executor: &CheckExecutor) -> bool {
        let topology = executor.topology();
        let polls = plan.watchers.iter().filter_map(|(watcher, peer)| {
            let w = topology.device(watcher.as_str())?;
            let p = topology.device(peer.as_str())?;
            Some(async move {
                match executor.call(w, &Command::BgpSummary, self.settings.command_timeout).await {
                    Ok(CommandOutput::Sessions(sessions)) => {
                        match find_session(&sessions, topology, w.id.as_str(), p) {
                            Some(s) => !s.is_established(),
                            None => true,
                        }
                    }
                    Ok(other) => {
                        debug!(watcher = %w.id, kind = other.kind(), "unexpected detection output");
                        false
                    }
                    Err(e) => {
                        debug!(watcher = %w.id, error = %e, "detection poll failed");
                        false
                    }
                }
            })
        });
        join_all(polls).await.into_iter().any(|down| down)
    }
}

fn finish(mut report: ScenarioReport, timer: &ConvergenceTimer) -> ScenarioReport {
    report.state = timer.state();
    report.detection = timer.detection_time();
    report.recovery = timer.recovery_time();
    report.events = timer.events().to_vec();
    info!(
        scenario = %report.name,
        state = %report.state,
        detection_ms = report.detection.map(|d| d.as_millis() as u64),
        recovery_ms = report.recovery.map(|d| d.as_millis() as u64),
        "scenario finished"
    );
    report
}
