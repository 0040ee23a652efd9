//! Fabric validation core: proves a spine/leaf EVPN-VXLAN fabric is healthy,
//! fast enough, and recovers within bounds after injected failures.

pub mod adapter;
pub mod baseline;
pub mod bench;
pub mod check;
pub mod error;
pub mod injector;
pub mod orchestrator;
pub mod parse;
pub mod probes;
pub mod registry;
pub mod report;
pub mod result;
pub mod retry;
pub mod sim;
pub mod stats;
pub mod topology;

pub use adapter::{AdapterError, Command, CommandOutput, DeviceAdapter, FlowSample, FlowSpec, TrafficGenerator};
pub use baseline::Baseline;
pub use bench::{BenchRunner, BenchSettings, BenchSpec, Pattern, Targets};
pub use check::{Category, CheckDef, FaultView, Probe, ProbeSettings, Selector, Verdict};
pub use error::{FabricError, Result};
pub use injector::{Fault, FailureInjector, FailureScenario, InjectorSettings, ScenarioState};
pub use orchestrator::{CheckExecutor, Orchestrator, OrchestratorConfig};
pub use registry::{CheckDefaults, CheckRegistry};
pub use report::{write_reports, ReportFormat, RunSummary};
pub use result::{CheckResult, RunStatus, Status, TestRun};
pub use retry::RetryPolicy;
pub use sim::{SimFabric, SimSettings};
pub use topology::{Device, DeviceId, Link, Role, Topology};
