use fabval_core::{
    BenchSettings, BenchSpec, Category, CheckDefaults, FailureScenario, InjectorSettings, OrchestratorConfig,
    ProbeSettings, RetryPolicy,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Retry policy as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            backoff_multiplier: self.backoff_multiplier,
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub program: String,
    pub user: Option<String>,
    pub extra_args: Vec<String>,
    /// Traffic generator binary on the hosts.
    pub traffic_program: String,
    pub traffic_base_port: u16,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            program: String::from("ssh"),
            user: None,
            extra_args: vec![
                String::from("-o"),
                String::from("BatchMode=yes"),
                String::from("-o"),
                String::from("ConnectTimeout=5"),
            ],
            traffic_program: String::from("iperf3"),
            traffic_base_port: 5201,
        }
    }
}

fn default_true() -> bool {
    true
}

/// A failure scenario: either the CLI shorthand (`device:spine1@3`) or a
/// table with a name and options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScenarioConfig {
    Shorthand(String),
    Full {
        name: String,
        /// Shorthand fault without the bound, e.g. `link:leaf1:spine1`.
        fault: String,
        #[serde(default)]
        recovery_bound_secs: Option<f64>,
        #[serde(default)]
        recovery_checks: Vec<String>,
        #[serde(default = "default_true")]
        blocking: bool,
    },
}

impl ScenarioConfig {
    pub fn to_scenario(&self) -> fabval_core::Result<FailureScenario> {
        match self {
            ScenarioConfig::Shorthand(s) => s.parse(),
            ScenarioConfig::Full {
                name,
                fault,
                recovery_bound_secs,
                recovery_checks,
                blocking,
            } => {
                let spec = match recovery_bound_secs {
                    Some(secs) => format!("{}@{}", fault, secs),
                    None => fault.clone(),
                };
                let mut scenario: FailureScenario = spec.parse()?;
                scenario.name = name.clone();
                scenario.blocking = *blocking;
                Ok(scenario.with_recovery_checks(recovery_checks.clone()))
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub concurrency: usize,
    pub check_timeout_ms: u64,
    pub retry: RetryConfig,
    pub ping_count: u32,
    pub required_mtu: u32,
    pub poll_interval_ms: u64,
    pub ssh: SshConfig,
    pub bench_duration_secs: u64,
    pub benchmarks: Vec<BenchSpec>,
    pub scenarios: Vec<ScenarioConfig>,
    pub baseline: Option<PathBuf>,
    pub regression_tolerance_pct: f64,
    pub regression_blocking: bool,
    pub report_dir: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            check_timeout_ms: 10_000,
            retry: RetryConfig::default(),
            ping_count: 5,
            required_mtu: 9050,
            poll_interval_ms: 500,
            ssh: SshConfig::default(),
            bench_duration_secs: 10,
            benchmarks: Vec::new(),
            scenarios: Vec::new(),
            baseline: None,
            regression_tolerance_pct: 5.0,
            regression_blocking: false,
            report_dir: PathBuf::from("fabval-reports"),
        }
    }
}

impl RunnerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: RunnerConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.check_timeout_ms == 0 {
            anyhow::bail!("check_timeout_ms must be positive");
        }
        if self.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be positive");
        }
        if !self.regression_tolerance_pct.is_finite() || self.regression_tolerance_pct < 0.0 {
            anyhow::bail!(
                "regression_tolerance_pct must be a non-negative number, got {}",
                self.regression_tolerance_pct
            );
        }
        Ok(())
    }

    pub fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.check_timeout_ms)
    }

    pub fn check_defaults(&self) -> CheckDefaults {
        CheckDefaults {
            timeout: self.check_timeout(),
            retry: self.retry.to_policy(),
        }
    }

    /// `categories` empty means every category.
    pub fn orchestrator_config(&self, categories: &[Category]) -> OrchestratorConfig {
        let categories: BTreeSet<Category> = if categories.is_empty() {
            Category::ALL.into_iter().collect()
        } else {
            categories.iter().copied().collect()
        };
        OrchestratorConfig {
            concurrency: self.concurrency,
            categories,
            probe: ProbeSettings {
                ping_count: self.ping_count,
                required_mtu: self.required_mtu,
            },
            injector: InjectorSettings {
                poll_interval: Duration::from_millis(self.poll_interval_ms),
                command_timeout: self.check_timeout(),
                retry: self.retry.to_policy(),
            },
        }
    }

    pub fn bench_settings(&self) -> BenchSettings {
        BenchSettings {
            duration: Duration::from_secs(self.bench_duration_secs),
            regression_tolerance_pct: self.regression_tolerance_pct,
            regression_blocking: self.regression_blocking,
            ..Default::default()
        }
    }

    pub fn failure_scenarios(&self) -> fabval_core::Result<Vec<FailureScenario>> {
        self.scenarios.iter().map(ScenarioConfig::to_scenario).collect()
    }
}
