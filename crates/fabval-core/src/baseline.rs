//! Stored performance baselines and regression comparison.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FabricError, Result};
use crate::stats::round3;

pub const BASELINE_VERSION: u32 = 1;

/// Whether a larger value of a metric is an improvement. Decided by the
/// metric's unit suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HigherIsBetter,
    LowerIsBetter,
}

impl Direction {
    pub fn of(metric: &str) -> Self {
        if metric.ends_with("_ms") {
            Direction::LowerIsBetter
        } else {
            Direction::HigherIsBetter
        }
    }
}

/// A metric that moved past tolerance in the bad direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Regression {
    pub metric: String,
    pub baseline: f64,
    pub current: f64,
    /// Signed change relative to the baseline, in percent.
    pub change_pct: f64,
}

/// Metrics captured from an earlier run, keyed `<pattern>.<metric>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Baseline {
    pub version: u32,
    #[serde(default)]
    pub captured_at: Option<String>,
    pub metrics: BTreeMap<String, f64>,
}

impl Baseline {
    pub fn new(metrics: BTreeMap<String, f64>) -> Self {
        Self {
            version: BASELINE_VERSION,
            captured_at: Some(chrono::Utc::now().to_rfc3339()),
            metrics,
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let baseline: Baseline =
            serde_json::from_str(json).map_err(|e| FabricError::Baseline(e.to_string()))?;
        if baseline.version != BASELINE_VERSION {
            return Err(FabricError::UnsupportedVersion {
                what: "baseline",
                got: baseline.version,
                supported: BASELINE_VERSION,
            });
        }
        Ok(baseline)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| FabricError::Baseline(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&contents)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| FabricError::Baseline(e.to_string()))
    }

    /// Baseline metrics recorded for one pattern.
    pub fn for_pattern(&self, pattern: &str) -> BTreeMap<&str, f64> {
        let prefix = format!("{}.", pattern);
        self.metrics
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|m| (m, *v)))
            .collect()
    }

    /// Metrics in `current` that regressed by more than `tolerance_pct`.
    /// Metrics missing on either side are ignored.
    pub fn compare(&self, current: &BTreeMap<String, f64>, tolerance_pct: f64) -> Vec<Regression> {
        let mut out = Vec::new();
        for (metric, &now) in current {
            let Some(&then) = self.metrics.get(metric) else {
                continue;
            };
            if then == 0.0 {
                continue;
            }
            let change_pct = (now - then) / then.abs() * 100.0;
            let regressed = match Direction::of(metric) {
                Direction::HigherIsBetter => change_pct < -tolerance_pct,
                Direction::LowerIsBetter => change_pct > tolerance_pct,
            };
            if regressed {
                out.push(Regression {
                    metric: metric.clone(),
                    baseline: then,
                    current: now,
                    change_pct: round3(change_pct),
                });
            }
        }
        out
    }
}
