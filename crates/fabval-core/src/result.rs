//! Check results and the run that owns them.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::check::Category;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pass,
    Fail,
    Error,
    Skipped,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pass => "pass",
            Status::Fail => "fail",
            Status::Error => "error",
            Status::Skipped => "skipped",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Status::Fail | Status::Error)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one check against one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check_id: String,
    pub category: Category,
    /// Device id, link label, or pattern label.
    pub target: String,
    pub status: Status,
    pub blocking: bool,
    #[serde(default)]
    pub observed: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub attempts: u32,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
    /// The blocking failure that caused this result to be skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
}

impl CheckResult {
    pub fn new(check_id: &str, category: Category, target: &str, status: Status) -> Self {
        Self {
            check_id: check_id.to_string(),
            category,
            target: target.to_string(),
            status,
            blocking: true,
            observed: Value::Null,
            message: None,
            attempts: 0,
            latency_ms: 0,
            timestamp: Utc::now(),
            blocked_by: None,
        }
    }

    pub fn skipped(check_id: &str, category: Category, target: &str, reason: &str) -> Self {
        Self::new(check_id, category, target, Status::Skipped).with_message(reason)
    }

    pub fn with_observed(mut self, observed: Value) -> Self {
        self.observed = observed;
        self
    }

    pub fn with_message(mut self, message: &str) -> Self {
        self.message = Some(message.to_string());
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn with_blocked_by(mut self, cause: &str) -> Self {
        self.blocked_by = Some(cause.to_string());
        self
    }

    /// A blocking result that failed or errored.
    pub fn is_blocking_failure(&self) -> bool {
        self.blocking && self.status.is_failure()
    }
}

/// Write handle given to workers. Results travel over a channel to the
/// single [`ResultCollector`] that owns the list.
#[derive(Debug, Clone)]
pub struct ResultSink {
    tx: mpsc::UnboundedSender<CheckResult>,
}

impl ResultSink {
    pub fn submit(&self, result: CheckResult) {
        if self.tx.send(result).is_err() {
            tracing::error!("result collector dropped before worker finished");
        }
    }
}

/// Sole owner of the results list.
#[derive(Debug)]
pub struct ResultCollector {
    tx: mpsc::UnboundedSender<CheckResult>,
    rx: mpsc::UnboundedReceiver<CheckResult>,
    results: Vec<CheckResult>,
}

impl ResultCollector {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx,
            results: Vec::new(),
        }
    }

    pub fn sink(&self) -> ResultSink {
        ResultSink {
            tx: self.tx.clone(),
        }
    }

    /// Drain everything submitted so far into the list.
    pub fn sync(&mut self) {
        while let Ok(result) = self.rx.try_recv() {
            self.results.push(result);
        }
    }

    /// Record a result directly.
    pub fn push(&mut self, result: CheckResult) {
        self.sync();
        self.results.push(result);
    }

    pub fn results(&self) -> &[CheckResult] {
        &self.results
    }

    /// Reorder everything recorded from `start` on. Workers submit in
    /// completion order.
    pub fn sort_from<K: Ord>(&mut self, start: usize, key: impl FnMut(&CheckResult) -> K) {
        self.sync();
        if start < self.results.len() {
            self.results[start..].sort_by_key(key);
        }
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn into_results(mut self) -> Vec<CheckResult> {
        self.sync();
        self.results
    }
}

impl Default for ResultCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Pass,
    Fail,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Running => "running",
            RunStatus::Pass => "pass",
            RunStatus::Fail => "fail",
        })
    }
}

/// One invocation of the orchestrator. Sealed once every category has been
/// executed or skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRun {
    pub run_id: Uuid,
    pub topology: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub cancelled: bool,
    pub results: Vec<CheckResult>,
}

impl TestRun {
    pub fn new(topology: &str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            topology: topology.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            cancelled: false,
            results: Vec::new(),
        }
    }

    /// Attach the final results and derive the overall status: pass iff no
    /// blocking result failed and the run was not cancelled.
    pub fn seal(mut self, results: Vec<CheckResult>, cancelled: bool) -> Self {
        let failed = results.iter().any(CheckResult::is_blocking_failure);
        self.status = if failed || cancelled {
            RunStatus::Fail
        } else {
            RunStatus::Pass
        };
        self.cancelled = cancelled;
        self.results = results;
        self.finished_at = Some(Utc::now());
        self
    }

    pub fn is_sealed(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn passed(&self) -> bool {
        self.status == RunStatus::Pass
    }

    pub fn count(&self, status: Status) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn in_category(&self, category: Category) -> impl Iterator<Item = &CheckResult> {
        self.results.iter().filter(move |r| r.category == category)
    }

    pub fn blocking_failures(&self) -> Vec<&CheckResult> {
        self.results.iter().filter(|r| r.is_blocking_failure()).collect()
    }

    pub fn duration_ms(&self) -> i64 {
        self.finished_at
            .map(|end| (end - self.started_at).num_milliseconds())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: Status, blocking: bool) -> CheckResult {
        CheckResult::new("underlay.mtu", Category::Underlay, "leaf1", status).with_blocking(blocking)
    }

    #[test]
    fn test_status_serde() {
        assert_eq!(serde_json::to_string(&Status::Skipped).unwrap(), "\"skipped\"");
        assert!(Status::Error.is_failure());
        assert!(!Status::Skipped.is_failure());
    }

    #[tokio::test]
    async fn test_collector_receives_from_many_sinks() {
        let mut collector = ResultCollector::new();
        let mut handles = Vec::new();
        for i in 0..8 {
            let sink = collector.sink();
            handles.push(tokio::spawn(async move {
                sink.submit(CheckResult::new("c", Category::Underlay, &format!("d{}", i), Status::Pass));
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        collector.sync();
        assert_eq!(collector.len(), 8);
    }

    #[test]
    fn test_seal_non_blocking_failure_passes() {
        let run = TestRun::new("lab").seal(
            vec![result(Status::Pass, true), result(Status::Fail, false)],
            false,
        );
        assert!(run.is_sealed());
        assert_eq!(run.status, RunStatus::Pass);
        assert_eq!(run.count(Status::Fail), 1);
    }

    #[test]
    fn test_seal_blocking_error_fails() {
        let run = TestRun::new("lab").seal(vec![result(Status::Error, true)], false);
        assert_eq!(run.status, RunStatus::Fail);
        assert_eq!(run.blocking_failures().len(), 1);
    }

    #[test]
    fn test_seal_cancelled_fails() {
        let run = TestRun::new("lab").seal(vec![result(Status::Pass, true)], true);
        assert_eq!(run.status, RunStatus::Fail);
        assert!(run.cancelled);
    }

    #[test]
    fn test_result_json_omits_empty_fields() {
        let json = serde_json::to_value(result(Status::Pass, true)).unwrap();
        assert!(json.get("blocked_by").is_none());
        assert_eq!(json["status"], "pass");
        assert_eq!(json["category"], "underlay");
    }
}
