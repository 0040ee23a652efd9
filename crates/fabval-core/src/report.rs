//! Run summaries and their renderings: JSON, JSON Lines, JUnit XML, text.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::check::Category;
use crate::error::{FabricError, Result};
use crate::result::{CheckResult, RunStatus, Status, TestRun};

/// Version of the machine-readable summary. Bumped on breaking changes.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub total: usize,
    pub pass: usize,
    pub fail: usize,
    pub error: usize,
    pub skipped: usize,
}

impl Totals {
    fn of<'a>(results: impl IntoIterator<Item = &'a CheckResult>) -> Self {
        let mut t = Totals::default();
        for r in results {
            t.total += 1;
            match r.status {
                Status::Pass => t.pass += 1,
                Status::Fail => t.fail += 1,
                Status::Error => t.error += 1,
                Status::Skipped => t.skipped += 1,
            }
        }
        t
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorySummary {
    pub category: Category,
    #[serde(flatten)]
    pub totals: Totals,
}

/// Machine-readable run summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub topology: String,
    pub status: RunStatus,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub totals: Totals,
    pub categories: Vec<CategorySummary>,
    /// `<check_id> on <target>` for every blocking failure.
    pub blocking_failures: Vec<String>,
    pub results: Vec<CheckResult>,
}

impl RunSummary {
    pub fn of(run: &TestRun) -> Self {
        let categories = Category::ALL
            .into_iter()
            .filter(|c| run.results.iter().any(|r| r.category == *c))
            .map(|c| CategorySummary {
                category: c,
                totals: Totals::of(run.in_category(c)),
            })
            .collect();
        Self {
            schema_version: SCHEMA_VERSION,
            run_id: run.run_id,
            topology: run.topology.clone(),
            status: run.status,
            cancelled: run.cancelled,
            started_at: run.started_at,
            finished_at: run.finished_at,
            duration_ms: run.duration_ms(),
            totals: Totals::of(&run.results),
            categories,
            blocking_failures: run
                .blocking_failures()
                .iter()
                .map(|r| format!("{} on {}", r.check_id, r.target))
                .collect(),
            results: run.results.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| FabricError::Parse(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let summary: RunSummary = serde_json::from_str(json).map_err(|e| FabricError::Parse(e.to_string()))?;
        if summary.schema_version != SCHEMA_VERSION {
            return Err(FabricError::UnsupportedVersion {
                what: "report",
                got: summary.schema_version,
                supported: SCHEMA_VERSION,
            });
        }
        Ok(summary)
    }

    /// One result per line, then a summary line without the results.
    pub fn to_json_lines(&self) -> Result<String> {
        let mut out = String::new();
        for r in &self.results {
            out.push_str(&serde_json::to_string(r).map_err(|e| FabricError::Parse(e.to_string()))?);
            out.push('\n');
        }
        let head = RunSummary {
            results: Vec::new(),
            ..self.clone()
        };
        out.push_str(&serde_json::to_string(&head).map_err(|e| FabricError::Parse(e.to_string()))?);
        out.push('\n');
        Ok(out)
    }

    pub fn to_junit_xml(&self) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        let _ = writeln!(
            xml,
            "<testsuites name=\"{}\" tests=\"{}\" failures=\"{}\" errors=\"{}\" skipped=\"{}\" time=\"{}\">",
            escape(&self.topology),
            self.totals.total,
            self.totals.fail,
            self.totals.error,
            self.totals.skipped,
            self.duration_ms as f64 / 1000.0
        );
        for cat in &self.categories {
            let _ = writeln!(
                xml,
                "  <testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" errors=\"{}\" skipped=\"{}\">",
                cat.category, cat.totals.total, cat.totals.fail, cat.totals.error, cat.totals.skipped
            );
            for r in self.results.iter().filter(|r| r.category == cat.category) {
                let _ = writeln!(
                    xml,
                    "    <testcase name=\"{}\" classname=\"{}\" time=\"{}\">",
                    escape(&r.target),
                    escape(&r.check_id),
                    r.latency_ms as f64 / 1000.0
                );
                let msg = escape(r.message.as_deref().unwrap_or(r.status.as_str()));
                match r.status {
                    Status::Fail => {
                        let _ = writeln!(xml, "      <failure message=\"{}\">{}</failure>", msg, escape(&r.observed.to_string()));
                    }
                    Status::Error => {
                        let _ = writeln!(xml, "      <error message=\"{}\" />", msg);
                    }
                    Status::Skipped => {
                        let _ = writeln!(xml, "      <skipped message=\"{}\" />", msg);
                    }
                    Status::Pass => {}
                }
                xml.push_str("    </testcase>\n");
            }
            xml.push_str("  </testsuite>\n");
        }
        xml.push_str("</testsuites>\n");
        xml
    }

    pub fn summary_line(&self) -> String {
        let t = &self.totals;
        let verdict = match (self.cancelled, self.status) {
            (true, _) => "CANCELLED",
            (false, RunStatus::Pass) => "PASS",
            (false, _) => "FAIL",
        };
        format!(
            "{} {}/{} passed ({} failed, {} errors, {} skipped) in {:.2}s",
            verdict,
            t.pass,
            t.total,
            t.fail,
            t.error,
            t.skipped,
            self.duration_ms as f64 / 1000.0
        )
    }

    /// Human-readable rendering grouped by category.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Fabric validation: {} (run {})", self.topology, self.run_id);
        for cat in &self.categories {
            let _ = writeln!(
                out,
                "\n[{}] {} pass, {} fail, {} error, {} skipped",
                cat.category, cat.totals.pass, cat.totals.fail, cat.totals.error, cat.totals.skipped
            );
            for r in self.results.iter().filter(|r| r.category == cat.category) {
                let tag = if r.blocking { "" } else { " (non-blocking)" };
                let _ = write!(out, "  {:<7} {} @ {}{}", r.status.as_str().to_uppercase(), r.check_id, r.target, tag);
                match (&r.message, &r.blocked_by) {
                    (_, Some(cause)) => {
                        let _ = write!(out, ": blocked by {}", cause);
                    }
                    (Some(msg), None) => {
                        let _ = write!(out, ": {}", msg);
                    }
                    (None, None) => {}
                }
                out.push('\n');
            }
        }
        if !self.blocking_failures.is_empty() {
            let _ = writeln!(out, "\nBlocking failures:");
            for f in &self.blocking_failures {
                let _ = writeln!(out, "  - {}", f);
            }
        }
        let _ = writeln!(out, "\n{}", self.summary_line());
        out
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Json,
    Jsonl,
    Junit,
    Text,
}

impl ReportFormat {
    pub const ALL: [ReportFormat; 4] = [
        ReportFormat::Json,
        ReportFormat::Jsonl,
        ReportFormat::Junit,
        ReportFormat::Text,
    ];

    pub fn file_name(&self) -> &'static str {
        match self {
            ReportFormat::Json => "summary.json",
            ReportFormat::Jsonl => "results.jsonl",
            ReportFormat::Junit => "junit.xml",
            ReportFormat::Text => "report.txt",
        }
    }

    pub fn render(&self, summary: &RunSummary) -> Result<String> {
        match self {
            ReportFormat::Json => summary.to_json(),
            ReportFormat::Jsonl => summary.to_json_lines(),
            ReportFormat::Junit => Ok(summary.to_junit_xml()),
            ReportFormat::Text => Ok(summary.to_text()),
        }
    }
}

impl FromStr for ReportFormat {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ReportFormat::Json),
            "jsonl" | "json-lines" | "ndjson" => Ok(ReportFormat::Jsonl),
            "junit" | "xml" => Ok(ReportFormat::Junit),
            "text" | "txt" => Ok(ReportFormat::Text),
            other => Err(FabricError::Parse(format!("unknown report format: {}", other))),
        }
    }
}

/// Write one file per format into `dir`, creating it if needed.
pub fn write_reports(summary: &RunSummary, dir: &Path, formats: &[ReportFormat]) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    let mut written = Vec::with_capacity(formats.len());
    for format in formats {
        let path = dir.join(format.file_name());
        std::fs::write(&path, format.render(summary)?)?;
        tracing::info!(path = %path.display(), "report written");
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run() -> TestRun {
        let results = vec![
            CheckResult::new("underlay.bgp_sessions", Category::Underlay, "leaf1", Status::Pass),
            CheckResult::new("underlay.mtu", Category::Underlay, "leaf1", Status::Fail)
                .with_blocking(false)
                .with_message("1 ports below MTU 9050, 0 ports missing")
                .with_observed(json!({"below": [{"port": "swp1", "mtu": 1500}]})),
            CheckResult::new("dataplane.tenant_isolation", Category::DataPlane, "host1", Status::Fail)
                .with_message("unexpected reachability"),
            CheckResult::skipped("performance.ring", Category::Performance, "ring(4)", "blocked by an earlier failure")
                .with_blocked_by("dataplane.tenant_isolation on host1"),
        ];
        TestRun::new("lab<1>").seal(results, false)
    }

    #[test]
    fn test_summary_totals() {
        let s = RunSummary::of(&run());
        assert_eq!(s.schema_version, 1);
        assert_eq!(
            s.totals,
            Totals {
                total: 4,
                pass: 1,
                fail: 2,
                error: 0,
                skipped: 1
            }
        );
        let cats: Vec<Category> = s.categories.iter().map(|c| c.category).collect();
        assert_eq!(cats, vec![Category::Underlay, Category::DataPlane, Category::Performance]);
        assert_eq!(s.blocking_failures, vec!["dataplane.tenant_isolation on host1"]);
        assert_eq!(s.status, RunStatus::Fail);
    }

    #[test]
    fn test_json_roundtrip_and_version() {
        let s = RunSummary::of(&run());
        let parsed = RunSummary::from_json(&s.to_json().unwrap()).unwrap();
        assert_eq!(parsed, s);

        let mut v: serde_json::Value = serde_json::from_str(&s.to_json().unwrap()).unwrap();
        v["schema_version"] = json!(2);
        assert!(matches!(
            RunSummary::from_json(&v.to_string()),
            Err(FabricError::UnsupportedVersion { what: "report", got: 2, .. })
        ));
    }

    #[test]
    fn test_json_lines() {
        let s = RunSummary::of(&run());
        let text = s.to_json_lines().unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 5);
        let last: serde_json::Value = serde_json::from_str(lines[4]).unwrap();
        assert_eq!(last["totals"]["total"], 4);
        assert_eq!(last["results"], json!([]));
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["check_id"], "underlay.bgp_sessions");
    }

    #[test]
    fn test_junit_xml() {
        let xml = RunSummary::of(&run()).to_junit_xml();
        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("<testsuites name=\"lab&lt;1&gt;\" tests=\"4\" failures=\"2\""));
        assert!(xml.contains("<testsuite name=\"underlay\" tests=\"2\""));
        assert!(xml.contains("classname=\"dataplane.tenant_isolation\""));
        assert!(xml.contains("<failure message=\"unexpected reachability\">"));
        assert!(xml.contains("<skipped message=\"blocked by an earlier failure\" />"));
        assert!(xml.trim_end().ends_with("</testsuites>"));
    }

    #[test]
    fn test_text_rendering() {
        let text = RunSummary::of(&run()).to_text();
        assert!(text.contains("[underlay] 1 pass, 1 fail"));
        assert!(text.contains("FAIL    underlay.mtu @ leaf1 (non-blocking)"));
        assert!(text.contains("blocked by dataplane.tenant_isolation on host1"));
        assert!(text.contains("Blocking failures:"));
        assert!(text.contains("FAIL 1/4 passed (2 failed, 0 errors, 1 skipped)"));
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("JSON".parse::<ReportFormat>().unwrap(), ReportFormat::Json);
        assert_eq!("ndjson".parse::<ReportFormat>().unwrap(), ReportFormat::Jsonl);
        assert_eq!("xml".parse::<ReportFormat>().unwrap(), ReportFormat::Junit);
        assert!("pdf".parse::<ReportFormat>().is_err());
    }

    #[test]
    fn test_write_reports() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("reports");
        let written = write_reports(&RunSummary::of(&run()), &out, &ReportFormat::ALL).unwrap();
        assert_eq!(written.len(), 4);
        for path in written {
            assert!(path.exists());
        }
        let text = std::fs::read_to_string(out.join("summary.json")).unwrap();
        assert!(text.contains("\"schema_version\": 1"));
    }
}
