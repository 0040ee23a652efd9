mod common;

use common::{run_args, write, TOPOLOGY};
use fabval_cli::runner::{self, EXIT_CANCELLED, EXIT_FAILED, EXIT_PASSED};
use fabval_core::{Category, RunStatus, RunSummary, Status};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_simulated_run_writes_reports() {
    let dir = TempDir::new().unwrap();
    let topology = write(dir.path(), "pod.json", TOPOLOGY);
    let args = run_args(
        dir.path(),
        &topology,
        &["--categories", "underlay,overlay,dataplane", "--format", "json,jsonl,junit,text"],
    );

    let outcome = runner::run(&args, CancellationToken::new()).await.unwrap();
    assert_eq!(outcome.exit_code, EXIT_PASSED);
    assert_eq!(outcome.reports.len(), 4);
    for path in &outcome.reports {
        assert!(path.exists(), "{} missing", path.display());
    }

    let json = std::fs::read_to_string(dir.path().join("reports/summary.json")).unwrap();
    let summary = RunSummary::from_json(&json).unwrap();
    assert_eq!(summary.status, RunStatus::Pass);
    assert_eq!(summary.topology, "bench-pod");
    assert_eq!(summary.totals.fail, 0);
    assert_eq!(summary.totals.error, 0);
    assert_eq!(summary.categories.len(), 3);
    assert_eq!(summary.totals.total, summary.results.len());

    let junit = std::fs::read_to_string(dir.path().join("reports/junit.xml")).unwrap();
    assert!(junit.contains("<testsuites"));
    assert!(junit.contains("underlay"));
}

#[tokio::test]
async fn test_missing_topology_is_a_setup_error() {
    let dir = TempDir::new().unwrap();
    let args = run_args(dir.path(), &dir.path().join("absent.json"), &[]);
    let err = runner::run(&args, CancellationToken::new()).await.unwrap_err();
    assert!(format!("{:#}", err).contains("loading topology"));
    assert!(!dir.path().join("reports").exists());
}

#[tokio::test]
async fn test_scenario_naming_unknown_device_is_rejected() {
    let dir = TempDir::new().unwrap();
    let topology = write(dir.path(), "pod.json", TOPOLOGY);
    let args = run_args(dir.path(), &topology, &["--scenario", "device:spine9"]);
    let err = runner::run(&args, CancellationToken::new()).await.unwrap_err();
    assert!(format!("{:#}", err).contains("validating failure scenarios"));
}

#[tokio::test(start_paused = true)]
async fn test_spine_failure_scenario_from_flag() {
    let dir = TempDir::new().unwrap();
    let topology = write(dir.path(), "pod.json", TOPOLOGY);
    let args = run_args(
        dir.path(),
        &topology,
        &["--categories", "resilience", "--scenario", "device:spine1@3"],
    );

    let outcome = runner::run(&args, CancellationToken::new()).await.unwrap();
    let results = &outcome.summary.results;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].category, Category::Resilience);
    assert_eq!(results[0].status, Status::Pass, "{:?}", results[0].observed);
    assert_eq!(outcome.exit_code, EXIT_PASSED);
}

#[tokio::test(start_paused = true)]
async fn test_benchmark_from_config_file() {
    let dir = TempDir::new().unwrap();
    let topology = write(dir.path(), "pod.json", TOPOLOGY);
    let config = write(
        dir.path(),
        "fabval.toml",
        r#"
bench_duration_secs = 1

[[benchmarks]]
name = "east-west"
pattern = { type = "point_to_point", src = "host1", dst = "host2" }
targets = { min_aggregate_gbps = 9.0 }

[[benchmarks]]
name = "too-fast"
pattern = { type = "point_to_point", src = "host2", dst = "host1" }
targets = { min_aggregate_gbps = 40.0 }
"#,
    );
    let config_arg = config.display().to_string();
    let args = run_args(
        dir.path(),
        &topology,
        &["--config", &config_arg, "--categories", "performance"],
    );

    let outcome = runner::run(&args, CancellationToken::new()).await.unwrap();
    let results = &outcome.summary.results;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].check_id, "performance.east-west");
    assert_eq!(results[0].status, Status::Pass);
    assert_eq!(results[1].check_id, "performance.too-fast");
    assert_eq!(results[1].status, Status::Fail);
    assert_eq!(outcome.exit_code, EXIT_FAILED);
}

#[tokio::test]
async fn test_missing_baseline_is_a_setup_error() {
    let dir = TempDir::new().unwrap();
    let topology = write(dir.path(), "pod.json", TOPOLOGY);
    let config = write(
        dir.path(),
        "fabval.json",
        r#"{
            "baseline": "/nonexistent/baseline.json",
            "benchmarks": [{"name": "ring", "pattern": {"type": "ring"}}]
        }"#,
    );
    let config_arg = config.display().to_string();
    let args = run_args(dir.path(), &topology, &["--config", &config_arg]);
    let err = runner::run(&args, CancellationToken::new()).await.unwrap_err();
    assert!(format!("{:#}", err).contains("loading baseline"));
}

#[tokio::test]
async fn test_cancelled_run_exits_130() {
    let dir = TempDir::new().unwrap();
    let topology = write(dir.path(), "pod.json", TOPOLOGY);
    let args = run_args(dir.path(), &topology, &[]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = runner::run(&args, cancel).await.unwrap();
    assert_eq!(outcome.exit_code, EXIT_CANCELLED);
    assert!(outcome.summary.cancelled);
    assert!(outcome
        .summary
        .results
        .iter()
        .all(|r| r.status == Status::Skipped));
    assert!(dir.path().join("reports/report.txt").exists());
}
