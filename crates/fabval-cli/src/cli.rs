use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use fabval_core::{Category, ReportFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "fabval")]
#[command(about = "Validate and benchmark a spine/leaf EVPN-VXLAN fabric", long_about = None)]
pub struct Cli {
    /// Log output format; the level comes from RUST_LOG.
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a validation pass against the fabric
    Run(RunArgs),
    /// Load a topology file and print what it describes
    ValidateTopology {
        #[arg(short, long)]
        topology: PathBuf,
    },
    /// List the registered checks
    ListChecks {
        #[arg(short, long)]
        category: Option<Category>,
    },
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Topology file (.json, .yaml)
    #[arg(short, long)]
    pub topology: PathBuf,

    /// Runner configuration (.toml, .json)
    #[arg(short, long, env = "FABVAL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Categories to run, comma separated; all when omitted
    #[arg(long, value_delimiter = ',')]
    pub categories: Vec<Category>,

    /// Failure scenario such as `device:spine1@3` or `link:leaf1:spine1`;
    /// replaces the configured scenarios
    #[arg(long = "scenario")]
    pub scenarios: Vec<String>,

    /// Seconds per benchmark flow
    #[arg(long)]
    pub bench_duration: Option<u64>,

    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Report directory
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Report formats, comma separated
    #[arg(long, value_delimiter = ',', default_value = "json,junit,text")]
    pub format: Vec<ReportFormat>,

    /// Run against the built-in fabric simulator instead of real devices
    #[arg(long)]
    pub simulate: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_arguments() {
        let cli = Cli::try_parse_from([
            "fabval",
            "run",
            "--topology",
            "lab.yaml",
            "--categories",
            "underlay,evpn",
            "--scenario",
            "device:spine1@3",
            "--scenario",
            "link:leaf1:spine2",
            "--bench-duration",
            "5",
            "--simulate",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Text);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.topology, PathBuf::from("lab.yaml"));
        assert_eq!(args.categories, vec![Category::Underlay, Category::Overlay]);
        assert_eq!(args.scenarios.len(), 2);
        assert_eq!(args.bench_duration, Some(5));
        assert_eq!(args.format, vec![ReportFormat::Json, ReportFormat::Junit, ReportFormat::Text]);
        assert!(args.simulate);
        assert!(args.output.is_none());
    }

    #[test]
    fn test_global_log_format_and_formats() {
        let cli = Cli::try_parse_from([
            "fabval",
            "run",
            "-t",
            "lab.json",
            "--format",
            "jsonl,xml",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.format, vec![ReportFormat::Jsonl, ReportFormat::Junit]);
    }

    #[test]
    fn test_rejects_unknown_category() {
        assert!(Cli::try_parse_from(["fabval", "run", "-t", "lab.json", "--categories", "latency"]).is_err());
        assert!(Cli::try_parse_from(["fabval", "run"]).is_err());
    }

    #[test]
    fn test_list_checks_filter() {
        let cli = Cli::try_parse_from(["fabval", "list-checks", "--category", "data-plane"]).unwrap();
        match cli.command {
            Command::ListChecks { category } => assert_eq!(category, Some(Category::DataPlane)),
            other => panic!("unexpected {:?}", other),
        }
    }
}
