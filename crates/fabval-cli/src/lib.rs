//! Command-line runner for fabric validation: configuration, the ssh and
//! iperf3 adapters, and report output.

pub mod cli;
pub mod config;
pub mod runner;
pub mod ssh;

pub use config::RunnerConfig;
pub use runner::{dispatch, RunOutcome};
