//! Shared fixtures for runner integration tests.

use std::path::{Path, PathBuf};

use clap::Parser;
use fabval_cli::cli::{Cli, Command, RunArgs};

/// Two spines, two leaves, one tenant segment.
pub const TOPOLOGY: &str = r#"{
    "version": 1,
    "name": "bench-pod",
    "devices": [
        {"id": "spine1", "role": "spine", "asn": 65001, "loopback": "10.255.0.1"},
        {"id": "spine2", "role": "spine", "asn": 65001, "loopback": "10.255.0.2"},
        {"id": "leaf1", "role": "leaf", "asn": 65011, "loopback": "10.255.1.1"},
        {"id": "leaf2", "role": "leaf", "asn": 65012, "loopback": "10.255.1.2"}
    ],
    "hosts": [
        {"id": "host1", "data_ip": "192.168.10.1", "segment": 10, "mac": "44:38:39:00:00:01"},
        {"id": "host2", "data_ip": "192.168.10.2", "segment": 10, "mac": "44:38:39:00:00:02"}
    ],
    "links": [
        {"a": "spine1", "b": "leaf1", "a_port": "swp1", "b_port": "swp51"},
        {"a": "spine1", "b": "leaf2", "a_port": "swp2", "b_port": "swp51"},
        {"a": "spine2", "b": "leaf1", "a_port": "swp1", "b_port": "swp52"},
        {"a": "spine2", "b": "leaf2", "a_port": "swp2", "b_port": "swp52"},
        {"a": "leaf1", "b": "host1", "a_port": "swp1", "b_port": "eth1", "capacity_gbps": 10},
        {"a": "leaf2", "b": "host2", "a_port": "swp1", "b_port": "eth1", "capacity_gbps": 10}
    ]
}"#;

pub fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

/// `fabval run --simulate --topology <topology> --output <dir>/reports <extra..>`
pub fn run_args(dir: &Path, topology: &Path, extra: &[&str]) -> RunArgs {
    let output = dir.join("reports");
    let mut argv = vec![
        "fabval".to_string(),
        "run".to_string(),
        "--simulate".to_string(),
        "--topology".to_string(),
        topology.display().to_string(),
        "--output".to_string(),
        output.display().to_string(),
    ];
    argv.extend(extra.iter().map(|s| s.to_string()));
    match Cli::try_parse_from(argv).unwrap().command {
        Command::Run(args) => args,
        other => panic!("unexpected command {:?}", other),
    }
}
