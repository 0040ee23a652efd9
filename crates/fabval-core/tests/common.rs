//! Shared fixtures for fabric validation integration tests.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use fabval_core::{
    Category, CheckRegistry, InjectorSettings, Orchestrator, OrchestratorConfig, RetryPolicy, SimFabric,
    SimSettings, Topology,
};

/// Two spines, four leaves, two tenant segments with two hosts each.
pub const FABRIC: &str = r#"{
    "version": 1,
    "name": "lab",
    "devices": [
        {"id": "spine1", "role": "spine", "asn": 65001, "loopback": "10.255.0.1"},
        {"id": "spine2", "role": "spine", "asn": 65001, "loopback": "10.255.0.2"},
        {"id": "leaf1", "role": "leaf", "asn": 65011, "loopback": "10.255.1.1"},
        {"id": "leaf2", "role": "leaf", "asn": 65012, "loopback": "10.255.1.2"},
        {"id": "leaf3", "role": "leaf", "asn": 65013, "loopback": "10.255.1.3"},
        {"id": "leaf4", "role": "leaf", "asn": 65014, "loopback": "10.255.1.4"}
    ],
    "hosts": [
        {"id": "host1", "data_ip": "192.168.10.1", "segment": 10, "mac": "44:38:39:00:00:01"},
        {"id": "host2", "data_ip": "192.168.10.2", "segment": 10, "mac": "44:38:39:00:00:02"},
        {"id": "host3", "data_ip": "192.168.20.3", "segment": 20, "mac": "44:38:39:00:00:03"},
        {"id": "host4", "data_ip": "192.168.20.4", "segment": 20, "mac": "44:38:39:00:00:04"}
    ],
    "links": [
        {"a": "spine1", "b": "leaf1", "a_port": "swp1", "b_port": "swp51"},
        {"a": "spine1", "b": "leaf2", "a_port": "swp2", "b_port": "swp51"},
        {"a": "spine1", "b": "leaf3", "a_port": "swp3", "b_port": "swp51"},
        {"a": "spine1", "b": "leaf4", "a_port": "swp4", "b_port": "swp51"},
        {"a": "spine2", "b": "leaf1", "a_port": "swp1", "b_port": "swp52"},
        {"a": "spine2", "b": "leaf2", "a_port": "swp2", "b_port": "swp52"},
        {"a": "spine2", "b": "leaf3", "a_port": "swp3", "b_port": "swp52"},
        {"a": "spine2", "b": "leaf4", "a_port": "swp4", "b_port": "swp52"},
        {"a": "leaf1", "b": "host1", "a_port": "swp1", "b_port": "eth1", "capacity_gbps": 10},
        {"a": "leaf2", "b": "host2", "a_port": "swp1", "b_port": "eth1", "capacity_gbps": 10},
        {"a": "leaf3", "b": "host3", "a_port": "swp1", "b_port": "eth1", "capacity_gbps": 10},
        {"a": "leaf4", "b": "host4", "a_port": "swp1", "b_port": "eth1", "capacity_gbps": 10}
    ]
}"#;

pub fn fabric() -> Arc<Topology> {
    Arc::new(Topology::from_json_str(FABRIC).unwrap())
}

pub fn sim() -> Arc<SimFabric> {
    Arc::new(SimFabric::new(fabric()))
}

pub fn sim_with(settings: SimSettings) -> Arc<SimFabric> {
    Arc::new(SimFabric::with_settings(fabric(), settings))
}

/// Fast polling and short backoff so time-driven tests stay small.
pub fn config(categories: &[Category]) -> OrchestratorConfig {
    OrchestratorConfig {
        categories: categories.iter().copied().collect::<BTreeSet<_>>(),
        injector: InjectorSettings {
            poll_interval: Duration::from_millis(100),
            command_timeout: Duration::from_secs(2),
            retry: RetryPolicy::once(),
        },
        ..Default::default()
    }
}

pub fn orchestrator(sim: &Arc<SimFabric>, config: OrchestratorConfig) -> Orchestrator {
    Orchestrator::new(
        sim.topology().clone(),
        sim.clone(),
        CheckRegistry::standard(&Default::default()),
        config,
    )
    .unwrap()
}
