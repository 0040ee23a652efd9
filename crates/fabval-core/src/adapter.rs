//! Narrow interfaces to the outside world.
//!
//! The core never talks to hardware itself. It issues [`Command`]s through a
//! [`DeviceAdapter`] and drives traffic through a [`TrafficGenerator`]; both
//! are implemented outside the core (an SSH adapter in the CLI crate, the
//! simulated fabric in [`crate::sim`]).

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::topology::{Device, DeviceId};

/// Failure of a single adapter call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AdapterError {
    #[error("device {device} unreachable: {reason}")]
    Unreachable { device: DeviceId, reason: String },

    #[error("command on {device} timed out after {timeout_ms}ms")]
    Timeout { device: DeviceId, timeout_ms: u64 },

    #[error("malformed response from {device}: {reason}")]
    MalformedResponse {
        device: DeviceId,
        reason: String,
        /// Raw payload as received, kept for diagnosis.
        raw: String,
    },
}

impl AdapterError {
    /// Unreachable and Timeout may clear on retry; a malformed payload will not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AdapterError::Unreachable { .. } | AdapterError::Timeout { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AdapterError::Unreachable { .. } => "unreachable",
            AdapterError::Timeout { .. } => "timeout",
            AdapterError::MalformedResponse { .. } => "malformed_response",
        }
    }

    pub fn malformed(device: &DeviceId, reason: impl Into<String>, raw: impl Into<String>) -> Self {
        AdapterError::MalformedResponse {
            device: device.clone(),
            reason: reason.into(),
            raw: raw.into(),
        }
    }
}

/// Commands the core may issue. All but the fault-injection variants are
/// read-only state inspection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    BgpSummary,
    RouteSummary,
    EvpnSummary,
    VniTable,
    MacTable,
    InterfaceTable,
    Ping { target: IpAddr, count: u32 },
    InterfaceDown { port: String },
    InterfaceUp { port: String },
    /// `neighbor` is the name the device's BGP configuration uses for the
    /// peer: the local interface of an unnumbered session or the peer's
    /// loopback address.
    SessionShutdown { asn: u32, neighbor: String, peer: DeviceId },
    SessionEnable { asn: u32, neighbor: String, peer: DeviceId },
}

impl Command {
    pub fn is_fault_injection(&self) -> bool {
        matches!(
            self,
            Command::InterfaceDown { .. }
                | Command::InterfaceUp { .. }
                | Command::SessionShutdown { .. }
                | Command::SessionEnable { .. }
        )
    }

    /// Operator command line for devices reached over a shell.
    pub fn render(&self) -> String {
        match self {
            Command::BgpSummary => "net show bgp summary json".to_string(),
            Command::RouteSummary => "net show route summary json".to_string(),
            Command::EvpnSummary => "net show bgp l2vpn evpn summary json".to_string(),
            Command::VniTable => "net show evpn vni json".to_string(),
            Command::MacTable => "net show evpn mac vni all json".to_string(),
            Command::InterfaceTable => "net show interface json".to_string(),
            Command::Ping { target, count } => {
                format!("ping -c {} -i 0.2 -W 1 {}", count, target)
            }
            Command::InterfaceDown { port } => format!("sudo ip link set {} down", port),
            Command::InterfaceUp { port } => format!("sudo ip link set {} up", port),
            Command::SessionShutdown { asn, neighbor, .. } => format!(
                "sudo vtysh -c 'conf t' -c 'router bgp {}' -c 'neighbor {} shutdown'",
                asn, neighbor
            ),
            Command::SessionEnable { asn, neighbor, .. } => format!(
                "sudo vtysh -c 'conf t' -c 'router bgp {}' -c 'no neighbor {} shutdown'",
                asn, neighbor
            ),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Routing session as reported by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub peer: String,
    pub state: String,
    pub prefixes_received: u64,
}

impl SessionState {
    pub fn is_established(&self) -> bool {
        self.state.eq_ignore_ascii_case("established")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VniEntry {
    pub vni: u32,
    pub remote_vteps: u32,
    pub mac_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacEntry {
    pub mac: String,
    pub vni: u32,
    /// `local` or the remote VTEP address.
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceState {
    pub name: String,
    pub up: bool,
    pub mtu: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingStats {
    pub transmitted: u32,
    pub received: u32,
    pub rtt_avg_ms: Option<f64>,
}

impl PingStats {
    pub fn loss_pct(&self) -> f64 {
        if self.transmitted == 0 {
            return 100.0;
        }
        let lost = self.transmitted.saturating_sub(self.received);
        lost as f64 * 100.0 / self.transmitted as f64
    }
}

/// Structured result of a successful command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum CommandOutput {
    Sessions(Vec<SessionState>),
    RouteSummary { total: u64 },
    Vnis(Vec<VniEntry>),
    Macs(Vec<MacEntry>),
    Interfaces(Vec<InterfaceState>),
    Ping(PingStats),
    Ack,
}

impl CommandOutput {
    pub fn kind(&self) -> &'static str {
        match self {
            CommandOutput::Sessions(_) => "sessions",
            CommandOutput::RouteSummary { .. } => "route_summary",
            CommandOutput::Vnis(_) => "vnis",
            CommandOutput::Macs(_) => "macs",
            CommandOutput::Interfaces(_) => "interfaces",
            CommandOutput::Ping(_) => "ping",
            CommandOutput::Ack => "ack",
        }
    }
}

/// Executes one command against one device.
///
/// Implementations must be callable concurrently for distinct devices. The
/// orchestrator never issues two commands to the same device at once, so an
/// adapter may assume a single in-flight command per device.
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    async fn execute(
        &self,
        device: &Device,
        command: &Command,
        timeout: Duration,
    ) -> Result<CommandOutput, AdapterError>;
}

/// One traffic flow to drive between two hosts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSpec {
    pub src: DeviceId,
    pub dst: DeviceId,
    pub duration: Duration,
    pub streams: u32,
}

/// Measurements collected for one flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSample {
    pub src: DeviceId,
    pub dst: DeviceId,
    /// Average throughput over the flow's duration.
    pub throughput_gbps: f64,
    /// Per-probe latency samples taken while the flow ran.
    pub latency_ms: Vec<f64>,
}

/// Drives traffic between hosts (iperf3 or similar).
#[async_trait]
pub trait TrafficGenerator: Send + Sync {
    async fn run_flow(
        &self,
        src: &Device,
        dst: &Device,
        flow: &FlowSpec,
        timeout: Duration,
    ) -> Result<FlowSample, AdapterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let dev = DeviceId::from("leaf1");
        assert!(AdapterError::Unreachable {
            device: dev.clone(),
            reason: "no route".into()
        }
        .is_transient());
        assert!(AdapterError::Timeout {
            device: dev.clone(),
            timeout_ms: 500
        }
        .is_transient());
        assert!(!AdapterError::malformed(&dev, "bad json", "{").is_transient());
    }

    #[test]
    fn test_fault_injection_commands() {
        assert!(!Command::BgpSummary.is_fault_injection());
        assert!(!Command::Ping {
            target: "192.168.10.2".parse().unwrap(),
            count: 3
        }
        .is_fault_injection());
        assert!(Command::InterfaceDown {
            port: "swp1".into()
        }
        .is_fault_injection());
        assert!(Command::SessionShutdown {
            asn: 65011,
            neighbor: "swp51".into(),
            peer: DeviceId::from("spine1")
        }
        .is_fault_injection());
    }

    #[test]
    fn test_render_commands() {
        assert_eq!(Command::BgpSummary.render(), "net show bgp summary json");
        assert_eq!(
            Command::Ping {
                target: "10.0.0.2".parse().unwrap(),
                count: 10
            }
            .render(),
            "ping -c 10 -i 0.2 -W 1 10.0.0.2"
        );
        assert_eq!(
            Command::InterfaceDown { port: "swp3".into() }.to_string(),
            "sudo ip link set swp3 down"
        );
        let shut = Command::SessionShutdown {
            asn: 65011,
            neighbor: "swp51".into(),
            peer: DeviceId::from("spine1"),
        };
        assert_eq!(
            shut.render(),
            "sudo vtysh -c 'conf t' -c 'router bgp 65011' -c 'neighbor swp51 shutdown'"
        );
        let enable = Command::SessionEnable {
            asn: 65011,
            neighbor: "10.255.0.1".into(),
            peer: DeviceId::from("spine1"),
        };
        assert_eq!(
            enable.render(),
            "sudo vtysh -c 'conf t' -c 'router bgp 65011' -c 'no neighbor 10.255.0.1 shutdown'"
        );
    }

    #[test]
    fn test_ping_loss() {
        let stats = PingStats {
            transmitted: 10,
            received: 7,
            rtt_avg_ms: Some(0.25),
        };
        assert!((stats.loss_pct() - 30.0).abs() < 1e-9);
        let none = PingStats {
            transmitted: 0,
            received: 0,
            rtt_avg_ms: None,
        };
        assert_eq!(none.loss_pct(), 100.0);
    }
}
