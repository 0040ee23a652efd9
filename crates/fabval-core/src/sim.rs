//! Simulated fabric.
//!
//! [`SimFabric`] answers device commands and drives traffic from a model of
//! the topology, so a full run works without hardware. Fault knobs let tests
//! and dry runs break things on purpose; the command log records ordering
//! and per-device concurrency.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::adapter::{
    AdapterError, Command, CommandOutput, DeviceAdapter, FlowSample, FlowSpec, InterfaceState, MacEntry,
    PingStats, SessionState, TrafficGenerator, VniEntry,
};
use crate::parse::parse_output;
use crate::probes::expected_evpn_routes;
use crate::stats::round3;
use crate::topology::{Device, DeviceId, Link, Role, Topology};

const GARBAGE: &str = "<!DOCTYPE html><html><body>502 Bad Gateway</body></html>";

/// Behaviour of a healthy simulated fabric.
#[derive(Debug, Clone)]
pub struct SimSettings {
    /// How long a session stays established after its link goes down.
    pub detection_delay: Duration,
    /// How long data-plane paths through a failed link keep dropping
    /// packets before traffic moves to the remaining paths.
    pub recovery_delay: Duration,
    pub command_latency: Duration,
    /// Fraction of the fair share a flow achieves.
    pub link_efficiency: f64,
    pub base_latency_ms: f64,
    pub mtu: u32,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            detection_delay: Duration::from_millis(300),
            recovery_delay: Duration::from_millis(900),
            command_latency: Duration::ZERO,
            link_efficiency: 0.94,
            base_latency_ms: 0.248,
            mtu: 9216,
        }
    }
}

/// One executed command. `started` and `finished` come from a single
/// sequence shared by every device.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRecord {
    pub device: DeviceId,
    pub command: Command,
    pub started: u64,
    pub finished: u64,
}

struct SimState {
    down_ports: HashMap<(DeviceId, String), Instant>,
    /// (device, peer) sessions shut from `device`.
    shut_sessions: BTreeSet<(DeviceId, DeviceId)>,
    forced_down: BTreeSet<(DeviceId, DeviceId)>,
    unreachable: BTreeSet<DeviceId>,
    transient: HashMap<DeviceId, u32>,
    garbage: BTreeSet<DeviceId>,
    leaked: BTreeSet<(u32, u32)>,
    mtu: HashMap<(DeviceId, String), u32>,
    throughput_scale: f64,
    sending: HashMap<DeviceId, u32>,
    receiving: HashMap<DeviceId, u32>,
}

impl SimState {
    fn new() -> Self {
        Self {
            down_ports: HashMap::new(),
            shut_sessions: BTreeSet::new(),
            forced_down: BTreeSet::new(),
            unreachable: BTreeSet::new(),
            transient: HashMap::new(),
            garbage: BTreeSet::new(),
            leaked: BTreeSet::new(),
            mtu: HashMap::new(),
            throughput_scale: 1.0,
            sending: HashMap::new(),
            receiving: HashMap::new(),
        }
    }
}

fn pair(a: &DeviceId, b: &DeviceId) -> (DeviceId, DeviceId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

fn segment_pair(x: u32, y: u32) -> (u32, u32) {
    (x.min(y), x.max(y))
}

/// A simulated fabric implementing both [`DeviceAdapter`] and
/// [`TrafficGenerator`].
pub struct SimFabric {
    topology: Arc<Topology>,
    settings: SimSettings,
    state: Mutex<SimState>,
    in_flight: DashMap<DeviceId, usize>,
    violations: AtomicUsize,
    seq: AtomicU64,
    log: Mutex<Vec<CommandRecord>>,
}

impl SimFabric {
    pub fn new(topology: Arc<Topology>) -> Self {
        Self::with_settings(topology, SimSettings::default())
    }

    pub fn with_settings(topology: Arc<Topology>, settings: SimSettings) -> Self {
        Self {
            topology,
            settings,
            state: Mutex::new(SimState::new()),
            in_flight: DashMap::new(),
            violations: AtomicUsize::new(0),
            seq: AtomicU64::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn settings(&self) -> &SimSettings {
        &self.settings
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every command refused until [`SimFabric::set_reachable`].
    pub fn set_unreachable(&self, device: &str) {
        self.state().unreachable.insert(DeviceId::from(device));
    }

    pub fn set_reachable(&self, device: &str) {
        self.state().unreachable.remove(device);
    }

    /// The next `count` commands to `device` time out.
    pub fn fail_next(&self, device: &str, count: u32) {
        self.state().transient.insert(DeviceId::from(device), count);
    }

    /// `device` answers every command with an unparseable payload.
    pub fn return_garbage(&self, device: &str) {
        self.state().garbage.insert(DeviceId::from(device));
    }

    /// Let traffic cross between two segments.
    pub fn leak_segments(&self, x: u32, y: u32) {
        self.state().leaked.insert(segment_pair(x, y));
    }

    /// Hold the session between `a` and `b` down on both sides.
    pub fn session_down(&self, a: &str, b: &str) {
        self.state()
            .forced_down
            .insert(pair(&DeviceId::from(a), &DeviceId::from(b)));
    }

    pub fn session_restore(&self, a: &str, b: &str) {
        self.state()
            .forced_down
            .remove(&pair(&DeviceId::from(a), &DeviceId::from(b)));
    }

    pub fn set_mtu(&self, device: &str, port: &str, mtu: u32) {
        self.state()
            .mtu
            .insert((DeviceId::from(device), port.to_string()), mtu);
    }

    /// Scale every flow's throughput.
    pub fn set_throughput_scale(&self, scale: f64) {
        self.state().throughput_scale = scale;
    }

    /// Ports and sessions currently held down by fault injection.
    pub fn applied_faults(&self) -> usize {
        let st = self.state();
        st.down_ports.len() + st.shut_sessions.len()
    }

    pub fn commands(&self) -> Vec<CommandRecord> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Times a device received a command while another one was in flight.
    pub fn concurrent_command_violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }

    fn link_down_since(&self, st: &SimState, link: &Link) -> Option<Instant> {
        let a = st.down_ports.get(&(link.a.clone(), link.a_port.clone()));
        let b = st.down_ports.get(&(link.b.clone(), link.b_port.clone()));
        match (a, b) {
            (Some(x), Some(y)) => Some(*x.min(y)),
            (Some(x), None) | (None, Some(x)) => Some(*x),
            (None, None) => None,
        }
    }

    fn is_fabric(&self, id: &DeviceId) -> bool {
        self.topology
            .device(id.as_str())
            .map(|d| d.role.is_fabric())
            .unwrap_or(false)
    }

    /// Whether the routing session between `a` and `b` is established.
    fn session_up(&self, st: &SimState, a: &DeviceId, b: &DeviceId, now: Instant) -> bool {
        let Some(link) = self.topology.link_between(a.as_str(), b.as_str()) else {
            return false;
        };
        if st.forced_down.contains(&pair(a, b))
            || st.shut_sessions.contains(&(a.clone(), b.clone()))
            || st.shut_sessions.contains(&(b.clone(), a.clone()))
        {
            return false;
        }
        match self.link_down_since(st, link) {
            Some(at) => now.saturating_duration_since(at) < self.settings.detection_delay,
            None => true,
        }
    }

    /// Whether the control plane still forwards over `link`.
    fn carries(&self, st: &SimState, link: &Link, now: Instant) -> bool {
        if self.is_fabric(&link.a) && self.is_fabric(&link.b) {
            self.session_up(st, &link.a, &link.b, now)
        } else {
            self.link_down_since(st, link).is_none()
        }
    }

    fn reachable(&self, st: &SimState, from: &str, now: Instant) -> BTreeSet<DeviceId> {
        self.topology
            .reachable_from(from, |l: &Link| self.carries(st, l, now))
    }

    fn stranded(&self, st: &SimState, now: Instant) -> BTreeSet<DeviceId> {
        let dead: Vec<(DeviceId, DeviceId)> = self
            .topology
            .links()
            .iter()
            .filter(|l| !self.carries(st, l, now))
            .map(|l| (l.a.clone(), l.b.clone()))
            .collect();
        self.topology.stranded_by(&BTreeSet::new(), &dead)
    }

    fn host_mac(&self, host: &Device) -> String {
        if let Some(mac) = &host.mac {
            return mac.clone();
        }
        let idx = self
            .topology
            .by_role(Role::Host)
            .iter()
            .position(|h| h.id == host.id)
            .unwrap_or(0);
        format!("02:00:00:00:{:02x}:{:02x}", (idx >> 8) & 0xff, idx & 0xff)
    }

    fn sessions(&self, st: &SimState, device: &Device, now: Instant, evpn: bool) -> Vec<SessionState> {
        let fabric_reach = self
            .reachable(st, device.id.as_str(), now)
            .iter()
            .filter(|id| self.is_fabric(id))
            .count() as u64;
        let stranded = self.stranded(st, now);
        let evpn_routes = expected_evpn_routes(&self.topology, device.id.as_str(), |id| stranded.contains(id));
        self.topology
            .neighbors(device.id.as_str())
            .into_iter()
            .filter(|n| n.role.is_fabric())
            .filter(|n| !evpn || n.role != device.role)
            .map(|n| {
                let up = self.session_up(st, &device.id, &n.id, now);
                SessionState {
                    peer: n.id.to_string(),
                    state: if up { "Established" } else { "Idle" }.to_string(),
                    prefixes_received: match (up, evpn) {
                        (false, _) => 0,
                        (true, true) => evpn_routes,
                        (true, false) => fabric_reach,
                    },
                }
            })
            .collect()
    }

    fn ping(&self, st: &SimState, device: &Device, target: std::net::IpAddr, count: u32, now: Instant) -> PingStats {
        let lost = PingStats {
            transmitted: count,
            received: 0,
            rtt_avg_ms: None,
        };
        let Some(dst) = self.topology.device_by_data_ip(target) else {
            return lost;
        };
        if let (Some(x), Some(y)) = (device.segment, dst.segment) {
            if x != y && !st.leaked.contains(&segment_pair(x, y)) {
                return lost;
            }
        }
        let converging = self
            .topology
            .path_links(device.id.as_str(), dst.id.as_str())
            .into_iter()
            .filter_map(|l| self.link_down_since(st, l))
            .any(|at| now.saturating_duration_since(at) < self.settings.recovery_delay);
        if converging || !self.reachable(st, device.id.as_str(), now).contains(&dst.id) {
            return lost;
        }
        PingStats {
            transmitted: count,
            received: count,
            rtt_avg_ms: Some(self.settings.base_latency_ms),
        }
    }

    fn port_exists(&self, device: &Device, port: &str) -> bool {
        self.topology
            .links_of(device.id.as_str())
            .iter()
            .any(|l| l.port_on(device.id.as_str()) == Some(port))
    }

    fn answer(&self, device: &Device, command: &Command, timeout: Duration) -> Result<CommandOutput, AdapterError> {
        let now = Instant::now();
        let mut st = self.state();
        if st.unreachable.contains(&device.id) {
            return Err(AdapterError::Unreachable {
                device: device.id.clone(),
                reason: "no route to management address".to_string(),
            });
        }
        if let Some(left) = st.transient.get_mut(&device.id) {
            if *left > 0 {
                *left -= 1;
                return Err(AdapterError::Timeout {
                    device: device.id.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        }
        if st.garbage.contains(&device.id) {
            return parse_output(&device.id, command, GARBAGE);
        }

        let fabric_only = |what: &str| {
            AdapterError::malformed(&device.id, format!("{} not available on a host", what), "")
        };
        let id = device.id.as_str();
        match command {
            Command::BgpSummary | Command::EvpnSummary | Command::RouteSummary if !device.role.is_fabric() => {
                Err(fabric_only(command.render().as_str()))
            }
            Command::BgpSummary => Ok(CommandOutput::Sessions(self.sessions(&st, device, now, false))),
            Command::EvpnSummary => Ok(CommandOutput::Sessions(self.sessions(&st, device, now, true))),
            Command::RouteSummary => {
                let total = self
                    .reachable(&st, id, now)
                    .iter()
                    .filter(|d| self.is_fabric(d))
                    .count() as u64;
                Ok(CommandOutput::RouteSummary { total })
            }
            Command::VniTable => {
                let reach = self.reachable(&st, id, now);
                let entries = self
                    .topology
                    .segments_on_leaf(id)
                    .into_iter()
                    .map(|vni| VniEntry {
                        vni,
                        remote_vteps: self
                            .topology
                            .remote_vteps(id, vni)
                            .into_iter()
                            .filter(|l| reach.contains(&l.id))
                            .count() as u32,
                        mac_count: self
                            .topology
                            .hosts_in_segment(vni)
                            .into_iter()
                            .filter(|h| reach.contains(&h.id))
                            .count() as u32,
                    })
                    .collect();
                Ok(CommandOutput::Vnis(entries))
            }
            Command::MacTable => {
                let reach = self.reachable(&st, id, now);
                let local: Vec<DeviceId> = self
                    .topology
                    .attached_hosts(id)
                    .into_iter()
                    .map(|h| h.id.clone())
                    .collect();
                let mut entries = Vec::new();
                for vni in self.topology.segments_on_leaf(id) {
                    for host in self.topology.hosts_in_segment(vni) {
                        if !reach.contains(&host.id) {
                            continue;
                        }
                        let location = if local.contains(&host.id) {
                            "local".to_string()
                        } else {
                            self.topology
                                .access_leaves(host.id.as_str())
                                .into_iter()
                                .find_map(|l| l.loopback)
                                .map(|ip| ip.to_string())
                                .unwrap_or_else(|| "remote".to_string())
                        };
                        entries.push(MacEntry {
                            mac: self.host_mac(host),
                            vni,
                            location,
                        });
                    }
                }
                Ok(CommandOutput::Macs(entries))
            }
            Command::InterfaceTable => {
                let table = self
                    .topology
                    .links_of(id)
                    .into_iter()
                    .filter_map(|l| {
                        let port = l.port_on(id)?.to_string();
                        Some(InterfaceState {
                            up: !st.down_ports.contains_key(&(device.id.clone(), port.clone())),
                            mtu: st
                                .mtu
                                .get(&(device.id.clone(), port.clone()))
                                .copied()
                                .unwrap_or(self.settings.mtu),
                            name: port,
                        })
                    })
                    .collect();
                Ok(CommandOutput::Interfaces(table))
            }
            Command::Ping { target, count } => Ok(CommandOutput::Ping(self.ping(&st, device, *target, *count, now))),
            Command::InterfaceDown { port } | Command::InterfaceUp { port } if !self.port_exists(device, port) => {
                Err(AdapterError::malformed(&device.id, format!("no such interface {}", port), ""))
            }
            Command::InterfaceDown { port } => {
                st.down_ports.entry((device.id.clone(), port.clone())).or_insert(now);
                Ok(CommandOutput::Ack)
            }
            Command::InterfaceUp { port } => {
                st.down_ports.remove(&(device.id.clone(), port.clone()));
                Ok(CommandOutput::Ack)
            }
            Command::SessionShutdown { peer, .. } => {
                st.shut_sessions.insert((device.id.clone(), peer.clone()));
                Ok(CommandOutput::Ack)
            }
            Command::SessionEnable { peer, .. } => {
                st.shut_sessions.remove(&(device.id.clone(), peer.clone()));
                Ok(CommandOutput::Ack)
            }
        }
    }

    fn access_capacity(&self, host: &str) -> f64 {
        self.topology
            .links_of(host)
            .iter()
            .map(|l| l.capacity_gbps)
            .sum()
    }
}

impl std::fmt::Debug for SimFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimFabric")
            .field("topology", &self.topology.name())
            .field("settings", &self.settings)
            .finish()
    }
}

/// Decrements the device's in-flight count, including when the call is
/// dropped by a timeout.
struct InFlight<'a> {
    map: &'a DashMap<DeviceId, usize>,
    device: DeviceId,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(mut n) = self.map.get_mut(&self.device) {
            *n = n.saturating_sub(1);
        }
    }
}

struct ActiveFlow<'a> {
    fabric: &'a SimFabric,
    src: DeviceId,
    dst: DeviceId,
}

impl Drop for ActiveFlow<'_> {
    fn drop(&mut self) {
        let mut st = self.fabric.state();
        if let Some(n) = st.sending.get_mut(&self.src) {
            *n = n.saturating_sub(1);
        }
        if let Some(n) = st.receiving.get_mut(&self.dst) {
            *n = n.saturating_sub(1);
        }
    }
}

#[async_trait]
impl DeviceAdapter for SimFabric {
    async fn execute(
        &self,
        device: &Device,
        command: &Command,
        timeout: Duration,
    ) -> Result<CommandOutput, AdapterError> {
        let started = self.seq.fetch_add(1, Ordering::SeqCst);
        let concurrent = {
            let mut n = self.in_flight.entry(device.id.clone()).or_insert(0);
            *n += 1;
            *n > 1
        };
        let _guard = InFlight {
            map: &self.in_flight,
            device: device.id.clone(),
        };
        if concurrent {
            warn!(device = %device.id, command = %command, "concurrent command on device");
            self.violations.fetch_add(1, Ordering::SeqCst);
        }

        if !self.settings.command_latency.is_zero() {
            tokio::time::sleep(self.settings.command_latency).await;
        }
        let result = self.answer(device, command, timeout);
        debug!(device = %device.id, command = %command, ok = result.is_ok(), "sim command");

        let finished = self.seq.fetch_add(1, Ordering::SeqCst);
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(CommandRecord {
                device: device.id.clone(),
                command: command.clone(),
                started,
                finished,
            });
        result
    }
}

#[async_trait]
impl TrafficGenerator for SimFabric {
    async fn run_flow(
        &self,
        src: &Device,
        dst: &Device,
        flow: &FlowSpec,
        _timeout: Duration,
    ) -> Result<FlowSample, AdapterError> {
        if self.state().unreachable.contains(&src.id) {
            return Err(AdapterError::Unreachable {
                device: src.id.clone(),
                reason: "traffic agent not responding".to_string(),
            });
        }
        let bottleneck = self.topology.bottleneck_gbps(src.id.as_str(), dst.id.as_str());
        if bottleneck <= 0.0 {
            return Err(AdapterError::Unreachable {
                device: src.id.clone(),
                reason: format!("no path to {}", dst.id),
            });
        }

        {
            let mut st = self.state();
            *st.sending.entry(src.id.clone()).or_insert(0) += 1;
            *st.receiving.entry(dst.id.clone()).or_insert(0) += 1;
        }
        let _active = ActiveFlow {
            fabric: self,
            src: src.id.clone(),
            dst: dst.id.clone(),
        };

        // Sample contention mid-flow, once every concurrent flow has started.
        let half = flow.duration / 2;
        tokio::time::sleep(half).await;
        let (sending, receiving, scale) = {
            let st = self.state();
            (
                st.sending.get(&src.id).copied().unwrap_or(1).max(1),
                st.receiving.get(&dst.id).copied().unwrap_or(1).max(1),
                st.throughput_scale,
            )
        };
        tokio::time::sleep(flow.duration - half).await;

        let share = (self.access_capacity(src.id.as_str()) / sending as f64)
            .min(self.access_capacity(dst.id.as_str()) / receiving as f64)
            .min(bottleneck);
        let throughput_gbps = round3(share * self.settings.link_efficiency * scale);
        let load = sending.max(receiving) as f64;
        let latency_ms = (0..10)
            .map(|i| round3(self.settings.base_latency_ms * (1.0 + 0.05 * (load - 1.0)) + 0.001 * i as f64))
            .collect();

        Ok(FlowSample {
            src: src.id.clone(),
            dst: dst.id.clone(),
            throughput_gbps,
            latency_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topo() -> Arc<Topology> {
        Arc::new(
            Topology::from_json_str(
                r#"{
                "devices": [
                    {"id": "spine1", "role": "spine", "asn": 65001, "loopback": "10.255.0.1"},
                    {"id": "spine2", "role": "spine", "asn": 65001, "loopback": "10.255.0.2"},
                    {"id": "leaf1", "role": "leaf", "asn": 65011, "loopback": "10.255.1.1"},
                    {"id": "leaf2", "role": "leaf", "asn": 65012, "loopback": "10.255.1.2"}
                ],
                "hosts": [
                    {"id": "host1", "data_ip": "192.168.10.1", "segment": 10},
                    {"id": "host2", "data_ip": "192.168.10.2", "segment": 10},
                    {"id": "host3", "data_ip": "192.168.20.3", "segment": 20}
                ],
                "links": [
                    {"a": "spine1", "b": "leaf1", "a_port": "swp1", "b_port": "swp51"},
                    {"a": "spine1", "b": "leaf2", "a_port": "swp2", "b_port": "swp51"},
                    {"a": "spine2", "b": "leaf1", "a_port": "swp1", "b_port": "swp52"},
                    {"a": "spine2", "b": "leaf2", "a_port": "swp2", "b_port": "swp52"},
                    {"a": "leaf1", "b": "host1", "a_port": "swp1", "capacity_gbps": 10},
                    {"a": "leaf2", "b": "host2", "a_port": "swp1", "capacity_gbps": 10},
                    {"a": "leaf2", "b": "host3", "a_port": "swp2", "capacity_gbps": 10}
                ]
            }"#,
            )
            .unwrap(),
        )
    }

    async fn exec(sim: &SimFabric, device: &str, command: Command) -> Result<CommandOutput, AdapterError> {
        let dev = sim.topology().device(device).unwrap().clone();
        sim.execute(&dev, &command, Duration::from_secs(1)).await
    }

    fn ping(ip: &str) -> Command {
        Command::Ping {
            target: ip.parse().unwrap(),
            count: 3,
        }
    }

    #[tokio::test]
    async fn test_healthy_sessions() {
        let sim = SimFabric::new(topo());
        let out = exec(&sim, "leaf1", Command::BgpSummary).await.unwrap();
        let CommandOutput::Sessions(sessions) = out else {
            panic!("expected sessions");
        };
        assert_eq!(sessions.len(), 2);
        assert!(sessions.iter().all(|s| s.is_established()));
        assert_eq!(
            exec(&sim, "spine1", Command::RouteSummary).await.unwrap(),
            CommandOutput::RouteSummary { total: 4 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_drops_after_detection_delay() {
        let sim = SimFabric::new(topo());
        exec(&sim, "spine1", Command::InterfaceDown { port: "swp1".into() })
            .await
            .unwrap();
        let leaf1_view = |out: CommandOutput| match out {
            CommandOutput::Sessions(s) => s.into_iter().find(|s| s.peer == "spine1").unwrap(),
            other => panic!("unexpected {:?}", other),
        };
        let s = leaf1_view(exec(&sim, "leaf1", Command::BgpSummary).await.unwrap());
        assert!(s.is_established());

        tokio::time::advance(Duration::from_millis(300)).await;
        let s = leaf1_view(exec(&sim, "leaf1", Command::BgpSummary).await.unwrap());
        assert!(!s.is_established());

        exec(&sim, "spine1", Command::InterfaceUp { port: "swp1".into() })
            .await
            .unwrap();
        assert_eq!(sim.applied_faults(), 0);
        let s = leaf1_view(exec(&sim, "leaf1", Command::BgpSummary).await.unwrap());
        assert!(s.is_established());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_reconverges_after_recovery_delay() {
        let sim = SimFabric::new(topo());
        exec(&sim, "spine1", Command::InterfaceDown { port: "swp1".into() })
            .await
            .unwrap();
        let received = |out: CommandOutput| match out {
            CommandOutput::Ping(p) => p.received,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(received(exec(&sim, "host1", ping("192.168.10.2")).await.unwrap()), 0);
        tokio::time::advance(Duration::from_millis(900)).await;
        assert_eq!(received(exec(&sim, "host1", ping("192.168.10.2")).await.unwrap()), 3);
    }

    #[tokio::test]
    async fn test_segments_isolated_unless_leaked() {
        let sim = SimFabric::new(topo());
        let out = exec(&sim, "host1", ping("192.168.20.3")).await.unwrap();
        assert!(matches!(out, CommandOutput::Ping(PingStats { received: 0, .. })));
        sim.leak_segments(20, 10);
        let out = exec(&sim, "host1", ping("192.168.20.3")).await.unwrap();
        assert!(matches!(out, CommandOutput::Ping(PingStats { received: 3, .. })));
    }

    #[tokio::test]
    async fn test_fault_knobs() {
        let sim = SimFabric::new(topo());
        sim.fail_next("leaf1", 1);
        assert!(matches!(
            exec(&sim, "leaf1", Command::VniTable).await,
            Err(AdapterError::Timeout { .. })
        ));
        assert!(exec(&sim, "leaf1", Command::VniTable).await.is_ok());

        sim.return_garbage("leaf2");
        assert!(matches!(
            exec(&sim, "leaf2", Command::BgpSummary).await,
            Err(AdapterError::MalformedResponse { .. })
        ));

        sim.set_unreachable("spine2");
        assert!(matches!(
            exec(&sim, "spine2", Command::BgpSummary).await,
            Err(AdapterError::Unreachable { .. })
        ));
        assert!(exec(&sim, "spine1", Command::InterfaceDown { port: "swp9".into() })
            .await
            .is_err());
        assert_eq!(sim.commands().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flow_share() {
        let sim = SimFabric::new(topo());
        let t = sim.topology().clone();
        let flow = FlowSpec {
            src: "host1".into(),
            dst: "host2".into(),
            duration: Duration::from_secs(2),
            streams: 1,
        };
        let host1 = t.device("host1").unwrap();
        let host2 = t.device("host2").unwrap();
        let sample = sim
            .run_flow(host1, host2, &flow, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(sample.throughput_gbps, 9.4);
        assert_eq!(sample.latency_ms.len(), 10);

        // two senders into host2 split its access link
        let host3 = t.device("host3").unwrap();
        let other = FlowSpec {
            src: "host3".into(),
            ..flow.clone()
        };
        let (a, b) = tokio::join!(
            sim.run_flow(host1, host2, &flow, Duration::from_secs(5)),
            sim.run_flow(host3, host2, &other, Duration::from_secs(5)),
        );
        assert_eq!(a.unwrap().throughput_gbps, 4.7);
        assert_eq!(b.unwrap().throughput_gbps, 4.7);
    }
}
