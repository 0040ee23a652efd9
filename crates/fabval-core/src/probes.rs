//! Built-in probes for the underlay, overlay and data-plane checks.
//!
//! Every probe derives its expectation from the topology (minus whatever the
//! active [`FaultView`](crate::check::FaultView) says is down), issues
//! read-only commands, and compares what the device reports.

use serde_json::{json, Value};

use crate::adapter::{AdapterError, Command, CommandOutput, MacEntry, SessionState, VniEntry};
use crate::check::{CheckContext, Probe, Verdict};
use crate::topology::{Device, DeviceId, Role, Topology};

fn unexpected(device: &Device, output: Option<&CommandOutput>, wanted: &str) -> AdapterError {
    AdapterError::malformed(
        &device.id,
        format!(
            "expected {} output, got {}",
            wanted,
            output.map(|o| o.kind()).unwrap_or("nothing")
        ),
        output.map(|o| format!("{:?}", o)).unwrap_or_default(),
    )
}

fn sessions_of<'o>(device: &Device, outputs: &'o [CommandOutput]) -> Result<&'o [SessionState], AdapterError> {
    match outputs.first() {
        Some(CommandOutput::Sessions(s)) => Ok(s.as_slice()),
        other => Err(unexpected(device, other, "sessions")),
    }
}

/// Find the session `device` holds towards `peer`. Devices name peers by
/// hostname, by the local interface, or by the peer's loopback address.
pub fn find_session<'s>(
    sessions: &'s [SessionState],
    topology: &Topology,
    device: &str,
    peer: &Device,
) -> Option<&'s SessionState> {
    let port = topology
        .link_between(device, peer.id.as_str())
        .and_then(|l| l.port_on(device));
    let loopback = peer.loopback.map(|ip| ip.to_string());
    sessions.iter().find(|s| {
        s.peer == peer.id.as_str()
            || Some(s.peer.as_str()) == port
            || Some(&s.peer) == loopback.as_ref()
    })
}

/// Fabric neighbours `device` should hold a session with right now.
fn expected_peers<'a>(device: &Device, ctx: &CheckContext<'a>) -> Vec<&'a Device> {
    ctx.topology
        .neighbors(device.id.as_str())
        .into_iter()
        .filter(|d| d.role.is_fabric())
        .filter(|d| !ctx.faults.expects_down(&device.id, &d.id))
        .collect()
}

fn assess_sessions(
    family: &str,
    device: &Device,
    outputs: &[CommandOutput],
    ctx: &CheckContext<'_>,
) -> Result<Verdict, AdapterError> {
    let sessions = sessions_of(device, outputs)?;
    let peers = expected_peers(device, ctx);
    let mut down = Vec::new();
    for peer in &peers {
        match find_session(sessions, ctx.topology, device.id.as_str(), peer) {
            Some(s) if s.is_established() => {}
            Some(s) => down.push(json!({"peer": peer.id, "state": s.state})),
            None => down.push(json!({"peer": peer.id, "state": "missing"})),
        }
    }
    let observed = json!({
        "family": family,
        "expected": peers.len(),
        "established": peers.len() - down.len(),
        "down": down,
    });
    if down.is_empty() {
        Ok(Verdict::Pass { observed })
    } else {
        Ok(Verdict::Mismatch {
            reason: format!(
                "{} of {} {} sessions not established",
                down.len(),
                peers.len(),
                family
            ),
            observed,
        })
    }
}

/// Every fabric neighbour has an established IPv4 unicast session.
pub struct BgpSessions;

impl Probe for BgpSessions {
    fn commands(&self, _device: &Device, _ctx: &CheckContext<'_>) -> Vec<Command> {
        vec![Command::BgpSummary]
    }

    fn assess(&self, device: &Device, outputs: &[CommandOutput], ctx: &CheckContext<'_>) -> Result<Verdict, AdapterError> {
        assess_sessions("ipv4 unicast", device, outputs, ctx)
    }
}

/// The routing table carries at least one route per live fabric loopback.
pub struct RouteCount {
    /// Overrides the topology-derived minimum.
    pub min_routes: Option<u64>,
}

impl RouteCount {
    fn expected(&self, ctx: &CheckContext<'_>) -> u64 {
        self.min_routes.unwrap_or_else(|| {
            ctx.topology
                .devices()
                .filter(|d| d.role.is_fabric() && !ctx.faults.is_excluded(d.id.as_str()))
                .count() as u64
        })
    }
}

impl Probe for RouteCount {
    fn commands(&self, _device: &Device, _ctx: &CheckContext<'_>) -> Vec<Command> {
        vec![Command::RouteSummary]
    }

    fn assess(&self, device: &Device, outputs: &[CommandOutput], ctx: &CheckContext<'_>) -> Result<Verdict, AdapterError> {
        let total = match outputs.first() {
            Some(CommandOutput::RouteSummary { total }) => *total,
            other => return Err(unexpected(device, other, "route summary")),
        };
        let expected = self.expected(ctx);
        let observed = json!({"routes": total, "expected_min": expected});
        if total >= expected {
            Ok(Verdict::Pass { observed })
        } else {
            Ok(Verdict::Mismatch {
                reason: format!("{} routes installed, expected at least {}", total, expected),
                observed,
            })
        }
    }
}

/// Every fabric-facing interface carries jumbo frames plus VXLAN overhead.
pub struct InterfaceMtu;

impl Probe for InterfaceMtu {
    fn commands(&self, _device: &Device, _ctx: &CheckContext<'_>) -> Vec<Command> {
        vec![Command::InterfaceTable]
    }

    fn assess(&self, device: &Device, outputs: &[CommandOutput], ctx: &CheckContext<'_>) -> Result<Verdict, AdapterError> {
        let interfaces = match outputs.first() {
            Some(CommandOutput::Interfaces(i)) => i,
            other => return Err(unexpected(device, other, "interface table")),
        };
        let required = ctx.settings.required_mtu;
        let mut below = Vec::new();
        let mut missing = Vec::new();
        for link in ctx.topology.links_of(device.id.as_str()) {
            let Some(port) = link.port_on(device.id.as_str()) else {
                continue;
            };
            match interfaces.iter().find(|i| i.name == port) {
                Some(iface) if iface.mtu >= required => {}
                Some(iface) => below.push(json!({"port": port, "mtu": iface.mtu})),
                None => missing.push(port.to_string()),
            }
        }
        let observed = json!({"required_mtu": required, "below": below, "missing": missing});
        if below.is_empty() && missing.is_empty() {
            Ok(Verdict::Pass { observed })
        } else {
            Ok(Verdict::Mismatch {
                reason: format!(
                    "{} ports below MTU {}, {} ports missing",
                    below.len(),
                    required,
                    missing.len()
                ),
                observed,
            })
        }
    }
}

/// A leaf holds an established EVPN session with every spine it connects to.
pub struct EvpnSessions;

impl Probe for EvpnSessions {
    fn commands(&self, _device: &Device, _ctx: &CheckContext<'_>) -> Vec<Command> {
        vec![Command::EvpnSummary]
    }

    fn assess(&self, device: &Device, outputs: &[CommandOutput], ctx: &CheckContext<'_>) -> Result<Verdict, AdapterError> {
        assess_sessions("l2vpn evpn", device, outputs, ctx)
    }
}

/// EVPN routes a leaf should learn: one MAC/IP route per live remote host in
/// each of its segments, plus one inclusive-multicast route per live remote
/// VTEP carrying the segment.
pub fn expected_evpn_routes(topology: &Topology, leaf: &str, is_excluded: impl Fn(&str) -> bool) -> u64 {
    let local: Vec<&DeviceId> = topology
        .attached_hosts(leaf)
        .into_iter()
        .map(|h| &h.id)
        .collect();
    let mut total = 0u64;
    for vni in topology.segments_on_leaf(leaf) {
        total += topology
            .hosts_in_segment(vni)
            .into_iter()
            .filter(|h| !local.contains(&&h.id) && !is_excluded(h.id.as_str()))
            .count() as u64;
        total += topology
            .remote_vteps(leaf, vni)
            .into_iter()
            .filter(|l| !is_excluded(l.id.as_str()))
            .count() as u64;
    }
    total
}

/// A leaf receives the EVPN routes its segments call for.
pub struct EvpnRoutes;

impl Probe for EvpnRoutes {
    fn commands(&self, _device: &Device, _ctx: &CheckContext<'_>) -> Vec<Command> {
        vec![Command::EvpnSummary]
    }

    fn assess(&self, device: &Device, outputs: &[CommandOutput], ctx: &CheckContext<'_>) -> Result<Verdict, AdapterError> {
        let sessions = sessions_of(device, outputs)?;
        let expected = expected_evpn_routes(ctx.topology, device.id.as_str(), |id| ctx.faults.is_excluded(id));
        // Route reflectors each advertise the full set; take the best session.
        let received = expected_peers(device, ctx)
            .into_iter()
            .filter_map(|peer| find_session(sessions, ctx.topology, device.id.as_str(), peer))
            .filter(|s| s.is_established())
            .map(|s| s.prefixes_received)
            .max();
        let observed = json!({"expected": expected, "received": received});
        match received {
            Some(n) if n >= expected => Ok(Verdict::Pass { observed }),
            Some(n) => Ok(Verdict::Mismatch {
                reason: format!("received {} EVPN routes, expected {}", n, expected),
                observed,
            }),
            None if expected == 0 => Ok(Verdict::Pass { observed }),
            None => Ok(Verdict::Mismatch {
                reason: "no established EVPN session to learn routes from".to_string(),
                observed,
            }),
        }
    }
}

/// Each segment a leaf serves is configured, with its remote VTEPs known.
pub struct VniConfig;

impl Probe for VniConfig {
    fn commands(&self, _device: &Device, _ctx: &CheckContext<'_>) -> Vec<Command> {
        vec![Command::VniTable]
    }

    fn assess(&self, device: &Device, outputs: &[CommandOutput], ctx: &CheckContext<'_>) -> Result<Verdict, AdapterError> {
        let table: &[VniEntry] = match outputs.first() {
            Some(CommandOutput::Vnis(v)) => v.as_slice(),
            other => return Err(unexpected(device, other, "VNI table")),
        };
        let leaf = device.id.as_str();
        let expected = ctx.topology.segments_on_leaf(leaf);
        let mut missing = Vec::new();
        let mut vtep_shortfall = Vec::new();
        for vni in &expected {
            let want = ctx
                .topology
                .remote_vteps(leaf, *vni)
                .into_iter()
                .filter(|l| !ctx.faults.is_excluded(l.id.as_str()))
                .count() as u32;
            match table.iter().find(|e| e.vni == *vni) {
                None => missing.push(*vni),
                Some(entry) if entry.remote_vteps < want => vtep_shortfall.push(json!({
                    "vni": vni,
                    "remote_vteps": entry.remote_vteps,
                    "expected": want,
                })),
                Some(_) => {}
            }
        }
        let observed = json!({
            "expected": expected,
            "configured": table.iter().map(|e| e.vni).collect::<Vec<_>>(),
            "missing": missing,
            "vtep_shortfall": vtep_shortfall,
        });
        if missing.is_empty() && vtep_shortfall.is_empty() {
            Ok(Verdict::Pass { observed })
        } else if !missing.is_empty() {
            Ok(Verdict::Mismatch {
                reason: format!("segments {:?} not configured", missing),
                observed,
            })
        } else {
            Ok(Verdict::Mismatch {
                reason: "remote VTEP list incomplete".to_string(),
                observed,
            })
        }
    }
}

/// Each segment's MAC table holds an entry for every live member host.
pub struct MacPopulation;

impl Probe for MacPopulation {
    fn commands(&self, _device: &Device, _ctx: &CheckContext<'_>) -> Vec<Command> {
        vec![Command::MacTable]
    }

    fn assess(&self, device: &Device, outputs: &[CommandOutput], ctx: &CheckContext<'_>) -> Result<Verdict, AdapterError> {
        let macs: &[MacEntry] = match outputs.first() {
            Some(CommandOutput::Macs(m)) => m.as_slice(),
            other => return Err(unexpected(device, other, "MAC table")),
        };
        let mut short = Vec::new();
        for vni in ctx.topology.segments_on_leaf(device.id.as_str()) {
            let members: Vec<&Device> = ctx
                .topology
                .hosts_in_segment(vni)
                .into_iter()
                .filter(|h| !ctx.faults.is_excluded(h.id.as_str()))
                .collect();
            let learned: Vec<&MacEntry> = macs.iter().filter(|m| m.vni == vni).collect();
            let absent: Vec<&str> = members
                .iter()
                .filter_map(|h| h.mac.as_deref())
                .filter(|mac| !learned.iter().any(|m| m.mac.eq_ignore_ascii_case(mac)))
                .collect();
            if learned.len() < members.len() || !absent.is_empty() {
                short.push(json!({
                    "vni": vni,
                    "learned": learned.len(),
                    "expected": members.len(),
                    "absent": absent,
                }));
            }
        }
        let observed = json!({"entries": macs.len(), "short": short});
        if short.is_empty() {
            Ok(Verdict::Pass { observed })
        } else {
            Ok(Verdict::Mismatch {
                reason: format!("{} segments with incomplete MAC tables", short.len()),
                observed,
            })
        }
    }
}

/// Live hosts `host` pings: same segment when `same_segment`, every other
/// segment otherwise.
fn ping_targets<'a>(host: &Device, ctx: &CheckContext<'a>, same_segment: bool) -> Vec<&'a Device> {
    let Some(own) = host.segment else {
        return Vec::new();
    };
    ctx.topology
        .by_role(Role::Host)
        .into_iter()
        .filter(|h| h.id != host.id && h.data_ip.is_some())
        .filter(|h| !ctx.faults.is_excluded(h.id.as_str()))
        .filter(|h| match h.segment {
            Some(seg) => (seg == own) == same_segment,
            None => false,
        })
        .collect()
}

fn ping_commands(targets: &[&Device], count: u32) -> Vec<Command> {
    targets
        .iter()
        .filter_map(|t| t.data_ip)
        .map(|target| Command::Ping { target, count })
        .collect()
}

fn ping_results<'o>(device: &Device, outputs: &'o [CommandOutput]) -> Result<Vec<&'o crate::adapter::PingStats>, AdapterError> {
    outputs
        .iter()
        .map(|o| match o {
            CommandOutput::Ping(stats) => Ok(stats),
            other => Err(unexpected(device, Some(other), "ping")),
        })
        .collect()
}

/// Hosts in the same segment reach each other across the overlay.
pub struct Reachability;

impl Probe for Reachability {
    fn commands(&self, device: &Device, ctx: &CheckContext<'_>) -> Vec<Command> {
        ping_commands(&ping_targets(device, ctx, true), ctx.settings.ping_count)
    }

    fn assess(&self, device: &Device, outputs: &[CommandOutput], ctx: &CheckContext<'_>) -> Result<Verdict, AdapterError> {
        let targets = ping_targets(device, ctx, true);
        let stats = ping_results(device, outputs)?;
        let mut unreachable = Vec::new();
        let mut rtts = Vec::new();
        for (target, s) in targets.iter().zip(stats) {
            if s.received < s.transmitted || s.transmitted == 0 {
                unreachable.push(json!({"dst": target.id, "loss_pct": s.loss_pct()}));
            }
            if let Some(rtt) = s.rtt_avg_ms {
                rtts.push(json!({"dst": target.id, "rtt_avg_ms": rtt}));
            }
        }
        let observed = json!({"probes": targets.len(), "unreachable": unreachable, "rtt": rtts});
        if unreachable.is_empty() {
            Ok(Verdict::Pass { observed })
        } else {
            Ok(Verdict::Mismatch {
                reason: format!("{} of {} peers unreachable", unreachable.len(), targets.len()),
                observed,
            })
        }
    }
}

/// Hosts in different segments must not reach each other.
pub struct TenantIsolation;

impl Probe for TenantIsolation {
    fn commands(&self, device: &Device, ctx: &CheckContext<'_>) -> Vec<Command> {
        ping_commands(&ping_targets(device, ctx, false), ctx.settings.ping_count)
    }

    fn assess(&self, device: &Device, outputs: &[CommandOutput], ctx: &CheckContext<'_>) -> Result<Verdict, AdapterError> {
        let targets = ping_targets(device, ctx, false);
        let stats = ping_results(device, outputs)?;
        let leaked: Vec<Value> = targets
            .iter()
            .zip(stats)
            .filter(|(_, s)| s.received > 0)
            .map(|(t, s)| json!({"dst": t.id, "segment": t.segment, "received": s.received}))
            .collect();
        if leaked.is_empty() {
            Ok(Verdict::Pass {
                observed: json!({"probes": targets.len(), "unexpected_reachability": []}),
            })
        } else {
            Ok(Verdict::Mismatch {
                reason: "unexpected reachability".to_string(),
                observed: json!({"probes": targets.len(), "unexpected_reachability": leaked}),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{InterfaceState, PingStats};
    use crate::check::{FaultView, ProbeSettings};
    use std::collections::BTreeSet;

    fn topo() -> Topology {
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
                {"a": "leaf1", "b": "host1"},
                {"a": "leaf2", "b": "host2"},
                {"a": "leaf2", "b": "host3"}
            ]
        }"#,
        )
        .unwrap()
    }

    fn session(peer: &str, state: &str, pfx: u64) -> SessionState {
        SessionState {
            peer: peer.to_string(),
            state: state.to_string(),
            prefixes_received: pfx,
        }
    }

    fn ping(received: u32) -> CommandOutput {
        CommandOutput::Ping(PingStats {
            transmitted: 5,
            received,
            rtt_avg_ms: if received > 0 { Some(0.248) } else { None },
        })
    }

    #[test]
    fn test_bgp_sessions_pass_and_fail() {
        let t = topo();
        let faults = FaultView::default();
        let settings = ProbeSettings::default();
        let ctx = CheckContext { topology: &t, faults: &faults, settings: &settings };
        let leaf1 = t.device("leaf1").unwrap();

        let ok = [CommandOutput::Sessions(vec![
            session("spine1", "Established", 4),
            session("swp52", "Established", 4),
        ])];
        assert!(matches!(BgpSessions.assess(leaf1, &ok, &ctx).unwrap(), Verdict::Pass { .. }));

        let bad = [CommandOutput::Sessions(vec![session("spine1", "Established", 4)])];
        match BgpSessions.assess(leaf1, &bad, &ctx).unwrap() {
            Verdict::Mismatch { reason, observed } => {
                assert!(reason.contains("1 of 2"));
                assert_eq!(observed["down"][0]["peer"], "spine2");
                assert_eq!(observed["down"][0]["state"], "missing");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_sessions_to_failed_device_not_expected() {
        let t = topo();
        let faults = FaultView::new(BTreeSet::from([DeviceId::from("spine2")]), &[]);
        let settings = ProbeSettings::default();
        let ctx = CheckContext { topology: &t, faults: &faults, settings: &settings };
        let leaf1 = t.device("leaf1").unwrap();
        let out = [CommandOutput::Sessions(vec![
            session("spine1", "Established", 4),
            session("spine2", "Active", 0),
        ])];
        assert!(matches!(BgpSessions.assess(leaf1, &out, &ctx).unwrap(), Verdict::Pass { .. }));
    }

    #[test]
    fn test_wrong_output_kind_is_malformed() {
        let t = topo();
        let faults = FaultView::default();
        let settings = ProbeSettings::default();
        let ctx = CheckContext { topology: &t, faults: &faults, settings: &settings };
        let leaf1 = t.device("leaf1").unwrap();
        let err = BgpSessions
            .assess(leaf1, &[CommandOutput::Ack], &ctx)
            .unwrap_err();
        assert_eq!(err.kind(), "malformed_response");
    }

    #[test]
    fn test_route_count() {
        let t = topo();
        let faults = FaultView::default();
        let settings = ProbeSettings::default();
        let ctx = CheckContext { topology: &t, faults: &faults, settings: &settings };
        let leaf1 = t.device("leaf1").unwrap();
        let probe = RouteCount { min_routes: None };
        let out = [CommandOutput::RouteSummary { total: 3 }];
        assert!(matches!(probe.assess(leaf1, &out, &ctx).unwrap(), Verdict::Mismatch { .. }));
        let out = [CommandOutput::RouteSummary { total: 8 }];
        assert!(matches!(probe.assess(leaf1, &out, &ctx).unwrap(), Verdict::Pass { .. }));
    }

    #[test]
    fn test_mtu_below_required() {
        let t = topo();
        let faults = FaultView::default();
        let settings = ProbeSettings::default();
        let ctx = CheckContext { topology: &t, faults: &faults, settings: &settings };
        let leaf1 = t.device("leaf1").unwrap();
        let out = [CommandOutput::Interfaces(vec![
            InterfaceState { name: "swp51".into(), up: true, mtu: 9216 },
            InterfaceState { name: "swp52".into(), up: true, mtu: 1500 },
            InterfaceState { name: "to-host1".into(), up: true, mtu: 9216 },
        ])];
        match InterfaceMtu.assess(leaf1, &out, &ctx).unwrap() {
            Verdict::Mismatch { observed, .. } => {
                assert_eq!(observed["below"][0]["port"], "swp52");
                assert_eq!(observed["below"][0]["mtu"], 1500);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_expected_evpn_routes() {
        let t = topo();
        // leaf1 serves vni 10: host2 behind leaf2 plus leaf2 as remote VTEP
        assert_eq!(expected_evpn_routes(&t, "leaf1", |_| false), 2);
        // leaf2 serves 10 and 20: host1 plus leaf1 for vni 10, nothing remote for 20
        assert_eq!(expected_evpn_routes(&t, "leaf2", |_| false), 2);
        assert_eq!(expected_evpn_routes(&t, "leaf2", |id| id == "leaf1" || id == "host1"), 0);
    }

    #[test]
    fn test_vni_missing_segment() {
        let t = topo();
        let faults = FaultView::default();
        let settings = ProbeSettings::default();
        let ctx = CheckContext { topology: &t, faults: &faults, settings: &settings };
        let leaf2 = t.device("leaf2").unwrap();
        let out = [CommandOutput::Vnis(vec![VniEntry { vni: 10, remote_vteps: 1, mac_count: 2 }])];
        match VniConfig.assess(leaf2, &out, &ctx).unwrap() {
            Verdict::Mismatch { observed, .. } => assert_eq!(observed["missing"][0], 20),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reachability_targets_same_segment_only() {
        let t = topo();
        let faults = FaultView::default();
        let settings = ProbeSettings::default();
        let ctx = CheckContext { topology: &t, faults: &faults, settings: &settings };
        let host1 = t.device("host1").unwrap();
        let cmds = Reachability.commands(host1, &ctx);
        assert_eq!(
            cmds,
            vec![Command::Ping { target: "192.168.10.2".parse().unwrap(), count: 5 }]
        );
        assert!(matches!(
            Reachability.assess(host1, &[ping(5)], &ctx).unwrap(),
            Verdict::Pass { .. }
        ));
        assert!(matches!(
            Reachability.assess(host1, &[ping(3)], &ctx).unwrap(),
            Verdict::Mismatch { .. }
        ));
    }

    #[test]
    fn test_tenant_isolation_leak() {
        let t = topo();
        let faults = FaultView::default();
        let settings = ProbeSettings::default();
        let ctx = CheckContext { topology: &t, faults: &faults, settings: &settings };
        let host1 = t.device("host1").unwrap();
        assert_eq!(TenantIsolation.commands(host1, &ctx).len(), 1);
        match TenantIsolation.assess(host1, &[ping(2)], &ctx).unwrap() {
            Verdict::Mismatch { reason, observed } => {
                assert_eq!(reason, "unexpected reachability");
                assert_eq!(observed["unexpected_reachability"][0]["dst"], "host3");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            TenantIsolation.assess(host1, &[ping(0)], &ctx).unwrap(),
            Verdict::Pass { .. }
        ));
    }
}
