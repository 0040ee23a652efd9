//! Decoding of raw device output into [`CommandOutput`].
//!
//! Shell-based adapters hand the raw stdout of a [`Command`] to [`parse_output`].
//! Anything that does not decode becomes [`AdapterError::MalformedResponse`]
//! carrying the raw payload.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::adapter::{
    AdapterError, Command, CommandOutput, InterfaceState, MacEntry, PingStats, SessionState,
    VniEntry,
};
use crate::topology::DeviceId;

/// Parse `raw` as the output of `command` run on `device`.
pub fn parse_output(device: &DeviceId, command: &Command, raw: &str) -> Result<CommandOutput, AdapterError> {
    let parsed = match command {
        Command::BgpSummary | Command::EvpnSummary => json(device, raw)
            .and_then(|v| parse_sessions(&v))
            .map(CommandOutput::Sessions),
        Command::RouteSummary => json(device, raw)
            .and_then(|v| parse_route_summary(&v))
            .map(|total| CommandOutput::RouteSummary { total }),
        Command::VniTable => json(device, raw)
            .and_then(|v| parse_vnis(&v))
            .map(CommandOutput::Vnis),
        Command::MacTable => json(device, raw)
            .and_then(|v| parse_macs(&v))
            .map(CommandOutput::Macs),
        Command::InterfaceTable => json(device, raw)
            .and_then(|v| parse_interfaces(&v))
            .map(CommandOutput::Interfaces),
        Command::Ping { .. } => parse_ping(raw).map(CommandOutput::Ping),
        Command::InterfaceDown { .. }
        | Command::InterfaceUp { .. }
        | Command::SessionShutdown { .. }
        | Command::SessionEnable { .. } => Ok(CommandOutput::Ack),
    };
    parsed.map_err(|reason| AdapterError::malformed(device, reason, raw))
}

fn json(device: &DeviceId, raw: &str) -> Result<Value, String> {
    serde_json::from_str(raw.trim()).map_err(|e| {
        tracing::debug!(device = %device, error = %e, "output is not JSON");
        format!("invalid JSON: {}", e)
    })
}

fn parse_sessions(value: &Value) -> Result<Vec<SessionState>, String> {
    let peers = value
        .get("peers")
        .or_else(|| value.get("ipv4Unicast").and_then(|v| v.get("peers")))
        .or_else(|| value.get("l2VpnEvpn").and_then(|v| v.get("peers")))
        .and_then(Value::as_object)
        .ok_or_else(|| "missing 'peers' table".to_string())?;

    let mut sessions = Vec::with_capacity(peers.len());
    for (key, peer) in peers {
        let state = peer
            .get("state")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("peer {} has no state", key))?;
        let name = peer
            .get("hostname")
            .and_then(Value::as_str)
            .unwrap_or(key);
        let prefixes = peer
            .get("pfxRcd")
            .or_else(|| peer.get("prefixReceivedCount"))
            .and_then(Value::as_u64)
            .unwrap_or(0);
        sessions.push(SessionState {
            peer: name.to_string(),
            state: state.to_string(),
            prefixes_received: prefixes,
        });
    }
    Ok(sessions)
}

fn parse_route_summary(value: &Value) -> Result<u64, String> {
    ["routesTotal", "totalRoutes", "total"]
        .iter()
        .find_map(|k| value.get(*k).and_then(Value::as_u64))
        .ok_or_else(|| "missing route total".to_string())
}

fn parse_vnis(value: &Value) -> Result<Vec<VniEntry>, String> {
    let table = value
        .as_object()
        .ok_or_else(|| "VNI table is not an object".to_string())?;
    let mut out = Vec::with_capacity(table.len());
    for (key, entry) in table {
        let vni = entry
            .get("vni")
            .and_then(Value::as_u64)
            .or_else(|| key.parse().ok())
            .ok_or_else(|| format!("entry {} has no VNI", key))?;
        out.push(VniEntry {
            vni: u32::try_from(vni).map_err(|_| format!("VNI {} out of range", vni))?,
            remote_vteps: entry
                .get("numRemoteVteps")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32,
            mac_count: entry.get("numMacs").and_then(Value::as_u64).unwrap_or(0) as u32,
        });
    }
    out.sort_by_key(|e| e.vni);
    Ok(out)
}

fn parse_macs(value: &Value) -> Result<Vec<MacEntry>, String> {
    let table = value
        .as_object()
        .ok_or_else(|| "MAC table is not an object".to_string())?;
    let mut out = Vec::new();
    for (key, per_vni) in table {
        let vni: u32 = key
            .parse()
            .map_err(|_| format!("MAC table key '{}' is not a VNI", key))?;
        let Some(macs) = per_vni.get("macs").and_then(Value::as_object) else {
            continue;
        };
        for (mac, info) in macs {
            let location = match info.get("type").and_then(Value::as_str) {
                Some("local") => "local".to_string(),
                _ => info
                    .get("remoteVtep")
                    .and_then(Value::as_str)
                    .unwrap_or("remote")
                    .to_string(),
            };
            out.push(MacEntry {
                mac: mac.clone(),
                vni,
                location,
            });
        }
    }
    Ok(out)
}

fn parse_interfaces(value: &Value) -> Result<Vec<InterfaceState>, String> {
    let table = value
        .as_object()
        .ok_or_else(|| "interface table is not an object".to_string())?;
    let mut out = Vec::with_capacity(table.len());
    for (name, entry) in table {
        let mtu = entry
            .get("mtu")
            .or_else(|| entry.get("iface_obj").and_then(|o| o.get("mtu")))
            .and_then(Value::as_u64)
            .ok_or_else(|| format!("interface {} has no MTU", name))?;
        let up = entry
            .get("linkstate")
            .and_then(Value::as_str)
            .map(|s| s.eq_ignore_ascii_case("up"))
            .unwrap_or(false);
        out.push(InterfaceState {
            name: name.clone(),
            up,
            mtu: mtu as u32,
        });
    }
    Ok(out)
}

fn ping_regexes() -> &'static (Regex, Regex) {
    static RE: OnceLock<(Regex, Regex)> = OnceLock::new();
    RE.get_or_init(|| {
        (
            Regex::new(r"(\d+) packets transmitted, (\d+) (?:packets )?received")
                .expect("static regex"),
            Regex::new(r"= [\d.]+/([\d.]+)/[\d.]+").expect("static regex"),
        )
    })
}

fn parse_ping(raw: &str) -> Result<PingStats, String> {
    let (counts, rtt) = ping_regexes();
    let caps = counts
        .captures(raw)
        .ok_or_else(|| "no ping statistics line".to_string())?;
    let transmitted: u32 = caps[1].parse().map_err(|_| "bad transmitted count".to_string())?;
    let received: u32 = caps[2].parse().map_err(|_| "bad received count".to_string())?;
    let rtt_avg_ms = rtt.captures(raw).and_then(|c| c[1].parse().ok());
    Ok(PingStats {
        transmitted,
        received,
        rtt_avg_ms,
    })
}
