//! Shell-backed adapters: device commands over ssh, traffic through iperf3
//! on the hosts.

use std::collections::BTreeSet;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use fabval_core::adapter::PingStats;
use fabval_core::parse::parse_output;
use fabval_core::stats::round3;
use fabval_core::{
    AdapterError, Command, CommandOutput, Device, DeviceAdapter, DeviceId, FlowSample, FlowSpec,
    TrafficGenerator,
};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::SshConfig;

/// ssh itself exits with 255 when the connection fails.
const SSH_CONNECT_FAILURE: i32 = 255;

struct RemoteOutput {
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl RemoteOutput {
    fn succeeded(&self) -> bool {
        self.code == Some(0)
    }

    fn failure(&self, device: &DeviceId, what: &str) -> AdapterError {
        AdapterError::malformed(
            device,
            format!("{} exited with status {}", what, self.code.unwrap_or(-1)),
            self.stderr.trim(),
        )
    }
}

fn destination(config: &SshConfig, device: &Device) -> String {
    match &config.user {
        Some(user) => format!("{}@{}", user, device.mgmt),
        None => device.mgmt.clone(),
    }
}

async fn remote(
    config: &SshConfig,
    device: &Device,
    line: &str,
    timeout: Duration,
) -> Result<RemoteOutput, AdapterError> {
    let mut cmd = tokio::process::Command::new(&config.program);
    cmd.args(&config.extra_args)
        .arg(destination(config, device))
        .arg(line)
        .stdin(Stdio::null())
        .kill_on_drop(true);

    debug!(device = %device.id, command = line, "ssh");
    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Err(_) => {
            return Err(AdapterError::Timeout {
                device: device.id.clone(),
                timeout_ms: timeout.as_millis() as u64,
            })
        }
        Ok(Err(e)) => {
            return Err(AdapterError::Unreachable {
                device: device.id.clone(),
                reason: format!("failed to spawn {}: {}", config.program, e),
            })
        }
        Ok(Ok(output)) => output,
    };

    let out = RemoteOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    if out.code == Some(SSH_CONNECT_FAILURE) {
        return Err(AdapterError::Unreachable {
            device: device.id.clone(),
            reason: out.stderr.trim().to_string(),
        });
    }
    Ok(out)
}

/// ping exits non-zero on loss with the statistics still on stdout. When the
/// echo request never left the host (no route, unknown address) there is no
/// statistics line at all; that is total loss, not a garbled reply.
fn ping_output(
    device: &DeviceId,
    command: &Command,
    count: u32,
    out: &RemoteOutput,
) -> Result<CommandOutput, AdapterError> {
    if !out.succeeded() && !out.stdout.contains("packets transmitted") {
        debug!(
            device = %device,
            code = out.code.unwrap_or(-1),
            stderr = out.stderr.trim(),
            "ping produced no statistics, counting as total loss"
        );
        return Ok(CommandOutput::Ping(PingStats {
            transmitted: count,
            received: 0,
            rtt_avg_ms: None,
        }));
    }
    parse_output(device, command, &out.stdout)
}

/// Runs rendered commands on devices over ssh.
pub struct SshAdapter {
    config: SshConfig,
}

impl SshAdapter {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DeviceAdapter for SshAdapter {
    async fn execute(
        &self,
        device: &Device,
        command: &Command,
        timeout: Duration,
    ) -> Result<CommandOutput, AdapterError> {
        let out = remote(&self.config, device, &command.render(), timeout).await?;
        match command {
            Command::Ping { count, .. } => ping_output(&device.id, command, *count, &out),
            _ if !out.succeeded() => Err(out.failure(&device.id, command.render().as_str())),
            _ => parse_output(&device.id, command, &out.stdout),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum IperfError {
    #[error("iperf3 reported: {0}")]
    Reported(String),

    #[error("no end-of-test summary")]
    MissingSummary,

    #[error("invalid JSON: {0}")]
    Json(String),
}

#[derive(Deserialize)]
struct IperfReport {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    end: Option<IperfEnd>,
}

#[derive(Deserialize)]
struct IperfEnd {
    #[serde(default)]
    streams: Vec<IperfStream>,
    #[serde(default)]
    sum_received: Option<IperfSum>,
    #[serde(default)]
    sum_sent: Option<IperfSum>,
}

#[derive(Deserialize)]
struct IperfSum {
    bits_per_second: f64,
}

#[derive(Deserialize)]
struct IperfStream {
    #[serde(default)]
    sender: Option<IperfSender>,
}

#[derive(Deserialize)]
struct IperfSender {
    /// Microseconds.
    #[serde(default)]
    mean_rtt: Option<f64>,
}

/// Throughput in Gb/s and per-stream mean RTTs in ms from `iperf3 -J` output.
pub fn parse_iperf(raw: &str) -> Result<(f64, Vec<f64>), IperfError> {
    let report: IperfReport =
        serde_json::from_str(raw.trim()).map_err(|e| IperfError::Json(e.to_string()))?;
    if let Some(err) = report.error {
        return Err(IperfError::Reported(err));
    }
    let end = report.end.ok_or(IperfError::MissingSummary)?;
    let sum = end
        .sum_received
        .or(end.sum_sent)
        .ok_or(IperfError::MissingSummary)?;
    let latency = end
        .streams
        .iter()
        .filter_map(|s| s.sender.as_ref().and_then(|s| s.mean_rtt))
        .map(|us| round3(us / 1000.0))
        .collect();
    Ok((round3(sum.bits_per_second / 1e9), latency))
}

/// `iperf3 -D` returns before the server listens, so a refused connection is
/// retried after a short pause.
const CLIENT_ATTEMPTS: u32 = 3;
const SERVER_SETTLE: Duration = Duration::from_millis(200);

fn server_not_ready(err: &IperfError) -> bool {
    matches!(err, IperfError::Reported(msg) if msg.contains("Connection refused"))
}

/// A server port held on one receiver for the lifetime of a flow.
struct PortLease<'a> {
    leases: &'a DashMap<DeviceId, BTreeSet<u16>>,
    device: DeviceId,
    port: u16,
}

impl Drop for PortLease<'_> {
    fn drop(&mut self) {
        if let Some(mut ports) = self.leases.get_mut(&self.device) {
            ports.remove(&self.port);
        }
    }
}

/// Drives flows with a one-shot iperf3 server on the receiver and a JSON
/// client run on the sender. Concurrent flows into the same receiver each get
/// their own server port.
pub struct IperfGenerator {
    config: SshConfig,
    leases: DashMap<DeviceId, BTreeSet<u16>>,
}

impl IperfGenerator {
    pub fn new(config: SshConfig) -> Self {
        Self {
            config,
            leases: DashMap::new(),
        }
    }

    /// Lowest port at or above the base not in use on `device`.
    fn lease(&self, device: &DeviceId) -> Result<PortLease<'_>, AdapterError> {
        let mut ports = self.leases.entry(device.clone()).or_default();
        let base = self.config.traffic_base_port;
        let port = (base..=u16::MAX)
            .find(|p| !ports.contains(p))
            .ok_or_else(|| AdapterError::malformed(device, "no free iperf3 server port", ""))?;
        ports.insert(port);
        Ok(PortLease {
            leases: &self.leases,
            device: device.clone(),
            port,
        })
    }
}

#[async_trait]
impl TrafficGenerator for IperfGenerator {
    async fn run_flow(
        &self,
        src: &Device,
        dst: &Device,
        flow: &FlowSpec,
        timeout: Duration,
    ) -> Result<FlowSample, AdapterError> {
        let target = dst
            .data_ip
            .ok_or_else(|| AdapterError::malformed(&dst.id, "host has no data_ip", ""))?;
        let lease = self.lease(&dst.id)?;
        let program = &self.config.traffic_program;

        let server = remote(
            &self.config,
            dst,
            &format!("{} -s -1 -D -p {}", program, lease.port),
            timeout,
        )
        .await?;
        if !server.succeeded() {
            return Err(server.failure(&dst.id, "iperf3 server"));
        }

        let client_line = format!(
            "{} -c {} -p {} -t {} -P {} -J",
            program,
            target,
            lease.port,
            flow.duration.as_secs().max(1),
            flow.streams.max(1)
        );
        let mut attempt = 1;
        let (throughput_gbps, latency_ms) = loop {
            let client = remote(&self.config, src, &client_line, timeout).await?;
            match parse_iperf(&client.stdout) {
                Ok(measured) => break measured,
                Err(e) if server_not_ready(&e) && attempt < CLIENT_ATTEMPTS => {
                    debug!(src = %src.id, dst = %dst.id, port = lease.port, attempt, "server not listening yet");
                    attempt += 1;
                    tokio::time::sleep(SERVER_SETTLE).await;
                }
                Err(e) => {
                    warn!(src = %src.id, dst = %dst.id, error = %e, "flow failed");
                    return Err(AdapterError::malformed(&src.id, e.to_string(), client.stdout.as_str()));
                }
            }
        };

        Ok(FlowSample {
            src: src.id.clone(),
            dst: dst.id.clone(),
            throughput_gbps,
            latency_ms,
        })
    }
}
