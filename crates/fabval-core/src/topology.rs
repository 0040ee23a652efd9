//! Fabric topology model.
//!
//! A [`Topology`] is built once per run from a declarative
//! [`TopologyDescription`] and is read-only afterwards. Every other component
//! borrows it (usually behind an `Arc`).

use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FabricError, Result};

/// Topology description schema version understood by this build.
pub const TOPOLOGY_VERSION: u32 = 1;

/// Link capacity assumed when a description does not declare one.
pub const DEFAULT_LINK_CAPACITY_GBPS: f64 = 100.0;

/// Unique device identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Borrow<str> for DeviceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Closed set of fabric roles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Spine,
    Leaf,
    Host,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Spine => "spine",
            Role::Leaf => "leaf",
            Role::Host => "host",
        }
    }

    /// Spines and leaves run the routing protocols; hosts only attach.
    pub fn is_fabric(&self) -> bool {
        matches!(self, Role::Spine | Role::Leaf)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = FabricError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "spine" => Ok(Role::Spine),
            "leaf" => Ok(Role::Leaf),
            "host" => Ok(Role::Host),
            other => Err(FabricError::malformed(format!(
                "unknown role '{}' (expected spine, leaf or host)",
                other
            ))),
        }
    }
}

/// A validated fabric element.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub role: Role,
    /// Management endpoint the device adapter connects to.
    pub mgmt: String,
    pub asn: Option<u32>,
    pub loopback: Option<Ipv4Addr>,
    /// Data-plane address probed by reachability checks (hosts).
    pub data_ip: Option<IpAddr>,
    /// Overlay segment (tenant VNI) the host belongs to.
    pub segment: Option<u32>,
    pub mac: Option<String>,
}

/// A validated point-to-point link.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub a: DeviceId,
    pub a_port: String,
    pub b: DeviceId,
    pub b_port: String,
    pub capacity_gbps: f64,
}

impl Link {
    pub fn touches(&self, id: &str) -> bool {
        self.a.as_str() == id || self.b.as_str() == id
    }

    pub fn connects(&self, x: &str, y: &str) -> bool {
        (self.a.as_str() == x && self.b.as_str() == y) || (self.a.as_str() == y && self.b.as_str() == x)
    }

    /// The endpoint opposite `id`.
    pub fn other(&self, id: &str) -> Option<&DeviceId> {
        if self.a.as_str() == id {
            Some(&self.b)
        } else if self.b.as_str() == id {
            Some(&self.a)
        } else {
            None
        }
    }

    /// Interface name of this link on device `id`.
    pub fn port_on(&self, id: &str) -> Option<&str> {
        if self.a.as_str() == id {
            Some(&self.a_port)
        } else if self.b.as_str() == id {
            Some(&self.b_port)
        } else {
            None
        }
    }

    /// Like [`Link::port_on`], but `None` when the topology file left the
    /// port unnamed.
    pub fn named_port_on(&self, id: &str) -> Option<&str> {
        let peer = self.other(id)?;
        self.port_on(id).filter(|port| *port != placeholder_port(peer.as_str()))
    }

    /// Order-independent label, e.g. `leaf1--spine1`.
    pub fn label(&self) -> String {
        if self.a <= self.b {
            format!("{}--{}", self.a, self.b)
        } else {
            format!("{}--{}", self.b, self.a)
        }
    }
}

/// Interface name given to a link end the topology file leaves unnamed.
fn placeholder_port(peer: &str) -> String {
    format!("to-{}", peer)
}

/// Device entry as written in a topology file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DeviceSpec {
    #[serde(alias = "name")]
    pub id: String,
    #[serde(default, alias = "type")]
    pub role: Option<String>,
    #[serde(default, alias = "mgmt_ip")]
    pub mgmt: Option<String>,
    #[serde(default)]
    pub asn: Option<u32>,
    #[serde(default)]
    pub loopback: Option<String>,
    #[serde(default)]
    pub data_ip: Option<String>,
    #[serde(default, alias = "vni")]
    pub segment: Option<u32>,
    #[serde(default)]
    pub mac: Option<String>,
}

/// Link entry as written in a topology file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LinkSpec {
    pub a: String,
    pub b: String,
    #[serde(default)]
    pub a_port: Option<String>,
    #[serde(default)]
    pub b_port: Option<String>,
    #[serde(default)]
    pub capacity_gbps: Option<f64>,
}

fn default_version() -> u32 {
    TOPOLOGY_VERSION
}

/// Declarative topology description, validated by [`Topology::load`].
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TopologyDescription {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
    /// Hosts listed separately; their role is implied.
    #[serde(default)]
    pub hosts: Vec<DeviceSpec>,
    #[serde(default)]
    pub links: Vec<LinkSpec>,
}

/// Immutable, validated fabric topology.
#[derive(Clone, Debug)]
pub struct Topology {
    name: String,
    devices: BTreeMap<DeviceId, Device>,
    links: Vec<Link>,
    adjacency: BTreeMap<DeviceId, Vec<usize>>,
}

impl Topology {
    /// Validate a description and build the topology.
    pub fn load(desc: TopologyDescription) -> Result<Self> {
        if desc.version != TOPOLOGY_VERSION {
            return Err(FabricError::UnsupportedVersion {
                what: "topology",
                got: desc.version,
                supported: TOPOLOGY_VERSION,
            });
        }

        let mut devices: BTreeMap<DeviceId, Device> = BTreeMap::new();
        let declared = desc
            .devices
            .iter()
            .map(|spec| (spec, None))
            .chain(desc.hosts.iter().map(|spec| (spec, Some(Role::Host))));

        for (spec, implied) in declared {
            let device = build_device(spec, implied)?;
            if let Some(existing) = devices.get(&device.id) {
                if existing.role != device.role {
                    return Err(FabricError::malformed(format!(
                        "device {} appears in two roles: {} and {}",
                        device.id, existing.role, device.role
                    )));
                }
                return Err(FabricError::malformed(format!(
                    "duplicate device id {}",
                    device.id
                )));
            }
            devices.insert(device.id.clone(), device);
        }

        let mut links: Vec<Link> = Vec::with_capacity(desc.links.len());
        for spec in &desc.links {
            for end in [&spec.a, &spec.b] {
                if !devices.contains_key(end.as_str()) {
                    return Err(FabricError::malformed(format!(
                        "link {}--{} references nonexistent device {}",
                        spec.a, spec.b, end
                    )));
                }
            }
            if spec.a == spec.b {
                return Err(FabricError::malformed(format!(
                    "link connects {} to itself",
                    spec.a
                )));
            }
            if links.iter().any(|l| l.connects(&spec.a, &spec.b)) {
                return Err(FabricError::malformed(format!(
                    "duplicate link {}--{}",
                    spec.a, spec.b
                )));
            }
            let capacity = spec.capacity_gbps.unwrap_or(DEFAULT_LINK_CAPACITY_GBPS);
            if !capacity.is_finite() || capacity <= 0.0 {
                return Err(FabricError::malformed(format!(
                    "link {}--{} has invalid capacity {}",
                    spec.a, spec.b, capacity
                )));
            }
            links.push(Link {
                a: DeviceId::new(spec.a.clone()),
                a_port: spec.a_port.clone().unwrap_or_else(|| placeholder_port(&spec.b)),
                b: DeviceId::new(spec.b.clone()),
                b_port: spec.b_port.clone().unwrap_or_else(|| placeholder_port(&spec.a)),
                capacity_gbps: capacity,
            });
        }

        let mut adjacency: BTreeMap<DeviceId, Vec<usize>> =
            devices.keys().map(|id| (id.clone(), Vec::new())).collect();
        for (idx, link) in links.iter().enumerate() {
            for end in [&link.a, &link.b] {
                if let Some(list) = adjacency.get_mut(end) {
                    list.push(idx);
                }
            }
        }

        Ok(Self {
            name: desc.name.unwrap_or_else(|| "fabric".to_string()),
            devices,
            links,
            adjacency,
        })
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let desc: TopologyDescription = serde_json::from_str(json)
            .map_err(|e| FabricError::malformed(format!("invalid JSON: {}", e)))?;
        Self::load(desc)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let desc: TopologyDescription = serde_yaml::from_str(yaml)
            .map_err(|e| FabricError::malformed(format!("invalid YAML: {}", e)))?;
        Self::load(desc)
    }

    /// Load a topology file, picking the decoder from the extension.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_lowercase();
        match ext.as_str() {
            "json" => Self::from_json_str(&contents),
            "yaml" | "yml" => Self::from_yaml_str(&contents),
            _ => Err(FabricError::malformed(format!(
                "unsupported topology file extension '{}'",
                ext
            ))),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn device(&self, id: &str) -> Option<&Device> {
        self.devices.get(id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn by_role(&self, role: Role) -> Vec<&Device> {
        self.devices.values().filter(|d| d.role == role).collect()
    }

    pub fn fabric_device_count(&self) -> usize {
        self.devices.values().filter(|d| d.role.is_fabric()).count()
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn links_of(&self, id: &str) -> Vec<&Link> {
        self.adjacency
            .get(id)
            .map(|idx| idx.iter().map(|&i| &self.links[i]).collect())
            .unwrap_or_default()
    }

    pub fn neighbors(&self, id: &str) -> Vec<&Device> {
        self.links_of(id)
            .into_iter()
            .filter_map(|l| l.other(id))
            .filter_map(|other| self.devices.get(other))
            .collect()
    }

    pub fn link_between(&self, a: &str, b: &str) -> Option<&Link> {
        self.links_of(a).into_iter().find(|l| l.connects(a, b))
    }

    pub fn device_by_data_ip(&self, ip: IpAddr) -> Option<&Device> {
        self.devices.values().find(|d| d.data_ip == Some(ip))
    }

    /// All overlay segments declared by hosts.
    pub fn segments(&self) -> BTreeSet<u32> {
        self.devices.values().filter_map(|d| d.segment).collect()
    }

    pub fn hosts_in_segment(&self, vni: u32) -> Vec<&Device> {
        self.devices
            .values()
            .filter(|d| d.role == Role::Host && d.segment == Some(vni))
            .collect()
    }

    /// Leaves a host is attached to.
    pub fn access_leaves(&self, host: &str) -> Vec<&Device> {
        self.neighbors(host)
            .into_iter()
            .filter(|d| d.role == Role::Leaf)
            .collect()
    }

    /// Hosts directly attached to a leaf.
    pub fn attached_hosts(&self, leaf: &str) -> Vec<&Device> {
        self.neighbors(leaf)
            .into_iter()
            .filter(|d| d.role == Role::Host)
            .collect()
    }

    /// Segments a leaf must carry because one of its hosts is a member.
    pub fn segments_on_leaf(&self, leaf: &str) -> BTreeSet<u32> {
        self.attached_hosts(leaf)
            .into_iter()
            .filter_map(|h| h.segment)
            .collect()
    }

    /// Leaves other than `leaf` that also carry `vni`.
    pub fn remote_vteps(&self, leaf: &str, vni: u32) -> Vec<&Device> {
        self.by_role(Role::Leaf)
            .into_iter()
            .filter(|l| l.id.as_str() != leaf && self.segments_on_leaf(l.id.as_str()).contains(&vni))
            .collect()
    }

    /// Links a flow between two hosts may traverse, ECMP across every spine
    /// shared by the access leaves. Empty when no path exists.
    pub fn path_links(&self, src: &str, dst: &str) -> Vec<&Link> {
        if src == dst {
            return Vec::new();
        }
        let src_leaves = self.access_leaves(src);
        let dst_leaves = self.access_leaves(dst);
        let mut used: BTreeSet<usize> = BTreeSet::new();

        let shared: Vec<&Device> = src_leaves
            .iter()
            .filter(|l| dst_leaves.iter().any(|d| d.id == l.id))
            .copied()
            .collect();

        if !shared.is_empty() {
            for leaf in shared {
                self.mark_link(&mut used, src, leaf.id.as_str());
                self.mark_link(&mut used, leaf.id.as_str(), dst);
            }
            return used.into_iter().map(|i| &self.links[i]).collect();
        }

        let mut fabric_path = false;
        for ls in &src_leaves {
            for ld in &dst_leaves {
                for spine in self.neighbors(ls.id.as_str()) {
                    if spine.role != Role::Spine {
                        continue;
                    }
                    if self.link_between(spine.id.as_str(), ld.id.as_str()).is_none() {
                        continue;
                    }
                    fabric_path = true;
                    self.mark_link(&mut used, src, ls.id.as_str());
                    self.mark_link(&mut used, ls.id.as_str(), spine.id.as_str());
                    self.mark_link(&mut used, spine.id.as_str(), ld.id.as_str());
                    self.mark_link(&mut used, ld.id.as_str(), dst);
                }
            }
        }

        if !fabric_path {
            return Vec::new();
        }
        used.into_iter().map(|i| &self.links[i]).collect()
    }

    fn mark_link(&self, used: &mut BTreeSet<usize>, a: &str, b: &str) {
        if let Some(idx) = self.adjacency.get(a).and_then(|list| {
            list.iter().copied().find(|&i| self.links[i].connects(a, b))
        }) {
            used.insert(idx);
        }
    }

    /// Upper bound for a single flow: the narrowest stage of the path.
    pub fn bottleneck_gbps(&self, src: &str, dst: &str) -> f64 {
        let path = self.path_links(src, dst);
        if path.is_empty() {
            return 0.0;
        }
        let stage = |pred: &dyn Fn(&Link) -> bool| -> f64 {
            path.iter()
                .copied()
                .filter(|&l| pred(l))
                .map(|l| l.capacity_gbps)
                .sum()
        };
        let src_access = stage(&|l: &Link| l.touches(src));
        let dst_access = stage(&|l: &Link| l.touches(dst));
        let spine_stage = stage(&|l: &Link| {
            !l.touches(src)
                && !l.touches(dst)
                && [&l.a, &l.b]
                    .iter()
                    .any(|end| self.device(end.as_str()).map(|d| d.role) == Some(Role::Spine))
        });

        let mut bound = src_access.min(dst_access);
        if spine_stage > 0.0 {
            // Each direction of the spine stage carries the flow once.
            bound = bound.min(spine_stage / 2.0);
        }
        bound
    }

    /// Devices reachable from `start` over links accepted by `is_up`.
    pub fn reachable_from<F>(&self, start: &str, is_up: F) -> BTreeSet<DeviceId>
    where
        F: Fn(&Link) -> bool,
    {
        let mut seen = BTreeSet::new();
        let Some(first) = self.devices.get(start) else {
            return seen;
        };
        let mut queue = VecDeque::from([first.id.clone()]);
        seen.insert(first.id.clone());
        while let Some(id) = queue.pop_front() {
            for link in self.links_of(id.as_str()) {
                if !is_up(link) {
                    continue;
                }
                if let Some(next) = link.other(id.as_str()) {
                    if seen.insert(next.clone()) {
                        queue.push_back(next.clone());
                    }
                }
            }
        }
        seen
    }

    /// Devices cut off when `down_devices` fail and `down_links` go down:
    /// the failed devices themselves plus any device whose every link is lost.
    pub fn stranded_by(
        &self,
        down_devices: &BTreeSet<DeviceId>,
        down_links: &[(DeviceId, DeviceId)],
    ) -> BTreeSet<DeviceId> {
        let link_down = |l: &Link| {
            down_devices.contains(&l.a)
                || down_devices.contains(&l.b)
                || down_links.iter().any(|(x, y)| l.connects(x.as_str(), y.as_str()))
        };
        let mut out: BTreeSet<DeviceId> = down_devices.clone();
        for id in self.devices.keys() {
            if out.contains(id) {
                continue;
            }
            let links = self.links_of(id.as_str());
            if !links.is_empty() && links.iter().all(|&l| link_down(l)) {
                out.insert(id.clone());
            }
        }
        out
    }

    pub fn summary(&self) -> String {
        format!(
            "{}: {} spine, {} leaf, {} host, {} links",
            self.name,
            self.by_role(Role::Spine).len(),
            self.by_role(Role::Leaf).len(),
            self.by_role(Role::Host).len(),
            self.links.len()
        )
    }
}

fn build_device(spec: &DeviceSpec, implied: Option<Role>) -> Result<Device> {
    if spec.id.trim().is_empty() {
        return Err(FabricError::malformed("device with empty id"));
    }
    let declared = spec.role.as_deref().map(Role::from_str).transpose()?;
    let role = match (declared, implied) {
        (Some(d), Some(i)) if d != i => {
            return Err(FabricError::malformed(format!(
                "device {} appears in two roles: {} and {}",
                spec.id, d, i
            )))
        }
        (Some(d), _) => d,
        (None, Some(i)) => i,
        (None, None) => {
            return Err(FabricError::malformed(format!(
                "device {} has no role",
                spec.id
            )))
        }
    };

    let loopback = spec
        .loopback
        .as_deref()
        .map(|s| {
            s.split('/')
                .next()
                .unwrap_or(s)
                .parse::<Ipv4Addr>()
                .map_err(|_| {
                    FabricError::malformed(format!("device {} has invalid loopback '{}'", spec.id, s))
                })
        })
        .transpose()?;
    let data_ip = spec
        .data_ip
        .as_deref()
        .map(|s| {
            s.parse::<IpAddr>().map_err(|_| {
                FabricError::malformed(format!("device {} has invalid data address '{}'", spec.id, s))
            })
        })
        .transpose()?;

    if role.is_fabric() {
        if spec.asn.is_none() {
            return Err(FabricError::malformed(format!(
                "{} {} declares no AS number",
                role, spec.id
            )));
        }
        if loopback.is_none() {
            return Err(FabricError::malformed(format!(
                "{} {} declares no loopback address",
                role, spec.id
            )));
        }
    } else if data_ip.is_none() {
        return Err(FabricError::malformed(format!(
            "host {} declares no data address",
            spec.id
        )));
    }

    Ok(Device {
        id: DeviceId::new(spec.id.clone()),
        role,
        mgmt: spec.mgmt.clone().unwrap_or_else(|| spec.id.clone()),
        asn: spec.asn,
        loopback,
        data_ip,
        segment: if role == Role::Host { spec.segment } else { None },
        mac: spec.mac.clone(),
    })
}
