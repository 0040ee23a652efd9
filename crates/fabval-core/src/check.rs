//! Check definitions.
//!
//! A [`CheckDef`] is an immutable description: which category it belongs to,
//! which devices it targets, how long a command may take, how to retry, and
//! the [`Probe`] that decides which commands to issue and how to judge them.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapter::{AdapterError, Command, CommandOutput};
use crate::error::FabricError;
use crate::retry::RetryPolicy;
use crate::topology::{Device, DeviceId, Role, Topology};

/// Ordered check categories. Execution follows declaration order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Underlay,
    Overlay,
    #[serde(rename = "dataplane")]
    DataPlane,
    Performance,
    Resilience,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Underlay,
        Category::Overlay,
        Category::DataPlane,
        Category::Performance,
        Category::Resilience,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Underlay => "underlay",
            Category::Overlay => "overlay",
            Category::DataPlane => "dataplane",
            Category::Performance => "performance",
            Category::Resilience => "resilience",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = FabricError;

    /// Accepts the category names plus the short test names used by the
    /// older lab scripts (`bgp`, `evpn`, `vxlan`, `ai`, `failure`).
    fn from_str(s: &str) -> Result<Self, FabricError> {
        match s.to_ascii_lowercase().as_str() {
            "underlay" | "bgp" => Ok(Category::Underlay),
            "overlay" | "evpn" => Ok(Category::Overlay),
            "dataplane" | "data-plane" | "data_plane" | "vxlan" => Ok(Category::DataPlane),
            "performance" | "perf" | "ai" => Ok(Category::Performance),
            "resilience" | "failure" => Ok(Category::Resilience),
            other => Err(FabricError::Parse(format!("unknown check category '{}'", other))),
        }
    }
}

/// Which devices a check runs against.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    All,
    Roles(Vec<Role>),
    Devices(Vec<DeviceId>),
}

impl Selector {
    pub fn role(role: Role) -> Self {
        Selector::Roles(vec![role])
    }

    pub fn select<'a>(&self, topology: &'a Topology) -> Vec<&'a Device> {
        match self {
            Selector::All => topology.devices().collect(),
            Selector::Roles(roles) => topology
                .devices()
                .filter(|d| roles.contains(&d.role))
                .collect(),
            Selector::Devices(ids) => ids
                .iter()
                .filter_map(|id| topology.device(id.as_str()))
                .collect(),
        }
    }
}

/// Tunables shared by the built-in probes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProbeSettings {
    /// Echo requests per reachability probe.
    pub ping_count: u32,
    /// Minimum fabric MTU: 9000 byte jumbo payload plus 50 bytes of VXLAN.
    pub required_mtu: u32,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            ping_count: 5,
            required_mtu: 9050,
        }
    }
}

/// Elements expected to be down while a failure scenario is active.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FaultView {
    excluded: BTreeSet<DeviceId>,
    down_pairs: BTreeSet<(DeviceId, DeviceId)>,
}

impl FaultView {
    pub fn new(excluded: BTreeSet<DeviceId>, down_pairs: &[(DeviceId, DeviceId)]) -> Self {
        Self {
            excluded,
            down_pairs: down_pairs.iter().map(|(a, b)| ordered(a, b)).collect(),
        }
    }

    pub fn is_excluded(&self, id: &str) -> bool {
        self.excluded.contains(id)
    }

    pub fn excluded(&self) -> &BTreeSet<DeviceId> {
        &self.excluded
    }

    /// Whether the adjacency between `a` and `b` is expected to be down.
    pub fn expects_down(&self, a: &DeviceId, b: &DeviceId) -> bool {
        self.excluded.contains(a) || self.excluded.contains(b) || self.down_pairs.contains(&ordered(a, b))
    }

    pub fn is_empty(&self) -> bool {
        self.excluded.is_empty() && self.down_pairs.is_empty()
    }
}

fn ordered(a: &DeviceId, b: &DeviceId) -> (DeviceId, DeviceId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// Read-only state handed to probes.
#[derive(Clone, Copy)]
pub struct CheckContext<'a> {
    pub topology: &'a Topology,
    pub faults: &'a FaultView,
    pub settings: &'a ProbeSettings,
}

/// Judgement of one check against one device.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Pass { observed: Value },
    /// Definitive mismatch; never retried.
    Mismatch { observed: Value, reason: String },
}

/// Assertion logic of a check.
pub trait Probe: Send + Sync {
    /// Commands to issue against `device`, in order. An empty list means
    /// there is nothing to verify on this device.
    fn commands(&self, device: &Device, ctx: &CheckContext<'_>) -> Vec<Command>;

    /// Judge the outputs, one per command returned by [`Probe::commands`].
    fn assess(
        &self,
        device: &Device,
        outputs: &[CommandOutput],
        ctx: &CheckContext<'_>,
    ) -> Result<Verdict, AdapterError>;
}

/// A registered check.
#[derive(Clone)]
pub struct CheckDef {
    pub id: String,
    pub category: Category,
    pub description: String,
    pub selector: Selector,
    /// Upper bound for every command the check issues.
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// A failing blocking check short-circuits later categories.
    pub blocking: bool,
    pub probe: Arc<dyn Probe>,
}

impl CheckDef {
    pub fn new(
        id: impl Into<String>,
        category: Category,
        selector: Selector,
        probe: Arc<dyn Probe>,
    ) -> Self {
        Self {
            id: id.into(),
            category,
            description: String::new(),
            selector,
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            blocking: true,
            probe,
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn non_blocking(mut self) -> Self {
        self.blocking = false;
        self
    }

    pub fn targets<'a>(&self, topology: &'a Topology) -> Vec<&'a Device> {
        self.selector.select(topology)
    }
}

impl fmt::Debug for CheckDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckDef")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("selector", &self.selector)
            .field("timeout", &self.timeout)
            .field("blocking", &self.blocking)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_order() {
        assert!(Category::Underlay < Category::Overlay);
        assert!(Category::Overlay < Category::DataPlane);
        assert!(Category::DataPlane < Category::Performance);
        assert!(Category::Performance < Category::Resilience);
        let mut sorted = Category::ALL.to_vec();
        sorted.sort();
        assert_eq!(sorted, Category::ALL.to_vec());
    }

    #[test]
    fn test_category_parse_aliases() {
        assert_eq!("bgp".parse::<Category>().unwrap(), Category::Underlay);
        assert_eq!("EVPN".parse::<Category>().unwrap(), Category::Overlay);
        assert_eq!("data-plane".parse::<Category>().unwrap(), Category::DataPlane);
        assert_eq!("failure".parse::<Category>().unwrap(), Category::Resilience);
        assert!("routing".parse::<Category>().is_err());
    }

    #[test]
    fn test_category_serde_names() {
        assert_eq!(
            serde_json::to_string(&Category::DataPlane).unwrap(),
            "\"dataplane\""
        );
        let c: Category = serde_json::from_str("\"underlay\"").unwrap();
        assert_eq!(c, Category::Underlay);
    }

    #[test]
    fn test_fault_view_expects_down() {
        let view = FaultView::new(
            BTreeSet::from([DeviceId::from("spine1")]),
            &[(DeviceId::from("leaf2"), DeviceId::from("spine2"))],
        );
        assert!(view.expects_down(&DeviceId::from("leaf1"), &DeviceId::from("spine1")));
        assert!(view.expects_down(&DeviceId::from("spine2"), &DeviceId::from("leaf2")));
        assert!(!view.expects_down(&DeviceId::from("leaf1"), &DeviceId::from("spine2")));
        assert!(view.is_excluded("spine1"));
        assert!(!FaultView::default().is_excluded("spine1"));
    }
}
