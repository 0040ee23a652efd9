//! Check registry: the catalogue of known checks, keyed by id.

use std::sync::Arc;
use std::time::Duration;

use crate::check::{Category, CheckDef, Selector};
use crate::error::{FabricError, Result};
use crate::probes::{
    BgpSessions, EvpnRoutes, EvpnSessions, InterfaceMtu, MacPopulation, Reachability, RouteCount,
    TenantIsolation, VniConfig,
};
use crate::retry::RetryPolicy;
use crate::topology::{Device, Role, Topology};

/// Per-check defaults applied to the standard catalogue.
#[derive(Debug, Clone)]
pub struct CheckDefaults {
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for CheckDefaults {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// Registered checks, in registration order.
#[derive(Debug, Default)]
pub struct CheckRegistry {
    checks: Vec<CheckDef>,
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in underlay, overlay and data-plane catalogue.
    pub fn standard(defaults: &CheckDefaults) -> Self {
        let fabric = || Selector::Roles(vec![Role::Spine, Role::Leaf]);
        let leaves = || Selector::role(Role::Leaf);
        let hosts = || Selector::role(Role::Host);
        let defs = vec![
            CheckDef::new("underlay.bgp_sessions", Category::Underlay, fabric(), Arc::new(BgpSessions))
                .with_description("IPv4 unicast sessions to every fabric neighbour are established"),
            CheckDef::new(
                "underlay.route_count",
                Category::Underlay,
                fabric(),
                Arc::new(RouteCount { min_routes: None }),
            )
            .with_description("routing table holds a route for every fabric loopback"),
            CheckDef::new("underlay.mtu", Category::Underlay, fabric(), Arc::new(InterfaceMtu))
                .with_description("fabric interfaces carry jumbo frames plus VXLAN overhead")
                .non_blocking(),
            CheckDef::new("overlay.evpn_sessions", Category::Overlay, leaves(), Arc::new(EvpnSessions))
                .with_description("EVPN sessions to every spine are established"),
            CheckDef::new("overlay.evpn_routes", Category::Overlay, leaves(), Arc::new(EvpnRoutes))
                .with_description("leaves learn MAC/IP and inclusive-multicast routes for their segments"),
            CheckDef::new("overlay.vni_config", Category::Overlay, leaves(), Arc::new(VniConfig))
                .with_description("every served segment is configured with its remote VTEPs"),
            CheckDef::new("dataplane.mac_table", Category::DataPlane, leaves(), Arc::new(MacPopulation))
                .with_description("MAC tables hold every member host of each served segment"),
            CheckDef::new("dataplane.reachability", Category::DataPlane, hosts(), Arc::new(Reachability))
                .with_description("hosts in the same segment reach each other"),
            CheckDef::new(
                "dataplane.tenant_isolation",
                Category::DataPlane,
                hosts(),
                Arc::new(TenantIsolation),
            )
            .with_description("hosts in different segments cannot reach each other"),
        ];

        let mut registry = Self::new();
        for def in defs {
            let def = def
                .with_timeout(defaults.timeout)
                .with_retry(defaults.retry.clone());
            // ids above are distinct literals
            registry.checks.push(def);
        }
        registry
    }

    /// Register a check. Ids are unique.
    pub fn register(&mut self, def: CheckDef) -> Result<()> {
        if self.get(&def.id).is_some() {
            return Err(FabricError::DuplicateCheck(def.id));
        }
        tracing::debug!(check = %def.id, category = %def.category, "registered check");
        self.checks.push(def);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&CheckDef> {
        self.checks.iter().find(|c| c.id == id)
    }

    pub fn require(&self, id: &str) -> Result<&CheckDef> {
        self.get(id)
            .ok_or_else(|| FabricError::UnknownCheck(id.to_string()))
    }

    pub fn checks(&self) -> &[CheckDef] {
        &self.checks
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    pub fn in_category(&self, category: Category) -> Vec<&CheckDef> {
        self.checks.iter().filter(|c| c.category == category).collect()
    }

    /// Concrete (check, device) units for one category, in registration
    /// order then device order.
    pub fn plan<'t>(&self, category: Category, topology: &'t Topology) -> Vec<(CheckDef, &'t Device)> {
        let mut units = Vec::new();
        for def in self.in_category(category) {
            for device in def.targets(topology) {
                units.push((def.clone(), device));
            }
        }
        units
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterError, Command, CommandOutput};
    use crate::check::{CheckContext, Probe, Verdict};

    struct Noop;

    impl Probe for Noop {
        fn commands(&self, _device: &Device, _ctx: &CheckContext<'_>) -> Vec<Command> {
            Vec::new()
        }

        fn assess(&self, _device: &Device, _outputs: &[CommandOutput], _ctx: &CheckContext<'_>) -> std::result::Result<Verdict, AdapterError> {
            Ok(Verdict::Pass {
                observed: serde_json::Value::Null,
            })
        }
    }

    fn topo() -> Topology {
        Topology::from_json_str(
            r#"{
            "devices": [
                {"id": "spine1", "role": "spine", "asn": 65001, "loopback": "10.255.0.1"},
                {"id": "leaf1", "role": "leaf", "asn": 65011, "loopback": "10.255.1.1"}
            ],
            "hosts": [{"id": "host1", "data_ip": "192.168.10.1", "segment": 10}],
            "links": [{"a": "spine1", "b": "leaf1"}, {"a": "leaf1", "b": "host1"}]
        }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_standard_catalogue() {
        let registry = CheckRegistry::standard(&CheckDefaults::default());
        assert_eq!(registry.len(), 9);
        assert_eq!(registry.in_category(Category::Underlay).len(), 3);
        assert_eq!(registry.in_category(Category::Overlay).len(), 3);
        assert_eq!(registry.in_category(Category::DataPlane).len(), 3);
        assert!(!registry.require("underlay.mtu").unwrap().blocking);
        assert!(registry.require("underlay.bgp_sessions").unwrap().blocking);
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut registry = CheckRegistry::standard(&CheckDefaults::default());
        let dup = CheckDef::new("overlay.vni_config", Category::Overlay, Selector::All, Arc::new(Noop));
        assert!(matches!(
            registry.register(dup),
            Err(FabricError::DuplicateCheck(id)) if id == "overlay.vni_config"
        ));
        let fresh = CheckDef::new("custom.noop", Category::DataPlane, Selector::All, Arc::new(Noop));
        registry.register(fresh).unwrap();
        assert_eq!(registry.len(), 10);
    }

    #[test]
    fn test_unknown_check() {
        let registry = CheckRegistry::new();
        assert!(matches!(
            registry.require("nope"),
            Err(FabricError::UnknownCheck(_))
        ));
    }

    #[test]
    fn test_plan_targets_roles() {
        let registry = CheckRegistry::standard(&CheckDefaults::default());
        let t = topo();
        let underlay = registry.plan(Category::Underlay, &t);
        // three checks on spine1 and leaf1
        assert_eq!(underlay.len(), 6);
        let dataplane = registry.plan(Category::DataPlane, &t);
        let ids: Vec<(&str, &str)> = dataplane
            .iter()
            .map(|(d, dev)| (d.id.as_str(), dev.id.as_str()))
            .collect();
        assert_eq!(
            ids,
            vec![
                ("dataplane.mac_table", "leaf1"),
                ("dataplane.reachability", "host1"),
                ("dataplane.tenant_isolation", "host1"),
            ]
        );
        assert!(registry.plan(Category::Performance, &t).is_empty());
    }
}
