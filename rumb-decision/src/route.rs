//
// Copyright (c) The Rumb Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::net::IpAddr;

use derive_new::new;
use enum_as_inner::EnumAsInner;
use ipnetwork::IpNetwork;
use rumb_utils::mpls::Label;

use crate::perf::PerfEvents;
use crate::prefix::{PrefixEntry, PrefixType};

// MPLS operation attached to a nexthop.
#[derive(Clone, Debug, EnumAsInner, Eq, Ord, PartialEq, PartialOrd)]
pub enum MplsAction {
    // Remove the top label and do an IP lookup (terminal node).
    PopAndLookup,
    // Penultimate-hop pop: forward without the top label.
    Php,
    // Replace the top label.
    Swap(Label),
    // Push a label stack (used for SR-MPLS prefix forwarding).
    Push(Vec<Label>),
}

// Route nexthop key: one nexthop per (address, interface) pair.
#[derive(Clone, Debug, Eq, new, Ord, PartialEq, PartialOrd)]
pub struct NexthopKey {
    pub address: IpAddr,
    pub ifname: Option<String>,
}

// Route nexthop.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct NextHop {
    pub address: IpAddr,
    // Local interface (`None` for drop or recursive nexthops).
    pub ifname: Option<String>,
    // IGP cost from the viewer to the exit node.
    pub metric: u32,
    pub mpls_action: Option<MplsAction>,
    pub area: Option<String>,
    pub neighbor_node: Option<String>,
    // UCMP weight; 0 means plain ECMP. Overridden by RIB policy.
    pub weight: u64,
}

// Ordered set of nexthops.
pub type Nexthops = BTreeMap<NexthopKey, NextHop>;

// Computed unicast route.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RibUnicastEntry {
    pub prefix: IpNetwork,
    pub nexthops: Nexthops,
    // Advertisement that won best-route selection; its drain metric
    // reflects the winner's effective drain state.
    pub best_prefix_entry: PrefixEntry,
    // (node, area) the best advertisement came from. `None` for routes
    // injected from the static-route stream.
    pub best_node_area: Option<(String, String)>,
    pub igp_cost: u32,
    // The viewer advertised this prefix itself but lost best-route
    // selection to a remote advertiser.
    pub local_route_considered: bool,
}

// Computed MPLS label route.
#[derive(Clone, Debug, Eq, new, PartialEq)]
pub struct RibMplsEntry {
    pub label: Label,
    pub nexthops: Nexthops,
}

// Complete RIB of one viewer.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DecisionRouteDb {
    pub unicast: BTreeMap<IpNetwork, RibUnicastEntry>,
    pub mpls: BTreeMap<Label, RibMplsEntry>,
}

// Delta between two RIBs, published to route consumers. Also used as the
// shape of the static-route ingress stream, where `prefix_type` tags the
// origin of the routes.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RouteUpdate {
    pub unicast_routes_to_update: BTreeMap<IpNetwork, RibUnicastEntry>,
    pub unicast_routes_to_delete: Vec<IpNetwork>,
    pub mpls_routes_to_update: BTreeMap<Label, RibMplsEntry>,
    pub mpls_routes_to_delete: Vec<Label>,
    pub perf_events: Option<PerfEvents>,
    pub prefix_type: Option<PrefixType>,
}

// ===== impl NextHop =====

impl NextHop {
    pub fn key(&self) -> NexthopKey {
        NexthopKey::new(self.address, self.ifname.clone())
    }
}

// ===== impl RibUnicastEntry =====

impl RibUnicastEntry {
    // Route injected from the static-route stream: no best-route
    // selection took place.
    pub fn from_static(
        prefix: IpNetwork,
        nexthops: Nexthops,
        prefix_type: PrefixType,
    ) -> RibUnicastEntry {
        RibUnicastEntry {
            prefix,
            nexthops,
            best_prefix_entry: PrefixEntry::new(prefix, prefix_type),
            best_node_area: None,
            igp_cost: 0,
            local_route_considered: false,
        }
    }
}

// ===== impl DecisionRouteDb =====

impl DecisionRouteDb {
    // Computes the delta that turns `self` into `new`.
    pub fn calculate_update(&self, new: &DecisionRouteDb) -> RouteUpdate {
        let mut update = RouteUpdate::default();

        for (prefix, entry) in &new.unicast {
            if self.unicast.get(prefix) != Some(entry) {
                update
                    .unicast_routes_to_update
                    .insert(*prefix, entry.clone());
            }
        }
        for prefix in self.unicast.keys() {
            if !new.unicast.contains_key(prefix) {
                update.unicast_routes_to_delete.push(*prefix);
            }
        }

        for (label, entry) in &new.mpls {
            if self.mpls.get(label) != Some(entry) {
                update.mpls_routes_to_update.insert(*label, entry.clone());
            }
        }
        for label in self.mpls.keys() {
            if !new.mpls.contains_key(label) {
                update.mpls_routes_to_delete.push(*label);
            }
        }

        update
    }
}

// ===== impl RouteUpdate =====

impl RouteUpdate {
    // An empty update is a valid heartbeat for consumers.
    pub fn is_empty(&self) -> bool {
        self.unicast_routes_to_update.is_empty()
            && self.unicast_routes_to_delete.is_empty()
            && self.mpls_routes_to_update.is_empty()
            && self.mpls_routes_to_delete.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unicast_entry(prefix: &str, metric: u32) -> RibUnicastEntry {
        let prefix: IpNetwork = prefix.parse().unwrap();
        let nexthop = NextHop {
            address: "fe80::2".parse().unwrap(),
            ifname: Some("1/2".to_owned()),
            metric,
            mpls_action: None,
            area: Some("0".to_owned()),
            neighbor_node: Some("2".to_owned()),
            weight: 0,
        };
        RibUnicastEntry {
            prefix,
            nexthops: [(nexthop.key(), nexthop)].into(),
            best_prefix_entry: PrefixEntry::new(prefix, PrefixType::Config),
            best_node_area: Some(("2".to_owned(), "0".to_owned())),
            igp_cost: metric,
            local_route_considered: false,
        }
    }

    #[test]
    fn test_calculate_update() {
        let mut old = DecisionRouteDb::default();
        old.unicast
            .insert(unicast_entry("10.1.1.1/32", 10).prefix, unicast_entry("10.1.1.1/32", 10));
        old.unicast
            .insert(unicast_entry("10.2.2.2/32", 10).prefix, unicast_entry("10.2.2.2/32", 10));

        let mut new = DecisionRouteDb::default();
        // Unchanged route, changed route, removed route.
        new.unicast
            .insert(unicast_entry("10.1.1.1/32", 10).prefix, unicast_entry("10.1.1.1/32", 10));
        new.unicast
            .insert(unicast_entry("10.3.3.3/32", 20).prefix, unicast_entry("10.3.3.3/32", 20));

        let update = old.calculate_update(&new);
        assert_eq!(update.unicast_routes_to_update.len(), 1);
        assert!(update
            .unicast_routes_to_update
            .contains_key(&"10.3.3.3/32".parse::<IpNetwork>().unwrap()));
        assert_eq!(
            update.unicast_routes_to_delete,
            vec!["10.2.2.2/32".parse::<IpNetwork>().unwrap()]
        );

        // Identical RIBs produce an empty (heartbeat) update.
        assert!(new.calculate_update(&new.clone()).is_empty());
    }
}
