//
// Copyright (c) The Rumb Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use derive_new::new;
use serde::{Deserialize, Serialize};

use crate::perf::PerfEvents;

// One directional half of a link, as declared by the owning node.
//
// The nexthop addresses are the addresses of the neighbor on the shared
// link, i.e. what the owning node would program as gateway to reach it.
#[derive(Clone, Debug, Eq, new, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Adjacency {
    pub other_node_name: String,
    pub if_name: String,
    pub other_if_name: String,
    pub nexthop_v6: Ipv6Addr,
    pub nexthop_v4: Ipv4Addr,
    pub metric: u32,
    // MPLS adjacency label (0 = unassigned).
    #[new(default)]
    pub adj_label: u32,
    #[new(default)]
    pub weight: u64,
    // Per-adjacency hard drain.
    #[new(default)]
    pub is_overloaded: bool,
    // When set, only the neighbor named by `other_node_name` may use this
    // adjacency in its path computation.
    #[new(default)]
    pub only_used_by_other_node: bool,
    // Unix timestamp of the last transition of this adjacency.
    #[new(default)]
    pub timestamp: i64,
}

// Operational status of a local interface.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum LinkStatus {
    Up,
    Down,
}

// Status of a local interface together with the wall-clock time of the
// transition, used to measure link-state propagation time.
#[derive(Clone, Debug, Eq, new, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct LinkStatusRecord {
    pub status: LinkStatus,
    pub unix_ts: i64,
}

// Full adjacency database of one node within one area.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct AdjacencyDatabase {
    pub node: String,
    // Node hard drain: the node stops being used for transit.
    pub is_overloaded: bool,
    // MPLS node label (0 = unassigned). Kept as the raw wire value so that
    // out-of-range labels can be detected when label routes are emitted.
    pub node_label: u32,
    // Node soft drain: added to the metric of every edge arriving here.
    pub node_metric_increment: u32,
    pub adjacencies: Vec<Adjacency>,
    // Per local interface status records, keyed by interface name.
    #[serde(default)]
    pub link_status_records: BTreeMap<String, LinkStatusRecord>,
    #[serde(default)]
    pub perf_events: Option<PerfEvents>,
}

// ===== impl AdjacencyDatabase =====

impl AdjacencyDatabase {
    pub fn new(
        node: &str,
        node_label: u32,
        adjacencies: Vec<Adjacency>,
    ) -> AdjacencyDatabase {
        AdjacencyDatabase {
            node: node.to_owned(),
            is_overloaded: false,
            node_label,
            node_metric_increment: 0,
            adjacencies,
            link_status_records: Default::default(),
            perf_events: None,
        }
    }

    // Returns whether the node is administratively drained, either hard
    // (overloaded) or soft (metric increment).
    pub fn is_drained(&self) -> bool {
        self.is_overloaded || self.node_metric_increment > 0
    }
}
