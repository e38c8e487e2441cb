//
// Copyright (c) The Rumb Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;
use std::str::FromStr;

use derive_new::new;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::perf::PerfEvents;

// Origin type of a prefix advertisement.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum PrefixType {
    Loopback,
    Default,
    Config,
    Bgp,
    Rib,
    Vip,
}

// How traffic to the prefix is forwarded.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum PrefixForwardingType {
    #[default]
    Ip,
    SrMpls,
}

// Which path computation the advertiser requests for the prefix.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum PrefixForwardingAlgorithm {
    #[default]
    SpEcmp,
    Ksp2EdEcmp,
}

// Metric components of best-route selection, in comparison order (the
// effective drain metric is evaluated first, see the SPF solver).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct PrefixMetrics {
    pub path_preference: i32,
    pub source_preference: i32,
    pub distance: i32,
    pub drain_metric: i32,
}

// One prefix advertisement from one node.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct PrefixEntry {
    pub prefix: IpNetwork,
    pub prefix_type: PrefixType,
    #[serde(default)]
    pub forwarding_type: PrefixForwardingType,
    #[serde(default)]
    pub forwarding_algorithm: PrefixForwardingAlgorithm,
    #[serde(default)]
    pub metrics: PrefixMetrics,
    // Install the route only when at least this many nexthops are
    // available.
    #[serde(default)]
    pub min_nexthops: Option<u32>,
    // Opaque data carried along with the advertisement.
    #[serde(default)]
    pub data: Option<Vec<u8>>,
    // Areas the prefix traversed while being redistributed, used for
    // loop prevention.
    #[serde(default)]
    pub area_stack: Vec<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

// Key identifying one prefix advertisement in the key-value transport:
// "prefix:<node>:<area>:<prefix>".
#[derive(Clone, Debug, Eq, new, Ord, PartialEq, PartialOrd)]
pub struct PrefixKey {
    pub node: String,
    pub area: String,
    pub prefix: IpNetwork,
}

// Wire form of a prefix advertisement (v2 format: one entry per key,
// withdrawals carry `delete_prefix`).
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct PrefixDatabase {
    pub node: String,
    pub prefix_entries: Vec<PrefixEntry>,
    #[serde(default)]
    pub perf_events: Option<PerfEvents>,
    #[serde(default)]
    pub delete_prefix: bool,
}

// Filter for received-routes queries. Unset fields match everything.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReceivedRouteFilter {
    pub prefixes: Option<Vec<IpNetwork>>,
    pub node_name: Option<String>,
    pub area_name: Option<String>,
}

// One advertisement as returned by received-routes queries.
#[derive(Clone, Debug, Eq, new, PartialEq)]
pub struct ReceivedRouteDetail {
    pub prefix: IpNetwork,
    pub node: String,
    pub area: String,
    pub entry: PrefixEntry,
}

// ===== impl PrefixMetrics =====

impl Default for PrefixMetrics {
    fn default() -> PrefixMetrics {
        PrefixMetrics {
            path_preference: 1000,
            source_preference: 100,
            distance: 0,
            drain_metric: 0,
        }
    }
}

// ===== impl PrefixEntry =====

impl PrefixEntry {
    pub fn new(prefix: IpNetwork, prefix_type: PrefixType) -> PrefixEntry {
        PrefixEntry {
            prefix,
            prefix_type,
            forwarding_type: Default::default(),
            forwarding_algorithm: Default::default(),
            metrics: Default::default(),
            min_nexthops: None,
            data: None,
            area_stack: Vec::new(),
            tags: Default::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: PrefixMetrics) -> PrefixEntry {
        self.metrics = metrics;
        self
    }

    pub fn with_forwarding(
        mut self,
        forwarding_type: PrefixForwardingType,
        forwarding_algorithm: PrefixForwardingAlgorithm,
    ) -> PrefixEntry {
        self.forwarding_type = forwarding_type;
        self.forwarding_algorithm = forwarding_algorithm;
        self
    }
}

// ===== impl PrefixKey =====

impl PrefixKey {
    pub const KEY_MARKER: &'static str = "prefix:";

    // Parses a "prefix:<node>:<area>:<prefix>" key.
    pub fn parse(key: &str) -> Option<PrefixKey> {
        let suffix = key.strip_prefix(Self::KEY_MARKER)?;
        let mut parts = suffix.splitn(3, ':');
        let node = parts.next()?;
        let area = parts.next()?;
        let prefix = IpNetwork::from_str(parts.next()?).ok()?;
        if node.is_empty() || area.is_empty() {
            return None;
        }
        Some(PrefixKey::new(node.to_owned(), area.to_owned(), prefix))
    }
}

impl std::fmt::Display for PrefixKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}:{}:{}",
            Self::KEY_MARKER,
            self.node,
            self.area,
            self.prefix
        )
    }
}

// ===== impl ReceivedRouteFilter =====

impl ReceivedRouteFilter {
    pub fn matches(&self, prefix: &IpNetwork, node: &str, area: &str) -> bool {
        if let Some(prefixes) = &self.prefixes {
            if !prefixes.contains(prefix) {
                return false;
            }
        }
        if let Some(node_name) = &self.node_name {
            if node_name != node {
                return false;
            }
        }
        if let Some(area_name) = &self.area_name {
            if area_name != area {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_key_roundtrip() {
        let key = PrefixKey::new(
            "node-1".to_owned(),
            "0".to_owned(),
            "10.1.1.1/32".parse().unwrap(),
        );
        assert_eq!(key.to_string(), "prefix:node-1:0:10.1.1.1/32");
        assert_eq!(PrefixKey::parse(&key.to_string()), Some(key));
    }

    #[test]
    fn test_prefix_key_v6() {
        let key = PrefixKey::parse("prefix:2:A:2001:db8::1/128").unwrap();
        assert_eq!(key.node, "2");
        assert_eq!(key.area, "A");
        assert_eq!(key.prefix, "2001:db8::1/128".parse::<IpNetwork>().unwrap());
    }

    #[test]
    fn test_prefix_key_invalid() {
        assert_eq!(PrefixKey::parse("adj:1"), None);
        assert_eq!(PrefixKey::parse("prefix:1"), None);
        assert_eq!(PrefixKey::parse("prefix:1:0:not-a-prefix"), None);
    }
}
