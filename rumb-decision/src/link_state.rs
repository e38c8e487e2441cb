//
// Copyright (c) The Rumb Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use derive_new::new;

use crate::adjacency::{Adjacency, AdjacencyDatabase, LinkStatus};
use crate::counters::WindowedStats;
use crate::debug::Debug;

// Report of what an adjacency database update changed.
#[derive(Clone, Copy, Debug, Default, Eq, new, PartialEq)]
pub struct LinkStateChange {
    // The set of usable links changed, or an effective metric changed.
    pub topology_changed: bool,
    // A usable link changed nexthop/weight/label attributes without
    // affecting the topology.
    pub link_attributes_changed: bool,
    // The node's label changed (absent counts as label 0).
    pub node_label_changed: bool,
}

// Key of an undirected link. Normalized so that the lexically smaller
// (node, interface) endpoint is stored as the "a" side.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct LinkKey {
    pub node_a: String,
    pub if_a: String,
    pub node_b: String,
    pub if_b: String,
}

// One endpoint's contribution to a link.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LinkHalf {
    pub metric: u32,
    pub nexthop_v4: std::net::Ipv4Addr,
    pub nexthop_v6: std::net::Ipv6Addr,
    pub weight: u64,
    pub adj_label: u32,
    pub is_overloaded: bool,
    pub only_used_by_other_node: bool,
}

// A bidirectionally observed link. The effective directed metrics use the
// symmetric maximum of both declared metrics, plus the soft-drain
// increment of the node the edge arrives at.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Link {
    pub key: LinkKey,
    pub half_a: LinkHalf,
    pub half_b: LinkHalf,
    pub metric_a_to_b: u32,
    pub metric_b_to_a: u32,
}

// Per-area store of adjacency databases and the bidirectional link view
// derived from them.
#[derive(Debug)]
pub struct LinkState {
    area: String,
    adj_dbs: BTreeMap<String, AdjacencyDatabase>,
    // Last accepted generation per node: the transport's monotonically
    // increasing per-node version.
    generations: BTreeMap<String, i64>,
    links: BTreeMap<LinkKey, Link>,
    num_partial_adjacencies: usize,
    num_complete_adjacencies: usize,
    up_propagation: WindowedStats,
    down_propagation: WindowedStats,
}

// ===== impl LinkStateChange =====

impl LinkStateChange {
    pub fn changed(&self) -> bool {
        self.topology_changed
            || self.link_attributes_changed
            || self.node_label_changed
    }
}

// ===== impl LinkKey =====

impl LinkKey {
    fn new(node1: &str, if1: &str, node2: &str, if2: &str) -> LinkKey {
        if (node1, if1) <= (node2, if2) {
            LinkKey {
                node_a: node1.to_owned(),
                if_a: if1.to_owned(),
                node_b: node2.to_owned(),
                if_b: if2.to_owned(),
            }
        } else {
            LinkKey {
                node_a: node2.to_owned(),
                if_a: if2.to_owned(),
                node_b: node1.to_owned(),
                if_b: if1.to_owned(),
            }
        }
    }

    fn touches(&self, node: &str) -> bool {
        self.node_a == node || self.node_b == node
    }
}

// ===== impl LinkHalf =====

impl LinkHalf {
    fn from_adjacency(adj: &Adjacency) -> LinkHalf {
        LinkHalf {
            metric: adj.metric,
            nexthop_v4: adj.nexthop_v4,
            nexthop_v6: adj.nexthop_v6,
            weight: adj.weight,
            adj_label: adj.adj_label,
            is_overloaded: adj.is_overloaded,
            only_used_by_other_node: adj.only_used_by_other_node,
        }
    }

    // Attributes whose change doesn't affect the topology.
    fn attributes(&self) -> (std::net::Ipv4Addr, std::net::Ipv6Addr, u64, u32)
    {
        (self.nexthop_v4, self.nexthop_v6, self.weight, self.adj_label)
    }
}

// ===== impl Link =====

impl Link {
    // A link is up when neither adjacency half is hard-drained. Node-level
    // drains are evaluated during SPF, not here, since a hard-drained node
    // remains reachable as a destination.
    pub fn is_up(&self) -> bool {
        !self.half_a.is_overloaded && !self.half_b.is_overloaded
    }

    // Checks the "only used by" restriction: every restricted half must
    // name the viewer as the permitted user.
    pub fn usable_by(&self, viewer: &str) -> bool {
        (!self.half_a.only_used_by_other_node || viewer == self.key.node_b)
            && (!self.half_b.only_used_by_other_node
                || viewer == self.key.node_a)
    }

    pub fn other_node(&self, node: &str) -> &str {
        if self.key.node_a == node {
            &self.key.node_b
        } else {
            &self.key.node_a
        }
    }

    // Effective metric of the directed edge leaving `node`.
    pub fn metric_from(&self, node: &str) -> u32 {
        if self.key.node_a == node {
            self.metric_a_to_b
        } else {
            self.metric_b_to_a
        }
    }

    // Local interface name and adjacency half declared by `node`.
    pub fn side(&self, node: &str) -> (&str, &LinkHalf) {
        if self.key.node_a == node {
            (&self.key.if_a, &self.half_a)
        } else {
            (&self.key.if_b, &self.half_b)
        }
    }
}

// ===== impl LinkState =====

impl LinkState {
    pub fn new(area: &str) -> LinkState {
        LinkState {
            area: area.to_owned(),
            adj_dbs: Default::default(),
            generations: Default::default(),
            links: Default::default(),
            num_partial_adjacencies: 0,
            num_complete_adjacencies: 0,
            up_propagation: WindowedStats::new_60s(),
            down_propagation: WindowedStats::new_60s(),
        }
    }

    pub fn area(&self) -> &str {
        &self.area
    }

    // Applies one node's adjacency database and reports what changed.
    // Idempotent: re-applying the same database reports no change.
    //
    // `version` is the transport's per-node generation. An update that
    // carries an empty adjacency set with a strictly newer generation
    // withdraws the node entirely, as if the transport had expired it;
    // an empty set at the same generation keeps the node known as a
    // zero-degree vertex.
    pub fn update_adjacency_database(
        &mut self,
        db: AdjacencyDatabase,
        version: i64,
        is_initial_sync: bool,
    ) -> LinkStateChange {
        let node = db.node.clone();
        let old_db = self.adj_dbs.get(&node);
        let old_label = old_db.map_or(0, |db| db.node_label);

        let prune = db.adjacencies.is_empty()
            && old_db.is_some()
            && self
                .generations
                .get(&node)
                .is_some_and(|generation| version > *generation);

        let mut change = LinkStateChange::default();
        change.node_label_changed = old_label != db.node_label;
        if let Some(old_db) = old_db {
            if old_db.is_overloaded != db.is_overloaded
                || old_db.node_metric_increment != db.node_metric_increment
            {
                change.topology_changed = true;
            }
        }

        // Apply the update first so the link diff (and its propagation
        // telemetry) reads the withdrawing node's own status records.
        let old_links = self.links_snapshot(&node);
        self.adj_dbs.insert(node.clone(), db);
        self.rebuild_links();
        let new_links = self.links_snapshot(&node);

        self.diff_links(
            &node,
            &old_links,
            &new_links,
            is_initial_sync,
            &mut change,
        );

        if prune {
            // The withdrawn entry takes its label with it.
            change.node_label_changed = old_label != 0;
            self.adj_dbs.remove(&node);
            self.generations.remove(&node);
            self.rebuild_links();
            Debug::AdjacencyDbDelete(&node, &self.area).log();
        } else {
            self.generations.insert(node.clone(), version);
            Debug::AdjacencyDbUpdate(&node, &self.area, &change).log();
        }
        change
    }

    // Removes a node's adjacency database (explicit expiry from the
    // transport).
    pub fn delete_adjacency_database(&mut self, node: &str) -> LinkStateChange {
        let Some(old_db) = self.adj_dbs.remove(node) else {
            return LinkStateChange::default();
        };
        self.generations.remove(node);

        let mut change = LinkStateChange::default();
        change.node_label_changed = old_db.node_label != 0;

        let old_links = self.links_snapshot(node);
        self.rebuild_links();
        if old_links.values().any(|link| link.is_up()) {
            change.topology_changed = true;
        }

        Debug::AdjacencyDbDelete(node, &self.area).log();
        change
    }

    pub fn get_adjacency_database(
        &self,
        node: &str,
    ) -> Option<&AdjacencyDatabase> {
        self.adj_dbs.get(node)
    }

    pub fn adjacency_databases(&self) -> &BTreeMap<String, AdjacencyDatabase> {
        &self.adj_dbs
    }

    pub fn has_node(&self, node: &str) -> bool {
        self.adj_dbs.contains_key(node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &String> + '_ {
        self.adj_dbs.keys()
    }

    pub fn node_label(&self, node: &str) -> u32 {
        self.adj_dbs.get(node).map_or(0, |db| db.node_label)
    }

    pub fn is_node_overloaded(&self, node: &str) -> bool {
        self.adj_dbs.get(node).is_some_and(|db| db.is_overloaded)
    }

    pub fn is_node_drained(&self, node: &str) -> bool {
        self.adj_dbs.get(node).is_some_and(|db| db.is_drained())
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> + '_ {
        self.links.values()
    }

    pub fn links_from<'a>(
        &'a self,
        node: &'a str,
    ) -> impl Iterator<Item = &'a Link> + 'a {
        self.links.values().filter(move |link| link.key.touches(node))
    }

    // Whether both halves of at least one link between the two nodes have
    // been received. Used by the initialization gate; the "only used by"
    // restriction and drains are irrelevant here.
    pub fn has_bidir_adjacency(&self, node1: &str, node2: &str) -> bool {
        self.links.values().any(|link| {
            link.key.touches(node1) && link.other_node(node1) == node2
        })
    }

    pub fn num_partial_adjacencies(&self) -> usize {
        self.num_partial_adjacencies
    }

    pub fn num_complete_adjacencies(&self) -> usize {
        self.num_complete_adjacencies
    }

    pub fn up_propagation(&self) -> &WindowedStats {
        &self.up_propagation
    }

    pub fn down_propagation(&self) -> &WindowedStats {
        &self.down_propagation
    }

    // Rebuilds the bidirectional link view from the half-edges declared
    // by all known adjacency databases.
    fn rebuild_links(&mut self) {
        // Index half-edges by (node, local interface).
        let mut half_edges: BTreeMap<(&str, &str), &Adjacency> =
            BTreeMap::new();
        for (node, db) in &self.adj_dbs {
            for adj in &db.adjacencies {
                half_edges
                    .insert((node.as_str(), adj.if_name.as_str()), adj);
            }
        }

        let mut links = BTreeMap::new();
        let mut num_partial = 0;
        let mut num_complete = 0;
        for ((node, if_name), adj) in &half_edges {
            let remote = (
                adj.other_node_name.as_str(),
                adj.other_if_name.as_str(),
            );
            let counterpart = half_edges.get(&remote).filter(|remote_adj| {
                remote_adj.other_node_name == *node
                    && remote_adj.other_if_name == *if_name
            });
            let Some(counterpart) = counterpart else {
                num_partial += 1;
                continue;
            };
            // Count and build each link once.
            if (*node, *if_name) > remote {
                continue;
            }
            num_complete += 1;

            let key = LinkKey::new(node, if_name, remote.0, remote.1);
            let base_metric = std::cmp::max(adj.metric, counterpart.metric);
            let increment = |node: &str| {
                self.adj_dbs
                    .get(node)
                    .map_or(0, |db| db.node_metric_increment)
            };
            let link = Link {
                half_a: LinkHalf::from_adjacency(adj),
                half_b: LinkHalf::from_adjacency(counterpart),
                metric_a_to_b: base_metric
                    .saturating_add(increment(&key.node_b)),
                metric_b_to_a: base_metric
                    .saturating_add(increment(&key.node_a)),
                key,
            };
            links.insert(link.key.clone(), link);
        }

        self.links = links;
        self.num_partial_adjacencies = num_partial;
        self.num_complete_adjacencies = num_complete;
    }

    fn links_snapshot(&self, node: &str) -> BTreeMap<LinkKey, Link> {
        self.links
            .iter()
            .filter(|(key, _)| key.touches(node))
            .map(|(key, link)| (key.clone(), link.clone()))
            .collect()
    }

    // Classifies the difference between the old and new link views around
    // the updated node.
    fn diff_links(
        &mut self,
        node: &str,
        old_links: &BTreeMap<LinkKey, Link>,
        new_links: &BTreeMap<LinkKey, Link>,
        is_initial_sync: bool,
        change: &mut LinkStateChange,
    ) {
        let keys: BTreeSet<&LinkKey> =
            old_links.keys().chain(new_links.keys()).collect();
        for key in keys {
            let old_link = old_links.get(key);
            let new_link = new_links.get(key);
            let old_up = old_link.is_some_and(|link| link.is_up());
            let new_up = new_link.is_some_and(|link| link.is_up());

            if old_up != new_up {
                change.topology_changed = true;
                if !is_initial_sync {
                    self.record_propagation(node, key, new_up);
                }
                continue;
            }
            let (Some(old_link), Some(new_link)) = (old_link, new_link)
            else {
                continue;
            };
            if !old_up {
                continue;
            }
            if old_link.metric_a_to_b != new_link.metric_a_to_b
                || old_link.metric_b_to_a != new_link.metric_b_to_a
                || old_link.half_a.only_used_by_other_node
                    != new_link.half_a.only_used_by_other_node
                || old_link.half_b.only_used_by_other_node
                    != new_link.half_b.only_used_by_other_node
            {
                change.topology_changed = true;
            } else if old_link.half_a.attributes()
                != new_link.half_a.attributes()
                || old_link.half_b.attributes() != new_link.half_b.attributes()
            {
                change.link_attributes_changed = true;
            }
        }
    }

    // Records how long the link event took to reach this process, based
    // on the transition timestamp reported by the updating node.
    fn record_propagation(&mut self, node: &str, key: &LinkKey, up: bool) {
        let sample = {
            let Some(db) = self.adj_dbs.get(node) else {
                return;
            };
            let if_name = if key.node_a == node { &key.if_a } else { &key.if_b };
            let Some(record) = db.link_status_records.get(if_name) else {
                return;
            };
            // A zero timestamp means the origin didn't record the
            // transition time.
            if record.unix_ts == 0 {
                return;
            }
            let expected = if up { LinkStatus::Up } else { LinkStatus::Down };
            if record.status != expected {
                return;
            }
            (Utc::now().timestamp_millis() - record.unix_ts).max(0)
        };
        if up {
            self.up_propagation.add(sample);
        } else {
            self.down_propagation.add(sample);
        }
    }
}
