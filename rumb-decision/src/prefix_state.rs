//
// Copyright (c) The Rumb Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};

use ipnetwork::IpNetwork;

use crate::prefix::{
    PrefixEntry, PrefixKey, ReceivedRouteDetail, ReceivedRouteFilter,
};

// Store of prefix advertisements, keyed by prefix and then by advertising
// (node, area). At most one entry exists per (node, prefix, area).
#[derive(Debug, Default)]
pub struct PrefixState {
    prefixes: BTreeMap<IpNetwork, BTreeMap<(String, String), PrefixEntry>>,
}

// ===== impl PrefixState =====

impl PrefixState {
    // Applies one advertisement. Returns the set of prefixes whose
    // advertisement state changed; idempotent updates return an empty set.
    pub fn update_prefix(
        &mut self,
        key: &PrefixKey,
        entry: PrefixEntry,
    ) -> BTreeSet<IpNetwork> {
        let advertisers = self.prefixes.entry(key.prefix).or_default();
        let node_area = (key.node.clone(), key.area.clone());
        if advertisers.get(&node_area) == Some(&entry) {
            return BTreeSet::new();
        }
        advertisers.insert(node_area, entry);
        [key.prefix].into()
    }

    // Withdraws one advertisement. Returns the set of prefixes whose
    // advertisement state changed.
    pub fn delete_prefix(&mut self, key: &PrefixKey) -> BTreeSet<IpNetwork> {
        let Some(advertisers) = self.prefixes.get_mut(&key.prefix) else {
            return BTreeSet::new();
        };
        let node_area = (key.node.clone(), key.area.clone());
        if advertisers.remove(&node_area).is_none() {
            return BTreeSet::new();
        }
        if advertisers.is_empty() {
            self.prefixes.remove(&key.prefix);
        }
        [key.prefix].into()
    }

    pub fn prefixes(&self) -> impl Iterator<Item = &IpNetwork> + '_ {
        self.prefixes.keys()
    }

    pub fn num_prefixes(&self) -> usize {
        self.prefixes.len()
    }

    // All advertisements of one prefix, keyed by (node, area).
    pub fn entries_for_prefix(
        &self,
        prefix: &IpNetwork,
    ) -> Option<&BTreeMap<(String, String), PrefixEntry>> {
        self.prefixes.get(prefix)
    }

    pub fn get_received_routes(
        &self,
        filter: &ReceivedRouteFilter,
    ) -> Vec<ReceivedRouteDetail> {
        self.prefixes
            .iter()
            .flat_map(|(prefix, advertisers)| {
                advertisers.iter().map(move |((node, area), entry)| {
                    (prefix, node, area, entry)
                })
            })
            .filter(|(prefix, node, area, _)| filter.matches(prefix, node, area))
            .map(|(prefix, node, area, entry)| {
                ReceivedRouteDetail::new(
                    *prefix,
                    node.clone(),
                    area.clone(),
                    entry.clone(),
                )
            })
            .collect()
    }
}
