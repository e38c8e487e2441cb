//
// Copyright (c) The Rumb Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeSet;

use ipnetwork::IpNetwork;

use crate::link_state::LinkStateChange;
use crate::perf::PerfEvents;

// Event marking the moment an update entered the decision engine.
pub const DECISION_RECEIVED: &str = "DECISION_RECEIVED";

// Accumulates the effect of a debounce window's worth of updates and
// decides between a full SPF rebuild and a per-prefix re-resolution.
#[derive(Debug)]
pub struct PendingUpdates {
    my_node_name: String,
    needs_full_rebuild: bool,
    updated_prefixes: BTreeSet<IpNetwork>,
    perf_events: Option<PerfEvents>,
}

// ===== impl PendingUpdates =====

impl PendingUpdates {
    pub fn new(my_node_name: &str) -> PendingUpdates {
        PendingUpdates {
            my_node_name: my_node_name.to_owned(),
            needs_full_rebuild: false,
            updated_prefixes: Default::default(),
            perf_events: None,
        }
    }

    // Topology and node-label changes anywhere require a full rebuild;
    // link-attribute changes only matter on the viewer's own links (they
    // change the viewer's outgoing nexthops).
    pub fn apply_link_state_change(
        &mut self,
        node_name: &str,
        change: &LinkStateChange,
        perf_events: Option<&PerfEvents>,
    ) {
        self.needs_full_rebuild |= change.topology_changed
            || change.node_label_changed
            || (change.link_attributes_changed
                && node_name == self.my_node_name);
        self.add_update(perf_events);
    }

    pub fn apply_prefix_state_change(
        &mut self,
        prefixes: BTreeSet<IpNetwork>,
        perf_events: Option<&PerfEvents>,
    ) {
        self.updated_prefixes.extend(prefixes);
        self.add_update(perf_events);
    }

    // Used for inputs that invalidate the whole RIB, e.g. RIB policy
    // transitions and static MPLS route changes.
    pub fn set_needs_full_rebuild(&mut self) {
        self.needs_full_rebuild = true;
        self.add_update(None);
    }

    pub fn needs_full_rebuild(&self) -> bool {
        self.needs_full_rebuild
    }

    pub fn needs_route_update(&self) -> bool {
        self.needs_full_rebuild || !self.updated_prefixes.is_empty()
    }

    pub fn updated_prefixes(&self) -> &BTreeSet<IpNetwork> {
        &self.updated_prefixes
    }

    pub fn perf_events(&self) -> Option<&PerfEvents> {
        self.perf_events.as_ref()
    }

    pub fn reset(&mut self) {
        self.needs_full_rebuild = false;
        self.updated_prefixes.clear();
        self.perf_events = None;
    }

    // Returns the accumulated state and resets the aggregator.
    pub fn take(
        &mut self,
    ) -> (bool, BTreeSet<IpNetwork>, Option<PerfEvents>) {
        let needs_full_rebuild = self.needs_full_rebuild;
        let updated_prefixes = std::mem::take(&mut self.updated_prefixes);
        let perf_events = self.perf_events.take();
        self.needs_full_rebuild = false;
        (needs_full_rebuild, updated_prefixes, perf_events)
    }

    // Keeps the trail whose oldest event is earliest, so the measured
    // convergence time spans the whole debounced batch.
    fn add_update(&mut self, perf_events: Option<&PerfEvents>) {
        let adopt = match &self.perf_events {
            None => true,
            Some(current) => match (
                perf_events.and_then(|events| events.first_ts()),
                current.first_ts(),
            ) {
                (Some(incoming), Some(current)) => incoming < current,
                _ => false,
            },
        };
        if adopt {
            let mut events = perf_events.cloned().unwrap_or_default();
            events.push_event(&self.my_node_name, DECISION_RECEIVED);
            self.perf_events = Some(events);
        }
    }
}
