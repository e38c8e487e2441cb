//
// Copyright (c) The Rumb Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, BTreeSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::IpNetwork;
use rumb_utils::ip::{AddressFamily, IpAddrExt, IpNetworkExt};
use rumb_utils::mpls::Label;

use crate::counters::WindowedStats;
use crate::debug::Debug;
use crate::link_state::LinkState;
use crate::prefix::{PrefixEntry, PrefixForwardingType};
use crate::prefix_state::PrefixState;
use crate::route::{
    DecisionRouteDb, MplsAction, NextHop, Nexthops, RibMplsEntry,
    RibUnicastEntry,
};
use crate::Config;

// Best-route selection result for one prefix: all advertisers that tied
// on the selection metrics, plus the single deterministic winner.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BestRoutes {
    pub all_node_areas: BTreeSet<(String, String)>,
    pub best_node_area: (String, String),
}

// First hop of an equal-cost shortest path from the viewer.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct FirstHop {
    pub neighbor: String,
    pub if_name: String,
    pub nexthop_v4: Ipv4Addr,
    pub nexthop_v6: Ipv6Addr,
}

// Per-node result of one area SPF run.
#[derive(Clone, Debug)]
pub struct SpfNode {
    pub metric: u32,
    pub first_hops: BTreeSet<FirstHop>,
}

// SPF result of one area, keyed by reachable node name.
pub type SpfResult = BTreeMap<String, SpfNode>;

// Solver statistics, exported as counters.
#[derive(Debug)]
pub struct SolverStats {
    pub spf_runs: u64,
    pub route_build_runs: u64,
    pub get_route_for_prefix: u64,
    pub duplicate_node_label: WindowedStats,
    pub no_route_to_prefix: WindowedStats,
    pub skipped_mpls_route: WindowedStats,
    pub no_route_to_label: WindowedStats,
}

// Pure route computation engine: a function of (viewer, link state per
// area, prefix state) to a RIB. Holds the static routes injected by
// upstream components and caches the last SPF results so that pure
// prefix changes only re-resolve the affected prefixes.
#[derive(Debug)]
pub struct SpfSolver {
    config: Config,
    spf_results: BTreeMap<String, SpfResult>,
    best_routes_cache: BTreeMap<IpNetwork, BestRoutes>,
    static_unicast_routes: BTreeMap<IpNetwork, RibUnicastEntry>,
    static_mpls_routes: BTreeMap<Label, RibMplsEntry>,
    pub stats: SolverStats,
}

// One reachable advertisement of a prefix, under evaluation.
struct Advertiser<'a> {
    node: &'a str,
    area: &'a str,
    entry: &'a PrefixEntry,
    igp_cost: u32,
    drained: bool,
}

// ===== impl SolverStats =====

impl Default for SolverStats {
    fn default() -> SolverStats {
        SolverStats {
            spf_runs: 0,
            route_build_runs: 0,
            get_route_for_prefix: 0,
            duplicate_node_label: WindowedStats::new_60s(),
            no_route_to_prefix: WindowedStats::new_60s(),
            skipped_mpls_route: WindowedStats::new_60s(),
            no_route_to_label: WindowedStats::new_60s(),
        }
    }
}

// ===== impl SpfSolver =====

impl SpfSolver {
    pub fn new(config: Config) -> SpfSolver {
        SpfSolver {
            config,
            spf_results: Default::default(),
            best_routes_cache: Default::default(),
            static_unicast_routes: Default::default(),
            static_mpls_routes: Default::default(),
            stats: Default::default(),
        }
    }

    pub fn best_routes_cache(&self) -> &BTreeMap<IpNetwork, BestRoutes> {
        &self.best_routes_cache
    }

    // Replaces the merged set of static routes injected by upstream
    // components. Computed routes override them per prefix/label.
    pub fn set_static_unicast_routes(
        &mut self,
        routes: BTreeMap<IpNetwork, RibUnicastEntry>,
    ) {
        self.static_unicast_routes = routes;
    }

    pub fn set_static_mpls_routes(
        &mut self,
        routes: BTreeMap<Label, RibMplsEntry>,
    ) {
        self.static_mpls_routes = routes;
    }

    // Computes the full RIB of `viewer`. Returns `None` when the viewer
    // is unknown to every area.
    pub fn build_route_db(
        &mut self,
        viewer: &str,
        area_link_states: &BTreeMap<String, LinkState>,
        prefix_state: &PrefixState,
    ) -> Option<DecisionRouteDb> {
        if !area_link_states
            .values()
            .any(|link_state| link_state.has_node(viewer))
        {
            return None;
        }
        Debug::RouteBuild(viewer, true).log();
        self.stats.route_build_runs += 1;

        // Shortest-path trees, one per area.
        let mut spf_results = BTreeMap::new();
        for (area, link_state) in area_link_states {
            self.stats.spf_runs += 1;
            spf_results.insert(area.clone(), run_spf(viewer, link_state));
        }
        self.spf_results = spf_results;

        // Static routes first; computed routes override them.
        let mut route_db = DecisionRouteDb {
            unicast: self.static_unicast_routes.clone(),
            mpls: self.static_mpls_routes.clone(),
        };

        self.best_routes_cache.clear();
        let prefixes: Vec<IpNetwork> =
            prefix_state.prefixes().copied().collect();
        for prefix in prefixes {
            let (best_routes, entry) = route_for_prefix(
                &self.config,
                &mut self.stats,
                viewer,
                prefix,
                &self.spf_results,
                area_link_states,
                prefix_state,
            );
            if let Some(best_routes) = best_routes {
                self.best_routes_cache.insert(prefix, best_routes);
            }
            if let Some(entry) = entry {
                route_db.unicast.insert(prefix, entry);
            }
        }

        if self.config.enable_segment_labels {
            build_mpls_routes(
                &self.config,
                &mut self.stats,
                viewer,
                &self.spf_results,
                area_link_states,
                &mut route_db.mpls,
            );
        }

        Some(route_db)
    }

    // Re-resolves only the given prefixes against the SPF results of the
    // last full computation, editing `route_db` in place.
    pub fn update_routes_for_prefixes(
        &mut self,
        viewer: &str,
        prefixes: &BTreeSet<IpNetwork>,
        area_link_states: &BTreeMap<String, LinkState>,
        prefix_state: &PrefixState,
        route_db: &mut DecisionRouteDb,
    ) {
        Debug::RouteBuild(viewer, false).log();
        for prefix in prefixes {
            self.stats.get_route_for_prefix += 1;
            let (best_routes, entry) = route_for_prefix(
                &self.config,
                &mut self.stats,
                viewer,
                *prefix,
                &self.spf_results,
                area_link_states,
                prefix_state,
            );
            match best_routes {
                Some(best_routes) => {
                    self.best_routes_cache.insert(*prefix, best_routes);
                }
                None => {
                    self.best_routes_cache.remove(prefix);
                }
            }
            match entry {
                Some(entry) => {
                    route_db.unicast.insert(*prefix, entry);
                }
                // Fall back to a static route for the prefix, if any.
                None => match self.static_unicast_routes.get(prefix) {
                    Some(entry) => {
                        route_db.unicast.insert(*prefix, entry.clone());
                    }
                    None => {
                        route_db.unicast.remove(prefix);
                    }
                },
            }
        }
    }
}

// ===== helper functions =====

// Dijkstra over the directed metric graph of one area, from `viewer`.
//
// Metrics are strictly positive, so every equal-cost predecessor of a
// vertex settles before the vertex itself and first-hop sets merge while
// the vertex still sits on the candidate list.
fn run_spf(viewer: &str, link_state: &LinkState) -> SpfResult {
    let mut result = SpfResult::new();
    if !link_state.has_node(viewer) {
        return result;
    }

    // Candidate list keyed by (distance, node).
    let mut cand_list: BTreeMap<(u32, String), BTreeSet<FirstHop>> =
        BTreeMap::new();
    cand_list.insert((0, viewer.to_owned()), BTreeSet::new());

    while let Some(((distance, node), first_hops)) = cand_list.pop_first() {
        result.insert(
            node.clone(),
            SpfNode {
                metric: distance,
                first_hops: first_hops.clone(),
            },
        );

        // A hard-drained node carries no transit traffic. Its own edges
        // remain usable when it is the root, so a drained node still
        // computes its own RIB.
        if node != viewer && link_state.is_node_overloaded(&node) {
            continue;
        }

        for link in link_state.links_from(&node) {
            if !link.is_up() || !link.usable_by(viewer) {
                continue;
            }
            let other = link.other_node(&node);
            if result.contains_key(other) {
                continue;
            }
            let new_distance =
                distance.saturating_add(link.metric_from(&node));

            // Direct neighbors of the root contribute the first hop;
            // everything farther away inherits the parent's first hops.
            let hops: BTreeSet<FirstHop> = if node == viewer {
                let (if_name, half) = link.side(viewer);
                [FirstHop {
                    neighbor: other.to_owned(),
                    if_name: if_name.to_owned(),
                    nexthop_v4: half.nexthop_v4,
                    nexthop_v6: half.nexthop_v6,
                }]
                .into()
            } else {
                first_hops.clone()
            };

            // Check if this vertex is already present on the candidate
            // list.
            let existing = cand_list
                .keys()
                .find(|(_, cand_node)| cand_node.as_str() == other)
                .cloned();
            match existing {
                Some(cand_key) => match new_distance.cmp(&cand_key.0) {
                    // Ignore higher cost paths.
                    Ordering::Greater => continue,
                    Ordering::Less => {
                        cand_list.remove(&cand_key);
                        cand_list
                            .entry((new_distance, other.to_owned()))
                            .or_default()
                            .extend(hops);
                    }
                    Ordering::Equal => {
                        cand_list.entry(cand_key).or_default().extend(hops);
                    }
                },
                None => {
                    cand_list
                        .entry((new_distance, other.to_owned()))
                        .or_default()
                        .extend(hops);
                }
            }
        }
    }

    result
}

// Comparison key of drain-aware best-route selection; lower sorts better.
// Advertisements from drained nodes are pushed behind everything else
// regardless of their preference values.
fn selection_key(
    advertiser: &Advertiser<'_>,
) -> (i32, Reverse<i32>, Reverse<i32>, i32) {
    let metrics = &advertiser.entry.metrics;
    let effective_drain =
        std::cmp::max(metrics.drain_metric, advertiser.drained as i32);
    (
        effective_drain,
        Reverse(metrics.path_preference),
        Reverse(metrics.source_preference),
        metrics.distance,
    )
}

// Selects the best advertisement of one prefix and materializes the
// unicast route toward the allowed advertisers.
fn route_for_prefix(
    config: &Config,
    stats: &mut SolverStats,
    viewer: &str,
    prefix: IpNetwork,
    spf_results: &BTreeMap<String, SpfResult>,
    area_link_states: &BTreeMap<String, LinkState>,
    prefix_state: &PrefixState,
) -> (Option<BestRoutes>, Option<RibUnicastEntry>) {
    let Some(entries) = prefix_state.entries_for_prefix(&prefix) else {
        return (None, None);
    };

    // Collect the advertisers reachable from the viewer.
    let mut advertisers = Vec::new();
    for ((node, area), entry) in entries {
        let Some(link_state) = area_link_states.get(area) else {
            continue;
        };
        let Some(igp_cost) = spf_results
            .get(area)
            .and_then(|result| result.get(node))
            .map(|spf_node| spf_node.metric)
        else {
            continue;
        };
        advertisers.push(Advertiser {
            node: node.as_str(),
            area: area.as_str(),
            entry,
            igp_cost,
            drained: link_state.is_node_drained(node),
        });
    }
    if advertisers.is_empty() {
        stats.no_route_to_prefix.add(1);
        Debug::NoRouteToPrefix(&prefix).log();
        return (None, None);
    }

    // The allowed set carries the ECMP union; with best-route selection
    // disabled only the IGP distance is considered.
    let allowed: Vec<&Advertiser<'_>> = if config.enable_best_route_selection
    {
        let best_key = advertisers.iter().map(selection_key).min().unwrap();
        advertisers
            .iter()
            .filter(|advertiser| selection_key(advertiser) == best_key)
            .collect()
    } else {
        let min_cost =
            advertisers.iter().map(|a| a.igp_cost).min().unwrap();
        advertisers
            .iter()
            .filter(|advertiser| advertiser.igp_cost == min_cost)
            .collect()
    };
    let best = allowed
        .iter()
        .copied()
        .min_by_key(|a| (a.igp_cost, a.node, a.area))
        .unwrap();
    let best_routes = BestRoutes {
        all_node_areas: allowed
            .iter()
            .map(|a| (a.node.to_owned(), a.area.to_owned()))
            .collect(),
        best_node_area: (best.node.to_owned(), best.area.to_owned()),
    };

    // Prefixes the viewer itself originates are not installed, unless a
    // remote advertiser won strictly.
    if allowed.iter().any(|a| a.node == viewer) {
        return (Some(best_routes), None);
    }
    let local_route_considered =
        advertisers.iter().any(|a| a.node == viewer);

    // ECMP nexthops across every allowed advertiser; the nexthop metric
    // is the IGP cost to that advertiser.
    let mut nexthops = Nexthops::new();
    for advertiser in &allowed {
        let Some(spf_node) = spf_results
            .get(advertiser.area)
            .and_then(|result| result.get(advertiser.node))
        else {
            continue;
        };
        let node_label = area_link_states
            .get(advertiser.area)
            .map_or(0, |link_state| link_state.node_label(advertiser.node));
        for first_hop in &spf_node.first_hops {
            let address = match prefix.address_family() {
                AddressFamily::Ipv4 => {
                    if config.enable_v4 {
                        IpAddr::V4(first_hop.nexthop_v4)
                    } else if config.v4_over_v6_nexthop {
                        IpAddr::V6(first_hop.nexthop_v6)
                    } else {
                        continue;
                    }
                }
                AddressFamily::Ipv6 => IpAddr::V6(first_hop.nexthop_v6),
            };
            if !address.is_usable() {
                continue;
            }
            let mpls_action = match advertiser.entry.forwarding_type {
                PrefixForwardingType::Ip => None,
                // Push the advertiser's node label along transit paths;
                // a directly adjacent advertiser pops instead.
                PrefixForwardingType::SrMpls => {
                    if first_hop.neighbor == advertiser.node {
                        None
                    } else {
                        match Label::try_new(node_label) {
                            Some(label) => {
                                Some(MplsAction::Push(vec![label]))
                            }
                            None => {
                                stats.skipped_mpls_route.add(1);
                                Debug::SkippedMplsRoute(node_label).log();
                                continue;
                            }
                        }
                    }
                }
            };
            let nexthop = NextHop {
                address,
                ifname: Some(first_hop.if_name.clone()),
                metric: advertiser.igp_cost,
                mpls_action,
                area: Some(advertiser.area.to_owned()),
                neighbor_node: Some(first_hop.neighbor.clone()),
                weight: 0,
            };
            nexthops.insert(nexthop.key(), nexthop);
        }
    }
    if nexthops.is_empty() {
        stats.no_route_to_prefix.add(1);
        Debug::NoRouteToPrefix(&prefix).log();
        return (Some(best_routes), None);
    }
    if let Some(min_nexthops) = best.entry.min_nexthops {
        if (nexthops.len() as u32) < min_nexthops {
            Debug::MinNexthopsNotMet(&prefix, nexthops.len(), min_nexthops)
                .log();
            return (Some(best_routes), None);
        }
    }

    // The installed best entry reflects the winner's effective drain
    // state, so downstream consumers see why the choice was made.
    let mut best_prefix_entry = best.entry.clone();
    best_prefix_entry.metrics.drain_metric = std::cmp::max(
        best_prefix_entry.metrics.drain_metric,
        best.drained as i32,
    );
    let entry = RibUnicastEntry {
        prefix,
        nexthops,
        best_prefix_entry,
        best_node_area: Some(best_routes.best_node_area.clone()),
        igp_cost: best.igp_cost,
        local_route_considered,
    };
    (Some(best_routes), Some(entry))
}

// Emits the MPLS label routes: POP for the viewer's own node label,
// PHP/SWAP toward every other reachable node label, and PHP routes for
// the viewer's adjacency labels.
fn build_mpls_routes(
    config: &Config,
    stats: &mut SolverStats,
    viewer: &str,
    spf_results: &BTreeMap<String, SpfResult>,
    area_link_states: &BTreeMap<String, LinkState>,
    mpls_routes: &mut BTreeMap<Label, RibMplsEntry>,
) {
    // Node labels across all areas, tracking duplicate declarations.
    let mut label_owners: BTreeMap<u32, BTreeSet<(&str, &str)>> =
        BTreeMap::new();
    for (area, link_state) in area_link_states {
        for node in link_state.nodes() {
            let label_value = link_state.node_label(node);
            if label_value != 0 {
                label_owners
                    .entry(label_value)
                    .or_default()
                    .insert((node.as_str(), area.as_str()));
            }
        }
    }

    for (label_value, owners) in label_owners {
        let nodes: BTreeSet<&str> =
            owners.iter().map(|(node, _)| *node).collect();
        if nodes.len() > 1 {
            stats.duplicate_node_label.add(1);
            Debug::DuplicateNodeLabel(label_value).log();
        }
        let Some(label) = Label::try_new(label_value) else {
            stats.skipped_mpls_route.add(1);
            Debug::SkippedMplsRoute(label_value).log();
            continue;
        };

        // Deterministic duplicate resolution: the lexically highest node
        // name owns the label.
        let winner = *nodes.iter().next_back().unwrap();
        if winner == viewer {
            let nexthop = NextHop {
                address: IpAddr::unspecified(AddressFamily::Ipv6),
                ifname: None,
                metric: 0,
                mpls_action: Some(MplsAction::PopAndLookup),
                area: None,
                neighbor_node: None,
                weight: 0,
            };
            mpls_routes.insert(
                label,
                RibMplsEntry::new(label, [(nexthop.key(), nexthop)].into()),
            );
            continue;
        }

        // Reach the winner through the area where it is closest.
        let best = owners
            .iter()
            .filter(|(node, _)| *node == winner)
            .filter_map(|(node, area)| {
                spf_results
                    .get(*area)
                    .and_then(|result| result.get(*node))
                    .map(|spf_node| (spf_node.metric, *area, spf_node))
            })
            .min_by_key(|(metric, area, _)| (*metric, *area));
        let Some((metric, area, spf_node)) = best else {
            stats.no_route_to_label.add(1);
            Debug::NoRouteToLabel(label_value).log();
            continue;
        };

        let mut nexthops = Nexthops::new();
        for first_hop in &spf_node.first_hops {
            // The hop before the label's owner pops, transit hops swap.
            let mpls_action = if first_hop.neighbor == winner {
                MplsAction::Php
            } else {
                MplsAction::Swap(label)
            };
            let nexthop = NextHop {
                address: IpAddr::V6(first_hop.nexthop_v6),
                ifname: Some(first_hop.if_name.clone()),
                metric,
                mpls_action: Some(mpls_action),
                area: Some(area.to_owned()),
                neighbor_node: Some(first_hop.neighbor.clone()),
                weight: 0,
            };
            nexthops.insert(nexthop.key(), nexthop);
        }
        if nexthops.is_empty() {
            stats.no_route_to_label.add(1);
            Debug::NoRouteToLabel(label_value).log();
            continue;
        }
        mpls_routes.insert(label, RibMplsEntry::new(label, nexthops));
    }

    // PHP routes for the viewer's own adjacency labels.
    if config.enable_adjacency_labels {
        for (area, link_state) in area_link_states {
            for link in link_state.links_from(viewer) {
                if !link.is_up() || !link.usable_by(viewer) {
                    continue;
                }
                let (if_name, half) = link.side(viewer);
                if half.adj_label == 0 {
                    continue;
                }
                let Some(label) = Label::try_new(half.adj_label) else {
                    stats.skipped_mpls_route.add(1);
                    Debug::SkippedMplsRoute(half.adj_label).log();
                    continue;
                };
                // Top labels must stay unique in the produced RIB.
                if mpls_routes.contains_key(&label) {
                    stats.skipped_mpls_route.add(1);
                    Debug::SkippedMplsRoute(half.adj_label).log();
                    continue;
                }
                let nexthop = NextHop {
                    address: IpAddr::V6(half.nexthop_v6),
                    ifname: Some(if_name.to_owned()),
                    metric: link.metric_from(viewer),
                    mpls_action: Some(MplsAction::Php),
                    area: Some(area.clone()),
                    neighbor_node: Some(link.other_node(viewer).to_owned()),
                    weight: 0,
                };
                mpls_routes.insert(
                    label,
                    RibMplsEntry::new(
                        label,
                        [(nexthop.key(), nexthop)].into(),
                    ),
                );
            }
        }
    }
}
