//
// Copyright (c) The Rumb Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod adjacency;
pub mod counters;
pub mod debounce;
pub mod debug;
pub mod error;
pub mod instance;
pub mod kv;
pub mod link_state;
pub mod pending;
pub mod perf;
pub mod prefix;
pub mod prefix_state;
pub mod rib_policy;
pub mod route;
pub mod spf;

use std::path::PathBuf;
use std::time::Duration;

// Area tag of the default area.
pub const DEFAULT_AREA: &str = "0";

// Static configuration of a decision instance.
#[derive(Clone, Debug)]
pub struct Config {
    // Name of the node this instance computes routes for.
    pub node_name: String,
    // Program IPv4 nexthops for IPv4 prefixes.
    pub enable_v4: bool,
    // Allow IPv4 prefixes over IPv6 nexthops when IPv4 is disabled.
    pub v4_over_v6_nexthop: bool,
    // Compute MPLS routes for node segment labels.
    pub enable_segment_labels: bool,
    // Compute MPLS routes for the local adjacency labels.
    pub enable_adjacency_labels: bool,
    // Run metric-based best-route selection across advertisers. When
    // disabled, advertisers are only filtered by shortest IGP distance.
    pub enable_best_route_selection: bool,
    // Accept and apply RIB policies.
    pub enable_rib_policy: bool,
    // SPF debounce window.
    pub debounce_min: Duration,
    pub debounce_max: Duration,
    // RIB policy persistence debounce window.
    pub save_rib_policy_min: Duration,
    pub save_rib_policy_max: Duration,
    // File the active RIB policy is persisted to.
    pub rib_policy_file: PathBuf,
}

// ===== impl Config =====

impl Config {
    pub fn new(node_name: &str) -> Config {
        Config {
            node_name: node_name.to_owned(),
            enable_v4: false,
            v4_over_v6_nexthop: false,
            enable_segment_labels: true,
            enable_adjacency_labels: false,
            enable_best_route_selection: true,
            enable_rib_policy: true,
            debounce_min: Duration::from_millis(10),
            debounce_max: Duration::from_millis(250),
            save_rib_policy_min: Duration::from_millis(500),
            save_rib_policy_max: Duration::from_secs(2),
            // Keyed by process id so concurrent instances don't collide.
            rib_policy_file: std::env::temp_dir()
                .join(format!("rumb-rib-policy-{}.json", std::process::id())),
        }
    }
}
