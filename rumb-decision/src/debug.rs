//
// Copyright (c) The Rumb Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::path::Path;

use ipnetwork::IpNetwork;
use tracing::{debug, debug_span};

use crate::instance::InitializationState;
use crate::link_state::LinkStateChange;
use crate::prefix::PrefixKey;

// Decision debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    // Instance
    InstanceStart,
    InstanceStop,
    InitializationStateChange(InitializationState),
    // Link state
    AdjacencyDbUpdate(&'a str, &'a str, &'a LinkStateChange),
    AdjacencyDbDelete(&'a str, &'a str),
    // Prefix state
    PrefixUpdate(&'a PrefixKey),
    PrefixWithdraw(&'a PrefixKey),
    SelfOriginatedPrefixSkip(&'a PrefixKey),
    // Route computation
    RouteBuild(&'a str, bool),
    RouteUpdatePublish(usize, usize, usize, usize),
    NoRouteToPrefix(&'a IpNetwork),
    MinNexthopsNotMet(&'a IpNetwork, usize, u32),
    DuplicateNodeLabel(u32),
    SkippedMplsRoute(u32),
    NoRouteToLabel(u32),
    // RIB policy
    RibPolicySet(i64),
    RibPolicyClear,
    RibPolicyExpired,
    RibPolicySave(&'a Path),
    RibPolicyLoad(&'a Path),
}

// ===== impl Debug =====

impl Debug<'_> {
    // Log debug message using the tracing API.
    pub(crate) fn log(&self) {
        match self {
            Debug::InstanceStart | Debug::InstanceStop => {
                debug!("{}", self);
            }
            Debug::InitializationStateChange(state) => {
                debug!(?state, "{}", self);
            }
            Debug::AdjacencyDbUpdate(node, area, change) => {
                debug_span!("link-state", %node, %area).in_scope(|| {
                    debug!(?change, "{}", self);
                })
            }
            Debug::AdjacencyDbDelete(node, area) => {
                debug_span!("link-state", %node, %area).in_scope(|| {
                    debug!("{}", self);
                })
            }
            Debug::PrefixUpdate(key)
            | Debug::PrefixWithdraw(key)
            | Debug::SelfOriginatedPrefixSkip(key) => {
                debug_span!("prefix-state", %key).in_scope(|| {
                    debug!("{}", self);
                })
            }
            Debug::RouteBuild(node, full) => {
                debug!(%node, %full, "{}", self);
            }
            Debug::RouteUpdatePublish(
                unicast_update,
                unicast_delete,
                mpls_update,
                mpls_delete,
            ) => {
                debug!(
                    %unicast_update, %unicast_delete, %mpls_update,
                    %mpls_delete, "{}", self
                );
            }
            Debug::NoRouteToPrefix(prefix) => {
                debug!(%prefix, "{}", self);
            }
            Debug::MinNexthopsNotMet(prefix, available, required) => {
                debug!(%prefix, %available, %required, "{}", self);
            }
            Debug::DuplicateNodeLabel(label)
            | Debug::SkippedMplsRoute(label)
            | Debug::NoRouteToLabel(label) => {
                debug!(%label, "{}", self);
            }
            Debug::RibPolicySet(ttl_secs) => {
                debug!(%ttl_secs, "{}", self);
            }
            Debug::RibPolicyClear | Debug::RibPolicyExpired => {
                debug!("{}", self);
            }
            Debug::RibPolicySave(path) | Debug::RibPolicyLoad(path) => {
                debug!(path = %path.display(), "{}", self);
            }
        }
    }
}

impl std::fmt::Display for Debug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::InstanceStart => {
                write!(f, "instance started")
            }
            Debug::InstanceStop => {
                write!(f, "instance stopped")
            }
            Debug::InitializationStateChange(..) => {
                write!(f, "initialization state change")
            }
            Debug::AdjacencyDbUpdate(..) => {
                write!(f, "adjacency database update")
            }
            Debug::AdjacencyDbDelete(..) => {
                write!(f, "adjacency database delete")
            }
            Debug::PrefixUpdate(..) => {
                write!(f, "prefix advertisement update")
            }
            Debug::PrefixWithdraw(..) => {
                write!(f, "prefix advertisement withdraw")
            }
            Debug::SelfOriginatedPrefixSkip(..) => {
                write!(f, "ignoring self-originated prefix advertisement")
            }
            Debug::RouteBuild(..) => {
                write!(f, "route computation")
            }
            Debug::RouteUpdatePublish(..) => {
                write!(f, "publishing route update")
            }
            Debug::NoRouteToPrefix(..) => {
                write!(f, "no route to prefix")
            }
            Debug::MinNexthopsNotMet(..) => {
                write!(f, "not enough nexthops to install route")
            }
            Debug::DuplicateNodeLabel(..) => {
                write!(f, "duplicate node label")
            }
            Debug::SkippedMplsRoute(..) => {
                write!(f, "skipping route for invalid MPLS label")
            }
            Debug::NoRouteToLabel(..) => {
                write!(f, "no route to node label")
            }
            Debug::RibPolicySet(..) => {
                write!(f, "RIB policy set")
            }
            Debug::RibPolicyClear => {
                write!(f, "RIB policy cleared")
            }
            Debug::RibPolicyExpired => {
                write!(f, "RIB policy expired")
            }
            Debug::RibPolicySave(..) => {
                write!(f, "saving RIB policy")
            }
            Debug::RibPolicyLoad(..) => {
                write!(f, "loading RIB policy")
            }
        }
    }
}
