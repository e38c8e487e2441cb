//
// Copyright (c) The Rumb Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::debug::Debug;
use crate::error::Error;
use crate::route::RibUnicastEntry;

// Weight override action: per-neighbor weights take precedence over
// per-area weights, which take precedence over the default.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct RibRouteActionWeight {
    #[serde(default)]
    pub default_weight: u64,
    #[serde(default)]
    pub area_to_weight: BTreeMap<String, u64>,
    #[serde(default)]
    pub neighbor_to_weight: BTreeMap<String, u64>,
}

// Action of a policy statement.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum RibRouteAction {
    SetWeight(RibRouteActionWeight),
}

// Matcher of a policy statement. Unset predicates don't participate; a
// route matches when any configured predicate matches.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct RibRouteMatcher {
    #[serde(default)]
    pub prefixes: Option<Vec<IpNetwork>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub area_stack: Option<Vec<String>>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct RibPolicyStatement {
    pub matcher: RibRouteMatcher,
    pub action: RibRouteAction,
}

// Post-processing policy applied to the computed RIB, valid for
// `ttl_secs` from the moment it is set.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct RibPolicy {
    pub statements: Vec<RibPolicyStatement>,
    pub ttl_secs: i64,
}

// An accepted policy bound to its absolute expiry deadline, both on the
// monotonic clock (for the event loop timer) and on the wall clock (for
// persistence across restarts).
#[derive(Clone, Debug)]
pub struct ActiveRibPolicy {
    pub policy: RibPolicy,
    pub expires_at: Instant,
    pub deadline_unix_ms: i64,
}

// On-disk form of a persisted policy.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
struct SavedRibPolicy {
    policy: RibPolicy,
    deadline_unix_ms: i64,
}

// ===== impl RibRouteMatcher =====

impl RibRouteMatcher {
    fn is_empty(&self) -> bool {
        self.prefixes.is_none()
            && self.tags.is_none()
            && self.area_stack.is_none()
    }

    fn matches(&self, route: &RibUnicastEntry) -> bool {
        if let Some(prefixes) = &self.prefixes {
            if prefixes.contains(&route.prefix) {
                return true;
            }
        }
        if let Some(tags) = &self.tags {
            if tags
                .iter()
                .any(|tag| route.best_prefix_entry.tags.contains(tag))
            {
                return true;
            }
        }
        if let Some(area_stack) = &self.area_stack {
            if *area_stack == route.best_prefix_entry.area_stack {
                return true;
            }
        }
        false
    }
}

// ===== impl RibPolicy =====

impl RibPolicy {
    // Synchronous validation performed before a policy is accepted. A
    // rejected policy leaves any previously active policy untouched.
    pub fn validate(&self) -> Result<(), Error> {
        if self.statements.is_empty() {
            return Err(Error::RibPolicyInvalid(
                "policy has no statements".to_owned(),
            ));
        }
        if self.ttl_secs <= 0 {
            return Err(Error::RibPolicyInvalid(
                "policy TTL must be positive".to_owned(),
            ));
        }
        for statement in &self.statements {
            if statement.matcher.is_empty() {
                return Err(Error::RibPolicyInvalid(
                    "statement has an empty matcher".to_owned(),
                ));
            }
            let RibRouteAction::SetWeight(weights) = &statement.action;
            if weights.default_weight == 0
                && weights.area_to_weight.is_empty()
                && weights.neighbor_to_weight.is_empty()
            {
                return Err(Error::RibPolicyInvalid(
                    "statement has an empty action".to_owned(),
                ));
            }
        }
        Ok(())
    }
}

// ===== impl ActiveRibPolicy =====

impl ActiveRibPolicy {
    pub fn new(policy: RibPolicy) -> ActiveRibPolicy {
        let ttl = Duration::from_secs(policy.ttl_secs as u64);
        ActiveRibPolicy {
            expires_at: Instant::now() + ttl,
            deadline_unix_ms: Utc::now().timestamp_millis()
                + ttl.as_millis() as i64,
            policy,
        }
    }

    fn from_saved(saved: SavedRibPolicy) -> Option<ActiveRibPolicy> {
        let remaining_ms =
            saved.deadline_unix_ms - Utc::now().timestamp_millis();
        if remaining_ms <= 0 {
            return None;
        }
        Some(ActiveRibPolicy {
            expires_at: Instant::now()
                + Duration::from_millis(remaining_ms as u64),
            deadline_unix_ms: saved.deadline_unix_ms,
            policy: saved.policy,
        })
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    // The policy with its TTL rewritten to the remaining lifetime, as
    // returned to API callers.
    pub fn remaining(&self) -> RibPolicy {
        let mut policy = self.policy.clone();
        policy.ttl_secs = self
            .expires_at
            .saturating_duration_since(Instant::now())
            .as_secs() as i64;
        policy
    }
}

// ===== global functions =====

// Applies the policy to the computed unicast routes, overriding nexthop
// weights on matching routes. Returns how many matched routes ended up
// with all-zero weights; those are kept installed but reported.
pub(crate) fn apply_policy(
    routes: &mut BTreeMap<IpNetwork, RibUnicastEntry>,
    policy: &RibPolicy,
) -> u64 {
    let mut invalidated_routes = 0;
    for route in routes.values_mut() {
        for statement in &policy.statements {
            if !statement.matcher.matches(route) {
                continue;
            }
            let RibRouteAction::SetWeight(weights) = &statement.action;
            for nexthop in route.nexthops.values_mut() {
                let neighbor_weight = nexthop
                    .neighbor_node
                    .as_ref()
                    .and_then(|n| weights.neighbor_to_weight.get(n));
                let area_weight = nexthop
                    .area
                    .as_ref()
                    .and_then(|a| weights.area_to_weight.get(a));
                nexthop.weight = *neighbor_weight
                    .or(area_weight)
                    .unwrap_or(&weights.default_weight);
            }
            if route.nexthops.values().all(|nexthop| nexthop.weight == 0) {
                invalidated_routes += 1;
            }
        }
    }
    invalidated_routes
}

// Loads the persisted policy. Unreadable, corrupt or expired files are
// treated as no policy.
pub(crate) fn load(path: &Path) -> Option<ActiveRibPolicy> {
    let data = std::fs::read(path).ok()?;
    let saved: SavedRibPolicy = serde_json::from_slice(&data).ok()?;
    let active = ActiveRibPolicy::from_saved(saved)?;
    Debug::RibPolicyLoad(path).log();
    Some(active)
}

// Persists the active policy, or removes the file when none is active.
pub(crate) fn save(
    path: &Path,
    active: Option<&ActiveRibPolicy>,
) -> Result<(), Error> {
    match active {
        Some(active) => {
            let saved = SavedRibPolicy {
                policy: active.policy.clone(),
                deadline_unix_ms: active.deadline_unix_ms,
            };
            let data = serde_json::to_vec(&saved)
                .expect("serializable policy");
            std::fs::write(path, data).map_err(Error::RibPolicySave)?;
            Debug::RibPolicySave(path).log();
        }
        None => {
            let _ = std::fs::remove_file(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefix::PrefixType;
    use crate::route::{NextHop, Nexthops};

    fn policy_statement(
        prefix: &str,
        neighbor_to_weight: BTreeMap<String, u64>,
    ) -> RibPolicyStatement {
        RibPolicyStatement {
            matcher: RibRouteMatcher {
                prefixes: Some(vec![prefix.parse().unwrap()]),
                ..Default::default()
            },
            action: RibRouteAction::SetWeight(RibRouteActionWeight {
                neighbor_to_weight,
                ..Default::default()
            }),
        }
    }

    fn route(prefix: &str, neighbor: &str) -> RibUnicastEntry {
        let nexthop = NextHop {
            address: "fe80::2".parse().unwrap(),
            ifname: Some("1/2".to_owned()),
            metric: 10,
            mpls_action: None,
            area: Some("0".to_owned()),
            neighbor_node: Some(neighbor.to_owned()),
            weight: 0,
        };
        RibUnicastEntry {
            prefix: prefix.parse().unwrap(),
            nexthops: Nexthops::from([(nexthop.key(), nexthop)]),
            best_prefix_entry: crate::prefix::PrefixEntry::new(
                prefix.parse().unwrap(),
                PrefixType::Config,
            ),
            best_node_area: Some((neighbor.to_owned(), "0".to_owned())),
            igp_cost: 10,
            local_route_considered: false,
        }
    }

    #[test]
    fn test_validation() {
        // Empty policy.
        let policy = RibPolicy { statements: vec![], ttl_secs: 1 };
        assert!(policy.validate().is_err());

        // Empty matcher.
        let policy = RibPolicy {
            statements: vec![RibPolicyStatement {
                matcher: Default::default(),
                action: RibRouteAction::SetWeight(RibRouteActionWeight {
                    default_weight: 1,
                    ..Default::default()
                }),
            }],
            ttl_secs: 1,
        };
        assert!(policy.validate().is_err());

        // Empty action.
        let policy = RibPolicy {
            statements: vec![RibPolicyStatement {
                matcher: RibRouteMatcher {
                    prefixes: Some(vec!["fc00::1/128".parse().unwrap()]),
                    ..Default::default()
                },
                action: RibRouteAction::SetWeight(Default::default()),
            }],
            ttl_secs: 1,
        };
        assert!(policy.validate().is_err());

        // Valid policy.
        let policy = RibPolicy {
            statements: vec![policy_statement(
                "fc00::1/128",
                [("2".to_owned(), 2)].into(),
            )],
            ttl_secs: 1,
        };
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_apply_weights() {
        let mut routes = BTreeMap::new();
        let matched = route("fc00::2/128", "2");
        let unmatched = route("fc00::3/128", "2");
        routes.insert(matched.prefix, matched.clone());
        routes.insert(unmatched.prefix, unmatched.clone());

        let policy = RibPolicy {
            statements: vec![policy_statement(
                "fc00::2/128",
                [("2".to_owned(), 2)].into(),
            )],
            ttl_secs: 1,
        };
        let invalidated = apply_policy(&mut routes, &policy);
        assert_eq!(invalidated, 0);
        assert_eq!(
            routes[&matched.prefix].nexthops.values().next().unwrap().weight,
            2
        );
        assert_eq!(
            routes[&unmatched.prefix]
                .nexthops
                .values()
                .next()
                .unwrap()
                .weight,
            0
        );
    }

    // All-zero weights keep the route installed but are reported.
    #[test]
    fn test_apply_zero_weights() {
        let mut routes = BTreeMap::new();
        let matched = route("fc00::2/128", "2");
        routes.insert(matched.prefix, matched.clone());

        let policy = RibPolicy {
            statements: vec![policy_statement(
                "fc00::2/128",
                [("2".to_owned(), 0), ("9".to_owned(), 9)].into(),
            )],
            ttl_secs: 1,
        };
        let invalidated = apply_policy(&mut routes, &policy);
        assert_eq!(invalidated, 1);
        let route = &routes[&matched.prefix];
        assert_eq!(route.nexthops.len(), 1);
        assert_eq!(route.nexthops.values().next().unwrap().weight, 0);
    }

    #[test]
    fn test_area_and_default_weights() {
        let mut routes = BTreeMap::new();
        let matched = route("fc00::2/128", "2");
        routes.insert(matched.prefix, matched.clone());

        let policy = RibPolicy {
            statements: vec![RibPolicyStatement {
                matcher: RibRouteMatcher {
                    prefixes: Some(vec!["fc00::2/128".parse().unwrap()]),
                    ..Default::default()
                },
                action: RibRouteAction::SetWeight(RibRouteActionWeight {
                    default_weight: 1,
                    area_to_weight: [("0".to_owned(), 5)].into(),
                    neighbor_to_weight: Default::default(),
                }),
            }],
            ttl_secs: 1,
        };
        apply_policy(&mut routes, &policy);
        assert_eq!(
            routes[&matched.prefix].nexthops.values().next().unwrap().weight,
            5
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let policy = RibPolicy {
            statements: vec![policy_statement(
                "fc00::2/128",
                [("2".to_owned(), 2)].into(),
            )],
            ttl_secs: 1,
        };
        let active = ActiveRibPolicy::new(policy);
        assert!(!active.is_expired());
        assert_eq!(active.remaining().ttl_secs, 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(active.is_expired());
        assert_eq!(active.remaining().ttl_secs, 0);
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let path = std::env::temp_dir()
            .join(format!("rumb-policy-test-{}.json", std::process::id()));
        let policy = RibPolicy {
            statements: vec![policy_statement(
                "fc00::2/128",
                [("2".to_owned(), 2)].into(),
            )],
            ttl_secs: 3600,
        };
        let active = ActiveRibPolicy::new(policy.clone());
        save(&path, Some(&active)).unwrap();

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.policy.statements, policy.statements);
        assert!(!loaded.is_expired());

        // Saving the absence of a policy removes the file.
        save(&path, None).unwrap();
        assert!(load(&path).is_none());
    }

    #[tokio::test]
    async fn test_load_expired_or_corrupt() {
        let path = std::env::temp_dir().join(format!(
            "rumb-policy-test-stale-{}.json",
            std::process::id()
        ));

        // Expired file.
        let saved = SavedRibPolicy {
            policy: RibPolicy { statements: vec![], ttl_secs: 1 },
            deadline_unix_ms: Utc::now().timestamp_millis() - 1000,
        };
        std::fs::write(&path, serde_json::to_vec(&saved).unwrap()).unwrap();
        assert!(load(&path).is_none());

        // Corrupt file.
        std::fs::write(&path, b"not json").unwrap();
        assert!(load(&path).is_none());

        let _ = std::fs::remove_file(&path);
    }
}
