//
// Copyright (c) The Rumb Core Contributors
//
// SPDX-License-Identifier: MIT
//

use tracing::{error, warn};

// Decision errors.
#[derive(Debug)]
pub enum Error {
    // Ingress parse errors
    AdjacencyDecode(String, serde_json::Error),
    PrefixDecode(String, serde_json::Error),
    KeyOriginMismatch(String, String),
    // RIB policy
    RibPolicyDisabled,
    RibPolicyNotFound,
    RibPolicyInvalid(String),
    RibPolicySave(std::io::Error),
    // API
    InstanceStopped,
}

// ===== impl Error =====

impl Error {
    pub(crate) fn log(&self) {
        match self {
            Error::AdjacencyDecode(key, error)
            | Error::PrefixDecode(key, error) => {
                warn!(%key, %error, "{}", self);
            }
            Error::KeyOriginMismatch(key, node) => {
                warn!(%key, %node, "{}", self);
            }
            Error::RibPolicyDisabled | Error::RibPolicyNotFound => {
                warn!("{}", self);
            }
            Error::RibPolicyInvalid(reason) => {
                warn!(%reason, "{}", self);
            }
            Error::RibPolicySave(error) => {
                error!(%error, "{}", self);
            }
            Error::InstanceStopped => {
                warn!("{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::AdjacencyDecode(..) => {
                write!(f, "failed to decode adjacency database")
            }
            Error::PrefixDecode(..) => {
                write!(f, "failed to decode prefix database")
            }
            Error::KeyOriginMismatch(..) => {
                write!(f, "key doesn't match the database origin")
            }
            Error::RibPolicyDisabled => {
                write!(f, "RIB policy support is disabled")
            }
            Error::RibPolicyNotFound => {
                write!(f, "no RIB policy is active")
            }
            Error::RibPolicyInvalid(..) => {
                write!(f, "invalid RIB policy")
            }
            Error::RibPolicySave(..) => {
                write!(f, "failed to persist RIB policy")
            }
            Error::InstanceStopped => {
                write!(f, "decision instance is no longer running")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::AdjacencyDecode(_, error)
            | Error::PrefixDecode(_, error) => Some(error),
            Error::RibPolicySave(error) => Some(error),
            _ => None,
        }
    }
}
