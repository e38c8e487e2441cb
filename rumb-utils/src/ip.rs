//
// Copyright (c) The Rumb Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};

// Address Family identifier.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum AddressFamily {
    Ipv4 = 1,
    Ipv6 = 2,
}

// Extension methods for IpAddr.
pub trait IpAddrExt {
    // Returns the address family of this address.
    fn address_family(&self) -> AddressFamily;

    // Returns true if this is an usable address.
    fn is_usable(&self) -> bool;

    // Returns an unspecified address of the given address family.
    fn unspecified(af: AddressFamily) -> IpAddr;
}

// Extension methods for IpNetwork.
pub trait IpNetworkExt {
    // Returns the address family of this network.
    fn address_family(&self) -> AddressFamily;

    // Apply mask to prefix.
    #[must_use]
    fn apply_mask(&self) -> IpNetwork;
}

// ===== impl AddressFamily =====

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressFamily::Ipv4 => write!(f, "ipv4"),
            AddressFamily::Ipv6 => write!(f, "ipv6"),
        }
    }
}

// ===== impl IpAddr =====

impl IpAddrExt for IpAddr {
    fn address_family(&self) -> AddressFamily {
        match self {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    fn is_usable(&self) -> bool {
        !self.is_unspecified() && !self.is_multicast()
    }

    fn unspecified(af: AddressFamily) -> IpAddr {
        match af {
            AddressFamily::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

// ===== impl IpNetwork =====

impl IpNetworkExt for IpNetwork {
    fn address_family(&self) -> AddressFamily {
        match self {
            IpNetwork::V4(_) => AddressFamily::Ipv4,
            IpNetwork::V6(_) => AddressFamily::Ipv6,
        }
    }

    fn apply_mask(&self) -> IpNetwork {
        match self {
            IpNetwork::V4(network) => {
                let network = Ipv4Network::new(
                    network.network(),
                    network.prefix(),
                )
                .unwrap();
                IpNetwork::V4(network)
            }
            IpNetwork::V6(network) => {
                let network = Ipv6Network::new(
                    network.network(),
                    network.prefix(),
                )
                .unwrap();
                IpNetwork::V6(network)
            }
        }
    }
}
