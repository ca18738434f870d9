// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Neighbor cache refresh requests for ports that have just moved.

use serde_derive::{Deserialize, Serialize};

use crate::types::PortMigrationState;

const INTERFACE_PREFIX: &str = "veth-";
const INTERFACE_PORT_CHARS: usize = 8;

/// Everything a host agent needs to announce a port at its new location.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GratuitousArpRequest {
    pub host_id: String,

    /// Best guess at the host-side interface carrying the port.
    pub interface: String,
    pub mac_address: String,
    pub ip_addresses: Vec<String>,
    pub count: u32,
}

impl GratuitousArpRequest {
    pub fn for_port(host_id: &str, port: &PortMigrationState, count: u32) -> Self {
        Self {
            host_id: host_id.to_string(),
            interface: interface_name(&port.port_id),
            mac_address: port.mac_address.clone(),
            ip_addresses: port.ip_addresses.clone(),
            count,
        }
    }
}

/// Derives the interface name the host agent uses for `port_id`.
fn interface_name(port_id: &str) -> String {
    let short: String = port_id.chars().take(INTERFACE_PORT_CHARS).collect();
    format!("{INTERFACE_PREFIX}{short}")
}
