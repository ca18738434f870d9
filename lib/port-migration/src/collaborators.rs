// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Services outside the coordinator that it consults or drives during a
//! migration.

use async_trait::async_trait;
use thiserror::Error;

use crate::arp::GratuitousArpRequest;
use crate::types::{FloatingIpAssociation, VmId};

/// Errors returned by collaborating services.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CollaboratorError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("call to {0} timed out")]
    Timeout(&'static str),

    #[error("{0}")]
    Failed(String),
}

/// A port's addressing, as recorded by the port service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortInfo {
    pub network_id: String,
    pub mac_address: String,
    pub fixed_ips: Vec<String>,
}

/// Sets (`Some`) or removes (`None`) one field of a port record, addressed
/// by a dotted path such as `external_ids.source-host`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortUpdate {
    pub field: String,
    pub value: Option<String>,
}

impl PortUpdate {
    pub fn set(field: &str, value: impl Into<String>) -> Self {
        Self { field: field.to_string(), value: Some(value.into()) }
    }

    pub fn clear(field: &str) -> Self {
        Self { field: field.to_string(), value: None }
    }
}

/// The control plane's record of network ports.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PortService: Send + Sync {
    async fn get_port(&self, port_id: &str) -> Result<PortInfo, CollaboratorError>;

    async fn update_port(
        &self,
        port_id: &str,
        updates: Vec<PortUpdate>,
    ) -> Result<(), CollaboratorError>;

    /// Records that `port_id` belongs to `vm_id` running on `host_id`.
    async fn bind_port(
        &self,
        port_id: &str,
        vm_id: VmId,
        host_id: &str,
    ) -> Result<(), CollaboratorError>;

    /// Clears `port_id`'s VM and host binding. The coordinator never calls
    /// this: a migrated port is rebound with [`PortService::bind_port`].
    async fn unbind_port(&self, port_id: &str) -> Result<(), CollaboratorError>;
}

/// Floating IP bookkeeping and NAT rule management.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FloatingIpService: Send + Sync {
    /// Lists the floating IPs currently attached to `vm_id`'s ports.
    async fn floating_ips_for_vm(
        &self,
        vm_id: VmId,
    ) -> Result<Vec<FloatingIpAssociation>, CollaboratorError>;

    /// Re-points `floating_ip`'s NAT rule at `new_internal_ip` on
    /// `new_port_id`. Must be idempotent: repeating a call with the same
    /// arguments after a partial failure leaves the rule correct.
    async fn migrate_floating_ip(
        &self,
        floating_ip: &str,
        old_port_id: &str,
        new_port_id: &str,
        new_internal_ip: &str,
    ) -> Result<(), CollaboratorError>;
}

/// The network agent running on a compute host.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HostAgent: Send + Sync {
    /// Asks the agent on `request.host_id` to announce the port's addresses.
    /// The agent owns transmission and pacing of the frames.
    async fn send_gratuitous_arp(
        &self,
        request: GratuitousArpRequest,
    ) -> Result<(), CollaboratorError>;
}
