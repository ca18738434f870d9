// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Imperative access to the SDN's logical port bindings.
//!
//! The coordinator never reaches into the SDN itself: every binding query or
//! update goes through an [`SdnControlClient`]. The production implementation
//! is [`ovn::OvnSdnClient`], which speaks OVSDB JSON-RPC directly to the OVN
//! Northbound and Southbound databases.

use async_trait::async_trait;
use thiserror::Error;

pub mod ovn;
pub mod ovsdb;

/// Errors returned by SDN control operations.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SdnError {
    /// The call did not complete within its deadline. The SDN's state after
    /// a timeout is unknown and must not be assumed to reflect the request.
    #[error("SDN call `{0}` timed out")]
    Timeout(&'static str),

    #[error("logical port {0} not found")]
    PortNotFound(String),

    #[error("logical port {0} is not bound to any chassis")]
    PortUnbound(String),

    #[error("chassis {0} not found")]
    ChassisNotFound(String),

    /// The connection to the database failed or was closed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The database rejected a request.
    #[error("database error: {0}")]
    Rpc(String),

    /// The database sent a reply we could not make sense of.
    #[error("unexpected reply: {0}")]
    Protocol(String),
}

/// Commands the coordinator can issue against the SDN's port binding state.
///
/// Every operation is a synchronous network round trip from the caller's
/// perspective; callers are expected to bound them with a timeout.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SdnControlClient: Send + Sync {
    /// Returns the host whose chassis currently holds `port_id`'s binding,
    /// as recorded in the SDN's state-of-record.
    async fn get_port_chassis(&self, port_id: &str) -> Result<String, SdnError>;

    /// Marks `host` as the chassis that should claim `port_id`. Advisory.
    async fn set_requested_chassis(
        &self,
        port_id: &str,
        host: &str,
    ) -> Result<(), SdnError>;

    /// Pre-stages a secondary binding for `port_id` on `host`. Advisory.
    async fn add_shadow_binding(
        &self,
        port_id: &str,
        host: &str,
    ) -> Result<(), SdnError>;

    /// Authoritatively binds `port_id` to `host`'s chassis.
    async fn switch_binding(
        &self,
        port_id: &str,
        host: &str,
    ) -> Result<(), SdnError>;

    /// Clears any requested-chassis or shadow binding hints on `port_id`.
    async fn clear_hints(&self, port_id: &str) -> Result<(), SdnError>;
}
