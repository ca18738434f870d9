// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Moves a single logical port's chassis binding from one host to another.
//!
//! The steps, in the order a migration uses them:
//!
//! 1. [`PortBindingSwitcher::prepare_destination`] pre-stages a shadow
//!    binding on the destination so its forwarding state can converge early.
//! 2. [`PortBindingSwitcher::request_claim`] marks the destination as the
//!    chassis that should claim the port.
//! 3. [`PortBindingSwitcher::switch_binding`] is the commit point: one
//!    authoritative write of the binding followed by a read-back. Several
//!    independent forwarding agents act on the binding, so a write that
//!    didn't take would leave the port owned by nobody without anyone
//!    noticing; the read-back turns that into a reported failure.
//! 4. [`PortBindingSwitcher::cleanup`] clears the hints once the port has
//!    moved, or [`PortBindingSwitcher::rollback`] returns the binding to the
//!    source if the migration is abandoned.
//!
//! Steps 1 and 2 are advisory and return errors for the caller to log. The
//! cleanup and rollback paths log their own failures and never return them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use slog::{debug, error, info, warn, Logger};
use thiserror::Error;

use crate::sdn::{SdnControlClient, SdnError};

/// Ways in which a switchover can fail.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SwitchoverError {
    #[error("failed to bind port {port_id} to {host}: {source}")]
    Write { port_id: String, host: String, source: SdnError },

    #[error("failed to read back binding of port {port_id}: {source}")]
    Verify { port_id: String, source: SdnError },

    #[error(
        "port {port_id} is bound to {actual} after switchover, \
        expected {expected}"
    )]
    Mismatch { port_id: String, expected: String, actual: String },
}

impl SwitchoverError {
    /// The chassis the port was observed on during verification, if the
    /// read-back got that far.
    pub fn observed_host(&self) -> Option<&str> {
        match self {
            SwitchoverError::Mismatch { actual, .. } => Some(actual),
            SwitchoverError::Write { .. } | SwitchoverError::Verify { .. } => {
                None
            }
        }
    }
}

pub struct PortBindingSwitcher {
    sdn: Arc<dyn SdnControlClient>,
    call_timeout: Duration,
    log: Logger,
}

impl PortBindingSwitcher {
    pub fn new(
        sdn: Arc<dyn SdnControlClient>,
        call_timeout: Duration,
        log: &Logger,
    ) -> Self {
        Self {
            sdn,
            call_timeout,
            log: log.new(slog::o!("component" => "port-binding-switcher")),
        }
    }

    /// Runs one SDN call under the switcher's deadline. Expiry is reported
    /// as a failure of the call.
    async fn bounded<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = Result<T, SdnError>>,
    ) -> Result<T, SdnError> {
        tokio::time::timeout(self.call_timeout, call)
            .await
            .map_err(|_| SdnError::Timeout(op))?
    }

    /// Reads the chassis that currently owns `port_id`.
    pub async fn current_binding(&self, port_id: &str) -> Result<String, SdnError> {
        self.bounded("get_port_chassis", self.sdn.get_port_chassis(port_id))
            .await
    }

    /// Pre-stages a shadow binding for `port_id` on `dest_host`.
    pub async fn prepare_destination(
        &self,
        port_id: &str,
        dest_host: &str,
    ) -> Result<(), SdnError> {
        debug!(self.log, "adding shadow binding";
               "port_id" => port_id, "dest" => dest_host);
        self.bounded(
            "add_shadow_binding",
            self.sdn.add_shadow_binding(port_id, dest_host),
        )
        .await
    }

    /// Signals that `dest_host` intends to claim `port_id`.
    pub async fn request_claim(
        &self,
        port_id: &str,
        dest_host: &str,
    ) -> Result<(), SdnError> {
        info!(self.log, "requesting port claim";
              "port_id" => port_id, "dest" => dest_host);
        self.bounded(
            "set_requested_chassis",
            self.sdn.set_requested_chassis(port_id, dest_host),
        )
        .await
    }

    /// Binds `port_id` to `to_host` and verifies that the binding took.
    pub async fn switch_binding(
        &self,
        port_id: &str,
        from_host: &str,
        to_host: &str,
    ) -> Result<(), SwitchoverError> {
        info!(self.log, "switching port binding";
              "port_id" => port_id, "from" => from_host, "to" => to_host);

        self.bounded("switch_binding", self.sdn.switch_binding(port_id, to_host))
            .await
            .map_err(|source| {
                error!(self.log, "failed to switch port binding";
                       "port_id" => port_id, "error" => %source);
                SwitchoverError::Write {
                    port_id: port_id.to_string(),
                    host: to_host.to_string(),
                    source,
                }
            })?;

        let actual = self.current_binding(port_id).await.map_err(|source| {
            error!(self.log, "failed to verify port binding";
                   "port_id" => port_id, "error" => %source);
            SwitchoverError::Verify { port_id: port_id.to_string(), source }
        })?;

        if actual != to_host {
            error!(self.log, "port binding verification failed";
                   "port_id" => port_id,
                   "expected" => to_host,
                   "actual" => &actual);
            return Err(SwitchoverError::Mismatch {
                port_id: port_id.to_string(),
                expected: to_host.to_string(),
                actual,
            });
        }

        info!(self.log, "port binding switched";
              "port_id" => port_id, "chassis" => to_host);
        Ok(())
    }

    /// Returns `port_id`'s binding to `to_host` and drops any migration
    /// hints. Safe to repeat.
    pub async fn rollback(&self, port_id: &str, to_host: &str) {
        warn!(self.log, "rolling back port binding";
              "port_id" => port_id, "to" => to_host);

        if let Err(e) = self
            .bounded("switch_binding", self.sdn.switch_binding(port_id, to_host))
            .await
        {
            error!(self.log, "failed to roll back port binding";
                   "port_id" => port_id, "error" => %e);
        }

        self.clear_hints(port_id).await;
    }

    /// Drops migration hints after a successful switchover.
    pub async fn cleanup(&self, port_id: &str) {
        debug!(self.log, "cleaning up migration hints"; "port_id" => port_id);
        self.clear_hints(port_id).await;
    }

    async fn clear_hints(&self, port_id: &str) {
        if let Err(e) =
            self.bounded("clear_hints", self.sdn.clear_hints(port_id)).await
        {
            debug!(self.log, "failed to clear migration hints";
                   "port_id" => port_id, "error" => %e);
        }
    }
}
