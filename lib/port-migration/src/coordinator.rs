// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Keeps a VM's network ports, floating IPs and neighbors' ARP caches
//! consistent while the VM is live-migrated between hosts.
//!
//! The coordinator is driven by whoever orchestrates the hypervisor-level
//! migration, which calls, in order:
//!
//! - [`MigrationCoordinator::prepare_migration`] before the VM starts moving.
//!   Every port is checked against the SDN to be bound to the source host,
//!   then the destination is pre-staged.
//! - [`MigrationCoordinator::notify_migration_started`] once the hypervisor
//!   transfer has begun.
//! - Either [`MigrationCoordinator::complete_migration`] after the VM is
//!   running on the destination, or [`MigrationCoordinator::abort_migration`]
//!   if the migration was abandoned.
//!
//! Completion follows a "report, don't abort" policy. Once the VM has moved,
//! a port that fails to switch is a data-plane repair problem, not a reason
//! to fail the whole migration: every port is attempted, failures are
//! recorded on the port as [`PortStatus::SwitchoverFailed`], and the
//! migration still ends [`MigrationPhase::Completed`]. Callers must inspect
//! the returned ports to find out whether remediation is needed.
//!
//! Operations that mutate a migration run on their own task. A caller that
//! stops waiting for one does not interrupt it, so a migration's recorded
//! state always reflects a finished operation.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use port_migration_config::Config;
use slog::{debug, error, info, warn, Logger};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::arp::GratuitousArpRequest;
use crate::collaborators::{
    CollaboratorError, FloatingIpService, HostAgent, PortService, PortUpdate,
};
use crate::registry::{ContextGuard, MigrationRegistry};
use crate::sdn::{SdnControlClient, SdnError};
use crate::switcher::PortBindingSwitcher;
use crate::types::{
    MigrationContext, MigrationPhase, PortMigrationState, PortStatus, VmId,
};

const REQUESTED_CHASSIS_FIELD: &str = "options.requested-chassis";
const MIGRATION_IN_PROGRESS_FIELD: &str = "external_ids.migration-in-progress";
const SOURCE_HOST_FIELD: &str = "external_ids.source-host";

/// Errors returned to the caller of a coordinator operation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum MigrationError {
    #[error("no migration context for VM {0}")]
    NoMigration(VmId),

    #[error("migration already in progress for VM {0}")]
    AlreadyInProgress(VmId),

    #[error("failed to get port {port_id}: {source}")]
    PortLookup { port_id: String, source: CollaboratorError },

    #[error("failed to read chassis binding of port {port_id}: {source}")]
    BindingLookup { port_id: String, source: SdnError },

    #[error("port {port_id} is bound to {actual}, not source {expected}")]
    PortNotOnSource { port_id: String, expected: String, actual: String },

    #[error("failed to list floating IPs of VM {vm_id}: {source}")]
    FloatingIpLookup { vm_id: VmId, source: CollaboratorError },

    #[error("failed to set up destination for port {port_id}: {source}")]
    DestinationSetup { port_id: String, source: CollaboratorError },

    #[error("cannot {op} migration of VM {vm_id} in phase {phase}")]
    InvalidPhase { vm_id: VmId, op: &'static str, phase: MigrationPhase },

    /// The task running the operation panicked. A migration the task left
    /// unfinished is marked [`MigrationPhase::Failed`].
    #[error("migration task for VM {0} did not run to completion")]
    TaskFailed(VmId),
}

/// A request to get a VM's ports ready to move.
#[derive(Clone, Debug)]
pub struct PrepareMigrationRequest {
    pub vm_id: VmId,
    pub source_host: String,
    pub destination_host: String,

    /// The VM's ports, in the order they should be switched over.
    pub port_ids: Vec<String>,
}

/// The services the coordinator drives.
pub struct Collaborators {
    pub sdn: Arc<dyn SdnControlClient>,
    pub ports: Arc<dyn PortService>,

    /// Required for floating IP migration; without it floating IPs are left
    /// alone.
    pub floating_ips: Option<Arc<dyn FloatingIpService>>,

    /// If present, receives a gratuitous ARP request for every port that
    /// switches over.
    pub host_agent: Option<Arc<dyn HostAgent>>,
}

struct Inner {
    registry: MigrationRegistry,
    switcher: PortBindingSwitcher,
    ports: Arc<dyn PortService>,
    floating_ips: Option<Arc<dyn FloatingIpService>>,
    host_agent: Option<Arc<dyn HostAgent>>,
    service_timeout: Duration,
    arp_count: u32,
    retention: Duration,
    log: Logger,
}

/// Coordinates the network side of VM live migrations. Cloning is cheap;
/// clones share the same set of migrations.
#[derive(Clone)]
pub struct MigrationCoordinator {
    inner: Arc<Inner>,
}

impl MigrationCoordinator {
    pub fn new(config: &Config, collaborators: Collaborators, log: &Logger) -> Self {
        let log = log.new(slog::o!("component" => "migration-coordinator"));
        let floating_ips = if config.migration.enable_floating_ip_migration {
            collaborators.floating_ips
        } else {
            None
        };
        let inner = Inner {
            registry: MigrationRegistry::new(),
            switcher: PortBindingSwitcher::new(
                collaborators.sdn,
                config.sdn.call_timeout(),
                &log,
            ),
            ports: collaborators.ports,
            floating_ips,
            host_agent: collaborators.host_agent,
            service_timeout: config.migration.port_service_timeout(),
            arp_count: config.migration.arp_gratuitous_count,
            retention: config.migration.completed_retention(),
            log,
        };
        Self { inner: Arc::new(inner) }
    }

    /// Validates and pre-stages every port of a VM that is about to migrate.
    ///
    /// If a port can't be looked up or is not bound to the claimed source
    /// host, fails and leaves the VM's registered migration (if any) as it
    /// was. A failure while
    /// staging the destination leaves the migration registered as
    /// [`MigrationPhase::Failed`].
    pub async fn prepare_migration(
        &self,
        req: PrepareMigrationRequest,
    ) -> Result<MigrationContext, MigrationError> {
        let vm_id = req.vm_id;
        let inner = self.inner.clone();
        self.detached(vm_id, async move { inner.prepare(req).await }).await
    }

    /// Records that the hypervisor has started moving the VM.
    pub async fn notify_migration_started(
        &self,
        vm_id: VmId,
    ) -> Result<(), MigrationError> {
        let inner = &self.inner;
        let mut guard = inner.lock(vm_id).await?;
        match guard.phase {
            MigrationPhase::PortSetup => {
                info!(inner.log, "migration started"; "vm_id" => %vm_id);
                guard.set_phase(MigrationPhase::Migrating);
                Ok(())
            }
            MigrationPhase::Migrating => {
                debug!(inner.log, "migration already started"; "vm_id" => %vm_id);
                Ok(())
            }
            phase => Err(MigrationError::InvalidPhase { vm_id, op: "start", phase }),
        }
    }

    /// Moves every port of a migrated VM to the destination host.
    ///
    /// Succeeds once every port has been attempted, whether or not each one
    /// moved; see the module documentation.
    pub async fn complete_migration(
        &self,
        vm_id: VmId,
    ) -> Result<MigrationContext, MigrationError> {
        self.complete_migration_with_cancel(vm_id, CancellationToken::new()).await
    }

    /// Like [`Self::complete_migration`], but stops switching ports once
    /// `cancel` fires. Ports already switched stay switched; the rest are
    /// recorded as failed and the migration still completes.
    pub async fn complete_migration_with_cancel(
        &self,
        vm_id: VmId,
        cancel: CancellationToken,
    ) -> Result<MigrationContext, MigrationError> {
        let inner = self.inner.clone();
        self.detached(vm_id, async move { inner.complete(vm_id, cancel).await }).await
    }

    /// Abandons a migration that has not finished, undoing destination-side
    /// preparation.
    pub async fn abort_migration(
        &self,
        vm_id: VmId,
    ) -> Result<MigrationContext, MigrationError> {
        let inner = self.inner.clone();
        self.detached(vm_id, async move { inner.abort(vm_id).await }).await
    }

    pub async fn get_migration_status(&self, vm_id: VmId) -> Option<MigrationContext> {
        self.inner.registry.get(vm_id).await
    }

    pub async fn list_active_migrations(&self) -> Vec<MigrationContext> {
        self.inner.registry.list_active().await
    }

    /// Forgets finished migrations that completed more than `older_than`
    /// ago. Returns how many were forgotten.
    pub fn cleanup_completed_migrations(&self, older_than: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };
        let purged = self.inner.registry.purge_finished_before(cutoff);
        if purged > 0 {
            info!(self.inner.log, "purged finished migrations"; "count" => purged);
        }
        purged
    }

    /// [`Self::cleanup_completed_migrations`] with the configured retention.
    pub fn cleanup_expired_migrations(&self) -> usize {
        self.cleanup_completed_migrations(self.inner.retention)
    }

    /// Builds the neighbor cache refresh request for `port` after it has
    /// moved to `ctx`'s destination host.
    pub fn build_gratuitous_arp_request(
        &self,
        ctx: &MigrationContext,
        port: &PortMigrationState,
    ) -> GratuitousArpRequest {
        GratuitousArpRequest::for_port(
            &ctx.destination_host,
            port,
            self.inner.arp_count,
        )
    }

    /// Builds refresh requests for every port of `vm_id` that has switched
    /// over.
    pub async fn gratuitous_arp_requests(
        &self,
        vm_id: VmId,
    ) -> Option<Vec<GratuitousArpRequest>> {
        let ctx = self.get_migration_status(vm_id).await?;
        Some(
            ctx.ports
                .iter()
                .filter(|p| p.status == PortStatus::Completed)
                .map(|p| self.build_gratuitous_arp_request(&ctx, p))
                .collect(),
        )
    }

    /// Runs `op` on its own task so that it finishes even if the caller stops
    /// waiting for it. If the task panics, a migration it left unfinished is
    /// marked failed so the VM can be prepared again.
    async fn detached<T: Send + 'static>(
        &self,
        vm_id: VmId,
        op: impl Future<Output = Result<T, MigrationError>> + Send + 'static,
    ) -> Result<T, MigrationError> {
        match tokio::spawn(op).await {
            Ok(result) => result,
            Err(e) => {
                error!(self.inner.log, "migration task failed";
                       "vm_id" => %vm_id, "error" => %e);
                if let Some(mut guard) = self.inner.registry.lock(vm_id).await {
                    if !guard.phase.is_terminal() {
                        guard.error = Some(format!("migration task failed: {e}"));
                        guard.set_phase(MigrationPhase::Failed);
                    }
                }
                Err(MigrationError::TaskFailed(vm_id))
            }
        }
    }
}

impl Inner {
    async fn lock(&self, vm_id: VmId) -> Result<ContextGuard, MigrationError> {
        self.registry.lock(vm_id).await.ok_or(MigrationError::NoMigration(vm_id))
    }

    /// Runs one call into the port or floating IP services under the
    /// configured deadline.
    async fn bounded<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = Result<T, CollaboratorError>>,
    ) -> Result<T, CollaboratorError> {
        tokio::time::timeout(self.service_timeout, call)
            .await
            .map_err(|_| CollaboratorError::Timeout(op))?
    }

    async fn prepare(
        &self,
        req: PrepareMigrationRequest,
    ) -> Result<MigrationContext, MigrationError> {
        let vm_id = req.vm_id;
        let log = self.log.new(slog::o!("vm_id" => vm_id.to_string()));
        info!(log, "preparing migration";
              "source" => &req.source_host,
              "dest" => &req.destination_host,
              "port_count" => req.port_ids.len());

        let ctx = MigrationContext::new(
            vm_id,
            req.source_host.clone(),
            req.destination_host.clone(),
        );
        let mut guard = self
            .registry
            .insert_new(ctx)
            .map_err(|_| MigrationError::AlreadyInProgress(vm_id))?;

        let ports = match self.collect_ports(&req).await {
            Ok(ports) => ports,
            Err(e) => {
                error!(log, "migration rejected"; "error" => %e);
                self.registry.discard(guard);
                return Err(e);
            }
        };
        guard.ports = ports;

        if let Some(fips) = &self.floating_ips {
            match self
                .bounded("floating_ips_for_vm", fips.floating_ips_for_vm(vm_id))
                .await
            {
                Ok(associations) => guard.floating_ips = associations,
                Err(source) => {
                    let e = MigrationError::FloatingIpLookup { vm_id, source };
                    error!(log, "migration rejected"; "error" => %e);
                    self.registry.discard(guard);
                    return Err(e);
                }
            }
        }

        guard.set_phase(MigrationPhase::PreMigration);
        if let Err(e) = self.setup_destination(&log, &mut guard).await {
            error!(log, "failed to set up destination ports"; "error" => %e);
            self.undo_destination_setup(&log, &mut guard).await;
            guard.error = Some(e.to_string());
            guard.set_phase(MigrationPhase::Failed);
            return Err(e);
        }
        guard.set_phase(MigrationPhase::PortSetup);

        info!(log, "migration prepared"; "phase" => %guard.phase);
        Ok(guard.snapshot())
    }

    /// Fetches each requested port and checks, against the SDN rather than
    /// any cached state, that it is bound to the source host.
    async fn collect_ports(
        &self,
        req: &PrepareMigrationRequest,
    ) -> Result<Vec<PortMigrationState>, MigrationError> {
        let mut ports = Vec::with_capacity(req.port_ids.len());
        for port_id in &req.port_ids {
            let info = self
                .bounded("get_port", self.ports.get_port(port_id))
                .await
                .map_err(|source| MigrationError::PortLookup {
                    port_id: port_id.clone(),
                    source,
                })?;

            let actual = self
                .switcher
                .current_binding(port_id)
                .await
                .map_err(|source| MigrationError::BindingLookup {
                    port_id: port_id.clone(),
                    source,
                })?;
            if actual != req.source_host {
                return Err(MigrationError::PortNotOnSource {
                    port_id: port_id.clone(),
                    expected: req.source_host.clone(),
                    actual,
                });
            }

            ports.push(PortMigrationState::new(
                port_id.clone(),
                info.network_id,
                info.mac_address,
                info.fixed_ips,
            ));
        }
        Ok(ports)
    }

    async fn setup_destination(
        &self,
        log: &Logger,
        guard: &mut ContextGuard,
    ) -> Result<(), MigrationError> {
        let source = guard.source_host.clone();
        let dest = guard.destination_host.clone();
        guard.rollback_required = true;

        for port in guard.ports.iter_mut() {
            // The shadow binding and claim request only speed up
            // convergence; switchover works without them.
            match self.switcher.prepare_destination(&port.port_id, &dest).await {
                Ok(()) => port.destination_bound = true,
                Err(e) => {
                    warn!(log, "failed to prepare destination binding, \
                               continuing with full switchover";
                          "port_id" => &port.port_id, "error" => %e);
                }
            }
            if let Err(e) = self.switcher.request_claim(&port.port_id, &dest).await {
                warn!(log, "failed to request port claim";
                      "port_id" => &port.port_id, "error" => %e);
            }

            let updates = vec![
                PortUpdate::set(REQUESTED_CHASSIS_FIELD, dest.as_str()),
                PortUpdate::set(MIGRATION_IN_PROGRESS_FIELD, "true"),
                PortUpdate::set(SOURCE_HOST_FIELD, source.as_str()),
            ];
            self.bounded("update_port", self.ports.update_port(&port.port_id, updates))
                .await
                .map_err(|source| MigrationError::DestinationSetup {
                    port_id: port.port_id.clone(),
                    source,
                })?;

            port.status = PortStatus::DestinationPrepared;
        }
        Ok(())
    }

    /// Reverses destination-side preparation of every port. Ports holding a
    /// destination binding are rolled back to the source; the others only
    /// have their hints cleared.
    async fn undo_destination_setup(&self, log: &Logger, guard: &mut ContextGuard) {
        let source = guard.source_host.clone();
        for port in guard.ports.iter_mut() {
            if port.destination_bound {
                self.switcher.rollback(&port.port_id, &source).await;
                port.destination_bound = false;
                port.source_bound = true;
            } else {
                self.switcher.cleanup(&port.port_id).await;
            }

            let updates = vec![
                PortUpdate::clear(REQUESTED_CHASSIS_FIELD),
                PortUpdate::clear(MIGRATION_IN_PROGRESS_FIELD),
                PortUpdate::clear(SOURCE_HOST_FIELD),
            ];
            if let Err(e) = self
                .bounded("update_port", self.ports.update_port(&port.port_id, updates))
                .await
            {
                warn!(log, "failed to clear migration markers";
                      "port_id" => &port.port_id, "error" => %e);
            }
        }
        guard.rollback_required = false;
    }

    async fn complete(
        &self,
        vm_id: VmId,
        cancel: CancellationToken,
    ) -> Result<MigrationContext, MigrationError> {
        let log = self.log.new(slog::o!("vm_id" => vm_id.to_string()));
        let mut guard = self.lock(vm_id).await?;
        match guard.phase {
            MigrationPhase::Migrating => {}
            MigrationPhase::PortSetup => {
                warn!(log, "completing migration that was never reported started");
            }
            phase => {
                return Err(MigrationError::InvalidPhase {
                    vm_id,
                    op: "complete",
                    phase,
                });
            }
        }

        info!(log, "completing migration"; "dest" => &guard.destination_host);
        guard.set_phase(MigrationPhase::PortSwitchover);

        let source = guard.source_host.clone();
        let dest = guard.destination_host.clone();
        for port in guard.ports.iter_mut() {
            if cancel.is_cancelled() {
                warn!(log, "completion cancelled, not switching port";
                      "port_id" => &port.port_id);
                port.destination_bound = false;
                port.status = PortStatus::SwitchoverFailed;
                port.error = Some("cancelled before switchover".to_string());
                continue;
            }

            match self.switcher.switch_binding(&port.port_id, &source, &dest).await {
                Ok(()) => {
                    port.source_bound = false;
                    port.destination_bound = true;
                    port.status = PortStatus::Completed;
                    port.error = None;
                    self.after_switchover(&log, vm_id, &dest, port).await;
                }
                Err(e) => {
                    error!(log, "failed to switch over port";
                           "port_id" => &port.port_id, "error" => %e);
                    port.destination_bound = false;
                    if let Some(actual) = e.observed_host() {
                        port.source_bound = actual == source;
                    }
                    port.status = PortStatus::SwitchoverFailed;
                    port.error = Some(e.to_string());
                }
            }
        }

        self.migrate_floating_ips(&log, &guard).await;

        guard.set_phase(MigrationPhase::PostMigration);
        for port in guard.ports.iter() {
            self.switcher.cleanup(&port.port_id).await;
        }
        guard.rollback_required = false;
        guard.set_phase(MigrationPhase::Completed);

        let failed = guard.failed_ports().count();
        let elapsed = Utc::now() - guard.started_at;
        if failed > 0 {
            warn!(log, "migration completed with failed ports";
                  "failed" => failed,
                  "duration_ms" => elapsed.num_milliseconds());
        } else {
            info!(log, "migration completed";
                  "duration_ms" => elapsed.num_milliseconds());
        }
        Ok(guard.snapshot())
    }

    /// Updates the port's records once it is bound to `dest` and asks the
    /// destination's agent to announce it. Nothing here can undo the
    /// switchover, so failures are only logged.
    async fn after_switchover(
        &self,
        log: &Logger,
        vm_id: VmId,
        dest: &str,
        port: &PortMigrationState,
    ) {
        let port_id = port.port_id.as_str();
        if let Err(e) = self
            .bounded("bind_port", self.ports.bind_port(port_id, vm_id, dest))
            .await
        {
            warn!(log, "failed to record port binding";
                  "port_id" => port_id, "error" => %e);
        }

        let updates = vec![
            PortUpdate::clear(MIGRATION_IN_PROGRESS_FIELD),
            PortUpdate::clear(SOURCE_HOST_FIELD),
        ];
        if let Err(e) =
            self.bounded("update_port", self.ports.update_port(port_id, updates)).await
        {
            warn!(log, "failed to clear migration markers";
                  "port_id" => port_id, "error" => %e);
        }

        if let Some(agent) = &self.host_agent {
            let request = GratuitousArpRequest::for_port(dest, port, self.arp_count);
            if let Err(e) = self
                .bounded("send_gratuitous_arp", agent.send_gratuitous_arp(request))
                .await
            {
                warn!(log, "failed to request gratuitous ARP";
                      "port_id" => port_id, "error" => %e);
            }
        }
    }

    /// Re-points each snapshotted floating IP at its port's address on the
    /// destination. Floating IPs of ports that failed to move are left
    /// alone.
    async fn migrate_floating_ips(&self, log: &Logger, ctx: &MigrationContext) {
        let Some(fips) = &self.floating_ips else {
            return;
        };

        for assoc in &ctx.floating_ips {
            let Some(port) = ctx.port(&assoc.port_id) else {
                warn!(log, "floating IP attached to a port outside this migration";
                      "floating_ip" => &assoc.floating_ip,
                      "port_id" => &assoc.port_id);
                continue;
            };
            if port.status != PortStatus::Completed {
                warn!(log, "not migrating floating IP of port that did not move";
                      "floating_ip" => &assoc.floating_ip,
                      "port_id" => &assoc.port_id);
                continue;
            }

            let internal_ip = if port.ip_addresses.contains(&assoc.internal_ip) {
                assoc.internal_ip.as_str()
            } else if let Some(first) = port.ip_addresses.first() {
                first.as_str()
            } else {
                warn!(log, "port has no address for floating IP";
                      "floating_ip" => &assoc.floating_ip,
                      "port_id" => &assoc.port_id);
                continue;
            };

            if let Err(e) = self
                .bounded(
                    "migrate_floating_ip",
                    fips.migrate_floating_ip(
                        &assoc.floating_ip,
                        &assoc.port_id,
                        &port.port_id,
                        internal_ip,
                    ),
                )
                .await
            {
                warn!(log, "failed to migrate floating IP";
                      "floating_ip" => &assoc.floating_ip, "error" => %e);
            }
        }
    }

    async fn abort(&self, vm_id: VmId) -> Result<MigrationContext, MigrationError> {
        let log = self.log.new(slog::o!("vm_id" => vm_id.to_string()));
        let mut guard = self.lock(vm_id).await?;
        if guard.phase.is_terminal() {
            return Err(MigrationError::InvalidPhase {
                vm_id,
                op: "abort",
                phase: guard.phase,
            });
        }

        info!(log, "aborting migration"; "phase" => %guard.phase);
        self.undo_destination_setup(&log, &mut guard).await;
        for port in guard.ports.iter_mut() {
            port.status = PortStatus::RolledBack;
        }
        guard.set_phase(MigrationPhase::RolledBack);

        info!(log, "migration aborted");
        Ok(guard.snapshot())
    }
}
