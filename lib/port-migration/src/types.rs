// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! State tracked for each VM whose network ports are being live-migrated.

use chrono::{DateTime, Utc};
use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a VM undergoing migration.
pub type VmId = Uuid;

/// The phases a VM's network migration moves through.
///
/// The expected order is `Init -> PreMigration -> PortSetup -> Migrating ->
/// PortSwitchover -> PostMigration -> Completed`. `Failed` and `RolledBack`
/// are alternative terminal states.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationPhase {
    Init,
    PreMigration,
    PortSetup,
    Migrating,
    PortSwitchover,
    PostMigration,
    Completed,
    Failed,
    RolledBack,
}

impl MigrationPhase {
    /// Returns `true` if no further transitions are possible from this phase.
    pub fn is_terminal(&self) -> bool {
        match self {
            MigrationPhase::Completed
            | MigrationPhase::Failed
            | MigrationPhase::RolledBack => true,
            MigrationPhase::Init
            | MigrationPhase::PreMigration
            | MigrationPhase::PortSetup
            | MigrationPhase::Migrating
            | MigrationPhase::PortSwitchover
            | MigrationPhase::PostMigration => false,
        }
    }
}

/// Per-port progress marker.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum PortStatus {
    Preparing,
    DestinationPrepared,
    Completed,
    SwitchoverFailed,
    RolledBack,
}

/// Migration bookkeeping for one of a VM's network ports.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMigrationState {
    pub port_id: String,
    pub network_id: String,
    pub mac_address: String,
    pub ip_addresses: Vec<String>,

    /// The source chassis holds the authoritative binding.
    pub source_bound: bool,

    /// The destination chassis holds a binding for this port: a shadow
    /// binding before switchover, the authoritative one after it.
    pub destination_bound: bool,

    pub status: PortStatus,

    /// Why the port failed to switch over, if it did.
    pub error: Option<String>,
}

impl PortMigrationState {
    pub(crate) fn new(
        port_id: String,
        network_id: String,
        mac_address: String,
        ip_addresses: Vec<String>,
    ) -> Self {
        Self {
            port_id,
            network_id,
            mac_address,
            ip_addresses,
            source_bound: true,
            destination_bound: false,
            status: PortStatus::Preparing,
            error: None,
        }
    }
}

/// A floating IP attached to one of the VM's ports when the migration was
/// prepared.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatingIpAssociation {
    pub floating_ip: String,
    pub port_id: String,
    pub internal_ip: String,
}

/// Everything the coordinator knows about one VM's migration.
///
/// Values handed out by the coordinator are snapshots; mutating them has no
/// effect on the migration itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationContext {
    pub vm_id: VmId,
    pub source_host: String,
    pub destination_host: String,
    pub ports: Vec<PortMigrationState>,
    pub floating_ips: Vec<FloatingIpAssociation>,
    pub phase: MigrationPhase,
    pub started_at: DateTime<Utc>,

    /// Set when the migration enters any terminal phase.
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub rollback_required: bool,
}

impl MigrationContext {
    pub(crate) fn new(
        vm_id: VmId,
        source_host: String,
        destination_host: String,
    ) -> Self {
        Self {
            vm_id,
            source_host,
            destination_host,
            ports: Vec::new(),
            floating_ips: Vec::new(),
            phase: MigrationPhase::Init,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            rollback_required: false,
        }
    }

    /// Looks up the state of one of this migration's ports.
    pub fn port(&self, port_id: &str) -> Option<&PortMigrationState> {
        self.ports.iter().find(|p| p.port_id == port_id)
    }

    /// The ports that did not make it to the destination.
    pub fn failed_ports(&self) -> impl Iterator<Item = &PortMigrationState> {
        self.ports
            .iter()
            .filter(|p| p.status == PortStatus::SwitchoverFailed)
    }

    /// Moves the context into `phase`, stamping the completion time if the
    /// new phase is terminal.
    pub(crate) fn set_phase(&mut self, phase: MigrationPhase) {
        self.phase = phase;
        if phase.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
    }
}
