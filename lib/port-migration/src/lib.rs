// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Network-side coordination of VM live migration.
//!
//! A VM's logical ports must follow it from the source host to the
//! destination host: the SDN's chassis binding is moved, floating IP NAT
//! rules are re-pointed, and neighbors are told where the VM's addresses now
//! live. [`MigrationCoordinator`] drives that work for any number of
//! concurrent migrations, talking to the SDN through a
//! [`sdn::SdnControlClient`] (an OVN implementation is in [`sdn::ovn`]) and
//! to the rest of the control plane through the traits in [`collaborators`].

pub mod arp;
pub mod collaborators;
pub mod coordinator;
pub mod registry;
pub mod sdn;
pub mod switcher;
pub mod types;

#[cfg(test)]
mod testutil;

pub use coordinator::{
    Collaborators, MigrationCoordinator, MigrationError, PrepareMigrationRequest,
};
pub use switcher::{PortBindingSwitcher, SwitchoverError};
pub use types::{
    FloatingIpAssociation, MigrationContext, MigrationPhase, PortMigrationState,
    PortStatus, VmId,
};
