// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory stand-ins for the SDN and the collaborating services.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use slog::{Discard, Logger};

use crate::arp::GratuitousArpRequest;
use crate::collaborators::{
    CollaboratorError, FloatingIpService, HostAgent, PortInfo, PortService,
    PortUpdate,
};
use crate::sdn::{SdnControlClient, SdnError};
use crate::types::{FloatingIpAssociation, VmId};

pub(crate) fn test_logger() -> Logger {
    Logger::root(Discard, slog::o!())
}

/// The binding-related state of one port in [`FakeSdn`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct FakePort {
    pub chassis: Option<String>,
    pub requested_chassis: Option<String>,
    pub shadow_chassis: Option<String>,
}

#[derive(Default)]
struct FakeSdnState {
    ports: BTreeMap<String, FakePort>,
    fail_switch: BTreeSet<String>,
    ignore_switch: BTreeSet<String>,
    fail_shadow: BTreeSet<String>,
    switch_calls: Vec<(String, String)>,
}

/// An SDN that keeps port bindings in memory and can be told to misbehave
/// for particular ports.
#[derive(Default)]
pub(crate) struct FakeSdn {
    state: Mutex<FakeSdnState>,
}

impl FakeSdn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_port(&self, port_id: &str, chassis: &str) {
        self.state.lock().unwrap().ports.insert(
            port_id.to_string(),
            FakePort { chassis: Some(chassis.to_string()), ..Default::default() },
        );
    }

    pub fn port(&self, port_id: &str) -> FakePort {
        self.state.lock().unwrap().ports[port_id].clone()
    }

    /// Binding writes for `port_id` fail.
    pub fn fail_switch(&self, port_id: &str) {
        self.state.lock().unwrap().fail_switch.insert(port_id.to_string());
    }

    /// Binding writes for `port_id` report success without changing
    /// anything.
    pub fn ignore_switch(&self, port_id: &str) {
        self.state.lock().unwrap().ignore_switch.insert(port_id.to_string());
    }

    pub fn fail_shadow(&self, port_id: &str) {
        self.state.lock().unwrap().fail_shadow.insert(port_id.to_string());
    }

    /// Every binding write so far, as `(port, chassis)`.
    pub fn switch_calls(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().switch_calls.clone()
    }

    fn with_port<T>(
        &self,
        port_id: &str,
        f: impl FnOnce(&mut FakePort) -> T,
    ) -> Result<T, SdnError> {
        let mut state = self.state.lock().unwrap();
        let port = state
            .ports
            .get_mut(port_id)
            .ok_or_else(|| SdnError::PortNotFound(port_id.to_string()))?;
        Ok(f(port))
    }
}

#[async_trait]
impl SdnControlClient for FakeSdn {
    async fn get_port_chassis(&self, port_id: &str) -> Result<String, SdnError> {
        self.with_port(port_id, |p| p.chassis.clone())?
            .ok_or_else(|| SdnError::PortUnbound(port_id.to_string()))
    }

    async fn set_requested_chassis(
        &self,
        port_id: &str,
        chassis: &str,
    ) -> Result<(), SdnError> {
        self.with_port(port_id, |p| {
            p.requested_chassis = Some(chassis.to_string())
        })
    }

    async fn add_shadow_binding(
        &self,
        port_id: &str,
        chassis: &str,
    ) -> Result<(), SdnError> {
        if self.state.lock().unwrap().fail_shadow.contains(port_id) {
            return Err(SdnError::Rpc("shadow binding rejected".to_string()));
        }
        self.with_port(port_id, |p| p.shadow_chassis = Some(chassis.to_string()))
    }

    async fn switch_binding(
        &self,
        port_id: &str,
        chassis: &str,
    ) -> Result<(), SdnError> {
        let (fail, ignore) = {
            let mut state = self.state.lock().unwrap();
            state
                .switch_calls
                .push((port_id.to_string(), chassis.to_string()));
            (
                state.fail_switch.contains(port_id),
                state.ignore_switch.contains(port_id),
            )
        };
        if fail {
            return Err(SdnError::Transport("connection reset".to_string()));
        }
        if ignore {
            return Ok(());
        }
        self.with_port(port_id, |p| p.chassis = Some(chassis.to_string()))
    }

    async fn clear_hints(&self, port_id: &str) -> Result<(), SdnError> {
        self.with_port(port_id, |p| {
            p.requested_chassis = None;
            p.shadow_chassis = None;
        })
    }
}

/// A port service backed by a map, recording every mutation.
#[derive(Default)]
pub(crate) struct FakePortService {
    ports: Mutex<BTreeMap<String, PortInfo>>,
    fail_update: Mutex<BTreeSet<String>>,
    pub updates: Mutex<Vec<(String, Vec<PortUpdate>)>>,
    pub bindings: Mutex<BTreeMap<String, (VmId, String)>>,
}

impl FakePortService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_port(&self, port_id: &str, ips: &[&str]) {
        let n = self.ports.lock().unwrap().len() + 1;
        self.ports.lock().unwrap().insert(
            port_id.to_string(),
            PortInfo {
                network_id: "net-1".to_string(),
                mac_address: format!("02:00:00:00:00:{n:02x}"),
                fixed_ips: ips.iter().map(|ip| ip.to_string()).collect(),
            },
        );
    }

    pub fn fail_update(&self, port_id: &str) {
        self.fail_update.lock().unwrap().insert(port_id.to_string());
    }

    /// The fields most recently written for `port_id`, in order.
    pub fn updates_for(&self, port_id: &str) -> Vec<Vec<PortUpdate>> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == port_id)
            .map(|(_, u)| u.clone())
            .collect()
    }
}

#[async_trait]
impl PortService for FakePortService {
    async fn get_port(&self, port_id: &str) -> Result<PortInfo, CollaboratorError> {
        self.ports
            .lock()
            .unwrap()
            .get(port_id)
            .cloned()
            .ok_or_else(|| CollaboratorError::NotFound(format!("port {port_id}")))
    }

    async fn update_port(
        &self,
        port_id: &str,
        updates: Vec<PortUpdate>,
    ) -> Result<(), CollaboratorError> {
        if self.fail_update.lock().unwrap().contains(port_id) {
            return Err(CollaboratorError::Failed("update rejected".to_string()));
        }
        self.updates.lock().unwrap().push((port_id.to_string(), updates));
        Ok(())
    }

    async fn bind_port(
        &self,
        port_id: &str,
        vm_id: VmId,
        host_id: &str,
    ) -> Result<(), CollaboratorError> {
        self.bindings
            .lock()
            .unwrap()
            .insert(port_id.to_string(), (vm_id, host_id.to_string()));
        Ok(())
    }

    async fn unbind_port(&self, port_id: &str) -> Result<(), CollaboratorError> {
        self.bindings.lock().unwrap().remove(port_id);
        Ok(())
    }
}

/// `(floating_ip, old_port, new_port, new_internal_ip)`
pub(crate) type FloatingIpMove = (String, String, String, String);

#[derive(Default)]
pub(crate) struct FakeFloatingIps {
    pub associations: Mutex<Vec<FloatingIpAssociation>>,
    pub moves: Mutex<Vec<FloatingIpMove>>,
}

impl FakeFloatingIps {
    pub fn moves(&self) -> Vec<FloatingIpMove> {
        self.moves.lock().unwrap().clone()
    }
}

#[async_trait]
impl FloatingIpService for FakeFloatingIps {
    async fn floating_ips_for_vm(
        &self,
        _vm_id: VmId,
    ) -> Result<Vec<FloatingIpAssociation>, CollaboratorError> {
        Ok(self.associations.lock().unwrap().clone())
    }

    async fn migrate_floating_ip(
        &self,
        floating_ip: &str,
        old_port_id: &str,
        new_port_id: &str,
        new_internal_ip: &str,
    ) -> Result<(), CollaboratorError> {
        self.moves.lock().unwrap().push((
            floating_ip.to_string(),
            old_port_id.to_string(),
            new_port_id.to_string(),
            new_internal_ip.to_string(),
        ));
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingHostAgent {
    pub requests: Mutex<Vec<GratuitousArpRequest>>,
}

#[async_trait]
impl HostAgent for RecordingHostAgent {
    async fn send_gratuitous_arp(
        &self,
        request: GratuitousArpRequest,
    ) -> Result<(), CollaboratorError> {
        self.requests.lock().unwrap().push(request);
        Ok(())
    }
}
