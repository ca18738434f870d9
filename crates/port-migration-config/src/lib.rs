// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Describes a migration coordinator config which may be parsed from a TOML
//! file.

use std::path::Path;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration for the live-migration network coordinator.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone)]
pub struct Config {
    #[serde(default)]
    pub sdn: SdnConfig,

    #[serde(default)]
    pub migration: MigrationConfig,
}

/// Where and how to reach the SDN's OVSDB servers.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct SdnConfig {
    /// `host:port` of the OVN Northbound database.
    #[serde(default = "default_northbound")]
    pub northbound: String,

    /// `host:port` of the OVN Southbound database.
    #[serde(default = "default_southbound")]
    pub southbound: String,

    /// Upper bound on any single SDN call, in milliseconds.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl SdnConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for SdnConfig {
    fn default() -> Self {
        Self {
            northbound: default_northbound(),
            southbound: default_southbound(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

/// Tunables for the migration coordinator itself.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
pub struct MigrationConfig {
    /// Upper bound on calls into the port and floating IP services, in
    /// milliseconds.
    #[serde(default = "default_port_service_timeout_ms")]
    pub port_service_timeout_ms: u64,

    /// How many gratuitous ARP frames the destination agent should send
    /// after a port moves.
    #[serde(default = "default_arp_gratuitous_count")]
    pub arp_gratuitous_count: u32,

    #[serde(default = "default_true")]
    pub enable_floating_ip_migration: bool,

    /// How long finished migrations stay queryable before the periodic
    /// cleanup may purge them, in seconds.
    #[serde(default = "default_completed_retention_secs")]
    pub completed_retention_secs: u64,
}

impl MigrationConfig {
    pub fn port_service_timeout(&self) -> Duration {
        Duration::from_millis(self.port_service_timeout_ms)
    }

    pub fn completed_retention(&self) -> Duration {
        Duration::from_secs(self.completed_retention_secs)
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            port_service_timeout_ms: default_port_service_timeout_ms(),
            arp_gratuitous_count: default_arp_gratuitous_count(),
            enable_floating_ip_migration: true,
            completed_retention_secs: default_completed_retention_secs(),
        }
    }
}

fn default_northbound() -> String {
    "127.0.0.1:6641".to_string()
}

fn default_southbound() -> String {
    "127.0.0.1:6642".to_string()
}

fn default_call_timeout_ms() -> u64 {
    10_000
}

fn default_port_service_timeout_ms() -> u64 {
    30_000
}

fn default_arp_gratuitous_count() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_completed_retention_secs() -> u64 {
    3600
}

/// Errors which may be returned when parsing the coordinator configuration.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Cannot parse toml: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Parses a TOML file into a configuration object.
pub fn parse<P: AsRef<Path>>(path: P) -> Result<Config, ParseError> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let cfg = toml::from_str::<Config>(&contents)?;
    Ok(cfg)
}
