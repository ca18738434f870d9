// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [`SdnControlClient`] for OVN.
//!
//! Binding reads and the authoritative switchover go straight to the
//! Southbound `Port_Binding` table, which is what the ovn-controllers on each
//! chassis act on; writing there avoids waiting for northd to propagate a
//! Northbound change. Claim hints live in the Northbound
//! `Logical_Switch_Port.options` map.

use async_trait::async_trait;
use serde_json::{json, Value};
use slog::{debug, Logger};

use super::ovsdb::{self, condition, OvsdbClient};
use super::{SdnControlClient, SdnError};

const NB_DB: &str = "OVN_Northbound";
const SB_DB: &str = "OVN_Southbound";

const REQUESTED_CHASSIS: &str = "requested-chassis";
const ADDITIONAL_CHASSIS: &str = "additional-chassis";

pub struct OvnSdnClient {
    nb: OvsdbClient,
    sb: OvsdbClient,
    log: Logger,
}

impl OvnSdnClient {
    pub fn new(
        northbound: impl Into<String>,
        southbound: impl Into<String>,
        log: &Logger,
    ) -> Self {
        let log = log.new(slog::o!("component" => "ovn-client"));
        Self {
            nb: OvsdbClient::new(northbound, &log),
            sb: OvsdbClient::new(southbound, &log),
            log,
        }
    }

    async fn chassis_uuid(&self, host: &str) -> Result<String, SdnError> {
        let results = self
            .sb
            .transact(
                SB_DB,
                vec![ovsdb::select(
                    "Chassis",
                    vec![condition("name", "==", json!(host))],
                    &["_uuid"],
                )],
            )
            .await?;
        let rows = ovsdb::result_rows(&results[0])?;
        let row =
            rows.first().ok_or_else(|| SdnError::ChassisNotFound(host.into()))?;
        ovsdb::optional_uuid(&row["_uuid"])?
            .ok_or_else(|| SdnError::Protocol(format!("chassis row {row}")))
    }

    /// Applies `mutations` to the options of the Northbound port `port_id`.
    async fn mutate_options(
        &self,
        port_id: &str,
        mutations: Vec<Value>,
    ) -> Result<(), SdnError> {
        let results = self
            .nb
            .transact(
                NB_DB,
                vec![ovsdb::mutate(
                    "Logical_Switch_Port",
                    vec![condition("name", "==", json!(port_id))],
                    mutations,
                )],
            )
            .await?;
        match ovsdb::result_count(&results[0])? {
            0 => Err(SdnError::PortNotFound(port_id.into())),
            _ => Ok(()),
        }
    }

    async fn set_option(
        &self,
        port_id: &str,
        key: &str,
        value: &str,
    ) -> Result<(), SdnError> {
        debug!(self.log, "setting port option";
               "port_id" => port_id, "key" => key, "value" => value);
        // Map inserts never overwrite an existing key, so drop it first.
        self.mutate_options(
            port_id,
            vec![
                json!(["options", "delete", ["set", [key]]]),
                json!(["options", "insert", ["map", [[key, value]]]]),
            ],
        )
        .await
    }
}

#[async_trait]
impl SdnControlClient for OvnSdnClient {
    async fn get_port_chassis(&self, port_id: &str) -> Result<String, SdnError> {
        let results = self
            .sb
            .transact(
                SB_DB,
                vec![ovsdb::select(
                    "Port_Binding",
                    vec![condition("logical_port", "==", json!(port_id))],
                    &["chassis"],
                )],
            )
            .await?;
        let rows = ovsdb::result_rows(&results[0])?;
        let row =
            rows.first().ok_or_else(|| SdnError::PortNotFound(port_id.into()))?;
        let chassis = ovsdb::optional_uuid(&row["chassis"])?
            .ok_or_else(|| SdnError::PortUnbound(port_id.into()))?;

        let results = self
            .sb
            .transact(
                SB_DB,
                vec![ovsdb::select(
                    "Chassis",
                    vec![condition("_uuid", "==", json!(["uuid", chassis]))],
                    &["name"],
                )],
            )
            .await?;
        let rows = ovsdb::result_rows(&results[0])?;
        rows.first()
            .and_then(|row| row["name"].as_str())
            .map(str::to_string)
            .ok_or_else(|| SdnError::ChassisNotFound(chassis))
    }

    async fn set_requested_chassis(
        &self,
        port_id: &str,
        host: &str,
    ) -> Result<(), SdnError> {
        self.set_option(port_id, REQUESTED_CHASSIS, host).await
    }

    async fn add_shadow_binding(
        &self,
        port_id: &str,
        host: &str,
    ) -> Result<(), SdnError> {
        self.set_option(port_id, ADDITIONAL_CHASSIS, host).await
    }

    async fn switch_binding(
        &self,
        port_id: &str,
        host: &str,
    ) -> Result<(), SdnError> {
        let chassis = self.chassis_uuid(host).await?;

        // The wait pins the chassis row so the update can't commit a
        // dangling reference if the chassis goes away in between.
        let results = self
            .sb
            .transact(
                SB_DB,
                vec![
                    ovsdb::wait_until_equal(
                        "Chassis",
                        vec![condition(
                            "_uuid",
                            "==",
                            json!(["uuid", chassis.clone()]),
                        )],
                        &["name"],
                        vec![json!({ "name": host })],
                    ),
                    ovsdb::update(
                        "Port_Binding",
                        vec![condition("logical_port", "==", json!(port_id))],
                        json!({ "chassis": ["uuid", chassis] }),
                    ),
                ],
            )
            .await?;
        match ovsdb::result_count(&results[1])? {
            0 => Err(SdnError::PortNotFound(port_id.into())),
            _ => Ok(()),
        }
    }

    async fn clear_hints(&self, port_id: &str) -> Result<(), SdnError> {
        self.mutate_options(
            port_id,
            vec![json!([
                "options",
                "delete",
                ["set", [REQUESTED_CHASSIS, ADDITIONAL_CHASSIS]]
            ])],
        )
        .await
    }
}
