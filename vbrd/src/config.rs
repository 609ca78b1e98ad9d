// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The externally stored configuration.
//!
//! A whole-system snapshot is loaded (TOML) and handed to the reconfigure
//! engine, which diffs it against running state.  Free-form fields (MAC
//! addresses, VLAN lists) deliberately stay loosely typed: a bad value in
//! one record is logged and skipped without invalidating the rest of the
//! snapshot.
//!
//! The engine also writes back the chosen datapath ID per bridge and the
//! OpenFlow port number per interface; those updates are collected into a
//! [`ConfigTxn`] committed once per reconfigure.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::types::VbrdError;
use crate::types::VbrdResult;

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct SystemConfig {
    #[serde(default)]
    pub bridges: Vec<BridgeConfig>,
    /// Default controller for bridges that don't name their own.
    #[serde(default)]
    pub controller: Option<ControllerConfig>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct BridgeConfig {
    pub name: String,
    #[serde(default)]
    pub ports: Vec<PortConfig>,
    #[serde(default)]
    pub mirrors: Vec<MirrorConfig>,
    /// Free-form keys; the core consults "hwaddr" and "datapath-id".
    #[serde(default)]
    pub other_config: BTreeMap<String, String>,
    /// VLANs on which learning is disabled and all traffic floods (RSPAN).
    #[serde(default)]
    pub flood_vlans: Vec<u16>,
    #[serde(default)]
    pub netflow: Option<NetflowConfig>,
    #[serde(default)]
    pub controller: Option<ControllerConfig>,
    /// Per-bridge TLS material for the controller connection.  Removing the
    /// section removes the material.
    #[serde(default)]
    pub ssl: Option<SslConfig>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct PortConfig {
    pub name: String,
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
    /// Implicit VLAN of an access port.  Absent for trunk ports.
    #[serde(default)]
    pub tag: Option<u16>,
    /// Trunked VLANs; empty means "trunk everything".
    #[serde(default)]
    pub trunks: Vec<u16>,
    #[serde(default)]
    pub bond_updelay: i64,
    #[serde(default)]
    pub bond_downdelay: i64,
    /// Expose an internal device named after the port, tracking the bond's
    /// aggregate up/down state.
    #[serde(default)]
    pub bond_fake_iface: bool,
    /// Pinned port MAC, candidate for the bridge address election.
    #[serde(default)]
    pub mac: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct InterfaceConfig {
    pub name: String,
    /// "internal" for devices simulated entirely within the datapath.
    #[serde(default, rename = "type")]
    pub iface_type: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Ingress policing, kbps / kb.  Zero disables.
    #[serde(default)]
    pub ingress_policing_rate: u32,
    #[serde(default)]
    pub ingress_policing_burst: u32,
    #[serde(default)]
    pub mac: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct MirrorConfig {
    pub name: String,
    #[serde(default)]
    pub select_src_port: Vec<String>,
    #[serde(default)]
    pub select_dst_port: Vec<String>,
    #[serde(default)]
    pub select_vlan: Vec<u16>,
    #[serde(default)]
    pub output_port: Option<String>,
    #[serde(default)]
    pub output_vlan: Option<u16>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct NetflowConfig {
    #[serde(default)]
    pub engine_type: Option<u8>,
    #[serde(default)]
    pub engine_id: Option<u8>,
    /// Seconds; zero means "engine default".
    #[serde(default)]
    pub active_timeout: i64,
    #[serde(default)]
    pub add_id_to_interface: bool,
    #[serde(default)]
    pub targets: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct ControllerConfig {
    /// "none", "discover", or a connection target.
    pub target: String,
    /// "in-band" (default) or "out-of-band".
    #[serde(default)]
    pub connection_mode: Option<String>,
    #[serde(default)]
    pub discover_accept_regex: Option<String>,
    /// Milliseconds.
    #[serde(default)]
    pub inactivity_probe: Option<i64>,
    /// Milliseconds.
    #[serde(default)]
    pub max_backoff: Option<i64>,
    #[serde(default)]
    pub controller_rate_limit: Option<i32>,
    #[serde(default)]
    pub controller_burst_limit: Option<i32>,
    /// "standalone" (default) or "secure".
    #[serde(default)]
    pub fail_mode: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct SslConfig {
    pub private_key: String,
    pub certificate: String,
    pub ca_cert: String,
    #[serde(default)]
    pub bootstrap_ca_cert: bool,
}

/// Read and parse a configuration snapshot.
pub fn load(path: &str) -> VbrdResult<SystemConfig> {
    let contents = std::fs::read_to_string(path)?;
    toml::from_str(&contents)
        .map_err(|e| VbrdError::Config(format!("failed to parse {path}: {e}")))
}

/// State written back to external storage, one transaction per reconfigure.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ConfigTxn {
    /// Bridge name → chosen datapath ID, hex.
    pub datapath_ids: BTreeMap<String, String>,
    /// Interface name → OpenFlow port number (-1 while unresolved).
    pub ofports: BTreeMap<String, i64>,
}

pub trait ConfigSink {
    fn commit(&mut self, txn: &ConfigTxn) -> VbrdResult<()>;
}

/// Discards write-backs; used when no external store is attached.
#[derive(Default)]
pub struct NullSink;

impl ConfigSink for NullSink {
    fn commit(&mut self, _txn: &ConfigTxn) -> VbrdResult<()> {
        Ok(())
    }
}

/// Persists each transaction as a TOML state file beside the configuration.
pub struct FileStateSink {
    pub path: String,
}

impl ConfigSink for FileStateSink {
    fn commit(&mut self, txn: &ConfigTxn) -> VbrdResult<()> {
        let rendered = toml::to_string(txn)
            .map_err(|e| VbrdError::Other(format!("serializing state: {e}")))?;
        std::fs::write(&self.path, rendered)?;
        Ok(())
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct RecordingSink {
    pub committed: Vec<ConfigTxn>,
}

#[cfg(test)]
impl ConfigSink for RecordingSink {
    fn commit(&mut self, txn: &ConfigTxn) -> VbrdResult<()> {
        self.committed.push(txn.clone());
        Ok(())
    }
}
