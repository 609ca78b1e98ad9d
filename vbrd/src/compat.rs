// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Legacy status shim for tools that expect Linux bonding/VLAN state files.
//!
//! The core publishes a snapshot whenever bond membership, hash assignments,
//! or a port's implicit VLAN change; what the consumer does with it is not
//! our concern.

use common::network::MacAddr;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BondSlaveStatus {
    pub name: String,
    /// Carrier detected, enabled, and no pending delay: the same notion of
    /// "up" the Linux bonding driver reports for a slave.
    pub up: bool,
    pub mac: Option<MacAddr>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BondStatus {
    pub up: bool,
    pub updelay_ms: i64,
    pub downdelay_ms: i64,
    /// (hash bucket, slave device) for every assigned bucket.
    pub hashes: Vec<(u8, String)>,
    pub slaves: Vec<BondSlaveStatus>,
}

pub trait ProcCompat {
    /// Publish bond state for `port`, or retract it with `None`.
    fn update_bond(&mut self, port: &str, bond: Option<&BondStatus>);

    /// Publish the VLAN device association for `port`, or retract it.
    fn update_vlan(&mut self, port: &str, vlandev: Option<&str>, vlan: u16);
}

/// Used when no compatibility consumer exists.
#[derive(Default)]
pub struct NullCompat;

impl ProcCompat for NullCompat {
    fn update_bond(&mut self, _port: &str, _bond: Option<&BondStatus>) {}

    fn update_vlan(&mut self, _port: &str, _vlandev: Option<&str>, _vlan: u16) {
    }
}

#[cfg(test)]
#[derive(Default)]
pub struct RecordingCompat {
    pub bonds: std::collections::BTreeMap<String, Option<BondStatus>>,
    pub vlans: std::collections::BTreeMap<String, Option<(String, u16)>>,
}

#[cfg(test)]
impl ProcCompat for RecordingCompat {
    fn update_bond(&mut self, port: &str, bond: Option<&BondStatus>) {
        self.bonds.insert(port.to_string(), bond.cloned());
    }

    fn update_vlan(&mut self, port: &str, vlandev: Option<&str>, vlan: u16) {
        self.vlans.insert(
            port.to_string(),
            vlandev.map(|dev| (dev.to_string(), vlan)),
        );
    }
}
