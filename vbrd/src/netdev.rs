// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Boundary with the host's network-device layer.
//!
//! Interfaces hold an open handle for the device backing them; the core only
//! uses the handful of attributes below.  `SimNet` is the in-memory
//! implementation used for tests and kernel-less runs: device state is keyed
//! by name, so a test can flip carrier on "eth0" while the model holds a
//! handle to it.

use std::cell::RefCell;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::Hasher;
use std::rc::Rc;

use common::network::MacAddr;

use crate::types::VbrdError;
use crate::types::VbrdResult;

pub trait Netdev {
    fn name(&self) -> &str;

    /// Is link beat currently detected?
    fn carrier(&self) -> bool;

    fn etheraddr(&self) -> VbrdResult<MacAddr>;

    fn set_etheraddr(&mut self, mac: MacAddr) -> VbrdResult<()>;

    /// The 802.1Q VID if this device is a VLAN device stacked on a physical
    /// one, else None.
    fn vlan_vid(&self) -> Option<u16>;

    fn set_policing(&mut self, rate: u32, burst: u32) -> VbrdResult<()>;

    /// Force the administrative up/down flag.
    fn set_up(&mut self, up: bool) -> VbrdResult<()>;

    /// Apply device-type specific options.
    fn reconfigure(
        &mut self,
        options: &BTreeMap<String, String>,
    ) -> VbrdResult<()>;
}

pub trait NetdevProvider {
    /// Open (creating if `may_create`) the named device.
    fn open(
        &self,
        name: &str,
        internal: bool,
        options: &BTreeMap<String, String>,
    ) -> VbrdResult<Box<dyn Netdev>>;
}

#[derive(Debug, Clone)]
struct SimDevState {
    mac: MacAddr,
    carrier: bool,
    vlan_vid: Option<u16>,
    up: bool,
    policing: Option<(u32, u32)>,
}

/// A deterministic MAC for a simulated device: unicast, globally-administered
/// (so it can win bridge MAC election), derived from the device name.
fn default_mac(name: &str) -> MacAddr {
    let mut hasher = DefaultHasher::new();
    hasher.write(name.as_bytes());
    let h = hasher.finish();
    let mut octets = MacAddr::from(h & 0xffff_ffff_ffff).octets();
    octets[0] &= !0x03;
    // Never all-zero, even for an unlucky name.
    octets[5] |= 0x01;
    MacAddr::from(octets)
}

#[derive(Default)]
struct SimNetState {
    devices: BTreeMap<String, SimDevState>,
    /// Names that refuse to open, to exercise the pruning paths.
    denied: BTreeMap<String, ()>,
}

/// Shared simulated device registry; clones refer to the same state.
#[derive(Clone, Default)]
pub struct SimNet {
    state: Rc<RefCell<SimNetState>>,
}

impl SimNet {
    pub fn new() -> SimNet {
        SimNet::default()
    }

    /// Pre-create a device with the given attributes.
    pub fn add_device(&self, name: &str, mac: MacAddr, carrier: bool) {
        self.state.borrow_mut().devices.insert(
            name.to_string(),
            SimDevState {
                mac,
                carrier,
                vlan_vid: None,
                up: false,
                policing: None,
            },
        );
    }

    /// Mark a device as a VLAN device with the given VID.
    pub fn set_vlan_vid(&self, name: &str, vid: u16) {
        if let Some(dev) = self.state.borrow_mut().devices.get_mut(name) {
            dev.vlan_vid = Some(vid);
        }
    }

    /// Flip link beat on a device.
    pub fn set_carrier(&self, name: &str, carrier: bool) {
        if let Some(dev) = self.state.borrow_mut().devices.get_mut(name) {
            dev.carrier = carrier;
        }
    }

    /// Make `open` fail for this name until it is added explicitly.
    pub fn deny(&self, name: &str) {
        self.state.borrow_mut().denied.insert(name.to_string(), ());
    }

    pub fn is_up(&self, name: &str) -> Option<bool> {
        self.state.borrow().devices.get(name).map(|d| d.up)
    }

    pub fn policing(&self, name: &str) -> Option<(u32, u32)> {
        self.state
            .borrow()
            .devices
            .get(name)
            .and_then(|d| d.policing)
    }

    pub fn mac(&self, name: &str) -> Option<MacAddr> {
        self.state.borrow().devices.get(name).map(|d| d.mac)
    }
}

impl NetdevProvider for SimNet {
    fn open(
        &self,
        name: &str,
        _internal: bool,
        _options: &BTreeMap<String, String>,
    ) -> VbrdResult<Box<dyn Netdev>> {
        let mut state = self.state.borrow_mut();
        if state.denied.contains_key(name) {
            return Err(VbrdError::Missing(format!("no such device {name}")));
        }
        state
            .devices
            .entry(name.to_string())
            .or_insert_with(|| SimDevState {
                mac: default_mac(name),
                carrier: true,
                vlan_vid: None,
                up: false,
                policing: None,
            });
        Ok(Box::new(SimNetdev {
            name: name.to_string(),
            state: self.state.clone(),
        }))
    }
}

pub struct SimNetdev {
    name: String,
    state: Rc<RefCell<SimNetState>>,
}

impl SimNetdev {
    fn dev<T>(&self, f: impl FnOnce(&SimDevState) -> T) -> Option<T> {
        self.state.borrow().devices.get(&self.name).map(f)
    }

    fn dev_mut<T>(
        &mut self,
        f: impl FnOnce(&mut SimDevState) -> T,
    ) -> VbrdResult<T> {
        self.state
            .borrow_mut()
            .devices
            .get_mut(&self.name)
            .map(f)
            .ok_or_else(|| {
                VbrdError::Missing(format!("device {} is gone", self.name))
            })
    }
}

impl Netdev for SimNetdev {
    fn name(&self) -> &str {
        &self.name
    }

    fn carrier(&self) -> bool {
        self.dev(|d| d.carrier).unwrap_or(false)
    }

    fn etheraddr(&self) -> VbrdResult<MacAddr> {
        self.dev(|d| d.mac).ok_or_else(|| {
            VbrdError::Missing(format!("device {} is gone", self.name))
        })
    }

    fn set_etheraddr(&mut self, mac: MacAddr) -> VbrdResult<()> {
        self.dev_mut(|d| d.mac = mac)
    }

    fn vlan_vid(&self) -> Option<u16> {
        self.dev(|d| d.vlan_vid).flatten()
    }

    fn set_policing(&mut self, rate: u32, burst: u32) -> VbrdResult<()> {
        self.dev_mut(|d| {
            d.policing = if rate == 0 { None } else { Some((rate, burst)) }
        })
    }

    fn set_up(&mut self, up: bool) -> VbrdResult<()> {
        self.dev_mut(|d| d.up = up)
    }

    fn reconfigure(
        &mut self,
        _options: &BTreeMap<String, String>,
    ) -> VbrdResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates() {
        let net = SimNet::new();
        let dev = net.open("eth0", false, &BTreeMap::new()).unwrap();
        assert!(dev.carrier());
        assert!(!dev.etheraddr().unwrap().is_multicast());
        assert!(!dev.etheraddr().unwrap().is_zero());
    }

    #[test]
    fn test_default_macs_stable_and_distinct() {
        assert_eq!(default_mac("eth0"), default_mac("eth0"));
        assert_ne!(default_mac("eth0"), default_mac("eth1"));
    }

    #[test]
    fn test_denied() {
        let net = SimNet::new();
        net.deny("missing0");
        assert!(net.open("missing0", false, &BTreeMap::new()).is_err());
    }

    #[test]
    fn test_carrier_visible_through_handle() {
        let net = SimNet::new();
        let dev = net.open("eth0", false, &BTreeMap::new()).unwrap();
        net.set_carrier("eth0", false);
        assert!(!dev.carrier());
    }
}
