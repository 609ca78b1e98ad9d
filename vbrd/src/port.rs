// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Ports and interfaces.
//!
//! A port is one L2 forwarding unit within a bridge: ordinarily it holds one
//! interface, and with two or more it is a bond.  Ports and interfaces live
//! in densely packed vectors and are referenced by index from the MAC table,
//! the bond hash buckets, and the reverse datapath map; removal is
//! swap-with-last, and every index holder is repaired in the same step.

use std::collections::BTreeMap;

use slog::debug;
use slog::info;
use slog::warn;

use common::network::MacAddr;
use common::network::VlanSet;

use crate::bridge::Bridge;
use crate::compat::ProcCompat;
use crate::config::InterfaceConfig;
use crate::datapath::LOCAL_PORT;
use crate::mirror::MirrorOut;
use crate::netdev::Netdev;
use crate::netdev::NetdevProvider;
use crate::tag::Tag;

/// Mask applied to a source-MAC hash to pick a bond bucket.
pub const BOND_MASK: u8 = 0xff;

/// Number of bond hash buckets.
pub const BOND_TABLE_SIZE: usize = BOND_MASK as usize + 1;

/// A port's VLAN configuration: an access port carries exactly one implicit
/// VLAN untagged; a trunk port carries the tagged VLANs in its set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VlanMode {
    Access(u16),
    Trunk(VlanSet),
}

impl VlanMode {
    pub fn access_vlan(&self) -> Option<u16> {
        match self {
            VlanMode::Access(vlan) => Some(*vlan),
            VlanMode::Trunk(_) => None,
        }
    }

    pub fn trunks_vlan(&self, vlan: u16) -> bool {
        match self {
            VlanMode::Access(_) => false,
            VlanMode::Trunk(set) => set.contains(vlan),
        }
    }

    pub fn includes_vlan(&self, vlan: u16) -> bool {
        match self {
            VlanMode::Access(access) => *access == vlan,
            VlanMode::Trunk(set) => set.contains(vlan),
        }
    }
}

/// One hash bucket of a bond: which slave the bucket's flows use, and how
/// many bytes they recently pushed through it.
#[derive(Debug, Default, Clone, Copy)]
pub struct BondEntry {
    pub iface_idx: Option<usize>,
    pub tx_bytes: u64,
    /// Fresh on each reassignment of the bucket.
    pub iface_tag: Option<Tag>,
}

/// Present on ports with two or more interfaces.
pub struct BondState {
    pub hash: Vec<BondEntry>,
    /// Depended on by flows dropped because no slave was usable.
    pub no_ifaces_tag: Tag,
}

pub struct Iface {
    pub name: String,
    /// Index within the kernel datapath, or -1 until resolved.
    pub dp_ifidx: i32,
    pub netdev: Option<Box<dyn Netdev>>,
    /// May this interface carry flows?
    pub enabled: bool,
    pub tag: Tag,
    /// Deadline after which `enabled` flips; `i64::MAX` when no transition
    /// is pending.
    pub delay_expires: i64,
    /// Declared `type = "internal"` in the configuration.
    pub internal: bool,
}

pub struct Port {
    pub name: String,
    pub vlan: VlanMode,
    pub ifaces: Vec<Iface>,

    pub bond: Option<BondState>,
    /// The slave that accepts multicast/broadcast ingress, while enabled.
    pub active_iface: Option<usize>,
    pub active_iface_tag: Tag,
    pub updelay: i64,
    pub downdelay: i64,
    pub bond_compat_is_stale: bool,
    pub bond_fake_iface: bool,

    pub src_mirrors: u32,
    pub dst_mirrors: u32,
    pub is_mirror_output_port: bool,
}

impl Port {
    pub fn is_bond(&self) -> bool {
        self.ifaces.len() >= 2
    }

    pub fn lookup_iface(&self, name: &str) -> Option<usize> {
        self.ifaces.iter().position(|iface| iface.name == name)
    }

    pub fn includes_vlan(&self, vlan: u16) -> bool {
        self.vlan.includes_vlan(vlan)
    }

    pub fn trunks_vlan(&self, vlan: u16) -> bool {
        self.vlan.trunks_vlan(vlan)
    }
}

impl Bridge {
    pub fn port_create(&mut self, name: &str) -> usize {
        let port = Port {
            name: name.to_string(),
            vlan: VlanMode::Trunk(VlanSet::full()),
            ifaces: Vec::new(),
            bond: None,
            active_iface: None,
            active_iface_tag: self.tags.fresh(),
            updelay: 0,
            downdelay: 0,
            bond_compat_is_stale: false,
            bond_fake_iface: false,
            src_mirrors: 0,
            dst_mirrors: 0,
            is_mirror_output_port: false,
        };
        self.ports.push(port);
        info!(self.log, "created port {name}");
        self.flush();
        self.ports.len() - 1
    }

    /// Destroy a port, its interfaces, and any mirror that outputs to it.
    pub fn port_destroy(
        &mut self,
        compat: &mut dyn ProcCompat,
        port_idx: usize,
        now: i64,
    ) {
        let name = self.ports[port_idx].name.clone();
        compat.update_vlan(&name, None, 0);
        compat.update_bond(&name, None);

        for mi in 0..self.mirrors.len() {
            let outputs_here = self.mirrors[mi]
                .as_ref()
                .map(|m| m.out == MirrorOut::Port(port_idx))
                .unwrap_or(false);
            if outputs_here {
                self.mirror_destroy(mi);
            }
        }

        while !self.ports[port_idx].ifaces.is_empty() {
            let last = self.ports[port_idx].ifaces.len() - 1;
            self.iface_destroy(port_idx, last, now);
        }

        self.ports.swap_remove(port_idx);
        let moved_old_idx = self.ports.len();
        if port_idx < self.ports.len() {
            // The previously-last port took the removed slot; repair every
            // index that referred to it.
            for entry in self.iface_by_dp.values_mut() {
                if entry.0 == moved_old_idx {
                    entry.0 = port_idx;
                }
            }
            for mirror in self.mirrors.iter_mut().flatten() {
                if mirror.out == MirrorOut::Port(moved_old_idx) {
                    mirror.out = MirrorOut::Port(port_idx);
                }
            }
        }

        info!(self.log, "destroyed port {name}");
        self.flush();
    }

    /// Create an interface on `port_idx` and try to open its device.  A
    /// device that cannot be opened is left behind for the reconfigure
    /// sweep's pruning passes.
    pub fn iface_create(
        &mut self,
        netdevs: &dyn NetdevProvider,
        port_idx: usize,
        cfg: &InterfaceConfig,
    ) -> usize {
        let internal = cfg.iface_type == "internal";
        let mut iface = Iface {
            name: cfg.name.clone(),
            dp_ifidx: -1,
            netdev: None,
            enabled: false,
            tag: self.tags.fresh(),
            delay_expires: i64::MAX,
            internal,
        };

        // Internal devices only exist once the datapath has a port for
        // them; everything else can be opened (or created) right away.
        if !internal && cfg.name != self.name {
            match netdevs.open(&cfg.name, false, &cfg.options) {
                Ok(netdev) => {
                    iface.enabled = netdev.carrier();
                    iface.netdev = Some(netdev);
                }
                Err(e) => {
                    warn!(self.log, "could not create iface {}: {e}", cfg.name);
                }
            }
        }

        let port = &mut self.ports[port_idx];
        debug!(
            self.log,
            "attached network device {} to port {}", cfg.name, port.name
        );
        port.ifaces.push(iface);
        let iface_idx = port.ifaces.len() - 1;
        if port.is_bond() {
            self.has_bonded_ports = true;
        }
        self.flush();
        iface_idx
    }

    /// Destroy one interface, repairing the reverse map, the bond hash
    /// buckets, and the active-slave link in the same step.
    pub fn iface_destroy(
        &mut self,
        port_idx: usize,
        iface_idx: usize,
        now: i64,
    ) {
        let port = &mut self.ports[port_idx];
        let iface = &port.ifaces[iface_idx];
        if iface.dp_ifidx >= 0 {
            self.iface_by_dp.remove(&(iface.dp_ifidx as u16));
        }
        let del_active = port.active_iface == Some(iface_idx);

        port.ifaces.swap_remove(iface_idx);
        let moved_old_idx = port.ifaces.len();
        let moved = iface_idx < port.ifaces.len();

        // Buckets assigned to the removed slave lose their assignment; any
        // flows pinned to them must revalidate.
        let mut stale_tags = Vec::new();
        if let Some(bond) = port.bond.as_mut() {
            for entry in bond.hash.iter_mut() {
                match entry.iface_idx {
                    Some(idx) if idx == iface_idx => {
                        if let Some(tag) = entry.iface_tag.take() {
                            stale_tags.push(tag);
                        }
                        entry.iface_idx = None;
                    }
                    Some(idx) if moved && idx == moved_old_idx => {
                        entry.iface_idx = Some(iface_idx);
                    }
                    _ => {}
                }
            }
        }
        if moved {
            if port.active_iface == Some(moved_old_idx) {
                port.active_iface = Some(iface_idx);
            }
            let moved_iface = &port.ifaces[iface_idx];
            if moved_iface.dp_ifidx >= 0 {
                self.iface_by_dp.insert(
                    moved_iface.dp_ifidx as u16,
                    (port_idx, iface_idx),
                );
            }
        }
        for tag in stale_tags {
            self.engine.revalidate(tag);
        }

        if del_active {
            let tag = self.ports[port_idx].active_iface_tag;
            self.engine.revalidate(tag);
            self.ports[port_idx].active_iface = None;
            self.bond_choose_active_iface(port_idx, now);
            self.bond_send_learning_packets(port_idx, now);
        }

        self.flush();
    }

    /// Bring a port's bonding state in line with its interface count:
    /// allocate the hash table and elect an active slave when it becomes a
    /// bond, drop them when it stops being one.
    pub fn port_update_bonding(&mut self, port_idx: usize, now: i64) {
        let is_bond = self.ports[port_idx].is_bond();
        if !is_bond {
            let port = &mut self.ports[port_idx];
            if port.bond.is_some() {
                port.bond = None;
                port.bond_compat_is_stale = true;
                port.bond_fake_iface = false;
            }
        } else {
            if self.ports[port_idx].bond.is_none() {
                let no_ifaces_tag = self.tags.fresh();
                self.ports[port_idx].bond = Some(BondState {
                    hash: vec![BondEntry::default(); BOND_TABLE_SIZE],
                    no_ifaces_tag,
                });
                self.bond_choose_active_iface(port_idx, now);
            }
            self.ports[port_idx].bond_compat_is_stale = true;
        }
    }

    /// All devices this bridge wants attached to its datapath: every iface,
    /// plus the fake device of any bond configured with one.  The bool marks
    /// entries backed by a real iface.
    pub fn desired_ifaces(&self) -> BTreeMap<String, Option<(usize, usize)>> {
        let mut want = BTreeMap::new();
        for (pi, port) in self.ports.iter().enumerate() {
            for (ii, iface) in port.ifaces.iter().enumerate() {
                want.entry(iface.name.clone()).or_insert(Some((pi, ii)));
            }
            if port.is_bond() && port.bond_fake_iface {
                want.entry(port.name.clone()).or_insert(None);
            }
        }
        want
    }

    /// Publish the access port's VLAN-device association: the trunk port
    /// that would carry its VLAN upstream, alphabetically first among the
    /// candidates with a plausible MAC.
    pub fn port_update_vlan_compat(
        &mut self,
        compat: &mut dyn ProcCompat,
        port_idx: usize,
    ) {
        let port = &self.ports[port_idx];
        let vlan = port.vlan.access_vlan().unwrap_or(0);

        let mut vlandev: Option<&str> = None;
        if vlan > 0 {
            for candidate in &self.ports {
                if !candidate.trunks_vlan(vlan) || candidate.ifaces.is_empty()
                {
                    continue;
                }
                if let Some(best) = vlandev {
                    if candidate.name.as_str() >= best {
                        continue;
                    }
                }
                let ea = candidate.ifaces[0]
                    .netdev
                    .as_ref()
                    .and_then(|netdev| netdev.etheraddr().ok());
                if let Some(ea) = ea {
                    if !ea.is_multicast() && !ea.is_reserved() && !ea.is_zero()
                    {
                        vlandev = Some(candidate.name.as_str());
                    }
                }
            }
        }

        let name = port.name.clone();
        let vlandev = vlandev.map(|dev| dev.to_string());
        compat.update_vlan(&name, vlandev.as_deref(), vlan);
    }

    /// Set an interface's MAC from its configuration.  Never applied to the
    /// local port, whose address is the bridge's own.
    pub fn iface_set_mac(
        &mut self,
        port_idx: usize,
        iface_idx: usize,
        cfg: &InterfaceConfig,
    ) {
        let Some(requested) = cfg.mac.as_deref() else {
            return;
        };
        let iface = &mut self.ports[port_idx].ifaces[iface_idx];
        match requested.parse::<MacAddr>() {
            Ok(ea) if ea.is_multicast() => {
                warn!(
                    self.log,
                    "interface {}: cannot set MAC to multicast address",
                    iface.name
                );
            }
            Ok(_) if iface.dp_ifidx == LOCAL_PORT as i32 => {
                warn!(
                    self.log,
                    "ignoring mac on local interface {}; set the bridge \
                     hwaddr instead",
                    iface.name
                );
            }
            Ok(ea) => {
                if let Some(netdev) = iface.netdev.as_mut() {
                    if let Err(e) = netdev.set_etheraddr(ea) {
                        warn!(
                            self.log,
                            "interface {}: setting MAC failed: {e}", iface.name
                        );
                    }
                }
            }
            Err(e) => {
                warn!(
                    self.log,
                    "interface {}: invalid mac \"{requested}\": {e}",
                    iface.name
                );
            }
        }
    }
}
