// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The per-bridge data model and lifecycle.

use std::collections::BTreeMap;

use sha1::Digest;
use sha1::Sha1;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;

use common::network::parse_dpid;
use common::network::MacAddr;

use crate::config::BridgeConfig;
use crate::datapath::Datapath;
use crate::datapath::LOCAL_PORT;
use crate::mac_table::MacTable;
use crate::mirror::Mirror;
use crate::mirror::MAX_MIRRORS;
use crate::netdev::NetdevProvider;
use crate::ofproto::FlowEngine;
use crate::port::Port;
use crate::ratelimit::RateLimiter;
use crate::types::VbrdError;
use crate::types::VbrdResult;
use crate::Vswitch;

/// Minimum interval between rebalances of a bridge's bonded ports.
pub const BOND_REBALANCE_INTERVAL_MS: i64 = 10_000;

/// Rate limiters for the bridge's per-packet and per-sweep log messages.
pub struct BridgeRateLimits {
    pub vlan_drop: RateLimiter,
    pub unknown_iface: RateLimiter,
    pub carrier: RateLimiter,
    pub election: RateLimiter,
    pub learning: RateLimiter,
    pub misc: RateLimiter,
}

impl Default for BridgeRateLimits {
    fn default() -> Self {
        BridgeRateLimits {
            vlan_drop: RateLimiter::new(1, 5),
            unknown_iface: RateLimiter::new(1, 5),
            carrier: RateLimiter::new(5, 20),
            election: RateLimiter::new(5, 20),
            // Useful when debugging, so comparatively generous.
            learning: RateLimiter::new(30, 300),
            misc: RateLimiter::new(1, 5),
        }
    }
}

/// One named L2 switch instance.
pub struct Bridge {
    pub name: String,
    /// The MAC learning table.
    pub ml: MacTable,
    /// Fallback bridge MAC when no interface supplies a better one.
    pub default_ea: MacAddr,
    /// Current controller target, to detect standalone transitions.
    pub controller: Option<String>,

    /// The OpenFlow engine owning this bridge's flow cache.
    pub engine: Box<dyn FlowEngine>,
    /// The kernel fast path.
    pub datapath: Box<dyn Datapath>,

    pub ports: Vec<Port>,
    /// Reverse index: datapath port number → (port_idx, iface_idx).
    /// Maintained in lock step with iface lifecycle.
    pub iface_by_dp: BTreeMap<u16, (usize, usize)>,

    pub mirrors: [Option<Mirror>; MAX_MIRRORS],

    pub has_bonded_ports: bool,
    pub bond_next_rebalance: i64,

    /// When set, the next run() forces every cached flow to revalidate.
    pub flush: bool,

    pub tags: crate::tag::TagAllocator,
    pub rl: BridgeRateLimits,
    pub log: slog::Logger,
}

impl Bridge {
    /// Force revalidation of all of this bridge's flows.  Appropriate
    /// whenever its configuration changes.
    pub fn flush(&mut self) {
        self.flush = true;
        self.ml.flush();
    }

    /// The iface on the datapath's local port, if any.
    pub fn local_iface(&self) -> Option<(usize, usize)> {
        self.iface_by_dp.get(&LOCAL_PORT).copied()
    }

    pub fn port_lookup(&self, name: &str) -> Option<usize> {
        self.ports.iter().position(|p| p.name == name)
    }

    pub fn iface_lookup(&self, name: &str) -> Option<(usize, usize)> {
        for (pi, port) in self.ports.iter().enumerate() {
            if let Some(ii) = port.lookup_iface(name) {
                return Some((pi, ii));
            }
        }
        None
    }

    pub fn iface_from_dp_ifidx(&self, dp_ifidx: u16) -> Option<(usize, usize)> {
        self.iface_by_dp.get(&dp_ifidx).copied()
    }

    pub fn port_from_dp_ifidx(&self, dp_ifidx: u16) -> Option<usize> {
        self.iface_by_dp.get(&dp_ifidx).map(|(pi, _)| *pi)
    }

    /// Whether `name` refers to a device simulated entirely within the
    /// datapath: the local port, an iface declared `type = "internal"`, or a
    /// bond's fake device.
    pub fn iface_is_internal(&self, name: &str) -> bool {
        if name == self.name {
            return true;
        }
        if let Some((pi, ii)) = self.iface_lookup(name) {
            if self.ports[pi].ifaces[ii].internal {
                return true;
            }
        }
        if let Some(pi) = self.port_lookup(name) {
            let port = &self.ports[pi];
            if port.is_bond() && port.bond_fake_iface {
                return true;
            }
        }
        false
    }

    /// Advance the engine, MAC aging, and bond timers by one sweep.
    pub fn run(
        &mut self,
        now: i64,
        compat: &mut dyn crate::compat::ProcCompat,
        netdevs: &dyn NetdevProvider,
    ) -> VbrdResult<()> {
        if !self.datapath.is_alive() {
            return Err(VbrdError::Datapath(
                crate::datapath::DatapathError::Destroyed,
            ));
        }

        {
            let engine = &mut self.engine;
            self.ml.run(now, &mut |tag| engine.revalidate(tag));
        }

        // Feed current carrier state into the bond debouncers.  The engine
        // also reports link transitions through the port-changed hook, but
        // that path is absent when running without one, so devices are
        // polled each sweep; a no-change update is free.
        let mut transitions = Vec::new();
        for (port_idx, port) in self.ports.iter().enumerate() {
            if !port.is_bond() {
                continue;
            }
            for (iface_idx, iface) in port.ifaces.iter().enumerate() {
                if let Some(netdev) = iface.netdev.as_ref() {
                    transitions.push((port_idx, iface_idx, netdev.carrier()));
                }
            }
        }
        for (port_idx, iface_idx, carrier) in transitions {
            self.bond_link_status_update(port_idx, iface_idx, carrier, now);
        }

        self.bond_run(now, compat, netdevs);
        self.account_checkpoint(now);

        let flush = std::mem::take(&mut self.flush);
        self.engine.run(flush)
    }

    /// Earliest deadline this bridge needs to be run again for.
    pub fn wait(&self) -> Option<i64> {
        let mut deadline = self.ml.next_expiration();
        if self.has_bonded_ports {
            deadline = Some(match deadline {
                Some(d) => d.min(self.bond_next_rebalance),
                None => self.bond_next_rebalance,
            });
        }
        for port in &self.ports {
            if !port.is_bond() {
                continue;
            }
            for iface in &port.ifaces {
                if iface.delay_expires != i64::MAX {
                    deadline = Some(match deadline {
                        Some(d) => d.min(iface.delay_expires),
                        None => iface.delay_expires,
                    });
                }
            }
        }
        deadline
    }

    /// Choose this bridge's MAC address (and the iface it came from, if any)
    /// per the election rules: an explicit `other_config.hwaddr` wins;
    /// otherwise the numerically smallest plausible MAC across the ports;
    /// otherwise the bridge's random default.
    pub fn pick_local_hw_addr(
        &mut self,
        cfg: &BridgeConfig,
        now: i64,
    ) -> (MacAddr, Option<(usize, usize)>) {
        if let Some(requested) = cfg.other_config.get("hwaddr") {
            match requested.parse::<MacAddr>() {
                Ok(ea) if ea.is_multicast() => {
                    warn!(
                        self.log,
                        "cannot set MAC address to multicast address {ea}"
                    );
                }
                Ok(ea) if ea.is_zero() => {
                    warn!(self.log, "cannot set MAC address to zero");
                }
                Ok(ea) => return (ea, None),
                Err(e) => {
                    warn!(self.log, "invalid hwaddr \"{requested}\": {e}");
                }
            }
        }

        // Choose the minimum plausible MAC address among the interfaces.
        let mut best: Option<(MacAddr, Option<(usize, usize)>)> = None;
        for (pi, port) in self.ports.iter().enumerate() {
            // Mirror output ports don't participate.
            if port.is_mirror_output_port {
                continue;
            }

            let pinned = cfg
                .ports
                .iter()
                .find(|pc| pc.name == port.name)
                .and_then(|pc| pc.mac.as_deref())
                .and_then(|mac| mac.parse::<MacAddr>().ok());

            let (iface_ea, from) = match pinned {
                Some(ea) => {
                    // Resolve which iface actually carries the pinned
                    // address, if any, so the caller knows its devname.
                    let from = port.ifaces.iter().enumerate().find_map(
                        |(ii, iface)| {
                            let dev_ea = iface
                                .netdev
                                .as_ref()
                                .and_then(|nd| nd.etheraddr().ok());
                            (dev_ea == Some(ea)).then_some((pi, ii))
                        },
                    );
                    (ea, from)
                }
                None => {
                    // The interface first in ASCII order represents the
                    // port, matching how the kernel bonding driver picks a
                    // bond's address.
                    let Some(ii) = port
                        .ifaces
                        .iter()
                        .enumerate()
                        .min_by(|(_, a), (_, b)| a.name.cmp(&b.name))
                        .map(|(ii, _)| ii)
                    else {
                        continue;
                    };
                    let iface = &port.ifaces[ii];
                    // The local port doesn't count; we're choosing its
                    // address right now.
                    if iface.dp_ifidx == LOCAL_PORT as i32 {
                        continue;
                    }
                    match iface.netdev.as_ref().map(|nd| nd.etheraddr()) {
                        Some(Ok(ea)) => (ea, Some((pi, ii))),
                        _ => {
                            if self.rl.misc.admit(now) {
                                warn!(
                                    self.log,
                                    "failed to obtain Ethernet address of {}",
                                    iface.name
                                );
                            }
                            continue;
                        }
                    }
                }
            };

            if iface_ea.is_multicast()
                || iface_ea.is_local_admin()
                || iface_ea.is_reserved()
                || iface_ea.is_zero()
            {
                continue;
            }
            if best.map(|(ea, _)| iface_ea < ea).unwrap_or(true) {
                best = Some((iface_ea, from));
            }
        }

        match best {
            Some((ea, from)) => {
                debug!(self.log, "using bridge Ethernet address {ea}");
                (ea, from)
            }
            None => {
                warn!(
                    self.log,
                    "using default bridge Ethernet address {}", self.default_ea
                );
                (self.default_ea, None)
            }
        }
    }

    /// Choose the datapath ID given the elected bridge MAC.
    ///
    /// `hw_addr_iface` is the iface the address came from, or None if it was
    /// derived some other way.  IDs must be unique per bridge and should be
    /// stable across restarts.
    pub fn pick_datapath_id(
        &self,
        cfg: &BridgeConfig,
        bridge_ea: MacAddr,
        hw_addr_iface: Option<(usize, usize)>,
        host_uuid: Option<&str>,
    ) -> u64 {
        if let Some(pinned) = cfg.other_config.get("datapath-id") {
            match parse_dpid(pinned) {
                Some(dpid) => return dpid,
                None => {
                    warn!(self.log, "invalid datapath-id \"{pinned}\"");
                }
            }
        }

        if let Some((pi, ii)) = hw_addr_iface {
            let vid = self.ports[pi].ifaces[ii]
                .netdev
                .as_ref()
                .and_then(|nd| nd.vlan_vid());
            if let Some(vlan) = vid {
                // The bridge MAC was taken from a VLAN device, so a bridge
                // on the underlying physical device would collide with it.
                // Fold the VLAN ID into the hash to keep the IDs distinct.
                let mut buf = [0u8; 8];
                buf[..6].copy_from_slice(&bridge_ea.octets());
                buf[6..].copy_from_slice(&vlan.to_be_bytes());
                return dpid_from_hash(&buf);
            }
            // Otherwise the bridge MAC is assumed unique and used directly.
        } else if let Some(uuid) = host_uuid {
            // A purely internal bridge has no natural identifier; hashing
            // the host identity with the bridge name is stable as long as
            // the name survives.
            let combined = format!("{uuid},{}", self.name);
            return dpid_from_hash(combined.as_bytes());
        }

        bridge_ea.into()
    }
}

/// Derive a datapath ID from arbitrary bytes: SHA-1, truncated to 48 bits
/// and marked as a unicast, locally-administered address.
fn dpid_from_hash(data: &[u8]) -> u64 {
    let digest = Sha1::digest(data);
    let mut octets = [0u8; 6];
    octets.copy_from_slice(&digest[..6]);
    octets[0] &= !0x01;
    octets[0] |= 0x02;
    MacAddr::from(octets).into()
}

// Bridge lifecycle, on the owning context.
impl Vswitch {
    pub fn bridge_lookup(&self, name: &str) -> Option<usize> {
        self.bridges.iter().position(|br| br.name == name)
    }

    /// Create a bridge and its datapath.  Returns None (after logging) if
    /// the datapath cannot be created; that failure cancels the bridge.
    pub fn bridge_create(&mut self, name: &str, now: i64) -> Option<usize> {
        debug_assert!(self.bridge_lookup(name).is_none());

        let mut datapath = match self.dp_provider.create(name) {
            Ok(dp) => dp,
            Err(e) => {
                warn!(self.log, "failed to create datapath {name}: {e}");
                return None;
            }
        };
        datapath.flow_flush();

        let engine = (self.engine_factory)(name);
        let log = self.log.new(o!("bridge" => name.to_string()));
        let br = Bridge {
            name: name.to_string(),
            ml: MacTable::new(),
            default_ea: MacAddr::random(),
            controller: None,
            engine,
            datapath,
            ports: Vec::new(),
            iface_by_dp: BTreeMap::new(),
            mirrors: Default::default(),
            has_bonded_ports: false,
            bond_next_rebalance: now + BOND_REBALANCE_INTERVAL_MS,
            flush: false,
            tags: crate::tag::TagAllocator::new(),
            rl: BridgeRateLimits::default(),
            log,
        };
        info!(self.log, "created bridge {name}");
        self.bridges.push(br);
        Some(self.bridges.len() - 1)
    }

    pub fn bridge_destroy(&mut self, bridge_idx: usize, now: i64) {
        let mut br = self.bridges.remove(bridge_idx);
        while !br.ports.is_empty() {
            let last = br.ports.len() - 1;
            br.port_destroy(self.compat.as_mut(), last, now);
        }
        br.datapath.destroy();
        info!(self.log, "destroyed bridge {}", br.name);
    }

    /// One sweep over every bridge.  A bridge whose datapath was destroyed
    /// externally is torn down; the caller must then force a reconfigure.
    /// Returns whether any bridge was lost that way.
    pub fn run(&mut self, now: i64) -> bool {
        let mut lost = false;
        let mut i = 0;
        while i < self.bridges.len() {
            let br = &mut self.bridges[i];
            match br.run(now, self.compat.as_mut(), self.netdevs.as_ref()) {
                Ok(()) => i += 1,
                Err(e) => {
                    if self.bridges[i].rl.misc.admit(now) {
                        warn!(
                            self.log,
                            "bridge {}: datapath was destroyed externally, \
                             forcing reconfiguration: {e}",
                            self.bridges[i].name
                        );
                    }
                    self.bridge_destroy(i, now);
                    lost = true;
                }
            }
        }
        lost
    }

    /// Earliest deadline across all bridges.
    pub fn wait(&self) -> Option<i64> {
        self.bridges
            .iter()
            .filter_map(|br| br.wait())
            .min()
    }
}

/// Shared fixtures for the model's unit tests: a bridge wired to a recording
/// engine, a simulated datapath, and simulated devices.
#[cfg(test)]
pub(crate) mod testutil {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::config::InterfaceConfig;
    use crate::datapath::DatapathProvider;
    use crate::datapath::SimDatapathHost;
    use crate::netdev::SimNet;
    use crate::ofproto::EngineLog;
    use crate::ofproto::RecordingEngine;

    pub fn test_log() -> slog::Logger {
        common::logging::init(
            "test",
            &None,
            common::logging::LogFormat::Human,
        )
        .unwrap()
    }

    pub fn test_bridge(
        name: &str,
    ) -> (Bridge, Rc<RefCell<EngineLog>>, SimNet) {
        let host = SimDatapathHost::new();
        let datapath = host.create(name).unwrap();
        let (engine, engine_log) = RecordingEngine::new();
        let log = test_log();
        let br = Bridge {
            name: name.to_string(),
            ml: MacTable::new(),
            default_ea: MacAddr::random(),
            controller: None,
            engine: Box::new(engine),
            datapath,
            ports: Vec::new(),
            iface_by_dp: BTreeMap::new(),
            mirrors: Default::default(),
            has_bonded_ports: false,
            bond_next_rebalance: BOND_REBALANCE_INTERVAL_MS,
            flush: false,
            tags: crate::tag::TagAllocator::new(),
            rl: BridgeRateLimits::default(),
            log,
        };
        (br, engine_log, SimNet::new())
    }

    /// Create a port with the named interfaces, attach them to the
    /// datapath, and bring the bonding state up to date, mimicking what a
    /// reconfigure sweep leaves behind.
    pub fn add_port(
        br: &mut Bridge,
        net: &SimNet,
        name: &str,
        ifaces: &[&str],
    ) -> usize {
        let port_idx = br.port_create(name);
        for iface_name in ifaces {
            let cfg = InterfaceConfig {
                name: iface_name.to_string(),
                ..Default::default()
            };
            let iface_idx = br.iface_create(net, port_idx, &cfg);
            let dp_ifidx = br.datapath.port_add(iface_name, false).unwrap();
            br.ports[port_idx].ifaces[iface_idx].dp_ifidx = dp_ifidx as i32;
            br.iface_by_dp.insert(dp_ifidx, (port_idx, iface_idx));
        }
        br.port_update_bonding(port_idx, 0);
        port_idx
    }

    /// The interface's datapath port number, for asserting on emitted
    /// actions.
    pub fn dp_of(br: &Bridge, port_idx: usize, iface_idx: usize) -> u16 {
        br.ports[port_idx].ifaces[iface_idx].dp_ifidx as u16
    }

    impl Bridge {
        /// Check the structural invariants tests verify after every
        /// reconfigure and bond event.
        pub fn assert_coherent(&self) {
            // Reverse-map coherence, both directions.
            for (dp, (pi, ii)) in &self.iface_by_dp {
                let iface = &self.ports[*pi].ifaces[*ii];
                assert_eq!(iface.dp_ifidx, *dp as i32);
            }
            for (pi, port) in self.ports.iter().enumerate() {
                for (ii, iface) in port.ifaces.iter().enumerate() {
                    if iface.dp_ifidx >= 0 {
                        assert_eq!(
                            self.iface_by_dp.get(&(iface.dp_ifidx as u16)),
                            Some(&(pi, ii)),
                            "iface {} not reverse-mapped",
                            iface.name
                        );
                    }
                }

                // Bond hash indices stay in range.
                if let Some(bond) = &port.bond {
                    for entry in &bond.hash {
                        if let Some(idx) = entry.iface_idx {
                            assert!(idx < port.ifaces.len());
                        }
                    }
                }

                // An active slave is enabled; an enabled slave implies an
                // active one.
                if port.is_bond() {
                    if let Some(active) = port.active_iface {
                        assert!(port.ifaces[active].enabled);
                    }
                    if port.ifaces.iter().any(|iface| iface.enabled) {
                        assert!(port.active_iface.is_some());
                    }
                }

                // The mirror-output flag matches the mirror set.
                let is_output = self.mirrors.iter().flatten().any(|m| {
                    m.out == crate::mirror::MirrorOut::Port(pi)
                });
                assert_eq!(port.is_mirror_output_port, is_output);
            }
        }
    }
}
