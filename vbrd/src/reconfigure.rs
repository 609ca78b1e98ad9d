// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The reconfigure engine: diff a configuration snapshot against running
//! state and apply the difference.
//!
//! Individual failures are logged and skipped; the sweep always finishes,
//! and applying the same snapshot twice leaves the same state behind.  The
//! only fatal error is failing to create a new bridge's datapath, which
//! cancels that bridge alone.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use slog::debug;
use slog::warn;

use common::network::format_dpid;
use common::network::VlanSet;
use common::network::VLAN_MAX;

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::config::ConfigTxn;
use crate::config::InterfaceConfig;
use crate::config::PortConfig;
use crate::config::SystemConfig;
use crate::datapath::DatapathError;
use crate::datapath::LOCAL_PORT;
use crate::netdev::NetdevProvider;
use crate::ofproto::ControllerSettings;
use crate::ofproto::NetflowOptions;
use crate::port::VlanMode;
use crate::Vswitch;

/// The OpenFlow port number persisted for a datapath port.
fn ofp_port_from_dp(dp_ifidx: u16) -> i64 {
    // The local port has a reserved number in OpenFlow.
    if dp_ifidx == LOCAL_PORT {
        0xfffe
    } else {
        dp_ifidx as i64
    }
}

/// A bridge's interface configurations by name; first occurrence wins.
fn iface_cfgs(br_cfg: &BridgeConfig) -> BTreeMap<&str, &InterfaceConfig> {
    let mut cfgs = BTreeMap::new();
    for port_cfg in &br_cfg.ports {
        for if_cfg in &port_cfg.interfaces {
            cfgs.entry(if_cfg.name.as_str()).or_insert(if_cfg);
        }
    }
    cfgs
}

impl Vswitch {
    /// Reconcile the whole system with `cfg`.
    pub fn reconfigure(&mut self, cfg: &SystemConfig, now: i64) {
        debug!(self.log, "reconfiguring");
        let mut txn = ConfigTxn::default();

        // Collect the configured bridges by name; the first wins.
        let mut new_br: BTreeMap<&str, &BridgeConfig> = BTreeMap::new();
        for br_cfg in &cfg.bridges {
            if new_br.contains_key(br_cfg.name.as_str()) {
                warn!(self.log, "more than one bridge named {}", br_cfg.name);
            } else {
                new_br.insert(br_cfg.name.as_str(), br_cfg);
            }
        }

        // Get rid of deleted bridges and add new bridges.
        let mut idx = 0;
        while idx < self.bridges.len() {
            if new_br.contains_key(self.bridges[idx].name.as_str()) {
                idx += 1;
            } else {
                self.bridge_destroy(idx, now);
            }
        }
        for &name in new_br.keys() {
            if self.bridge_lookup(name).is_none() {
                self.bridge_create(name, now);
            }
        }

        // Reconfigure the model of every bridge.
        for idx in 0..self.bridges.len() {
            let name = self.bridges[idx].name.clone();
            let br_cfg: &BridgeConfig = new_br[name.as_str()];
            self.bridge_reconfigure_one(idx, cfg, br_cfg, now);
        }

        // Add and delete ports on all datapaths.  A device can only be
        // attached to one datapath at a time, so every deletion must happen
        // before any addition.
        for br in self.bridges.iter_mut() {
            let want = br.desired_ifaces();
            for dp_port in br.datapath.port_list() {
                if dp_port.devname != br.name
                    && !want.contains_key(&dp_port.devname)
                {
                    if let Err(e) = br.datapath.port_del(dp_port.port_no) {
                        warn!(
                            br.log,
                            "failed to remove {} interface: {e}",
                            dp_port.devname
                        );
                    }
                }
            }
        }
        for idx in 0..self.bridges.len() {
            let name = self.bridges[idx].name.clone();
            let br_cfg: &BridgeConfig = new_br[name.as_str()];
            self.reconcile_datapath_additions(idx, br_cfg);
        }

        // Resolve datapath port numbers, prune unusable interfaces, pick
        // addresses, and push per-bridge settings to the engine.
        for idx in 0..self.bridges.len() {
            let name = self.bridges[idx].name.clone();
            let br_cfg: &BridgeConfig = new_br[name.as_str()];

            self.bridges[idx].fetch_dp_ifaces(&mut txn);
            self.prune_ifaces(idx, br_cfg, now);

            let (ea, hw_addr_iface) =
                self.bridges[idx].pick_local_hw_addr(br_cfg, now);
            if let Some((pi, ii)) = self.bridges[idx].local_iface() {
                let br = &mut self.bridges[idx];
                if let Some(netdev) = br.ports[pi].ifaces[ii].netdev.as_mut()
                {
                    if let Err(e) = netdev.set_etheraddr(ea) {
                        if br.rl.misc.admit(now) {
                            warn!(
                                br.log,
                                "failed to set bridge Ethernet address: {e}"
                            );
                        }
                    }
                }
            }

            let dpid = self.bridges[idx].pick_datapath_id(
                br_cfg,
                ea,
                hw_addr_iface,
                self.host_uuid.as_deref(),
            );
            self.bridges[idx].engine.set_datapath_id(dpid);
            txn.datapath_ids.insert(name.clone(), format_dpid(dpid));

            self.bridges[idx].configure_netflow(br_cfg);
            // The controller is configured only now that the datapath ID is
            // known: resetting the ID disconnects an attached controller.
            self.bridges[idx].reconfigure_controller(cfg, br_cfg);
            self.bridges[idx].engine.set_ssl(br_cfg.ssl.as_ref());

            let listeners =
                vec![format!("punix:{}/{name}.mgmt", self.rundir)];
            self.bridges[idx].engine.set_listeners(&listeners);
            let snoops = vec![format!("punix:{}/{name}.snoop", self.rundir)];
            self.bridges[idx].engine.set_snoops(&snoops);
        }

        // Per port: legacy VLAN shim and bonding state.
        for idx in 0..self.bridges.len() {
            for port_idx in 0..self.bridges[idx].ports.len() {
                self.bridges[idx]
                    .port_update_vlan_compat(self.compat.as_mut(), port_idx);
                self.bridges[idx].port_update_bonding(port_idx, now);
            }
        }

        // Per iface: policing and statically configured MACs.
        for idx in 0..self.bridges.len() {
            let name = self.bridges[idx].name.clone();
            let br_cfg: &BridgeConfig = new_br[name.as_str()];
            self.apply_iface_properties(idx, br_cfg);
        }

        if let Err(e) = self.config_sink.commit(&txn) {
            warn!(self.log, "failed to commit configuration updates: {e}");
        }
    }

    /// Port and interface diff for one bridge, then its mirrors.
    fn bridge_reconfigure_one(
        &mut self,
        bridge_idx: usize,
        _cfg: &SystemConfig,
        br_cfg: &BridgeConfig,
        now: i64,
    ) {
        // Collect the configured ports; the first of a duplicated name
        // wins.
        let mut new_ports: BTreeMap<&str, &PortConfig> = BTreeMap::new();
        for port_cfg in &br_cfg.ports {
            if new_ports.contains_key(port_cfg.name.as_str()) {
                warn!(
                    self.bridges[bridge_idx].log,
                    "{} specified twice as bridge port", port_cfg.name
                );
            } else {
                new_ports.insert(port_cfg.name.as_str(), port_cfg);
            }
        }

        // Get rid of deleted ports and add new ports.
        let old_names: Vec<String> = self.bridges[bridge_idx]
            .ports
            .iter()
            .map(|port| port.name.clone())
            .collect();
        for name in old_names {
            if !new_ports.contains_key(name.as_str()) {
                let br = &mut self.bridges[bridge_idx];
                if let Some(port_idx) = br.port_lookup(&name) {
                    br.port_destroy(self.compat.as_mut(), port_idx, now);
                }
            }
        }
        for (&name, &port_cfg) in &new_ports {
            let br = &mut self.bridges[bridge_idx];
            let port_idx = br
                .port_lookup(name)
                .unwrap_or_else(|| br.port_create(name));
            br.port_reconfigure(
                self.netdevs.as_ref(),
                port_idx,
                port_cfg,
                now,
            );
        }

        // An interface name may appear on only one port; later claims are
        // dropped, and a port left empty goes with them.
        let mut seen: BTreeSet<String> = BTreeSet::new();
        let mut port_idx = 0;
        while port_idx < self.bridges[bridge_idx].ports.len() {
            let mut iface_idx = 0;
            while iface_idx
                < self.bridges[bridge_idx].ports[port_idx].ifaces.len()
            {
                let br = &mut self.bridges[bridge_idx];
                let name =
                    br.ports[port_idx].ifaces[iface_idx].name.clone();
                if seen.insert(name.clone()) {
                    iface_idx += 1;
                } else {
                    warn!(
                        br.log,
                        "{name} interface is on multiple ports, removing \
                         from {}",
                        br.ports[port_idx].name
                    );
                    br.iface_destroy(port_idx, iface_idx, now);
                }
            }
            let br = &mut self.bridges[bridge_idx];
            if br.ports[port_idx].ifaces.is_empty() {
                warn!(
                    br.log,
                    "{} port has no interfaces, dropping",
                    br.ports[port_idx].name
                );
                br.port_destroy(self.compat.as_mut(), port_idx, now);
            } else {
                port_idx += 1;
            }
        }

        self.bridges[bridge_idx].mirror_reconfigure(br_cfg);
    }

    /// Second half of the datapath reconciliation: attach missing devices
    /// and push options to the ones already attached.
    fn reconcile_datapath_additions(
        &mut self,
        bridge_idx: usize,
        br_cfg: &BridgeConfig,
    ) {
        let cfgs = iface_cfgs(br_cfg);
        let br = &mut self.bridges[bridge_idx];
        let current: BTreeSet<String> = br
            .datapath
            .port_list()
            .into_iter()
            .map(|dp_port| dp_port.devname)
            .collect();

        for (devname, backing) in br.desired_ifaces() {
            if current.contains(&devname) {
                // Already attached; apply any changed device options.
                if let Some((pi, ii)) = backing {
                    if let Some(if_cfg) = cfgs.get(devname.as_str()) {
                        if let Some(netdev) =
                            br.ports[pi].ifaces[ii].netdev.as_mut()
                        {
                            if let Err(e) =
                                netdev.reconfigure(&if_cfg.options)
                            {
                                warn!(
                                    br.log,
                                    "could not reconfigure {devname}: {e}"
                                );
                            }
                        }
                    }
                }
                continue;
            }

            let internal = br.iface_is_internal(&devname)
                || cfgs
                    .get(devname.as_str())
                    .map(|if_cfg| if_cfg.iface_type == "internal")
                    .unwrap_or(false);
            match br.datapath.port_add(&devname, internal) {
                Ok(_) => {}
                Err(DatapathError::PortSpaceExhausted) => {
                    warn!(br.log, "ran out of valid port numbers");
                    break;
                }
                Err(e) => {
                    warn!(br.log, "failed to add {devname} interface: {e}");
                }
            }
        }
    }

    /// Drop interfaces that never got a device handle, then those the
    /// datapath doesn't know, then any port left with no interfaces.
    fn prune_ifaces(
        &mut self,
        bridge_idx: usize,
        br_cfg: &BridgeConfig,
        now: i64,
    ) {
        let cfgs = iface_cfgs(br_cfg);

        // Pass 1: every interface needs an open device.
        let mut port_idx = 0;
        while port_idx < self.bridges[bridge_idx].ports.len() {
            let mut iface_idx = 0;
            while iface_idx
                < self.bridges[bridge_idx].ports[port_idx].ifaces.len()
            {
                let br = &mut self.bridges[bridge_idx];
                let iface = &br.ports[port_idx].ifaces[iface_idx];
                if iface.netdev.is_some() {
                    iface_idx += 1;
                    continue;
                }
                let name = iface.name.clone();
                let internal = iface.internal || name == br.name;
                let options = cfgs
                    .get(name.as_str())
                    .map(|if_cfg| if_cfg.options.clone())
                    .unwrap_or_default();
                match self.netdevs.open(&name, internal, &options) {
                    Ok(netdev) => {
                        let br = &mut self.bridges[bridge_idx];
                        let iface =
                            &mut br.ports[port_idx].ifaces[iface_idx];
                        iface.enabled = netdev.carrier();
                        iface.netdev = Some(netdev);
                        iface_idx += 1;
                    }
                    Err(e) => {
                        let br = &mut self.bridges[bridge_idx];
                        warn!(
                            br.log,
                            "could not open netdev on {name}, dropping: {e}"
                        );
                        br.iface_destroy(port_idx, iface_idx, now);
                    }
                }
            }
            port_idx = self.prune_port_if_empty(bridge_idx, port_idx, now);
        }

        // Pass 2: and a datapath port number.
        let mut port_idx = 0;
        while port_idx < self.bridges[bridge_idx].ports.len() {
            let mut iface_idx = 0;
            while iface_idx
                < self.bridges[bridge_idx].ports[port_idx].ifaces.len()
            {
                let br = &mut self.bridges[bridge_idx];
                let iface = &br.ports[port_idx].ifaces[iface_idx];
                if iface.dp_ifidx >= 0 {
                    debug!(
                        br.log,
                        "{} has interface {} on port {}",
                        br.name,
                        iface.name,
                        iface.dp_ifidx
                    );
                    iface_idx += 1;
                } else {
                    warn!(
                        br.log,
                        "{} interface not in datapath, dropping", iface.name
                    );
                    br.iface_destroy(port_idx, iface_idx, now);
                }
            }
            port_idx = self.prune_port_if_empty(bridge_idx, port_idx, now);
        }
    }

    /// Destroy the port if its last interface was pruned; returns the index
    /// to continue iterating from.
    fn prune_port_if_empty(
        &mut self,
        bridge_idx: usize,
        port_idx: usize,
        now: i64,
    ) -> usize {
        let br = &mut self.bridges[bridge_idx];
        if br.ports[port_idx].ifaces.is_empty() {
            warn!(
                br.log,
                "{} port has no interfaces, dropping",
                br.ports[port_idx].name
            );
            br.port_destroy(self.compat.as_mut(), port_idx, now);
            port_idx
        } else {
            port_idx + 1
        }
    }

    /// Ingress policing and statically configured interface MACs.
    fn apply_iface_properties(
        &mut self,
        bridge_idx: usize,
        br_cfg: &BridgeConfig,
    ) {
        let cfgs = iface_cfgs(br_cfg);
        let br = &mut self.bridges[bridge_idx];
        for port_idx in 0..br.ports.len() {
            for iface_idx in 0..br.ports[port_idx].ifaces.len() {
                let iface = &br.ports[port_idx].ifaces[iface_idx];
                let name = iface.name.clone();
                let Some(if_cfg) = cfgs.get(name.as_str()).copied() else {
                    continue;
                };

                let iface = &mut br.ports[port_idx].ifaces[iface_idx];
                if let Some(netdev) = iface.netdev.as_mut() {
                    if let Err(e) = netdev.set_policing(
                        if_cfg.ingress_policing_rate,
                        if_cfg.ingress_policing_burst,
                    ) {
                        warn!(
                            br.log,
                            "could not set policing on {name}: {e}"
                        );
                    }
                }

                // Internal devices other than the local port may pin a MAC.
                let iface = &br.ports[port_idx].ifaces[iface_idx];
                if iface.dp_ifidx != LOCAL_PORT as i32 && iface.internal {
                    br.iface_set_mac(port_idx, iface_idx, if_cfg);
                }
            }
        }
    }
}

impl Bridge {
    /// Apply one port's configuration: bond delays, the interface list, and
    /// the VLAN mode.
    pub fn port_reconfigure(
        &mut self,
        netdevs: &dyn NetdevProvider,
        port_idx: usize,
        cfg: &PortConfig,
        now: i64,
    ) {
        {
            let port = &mut self.ports[port_idx];
            port.updelay = cfg.bond_updelay.max(0);
            port.downdelay = cfg.bond_downdelay.max(0);
            port.bond_fake_iface = cfg.bond_fake_iface;
        }

        // Collect the configured interfaces; the first of a duplicated name
        // wins.
        let mut new_ifaces: BTreeMap<&str, &InterfaceConfig> = BTreeMap::new();
        for if_cfg in &cfg.interfaces {
            if new_ifaces.contains_key(if_cfg.name.as_str()) {
                warn!(
                    self.log,
                    "port {}: {} specified twice as port interface",
                    cfg.name,
                    if_cfg.name
                );
            } else {
                new_ifaces.insert(if_cfg.name.as_str(), if_cfg);
            }
        }

        // Get rid of deleted interfaces and add new interfaces.
        let old_names: Vec<String> = self.ports[port_idx]
            .ifaces
            .iter()
            .map(|iface| iface.name.clone())
            .collect();
        for name in old_names {
            if !new_ifaces.contains_key(name.as_str()) {
                if let Some(iface_idx) =
                    self.ports[port_idx].lookup_iface(&name)
                {
                    self.iface_destroy(port_idx, iface_idx, now);
                }
            }
        }
        for (&name, &if_cfg) in &new_ifaces {
            if self.ports[port_idx].lookup_iface(name).is_none() {
                self.iface_create(netdevs, port_idx, if_cfg);
            }
        }

        // The VLAN mode: an implicit tag makes an access port, except on
        // bonds, which have not been tested with tagging and stay trunks.
        let mut access_vlan = None;
        if let Some(tag) = cfg.tag {
            if self.ports[port_idx].ifaces.len() < 2 {
                if tag <= VLAN_MAX {
                    debug!(
                        self.log,
                        "port {}: assigning VLAN tag {tag}", cfg.name
                    );
                    access_vlan = Some(tag);
                }
            } else {
                warn!(
                    self.log,
                    "port {}: VLAN tags not supported on bonded ports",
                    cfg.name
                );
            }
        }

        let mode = match access_vlan {
            Some(vlan) => {
                if !cfg.trunks.is_empty() {
                    warn!(
                        self.log,
                        "port {}: ignoring trunks in favor of implicit vlan",
                        cfg.name
                    );
                }
                VlanMode::Access(vlan)
            }
            None => {
                let mut trunks = VlanSet::new();
                let mut n_errors = 0;
                for &trunk in &cfg.trunks {
                    if trunk <= VLAN_MAX {
                        trunks.insert(trunk);
                    } else {
                        n_errors += 1;
                    }
                }
                if n_errors > 0 {
                    warn!(
                        self.log,
                        "port {}: invalid values for {n_errors} trunk VLANs",
                        cfg.name
                    );
                }
                if trunks.is_empty() {
                    if n_errors > 0 {
                        warn!(
                            self.log,
                            "port {}: no valid trunks, trunking all VLANs",
                            cfg.name
                        );
                    }
                    trunks = VlanSet::full();
                }
                VlanMode::Trunk(trunks)
            }
        };
        if self.ports[port_idx].vlan != mode {
            self.ports[port_idx].vlan = mode;
            self.flush();
        }
    }

    /// Re-check every datapath port number.  Administrators can move ports
    /// around behind our back, so the interface numbering is rebuilt from
    /// scratch; interfaces left without a number get pruned by the caller.
    pub fn fetch_dp_ifaces(&mut self, txn: &mut ConfigTxn) {
        for port in self.ports.iter_mut() {
            for iface in port.ifaces.iter_mut() {
                iface.dp_ifidx = -1;
            }
        }
        self.iface_by_dp.clear();

        for dp_port in self.datapath.port_list() {
            let Some((pi, ii)) = self.iface_lookup(&dp_port.devname) else {
                continue;
            };
            if self.ports[pi].ifaces[ii].dp_ifidx >= 0 {
                warn!(
                    self.log,
                    "datapath reported interface {} twice", dp_port.devname
                );
            } else if self.iface_by_dp.contains_key(&dp_port.port_no) {
                warn!(
                    self.log,
                    "datapath reported interface {} twice", dp_port.port_no
                );
            } else {
                self.ports[pi].ifaces[ii].dp_ifidx = dp_port.port_no as i32;
                self.iface_by_dp.insert(dp_port.port_no, (pi, ii));
            }

            let dp_ifidx = self.ports[pi].ifaces[ii].dp_ifidx;
            let ofport = if dp_ifidx >= 0 {
                ofp_port_from_dp(dp_ifidx as u16)
            } else {
                -1
            };
            txn.ofports.insert(dp_port.devname.clone(), ofport);
        }
    }

    /// Validate and push the NetFlow export settings.
    pub fn configure_netflow(&mut self, br_cfg: &BridgeConfig) {
        let options = br_cfg.netflow.as_ref().map(|nf| {
            let mut active_timeout = nf.active_timeout;
            if active_timeout == 0 {
                active_timeout = -1;
            } else if active_timeout < 0 {
                warn!(
                    self.log,
                    "active timeout interval set to negative value, using \
                     default instead"
                );
                active_timeout = -1;
            }

            let engine_id = nf.engine_id.unwrap_or(0);
            if nf.add_id_to_interface {
                if engine_id > 0x7f {
                    warn!(
                        self.log,
                        "netflow port mangling may conflict with another \
                         vswitch, choose an engine id less than 128"
                    );
                }
                if self.ports.len() > 508 {
                    warn!(
                        self.log,
                        "netflow port mangling will conflict with another \
                         port when more than 508 ports are used"
                    );
                }
            }

            NetflowOptions {
                engine_type: nf.engine_type.unwrap_or(0),
                engine_id,
                active_timeout,
                add_id_to_iface: nf.add_id_to_interface,
                collectors: nf.targets.clone(),
            }
        });

        if self.engine.set_netflow(options.as_ref()).is_err() {
            warn!(self.log, "problem setting netflow collectors");
        }
    }

    /// Resolve which controller applies to this bridge and push its
    /// settings.  Switching between standalone and controlled operation
    /// drops every installed flow.
    pub fn reconfigure_controller(
        &mut self,
        cfg: &SystemConfig,
        br_cfg: &BridgeConfig,
    ) {
        let controller = br_cfg
            .controller
            .as_ref()
            .or(cfg.controller.as_ref())
            .filter(|c| c.target != "none");

        if self.controller.is_some() != controller.is_some() {
            self.engine.flush_flows();
        }
        self.controller = controller.map(|c| c.target.clone());

        let settings = match controller {
            None => ControllerSettings::Standalone,
            Some(c) if c.target == "discover" => {
                ControllerSettings::Discover {
                    accept_regex: c.discover_accept_regex.clone(),
                }
            }
            Some(c) => ControllerSettings::Remote {
                target: c.target.clone(),
                in_band: c
                    .connection_mode
                    .as_deref()
                    .map(|mode| mode != "out-of-band")
                    .unwrap_or(true),
                probe_interval_s: c
                    .inactivity_probe
                    .map(|ms| (ms / 1000) as i32)
                    .unwrap_or(5),
                max_backoff_s: c
                    .max_backoff
                    .map(|ms| (ms / 1000) as i32)
                    .unwrap_or(8),
                rate_limit: c.controller_rate_limit.unwrap_or(0),
                burst_limit: c.controller_burst_limit.unwrap_or(0),
                fail_open: c
                    .fail_mode
                    .as_deref()
                    .map(|mode| mode == "standalone" || mode == "open")
                    .unwrap_or(true),
            },
        };
        self.engine.set_controller(&settings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControllerConfig;
    use crate::ofproto::PortChangeReason;
    use crate::testutil::test_vswitch;
    use common::network::MacAddr;
    use common::network::VLAN_NONE;

    fn snapshot(raw: &str) -> SystemConfig {
        toml::from_str(raw).unwrap()
    }

    const BASIC: &str = r#"
        [[bridges]]
        name = "br0"

        [[bridges.ports]]
        name = "eth0"
        tag = 10
        [[bridges.ports.interfaces]]
        name = "eth0"

        [[bridges.ports]]
        name = "bond0"
        bond_updelay = 200
        bond_downdelay = 100
        [[bridges.ports.interfaces]]
        name = "eth1"
        [[bridges.ports.interfaces]]
        name = "eth2"
    "#;

    /// The externally observable shape of a bridge, for idempotence checks.
    fn shape(vswitch: &crate::Vswitch) -> Vec<(String, Vec<(String, i32)>)> {
        vswitch
            .bridges
            .iter()
            .map(|br| {
                (
                    br.name.clone(),
                    br.ports
                        .iter()
                        .flat_map(|port| {
                            port.ifaces.iter().map(|iface| {
                                (iface.name.clone(), iface.dp_ifidx)
                            })
                        })
                        .collect(),
                )
            })
            .collect()
    }

    #[test]
    fn test_basic_reconfigure() {
        let (mut vswitch, engines, _net, txns) = test_vswitch();
        vswitch.reconfigure(&snapshot(BASIC), 0);

        assert_eq!(vswitch.bridges.len(), 1);
        let br = &vswitch.bridges[0];
        assert_eq!(br.ports.len(), 2);
        br.assert_coherent();

        let p_eth0 = br.port_lookup("eth0").unwrap();
        assert_eq!(br.ports[p_eth0].vlan.access_vlan(), Some(10));
        assert!(br.ports[p_eth0].ifaces[0].dp_ifidx >= 0);

        let p_bond = br.port_lookup("bond0").unwrap();
        assert!(br.ports[p_bond].is_bond());
        assert!(br.ports[p_bond].bond.is_some());
        assert!(br.ports[p_bond].active_iface.is_some());
        assert_eq!(br.ports[p_bond].updelay, 200);
        assert_eq!(br.ports[p_bond].downdelay, 100);
        assert!(br.has_bonded_ports);

        // The engine got a datapath ID, and it was persisted along with the
        // resolved OpenFlow port numbers.
        let dpid = engines.borrow()["br0"].borrow().dpid;
        assert_ne!(dpid, 0);
        let committed = txns.borrow();
        assert_eq!(committed.len(), 1);
        assert_eq!(
            committed[0].datapath_ids["br0"],
            common::network::format_dpid(dpid)
        );
        assert!(committed[0].ofports.contains_key("eth0"));
        assert!(committed[0].ofports["eth0"] >= 0);
    }

    #[test]
    fn test_idempotent() {
        let (mut vswitch, engines, _net, txns) = test_vswitch();
        let cfg = snapshot(BASIC);
        vswitch.reconfigure(&cfg, 0);
        let first = shape(&vswitch);
        let dpid = engines.borrow()["br0"].borrow().dpid;

        vswitch.reconfigure(&cfg, 1000);
        assert_eq!(shape(&vswitch), first);
        assert_eq!(engines.borrow()["br0"].borrow().dpid, dpid);
        vswitch.bridges[0].assert_coherent();

        // Both transactions recorded the same write-backs.
        let committed = txns.borrow();
        assert_eq!(committed[0], committed[1]);
    }

    #[test]
    fn test_bridge_removed() {
        let (mut vswitch, _, _net, _) = test_vswitch();
        vswitch.reconfigure(&snapshot(BASIC), 0);
        assert_eq!(vswitch.bridges.len(), 1);

        vswitch.reconfigure(&snapshot(""), 1000);
        assert!(vswitch.bridges.is_empty());
    }

    #[test]
    fn test_duplicate_iface_across_ports() {
        let (mut vswitch, _, _net, _) = test_vswitch();
        let cfg = snapshot(
            r#"
            [[bridges]]
            name = "br0"
            [[bridges.ports]]
            name = "p1"
            [[bridges.ports.interfaces]]
            name = "eth9"
            [[bridges.ports]]
            name = "p2"
            [[bridges.ports.interfaces]]
            name = "eth9"
        "#,
        );
        vswitch.reconfigure(&cfg, 0);

        // The first port keeps the interface; the duplicate-holder is left
        // empty and dropped.
        let br = &vswitch.bridges[0];
        assert_eq!(br.ports.len(), 1);
        assert_eq!(br.ports[0].name, "p1");
        br.assert_coherent();
    }

    #[test]
    fn test_unopenable_device_pruned() {
        let (mut vswitch, _, net, _) = test_vswitch();
        net.deny("ghost0");
        let cfg = snapshot(
            r#"
            [[bridges]]
            name = "br0"
            [[bridges.ports]]
            name = "p1"
            [[bridges.ports.interfaces]]
            name = "eth0"
            [[bridges.ports]]
            name = "p2"
            [[bridges.ports.interfaces]]
            name = "ghost0"
        "#,
        );
        vswitch.reconfigure(&cfg, 0);

        let br = &vswitch.bridges[0];
        assert_eq!(br.ports.len(), 1);
        assert_eq!(br.ports[0].name, "p1");
        br.assert_coherent();
    }

    #[test]
    fn test_device_moves_between_bridges() {
        let (mut vswitch, _, _net, _) = test_vswitch();
        let cfg_a = snapshot(
            r#"
            [[bridges]]
            name = "br0"
            [[bridges.ports]]
            name = "p1"
            [[bridges.ports.interfaces]]
            name = "eth0"
        "#,
        );
        vswitch.reconfigure(&cfg_a, 0);
        assert!(vswitch.bridges[0].iface_lookup("eth0").is_some());

        // The same device now belongs to a different bridge: the deletion
        // pass must free it before the addition pass claims it.
        let cfg_b = snapshot(
            r#"
            [[bridges]]
            name = "br0"
            [[bridges.ports]]
            name = "p9"
            [[bridges.ports.interfaces]]
            name = "eth9"
            [[bridges]]
            name = "br1"
            [[bridges.ports]]
            name = "p1"
            [[bridges.ports.interfaces]]
            name = "eth0"
        "#,
        );
        vswitch.reconfigure(&cfg_b, 1000);

        let br1 = &vswitch.bridges[vswitch.bridge_lookup("br1").unwrap()];
        let (pi, ii) = br1.iface_lookup("eth0").unwrap();
        assert!(br1.ports[pi].ifaces[ii].dp_ifidx >= 0);
        let br0 = &vswitch.bridges[vswitch.bridge_lookup("br0").unwrap()];
        assert!(br0.iface_lookup("eth0").is_none());
        br0.assert_coherent();
        br1.assert_coherent();
    }

    #[test]
    fn test_pinned_hwaddr_and_dpid() {
        let (mut vswitch, engines, net, _) = test_vswitch();
        let cfg = snapshot(
            r#"
            [[bridges]]
            name = "br0"
            [bridges.other_config]
            hwaddr = "00:16:3e:00:00:99"
            datapath-id = "0000aabbccddeeff"
            [[bridges.ports]]
            name = "br0"
            [[bridges.ports.interfaces]]
            name = "br0"
            type = "internal"
            [[bridges.ports]]
            name = "p1"
            [[bridges.ports.interfaces]]
            name = "eth0"
        "#,
        );
        vswitch.reconfigure(&cfg, 0);

        assert_eq!(engines.borrow()["br0"].borrow().dpid, 0xaabbccddeeff);
        // The pinned address lands on the local port's device.
        assert_eq!(
            net.mac("br0"),
            Some("00:16:3e:00:00:99".parse().unwrap())
        );
    }

    #[test]
    fn test_elected_hwaddr_is_smallest() {
        let (mut vswitch, engines, net, _) = test_vswitch();
        net.add_device("eth0", MacAddr::new(0, 2, 0, 0, 0, 1), true);
        net.add_device("eth1", MacAddr::new(0, 1, 0, 0, 0, 1), true);
        let cfg = snapshot(
            r#"
            [[bridges]]
            name = "br0"
            [[bridges.ports]]
            name = "br0"
            [[bridges.ports.interfaces]]
            name = "br0"
            type = "internal"
            [[bridges.ports]]
            name = "eth0"
            [[bridges.ports.interfaces]]
            name = "eth0"
            [[bridges.ports]]
            name = "eth1"
            [[bridges.ports.interfaces]]
            name = "eth1"
        "#,
        );
        vswitch.reconfigure(&cfg, 0);

        let elected = MacAddr::new(0, 1, 0, 0, 0, 1);
        assert_eq!(net.mac("br0"), Some(elected));
        // No VLAN device, so the datapath ID is the address itself.
        assert_eq!(engines.borrow()["br0"].borrow().dpid, u64::from(elected));
    }

    #[test]
    fn test_ssl_set_and_removed() {
        let (mut vswitch, engines, _net, _) = test_vswitch();
        let with_ssl = snapshot(
            r#"
            [[bridges]]
            name = "br0"
            [bridges.ssl]
            private_key = "/etc/vbrd/key.pem"
            certificate = "/etc/vbrd/cert.pem"
            ca_cert = "/etc/vbrd/ca.pem"
            [[bridges.ports]]
            name = "p1"
            [[bridges.ports.interfaces]]
            name = "eth0"
        "#,
        );
        vswitch.reconfigure(&with_ssl, 0);
        assert!(engines.borrow()["br0"].borrow().ssl.is_some());

        // Dropping the section tears the material down again.
        let mut without = with_ssl.clone();
        without.bridges[0].ssl = None;
        vswitch.reconfigure(&without, 1000);
        assert!(engines.borrow()["br0"].borrow().ssl.is_none());
    }

    #[test]
    fn test_controller_transitions() {
        let (mut vswitch, engines, _net, _) = test_vswitch();
        let mut cfg = snapshot(BASIC);
        vswitch.reconfigure(&cfg, 0);
        assert_eq!(
            engines.borrow()["br0"].borrow().controller,
            Some(ControllerSettings::Standalone)
        );

        cfg.bridges[0].controller = Some(ControllerConfig {
            target: "tcp:127.0.0.1:6633".to_string(),
            fail_mode: Some("secure".to_string()),
            ..Default::default()
        });
        vswitch.reconfigure(&cfg, 1000);
        {
            let logs = engines.borrow();
            let log = logs["br0"].borrow();
            // Standalone -> controlled drops installed flows.
            assert_eq!(log.flushed, 1);
            match log.controller.as_ref().unwrap() {
                ControllerSettings::Remote {
                    target,
                    in_band,
                    probe_interval_s,
                    max_backoff_s,
                    fail_open,
                    ..
                } => {
                    assert_eq!(target, "tcp:127.0.0.1:6633");
                    assert!(*in_band);
                    assert_eq!(*probe_interval_s, 5);
                    assert_eq!(*max_backoff_s, 8);
                    assert!(!*fail_open);
                }
                other => panic!("unexpected controller: {other:?}"),
            }
        }

        cfg.bridges[0].controller = None;
        vswitch.reconfigure(&cfg, 2000);
        let logs = engines.borrow();
        let log = logs["br0"].borrow();
        assert_eq!(log.flushed, 2);
        assert_eq!(log.controller, Some(ControllerSettings::Standalone));
    }

    #[test]
    fn test_trunk_configuration() {
        let (mut vswitch, _, _net, _) = test_vswitch();
        let cfg = snapshot(
            r#"
            [[bridges]]
            name = "br0"
            [[bridges.ports]]
            name = "trunked"
            trunks = [10, 20]
            [[bridges.ports.interfaces]]
            name = "eth0"
        "#,
        );
        vswitch.reconfigure(&cfg, 0);

        let br = &vswitch.bridges[0];
        let port = &br.ports[br.port_lookup("trunked").unwrap()];
        assert!(port.includes_vlan(10));
        assert!(port.includes_vlan(20));
        assert!(!port.includes_vlan(30));
    }

    #[test]
    fn test_port_changed_hooks() {
        let (mut vswitch, _, net, _) = test_vswitch();
        vswitch.reconfigure(&snapshot(BASIC), 0);

        // Link-down on a bond slave starts its downdelay.
        let br = &vswitch.bridges[0];
        let p_bond = br.port_lookup("bond0").unwrap();
        let dp = br.ports[p_bond].ifaces[0].dp_ifidx as u16;
        net.set_carrier("eth1", false);
        vswitch.port_changed(0, PortChangeReason::Modify, dp, false, 1000);
        let br = &vswitch.bridges[0];
        assert_eq!(br.ports[p_bond].ifaces[0].delay_expires, 1000 + 100);

        // Unexpected deletion of the single-iface port removes the port.
        let p_eth0 = br.port_lookup("eth0").unwrap();
        let dp = br.ports[p_eth0].ifaces[0].dp_ifidx as u16;
        vswitch.port_changed(0, PortChangeReason::Delete, dp, false, 1000);
        let br = &vswitch.bridges[0];
        assert!(br.port_lookup("eth0").is_none());
        assert!(br.flush);
        br.assert_coherent();
    }

    #[test]
    fn test_flow_after_reconfigure() {
        use crate::forward::OdpAction;
        use crate::tag::TagSet;

        let (mut vswitch, _, _net, _) = test_vswitch();
        vswitch.reconfigure(&snapshot(BASIC), 0);
        let br = &mut vswitch.bridges[0];
        let p_eth0 = br.port_lookup("eth0").unwrap();
        let in_dp = br.ports[p_eth0].ifaces[0].dp_ifidx as u16;

        let flow = crate::forward::Flow::l2(
            in_dp,
            MacAddr::new(0xaa, 0, 0, 0, 0, 1),
            MacAddr::new(0xaa, 0, 0, 0, 0, 2),
            VLAN_NONE,
        );
        let mut actions = Vec::new();
        let mut tags = TagSet::new();
        let mut nf_output = 0;
        let applicable = br.process_flow(
            &flow,
            true,
            &mut actions,
            &mut tags,
            &mut nf_output,
            0,
        );
        assert!(applicable);
        // The access port floods into the bond, tagged with VLAN 10.
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0], OdpAction::SetVlanVid(10));
        assert!(matches!(actions[1], OdpAction::Output(_)));
        assert!(!tags.is_empty());
    }
}

