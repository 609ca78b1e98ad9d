// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Port mirroring.
//!
//! A bridge carries up to 32 mirrors, addressed by bit position in the
//! per-port `src_mirrors`/`dst_mirrors` masks.  A mirror selects traffic by
//! ingress port, egress port, and/or VLAN (no selectors at all means
//! "mirror everything") and duplicates it either to an output port or onto
//! an RSPAN VLAN.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use slog::info;
use slog::warn;

use common::network::VlanSet;
use common::network::VLAN_MAX;

use crate::bridge::Bridge;
use crate::config::BridgeConfig;
use crate::config::MirrorConfig;

pub const MAX_MIRRORS: usize = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MirrorOut {
    /// Duplicate matching frames to this port.
    Port(usize),
    /// RSPAN: tag matching frames with this VLAN and flood them to every
    /// port carrying it.
    Vlan(u16),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mirror {
    pub idx: usize,
    pub name: String,

    pub src_ports: BTreeSet<String>,
    pub dst_ports: BTreeSet<String>,
    pub vlans: Vec<u16>,

    pub out: MirrorOut,
}

impl Mirror {
    /// No selectors at all: the mirror matches every port.
    pub fn mirrors_all(&self) -> bool {
        self.src_ports.is_empty()
            && self.dst_ports.is_empty()
            && self.vlans.is_empty()
    }

    pub fn selects_vlan(&self, vlan: u16) -> bool {
        self.vlans.contains(&vlan)
    }
}

impl Bridge {
    /// Tear down one mirror slot, clearing its bit from every port.
    pub fn mirror_destroy(&mut self, idx: usize) {
        if let Some(mirror) = self.mirrors[idx].take() {
            let bit = !(1u32 << idx);
            for port in self.ports.iter_mut() {
                port.src_mirrors &= bit;
                port.dst_mirrors &= bit;
            }
            info!(self.log, "destroyed mirror {}", mirror.name);
            self.flush();
        }
    }

    /// Reconcile the bridge's mirrors with the configuration: diff by name,
    /// resolve selectors, recompute the per-port masks and the
    /// mirror-output flags, and refresh the flood-VLAN set.
    pub fn mirror_reconfigure(&mut self, cfg: &BridgeConfig) {
        // Collect the new mirrors by name; the first occurrence wins.
        let mut new_mirrors: BTreeMap<&str, &MirrorConfig> = BTreeMap::new();
        for mirror_cfg in &cfg.mirrors {
            if new_mirrors.contains_key(mirror_cfg.name.as_str()) {
                warn!(
                    self.log,
                    "{} specified twice as mirror", mirror_cfg.name
                );
            } else {
                new_mirrors.insert(mirror_cfg.name.as_str(), mirror_cfg);
            }
        }

        // Get rid of deleted mirrors.
        for idx in 0..MAX_MIRRORS {
            let gone = self.mirrors[idx]
                .as_ref()
                .map(|m| !new_mirrors.contains_key(m.name.as_str()))
                .unwrap_or(false);
            if gone {
                self.mirror_destroy(idx);
            }
        }

        // Build or rebuild the survivors and any new mirrors.
        for (name, mirror_cfg) in new_mirrors {
            let slot = match self.mirror_slot(name) {
                Some(slot) => slot,
                None => {
                    warn!(
                        self.log,
                        "maximum of {MAX_MIRRORS} port mirrors reached, \
                         cannot create {name}"
                    );
                    continue;
                }
            };
            match self.mirror_resolve(slot, mirror_cfg) {
                Some(mirror) => {
                    if self.mirrors[slot].as_ref() != Some(&mirror) {
                        self.flush();
                    }
                    if self.mirrors[slot].is_none() {
                        info!(self.log, "created port mirror {name}");
                    }
                    self.mirrors[slot] = Some(mirror);
                }
                None => {
                    // Invalid configuration: an existing mirror by this
                    // name is withdrawn rather than left stale.
                    self.mirror_destroy(slot);
                }
            }
        }

        // Mirror-output flags are recomputed from scratch each pass.
        for port in self.ports.iter_mut() {
            port.is_mirror_output_port = false;
        }
        let outputs: Vec<usize> = self
            .mirrors
            .iter()
            .flatten()
            .filter_map(|m| match m.out {
                MirrorOut::Port(port_idx) => Some(port_idx),
                MirrorOut::Vlan(_) => None,
            })
            .collect();
        for port_idx in outputs {
            self.ports[port_idx].is_mirror_output_port = true;
        }

        self.mirror_update_port_masks();

        // Flood VLANs (RSPAN): learning is disabled on these.
        let flood_vlans = if cfg.flood_vlans.is_empty() {
            None
        } else {
            let mut set = VlanSet::new();
            for &vlan in &cfg.flood_vlans {
                if vlan > VLAN_MAX {
                    warn!(self.log, "invalid value {vlan} for flood VLAN");
                } else {
                    info!(self.log, "disabling learning on vlan {vlan}");
                    set.insert(vlan);
                }
            }
            Some(set)
        };
        if self.ml.set_flood_vlans(flood_vlans) {
            self.flush();
        }
    }

    /// The slot an existing mirror occupies, or a free one.
    fn mirror_slot(&self, name: &str) -> Option<usize> {
        let existing = self
            .mirrors
            .iter()
            .position(|m| m.as_ref().map(|m| m.name == name).unwrap_or(false));
        existing.or_else(|| self.mirrors.iter().position(|m| m.is_none()))
    }

    /// Validate one mirror's configuration against the bridge.  None means
    /// the mirror cannot be realized and must be withdrawn.
    fn mirror_resolve(
        &self,
        slot: usize,
        cfg: &MirrorConfig,
    ) -> Option<Mirror> {
        let out = match (&cfg.output_port, cfg.output_vlan) {
            (Some(_), Some(_)) => {
                warn!(
                    self.log,
                    "mirror {} specifies both output port and output vlan; \
                     ignoring",
                    cfg.name
                );
                return None;
            }
            (Some(port_name), None) => {
                match self.port_lookup(port_name) {
                    Some(port_idx) => MirrorOut::Port(port_idx),
                    None => {
                        warn!(
                            self.log,
                            "mirror {} outputs to port not on bridge",
                            cfg.name
                        );
                        return None;
                    }
                }
            }
            (None, Some(out_vlan)) => {
                if out_vlan > VLAN_MAX {
                    warn!(
                        self.log,
                        "mirror {} outputs to invalid vlan {out_vlan}",
                        cfg.name
                    );
                    return None;
                }
                MirrorOut::Vlan(out_vlan)
            }
            (None, None) => {
                warn!(
                    self.log,
                    "mirror {} does not specify output; ignoring", cfg.name
                );
                return None;
            }
        };

        // Collect selector ports, dropping duplicates and ports that don't
        // exist on this bridge.
        let mut src_ports = BTreeSet::new();
        let mut dst_ports = BTreeSet::new();
        for (names, resolved) in [
            (&cfg.select_src_port, &mut src_ports),
            (&cfg.select_dst_port, &mut dst_ports),
        ] {
            for name in names.iter() {
                if self.port_lookup(name).is_some() {
                    resolved.insert(name.clone());
                } else {
                    warn!(
                        self.log,
                        "mirror {} cannot match on nonexistent port {name}",
                        cfg.name
                    );
                }
            }
        }
        let any_ports_specified =
            !cfg.select_src_port.is_empty() || !cfg.select_dst_port.is_empty();
        if any_ports_specified && src_ports.is_empty() && dst_ports.is_empty()
        {
            warn!(
                self.log,
                "disabling mirror {} since none of the specified selection \
                 ports exists",
                cfg.name
            );
            return None;
        }

        // And the selector VLANs.
        let mut vlans = Vec::new();
        for &vlan in &cfg.select_vlan {
            if vlan > VLAN_MAX {
                warn!(
                    self.log,
                    "mirror {} selects invalid VLAN {vlan}", cfg.name
                );
            } else if !vlans.contains(&vlan) {
                vlans.push(vlan);
            }
        }
        if !cfg.select_vlan.is_empty() && vlans.is_empty() {
            warn!(
                self.log,
                "disabling mirror {} since none of the specified VLANs \
                 exists",
                cfg.name
            );
            return None;
        }

        Some(Mirror {
            idx: slot,
            name: cfg.name.clone(),
            src_ports,
            dst_ports,
            vlans,
            out,
        })
    }

    /// Recompute every port's src/dst mirror masks from the mirror set.
    fn mirror_update_port_masks(&mut self) {
        for port_idx in 0..self.ports.len() {
            let mut src_mask = 0u32;
            let mut dst_mask = 0u32;
            for mirror in self.mirrors.iter().flatten() {
                let bit = 1u32 << mirror.idx;
                let port = &self.ports[port_idx];

                let vlan_selected = !mirror.vlans.is_empty()
                    && match port.vlan.access_vlan() {
                        Some(access) => mirror.selects_vlan(access),
                        None => mirror
                            .vlans
                            .iter()
                            .any(|&vlan| port.trunks_vlan(vlan)),
                    };
                if mirror.mirrors_all()
                    || mirror.src_ports.contains(&port.name)
                    || vlan_selected
                {
                    src_mask |= bit;
                }
                if mirror.mirrors_all()
                    || mirror.dst_ports.contains(&port.name)
                {
                    dst_mask |= bit;
                }
            }
            let port = &mut self.ports[port_idx];
            port.src_mirrors = src_mask;
            port.dst_mirrors = dst_mask;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::testutil::add_port;
    use crate::bridge::testutil::test_bridge;
    use crate::port::VlanMode;

    fn mirror_cfg(name: &str) -> MirrorConfig {
        MirrorConfig {
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn bridge_cfg(mirrors: Vec<MirrorConfig>) -> BridgeConfig {
        BridgeConfig {
            name: "br0".to_string(),
            mirrors,
            ..Default::default()
        }
    }

    #[test]
    fn test_mirror_all_and_masks() {
        let (mut br, _, net) = test_bridge("br0");
        add_port(&mut br, &net, "p1", &["eth1"]);
        add_port(&mut br, &net, "p2", &["eth2"]);
        add_port(&mut br, &net, "span", &["eth3"]);

        let mut m = mirror_cfg("m0");
        m.output_port = Some("span".to_string());
        br.mirror_reconfigure(&bridge_cfg(vec![m]));

        // No selectors: everything is mirrored.
        assert_eq!(br.ports[0].src_mirrors, 1);
        assert_eq!(br.ports[0].dst_mirrors, 1);
        assert_eq!(br.ports[1].src_mirrors, 1);
        assert!(br.ports[2].is_mirror_output_port);

        // Removing it clears the masks and the output flag.
        br.mirror_reconfigure(&bridge_cfg(vec![]));
        assert_eq!(br.ports[0].src_mirrors, 0);
        assert_eq!(br.ports[0].dst_mirrors, 0);
        assert!(!br.ports[2].is_mirror_output_port);
        assert!(br.mirrors.iter().all(|m| m.is_none()));
    }

    #[test]
    fn test_vlan_selector_masks() {
        let (mut br, _, net) = test_bridge("br0");
        let p1 = add_port(&mut br, &net, "p1", &["eth1"]);
        let p2 = add_port(&mut br, &net, "p2", &["eth2"]);
        let p3 = add_port(&mut br, &net, "p3", &["eth3"]);
        add_port(&mut br, &net, "span", &["eth4"]);
        br.ports[p1].vlan = VlanMode::Access(10);
        br.ports[p2].vlan =
            VlanMode::Trunk([10u16, 20].into_iter().collect());
        br.ports[p3].vlan = VlanMode::Access(30);

        let mut m = mirror_cfg("m0");
        m.select_vlan = vec![10];
        m.output_port = Some("span".to_string());
        br.mirror_reconfigure(&bridge_cfg(vec![m]));

        // Access port on VLAN 10 and the trunk carrying it are sources; the
        // VLAN-30 access port is not.  VLAN selection does not make dst
        // ports.
        assert_eq!(br.ports[p1].src_mirrors, 1);
        assert_eq!(br.ports[p2].src_mirrors, 1);
        assert_eq!(br.ports[p3].src_mirrors, 0);
        assert_eq!(br.ports[p1].dst_mirrors, 0);
    }

    #[test]
    fn test_invalid_mirrors_are_withdrawn() {
        let (mut br, _, net) = test_bridge("br0");
        add_port(&mut br, &net, "p1", &["eth1"]);

        // Output port that doesn't exist.
        let mut bad_out = mirror_cfg("m0");
        bad_out.output_port = Some("nope".to_string());
        // No output at all.
        let no_out = mirror_cfg("m1");
        // Selector ports all nonexistent.
        let mut bad_sel = mirror_cfg("m2");
        bad_sel.select_src_port = vec!["ghost".to_string()];
        bad_sel.output_vlan = Some(99);
        // Both output kinds at once: output port xor output vlan.
        let mut both_out = mirror_cfg("m4");
        both_out.output_port = Some("p1".to_string());
        both_out.output_vlan = Some(99);

        br.mirror_reconfigure(&bridge_cfg(vec![
            bad_out, no_out, bad_sel, both_out,
        ]));
        assert!(br.mirrors.iter().all(|m| m.is_none()));
        assert!(!br.ports[0].is_mirror_output_port);

        // A valid RSPAN mirror occupies a slot, then turning its config
        // invalid withdraws it.
        let mut rspan = mirror_cfg("m3");
        rspan.output_vlan = Some(99);
        br.mirror_reconfigure(&bridge_cfg(vec![rspan.clone()]));
        assert!(br.mirrors[0].is_some());
        assert_eq!(br.mirrors[0].as_ref().unwrap().out, MirrorOut::Vlan(99));

        // Adding an output port on top of the output vlan withdraws it.
        let mut broken = mirror_cfg("m3");
        broken.output_port = Some("p1".to_string());
        broken.output_vlan = Some(99);
        br.mirror_reconfigure(&bridge_cfg(vec![broken]));
        assert!(br.mirrors[0].is_none());
        assert!(!br.ports[0].is_mirror_output_port);

        br.mirror_reconfigure(&bridge_cfg(vec![rspan]));
        assert!(br.mirrors[0].is_some());

        let mut broken = mirror_cfg("m3");
        broken.output_vlan = Some(9999);
        br.mirror_reconfigure(&bridge_cfg(vec![broken]));
        assert!(br.mirrors[0].is_none());
    }

    #[test]
    fn test_slot_cap() {
        let (mut br, _, net) = test_bridge("br0");
        add_port(&mut br, &net, "p1", &["eth1"]);

        let mut cfgs = Vec::new();
        for i in 0..(MAX_MIRRORS + 2) {
            let mut m = mirror_cfg(&format!("m{i}"));
            m.output_vlan = Some(100 + i as u16);
            cfgs.push(m);
        }
        br.mirror_reconfigure(&bridge_cfg(cfgs));
        let occupied = br.mirrors.iter().flatten().count();
        assert_eq!(occupied, MAX_MIRRORS);
    }

    #[test]
    fn test_flood_vlans_applied() {
        let (mut br, _, net) = test_bridge("br0");
        let p1 = add_port(&mut br, &net, "p1", &["eth1"]);
        let mut cfg = bridge_cfg(vec![]);
        cfg.flood_vlans = vec![99];
        br.mirror_reconfigure(&cfg);

        let mac = common::network::MacAddr::new(0, 1, 2, 3, 4, 5);
        assert_eq!(br.ml.learn(mac, 99, p1, 0), None);
        assert!(br.ml.learn(mac, 10, p1, 0).is_some());
    }
}
