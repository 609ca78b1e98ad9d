// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Link aggregation.
//!
//! A bond spreads flows over its slaves by hashing the source MAC into 256
//! buckets, each pinned to one slave.  Slaves are enabled and disabled with
//! configurable debounce delays, one slave is elected "active" to receive
//! multicast ingress, and a periodic rebalance migrates buckets from
//! overloaded slaves to underloaded ones.  Every state change here
//! revalidates the tags that dependent cached flows recorded.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

use slog::debug;
use slog::info;
use slog::warn;

use common::network::MacAddr;

use crate::bridge::Bridge;
use crate::bridge::BOND_REBALANCE_INTERVAL_MS;
use crate::compat::BondSlaveStatus;
use crate::compat::BondStatus;
use crate::compat::ProcCompat;
use crate::netdev::NetdevProvider;
use crate::port::BOND_MASK;
use crate::tag::TagSet;

/// EtherType of the gratuitous frames sent to make upstream switches relearn
/// MACs after a failover.
pub const LEARNING_PACKET_ETHERTYPE: u16 = 0xf177;

pub const LEARNING_PACKET_LABEL: &[u8] = b"Open vSwitch Bond Failover";

pub const LEARNING_PACKET_LEN: usize = 128;

/// Hash a source MAC into a bond bucket index.
pub fn bond_hash(mac: MacAddr) -> u8 {
    let mut hasher = DefaultHasher::new();
    hasher.write(&mac.octets());
    (hasher.finish() & BOND_MASK as u64) as u8
}

/// One small benign frame, sourced from `mac`, that prompts upstream
/// switches to move the address to whatever path carries it.
fn compose_learning_frame(mac: MacAddr) -> Vec<u8> {
    let mut frame = vec![0u8; LEARNING_PACKET_LEN];
    frame[..6].copy_from_slice(&mac.octets());
    frame[6..12].copy_from_slice(&mac.octets());
    frame[12..14].copy_from_slice(&LEARNING_PACKET_ETHERTYPE.to_be_bytes());
    frame[14..14 + LEARNING_PACKET_LABEL.len()]
        .copy_from_slice(LEARNING_PACKET_LABEL);
    frame
}

impl Bridge {
    /// Pick the datapath port a frame from `dl_src` leaves through on
    /// `port_idx`, folding every tag the choice depended on into `tags`.
    ///
    /// For a bond this consults the source-MAC hash bucket, repairing the
    /// bucket first if it is unassigned or points at a disabled slave.
    /// Returns None (after folding in the no-slaves tag) when the bond has
    /// no usable slave at all.
    pub fn choose_output_iface(
        &mut self,
        port_idx: usize,
        dl_src: MacAddr,
        tags: &mut TagSet,
        now: i64,
    ) -> Option<u16> {
        let port = &self.ports[port_idx];
        debug_assert!(!port.ifaces.is_empty());

        let iface_idx = if port.ifaces.len() == 1 {
            0
        } else {
            let bucket = bond_hash(dl_src) as usize;
            let n_ifaces = port.ifaces.len();
            let entry = &port.bond.as_ref().unwrap().hash[bucket];
            let usable = entry
                .iface_idx
                .map(|i| i < n_ifaces && port.ifaces[i].enabled)
                .unwrap_or(false);

            if !usable {
                match self.bond_choose_iface(port_idx, now, false) {
                    None => {
                        let port = &self.ports[port_idx];
                        tags.insert(port.bond.as_ref().unwrap().no_ifaces_tag);
                        return None;
                    }
                    Some(chosen) => {
                        let tag = self.tags.fresh();
                        let port = &mut self.ports[port_idx];
                        let entry =
                            &mut port.bond.as_mut().unwrap().hash[bucket];
                        entry.iface_idx = Some(chosen);
                        entry.iface_tag = Some(tag);
                        port.bond_compat_is_stale = true;
                    }
                }
            }

            let port = &self.ports[port_idx];
            let entry = &port.bond.as_ref().unwrap().hash[bucket];
            if let Some(tag) = entry.iface_tag {
                tags.insert(tag);
            }
            entry.iface_idx.unwrap()
        };

        let iface = &self.ports[port_idx].ifaces[iface_idx];
        tags.insert(iface.tag);
        if iface.dp_ifidx < 0 {
            return None;
        }
        Some(iface.dp_ifidx as u16)
    }

    /// The slave a new assignment should use: the first enabled one.  With
    /// none enabled, the pending slave closest to the end of its updelay is
    /// forced on immediately, on the grounds that some connectivity beats
    /// none.  Slaves that are down with no transition pending are not
    /// candidates.
    pub fn bond_choose_iface(
        &mut self,
        port_idx: usize,
        now: i64,
        moving_active_iface: bool,
    ) -> Option<usize> {
        let port = &self.ports[port_idx];
        if let Some(idx) = port.ifaces.iter().position(|iface| iface.enabled) {
            return Some(idx);
        }

        let best = port
            .ifaces
            .iter()
            .enumerate()
            .filter(|(_, iface)| iface.delay_expires != i64::MAX)
            .min_by_key(|(_, iface)| iface.delay_expires)
            .map(|(idx, _)| idx)?;

        let iface = &port.ifaces[best];
        if self.rl.carrier.admit(now) {
            info!(
                self.log,
                "interface {}: skipping remaining {} ms updelay since no \
                 other interface is up",
                iface.name,
                iface.delay_expires.saturating_sub(now)
            );
        }
        self.bond_enable_slave(port_idx, best, true, moving_active_iface, now);
        Some(best)
    }

    /// Elect a new active slave and replace the active-slave tag.
    pub fn bond_choose_active_iface(
        &mut self,
        port_idx: usize,
        now: i64,
    ) -> Option<usize> {
        self.bond_choose_active_iface_inner(port_idx, now, false)
    }

    fn bond_choose_active_iface_inner(
        &mut self,
        port_idx: usize,
        now: i64,
        moving_active_iface: bool,
    ) -> Option<usize> {
        let chosen =
            self.bond_choose_iface(port_idx, now, moving_active_iface);
        let tag = self.tags.fresh();
        let port = &mut self.ports[port_idx];
        port.active_iface = chosen;
        port.active_iface_tag = tag;
        match chosen {
            Some(idx) => {
                let name = port.ifaces[idx].name.clone();
                if self.rl.election.admit(now) {
                    info!(
                        self.log,
                        "port {}: active interface is now {name}", port.name
                    );
                }
            }
            None => {
                if self.rl.election.admit(now) {
                    warn!(
                        self.log,
                        "port {}: all ports disabled, no active interface",
                        port.name
                    );
                }
            }
        }
        chosen
    }

    /// Feed a carrier transition into the debounce state machine.
    ///
    /// A transition that restores the stable state cancels any pending
    /// delay.  Carrier-up with no active slave takes effect immediately;
    /// anything else starts the configured up/down delay.
    pub fn bond_link_status_update(
        &mut self,
        port_idx: usize,
        iface_idx: usize,
        carrier: bool,
        now: i64,
    ) {
        let port = &self.ports[port_idx];
        let iface = &port.ifaces[iface_idx];

        if (carrier == iface.enabled) == (iface.delay_expires == i64::MAX) {
            // Nothing to do.
            return;
        }
        let name = iface.name.clone();
        if self.rl.carrier.admit(now) {
            info!(
                self.log,
                "interface {name}: carrier {}",
                if carrier { "detected" } else { "dropped" }
            );
        }

        if carrier == self.ports[port_idx].ifaces[iface_idx].enabled {
            let iface = &mut self.ports[port_idx].ifaces[iface_idx];
            iface.delay_expires = i64::MAX;
            if self.rl.carrier.admit(now) {
                info!(
                    self.log,
                    "interface {name}: will not be {}",
                    if carrier { "disabled" } else { "enabled" }
                );
            }
        } else if carrier && self.ports[port_idx].active_iface.is_none() {
            let updelay = self.ports[port_idx].updelay;
            self.bond_enable_slave(port_idx, iface_idx, true, false, now);
            if updelay > 0 && self.rl.carrier.admit(now) {
                info!(
                    self.log,
                    "interface {name}: skipping {updelay} ms updelay since \
                     no other interface is up"
                );
            }
        } else {
            let port = &mut self.ports[port_idx];
            let delay = if carrier { port.updelay } else { port.downdelay };
            port.ifaces[iface_idx].delay_expires = now + delay;
            if delay > 0 && self.rl.carrier.admit(now) {
                info!(
                    self.log,
                    "interface {name}: will be {} if it stays {} for \
                     {delay} ms",
                    if carrier { "enabled" } else { "disabled" },
                    if carrier { "up" } else { "down" }
                );
            }
        }
    }

    /// Flip a slave's `enabled` state, with all the follow-on work: tag
    /// revalidation, active-slave re-election, and learning packets.
    ///
    /// `moving_active_iface` is true when this call is nested inside the
    /// disable of the current active slave; the election running there
    /// already covers the work the newly enabled slave would otherwise
    /// trigger.
    pub fn bond_enable_slave(
        &mut self,
        port_idx: usize,
        iface_idx: usize,
        enable: bool,
        moving_active_iface: bool,
        now: i64,
    ) {
        {
            let iface = &mut self.ports[port_idx].ifaces[iface_idx];
            iface.delay_expires = i64::MAX;
            if enable == iface.enabled {
                return;
            }
            iface.enabled = enable;
        }

        let name = self.ports[port_idx].ifaces[iface_idx].name.clone();
        if !enable {
            warn!(self.log, "interface {name}: disabled");
            let tag = self.ports[port_idx].ifaces[iface_idx].tag;
            self.engine.revalidate(tag);
            if self.ports[port_idx].active_iface == Some(iface_idx) {
                let active_tag = self.ports[port_idx].active_iface_tag;
                self.engine.revalidate(active_tag);
                // Disabling the active slave can immediately enable another
                // one that was waiting out an updelay; the nested call sees
                // moving_active_iface and skips its redundant election.
                self.bond_choose_active_iface_inner(port_idx, now, true);
            }
            self.bond_send_learning_packets(port_idx, now);
        } else {
            warn!(self.log, "interface {name}: enabled");
            if self.ports[port_idx].active_iface.is_none()
                && !moving_active_iface
            {
                let no_ifaces_tag = self.ports[port_idx]
                    .bond
                    .as_ref()
                    .map(|bond| bond.no_ifaces_tag);
                if let Some(tag) = no_ifaces_tag {
                    self.engine.revalidate(tag);
                }
                self.bond_choose_active_iface_inner(port_idx, now, false);
                self.bond_send_learning_packets(port_idx, now);
            }
            let tag = self.tags.fresh();
            self.ports[port_idx].ifaces[iface_idx].tag = tag;
        }

        self.ports[port_idx].bond_compat_is_stale = true;
    }

    /// Fire expired debounce timers and push refreshed bond status to the
    /// compatibility layer.
    pub fn bond_run(
        &mut self,
        now: i64,
        compat: &mut dyn ProcCompat,
        netdevs: &dyn NetdevProvider,
    ) {
        for port_idx in 0..self.ports.len() {
            if self.ports[port_idx].is_bond() {
                for iface_idx in 0..self.ports[port_idx].ifaces.len() {
                    let iface = &self.ports[port_idx].ifaces[iface_idx];
                    if now >= iface.delay_expires {
                        let enable = !iface.enabled;
                        self.bond_enable_slave(
                            port_idx, iface_idx, enable, false, now,
                        );
                    }
                }
            }

            if self.ports[port_idx].bond_compat_is_stale {
                self.ports[port_idx].bond_compat_is_stale = false;
                self.bond_refresh_compat(port_idx, compat, netdevs);
            }
        }
    }

    /// Publish a port's bond status, and drive the fake bond device's
    /// up/down flag to track the aggregate state.
    pub fn bond_refresh_compat(
        &mut self,
        port_idx: usize,
        compat: &mut dyn ProcCompat,
        netdevs: &dyn NetdevProvider,
    ) {
        let port = &self.ports[port_idx];
        if !port.is_bond() {
            compat.update_bond(&port.name, None);
            return;
        }

        let slaves: Vec<BondSlaveStatus> = port
            .ifaces
            .iter()
            .map(|iface| BondSlaveStatus {
                name: iface.name.clone(),
                up: iface.enabled && iface.delay_expires == i64::MAX,
                mac: iface
                    .netdev
                    .as_ref()
                    .and_then(|netdev| netdev.etheraddr().ok()),
            })
            .collect();
        let hashes = port
            .bond
            .as_ref()
            .map(|bond| {
                bond.hash
                    .iter()
                    .enumerate()
                    .filter_map(|(bucket, entry)| {
                        let idx = entry.iface_idx?;
                        let iface = port.ifaces.get(idx)?;
                        Some((bucket as u8, iface.name.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default();
        let status = BondStatus {
            up: slaves.iter().any(|slave| slave.up),
            updelay_ms: port.updelay,
            downdelay_ms: port.downdelay,
            hashes,
            slaves,
        };

        if port.bond_fake_iface {
            match netdevs.open(
                &port.name,
                true,
                &std::collections::BTreeMap::new(),
            ) {
                Ok(mut netdev) => {
                    if let Err(e) = netdev.set_up(status.up) {
                        warn!(
                            self.log,
                            "could not update fake bond device {}: {e}",
                            port.name
                        );
                    }
                }
                Err(e) => {
                    warn!(
                        self.log,
                        "could not open fake bond device {}: {e}", port.name
                    );
                }
            }
        }

        let name = self.ports[port_idx].name.clone();
        compat.update_bond(&name, Some(&status));
    }

    /// For each MAC learned on some *other* port, transmit one gratuitous
    /// frame through this bond so the upstream network relearns the address
    /// on the bond's current path.
    pub fn bond_send_learning_packets(&mut self, port_idx: usize, now: i64) {
        if self.ports[port_idx].ifaces.is_empty()
            || self.ports[port_idx].active_iface.is_none()
        {
            return;
        }

        let entries: Vec<(MacAddr, u16, usize)> = self
            .ml
            .entries_lru()
            .map(|e| (e.mac, e.vlan, e.port_idx))
            .collect();

        let mut n_packets = 0;
        let mut n_errors = 0;
        for (mac, vlan, learned_port) in entries {
            if learned_port == port_idx {
                continue;
            }
            let mut tags = TagSet::new();
            let Some(dp_ifidx) =
                self.choose_output_iface(port_idx, mac, &mut tags, now)
            else {
                continue;
            };

            let mut actions = Vec::with_capacity(2);
            if vlan != 0 {
                actions.push(crate::forward::OdpAction::SetVlanVid(vlan));
            }
            actions.push(crate::forward::OdpAction::Output(dp_ifidx));

            n_packets += 1;
            let frame = compose_learning_frame(mac);
            if self.engine.send_packet(&actions, &frame).is_err() {
                n_errors += 1;
            }
        }

        let name = &self.ports[port_idx].name;
        if n_errors > 0 {
            if self.rl.misc.admit(now) {
                warn!(
                    self.log,
                    "bond {name}: {n_errors} errors sending {n_packets} \
                     gratuitous learning packets"
                );
            }
        } else {
            debug!(
                self.log,
                "bond {name}: sent {n_packets} gratuitous learning packets"
            );
        }
    }

    /// Reassign one hash bucket (administrative override).
    pub fn bond_migrate(
        &mut self,
        port_idx: usize,
        bucket: u8,
        iface_idx: usize,
    ) {
        let tag = self.tags.fresh();
        let port = &mut self.ports[port_idx];
        let entry = &mut port.bond.as_mut().unwrap().hash[bucket as usize];
        let old_tag = entry.iface_tag.take();
        entry.iface_idx = Some(iface_idx);
        entry.iface_tag = Some(tag);
        port.bond_compat_is_stale = true;
        if let Some(old) = old_tag {
            self.engine.revalidate(old);
        }
    }

    /// Administratively select the active slave.  Returns false if it
    /// already was the active one.
    pub fn bond_set_active_slave(
        &mut self,
        port_idx: usize,
        iface_idx: usize,
        now: i64,
    ) -> bool {
        if self.ports[port_idx].active_iface == Some(iface_idx) {
            return false;
        }
        let old_tag = self.ports[port_idx].active_iface_tag;
        self.engine.revalidate(old_tag);
        let tag = self.tags.fresh();
        let port = &mut self.ports[port_idx];
        port.active_iface = Some(iface_idx);
        port.active_iface_tag = tag;
        let name = port.ifaces[iface_idx].name.clone();
        info!(
            self.log,
            "port {}: active interface is now {name}",
            self.ports[port_idx].name
        );
        self.bond_send_learning_packets(port_idx, now);
        true
    }
}

/// Per-slave accounting used during one rebalance pass.
struct SlaveBalance {
    iface_idx: usize,
    enabled: bool,
    tx_bytes: u64,
    /// (bucket index, bucket bytes), ascending by bytes.
    hashes: Vec<(usize, u64)>,
}

/// Restore sorted order (descending tx_bytes) given that only position `p`
/// may be out of place.
fn resort_bals(bals: &mut [SlaveBalance], mut p: usize) {
    while p > 0 && bals[p].tx_bytes > bals[p - 1].tx_bytes {
        bals.swap(p, p - 1);
        p -= 1;
    }
    while p + 1 < bals.len() && bals[p].tx_bytes < bals[p + 1].tx_bytes {
        bals.swap(p, p + 1);
        p += 1;
    }
}

impl Bridge {
    /// Shift load between a bond's slaves until it is roughly even, then
    /// decay every bucket's byte count by half (an exponential moving
    /// average with a half-life of one rebalance period).
    pub fn bond_rebalance_port(&mut self, port_idx: usize) {
        let port = &self.ports[port_idx];
        let Some(bond) = port.bond.as_ref() else {
            return;
        };
        let n_ifaces = port.ifaces.len();

        let mut bals: Vec<SlaveBalance> = port
            .ifaces
            .iter()
            .enumerate()
            .map(|(idx, iface)| SlaveBalance {
                iface_idx: idx,
                enabled: iface.enabled,
                tx_bytes: 0,
                hashes: Vec::new(),
            })
            .collect();
        for (bucket, entry) in bond.hash.iter().enumerate() {
            if let Some(idx) = entry.iface_idx {
                if idx < n_ifaces {
                    bals[idx].tx_bytes += entry.tx_bytes;
                    bals[idx].hashes.push((bucket, entry.tx_bytes));
                }
            }
        }
        for bal in &mut bals {
            bal.hashes.sort_by_key(|(_, bytes)| *bytes);
        }
        // Enabled slaves first, then descending load.
        bals.sort_by(|a, b| {
            b.enabled
                .cmp(&a.enabled)
                .then(b.tx_bytes.cmp(&a.tx_bytes))
        });
        self.log_bals(port_idx, &bals);

        // Disabled slaves sorted to the back carry no migratable load.
        while let Some(last) = bals.last() {
            if last.enabled {
                break;
            }
            bals.pop();
        }
        if bals.is_empty() {
            return;
        }

        let to = bals.len() - 1;
        let mut from = 0;
        while from < to {
            let overload =
                bals[from].tx_bytes.saturating_sub(bals[to].tx_bytes);
            if overload < (bals[to].tx_bytes >> 5).max(100_000) {
                // The heaviest slave exceeds the lightest by less than ~3%
                // or ~1 Mbps; not worth churning cached flows over.
                break;
            }
            if bals[from].hashes.len() == 1 {
                // A single hash can't be split, however large it is.
                from += 1;
                continue;
            }

            let mut migrate = None;
            for (pos, &(bucket, delta)) in bals[from].hashes.iter().enumerate()
            {
                if delta == 0 {
                    continue;
                }
                let order_swapped = bals[from].tx_bytes - delta
                    < bals[to].tx_bytes + delta;
                if bals[to].tx_bytes == 0 {
                    // Nothing on the idle slave yet; any load helps.
                    migrate = Some((pos, bucket, delta, order_swapped));
                    break;
                }
                let old_ratio =
                    bals[from].tx_bytes as f64 / bals[to].tx_bytes as f64;
                let mut new_ratio = (bals[from].tx_bytes - delta) as f64
                    / (bals[to].tx_bytes + delta) as f64;
                if new_ratio == 0.0 {
                    continue;
                }
                if new_ratio < 1.0 {
                    new_ratio = 1.0 / new_ratio;
                }
                if old_ratio - new_ratio > 0.1 {
                    migrate = Some((pos, bucket, delta, order_swapped));
                    break;
                }
            }

            match migrate {
                None => from += 1,
                Some((pos, bucket, delta, order_swapped)) => {
                    self.bond_shift_load(
                        port_idx,
                        bucket,
                        bals[to].iface_idx,
                        delta,
                        &bals[from],
                        &bals[to],
                    );
                    bals[from].hashes.remove(pos);
                    bals[from].tx_bytes -= delta;
                    bals[to].tx_bytes += delta;

                    // If the migration inverted the pair's order, swap them
                    // back so the positional walk stays valid.
                    if order_swapped {
                        bals.swap(from, to);
                    }
                    resort_bals(&mut bals, from);
                    resort_bals(&mut bals, to);
                }
            }
        }

        let bond = self.ports[port_idx].bond.as_mut().unwrap();
        for entry in bond.hash.iter_mut() {
            entry.tx_bytes /= 2;
        }
    }

    fn bond_shift_load(
        &mut self,
        port_idx: usize,
        bucket: usize,
        to_iface: usize,
        delta: u64,
        from: &SlaveBalance,
        to: &SlaveBalance,
    ) {
        {
            let port = &self.ports[port_idx];
            info!(
                self.log,
                "bond {}: shift {}kB of load (with hash {bucket}) from {} \
                 to {} (now carrying {}kB and {}kB load, respectively)",
                port.name,
                delta / 1024,
                port.ifaces[from.iface_idx].name,
                port.ifaces[to.iface_idx].name,
                (from.tx_bytes - delta) / 1024,
                (to.tx_bytes + delta) / 1024
            );
        }

        let tag = self.tags.fresh();
        let port = &mut self.ports[port_idx];
        let entry = &mut port.bond.as_mut().unwrap().hash[bucket];
        let old_tag = entry.iface_tag.take();
        entry.iface_idx = Some(to_iface);
        entry.iface_tag = Some(tag);
        port.bond_compat_is_stale = true;
        if let Some(old) = old_tag {
            self.engine.revalidate(old);
        }
    }

    fn log_bals(&self, port_idx: usize, bals: &[SlaveBalance]) {
        let port = &self.ports[port_idx];
        let mut rendered = String::new();
        for (i, bal) in bals.iter().enumerate() {
            if i > 0 {
                rendered.push(',');
            }
            rendered.push_str(&format!(
                " {} {}kB",
                port.ifaces[bal.iface_idx].name,
                bal.tx_bytes / 1024
            ));
            if !bal.enabled {
                rendered.push_str(" (disabled)");
            }
            if !bal.hashes.is_empty() {
                let buckets: Vec<String> = bal
                    .hashes
                    .iter()
                    .map(|(bucket, bytes)| {
                        format!("h{bucket}: {}kB", bytes / 1024)
                    })
                    .collect();
                rendered.push_str(&format!(" ({})", buckets.join(" + ")));
            }
        }
        debug!(self.log, "bond {}:{rendered}", port.name);
    }

    /// Called at least once a second by the engine; runs the 10-second
    /// rebalance debounce.
    pub fn account_checkpoint(&mut self, now: i64) {
        if !self.has_bonded_ports || now < self.bond_next_rebalance {
            return;
        }
        self.bond_next_rebalance = now + BOND_REBALANCE_INTERVAL_MS;

        for port_idx in 0..self.ports.len() {
            if self.ports[port_idx].is_bond() {
                self.bond_rebalance_port(port_idx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::testutil::add_port;
    use crate::bridge::testutil::test_bridge;
    use crate::forward::OdpAction;
    use crate::port::BOND_TABLE_SIZE;

    fn mac(last: u8) -> MacAddr {
        MacAddr::new(0x50, 0x54, 0x00, 0x00, 0x00, last)
    }

    #[test]
    fn test_learning_frame_layout() {
        let frame = compose_learning_frame(mac(7));
        assert_eq!(frame.len(), LEARNING_PACKET_LEN);
        assert_eq!(&frame[6..12], &mac(7).octets());
        assert_eq!(&frame[12..14], &[0xf1, 0x77]);
        assert_eq!(
            &frame[14..14 + LEARNING_PACKET_LABEL.len()],
            LEARNING_PACKET_LABEL
        );
    }

    #[test]
    fn test_bond_hash_stable() {
        assert_eq!(bond_hash(mac(1)), bond_hash(mac(1)));
    }

    #[test]
    fn test_single_iface_choice() {
        let (mut br, _, net) = test_bridge("br0");
        let p = add_port(&mut br, &net, "p1", &["eth0"]);
        let mut tags = TagSet::new();
        let dp = br.choose_output_iface(p, mac(1), &mut tags, 0).unwrap();
        assert_eq!(dp, br.ports[p].ifaces[0].dp_ifidx as u16);
        assert!(tags.contains(br.ports[p].ifaces[0].tag));
    }

    #[test]
    fn test_bond_assignment_and_tags() {
        let (mut br, _, net) = test_bridge("br0");
        let p = add_port(&mut br, &net, "bond0", &["eth1", "eth2"]);
        assert!(br.ports[p].bond.is_some());
        assert!(br.ports[p].active_iface.is_some());

        let mut tags = TagSet::new();
        let dp = br.choose_output_iface(p, mac(1), &mut tags, 0).unwrap();
        let bucket = bond_hash(mac(1)) as usize;
        let entry = br.ports[p].bond.as_ref().unwrap().hash[bucket];
        let assigned = entry.iface_idx.unwrap();
        assert_eq!(dp, br.ports[p].ifaces[assigned].dp_ifidx as u16);
        // The decision depends on both the bucket tag and the slave tag.
        assert!(tags.contains(entry.iface_tag.unwrap()));
        assert!(tags.contains(br.ports[p].ifaces[assigned].tag));
        // First enabled slave wins a fresh assignment.
        assert_eq!(assigned, 0);
    }

    #[test]
    fn test_no_usable_slave() {
        let (mut br, _, net) = test_bridge("br0");
        let p = add_port(&mut br, &net, "bond0", &["eth1", "eth2"]);
        // Both slaves stable-down: nothing to force on, so the decision
        // drops the destination and depends on the no-slaves tag.
        for iface in br.ports[p].ifaces.iter_mut() {
            iface.enabled = false;
            iface.delay_expires = i64::MAX;
        }
        br.ports[p].active_iface = None;
        let no_ifaces_tag = br.ports[p].bond.as_ref().unwrap().no_ifaces_tag;

        let mut tags = TagSet::new();
        assert_eq!(br.choose_output_iface(p, mac(1), &mut tags, 0), None);
        assert!(tags.contains(no_ifaces_tag));

        // A slave part-way through its updelay is forced on immediately.
        br.ports[p].ifaces[1].delay_expires = 5_000;
        let mut tags = TagSet::new();
        let dp = br.choose_output_iface(p, mac(1), &mut tags, 1_000);
        assert_eq!(dp, Some(br.ports[p].ifaces[1].dp_ifidx as u16));
        assert!(br.ports[p].ifaces[1].enabled);
        assert_eq!(br.ports[p].ifaces[1].delay_expires, i64::MAX);
        assert_eq!(br.ports[p].active_iface, Some(1));
    }

    #[test]
    fn test_debounce_transitions() {
        let (mut br, _, net) = test_bridge("br0");
        let p = add_port(&mut br, &net, "bond0", &["ethA", "ethB"]);
        br.ports[p].updelay = 200;
        br.ports[p].downdelay = 100;
        let now = 1000;

        // Carrier loss on an enabled slave: pending-down.
        br.bond_link_status_update(p, 1, false, now);
        assert!(br.ports[p].ifaces[1].enabled);
        assert_eq!(br.ports[p].ifaces[1].delay_expires, now + 100);

        // Carrier back before the delay expires: transition cancelled.
        br.bond_link_status_update(p, 1, true, now + 50);
        assert!(br.ports[p].ifaces[1].enabled);
        assert_eq!(br.ports[p].ifaces[1].delay_expires, i64::MAX);

        // Lose it again and let the timer fire.
        br.bond_link_status_update(p, 1, false, now);
        let mut compat = crate::compat::RecordingCompat::default();
        br.bond_run(now + 100, &mut compat, &net);
        assert!(!br.ports[p].ifaces[1].enabled);

        // Carrier up on the now-disabled slave while another is active:
        // pending-up with the updelay.
        br.bond_link_status_update(p, 1, true, now + 200);
        assert!(!br.ports[p].ifaces[1].enabled);
        assert_eq!(br.ports[p].ifaces[1].delay_expires, now + 400);
    }

    // Scenario: bonded port with the active slave losing carrier; after the
    // downdelay the other slave takes over, with the tag protocol observed.
    #[test]
    fn test_bond_failover() {
        let (mut br, engine, net) = test_bridge("br0");
        let access = add_port(&mut br, &net, "p1", &["eth0"]);
        let p = add_port(&mut br, &net, "bond0", &["ethA", "ethB"]);
        br.ports[p].downdelay = 100;
        let active = br.ports[p].active_iface.unwrap();
        let standby = 1 - active;
        let old_active_tag = br.ports[p].active_iface_tag;
        let old_iface_tag = br.ports[p].ifaces[active].tag;

        // A MAC learned on another port earns a learning packet on failover.
        br.ml.learn(mac(9), 0, access, 0);

        let now = 5000;
        br.bond_link_status_update(p, active, false, now);
        // No timer yet: still enabled, still active.
        assert!(br.ports[p].ifaces[active].enabled);
        assert_eq!(br.ports[p].active_iface, Some(active));

        let mut compat = crate::compat::RecordingCompat::default();
        br.bond_run(now + 100, &mut compat, &net);

        assert!(!br.ports[p].ifaces[active].enabled);
        assert_eq!(br.ports[p].active_iface, Some(standby));
        assert_ne!(br.ports[p].active_iface_tag, old_active_tag);

        let log = engine.borrow();
        assert!(log.was_revalidated(old_active_tag));
        assert!(log.was_revalidated(old_iface_tag));
        // One learning packet, for the one MAC learned elsewhere, out the
        // standby slave.
        assert_eq!(log.sent.len(), 1);
        let (actions, frame) = &log.sent[0];
        assert_eq!(
            actions.as_slice(),
            &[OdpAction::Output(
                br.ports[p].ifaces[standby].dp_ifidx as u16
            )]
        );
        assert_eq!(&frame[6..12], &mac(9).octets());

        // Compat layer saw the refreshed state.
        let status = compat.bonds["bond0"].as_ref().unwrap();
        assert!(status.up);
        assert_eq!(status.slaves.len(), 2);
    }

    // Scenario: one overloaded bucket moves to the idle slave, and the
    // decay pass halves its counter.
    #[test]
    fn test_rebalance() {
        let (mut br, engine, net) = test_bridge("br0");
        let p = add_port(&mut br, &net, "bond0", &["ethA", "ethB"]);

        {
            let bond = br.ports[p].bond.as_mut().unwrap();
            bond.hash[0].iface_idx = Some(0);
            bond.hash[0].tx_bytes = 10_000_000;
            // A second, smaller bucket so slave A has something left.
            bond.hash[1].iface_idx = Some(0);
            bond.hash[1].tx_bytes = 1_000_000;
        }
        let old_tag = {
            let bond = br.ports[p].bond.as_mut().unwrap();
            let tag = crate::tag::Tag::from_hash(0xdead);
            bond.hash[0].iface_tag = Some(tag);
            tag
        };

        br.bond_rebalance_port(p);

        let bond = br.ports[p].bond.as_ref().unwrap();
        // The smaller bucket moved (ascending-bytes preference); the big one
        // stayed.
        assert_eq!(bond.hash[1].iface_idx, Some(1));
        assert_eq!(bond.hash[0].iface_idx, Some(0));
        // Decay pass halved everything.
        assert_eq!(bond.hash[0].tx_bytes, 5_000_000);
        assert_eq!(bond.hash[1].tx_bytes, 500_000);
        // Only the migrated bucket changed: bucket 0's tag survived, and
        // bucket 1 got a fresh one.
        assert!(!engine.borrow().was_revalidated(old_tag));
        assert_eq!(bond.hash[0].iface_tag, Some(old_tag));
        assert!(bond.hash[1].iface_tag.is_some());
    }

    // The full failing-slaveless case: all of the load sits in one bucket,
    // the other slave is idle.  The bucket moves despite emptying its old
    // slave, and the decay pass halves its counter on the new one.
    #[test]
    fn test_rebalance_whole_load_to_idle_slave() {
        let (mut br, engine, net) = test_bridge("br0");
        let p = add_port(&mut br, &net, "bond0", &["ethA", "ethB"]);
        let old_tag = br.tags.fresh();
        {
            let bond = br.ports[p].bond.as_mut().unwrap();
            for bucket in 0..BOND_TABLE_SIZE {
                bond.hash[bucket].iface_idx = Some(0);
            }
            bond.hash[0].tx_bytes = 10_000_000;
            bond.hash[0].iface_tag = Some(old_tag);
        }

        br.bond_rebalance_port(p);

        let bond = br.ports[p].bond.as_ref().unwrap();
        assert_eq!(bond.hash[0].iface_idx, Some(1));
        assert_eq!(bond.hash[0].tx_bytes, 5_000_000);
        assert!(engine.borrow().was_revalidated(old_tag));
        assert_ne!(bond.hash[0].iface_tag, Some(old_tag));
    }

    #[test]
    fn test_rebalance_single_bucket_moves_to_empty() {
        let (mut br, engine, net) = test_bridge("br0");
        let p = add_port(&mut br, &net, "bond0", &["ethA", "ethB"]);
        let old_tag = br.tags.fresh();
        {
            let bond = br.ports[p].bond.as_mut().unwrap();
            bond.hash[0].iface_idx = Some(0);
            bond.hash[0].tx_bytes = 10_000_000;
            bond.hash[0].iface_tag = Some(old_tag);
            bond.hash[7].iface_idx = Some(0);
            bond.hash[7].tx_bytes = 10_000_000;
        }

        br.bond_rebalance_port(p);

        let bond = br.ports[p].bond.as_ref().unwrap();
        let moved: Vec<usize> = [0usize, 7]
            .iter()
            .filter(|b| bond.hash[**b].iface_idx == Some(1))
            .copied()
            .collect();
        // Exactly one of the two equal buckets migrated to the idle slave.
        assert_eq!(moved.len(), 1);
        if moved[0] == 0 {
            assert!(engine.borrow().was_revalidated(old_tag));
        }
        assert_eq!(bond.hash[0].tx_bytes, 5_000_000);
        assert_eq!(bond.hash[7].tx_bytes, 5_000_000);
    }

    #[test]
    fn test_rebalance_below_threshold_is_noop() {
        let (mut br, _, net) = test_bridge("br0");
        let p = add_port(&mut br, &net, "bond0", &["ethA", "ethB"]);
        {
            let bond = br.ports[p].bond.as_mut().unwrap();
            bond.hash[0].iface_idx = Some(0);
            bond.hash[0].tx_bytes = 50_000;
            bond.hash[1].iface_idx = Some(0);
            bond.hash[1].tx_bytes = 40_000;
        }

        br.bond_rebalance_port(p);

        let bond = br.ports[p].bond.as_ref().unwrap();
        // Under the absolute threshold: nothing moves, decay still runs.
        assert_eq!(bond.hash[0].iface_idx, Some(0));
        assert_eq!(bond.hash[1].iface_idx, Some(0));
        assert_eq!(bond.hash[0].tx_bytes, 25_000);
    }

    #[test]
    fn test_account_checkpoint_debounce() {
        let (mut br, _, net) = test_bridge("br0");
        let p = add_port(&mut br, &net, "bond0", &["ethA", "ethB"]);
        {
            let bond = br.ports[p].bond.as_mut().unwrap();
            bond.hash[0].iface_idx = Some(0);
            bond.hash[0].tx_bytes = 1 << 20;
        }
        let first_deadline = br.bond_next_rebalance;

        // Too early: nothing happens.
        br.account_checkpoint(first_deadline - 1);
        assert_eq!(
            br.ports[p].bond.as_ref().unwrap().hash[0].tx_bytes,
            1 << 20
        );

        // At the deadline the rebalance (and decay) runs and the timer
        // re-arms.
        br.account_checkpoint(first_deadline);
        assert_eq!(
            br.ports[p].bond.as_ref().unwrap().hash[0].tx_bytes,
            1 << 19
        );
        assert_eq!(
            br.bond_next_rebalance,
            first_deadline + BOND_REBALANCE_INTERVAL_MS
        );
    }

    #[test]
    fn test_migrate_and_set_active() {
        let (mut br, engine, net) = test_bridge("br0");
        let p = add_port(&mut br, &net, "bond0", &["ethA", "ethB"]);

        br.bond_migrate(p, 42, 1);
        let entry = br.ports[p].bond.as_ref().unwrap().hash[42];
        assert_eq!(entry.iface_idx, Some(1));
        assert!(entry.iface_tag.is_some());

        let old_tag = br.ports[p].active_iface_tag;
        assert!(br.bond_set_active_slave(p, 1, 0));
        assert!(engine.borrow().was_revalidated(old_tag));
        assert_eq!(br.ports[p].active_iface, Some(1));
        // Selecting it again reports no change.
        assert!(!br.bond_set_active_slave(p, 1, 0));
    }
}
