// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The forwarding decision.
//!
//! `process_flow` is invoked once per newly seen flow (and again, without a
//! packet, whenever a cached decision is revalidated).  It classifies the
//! VLAN, learns the source MAC, looks up the destination, and synthesizes
//! the datapath action list, recording in a tag set every piece of state
//! the decision depended on.

use slog::debug;
use slog::warn;

use common::network::MacAddr;
use common::network::VLAN_NONE;

use crate::bridge::Bridge;
use crate::tag::TagSet;

const ETH_TYPE_ARP: u16 = 0x0806;
const ARP_OP_REPLY: u8 = 2;

/// NetFlow's "output interface" for flooded flows.
pub const NF_OUT_FLOOD: u16 = u16::MAX;
/// And for dropped flows.
pub const NF_OUT_DROP: u16 = u16::MAX - 2;

/// A parsed flow key, as handed to us by the OpenFlow engine.
#[derive(Clone, Copy, Debug)]
pub struct Flow {
    /// Ingress datapath port number.
    pub in_port: u16,
    pub dl_src: MacAddr,
    pub dl_dst: MacAddr,
    /// 802.1Q VID in host order; `VLAN_NONE` when untagged.
    pub dl_vlan: u16,
    pub dl_type: u16,
    pub nw_proto: u8,
    pub nw_src: u32,
    pub nw_dst: u32,
    pub tp_src: u16,
    pub tp_dst: u16,
}

impl Flow {
    /// A unicast L2 flow with the fields the forwarding path inspects.
    pub fn l2(in_port: u16, dl_src: MacAddr, dl_dst: MacAddr, dl_vlan: u16) -> Flow {
        Flow {
            in_port,
            dl_src,
            dl_dst,
            dl_vlan,
            dl_type: 0x0800,
            nw_proto: 0,
            nw_src: 0,
            nw_dst: 0,
            tp_src: 0,
            tp_dst: 0,
        }
    }
}

/// One datapath action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OdpAction {
    Output(u16),
    SetVlanVid(u16),
    StripVlan,
}

/// Where a decision sends the frame before mirroring fans it out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OutPort {
    /// Send to every port carrying the frame's VLAN.
    Flood,
    Port(usize),
    /// Emit nothing (mirrors may still apply).
    Drop,
}

/// One concrete destination: a datapath port and the VLAN tag the frame
/// carries on the way out (`VLAN_NONE` for untagged).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Dst {
    vlan: u16,
    dp_ifidx: u16,
}

fn dst_is_duplicate(dsts: &[Dst], test: &Dst) -> bool {
    dsts.iter().any(|dst| dst == test)
}

fn is_bcast_arp_reply(flow: &Flow) -> bool {
    flow.dl_type == ETH_TYPE_ARP
        && flow.nw_proto == ARP_OP_REPLY
        && flow.dl_dst.is_broadcast()
}

/// Move every dst whose VLAN equals `vlan` to the front, reducing the
/// number of VLAN transitions emitted.  Not a full sort: flows rarely touch
/// more than two VLANs.
fn partition_dsts(dsts: &mut [Dst], vlan: u16) {
    let mut first = 0;
    let mut last = dsts.len();

    while first != last {
        // Invariants:
        //      - All dsts < first have vlan == `vlan`.
        //      - All dsts >= last have vlan != `vlan`.
        //      - first < last.
        while dsts[first].vlan == vlan {
            first += 1;
            if first == last {
                return;
            }
        }
        while dsts[last - 1].vlan != vlan {
            last -= 1;
            if last == first {
                return;
            }
        }
        last -= 1;
        dsts.swap(first, last);
        first += 1;
    }
}

impl Bridge {
    /// The effective VLAN of a frame, taking both the 802.1Q header and the
    /// ingress port's mode into account.  None means the frame is invalid
    /// for this port and must be dropped.
    pub fn flow_get_vlan(
        &mut self,
        flow: &Flow,
        in_port_idx: usize,
        have_packet: bool,
        now: i64,
    ) -> Option<u16> {
        // A missing 802.1Q header and an explicit tag of 0 both mean
        // VLAN 0.
        let mut vlan = if flow.dl_vlan == VLAN_NONE { 0 } else { flow.dl_vlan };

        let port = &self.ports[in_port_idx];
        match port.vlan.access_vlan() {
            Some(access) => {
                if vlan != 0 {
                    if have_packet && self.rl.vlan_drop.admit(now) {
                        warn!(
                            self.log,
                            "dropping VLAN {vlan} tagged packet received on \
                             port {} configured with implicit VLAN {access}",
                            port.name
                        );
                    }
                    return None;
                }
                vlan = access;
            }
            None => {
                if !port.includes_vlan(vlan) {
                    if have_packet && self.rl.vlan_drop.admit(now) {
                        warn!(
                            self.log,
                            "dropping VLAN {vlan} tagged packet received on \
                             port {} not configured for trunking VLAN {vlan}",
                            port.name
                        );
                    }
                    return None;
                }
            }
        }

        Some(vlan)
    }

    /// Learn the flow's source MAC, revalidating whatever the binding's
    /// previous state was when it changed.
    pub fn update_learning(
        &mut self,
        flow: &Flow,
        vlan: u16,
        in_port_idx: usize,
        now: i64,
    ) {
        let Some(tag) =
            self.ml.learn(flow.dl_src, vlan, in_port_idx, now)
        else {
            return;
        };
        if self.rl.learning.admit(now) {
            debug!(
                self.log,
                "learned that {} is on port {} in VLAN {vlan}",
                flow.dl_src,
                self.ports[in_port_idx].name
            );
        }
        self.engine.revalidate(tag);
    }

    /// Decide what to do with `flow`.
    ///
    /// Appends the resulting datapath actions to `actions` (none at all
    /// means drop), and folds every tag the decision depended on into
    /// `tags`.  `have_packet` is false during flow revalidation.
    ///
    /// Returns true if the actions apply to *every* future packet matching
    /// the flow and may therefore be installed in the flow cache; false if
    /// they only apply to this single packet.
    pub fn process_flow(
        &mut self,
        flow: &Flow,
        have_packet: bool,
        actions: &mut Vec<OdpAction>,
        tags: &mut TagSet,
        nf_output_iface: &mut u16,
        now: i64,
    ) -> bool {
        *nf_output_iface = NF_OUT_DROP;

        let Some((in_port_idx, in_iface_idx)) =
            self.iface_from_dp_ifidx(flow.in_port)
        else {
            // A packet from a port we don't know about: either a recently
            // deleted interface still draining its queue, or something
            // attached to the datapath behind our back.  Drop the flow.
            if have_packet && self.rl.unknown_iface.admit(now) {
                warn!(
                    self.log,
                    "received packet on unknown interface {}", flow.in_port
                );
            }
            return true;
        };

        let Some(vlan) =
            self.flow_get_vlan(flow, in_port_idx, have_packet, now)
        else {
            return true;
        };

        let mut out = OutPort::Drop;
        let mut dropped = false;

        // Frames for reserved L2 multicast addresses are never forwarded.
        if flow.dl_dst.is_reserved() {
            dropped = true;
        } else if self.ports[in_port_idx].is_mirror_output_port {
            if self.rl.misc.admit(now) {
                warn!(
                    self.log,
                    "dropping packet received on port {}, which is reserved \
                     exclusively for mirroring",
                    self.ports[in_port_idx].name
                );
            }
            dropped = true;
        } else if self.ports[in_port_idx].is_bond() {
            // Bond ingress needs care to avoid duplicates.
            if flow.dl_dst.is_multicast() {
                tags.insert(self.ports[in_port_idx].active_iface_tag);
                if self.ports[in_port_idx].active_iface != Some(in_iface_idx)
                {
                    // Only the active slave accepts multicast.
                    dropped = true;
                }
            }
            if !dropped {
                // A source learned on a different port is most likely our
                // own flooded copy reflected back at us.  Broadcast ARP
                // replies are exempt: the host really moved.
                if let Some(learned) = self.ml.lookup(flow.dl_src, vlan) {
                    if learned != in_port_idx && !is_bcast_arp_reply(flow) {
                        dropped = true;
                    }
                }
            }
        }

        if !dropped {
            out = OutPort::Flood;
            // Learn the source MAC, but never from revalidation.
            if have_packet {
                self.update_learning(flow, vlan, in_port_idx, now);
            }

            match self.ml.lookup_tag(flow.dl_dst, vlan, tags) {
                Some(idx) if idx < self.ports.len() => {
                    out = OutPort::Port(idx);
                }
                _ => {
                    if !have_packet && !flow.dl_dst.is_multicast() {
                        // Revalidating with no learning entry: refuse to
                        // install a flood rule.  A real packet may reveal
                        // the correct port, and a cached flood could
                        // blackhole traffic learned from a reflected copy.
                        return false;
                    }
                }
            }

            // Never send a frame back out its input port.
            if out == OutPort::Port(in_port_idx) {
                out = OutPort::Drop;
            }
        }

        self.compose_actions(
            flow,
            vlan,
            in_port_idx,
            out,
            tags,
            actions,
            nf_output_iface,
            now,
        );
        true
    }

    /// One destination on `out_port_idx`, tagged the way that port needs
    /// it: untagged for access ports, the ingress port's implicit VLAN for
    /// access-to-trunk, else the frame's own tag.
    fn set_dst(
        &mut self,
        flow: &Flow,
        in_access_vlan: Option<u16>,
        out_port_idx: usize,
        tags: &mut TagSet,
        now: i64,
    ) -> Option<Dst> {
        let vlan = if self.ports[out_port_idx].vlan.access_vlan().is_some() {
            VLAN_NONE
        } else {
            in_access_vlan.unwrap_or(flow.dl_vlan)
        };
        let dp_ifidx =
            self.choose_output_iface(out_port_idx, flow.dl_src, tags, now)?;
        Some(Dst { vlan, dp_ifidx })
    }

    /// Expand an output choice into the concrete destination list,
    /// including mirror fan-out, and append the corresponding actions.
    #[allow(clippy::too_many_arguments)]
    fn compose_actions(
        &mut self,
        flow: &Flow,
        vlan: u16,
        in_port_idx: usize,
        out: OutPort,
        tags: &mut TagSet,
        actions: &mut Vec<OdpAction>,
        nf_output_iface: &mut u16,
        now: i64,
    ) {
        let mut dsts: Vec<Dst> = Vec::new();
        let mut mirrors = self.ports[in_port_idx].src_mirrors;
        let in_access_vlan = self.ports[in_port_idx].vlan.access_vlan();

        match out {
            OutPort::Flood => {
                for port_idx in 0..self.ports.len() {
                    if port_idx == in_port_idx {
                        continue;
                    }
                    let port = &self.ports[port_idx];
                    if !port.includes_vlan(vlan) || port.is_mirror_output_port
                    {
                        continue;
                    }
                    if let Some(dst) =
                        self.set_dst(flow, in_access_vlan, port_idx, tags, now)
                    {
                        mirrors |= self.ports[port_idx].dst_mirrors;
                        dsts.push(dst);
                    }
                }
                *nf_output_iface = NF_OUT_FLOOD;
            }
            OutPort::Port(port_idx) => {
                if let Some(dst) =
                    self.set_dst(flow, in_access_vlan, port_idx, tags, now)
                {
                    *nf_output_iface = dst.dp_ifidx;
                    mirrors |= self.ports[port_idx].dst_mirrors;
                    dsts.push(dst);
                }
            }
            OutPort::Drop => {}
        }

        // Visit triggered mirrors in bit order.
        while mirrors != 0 {
            let idx = mirrors.trailing_zeros() as usize;
            mirrors &= mirrors - 1;
            let Some((mirror_out, vlan_selected)) = self.mirrors[idx]
                .as_ref()
                .map(|m| {
                    (m.out, m.vlans.is_empty() || m.selects_vlan(vlan))
                })
            else {
                continue;
            };
            if !vlan_selected {
                continue;
            }

            match mirror_out {
                crate::mirror::MirrorOut::Port(out_port_idx) => {
                    if let Some(dst) = self.set_dst(
                        flow,
                        in_access_vlan,
                        out_port_idx,
                        tags,
                        now,
                    ) {
                        if !dst_is_duplicate(&dsts, &dst) {
                            dsts.push(dst);
                        }
                    }
                }
                crate::mirror::MirrorOut::Vlan(out_vlan) => {
                    // RSPAN: replicate onto every port carrying the output
                    // VLAN.  Compare hairpins against the frame's own tag,
                    // from before any implicit tagging.
                    let flow_vlan = if flow.dl_vlan == 0 {
                        VLAN_NONE
                    } else {
                        flow.dl_vlan
                    };
                    for port_idx in 0..self.ports.len() {
                        if !self.ports[port_idx].includes_vlan(out_vlan) {
                            continue;
                        }
                        let Some(mut dst) = self.set_dst(
                            flow,
                            in_access_vlan,
                            port_idx,
                            tags,
                            now,
                        ) else {
                            continue;
                        };
                        if self.ports[port_idx].vlan.access_vlan().is_none() {
                            dst.vlan = out_vlan;
                        }
                        if dst_is_duplicate(&dsts, &dst) {
                            continue;
                        }
                        if port_idx == in_port_idx && dst.vlan == flow_vlan {
                            // Don't send out the input port on the same
                            // VLAN it arrived on.
                            continue;
                        }
                        dsts.push(dst);
                    }
                }
            }
        }

        let flow_vlan = if flow.dl_vlan == 0 { VLAN_NONE } else { flow.dl_vlan };
        partition_dsts(&mut dsts, flow_vlan);

        let mut cur_vlan = flow.dl_vlan;
        for dst in &dsts {
            if dst.vlan != cur_vlan {
                if dst.vlan == VLAN_NONE {
                    actions.push(OdpAction::StripVlan);
                } else {
                    actions.push(OdpAction::SetVlanVid(dst.vlan));
                }
                cur_vlan = dst.vlan;
            }
            actions.push(OdpAction::Output(dst.dp_ifidx));
        }
    }

    /// Accounting feedback from the engine's active flows: keep the
    /// learning table in sync with real traffic, and charge transmitted
    /// bytes to the bond buckets that carried them.
    pub fn account_flow(
        &mut self,
        flow: &Flow,
        actions: &[OdpAction],
        n_bytes: u64,
        now: i64,
    ) {
        if let Some(in_port_idx) = self.port_from_dp_ifidx(flow.in_port) {
            if let Some(vlan) =
                self.flow_get_vlan(flow, in_port_idx, false, now)
            {
                self.update_learning(flow, vlan, in_port_idx, now);
            }
        }

        if !self.has_bonded_ports {
            return;
        }
        for action in actions {
            let OdpAction::Output(dp_ifidx) = action else {
                continue;
            };
            let Some(port_idx) = self.port_from_dp_ifidx(*dp_ifidx) else {
                continue;
            };
            let bucket = crate::bond::bond_hash(flow.dl_src) as usize;
            if let Some(bond) = self.ports[port_idx].bond.as_mut() {
                bond.hash[bucket].tx_bytes += n_bytes;
            }
        }
    }
}
