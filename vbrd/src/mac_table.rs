// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The MAC learning table: (MAC, VLAN) → bridge port index.
//!
//! Entries age out after [`MAC_ENTRY_IDLE_TIME_MS`] without traffic and are
//! kept in LRU order.  Every entry carries a tag, and every *absent* binding
//! has a deterministic tag derived from (MAC, VLAN), so a forwarding decision
//! made while a destination was unknown still gets revalidated when that
//! destination is finally learned.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::Hasher;

use common::network::MacAddr;
use common::network::VlanSet;
use rand::prelude::*;

use crate::tag::Tag;
use crate::tag::TagAllocator;
use crate::tag::TagSet;

/// Idle time after which a learned entry expires.
pub const MAC_ENTRY_IDLE_TIME_MS: i64 = 60_000;

/// Cap on the number of learned entries; beyond it the least recently used
/// entry is evicted.
const MAC_MAX: usize = 2048;

#[derive(Debug)]
pub struct MacEntry {
    pub mac: MacAddr,
    pub vlan: u16,
    pub port_idx: usize,
    pub tag: Tag,
    expires: i64,
}

impl MacEntry {
    /// Seconds since this entry was last refreshed.
    pub fn age_secs(&self, now: i64) -> i64 {
        ((now - (self.expires - MAC_ENTRY_IDLE_TIME_MS)) / 1000).max(0)
    }
}

type Key = (u64, u16);

pub struct MacTable {
    entries: BTreeMap<Key, MacEntry>,
    /// Keys in LRU order; front is the least recently used.
    lru: Vec<Key>,
    /// VLANs on which learning is disabled and all traffic floods (RSPAN).
    flood_vlans: Option<VlanSet>,
    tags: TagAllocator,
    secret: u64,
}

impl Default for MacTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MacTable {
    pub fn new() -> MacTable {
        MacTable {
            entries: BTreeMap::new(),
            lru: Vec::new(),
            flood_vlans: None,
            tags: TagAllocator::new(),
            secret: rand::thread_rng().gen(),
        }
    }

    fn key(mac: MacAddr, vlan: u16) -> Key {
        (mac.into(), vlan)
    }

    fn is_flood_vlan(&self, vlan: u16) -> bool {
        self.flood_vlans
            .as_ref()
            .map(|set| set.contains(vlan))
            .unwrap_or(false)
    }

    /// The tag representing "no binding for (mac, vlan)".  Deterministic, so
    /// the same tag a miss folded into its dependency set is the one a later
    /// learn returns for revalidation.
    fn unknown_tag(&self, mac: MacAddr, vlan: u16) -> Tag {
        let mut hasher = DefaultHasher::new();
        hasher.write_u64(self.secret);
        hasher.write_u64(mac.into());
        hasher.write_u16(vlan);
        Tag::from_hash(hasher.finish())
    }

    fn touch(&mut self, key: Key, now: i64) {
        if let Some(pos) = self.lru.iter().position(|k| *k == key) {
            self.lru.remove(pos);
        }
        self.lru.push(key);
        if let Some(e) = self.entries.get_mut(&key) {
            e.expires = now + MAC_ENTRY_IDLE_TIME_MS;
        }
    }

    /// Record that `mac` was seen on `port_idx` in `vlan`.
    ///
    /// Returns `Some(tag)` when the binding was added or moved; the tag
    /// identifies the binding's previous state (the old entry's tag on a
    /// move, the deterministic unknown tag on a fresh learn) so the caller
    /// can revalidate dependent flows.  Returns `None` when nothing changed,
    /// when `mac` is multicast, or when learning is disabled on `vlan`.
    pub fn learn(
        &mut self,
        mac: MacAddr,
        vlan: u16,
        port_idx: usize,
        now: i64,
    ) -> Option<Tag> {
        if mac.is_multicast() || self.is_flood_vlan(vlan) {
            return None;
        }

        let key = Self::key(mac, vlan);
        if self.entries.contains_key(&key) {
            self.touch(key, now);
            let fresh = {
                let e = self.entries.get(&key).unwrap();
                (e.port_idx != port_idx).then(|| self.tags.fresh())
            };
            let e = self.entries.get_mut(&key).unwrap();
            match fresh {
                None => None,
                Some(tag) => {
                    let old = e.tag;
                    e.port_idx = port_idx;
                    e.tag = tag;
                    Some(old)
                }
            }
        } else {
            if self.entries.len() >= MAC_MAX {
                let oldest = self.lru.remove(0);
                self.entries.remove(&oldest);
            }
            let entry = MacEntry {
                mac,
                vlan,
                port_idx,
                tag: self.tags.fresh(),
                expires: now + MAC_ENTRY_IDLE_TIME_MS,
            };
            self.entries.insert(key, entry);
            self.lru.push(key);
            Some(self.unknown_tag(mac, vlan))
        }
    }

    /// Look up the learned port for (mac, vlan).
    pub fn lookup(&self, mac: MacAddr, vlan: u16) -> Option<usize> {
        if self.is_flood_vlan(vlan) {
            return None;
        }
        self.entries
            .get(&Self::key(mac, vlan))
            .map(|e| e.port_idx)
    }

    /// Like [`MacTable::lookup`], but also folds the binding's tag into
    /// `tags`: the entry's tag on a hit, the deterministic unknown tag on a
    /// miss.  A decision based on "not learned yet" thereby depends on the
    /// future learn.
    pub fn lookup_tag(
        &self,
        mac: MacAddr,
        vlan: u16,
        tags: &mut TagSet,
    ) -> Option<usize> {
        if self.is_flood_vlan(vlan) {
            return None;
        }
        match self.entries.get(&Self::key(mac, vlan)) {
            Some(e) => {
                tags.insert(e.tag);
                Some(e.port_idx)
            }
            None => {
                tags.insert(self.unknown_tag(mac, vlan));
                None
            }
        }
    }

    /// Drop every learned entry.
    pub fn flush(&mut self) {
        self.entries.clear();
        self.lru.clear();
    }

    /// Expire idle entries, reporting each expired entry's tag for
    /// revalidation.
    pub fn run(&mut self, now: i64, revalidate: &mut dyn FnMut(Tag)) {
        while let Some(key) = self.lru.first().copied() {
            let expired = self
                .entries
                .get(&key)
                .map(|e| e.expires <= now)
                .unwrap_or(true);
            if !expired {
                break;
            }
            self.lru.remove(0);
            if let Some(e) = self.entries.remove(&key) {
                revalidate(e.tag);
            }
        }
    }

    /// Deadline of the next expiry, for the caller's `wait()` step.
    pub fn next_expiration(&self) -> Option<i64> {
        self.lru
            .first()
            .and_then(|key| self.entries.get(key))
            .map(|e| e.expires)
    }

    /// Replace the set of flood VLANs.  Returns true if the set changed (the
    /// caller must flush cached flows in that case).
    pub fn set_flood_vlans(&mut self, vlans: Option<VlanSet>) -> bool {
        if self.flood_vlans == vlans {
            false
        } else {
            self.flood_vlans = vlans;
            true
        }
    }

    /// All entries, least recently used first.
    pub fn entries_lru(&self) -> impl Iterator<Item = &MacEntry> {
        self.lru.iter().filter_map(|key| self.entries.get(key))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(last: u8) -> MacAddr {
        MacAddr::new(0x00, 0x16, 0x3e, 0x00, 0x00, last)
    }

    #[test]
    fn test_learn_lookup() {
        let mut ml = MacTable::new();
        assert_eq!(ml.lookup(mac(1), 10), None);

        assert!(ml.learn(mac(1), 10, 3, 0).is_some());
        assert_eq!(ml.lookup(mac(1), 10), Some(3));
        // Same binding again: no change, no tag.
        assert_eq!(ml.learn(mac(1), 10, 3, 1), None);
        // Same MAC, different VLAN: distinct binding.
        assert_eq!(ml.lookup(mac(1), 20), None);
    }

    #[test]
    fn test_move_returns_old_tag() {
        let mut ml = MacTable::new();
        ml.learn(mac(1), 10, 3, 0);
        let mut tags = TagSet::new();
        ml.lookup_tag(mac(1), 10, &mut tags);

        let moved = ml.learn(mac(1), 10, 4, 1).unwrap();
        // The tag returned by the move is the one earlier lookups depended on.
        assert!(tags.contains(moved));
        assert_eq!(ml.lookup(mac(1), 10), Some(4));
    }

    #[test]
    fn test_miss_tag_matches_learn_tag() {
        let mut ml = MacTable::new();
        let mut tags = TagSet::new();
        assert_eq!(ml.lookup_tag(mac(9), 10, &mut tags), None);
        assert!(!tags.is_empty());

        // A decision that flooded because (mac, vlan) was unknown depends on
        // exactly the tag the first learn hands back.
        let learned = ml.learn(mac(9), 10, 0, 0).unwrap();
        assert!(tags.contains(learned));
    }

    #[test]
    fn test_multicast_not_learned() {
        let mut ml = MacTable::new();
        assert_eq!(ml.learn(MacAddr::BROADCAST, 10, 0, 0), None);
        assert!(ml.is_empty());
    }

    #[test]
    fn test_expiry() {
        let mut ml = MacTable::new();
        ml.learn(mac(1), 10, 0, 0);
        ml.learn(mac(2), 10, 1, 30_000);
        assert_eq!(ml.next_expiration(), Some(MAC_ENTRY_IDLE_TIME_MS));

        let mut revalidated = Vec::new();
        ml.run(MAC_ENTRY_IDLE_TIME_MS, &mut |t| revalidated.push(t));
        assert_eq!(revalidated.len(), 1);
        assert_eq!(ml.lookup(mac(1), 10), None);
        assert_eq!(ml.lookup(mac(2), 10), Some(1));

        // Traffic refreshes the survivor.
        ml.learn(mac(2), 10, 1, 60_000);
        ml.run(90_000, &mut |_| panic!("refreshed entry expired"));
        assert_eq!(ml.lookup(mac(2), 10), Some(1));
    }

    #[test]
    fn test_flood_vlans_disable_learning() {
        let mut ml = MacTable::new();
        ml.learn(mac(1), 10, 0, 0);

        let rspan: VlanSet = [10u16].into_iter().collect();
        assert!(ml.set_flood_vlans(Some(rspan.clone())));
        assert!(!ml.set_flood_vlans(Some(rspan)));

        // Existing entries on the flood VLAN are masked and new ones refused.
        assert_eq!(ml.lookup(mac(1), 10), None);
        assert_eq!(ml.learn(mac(2), 10, 1, 0), None);
        let mut tags = TagSet::new();
        assert_eq!(ml.lookup_tag(mac(2), 10, &mut tags), None);
        assert!(tags.is_empty());

        // Other VLANs still learn.
        assert!(ml.learn(mac(2), 20, 1, 0).is_some());

        assert!(ml.set_flood_vlans(None));
        assert_eq!(ml.lookup(mac(1), 10), Some(0));
    }

    #[test]
    fn test_lru_eviction() {
        let mut ml = MacTable::new();
        for i in 0..MAC_MAX {
            let m = MacAddr::from(0x0016_3e00_0000u64 + i as u64);
            ml.learn(m, 1, 0, i as i64);
        }
        assert_eq!(ml.len(), MAC_MAX);

        // Refresh the oldest so the second-oldest is the victim.
        ml.learn(MacAddr::from(0x0016_3e00_0000u64), 1, 0, 1_000_000);
        ml.learn(mac(0xff), 2, 0, 1_000_001);
        assert_eq!(ml.len(), MAC_MAX);
        assert_eq!(ml.lookup(MacAddr::from(0x0016_3e00_0000u64), 1), Some(0));
        assert_eq!(ml.lookup(MacAddr::from(0x0016_3e00_0001u64), 1), None);
    }

    #[test]
    fn test_age() {
        let mut ml = MacTable::new();
        ml.learn(mac(1), 10, 0, 10_000);
        let e = ml.entries_lru().next().unwrap();
        assert_eq!(e.age_secs(10_000), 0);
        assert_eq!(e.age_secs(13_500), 3);
    }
}
