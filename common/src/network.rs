// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use rand::prelude::*;

/// An EUI-48 MAC address, used for layer-2 addressing.
///
/// The derived ordering is lexicographic over the octets, which matches the
/// "numerically smallest address" comparison used when electing a bridge MAC.
#[derive(
    Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr {
    a: [u8; 6],
}

impl From<[u8; 6]> for MacAddr {
    fn from(a: [u8; 6]) -> Self {
        Self { a }
    }
}

impl MacAddr {
    pub const ZERO: Self = MacAddr {
        a: [0, 0, 0, 0, 0, 0],
    };

    pub const BROADCAST: Self = MacAddr {
        a: [0xff, 0xff, 0xff, 0xff, 0xff, 0xff],
    };

    /// Create a new MAC address from octets in network byte order.
    pub fn new(o0: u8, o1: u8, o2: u8, o3: u8, o4: u8, o5: u8) -> MacAddr {
        MacAddr {
            a: [o0, o1, o2, o3, o4, o5],
        }
    }

    /// Create a new MAC address from a slice of bytes in network byte order.
    ///
    /// # Panics
    ///
    /// Panics if the slice is fewer than 6 octets.
    ///
    /// Note that any further octets are ignored.
    pub fn from_slice(s: &[u8]) -> MacAddr {
        MacAddr::new(s[0], s[1], s[2], s[3], s[4], s[5])
    }

    /// Return the octets in network byte order.
    pub fn octets(self) -> [u8; 6] {
        self.a
    }

    /// Return `true` if the group bit is set (multicast and broadcast
    /// addresses).
    pub fn is_multicast(self) -> bool {
        self.a[0] & 0x01 != 0
    }

    /// Return `true` if this is the all-ones broadcast address.
    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }

    /// Return `true` if the locally-administered bit is set.
    pub fn is_local_admin(self) -> bool {
        self.a[0] & 0x02 != 0
    }

    /// Return `true` if `self` is the null MAC address, all zeros.
    pub fn is_zero(self) -> bool {
        self == Self::ZERO
    }

    /// Return `true` for addresses in the IEEE 802.1D reserved block
    /// 01:80:c2:00:00:00 through 01:80:c2:00:00:0f (STP, pause frames, and
    /// friends), which bridges must not forward.
    pub fn is_reserved(self) -> bool {
        self.a[0] == 0x01
            && self.a[1] == 0x80
            && self.a[2] == 0xc2
            && self.a[3] == 0x00
            && self.a[4] == 0x00
            && self.a[5] & 0xf0 == 0x00
    }

    /// Generate a random, unicast, locally-administered MAC address.
    pub fn random() -> MacAddr {
        let mut rng = rand::thread_rng();
        let mut m = MacAddr { a: [0; 6] };
        for octet in m.a.iter_mut() {
            *octet = rng.gen();
        }
        m.a[0] &= !0x01;
        m.a[0] |= 0x02;
        m
    }
}

#[derive(Error, Debug, Clone)]
pub enum MacError {
    /// Too few octets to be a valid MAC address
    #[error("Too few octets")]
    TooShort,
    /// Too many octets to be a valid MAC address
    #[error("Too many octets")]
    TooLong,
    /// Found an octet with a non-hexadecimal character or invalid separator
    #[error("Invalid octet")]
    InvalidOctet,
}

impl FromStr for MacAddr {
    type Err = MacError;

    fn from_str(s: &str) -> Result<Self, MacError> {
        let v: Vec<&str> = s.split(':').collect();

        match v.len().cmp(&6) {
            std::cmp::Ordering::Less => Err(MacError::TooShort),
            std::cmp::Ordering::Greater => Err(MacError::TooLong),
            std::cmp::Ordering::Equal => {
                let mut m = MacAddr { a: [0u8; 6] };
                for (i, octet) in v.iter().enumerate() {
                    m.a[i] = u8::from_str_radix(octet, 16)
                        .map_err(|_| MacError::InvalidOctet)?;
                }
                Ok(m)
            }
        }
    }
}

impl TryFrom<String> for MacAddr {
    type Error = MacError;

    fn try_from(s: String) -> Result<Self, MacError> {
        s.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> String {
        mac.to_string()
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.a[0], self.a[1], self.a[2], self.a[3], self.a[4], self.a[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.a[0], self.a[1], self.a[2], self.a[3], self.a[4], self.a[5]
        )
    }
}

impl From<MacAddr> for [u8; 6] {
    fn from(mac: MacAddr) -> [u8; 6] {
        mac.a
    }
}

impl From<MacAddr> for u64 {
    fn from(mac: MacAddr) -> u64 {
        ((mac.a[0] as u64) << 40)
            | ((mac.a[1] as u64) << 32)
            | ((mac.a[2] as u64) << 24)
            | ((mac.a[3] as u64) << 16)
            | ((mac.a[4] as u64) << 8)
            | (mac.a[5] as u64)
    }
}

impl From<&MacAddr> for u64 {
    fn from(mac: &MacAddr) -> u64 {
        From::from(*mac)
    }
}

impl From<u64> for MacAddr {
    fn from(x: u64) -> Self {
        MacAddr {
            a: [
                ((x >> 40) & 0xff) as u8,
                ((x >> 32) & 0xff) as u8,
                ((x >> 24) & 0xff) as u8,
                ((x >> 16) & 0xff) as u8,
                ((x >> 8) & 0xff) as u8,
                (x & 0xff) as u8,
            ],
        }
    }
}

/// Highest valid 802.1Q VLAN ID.
pub const VLAN_MAX: u16 = 4095;

/// Sentinel meaning "no 802.1Q tag at all".
pub const VLAN_NONE: u16 = 0xffff;

#[derive(Error, Debug, Clone)]
pub enum VlanError {
    /// Not a valid VLAN ID
    #[error("Invalid VLAN tag: {}", .0)]
    InvalidVlan(u16),
}

pub fn validate_vlan(id: impl Into<u16>) -> Result<(), VlanError> {
    let id: u16 = id.into();
    if id > VLAN_MAX {
        Err(VlanError::InvalidVlan(id))
    } else {
        Ok(())
    }
}

const VLAN_SET_WORDS: usize = (VLAN_MAX as usize + 1) / 64;

/// A set of VLAN IDs, as a fixed 4096-bit bitmap.  Used for trunk port
/// membership and for the bridge's flood-VLAN set.
#[derive(Clone, PartialEq, Eq)]
pub struct VlanSet {
    bits: [u64; VLAN_SET_WORDS],
}

impl Default for VlanSet {
    fn default() -> Self {
        Self::new()
    }
}

impl VlanSet {
    /// An empty set.
    pub fn new() -> Self {
        VlanSet {
            bits: [0; VLAN_SET_WORDS],
        }
    }

    /// The set containing every valid VLAN ID.
    pub fn full() -> Self {
        VlanSet {
            bits: [u64::MAX; VLAN_SET_WORDS],
        }
    }

    pub fn insert(&mut self, vlan: u16) {
        debug_assert!(vlan <= VLAN_MAX);
        self.bits[vlan as usize / 64] |= 1 << (vlan % 64);
    }

    pub fn contains(&self, vlan: u16) -> bool {
        vlan <= VLAN_MAX
            && self.bits[vlan as usize / 64] & (1 << (vlan % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|w| *w == 0)
    }
}

impl fmt::Debug for VlanSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut set = f.debug_set();
        for vlan in 0..=VLAN_MAX {
            if self.contains(vlan) {
                set.entry(&vlan);
            }
        }
        set.finish()
    }
}

impl FromIterator<u16> for VlanSet {
    fn from_iter<I: IntoIterator<Item = u16>>(iter: I) -> Self {
        let mut set = VlanSet::new();
        for vlan in iter {
            set.insert(vlan);
        }
        set
    }
}

/// Parse a pinned datapath ID: up to 16 hex digits, non-zero.
pub fn parse_dpid(s: &str) -> Option<u64> {
    if s.is_empty() || s.len() > 16 {
        return None;
    }
    match u64::from_str_radix(s, 16) {
        Ok(0) | Err(_) => None,
        Ok(dpid) => Some(dpid),
    }
}

/// Format a datapath ID the way it is persisted: lower-case hex, at least 12
/// digits.
pub fn format_dpid(dpid: u64) -> String {
    format!("{dpid:012x}")
}

#[cfg(test)]
mod tests {
    use super::MacAddr;
    use super::VlanSet;

    #[test]
    fn test_into() {
        let a = MacAddr::new(0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc);
        let u: u64 = (&a).into();
        assert_eq!(u, 0x123456789abc);
    }

    #[test]
    fn test_parse_display() {
        let a: MacAddr = "00:16:3e:07:a2:ff".parse().unwrap();
        assert_eq!(a, MacAddr::new(0x00, 0x16, 0x3e, 0x07, 0xa2, 0xff));
        assert_eq!(a.to_string(), "00:16:3e:07:a2:ff");
        assert!("00:16:3e:07:a2".parse::<MacAddr>().is_err());
        assert!("00:16:3e:07:a2:ff:01".parse::<MacAddr>().is_err());
        assert!("00:16:3e:07:a2:zz".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_predicates() {
        assert!(MacAddr::BROADCAST.is_multicast());
        assert!(MacAddr::BROADCAST.is_broadcast());
        assert!(MacAddr::ZERO.is_zero());
        assert!(!MacAddr::ZERO.is_multicast());

        let stp = MacAddr::new(0x01, 0x80, 0xc2, 0x00, 0x00, 0x00);
        assert!(stp.is_reserved());
        assert!(stp.is_multicast());
        let pause = MacAddr::new(0x01, 0x80, 0xc2, 0x00, 0x00, 0x01);
        assert!(pause.is_reserved());
        let not_reserved = MacAddr::new(0x01, 0x80, 0xc2, 0x00, 0x00, 0x10);
        assert!(!not_reserved.is_reserved());

        let local = MacAddr::new(0x02, 0x00, 0x00, 0x00, 0x00, 0x01);
        assert!(local.is_local_admin());

        let random = MacAddr::random();
        assert!(!random.is_multicast());
        assert!(random.is_local_admin());
    }

    #[test]
    fn test_ordering() {
        let small = MacAddr::new(0x00, 0x01, 0x00, 0x00, 0x00, 0x00);
        let big = MacAddr::new(0x00, 0x02, 0x00, 0x00, 0x00, 0x00);
        assert!(small < big);
        assert_eq!(std::cmp::min(small, big), small);
    }

    #[test]
    fn test_vlan_set() {
        let mut set = VlanSet::new();
        assert!(set.is_empty());
        set.insert(0);
        set.insert(10);
        set.insert(4095);
        assert!(set.contains(0));
        assert!(set.contains(10));
        assert!(set.contains(4095));
        assert!(!set.contains(11));
        assert!(!set.contains(super::VLAN_NONE));

        let full = VlanSet::full();
        for vlan in [0u16, 1, 100, 4095] {
            assert!(full.contains(vlan));
        }

        let from_iter: VlanSet = [10u16, 20].into_iter().collect();
        assert!(from_iter.contains(10) && from_iter.contains(20));
        assert_ne!(from_iter, set);
    }

    #[test]
    fn test_dpid() {
        assert_eq!(super::parse_dpid("0000123456789abc"), Some(0x123456789abc));
        assert_eq!(super::parse_dpid("123456789abc"), Some(0x123456789abc));
        assert_eq!(super::parse_dpid(""), None);
        assert_eq!(super::parse_dpid("0"), None);
        assert_eq!(super::parse_dpid("00001234567890abcd"), None);
        assert_eq!(super::format_dpid(0x123456789abc), "123456789abc");
    }
}
