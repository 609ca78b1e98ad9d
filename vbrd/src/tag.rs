// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Flow-cache invalidation tokens.
//!
//! Every independent reason a cached forwarding decision might become stale
//! owns a `Tag`.  A decision records the tags it depended on; when the state
//! behind a tag changes, the old tag is passed to
//! [`FlowEngine::revalidate`](crate::ofproto::FlowEngine::revalidate) *before*
//! the mutation becomes observable, and the engine reconsiders every flow
//! that depended on it.

use std::collections::BTreeSet;
use std::fmt;

use rand::prelude::*;

/// An opaque 64-bit invalidation token.  Never zero.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tag(u64);

impl Tag {
    /// Build a tag from a precomputed 64-bit value, forcing it non-zero.
    /// Used for the deterministic "unknown binding" tags of the MAC table.
    pub fn from_hash(h: u64) -> Tag {
        Tag(h.max(1))
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "tag:{:016x}", self.0)
    }
}

/// Issues tags.  Each call returns a token distinct from the previous one.
#[derive(Debug, Default)]
pub struct TagAllocator {
    last: u64,
}

impl TagAllocator {
    pub fn new() -> TagAllocator {
        TagAllocator::default()
    }

    /// Return a fresh tag.
    pub fn fresh(&mut self) -> Tag {
        let mut rng = rand::thread_rng();
        loop {
            let t: u64 = rng.gen();
            if t != 0 && t != self.last {
                self.last = t;
                return Tag(t);
            }
        }
    }
}

/// The set of tags one forwarding decision depends on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TagSet(BTreeSet<Tag>);

impl TagSet {
    pub fn new() -> TagSet {
        TagSet::default()
    }

    pub fn insert(&mut self, tag: Tag) {
        self.0.insert(tag);
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.0.contains(&tag)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Tag> + '_ {
        self.0.iter().copied()
    }
}

#[test]
fn test_fresh_tags_are_distinct() {
    let mut alloc = TagAllocator::new();
    let mut seen = BTreeSet::new();
    for _ in 0..1000 {
        assert!(seen.insert(alloc.fresh()));
    }
}

#[test]
fn test_from_hash_never_zero() {
    assert_ne!(Tag::from_hash(0), Tag(0));
    assert_eq!(Tag::from_hash(7), Tag(7));
}
