//! Consistent-hash ring over the live membership
//!
//! Each member contributes a fixed number of virtual nodes; a key is owned by
//! the first R distinct members encountered walking the ring clockwise from
//! the key's hash. The ring is rebuilt wholesale from every membership
//! snapshot, so partial updates are never visible.
//!
//! Hashing is SHA-256 truncated to 64 bits: stable across processes and
//! platforms, so identical snapshots produce identical replica sets on every
//! node.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use super::Member;
use crate::error::Error;

/// Virtual nodes per member. Fixed cluster-wide: all peers must agree for
/// lookups to be consistent.
pub const VIRTUAL_NODES: usize = 20;

/// Consistent-hash view of the current membership.
pub struct HashRing {
    vnodes: usize,
    /// Ring point → index into `members`
    points: BTreeMap<u64, usize>,
    members: Vec<Member>,
}

impl HashRing {
    /// Create an empty ring with the given virtual-node count.
    pub fn new(vnodes: usize) -> Self {
        Self {
            vnodes,
            points: BTreeMap::new(),
            members: Vec::new(),
        }
    }

    /// Replace the membership with a complete snapshot.
    ///
    /// Members are ordered and deduplicated by their canonical string form
    /// before placement, so the result only depends on the set, not on
    /// snapshot ordering.
    pub fn set_members(&mut self, members: &[Member]) {
        let mut members = members.to_vec();
        members.sort_by_key(|m| m.to_string());
        members.dedup();

        self.points.clear();
        for (index, member) in members.iter().enumerate() {
            for vnode in 0..self.vnodes {
                let point = hash(&format!("{}#{}", member, vnode));
                self.points.insert(point, index);
            }
        }
        self.members = members;
    }

    /// The first `n` distinct members clockwise from the key's hash.
    ///
    /// Returns all members when fewer than `n` exist; fails when the ring is
    /// empty. The order is part of the result: repeated lookups between
    /// snapshots are identical.
    pub fn lookup(&self, key: &str, n: usize) -> Result<Vec<Member>, Error> {
        if self.members.is_empty() {
            return Err(Error::NoMembers);
        }
        let want = n.min(self.members.len());
        let start = hash(key);

        let mut owners: Vec<usize> = Vec::with_capacity(want);
        for (_, &index) in self
            .points
            .range(start..)
            .chain(self.points.range(..start))
        {
            if !owners.contains(&index) {
                owners.push(index);
                if owners.len() == want {
                    break;
                }
            }
        }

        Ok(owners
            .into_iter()
            .map(|index| self.members[index].clone())
            .collect())
    }

    /// Number of distinct members on the ring.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the ring has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

fn hash(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}
