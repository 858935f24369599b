//! Consistent hash ring.
//!
//! Every member contributes `vnodes` tokens. A key belongs to the arc that
//! ends at the first token at or after its hash, wrapping past the top of
//! the `u64` space. Adding or removing a member only moves the arcs adjacent
//! to its tokens.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default number of virtual nodes per member.
pub const DEFAULT_VNODES: usize = 64;

/// Hash a key onto the ring (BLAKE3, first 8 bytes little endian).
pub fn hash_key(key: &[u8]) -> u64 {
    let digest = blake3::hash(key);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

/// Token of a member's `replica`-th virtual node.
fn vnode_token(node_id: &str, replica: usize) -> u64 {
    hash_key(format!("{}#{}", node_id, replica).as_bytes())
}

/// Half-open arc `(start, end]` of the ring. `start == end` means the whole
/// ring (single token).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingArc {
    pub start: u64,
    pub end: u64,
}

impl RingArc {
    pub fn contains(&self, point: u64) -> bool {
        if self.start == self.end {
            true
        } else if self.start < self.end {
            point > self.start && point <= self.end
        } else {
            point > self.start || point <= self.end
        }
    }
}

/// Token → member map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRing {
    tokens: BTreeMap<u64, String>,
    vnodes: usize,
}

impl HashRing {
    /// Build a ring over `nodes`.
    ///
    /// Token collisions (astronomically rare) go to the lexically smaller
    /// node id so every process builds the same ring.
    pub fn build<'a>(nodes: impl IntoIterator<Item = &'a str>, vnodes: usize) -> Self {
        let vnodes = vnodes.max(1);
        let mut tokens: BTreeMap<u64, String> = BTreeMap::new();
        for node in nodes {
            for replica in 0..vnodes {
                let token = vnode_token(node, replica);
                match tokens.get(&token) {
                    Some(existing) if existing.as_str() <= node => {}
                    _ => {
                        tokens.insert(token, node.to_string());
                    }
                }
            }
        }
        Self { tokens, vnodes }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn vnodes(&self) -> usize {
        self.vnodes
    }

    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// Token ending the arc that contains `point`.
    pub fn successor(&self, point: u64) -> Option<u64> {
        self.tokens
            .range(point..)
            .next()
            .or_else(|| self.tokens.iter().next())
            .map(|(t, _)| *t)
    }

    /// Token immediately before `token` (wrapping).
    fn predecessor(&self, token: u64) -> Option<u64> {
        self.tokens
            .range(..token)
            .next_back()
            .or_else(|| self.tokens.iter().next_back())
            .map(|(t, _)| *t)
    }

    /// Owner of the arc ending at `token`.
    pub fn owner_of_token(&self, token: u64) -> Option<&str> {
        self.tokens.get(&token).map(String::as_str)
    }

    /// Owner of a ring point.
    pub fn owner_of_point(&self, point: u64) -> Option<(u64, &str)> {
        let token = self.successor(point)?;
        self.owner_of_token(token).map(|owner| (token, owner))
    }

    /// Owner of a key.
    pub fn owner_of_key(&self, key: &str) -> Option<(u64, &str)> {
        self.owner_of_point(hash_key(key.as_bytes()))
    }

    /// The arc ending at `token`.
    pub fn arc(&self, token: u64) -> Option<RingArc> {
        let start = self.predecessor(token)?;
        Some(RingArc { start, end: token })
    }

    /// Iterate over all `(arc, owner)` pairs in token order.
    pub fn arcs(&self) -> impl Iterator<Item = (RingArc, &str)> + '_ {
        self.tokens.iter().filter_map(move |(token, owner)| {
            self.arc(*token).map(|arc| (arc, owner.as_str()))
        })
    }

    /// Tokens of this ring lying strictly inside `arc` (excluding its end).
    pub fn tokens_within(&self, arc: RingArc) -> Vec<u64> {
        if self.tokens.is_empty() {
            return Vec::new();
        }
        if arc.start == arc.end {
            return self.tokens.keys().copied().filter(|t| *t != arc.end).collect();
        }
        self.tokens
            .keys()
            .copied()
            .filter(|t| *t != arc.end && arc.contains(*t))
            .collect()
    }
}
