//! Versioned ring snapshots.
//!
//! The membership log is an ordered sequence of [`RingSnapshot`]s. Each
//! commit applies one [`MembershipChange`] to the previous snapshot and
//! carries the epoch of every arc forward when the arc kept its owner.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use ts_rs::TS;

use super::ring::{HashRing, hash_key};
use crate::error::{Result, ScrivenerError};

/// A cluster member and the address clients reach it at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct NodeInfo {
    pub node_id: String,
    /// `host:port` advertised to clients
    pub addr: String,
}

impl NodeInfo {
    pub fn new(node_id: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            addr: addr.into(),
        }
    }
}

/// What a membership commit changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MembershipChange {
    /// The empty ring every log starts from
    Genesis,
    Join { node: NodeInfo },
    /// Graceful departure
    Leave { node_id: String },
    /// Removed by failure detection
    Expire { node_id: String },
}

/// Which node owns a document, under which epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct OwnershipRecord {
    pub doc_id: String,
    pub node_id: String,
    /// Fencing token; strictly increases whenever the document's arc changes
    /// hands
    pub epoch: u64,
    /// Ring snapshot the record was read from
    pub membership_version: u64,
}

/// One entry of the membership log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingSnapshot {
    pub version: u64,
    pub change: MembershipChange,
    pub nodes: BTreeMap<String, NodeInfo>,
    ring: HashRing,
    /// Epoch of the arc ending at each token
    epochs: BTreeMap<u64, u64>,
    /// Commit time (Unix milliseconds)
    pub committed_at: i64,
}

impl RingSnapshot {
    /// Version 0: no members.
    pub fn genesis(vnodes: usize) -> Self {
        Self {
            version: 0,
            change: MembershipChange::Genesis,
            nodes: BTreeMap::new(),
            ring: HashRing::build(std::iter::empty::<&str>(), vnodes),
            epochs: BTreeMap::new(),
            committed_at: 0,
        }
    }

    pub fn ring(&self) -> &HashRing {
        &self.ring
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeInfo> {
        self.nodes.get(node_id)
    }

    pub fn contains_node(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Whether applying `change` would alter anything.
    pub fn changes_anything(&self, change: &MembershipChange) -> bool {
        match change {
            MembershipChange::Genesis => false,
            MembershipChange::Join { node } => self.nodes.get(&node.node_id) != Some(node),
            MembershipChange::Leave { node_id } | MembershipChange::Expire { node_id } => {
                self.nodes.contains_key(node_id)
            }
        }
    }

    /// Build the next snapshot of the log.
    pub fn apply(&self, change: MembershipChange, committed_at: i64) -> Result<RingSnapshot> {
        let mut nodes = self.nodes.clone();
        match &change {
            MembershipChange::Genesis => {
                return Err(ScrivenerError::MalformedOp(
                    "genesis cannot be committed".to_string(),
                ));
            }
            MembershipChange::Join { node } => {
                nodes.insert(node.node_id.clone(), node.clone());
            }
            MembershipChange::Leave { node_id } | MembershipChange::Expire { node_id } => {
                if nodes.remove(node_id).is_none() {
                    return Err(ScrivenerError::UnknownNode(node_id.clone()));
                }
            }
        }

        let version = self.version + 1;
        let ring = HashRing::build(nodes.keys().map(String::as_str), self.ring.vnodes());
        let epochs = self.carry_epochs(&ring, version);

        Ok(RingSnapshot {
            version,
            change,
            nodes,
            ring,
            epochs,
            committed_at,
        })
    }

    /// Epochs for `next`, committed at `version`.
    ///
    /// A new arc keeps the previous epoch only when every previous arc it
    /// overlaps had its owner and one shared epoch.
    fn carry_epochs(&self, next: &HashRing, version: u64) -> BTreeMap<u64, u64> {
        let mut epochs = BTreeMap::new();
        for (arc, owner) in next.arcs() {
            let mut overlapped = self.ring.tokens_within(arc);
            overlapped.extend(self.ring.successor(arc.end));

            let mut carried: Option<u64> = None;
            let mut keep = !overlapped.is_empty();
            for token in overlapped {
                let prev_owner = self.ring.owner_of_token(token);
                let prev_epoch = self.epochs.get(&token).copied();
                match (prev_owner, prev_epoch) {
                    (Some(o), Some(e)) if o == owner && carried.is_none_or(|c| c == e) => {
                        carried = Some(e);
                    }
                    _ => {
                        keep = false;
                        break;
                    }
                }
            }

            let epoch = match carried {
                Some(e) if keep => e,
                _ => version,
            };
            epochs.insert(arc.end, epoch);
        }
        epochs
    }

    /// Owner and epoch of a document under this snapshot.
    pub fn record(&self, doc_id: &str) -> Option<OwnershipRecord> {
        let (token, owner) = self.ring.owner_of_point(hash_key(doc_id.as_bytes()))?;
        let epoch = self.epochs.get(&token).copied().unwrap_or(self.version);
        Some(OwnershipRecord {
            doc_id: doc_id.to_string(),
            node_id: owner.to_string(),
            epoch,
            membership_version: self.version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join(snap: &RingSnapshot, id: &str) -> RingSnapshot {
        snap.apply(
            MembershipChange::Join {
                node: NodeInfo::new(id, format!("{id}:4040")),
            },
            0,
        )
        .unwrap()
    }

    fn docs() -> Vec<String> {
        (0..500).map(|i| format!("doc-{i}")).collect()
    }

    #[test]
    fn test_empty_ring_has_no_records() {
        let snap = RingSnapshot::genesis(8);
        assert!(snap.record("doc").is_none());
    }

    #[test]
    fn test_first_member_owns_everything_at_its_version() {
        let snap = join(&RingSnapshot::genesis(8), "a");
        assert_eq!(snap.version, 1);
        for doc in docs() {
            let rec = snap.record(&doc).unwrap();
            assert_eq!(rec.node_id, "a");
            assert_eq!(rec.epoch, 1);
            assert_eq!(rec.membership_version, 1);
        }
    }

    #[test]
    fn test_join_bumps_epochs_only_for_moved_documents() {
        let one = join(&RingSnapshot::genesis(16), "a");
        let two = join(&one, "b");
        let three = join(&two, "c");

        for doc in docs() {
            let before = two.record(&doc).unwrap();
            let after = three.record(&doc).unwrap();
            if after.node_id != before.node_id {
                assert_eq!(after.node_id, "c");
                assert_eq!(after.epoch, 3);
            }
            assert!(after.epoch >= before.epoch);
        }
    }

    #[test]
    fn test_unaffected_arcs_keep_epoch() {
        let one = join(&RingSnapshot::genesis(16), "a");
        let two = join(&one, "b");
        let three = join(&two, "c");

        let kept = docs()
            .iter()
            .filter(|doc| {
                let before = two.record(doc).unwrap();
                let after = three.record(doc).unwrap();
                before == OwnershipRecord {
                    membership_version: 2,
                    ..after
                }
            })
            .count();
        assert!(kept > 0);
    }

    #[test]
    fn test_leave_reassigns_with_new_epoch() {
        let one = join(&RingSnapshot::genesis(16), "a");
        let two = join(&one, "b");
        let three = two
            .apply(
                MembershipChange::Leave {
                    node_id: "b".into(),
                },
                0,
            )
            .unwrap();

        for doc in docs() {
            let before = two.record(&doc).unwrap();
            let after = three.record(&doc).unwrap();
            assert_eq!(after.node_id, "a");
            if before.node_id == "b" {
                assert_eq!(after.epoch, 3);
            }
        }
    }

    #[test]
    fn test_rejoin_never_reuses_an_epoch() {
        let one = join(&RingSnapshot::genesis(16), "a");
        let two = join(&one, "b");
        let three = two
            .apply(
                MembershipChange::Expire {
                    node_id: "b".into(),
                },
                0,
            )
            .unwrap();
        let four = join(&three, "b");

        for doc in docs() {
            let at_two = two.record(&doc).unwrap();
            let at_four = four.record(&doc).unwrap();
            if at_four.node_id == "b" {
                assert_eq!(at_two.node_id, "b");
                assert!(at_four.epoch > at_two.epoch);
            }
        }
    }

    #[test]
    fn test_readvertise_keeps_every_epoch() {
        let one = join(&RingSnapshot::genesis(16), "a");
        let two = join(&one, "b");
        let moved = two
            .apply(
                MembershipChange::Join {
                    node: NodeInfo::new("b", "elsewhere:4040"),
                },
                0,
            )
            .unwrap();

        for doc in docs() {
            assert_eq!(two.record(&doc).unwrap().epoch, moved.record(&doc).unwrap().epoch);
        }
        assert_eq!(moved.node("b").unwrap().addr, "elsewhere:4040");
    }

    #[test]
    fn test_unknown_leave_rejected() {
        let snap = join(&RingSnapshot::genesis(8), "a");
        let err = snap
            .apply(
                MembershipChange::Leave {
                    node_id: "zzz".into(),
                },
                0,
            )
            .unwrap_err();
        assert!(matches!(err, ScrivenerError::UnknownNode(_)));
        assert!(!snap.changes_anything(&MembershipChange::Leave {
            node_id: "zzz".into()
        }));
    }

    #[test]
    fn test_snapshot_json_roundtrip() {
        let snap = join(&join(&RingSnapshot::genesis(4), "a"), "b");
        let json = serde_json::to_string(&snap).unwrap();
        let back: RingSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);
    }
}
