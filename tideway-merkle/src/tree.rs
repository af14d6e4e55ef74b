use crate::node::{MerkleNode, Prefix, SlotState, MAX_LEVELS};
use std::collections::BTreeSet;
use tideway_base::{Id, ObjectType};
use tracing::trace;

enum Found {
    Missing,
    Empty,
    SameLeaf(SlotState),
    OtherLeaf(Id, bool),
    Subtree,
}

/// An in-memory trie over one object type. Build it by inserting every
/// local id, then call [`MerkleTable::recompute_codes`] once; only then
/// are the subtree slots and the root fingerprint meaningful.
#[derive(Clone, Debug)]
pub struct MerkleTable {
    ty: ObjectType,
    nodes: std::collections::BTreeMap<(usize, Prefix), MerkleNode>,
}

impl MerkleTable {
    /// A new table holding an empty root, so refinement always has a
    /// root node to offer even for an empty set.
    pub fn new(ty: ObjectType) -> MerkleTable {
        let mut nodes = std::collections::BTreeMap::new();
        nodes.insert((0, Prefix::root()), MerkleNode::root(ty));
        MerkleTable { ty, nodes }
    }

    pub fn ty(&self) -> ObjectType {
        self.ty
    }

    pub fn node(&self, level: usize, prefix: &Prefix) -> Option<&MerkleNode> {
        self.nodes.get(&(level, prefix.clone()))
    }

    pub fn root(&self) -> &MerkleNode {
        self.nodes
            .get(&(0, Prefix::root()))
            .expect("table always holds a root")
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root().is_empty()
    }

    /// Release the node storage once refinement is finished with it.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.nodes
            .insert((0, Prefix::root()), MerkleNode::root(self.ty));
    }

    /// Insert an id, pushing leaf collisions down into fresh subtrees.
    /// Re-inserting an existing id only flips its liveness.
    pub fn insert(&mut self, leaf: Id, live: bool) {
        self.insert_at(leaf, live, 0);
    }

    fn insert_at(&mut self, leaf: Id, live: bool, level: usize) -> bool {
        assert!(level < MAX_LEVELS, "distinct ids differ within {} nibbles", MAX_LEVELS);
        let prefix = Prefix::of_id(&leaf, level);
        let slot = leaf.nibble(level);
        let leaf_state = if live {
            SlotState::LiveLeaf
        } else {
            SlotState::DeadLeaf
        };

        let found = match self.nodes.get(&(level, prefix.clone())) {
            None => Found::Missing,
            Some(node) => match node.slot_state(slot) {
                SlotState::Empty => Found::Empty,
                SlotState::Subtree => Found::Subtree,
                st if node.slot_id(slot) == leaf => Found::SameLeaf(st),
                st => Found::OtherLeaf(node.slot_id(slot), st == SlotState::LiveLeaf),
            },
        };

        match found {
            Found::Missing => {
                trace!(ty = %self.ty, level, %prefix, slot, "new node for {}", leaf);
                let mut node = MerkleNode::new(self.ty, level, prefix.clone());
                node.total_leaves = 1;
                node.set_slot(slot, leaf_state, leaf);
                self.nodes.insert((level, prefix), node);
                true
            }
            Found::Empty => {
                let node = self.node_mut(level, &prefix);
                node.total_leaves += 1;
                node.set_slot(slot, leaf_state, leaf);
                true
            }
            Found::SameLeaf(st) => {
                if st != leaf_state {
                    trace!(ty = %self.ty, level, slot, "flipping liveness of {}", leaf);
                    self.node_mut(level, &prefix).set_slot(slot, leaf_state, leaf);
                }
                false
            }
            Found::OtherLeaf(existing, existing_live) => {
                // Both leaves move one level down; the slot becomes a
                // subtree whose code recompute_codes will fill in.
                let node = self.node_mut(level, &prefix);
                node.total_leaves += 1;
                node.set_slot(slot, SlotState::Subtree, Id::ZERO);
                self.insert_at(existing, existing_live, level + 1);
                self.insert_at(leaf, live, level + 1);
                true
            }
            Found::Subtree => {
                let added = self.insert_at(leaf, live, level + 1);
                if added {
                    self.node_mut(level, &prefix).total_leaves += 1;
                }
                added
            }
        }
    }

    fn node_mut(&mut self, level: usize, prefix: &Prefix) -> &mut MerkleNode {
        self.nodes
            .get_mut(&(level, prefix.clone()))
            .expect("node present on traversed path")
    }

    /// Walk the trie bottom-up, refreshing every subtree slot with the
    /// hash of its child's serialized form. Returns the root code: the
    /// authoritative fingerprint of the whole set.
    pub fn recompute_codes(&mut self) -> Id {
        self.recompute_at(0, Prefix::root())
    }

    fn recompute_at(&mut self, level: usize, prefix: Prefix) -> Id {
        let subtree_slots: Vec<usize> = {
            let node = self
                .nodes
                .get(&(level, prefix.clone()))
                .expect("node present during code recomputation");
            (0..crate::NUM_SLOTS)
                .filter(|s| node.slot_state(*s) == SlotState::Subtree)
                .collect()
        };
        for slot in subtree_slots {
            let code = self.recompute_at(level + 1, prefix.child(slot));
            self.node_mut(level, &prefix)
                .set_slot(slot, SlotState::Subtree, code);
        }
        self.nodes
            .get(&(level, prefix.clone()))
            .expect("node present during code recomputation")
            .code()
    }

    /// Every id at or below the node named by (level, prefix).
    pub fn collect_items_in_subtree(
        &self,
        level: usize,
        prefix: &Prefix,
        out: &mut BTreeSet<Id>,
    ) {
        let Some(node) = self.node(level, prefix) else {
            return;
        };
        for slot in 0..crate::NUM_SLOTS {
            match node.slot_state(slot) {
                SlotState::Empty => {}
                SlotState::LiveLeaf | SlotState::DeadLeaf => {
                    out.insert(node.slot_id(slot));
                }
                SlotState::Subtree => {
                    self.collect_items_in_subtree(level + 1, &prefix.child(slot), out);
                }
            }
        }
    }

    /// Find the node whose leaf slot holds `item`, if the trie
    /// contains it.
    pub fn locate_item(&self, item: &Id) -> Option<(usize, &MerkleNode)> {
        for level in 0..MAX_LEVELS {
            let prefix = Prefix::of_id(item, level);
            let node = self.node(level, &prefix)?;
            let slot = item.nibble(level);
            match node.slot_state(slot) {
                SlotState::Empty => return None,
                SlotState::LiveLeaf | SlotState::DeadLeaf => {
                    if node.slot_id(slot) == *item {
                        return Some((slot, node));
                    }
                    return None;
                }
                SlotState::Subtree => continue,
            }
        }
        None
    }
}
