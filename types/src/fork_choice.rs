//! The fork-choice working set.
//!
//! [`ForkChoiceDag`] holds summaries of blocks descending from the finalized block along with the
//! weights the fork-choice engine assigns to them. It does not compute weights itself.

use core::cmp::Reverse;

use anyhow::{ensure, Result};
use im::OrdMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::primitives::{Slot, Weight, H256};

#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct ForkChoiceNode {
    pub root: H256,
    pub parent_root: H256,
    pub slot: Slot,
    pub weight: Weight,
    pub valid: bool,
}

impl ForkChoiceNode {
    #[must_use]
    pub const fn new(root: H256, parent_root: H256, slot: Slot, weight: Weight) -> Self {
        Self {
            root,
            parent_root,
            slot,
            weight,
            valid: true,
        }
    }
}

/// A DAG of block summaries rooted at a single node.
///
/// Cloning is cheap. Nodes are kept in a persistent map.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ForkChoiceDag {
    root: H256,
    nodes: OrdMap<H256, ForkChoiceNode>,
}

impl ForkChoiceDag {
    #[must_use]
    pub fn new(root_node: ForkChoiceNode) -> Self {
        Self {
            root: root_node.root,
            nodes: OrdMap::unit(root_node.root, root_node),
        }
    }

    /// Rebuilds a DAG from the parts produced by [`ForkChoiceDag::nodes`].
    pub fn from_nodes(root: H256, nodes: impl IntoIterator<Item = ForkChoiceNode>) -> Result<Self> {
        let nodes = nodes
            .into_iter()
            .map(|node| (node.root, node))
            .collect::<OrdMap<H256, ForkChoiceNode>>();

        ensure!(nodes.contains_key(&root), Error::UnknownNode { root });

        for node in nodes.values() {
            ensure!(
                node.root == root || nodes.contains_key(&node.parent_root),
                Error::UnknownParent {
                    root: node.root,
                    parent_root: node.parent_root,
                },
            );
        }

        Ok(Self { root, nodes })
    }

    #[must_use]
    pub const fn root(&self) -> H256 {
        self.root
    }

    #[must_use]
    pub fn root_node(&self) -> &ForkChoiceNode {
        &self.nodes[&self.root]
    }

    #[must_use]
    pub fn get(&self, root: H256) -> Option<&ForkChoiceNode> {
        self.nodes.get(&root)
    }

    #[must_use]
    pub fn contains(&self, root: H256) -> bool {
        self.nodes.contains_key(&root)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in ascending order of block root.
    pub fn nodes(&self) -> impl Iterator<Item = &ForkChoiceNode> {
        self.nodes.values()
    }

    /// Adds a node whose parent is already in the DAG. Adding a node twice has no effect.
    pub fn insert(&mut self, node: ForkChoiceNode) -> Result<()> {
        if self.nodes.contains_key(&node.root) {
            return Ok(());
        }

        let parent = self.nodes.get(&node.parent_root).ok_or(Error::UnknownParent {
            root: node.root,
            parent_root: node.parent_root,
        })?;

        ensure!(
            parent.slot < node.slot,
            Error::SlotNotAfterParent {
                root: node.root,
                slot: node.slot,
                parent_slot: parent.slot,
            },
        );

        self.nodes.insert(node.root, node);

        Ok(())
    }

    pub fn set_weight(&mut self, root: H256, weight: Weight) -> Result<()> {
        let node = self.nodes.get_mut(&root).ok_or(Error::UnknownNode { root })?;
        node.weight = weight;
        Ok(())
    }

    pub fn mark_invalid(&mut self, root: H256) -> Result<()> {
        ensure!(root != self.root, Error::InvalidRoot { root });

        let node = self.nodes.get_mut(&root).ok_or(Error::UnknownNode { root })?;
        node.valid = false;
        Ok(())
    }

    /// Returns `true` if `descendant` is `ancestor` or one of its descendants.
    #[must_use]
    pub fn is_descendant(&self, ancestor: H256, descendant: H256) -> bool {
        self.ancestors(descendant)
            .any(|node| node.root == ancestor)
    }

    /// Returns `true` if `root` and all of its ancestors in the DAG are valid.
    #[must_use]
    pub fn is_viable(&self, root: H256) -> bool {
        self.contains(root) && self.ancestors(root).all(|node| node.valid)
    }

    /// Finds the closest node that both `left` and `right` descend from.
    #[must_use]
    pub fn common_ancestor(&self, left: H256, right: H256) -> Option<&ForkChoiceNode> {
        let right_node = self.nodes.get(&right)?;

        self.ancestors(left).find(|candidate| {
            candidate.slot <= right_node.slot && self.is_descendant(candidate.root, right)
        })
    }

    /// Iterates over `root` and its ancestors up to and including the root of the DAG.
    pub fn ancestors(&self, root: H256) -> impl Iterator<Item = &ForkChoiceNode> {
        let mut next = self.nodes.get(&root);

        core::iter::from_fn(move || {
            let node = next?;

            next = if node.root == self.root {
                None
            } else {
                self.nodes.get(&node.parent_root)
            };

            Some(node)
        })
    }

    /// The viable node with the greatest weight. Ties go to the lower block root.
    #[must_use]
    pub fn find_head(&self) -> H256 {
        self.nodes
            .values()
            .filter(|node| self.is_viable(node.root))
            .max_by_key(|node| (node.weight, Reverse(node.root)))
            .map_or(self.root, |node| node.root)
    }

    /// Makes `new_root` the root of the DAG and drops every node that does not descend from it.
    pub fn prune_to(&mut self, new_root: H256) -> Result<usize> {
        ensure!(
            self.contains(new_root),
            Error::UnknownNode { root: new_root },
        );

        let retained = self
            .nodes
            .values()
            .filter(|node| self.is_descendant(new_root, node.root))
            .map(|node| (node.root, *node))
            .collect::<OrdMap<_, _>>();

        let removed = self.nodes.len() - retained.len();

        self.root = new_root;
        self.nodes = retained;

        Ok(removed)
    }
}

/// Compares candidate heads. `true` means `candidate` should replace `current`.
#[must_use]
pub fn supersedes(candidate: &ForkChoiceNode, current: &ForkChoiceNode) -> bool {
    (candidate.weight, Reverse(candidate.root)) > (current.weight, Reverse(current.root))
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("block {root:?} is not in the fork-choice DAG")]
    UnknownNode { root: H256 },
    #[error("parent {parent_root:?} of block {root:?} is not in the fork-choice DAG")]
    UnknownParent { root: H256, parent_root: H256 },
    #[error("block {root:?} at slot {slot} is not after its parent at slot {parent_slot}")]
    SlotNotAfterParent {
        root: H256,
        slot: Slot,
        parent_slot: Slot,
    },
    #[error("root of the fork-choice DAG cannot be invalidated: {root:?}")]
    InvalidRoot { root: H256 },
}
