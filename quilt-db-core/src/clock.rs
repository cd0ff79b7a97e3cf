//! Tree-structured logical clocks
//!
//! A [`TreeClock`] gives each clone a unique, infinitely divisible identity
//! and a partial order over events. The clock is a binary tree whose leaves
//! hold tick counts; exactly one leaf (addressed by the identity path) is
//! this process's own counter, the rest record ticks observed from sibling
//! processes.
//!
//! `fork` splits the identity leaf into two children that both retain the
//! parent's count, so every history reachable through `tick`/`fork`/`merge`
//! can compare trees of different shapes without losing observed events.
//! Clock values are immutable; every operation returns a fresh clock.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

use crate::error::{Error, Result};

/// One step of an identity path
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Branch {
    Left,
    Right,
}

/// A node of the clock tree: a tick-counting leaf or an unlabeled fork
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ClockNode {
    Leaf(u64),
    Fork(Box<ClockNode>, Box<ClockNode>),
}

/// Comparison mode for [`TreeClock::any_lt`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareMode {
    /// Compare only non-identity leaves (the default causal test)
    Events,
    /// Also compare the identity leaves of both clocks
    IncludeIds,
}

/// An immutable tree clock with a designated identity leaf
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "TreeClockWire", into = "TreeClockWire")]
pub struct TreeClock {
    root: ClockNode,
    path: Vec<Branch>,
}

impl TreeClock {
    /// The designated root clock: a single identity leaf at tick 0
    pub fn genesis() -> Self {
        Self {
            root: ClockNode::Leaf(0),
            path: Vec::new(),
        }
    }

    /// Ticks on the identity leaf
    pub fn ticks(&self) -> u64 {
        match self.identity_leaf() {
            Some(n) => n,
            // The path is validated at construction; a missing leaf cannot
            // occur for a clock built through genesis/fork/merge.
            None => 0,
        }
    }

    /// Advance the identity leaf by one
    #[must_use]
    pub fn tick(&self) -> Self {
        let mut next = self.clone();
        bump_leaf(&mut next.root, &next.path, 1);
        next
    }

    /// Split the identity leaf into two child leaves
    ///
    /// Both halves retain the full pre-fork history: the parent leaf's count
    /// is copied into each child. `self`'s successor keeps the left child as
    /// identity; the right half is the new process identity to hand off.
    pub fn fork(&self) -> (Self, Self) {
        let ticks = self.ticks();
        let mut root = self.root.clone();
        split_leaf(&mut root, &self.path, ticks);

        let mut left_path = self.path.clone();
        left_path.push(Branch::Left);
        let mut right_path = self.path.clone();
        right_path.push(Branch::Right);

        (
            Self {
                root: root.clone(),
                path: left_path,
            },
            Self {
                root,
                path: right_path,
            },
        )
    }

    /// Per-leaf maximum over the joint tree shape; identity kept from `self`
    ///
    /// A leaf facing a fork distributes its count over the fork's children;
    /// this aligns shapes without ever decrementing an observed count.
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        Self {
            root: merge_nodes(&self.root, &other.root),
            path: self.path.clone(),
        }
    }

    /// True iff some leaf of `other` exceeds the corresponding leaf of `self`
    ///
    /// In [`CompareMode::Events`] the identity leaves of both clocks are
    /// excluded. A leaf of `self` facing a fork of `other` compares as zero,
    /// so a process unknown to `self` counts as ahead.
    pub fn any_lt(&self, other: &Self, mode: CompareMode) -> bool {
        let include_ids = mode == CompareMode::IncludeIds;
        let mut pos = Vec::new();
        any_lt_node(
            &self.root,
            &other.root,
            &mut pos,
            &self.path,
            &other.path,
            include_ids,
        )
    }

    /// Ticks attributed to `other`'s identity as seen in `self`
    ///
    /// Walks `other`'s identity path through `self`'s tree. Reaching a leaf
    /// on or before the end of the path yields that count (the pre-fork
    /// lineage maps onto the same tick axis). A fork past the end of the
    /// path means the shapes diverged and the attribution is undefined.
    pub fn get_ticks(&self, other: &Self) -> Option<u64> {
        let mut node = &self.root;
        for step in &other.path {
            match node {
                ClockNode::Leaf(n) => return Some(*n),
                ClockNode::Fork(l, r) => {
                    node = match step {
                        Branch::Left => l,
                        Branch::Right => r,
                    }
                }
            }
        }
        match node {
            ClockNode::Leaf(n) => Some(*n),
            ClockNode::Fork(_, _) => None,
        }
    }

    /// True when both clocks designate the same identity leaf
    ///
    /// Used for self-echo suppression: a clone refuses a delta whose time
    /// carries its own identity.
    pub fn same_identity(&self, other: &Self) -> bool {
        self.path == other.path
    }

    /// The identity path as 0/1 indices (wire form)
    pub fn path_indices(&self) -> Vec<u8> {
        self.path
            .iter()
            .map(|b| match b {
                Branch::Left => 0,
                Branch::Right => 1,
            })
            .collect()
    }

    fn identity_leaf(&self) -> Option<u64> {
        let mut node = &self.root;
        for step in &self.path {
            match node {
                ClockNode::Leaf(_) => return None,
                ClockNode::Fork(l, r) => {
                    node = match step {
                        Branch::Left => l,
                        Branch::Right => r,
                    }
                }
            }
        }
        match node {
            ClockNode::Leaf(n) => Some(*n),
            ClockNode::Fork(_, _) => None,
        }
    }
}

fn bump_leaf(node: &mut ClockNode, path: &[Branch], by: u64) {
    match (node, path) {
        (ClockNode::Leaf(n), []) => *n += by,
        (ClockNode::Fork(l, r), [step, rest @ ..]) => {
            let child = match step {
                Branch::Left => l,
                Branch::Right => r,
            };
            bump_leaf(child, rest, by);
        }
        // Unreachable for validated clocks
        _ => {}
    }
}

fn split_leaf(node: &mut ClockNode, path: &[Branch], ticks: u64) {
    match (node, path) {
        (node @ ClockNode::Leaf(_), []) => {
            *node = ClockNode::Fork(
                Box::new(ClockNode::Leaf(ticks)),
                Box::new(ClockNode::Leaf(ticks)),
            );
        }
        (ClockNode::Fork(l, r), [step, rest @ ..]) => {
            let child = match step {
                Branch::Left => l,
                Branch::Right => r,
            };
            split_leaf(child, rest, ticks);
        }
        _ => {}
    }
}

fn merge_nodes(a: &ClockNode, b: &ClockNode) -> ClockNode {
    match (a, b) {
        (ClockNode::Leaf(x), ClockNode::Leaf(y)) => ClockNode::Leaf((*x).max(*y)),
        (ClockNode::Fork(al, ar), ClockNode::Fork(bl, br)) => ClockNode::Fork(
            Box::new(merge_nodes(al, bl)),
            Box::new(merge_nodes(ar, br)),
        ),
        (leaf @ ClockNode::Leaf(_), ClockNode::Fork(bl, br)) => ClockNode::Fork(
            Box::new(merge_nodes(leaf, bl)),
            Box::new(merge_nodes(leaf, br)),
        ),
        (ClockNode::Fork(al, ar), leaf @ ClockNode::Leaf(_)) => ClockNode::Fork(
            Box::new(merge_nodes(al, leaf)),
            Box::new(merge_nodes(ar, leaf)),
        ),
    }
}

fn any_lt_node(
    a: &ClockNode,
    b: &ClockNode,
    pos: &mut Vec<Branch>,
    self_path: &[Branch],
    other_path: &[Branch],
    include_ids: bool,
) -> bool {
    let at_identity = !include_ids && (pos.as_slice() == self_path || pos.as_slice() == other_path);
    match (a, b) {
        (ClockNode::Leaf(x), ClockNode::Leaf(y)) => !at_identity && y > x,
        (ClockNode::Fork(al, ar), ClockNode::Fork(bl, br)) => {
            descend(al, bl, pos, Branch::Left, self_path, other_path, include_ids)
                || descend(ar, br, pos, Branch::Right, self_path, other_path, include_ids)
        }
        // Missing subtree on the left compares as zero.
        (ClockNode::Leaf(_), ClockNode::Fork(bl, br)) => {
            if at_identity {
                return false;
            }
            let zero = ClockNode::Leaf(0);
            descend(&zero, bl, pos, Branch::Left, self_path, other_path, include_ids)
                || descend(&zero, br, pos, Branch::Right, self_path, other_path, include_ids)
        }
        // A leaf of `other` spanning a fork of `self` exceeds it when it
        // exceeds any leaf underneath.
        (ClockNode::Fork(al, ar), leaf @ ClockNode::Leaf(_)) => {
            if at_identity {
                return false;
            }
            descend(al, leaf, pos, Branch::Left, self_path, other_path, include_ids)
                || descend(ar, leaf, pos, Branch::Right, self_path, other_path, include_ids)
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn descend(
    a: &ClockNode,
    b: &ClockNode,
    pos: &mut Vec<Branch>,
    step: Branch,
    self_path: &[Branch],
    other_path: &[Branch],
    include_ids: bool,
) -> bool {
    pos.push(step);
    let hit = any_lt_node(a, b, pos, self_path, other_path, include_ids);
    pos.pop();
    hit
}

// ============================================================================
// Wire format
// ============================================================================

/// Array-shaped JSON encoding: a node is `[ticks]` or `[left, right]`; the
/// identity path is a parallel list of 0/1 indices.
#[derive(Serialize, Deserialize)]
struct TreeClockWire {
    tree: JsonValue,
    path: Vec<u8>,
}

impl From<TreeClock> for TreeClockWire {
    fn from(clock: TreeClock) -> Self {
        Self {
            tree: node_to_json(&clock.root),
            path: clock.path_indices(),
        }
    }
}

impl TryFrom<TreeClockWire> for TreeClock {
    type Error = Error;

    fn try_from(wire: TreeClockWire) -> Result<Self> {
        let root = node_from_json(&wire.tree)?;
        let mut path = Vec::with_capacity(wire.path.len());
        for idx in wire.path {
            path.push(match idx {
                0 => Branch::Left,
                1 => Branch::Right,
                other => {
                    return Err(Error::clock(format!(
                        "identity path index out of range: {}",
                        other
                    )))
                }
            });
        }
        let clock = TreeClock { root, path };
        if clock.identity_leaf().is_none() {
            return Err(Error::clock("identity path does not address a leaf"));
        }
        Ok(clock)
    }
}

fn node_to_json(node: &ClockNode) -> JsonValue {
    match node {
        ClockNode::Leaf(n) => json!([n]),
        ClockNode::Fork(l, r) => json!([node_to_json(l), node_to_json(r)]),
    }
}

fn node_from_json(value: &JsonValue) -> Result<ClockNode> {
    let arr = value
        .as_array()
        .ok_or_else(|| Error::clock(format!("clock node is not an array: {}", value)))?;
    match arr.as_slice() {
        [ticks] if ticks.is_u64() => Ok(ClockNode::Leaf(ticks.as_u64().unwrap_or(0))),
        [left, right] => Ok(ClockNode::Fork(
            Box::new(node_from_json(left)?),
            Box::new(node_from_json(right)?),
        )),
        _ => Err(Error::clock(format!("malformed clock node: {}", value))),
    }
}
