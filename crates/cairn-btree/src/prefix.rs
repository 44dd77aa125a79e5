//! Per-internal-node prefix-sum index.
//!
//! Every internal node indexes its children twice: by separator key (the
//! in-node map) and by position, through a balanced binary tree whose nodes
//! are the children themselves (each child carries inline `prefix_*`
//! fields). Each prefix-sum position stores its child's subtree item count
//! plus the counts of both prefix-sum subtrees below it, which turns
//! rank→child resolution and rank-offset accumulation into O(log fanout)
//! walks.
//!
//! The index is rebuilt from scratch after any structural change to the
//! internal node (split, merge, rotation) and adjusted incrementally when a
//! leaf insert/delete changes counts without changing structure.

use crate::node::{NodeArena, NodeId};
use cairn_common::{CairnError, Result};

/// Rebuilds `node_id`'s prefix-sum tree from its current child sequence and
/// refreshes `items` from the new root sum. `node_id` must be internal.
pub(crate) fn rebuild<K, V>(arena: &mut NodeArena<K, V>, node_id: NodeId) {
    let (leftmost, child_ids) = {
        let node = &arena[node_id];
        let child_ids: Vec<NodeId> = node.children.iter().map(|(_, c)| *c).collect();
        (node.leftmost_child, child_ids)
    };

    let leftmost = match leftmost {
        Some(leftmost) => leftmost,
        None => {
            arena[node_id].prefix_root = None;
            return;
        }
    };

    let mut sequence = Vec::with_capacity(1 + child_ids.len());
    sequence.push(leftmost);
    sequence.extend(child_ids);

    for (position, &child_id) in sequence.iter().enumerate() {
        let child = &mut arena[child_id];
        child.prefix_items = child.items;
        child.prefix_kv_index = position as i64 - 1;
        child.prefix_parent = None;
        child.prefix_left = None;
        child.prefix_right = None;
    }

    let prefix_root = build_balanced(arena, &sequence);
    let total = arena[prefix_root].prefix_items;
    let node = &mut arena[node_id];
    node.prefix_root = Some(prefix_root);
    node.items = total;
}

/// Midpoint construction: element ⌊n/2⌋ becomes the subtree root, halves
/// recurse, sums and parent links are fixed bottom-up.
fn build_balanced<K, V>(arena: &mut NodeArena<K, V>, sequence: &[NodeId]) -> NodeId {
    let mid = sequence.len() / 2;
    let mid_id = sequence[mid];

    if mid > 0 {
        let left = build_balanced(arena, &sequence[..mid]);
        arena[left].prefix_parent = Some(mid_id);
        let left_items = arena[left].prefix_items;
        let node = &mut arena[mid_id];
        node.prefix_left = Some(left);
        node.prefix_items += left_items;
    }
    if mid + 1 < sequence.len() {
        let right = build_balanced(arena, &sequence[mid + 1..]);
        arena[right].prefix_parent = Some(mid_id);
        let right_items = arena[right].prefix_items;
        let node = &mut arena[mid_id];
        node.prefix_right = Some(right);
        node.prefix_items += right_items;
    }

    mid_id
}

/// Rebuilds the prefix-sum trees of `node_id` and every ancestor, marking
/// each dirty on the way up.
pub(crate) fn rebuild_to_root<K, V>(arena: &mut NodeArena<K, V>, mut node_id: NodeId) {
    loop {
        rebuild(arena, node_id);
        arena[node_id].dirty = true;
        if arena[node_id].is_root {
            return;
        }
        match arena[node_id].parent {
            Some(parent) => node_id = parent,
            None => return,
        }
    }
}

/// Propagates a ±delta item-count change from a leaf to the root without
/// rebuilding: each ancestor's `items` is adjusted, and within each
/// ancestor's prefix-sum tree the chain from the updated child to the
/// prefix-sum root is adjusted. Every node on the way is marked dirty.
pub(crate) fn apply_count_delta<K, V>(arena: &mut NodeArena<K, V>, node_id: NodeId, delta: i64) {
    let mut id = node_id;
    loop {
        {
            let node = &mut arena[id];
            node.items = (node.items as i64 + delta) as u64;
            node.dirty = true;
            if node.is_root {
                return;
            }
        }

        let mut prefix_id = id;
        loop {
            let node = &mut arena[prefix_id];
            node.prefix_items = (node.prefix_items as i64 + delta) as u64;
            match node.prefix_parent {
                Some(parent) => prefix_id = parent,
                None => break,
            }
        }

        match arena[id].parent {
            Some(parent) => id = parent,
            None => return,
        }
    }
}

/// Applies the leaf's map-length vs `items` difference up the tree. Called
/// after a single entry was inserted into or deleted from a leaf.
pub(crate) fn update_counts_from_leaf<K, V>(arena: &mut NodeArena<K, V>, leaf_id: NodeId) {
    let leaf = &arena[leaf_id];
    let delta = leaf.entries.len() as i64 - leaf.items as i64;
    if delta != 0 {
        apply_count_delta(arena, leaf_id, delta);
    }
}

/// Resolves a rank within `node_id`'s subtree to the child containing it.
/// Returns `(child, residual rank within that child, child's kv index)`.
/// `rank` must be < `items(node_id)`.
pub(crate) fn child_for_rank<K, V>(
    arena: &NodeArena<K, V>,
    node_id: NodeId,
    mut rank: u64,
) -> Result<(NodeId, u64, i64)> {
    let mut cursor = arena[node_id]
        .prefix_root
        .ok_or_else(|| CairnError::invariant("rank descent into internal node without prefix-sum tree"))?;

    loop {
        let node = &arena[cursor];
        let left_sum = node.prefix_left.map_or(0, |left| arena[left].prefix_items);
        if rank < left_sum {
            cursor = node
                .prefix_left
                .ok_or_else(|| CairnError::invariant("prefix-sum left subtree missing"))?;
        } else if rank < left_sum + node.items {
            return Ok((cursor, rank - left_sum, node.prefix_kv_index));
        } else {
            rank -= left_sum + node.items;
            cursor = node
                .prefix_right
                .ok_or_else(|| CairnError::invariant("rank exceeds prefix-sum total"))?;
        }
    }
}

/// Number of items in all children positioned strictly left of `child_id`
/// within its parent's prefix-sum tree.
pub(crate) fn accumulated_offset<K, V>(arena: &NodeArena<K, V>, child_id: NodeId) -> u64 {
    let mut offset = arena[child_id]
        .prefix_left
        .map_or(0, |left| arena[left].prefix_items);

    let mut cursor = child_id;
    while let Some(parent_id) = arena[cursor].prefix_parent {
        let parent = &arena[parent_id];
        if parent.prefix_right == Some(cursor) {
            offset += parent.items;
            offset += parent.prefix_left.map_or(0, |left| arena[left].prefix_items);
        }
        cursor = parent_id;
    }

    offset
}
