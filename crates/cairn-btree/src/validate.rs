//! Structural self-check over the loaded portion of a tree.
//!
//! Unloaded subtrees are skipped; their `items` counts are trusted from the
//! last load, exactly as the engine itself trusts them.

use std::cmp::Ordering;

use cairn_common::{CairnError, Result};

use crate::node::NodeId;
use crate::tree::TreeInner;

impl<K: Clone, V: Clone> TreeInner<K, V> {
    pub(crate) fn validate(&self) -> Result<()> {
        let root = &self.arena[self.root];
        if !root.is_root {
            return Err(CairnError::invariant("tree root lacks the root flag"));
        }
        if root.parent.is_some() {
            return Err(CairnError::invariant("tree root has a parent"));
        }
        let flagged = self
            .arena
            .live_ids()
            .filter(|id| self.arena[*id].is_root)
            .count();
        if flagged != 1 {
            return Err(CairnError::invariant(format!(
                "{flagged} nodes carry the root flag"
            )));
        }

        let mut leaf_depth = None;
        self.validate_node(self.root, 0, &mut leaf_depth)
    }

    fn validate_node(
        &self,
        node_id: NodeId,
        depth: usize,
        leaf_depth: &mut Option<usize>,
    ) -> Result<()> {
        let node = &self.arena[node_id];

        if node.dirty {
            if !node.loaded {
                return Err(CairnError::invariant("dirty node is not loaded"));
            }
            if let Some(parent) = node.parent {
                if !self.arena[parent].dirty {
                    return Err(CairnError::invariant("dirty node under a clean parent"));
                }
            }
        }
        if !node.loaded {
            return Ok(());
        }

        let key_count = node.key_count() as u64;
        if !node.is_root {
            if key_count > self.max_keys_per_node {
                return Err(CairnError::invariant(format!(
                    "node holds {key_count} keys, above the maximum {}",
                    self.max_keys_per_node
                )));
            }
            // Internal splits lift one separator out of the new left half,
            // so internal nodes may sit one key below the leaf minimum.
            let lower_bound = if node.is_leaf {
                self.min_keys_per_node
            } else {
                self.min_keys_per_node.saturating_sub(1)
            };
            if key_count < lower_bound {
                return Err(CairnError::invariant(format!(
                    "node holds {key_count} keys, below the minimum {lower_bound}"
                )));
            }
        }

        if node.is_leaf {
            self.check_key_order(node.entries.iter().map(|(key, _)| key))?;
            if node.items != node.entries.len() as u64 {
                return Err(CairnError::invariant(format!(
                    "leaf items {} disagrees with entry count {}",
                    node.items,
                    node.entries.len()
                )));
            }
            match *leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(expected) if expected == depth => {}
                Some(expected) => {
                    return Err(CairnError::invariant(format!(
                        "leaf at depth {depth}, expected {expected}"
                    )));
                }
            }
            return Ok(());
        }

        self.check_key_order(node.children.iter().map(|(key, _)| key))?;
        let leftmost = node
            .leftmost_child
            .ok_or_else(|| CairnError::invariant("internal node without leftmost child"))?;

        let mut items_sum = self.arena[leftmost].items;
        for (_, child) in node.children.iter() {
            items_sum += self.arena[*child].items;
        }
        if node.items != items_sum {
            return Err(CairnError::invariant(format!(
                "internal items {} disagrees with child sum {items_sum}",
                node.items
            )));
        }

        if self.arena[leftmost].parent != Some(node_id) {
            return Err(CairnError::invariant("leftmost child parent link broken"));
        }
        for (separator, child) in node.children.iter() {
            if self.arena[*child].parent != Some(node_id) {
                return Err(CairnError::invariant("child parent link broken"));
            }
            // The separator must be the smallest key stored under its child.
            if let Some(min_key) = self.subtree_min_key(*child) {
                if (self.compare)(separator, min_key) != Ordering::Equal {
                    return Err(CairnError::invariant(
                        "separator differs from child's minimum key",
                    ));
                }
            }
        }

        let prefix_root = node
            .prefix_root
            .ok_or_else(|| CairnError::invariant("internal node without prefix-sum tree"))?;
        if self.arena[prefix_root].prefix_items != node.items {
            return Err(CairnError::invariant(
                "prefix-sum total disagrees with node items",
            ));
        }
        let mut sequence = Vec::new();
        self.collect_prefix_in_order(prefix_root, &mut sequence)?;
        let mut expected = vec![leftmost];
        expected.extend(node.children.iter().map(|(_, child)| *child));
        if sequence != expected {
            return Err(CairnError::invariant(
                "prefix-sum order diverges from child sequence",
            ));
        }
        for (position, &child) in expected.iter().enumerate() {
            if self.arena[child].prefix_kv_index != position as i64 - 1 {
                return Err(CairnError::invariant("prefix-sum kv index out of date"));
            }
        }

        self.validate_node(leftmost, depth + 1, leaf_depth)?;
        for (_, child) in node.children.iter() {
            self.validate_node(*child, depth + 1, leaf_depth)?;
        }
        Ok(())
    }

    fn check_key_order<'a>(&self, keys: impl Iterator<Item = &'a K>) -> Result<()>
    where
        K: 'a,
    {
        let mut previous: Option<&K> = None;
        for key in keys {
            if let Some(previous) = previous {
                if (self.compare)(previous, key) != Ordering::Less {
                    return Err(CairnError::invariant("node keys out of order"));
                }
            }
            previous = Some(key);
        }
        Ok(())
    }

    /// In-order walk of a prefix-sum subtree, verifying parent links and
    /// cumulative sums along the way.
    fn collect_prefix_in_order(&self, prefix_id: NodeId, out: &mut Vec<NodeId>) -> Result<()> {
        let node = &self.arena[prefix_id];
        if let Some(left) = node.prefix_left {
            if self.arena[left].prefix_parent != Some(prefix_id) {
                return Err(CairnError::invariant("prefix-sum parent link broken"));
            }
            self.collect_prefix_in_order(left, out)?;
        }
        let left_sum = node.prefix_left.map_or(0, |left| self.arena[left].prefix_items);
        let right_sum = node
            .prefix_right
            .map_or(0, |right| self.arena[right].prefix_items);
        if node.prefix_items != node.items + left_sum + right_sum {
            return Err(CairnError::invariant("prefix-sum cumulative count broken"));
        }
        out.push(prefix_id);
        if let Some(right) = node.prefix_right {
            if self.arena[right].prefix_parent != Some(prefix_id) {
                return Err(CairnError::invariant("prefix-sum parent link broken"));
            }
            self.collect_prefix_in_order(right, out)?;
        }
        Ok(())
    }

    /// Minimum key stored under `node_id`, or `None` when the walk reaches
    /// an unloaded node.
    fn subtree_min_key(&self, node_id: NodeId) -> Option<&K> {
        let mut cursor = node_id;
        loop {
            let node = &self.arena[cursor];
            if !node.loaded {
                return None;
            }
            if node.is_leaf {
                return node.entries.get_by_index(0).map(|(key, _)| key);
            }
            cursor = node.leftmost_child?;
        }
    }
}
