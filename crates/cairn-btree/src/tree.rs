//! Tree engine: public API, key and rank descents, and the split/merge/
//! rotate balancing that keeps the B+Tree invariants.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use parking_lot::Mutex;

use cairn_common::{CairnError, Result, TreeConfig};

use crate::callbacks::TreeCallbacks;
use crate::node::{Node, NodeArena, NodeId};
use crate::prefix;
use crate::Compare;

/// Bytes in use per object number, as returned by `fetch_layout_report`.
pub type LayoutReport = BTreeMap<u64, u64>;

/// Address of a persisted node. The root's location, as returned by
/// [`BPlusTree::flush`], is the only handle needed to re-open a tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RootLocation {
    pub object_number: u64,
    pub object_offset: u64,
    pub object_length: u64,
}

/// Shape summary returned by `fetch_dimensions_report`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DimensionsReport {
    pub min_keys_per_node: u64,
    pub max_keys_per_node: u64,
    pub items: u64,
    /// Number of levels, counting the root; 1 while the root is a leaf.
    pub height: u64,
}

/// Persistent order-statistic B+Tree. See the crate documentation for the
/// data model; all operations serialize behind one tree-wide mutex and run
/// in O(log n).
pub struct BPlusTree<K, V> {
    inner: Mutex<TreeInner<K, V>>,
}

pub(crate) struct TreeInner<K, V> {
    pub(crate) min_keys_per_node: u64,
    pub(crate) max_keys_per_node: u64,
    pub(crate) compare: Compare<K>,
    pub(crate) callbacks: Box<dyn TreeCallbacks<K, V> + Send>,
    pub(crate) arena: NodeArena<K, V>,
    pub(crate) root: NodeId,
}

impl<K: Clone, V: Clone> BPlusTree<K, V> {
    /// Creates an empty tree. Fails with `InvalidConfiguration` if the
    /// fanout constraint (even, ≥ 4) is violated.
    pub fn create(
        config: TreeConfig,
        compare: Compare<K>,
        callbacks: Box<dyn TreeCallbacks<K, V> + Send>,
    ) -> Result<Self> {
        config.validate()?;
        let mut arena = NodeArena::new();
        let mut root_node = Node::fresh(true, None, compare);
        root_node.is_root = true;
        let root = arena.alloc(root_node);
        Ok(Self {
            inner: Mutex::new(TreeInner {
                min_keys_per_node: config.min_keys_per_node(),
                max_keys_per_node: config.max_keys_per_node,
                compare,
                callbacks,
                arena,
                root,
            }),
        })
    }

    /// Re-opens a previously flushed tree from its root location. The root
    /// payload carries the fanout, which is restored before returning.
    pub fn open(
        location: RootLocation,
        compare: Compare<K>,
        callbacks: Box<dyn TreeCallbacks<K, V> + Send>,
    ) -> Result<Self> {
        let mut arena = NodeArena::new();
        let mut root_node = Node::shell(
            location.object_number,
            location.object_offset,
            location.object_length,
            0,
            None,
            compare,
        );
        root_node.is_root = true;
        let root = arena.alloc(root_node);
        let mut inner = TreeInner {
            min_keys_per_node: 0,
            max_keys_per_node: 0,
            compare,
            callbacks,
            arena,
            root,
        };
        inner.ensure_loaded(root)?;
        if !inner.arena[root].is_root {
            return Err(CairnError::CorruptNode(
                "root location does not reference a root node".to_string(),
            ));
        }
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Looks up a value by key.
    pub fn get_by_key(&self, key: &K) -> Result<Option<V>> {
        self.inner.lock().get_by_key(key)
    }

    /// Looks up the entry at global rank `index`; `None` when out of range.
    pub fn get_by_index(&self, index: usize) -> Result<Option<(K, V)>> {
        self.inner.lock().get_by_index(index)
    }

    /// Returns `(rank, found)` where `rank` is the smallest global index
    /// whose key compares ≥ `key`.
    pub fn bisect_left(&self, key: &K) -> Result<(usize, bool)> {
        self.inner.lock().bisect(key, false)
    }

    /// Returns `(rank, found)` where `rank` is the smallest global index
    /// whose key compares > `key`.
    pub fn bisect_right(&self, key: &K) -> Result<(usize, bool)> {
        self.inner.lock().bisect(key, true)
    }

    /// Inserts `key → value`. Returns false, changing nothing, if the key is
    /// already present; `patch_by_key` is the overwrite operation.
    pub fn put(&self, key: K, value: V) -> Result<bool> {
        self.inner.lock().put(key, value)
    }

    /// Replaces the value stored under `key`. Returns false if absent.
    pub fn patch_by_key(&self, key: &K, value: V) -> Result<bool> {
        self.inner.lock().patch_by_key(key, value)
    }

    /// Replaces the value at global rank `index`. Returns false when out of
    /// range.
    pub fn patch_by_index(&self, index: usize, value: V) -> Result<bool> {
        self.inner.lock().patch_by_index(index, value)
    }

    /// Removes `key`. Returns false if absent.
    pub fn delete_by_key(&self, key: &K) -> Result<bool> {
        self.inner.lock().delete_by_key(key)
    }

    /// Removes the entry at global rank `index`. Returns false when out of
    /// range.
    pub fn delete_by_index(&self, index: usize) -> Result<bool> {
        self.inner.lock().delete_by_index(index)
    }

    /// Total number of entries.
    pub fn len(&self) -> Result<usize> {
        self.inner.lock().len()
    }

    /// True when the tree holds no entries.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Posts every dirty node (children before parents) and returns the
    /// root's new location. With `and_purge`, additionally drops all
    /// in-memory node structures, keeping only object coordinates and item
    /// counts.
    pub fn flush(&self, and_purge: bool) -> Result<RootLocation> {
        self.inner.lock().flush(and_purge)
    }

    /// Drops the in-memory structures of all clean nodes. Fails with
    /// `InvariantViolation` if any node is dirty.
    pub fn purge(&self) -> Result<()> {
        self.inner.lock().purge()
    }

    /// Loads every node and marks the whole tree dirty, forcing the next
    /// flush to rewrite it completely.
    pub fn touch(&self) -> Result<()> {
        self.inner.lock().touch()
    }

    /// Produces a logically equal tree with an independent in-memory node
    /// graph, bound to `callbacks`. Clean subtrees share only their
    /// persisted bytes; dirty nodes are deep-copied with every key and value
    /// round-tripped through the packers.
    pub fn clone_with(
        &self,
        callbacks: Box<dyn TreeCallbacks<K, V> + Send>,
    ) -> Result<BPlusTree<K, V>> {
        let inner = self.inner.lock().clone_with(callbacks)?;
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Flushes (without purging), then reports bytes in use per object
    /// number across all live nodes.
    pub fn fetch_layout_report(&self) -> Result<LayoutReport> {
        self.inner.lock().fetch_layout_report()
    }

    /// Reports the tree's fanout bounds, entry count, and height.
    pub fn fetch_dimensions_report(&self) -> Result<DimensionsReport> {
        self.inner.lock().fetch_dimensions_report()
    }

    /// Last known persisted location of the root (all zero before the first
    /// flush).
    pub fn root_location(&self) -> RootLocation {
        let inner = self.inner.lock();
        let root = &inner.arena[inner.root];
        RootLocation {
            object_number: root.object_number,
            object_offset: root.object_offset,
            object_length: root.object_length,
        }
    }

    /// Walks the loaded portion of the tree checking every structural
    /// invariant (root uniqueness, uniform leaf depth, occupancy, key order,
    /// item-count and prefix-sum coherence, dirty propagation, parent
    /// back-references).
    pub fn validate(&self) -> Result<()> {
        self.inner.lock().validate()
    }
}

impl<K: Clone, V: Clone> TreeInner<K, V> {
    /// Resolves the child of `node_id` that covers `key`. Returns the child
    /// and its index in the child map (-1 for the leftmost child). `node_id`
    /// must be a loaded internal node.
    fn child_for_key(&self, node_id: NodeId, key: &K) -> Result<(NodeId, i64)> {
        let node = &self.arena[node_id];
        let leftmost = || {
            node.leftmost_child
                .map(|child| (child, -1))
                .ok_or_else(|| CairnError::invariant("internal node without leftmost child"))
        };

        let min_key = match node.children.get_by_index(0) {
            Some((min_key, _)) => min_key,
            None => return leftmost(),
        };
        if (self.compare)(key, min_key) == Ordering::Less {
            return leftmost();
        }

        // First separator ≥ key, stepped back when the match is not exact,
        // yields the last separator ≤ key.
        let (position, found) = node.children.bisect_left(key);
        let child_index = if found { position } else { position - 1 };
        let (_, child) = node
            .children
            .get_by_index(child_index)
            .ok_or_else(|| CairnError::invariant("child map bisect out of range"))?;
        Ok((*child, child_index as i64))
    }

    fn get_by_key(&mut self, key: &K) -> Result<Option<V>> {
        let mut node_id = self.root;
        loop {
            self.ensure_loaded(node_id)?;
            let node = &self.arena[node_id];
            if node.is_leaf {
                return Ok(node.entries.get_by_key(key).cloned());
            }
            node_id = self.child_for_key(node_id, key)?.0;
        }
    }

    fn get_by_index(&mut self, index: usize) -> Result<Option<(K, V)>> {
        self.ensure_loaded(self.root)?;
        if index as u64 >= self.arena[self.root].items {
            return Ok(None);
        }
        let mut node_id = self.root;
        let mut rank = index as u64;
        loop {
            self.ensure_loaded(node_id)?;
            let node = &self.arena[node_id];
            if node.is_leaf {
                return Ok(node
                    .entries
                    .get_by_index(rank as usize)
                    .map(|(k, v)| (k.clone(), v.clone())));
            }
            let (child, residual, _) = prefix::child_for_rank(&self.arena, node_id, rank)?;
            node_id = child;
            rank = residual;
        }
    }

    /// Shared walk for `bisect_left`/`bisect_right`: descends by key while
    /// accumulating the number of entries in subtrees left of the path, then
    /// adds the leaf-local bisect result.
    fn bisect(&mut self, key: &K, right: bool) -> Result<(usize, bool)> {
        let mut node_id = self.root;
        let mut index_delta: u64 = 0;
        loop {
            self.ensure_loaded(node_id)?;
            let node = &self.arena[node_id];
            if node.is_leaf {
                let (local, found) = if right {
                    node.entries.bisect_right(key)
                } else {
                    node.entries.bisect_left(key)
                };
                return Ok((index_delta as usize + local, found));
            }
            let (child, _) = self.child_for_key(node_id, key)?;
            index_delta += prefix::accumulated_offset(&self.arena, child);
            node_id = child;
        }
    }

    fn put(&mut self, key: K, value: V) -> Result<bool> {
        let mut node_id = self.root;
        loop {
            self.ensure_loaded(node_id)?;
            if self.arena[node_id].is_leaf {
                break;
            }
            node_id = self.child_for_key(node_id, &key)?.0;
        }
        if self.arena[node_id].entries.get_by_key(&key).is_some() {
            return Ok(false);
        }
        self.insert_here(node_id, key, value)?;
        Ok(true)
    }

    fn insert_here(&mut self, leaf_id: NodeId, key: K, value: V) -> Result<()> {
        self.arena[leaf_id].entries.put(key, value);
        prefix::update_counts_from_leaf(&mut self.arena, leaf_id);
        self.split_if_overfull(leaf_id)
    }

    /// Splits `node_id` if it holds more than `max_keys_per_node` keys,
    /// re-ascending through any ancestors the insertion of the split key
    /// pushes over the limit in turn. The root split grows the tree by one
    /// level.
    fn split_if_overfull(&mut self, node_id: NodeId) -> Result<()> {
        if self.arena[node_id].key_count() as u64 <= self.max_keys_per_node {
            return Ok(());
        }

        let is_leaf = self.arena[node_id].is_leaf;
        let parent = self.arena[node_id].parent;
        let sibling_id = self.arena.alloc(Node::fresh(is_leaf, parent, self.compare));

        // Move the largest entries into the new right sibling until the
        // source is down to the minimum.
        let mut split_key: Option<K> = None;
        loop {
            let len = self.arena[node_id].key_count();
            if len as u64 <= self.min_keys_per_node {
                break;
            }
            if is_leaf {
                let (key, value) = self.arena[node_id]
                    .entries
                    .delete_by_index(len - 1)
                    .ok_or_else(|| CairnError::invariant("split source leaf missing entry"))?;
                split_key = Some(key.clone());
                self.arena[sibling_id].entries.put(key, value);
                self.arena[node_id].items -= 1;
                self.arena[sibling_id].items += 1;
            } else {
                let (key, child) = self.arena[node_id]
                    .children
                    .delete_by_index(len - 1)
                    .ok_or_else(|| CairnError::invariant("split source node missing child"))?;
                self.arena[sibling_id].children.put(key, child);
                self.arena[child].parent = Some(sibling_id);
            }
        }

        if !is_leaf {
            // Lift the largest remaining separator out of the source; its
            // child becomes the sibling's leftmost child.
            let len = self.arena[node_id].key_count();
            let (key, child) = self.arena[node_id]
                .children
                .delete_by_index(len - 1)
                .ok_or_else(|| CairnError::invariant("split source node missing split key"))?;
            split_key = Some(key);
            self.arena[sibling_id].leftmost_child = Some(child);
            self.arena[child].parent = Some(sibling_id);
            prefix::rebuild(&mut self.arena, node_id);
            prefix::rebuild(&mut self.arena, sibling_id);
        }
        let split_key =
            split_key.ok_or_else(|| CairnError::invariant("split produced no separator"))?;
        self.arena[node_id].dirty = true;

        if self.arena[node_id].is_root {
            // The root split: allocate a new internal root above both halves.
            let node_items = self.arena[node_id].items;
            let sibling_items = self.arena[sibling_id].items;
            self.arena[node_id].is_root = false;

            let mut new_root = Node::fresh(false, None, self.compare);
            new_root.is_root = true;
            new_root.items = node_items + sibling_items;
            new_root.leftmost_child = Some(node_id);
            let new_root_id = self.arena.alloc(new_root);

            self.arena[node_id].parent = Some(new_root_id);
            self.arena[sibling_id].parent = Some(new_root_id);
            self.arena[new_root_id].children.put(split_key, sibling_id);
            self.root = new_root_id;
            prefix::rebuild_to_root(&mut self.arena, new_root_id);
            Ok(())
        } else {
            let parent_id = self.arena[node_id]
                .parent
                .ok_or_else(|| CairnError::invariant("non-root node without parent"))?;
            self.arena[parent_id].children.put(split_key, sibling_id);
            prefix::rebuild_to_root(&mut self.arena, parent_id);
            self.split_if_overfull(parent_id)
        }
    }

    fn patch_by_key(&mut self, key: &K, value: V) -> Result<bool> {
        let mut node_id = self.root;
        loop {
            self.ensure_loaded(node_id)?;
            if self.arena[node_id].is_leaf {
                break;
            }
            node_id = self.child_for_key(node_id, key)?.0;
        }
        if self.arena[node_id].entries.patch_by_key(key, value) {
            self.mark_dirty_to_root(node_id);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn patch_by_index(&mut self, index: usize, value: V) -> Result<bool> {
        self.ensure_loaded(self.root)?;
        if index as u64 >= self.arena[self.root].items {
            return Ok(false);
        }
        let mut node_id = self.root;
        let mut rank = index as u64;
        loop {
            self.ensure_loaded(node_id)?;
            if self.arena[node_id].is_leaf {
                break;
            }
            let (child, residual, _) = prefix::child_for_rank(&self.arena, node_id, rank)?;
            node_id = child;
            rank = residual;
        }
        if self.arena[node_id].entries.patch_by_index(rank as usize, value) {
            self.mark_dirty_to_root(node_id);
            Ok(true)
        } else {
            Err(CairnError::invariant("rank descent missed leaf entry"))
        }
    }

    fn delete_by_key(&mut self, key: &K) -> Result<bool> {
        let mut node_id = self.root;
        let mut parent_index_stack: Vec<i64> = Vec::new();
        loop {
            self.ensure_loaded(node_id)?;
            if self.arena[node_id].is_leaf {
                break;
            }
            let (child, kv_index) = self.child_for_key(node_id, key)?;
            parent_index_stack.push(kv_index);
            node_id = child;
        }
        if self.arena[node_id].entries.delete_by_key(key).is_none() {
            return Ok(false);
        }
        prefix::update_counts_from_leaf(&mut self.arena, node_id);
        self.rebalance_if_underfull(node_id, &mut parent_index_stack)?;
        Ok(true)
    }

    fn delete_by_index(&mut self, index: usize) -> Result<bool> {
        self.ensure_loaded(self.root)?;
        if index as u64 >= self.arena[self.root].items {
            return Ok(false);
        }
        let mut node_id = self.root;
        let mut rank = index as u64;
        let mut parent_index_stack: Vec<i64> = Vec::new();
        loop {
            self.ensure_loaded(node_id)?;
            if self.arena[node_id].is_leaf {
                break;
            }
            let (child, residual, kv_index) = prefix::child_for_rank(&self.arena, node_id, rank)?;
            parent_index_stack.push(kv_index);
            node_id = child;
            rank = residual;
        }
        if self.arena[node_id]
            .entries
            .delete_by_index(rank as usize)
            .is_none()
        {
            return Err(CairnError::invariant("rank descent missed leaf entry"));
        }
        prefix::update_counts_from_leaf(&mut self.arena, node_id);
        self.rebalance_if_underfull(node_id, &mut parent_index_stack)?;
        Ok(true)
    }

    fn len(&mut self) -> Result<usize> {
        self.ensure_loaded(self.root)?;
        Ok(self.arena[self.root].items as usize)
    }

    fn mark_dirty_to_root(&mut self, mut node_id: NodeId) {
        loop {
            let node = &mut self.arena[node_id];
            node.dirty = true;
            match node.parent {
                Some(parent) => node_id = parent,
                None => return,
            }
        }
    }

    /// Restores occupancy after a deletion left `node_id` underfull: steal
    /// from a sibling with spare keys, otherwise merge with one. Merges
    /// remove a separator from the parent and recurse; a root left with a
    /// single child is retired, shrinking the tree by one level.
    ///
    /// `parent_index_stack` records, per level of the descent, the child-map
    /// index followed (-1 for the leftmost child); one entry is consumed per
    /// recursion step.
    fn rebalance_if_underfull(
        &mut self,
        node_id: NodeId,
        parent_index_stack: &mut Vec<i64>,
    ) -> Result<()> {
        if self.arena[node_id].is_root {
            return Ok(());
        }
        if self.arena[node_id].key_count() as u64 >= self.min_keys_per_node {
            return Ok(());
        }

        let parent_id = self.arena[node_id]
            .parent
            .ok_or_else(|| CairnError::invariant("non-root node without parent"))?;
        let parent_index = parent_index_stack
            .pop()
            .ok_or_else(|| CairnError::invariant("rebalance without a descent record"))?;

        let left_sibling = if parent_index == -1 {
            None
        } else if parent_index == 0 {
            self.arena[parent_id].leftmost_child
        } else {
            self.arena[parent_id]
                .children
                .get_by_index(parent_index as usize - 1)
                .map(|(_, child)| *child)
        };

        if let Some(left_id) = left_sibling {
            self.ensure_loaded(left_id)?;
            if self.arena[left_id].key_count() as u64 > self.min_keys_per_node {
                return self.steal_from_left(node_id, left_id, parent_id, parent_index as usize);
            }
        }

        let parent_len = self.arena[parent_id].children.len() as i64;
        let right_sibling = if parent_index == parent_len - 1 {
            None
        } else {
            self.arena[parent_id]
                .children
                .get_by_index((parent_index + 1) as usize)
                .map(|(_, child)| *child)
        };

        if let Some(right_id) = right_sibling {
            self.ensure_loaded(right_id)?;
            if self.arena[right_id].key_count() as u64 > self.min_keys_per_node {
                return self.steal_from_right(
                    node_id,
                    right_id,
                    parent_id,
                    (parent_index + 1) as usize,
                );
            }
        }

        if let Some(left_id) = left_sibling {
            self.merge_into_left(
                left_id,
                node_id,
                parent_id,
                parent_index as usize,
                parent_index_stack,
            )
        } else if let Some(right_id) = right_sibling {
            self.merge_right_into(
                node_id,
                right_id,
                parent_id,
                (parent_index + 1) as usize,
                parent_index_stack,
            )
        } else {
            // Unreachable while the occupancy invariants hold: a non-root
            // node always has a sibling.
            Err(CairnError::invariant(
                "underfull node has no sibling to merge with",
            ))
        }
    }

    /// Moves one entry from the left sibling into `node_id`.
    /// `separator_index` is the parent-map index of `node_id`'s separator.
    fn steal_from_left(
        &mut self,
        node_id: NodeId,
        left_id: NodeId,
        parent_id: NodeId,
        separator_index: usize,
    ) -> Result<()> {
        let is_leaf = self.arena[node_id].is_leaf;
        if is_leaf {
            let left_len = self.arena[left_id].entries.len();
            let (moved_key, moved_value) = self.arena[left_id]
                .entries
                .delete_by_index(left_len - 1)
                .ok_or_else(|| CairnError::invariant("left sibling had no entry to give up"))?;
            self.arena[node_id]
                .entries
                .put(moved_key.clone(), moved_value);
            self.arena[left_id].items -= 1;
            self.arena[node_id].items += 1;
            // The moved key is the node's new minimum; re-key it in the parent.
            self.arena[parent_id]
                .children
                .delete_by_index(separator_index)
                .ok_or_else(|| CairnError::invariant("parent separator missing during steal"))?;
            self.arena[parent_id].children.put(moved_key, node_id);
        } else {
            // Rotate: the sibling's last separator rises into the parent,
            // the parent's old separator drops into the node paired with the
            // node's old leftmost child, and the sibling's detached child
            // becomes the node's new leftmost child.
            let left_len = self.arena[left_id].children.len();
            let (new_parent_key, moved_child) = self.arena[left_id]
                .children
                .delete_by_index(left_len - 1)
                .ok_or_else(|| CairnError::invariant("left sibling had no child to give up"))?;
            let (old_parent_key, _) = self.arena[parent_id]
                .children
                .delete_by_index(separator_index)
                .ok_or_else(|| CairnError::invariant("parent separator missing during rotate"))?;
            let old_leftmost = self.arena[node_id]
                .leftmost_child
                .ok_or_else(|| CairnError::invariant("internal node without leftmost child"))?;
            self.arena[node_id].leftmost_child = Some(moved_child);
            self.arena[moved_child].parent = Some(node_id);
            self.arena[node_id].children.put(old_parent_key, old_leftmost);
            self.arena[parent_id].children.put(new_parent_key, node_id);
            prefix::rebuild(&mut self.arena, left_id);
            prefix::rebuild(&mut self.arena, node_id);
        }
        prefix::rebuild(&mut self.arena, parent_id);
        self.arena[node_id].dirty = true;
        self.arena[left_id].dirty = true;
        self.arena[parent_id].dirty = true;
        Ok(())
    }

    /// Moves one entry from the right sibling into `node_id`.
    /// `separator_index` is the parent-map index of the right sibling's
    /// separator.
    fn steal_from_right(
        &mut self,
        node_id: NodeId,
        right_id: NodeId,
        parent_id: NodeId,
        separator_index: usize,
    ) -> Result<()> {
        let is_leaf = self.arena[node_id].is_leaf;
        if is_leaf {
            let (moved_key, moved_value) = self.arena[right_id]
                .entries
                .delete_by_index(0)
                .ok_or_else(|| CairnError::invariant("right sibling had no entry to give up"))?;
            self.arena[node_id].entries.put(moved_key, moved_value);
            // The sibling's separator must become its new minimum.
            let new_parent_key = {
                let (key, _) = self.arena[right_id]
                    .entries
                    .get_by_index(0)
                    .ok_or_else(|| CairnError::invariant("right sibling empty after steal"))?;
                key.clone()
            };
            self.arena[parent_id]
                .children
                .delete_by_index(separator_index)
                .ok_or_else(|| CairnError::invariant("parent separator missing during steal"))?;
            self.arena[parent_id].children.put(new_parent_key, right_id);
            self.arena[node_id].items += 1;
            self.arena[right_id].items -= 1;
        } else {
            let moved_child = self.arena[right_id]
                .leftmost_child
                .ok_or_else(|| CairnError::invariant("internal node without leftmost child"))?;
            let (new_parent_key, new_right_leftmost) = self.arena[right_id]
                .children
                .delete_by_index(0)
                .ok_or_else(|| CairnError::invariant("right sibling had no child to give up"))?;
            let (old_parent_key, _) = self.arena[parent_id]
                .children
                .delete_by_index(separator_index)
                .ok_or_else(|| CairnError::invariant("parent separator missing during rotate"))?;
            self.arena[node_id].children.put(old_parent_key, moved_child);
            self.arena[moved_child].parent = Some(node_id);
            self.arena[right_id].leftmost_child = Some(new_right_leftmost);
            self.arena[parent_id].children.put(new_parent_key, right_id);
            prefix::rebuild(&mut self.arena, node_id);
            prefix::rebuild(&mut self.arena, right_id);
        }
        prefix::rebuild(&mut self.arena, parent_id);
        self.arena[node_id].dirty = true;
        self.arena[right_id].dirty = true;
        self.arena[parent_id].dirty = true;
        Ok(())
    }

    /// Folds `node_id` into its left sibling, removing `node_id`'s separator
    /// from the parent. `separator_index` is that separator's parent-map
    /// index.
    fn merge_into_left(
        &mut self,
        left_id: NodeId,
        node_id: NodeId,
        parent_id: NodeId,
        separator_index: usize,
        parent_index_stack: &mut Vec<i64>,
    ) -> Result<()> {
        let is_leaf = self.arena[node_id].is_leaf;
        let node_items = self.arena[node_id].items;

        if !is_leaf {
            // The parent's separator comes back down, paired with the
            // node's leftmost child.
            let old_split_key = {
                let (key, _) = self.arena[parent_id]
                    .children
                    .get_by_index(separator_index)
                    .ok_or_else(|| CairnError::invariant("parent separator missing during merge"))?;
                key.clone()
            };
            let node_leftmost = self.arena[node_id]
                .leftmost_child
                .ok_or_else(|| CairnError::invariant("internal node without leftmost child"))?;
            self.arena[left_id].children.put(old_split_key, node_leftmost);
            self.arena[node_leftmost].parent = Some(left_id);
        }

        loop {
            if is_leaf {
                match self.arena[node_id].entries.delete_by_index(0) {
                    Some((key, value)) => {
                        self.arena[left_id].entries.put(key, value);
                    }
                    None => break,
                }
            } else {
                match self.arena[node_id].children.delete_by_index(0) {
                    Some((key, child)) => {
                        self.arena[left_id].children.put(key, child);
                        self.arena[child].parent = Some(left_id);
                    }
                    None => break,
                }
            }
        }
        self.arena[left_id].items += node_items;
        self.arena.free(node_id);

        self.finish_merge(left_id, parent_id, separator_index, is_leaf, parent_index_stack)
    }

    /// Folds the right sibling into `node_id`, removing the sibling's
    /// separator from the parent. `separator_index` is that separator's
    /// parent-map index.
    fn merge_right_into(
        &mut self,
        node_id: NodeId,
        right_id: NodeId,
        parent_id: NodeId,
        separator_index: usize,
        parent_index_stack: &mut Vec<i64>,
    ) -> Result<()> {
        let is_leaf = self.arena[node_id].is_leaf;
        let right_items = self.arena[right_id].items;

        if !is_leaf {
            let old_split_key = {
                let (key, _) = self.arena[parent_id]
                    .children
                    .get_by_index(separator_index)
                    .ok_or_else(|| CairnError::invariant("parent separator missing during merge"))?;
                key.clone()
            };
            let right_leftmost = self.arena[right_id]
                .leftmost_child
                .ok_or_else(|| CairnError::invariant("internal node without leftmost child"))?;
            self.arena[node_id].children.put(old_split_key, right_leftmost);
            self.arena[right_leftmost].parent = Some(node_id);
        }

        loop {
            if is_leaf {
                match self.arena[right_id].entries.delete_by_index(0) {
                    Some((key, value)) => {
                        self.arena[node_id].entries.put(key, value);
                    }
                    None => break,
                }
            } else {
                match self.arena[right_id].children.delete_by_index(0) {
                    Some((key, child)) => {
                        self.arena[node_id].children.put(key, child);
                        self.arena[child].parent = Some(node_id);
                    }
                    None => break,
                }
            }
        }
        self.arena[node_id].items += right_items;
        self.arena.free(right_id);

        self.finish_merge(node_id, parent_id, separator_index, is_leaf, parent_index_stack)
    }

    /// Common tail of both merge directions: either retire a root left with
    /// a single child, or drop the consumed separator and recurse upward.
    fn finish_merge(
        &mut self,
        merged_id: NodeId,
        parent_id: NodeId,
        separator_index: usize,
        is_leaf: bool,
        parent_index_stack: &mut Vec<i64>,
    ) -> Result<()> {
        let parent_is_root = self.arena[parent_id].is_root;
        let parent_len = self.arena[parent_id].children.len();

        if parent_is_root && parent_len == 1 {
            // The root held exactly one separator: the merge result becomes
            // the new root and the tree loses a level.
            self.arena[merged_id].is_root = true;
            self.arena[merged_id].parent = None;
            self.root = merged_id;
            if !is_leaf {
                prefix::rebuild(&mut self.arena, merged_id);
            }
            self.arena[merged_id].dirty = true;
            self.arena.free(parent_id);
            Ok(())
        } else {
            self.arena[parent_id]
                .children
                .delete_by_index(separator_index)
                .ok_or_else(|| CairnError::invariant("parent separator missing after merge"))?;
            if !is_leaf {
                prefix::rebuild(&mut self.arena, merged_id);
            }
            prefix::rebuild(&mut self.arena, parent_id);
            self.arena[merged_id].dirty = true;
            self.arena[parent_id].dirty = true;
            self.rebalance_if_underfull(parent_id, parent_index_stack)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::cmp::Ordering;

    /// Callbacks for trees that never leave memory; any persistence call is
    /// a test failure surfaced as an error.
    struct NoStore;

    impl TreeCallbacks<i64, String> for NoStore {
        fn get_node(&mut self, _: u64, _: u64, _: u64) -> Result<Bytes> {
            Err(CairnError::callback("get_node not available"))
        }
        fn put_node(&mut self, _: &[u8]) -> Result<(u64, u64)> {
            Err(CairnError::callback("put_node not available"))
        }
        fn pack_key(&self, key: &i64) -> Result<Bytes> {
            Ok(Bytes::copy_from_slice(&key.to_le_bytes()))
        }
        fn unpack_key(&self, buf: &[u8]) -> Result<(i64, usize)> {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[..8]);
            Ok((i64::from_le_bytes(raw), 8))
        }
        fn pack_value(&self, value: &String) -> Result<Bytes> {
            let mut out = vec![value.len() as u8];
            out.extend_from_slice(value.as_bytes());
            Ok(Bytes::from(out))
        }
        fn unpack_value(&self, buf: &[u8]) -> Result<(String, usize)> {
            let len = buf[0] as usize;
            let text = String::from_utf8(buf[1..1 + len].to_vec())
                .map_err(|e| CairnError::callback(e.to_string()))?;
            Ok((text, 1 + len))
        }
    }

    fn compare_i64(a: &i64, b: &i64) -> Ordering {
        a.cmp(b)
    }

    fn small_tree() -> BPlusTree<i64, String> {
        BPlusTree::create(TreeConfig::new(4), compare_i64, Box::new(NoStore)).unwrap()
    }

    #[test]
    fn test_create_rejects_bad_fanout() {
        for max in [0u64, 2, 3, 5, 7] {
            let result =
                BPlusTree::<i64, String>::create(TreeConfig::new(max), compare_i64, Box::new(NoStore));
            assert!(matches!(result, Err(CairnError::InvalidConfiguration(_))));
        }
    }

    #[test]
    fn test_put_get_across_splits() {
        let tree = small_tree();
        for k in 0..64i64 {
            assert!(tree.put(k, k.to_string()).unwrap(), "put {k}");
            tree.validate().unwrap();
        }
        assert_eq!(tree.len().unwrap(), 64);
        for k in 0..64i64 {
            assert_eq!(tree.get_by_key(&k).unwrap(), Some(k.to_string()));
        }
        assert_eq!(tree.get_by_key(&64).unwrap(), None);
    }

    #[test]
    fn test_put_duplicate_is_rejected() {
        let tree = small_tree();
        assert!(tree.put(1, "one".to_string()).unwrap());
        assert!(!tree.put(1, "uno".to_string()).unwrap());
        assert_eq!(tree.get_by_key(&1).unwrap(), Some("one".to_string()));
        assert_eq!(tree.len().unwrap(), 1);
    }

    #[test]
    fn test_get_by_index_matches_key_order() {
        let tree = small_tree();
        for k in (0..40i64).rev() {
            tree.put(k, k.to_string()).unwrap();
        }
        for i in 0..40usize {
            let (k, v) = tree.get_by_index(i).unwrap().unwrap();
            assert_eq!(k, i as i64);
            assert_eq!(v, k.to_string());
        }
        assert_eq!(tree.get_by_index(40).unwrap(), None);
    }

    #[test]
    fn test_patch_by_key_and_index() {
        let tree = small_tree();
        for k in 0..16i64 {
            tree.put(k, "old".to_string()).unwrap();
        }
        assert!(tree.patch_by_key(&5, "by-key".to_string()).unwrap());
        assert!(tree.patch_by_index(6, "by-index".to_string()).unwrap());
        assert!(!tree.patch_by_key(&99, "missing".to_string()).unwrap());
        assert!(!tree.patch_by_index(16, "missing".to_string()).unwrap());
        assert_eq!(tree.get_by_key(&5).unwrap(), Some("by-key".to_string()));
        assert_eq!(tree.get_by_key(&6).unwrap(), Some("by-index".to_string()));
        assert_eq!(tree.len().unwrap(), 16);
        tree.validate().unwrap();
    }

    #[test]
    fn test_delete_by_key_with_merges() {
        let tree = small_tree();
        for k in 0..32i64 {
            tree.put(k, k.to_string()).unwrap();
        }
        for k in 0..32i64 {
            assert!(tree.delete_by_key(&k).unwrap(), "delete {k}");
            tree.validate().unwrap();
        }
        assert!(!tree.delete_by_key(&0).unwrap());
        assert_eq!(tree.len().unwrap(), 0);
    }

    #[test]
    fn test_delete_by_index_always_first() {
        let tree = small_tree();
        for k in 0..20i64 {
            tree.put(k, k.to_string()).unwrap();
        }
        for expected in 0..20i64 {
            let (k, _) = tree.get_by_index(0).unwrap().unwrap();
            assert_eq!(k, expected);
            assert!(tree.delete_by_index(0).unwrap());
            tree.validate().unwrap();
        }
        assert!(!tree.delete_by_index(0).unwrap());
    }

    #[test]
    fn test_bisect_on_gapped_keys() {
        let tree = small_tree();
        for k in 0..20i64 {
            tree.put(k * 2, String::new()).unwrap();
        }
        // Keys are 0, 2, ..., 38.
        assert_eq!(tree.bisect_left(&-1).unwrap(), (0, false));
        assert_eq!(tree.bisect_left(&0).unwrap(), (0, true));
        assert_eq!(tree.bisect_left(&7).unwrap(), (4, false));
        assert_eq!(tree.bisect_left(&8).unwrap(), (4, true));
        assert_eq!(tree.bisect_left(&39).unwrap(), (20, false));
        assert_eq!(tree.bisect_right(&0).unwrap(), (1, true));
        assert_eq!(tree.bisect_right(&7).unwrap(), (4, false));
        assert_eq!(tree.bisect_right(&38).unwrap(), (20, true));
    }

    #[test]
    fn test_root_location_starts_zeroed() {
        let tree = small_tree();
        assert_eq!(tree.root_location(), RootLocation::default());
    }
}
