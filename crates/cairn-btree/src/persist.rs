//! Lazy load and dirty-write protocol against the object store, plus the
//! whole-tree operations built on it: flush, purge, touch, layout and
//! dimensions reporting, and structural clone.

use bytes::BytesMut;
use tracing::{debug, trace};

use cairn_common::{CairnError, Result, TreeConfig};

use crate::callbacks::TreeCallbacks;
use crate::node::{Node, NodeArena, NodeId};
use crate::prefix;
use crate::tree::{DimensionsReport, LayoutReport, RootLocation, TreeInner};
use crate::wire::{self, ChildRef, NodeHeader, PayloadReader};

impl<K: Clone, V: Clone> TreeInner<K, V> {
    /// Materializes `node_id` from the object store if it is not already in
    /// memory.
    pub(crate) fn ensure_loaded(&mut self, node_id: NodeId) -> Result<()> {
        if self.arena[node_id].loaded {
            return Ok(());
        }
        self.load_node(node_id)
    }

    fn load_node(&mut self, node_id: NodeId) -> Result<()> {
        let (object_number, object_offset, object_length) = {
            let node = &self.arena[node_id];
            (node.object_number, node.object_offset, node.object_length)
        };
        let blob = self
            .callbacks
            .get_node(object_number, object_offset, object_length)?;
        let (header, payload) = wire::decode_node(&blob)?;
        let mut reader = PayloadReader::new(payload);

        {
            let compare = self.compare;
            let node = &mut self.arena[node_id];
            node.clear_in_memory(compare);
            node.items = header.items;
            node.is_root = header.root;
            node.is_leaf = header.leaf;
        }

        if header.root {
            // The root payload opens with the fanout the tree was built with.
            let config = TreeConfig::new(reader.read_u64()?);
            config.validate()?;
            self.min_keys_per_node = config.min_keys_per_node();
            self.max_keys_per_node = config.max_keys_per_node;
        }

        if header.leaf {
            let count = reader.read_u64()?;
            for _ in 0..count {
                let (key, consumed) = self.callbacks.unpack_key(reader.rest())?;
                reader.advance(consumed)?;
                let (value, consumed) = self.callbacks.unpack_value(reader.rest())?;
                reader.advance(consumed)?;
                if !self.arena[node_id].entries.put(key, value) {
                    return Err(CairnError::invariant("duplicate key in persisted leaf"));
                }
            }
        } else {
            let count = reader.read_u64()?;
            if count > 0 {
                let child_ref = reader.read_child_ref()?;
                let child = self.alloc_shell(&child_ref, node_id);
                self.arena[node_id].leftmost_child = Some(child);
                for _ in 1..count {
                    let (key, consumed) = self.callbacks.unpack_key(reader.rest())?;
                    reader.advance(consumed)?;
                    let child_ref = reader.read_child_ref()?;
                    let child = self.alloc_shell(&child_ref, node_id);
                    if !self.arena[node_id].children.put(key, child) {
                        return Err(CairnError::invariant(
                            "duplicate separator in persisted node",
                        ));
                    }
                }
                prefix::rebuild(&mut self.arena, node_id);
            }
        }

        if reader.remaining() != 0 {
            return Err(CairnError::TrailingPayload {
                remaining: reader.remaining(),
            });
        }

        let node = &mut self.arena[node_id];
        node.loaded = true;
        node.dirty = false;
        trace!(
            object_number,
            object_offset,
            object_length,
            leaf = header.leaf,
            items = header.items,
            "node loaded"
        );
        Ok(())
    }

    fn alloc_shell(&mut self, child_ref: &ChildRef, parent: NodeId) -> NodeId {
        self.arena.alloc(Node::shell(
            child_ref.object_number,
            child_ref.object_offset,
            child_ref.object_length,
            child_ref.items,
            Some(parent),
            self.compare,
        ))
    }

    /// Serializes a dirty node and writes it to the store. All children must
    /// already be posted; their just-committed addresses are what this
    /// node's payload references.
    fn post_node(&mut self, node_id: NodeId) -> Result<()> {
        if !self.arena[node_id].dirty {
            return Ok(());
        }

        let (items, is_root, is_leaf) = {
            let node = &self.arena[node_id];
            (node.items, node.is_root, node.is_leaf)
        };

        let mut payload = BytesMut::new();
        if is_root {
            wire::put_u64(&mut payload, self.max_keys_per_node);
        }

        if is_leaf {
            let node = &self.arena[node_id];
            wire::put_u64(&mut payload, node.entries.len() as u64);
            for (key, value) in node.entries.iter() {
                let packed = self.callbacks.pack_key(key)?;
                payload.extend_from_slice(&packed);
                let packed = self.callbacks.pack_value(value)?;
                payload.extend_from_slice(&packed);
            }
        } else {
            let node = &self.arena[node_id];
            match node.leftmost_child {
                None => {
                    if !node.children.is_empty() {
                        return Err(CairnError::invariant(
                            "internal node has separators but no leftmost child",
                        ));
                    }
                    wire::put_u64(&mut payload, 0);
                }
                Some(leftmost) => {
                    wire::put_u64(&mut payload, 1 + node.children.len() as u64);
                    self.append_child_ref(&mut payload, leftmost)?;
                    for (key, child) in node.children.iter() {
                        let packed = self.callbacks.pack_key(key)?;
                        payload.extend_from_slice(&packed);
                        self.append_child_ref(&mut payload, *child)?;
                    }
                }
            }
        }

        let blob = wire::encode_node(
            &NodeHeader {
                items,
                root: is_root,
                leaf: is_leaf,
            },
            &payload,
        );
        let (object_number, object_offset) = self.callbacks.put_node(&blob)?;

        let node = &mut self.arena[node_id];
        node.object_number = object_number;
        node.object_offset = object_offset;
        node.object_length = blob.len() as u64;
        node.dirty = false;
        debug!(
            object_number,
            object_offset,
            object_length = blob.len(),
            leaf = is_leaf,
            "node posted"
        );
        Ok(())
    }

    fn append_child_ref(&self, payload: &mut BytesMut, child_id: NodeId) -> Result<()> {
        let child = &self.arena[child_id];
        if child.dirty {
            return Err(CairnError::invariant("dirty child reference during post"));
        }
        wire::put_child_ref(
            payload,
            &ChildRef {
                object_number: child.object_number,
                object_offset: child.object_offset,
                object_length: child.object_length,
                items: child.items,
            },
        );
        Ok(())
    }

    /// Post-order flush: children are posted (and cleaned) strictly before
    /// their parent is serialized. With `and_purge`, the in-memory structure
    /// of every visited node is dropped on the way out.
    fn flush_node(&mut self, node_id: NodeId, and_purge: bool) -> Result<()> {
        if !self.arena[node_id].loaded {
            return Ok(());
        }
        if !self.arena[node_id].is_leaf {
            if let Some(leftmost) = self.arena[node_id].leftmost_child {
                self.flush_node(leftmost, and_purge)?;
                let children: Vec<NodeId> = self.arena[node_id]
                    .children
                    .iter()
                    .map(|(_, child)| *child)
                    .collect();
                for child in children {
                    self.flush_node(child, and_purge)?;
                }
            }
        }
        if self.arena[node_id].dirty {
            self.post_node(node_id)?;
        }
        if and_purge {
            self.release_children(node_id);
            let compare = self.compare;
            self.arena[node_id].clear_in_memory(compare);
        }
        Ok(())
    }

    /// Frees the arena slots of this node's direct children. Their own
    /// subtrees must already have been released.
    fn release_children(&mut self, node_id: NodeId) {
        let mut children = Vec::new();
        {
            let node = &self.arena[node_id];
            if let Some(leftmost) = node.leftmost_child {
                children.push(leftmost);
            }
            children.extend(node.children.iter().map(|(_, child)| *child));
        }
        for child in children {
            self.arena.free(child);
        }
    }

    pub(crate) fn flush(&mut self, and_purge: bool) -> Result<RootLocation> {
        self.flush_node(self.root, and_purge)?;
        let root = &self.arena[self.root];
        debug!(
            object_number = root.object_number,
            object_offset = root.object_offset,
            and_purge,
            "tree flushed"
        );
        Ok(RootLocation {
            object_number: root.object_number,
            object_offset: root.object_offset,
            object_length: root.object_length,
        })
    }

    pub(crate) fn purge(&mut self) -> Result<()> {
        self.purge_node(self.root)
    }

    fn purge_node(&mut self, node_id: NodeId) -> Result<()> {
        if !self.arena[node_id].loaded {
            return Ok(());
        }
        if self.arena[node_id].dirty {
            return Err(CairnError::invariant("purge found a dirty node"));
        }
        if !self.arena[node_id].is_leaf {
            if let Some(leftmost) = self.arena[node_id].leftmost_child {
                self.purge_node(leftmost)?;
                let children: Vec<NodeId> = self.arena[node_id]
                    .children
                    .iter()
                    .map(|(_, child)| *child)
                    .collect();
                for child in children {
                    self.purge_node(child)?;
                }
            }
        }
        self.release_children(node_id);
        let compare = self.compare;
        self.arena[node_id].clear_in_memory(compare);
        debug!(object_number = self.arena[node_id].object_number, "node purged");
        Ok(())
    }

    pub(crate) fn touch(&mut self) -> Result<()> {
        self.touch_node(self.root)
    }

    fn touch_node(&mut self, node_id: NodeId) -> Result<()> {
        self.ensure_loaded(node_id)?;
        self.arena[node_id].dirty = true;
        if !self.arena[node_id].is_leaf {
            if let Some(leftmost) = self.arena[node_id].leftmost_child {
                self.touch_node(leftmost)?;
                let children: Vec<NodeId> = self.arena[node_id]
                    .children
                    .iter()
                    .map(|(_, child)| *child)
                    .collect();
                for child in children {
                    self.touch_node(child)?;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn fetch_layout_report(&mut self) -> Result<LayoutReport> {
        // Post all dirty state first so every node has final coordinates.
        self.flush_node(self.root, false)?;
        let mut report = LayoutReport::new();
        self.update_layout_report(&mut report, self.root)?;
        Ok(report)
    }

    fn update_layout_report(&mut self, report: &mut LayoutReport, node_id: NodeId) -> Result<()> {
        self.ensure_loaded(node_id)?;
        let (object_number, object_length, is_leaf) = {
            let node = &self.arena[node_id];
            (node.object_number, node.object_length, node.is_leaf)
        };
        *report.entry(object_number).or_insert(0) += object_length;
        if !is_leaf {
            let leftmost = self.arena[node_id]
                .leftmost_child
                .ok_or_else(|| CairnError::invariant("internal node without leftmost child"))?;
            self.update_layout_report(report, leftmost)?;
            let children: Vec<NodeId> = self.arena[node_id]
                .children
                .iter()
                .map(|(_, child)| *child)
                .collect();
            for child in children {
                self.update_layout_report(report, child)?;
            }
        }
        Ok(())
    }

    pub(crate) fn fetch_dimensions_report(&mut self) -> Result<DimensionsReport> {
        self.ensure_loaded(self.root)?;
        let mut height = 1u64;
        let mut node_id = self.root;
        loop {
            self.ensure_loaded(node_id)?;
            if self.arena[node_id].is_leaf {
                break;
            }
            node_id = self.arena[node_id]
                .leftmost_child
                .ok_or_else(|| CairnError::invariant("internal node without leftmost child"))?;
            height += 1;
        }
        Ok(DimensionsReport {
            min_keys_per_node: self.min_keys_per_node,
            max_keys_per_node: self.max_keys_per_node,
            items: self.arena[self.root].items,
            height,
        })
    }

    /// Builds an independent tree over `callbacks`. Unloaded or clean nodes
    /// become shells sharing only on-disk coordinates; loaded dirty nodes
    /// are deep-copied, with each key and value round-tripped through the
    /// source tree's packers to sever any sharing inside reference types.
    pub(crate) fn clone_with(
        &self,
        callbacks: Box<dyn TreeCallbacks<K, V> + Send>,
    ) -> Result<TreeInner<K, V>> {
        let mut arena = NodeArena::new();
        let root = arena.alloc(Node::fresh(true, None, self.compare));
        let mut cloned = TreeInner {
            min_keys_per_node: self.min_keys_per_node,
            max_keys_per_node: self.max_keys_per_node,
            compare: self.compare,
            callbacks,
            arena,
            root,
        };
        self.clone_node(self.root, &mut cloned.arena, root)?;
        Ok(cloned)
    }

    fn clone_node(
        &self,
        source_id: NodeId,
        arena: &mut NodeArena<K, V>,
        target_id: NodeId,
    ) -> Result<()> {
        let source = &self.arena[source_id];

        if source.loaded && source.dirty {
            {
                let target = &mut arena[target_id];
                target.items = source.items;
                target.loaded = true;
                target.dirty = true;
                target.is_root = source.is_root;
                target.is_leaf = source.is_leaf;
                target.object_number = 0;
                target.object_offset = 0;
                target.object_length = 0;
            }
            if source.is_leaf {
                for (key, value) in source.entries.iter() {
                    let key = self.clone_key(key)?;
                    let value = self.clone_value(value)?;
                    if !arena[target_id].entries.put(key, value) {
                        return Err(CairnError::invariant("duplicate key while cloning leaf"));
                    }
                }
            } else {
                if let Some(source_leftmost) = source.leftmost_child {
                    let child = arena.alloc(Node::fresh(true, Some(target_id), self.compare));
                    arena[target_id].leftmost_child = Some(child);
                    self.clone_node(source_leftmost, arena, child)?;
                }
                for (key, source_child) in source.children.iter() {
                    let key = self.clone_key(key)?;
                    let child = arena.alloc(Node::fresh(true, Some(target_id), self.compare));
                    if !arena[target_id].children.put(key, child) {
                        return Err(CairnError::invariant(
                            "duplicate separator while cloning node",
                        ));
                    }
                    self.clone_node(*source_child, arena, child)?;
                }
                prefix::rebuild(arena, target_id);
            }
        } else {
            // Not loaded, or loaded and clean: a shell over the persisted
            // bytes suffices, and the subtree below it is not visited.
            let target = &mut arena[target_id];
            target.items = source.items;
            target.loaded = false;
            target.dirty = false;
            target.is_root = source.is_root;
            target.is_leaf = source.is_leaf;
            target.object_number = source.object_number;
            target.object_offset = source.object_offset;
            target.object_length = source.object_length;
        }
        Ok(())
    }

    fn clone_key(&self, key: &K) -> Result<K> {
        let packed = self.callbacks.pack_key(key)?;
        let (key, consumed) = self.callbacks.unpack_key(&packed)?;
        if consumed != packed.len() {
            return Err(CairnError::SerializationMismatch {
                packed: packed.len(),
                consumed,
            });
        }
        Ok(key)
    }

    fn clone_value(&self, value: &V) -> Result<V> {
        let packed = self.callbacks.pack_value(value)?;
        let (value, consumed) = self.callbacks.unpack_value(&packed)?;
        if consumed != packed.len() {
            return Err(CairnError::SerializationMismatch {
                packed: packed.len(),
                consumed,
            });
        }
        Ok(value)
    }
}
