//! Persistent order-statistic B+Tree.
//!
//! `cairn-btree` provides [`BPlusTree`], a sorted map over opaque keys and
//! values that supports both keyed and positional access in O(log n):
//! lookup by key or by rank, bisection returning global ranks, insertion,
//! deletion by key or rank, and in-place patching. Nodes are persisted to a
//! caller-supplied content-addressable object store through the
//! [`TreeCallbacks`] trait and re-loaded lazily on demand, so a tree far
//! larger than memory can be navigated by materializing one root-to-leaf
//! path at a time.
//!
//! ## Structure
//!
//! ```text
//!                       [internal node]
//!          separators:  [k20, k40]          (order-statistic map)
//!          prefix sums: balanced tree over child item counts
//!         /                  |                  \
//!   [leaf 0]             [leaf 1]             [leaf 2]
//!   k0..k19 entries      k20..k39             k40..
//! ```
//!
//! Each internal node carries a *prefix-sum index*: a balanced binary tree
//! over its children in position order, keyed by cumulative subtree item
//! counts. Rank descents and rank-offset accumulation both resolve in
//! O(log fanout) per level without scanning siblings.
//!
//! ## Persistence
//!
//! Mutations only touch memory and mark nodes dirty; [`BPlusTree::flush`]
//! writes dirty nodes in post-order (children strictly before parents, so a
//! parent always references just-committed child addresses) and returns the
//! root's address, which is the only handle needed to re-open the tree with
//! [`BPlusTree::open`]. Clean subtrees can be dropped from memory with
//! [`BPlusTree::purge`] and are re-loaded transparently when touched.
//!
//! All operations on one tree serialize behind a single mutex; separate
//! trees share nothing. [`BPlusTree::clone_with`] produces a logically equal
//! tree with an independent node graph, where clean subtrees share only
//! on-disk bytes.

pub mod callbacks;
pub mod llrb;

mod node;
mod persist;
mod prefix;
mod tree;
mod validate;
mod wire;

pub use cairn_common::{CairnError, Result, TreeConfig};
pub use callbacks::TreeCallbacks;
pub use llrb::LlrbMap;
pub use tree::{BPlusTree, DimensionsReport, LayoutReport, RootLocation};

/// User-supplied total-order comparator; authoritative for key ordering
/// everywhere in the tree.
pub type Compare<K> = fn(&K, &K) -> std::cmp::Ordering;

/// Ready-made comparator for keys with a natural order.
pub fn compare_ord<K: Ord>(a: &K, b: &K) -> std::cmp::Ordering {
    a.cmp(b)
}
