//! Caller-supplied object store and serialization callbacks.

use bytes::Bytes;
use cairn_common::Result;

/// The embedding supplies the tree's persistence backend and the key/value
/// packers through this trait. Callbacks run while the tree's mutex is held
/// and must not re-enter the same tree.
///
/// Errors returned from any callback abort the current operation and are
/// forwarded to the caller unchanged; the tree applies no partial mutation.
pub trait TreeCallbacks<K, V> {
    /// Returns the exact bytes previously written at the given address.
    fn get_node(&mut self, object_number: u64, object_offset: u64, object_length: u64)
        -> Result<Bytes>;

    /// Appends `blob` to the store. The returned `(object_number,
    /// object_offset)` pair plus `blob.len()` forms the blob's address.
    fn put_node(&mut self, blob: &[u8]) -> Result<(u64, u64)>;

    /// Serializes a key.
    fn pack_key(&self, key: &K) -> Result<Bytes>;

    /// Deserializes one key from the front of `buf`, returning it together
    /// with the number of bytes consumed. Must consume exactly the bytes the
    /// matching `pack_key` produced.
    fn unpack_key(&self, buf: &[u8]) -> Result<(K, usize)>;

    /// Serializes a value.
    fn pack_value(&self, value: &V) -> Result<Bytes>;

    /// Deserializes one value from the front of `buf`; same contract as
    /// `unpack_key`.
    fn unpack_value(&self, buf: &[u8]) -> Result<(V, usize)>;
}
