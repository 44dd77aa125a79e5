//! On-disk node encoding.
//!
//! All integers are little-endian with no padding. A persisted node is:
//!
//! ```text
//! +------------------------+ 0
//! | items: u64             | 8
//! | root: u8 (0 or 1)      | 9
//! | leaf: u8 (0 or 1)      | 10
//! | payload_length: u64    | 18 (NODE_HEADER_SIZE)
//! +------------------------+
//! | payload                |
//! +------------------------+
//! ```
//!
//! Payload contents depend on the flags: a root payload starts with the
//! tree's `max_keys_per_node`; a leaf payload is a count followed by packed
//! key/value pairs; an internal payload is a child count followed by the
//! leftmost child reference and packed separator / child-reference pairs.

use bytes::{Bytes, BytesMut};
use cairn_common::{CairnError, Result};

/// Size of the fixed node header.
pub(crate) const NODE_HEADER_SIZE: usize = 18;

/// Size of an encoded child reference.
pub(crate) const CHILD_REF_SIZE: usize = 32;

/// Fixed header fields of a persisted node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct NodeHeader {
    pub items: u64,
    pub root: bool,
    pub leaf: bool,
}

/// Reference to a child node within an internal payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChildRef {
    pub object_number: u64,
    pub object_offset: u64,
    pub object_length: u64,
    pub items: u64,
}

pub(crate) fn put_u64(buf: &mut BytesMut, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_child_ref(buf: &mut BytesMut, child: &ChildRef) {
    put_u64(buf, child.object_number);
    put_u64(buf, child.object_offset);
    put_u64(buf, child.object_length);
    put_u64(buf, child.items);
}

/// Assembles the full node blob from its header and payload.
pub(crate) fn encode_node(header: &NodeHeader, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(NODE_HEADER_SIZE + payload.len());
    put_u64(&mut buf, header.items);
    buf.extend_from_slice(&[header.root as u8, header.leaf as u8]);
    put_u64(&mut buf, payload.len() as u64);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Splits a node blob into its header and payload, verifying the declared
/// payload length against the blob.
pub(crate) fn decode_node(blob: &[u8]) -> Result<(NodeHeader, &[u8])> {
    let mut reader = PayloadReader::new(blob);
    let items = reader.read_u64()?;
    let root = reader.read_bool()?;
    let leaf = reader.read_bool()?;
    let payload_length = reader.read_u64()? as usize;
    let payload = reader.rest();
    if payload.len() != payload_length {
        return Err(CairnError::CorruptNode(format!(
            "payload length {} disagrees with blob ({} bytes remain)",
            payload_length,
            payload.len()
        )));
    }
    Ok((NodeHeader { items, root, leaf }, payload))
}

/// Sequential little-endian reader over a payload slice.
pub(crate) struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn rest(&self) -> &'a [u8] {
        self.buf
    }

    /// Consumes `count` bytes, as reported by a caller-driven unpack.
    pub fn advance(&mut self, count: usize) -> Result<()> {
        if count > self.buf.len() {
            return Err(CairnError::CorruptNode(format!(
                "unpack consumed {} bytes with only {} available",
                count,
                self.buf.len()
            )));
        }
        self.buf = &self.buf[count..];
        Ok(())
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        if self.buf.len() < 8 {
            return Err(CairnError::CorruptNode(format!(
                "truncated u64 field ({} bytes remain)",
                self.buf.len()
            )));
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.buf[..8]);
        self.buf = &self.buf[8..];
        Ok(u64::from_le_bytes(raw))
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        match self.buf.first() {
            Some(&0) => {
                self.buf = &self.buf[1..];
                Ok(false)
            }
            Some(&1) => {
                self.buf = &self.buf[1..];
                Ok(true)
            }
            Some(&other) => Err(CairnError::CorruptNode(format!(
                "flag byte must be 0 or 1, found {other}"
            ))),
            None => Err(CairnError::CorruptNode("truncated flag byte".to_string())),
        }
    }

    pub fn read_child_ref(&mut self) -> Result<ChildRef> {
        Ok(ChildRef {
            object_number: self.read_u64()?,
            object_offset: self.read_u64()?,
            object_length: self.read_u64()?,
            items: self.read_u64()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_roundtrip() {
        let header = NodeHeader {
            items: 42,
            root: true,
            leaf: false,
        };
        let payload = [7u8, 8, 9];
        let blob = encode_node(&header, &payload);
        assert_eq!(blob.len(), NODE_HEADER_SIZE + payload.len());

        let (decoded, decoded_payload) = decode_node(&blob).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded_payload, &payload);
    }

    #[test]
    fn test_node_layout_is_little_endian() {
        let header = NodeHeader {
            items: 0x0102,
            root: false,
            leaf: true,
        };
        let blob = encode_node(&header, &[]);
        assert_eq!(&blob[..8], &[0x02, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(blob[8], 0);
        assert_eq!(blob[9], 1);
        assert_eq!(&blob[10..18], &[0u8; 8]);
    }

    #[test]
    fn test_child_ref_roundtrip() {
        let child = ChildRef {
            object_number: 1,
            object_offset: 2,
            object_length: 3,
            items: 4,
        };
        let mut buf = BytesMut::new();
        put_child_ref(&mut buf, &child);
        assert_eq!(buf.len(), CHILD_REF_SIZE);

        let mut reader = PayloadReader::new(&buf);
        assert_eq!(reader.read_child_ref().unwrap(), child);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let blob = encode_node(
            &NodeHeader {
                items: 0,
                root: false,
                leaf: true,
            },
            &[1, 2, 3],
        );
        assert!(decode_node(&blob[..blob.len() - 1]).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_flag() {
        let mut blob = BytesMut::new();
        put_u64(&mut blob, 0);
        blob.extend_from_slice(&[2u8, 0]);
        put_u64(&mut blob, 0);
        assert!(matches!(
            decode_node(&blob),
            Err(CairnError::CorruptNode(_))
        ));
    }

    #[test]
    fn test_reader_advance_bounds() {
        let data = [1u8, 2, 3];
        let mut reader = PayloadReader::new(&data);
        assert!(reader.advance(2).is_ok());
        assert_eq!(reader.remaining(), 1);
        assert!(reader.advance(2).is_err());
        assert!(reader.read_u64().is_err());
    }
}
