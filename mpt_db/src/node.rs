//! In-memory trie nodes and their canonical RLP form.

use std::sync::Arc;

use ethereum_types::H256;
use keccak_hash::keccak;
use rlp::{DecoderError, Rlp, RlpStream};

use crate::nibbles::Nibbles;

/// Shared handle to a child node. `Arc` keeps unchanged subtries shared
/// between tries opened over the same database.
pub type NodeHandle = Arc<Node>;

/// A node of the Merkle Patricia trie.
///
/// `Hash` children reference nodes that live in the backing store and have
/// not been pulled into memory yet; [`Trie`][crate::trie::Trie] resolves them
/// on demand.
#[derive(Clone, Debug, Default)]
pub enum Node {
    /// The empty trie.
    #[default]
    Empty,
    /// A node kept in the backing store, referenced by the keccak hash of its
    /// encoding.
    Hash(H256),
    /// Terminal node holding a value under the remaining path.
    Leaf {
        /// Path from the parent down to the value.
        partial: Nibbles,
        /// The stored value. Never empty.
        value: Vec<u8>,
    },
    /// A shared path segment with a single child.
    Extension {
        /// Path prefix common to everything below.
        prefix: Nibbles,
        /// The node the prefix leads to.
        child: NodeHandle,
    },
    /// Sixteen-way fork, with an optional value of its own for keys ending
    /// exactly here.
    Branch {
        /// One child per next-nibble.
        children: [NodeHandle; 16],
        /// Value stored at the branch itself; empty when absent.
        value: Vec<u8>,
    },
}

/// An encoded node reference, as it appears inside its parent.
pub(crate) enum NodeRef {
    /// Encoding shorter than 32 bytes, inlined into the parent.
    Inline(Vec<u8>),
    /// Keccak hash of the encoding.
    Digest(H256),
}

/// Forces byte-string RLP for a slice, sidestepping any list
/// interpretation of byte containers.
struct ByteStr<'a>(&'a [u8]);

impl rlp::Encodable for ByteStr<'_> {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.encoder().encode_value(self.0);
    }
}

impl Node {
    /// Sixteen empty children for a fresh branch.
    pub(crate) fn empty_children() -> [NodeHandle; 16] {
        std::array::from_fn(|_| Arc::new(Node::Empty))
    }

    /// RLP-encodes the node, handing every encoding of at least 32 bytes to
    /// `sink` keyed by its hash. Shorter encodings are inlined into the
    /// parent instead of being hashed.
    pub(crate) fn encode(&self, sink: &mut dyn FnMut(H256, &[u8])) -> NodeRef {
        match self {
            Node::Empty => NodeRef::Inline(rlp::NULL_RLP.to_vec()),
            Node::Hash(h) => NodeRef::Digest(*h),
            Node::Leaf { partial, value } => {
                let mut s = RlpStream::new_list(2);
                s.append(&ByteStr(&partial.hex_prefix(true)));
                s.append(&ByteStr(value));
                deliver(s.out().to_vec(), sink)
            }
            Node::Extension { prefix, child } => {
                let mut s = RlpStream::new_list(2);
                s.append(&ByteStr(&prefix.hex_prefix(false)));
                append_ref(&mut s, child.encode(sink));
                deliver(s.out().to_vec(), sink)
            }
            Node::Branch { children, value } => {
                let mut s = RlpStream::new_list(17);
                for child in children {
                    append_ref(&mut s, child.encode(sink));
                }
                s.append(&ByteStr(value));
                deliver(s.out().to_vec(), sink)
            }
        }
    }

    /// Hash of the node in root position. Unlike interior nodes, the root is
    /// hashed (and persisted) even when its encoding is under 32 bytes.
    pub(crate) fn root_hash(&self, sink: &mut dyn FnMut(H256, &[u8])) -> H256 {
        match self.encode(sink) {
            NodeRef::Inline(raw) => {
                let hash = keccak(&raw);
                sink(hash, &raw);
                hash
            }
            NodeRef::Digest(hash) => hash,
        }
    }

    /// Decodes a node from the encoding produced by [`Node::encode`].
    pub(crate) fn decode(bytes: &[u8]) -> Result<Node, DecoderError> {
        decode_rlp(&Rlp::new(bytes))
    }
}

fn deliver(bytes: Vec<u8>, sink: &mut dyn FnMut(H256, &[u8])) -> NodeRef {
    match bytes.len() < 32 {
        true => NodeRef::Inline(bytes),
        false => {
            let hash = keccak(&bytes);
            sink(hash, &bytes);
            NodeRef::Digest(hash)
        }
    }
}

fn append_ref(s: &mut RlpStream, node: NodeRef) {
    match node {
        NodeRef::Inline(raw) => s.append_raw(&raw, 1),
        NodeRef::Digest(hash) => s.append(&hash),
    };
}

fn decode_rlp(rlp: &Rlp<'_>) -> Result<Node, DecoderError> {
    if rlp.is_data() && rlp.data()?.is_empty() {
        return Ok(Node::Empty);
    }
    match rlp.item_count()? {
        2 => {
            let (path, leaf) = Nibbles::from_hex_prefix(rlp.at(0)?.data()?)
                .ok_or(DecoderError::Custom("malformed hex-prefix key"))?;
            match leaf {
                true => Ok(Node::Leaf {
                    partial: path,
                    value: rlp.at(1)?.data()?.to_vec(),
                }),
                false => Ok(Node::Extension {
                    prefix: path,
                    child: decode_ref(&rlp.at(1)?)?,
                }),
            }
        }
        17 => {
            let mut children = Node::empty_children();
            for (i, slot) in children.iter_mut().enumerate() {
                *slot = decode_ref(&rlp.at(i)?)?;
            }
            Ok(Node::Branch {
                children,
                value: rlp.at(16)?.data()?.to_vec(),
            })
        }
        _ => Err(DecoderError::Custom("trie node is neither a 2- nor a 17-list")),
    }
}

fn decode_ref(rlp: &Rlp<'_>) -> Result<NodeHandle, DecoderError> {
    if rlp.is_data() {
        let data = rlp.data()?;
        return match data.len() {
            0 => Ok(Arc::new(Node::Empty)),
            32 => Ok(Arc::new(Node::Hash(H256::from_slice(data)))),
            _ => Err(DecoderError::Custom("child reference is neither empty nor a hash")),
        };
    }
    // A child whose encoding was under 32 bytes, inlined by the parent.
    Ok(Arc::new(decode_rlp(rlp)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discard() -> impl FnMut(H256, &[u8]) {
        |_, _| {}
    }

    #[test]
    fn empty_node_encodes_to_null_rlp() {
        match Node::Empty.encode(&mut discard()) {
            NodeRef::Inline(raw) => assert_eq!(raw, rlp::NULL_RLP.to_vec()),
            NodeRef::Digest(_) => panic!("empty node must inline"),
        }
        assert_eq!(
            Node::Empty.root_hash(&mut discard()),
            keccak_hash::KECCAK_NULL_RLP
        );
    }

    #[test]
    fn small_leaf_inlines_large_leaf_hashes() {
        let small = Node::Leaf {
            partial: Nibbles::from_bytes(&[0x12]),
            value: vec![7],
        };
        assert!(matches!(small.encode(&mut discard()), NodeRef::Inline(_)));

        let large = Node::Leaf {
            partial: Nibbles::from_bytes(&[0x12]),
            value: vec![7; 40],
        };
        let mut sunk = Vec::new();
        match large.encode(&mut |h, bytes| sunk.push((h, bytes.to_vec()))) {
            NodeRef::Digest(h) => {
                assert_eq!(sunk.len(), 1);
                assert_eq!(sunk[0].0, h);
                assert_eq!(keccak(&sunk[0].1), h);
            }
            NodeRef::Inline(_) => panic!("40-byte value must hash"),
        }
    }

    #[test]
    fn decode_inverts_encode() {
        let leaf = Arc::new(Node::Leaf {
            partial: Nibbles::from_bytes(&[0x34, 0x56]),
            value: b"some stored value padded well past 32".to_vec(),
        });
        let mut children = Node::empty_children();
        children[3] = leaf;
        let branch = Node::Branch {
            children,
            value: vec![9],
        };

        let mut store = std::collections::HashMap::new();
        let root = branch.root_hash(&mut |h, bytes| {
            store.insert(h, bytes.to_vec());
        });

        let decoded = Node::decode(&store[&root]).unwrap();
        match decoded {
            Node::Branch { children, value } => {
                assert_eq!(value, vec![9]);
                // The large leaf was replaced by its hash reference.
                let child_hash = match children[3].as_ref() {
                    Node::Hash(h) => *h,
                    other => panic!("expected hash child, got {other:?}"),
                };
                let leaf = Node::decode(&store[&child_hash]).unwrap();
                assert!(matches!(leaf, Node::Leaf { .. }));
            }
            other => panic!("expected branch, got {other:?}"),
        }
    }
}
