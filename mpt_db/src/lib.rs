//! A Merkle Patricia trie that lives in a byte-keyed database.
//!
//! The world state of a chain is too large to rebuild from scratch on every
//! block, so this trie is split across two layers:
//! - a [`Database`][db::Database]: a durable, dumb `bytes -> bytes` map whose
//!   keys are the keccak hashes of RLP-encoded trie nodes, and
//! - an in-memory overlay of decoded [`Node`][node::Node]s reachable from the
//!   root of a [`Trie`][trie::Trie].
//!
//! Reads pull nodes out of the database on demand; writes only ever touch the
//! overlay. Nothing reaches the database until [`Trie::commit`][trie::Trie::commit]
//! is called, which is what lets a validation attempt be thrown away without
//! leaving half-applied state behind.
//!
//! Because nodes are content-addressed, any number of tries may be open over
//! the same database at once, sharing every node they have in common.

#![deny(rustdoc::broken_intra_doc_links)]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]

pub mod db;
pub mod nibbles;
pub mod node;
pub mod trie;

pub use db::{Database, DatabaseHandle, MemoryDb};
pub use nibbles::Nibbles;
pub use trie::{Trie, TrieError, TrieResult};
