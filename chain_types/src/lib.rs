//! The value types every consensus rule is written against: block headers,
//! transactions, receipts and logs, plus their canonical RLP encodings and
//! the derived Merkle roots and bloom filters headers commit to.
//!
//! Hashing a value always means hashing its RLP encoding with keccak-256, so
//! every type's codec and its identity are defined in one place here.

#![deny(rustdoc::broken_intra_doc_links)]
#![warn(missing_debug_implementations)]

use ethereum_types::H256;

pub mod block;
pub mod bloom;
pub mod derive;
pub mod header;
pub mod receipt;
pub mod transaction;

pub use block::{uncles_hash, Block};
pub use bloom::{log_bloom, logs_bloom};
pub use derive::ordered_trie_root;
pub use header::Header;
pub use receipt::{Log, Receipt};
pub use transaction::{SignatureError, Transaction};

/// The hash of an account's empty EVM code.
/// 0xc5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470
pub const EMPTY_CODE_HASH: H256 = H256([
    197, 210, 70, 1, 134, 247, 35, 60, 146, 126, 125, 178, 220, 199, 3, 192, 229, 0, 182, 83, 202,
    130, 39, 59, 123, 250, 216, 4, 93, 133, 164, 112,
]);

/// The root hash of an empty Merkle Patricia trie.
/// 0x56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421
pub const EMPTY_TRIE_HASH: H256 = H256([
    86, 232, 31, 23, 27, 204, 85, 166, 255, 131, 69, 230, 146, 192, 248, 110, 91, 72, 224, 27, 153,
    108, 173, 192, 1, 98, 47, 181, 227, 99, 180, 33,
]);

#[test]
fn empty_code_hash_matches_keccak() {
    assert_eq!(EMPTY_CODE_HASH, keccak_hash::keccak([]));
}

#[test]
fn empty_trie_hash_matches_null_rlp() {
    assert_eq!(EMPTY_TRIE_HASH, keccak_hash::KECCAK_NULL_RLP);
}
