//! Index-keyed Merkle roots, as committed to by `tx_hash` and
//! `receipt_hash` in the header.

use std::sync::Arc;

use ethereum_types::H256;
use mpt_db::{MemoryDb, Trie};

/// Merkle root of the trie `rlp(index) -> items[index]`, built over a
/// throwaway in-memory store. The items are expected to be RLP encodings
/// already; this function does not re-encode them.
pub fn ordered_trie_root<I>(items: I) -> H256
where
    I: IntoIterator<Item = Vec<u8>>,
{
    let mut trie = Trie::new(Arc::new(MemoryDb::new()));
    for (index, item) in items.into_iter().enumerate() {
        trie.insert(&rlp::encode(&index), item)
            .expect("an in-memory trie has no unresolved nodes");
    }
    trie.root_hash()
}
