//! The consensus block header.

use bytes::Bytes;
use ethereum_types::{Address, Bloom, H256, H64, U256};
use keccak_hash::keccak;
use rlp::RlpStream;
use rlp_derive::{RlpDecodable, RlpEncodable};

/// A block header.
///
/// Field order is the canonical RLP order, and the codec is derived from the
/// struct, so the two can never drift apart. `number` and `time` are plain
/// 64-bit integers; difficulty, gas and wei amounts are 256-bit.
#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Header {
    /// Hash of the parent block's header.
    pub parent_hash: H256,
    /// `keccak(rlp(uncles))` of this block's uncle list.
    pub uncle_hash: H256,
    /// Address credited with the block reward and transaction fees.
    pub coinbase: Address,
    /// Root of the world-state trie after applying this block.
    pub state_root: H256,
    /// Merkle root over `rlp(index) -> rlp(transaction)`.
    pub tx_hash: H256,
    /// Merkle root over `rlp(index) -> rlp(receipt)`.
    pub receipt_hash: H256,
    /// OR of every receipt's log bloom.
    pub bloom: Bloom,
    /// Proof-of-work difficulty target of this block.
    pub difficulty: U256,
    /// Height; the parent's number plus one.
    pub number: u64,
    /// Gas ceiling for the block's transactions.
    pub gas_limit: U256,
    /// Gas actually consumed by the block's transactions.
    pub gas_used: U256,
    /// Timestamp in seconds; strictly greater than the parent's.
    pub time: u64,
    /// Arbitrary extra bytes, bounded by the chain parameters.
    pub extra: Bytes,
    /// Proof-of-work intermediate digest.
    pub mix_digest: H256,
    /// Proof-of-work nonce.
    pub nonce: H64,
}

impl Header {
    /// The hash identifying this header (and its block).
    pub fn hash(&self) -> H256 {
        keccak(rlp::encode(self))
    }

    /// Hash of the header without its seal (`mix_digest`, `nonce`): the
    /// message the proof-of-work search commits to.
    pub fn seal_hash(&self) -> H256 {
        let mut s = RlpStream::new_list(13);
        s.append(&self.parent_hash);
        s.append(&self.uncle_hash);
        s.append(&self.coinbase);
        s.append(&self.state_root);
        s.append(&self.tx_hash);
        s.append(&self.receipt_hash);
        s.append(&self.bloom);
        s.append(&self.difficulty);
        s.append(&self.number);
        s.append(&self.gas_limit);
        s.append(&self.gas_used);
        s.append(&self.time);
        s.append(&self.extra);
        keccak(s.out())
    }
}
