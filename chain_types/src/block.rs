//! Blocks: a header plus its transactions and uncle headers.

use ethereum_types::H256;
use keccak_hash::keccak;
use rlp::RlpStream;
use rlp_derive::{RlpDecodable, RlpEncodable};

use crate::{header::Header, transaction::Transaction};

/// The unit of consensus. Once committed, a block is immutable.
#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Block {
    /// The sealed header.
    pub header: Header,
    /// Transactions, in execution order.
    pub transactions: Vec<Transaction>,
    /// Included uncle headers (at most two).
    pub uncles: Vec<Header>,
}

impl Block {
    /// Assembles a block from its parts.
    pub fn new(header: Header, transactions: Vec<Transaction>, uncles: Vec<Header>) -> Self {
        Self {
            header,
            transactions,
            uncles,
        }
    }

    /// The block's identifying hash (its header's hash).
    pub fn hash(&self) -> H256 {
        self.header.hash()
    }

    /// The block height.
    pub fn number(&self) -> u64 {
        self.header.number
    }
}

/// `keccak(rlp(uncles))`: the value `Header::uncle_hash` commits to.
pub fn uncles_hash(uncles: &[Header]) -> H256 {
    let mut s = RlpStream::new();
    s.append_list(uncles);
    keccak(s.out())
}

#[cfg(test)]
mod tests {
    use ethereum_types::U256;

    use super::*;

    #[test]
    fn rlp_roundtrip() {
        let block = Block::new(
            Header {
                number: 7,
                difficulty: U256::from(131_072),
                ..Default::default()
            },
            vec![Transaction::default()],
            vec![Header::default()],
        );
        let decoded: Block = rlp::decode(&rlp::encode(&block)).unwrap();
        assert_eq!(decoded, block);
        assert_eq!(decoded.hash(), block.header.hash());
    }

    #[test]
    fn uncles_hash_distinguishes_lists() {
        assert_eq!(uncles_hash(&[]), keccak_hash::KECCAK_EMPTY_LIST_RLP);
        assert_ne!(uncles_hash(&[Header::default()]), uncles_hash(&[]));
    }
}
