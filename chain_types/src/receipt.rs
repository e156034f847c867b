//! Execution receipts and the logs they carry.

use bytes::Bytes;
use ethereum_types::{Address, Bloom, H256, U256};
use rlp_derive::{RlpDecodable, RlpEncodable};

use crate::bloom::logs_bloom;

/// A log emitted by contract execution.
#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Log {
    /// The contract that emitted the log.
    pub address: Address,
    /// Zero to four indexed topics.
    pub topics: Vec<H256>,
    /// Unindexed payload bytes.
    pub data: Bytes,
}

/// Per-transaction execution summary, committed into the block's receipt
/// trie. One receipt per transaction, in execution order.
#[derive(Clone, Debug, Default, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Receipt {
    /// World-state root after this transaction.
    pub post_state: H256,
    /// Gas used by the block up to and including this transaction.
    pub cumulative_gas_used: U256,
    /// Bloom over this receipt's logs.
    pub bloom: Bloom,
    /// The logs this transaction emitted.
    pub logs: Vec<Log>,
}

impl Receipt {
    /// Builds a receipt, deriving the bloom from `logs`.
    pub fn new(post_state: H256, cumulative_gas_used: U256, logs: Vec<Log>) -> Self {
        Self {
            post_state,
            cumulative_gas_used,
            bloom: logs_bloom(&logs),
            logs,
        }
    }
}
