//! Chain parameters.
//!
//! Every consensus constant lives in a [`ChainParams`] value handed to the
//! processor at construction. Nothing in this crate reads a process-wide
//! constant, which is what lets several networks (or a test harness with a
//! trivial difficulty floor) coexist in one process.

use chain_types::Header;
use ethereum_types::U256;
use serde::{Deserialize, Serialize};

/// Consensus parameters of one chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainParams {
    /// Upper bound on `header.extra` length, in bytes.
    pub maximum_extra_data_size: usize,
    /// Lower bound on any block's gas limit.
    pub min_gas_limit: U256,
    /// A block's gas limit must differ from its parent's by less than
    /// `parent.gas_limit / gas_limit_bound_divisor`.
    pub gas_limit_bound_divisor: U256,
    /// Floor of the difficulty adjustment.
    pub minimum_difficulty: U256,
    /// Difficulty moves by `parent.difficulty / difficulty_bound_divisor`
    /// per block.
    pub difficulty_bound_divisor: U256,
    /// Block-time threshold, in seconds, below which difficulty rises.
    pub duration_limit: u64,
    /// Wei minted to the coinbase of each block.
    pub block_reward: U256,
    /// Base gas charged to every transaction.
    pub tx_gas: U256,
    /// Gas per zero byte of transaction data.
    pub tx_data_zero_gas: U256,
    /// Gas per non-zero byte of transaction data.
    pub tx_data_non_zero_gas: U256,
    /// Most uncles a single block may include.
    pub max_uncles: usize,
    /// How many ancestors back an uncle's parent may sit.
    pub uncle_ancestry_depth: u64,
    /// Seconds a header's timestamp may run ahead of the wall clock.
    pub max_future_drift: u64,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            maximum_extra_data_size: 32,
            min_gas_limit: U256::from(125_000),
            gas_limit_bound_divisor: U256::from(1024),
            minimum_difficulty: U256::from(131_072),
            difficulty_bound_divisor: U256::from(2048),
            duration_limit: 13,
            block_reward: U256::from(5) * U256::exp10(18),
            tx_gas: U256::from(21_000),
            tx_data_zero_gas: U256::from(4),
            tx_data_non_zero_gas: U256::from(68),
            max_uncles: 2,
            uncle_ancestry_depth: 7,
            max_future_drift: 4,
        }
    }
}

impl ChainParams {
    /// The difficulty a child of `parent` stamped with `time` must carry:
    /// the parent's difficulty nudged up for fast blocks and down for slow
    /// ones, never below the configured minimum.
    pub fn calc_difficulty(&self, time: u64, parent: &Header) -> U256 {
        let adjustment = parent.difficulty / self.difficulty_bound_divisor;
        let raised = time.saturating_sub(parent.time) < self.duration_limit;
        let difficulty = match raised {
            true => parent.difficulty + adjustment,
            false => parent.difficulty.saturating_sub(adjustment),
        };
        difficulty.max(self.minimum_difficulty)
    }

    /// Gas charged to a transaction before the first opcode runs.
    pub fn intrinsic_gas(&self, data: &[u8]) -> U256 {
        let zero_bytes = data.iter().filter(|b| **b == 0).count();
        let non_zero_bytes = data.len() - zero_bytes;
        self.tx_gas
            + self.tx_data_zero_gas * U256::from(zero_bytes)
            + self.tx_data_non_zero_gas * U256::from(non_zero_bytes)
    }
}
