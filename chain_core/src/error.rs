//! The failure taxonomy of block processing.
//!
//! The variants map to how a caller should react: `KnownBlock` is an
//! idempotent no-op, `UnknownParent` is retryable once the parent arrives,
//! `FutureBlock` is retryable once the wall clock catches up, and everything
//! else is a permanent rejection (and typically a peer-scoring signal).

use ethereum_types::{Bloom, H256, U256};
use thiserror::Error;

use crate::{executor::ExecutionError, state::StateError};

/// Why a block was not processed.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The chain already contains this block.
    #[error("block {number} already known ({hash:?})")]
    KnownBlock {
        /// Height of the known block.
        number: u64,
        /// Its hash.
        hash: H256,
    },

    /// The block's parent has not been imported yet.
    #[error("parent {0:?} unknown")]
    UnknownParent(H256),

    /// The header's timestamp is too far ahead of the wall clock.
    #[error("block time {time} is more than {drift}s in the future")]
    FutureBlock {
        /// The offending timestamp.
        time: u64,
        /// The allowed drift, in seconds.
        drift: u64,
    },

    /// A header-only rule failed.
    #[error("invalid header: {0}")]
    Header(#[from] HeaderError),

    /// A derived quantity disagreed with what the header commits to.
    #[error("invalid body: {0}")]
    Body(#[from] BodyError),

    /// A transaction violated a nonce, gas or signature rule.
    #[error("invalid transaction at index {index}: {source}")]
    Transaction {
        /// Position of the offending transaction in the block.
        index: usize,
        /// The executor's verdict.
        source: ExecutionError,
    },

    /// An uncle violated uniqueness, ancestry or validity rules.
    #[error("invalid uncle: {0}")]
    Uncle(#[from] UncleError),

    /// The backing state store failed; the block's validity is undecided.
    #[error("state access failed: {0}")]
    State(#[from] StateError),
}

/// Header-only rule violations.
#[derive(Debug, Error)]
pub enum HeaderError {
    /// `extra` is longer than the chain allows.
    #[error("extra data is {len} bytes, limit {max}")]
    ExtraDataTooLong {
        /// Actual length.
        len: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// The stamped difficulty is not the calculated one.
    #[error("difficulty {have} does not match calculated {want}")]
    Difficulty {
        /// Stamped value.
        have: U256,
        /// Calculated value.
        want: U256,
    },

    /// The gas limit moved too far from the parent's, or under the floor.
    #[error("gas limit {have} out of bounds (parent {parent})")]
    GasLimit {
        /// Stamped value.
        have: U256,
        /// Parent's gas limit.
        parent: U256,
    },

    /// The height is not parent + 1.
    #[error("block number {have} is not {parent} + 1")]
    Number {
        /// Stamped height.
        have: u64,
        /// Parent height.
        parent: u64,
    },

    /// The timestamp does not advance past the parent's.
    #[error("block time {have} not after parent time {parent}")]
    Timestamp {
        /// Stamped time.
        have: u64,
        /// Parent time.
        parent: u64,
    },

    /// The proof-of-work seal does not meet the difficulty target.
    #[error("proof-of-work nonce is invalid")]
    InvalidPow,
}

/// Mismatches between derived quantities and header commitments.
#[derive(Debug, Error)]
pub enum BodyError {
    /// More uncles than the chain allows.
    #[error("{count} uncles, limit {max}")]
    TooManyUncles {
        /// Included uncle count.
        count: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// Σ gas used disagrees with the header.
    #[error("gas used mismatch (header {header}, computed {computed})")]
    GasUsed {
        /// Header's claim.
        header: U256,
        /// Replay result.
        computed: U256,
    },

    /// OR of receipt blooms disagrees with the header.
    #[error("bloom mismatch (computed {computed:?})")]
    Bloom {
        /// Replay result.
        computed: Box<Bloom>,
    },

    /// Transaction root disagrees with the header.
    #[error("transaction root mismatch (header {header:?}, computed {computed:?})")]
    TxRoot {
        /// Header's claim.
        header: H256,
        /// Replay result.
        computed: H256,
    },

    /// Receipt root disagrees with the header.
    #[error("receipt root mismatch (header {header:?}, computed {computed:?})")]
    ReceiptRoot {
        /// Header's claim.
        header: H256,
        /// Replay result.
        computed: H256,
    },

    /// State root disagrees with the header.
    #[error("state root mismatch (header {header:?}, computed {computed:?})")]
    StateRoot {
        /// Header's claim.
        header: H256,
        /// Replay result.
        computed: H256,
    },
}

/// Uncle rule violations.
#[derive(Debug, Error)]
pub enum UncleError {
    /// Already included by this block or a recent ancestor, or is the block
    /// itself.
    #[error("uncle {0:?} is not unique")]
    NotUnique(H256),

    /// The uncle is itself on the ancestor chain.
    #[error("uncle {0:?} is an ancestor")]
    IsAncestor(H256),

    /// The uncle's parent is not a recent ancestor.
    #[error("uncle parent {0:?} is not a known recent ancestor")]
    UnknownParent(H256),

    /// The uncle's own header fails validation against its parent.
    #[error("uncle {hash:?} header invalid: {source}")]
    Invalid {
        /// The uncle's hash.
        hash: H256,
        /// What its header validation reported.
        source: Box<ProcessError>,
    },

    /// The uncle sits outside the depth window the reward formula covers.
    #[error("uncle {hash:?} at depth {depth} is outside the reward window")]
    DepthOutOfRange {
        /// The uncle's hash.
        hash: H256,
        /// `block.number - uncle.number`.
        depth: u64,
    },
}

