//! The consensus-critical core of the node: everything that decides whether
//! a candidate block is valid and, if so, makes it durable.
//!
//! The center of the crate is [`processor::BlockProcessor`]: given a block
//! whose parent is already on the chain, it re-executes the block's
//! transactions against a fresh [`state::State`] rooted at the parent's
//! state root, checks the derived gas total, bloom, transaction root,
//! receipt root and state root against the header, verifies the uncles, pays
//! the rewards, and only then lets the new state touch the database. Any
//! deviation from these rules on any node forks it off the network, which is
//! why everything here is deterministic and nothing here is clever.
//!
//! The surrounding pieces are deliberately small and injected at
//! construction ([`params::ChainParams`], a [`pow::Pow`] verifier, a
//! [`chain::ChainReader`], the [`pool::TxPool`], an [`events::EventBus`]),
//! so multiple networks can coexist in one process and tests can substitute
//! any of them.

#![deny(rustdoc::broken_intra_doc_links)]
#![warn(missing_debug_implementations)]

pub mod chain;
pub mod error;
pub mod events;
pub mod evm;
pub mod executor;
pub mod params;
pub mod pool;
pub mod pow;
pub mod processor;
pub mod state;

pub use chain::{ChainManager, ChainReader, GenesisSpec};
pub use error::{BodyError, HeaderError, ProcessError, UncleError};
pub use events::{ChainEvent, EventBus};
pub use executor::{apply_message, ExecutedMessage, ExecutionError, GasPool};
pub use params::ChainParams;
pub use pool::TxPool;
pub use pow::{HashPow, Pow};
pub use processor::{accumulate_rewards, BlockProcessor};
pub use state::{State, StateError};
