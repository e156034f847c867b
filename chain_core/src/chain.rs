//! The chain store and genesis construction.
//!
//! The processor only ever sees the [`ChainReader`] capability; the
//! [`ChainManager`] below implements it over the `blockchain` namespace of
//! the data directory and is also what the assembling caller uses to insert
//! accepted blocks. Neither side owns the other.

use std::collections::BTreeMap;

use chain_types::{uncles_hash, Block, Header, EMPTY_TRIE_HASH};
use ethereum_types::{Address, H256, U256};
use mpt_db::DatabaseHandle;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::state::{State, StateError};

/// Read access to already-imported blocks.
pub trait ChainReader: Send + Sync {
    /// Returns `true` if `hash` is an imported block.
    fn has_block(&self, hash: H256) -> bool;

    /// Loads an imported block by hash.
    fn block(&self, hash: H256) -> Option<Block>;

    /// Up to `depth` ancestors of `block`, parent first.
    fn ancestors(&self, block: &Block, depth: u64) -> Vec<Block> {
        let mut out = Vec::new();
        let mut hash = block.header.parent_hash;
        for _ in 0..depth {
            match self.block(hash) {
                Some(ancestor) => {
                    hash = ancestor.header.parent_hash;
                    out.push(ancestor);
                }
                None => break,
            }
        }
        out
    }
}

/// One account's genesis allocation.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct GenesisAccount {
    /// Initial balance in wei.
    pub balance: U256,
    /// Initial nonce; zero for ordinary allocations.
    #[serde(default)]
    pub nonce: u64,
}

/// Everything needed to build block zero.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GenesisSpec {
    /// Difficulty stamped on the genesis header.
    pub difficulty: U256,
    /// Gas limit of the genesis header.
    pub gas_limit: U256,
    /// Coinbase of the genesis header.
    pub coinbase: Address,
    /// Extra bytes of the genesis header.
    pub extra: Vec<u8>,
    /// Timestamp of the genesis header.
    pub time: u64,
    /// Account allocations.
    pub alloc: BTreeMap<Address, GenesisAccount>,
}

impl Default for GenesisSpec {
    fn default() -> Self {
        Self {
            difficulty: U256::from(131_072),
            gas_limit: U256::from(3_141_592),
            coinbase: Address::zero(),
            extra: Vec::new(),
            time: 0,
            alloc: BTreeMap::new(),
        }
    }
}

impl GenesisSpec {
    /// Seeds the allocations into a fresh state over `state_db`, persists
    /// it, and returns the genesis block.
    pub fn build(&self, state_db: &DatabaseHandle) -> Result<Block, StateError> {
        let mut state = State::new(state_db.clone());
        for (address, account) in &self.alloc {
            state.add_balance(*address, account.balance)?;
            if account.nonce != 0 {
                state.set_nonce(*address, account.nonce)?;
            }
        }
        state.update()?;
        let state_root = state.root();
        state.sync();
        debug!(?state_root, accounts = self.alloc.len(), "built genesis state");

        let header = Header {
            parent_hash: H256::zero(),
            uncle_hash: uncles_hash(&[]),
            coinbase: self.coinbase,
            state_root,
            tx_hash: EMPTY_TRIE_HASH,
            receipt_hash: EMPTY_TRIE_HASH,
            difficulty: self.difficulty,
            number: 0,
            gas_limit: self.gas_limit,
            time: self.time,
            extra: self.extra.clone().into(),
            ..Default::default()
        };
        Ok(Block::new(header, Vec::new(), Vec::new()))
    }
}

/// Canonical-number index prefix in the `blockchain` namespace. Block
/// bodies are keyed by their raw hash.
const CANONICAL_PREFIX: &[u8] = b"canonical-";

fn number_key(number: u64) -> Vec<u8> {
    let mut key = CANONICAL_PREFIX.to_vec();
    key.extend_from_slice(&number.to_be_bytes());
    key
}

/// Block storage over the `blockchain` namespace: blocks keyed by hash plus
/// a canonical-number index. Fork choice is not decided here; `insert`
/// simply extends the canonical index and head.
pub struct ChainManager {
    db: DatabaseHandle,
    genesis: Block,
    head: RwLock<H256>,
}

impl ChainManager {
    /// Opens the store and writes `genesis` into it.
    pub fn new(db: DatabaseHandle, genesis: Block) -> Self {
        let manager = Self {
            head: RwLock::new(genesis.hash()),
            genesis: genesis.clone(),
            db,
        };
        manager.write_block(&genesis);
        manager
    }

    /// The genesis block.
    pub fn genesis(&self) -> &Block {
        &self.genesis
    }

    /// Hash of the current head block.
    pub fn head_hash(&self) -> H256 {
        *self.head.read()
    }

    /// The current head block.
    pub fn head(&self) -> Block {
        self.block(self.head_hash())
            .expect("head always points at a stored block")
    }

    /// Stores an accepted block, indexes its number and advances the head.
    pub fn insert(&self, block: &Block) {
        self.write_block(block);
        *self.head.write() = block.hash();
    }

    /// Canonical block at `number`, if indexed.
    pub fn block_by_number(&self, number: u64) -> Option<Block> {
        let hash = self.db.get(&number_key(number))?;
        self.block(H256::from_slice(&hash))
    }

    fn write_block(&self, block: &Block) {
        self.db
            .put(block.hash().as_bytes(), rlp::encode(block).to_vec());
        self.db
            .put(&number_key(block.number()), block.hash().as_bytes().to_vec());
    }
}

impl ChainReader for ChainManager {
    fn has_block(&self, hash: H256) -> bool {
        self.db.contains(hash.as_bytes())
    }

    fn block(&self, hash: H256) -> Option<Block> {
        let bytes = self.db.get(hash.as_bytes())?;
        match rlp::decode(&bytes) {
            Ok(block) => Some(block),
            Err(err) => {
                error!(?hash, %err, "stored block is undecodable");
                None
            }
        }
    }
}

impl std::fmt::Debug for ChainManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainManager")
            .field("genesis", &self.genesis.hash())
            .field("head", &self.head_hash())
            .finish_non_exhaustive()
    }
}
