//! A single account held in the state cache.

use chain_types::{EMPTY_CODE_HASH, EMPTY_TRIE_HASH};
use ethereum_types::{H256, U256};
use keccak_hash::keccak;
use mpt_db::{DatabaseHandle, Trie, TrieResult};
use rlp_derive::{RlpDecodable, RlpEncodable};

/// The account leaf as committed into the world trie.
#[derive(Clone, Copy, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct Account {
    /// Number of transactions sent (or, for contracts, creations made).
    pub nonce: u64,
    /// Balance in wei.
    pub balance: U256,
    /// Root of the account's storage trie.
    pub storage_root: H256,
    /// Hash of the account's code.
    pub code_hash: H256,
}

impl Default for Account {
    fn default() -> Self {
        Self {
            nonce: 0,
            balance: U256::zero(),
            storage_root: EMPTY_TRIE_HASH,
            code_hash: EMPTY_CODE_HASH,
        }
    }
}

/// An account pulled into memory, together with its pending mutations.
#[derive(Debug)]
pub(crate) struct StateObject {
    pub(crate) nonce: u64,
    pub(crate) balance: U256,
    pub(crate) code_hash: H256,
    pub(crate) code: Vec<u8>,
    /// The account's storage trie, rooted at the last committed root.
    pub(crate) storage_trie: Trie,
    /// Storage writes not yet flushed into the trie. Cleared by
    /// `State::update`.
    pub(crate) overlay: std::collections::HashMap<H256, H256>,
    /// Account fields or storage changed since the last `update`.
    pub(crate) dirty: bool,
    /// Code changed and must be written out at `sync`.
    pub(crate) code_dirty: bool,
}

impl StateObject {
    /// A zero-valued account that exists only in memory so far.
    pub(crate) fn fresh(db: DatabaseHandle) -> Self {
        Self {
            nonce: 0,
            balance: U256::zero(),
            code_hash: EMPTY_CODE_HASH,
            code: Vec::new(),
            storage_trie: Trie::new(db),
            overlay: Default::default(),
            dirty: true,
            code_dirty: false,
        }
    }

    /// Rehydrates an account from its committed leaf. `code` must be the
    /// preimage of `account.code_hash`.
    pub(crate) fn from_account(account: Account, code: Vec<u8>, db: DatabaseHandle) -> Self {
        Self {
            nonce: account.nonce,
            balance: account.balance,
            code_hash: account.code_hash,
            code,
            storage_trie: Trie::open(db, account.storage_root),
            overlay: Default::default(),
            dirty: false,
            code_dirty: false,
        }
    }

    /// Reads a storage slot: pending writes shadow the trie.
    pub(crate) fn storage(&self, key: H256) -> TrieResult<H256> {
        if let Some(value) = self.overlay.get(&key) {
            return Ok(*value);
        }
        let stored = self.storage_trie.get(keccak(key.as_bytes()).as_bytes())?;
        Ok(match stored {
            // Slot values are stored as trimmed big-endian RLP.
            Some(bytes) => {
                let value: U256 = rlp::decode(&bytes).unwrap_or_default();
                let mut buf = [0u8; 32];
                value.to_big_endian(&mut buf);
                H256(buf)
            }
            None => H256::zero(),
        })
    }

    /// Flushes the overlay into the storage trie; zero values delete their
    /// slot. Returns the new storage root.
    pub(crate) fn flush_storage(&mut self) -> TrieResult<H256> {
        let mut writes: Vec<(H256, H256)> = self.overlay.drain().collect();
        writes.sort();
        for (key, value) in writes {
            let trie_key = keccak(key.as_bytes());
            match value.is_zero() {
                true => {
                    self.storage_trie.remove(trie_key.as_bytes())?;
                }
                false => {
                    let slot = U256::from_big_endian(value.as_bytes());
                    self.storage_trie
                        .insert(trie_key.as_bytes(), rlp::encode(&slot).to_vec())?;
                }
            }
        }
        Ok(self.storage_trie.root_hash())
    }

    /// The committable account leaf. Only meaningful after
    /// [`StateObject::flush_storage`].
    pub(crate) fn account(&mut self) -> Account {
        Account {
            nonce: self.nonce,
            balance: self.balance,
            storage_root: self.storage_trie.root_hash(),
            code_hash: self.code_hash,
        }
    }
}
