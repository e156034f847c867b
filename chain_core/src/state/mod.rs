//! The journalled state database.
//!
//! A [`State`] is opened at a parent block's state root for every validation
//! attempt and thrown away on failure; only [`State::sync`] lets anything
//! reach the backing store. Mutations are journalled so the executor can
//! bracket sub-calls with [`State::snapshot`] / [`State::revert_to`], and
//! logs are captured per transaction so reverted frames drop theirs.

mod journal;
mod object;

use std::collections::HashMap;

use chain_types::{Log, EMPTY_CODE_HASH};
use ethereum_types::{Address, H256, U256};
use keccak_hash::keccak;
use mpt_db::{DatabaseHandle, Trie, TrieError};
use thiserror::Error;
use tracing::trace;

use journal::JournalEntry;
pub use object::Account;
use object::StateObject;

/// Failures while reading accounts out of the backing store.
#[derive(Debug, Error)]
pub enum StateError {
    /// The world or a storage trie is missing nodes or corrupt.
    #[error(transparent)]
    Trie(#[from] TrieError),

    /// An account leaf failed to decode.
    #[error("account {0:?} is undecodable: {1}")]
    Account(Address, rlp::DecoderError),

    /// An account references code the store does not have.
    #[error("code {0:?} missing from the state store")]
    MissingCode(H256),
}

/// The world state as seen by one validation attempt.
pub struct State {
    db: DatabaseHandle,
    trie: Trie,
    objects: HashMap<Address, StateObject>,
    journal: Vec<JournalEntry>,
    /// `(tx hash, log)` pairs in emission order.
    logs: Vec<(H256, Log)>,
    refund: U256,
    /// Current log-collection frame, set by [`State::start_record`].
    tx_hash: H256,
    tx_index: usize,
}

impl State {
    /// A state over an empty world trie.
    pub fn new(db: DatabaseHandle) -> Self {
        Self::open(keccak_hash::KECCAK_NULL_RLP, db)
    }

    /// Opens the world trie at `root`. Nothing is read until the first
    /// account access.
    pub fn open(root: H256, db: DatabaseHandle) -> Self {
        Self {
            trie: Trie::open(db.clone(), root),
            db,
            objects: HashMap::new(),
            journal: Vec::new(),
            logs: Vec::new(),
            refund: U256::zero(),
            tx_hash: H256::zero(),
            tx_index: 0,
        }
    }

    /// Returns the account's committed-or-pending field values, creating a
    /// zero-valued account if none exists.
    pub fn get_or_create(&mut self, address: Address) -> Result<Account, StateError> {
        self.ensure_loaded(address)?;
        let object = self.objects.get_mut(&address).expect("just loaded");
        Ok(object.account())
    }

    /// Returns `true` if the account exists (committed or created in this
    /// state).
    pub fn exists(&mut self, address: Address) -> Result<bool, StateError> {
        Ok(self.peek(address)?.is_some())
    }

    /// The account's balance; zero for absent accounts.
    pub fn balance(&mut self, address: Address) -> Result<U256, StateError> {
        Ok(self.peek(address)?.map(|o| o.balance).unwrap_or_default())
    }

    /// The account's nonce; zero for absent accounts.
    pub fn nonce(&mut self, address: Address) -> Result<u64, StateError> {
        Ok(self.peek(address)?.map(|o| o.nonce).unwrap_or_default())
    }

    /// The account's code; empty for absent accounts.
    pub fn code(&mut self, address: Address) -> Result<Vec<u8>, StateError> {
        Ok(self
            .peek(address)?
            .map(|o| o.code.clone())
            .unwrap_or_default())
    }

    /// A storage slot of the account; zero when unset.
    pub fn storage(&mut self, address: Address, key: H256) -> Result<H256, StateError> {
        match self.peek(address)? {
            Some(object) => Ok(object.storage(key)?),
            None => Ok(H256::zero()),
        }
    }

    /// Credits `amount` to the account, creating it if needed.
    pub fn add_balance(&mut self, address: Address, amount: U256) -> Result<(), StateError> {
        self.ensure_loaded(address)?;
        let object = self.objects.get_mut(&address).expect("just loaded");
        let prev = object.balance;
        object.balance = prev + amount;
        object.dirty = true;
        self.journal.push(JournalEntry::Balance { address, prev });
        Ok(())
    }

    /// Debits `amount` from the account. The caller must have checked the
    /// balance covers it.
    pub fn sub_balance(&mut self, address: Address, amount: U256) -> Result<(), StateError> {
        self.ensure_loaded(address)?;
        let object = self.objects.get_mut(&address).expect("just loaded");
        let prev = object.balance;
        object.balance = prev - amount;
        object.dirty = true;
        self.journal.push(JournalEntry::Balance { address, prev });
        Ok(())
    }

    /// Sets the account's nonce.
    pub fn set_nonce(&mut self, address: Address, nonce: u64) -> Result<(), StateError> {
        self.ensure_loaded(address)?;
        let object = self.objects.get_mut(&address).expect("just loaded");
        let prev = object.nonce;
        object.nonce = nonce;
        object.dirty = true;
        self.journal.push(JournalEntry::Nonce { address, prev });
        Ok(())
    }

    /// Installs contract code on the account. The code bytes are written to
    /// the store, keyed by their hash, at [`State::sync`].
    pub fn set_code(&mut self, address: Address, code: Vec<u8>) -> Result<(), StateError> {
        self.ensure_loaded(address)?;
        let object = self.objects.get_mut(&address).expect("just loaded");
        let prev_code = std::mem::take(&mut object.code);
        let prev_hash = object.code_hash;
        object.code_hash = keccak(&code);
        object.code = code;
        object.dirty = true;
        object.code_dirty = true;
        self.journal.push(JournalEntry::Code {
            address,
            prev_code,
            prev_hash,
        });
        Ok(())
    }

    /// Writes a storage slot into the account's pending overlay. A zero
    /// value deletes the slot when flushed.
    pub fn set_storage(&mut self, address: Address, key: H256, value: H256) -> Result<(), StateError> {
        self.ensure_loaded(address)?;
        let object = self.objects.get_mut(&address).expect("just loaded");
        let prev = object.overlay.insert(key, value);
        object.dirty = true;
        self.journal.push(JournalEntry::Storage { address, key, prev });
        Ok(())
    }

    /// Accumulates gas to be refunded at the end of the transaction.
    pub fn add_refund(&mut self, amount: U256) {
        self.journal.push(JournalEntry::Refund { prev: self.refund });
        self.refund += amount;
    }

    /// The accumulated refund counter.
    pub fn refund(&self) -> U256 {
        self.refund
    }

    /// An identifier for the current journal position.
    pub fn snapshot(&self) -> usize {
        self.journal.len()
    }

    /// Rewinds every mutation made after `snapshot` was taken: balances,
    /// nonces, code, storage, refunds and logs.
    pub fn revert_to(&mut self, snapshot: usize) {
        while self.journal.len() > snapshot {
            let entry = self.journal.pop().expect("len checked");
            self.undo(entry);
        }
    }

    /// Opens the log-collection frame for a transaction about to execute.
    pub fn start_record(&mut self, tx_hash: H256, block_hash: H256, index: usize) {
        trace!(?tx_hash, ?block_hash, index, "recording transaction");
        self.tx_hash = tx_hash;
        self.tx_index = index;
        self.refund = U256::zero();
    }

    /// Records a log against the current frame.
    pub fn add_log(&mut self, log: Log) {
        trace!(tx = ?self.tx_hash, index = self.tx_index, "log from {:?}", log.address);
        self.journal.push(JournalEntry::Log);
        self.logs.push((self.tx_hash, log));
    }

    /// The logs recorded for one transaction, in emission order.
    pub fn get_logs(&self, tx_hash: H256) -> Vec<Log> {
        self.logs
            .iter()
            .filter(|(hash, _)| *hash == tx_hash)
            .map(|(_, log)| log.clone())
            .collect()
    }

    /// Every log recorded since this state was opened, in emission order.
    pub fn logs(&self) -> Vec<Log> {
        self.logs.iter().map(|(_, log)| log.clone()).collect()
    }

    /// Flushes pending object mutations into the world trie, recomputing
    /// storage roots and branch hashes. Journal history does not survive
    /// (snapshots must not span an `update`), but recorded logs do.
    pub fn update(&mut self) -> Result<(), StateError> {
        let dirty: Vec<Address> = self
            .objects
            .iter()
            .filter(|(_, object)| object.dirty)
            .map(|(address, _)| *address)
            .collect();

        for address in dirty {
            let object = self.objects.get_mut(&address).expect("listed above");
            object.flush_storage()?;
            let leaf = rlp::encode(&object.account()).to_vec();
            object.dirty = false;
            self.trie.insert(keccak(address).as_bytes(), leaf)?;
        }
        self.journal.clear();
        Ok(())
    }

    /// The world-trie root. Reflects mutations only after [`State::update`].
    pub fn root(&mut self) -> H256 {
        self.trie.root_hash()
    }

    /// Persists every dirty trie node and contract code to the backing
    /// store. Called once, after the containing block has been accepted.
    pub fn sync(&mut self) {
        for object in self.objects.values_mut() {
            if object.code_dirty {
                self.db
                    .put(object.code_hash.as_bytes(), object.code.clone());
                object.code_dirty = false;
            }
            object.storage_trie.commit();
        }
        self.trie.commit();
    }

    /// Loads the account into the cache if it exists; never creates.
    fn peek(&mut self, address: Address) -> Result<Option<&StateObject>, StateError> {
        if !self.objects.contains_key(&address) {
            match self.load(address)? {
                Some(object) => {
                    self.objects.insert(address, object);
                }
                None => return Ok(None),
            }
        }
        Ok(self.objects.get(&address))
    }

    /// Loads or creates the account, journalling a creation.
    fn ensure_loaded(&mut self, address: Address) -> Result<(), StateError> {
        if self.objects.contains_key(&address) {
            return Ok(());
        }
        match self.load(address)? {
            Some(object) => {
                self.objects.insert(address, object);
            }
            None => {
                self.objects
                    .insert(address, StateObject::fresh(self.db.clone()));
                self.journal.push(JournalEntry::Created { address });
            }
        }
        Ok(())
    }

    fn load(&self, address: Address) -> Result<Option<StateObject>, StateError> {
        let Some(bytes) = self.trie.get(keccak(address).as_bytes())? else {
            return Ok(None);
        };
        let account: Account =
            rlp::decode(&bytes).map_err(|err| StateError::Account(address, err))?;
        let code = match account.code_hash == EMPTY_CODE_HASH {
            true => Vec::new(),
            false => self
                .db
                .get(account.code_hash.as_bytes())
                .ok_or(StateError::MissingCode(account.code_hash))?,
        };
        Ok(Some(StateObject::from_account(
            account,
            code,
            self.db.clone(),
        )))
    }

    fn undo(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::Created { address } => {
                self.objects.remove(&address);
            }
            JournalEntry::Balance { address, prev } => {
                if let Some(object) = self.objects.get_mut(&address) {
                    object.balance = prev;
                }
            }
            JournalEntry::Nonce { address, prev } => {
                if let Some(object) = self.objects.get_mut(&address) {
                    object.nonce = prev;
                }
            }
            JournalEntry::Code {
                address,
                prev_code,
                prev_hash,
            } => {
                if let Some(object) = self.objects.get_mut(&address) {
                    object.code = prev_code;
                    object.code_hash = prev_hash;
                    object.code_dirty = prev_hash != EMPTY_CODE_HASH;
                }
            }
            JournalEntry::Storage { address, key, prev } => {
                if let Some(object) = self.objects.get_mut(&address) {
                    match prev {
                        Some(value) => {
                            object.overlay.insert(key, value);
                        }
                        None => {
                            object.overlay.remove(&key);
                        }
                    }
                }
            }
            JournalEntry::Log => {
                self.logs.pop();
            }
            JournalEntry::Refund { prev } => {
                self.refund = prev;
            }
        }
    }
}

impl std::fmt::Debug for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("State")
            .field("cached_accounts", &self.objects.len())
            .field("journal_len", &self.journal.len())
            .field("logs", &self.logs.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mpt_db::MemoryDb;

    use super::*;

    fn fresh_state() -> (Arc<MemoryDb>, State) {
        let db = Arc::new(MemoryDb::new());
        let state = State::new(db.clone());
        (db, state)
    }

    fn addr(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    #[test]
    fn absent_accounts_read_as_zero() {
        let (_, mut state) = fresh_state();
        assert_eq!(state.balance(addr(1)).unwrap(), U256::zero());
        assert_eq!(state.nonce(addr(1)).unwrap(), 0);
        assert!(state.code(addr(1)).unwrap().is_empty());
        assert_eq!(state.storage(addr(1), H256::zero()).unwrap(), H256::zero());
        assert!(!state.exists(addr(1)).unwrap());
    }

    #[test]
    fn snapshot_revert_restores_everything() {
        let (_, mut state) = fresh_state();
        let a = addr(1);
        state.add_balance(a, U256::from(100)).unwrap();
        state.set_nonce(a, 3).unwrap();
        state.start_record(H256::repeat_byte(9), H256::zero(), 0);

        let checkpoint = state.snapshot();
        state.add_balance(a, U256::from(50)).unwrap();
        state.set_nonce(a, 4).unwrap();
        state.set_code(a, vec![0x60, 0x00]).unwrap();
        state
            .set_storage(a, H256::from_low_u64_be(1), H256::from_low_u64_be(7))
            .unwrap();
        state.add_refund(U256::from(15_000));
        state.add_log(Log {
            address: a,
            ..Default::default()
        });
        state.add_balance(addr(2), U256::from(9)).unwrap();

        state.revert_to(checkpoint);

        assert_eq!(state.balance(a).unwrap(), U256::from(100));
        assert_eq!(state.nonce(a).unwrap(), 3);
        assert!(state.code(a).unwrap().is_empty());
        assert_eq!(
            state.storage(a, H256::from_low_u64_be(1)).unwrap(),
            H256::zero()
        );
        assert_eq!(state.refund(), U256::zero());
        assert!(state.logs().is_empty());
        // The account created inside the window is gone again.
        assert!(!state.exists(addr(2)).unwrap());
    }

    #[test]
    fn reverted_frames_drop_only_their_logs() {
        let (_, mut state) = fresh_state();
        state.start_record(H256::repeat_byte(1), H256::zero(), 0);
        state.add_log(Log::default());

        let checkpoint = state.snapshot();
        state.add_log(Log::default());
        state.add_log(Log::default());
        state.revert_to(checkpoint);

        assert_eq!(state.logs().len(), 1);
        assert_eq!(state.get_logs(H256::repeat_byte(1)).len(), 1);
    }

    #[test]
    fn update_then_root_is_deterministic() {
        let (_, mut a) = fresh_state();
        let (_, mut b) = fresh_state();

        for state in [&mut a, &mut b] {
            state.add_balance(addr(1), U256::from(1000)).unwrap();
            state.add_balance(addr(2), U256::from(2000)).unwrap();
            state.update().unwrap();
        }
        assert_eq!(a.root(), b.root());

        a.add_balance(addr(3), U256::one()).unwrap();
        a.update().unwrap();
        assert_ne!(a.root(), b.root());
    }

    #[test]
    fn sync_persists_and_reopen_reads_back() {
        let (db, mut state) = fresh_state();
        let contract = addr(7);
        state.add_balance(contract, U256::from(123)).unwrap();
        state.set_code(contract, vec![0x60, 0x01, 0x60, 0x02]).unwrap();
        state
            .set_storage(contract, H256::from_low_u64_be(5), H256::from_low_u64_be(42))
            .unwrap();
        state.update().unwrap();
        let root = state.root();

        assert!(db.is_empty(), "nothing durable before sync");
        state.sync();

        let mut reopened = State::open(root, db);
        assert_eq!(reopened.balance(contract).unwrap(), U256::from(123));
        assert_eq!(reopened.code(contract).unwrap(), vec![0x60, 0x01, 0x60, 0x02]);
        assert_eq!(
            reopened
                .storage(contract, H256::from_low_u64_be(5))
                .unwrap(),
            H256::from_low_u64_be(42)
        );
        assert_eq!(reopened.nonce(contract).unwrap(), 0);
    }

    #[test]
    fn zero_storage_writes_delete_their_slot() {
        let (_db, mut state) = fresh_state();
        let a = addr(3);
        let slot = H256::from_low_u64_be(1);

        state.add_balance(a, U256::one()).unwrap();
        state.update().unwrap();
        let clean_root = state.root();

        state.set_storage(a, slot, H256::from_low_u64_be(9)).unwrap();
        state.update().unwrap();
        assert_ne!(state.root(), clean_root);

        state.set_storage(a, slot, H256::zero()).unwrap();
        state.update().unwrap();
        assert_eq!(state.root(), clean_root);
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let (_, mut state) = fresh_state();
        let created = state.get_or_create(addr(9)).unwrap();
        assert_eq!(created, Account::default());
        state.add_balance(addr(9), U256::from(5)).unwrap();
        assert_eq!(state.get_or_create(addr(9)).unwrap().balance, U256::from(5));
    }
}
