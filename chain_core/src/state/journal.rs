//! The mutation journal backing `snapshot`/`revert_to`.
//!
//! Every state mutation appends one reverse-op; reverting to a snapshot pops
//! and undoes entries from the tail. No whole-account copies are ever taken.

use ethereum_types::{Address, H256, U256};

/// One undoable mutation.
#[derive(Clone, Debug)]
pub(crate) enum JournalEntry {
    /// An account object was created; undo removes it.
    Created {
        /// The created account.
        address: Address,
    },
    /// A balance changed.
    Balance {
        /// The mutated account.
        address: Address,
        /// Balance before the change.
        prev: U256,
    },
    /// A nonce changed.
    Nonce {
        /// The mutated account.
        address: Address,
        /// Nonce before the change.
        prev: u64,
    },
    /// Contract code was set.
    Code {
        /// The mutated account.
        address: Address,
        /// Code before the change.
        prev_code: Vec<u8>,
        /// Code hash before the change.
        prev_hash: H256,
    },
    /// A storage slot changed in the write overlay.
    Storage {
        /// The mutated account.
        address: Address,
        /// The slot.
        key: H256,
        /// Previous overlay entry; `None` when the slot had no pending
        /// write (undo then falls back to the storage trie).
        prev: Option<H256>,
    },
    /// A log was recorded; undo pops it.
    Log,
    /// The refund counter changed.
    Refund {
        /// Counter before the change.
        prev: U256,
    },
}
