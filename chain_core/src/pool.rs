//! The pending-transaction pool, as seen by the block processor.
//!
//! Only the core-facing surface lives here: bulk removal of transactions
//! that landed in a block, and the per-sender nonce tracker the processor
//! pokes when a pooled transaction turns out to be invalid. Admission
//! policy, pricing and replacement are the RPC/p2p layers' business.

use std::collections::{BTreeMap, HashMap};

use chain_types::{SignatureError, Transaction};
use ethereum_types::{Address, H256};
use tracing::{trace, warn};

/// Tracks the next expected nonce per sender across pooled transactions.
#[derive(Debug, Default)]
pub struct NonceTracker {
    next: HashMap<Address, u64>,
}

impl NonceTracker {
    /// The tracked next nonce for `sender`, if any transaction of theirs
    /// has been pooled.
    pub fn nonce(&self, sender: Address) -> Option<u64> {
        self.next.get(&sender).copied()
    }

    /// Drops an invalidated pending nonce: if the tracker has advanced past
    /// `nonce`, it is pulled back so the slot can be refilled.
    pub fn remove_nonce(&mut self, sender: Address, nonce: u64) {
        if let Some(next) = self.next.get_mut(&sender) {
            if *next > nonce {
                trace!(?sender, from = *next, to = nonce, "rewinding tracked nonce");
                *next = nonce;
            }
        }
    }

    fn advance(&mut self, sender: Address, past: u64) {
        let next = self.next.entry(sender).or_insert(0);
        *next = (*next).max(past + 1);
    }
}

/// The pending set, indexed by sender and nonce.
#[derive(Debug, Default)]
pub struct TxPool {
    pending: HashMap<Address, BTreeMap<u64, Transaction>>,
    nonces: NonceTracker,
}

impl TxPool {
    /// An empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Admits a transaction, replacing any pending one with the same sender
    /// and nonce.
    pub fn add(&mut self, tx: Transaction) -> Result<(), SignatureError> {
        let sender = tx.sender()?;
        trace!(?sender, nonce = tx.nonce, hash = ?tx.hash(), "pooling transaction");
        self.nonces.advance(sender, tx.nonce);
        self.pending.entry(sender).or_default().insert(tx.nonce, tx);
        Ok(())
    }

    /// Bulk-removes transactions that were just committed in a block.
    pub fn remove_set(&mut self, txs: &[Transaction]) {
        for tx in txs {
            let sender = match tx.sender() {
                Ok(sender) => sender,
                Err(err) => {
                    // A block with an unrecoverable sender never validates,
                    // so this only triggers on transient replays.
                    warn!(%err, hash = ?tx.hash(), "cannot derive sender for pool removal");
                    continue;
                }
            };
            if let Some(queue) = self.pending.get_mut(&sender) {
                let hash = tx.hash();
                if queue.get(&tx.nonce).map(Transaction::hash) == Some(hash) {
                    queue.remove(&tx.nonce);
                }
                if queue.is_empty() {
                    self.pending.remove(&sender);
                }
            }
        }
    }

    /// Drops one pending entry by sender and nonce, rewinding the tracker.
    pub fn remove_nonce(&mut self, sender: Address, nonce: u64) {
        if let Some(queue) = self.pending.get_mut(&sender) {
            queue.remove(&nonce);
            if queue.is_empty() {
                self.pending.remove(&sender);
            }
        }
        self.nonces.remove_nonce(sender, nonce);
    }

    /// The per-sender nonce tracker.
    pub fn state(&mut self) -> &mut NonceTracker {
        &mut self.nonces
    }

    /// Returns `true` if a transaction with this hash is pending.
    pub fn contains(&self, hash: H256) -> bool {
        self.pending
            .values()
            .flat_map(|queue| queue.values())
            .any(|tx| tx.hash() == hash)
    }

    /// Snapshot of all pending transactions, ordered by sender then nonce.
    pub fn pending(&self) -> Vec<Transaction> {
        let mut senders: Vec<_> = self.pending.iter().collect();
        senders.sort_by_key(|(sender, _)| **sender);
        senders
            .into_iter()
            .flat_map(|(_, queue)| queue.values().cloned())
            .collect()
    }

    /// Number of pending transactions.
    pub fn len(&self) -> usize {
        self.pending.values().map(BTreeMap::len).sum()
    }

    /// Returns `true` if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
