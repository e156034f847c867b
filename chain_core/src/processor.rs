//! The block processor: the single gate through which blocks become state.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use chain_types::{ordered_trie_root, Block, Header, Log, Receipt, Transaction};
use ethereum_types::{Bloom, H256, U256};
use parking_lot::Mutex;
use rlp_derive::{RlpDecodable, RlpEncodable};
use tracing::{debug, info, trace};

use crate::{
    chain::ChainReader,
    error::{BodyError, HeaderError, ProcessError, UncleError},
    events::{ChainEvent, EventBus},
    executor::{apply_message, ExecutionError, GasPool},
    params::ChainParams,
    pool::TxPool,
    pow::Pow,
    state::State,
};

use mpt_db::DatabaseHandle;

/// Suffix distinguishing a transaction's inclusion-metadata key from its
/// body key in the `extra` namespace.
pub const TX_META_SUFFIX: u8 = 0x01;

/// Where a committed transaction landed; stored next to its body for
/// by-hash lookups.
#[derive(Clone, Debug, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct TxMeta {
    /// Hash of the containing block.
    pub block_hash: H256,
    /// Number of the containing block.
    pub block_number: u64,
    /// Position within the block.
    pub index: u64,
}

/// Serializes block admission: validates headers, replays transactions,
/// checks every header commitment, pays rewards and commits state.
///
/// All collaborators are injected; the processor holds capabilities, not
/// owners (the chain holds this processor as its validator in turn, with
/// the assembly code owning both).
pub struct BlockProcessor {
    /// `state` namespace: trie nodes and code.
    state_db: DatabaseHandle,
    /// `extra` namespace: transaction lookup entries.
    extra_db: DatabaseHandle,
    chain: Arc<dyn ChainReader>,
    pow: Box<dyn Pow>,
    pool: Arc<Mutex<TxPool>>,
    events: Arc<EventBus>,
    params: ChainParams,
    /// Blocks are handled strictly one at a time.
    lock: Mutex<()>,
    /// The most recently attempted block, valid or not. Debugging aid.
    last_attempted: Mutex<Option<H256>>,
}

impl BlockProcessor {
    /// Wires up a processor. `state_db` and `extra_db` are the two
    /// namespaces this component writes; the chain store stays behind
    /// `chain`.
    pub fn new(
        state_db: DatabaseHandle,
        extra_db: DatabaseHandle,
        pow: Box<dyn Pow>,
        pool: Arc<Mutex<TxPool>>,
        chain: Arc<dyn ChainReader>,
        events: Arc<EventBus>,
        params: ChainParams,
    ) -> Self {
        Self {
            state_db,
            extra_db,
            chain,
            pow,
            pool,
            events,
            params,
            lock: Mutex::new(()),
            last_attempted: Mutex::new(None),
        }
    }

    /// The configured chain parameters.
    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    /// Hash of the last block handed to this processor, if any.
    pub fn last_attempted(&self) -> Option<H256> {
        *self.last_attempted.lock()
    }

    /// Admits a block whose parent is already on the chain. On success the
    /// new state is durable and all logs produced during execution are
    /// returned; on failure nothing has been written.
    pub fn process(&self, block: &Block) -> Result<Vec<Log>, ProcessError> {
        let _serial = self.lock.lock();

        let hash = block.hash();
        if self.chain.has_block(hash) {
            return Err(ProcessError::KnownBlock {
                number: block.number(),
                hash,
            });
        }
        let parent = self
            .chain
            .block(block.header.parent_hash)
            .ok_or(ProcessError::UnknownParent(block.header.parent_hash))?;

        self.process_with_parent(block, &parent)
    }

    /// Same as [`BlockProcessor::process`] minus the already-known check;
    /// recomputes (and re-persists) a block that was validated before.
    pub fn retry_process(&self, block: &Block) -> Result<Vec<Log>, ProcessError> {
        let _serial = self.lock.lock();

        let parent = self
            .chain
            .block(block.header.parent_hash)
            .ok_or(ProcessError::UnknownParent(block.header.parent_hash))?;

        self.process_with_parent(block, &parent)
    }

    /// Transient replay: executes the block against a fresh state to
    /// recover its logs, persisting nothing, touching no pool entries, and
    /// emitting only a single [`ChainEvent::PendingBlock`].
    pub fn get_logs(&self, block: &Block) -> Result<Vec<Log>, ProcessError> {
        let _serial = self.lock.lock();

        if !self.chain.has_block(block.header.parent_hash) {
            return Err(ProcessError::UnknownParent(block.header.parent_hash));
        }
        *self.last_attempted.lock() = Some(block.hash());

        let parent = self
            .chain
            .block(block.header.parent_hash)
            .ok_or(ProcessError::UnknownParent(block.header.parent_hash))?;

        let mut state = State::open(parent.header.state_root, self.state_db.clone());
        self.apply_transactions(&mut state, block, true)?;
        Ok(state.logs())
    }

    /// Header-only validation of `header` against its parent: extra-data
    /// size, difficulty, gas-limit drift, timestamps, number and the
    /// proof-of-work seal. No state is touched.
    pub fn validate_header(&self, header: &Header, parent: &Header) -> Result<(), ProcessError> {
        if header.extra.len() > self.params.maximum_extra_data_size {
            return Err(HeaderError::ExtraDataTooLong {
                len: header.extra.len(),
                max: self.params.maximum_extra_data_size,
            }
            .into());
        }

        let want = self.params.calc_difficulty(header.time, parent);
        if header.difficulty != want {
            return Err(HeaderError::Difficulty {
                have: header.difficulty,
                want,
            }
            .into());
        }

        let drift = match header.gas_limit > parent.gas_limit {
            true => header.gas_limit - parent.gas_limit,
            false => parent.gas_limit - header.gas_limit,
        };
        let bound = parent.gas_limit / self.params.gas_limit_bound_divisor;
        if drift >= bound || header.gas_limit < self.params.min_gas_limit {
            return Err(HeaderError::GasLimit {
                have: header.gas_limit,
                parent: parent.gas_limit,
            }
            .into());
        }

        if header.time > unix_now() + self.params.max_future_drift {
            return Err(ProcessError::FutureBlock {
                time: header.time,
                drift: self.params.max_future_drift,
            });
        }

        if header.number != parent.number + 1 {
            return Err(HeaderError::Number {
                have: header.number,
                parent: parent.number,
            }
            .into());
        }

        if header.time <= parent.time {
            return Err(HeaderError::Timestamp {
                have: header.time,
                parent: parent.time,
            }
            .into());
        }

        if !self.pow.verify(header) {
            return Err(HeaderError::InvalidPow.into());
        }

        Ok(())
    }

    fn process_with_parent(&self, block: &Block, parent: &Block) -> Result<Vec<Log>, ProcessError> {
        *self.last_attempted.lock() = Some(block.hash());
        let header = &block.header;

        // Fresh working state rooted at the parent; discarded wholesale on
        // any failure below.
        let mut state = State::open(parent.header.state_root, self.state_db.clone());

        self.validate_header(header, &parent.header)?;

        if block.uncles.len() > self.params.max_uncles {
            return Err(BodyError::TooManyUncles {
                count: block.uncles.len(),
                max: self.params.max_uncles,
            }
            .into());
        }

        let receipts = self.apply_transactions(&mut state, block, false)?;

        let mut bloom = Bloom::zero();
        for receipt in &receipts {
            bloom.accrue_bloom(&receipt.bloom);
        }
        if bloom != header.bloom {
            return Err(BodyError::Bloom {
                computed: Box::new(bloom),
            }
            .into());
        }

        let tx_root = ordered_trie_root(
            block
                .transactions
                .iter()
                .map(|tx| rlp::encode(tx).to_vec()),
        );
        if tx_root != header.tx_hash {
            return Err(BodyError::TxRoot {
                header: header.tx_hash,
                computed: tx_root,
            }
            .into());
        }

        let receipt_root =
            ordered_trie_root(receipts.iter().map(|receipt| rlp::encode(receipt).to_vec()));
        if receipt_root != header.receipt_hash {
            return Err(BodyError::ReceiptRoot {
                header: header.receipt_hash,
                computed: receipt_root,
            }
            .into());
        }

        self.verify_uncles(block)?;

        accumulate_rewards(&self.params, &mut state, block)?;

        state.update()?;
        let state_root = state.root();
        if state_root != header.state_root {
            return Err(BodyError::StateRoot {
                header: header.state_root,
                computed: state_root,
            }
            .into());
        }

        // The block is valid; everything below is commitment, not checking.
        state.sync();

        self.pool.lock().remove_set(&block.transactions);

        for (index, tx) in block.transactions.iter().enumerate() {
            self.write_tx_lookup(tx, block, index as u64);
        }

        // Events go out only for accepted blocks, in transaction order.
        for tx in &block.transactions {
            let logs = state.get_logs(tx.hash());
            self.events.post(ChainEvent::TxPost { tx: tx.clone() });
            self.events.post(ChainEvent::Logs(logs));
        }

        info!(
            number = block.number(),
            hash = ?block.hash(),
            txs = block.transactions.len(),
            uncles = block.uncles.len(),
            "processed block"
        );
        Ok(state.logs())
    }

    /// Replays every transaction in order, building receipts and checking
    /// the header's gas total. In transient mode the only side channel is a
    /// single `PendingBlock` event.
    fn apply_transactions(
        &self,
        state: &mut State,
        block: &Block,
        transient: bool,
    ) -> Result<Vec<Receipt>, ProcessError> {
        let mut receipts = Vec::with_capacity(block.transactions.len());
        let mut used_gas = U256::zero();
        let mut fees = U256::zero();
        let mut gas_pool = GasPool::new(block.header.gas_limit);
        let block_hash = block.hash();

        for (index, tx) in block.transactions.iter().enumerate() {
            state.start_record(tx.hash(), block_hash, index);
            let gas_before = used_gas;
            let receipt =
                self.apply_transaction(state, block, tx, index, &mut used_gas, &mut gas_pool)?;
            fees += (used_gas - gas_before) * tx.gas_price;
            receipts.push(receipt);
        }
        debug!(%used_gas, %fees, txs = receipts.len(), "replayed transactions");

        if block.header.gas_used != used_gas {
            return Err(BodyError::GasUsed {
                header: block.header.gas_used,
                computed: used_gas,
            }
            .into());
        }

        if transient {
            self.events.post(ChainEvent::PendingBlock {
                block: block.clone(),
                logs: state.logs(),
            });
        }

        Ok(receipts)
    }

    fn apply_transaction(
        &self,
        state: &mut State,
        block: &Block,
        tx: &Transaction,
        index: usize,
        used_gas: &mut U256,
        gas_pool: &mut GasPool,
    ) -> Result<Receipt, ProcessError> {
        let applied = apply_message(
            state,
            self.chain.as_ref(),
            &block.header,
            &self.params,
            tx,
            gas_pool,
        );
        let message = match applied {
            Ok(message) => message,
            // A failing store says nothing about the transaction; surface
            // it as the undecided-state class and leave the pool alone.
            Err(ExecutionError::State(err)) => return Err(ProcessError::State(err)),
            Err(source) => {
                // An inadmissible transaction sinks the whole block; drop
                // the sender's tracked pool nonce so the slot can refill.
                if let Ok(sender) = tx.sender() {
                    self.pool.lock().state().remove_nonce(sender, tx.nonce);
                }
                debug!(index, %source, "transaction inadmissible");
                return Err(ProcessError::Transaction { index, source });
            }
        };

        if let Some(fault) = message.fault {
            debug!(index, %fault, "transaction frame failed");
        }

        state.update()?;
        *used_gas += message.gas_used;
        let logs = state.get_logs(tx.hash());
        let receipt = Receipt::new(state.root(), *used_gas, logs);
        trace!(?receipt);
        Ok(receipt)
    }

    /// Applies the uncle rules: collect ancestors to the configured depth,
    /// require each uncle to be new (not an ancestor, not included before,
    /// not this block), to descend from a recent ancestor, and to carry a
    /// header valid against that ancestor.
    fn verify_uncles(&self, block: &Block) -> Result<(), ProcessError> {
        let ancestors = self
            .chain
            .ancestors(block, self.params.uncle_ancestry_depth);

        let mut ancestor_headers: HashMap<H256, Header> = HashMap::new();
        let mut seen: HashSet<H256> = HashSet::new();
        for ancestor in &ancestors {
            ancestor_headers.insert(ancestor.hash(), ancestor.header.clone());
            for uncle in &ancestor.uncles {
                seen.insert(uncle.hash());
            }
        }
        seen.insert(block.hash());

        for uncle in &block.uncles {
            let hash = uncle.hash();
            if !seen.insert(hash) {
                return Err(UncleError::NotUnique(hash).into());
            }
            if ancestor_headers.contains_key(&hash) {
                return Err(UncleError::IsAncestor(hash).into());
            }
            let parent = ancestor_headers
                .get(&uncle.parent_hash)
                .ok_or(UncleError::UnknownParent(uncle.parent_hash))?;
            self.validate_header(uncle, parent)
                .map_err(|source| UncleError::Invalid {
                    hash,
                    source: Box::new(source),
                })?;
        }

        Ok(())
    }

    fn write_tx_lookup(&self, tx: &Transaction, block: &Block, index: u64) {
        let hash = tx.hash();
        self.extra_db.put(hash.as_bytes(), rlp::encode(tx).to_vec());

        let meta = TxMeta {
            block_hash: block.hash(),
            block_number: block.number(),
            index,
        };
        let mut key = hash.as_bytes().to_vec();
        key.push(TX_META_SUFFIX);
        self.extra_db.put(&key, rlp::encode(&meta).to_vec());
    }
}

impl std::fmt::Debug for BlockProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockProcessor")
            .field("last_attempted", &self.last_attempted())
            .finish_non_exhaustive()
    }
}

/// Credits the static block reward plus uncle-inclusion bonuses to the
/// coinbase, and the depth-scaled partial reward to each uncle's coinbase.
///
/// With `R` the block reward and `k` the uncle's depth below the block,
/// the uncle's coinbase earns `R * (8 - k) / 8` and the block's coinbase an
/// extra `R / 32` per uncle. The depth window `1..=6` is guaranteed by the
/// uncle ancestry checks; it is re-checked here so the subtraction can
/// never mint a wrapped reward.
pub fn accumulate_rewards(
    params: &ChainParams,
    state: &mut State,
    block: &Block,
) -> Result<(), ProcessError> {
    let mut reward = params.block_reward;

    for uncle in &block.uncles {
        let depth = block
            .number()
            .checked_sub(uncle.number)
            .filter(|depth| (1..=6).contains(depth))
            .ok_or_else(|| UncleError::DepthOutOfRange {
                hash: uncle.hash(),
                depth: block.number().saturating_sub(uncle.number),
            })?;

        let uncle_reward = params.block_reward * U256::from(8 - depth) / U256::from(8);
        state.add_balance(uncle.coinbase, uncle_reward)?;
        reward += params.block_reward / U256::from(32);
    }

    state.add_balance(block.header.coinbase, reward)?;
    Ok(())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ethereum_types::Address;
    use mpt_db::MemoryDb;

    use super::*;

    fn block_with_uncles(number: u64, uncle_numbers: &[u64]) -> Block {
        let uncles = uncle_numbers
            .iter()
            .map(|n| Header {
                number: *n,
                coinbase: Address::repeat_byte(*n as u8),
                ..Default::default()
            })
            .collect();
        Block::new(
            Header {
                number,
                coinbase: Address::repeat_byte(0xc0),
                ..Default::default()
            },
            Vec::new(),
            uncles,
        )
    }

    #[test]
    fn base_reward_with_no_uncles() {
        let params = ChainParams::default();
        let mut state = State::new(Arc::new(MemoryDb::new()));
        accumulate_rewards(&params, &mut state, &block_with_uncles(10, &[])).unwrap();
        assert_eq!(
            state.balance(Address::repeat_byte(0xc0)).unwrap(),
            params.block_reward
        );
    }

    #[test]
    fn uncle_rewards_scale_with_depth() {
        let params = ChainParams::default();
        let mut state = State::new(Arc::new(MemoryDb::new()));
        // Uncles at depth 1 and 6.
        accumulate_rewards(&params, &mut state, &block_with_uncles(10, &[9, 4])).unwrap();

        assert_eq!(
            state.balance(Address::repeat_byte(9)).unwrap(),
            params.block_reward * U256::from(7) / U256::from(8)
        );
        assert_eq!(
            state.balance(Address::repeat_byte(4)).unwrap(),
            params.block_reward * U256::from(2) / U256::from(8)
        );
        assert_eq!(
            state.balance(Address::repeat_byte(0xc0)).unwrap(),
            params.block_reward + params.block_reward / U256::from(32) * U256::from(2)
        );
    }

    #[test]
    fn out_of_window_uncles_are_rejected_at_reward_time() {
        let params = ChainParams::default();
        let mut state = State::new(Arc::new(MemoryDb::new()));

        let too_deep = block_with_uncles(10, &[3]);
        assert!(matches!(
            accumulate_rewards(&params, &mut state, &too_deep),
            Err(ProcessError::Uncle(UncleError::DepthOutOfRange { depth: 7, .. }))
        ));

        let not_above = block_with_uncles(10, &[10]);
        assert!(matches!(
            accumulate_rewards(&params, &mut state, &not_above),
            Err(ProcessError::Uncle(UncleError::DepthOutOfRange { depth: 0, .. }))
        ));
    }
}
