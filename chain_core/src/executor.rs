//! Applying a single transaction to the working state.
//!
//! [`apply_message`] is the executor's whole surface: recover the sender,
//! check its nonce, reserve the gas allowance, run the call or creation in
//! the VM, then settle gas with the sender and the coinbase. It is
//! deterministic and single-threaded; serializing invocations is the block
//! processor's concern.

use chain_types::{Header, SignatureError, Transaction};
use ethereum_types::U256;
use thiserror::Error;
use tracing::debug;

use crate::{
    chain::ChainReader,
    evm::{self, Env, FrameOutcome, VmError},
    params::ChainParams,
    state::{State, StateError},
};

/// Violations that make a transaction inadmissible. Any of these is fatal
/// to the containing block; contract-level faults are [`VmError`]s carried
/// in [`ExecutedMessage::fault`] instead.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The signature recovers no sender.
    #[error("invalid signature: {0}")]
    Signature(#[from] SignatureError),

    /// The stamped nonce is not the sender's next nonce.
    #[error("invalid nonce: have {have}, expected {expected}")]
    Nonce {
        /// Nonce carried by the transaction.
        have: u64,
        /// The sender's account nonce.
        expected: u64,
    },

    /// The sender cannot fund the gas allowance `gas_limit * gas_price`.
    /// Shortfalls on the transferred value are frame faults, not this.
    #[error("insufficient funds for gas: need {required}, have {balance}")]
    InsufficientFunds {
        /// Wei the allowance costs up front.
        required: U256,
        /// The sender's balance.
        balance: U256,
    },

    /// The block's gas pool cannot cover the transaction's gas limit.
    #[error("gas limit {requested} exceeds remaining block gas {remaining}")]
    BlockGasLimit {
        /// The transaction's gas limit.
        requested: U256,
        /// Gas left in the block.
        remaining: U256,
    },

    /// The gas limit does not even cover the intrinsic charge.
    #[error("intrinsic gas {required} exceeds gas limit {limit}")]
    IntrinsicGas {
        /// Intrinsic gas of the payload.
        required: U256,
        /// The transaction's gas limit.
        limit: U256,
    },

    /// The backing store failed mid-execution.
    #[error(transparent)]
    State(#[from] StateError),
}

/// The gas a block may still hand to its transactions. Initialized from the
/// header's gas limit; unused gas flows back after each transaction.
#[derive(Clone, Copy, Debug)]
pub struct GasPool(U256);

impl GasPool {
    /// A pool holding `limit` gas.
    pub fn new(limit: U256) -> Self {
        Self(limit)
    }

    /// Gas not yet reserved.
    pub fn remaining(&self) -> U256 {
        self.0
    }

    /// Reserves `amount` from the pool.
    pub fn take(&mut self, amount: U256) -> Result<(), ExecutionError> {
        if self.0 < amount {
            return Err(ExecutionError::BlockGasLimit {
                requested: amount,
                remaining: self.0,
            });
        }
        self.0 -= amount;
        Ok(())
    }

    /// Returns unspent gas to the pool.
    pub fn refund(&mut self, amount: U256) {
        self.0 += amount;
    }
}

/// What applying a message produced.
#[derive(Debug)]
pub struct ExecutedMessage {
    /// Data returned by the call (or the deployed code for creations).
    pub return_data: Vec<u8>,
    /// Gas consumed, including the intrinsic charge.
    pub gas_used: U256,
    /// A contract-level fault, if the frame failed. The transaction still
    /// stands: its gas is consumed and its receipt is still produced.
    pub fault: Option<VmError>,
}

/// Applies one transaction against `state`, settling gas with the sender
/// and `header.coinbase`.
pub fn apply_message(
    state: &mut State,
    chain: &dyn ChainReader,
    header: &Header,
    params: &ChainParams,
    tx: &Transaction,
    gas_pool: &mut GasPool,
) -> Result<ExecutedMessage, ExecutionError> {
    let sender = tx.sender()?;

    let expected = state.nonce(sender)?;
    if tx.nonce != expected {
        return Err(ExecutionError::Nonce {
            have: tx.nonce,
            expected,
        });
    }

    // Reserve the gas allowance up front; unused gas comes back in wei at
    // the end. An allowance that overflows 256 bits is unaffordable by
    // definition. The transferred value is not part of this check.
    let balance = state.balance(sender)?;
    let gas_cost = tx.gas_limit.checked_mul(tx.gas_price);
    let required = gas_cost.unwrap_or(U256::MAX);
    if gas_cost.is_none() || balance < required {
        return Err(ExecutionError::InsufficientFunds { required, balance });
    }
    gas_pool.take(tx.gas_limit)?;
    state.sub_balance(sender, required)?;
    state.set_nonce(sender, expected + 1)?;

    let intrinsic = params.intrinsic_gas(&tx.data);
    if tx.gas_limit < intrinsic {
        return Err(ExecutionError::IntrinsicGas {
            required: intrinsic,
            limit: tx.gas_limit,
        });
    }
    let frame_gas = tx.gas_limit - intrinsic;

    // The value moves inside the frame; a balance shortfall there is a
    // frame fault that consumes the gas, the same verdict a nested CALL
    // gets for the identical shortfall one frame deeper.
    let outcome = if state.balance(sender)? < tx.value {
        FrameOutcome::fault(VmError::BalanceTooLow)
    } else {
        let mut env = Env {
            state,
            chain,
            header,
            origin: sender,
            gas_price: tx.gas_price,
        };
        match tx.to {
            Some(to) => {
                evm::run_call(&mut env, sender, to, tx.value, tx.data.to_vec(), frame_gas, 0)?
            }
            None => {
                let address = evm::create_address(sender, tx.nonce);
                evm::run_create_at(
                    &mut env,
                    sender,
                    address,
                    tx.value,
                    tx.data.to_vec(),
                    frame_gas,
                    0,
                )?
            }
        }
    };

    let mut gas_left = outcome.gas_left;
    if outcome.result.is_ok() {
        // Storage-clear refunds, capped at half of what was spent.
        let spent = tx.gas_limit - gas_left;
        gas_left += state.refund().min(spent / 2);
    }
    let gas_used = tx.gas_limit - gas_left;

    state.add_balance(sender, gas_left * tx.gas_price)?;
    state.add_balance(header.coinbase, gas_used * tx.gas_price)?;
    gas_pool.refund(gas_left);

    let (return_data, fault) = match outcome.result {
        Ok(ret) => (ret, None),
        Err(fault) => (Vec::new(), Some(fault)),
    };
    debug!(%gas_used, ?fault, "applied message");

    Ok(ExecutedMessage {
        return_data,
        gas_used,
        fault,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chain_types::Block;
    use ethereum_types::{Address, H256};
    use k256::ecdsa::SigningKey;
    use mpt_db::MemoryDb;

    use super::*;

    struct NoChain;

    impl ChainReader for NoChain {
        fn has_block(&self, _hash: H256) -> bool {
            false
        }
        fn block(&self, _hash: H256) -> Option<Block> {
            None
        }
    }

    fn signer(seed: u8) -> SigningKey {
        SigningKey::from_slice(&[seed; 32]).unwrap()
    }

    fn address_of(key: &SigningKey) -> Address {
        let point = key.verifying_key().to_encoded_point(false);
        Address::from_slice(&keccak_hash::keccak(&point.as_bytes()[1..]).as_bytes()[12..])
    }

    fn header() -> Header {
        Header {
            number: 1,
            time: 100,
            gas_limit: U256::from(3_141_592),
            coinbase: Address::repeat_byte(0xc0),
            ..Default::default()
        }
    }

    fn funded_state(address: Address, wei: U256) -> State {
        let mut state = State::new(Arc::new(MemoryDb::new()));
        state.add_balance(address, wei).unwrap();
        state
    }

    fn transfer(key: &SigningKey, nonce: u64, to: Address, value: u64) -> Transaction {
        Transaction {
            nonce,
            gas_price: U256::one(),
            gas_limit: U256::from(21_000),
            to: Some(to),
            value: U256::from(value),
            data: Default::default(),
            ..Default::default()
        }
        .sign(key)
        .unwrap()
    }

    #[test]
    fn plain_transfer_costs_exactly_the_base_gas() {
        let key = signer(1);
        let sender = address_of(&key);
        let recipient = Address::repeat_byte(0xbb);
        let header = header();
        let params = ChainParams::default();
        let mut state = funded_state(sender, U256::from(1_000_000));
        let mut pool = GasPool::new(header.gas_limit);

        let tx = transfer(&key, 0, recipient, 1234);
        let msg = apply_message(&mut state, &NoChain, &header, &params, &tx, &mut pool).unwrap();

        assert_eq!(msg.gas_used, U256::from(21_000));
        assert!(msg.fault.is_none());
        assert_eq!(state.balance(recipient).unwrap(), U256::from(1234));
        assert_eq!(
            state.balance(sender).unwrap(),
            U256::from(1_000_000 - 1234 - 21_000)
        );
        assert_eq!(
            state.balance(header.coinbase).unwrap(),
            U256::from(21_000)
        );
        assert_eq!(state.nonce(sender).unwrap(), 1);
        assert_eq!(pool.remaining(), header.gas_limit - U256::from(21_000));
    }

    #[test]
    fn wrong_nonce_is_fatal() {
        let key = signer(2);
        let sender = address_of(&key);
        let header = header();
        let params = ChainParams::default();
        let mut state = funded_state(sender, U256::from(1_000_000));
        let mut pool = GasPool::new(header.gas_limit);

        let tx = transfer(&key, 5, Address::repeat_byte(0xbb), 1);
        let err = apply_message(&mut state, &NoChain, &header, &params, &tx, &mut pool);
        assert!(matches!(
            err,
            Err(ExecutionError::Nonce {
                have: 5,
                expected: 0
            })
        ));
    }

    #[test]
    fn unaffordable_transaction_is_fatal() {
        let key = signer(3);
        let sender = address_of(&key);
        let header = header();
        let params = ChainParams::default();
        let mut state = funded_state(sender, U256::from(100));
        let mut pool = GasPool::new(header.gas_limit);

        let tx = transfer(&key, 0, Address::repeat_byte(0xbb), 1);
        assert!(matches!(
            apply_message(&mut state, &NoChain, &header, &params, &tx, &mut pool),
            Err(ExecutionError::InsufficientFunds { .. })
        ));
    }

    #[test]
    fn value_shortfall_is_a_frame_fault_not_fatal() {
        let key = signer(8);
        let sender = address_of(&key);
        let recipient = Address::repeat_byte(0xbb);
        let header = header();
        let params = ChainParams::default();
        // Enough for the gas allowance, 1_000 wei short of the value after
        // paying it.
        let mut state = funded_state(sender, U256::from(22_000));
        let mut pool = GasPool::new(header.gas_limit);

        let tx = transfer(&key, 0, recipient, 2_000);
        let msg = apply_message(&mut state, &NoChain, &header, &params, &tx, &mut pool).unwrap();

        assert!(matches!(msg.fault, Some(VmError::BalanceTooLow)));
        assert_eq!(msg.gas_used, U256::from(21_000));
        assert_eq!(state.balance(recipient).unwrap(), U256::zero());
        assert_eq!(state.balance(sender).unwrap(), U256::from(1_000));
        assert_eq!(state.balance(header.coinbase).unwrap(), U256::from(21_000));
        assert_eq!(state.nonce(sender).unwrap(), 1);
    }

    #[test]
    fn exhausted_gas_pool_is_fatal() {
        let key = signer(4);
        let sender = address_of(&key);
        let header = header();
        let params = ChainParams::default();
        let mut state = funded_state(sender, U256::from(1_000_000));
        let mut pool = GasPool::new(U256::from(20_000));

        let tx = transfer(&key, 0, Address::repeat_byte(0xbb), 1);
        assert!(matches!(
            apply_message(&mut state, &NoChain, &header, &params, &tx, &mut pool),
            Err(ExecutionError::BlockGasLimit { .. })
        ));
    }

    #[test]
    fn gas_limit_below_intrinsic_is_fatal() {
        let key = signer(5);
        let sender = address_of(&key);
        let header = header();
        let params = ChainParams::default();
        let mut state = funded_state(sender, U256::from(1_000_000));
        let mut pool = GasPool::new(header.gas_limit);

        let tx = Transaction {
            nonce: 0,
            gas_price: U256::one(),
            gas_limit: U256::from(100),
            to: Some(Address::repeat_byte(0xbb)),
            value: U256::zero(),
            data: vec![1, 2, 3].into(),
            ..Default::default()
        }
        .sign(&key)
        .unwrap();
        assert!(matches!(
            apply_message(&mut state, &NoChain, &header, &params, &tx, &mut pool),
            Err(ExecutionError::IntrinsicGas { .. })
        ));
    }

    #[test]
    fn vm_fault_consumes_gas_but_is_not_fatal() {
        let key = signer(6);
        let sender = address_of(&key);
        let target = Address::repeat_byte(0xee);
        let header = header();
        let params = ChainParams::default();
        let mut state = funded_state(sender, U256::from(1_000_000));
        // Code that immediately hits an invalid opcode.
        state.set_code(target, vec![0xfe]).unwrap();
        let mut pool = GasPool::new(header.gas_limit);

        let tx = Transaction {
            nonce: 0,
            gas_price: U256::one(),
            gas_limit: U256::from(50_000),
            to: Some(target),
            value: U256::from(777),
            data: Default::default(),
            ..Default::default()
        }
        .sign(&key)
        .unwrap();
        let msg = apply_message(&mut state, &NoChain, &header, &params, &tx, &mut pool).unwrap();

        assert!(matches!(msg.fault, Some(VmError::InvalidOpcode(0xfe))));
        assert_eq!(msg.gas_used, U256::from(50_000));
        // The transfer was reverted with the frame; only gas moved.
        assert_eq!(state.balance(target).unwrap(), U256::zero());
        assert_eq!(
            state.balance(sender).unwrap(),
            U256::from(1_000_000 - 50_000)
        );
        assert_eq!(state.nonce(sender).unwrap(), 1);
    }

    #[test]
    fn creation_deploys_and_returns_the_runtime_code() {
        let key = signer(7);
        let sender = address_of(&key);
        let header = header();
        let params = ChainParams::default();
        let mut state = funded_state(sender, U256::from(10_000_000));
        let mut pool = GasPool::new(header.gas_limit);

        // Init code returning the byte 0x2a as runtime code.
        let init = vec![0x60, 0x2a, 0x60, 0x00, 0x53, 0x60, 0x01, 0x60, 0x00, 0xf3];
        let tx = Transaction {
            nonce: 0,
            gas_price: U256::one(),
            gas_limit: U256::from(100_000),
            to: None,
            value: U256::from(5),
            data: init.into(),
            ..Default::default()
        }
        .sign(&key)
        .unwrap();
        let msg = apply_message(&mut state, &NoChain, &header, &params, &tx, &mut pool).unwrap();

        assert!(msg.fault.is_none());
        assert_eq!(msg.return_data, vec![0x2a]);
        let contract = evm::create_address(sender, 0);
        assert_eq!(state.code(contract).unwrap(), vec![0x2a]);
        assert_eq!(state.balance(contract).unwrap(), U256::from(5));
        // Base + data + deposit for one byte of runtime code.
        assert!(msg.gas_used > params.tx_gas);
    }
}
