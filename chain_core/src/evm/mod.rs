//! The metered virtual machine (frontier rule set).
//!
//! One `run_call` or `run_create_at` executes a single frame; nested
//! CALL/CREATE recurse through the same entry points. A frame fault
//! (out-of-gas, stack misuse, bad jump, invalid opcode) consumes the frame's
//! gas and reverts its state writes via the journal, but is *not* an error
//! at this layer: the caller decides what a failed frame means. Only a
//! broken backing store surfaces as `Err`.

mod gas;
mod memory;
mod stack;

use chain_types::Log;
use ethereum_types::{Address, H256, U256, U512};
use keccak_hash::keccak;
use rlp::RlpStream;
use thiserror::Error;
use tracing::trace;

use crate::{
    chain::ChainReader,
    state::{State, StateError},
};
use memory::Memory;
use stack::Stack;

/// Execution faults. These consume the faulting frame's gas.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum VmError {
    /// The frame ran out of gas.
    #[error("out of gas")]
    OutOfGas,
    /// Pop or peek on too few operands.
    #[error("stack underflow")]
    StackUnderflow,
    /// Push past the 1024-entry limit.
    #[error("stack overflow")]
    StackOverflow,
    /// Jump to a position that is not a JUMPDEST.
    #[error("invalid jump destination {0}")]
    BadJumpDestination(usize),
    /// An opcode outside the supported set.
    #[error("invalid opcode {0:#04x}")]
    InvalidOpcode(u8),
    /// CALL/CREATE past the depth limit.
    #[error("call depth limit reached")]
    DepthLimit,
    /// A transfer's value exceeds the paying account's balance.
    #[error("insufficient balance for transfer")]
    BalanceTooLow,
}

/// Everything a frame may consult besides its own inputs: the working
/// state, the chain (for BLOCKHASH), and the containing block's header.
pub struct Env<'a> {
    /// The journalled working state.
    pub state: &'a mut State,
    /// Resolver for ancestor block hashes.
    pub chain: &'a dyn ChainReader,
    /// Header of the block being executed.
    pub header: &'a chain_types::Header,
    /// Sender of the outermost transaction.
    pub origin: Address,
    /// Gas price of the outermost transaction.
    pub gas_price: U256,
}

impl Env<'_> {
    /// The hash of ancestor block `number`, or zero outside the 256-block
    /// window. Resolved by walking parent hashes from the block under
    /// execution, so it is deterministic for replays.
    fn block_hash(&self, number: u64) -> H256 {
        let current = self.header.number;
        if number >= current || current - number > 256 {
            return H256::zero();
        }
        let mut hash = self.header.parent_hash;
        let mut at = current - 1;
        while at > number {
            match self.chain.block(hash) {
                Some(block) => {
                    hash = block.header.parent_hash;
                    at -= 1;
                }
                None => return H256::zero(),
            }
        }
        hash
    }
}

impl std::fmt::Debug for Env<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env")
            .field("origin", &self.origin)
            .field("number", &self.header.number)
            .finish_non_exhaustive()
    }
}

/// What a finished frame leaves behind.
#[derive(Debug)]
pub(crate) struct FrameOutcome {
    /// Gas not consumed by the frame. Zero after a fault.
    pub gas_left: U256,
    /// Return data, or the fault that ended the frame.
    pub result: Result<Vec<u8>, VmError>,
}

impl FrameOutcome {
    pub(crate) fn fault(error: VmError) -> Self {
        Self {
            gas_left: U256::zero(),
            result: Err(error),
        }
    }
}

/// Runs a message call against `to`, transferring `value` first. The caller
/// must have verified its balance covers `value`; frame faults revert the
/// transfer and all other writes.
pub(crate) fn run_call(
    env: &mut Env<'_>,
    caller: Address,
    to: Address,
    value: U256,
    input: Vec<u8>,
    gas_limit: U256,
    depth: usize,
) -> Result<FrameOutcome, StateError> {
    if depth > gas::CALL_DEPTH_LIMIT {
        return Ok(FrameOutcome::fault(VmError::DepthLimit));
    }

    let checkpoint = env.state.snapshot();
    env.state.sub_balance(caller, value)?;
    env.state.add_balance(to, value)?;

    let code = env.state.code(to)?;
    let outcome = Interpreter::new(env, to, caller, value, code, input, gas_limit, depth).run()?;
    if outcome.result.is_err() {
        env.state.revert_to(checkpoint);
    }
    Ok(outcome)
}

/// Runs contract-creation init code, installing the returned runtime code
/// at `address`. The account address and creator nonce handling belong to
/// the caller (the CREATE opcode and the transaction applier compute them
/// differently).
pub(crate) fn run_create_at(
    env: &mut Env<'_>,
    caller: Address,
    address: Address,
    value: U256,
    init_code: Vec<u8>,
    gas_limit: U256,
    depth: usize,
) -> Result<FrameOutcome, StateError> {
    if depth > gas::CALL_DEPTH_LIMIT {
        return Ok(FrameOutcome::fault(VmError::DepthLimit));
    }

    let checkpoint = env.state.snapshot();
    env.state.get_or_create(address)?;
    env.state.sub_balance(caller, value)?;
    env.state.add_balance(address, value)?;

    let mut outcome =
        Interpreter::new(env, address, caller, value, init_code, Vec::new(), gas_limit, depth)
            .run()?;

    match &outcome.result {
        Ok(code) => {
            // Depositing the runtime code costs gas per byte; if the frame
            // cannot pay, the contract is left with empty code but the
            // creation still succeeds (frontier behavior).
            let deposit = U256::from(gas::CODE_DEPOSIT) * U256::from(code.len());
            if outcome.gas_left >= deposit {
                outcome.gas_left -= deposit;
                env.state.set_code(address, code.clone())?;
            }
        }
        Err(_) => env.state.revert_to(checkpoint),
    }
    Ok(outcome)
}

/// The address a creation by `creator` with `nonce` deploys to.
pub(crate) fn create_address(creator: Address, nonce: u64) -> Address {
    let mut s = RlpStream::new_list(2);
    s.append(&creator);
    s.append(&nonce);
    let digest = keccak(s.out());
    Address::from_slice(&digest.as_bytes()[12..])
}

/// Interpreter faults plus backing-store failures. Only the former stay
/// inside the VM layer.
enum Interrupt {
    Vm(VmError),
    State(StateError),
}

impl From<VmError> for Interrupt {
    fn from(e: VmError) -> Self {
        Interrupt::Vm(e)
    }
}

impl From<StateError> for Interrupt {
    fn from(e: StateError) -> Self {
        Interrupt::State(e)
    }
}

enum Control {
    Continue,
    Stop(Vec<u8>),
}

struct Interpreter<'i, 'e> {
    env: &'i mut Env<'e>,
    /// Account whose storage and logs this frame touches.
    address: Address,
    caller: Address,
    value: U256,
    code: Vec<u8>,
    input: Vec<u8>,
    gas: U256,
    depth: usize,
    pc: usize,
    stack: Stack,
    memory: Memory,
    mem_words: u64,
}

impl<'i, 'e> Interpreter<'i, 'e> {
    #[allow(clippy::too_many_arguments)]
    fn new(
        env: &'i mut Env<'e>,
        address: Address,
        caller: Address,
        value: U256,
        code: Vec<u8>,
        input: Vec<u8>,
        gas: U256,
        depth: usize,
    ) -> Self {
        Self {
            env,
            address,
            caller,
            value,
            code,
            input,
            gas,
            depth,
            pc: 0,
            stack: Stack::new(),
            memory: Memory::new(),
            mem_words: 0,
        }
    }

    fn run(mut self) -> Result<FrameOutcome, StateError> {
        loop {
            match self.step() {
                Ok(Control::Continue) => {}
                Ok(Control::Stop(ret)) => {
                    return Ok(FrameOutcome {
                        gas_left: self.gas,
                        result: Ok(ret),
                    })
                }
                Err(Interrupt::Vm(fault)) => {
                    trace!(%fault, pc = self.pc, "frame fault");
                    return Ok(FrameOutcome::fault(fault));
                }
                Err(Interrupt::State(err)) => return Err(err),
            }
        }
    }

    fn step(&mut self) -> Result<Control, Interrupt> {
        let Some(&op) = self.code.get(self.pc) else {
            // Running off the end of the code is an implicit STOP.
            return Ok(Control::Stop(Vec::new()));
        };
        self.pc += 1;

        match op {
            op::STOP => return Ok(Control::Stop(Vec::new())),

            op::ADD => self.binary(gas::VERY_LOW, |a, b| a.overflowing_add(b).0)?,
            op::MUL => self.binary(gas::LOW, |a, b| a.overflowing_mul(b).0)?,
            op::SUB => self.binary(gas::VERY_LOW, |a, b| a.overflowing_sub(b).0)?,
            op::DIV => self.binary(gas::LOW, |a, b| match b.is_zero() {
                true => U256::zero(),
                false => a / b,
            })?,
            op::SDIV => self.binary(gas::LOW, sdiv)?,
            op::MOD => self.binary(gas::LOW, |a, b| match b.is_zero() {
                true => U256::zero(),
                false => a % b,
            })?,
            op::SMOD => self.binary(gas::LOW, smod)?,
            op::ADDMOD => self.ternary(gas::MID, |a, b, n| match n.is_zero() {
                true => U256::zero(),
                false => {
                    let sum = U512::from(a) + U512::from(b);
                    u512_low(sum % U512::from(n))
                }
            })?,
            op::MULMOD => self.ternary(gas::MID, |a, b, n| match n.is_zero() {
                true => U256::zero(),
                false => u512_low(a.full_mul(b) % U512::from(n)),
            })?,
            op::EXP => {
                let base = self.stack.pop()?;
                let exponent = self.stack.pop()?;
                let byte_len = (exponent.bits() as u64 + 7) / 8;
                self.charge(gas::EXP + gas::EXP_BYTE * byte_len)?;
                self.stack.push(base.overflowing_pow(exponent).0)?;
            }
            op::SIGNEXTEND => self.binary(gas::LOW, signextend)?,

            op::LT => self.binary(gas::VERY_LOW, |a, b| bool_word(a < b))?,
            op::GT => self.binary(gas::VERY_LOW, |a, b| bool_word(a > b))?,
            op::SLT => self.binary(gas::VERY_LOW, |a, b| bool_word(signed_lt(a, b)))?,
            op::SGT => self.binary(gas::VERY_LOW, |a, b| bool_word(signed_lt(b, a)))?,
            op::EQ => self.binary(gas::VERY_LOW, |a, b| bool_word(a == b))?,
            op::ISZERO => {
                self.charge(gas::VERY_LOW)?;
                let a = self.stack.pop()?;
                self.stack.push(bool_word(a.is_zero()))?;
            }
            op::AND => self.binary(gas::VERY_LOW, |a, b| a & b)?,
            op::OR => self.binary(gas::VERY_LOW, |a, b| a | b)?,
            op::XOR => self.binary(gas::VERY_LOW, |a, b| a ^ b)?,
            op::NOT => {
                self.charge(gas::VERY_LOW)?;
                let a = self.stack.pop()?;
                self.stack.push(!a)?;
            }
            op::BYTE => self.binary(gas::VERY_LOW, byte_at)?,

            op::SHA3 => {
                let offset = self.stack.pop()?;
                let size = self.stack.pop()?;
                self.charge(gas::SHA3)?;
                // Expansion bounds the size, so the per-word charge cannot
                // overflow.
                let (offset, size) = self.expand(offset, size)?;
                self.charge(gas::SHA3_WORD * words_of(size))?;
                let digest = keccak(self.memory.read(offset, size));
                self.stack.push(U256::from_big_endian(digest.as_bytes()))?;
            }

            op::ADDRESS => {
                self.charge(gas::BASE)?;
                self.stack.push(address_word(self.address))?;
            }
            op::BALANCE => {
                self.charge(gas::EXT)?;
                let address = word_address(self.stack.pop()?);
                let balance = self.env.state.balance(address)?;
                self.stack.push(balance)?;
            }
            op::ORIGIN => {
                self.charge(gas::BASE)?;
                self.stack.push(address_word(self.env.origin))?;
            }
            op::CALLER => {
                self.charge(gas::BASE)?;
                self.stack.push(address_word(self.caller))?;
            }
            op::CALLVALUE => {
                self.charge(gas::BASE)?;
                self.stack.push(self.value)?;
            }
            op::CALLDATALOAD => {
                self.charge(gas::VERY_LOW)?;
                let offset = self.stack.pop()?;
                self.stack.push(load_padded_word(&self.input, offset))?;
            }
            op::CALLDATASIZE => {
                self.charge(gas::BASE)?;
                self.stack.push(U256::from(self.input.len()))?;
            }
            op::CALLDATACOPY => {
                let input = std::mem::take(&mut self.input);
                let copied = self.copy_to_memory(&input, gas::VERY_LOW);
                self.input = input;
                copied?;
            }
            op::CODESIZE => {
                self.charge(gas::BASE)?;
                self.stack.push(U256::from(self.code.len()))?;
            }
            op::CODECOPY => {
                let code = std::mem::take(&mut self.code);
                let copied = self.copy_to_memory(&code, gas::VERY_LOW);
                self.code = code;
                copied?;
            }
            op::GASPRICE => {
                self.charge(gas::BASE)?;
                self.stack.push(self.env.gas_price)?;
            }
            op::EXTCODESIZE => {
                self.charge(gas::EXT)?;
                let address = word_address(self.stack.pop()?);
                let len = self.env.state.code(address)?.len();
                self.stack.push(U256::from(len))?;
            }
            op::EXTCODECOPY => {
                self.charge(gas::EXT)?;
                let address = word_address(self.stack.pop()?);
                let code = self.env.state.code(address)?;
                // EXTCODECOPY's base was charged above; the copy surcharge
                // and memory expansion follow the shared path with a zero
                // base.
                self.copy_to_memory(&code, 0)?;
            }

            op::BLOCKHASH => {
                self.charge(gas::EXT)?;
                let number = self.stack.pop()?;
                let hash = match number <= U256::from(u64::MAX) {
                    true => self.env.block_hash(number.as_u64()),
                    false => H256::zero(),
                };
                self.stack.push(U256::from_big_endian(hash.as_bytes()))?;
            }
            op::COINBASE => {
                self.charge(gas::BASE)?;
                self.stack.push(address_word(self.env.header.coinbase))?;
            }
            op::TIMESTAMP => {
                self.charge(gas::BASE)?;
                self.stack.push(U256::from(self.env.header.time))?;
            }
            op::NUMBER => {
                self.charge(gas::BASE)?;
                self.stack.push(U256::from(self.env.header.number))?;
            }
            op::DIFFICULTY => {
                self.charge(gas::BASE)?;
                self.stack.push(self.env.header.difficulty)?;
            }
            op::GASLIMIT => {
                self.charge(gas::BASE)?;
                self.stack.push(self.env.header.gas_limit)?;
            }

            op::POP => {
                self.charge(gas::BASE)?;
                self.stack.pop()?;
            }
            op::MLOAD => {
                self.charge(gas::VERY_LOW)?;
                let offset = self.stack.pop()?;
                let (offset, _) = self.expand(offset, U256::from(32))?;
                self.stack.push(self.memory.load_word(offset))?;
            }
            op::MSTORE => {
                self.charge(gas::VERY_LOW)?;
                let offset = self.stack.pop()?;
                let value = self.stack.pop()?;
                let (offset, _) = self.expand(offset, U256::from(32))?;
                self.memory.store_word(offset, value);
            }
            op::MSTORE8 => {
                self.charge(gas::VERY_LOW)?;
                let offset = self.stack.pop()?;
                let value = self.stack.pop()?;
                let (offset, _) = self.expand(offset, U256::one())?;
                self.memory.store_byte(offset, value);
            }
            op::SLOAD => {
                self.charge(gas::SLOAD)?;
                let key = word_hash(self.stack.pop()?);
                let value = self.env.state.storage(self.address, key)?;
                self.stack.push(U256::from_big_endian(value.as_bytes()))?;
            }
            op::SSTORE => {
                let key = word_hash(self.stack.pop()?);
                let value = word_hash(self.stack.pop()?);
                let current = self.env.state.storage(self.address, key)?;
                match current.is_zero() && !value.is_zero() {
                    true => self.charge(gas::SSTORE_SET)?,
                    false => self.charge(gas::SSTORE_RESET)?,
                }
                if !current.is_zero() && value.is_zero() {
                    self.env.state.add_refund(U256::from(gas::SSTORE_REFUND));
                }
                self.env.state.set_storage(self.address, key, value)?;
            }
            op::JUMP => {
                self.charge(gas::MID)?;
                let dest = self.stack.pop()?;
                self.jump(dest)?;
            }
            op::JUMPI => {
                self.charge(gas::HIGH)?;
                let dest = self.stack.pop()?;
                let condition = self.stack.pop()?;
                if !condition.is_zero() {
                    self.jump(dest)?;
                }
            }
            op::PC => {
                self.charge(gas::BASE)?;
                self.stack.push(U256::from(self.pc - 1))?;
            }
            op::MSIZE => {
                self.charge(gas::BASE)?;
                self.stack.push(U256::from(self.memory.len()))?;
            }
            op::GAS => {
                self.charge(gas::BASE)?;
                self.stack.push(self.gas)?;
            }
            op::JUMPDEST => self.charge(gas::JUMPDEST)?,

            op::PUSH1..=op::PUSH32 => {
                self.charge(gas::VERY_LOW)?;
                let n = (op - op::PUSH1 + 1) as usize;
                let mut bytes = [0u8; 32];
                for i in 0..n {
                    bytes[32 - n + i] = self.code.get(self.pc + i).copied().unwrap_or(0);
                }
                self.pc += n;
                self.stack.push(U256::from_big_endian(&bytes))?;
            }
            op::DUP1..=op::DUP16 => {
                self.charge(gas::VERY_LOW)?;
                self.stack.dup((op - op::DUP1 + 1) as usize)?;
            }
            op::SWAP1..=op::SWAP16 => {
                self.charge(gas::VERY_LOW)?;
                self.stack.swap((op - op::SWAP1 + 1) as usize)?;
            }

            op::LOG0..=op::LOG4 => {
                let topic_count = (op - op::LOG0) as usize;
                let offset = self.stack.pop()?;
                let size = self.stack.pop()?;
                self.charge(gas::LOG + gas::LOG_TOPIC * topic_count as u64)?;
                let mut topics = Vec::with_capacity(topic_count);
                for _ in 0..topic_count {
                    topics.push(word_hash(self.stack.pop()?));
                }
                let (offset, size) = self.expand(offset, size)?;
                self.charge(gas::LOG_DATA * size as u64)?;
                let data = self.memory.read(offset, size);
                self.env.state.add_log(Log {
                    address: self.address,
                    topics,
                    data: data.into(),
                });
            }

            op::CREATE => self.op_create()?,
            op::CALL => self.op_call()?,
            op::RETURN => {
                let offset = self.stack.pop()?;
                let size = self.stack.pop()?;
                let (offset, size) = self.expand(offset, size)?;
                return Ok(Control::Stop(self.memory.read(offset, size)));
            }

            other => return Err(VmError::InvalidOpcode(other).into()),
        }

        Ok(Control::Continue)
    }

    fn op_call(&mut self) -> Result<(), Interrupt> {
        let requested_gas = self.stack.pop()?;
        let to = word_address(self.stack.pop()?);
        let value = self.stack.pop()?;
        let in_offset = self.stack.pop()?;
        let in_size = self.stack.pop()?;
        let out_offset = self.stack.pop()?;
        let out_size = self.stack.pop()?;

        self.charge(gas::CALL)?;
        if !value.is_zero() {
            self.charge(gas::CALL_VALUE)?;
        }
        if !self.env.state.exists(to)? {
            self.charge(gas::NEW_ACCOUNT)?;
        }

        let (in_offset, in_size) = self.expand(in_offset, in_size)?;
        let (out_offset, out_size) = self.expand(out_offset, out_size)?;
        let input = self.memory.read(in_offset, in_size);

        // All requested gas must be on hand; the stipend rides on top for
        // value-bearing calls.
        self.charge_u256(requested_gas)?;
        let mut child_gas = requested_gas;
        if !value.is_zero() {
            child_gas += U256::from(gas::CALL_STIPEND);
        }

        if self.env.state.balance(self.address)? < value {
            self.gas += child_gas;
            self.stack.push(bool_word(false))?;
            return Ok(());
        }

        let outcome = run_call(
            self.env,
            self.address,
            to,
            value,
            input,
            child_gas,
            self.depth + 1,
        )?;
        match outcome.result {
            Ok(ret) => {
                let n = ret.len().min(out_size);
                self.memory.write(out_offset, &ret[..n]);
                self.gas += outcome.gas_left;
                self.stack.push(bool_word(true))?;
            }
            Err(fault) => {
                trace!(%fault, "nested call failed");
                self.stack.push(bool_word(false))?;
            }
        }
        Ok(())
    }

    fn op_create(&mut self) -> Result<(), Interrupt> {
        let value = self.stack.pop()?;
        let offset = self.stack.pop()?;
        let size = self.stack.pop()?;

        self.charge(gas::CREATE)?;
        let (offset, size) = self.expand(offset, size)?;
        let init_code = self.memory.read(offset, size);

        if self.env.state.balance(self.address)? < value {
            self.stack.push(U256::zero())?;
            return Ok(());
        }

        // The creator's pre-increment nonce names the new account.
        let nonce = self.env.state.nonce(self.address)?;
        self.env.state.set_nonce(self.address, nonce + 1)?;
        let address = create_address(self.address, nonce);

        // A creation frame receives everything the creator has left.
        let child_gas = std::mem::take(&mut self.gas);
        let outcome = run_create_at(
            self.env,
            self.address,
            address,
            value,
            init_code,
            child_gas,
            self.depth + 1,
        )?;
        match outcome.result {
            Ok(_) => {
                self.gas = outcome.gas_left;
                self.stack.push(address_word(address))?;
            }
            Err(fault) => {
                trace!(%fault, "nested creation failed");
                self.stack.push(U256::zero())?;
            }
        }
        Ok(())
    }

    /// Shared body of the *COPY opcodes: pops `(mem_offset, src_offset,
    /// size)`, charges `base` plus the per-word copy surcharge, expands
    /// memory and writes the zero-padded source slice.
    fn copy_to_memory(&mut self, source: &[u8], base: u64) -> Result<(), Interrupt> {
        let mem_offset = self.stack.pop()?;
        let src_offset = self.stack.pop()?;
        let size = self.stack.pop()?;

        self.charge(base)?;
        let (mem_offset, size) = self.expand(mem_offset, size)?;
        self.charge(gas::COPY_WORD * words_of(size))?;

        let bytes = copy_padded(source, src_offset, size);
        self.memory.write(mem_offset, &bytes);
        Ok(())
    }

    fn jump(&mut self, dest: U256) -> Result<(), Interrupt> {
        let target = match dest <= U256::from(usize::MAX as u64) {
            true => dest.as_usize(),
            false => usize::MAX,
        };
        match self.code.get(target) == Some(&op::JUMPDEST) && self.is_code_position(target) {
            true => {
                self.pc = target;
                Ok(())
            }
            false => Err(VmError::BadJumpDestination(target).into()),
        }
    }

    /// Returns `true` if `position` holds an opcode rather than PUSH
    /// immediate data.
    fn is_code_position(&self, position: usize) -> bool {
        let mut pc = 0;
        while pc < self.code.len() {
            if pc == position {
                return true;
            }
            let op = self.code[pc];
            pc += 1;
            if (op::PUSH1..=op::PUSH32).contains(&op) {
                pc += (op - op::PUSH1 + 1) as usize;
            }
        }
        false
    }

    fn charge(&mut self, amount: u64) -> Result<(), Interrupt> {
        self.charge_u256(U256::from(amount))
    }

    fn charge_u256(&mut self, amount: U256) -> Result<(), Interrupt> {
        if self.gas < amount {
            return Err(VmError::OutOfGas.into());
        }
        self.gas -= amount;
        Ok(())
    }

    /// Expands memory to cover `[offset, offset + size)`, charging the
    /// linear + quadratic growth cost, and returns the bounds as `usize`.
    fn expand(&mut self, offset: U256, size: U256) -> Result<(usize, usize), Interrupt> {
        if size.is_zero() {
            return Ok((0, 0));
        }
        let end = offset
            .checked_add(size)
            .filter(|end| *end <= U256::from(u32::MAX))
            .ok_or(VmError::OutOfGas)?;

        let new_words = (end.as_u64() + 31) / 32;
        if new_words > self.mem_words {
            let cost = |words: u64| {
                U256::from(words) * U256::from(gas::MEMORY_WORD)
                    + U256::from(words) * U256::from(words) / U256::from(gas::QUAD_DIVISOR)
            };
            let delta = cost(new_words) - cost(self.mem_words);
            self.charge_u256(delta)?;
            self.mem_words = new_words;
            self.memory.grow(new_words as usize);
        }
        Ok((offset.as_usize(), size.as_usize()))
    }

    fn binary(&mut self, cost: u64, f: impl FnOnce(U256, U256) -> U256) -> Result<(), Interrupt> {
        self.charge(cost)?;
        let a = self.stack.pop()?;
        let b = self.stack.pop()?;
        self.stack.push(f(a, b))?;
        Ok(())
    }

    fn ternary(
        &mut self,
        cost: u64,
        f: impl FnOnce(U256, U256, U256) -> U256,
    ) -> Result<(), Interrupt> {
        self.charge(cost)?;
        let a = self.stack.pop()?;
        let b = self.stack.pop()?;
        let c = self.stack.pop()?;
        self.stack.push(f(a, b, c))?;
        Ok(())
    }
}

/// 32-byte words covering `size` bytes.
fn words_of(size: usize) -> u64 {
    (size as u64 + 31) / 32
}

/// The low 256 bits of a 512-bit value; exact for any modular remainder.
fn u512_low(x: U512) -> U256 {
    let mut bytes = [0u8; 64];
    x.to_big_endian(&mut bytes);
    U256::from_big_endian(&bytes[32..])
}

fn bool_word(b: bool) -> U256 {
    match b {
        true => U256::one(),
        false => U256::zero(),
    }
}

fn address_word(address: Address) -> U256 {
    U256::from_big_endian(address.as_bytes())
}

fn word_address(word: U256) -> Address {
    let mut bytes = [0u8; 32];
    word.to_big_endian(&mut bytes);
    Address::from_slice(&bytes[12..])
}

fn word_hash(word: U256) -> H256 {
    let mut bytes = [0u8; 32];
    word.to_big_endian(&mut bytes);
    H256(bytes)
}

/// One zero-padded 32-byte word of `data` at `offset`.
fn load_padded_word(data: &[u8], offset: U256) -> U256 {
    let mut word = [0u8; 32];
    if offset <= U256::from(data.len()) {
        let start = offset.as_usize();
        let n = 32.min(data.len() - start);
        word[..n].copy_from_slice(&data[start..start + n]);
    }
    U256::from_big_endian(&word)
}

/// `size` bytes of `source` at `offset`, zero-padded past its end.
fn copy_padded(source: &[u8], offset: U256, size: usize) -> Vec<u8> {
    let mut out = vec![0u8; size];
    if offset <= U256::from(source.len()) {
        let start = offset.as_usize();
        let n = size.min(source.len() - start);
        out[..n].copy_from_slice(&source[start..start + n]);
    }
    out
}

fn is_negative(x: U256) -> bool {
    x.bit(255)
}

fn twos_complement(x: U256) -> U256 {
    (!x).overflowing_add(U256::one()).0
}

fn abs_sign(x: U256) -> (U256, bool) {
    match is_negative(x) {
        true => (twos_complement(x), true),
        false => (x, false),
    }
}

fn sdiv(a: U256, b: U256) -> U256 {
    if b.is_zero() {
        return U256::zero();
    }
    let (ua, sa) = abs_sign(a);
    let (ub, sb) = abs_sign(b);
    let quotient = ua / ub;
    match sa ^ sb {
        true => twos_complement(quotient),
        false => quotient,
    }
}

fn smod(a: U256, b: U256) -> U256 {
    if b.is_zero() {
        return U256::zero();
    }
    let (ua, sa) = abs_sign(a);
    let (ub, _) = abs_sign(b);
    let remainder = ua % ub;
    match sa {
        true => twos_complement(remainder),
        false => remainder,
    }
}

fn signed_lt(a: U256, b: U256) -> bool {
    match (is_negative(a), is_negative(b)) {
        (true, false) => true,
        (false, true) => false,
        // Two's-complement ordering agrees with unsigned ordering within a
        // sign class.
        _ => a < b,
    }
}

fn signextend(index: U256, value: U256) -> U256 {
    if index >= U256::from(31) {
        return value;
    }
    let bit = index.as_usize() * 8 + 7;
    let mask = (U256::one() << (bit + 1)) - 1;
    match value.bit(bit) {
        true => value | !mask,
        false => value & mask,
    }
}

fn byte_at(index: U256, value: U256) -> U256 {
    match index < U256::from(32) {
        true => U256::from(value.byte(31 - index.as_usize())),
        false => U256::zero(),
    }
}

/// Opcode bytes (frontier set).
mod op {
    pub const STOP: u8 = 0x00;
    pub const ADD: u8 = 0x01;
    pub const MUL: u8 = 0x02;
    pub const SUB: u8 = 0x03;
    pub const DIV: u8 = 0x04;
    pub const SDIV: u8 = 0x05;
    pub const MOD: u8 = 0x06;
    pub const SMOD: u8 = 0x07;
    pub const ADDMOD: u8 = 0x08;
    pub const MULMOD: u8 = 0x09;
    pub const EXP: u8 = 0x0a;
    pub const SIGNEXTEND: u8 = 0x0b;

    pub const LT: u8 = 0x10;
    pub const GT: u8 = 0x11;
    pub const SLT: u8 = 0x12;
    pub const SGT: u8 = 0x13;
    pub const EQ: u8 = 0x14;
    pub const ISZERO: u8 = 0x15;
    pub const AND: u8 = 0x16;
    pub const OR: u8 = 0x17;
    pub const XOR: u8 = 0x18;
    pub const NOT: u8 = 0x19;
    pub const BYTE: u8 = 0x1a;

    pub const SHA3: u8 = 0x20;

    pub const ADDRESS: u8 = 0x30;
    pub const BALANCE: u8 = 0x31;
    pub const ORIGIN: u8 = 0x32;
    pub const CALLER: u8 = 0x33;
    pub const CALLVALUE: u8 = 0x34;
    pub const CALLDATALOAD: u8 = 0x35;
    pub const CALLDATASIZE: u8 = 0x36;
    pub const CALLDATACOPY: u8 = 0x37;
    pub const CODESIZE: u8 = 0x38;
    pub const CODECOPY: u8 = 0x39;
    pub const GASPRICE: u8 = 0x3a;
    pub const EXTCODESIZE: u8 = 0x3b;
    pub const EXTCODECOPY: u8 = 0x3c;

    pub const BLOCKHASH: u8 = 0x40;
    pub const COINBASE: u8 = 0x41;
    pub const TIMESTAMP: u8 = 0x42;
    pub const NUMBER: u8 = 0x43;
    pub const DIFFICULTY: u8 = 0x44;
    pub const GASLIMIT: u8 = 0x45;

    pub const POP: u8 = 0x50;
    pub const MLOAD: u8 = 0x51;
    pub const MSTORE: u8 = 0x52;
    pub const MSTORE8: u8 = 0x53;
    pub const SLOAD: u8 = 0x54;
    pub const SSTORE: u8 = 0x55;
    pub const JUMP: u8 = 0x56;
    pub const JUMPI: u8 = 0x57;
    pub const PC: u8 = 0x58;
    pub const MSIZE: u8 = 0x59;
    pub const GAS: u8 = 0x5a;
    pub const JUMPDEST: u8 = 0x5b;

    pub const PUSH1: u8 = 0x60;
    pub const PUSH32: u8 = 0x7f;
    pub const DUP1: u8 = 0x80;
    pub const DUP16: u8 = 0x8f;
    pub const SWAP1: u8 = 0x90;
    pub const SWAP16: u8 = 0x9f;

    pub const LOG0: u8 = 0xa0;
    pub const LOG1: u8 = 0xa1;
    pub const LOG2: u8 = 0xa2;
    pub const LOG3: u8 = 0xa3;
    pub const LOG4: u8 = 0xa4;

    pub const CREATE: u8 = 0xf0;
    pub const CALL: u8 = 0xf1;
    pub const RETURN: u8 = 0xf3;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chain_types::{Block, Header};
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

    fn fresh_state() -> State {
        State::new(Arc::new(MemoryDb::new()))
    }

    fn run_code(state: &mut State, code: Vec<u8>, gas: u64) -> FrameOutcome {
        let header = Header {
            number: 1,
            time: 1000,
            difficulty: U256::from(131_072),
            gas_limit: U256::from(1_000_000),
            coinbase: Address::repeat_byte(0xc0),
            ..Default::default()
        };
        let caller = Address::repeat_byte(0xca);
        let contract = Address::repeat_byte(0xcc);
        let mut env = Env {
            state,
            chain: &NoChain,
            header: &header,
            origin: caller,
            gas_price: U256::one(),
        };
        env.state.get_or_create(contract).unwrap();
        Interpreter::new(
            &mut env,
            contract,
            caller,
            U256::zero(),
            code,
            Vec::new(),
            U256::from(gas),
            0,
        )
        .run()
        .unwrap()
    }

    #[test]
    fn add_and_return() {
        let mut state = fresh_state();
        // 2 + 3, stored to memory, returned as one word.
        let code = vec![
            op::PUSH1, 2, op::PUSH1, 3, op::ADD, op::PUSH1, 0, op::MSTORE, op::PUSH1, 32,
            op::PUSH1, 0, op::RETURN,
        ];
        let outcome = run_code(&mut state, code, 100_000);
        let ret = outcome.result.unwrap();
        assert_eq!(U256::from_big_endian(&ret), U256::from(5));
        assert!(outcome.gas_left > U256::zero());
    }

    #[test]
    fn sstore_persists_and_clearing_refunds() {
        let mut state = fresh_state();
        let contract = Address::repeat_byte(0xcc);
        // slot[1] = 7
        let code = vec![op::PUSH1, 7, op::PUSH1, 1, op::SSTORE, op::STOP];
        run_code(&mut state, code, 100_000).result.unwrap();
        assert_eq!(
            state.storage(contract, H256::from_low_u64_be(1)).unwrap(),
            H256::from_low_u64_be(7)
        );

        // slot[1] = 0 accrues the clear refund.
        let code = vec![op::PUSH1, 0, op::PUSH1, 1, op::SSTORE, op::STOP];
        run_code(&mut state, code, 100_000).result.unwrap();
        assert_eq!(state.refund(), U256::from(gas::SSTORE_REFUND));
    }

    #[test]
    fn log_lands_in_the_state_frame() {
        let mut state = fresh_state();
        state.start_record(H256::repeat_byte(0x77), H256::zero(), 0);
        // LOG1, one topic, two data bytes from memory.
        let code = vec![
            op::PUSH1, 0xab, op::PUSH1, 0, op::MSTORE8, op::PUSH1, 0xcd, op::PUSH1, 1,
            op::MSTORE8, op::PUSH1, 0x42, op::PUSH1, 2, op::PUSH1, 0, op::LOG1, op::STOP,
        ];
        run_code(&mut state, code, 100_000).result.unwrap();

        let logs = state.get_logs(H256::repeat_byte(0x77));
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].address, Address::repeat_byte(0xcc));
        assert_eq!(logs[0].topics, vec![H256::from_low_u64_be(0x42)]);
        assert_eq!(logs[0].data, vec![0xab, 0xcd]);
    }

    #[test]
    fn out_of_gas_consumes_the_frame() {
        let mut state = fresh_state();
        let code = vec![op::PUSH1, 1, op::PUSH1, 2, op::ADD, op::STOP];
        let outcome = run_code(&mut state, code, 5);
        assert_eq!(outcome.result, Err(VmError::OutOfGas));
        assert_eq!(outcome.gas_left, U256::zero());
    }

    #[test]
    fn jumps_must_land_on_jumpdest() {
        let mut state = fresh_state();
        let good = vec![op::PUSH1, 4, op::JUMP, op::STOP, op::JUMPDEST, op::STOP];
        assert!(run_code(&mut state, good, 100_000).result.is_ok());

        let bad = vec![op::PUSH1, 3, op::JUMP, op::STOP];
        assert_eq!(
            run_code(&mut state, bad, 100_000).result,
            Err(VmError::BadJumpDestination(3))
        );

        // A JUMPDEST byte inside PUSH data does not count.
        let inside_push = vec![op::PUSH1, 3, op::JUMP, op::PUSH1, op::JUMPDEST, op::STOP];
        assert!(matches!(
            run_code(&mut state, inside_push, 100_000).result,
            Err(VmError::BadJumpDestination(3))
        ));
    }

    #[test]
    fn invalid_opcode_faults() {
        let mut state = fresh_state();
        let outcome = run_code(&mut state, vec![0xfe], 100_000);
        assert_eq!(outcome.result, Err(VmError::InvalidOpcode(0xfe)));
    }

    #[test]
    fn faulting_frame_reverts_its_writes() {
        let mut state = fresh_state();
        let contract = Address::repeat_byte(0xcc);
        let caller = Address::repeat_byte(0xca);
        let header = Header::default();
        state.add_balance(contract, U256::from(1000)).unwrap();

        // Store then run into an invalid opcode.
        let code = vec![op::PUSH1, 9, op::PUSH1, 1, op::SSTORE, 0xfe];
        state.set_code(contract, code).unwrap();
        let mut env = Env {
            state: &mut state,
            chain: &NoChain,
            header: &header,
            origin: caller,
            gas_price: U256::one(),
        };
        let outcome = run_call(
            &mut env,
            caller,
            contract,
            U256::zero(),
            Vec::new(),
            U256::from(100_000),
            0,
        )
        .unwrap();
        assert!(outcome.result.is_err());
        assert_eq!(
            state.storage(contract, H256::from_low_u64_be(1)).unwrap(),
            H256::zero()
        );
    }

    #[test]
    fn create_deploys_runtime_code() {
        let mut state = fresh_state();
        let creator = Address::repeat_byte(0xca);
        state.add_balance(creator, U256::from(1_000_000)).unwrap();

        // Init code that returns the single byte 0x2a.
        let init = vec![
            op::PUSH1, 0x2a, op::PUSH1, 0, op::MSTORE8, op::PUSH1, 1, op::PUSH1, 0, op::RETURN,
        ];
        let header = Header::default();
        let mut env = Env {
            state: &mut state,
            chain: &NoChain,
            header: &header,
            origin: creator,
            gas_price: U256::one(),
        };
        let address = create_address(creator, 0);
        let outcome = run_create_at(
            &mut env,
            creator,
            address,
            U256::from(5),
            init,
            U256::from(100_000),
            0,
        )
        .unwrap();

        assert_eq!(outcome.result.unwrap(), vec![0x2a]);
        assert_eq!(state.code(address).unwrap(), vec![0x2a]);
        assert_eq!(state.balance(address).unwrap(), U256::from(5));
    }

    #[test]
    fn nested_call_moves_value() {
        let mut state = fresh_state();
        let contract = Address::repeat_byte(0xcc);
        let sink = Address::repeat_byte(0xdd);
        state.add_balance(contract, U256::from(100)).unwrap();
        state.get_or_create(sink).unwrap();

        // CALL(gas=0x1000, to=sink, value=40, no data, no return buffer).
        let mut code = vec![
            op::PUSH1, 0, op::PUSH1, 0, op::PUSH1, 0, op::PUSH1, 0, op::PUSH1, 40,
        ];
        code.push(0x73); // PUSH20
        code.extend_from_slice(sink.as_bytes());
        code.extend_from_slice(&[op::PUSH1 + 1, 0x10, 0x00, op::CALL, op::STOP]);

        state.set_code(contract, code.clone()).unwrap();
        let header = Header::default();
        let caller = Address::repeat_byte(0xca);
        let mut env = Env {
            state: &mut state,
            chain: &NoChain,
            header: &header,
            origin: caller,
            gas_price: U256::one(),
        };
        let outcome = run_call(
            &mut env,
            caller,
            contract,
            U256::zero(),
            Vec::new(),
            U256::from(200_000),
            0,
        )
        .unwrap();
        assert!(outcome.result.is_ok());
        assert_eq!(state.balance(sink).unwrap(), U256::from(40));
        assert_eq!(state.balance(contract).unwrap(), U256::from(60));
    }

    #[test]
    fn signed_arithmetic_vectors() {
        let minus_one = U256::MAX;
        let minus_two = U256::MAX - 1;

        assert_eq!(sdiv(minus_two, U256::from(2)), minus_one);
        assert_eq!(sdiv(minus_two, minus_one), U256::from(2));
        assert_eq!(sdiv(U256::from(7), U256::from(2)), U256::from(3));
        assert_eq!(sdiv(U256::from(7), U256::zero()), U256::zero());

        assert_eq!(smod(minus_one, U256::from(2)), minus_one);
        assert_eq!(smod(U256::from(7), U256::from(3)), U256::one());

        assert!(signed_lt(minus_one, U256::zero()));
        assert!(signed_lt(minus_two, minus_one));
        assert!(!signed_lt(U256::one(), minus_one));

        assert_eq!(signextend(U256::zero(), U256::from(0x80)), !U256::from(0x7f));
        assert_eq!(signextend(U256::zero(), U256::from(0x7f)), U256::from(0x7f));
        assert_eq!(byte_at(U256::from(31), U256::from(0xab)), U256::from(0xab));
        assert_eq!(byte_at(U256::from(40), U256::from(0xab)), U256::zero());
    }
}
