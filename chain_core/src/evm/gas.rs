//! The gas schedule (frontier rules).

/// Quick arithmetic, stack shuffling, pushes.
pub(crate) const VERY_LOW: u64 = 3;
/// Environment reads that hit only the frame.
pub(crate) const BASE: u64 = 2;
/// Multiplication-class arithmetic.
pub(crate) const LOW: u64 = 5;
/// Modular arithmetic and JUMP.
pub(crate) const MID: u64 = 8;
/// JUMPI.
pub(crate) const HIGH: u64 = 10;
/// Reads that reach other accounts or block history.
pub(crate) const EXT: u64 = 20;
/// SLOAD.
pub(crate) const SLOAD: u64 = 50;
/// JUMPDEST marker.
pub(crate) const JUMPDEST: u64 = 1;

/// SSTORE of a non-zero value into an empty slot.
pub(crate) const SSTORE_SET: u64 = 20_000;
/// Any other SSTORE.
pub(crate) const SSTORE_RESET: u64 = 5_000;
/// Refund for clearing a slot to zero.
pub(crate) const SSTORE_REFUND: u64 = 15_000;

/// EXP base cost, plus per exponent byte.
pub(crate) const EXP: u64 = 10;
pub(crate) const EXP_BYTE: u64 = 10;

/// SHA3 base cost, plus per hashed word.
pub(crate) const SHA3: u64 = 30;
pub(crate) const SHA3_WORD: u64 = 6;

/// Per-word surcharge of the *COPY opcodes.
pub(crate) const COPY_WORD: u64 = 3;

/// Linear and quadratic memory expansion terms:
/// `words * MEMORY_WORD + words^2 / QUAD_DIVISOR`.
pub(crate) const MEMORY_WORD: u64 = 3;
pub(crate) const QUAD_DIVISOR: u64 = 512;

/// LOGn base, per topic, and per data byte.
pub(crate) const LOG: u64 = 375;
pub(crate) const LOG_TOPIC: u64 = 375;
pub(crate) const LOG_DATA: u64 = 8;

/// CALL base cost and its surcharges.
pub(crate) const CALL: u64 = 40;
pub(crate) const CALL_VALUE: u64 = 9_000;
pub(crate) const CALL_STIPEND: u64 = 2_300;
pub(crate) const NEW_ACCOUNT: u64 = 25_000;

/// CREATE base cost and the per-byte code deposit charge.
pub(crate) const CREATE: u64 = 32_000;
pub(crate) const CODE_DEPOSIT: u64 = 200;

/// Operand stack depth cap.
pub(crate) const STACK_LIMIT: usize = 1024;
/// Message-call recursion cap.
pub(crate) const CALL_DEPTH_LIMIT: usize = 1024;
