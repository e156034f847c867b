//! Proof-of-work verification.

use chain_types::Header;
use ethereum_types::U256;
use keccak_hash::keccak;

/// A proof-of-work verifier: a pure function of the header bytes (seal
/// included) and its difficulty. Injected into the processor so tests and
/// alternative networks can swap the sealing rule.
pub trait Pow: Send + Sync {
    /// Returns `true` if the header's seal meets its difficulty target.
    fn verify(&self, header: &Header) -> bool;
}

/// Keccak-based proof of work: the hash of the unsealed header, the mix
/// digest and the nonce must fall below `U256::MAX / difficulty`.
#[derive(Clone, Copy, Debug, Default)]
pub struct HashPow;

impl HashPow {
    fn pow_value(header: &Header) -> U256 {
        let mut preimage = Vec::with_capacity(32 + 32 + 8);
        preimage.extend_from_slice(header.seal_hash().as_bytes());
        preimage.extend_from_slice(header.mix_digest.as_bytes());
        preimage.extend_from_slice(header.nonce.as_bytes());
        U256::from_big_endian(keccak(&preimage).as_bytes())
    }

    /// Searches nonces from zero until the header verifies. Deterministic;
    /// used by block builders and tests, not a mining loop.
    pub fn seal(&self, header: &mut Header) {
        for nonce in 0u64.. {
            header.nonce = ethereum_types::H64::from_low_u64_be(nonce);
            if self.verify(header) {
                return;
            }
        }
    }
}

impl Pow for HashPow {
    fn verify(&self, header: &Header) -> bool {
        if header.difficulty.is_zero() {
            return false;
        }
        Self::pow_value(header) <= U256::MAX / header.difficulty
    }
}
