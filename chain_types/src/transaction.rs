//! Signed transactions and sender recovery.

use bytes::Bytes;
use ethereum_types::{Address, H256, U256};
use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use keccak_hash::keccak;
use rlp::{DecoderError, Rlp, RlpStream};
use thiserror::Error;

/// Reasons a transaction signature cannot yield a sender.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    /// `v` is not 27 or 28.
    #[error("recovery id {0} out of range")]
    RecoveryId(u64),

    /// `r` or `s` is not a valid curve scalar.
    #[error("signature scalars out of range")]
    Malformed,

    /// The scalars are well-formed but recover no public key.
    #[error("public key recovery failed")]
    Unrecoverable,
}

/// A signed value transfer, contract call, or contract creation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Transaction {
    /// Sender-local sequence number.
    pub nonce: u64,
    /// Wei paid per unit of gas.
    pub gas_price: U256,
    /// Gas ceiling for this transaction.
    pub gas_limit: U256,
    /// Recipient; `None` creates a contract.
    pub to: Option<Address>,
    /// Wei transferred to the recipient (or creation endowment).
    pub value: U256,
    /// Call input or contract init code.
    pub data: Bytes,
    /// Signature recovery byte, 27 or 28.
    pub v: u64,
    /// Signature scalar.
    pub r: U256,
    /// Signature scalar.
    pub s: U256,
}

impl Transaction {
    /// The hash identifying this transaction.
    pub fn hash(&self) -> H256 {
        keccak(rlp::encode(self))
    }

    /// Hash of the unsigned payload: what the signature commits to.
    pub fn signing_hash(&self) -> H256 {
        let mut s = RlpStream::new_list(6);
        self.append_unsigned(&mut s);
        keccak(s.out())
    }

    /// Returns `true` for contract creations.
    pub fn is_creation(&self) -> bool {
        self.to.is_none()
    }

    /// Signs the payload with `key` (deterministic RFC-6979 nonce) and
    /// returns the transaction with `(v, r, s)` filled in.
    pub fn sign(mut self, key: &SigningKey) -> Result<Self, SignatureError> {
        let digest = self.signing_hash();
        let (sig, recovery) = key
            .sign_prehash_recoverable(digest.as_bytes())
            .map_err(|_| SignatureError::Unrecoverable)?;

        let (r, s) = sig.split_bytes();
        self.r = U256::from_big_endian(r.as_slice());
        self.s = U256::from_big_endian(s.as_slice());
        self.v = 27 + u64::from(recovery.to_byte());
        Ok(self)
    }

    /// Recovers the sender address from the signature. Deterministic: equal
    /// transactions always recover the same sender or fail the same way.
    pub fn sender(&self) -> Result<Address, SignatureError> {
        let recovery = self
            .v
            .checked_sub(27)
            .and_then(|v| u8::try_from(v).ok())
            .and_then(RecoveryId::from_byte)
            .ok_or(SignatureError::RecoveryId(self.v))?;

        let mut scalars = [0u8; 64];
        self.r.to_big_endian(&mut scalars[..32]);
        self.s.to_big_endian(&mut scalars[32..]);
        let sig = Signature::try_from(&scalars[..]).map_err(|_| SignatureError::Malformed)?;

        let key = VerifyingKey::recover_from_prehash(self.signing_hash().as_bytes(), &sig, recovery)
            .map_err(|_| SignatureError::Unrecoverable)?;

        // An address is the low 20 bytes of the keccak of the uncompressed
        // public key, sans the 0x04 tag byte.
        let point = key.to_encoded_point(false);
        let digest = keccak(&point.as_bytes()[1..]);
        Ok(Address::from_slice(&digest.as_bytes()[12..]))
    }

    fn append_unsigned(&self, s: &mut RlpStream) {
        s.append(&self.nonce);
        s.append(&self.gas_price);
        s.append(&self.gas_limit);
        match &self.to {
            Some(address) => s.append(address),
            None => s.append_empty_data(),
        };
        s.append(&self.value);
        s.append(&self.data);
    }
}

impl rlp::Encodable for Transaction {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(9);
        self.append_unsigned(s);
        s.append(&self.v);
        s.append(&self.r);
        s.append(&self.s);
    }
}

impl rlp::Decodable for Transaction {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        if rlp.item_count()? != 9 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        let to_field = rlp.at(3)?;
        let to = match to_field.data()?.is_empty() {
            true => None,
            false => Some(to_field.as_val()?),
        };
        Ok(Self {
            nonce: rlp.val_at(0)?,
            gas_price: rlp.val_at(1)?,
            gas_limit: rlp.val_at(2)?,
            to,
            value: rlp.val_at(4)?,
            data: rlp.val_at(5)?,
            v: rlp.val_at(6)?,
            r: rlp.val_at(7)?,
            s: rlp.val_at(8)?,
        })
    }
}
