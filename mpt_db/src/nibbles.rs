//! Nibble paths for trie keys and their compact (hex-prefix) encoding.

use std::fmt;

use ethereum_types::H256;

/// A single nibble (`0..16`), stored unpacked in a `u8` for convenience.
pub type Nibble = u8;

/// An owned sequence of nibbles.
///
/// Trie keys here are at most 32 bytes (64 nibbles), so an unpacked buffer is
/// plenty; this makes no attempt at the bit-packing a general-purpose key
/// type would want.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Nibbles {
    data: Vec<Nibble>,
}

impl Nibbles {
    /// The nibbles of `bytes`, high half-byte first.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut data = Vec::with_capacity(bytes.len() * 2);
        for b in bytes {
            data.push(b >> 4);
            data.push(b & 0x0f);
        }
        Self { data }
    }

    /// The 64 nibbles of a hash key.
    pub fn from_h256(hash: H256) -> Self {
        Self::from_bytes(hash.as_bytes())
    }

    /// A path of exactly one nibble.
    pub fn single(nib: Nibble) -> Self {
        debug_assert!(nib < 16);
        Self { data: vec![nib] }
    }

    /// Number of nibbles in the path.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` for the zero-length path.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The nibble at position `i`.
    ///
    /// # Panics
    /// If `i` is out of bounds.
    pub fn at(&self, i: usize) -> Nibble {
        self.data[i]
    }

    /// Number of leading nibbles shared with `other`.
    pub fn common_prefix_len(&self, other: &Self) -> usize {
        self.data
            .iter()
            .zip(&other.data)
            .take_while(|(a, b)| a == b)
            .count()
    }

    /// The first `n` nibbles.
    pub fn prefix(&self, n: usize) -> Self {
        Self {
            data: self.data[..n].to_vec(),
        }
    }

    /// The sub-path starting at nibble `n`.
    pub fn suffix(&self, n: usize) -> Self {
        Self {
            data: self.data[n..].to_vec(),
        }
    }

    /// Returns `true` if `prefix` is a (possibly full) prefix of `self`.
    pub fn starts_with(&self, prefix: &Self) -> bool {
        self.data.len() >= prefix.data.len() && self.common_prefix_len(prefix) == prefix.data.len()
    }

    /// `self` followed by `other`.
    pub fn join(&self, other: &Self) -> Self {
        let mut data = self.data.clone();
        data.extend_from_slice(&other.data);
        Self { data }
    }

    /// Compact encoding: a flag nibble (`2` for leaves, `0` for extensions,
    /// `+1` when the path has odd length), then the path packed two nibbles
    /// per byte.
    pub fn hex_prefix(&self, leaf: bool) -> Vec<u8> {
        let odd = self.data.len() % 2 == 1;
        let flag = u8::from(leaf) * 2 + u8::from(odd);

        let mut out = Vec::with_capacity(1 + self.data.len() / 2);
        let mut nibbles = self.data.iter().copied();
        match odd {
            true => out.push(flag << 4 | nibbles.next().unwrap_or_default()),
            false => out.push(flag << 4),
        }
        while let (Some(hi), Some(lo)) = (nibbles.next(), nibbles.next()) {
            out.push(hi << 4 | lo);
        }
        out
    }

    /// Decodes a compact encoding back into the path and its leaf flag.
    /// Returns `None` on an empty input or a flag nibble above 3.
    pub fn from_hex_prefix(bytes: &[u8]) -> Option<(Self, bool)> {
        let first = *bytes.first()?;
        let flag = first >> 4;
        if flag > 3 {
            return None;
        }

        let mut data = Vec::with_capacity(bytes.len() * 2);
        if flag & 1 != 0 {
            data.push(first & 0x0f);
        }
        for b in &bytes[1..] {
            data.push(b >> 4);
            data.push(b & 0x0f);
        }
        Some((Self { data }, flag & 2 != 0))
    }
}

impl fmt::Debug for Nibbles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for nib in &self.data {
            write!(f, "{nib:x}")?;
        }
        Ok(())
    }
}
