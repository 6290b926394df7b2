//! Hashing primitives used by the sync engine.
//!
//! Everything on the wire and in the stores is addressed by keccak256. The
//! trie crate works in terms of `B256`; the conversions here keep that an
//! implementation detail of the state-sync boundary.

use std::fmt::Display;

use alloy::primitives::B256;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const ZERO: Hash = Hash([0; 32]);

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn compute(preimages: &[&[u8]]) -> Hash {
        let mut hasher = Keccak256::new();
        for preimage in preimages {
            hasher.update(preimage);
        }
        Self(hasher.finalize().into())
    }
}

impl From<B256> for Hash {
    fn from(value: B256) -> Self {
        Hash(value.0)
    }
}

impl From<Hash> for B256 {
    fn from(value: Hash) -> Self {
        B256::from(value.0)
    }
}

impl Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.as_bytes()))
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keccak_vector() {
        // keccak256 of the empty input.
        assert_eq!(
            Hash::compute(&[]).to_string(),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn b256_round_trip() {
        let h = Hash::compute(&[b"abc"]);
        assert_eq!(Hash::from(B256::from(h)), h);
    }
}
