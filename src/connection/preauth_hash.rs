//! The preauth integrity hash chain: `H(i) = SHA-512(H(i-1) || m_i)` over
//! the raw wire bytes of each hashed message, with `H(0)` all zeros.

use sha2::{Digest, Sha512};

pub type PreauthHashValue = [u8; 64];

pub const SUPPORTED_HASH_ALGORITHMS: &[u16] = &[
    crate::packets::negotiate::HashAlgorithm::Sha512 as u16,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreauthHash {
    value: PreauthHashValue,
}

impl PreauthHash {
    pub fn new() -> Self {
        PreauthHash { value: [0; 64] }
    }

    /// Folds the raw bytes of one message into the chain.
    pub fn update(&mut self, data: &[u8]) {
        let mut hasher = Sha512::new();
        hasher.update(self.value);
        hasher.update(data);
        self.value = hasher.finalize().into();
    }

    pub fn value(&self) -> &PreauthHashValue {
        &self.value
    }
}

impl Default for PreauthHash {
    fn default() -> Self {
        Self::new()
    }
}
