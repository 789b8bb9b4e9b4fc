//! Signature generation.

use rand::TryRngCore;
use rand::rngs::OsRng;

use crate::error::{Result, SigningError};

/// Default number of random bytes per signature (48 hex characters).
pub const DEFAULT_BYTE_LEN: usize = 24;

/// Produces hex signatures from the operating system CSPRNG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyGenerator {
    byte_len: usize,
}

impl KeyGenerator {
    pub fn new(byte_len: usize) -> Self {
        Self { byte_len }
    }

    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    /// Generate a new signature.
    ///
    /// # Output
    ///
    /// `2 * byte_len` lowercase hex characters
    ///
    /// # Errors
    ///
    /// - `EntropyUnavailable`: the OS random source failed
    pub fn generate(&self) -> Result<String> {
        let mut bytes = vec![0u8; self.byte_len];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| SigningError::EntropyUnavailable(e.to_string()))?;

        Ok(hex::encode(bytes))
    }
}

impl Default for KeyGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_BYTE_LEN)
    }
}
