//! Cryptographically strong randomness for padding and poll jitter.
//!
//! Everything here draws from a ChaCha-based `StdRng` freshly seeded from the
//! operating system, so the values are not predictable from earlier output.
//! Seeding is the only fallible step and surfaces as [`Error::Entropy`].

use crate::{Error, Result};
use base64::Engine;
use rand::rngs::{OsRng, StdRng};
use rand::{Rng, RngCore, SeedableRng};

/// Padding length is drawn from `[0, MAX_PADDING_LEN)`.
pub const MAX_PADDING_LEN: usize = 100;

/// A CSPRNG seeded from the OS entropy source.
pub fn secure_rng() -> Result<StdRng> {
    StdRng::from_rng(OsRng).map_err(|e| Error::entropy(e.to_string()))
}

/// Random-length random bytes, base64 encoded for use as a header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddingToken {
    len: usize,
    encoded: String,
}

impl PaddingToken {
    pub fn generate() -> Result<Self> {
        let mut rng = secure_rng()?;
        Self::generate_with(&mut rng)
    }

    pub fn generate_with<R: RngCore>(rng: &mut R) -> Result<Self> {
        let len = rng.gen_range(0..MAX_PADDING_LEN);
        let mut raw = vec![0u8; len];
        rng.try_fill_bytes(&mut raw)?;
        Ok(PaddingToken {
            len,
            encoded: base64::engine::general_purpose::STANDARD.encode(&raw),
        })
    }

    /// Number of random bytes before encoding.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_str(&self) -> &str {
        &self.encoded
    }
}

/// Uniform draw from `[min, max)`. Callers guarantee `min < max`.
pub fn jitter<R: RngCore>(rng: &mut R, min: u64, max: u64) -> u64 {
    rng.gen_range(min..max)
}
