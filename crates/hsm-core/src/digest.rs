//! Streaming message digests backing the software digest mechanisms.

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use std::fmt;

use crate::error::{HsmError, HsmResult};

/// Largest digest any supported algorithm produces (SHA-512).
pub const MAX_DIGEST_LEN: usize = 64;

/// Hash algorithms available to the software digest engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DigestAlgorithm {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub const ALL: [DigestAlgorithm; 5] = [
        DigestAlgorithm::Sha1,
        DigestAlgorithm::Sha224,
        DigestAlgorithm::Sha256,
        DigestAlgorithm::Sha384,
        DigestAlgorithm::Sha512,
    ];

    pub fn output_len(self) -> usize {
        match self {
            DigestAlgorithm::Sha1 => 20,
            DigestAlgorithm::Sha224 => 28,
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "SHA-1",
            DigestAlgorithm::Sha224 => "SHA-224",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha384 => "SHA-384",
            DigestAlgorithm::Sha512 => "SHA-512",
        }
    }

    /// One-shot digest of `data`.
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        let mut ctx = DigestContext::new(self);
        ctx.update(data);
        ctx.finalize_vec()
    }
}

/// Incremental hashing state. Cloning forks the running state, which lets a
/// caller compute an intermediate digest without consuming the original.
#[derive(Clone)]
pub enum DigestContext {
    Sha1(Sha1),
    Sha224(Sha224),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl fmt::Debug for DigestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DigestContext")
            .field(&self.algorithm().name())
            .finish()
    }
}

impl DigestContext {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Sha1 => Self::Sha1(Sha1::new()),
            DigestAlgorithm::Sha224 => Self::Sha224(Sha224::new()),
            DigestAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            DigestAlgorithm::Sha384 => Self::Sha384(Sha384::new()),
            DigestAlgorithm::Sha512 => Self::Sha512(Sha512::new()),
        }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        match self {
            Self::Sha1(_) => DigestAlgorithm::Sha1,
            Self::Sha224(_) => DigestAlgorithm::Sha224,
            Self::Sha256(_) => DigestAlgorithm::Sha256,
            Self::Sha384(_) => DigestAlgorithm::Sha384,
            Self::Sha512(_) => DigestAlgorithm::Sha512,
        }
    }

    pub fn output_len(&self) -> usize {
        self.algorithm().output_len()
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Sha224(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
            Self::Sha384(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    /// Writes the digest into the front of `out` and resets the context.
    /// `out` must hold at least [`Self::output_len`] bytes.
    pub fn finalize_into(&mut self, out: &mut [u8]) -> HsmResult<usize> {
        let len = self.output_len();
        let out = out.get_mut(..len).ok_or_else(|| {
            HsmError::invalid(format!(
                "{} output needs {len} bytes",
                self.algorithm().name()
            ))
        })?;
        match self {
            Self::Sha1(h) => out.copy_from_slice(&h.finalize_reset()),
            Self::Sha224(h) => out.copy_from_slice(&h.finalize_reset()),
            Self::Sha256(h) => out.copy_from_slice(&h.finalize_reset()),
            Self::Sha384(h) => out.copy_from_slice(&h.finalize_reset()),
            Self::Sha512(h) => out.copy_from_slice(&h.finalize_reset()),
        }
        Ok(len)
    }

    fn finalize_vec(self) -> Vec<u8> {
        match self {
            Self::Sha1(h) => h.finalize().to_vec(),
            Self::Sha224(h) => h.finalize().to_vec(),
            Self::Sha256(h) => h.finalize().to_vec(),
            Self::Sha384(h) => h.finalize().to_vec(),
            Self::Sha512(h) => h.finalize().to_vec(),
        }
    }
}
