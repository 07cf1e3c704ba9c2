//! Append-only byte accumulator for raw signature input.

use std::fmt;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Growable buffer whose every allocation is wiped before it is freed.
///
/// Each append moves the contents into a fresh allocation of exactly
/// `old + new` bytes; the previous allocation is zeroised on the way out.
#[derive(Clone, Default)]
pub struct SecureBuffer {
    data: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for SecureBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureBuffer")
            .field("len", &self.data.len())
            .finish()
    }
}

impl SecureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let len = self
            .data
            .len()
            .checked_add(bytes.len())
            .ok_or(Error::OutOfMemory)?;
        let mut grown = Zeroizing::new(Vec::new());
        grown
            .try_reserve_exact(len)
            .map_err(|_| Error::OutOfMemory)?;
        grown.extend_from_slice(&self.data);
        grown.extend_from_slice(bytes);
        self.data = grown;
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
