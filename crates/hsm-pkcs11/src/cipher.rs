//! Streaming encrypt/decrypt engine.
//!
//! The key object keeps the cipher context for each session; the engine only
//! sequences the init/update/final steps and splits the caller's buffer for
//! single-part calls.

use cryptoki_sys::{CK_FLAGS, CKF_DECRYPT, CKF_ENCRYPT};
use hsm_core::CipherDirection;
use std::sync::Arc;

use crate::{
    error::{Error, Result},
    hardware::{CipherStep, KeyObject},
    mechanism::CipherOps,
    operation::{Operation, OperationData},
};

#[derive(Debug, Clone)]
pub struct CipherData {
    key: Arc<dyn KeyObject>,
}

impl CipherData {
    pub fn key(&self) -> &Arc<dyn KeyObject> {
        &self.key
    }
}

#[derive(Debug)]
pub struct CipherEngine {
    direction: CipherDirection,
}

pub static ENCRYPTION: CipherEngine = CipherEngine {
    direction: CipherDirection::Encrypt,
};

pub static DECRYPTION: CipherEngine = CipherEngine {
    direction: CipherDirection::Decrypt,
};

impl CipherEngine {
    fn flag(&self) -> CK_FLAGS {
        match self.direction {
            CipherDirection::Encrypt => CKF_ENCRYPT,
            CipherDirection::Decrypt => CKF_DECRYPT,
        }
    }

    fn step(&self, op: &Operation, step: CipherStep<'_>, out: Option<&mut [u8]>) -> Result<usize> {
        let key = match op.data() {
            OperationData::Cipher(data) => data.key(),
            _ => return Err(Error::OperationNotInitialized),
        };
        let mechanism = op.mechanism();
        match self.direction {
            CipherDirection::Encrypt => key.encrypt(op.session(), &mechanism, step, out),
            CipherDirection::Decrypt => key.decrypt(op.session(), &mechanism, step, out),
        }
    }
}

impl CipherOps for CipherEngine {
    fn init(&self, op: &mut Operation, key: Arc<dyn KeyObject>) -> Result<()> {
        match key.can_do(op.session(), op.mechanism().mechanism, self.flag()) {
            Ok(()) | Err(Error::FunctionNotSupported) => {}
            Err(err) => return Err(err),
        }
        op.set_data(OperationData::Cipher(CipherData { key }));
        self.step(op, CipherStep::Init, None).map(|_| ())
    }

    /// Update followed by final into one buffer. Capacity is checked against
    /// the queried lengths before any input reaches the key, so a short buffer
    /// leaves the stream untouched for the retry.
    fn once(&self, op: &mut Operation, data: &[u8], out: Option<&mut [u8]>) -> Result<usize> {
        let head = self.step(op, CipherStep::Update(data), None)?;
        let tail = self.step(op, CipherStep::Final, None)?;
        let Some(out) = out else {
            return Ok(head + tail);
        };
        if out.len() < head + tail {
            return Err(Error::BufferTooSmall(head + tail));
        }
        let (head_out, tail_out) = out.split_at_mut(head);
        let written = self.step(op, CipherStep::Update(data), Some(head_out))?;
        if written != head {
            return Err(Error::OperationFailed);
        }
        Ok(head + self.step(op, CipherStep::Final, Some(tail_out))?)
    }

    fn update(&self, op: &mut Operation, data: &[u8], out: Option<&mut [u8]>) -> Result<usize> {
        self.step(op, CipherStep::Update(data), out)
    }

    fn finish(&self, op: &mut Operation, out: Option<&mut [u8]>) -> Result<usize> {
        self.step(op, CipherStep::Final, out)
    }
}
