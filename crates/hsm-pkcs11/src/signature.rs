//! Sign and verify engines.
//!
//! When a key can run a hash-composite mechanism itself the message goes
//! straight to the element. Otherwise the engine drives a nested software
//! digest operation and hands only the hash to the raw primitive, so both
//! paths look the same to the caller.

use cryptoki_sys::{
    CKA_KEY_TYPE, CKA_MODULUS_BITS, CKF_SIGN, CKK_EC, CKK_EC_EDWARDS, CKK_EC_MONTGOMERY,
    CKK_GOSTR3410, CKK_RSA,
};
use hsm_core::MAX_DIGEST_LEN;
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroizing;

use crate::{
    buffer::SecureBuffer,
    error::{Error, Result},
    hardware::KeyObject,
    mechanism::{HashSignInfo, SignOps},
    operation::{Operation, OperationData, SessionHandle},
};

#[cfg(feature = "soft-verify")]
use crate::mechanism::{VerifyOps, digest_algorithm, signature_scheme};
#[cfg(feature = "soft-verify")]
use cryptoki_sys::{CKA_GOSTR3410_PARAMS, CKA_PUBLIC_KEY_INFO, CKA_VALUE, CKF_VERIFY};
#[cfg(feature = "soft-verify")]
use hsm_core::{PublicKeyData, verify_signature};

/// Private state of a sign or verify operation.
#[derive(Debug, Clone)]
pub struct SignatureData {
    key: Arc<dyn KeyObject>,
    info: Option<HashSignInfo>,
    md: Option<Box<Operation>>,
    buffer: SecureBuffer,
}

impl SignatureData {
    pub fn key(&self) -> &Arc<dyn KeyObject> {
        &self.key
    }

    pub fn hash_sign_info(&self) -> Option<&HashSignInfo> {
        self.info.as_ref()
    }

    /// True when hashing happens in software before the raw primitive.
    pub fn has_nested_digest(&self) -> bool {
        self.md.is_some()
    }

    /// Raw input accumulated so far (empty while a nested digest is active).
    pub fn buffered(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    fn accumulate(&mut self, data: &[u8]) -> Result<()> {
        match self.md.as_deref_mut() {
            Some(md) => {
                let ops = md.mechanism_type().digest_ops()?;
                ops.update(md, data)
            }
            None => self.buffer.append(data),
        }
    }

    /// The bytes handed to the raw primitive: accumulated input followed by
    /// the digest, if any. Works on copies so the operation can be finished
    /// again after a length query or a short buffer.
    fn message(&self) -> Result<SecureBuffer> {
        let Some(md) = self.md.as_deref() else {
            return Ok(self.buffer.clone());
        };
        let mut fork = md.clone();
        let ops = fork.mechanism_type().digest_ops()?;
        let mut hash = Zeroizing::new([0u8; MAX_DIGEST_LEN]);
        let len = ops
            .finish(&mut fork, Some(&mut hash[..]))
            .map_err(|err| {
                if err.is_buffer_too_small() {
                    Error::OperationFailed
                } else {
                    err
                }
            })?;
        let mut message = self.buffer.clone();
        message.append(&hash[..len])?;
        Ok(message)
    }
}

fn nested_digest(session: SessionHandle, info: &HashSignInfo) -> Result<Box<Operation>> {
    let mut md = Box::new(Operation::new(session, info.hash_type.clone()));
    info.hash_type.digest_ops()?.init(&mut md)?;
    Ok(md)
}

fn signature_data(op: &Operation) -> Result<&SignatureData> {
    match op.data() {
        OperationData::Signature(data) => Ok(data),
        _ => Err(Error::OperationNotInitialized),
    }
}

fn signature_data_mut(op: &mut Operation) -> Result<&mut SignatureData> {
    match op.data_mut() {
        OperationData::Signature(data) => Ok(data),
        _ => Err(Error::OperationNotInitialized),
    }
}

/// Sign engine shared by every mechanism advertising `CKF_SIGN`.
#[derive(Debug)]
pub struct GenericSignature;

pub static SIGNATURE: GenericSignature = GenericSignature;

impl SignOps for GenericSignature {
    fn init(&self, op: &mut Operation, key: Arc<dyn KeyObject>) -> Result<()> {
        let session = op.session();
        let mechanism = op.mechanism().mechanism;
        let native = match key.can_do(session, mechanism, CKF_SIGN) {
            Ok(()) => true,
            Err(Error::FunctionNotSupported) => false,
            Err(err) => return Err(err),
        };
        key.init_params(session, &op.mechanism())?;

        let info = op.mechanism_type().hash_sign_info().cloned();
        let md = match &info {
            Some(info) if !native => {
                debug!(
                    "session {session}: hashing {:#x} in software for {mechanism:#x}",
                    info.hash_mech
                );
                Some(nested_digest(session, info)?)
            }
            _ => None,
        };
        op.set_data(OperationData::Signature(SignatureData {
            key,
            info,
            md,
            buffer: SecureBuffer::new(),
        }));
        Ok(())
    }

    fn update(&self, op: &mut Operation, data: &[u8]) -> Result<()> {
        signature_data_mut(op)?.accumulate(data)
    }

    fn finish(&self, op: &mut Operation, out: Option<&mut [u8]>) -> Result<usize> {
        let mechanism = op.mechanism();
        let data = signature_data(op)?;
        let message = data.message()?;
        data.key.sign(op.session(), &mechanism, message.as_slice(), out)
    }

    fn size(&self, op: &Operation) -> Result<usize> {
        let key = signature_data(op)?.key();
        let key_type = key.get_attribute(CKA_KEY_TYPE)?.as_ulong()?;
        let bits = key.get_attribute(CKA_MODULUS_BITS)?.as_ulong()?;
        let bytes = usize::try_from(bits)
            .map_err(|_| Error::OperationFailed)?
            .div_ceil(8);
        match key_type {
            CKK_RSA => Ok(bytes),
            CKK_EC | CKK_EC_EDWARDS | CKK_EC_MONTGOMERY | CKK_GOSTR3410 => Ok(bytes * 2),
            _ => Err(Error::MechanismInvalid),
        }
    }
}

/// Software verification engine: the element is never asked to verify.
#[cfg(feature = "soft-verify")]
#[derive(Debug)]
pub struct GenericVerification;

#[cfg(feature = "soft-verify")]
pub static VERIFICATION: GenericVerification = GenericVerification;

#[cfg(feature = "soft-verify")]
impl VerifyOps for GenericVerification {
    fn init(&self, op: &mut Operation, key: Arc<dyn KeyObject>) -> Result<()> {
        let session = op.session();
        match key.can_do(session, op.mechanism().mechanism, CKF_VERIFY) {
            Ok(()) | Err(Error::FunctionNotSupported) => {}
            Err(err) => return Err(err),
        }
        key.init_params(session, &op.mechanism())?;

        let info = op.mechanism_type().hash_sign_info().cloned();
        let md = match &info {
            Some(info) => Some(nested_digest(session, info)?),
            None => None,
        };
        op.set_data(OperationData::Signature(SignatureData {
            key,
            info,
            md,
            buffer: SecureBuffer::new(),
        }));
        Ok(())
    }

    fn update(&self, op: &mut Operation, data: &[u8]) -> Result<()> {
        signature_data_mut(op)?.accumulate(data)
    }

    fn finish(&self, op: &mut Operation, signature: &[u8]) -> Result<()> {
        let mechanism = op.mechanism().mechanism;
        let data = signature_data(op)?;
        let key_type = data.key.get_attribute(CKA_KEY_TYPE)?.as_ulong()?;
        let scheme = signature_scheme(mechanism).ok_or(Error::MechanismInvalid)?;
        let prehash = data
            .info
            .as_ref()
            .and_then(|info| digest_algorithm(info.hash_mech));

        let message = data.message()?;
        let valid = match key_type {
            CKK_RSA | CKK_EC | CKK_EC_EDWARDS | CKK_EC_MONTGOMERY => {
                let spki = data.key.get_attribute(CKA_PUBLIC_KEY_INFO)?.into_bytes()?;
                verify_signature(
                    &PublicKeyData::Spki(&spki),
                    scheme,
                    prehash,
                    message.as_slice(),
                    signature,
                )?
            }
            CKK_GOSTR3410 => {
                let value = data.key.get_attribute(CKA_VALUE)?.into_bytes()?;
                let params = data.key.get_attribute(CKA_GOSTR3410_PARAMS)?.into_bytes()?;
                verify_signature(
                    &PublicKeyData::Gost {
                        value: &value,
                        params: &params,
                    },
                    scheme,
                    prehash,
                    message.as_slice(),
                    signature,
                )?
            }
            _ => return Err(Error::MechanismInvalid),
        };
        if valid {
            Ok(())
        } else {
            Err(Error::SignatureInvalid)
        }
    }
}
