//! Secure-element key objects.
//!
//! [`KeyObject`] is the command surface the mechanism layer drives: a
//! capability probe, parameter validation, the raw primitives and attribute
//! access. Card drivers implement it for their own objects; [`SoftKey`] is a
//! software element backed by `hsm-core` used by embedders and the test
//! suite.

use cryptoki_sys::{
    CK_ATTRIBUTE_TYPE, CK_FLAGS, CK_KEY_TYPE, CK_MECHANISM_TYPE, CKA_KEY_TYPE, CKA_MODULUS_BITS,
    CKA_PUBLIC_KEY_INFO, CKA_VALUE, CKF_SIGN, CKK_EC, CKK_GENERIC_SECRET, CKK_RSA,
    CKM_AES_CBC_PAD, CKM_ECDH1_DERIVE, CKM_RSA_PKCS,
};
use hsm_core::{AES_BLOCK_LEN, CbcPadCipher, CipherDirection, HsmError, KeyMaterial};
use parking_lot::{Mutex, RwLock};
use std::{collections::HashMap, fmt};
use tracing::debug;
use zeroize::Zeroizing;

use crate::{
    attribute::{AttributeSet, AttributeValue},
    error::{Error, Result, check_capacity},
    mechanism::{Mechanism, hash_sign_parts, signature_scheme},
    operation::SessionHandle,
};

/// Stage of a streaming cipher call.
#[derive(Debug, Clone, Copy)]
pub enum CipherStep<'a> {
    Init,
    Update(&'a [u8]),
    Final,
}

/// Operations a secure element performs on one of its key objects.
///
/// Every output-producing call follows the PKCS#11 length convention:
/// `out == None` asks for the output length without consuming state, and an
/// undersized buffer fails with [`Error::BufferTooSmall`] carrying the
/// required length, also without consuming state.
pub trait KeyObject: fmt::Debug + Send + Sync {
    /// Whether the element executes `mechanism` for `flags` natively.
    /// [`Error::FunctionNotSupported`] means "no, fall back to software".
    fn can_do(
        &self,
        _session: SessionHandle,
        _mechanism: CK_MECHANISM_TYPE,
        _flags: CK_FLAGS,
    ) -> Result<()> {
        Err(Error::FunctionNotSupported)
    }

    fn init_params(&self, _session: SessionHandle, _mechanism: &Mechanism<'_>) -> Result<()> {
        Ok(())
    }

    /// Raw signature primitive. For hash-composite mechanisms the element
    /// cannot run natively, `data` is the already computed digest.
    fn sign(
        &self,
        _session: SessionHandle,
        _mechanism: &Mechanism<'_>,
        _data: &[u8],
        _out: Option<&mut [u8]>,
    ) -> Result<usize> {
        Err(Error::FunctionNotSupported)
    }

    fn encrypt(
        &self,
        _session: SessionHandle,
        _mechanism: &Mechanism<'_>,
        _step: CipherStep<'_>,
        _out: Option<&mut [u8]>,
    ) -> Result<usize> {
        Err(Error::FunctionNotSupported)
    }

    fn decrypt(
        &self,
        _session: SessionHandle,
        _mechanism: &Mechanism<'_>,
        _step: CipherStep<'_>,
        _out: Option<&mut [u8]>,
    ) -> Result<usize> {
        Err(Error::FunctionNotSupported)
    }

    fn wrap_key(
        &self,
        _session: SessionHandle,
        _mechanism: &Mechanism<'_>,
        _target: &dyn KeyObject,
        _out: Option<&mut [u8]>,
    ) -> Result<usize> {
        Err(Error::FunctionNotSupported)
    }

    fn unwrap_key(
        &self,
        _session: SessionHandle,
        _mechanism: &Mechanism<'_>,
        _wrapped: &[u8],
        _target: &dyn KeyObject,
    ) -> Result<()> {
        Err(Error::FunctionNotSupported)
    }

    fn derive(
        &self,
        _session: SessionHandle,
        _mechanism: &Mechanism<'_>,
        _params: &[u8],
        _out: Option<&mut [u8]>,
    ) -> Result<usize> {
        Err(Error::FunctionNotSupported)
    }

    fn get_attribute(&self, _attr: CK_ATTRIBUTE_TYPE) -> Result<AttributeValue> {
        Err(Error::AttributeTypeInvalid)
    }

    fn set_attribute(&self, _attr: CK_ATTRIBUTE_TYPE, _value: AttributeValue) -> Result<()> {
        Err(Error::FunctionNotSupported)
    }
}

/// Key object of the software secure element.
pub struct SoftKey {
    material: Option<KeyMaterial>,
    native: Vec<(CK_MECHANISM_TYPE, CK_FLAGS)>,
    attributes: RwLock<AttributeSet>,
    encrypt_state: Mutex<HashMap<SessionHandle, CbcPadCipher>>,
    decrypt_state: Mutex<HashMap<SessionHandle, CbcPadCipher>>,
}

impl fmt::Debug for SoftKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftKey")
            .field("material", &self.material)
            .field("native", &self.native)
            .finish_non_exhaustive()
    }
}

impl SoftKey {
    /// Wraps asymmetric or secret key material; attributes are derived from it.
    pub fn new(material: KeyMaterial) -> Result<Self> {
        let mut attributes = AttributeSet::new();
        match &material {
            KeyMaterial::Secret(value) => {
                attributes.set(CKA_KEY_TYPE, AttributeValue::Ulong(CKK_GENERIC_SECRET));
                attributes.set(CKA_VALUE, AttributeValue::Bytes(value.to_vec()));
            }
            asymmetric => {
                let key_type = match asymmetric {
                    KeyMaterial::Rsa(_) => CKK_RSA,
                    _ => CKK_EC,
                };
                attributes.set(CKA_KEY_TYPE, AttributeValue::Ulong(key_type));
                attributes.set(
                    CKA_MODULUS_BITS,
                    AttributeValue::Ulong(asymmetric.key_bits() as _),
                );
                attributes.set(
                    CKA_PUBLIC_KEY_INFO,
                    AttributeValue::Bytes(asymmetric.public_key_der()?),
                );
            }
        }
        Ok(Self::with_attributes(Some(material), attributes))
    }

    /// Secret key of an explicit type, e.g. `CKK_AES`.
    pub fn secret(key_type: CK_KEY_TYPE, value: &[u8]) -> Self {
        let mut attributes = AttributeSet::new();
        attributes.set(CKA_KEY_TYPE, AttributeValue::Ulong(key_type));
        attributes.set(CKA_VALUE, AttributeValue::Bytes(value.to_vec()));
        Self::with_attributes(Some(KeyMaterial::secret(value)), attributes)
    }

    /// Object without key material yet, the target of unwrap or derive.
    pub fn template(key_type: CK_KEY_TYPE) -> Self {
        let mut attributes = AttributeSet::new();
        attributes.set(CKA_KEY_TYPE, AttributeValue::Ulong(key_type));
        Self::with_attributes(None, attributes)
    }

    /// Declares `mechanism` executable natively for the given capability flags.
    pub fn with_native(mut self, mechanism: CK_MECHANISM_TYPE, flags: CK_FLAGS) -> Self {
        self.native.push((mechanism, flags));
        self
    }

    pub fn material(&self) -> Option<&KeyMaterial> {
        self.material.as_ref()
    }

    fn with_attributes(material: Option<KeyMaterial>, attributes: AttributeSet) -> Self {
        Self {
            material,
            native: Vec::new(),
            attributes: RwLock::new(attributes),
            encrypt_state: Mutex::new(HashMap::new()),
            decrypt_state: Mutex::new(HashMap::new()),
        }
    }

    fn key_material(&self) -> Result<&KeyMaterial> {
        self.material.as_ref().ok_or(Error::KeyTypeInconsistent)
    }

    fn is_native(&self, mechanism: CK_MECHANISM_TYPE, flags: CK_FLAGS) -> bool {
        self.native
            .iter()
            .any(|(native, supported)| *native == mechanism && supported & flags == flags)
    }

    fn secret_value(&self) -> Result<Zeroizing<Vec<u8>>> {
        let attributes = self.attributes.read();
        let value = attributes
            .get(CKA_VALUE)
            .ok_or(Error::KeyTypeInconsistent)?
            .as_bytes()?;
        Ok(Zeroizing::new(value.to_vec()))
    }

    /// Cipher contexts are kept per session, so one key can stream in
    /// several sessions at once.
    fn cipher(
        &self,
        session: SessionHandle,
        direction: CipherDirection,
        mechanism: &Mechanism<'_>,
        step: CipherStep<'_>,
        out: Option<&mut [u8]>,
    ) -> Result<usize> {
        if mechanism.mechanism != CKM_AES_CBC_PAD {
            return Err(Error::MechanismInvalid);
        }
        let mut contexts = match direction {
            CipherDirection::Encrypt => self.encrypt_state.lock(),
            CipherDirection::Decrypt => self.decrypt_state.lock(),
        };
        match step {
            CipherStep::Init => {
                check_iv(mechanism)?;
                let key = self.secret_value()?;
                let cipher = CbcPadCipher::new(direction, &key, mechanism.parameter)?;
                contexts.insert(session, cipher);
                Ok(0)
            }
            CipherStep::Update(data) => {
                let cipher = contexts
                    .get_mut(&session)
                    .ok_or(Error::OperationNotInitialized)?;
                let len = cipher.update_len(data.len());
                let Some(out) = out else { return Ok(len) };
                check_capacity(out, len)?;
                Ok(cipher.update(data, out)?)
            }
            CipherStep::Final => {
                let cipher = contexts
                    .get(&session)
                    .ok_or(Error::OperationNotInitialized)?;
                if out.is_none()
                    && direction == CipherDirection::Decrypt
                    && cipher.buffered() != AES_BLOCK_LEN
                {
                    // Exact length needs the held back block; otherwise give an upper bound.
                    return Ok(AES_BLOCK_LEN - 1);
                }
                let last = match cipher.peek_final() {
                    Ok(last) => last,
                    Err(err) => {
                        contexts.remove(&session);
                        return Err(match err {
                            HsmError::InvalidRequest(_) => Error::EncryptedDataLenRange,
                            other => Error::Crypto(other),
                        });
                    }
                };
                let Some(out) = out else { return Ok(last.len()) };
                check_capacity(out, last.len())?;
                out[..last.len()].copy_from_slice(&last);
                contexts.remove(&session);
                Ok(last.len())
            }
        }
    }
}

fn check_iv(mechanism: &Mechanism<'_>) -> Result<()> {
    if mechanism.parameter.len() != AES_BLOCK_LEN {
        return Err(Error::MechanismParamInvalid);
    }
    Ok(())
}

impl KeyObject for SoftKey {
    fn can_do(
        &self,
        _session: SessionHandle,
        mechanism: CK_MECHANISM_TYPE,
        flags: CK_FLAGS,
    ) -> Result<()> {
        if self.is_native(mechanism, flags) {
            Ok(())
        } else {
            Err(Error::FunctionNotSupported)
        }
    }

    fn init_params(&self, _session: SessionHandle, mechanism: &Mechanism<'_>) -> Result<()> {
        match mechanism.mechanism {
            CKM_AES_CBC_PAD => check_iv(mechanism),
            _ => Ok(()),
        }
    }

    fn sign(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism<'_>,
        data: &[u8],
        out: Option<&mut [u8]>,
    ) -> Result<usize> {
        let material = self.key_material()?;
        let scheme = signature_scheme(mechanism.mechanism).ok_or(Error::MechanismInvalid)?;
        let len = material.signature_len()?;
        let Some(out) = out else { return Ok(len) };
        check_capacity(out, len)?;

        let (prehash, message) = match hash_sign_parts(mechanism.mechanism) {
            Some((_, algorithm)) if self.is_native(mechanism.mechanism, CKF_SIGN) => {
                debug!(
                    "session {session}: hashing natively for mechanism {:#x}",
                    mechanism.mechanism
                );
                (Some(algorithm), Zeroizing::new(algorithm.digest(data)))
            }
            Some((_, algorithm)) => (Some(algorithm), Zeroizing::new(data.to_vec())),
            None => (None, Zeroizing::new(data.to_vec())),
        };
        let signature = material.sign(scheme, prehash, &message)?;
        out[..signature.len()].copy_from_slice(&signature);
        Ok(signature.len())
    }

    fn encrypt(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism<'_>,
        step: CipherStep<'_>,
        out: Option<&mut [u8]>,
    ) -> Result<usize> {
        self.cipher(session, CipherDirection::Encrypt, mechanism, step, out)
    }

    fn decrypt(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism<'_>,
        step: CipherStep<'_>,
        out: Option<&mut [u8]>,
    ) -> Result<usize> {
        self.cipher(session, CipherDirection::Decrypt, mechanism, step, out)
    }

    fn wrap_key(
        &self,
        _session: SessionHandle,
        mechanism: &Mechanism<'_>,
        target: &dyn KeyObject,
        out: Option<&mut [u8]>,
    ) -> Result<usize> {
        if mechanism.mechanism != CKM_RSA_PKCS {
            return Err(Error::MechanismInvalid);
        }
        let material = self.key_material()?;
        let len = material.signature_len()?;
        let Some(out) = out else { return Ok(len) };
        check_capacity(out, len)?;

        let value = Zeroizing::new(target.get_attribute(CKA_VALUE)?.into_bytes()?);
        let wrapped = material.rsa_encrypt(&value)?;
        out[..wrapped.len()].copy_from_slice(&wrapped);
        Ok(wrapped.len())
    }

    fn unwrap_key(
        &self,
        _session: SessionHandle,
        mechanism: &Mechanism<'_>,
        wrapped: &[u8],
        target: &dyn KeyObject,
    ) -> Result<()> {
        if mechanism.mechanism != CKM_RSA_PKCS {
            return Err(Error::MechanismInvalid);
        }
        let value = self.key_material()?.rsa_decrypt(wrapped)?;
        target.set_attribute(CKA_VALUE, AttributeValue::Bytes(value.to_vec()))
    }

    fn derive(
        &self,
        session: SessionHandle,
        mechanism: &Mechanism<'_>,
        params: &[u8],
        out: Option<&mut [u8]>,
    ) -> Result<usize> {
        if mechanism.mechanism != CKM_ECDH1_DERIVE {
            return Err(Error::MechanismInvalid);
        }
        let material = self.key_material()?;
        let len = material.ecdh_len()?;
        let Some(out) = out else { return Ok(len) };
        check_capacity(out, len)?;

        let shared = material.ecdh(params)?;
        out[..shared.len()].copy_from_slice(&shared);
        debug!("session {session}: derived {} byte ECDH secret", shared.len());
        Ok(shared.len())
    }

    fn get_attribute(&self, attr: CK_ATTRIBUTE_TYPE) -> Result<AttributeValue> {
        self.attributes
            .read()
            .get(attr)
            .cloned()
            .ok_or(Error::AttributeTypeInvalid)
    }

    fn set_attribute(&self, attr: CK_ATTRIBUTE_TYPE, value: AttributeValue) -> Result<()> {
        self.attributes.write().set(attr, value);
        Ok(())
    }
}
