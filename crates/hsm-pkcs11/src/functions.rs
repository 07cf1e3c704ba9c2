//! Session-level entry points behind the `C_*` verbs.
//!
//! These functions own the operation slot lifecycle: they look up the
//! mechanism, start the slot, drive the engine and decide whether the slot
//! survives the call. Length queries (`out == None`) and short buffers keep
//! the operation alive so the caller can retry; every other error releases it.

use cryptoki_sys::{
    CK_FLAGS, CK_KEY_TYPE, CK_MECHANISM_TYPE, CKA_VALUE, CKF_DECRYPT, CKF_DERIVE, CKF_DIGEST,
    CKF_ENCRYPT, CKF_SIGN, CKF_UNWRAP, CKF_WRAP,
};
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroizing;

use crate::{
    attribute::AttributeValue,
    error::{Error, Result},
    hardware::KeyObject,
    mechanism::{CipherOps, Mechanism, MechanismInfo, MechanismType, validate_key_type},
    operation::{Operation, OperationClass, Session},
    registry::Mechanisms,
};

#[cfg(feature = "soft-verify")]
use cryptoki_sys::CKF_VERIFY;

fn lookup<S: Session + ?Sized>(
    session: &S,
    mechanism: CK_MECHANISM_TYPE,
    flags: CK_FLAGS,
) -> Result<Arc<MechanismType>> {
    session
        .mechanisms()
        .ok_or(Error::ArgumentsInvalid)?
        .find(mechanism, flags)
        .cloned()
        .ok_or(Error::MechanismInvalid)
}

/// Starts the slot for `class` and runs `init` on the new operation,
/// releasing the slot again if it fails.
fn start<S, F>(
    session: &mut S,
    class: OperationClass,
    mt: Arc<MechanismType>,
    mechanism: &Mechanism<'_>,
    init: F,
) -> Result<()>
where
    S: Session + ?Sized,
    F: FnOnce(&mut Operation) -> Result<()>,
{
    let mut op = Operation::new(session.handle(), mt);
    op.set_mechanism(mechanism)?;
    let op = session.start_operation(class, op)?;
    if let Err(err) = init(op) {
        session.stop_operation(class);
        return Err(err);
    }
    Ok(())
}

/// Runs a mid-operation step. Errors release the slot unless `retryable`
/// says otherwise.
fn step<S, T, F>(
    session: &mut S,
    class: OperationClass,
    retryable: fn(&Error) -> bool,
    f: F,
) -> Result<T>
where
    S: Session + ?Sized,
    F: FnOnce(&mut Operation) -> Result<T>,
{
    let op = session.get_operation(class)?;
    let result = f(op);
    if let Err(err) = &result {
        if !retryable(err) {
            session.stop_operation(class);
        }
    }
    result
}

fn never(_: &Error) -> bool {
    false
}

/// Runs a final-stage call and applies the termination rules.
fn finish<S, F>(session: &mut S, class: OperationClass, query: bool, f: F) -> Result<usize>
where
    S: Session + ?Sized,
    F: FnOnce(&mut Operation) -> Result<usize>,
{
    let op = session.get_operation(class)?;
    match f(op) {
        Ok(len) => {
            if !query {
                session.stop_operation(class);
            }
            Ok(len)
        }
        Err(Error::BufferTooSmall(len)) if query => Ok(len),
        Err(err @ Error::BufferTooSmall(_)) => Err(err),
        Err(err) => {
            session.stop_operation(class);
            Err(err)
        }
    }
}

pub fn digest_init<S: Session + ?Sized>(session: &mut S, mechanism: &Mechanism<'_>) -> Result<()> {
    let mt = lookup(session, mechanism.mechanism, CKF_DIGEST)?;
    start(session, OperationClass::Digest, mt, mechanism, |op| {
        op.mechanism_type().digest_ops()?.init(op)
    })
}

pub fn digest_update<S: Session + ?Sized>(session: &mut S, data: &[u8]) -> Result<()> {
    step(session, OperationClass::Digest, never, |op| {
        op.mechanism_type().digest_ops()?.update(op, data)
    })
}

pub fn digest_final<S: Session + ?Sized>(session: &mut S, out: Option<&mut [u8]>) -> Result<usize> {
    let query = out.is_none();
    finish(session, OperationClass::Digest, query, |op| {
        op.mechanism_type().digest_ops()?.finish(op, out)
    })
}

pub fn sign_init<S: Session + ?Sized>(
    session: &mut S,
    mechanism: &Mechanism<'_>,
    key: Arc<dyn KeyObject>,
    key_type: CK_KEY_TYPE,
) -> Result<()> {
    debug!(
        "session {}: sign init, mechanism {:#x}, key type {key_type:#x}",
        session.handle(),
        mechanism.mechanism
    );
    let mt = lookup(session, mechanism.mechanism, CKF_SIGN)?;
    validate_key_type(&mt, key_type)?;
    start(session, OperationClass::Sign, mt, mechanism, |op| {
        op.mechanism_type().sign_ops()?.init(op, key)
    })
}

pub fn sign_update<S: Session + ?Sized>(session: &mut S, data: &[u8]) -> Result<()> {
    step(session, OperationClass::Sign, never, |op| {
        op.mechanism_type().sign_ops()?.update(op, data)
    })
}

pub fn sign_final<S: Session + ?Sized>(session: &mut S, out: Option<&mut [u8]>) -> Result<usize> {
    let query = out.is_none();
    finish(session, OperationClass::Sign, query, |op| {
        op.mechanism_type().sign_ops()?.finish(op, out)
    })
}

/// Signature length of the active sign operation.
pub fn sign_size<S: Session + ?Sized>(session: &mut S) -> Result<usize> {
    step(session, OperationClass::Sign, never, |op| {
        op.mechanism_type().sign_ops()?.size(op)
    })
}

#[cfg(feature = "soft-verify")]
pub fn verify_init<S: Session + ?Sized>(
    session: &mut S,
    mechanism: &Mechanism<'_>,
    key: Arc<dyn KeyObject>,
    key_type: CK_KEY_TYPE,
) -> Result<()> {
    debug!(
        "session {}: verify init, mechanism {:#x}, key type {key_type:#x}",
        session.handle(),
        mechanism.mechanism
    );
    let mt = lookup(session, mechanism.mechanism, CKF_VERIFY)?;
    validate_key_type(&mt, key_type)?;
    start(session, OperationClass::Verify, mt, mechanism, |op| {
        op.mechanism_type().verify_ops()?.init(op, key)
    })
}

#[cfg(feature = "soft-verify")]
pub fn verify_update<S: Session + ?Sized>(session: &mut S, data: &[u8]) -> Result<()> {
    step(session, OperationClass::Verify, never, |op| {
        op.mechanism_type().verify_ops()?.update(op, data)
    })
}

/// Checks `signature` and releases the verify operation whatever the outcome.
#[cfg(feature = "soft-verify")]
pub fn verify_final<S: Session + ?Sized>(session: &mut S, signature: &[u8]) -> Result<()> {
    let op = session.get_operation(OperationClass::Verify)?;
    let result = op
        .mechanism_type()
        .verify_ops()
        .and_then(|ops| ops.finish(op, signature));
    session.stop_operation(OperationClass::Verify);
    result
}

fn cipher_init<S: Session + ?Sized>(
    session: &mut S,
    class: OperationClass,
    mechanism: &Mechanism<'_>,
    key: Arc<dyn KeyObject>,
    key_type: CK_KEY_TYPE,
) -> Result<()> {
    let flags = match class {
        OperationClass::Encrypt => CKF_ENCRYPT,
        _ => CKF_DECRYPT,
    };
    let mt = lookup(session, mechanism.mechanism, flags)?;
    validate_key_type(&mt, key_type)?;
    start(session, class, mt, mechanism, |op| {
        cipher_ops(op, class)?.init(op, key.clone())?;
        key.init_params(op.session(), &op.mechanism())
    })
}

fn cipher_ops(op: &Operation, class: OperationClass) -> Result<&'static dyn CipherOps> {
    match class {
        OperationClass::Encrypt => op.mechanism_type().encrypt_ops(),
        _ => op.mechanism_type().decrypt_ops(),
    }
}

fn cipher_once<S: Session + ?Sized>(
    session: &mut S,
    class: OperationClass,
    data: &[u8],
    out: Option<&mut [u8]>,
) -> Result<usize> {
    let query = out.is_none();
    finish(session, class, query, |op| cipher_ops(op, class)?.once(op, data, out))
}

fn cipher_update<S: Session + ?Sized>(
    session: &mut S,
    class: OperationClass,
    data: &[u8],
    out: Option<&mut [u8]>,
) -> Result<usize> {
    step(session, class, Error::is_buffer_too_small, |op| {
        cipher_ops(op, class)?.update(op, data, out)
    })
}

fn cipher_final<S: Session + ?Sized>(
    session: &mut S,
    class: OperationClass,
    out: Option<&mut [u8]>,
) -> Result<usize> {
    let query = out.is_none();
    finish(session, class, query, |op| cipher_ops(op, class)?.finish(op, out))
}

pub fn encrypt_init<S: Session + ?Sized>(
    session: &mut S,
    mechanism: &Mechanism<'_>,
    key: Arc<dyn KeyObject>,
    key_type: CK_KEY_TYPE,
) -> Result<()> {
    cipher_init(session, OperationClass::Encrypt, mechanism, key, key_type)
}

pub fn encrypt<S: Session + ?Sized>(
    session: &mut S,
    data: &[u8],
    out: Option<&mut [u8]>,
) -> Result<usize> {
    cipher_once(session, OperationClass::Encrypt, data, out)
}

pub fn encrypt_update<S: Session + ?Sized>(
    session: &mut S,
    data: &[u8],
    out: Option<&mut [u8]>,
) -> Result<usize> {
    cipher_update(session, OperationClass::Encrypt, data, out)
}

pub fn encrypt_final<S: Session + ?Sized>(session: &mut S, out: Option<&mut [u8]>) -> Result<usize> {
    cipher_final(session, OperationClass::Encrypt, out)
}

pub fn decrypt_init<S: Session + ?Sized>(
    session: &mut S,
    mechanism: &Mechanism<'_>,
    key: Arc<dyn KeyObject>,
    key_type: CK_KEY_TYPE,
) -> Result<()> {
    cipher_init(session, OperationClass::Decrypt, mechanism, key, key_type)
}

pub fn decrypt<S: Session + ?Sized>(
    session: &mut S,
    data: &[u8],
    out: Option<&mut [u8]>,
) -> Result<usize> {
    cipher_once(session, OperationClass::Decrypt, data, out)
}

pub fn decrypt_update<S: Session + ?Sized>(
    session: &mut S,
    data: &[u8],
    out: Option<&mut [u8]>,
) -> Result<usize> {
    cipher_update(session, OperationClass::Decrypt, data, out)
}

pub fn decrypt_final<S: Session + ?Sized>(session: &mut S, out: Option<&mut [u8]>) -> Result<usize> {
    cipher_final(session, OperationClass::Decrypt, out)
}

/// Runs a one-shot key management verb in its own slot, which is released
/// afterwards whatever the outcome.
fn one_shot<S, T, F>(
    session: &mut S,
    class: OperationClass,
    mt: Arc<MechanismType>,
    mechanism: &Mechanism<'_>,
    f: F,
) -> Result<T>
where
    S: Session + ?Sized,
    F: FnOnce(&mut Operation) -> Result<T>,
{
    let mut op = Operation::new(session.handle(), mt);
    op.set_mechanism(mechanism)?;
    let op = session.start_operation(class, op)?;
    let result = f(op);
    session.stop_operation(class);
    result
}

pub fn wrap<S: Session + ?Sized>(
    session: &mut S,
    mechanism: &Mechanism<'_>,
    wrapping_key: &dyn KeyObject,
    key_type: CK_KEY_TYPE,
    target_key: &dyn KeyObject,
    out: Option<&mut [u8]>,
) -> Result<usize> {
    let mt = lookup(session, mechanism.mechanism, CKF_WRAP)?;
    validate_key_type(&mt, key_type)?;
    one_shot(session, OperationClass::Wrap, mt, mechanism, |op| {
        op.mechanism_type()
            .wrap_ops()?
            .wrap(op, wrapping_key, target_key, out)
    })
}

pub fn unwrap<S: Session + ?Sized>(
    session: &mut S,
    mechanism: &Mechanism<'_>,
    unwrapping_key: &dyn KeyObject,
    key_type: CK_KEY_TYPE,
    wrapped: &[u8],
    target_key: &dyn KeyObject,
) -> Result<()> {
    let mt = lookup(session, mechanism.mechanism, CKF_UNWRAP)?;
    validate_key_type(&mt, key_type)?;
    one_shot(session, OperationClass::Unwrap, mt, mechanism, |op| {
        op.mechanism_type()
            .unwrap_ops()?
            .unwrap(op, unwrapping_key, wrapped, target_key)
    })
}

/// Derives a secret from `base_key` and stores it as `CKA_VALUE` on
/// `derived_key`. A zero-length result leaves the derived key untouched.
pub fn derive<S: Session + ?Sized>(
    session: &mut S,
    mechanism: &Mechanism<'_>,
    base_key: &dyn KeyObject,
    key_type: CK_KEY_TYPE,
    derived_key: &dyn KeyObject,
) -> Result<()> {
    let mt = lookup(session, mechanism.mechanism, CKF_DERIVE)?;
    validate_key_type(&mt, key_type)?;
    let params = mechanism.parameter;
    one_shot(session, OperationClass::Derive, mt, mechanism, |op| {
        let ops = op.mechanism_type().derive_ops()?;
        let len = ops.derive(op, base_key, params, None)?;

        let mut value = Zeroizing::new(Vec::new());
        let capacity = if len == 0 { 8 } else { len };
        value
            .try_reserve_exact(capacity)
            .map_err(|_| Error::OutOfMemory)?;
        value.resize(capacity, 0);

        let len = ops.derive(op, base_key, params, Some(&mut value[..]))?;
        if len > 0 {
            let derived = value.get(..len).ok_or(Error::OperationFailed)?;
            derived_key.set_attribute(CKA_VALUE, AttributeValue::Bytes(derived.to_vec()))?;
        }
        Ok(())
    })
}

pub fn get_mechanism_list(
    mechanisms: Option<&Mechanisms>,
    out: Option<&mut [CK_MECHANISM_TYPE]>,
) -> Result<usize> {
    mechanisms.ok_or(Error::TokenNotPresent)?.list(out)
}

pub fn get_mechanism_info(
    mechanisms: Option<&Mechanisms>,
    mechanism: CK_MECHANISM_TYPE,
) -> Result<MechanismInfo> {
    mechanisms.ok_or(Error::TokenNotPresent)?.info(mechanism)
}
