//! Raw-pointer adapters over [`crate::functions`].
//!
//! Each shim validates the PKCS#11 pointer/length arguments, calls the safe
//! function and writes the produced (or required) length back through the
//! caller's length pointer. The return value is the `CK_RV` for the frontend
//! to hand back unchanged.

use cryptoki_sys::{
    CK_BYTE_PTR, CK_KEY_TYPE, CK_MECHANISM_INFO, CK_MECHANISM_INFO_PTR, CK_MECHANISM_PTR,
    CK_MECHANISM_TYPE, CK_MECHANISM_TYPE_PTR, CK_RV, CK_ULONG, CK_ULONG_PTR, CKR_ARGUMENTS_BAD,
    CKR_OK,
};
use std::slice;
use tracing::{debug, error};

use crate::{
    error::{Error, Result},
    functions,
    hardware::KeyObject,
    mechanism::Mechanism,
    operation::Session,
    registry::Mechanisms,
};

/// Borrows caller input. A null pointer is only accepted for empty input.
unsafe fn input<'a>(ptr: *const u8, len: CK_ULONG) -> Result<&'a [u8]> {
    if ptr.is_null() {
        return if len == 0 {
            Ok(&[])
        } else {
            Err(Error::ArgumentsInvalid)
        };
    }
    // SAFETY: the caller guarantees `ptr` is valid for `len` bytes.
    Ok(unsafe { slice::from_raw_parts(ptr, len as usize) })
}

/// Borrows the caller's output buffer; a null buffer is a length query.
unsafe fn output<'a>(ptr: CK_BYTE_PTR, len_ptr: CK_ULONG_PTR) -> Result<Option<&'a mut [u8]>> {
    if len_ptr.is_null() {
        return Err(Error::ArgumentsInvalid);
    }
    if ptr.is_null() {
        return Ok(None);
    }
    // SAFETY: `len_ptr` is non-null and `ptr` is valid for `*len_ptr` bytes.
    Ok(Some(unsafe { slice::from_raw_parts_mut(ptr, *len_ptr as usize) }))
}

unsafe fn mechanism<'a>(ptr: CK_MECHANISM_PTR) -> Result<Mechanism<'a>> {
    // SAFETY: the caller guarantees a non-null `ptr` points to a CK_MECHANISM.
    let raw = unsafe { ptr.as_ref() }.ok_or(Error::ArgumentsInvalid)?;
    let parameter = unsafe { input(raw.pParameter.cast::<u8>(), raw.ulParameterLen)? };
    Ok(Mechanism::with_parameter(raw.mechanism, parameter))
}

fn fail(what: &str, err: Error) -> CK_RV {
    error!("pkcs11 {what} failed: {err}");
    err.ck_rv()
}

/// Stores the length of a successful or short-buffer call.
unsafe fn report(what: &str, len_ptr: CK_ULONG_PTR, result: Result<usize>) -> CK_RV {
    match result {
        Ok(len) => {
            // SAFETY: `len_ptr` was checked non-null by `output`.
            unsafe { *len_ptr = len as CK_ULONG };
            CKR_OK
        }
        Err(Error::BufferTooSmall(len)) => {
            debug!("pkcs11 {what}: buffer too small, {len} bytes required");
            unsafe { *len_ptr = len as CK_ULONG };
            Error::BufferTooSmall(len).ck_rv()
        }
        Err(err) => fail(what, err),
    }
}

fn status(what: &str, result: Result<()>) -> CK_RV {
    match result {
        Ok(()) => CKR_OK,
        Err(err) => fail(what, err),
    }
}

/// # Safety
/// `p_digest` must be null or valid for `*pul_digest_len` writable bytes and
/// `pul_digest_len` must be null or valid for reads and writes.
pub unsafe fn digest_final<S: Session + ?Sized>(
    session: &mut S,
    p_digest: CK_BYTE_PTR,
    pul_digest_len: CK_ULONG_PTR,
) -> CK_RV {
    let out = match unsafe { output(p_digest, pul_digest_len) } {
        Ok(out) => out,
        Err(err) => return err.ck_rv(),
    };
    unsafe { report("digest_final", pul_digest_len, functions::digest_final(session, out)) }
}

/// # Safety
/// `p_part` must be null or valid for `ul_part_len` bytes.
pub unsafe fn sign_update<S: Session + ?Sized>(
    session: &mut S,
    p_part: CK_BYTE_PTR,
    ul_part_len: CK_ULONG,
) -> CK_RV {
    let data = match unsafe { input(p_part, ul_part_len) } {
        Ok(data) => data,
        Err(err) => return err.ck_rv(),
    };
    status("sign_update", functions::sign_update(session, data))
}

/// # Safety
/// `p_signature` must be null or valid for `*pul_signature_len` writable
/// bytes and `pul_signature_len` must be null or valid for reads and writes.
pub unsafe fn sign_final<S: Session + ?Sized>(
    session: &mut S,
    p_signature: CK_BYTE_PTR,
    pul_signature_len: CK_ULONG_PTR,
) -> CK_RV {
    let out = match unsafe { output(p_signature, pul_signature_len) } {
        Ok(out) => out,
        Err(err) => return err.ck_rv(),
    };
    unsafe { report("sign_final", pul_signature_len, functions::sign_final(session, out)) }
}

/// # Safety
/// `p_signature` must be null or valid for `ul_signature_len` bytes.
#[cfg(feature = "soft-verify")]
pub unsafe fn verify_final<S: Session + ?Sized>(
    session: &mut S,
    p_signature: CK_BYTE_PTR,
    ul_signature_len: CK_ULONG,
) -> CK_RV {
    if p_signature.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let signature = match unsafe { input(p_signature, ul_signature_len) } {
        Ok(signature) => signature,
        Err(err) => return err.ck_rv(),
    };
    status("verify_final", functions::verify_final(session, signature))
}

unsafe fn cipher_call<S, F>(
    what: &str,
    call: F,
    session: &mut S,
    p_in: CK_BYTE_PTR,
    ul_in_len: CK_ULONG,
    p_out: CK_BYTE_PTR,
    pul_out_len: CK_ULONG_PTR,
) -> CK_RV
where
    S: Session + ?Sized,
    F: FnOnce(&mut S, &[u8], Option<&mut [u8]>) -> Result<usize>,
{
    let data = match unsafe { input(p_in, ul_in_len) } {
        Ok(data) => data,
        Err(err) => return err.ck_rv(),
    };
    let out = match unsafe { output(p_out, pul_out_len) } {
        Ok(out) => out,
        Err(err) => return err.ck_rv(),
    };
    unsafe { report(what, pul_out_len, call(session, data, out)) }
}

unsafe fn cipher_final<S, F>(
    what: &str,
    call: F,
    session: &mut S,
    p_out: CK_BYTE_PTR,
    pul_out_len: CK_ULONG_PTR,
) -> CK_RV
where
    S: Session + ?Sized,
    F: FnOnce(&mut S, Option<&mut [u8]>) -> Result<usize>,
{
    let out = match unsafe { output(p_out, pul_out_len) } {
        Ok(out) => out,
        Err(err) => return err.ck_rv(),
    };
    unsafe { report(what, pul_out_len, call(session, out)) }
}

/// # Safety
/// `p_data` must be null or valid for `ul_data_len` bytes, `p_encrypted` null
/// or valid for `*pul_encrypted_len` writable bytes, `pul_encrypted_len` null
/// or valid for reads and writes.
pub unsafe fn encrypt<S: Session + ?Sized>(
    session: &mut S,
    p_data: CK_BYTE_PTR,
    ul_data_len: CK_ULONG,
    p_encrypted: CK_BYTE_PTR,
    pul_encrypted_len: CK_ULONG_PTR,
) -> CK_RV {
    unsafe {
        cipher_call(
            "encrypt",
            functions::encrypt::<S>,
            session,
            p_data,
            ul_data_len,
            p_encrypted,
            pul_encrypted_len,
        )
    }
}

/// # Safety
/// Same contract as [`encrypt`].
pub unsafe fn encrypt_update<S: Session + ?Sized>(
    session: &mut S,
    p_part: CK_BYTE_PTR,
    ul_part_len: CK_ULONG,
    p_encrypted_part: CK_BYTE_PTR,
    pul_encrypted_part_len: CK_ULONG_PTR,
) -> CK_RV {
    unsafe {
        cipher_call(
            "encrypt_update",
            functions::encrypt_update::<S>,
            session,
            p_part,
            ul_part_len,
            p_encrypted_part,
            pul_encrypted_part_len,
        )
    }
}

/// # Safety
/// `p_last` must be null or valid for `*pul_last_len` writable bytes and
/// `pul_last_len` null or valid for reads and writes.
pub unsafe fn encrypt_final<S: Session + ?Sized>(
    session: &mut S,
    p_last: CK_BYTE_PTR,
    pul_last_len: CK_ULONG_PTR,
) -> CK_RV {
    unsafe {
        cipher_final(
            "encrypt_final",
            functions::encrypt_final::<S>,
            session,
            p_last,
            pul_last_len,
        )
    }
}

/// # Safety
/// Same contract as [`encrypt`].
pub unsafe fn decrypt<S: Session + ?Sized>(
    session: &mut S,
    p_encrypted: CK_BYTE_PTR,
    ul_encrypted_len: CK_ULONG,
    p_data: CK_BYTE_PTR,
    pul_data_len: CK_ULONG_PTR,
) -> CK_RV {
    unsafe {
        cipher_call(
            "decrypt",
            functions::decrypt::<S>,
            session,
            p_encrypted,
            ul_encrypted_len,
            p_data,
            pul_data_len,
        )
    }
}

/// # Safety
/// Same contract as [`encrypt`].
pub unsafe fn decrypt_update<S: Session + ?Sized>(
    session: &mut S,
    p_encrypted_part: CK_BYTE_PTR,
    ul_encrypted_part_len: CK_ULONG,
    p_part: CK_BYTE_PTR,
    pul_part_len: CK_ULONG_PTR,
) -> CK_RV {
    unsafe {
        cipher_call(
            "decrypt_update",
            functions::decrypt_update::<S>,
            session,
            p_encrypted_part,
            ul_encrypted_part_len,
            p_part,
            pul_part_len,
        )
    }
}

/// # Safety
/// Same contract as [`encrypt_final`].
pub unsafe fn decrypt_final<S: Session + ?Sized>(
    session: &mut S,
    p_last: CK_BYTE_PTR,
    pul_last_len: CK_ULONG_PTR,
) -> CK_RV {
    unsafe {
        cipher_final(
            "decrypt_final",
            functions::decrypt_final::<S>,
            session,
            p_last,
            pul_last_len,
        )
    }
}

/// # Safety
/// `p_mechanism` must be null or point to a valid `CK_MECHANISM`;
/// `p_wrapped` and `pul_wrapped_len` follow the [`encrypt_final`] contract.
pub unsafe fn wrap<S: Session + ?Sized>(
    session: &mut S,
    p_mechanism: CK_MECHANISM_PTR,
    wrapping_key: &dyn KeyObject,
    key_type: CK_KEY_TYPE,
    target_key: &dyn KeyObject,
    p_wrapped: CK_BYTE_PTR,
    pul_wrapped_len: CK_ULONG_PTR,
) -> CK_RV {
    let mechanism = match unsafe { mechanism(p_mechanism) } {
        Ok(mechanism) => mechanism,
        Err(err) => return err.ck_rv(),
    };
    let out = match unsafe { output(p_wrapped, pul_wrapped_len) } {
        Ok(out) => out,
        Err(err) => return err.ck_rv(),
    };
    let result = functions::wrap(session, &mechanism, wrapping_key, key_type, target_key, out);
    unsafe { report("wrap", pul_wrapped_len, result) }
}

/// # Safety
/// `p_list` must be null or valid for `*pul_count` writable entries and
/// `pul_count` null or valid for reads and writes.
pub unsafe fn get_mechanism_list(
    mechanisms: Option<&Mechanisms>,
    p_list: CK_MECHANISM_TYPE_PTR,
    pul_count: CK_ULONG_PTR,
) -> CK_RV {
    if pul_count.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    let out: Option<&mut [CK_MECHANISM_TYPE]> = if p_list.is_null() {
        None
    } else {
        // SAFETY: `p_list` is valid for `*pul_count` entries per the contract.
        Some(unsafe { slice::from_raw_parts_mut(p_list, *pul_count as usize) })
    };
    unsafe {
        report(
            "get_mechanism_list",
            pul_count,
            functions::get_mechanism_list(mechanisms, out),
        )
    }
}

/// # Safety
/// `p_info` must be null or valid for writing a `CK_MECHANISM_INFO`.
pub unsafe fn get_mechanism_info(
    mechanisms: Option<&Mechanisms>,
    mechanism: CK_MECHANISM_TYPE,
    p_info: CK_MECHANISM_INFO_PTR,
) -> CK_RV {
    if p_info.is_null() {
        return CKR_ARGUMENTS_BAD;
    }
    match functions::get_mechanism_info(mechanisms, mechanism) {
        Ok(info) => {
            // SAFETY: `p_info` is non-null and writable per the contract.
            unsafe { p_info.write(CK_MECHANISM_INFO::from(info)) };
            CKR_OK
        }
        Err(err) => fail("get_mechanism_info", err),
    }
}
