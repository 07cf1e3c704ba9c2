//! Sign and verify through the session-level functions.

mod common;

use cryptoki_sys::{
    CK_FLAGS, CK_MECHANISM_TYPE, CKF_SIGN, CKK_EC, CKK_RSA, CKM_ECDSA, CKM_ECDSA_SHA256,
    CKM_RSA_PKCS, CKM_SHA256_RSA_PKCS,
};
use hsm_core::{DigestAlgorithm, KeyMaterial};
use hsm_pkcs11::{
    Error, KeyObject, Mechanism, OperationClass, SoftKey, functions, operation::SessionHandle,
};
use parking_lot::Mutex;
use std::sync::Arc;

fn ec_key() -> Arc<SoftKey> {
    Arc::new(SoftKey::new(KeyMaterial::generate_p256()).expect("ec key"))
}

fn sign(
    session: &mut hsm_pkcs11::SessionState,
    mechanism: CK_MECHANISM_TYPE,
    key: Arc<dyn KeyObject>,
    key_type: cryptoki_sys::CK_KEY_TYPE,
    parts: &[&[u8]],
) -> Vec<u8> {
    functions::sign_init(session, &Mechanism::new(mechanism), key, key_type).expect("sign init");
    for part in parts {
        functions::sign_update(session, part).expect("sign update");
    }
    let len = functions::sign_final(session, None).expect("length query");
    let mut signature = vec![0u8; len];
    let len = functions::sign_final(session, Some(&mut signature)).expect("sign final");
    signature.truncate(len);
    signature
}

#[test]
fn test_composite_signature_equals_raw_signature_over_digest() {
    let mut session = common::session();
    let key = ec_key();
    let message = b"the quick brown fox jumps over the lazy dog";

    let composite = sign(
        &mut session,
        CKM_ECDSA_SHA256,
        key.clone(),
        CKK_EC,
        &[&message[..10], &message[10..]],
    );
    let digest = DigestAlgorithm::Sha256.digest(message);
    let raw = sign(&mut session, CKM_ECDSA, key, CKK_EC, &[&digest]);

    // RFC 6979 nonces make ECDSA deterministic for identical inputs.
    assert_eq!(composite, raw);
    assert_eq!(composite.len(), 64);
}

#[test]
fn test_native_and_software_hashing_agree() {
    let mut session = common::session();
    let material = KeyMaterial::generate_rsa(1024).expect("rsa key");
    let KeyMaterial::Rsa(private) = &material else {
        unreachable!("generate_rsa returns RSA material");
    };
    let native = Arc::new(
        SoftKey::new(KeyMaterial::Rsa(private.clone()))
            .expect("key")
            .with_native(CKM_SHA256_RSA_PKCS, CKF_SIGN),
    );
    let software = Arc::new(SoftKey::new(material).expect("key"));

    let message = b"composed in software or hashed on the element";
    let by_element = sign(&mut session, CKM_SHA256_RSA_PKCS, native, CKK_RSA, &[message]);
    let by_host = sign(&mut session, CKM_SHA256_RSA_PKCS, software, CKK_RSA, &[message]);
    assert_eq!(by_element, by_host);
    assert_eq!(by_element.len(), 128);
}

/// Element that claims every mechanism and records what it was asked to sign.
#[derive(Debug, Default)]
struct RecordingKey {
    signed: Mutex<Vec<Vec<u8>>>,
    refuse: bool,
}

impl KeyObject for RecordingKey {
    fn can_do(&self, _: SessionHandle, _: CK_MECHANISM_TYPE, _: CK_FLAGS) -> hsm_pkcs11::Result<()> {
        if self.refuse {
            Err(Error::Device(cryptoki_sys::CKR_DEVICE_ERROR))
        } else {
            Ok(())
        }
    }

    fn sign(
        &self,
        _: SessionHandle,
        _: &Mechanism<'_>,
        data: &[u8],
        out: Option<&mut [u8]>,
    ) -> hsm_pkcs11::Result<usize> {
        let Some(out) = out else { return Ok(8) };
        if out.len() < 8 {
            return Err(Error::BufferTooSmall(8));
        }
        self.signed.lock().push(data.to_vec());
        out[..8].copy_from_slice(b"signatur");
        Ok(8)
    }
}

#[test]
fn test_native_composite_receives_the_message() {
    let mut session = common::session();
    let key = Arc::new(RecordingKey::default());
    let signature = sign(
        &mut session,
        CKM_ECDSA_SHA256,
        key.clone(),
        CKK_EC,
        &[b"hello ", b"world"],
    );
    assert_eq!(signature, b"signatur");
    assert_eq!(key.signed.lock().as_slice(), &[b"hello world".to_vec()]);
}

#[test]
fn test_length_query_and_short_buffer_keep_the_operation() {
    let mut session = common::session();
    let key = Arc::new(RecordingKey::default());
    functions::sign_init(&mut session, &Mechanism::new(CKM_ECDSA), key.clone(), CKK_EC)
        .expect("init");
    functions::sign_update(&mut session, b"payload").expect("update");

    assert_eq!(functions::sign_final(&mut session, None).ok(), Some(8));
    assert!(session.is_active(OperationClass::Sign));

    let mut short = [0u8; 4];
    assert!(matches!(
        functions::sign_final(&mut session, Some(&mut short)),
        Err(Error::BufferTooSmall(8))
    ));
    assert!(session.is_active(OperationClass::Sign));

    let mut out = [0u8; 8];
    assert_eq!(functions::sign_final(&mut session, Some(&mut out)).ok(), Some(8));
    assert!(!session.is_active(OperationClass::Sign));
    assert_eq!(key.signed.lock().len(), 1);
}

#[test]
fn test_failed_init_frees_the_slot() {
    let mut session = common::session();
    let key = Arc::new(RecordingKey {
        refuse: true,
        ..RecordingKey::default()
    });
    assert!(matches!(
        functions::sign_init(&mut session, &Mechanism::new(CKM_ECDSA), key, CKK_EC),
        Err(Error::Device(_))
    ));
    assert!(!session.is_active(OperationClass::Sign));

    functions::sign_init(&mut session, &Mechanism::new(CKM_ECDSA), ec_key(), CKK_EC)
        .expect("slot is free again");
}

#[test]
fn test_second_init_reports_active_operation() {
    let mut session = common::session();
    functions::sign_init(&mut session, &Mechanism::new(CKM_ECDSA), ec_key(), CKK_EC)
        .expect("init");
    assert!(matches!(
        functions::sign_init(&mut session, &Mechanism::new(CKM_ECDSA), ec_key(), CKK_EC),
        Err(Error::OperationActive)
    ));
}

#[test]
fn test_key_type_must_match_registration() {
    let mut session = common::session();
    assert!(matches!(
        functions::sign_init(&mut session, &Mechanism::new(CKM_RSA_PKCS), ec_key(), CKK_EC),
        Err(Error::KeyTypeInconsistent)
    ));
    assert!(!session.is_active(OperationClass::Sign));
}

#[test]
fn test_sign_size_follows_key_attributes() {
    let mut session = common::session();
    functions::sign_init(&mut session, &Mechanism::new(CKM_ECDSA_SHA256), ec_key(), CKK_EC)
        .expect("init");
    assert_eq!(functions::sign_size(&mut session).ok(), Some(64));
    assert!(session.is_active(OperationClass::Sign));
}

#[cfg(feature = "soft-verify")]
#[test]
fn test_software_verification_detects_tampering() {
    let mut session = common::session();
    let key = ec_key();
    let message = b"verify me";
    let signature = sign(&mut session, CKM_ECDSA_SHA256, key.clone(), CKK_EC, &[message]);

    let mechanism = Mechanism::new(CKM_ECDSA_SHA256);
    functions::verify_init(&mut session, &mechanism, key.clone(), CKK_EC).expect("verify init");
    functions::verify_update(&mut session, message).expect("verify update");
    functions::verify_final(&mut session, &signature).expect("signature verifies");
    assert!(!session.is_active(OperationClass::Verify));

    functions::verify_init(&mut session, &mechanism, key, CKK_EC).expect("verify init");
    functions::verify_update(&mut session, b"verify m3").expect("verify update");
    assert!(matches!(
        functions::verify_final(&mut session, &signature),
        Err(Error::SignatureInvalid)
    ));
    assert!(!session.is_active(OperationClass::Verify));
}

#[cfg(feature = "soft-verify")]
#[test]
fn test_rsa_composite_verifies_in_software() {
    let mut session = common::session();
    let key = Arc::new(SoftKey::new(KeyMaterial::generate_rsa(1024).expect("rsa")).expect("key"));
    let signature = sign(&mut session, CKM_SHA256_RSA_PKCS, key.clone(), CKK_RSA, &[b"data"]);

    functions::verify_init(&mut session, &Mechanism::new(CKM_SHA256_RSA_PKCS), key, CKK_RSA)
        .expect("verify init");
    functions::verify_update(&mut session, b"da").expect("update");
    functions::verify_update(&mut session, b"ta").expect("update");
    functions::verify_final(&mut session, &signature).expect("valid");
}

#[test]
fn test_raw_accumulation_ignores_chunking() {
    let mut session = common::session();
    let key = Arc::new(RecordingKey::default());
    let data = b"0123456789abcdefghijklmnopqrstuvwxyz";
    sign(&mut session, CKM_RSA_PKCS, key.clone(), CKK_RSA, &[data]);
    sign(
        &mut session,
        CKM_RSA_PKCS,
        key.clone(),
        CKK_RSA,
        &[&data[..1], &data[1..20], b"", &data[20..]],
    );
    let signed = key.signed.lock();
    assert_eq!(signed.len(), 2);
    assert_eq!(signed[0], signed[1]);
    assert_eq!(signed[0], data.to_vec());
}
