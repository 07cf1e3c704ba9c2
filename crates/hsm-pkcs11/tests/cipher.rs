//! AES-CBC-PAD through the session-level cipher functions.

mod common;

use cryptoki_sys::{CKK_AES, CKK_EC, CKM_AES_CBC_PAD};
use hsm_core::{CbcPadCipher, CipherDirection};
use hsm_pkcs11::{Error, Mechanism, OperationClass, SessionState, SoftKey, functions};
use std::sync::Arc;

const KEY: [u8; 32] = [0x42; 32];
const IV: [u8; 16] = [0x24; 16];

fn aes_key() -> Arc<SoftKey> {
    Arc::new(SoftKey::secret(CKK_AES, &KEY))
}

/// Ciphertext from a fresh context, outside any session.
fn reference_ciphertext(data: &[u8]) -> Vec<u8> {
    let mut cipher = CbcPadCipher::new(CipherDirection::Encrypt, &KEY, &IV).expect("cipher");
    let mut out = vec![0u8; cipher.update_len(data.len())];
    let len = cipher.update(data, &mut out).expect("update");
    out.truncate(len);
    out.extend_from_slice(&cipher.peek_final().expect("final block"));
    out
}

fn encrypt_once(session: &mut SessionState, key: Arc<SoftKey>, data: &[u8]) -> Vec<u8> {
    let mechanism = Mechanism::with_parameter(CKM_AES_CBC_PAD, &IV);
    functions::encrypt_init(session, &mechanism, key, CKK_AES).expect("encrypt init");
    let len = functions::encrypt(session, data, None).expect("length query");
    assert!(session.is_active(OperationClass::Encrypt));
    let mut out = vec![0u8; len];
    let len = functions::encrypt(session, data, Some(&mut out)).expect("encrypt");
    out.truncate(len);
    out
}

#[test]
fn test_single_part_matches_multi_part() {
    let mut session = common::session();
    let key = aes_key();
    let data = b"forty-one bytes of plaintext for the test";

    let once = encrypt_once(&mut session, key.clone(), data);
    assert_eq!(once.len(), 48);
    assert!(!session.is_active(OperationClass::Encrypt));

    let mechanism = Mechanism::with_parameter(CKM_AES_CBC_PAD, &IV);
    functions::encrypt_init(&mut session, &mechanism, key, CKK_AES).expect("init");
    let mut streamed = Vec::new();
    for chunk in data.chunks(7) {
        let mut out = [0u8; 32];
        let len = functions::encrypt_update(&mut session, chunk, Some(&mut out)).expect("update");
        streamed.extend_from_slice(&out[..len]);
    }
    let mut last = [0u8; 16];
    let len = functions::encrypt_final(&mut session, Some(&mut last)).expect("final");
    streamed.extend_from_slice(&last[..len]);

    assert_eq!(streamed, once);
    assert!(!session.is_active(OperationClass::Encrypt));
}

#[test]
fn test_decrypt_round_trip_with_length_queries() {
    let mut session = common::session();
    let key = aes_key();
    let data = b"exactly thirty-two bytes long!!!";
    let ciphertext = encrypt_once(&mut session, key.clone(), data);
    assert_eq!(ciphertext.len(), 48);

    let mechanism = Mechanism::with_parameter(CKM_AES_CBC_PAD, &IV);
    functions::decrypt_init(&mut session, &mechanism, key, CKK_AES).expect("init");
    let mut out = [0u8; 48];
    let head = functions::decrypt_update(&mut session, &ciphertext, Some(&mut out)).expect("update");
    // The last block is held back until the padding can be checked.
    assert_eq!(head, 32);
    assert_eq!(functions::decrypt_final(&mut session, None).ok(), Some(0));
    assert!(session.is_active(OperationClass::Decrypt));

    let len = functions::decrypt_final(&mut session, Some(&mut out[head..])).expect("final");
    assert_eq!(&out[..head + len], data);
    assert!(!session.is_active(OperationClass::Decrypt));
}

#[test]
fn test_short_update_buffer_is_retryable() {
    let mut session = common::session();
    let mechanism = Mechanism::with_parameter(CKM_AES_CBC_PAD, &IV);
    functions::encrypt_init(&mut session, &mechanism, aes_key(), CKK_AES).expect("init");

    let mut short = [0u8; 8];
    assert!(matches!(
        functions::encrypt_update(&mut session, &[0u8; 20], Some(&mut short)),
        Err(Error::BufferTooSmall(16))
    ));
    assert!(session.is_active(OperationClass::Encrypt));

    let mut out = [0u8; 16];
    assert_eq!(
        functions::encrypt_update(&mut session, &[0u8; 20], Some(&mut out)).ok(),
        Some(16)
    );
}

#[test]
fn test_bad_iv_fails_init_and_frees_slot() {
    let mut session = common::session();
    let mechanism = Mechanism::with_parameter(CKM_AES_CBC_PAD, &IV[..4]);
    assert!(matches!(
        functions::encrypt_init(&mut session, &mechanism, aes_key(), CKK_AES),
        Err(Error::MechanismParamInvalid)
    ));
    assert!(!session.is_active(OperationClass::Encrypt));
}

#[test]
fn test_truncated_ciphertext_terminates_decrypt() {
    let mut session = common::session();
    let mechanism = Mechanism::with_parameter(CKM_AES_CBC_PAD, &IV);
    functions::decrypt_init(&mut session, &mechanism, aes_key(), CKK_AES).expect("init");
    let mut out = [0u8; 32];
    functions::decrypt_update(&mut session, &[0u8; 10], Some(&mut out)).expect("update");
    assert!(matches!(
        functions::decrypt_final(&mut session, Some(&mut out)),
        Err(Error::EncryptedDataLenRange)
    ));
    assert!(!session.is_active(OperationClass::Decrypt));
}

#[test]
fn test_cipher_rejects_mechanism_without_capability() {
    let mut session = common::session();
    let mechanism = Mechanism::with_parameter(CKM_AES_CBC_PAD, &IV);
    assert!(matches!(
        functions::encrypt_init(&mut session, &mechanism, aes_key(), CKK_EC),
        Err(Error::KeyTypeInconsistent)
    ));
    assert!(matches!(
        functions::encrypt(&mut session, b"data", None),
        Err(Error::OperationNotInitialized)
    ));
}

#[test]
fn test_session_without_token() {
    let mut session = SessionState::without_token(3);
    let mechanism = Mechanism::with_parameter(CKM_AES_CBC_PAD, &IV);
    assert!(matches!(
        functions::encrypt_init(&mut session, &mechanism, aes_key(), CKK_AES),
        Err(Error::ArgumentsInvalid)
    ));
}

#[test]
fn test_single_part_retry_after_short_buffer() {
    let mut session = common::session();
    let data = [0x11u8; 20];
    let mechanism = Mechanism::with_parameter(CKM_AES_CBC_PAD, &IV);
    functions::encrypt_init(&mut session, &mechanism, aes_key(), CKK_AES).expect("init");

    let mut short = [0u8; 16];
    assert!(matches!(
        functions::encrypt(&mut session, &data, Some(&mut short)),
        Err(Error::BufferTooSmall(32))
    ));
    assert!(session.is_active(OperationClass::Encrypt));

    let mut out = [0u8; 32];
    assert_eq!(functions::encrypt(&mut session, &data, Some(&mut out)).ok(), Some(32));
    assert_eq!(out.to_vec(), reference_ciphertext(&data));
    assert!(!session.is_active(OperationClass::Encrypt));
}

#[test]
fn test_single_part_decrypt_retry_after_short_buffer() {
    let mut session = common::session();
    let data = b"twenty bytes of text";
    let ciphertext = reference_ciphertext(data);
    let mechanism = Mechanism::with_parameter(CKM_AES_CBC_PAD, &IV);
    functions::decrypt_init(&mut session, &mechanism, aes_key(), CKK_AES).expect("init");

    // One held back block plus the padded upper bound of the last one.
    assert_eq!(functions::decrypt(&mut session, &ciphertext, None).ok(), Some(31));
    let mut short = [0u8; 20];
    assert!(matches!(
        functions::decrypt(&mut session, &ciphertext, Some(&mut short)),
        Err(Error::BufferTooSmall(31))
    ));
    assert!(session.is_active(OperationClass::Decrypt));

    let mut out = [0u8; 31];
    let len = functions::decrypt(&mut session, &ciphertext, Some(&mut out)).expect("decrypt");
    assert_eq!(&out[..len], data);
    assert!(!session.is_active(OperationClass::Decrypt));
}

#[test]
fn test_short_encrypt_final_retries() {
    let mut session = common::session();
    let data = [0x5au8; 20];
    let mechanism = Mechanism::with_parameter(CKM_AES_CBC_PAD, &IV);
    functions::encrypt_init(&mut session, &mechanism, aes_key(), CKK_AES).expect("init");
    let mut out = [0u8; 32];
    let head = functions::encrypt_update(&mut session, &data, Some(&mut out)).expect("update");
    assert_eq!(head, 16);

    let mut short = [0u8; 8];
    assert!(matches!(
        functions::encrypt_final(&mut session, Some(&mut short)),
        Err(Error::BufferTooSmall(16))
    ));
    assert!(session.is_active(OperationClass::Encrypt));

    let len = functions::encrypt_final(&mut session, Some(&mut out[head..])).expect("final");
    assert_eq!(out[..head + len].to_vec(), reference_ciphertext(&data));
    assert!(!session.is_active(OperationClass::Encrypt));
}

#[test]
fn test_short_decrypt_final_retries() {
    let mut session = common::session();
    let data = b"twenty bytes of text";
    let ciphertext = reference_ciphertext(data);
    let mechanism = Mechanism::with_parameter(CKM_AES_CBC_PAD, &IV);
    functions::decrypt_init(&mut session, &mechanism, aes_key(), CKK_AES).expect("init");
    let mut out = [0u8; 32];
    let head = functions::decrypt_update(&mut session, &ciphertext, Some(&mut out)).expect("update");
    assert_eq!(head, 16);
    assert_eq!(functions::decrypt_final(&mut session, None).ok(), Some(4));

    let mut short = [0u8; 2];
    assert!(matches!(
        functions::decrypt_final(&mut session, Some(&mut short)),
        Err(Error::BufferTooSmall(4))
    ));
    assert!(session.is_active(OperationClass::Decrypt));

    let len = functions::decrypt_final(&mut session, Some(&mut out[head..])).expect("final");
    assert_eq!(&out[..head + len], data);
    assert!(!session.is_active(OperationClass::Decrypt));
}

#[test]
fn test_sessions_sharing_a_key_stream_independently() {
    let key = aes_key();
    let mechanism = Mechanism::with_parameter(CKM_AES_CBC_PAD, &IV);
    let mut first = common::session();
    let mut second = SessionState::new(2, common::mechanisms());
    let data = [0x33u8; 32];

    functions::encrypt_init(&mut first, &mechanism, key.clone(), CKK_AES).expect("init");
    let mut streamed = [0u8; 48];
    let mut len = functions::encrypt_update(&mut first, &data[..16], Some(&mut streamed))
        .expect("first block");

    functions::encrypt_init(&mut second, &mechanism, key.clone(), CKK_AES).expect("init");
    let mut other = [0u8; 32];
    functions::encrypt_update(&mut second, &[0x77; 16], Some(&mut other)).expect("other block");

    len += functions::encrypt_update(&mut first, &data[16..], Some(&mut streamed[len..]))
        .expect("second block");
    len += functions::encrypt_final(&mut first, Some(&mut streamed[len..])).expect("final");
    assert_eq!(streamed[..len].to_vec(), reference_ciphertext(&data));

    let tail = functions::encrypt_final(&mut second, Some(&mut other[16..])).expect("final");
    assert_eq!(other[..16 + tail].to_vec(), reference_ciphertext(&[0x77; 16]));
}
