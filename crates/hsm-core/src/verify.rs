//! Software signature verification for tokens that cannot verify on-card.
//!
//! Public keys arrive as DER `SubjectPublicKeyInfo` blobs read from the key
//! object. The message handed to [`verify_signature`] is whatever the signer
//! fed to its raw primitive: the digest for hash-composite mechanisms, the
//! caller's data otherwise.

use p256::ecdsa::signature::hazmat::PrehashVerifier;
use pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha1::Sha1;
use sha2::{Sha224, Sha256, Sha384, Sha512};

use crate::{
    digest::DigestAlgorithm,
    error::{HsmError, HsmResult},
};

/// Signature primitive family.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignatureScheme {
    /// RSASSA-PKCS1-v1_5. With a prehash the message is wrapped in a
    /// DigestInfo, without one it is signed as given.
    RsaPkcs1v15,
    /// ECDSA over a caller supplied hash, raw `r || s` signature encoding.
    Ecdsa,
    /// GOST R 34.10.
    Gost,
}

/// Public key material as exposed by a key object.
#[derive(Clone, Copy, Debug)]
pub enum PublicKeyData<'a> {
    Spki(&'a [u8]),
    Gost { value: &'a [u8], params: &'a [u8] },
}

/// Checks `signature` over `message`. `Ok(false)` means the signature did not
/// verify; errors are reserved for unusable keys and unsupported algorithms.
pub fn verify_signature(
    key: &PublicKeyData<'_>,
    scheme: SignatureScheme,
    prehash: Option<DigestAlgorithm>,
    message: &[u8],
    signature: &[u8],
) -> HsmResult<bool> {
    match (scheme, key) {
        (SignatureScheme::Gost, _) | (_, PublicKeyData::Gost { .. }) => {
            Err(HsmError::unsupported("GOST R 34.10 verification"))
        }
        (SignatureScheme::RsaPkcs1v15, PublicKeyData::Spki(der)) => {
            let public_key = RsaPublicKey::from_public_key_der(der).map_err(HsmError::key_material)?;
            Ok(public_key
                .verify(pkcs1v15_padding(prehash), message, signature)
                .is_ok())
        }
        (SignatureScheme::Ecdsa, PublicKeyData::Spki(der)) => verify_ecdsa(der, message, signature),
    }
}

pub(crate) fn pkcs1v15_padding(prehash: Option<DigestAlgorithm>) -> Pkcs1v15Sign {
    match prehash {
        None => Pkcs1v15Sign::new_unprefixed(),
        Some(DigestAlgorithm::Sha1) => Pkcs1v15Sign::new::<Sha1>(),
        Some(DigestAlgorithm::Sha224) => Pkcs1v15Sign::new::<Sha224>(),
        Some(DigestAlgorithm::Sha256) => Pkcs1v15Sign::new::<Sha256>(),
        Some(DigestAlgorithm::Sha384) => Pkcs1v15Sign::new::<Sha384>(),
        Some(DigestAlgorithm::Sha512) => Pkcs1v15Sign::new::<Sha512>(),
    }
}

fn verify_ecdsa(der: &[u8], prehash: &[u8], signature: &[u8]) -> HsmResult<bool> {
    if let Ok(public_key) = p256::ecdsa::VerifyingKey::from_public_key_der(der) {
        let Ok(signature) = p256::ecdsa::Signature::from_slice(signature) else {
            return Ok(false);
        };
        return Ok(public_key.verify_prehash(prehash, &signature).is_ok());
    }
    if let Ok(public_key) = p384::ecdsa::VerifyingKey::from_public_key_der(der) {
        let Ok(signature) = p384::ecdsa::Signature::from_slice(signature) else {
            return Ok(false);
        };
        return Ok(public_key.verify_prehash(prehash, &signature).is_ok());
    }
    Err(HsmError::unsupported("elliptic curve public key"))
}
