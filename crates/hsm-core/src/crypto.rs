use ::rand::rngs::OsRng;
use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::{
    BlockDecryptMut, BlockEncryptMut, KeyIvInit,
    block_padding::{Padding, Pkcs7},
    consts::U16,
    generic_array::GenericArray,
};
use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use pkcs8::EncodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, traits::PublicKeyParts};
use std::fmt;
use zeroize::Zeroizing;

use crate::{
    digest::DigestAlgorithm,
    error::{HsmError, HsmResult},
    verify::{SignatureScheme, pkcs1v15_padding},
};

pub const AES_BLOCK_LEN: usize = 16;

/// Private key material held by a software token.
pub enum KeyMaterial {
    Rsa(RsaPrivateKey),
    P256(p256::SecretKey),
    P384(p384::SecretKey),
    Secret(Zeroizing<Vec<u8>>),
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyMaterial::Rsa(_) => write!(f, "KeyMaterial::Rsa({} bits)", self.key_bits()),
            KeyMaterial::P256(_) => f.write_str("KeyMaterial::P256"),
            KeyMaterial::P384(_) => f.write_str("KeyMaterial::P384"),
            KeyMaterial::Secret(value) => write!(f, "KeyMaterial::Secret({} bytes)", value.len()),
        }
    }
}

impl KeyMaterial {
    pub fn generate_rsa(bits: usize) -> HsmResult<Self> {
        RsaPrivateKey::new(&mut OsRng, bits)
            .map(KeyMaterial::Rsa)
            .map_err(HsmError::crypto)
    }

    pub fn generate_p256() -> Self {
        KeyMaterial::P256(p256::SecretKey::random(&mut OsRng))
    }

    pub fn generate_p384() -> Self {
        KeyMaterial::P384(p384::SecretKey::random(&mut OsRng))
    }

    pub fn secret(value: &[u8]) -> Self {
        KeyMaterial::Secret(Zeroizing::new(value.to_vec()))
    }

    /// Modulus length for RSA, field size for EC, value length for secrets.
    pub fn key_bits(&self) -> usize {
        match self {
            KeyMaterial::Rsa(key) => key.size() * 8,
            KeyMaterial::P256(_) => 256,
            KeyMaterial::P384(_) => 384,
            KeyMaterial::Secret(value) => value.len() * 8,
        }
    }

    pub fn signature_len(&self) -> HsmResult<usize> {
        match self {
            KeyMaterial::Rsa(key) => Ok(key.size()),
            KeyMaterial::P256(_) => Ok(64),
            KeyMaterial::P384(_) => Ok(96),
            KeyMaterial::Secret(_) => Err(HsmError::unsupported("signing with a secret key")),
        }
    }

    /// DER encoded SubjectPublicKeyInfo.
    pub fn public_key_der(&self) -> HsmResult<Vec<u8>> {
        let document = match self {
            KeyMaterial::Rsa(key) => key.to_public_key().to_public_key_der(),
            KeyMaterial::P256(key) => key.public_key().to_public_key_der(),
            KeyMaterial::P384(key) => key.public_key().to_public_key_der(),
            KeyMaterial::Secret(_) => {
                return Err(HsmError::invalid("secret keys have no public component"));
            }
        }
        .map_err(HsmError::crypto)?;
        Ok(document.as_bytes().to_vec())
    }

    /// Uncompressed SEC1 point of an EC key.
    pub fn public_point(&self) -> HsmResult<Vec<u8>> {
        match self {
            KeyMaterial::P256(key) => Ok(key.public_key().to_encoded_point(false).as_bytes().to_vec()),
            KeyMaterial::P384(key) => Ok(key.public_key().to_encoded_point(false).as_bytes().to_vec()),
            _ => Err(HsmError::invalid("not an elliptic curve key")),
        }
    }

    /// Runs the raw signature primitive. For ECDSA `message` must already be
    /// a hash; for RSA `prehash` selects the DigestInfo prefix.
    pub fn sign(
        &self,
        scheme: SignatureScheme,
        prehash: Option<DigestAlgorithm>,
        message: &[u8],
    ) -> HsmResult<Vec<u8>> {
        match (scheme, self) {
            (SignatureScheme::RsaPkcs1v15, KeyMaterial::Rsa(key)) => key
                .sign(pkcs1v15_padding(prehash), message)
                .map_err(HsmError::crypto),
            (SignatureScheme::Ecdsa, KeyMaterial::P256(key)) => {
                let signing = p256::ecdsa::SigningKey::from(key);
                let signature: p256::ecdsa::Signature =
                    signing.sign_prehash(message).map_err(HsmError::crypto)?;
                Ok(signature.to_bytes().to_vec())
            }
            (SignatureScheme::Ecdsa, KeyMaterial::P384(key)) => {
                let signing = p384::ecdsa::SigningKey::from(key);
                let signature: p384::ecdsa::Signature =
                    signing.sign_prehash(message).map_err(HsmError::crypto)?;
                Ok(signature.to_bytes().to_vec())
            }
            (scheme, material) => Err(HsmError::unsupported(format!(
                "{scheme:?} signature with {material:?}"
            ))),
        }
    }

    pub fn rsa_encrypt(&self, plaintext: &[u8]) -> HsmResult<Vec<u8>> {
        match self {
            KeyMaterial::Rsa(key) => key
                .to_public_key()
                .encrypt(&mut OsRng, Pkcs1v15Encrypt, plaintext)
                .map_err(HsmError::crypto),
            other => Err(HsmError::unsupported(format!("RSA encryption with {other:?}"))),
        }
    }

    pub fn rsa_decrypt(&self, ciphertext: &[u8]) -> HsmResult<Zeroizing<Vec<u8>>> {
        match self {
            KeyMaterial::Rsa(key) => key
                .decrypt(Pkcs1v15Encrypt, ciphertext)
                .map(Zeroizing::new)
                .map_err(HsmError::crypto),
            other => Err(HsmError::unsupported(format!("RSA decryption with {other:?}"))),
        }
    }

    pub fn ecdh_len(&self) -> HsmResult<usize> {
        match self {
            KeyMaterial::P256(_) => Ok(32),
            KeyMaterial::P384(_) => Ok(48),
            other => Err(HsmError::unsupported(format!("ECDH with {other:?}"))),
        }
    }

    /// ECDH shared secret (affine x-coordinate) with a SEC1 encoded peer point.
    pub fn ecdh(&self, peer_point: &[u8]) -> HsmResult<Zeroizing<Vec<u8>>> {
        match self {
            KeyMaterial::P256(key) => {
                let peer = p256::PublicKey::from_sec1_bytes(peer_point).map_err(HsmError::invalid)?;
                let shared = p256::ecdh::diffie_hellman(key.to_nonzero_scalar(), peer.as_affine());
                Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
            }
            KeyMaterial::P384(key) => {
                let peer = p384::PublicKey::from_sec1_bytes(peer_point).map_err(HsmError::invalid)?;
                let shared = p384::ecdh::diffie_hellman(key.to_nonzero_scalar(), peer.as_affine());
                Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
            }
            other => Err(HsmError::unsupported(format!("ECDH with {other:?}"))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherDirection {
    Encrypt,
    Decrypt,
}

type Block = GenericArray<u8, U16>;

/// `cbc` mode context for each AES key size and direction.
#[derive(Clone)]
enum CbcMode {
    Encrypt128(cbc::Encryptor<Aes128>),
    Encrypt192(cbc::Encryptor<Aes192>),
    Encrypt256(cbc::Encryptor<Aes256>),
    Decrypt128(cbc::Decryptor<Aes128>),
    Decrypt192(cbc::Decryptor<Aes192>),
    Decrypt256(cbc::Decryptor<Aes256>),
}

impl CbcMode {
    fn new(direction: CipherDirection, key: &[u8], iv: &[u8]) -> HsmResult<Self> {
        use CipherDirection::{Decrypt, Encrypt};
        match (direction, key.len()) {
            (Encrypt, 16) => cbc::Encryptor::new_from_slices(key, iv).map(Self::Encrypt128),
            (Encrypt, 24) => cbc::Encryptor::new_from_slices(key, iv).map(Self::Encrypt192),
            (Encrypt, 32) => cbc::Encryptor::new_from_slices(key, iv).map(Self::Encrypt256),
            (Decrypt, 16) => cbc::Decryptor::new_from_slices(key, iv).map(Self::Decrypt128),
            (Decrypt, 24) => cbc::Decryptor::new_from_slices(key, iv).map(Self::Decrypt192),
            (Decrypt, 32) => cbc::Decryptor::new_from_slices(key, iv).map(Self::Decrypt256),
            (_, other) => return Err(HsmError::key_material(format!("AES key of {other} bytes"))),
        }
        .map_err(HsmError::crypto)
    }

    fn process(&mut self, block: &mut Block) {
        match self {
            Self::Encrypt128(mode) => mode.encrypt_block_mut(block),
            Self::Encrypt192(mode) => mode.encrypt_block_mut(block),
            Self::Encrypt256(mode) => mode.encrypt_block_mut(block),
            Self::Decrypt128(mode) => mode.decrypt_block_mut(block),
            Self::Decrypt192(mode) => mode.decrypt_block_mut(block),
            Self::Decrypt256(mode) => mode.decrypt_block_mut(block),
        }
    }
}

/// Streaming AES-CBC with PKCS#7 padding.
///
/// `update` only ever emits whole blocks and keeps the partial block carry.
/// When decrypting the last complete block is held back because it may carry
/// the padding; [`CbcPadCipher::peek_final`] releases it. Length helpers never
/// touch the running state.
pub struct CbcPadCipher {
    mode: CbcMode,
    direction: CipherDirection,
    pending: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for CbcPadCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CbcPadCipher")
            .field("direction", &self.direction)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl CbcPadCipher {
    pub fn new(direction: CipherDirection, key: &[u8], iv: &[u8]) -> HsmResult<Self> {
        if iv.len() != AES_BLOCK_LEN {
            return Err(HsmError::invalid(format!("CBC IV of {} bytes", iv.len())));
        }
        Ok(Self {
            mode: CbcMode::new(direction, key, iv)?,
            direction,
            pending: Zeroizing::new(Vec::with_capacity(2 * AES_BLOCK_LEN)),
        })
    }

    /// Input bytes accepted but not yet emitted.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Bytes `update` would emit for `input_len` more bytes of input.
    pub fn update_len(&self, input_len: usize) -> usize {
        let total = self.pending.len() + input_len;
        match self.direction {
            CipherDirection::Encrypt => total / AES_BLOCK_LEN * AES_BLOCK_LEN,
            CipherDirection::Decrypt if total == 0 => 0,
            CipherDirection::Decrypt => (total - 1) / AES_BLOCK_LEN * AES_BLOCK_LEN,
        }
    }

    pub fn update(&mut self, input: &[u8], out: &mut [u8]) -> HsmResult<usize> {
        let produced = self.update_len(input.len());
        if out.len() < produced {
            return Err(HsmError::invalid(format!("output needs {produced} bytes")));
        }
        self.pending.extend_from_slice(input);
        for (chunk, dst) in self.pending[..produced]
            .chunks_exact(AES_BLOCK_LEN)
            .zip(out.chunks_exact_mut(AES_BLOCK_LEN))
        {
            dst.copy_from_slice(chunk);
            self.mode.process(GenericArray::from_mut_slice(dst));
        }
        self.pending.drain(..produced);
        Ok(produced)
    }

    /// Output of the final block, computed on a copy of the mode state.
    pub fn peek_final(&self) -> HsmResult<Zeroizing<Vec<u8>>> {
        let mut mode = self.mode.clone();
        let mut block = Zeroizing::new([0u8; AES_BLOCK_LEN]);
        match self.direction {
            CipherDirection::Encrypt => {
                let pos = self.pending.len();
                block[..pos].copy_from_slice(&self.pending);
                let padded = GenericArray::from_mut_slice(&mut block[..]);
                <Pkcs7 as Padding<U16>>::pad(padded, pos);
                mode.process(padded);
                Ok(Zeroizing::new(padded.to_vec()))
            }
            CipherDirection::Decrypt => {
                if self.pending.len() != AES_BLOCK_LEN {
                    return Err(HsmError::invalid(format!(
                        "ciphertext is not block aligned ({} trailing bytes)",
                        self.pending.len()
                    )));
                }
                block.copy_from_slice(&self.pending);
                let plain = GenericArray::from_mut_slice(&mut block[..]);
                mode.process(plain);
                <Pkcs7 as Padding<U16>>::unpad(plain)
                    .map(|plain| Zeroizing::new(plain.to_vec()))
                    .map_err(|_| HsmError::crypto("invalid CBC padding"))
            }
        }
    }
}
