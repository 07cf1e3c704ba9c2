//! FerroHSM software crypto provider. Supplies the message digests, software
//! signature verification and key primitives that the PKCS#11 mechanism layer
//! composes with (or substitutes for) secure-element operations.

pub mod crypto;
pub mod digest;
pub mod error;
pub mod verify;

pub use crypto::{AES_BLOCK_LEN, CbcPadCipher, CipherDirection, KeyMaterial};
pub use digest::{DigestAlgorithm, DigestContext, MAX_DIGEST_LEN};
pub use error::{HsmError, HsmResult};
pub use verify::{PublicKeyData, SignatureScheme, verify_signature};
