//! Mechanism descriptors and the factory that wires their verb tables.
//!
//! A [`MechanismType`] describes one algorithm a card supports: its
//! identifier, the capability flags and key size bounds reported through
//! `C_GetMechanismInfo`, the key types it accepts and the generic engines
//! that implement each verb. Descriptors only expose the verbs their flags
//! allow; callers probe through [`MechanismType::sign_ops`] and friends
//! instead of assuming an entry point exists.

use cryptoki_sys::{
    CK_FLAGS, CK_KEY_TYPE, CK_MECHANISM_INFO, CK_MECHANISM_TYPE, CK_ULONG, CKF_DECRYPT,
    CKF_DERIVE, CKF_ENCRYPT, CKF_SIGN, CKF_UNWRAP, CKF_WRAP, CKM_ECDSA, CKM_ECDSA_SHA1,
    CKM_ECDSA_SHA224, CKM_ECDSA_SHA256, CKM_ECDSA_SHA384, CKM_ECDSA_SHA512, CKM_GOSTR3410,
    CKM_GOSTR3410_WITH_GOSTR3411, CKM_RSA_PKCS, CKM_SHA1_RSA_PKCS, CKM_SHA224, CKM_SHA224_RSA_PKCS,
    CKM_SHA256, CKM_SHA256_RSA_PKCS, CKM_SHA384, CKM_SHA384_RSA_PKCS, CKM_SHA512,
    CKM_SHA512_RSA_PKCS, CKM_SHA_1,
};
use hsm_core::{DigestAlgorithm, SignatureScheme};
use std::{any::Any, fmt, sync::Arc};

use crate::{
    cipher::{DECRYPTION, ENCRYPTION},
    error::{Error, Result},
    hardware::KeyObject,
    keymgmt::{DERIVATION, UNWRAPPING, WRAPPING},
    operation::Operation,
    signature::SIGNATURE,
};

#[cfg(feature = "soft-verify")]
use crate::signature::VERIFICATION;

/// Number of key types a single descriptor can accept.
pub const MAX_KEY_TYPES: usize = 2;

/// Hash-composite mechanisms the framework can assemble from a raw
/// signature mechanism and a software digest:
/// `(composite, raw signature mechanism, digest mechanism)`.
pub const HASH_SIGN_MECHANISMS: [(CK_MECHANISM_TYPE, CK_MECHANISM_TYPE, CK_MECHANISM_TYPE); 10] = [
    (CKM_SHA1_RSA_PKCS, CKM_RSA_PKCS, CKM_SHA_1),
    (CKM_SHA224_RSA_PKCS, CKM_RSA_PKCS, CKM_SHA224),
    (CKM_SHA256_RSA_PKCS, CKM_RSA_PKCS, CKM_SHA256),
    (CKM_SHA384_RSA_PKCS, CKM_RSA_PKCS, CKM_SHA384),
    (CKM_SHA512_RSA_PKCS, CKM_RSA_PKCS, CKM_SHA512),
    (CKM_ECDSA_SHA1, CKM_ECDSA, CKM_SHA_1),
    (CKM_ECDSA_SHA224, CKM_ECDSA, CKM_SHA224),
    (CKM_ECDSA_SHA256, CKM_ECDSA, CKM_SHA256),
    (CKM_ECDSA_SHA384, CKM_ECDSA, CKM_SHA384),
    (CKM_ECDSA_SHA512, CKM_ECDSA, CKM_SHA512),
];

/// Maps a digest mechanism onto the software hash implementing it.
pub fn digest_algorithm(mechanism: CK_MECHANISM_TYPE) -> Option<DigestAlgorithm> {
    match mechanism {
        CKM_SHA_1 => Some(DigestAlgorithm::Sha1),
        CKM_SHA224 => Some(DigestAlgorithm::Sha224),
        CKM_SHA256 => Some(DigestAlgorithm::Sha256),
        CKM_SHA384 => Some(DigestAlgorithm::Sha384),
        CKM_SHA512 => Some(DigestAlgorithm::Sha512),
        _ => None,
    }
}

pub fn digest_mechanism(algorithm: DigestAlgorithm) -> CK_MECHANISM_TYPE {
    match algorithm {
        DigestAlgorithm::Sha1 => CKM_SHA_1,
        DigestAlgorithm::Sha224 => CKM_SHA224,
        DigestAlgorithm::Sha256 => CKM_SHA256,
        DigestAlgorithm::Sha384 => CKM_SHA384,
        DigestAlgorithm::Sha512 => CKM_SHA512,
    }
}

/// Splits a hash-composite mechanism into its raw signature mechanism and hash.
pub fn hash_sign_parts(mechanism: CK_MECHANISM_TYPE) -> Option<(CK_MECHANISM_TYPE, DigestAlgorithm)> {
    HASH_SIGN_MECHANISMS
        .iter()
        .find(|(composite, _, _)| *composite == mechanism)
        .and_then(|(_, raw, hash)| Some((*raw, digest_algorithm(*hash)?)))
}

/// Signature primitive family used by a raw or composite mechanism.
pub fn signature_scheme(mechanism: CK_MECHANISM_TYPE) -> Option<SignatureScheme> {
    let raw = hash_sign_parts(mechanism).map_or(mechanism, |(raw, _)| raw);
    match raw {
        CKM_RSA_PKCS => Some(SignatureScheme::RsaPkcs1v15),
        CKM_ECDSA => Some(SignatureScheme::Ecdsa),
        CKM_GOSTR3410 | CKM_GOSTR3410_WITH_GOSTR3411 => Some(SignatureScheme::Gost),
        _ => None,
    }
}

/// Capability flags and key size bounds of a mechanism.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MechanismInfo {
    pub min_key_size: CK_ULONG,
    pub max_key_size: CK_ULONG,
    pub flags: CK_FLAGS,
}

impl MechanismInfo {
    pub fn new(min_key_size: CK_ULONG, max_key_size: CK_ULONG, flags: CK_FLAGS) -> Self {
        Self {
            min_key_size,
            max_key_size,
            flags,
        }
    }

    /// True when every flag in `flags` is advertised.
    pub fn supports(&self, flags: CK_FLAGS) -> bool {
        self.flags & flags == flags
    }

    fn widen(&mut self, other: &MechanismInfo) {
        if other.max_key_size > self.max_key_size {
            self.max_key_size = other.max_key_size;
        }
        if other.min_key_size < self.min_key_size {
            self.min_key_size = other.min_key_size;
        }
        self.flags |= other.flags;
    }
}

impl From<MechanismInfo> for CK_MECHANISM_INFO {
    fn from(info: MechanismInfo) -> Self {
        CK_MECHANISM_INFO {
            ulMinKeySize: info.min_key_size,
            ulMaxKeySize: info.max_key_size,
            flags: info.flags,
        }
    }
}

/// Fixed-capacity key type list; the first `None` terminates it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyTypes([Option<CK_KEY_TYPE>; MAX_KEY_TYPES]);

impl KeyTypes {
    pub fn single(key_type: Option<CK_KEY_TYPE>) -> Self {
        let mut slots = [None; MAX_KEY_TYPES];
        slots[0] = key_type;
        Self(slots)
    }

    pub fn iter(&self) -> impl Iterator<Item = CK_KEY_TYPE> + '_ {
        self.0.iter().map_while(|slot| *slot)
    }

    pub fn first(&self) -> Option<CK_KEY_TYPE> {
        self.0[0]
    }

    pub fn contains(&self, key_type: CK_KEY_TYPE) -> bool {
        self.iter().any(|candidate| candidate == key_type)
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.0[0].is_none()
    }

    /// Stores `key_type` in the first free slot. Returns false when full.
    fn insert(&mut self, key_type: CK_KEY_TYPE) -> bool {
        match self.0.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(key_type);
                true
            }
            None => false,
        }
    }
}

/// The caller's mechanism selection: identifier plus raw parameter bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mechanism<'a> {
    pub mechanism: CK_MECHANISM_TYPE,
    pub parameter: &'a [u8],
}

impl<'a> Mechanism<'a> {
    pub fn new(mechanism: CK_MECHANISM_TYPE) -> Self {
        Self {
            mechanism,
            parameter: &[],
        }
    }

    pub fn with_parameter(mechanism: CK_MECHANISM_TYPE, parameter: &'a [u8]) -> Self {
        Self {
            mechanism,
            parameter,
        }
    }
}

/// Per-mechanism extension payload owned by a descriptor.
pub trait MechanismData: fmt::Debug + Send + Sync {
    /// Deep copy used when the registry adopts a descriptor.
    fn try_clone(&self) -> Result<Box<dyn MechanismData>>;

    fn as_any(&self) -> &dyn Any;
}

/// Links a hash-composite mechanism to the digest and raw signature
/// mechanisms it is assembled from.
#[derive(Debug, Clone)]
pub struct HashSignInfo {
    pub mech: CK_MECHANISM_TYPE,
    pub hash_mech: CK_MECHANISM_TYPE,
    pub sign_mech: CK_MECHANISM_TYPE,
    /// Private copy of the digest descriptor used for software hashing.
    pub hash_type: Arc<MechanismType>,
}

impl MechanismData for HashSignInfo {
    fn try_clone(&self) -> Result<Box<dyn MechanismData>> {
        Ok(Box::new(self.clone()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub trait DigestOps: Send + Sync {
    fn init(&self, op: &mut Operation) -> Result<()>;
    fn update(&self, op: &mut Operation, data: &[u8]) -> Result<()>;
    fn finish(&self, op: &mut Operation, out: Option<&mut [u8]>) -> Result<usize>;
}

pub trait SignOps: Send + Sync {
    fn init(&self, op: &mut Operation, key: Arc<dyn KeyObject>) -> Result<()>;
    fn update(&self, op: &mut Operation, data: &[u8]) -> Result<()>;
    fn finish(&self, op: &mut Operation, out: Option<&mut [u8]>) -> Result<usize>;
    fn size(&self, op: &Operation) -> Result<usize>;
}

pub trait VerifyOps: Send + Sync {
    fn init(&self, op: &mut Operation, key: Arc<dyn KeyObject>) -> Result<()>;
    fn update(&self, op: &mut Operation, data: &[u8]) -> Result<()>;
    fn finish(&self, op: &mut Operation, signature: &[u8]) -> Result<()>;
}

/// Shared by the encrypt and decrypt verbs.
pub trait CipherOps: Send + Sync {
    fn init(&self, op: &mut Operation, key: Arc<dyn KeyObject>) -> Result<()>;
    /// Single-part operation: update followed by final.
    fn once(&self, op: &mut Operation, data: &[u8], out: Option<&mut [u8]>) -> Result<usize>;
    fn update(&self, op: &mut Operation, data: &[u8], out: Option<&mut [u8]>) -> Result<usize>;
    fn finish(&self, op: &mut Operation, out: Option<&mut [u8]>) -> Result<usize>;
}

pub trait WrapOps: Send + Sync {
    fn wrap(
        &self,
        op: &mut Operation,
        wrapping_key: &dyn KeyObject,
        target_key: &dyn KeyObject,
        out: Option<&mut [u8]>,
    ) -> Result<usize>;
}

pub trait UnwrapOps: Send + Sync {
    fn unwrap(
        &self,
        op: &mut Operation,
        unwrapping_key: &dyn KeyObject,
        wrapped: &[u8],
        target_key: &dyn KeyObject,
    ) -> Result<()>;
}

pub trait DeriveOps: Send + Sync {
    fn derive(
        &self,
        op: &mut Operation,
        base_key: &dyn KeyObject,
        params: &[u8],
        out: Option<&mut [u8]>,
    ) -> Result<usize>;
}

/// Verb table of a descriptor. Absent verbs are `None`.
#[derive(Clone, Copy, Default)]
pub struct MechanismOps {
    pub digest: Option<&'static dyn DigestOps>,
    pub sign: Option<&'static dyn SignOps>,
    pub verify: Option<&'static dyn VerifyOps>,
    pub encrypt: Option<&'static dyn CipherOps>,
    pub decrypt: Option<&'static dyn CipherOps>,
    pub wrap: Option<&'static dyn WrapOps>,
    pub unwrap: Option<&'static dyn UnwrapOps>,
    pub derive: Option<&'static dyn DeriveOps>,
}

impl fmt::Debug for MechanismOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verbs = [
            ("digest", self.digest.is_some()),
            ("sign", self.sign.is_some()),
            ("verify", self.verify.is_some()),
            ("encrypt", self.encrypt.is_some()),
            ("decrypt", self.decrypt.is_some()),
            ("wrap", self.wrap.is_some()),
            ("unwrap", self.unwrap.is_some()),
            ("derive", self.derive.is_some()),
        ];
        f.debug_list()
            .entries(verbs.iter().filter(|(_, present)| *present).map(|(name, _)| name))
            .finish()
    }
}

/// A registered mechanism.
#[derive(Debug)]
pub struct MechanismType {
    mech: CK_MECHANISM_TYPE,
    info: MechanismInfo,
    key_types: KeyTypes,
    data: Option<Box<dyn MechanismData>>,
    ops: MechanismOps,
}

impl MechanismType {
    pub fn new(
        mech: CK_MECHANISM_TYPE,
        info: MechanismInfo,
        key_type: Option<CK_KEY_TYPE>,
        data: Option<Box<dyn MechanismData>>,
        ops: MechanismOps,
    ) -> Self {
        Self {
            mech,
            info,
            key_types: KeyTypes::single(key_type),
            data,
            ops,
        }
    }

    pub fn mechanism(&self) -> CK_MECHANISM_TYPE {
        self.mech
    }

    pub fn info(&self) -> MechanismInfo {
        self.info
    }

    pub fn key_types(&self) -> &KeyTypes {
        &self.key_types
    }

    pub fn hash_sign_info(&self) -> Option<&HashSignInfo> {
        self.data.as_deref()?.as_any().downcast_ref()
    }

    pub fn digest_ops(&self) -> Result<&'static dyn DigestOps> {
        self.ops.digest.ok_or(Error::KeyTypeInconsistent)
    }

    pub fn sign_ops(&self) -> Result<&'static dyn SignOps> {
        self.ops.sign.ok_or(Error::KeyTypeInconsistent)
    }

    pub fn verify_ops(&self) -> Result<&'static dyn VerifyOps> {
        self.ops.verify.ok_or(Error::KeyTypeInconsistent)
    }

    pub fn encrypt_ops(&self) -> Result<&'static dyn CipherOps> {
        self.ops.encrypt.ok_or(Error::KeyTypeInconsistent)
    }

    pub fn decrypt_ops(&self) -> Result<&'static dyn CipherOps> {
        self.ops.decrypt.ok_or(Error::KeyTypeInconsistent)
    }

    pub fn wrap_ops(&self) -> Result<&'static dyn WrapOps> {
        self.ops.wrap.ok_or(Error::KeyTypeInconsistent)
    }

    pub fn unwrap_ops(&self) -> Result<&'static dyn UnwrapOps> {
        self.ops.unwrap.ok_or(Error::KeyTypeInconsistent)
    }

    pub fn derive_ops(&self) -> Result<&'static dyn DeriveOps> {
        self.ops.derive.ok_or(Error::KeyTypeInconsistent)
    }

    /// Deep copy, duplicating the extension payload through its own copy hook.
    pub fn try_copy(&self) -> Result<Self> {
        let data = match &self.data {
            Some(data) => Some(data.try_clone()?),
            None => None,
        };
        Ok(Self {
            mech: self.mech,
            info: self.info,
            key_types: self.key_types,
            data,
            ops: self.ops,
        })
    }

    /// Folds another advertisement of the same mechanism into this one.
    /// Leaves `self` untouched when the key type cannot be stored.
    pub(crate) fn merge(&mut self, other: &MechanismType) -> Result<()> {
        if let Some(key_type) = other.key_types.first() {
            if !self.key_types.contains(key_type) && !self.key_types.insert(key_type) {
                return Err(Error::TooManyKeyTypes(self.mech));
            }
        }
        self.info.widen(&other.info);
        Ok(())
    }
}

/// Builds a descriptor whose verbs follow the advertised capability flags.
pub fn new_mechanism(
    mech: CK_MECHANISM_TYPE,
    info: MechanismInfo,
    key_type: Option<CK_KEY_TYPE>,
    data: Option<Box<dyn MechanismData>>,
) -> MechanismType {
    let mut ops = MechanismOps::default();
    if info.flags & CKF_SIGN != 0 {
        ops.sign = Some(&SIGNATURE);
        #[cfg(feature = "soft-verify")]
        {
            ops.verify = Some(&VERIFICATION);
        }
    }
    if info.flags & CKF_WRAP != 0 {
        ops.wrap = Some(&WRAPPING);
    }
    if info.flags & CKF_UNWRAP != 0 {
        ops.unwrap = Some(&UNWRAPPING);
    }
    if info.flags & CKF_DERIVE != 0 {
        ops.derive = Some(&DERIVATION);
    }
    if info.flags & CKF_DECRYPT != 0 {
        ops.decrypt = Some(&DECRYPTION);
    }
    if info.flags & CKF_ENCRYPT != 0 {
        ops.encrypt = Some(&ENCRYPTION);
    }
    MechanismType::new(mech, info, key_type, data, ops)
}

/// Rejects keys whose type the mechanism was not registered for.
pub fn validate_key_type(mechanism: &MechanismType, key_type: CK_KEY_TYPE) -> Result<()> {
    if mechanism.key_types.contains(key_type) {
        Ok(())
    } else {
        Err(Error::KeyTypeInconsistent)
    }
}
