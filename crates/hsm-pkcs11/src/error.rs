//! Error type shared by the mechanism layer and its translation into
//! `CKR_*` return codes.

use cryptoki_sys::{
    CK_MECHANISM_TYPE, CK_RV, CKR_ARGUMENTS_BAD, CKR_ATTRIBUTE_TYPE_INVALID, CKR_BUFFER_TOO_SMALL,
    CKR_DATA_LEN_RANGE, CKR_ENCRYPTED_DATA_LEN_RANGE, CKR_FUNCTION_FAILED,
    CKR_FUNCTION_NOT_SUPPORTED, CKR_HOST_MEMORY, CKR_KEY_TYPE_INCONSISTENT,
    CKR_MECHANISM_INVALID, CKR_MECHANISM_PARAM_INVALID, CKR_OPERATION_ACTIVE,
    CKR_OPERATION_NOT_INITIALIZED, CKR_SIGNATURE_INVALID, CKR_TOKEN_NOT_PRESENT,
};
use hsm_core::HsmError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while dispatching mechanism operations, prior to
/// translation into CKR_* return codes.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid or inconsistent arguments")]
    ArgumentsInvalid,
    #[error("mechanism is not registered for the requested use")]
    MechanismInvalid,
    #[error("mechanism parameter rejected")]
    MechanismParamInvalid,
    #[error("key type not accepted by the mechanism")]
    KeyTypeInconsistent,
    #[error("out of host memory")]
    OutOfMemory,
    /// Retryable: the caller's output buffer must hold at least this many bytes.
    #[error("output buffer too small, {0} bytes required")]
    BufferTooSmall(usize),
    #[error("no free key type slot left on mechanism {0:#x}")]
    TooManyKeyTypes(CK_MECHANISM_TYPE),
    #[error("operation failed")]
    OperationFailed,
    #[error("function not supported")]
    FunctionNotSupported,
    #[error("an operation of this class is already active")]
    OperationActive,
    #[error("no active operation of this class")]
    OperationNotInitialized,
    #[error("signature is invalid")]
    SignatureInvalid,
    #[error("input length out of range")]
    DataLenRange,
    #[error("encrypted input length out of range")]
    EncryptedDataLenRange,
    #[error("attribute type not present on object")]
    AttributeTypeInvalid,
    #[error("no token present")]
    TokenNotPresent,
    /// Return code reported verbatim by the secure element.
    #[error("device returned {0:#x}")]
    Device(CK_RV),
    #[error(transparent)]
    Crypto(#[from] HsmError),
}

impl Error {
    pub fn ck_rv(&self) -> CK_RV {
        match self {
            Error::ArgumentsInvalid => CKR_ARGUMENTS_BAD,
            Error::MechanismInvalid => CKR_MECHANISM_INVALID,
            Error::MechanismParamInvalid => CKR_MECHANISM_PARAM_INVALID,
            Error::KeyTypeInconsistent => CKR_KEY_TYPE_INCONSISTENT,
            Error::OutOfMemory => CKR_HOST_MEMORY,
            Error::BufferTooSmall(_) | Error::TooManyKeyTypes(_) => CKR_BUFFER_TOO_SMALL,
            Error::OperationFailed => CKR_FUNCTION_FAILED,
            Error::FunctionNotSupported => CKR_FUNCTION_NOT_SUPPORTED,
            Error::OperationActive => CKR_OPERATION_ACTIVE,
            Error::OperationNotInitialized => CKR_OPERATION_NOT_INITIALIZED,
            Error::SignatureInvalid => CKR_SIGNATURE_INVALID,
            Error::DataLenRange => CKR_DATA_LEN_RANGE,
            Error::EncryptedDataLenRange => CKR_ENCRYPTED_DATA_LEN_RANGE,
            Error::AttributeTypeInvalid => CKR_ATTRIBUTE_TYPE_INVALID,
            Error::TokenNotPresent => CKR_TOKEN_NOT_PRESENT,
            Error::Device(rv) => *rv,
            Error::Crypto(HsmError::UnsupportedAlgorithm(_)) => CKR_MECHANISM_INVALID,
            Error::Crypto(_) => CKR_FUNCTION_FAILED,
        }
    }

    pub(crate) fn is_buffer_too_small(&self) -> bool {
        matches!(self, Error::BufferTooSmall(_))
    }
}

impl From<Error> for CK_RV {
    fn from(err: Error) -> CK_RV {
        err.ck_rv()
    }
}

/// Fails with [`Error::BufferTooSmall`] unless `out` can take `required` bytes.
pub(crate) fn check_capacity(out: &[u8], required: usize) -> Result<()> {
    if out.len() < required {
        return Err(Error::BufferTooSmall(required));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_errors_carry_required_length() {
        let err = check_capacity(&[0u8; 4], 16).expect_err("too small");
        assert!(matches!(err, Error::BufferTooSmall(16)));
        assert_eq!(CK_RV::from(err), CKR_BUFFER_TOO_SMALL);
        assert!(check_capacity(&[0u8; 16], 16).is_ok());
    }

    #[test]
    fn provider_errors_translate_by_kind() {
        let unsupported = Error::from(HsmError::unsupported("GOST"));
        assert_eq!(unsupported.ck_rv(), CKR_MECHANISM_INVALID);
        let failed = Error::from(HsmError::crypto("bad padding"));
        assert_eq!(failed.ck_rv(), CKR_FUNCTION_FAILED);
        assert_eq!(Error::Device(0x1234).ck_rv(), 0x1234);
    }
}
