use thiserror::Error;

pub type HsmResult<T> = Result<T, HsmError>;

#[derive(Debug, Error)]
pub enum HsmError {
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
    #[error("invalid key material: {0}")]
    KeyMaterial(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl HsmError {
    pub fn crypto<E: std::fmt::Display>(err: E) -> Self {
        Self::Crypto(err.to_string())
    }
    pub fn unsupported<E: std::fmt::Display>(err: E) -> Self {
        Self::UnsupportedAlgorithm(err.to_string())
    }
    pub fn key_material<E: std::fmt::Display>(err: E) -> Self {
        Self::KeyMaterial(err.to_string())
    }
    pub fn invalid<E: std::fmt::Display>(err: E) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}
