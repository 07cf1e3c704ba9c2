//! Card initialisation: turns the element's advertised capabilities and the
//! token configuration into a published mechanism table.

use cryptoki_sys::{CK_KEY_TYPE, CK_MECHANISM_TYPE, CKF_DIGEST, CKF_SIGN};
use hsm_core::DigestAlgorithm;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    digest::new_digest_mechanism,
    error::Result,
    mechanism::{HASH_SIGN_MECHANISMS, MechanismInfo, new_mechanism},
    registry::Mechanisms,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Software digests registered on every card.
    pub digests: Vec<DigestAlgorithm>,
    /// Whether to assemble hash+sign mechanisms the element lacks.
    pub hash_sign_composites: bool,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            digests: DigestAlgorithm::ALL.to_vec(),
            hash_sign_composites: true,
        }
    }
}

impl TokenConfig {
    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        serde_json::from_str(data)
    }
}

/// One capability row reported by the secure element.
#[derive(Debug, Clone, Copy)]
pub struct AdvertisedMechanism {
    pub mechanism: CK_MECHANISM_TYPE,
    pub info: MechanismInfo,
    pub key_type: Option<CK_KEY_TYPE>,
}

impl AdvertisedMechanism {
    pub fn new(mechanism: CK_MECHANISM_TYPE, info: MechanismInfo, key_type: CK_KEY_TYPE) -> Self {
        Self {
            mechanism,
            info,
            key_type: Some(key_type),
        }
    }
}

/// Builds the mechanism table for a card.
pub fn build_mechanisms(
    config: &TokenConfig,
    advertised: &[AdvertisedMechanism],
) -> Result<Arc<Mechanisms>> {
    let mut mechanisms = Mechanisms::new();

    for algorithm in &config.digests {
        mechanisms.register(&new_digest_mechanism(*algorithm))?;
    }

    for row in advertised {
        let mt = new_mechanism(row.mechanism, row.info, row.key_type, None);
        mechanisms.register(&mt).inspect_err(|err| {
            warn!("failed to register mechanism {:#x}: {err}", row.mechanism);
        })?;
    }

    if config.hash_sign_composites {
        for (composite, raw, hash) in HASH_SIGN_MECHANISMS {
            if mechanisms.find(composite, CKF_SIGN).is_some() {
                debug!("mechanism {composite:#x} is advertised by the element");
                continue;
            }
            if mechanisms.find(raw, CKF_SIGN).is_none() || mechanisms.find(hash, CKF_DIGEST).is_none()
            {
                continue;
            }
            mechanisms.register_sign_and_hash(composite, hash, raw)?;
            debug!("composed mechanism {composite:#x} from {hash:#x} and {raw:#x}");
        }
    }

    info!("mechanism table ready with {} entries", mechanisms.len());
    Ok(Arc::new(mechanisms))
}
