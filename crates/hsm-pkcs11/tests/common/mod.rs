//! Shared fixtures: a card advertising a typical secure element profile.

#![allow(dead_code)]

use cryptoki_sys::{
    CKF_DECRYPT, CKF_DERIVE, CKF_ENCRYPT, CKF_SIGN, CKF_UNWRAP, CKF_VERIFY, CKF_WRAP, CKK_AES,
    CKK_EC, CKK_RSA, CKM_AES_CBC_PAD, CKM_ECDH1_DERIVE, CKM_ECDSA, CKM_RSA_PKCS,
};
use hsm_pkcs11::{
    AdvertisedMechanism, MechanismInfo, Mechanisms, SessionState, TokenConfig, build_mechanisms,
};
use std::sync::{Arc, Once};

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .try_init();
    });
}

pub fn advertised() -> Vec<AdvertisedMechanism> {
    vec![
        AdvertisedMechanism::new(
            CKM_RSA_PKCS,
            MechanismInfo::new(1024, 4096, CKF_SIGN | CKF_VERIFY | CKF_WRAP | CKF_UNWRAP),
            CKK_RSA,
        ),
        AdvertisedMechanism::new(
            CKM_ECDSA,
            MechanismInfo::new(256, 384, CKF_SIGN | CKF_VERIFY),
            CKK_EC,
        ),
        AdvertisedMechanism::new(CKM_ECDH1_DERIVE, MechanismInfo::new(256, 384, CKF_DERIVE), CKK_EC),
        AdvertisedMechanism::new(
            CKM_AES_CBC_PAD,
            MechanismInfo::new(128, 256, CKF_ENCRYPT | CKF_DECRYPT),
            CKK_AES,
        ),
    ]
}

pub fn mechanisms() -> Arc<Mechanisms> {
    init_tracing();
    build_mechanisms(&TokenConfig::default(), &advertised()).expect("mechanism table")
}

pub fn session() -> SessionState {
    SessionState::new(1, mechanisms())
}
