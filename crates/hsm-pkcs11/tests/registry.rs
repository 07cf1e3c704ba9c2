//! Mechanism table assembly at card initialisation.

mod common;

use cryptoki_sys::{
    CK_MECHANISM_TYPE, CKF_DIGEST, CKF_SIGN, CKF_VERIFY, CKK_EC, CKK_RSA, CKM_ECDSA,
    CKM_ECDSA_SHA256, CKM_ECDSA_SHA384, CKM_RSA_PKCS, CKM_SHA1_RSA_PKCS, CKM_SHA256,
    CKM_SHA256_RSA_PKCS,
};
use hsm_core::DigestAlgorithm;
use hsm_pkcs11::{
    AdvertisedMechanism, Error, MechanismInfo, TokenConfig, build_mechanisms, functions,
};

#[test]
fn test_default_profile_publishes_digests_and_composites() {
    let mechanisms = common::mechanisms();
    for mechanism in [CKM_SHA256, CKM_ECDSA_SHA256, CKM_ECDSA_SHA384, CKM_SHA1_RSA_PKCS] {
        assert!(
            mechanisms.find(mechanism, 0).is_some(),
            "missing {mechanism:#x}"
        );
    }
    let composite = mechanisms.find(CKM_SHA256_RSA_PKCS, CKF_SIGN).expect("composite");
    assert_eq!(composite.info().flags, CKF_SIGN | CKF_VERIFY);
    assert_eq!(composite.info().min_key_size, 1024);
    assert!(composite.key_types().contains(CKK_RSA));
    assert!(mechanisms.find(CKM_SHA256, CKF_DIGEST).is_some());
    assert!(mechanisms.find(CKM_SHA256, CKF_SIGN).is_none());
    assert!(mechanisms.find(0x8000_0001, 0).is_none());
}

#[test]
fn test_element_composite_is_not_shadowed() {
    let mut advertised = common::advertised();
    advertised.push(AdvertisedMechanism::new(
        CKM_ECDSA_SHA256,
        MechanismInfo::new(256, 256, CKF_SIGN),
        CKK_EC,
    ));
    let mechanisms = build_mechanisms(&TokenConfig::default(), &advertised).expect("table");
    let entry = mechanisms.find(CKM_ECDSA_SHA256, CKF_SIGN).expect("entry");
    assert!(entry.hash_sign_info().is_none());
    assert_eq!(entry.info().max_key_size, 256);

    let count = mechanisms
        .iter()
        .filter(|mt| mt.mechanism() == CKM_ECDSA_SHA256)
        .count();
    assert_eq!(count, 1);
}

#[test]
fn test_rows_for_other_key_types_merge() {
    let advertised = [
        AdvertisedMechanism::new(CKM_ECDSA, MechanismInfo::new(256, 256, CKF_SIGN), CKK_EC),
        AdvertisedMechanism::new(CKM_ECDSA, MechanismInfo::new(384, 521, CKF_SIGN), CKK_RSA),
    ];
    let config = TokenConfig {
        digests: Vec::new(),
        hash_sign_composites: false,
    };
    let mechanisms = build_mechanisms(&config, &advertised).expect("table");
    assert_eq!(mechanisms.len(), 1);
    let entry = mechanisms.find(CKM_ECDSA, CKF_SIGN).expect("entry");
    assert_eq!(entry.info().min_key_size, 256);
    assert_eq!(entry.info().max_key_size, 521);
    assert!(entry.key_types().contains(CKK_EC));
    assert!(entry.key_types().contains(CKK_RSA));
}

#[test]
fn test_third_key_type_fails_card_initialisation() {
    let advertised = [
        AdvertisedMechanism::new(CKM_RSA_PKCS, MechanismInfo::new(1024, 2048, CKF_SIGN), CKK_RSA),
        AdvertisedMechanism::new(CKM_RSA_PKCS, MechanismInfo::new(1024, 2048, CKF_SIGN), CKK_EC),
        AdvertisedMechanism::new(
            CKM_RSA_PKCS,
            MechanismInfo::new(1024, 2048, CKF_SIGN),
            cryptoki_sys::CKK_DSA,
        ),
    ];
    assert!(matches!(
        build_mechanisms(&TokenConfig::default(), &advertised),
        Err(Error::TooManyKeyTypes(CKM_RSA_PKCS))
    ));
}

#[test]
fn test_configured_digests_limit_composites() {
    let config = TokenConfig::from_json(r#"{ "digests": ["sha256"] }"#).expect("config");
    let mechanisms = build_mechanisms(&config, &common::advertised()).expect("table");
    assert!(mechanisms.find(CKM_ECDSA_SHA256, CKF_SIGN).is_some());
    assert!(mechanisms.find(CKM_ECDSA_SHA384, CKF_SIGN).is_none());
    assert!(mechanisms.find(CKM_SHA1_RSA_PKCS, CKF_SIGN).is_none());
    assert!(
        mechanisms
            .find(hsm_pkcs11::mechanism::digest_mechanism(DigestAlgorithm::Sha512), 0)
            .is_none()
    );
}

#[test]
fn test_mechanism_queries_need_a_token() {
    let mechanisms = common::mechanisms();
    let mut list = vec![0 as CK_MECHANISM_TYPE; 2];
    assert!(matches!(
        functions::get_mechanism_list(Some(mechanisms.as_ref()), Some(&mut list)),
        Err(Error::BufferTooSmall(n)) if n == mechanisms.len()
    ));
    assert!(matches!(
        functions::get_mechanism_list(None, None),
        Err(Error::TokenNotPresent)
    ));
    assert!(matches!(
        functions::get_mechanism_info(Some(mechanisms.as_ref()), CKM_ECDSA_SHA256).map(|i| i.flags),
        Ok(flags) if flags & CKF_SIGN != 0
    ));
}
