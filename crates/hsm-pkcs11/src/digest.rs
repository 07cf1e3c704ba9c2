//! Software message digests exposed as PKCS#11 digest mechanisms.

use cryptoki_sys::CKF_DIGEST;
use hsm_core::{DigestAlgorithm, DigestContext};

use crate::{
    error::{Error, Result, check_capacity},
    mechanism::{
        DigestOps, MechanismInfo, MechanismOps, MechanismType, digest_algorithm, digest_mechanism,
    },
    operation::{Operation, OperationData},
};

#[derive(Debug)]
pub struct SoftwareDigest;

pub static SOFTWARE_DIGEST: SoftwareDigest = SoftwareDigest;

/// Descriptor for a keyless digest mechanism backed by [`SOFTWARE_DIGEST`].
pub fn new_digest_mechanism(algorithm: DigestAlgorithm) -> MechanismType {
    MechanismType::new(
        digest_mechanism(algorithm),
        MechanismInfo::new(0, 0, CKF_DIGEST),
        None,
        None,
        MechanismOps {
            digest: Some(&SOFTWARE_DIGEST),
            ..MechanismOps::default()
        },
    )
}

fn context(op: &mut Operation) -> Result<&mut DigestContext> {
    match op.data_mut() {
        OperationData::Digest(ctx) => Ok(ctx),
        _ => Err(Error::OperationNotInitialized),
    }
}

impl DigestOps for SoftwareDigest {
    fn init(&self, op: &mut Operation) -> Result<()> {
        let algorithm =
            digest_algorithm(op.mechanism_type().mechanism()).ok_or(Error::MechanismInvalid)?;
        op.set_data(OperationData::Digest(DigestContext::new(algorithm)));
        Ok(())
    }

    fn update(&self, op: &mut Operation, data: &[u8]) -> Result<()> {
        context(op)?.update(data);
        Ok(())
    }

    fn finish(&self, op: &mut Operation, out: Option<&mut [u8]>) -> Result<usize> {
        let ctx = context(op)?;
        let len = ctx.output_len();
        let Some(out) = out else { return Ok(len) };
        check_capacity(out, len)?;
        Ok(ctx.finalize_into(out)?)
    }
}
