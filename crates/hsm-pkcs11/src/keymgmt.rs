//! Wrap, unwrap and derive adapters. Each forwards the operation's stored
//! mechanism to the corresponding key object call.

use crate::{
    error::Result,
    hardware::KeyObject,
    mechanism::{DeriveOps, UnwrapOps, WrapOps},
    operation::Operation,
};

#[derive(Debug)]
pub struct GenericWrap;

#[derive(Debug)]
pub struct GenericUnwrap;

#[derive(Debug)]
pub struct GenericDerive;

pub static WRAPPING: GenericWrap = GenericWrap;
pub static UNWRAPPING: GenericUnwrap = GenericUnwrap;
pub static DERIVATION: GenericDerive = GenericDerive;

impl WrapOps for GenericWrap {
    fn wrap(
        &self,
        op: &mut Operation,
        wrapping_key: &dyn KeyObject,
        target_key: &dyn KeyObject,
        out: Option<&mut [u8]>,
    ) -> Result<usize> {
        wrapping_key.wrap_key(op.session(), &op.mechanism(), target_key, out)
    }
}

impl UnwrapOps for GenericUnwrap {
    fn unwrap(
        &self,
        op: &mut Operation,
        unwrapping_key: &dyn KeyObject,
        wrapped: &[u8],
        target_key: &dyn KeyObject,
    ) -> Result<()> {
        unwrapping_key.unwrap_key(op.session(), &op.mechanism(), wrapped, target_key)
    }
}

impl DeriveOps for GenericDerive {
    fn derive(
        &self,
        op: &mut Operation,
        base_key: &dyn KeyObject,
        params: &[u8],
        out: Option<&mut [u8]>,
    ) -> Result<usize> {
        base_key.derive(op.session(), &op.mechanism(), params, out)
    }
}
