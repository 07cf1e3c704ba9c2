//! Per-card mechanism table.

use cryptoki_sys::{
    CK_FLAGS, CK_MECHANISM_TYPE, CKF_DIGEST, CKF_SIGN, CKF_SIGN_RECOVER, CKF_VERIFY,
    CKF_VERIFY_RECOVER,
};
use std::sync::Arc;
use tracing::debug;

use crate::{
    error::{Error, Result},
    mechanism::{HashSignInfo, MechanismInfo, MechanismType, new_mechanism},
};

const SIGN_AND_VERIFY: CK_FLAGS = CKF_SIGN | CKF_SIGN_RECOVER | CKF_VERIFY | CKF_VERIFY_RECOVER;

/// Mechanisms a card supports, in registration order.
///
/// Built mutably during card initialisation, then shared read-only as
/// `Arc<Mechanisms>`. Entries are reference counted so live operations keep
/// their descriptor alive independently of the table.
#[derive(Debug, Default)]
pub struct Mechanisms {
    entries: Vec<Arc<MechanismType>>,
}

impl Mechanisms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `mt`, or folds it into an existing entry for the same mechanism
    /// whose flags cover the new ones. Returns the entry held by the table.
    pub fn register(&mut self, mt: &MechanismType) -> Result<&Arc<MechanismType>> {
        let flags = mt.info().flags;
        let existing = self
            .entries
            .iter()
            .position(|entry| entry.mechanism() == mt.mechanism() && entry.info().supports(flags));

        let index = match existing {
            Some(index) => {
                let entry = &mut self.entries[index];
                match Arc::get_mut(entry) {
                    Some(entry) => entry.merge(mt)?,
                    None => {
                        let mut copy = entry.try_copy()?;
                        copy.merge(mt)?;
                        *entry = Arc::new(copy);
                    }
                }
                debug!(
                    "merged mechanism {:#x} into existing entry, key types {:?}",
                    mt.mechanism(),
                    self.entries[index].key_types()
                );
                index
            }
            None => {
                let copy = Arc::new(mt.try_copy()?);
                self.entries
                    .try_reserve(1)
                    .map_err(|_| Error::OutOfMemory)?;
                self.entries.push(copy);
                debug!("registered mechanism {:#x}", mt.mechanism());
                self.entries.len() - 1
            }
        };
        Ok(&self.entries[index])
    }

    /// First entry for `mechanism` advertising at least `flags`.
    pub fn find(&self, mechanism: CK_MECHANISM_TYPE, flags: CK_FLAGS) -> Option<&Arc<MechanismType>> {
        self.entries
            .iter()
            .find(|entry| entry.mechanism() == mechanism && entry.info().supports(flags))
    }

    /// Copies mechanism identifiers into `out`. Without a buffer only the count
    /// is returned; a short buffer is filled as far as it goes.
    pub fn list(&self, out: Option<&mut [CK_MECHANISM_TYPE]>) -> Result<usize> {
        let count = self.entries.len();
        if let Some(out) = out {
            for (slot, entry) in out.iter_mut().zip(&self.entries) {
                *slot = entry.mechanism();
            }
            if out.len() < count {
                return Err(Error::BufferTooSmall(count));
            }
        }
        Ok(count)
    }

    pub fn info(&self, mechanism: CK_MECHANISM_TYPE) -> Result<MechanismInfo> {
        self.find(mechanism, 0)
            .map(|entry| entry.info())
            .ok_or(Error::MechanismInvalid)
    }

    /// Registers `mech` as `sign_mech` over a software `hash_mech` digest.
    pub fn register_sign_and_hash(
        &mut self,
        mech: CK_MECHANISM_TYPE,
        hash_mech: CK_MECHANISM_TYPE,
        sign_mech: CK_MECHANISM_TYPE,
    ) -> Result<&Arc<MechanismType>> {
        let sign_type = self
            .find(sign_mech, CKF_SIGN)
            .ok_or(Error::MechanismInvalid)?;
        let hash_type = self
            .find(hash_mech, CKF_DIGEST)
            .ok_or(Error::MechanismInvalid)?;

        let sign_info = sign_type.info();
        let info = MechanismInfo::new(
            sign_info.min_key_size,
            sign_info.max_key_size,
            sign_info.flags & SIGN_AND_VERIFY,
        );
        let key_type = sign_type.key_types().first();
        let data = HashSignInfo {
            mech,
            hash_mech,
            sign_mech,
            hash_type: Arc::new(hash_type.try_copy()?),
        };
        let composite = new_mechanism(mech, info, key_type, Some(Box::new(data)));
        self.register(&composite)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<MechanismType>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
