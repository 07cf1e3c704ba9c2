//! Live state of multi-part PKCS#11 operations and the per-session slots
//! that own them.

use cryptoki_sys::{CK_MECHANISM_TYPE, CK_SESSION_HANDLE};
use hsm_core::DigestContext;
use std::{fmt, sync::Arc};
use tracing::trace;
use zeroize::Zeroize;

use crate::{
    cipher::CipherData,
    error::{Error, Result},
    mechanism::{Mechanism, MechanismType},
    registry::Mechanisms,
    signature::SignatureData,
};

pub type SessionHandle = CK_SESSION_HANDLE;

/// Largest mechanism parameter block an operation will store.
pub const MAX_MECHANISM_PARAMS: usize = 128;

/// Verb class; a session holds at most one operation per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    Digest,
    Sign,
    Verify,
    Encrypt,
    Decrypt,
    Wrap,
    Unwrap,
    Derive,
}

impl OperationClass {
    pub const COUNT: usize = 8;

    fn index(self) -> usize {
        self as usize
    }
}

/// Copy of the caller's `CK_MECHANISM`, parameters included. Wiped on drop.
#[derive(Clone)]
pub struct MechanismParams {
    mechanism: CK_MECHANISM_TYPE,
    len: usize,
    bytes: [u8; MAX_MECHANISM_PARAMS],
}

impl MechanismParams {
    fn empty(mechanism: CK_MECHANISM_TYPE) -> Self {
        Self {
            mechanism,
            len: 0,
            bytes: [0u8; MAX_MECHANISM_PARAMS],
        }
    }

    fn copy_from(mechanism: &Mechanism<'_>) -> Result<Self> {
        let len = mechanism.parameter.len();
        if len > MAX_MECHANISM_PARAMS {
            return Err(Error::ArgumentsInvalid);
        }
        let mut params = Self::empty(mechanism.mechanism);
        params.bytes[..len].copy_from_slice(mechanism.parameter);
        params.len = len;
        Ok(params)
    }

    pub fn as_mechanism(&self) -> Mechanism<'_> {
        Mechanism::with_parameter(self.mechanism, &self.bytes[..self.len])
    }
}

impl fmt::Debug for MechanismParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MechanismParams")
            .field("mechanism", &format_args!("{:#x}", self.mechanism))
            .field("len", &self.len)
            .finish()
    }
}

impl Drop for MechanismParams {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

/// Verb specific private state of an operation.
#[derive(Debug, Clone, Default)]
pub enum OperationData {
    #[default]
    Empty,
    Digest(DigestContext),
    Signature(SignatureData),
    Cipher(CipherData),
}

/// One in-progress call sequence. Dropping it releases and wipes everything
/// it owns, nested digest operations and buffered input included.
#[derive(Debug, Clone)]
pub struct Operation {
    session: SessionHandle,
    mechanism: Arc<MechanismType>,
    params: MechanismParams,
    data: OperationData,
}

impl Operation {
    pub fn new(session: SessionHandle, mechanism: Arc<MechanismType>) -> Self {
        let params = MechanismParams::empty(mechanism.mechanism());
        Self {
            session,
            mechanism,
            params,
            data: OperationData::Empty,
        }
    }

    /// Releases whatever operation `slot` holds; empty slots are left alone.
    pub fn release(slot: &mut Option<Operation>) {
        slot.take();
    }

    pub fn session(&self) -> SessionHandle {
        self.session
    }

    pub fn mechanism_type(&self) -> &Arc<MechanismType> {
        &self.mechanism
    }

    /// The mechanism selection the operation was started with.
    pub fn mechanism(&self) -> Mechanism<'_> {
        self.params.as_mechanism()
    }

    pub fn set_mechanism(&mut self, mechanism: &Mechanism<'_>) -> Result<()> {
        self.params = MechanismParams::copy_from(mechanism)?;
        Ok(())
    }

    pub fn data(&self) -> &OperationData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut OperationData {
        &mut self.data
    }

    pub fn set_data(&mut self, data: OperationData) {
        self.data = data;
    }
}

/// Operation slot bookkeeping a session offers to the mechanism layer.
pub trait Session {
    fn handle(&self) -> SessionHandle;

    /// Mechanism table of the token behind the session, if one is present.
    fn mechanisms(&self) -> Option<&Arc<Mechanisms>>;

    /// Installs `op` in the slot for `class`; fails if the slot is busy.
    fn start_operation(&mut self, class: OperationClass, op: Operation) -> Result<&mut Operation>;

    fn get_operation(&mut self, class: OperationClass) -> Result<&mut Operation>;

    /// Releases the operation in the slot for `class`, if any.
    fn stop_operation(&mut self, class: OperationClass);
}

/// Session state including active operations
#[derive(Debug)]
pub struct SessionState {
    handle: SessionHandle,
    mechanisms: Option<Arc<Mechanisms>>,
    operations: [Option<Operation>; OperationClass::COUNT],
}

impl SessionState {
    pub fn new(handle: SessionHandle, mechanisms: Arc<Mechanisms>) -> Self {
        Self {
            handle,
            mechanisms: Some(mechanisms),
            operations: std::array::from_fn(|_| None),
        }
    }

    /// A session whose slot has no token behind it.
    pub fn without_token(handle: SessionHandle) -> Self {
        Self {
            handle,
            mechanisms: None,
            operations: std::array::from_fn(|_| None),
        }
    }

    pub fn is_active(&self, class: OperationClass) -> bool {
        self.operations[class.index()].is_some()
    }
}

impl Session for SessionState {
    fn handle(&self) -> SessionHandle {
        self.handle
    }

    fn mechanisms(&self) -> Option<&Arc<Mechanisms>> {
        self.mechanisms.as_ref()
    }

    fn start_operation(&mut self, class: OperationClass, op: Operation) -> Result<&mut Operation> {
        let slot = &mut self.operations[class.index()];
        if slot.is_some() {
            return Err(Error::OperationActive);
        }
        trace!(
            "session {}: starting {class:?} with mechanism {:#x}",
            self.handle,
            op.mechanism_type().mechanism()
        );
        Ok(slot.insert(op))
    }

    fn get_operation(&mut self, class: OperationClass) -> Result<&mut Operation> {
        self.operations[class.index()]
            .as_mut()
            .ok_or(Error::OperationNotInitialized)
    }

    fn stop_operation(&mut self, class: OperationClass) {
        let slot = &mut self.operations[class.index()];
        if slot.is_some() {
            trace!("session {}: stopping {class:?}", self.handle);
        }
        Operation::release(slot);
    }
}
