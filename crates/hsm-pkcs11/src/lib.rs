//! PKCS#11 mechanism layer for FerroHSM.
//!
//! A card publishes a [`Mechanisms`] table built from what its secure element
//! advertises plus software digests and composed hash-and-sign mechanisms.
//! Sessions hold at most one [`Operation`] per [`OperationClass`]; the
//! functions in [`functions`] drive those operations through the verb tables
//! attached to each [`MechanismType`], and [`ffi`] adapts them to the raw
//! pointer conventions of the `C_*` entry points.

pub mod attribute;
pub mod buffer;
pub mod cipher;
pub mod digest;
pub mod error;
pub mod ffi;
pub mod functions;
pub mod hardware;
pub mod keymgmt;
pub mod mechanism;
pub mod operation;
pub mod registry;
pub mod signature;
pub mod token;

pub use attribute::{AttributeSet, AttributeValue};
pub use error::{Error, Result};
pub use hardware::{CipherStep, KeyObject, SoftKey};
pub use mechanism::{Mechanism, MechanismInfo, MechanismType};
pub use operation::{Operation, OperationClass, Session, SessionState};
pub use registry::Mechanisms;
pub use token::{AdvertisedMechanism, TokenConfig, build_mechanisms};
