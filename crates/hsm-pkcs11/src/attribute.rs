//! Attribute values exchanged with key objects.

use cryptoki_sys::{CK_ATTRIBUTE_TYPE, CK_ULONG};
use std::collections::HashMap;
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// Represents a PKCS#11 attribute value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Bool(bool),
    Ulong(CK_ULONG),
    Bytes(Vec<u8>),
    String(String),
}

impl AttributeValue {
    pub fn as_ulong(&self) -> Result<CK_ULONG> {
        match self {
            AttributeValue::Ulong(value) => Ok(*value),
            _ => Err(Error::AttributeTypeInvalid),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            AttributeValue::Bytes(value) => Ok(value),
            AttributeValue::String(value) => Ok(value.as_bytes()),
            _ => Err(Error::AttributeTypeInvalid),
        }
    }

    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            AttributeValue::Bytes(value) => Ok(value),
            AttributeValue::String(value) => Ok(value.into_bytes()),
            _ => Err(Error::AttributeTypeInvalid),
        }
    }
}

impl Zeroize for AttributeValue {
    fn zeroize(&mut self) {
        match self {
            AttributeValue::Bool(value) => value.zeroize(),
            AttributeValue::Ulong(value) => value.zeroize(),
            AttributeValue::Bytes(value) => value.zeroize(),
            AttributeValue::String(value) => value.zeroize(),
        }
    }
}

/// A collection of PKCS#11 attributes. Values are wiped when replaced,
/// removed or dropped.
#[derive(Debug, Clone, Default)]
pub struct AttributeSet {
    attributes: HashMap<CK_ATTRIBUTE_TYPE, AttributeValue>,
}

impl AttributeSet {
    /// Create a new empty attribute set
    pub fn new() -> Self {
        Self {
            attributes: HashMap::new(),
        }
    }

    /// Set an attribute value
    pub fn set(&mut self, attr_type: CK_ATTRIBUTE_TYPE, value: AttributeValue) {
        if let Some(mut previous) = self.attributes.insert(attr_type, value) {
            previous.zeroize();
        }
    }

    /// Get an attribute value
    pub fn get(&self, attr_type: CK_ATTRIBUTE_TYPE) -> Option<&AttributeValue> {
        self.attributes.get(&attr_type)
    }
}

impl Drop for AttributeSet {
    fn drop(&mut self) {
        self.attributes.values_mut().for_each(Zeroize::zeroize);
    }
}
