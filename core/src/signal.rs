//! Signal metadata carried alongside the backplane
//!
//! The backplane stores every value as 8 bytes regardless of the declared
//! type; the type tag and flags only drive validation and the schema sent to
//! control clients.
use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Declared value type of a signal
///
/// Storage in the data region is always 8 bytes, independent of the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SignalType {
    #[default]
    F64,
    F32,
    I64,
    I32,
    Bool,
}

impl fmt::Display for SignalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalType::F64 => "f64",
            SignalType::F32 => "f32",
            SignalType::I64 => "i64",
            SignalType::I32 => "i32",
            SignalType::Bool => "bool",
        };
        write!(f, "{s}")
    }
}

bitflags! {
    /// Property flags of a signal
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SignalFlags: u32 {
        /// May be modified from outside the owning module (control `set`, wires)
        const WRITABLE = 1 << 0;
        /// Included in telemetry streams by default
        const PUBLISHED = 1 << 1;
    }
}

/// Metadata of a single signal in the backplane
///
/// `name` is the qualified `"<module>.<local>"` form; insertion order of
/// descriptors determines the segment layout.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalDescriptor {
    pub name: String,
    pub ty: SignalType,
    pub flags: SignalFlags,
    pub unit: String,
}

impl SignalDescriptor {
    pub fn new<N: Into<String>>(name: N) -> Self {
        Self {
            name: name.into(),
            ty: SignalType::default(),
            flags: SignalFlags::default(),
            unit: String::new(),
        }
    }

    pub fn with_type(mut self, ty: SignalType) -> Self {
        self.ty = ty;
        self
    }

    pub fn with_flags(mut self, flags: SignalFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_unit<U: Into<String>>(mut self, unit: U) -> Self {
        self.unit = unit.into();
        self
    }

    /// Splits the qualified name into `(module, local)`; unqualified names
    /// have no module part
    pub fn split_name(&self) -> (Option<&str>, &str) {
        match self.name.rsplit_once('.') {
            Some((module, local)) => (Some(module), local),
            None => (None, &self.name),
        }
    }
}
