//! # Simulation Properties
//!
//! Typed definitions of every configuration key the simulator reads.
//!
//! ## Module Organization
//!
//! - [`definitions`] - All property constants (easy to review in one place)
//! - [`registry`] - Lookup by name and the resolved property set
//!
//! ## Type-Safe Property Access
//!
//! Each property carries the Rust type it resolves to:
//!
//! ```ignore
//! use bansim_model::properties::{ResolvedProperties, NODE_COUNT};
//!
//! let props = ResolvedProperties::new();
//! let nodes: usize = props.get(&NODE_COUNT);
//! ```
//!
//! Configuration files are flat: every key is a property name. Numeric keys
//! also accept numeric strings, so `"node_count": "4"` and `node_count: 4`
//! resolve to the same value.

pub mod definitions;
pub mod registry;

pub use definitions::*;
pub use registry::{
    default_value, get_property_def, is_known_property, PropertySetError, ResolvedProperties,
    ALL_PROPERTIES,
};

use std::fmt;
use std::marker::PhantomData;

use serde::Serialize;

// ============================================================================
// Values
// ============================================================================

/// Value type a property resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyType {
    Integer,
    Float,
    Bool,
    String,
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PropertyType::Integer => "integer",
            PropertyType::Float => "float",
            PropertyType::Bool => "bool",
            PropertyType::String => "string",
        };
        f.write_str(name)
    }
}

/// Built-in default, usable in constants.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PropertyDefault {
    Integer(i64),
    Float(f64),
    Bool(bool),
    String(&'static str),
}

impl PropertyDefault {
    const fn value_type(&self) -> PropertyType {
        match self {
            PropertyDefault::Integer(_) => PropertyType::Integer,
            PropertyDefault::Float(_) => PropertyType::Float,
            PropertyDefault::Bool(_) => PropertyType::Bool,
            PropertyDefault::String(_) => PropertyType::String,
        }
    }
}

impl fmt::Display for PropertyDefault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyDefault::Integer(v) => write!(f, "{}", v),
            PropertyDefault::Float(v) => write!(f, "{}", v),
            PropertyDefault::Bool(v) => write!(f, "{}", v),
            PropertyDefault::String(v) => write!(f, "\"{}\"", v),
        }
    }
}

/// A configuration value, either raw from a file or resolved.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Integer(i64),
    Float(f64),
    Bool(bool),
    String(String),
}

impl PropertyValue {
    /// Short name of the variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            PropertyValue::Integer(_) => "integer",
            PropertyValue::Float(_) => "float",
            PropertyValue::Bool(_) => "bool",
            PropertyValue::String(_) => "string",
        }
    }

    /// Convert to `target`, or `None` when the value cannot represent it.
    ///
    /// Strings are trimmed and parsed for numeric and boolean targets. A float
    /// converts to an integer only when it has no fractional part.
    pub fn coerce(&self, target: PropertyType) -> Option<PropertyValue> {
        match (target, self) {
            (PropertyType::Integer, PropertyValue::Integer(v)) => Some(PropertyValue::Integer(*v)),
            (PropertyType::Integer, PropertyValue::Float(v)) if v.fract() == 0.0 && v.is_finite() => {
                Some(PropertyValue::Integer(*v as i64))
            }
            (PropertyType::Integer, PropertyValue::String(s)) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|v| v.fract() == 0.0).map(|v| v as i64))
                    .map(PropertyValue::Integer)
            }
            (PropertyType::Float, PropertyValue::Integer(v)) => Some(PropertyValue::Float(*v as f64)),
            (PropertyType::Float, PropertyValue::Float(v)) => Some(PropertyValue::Float(*v)),
            (PropertyType::Float, PropertyValue::String(s)) => {
                s.trim().parse::<f64>().ok().map(PropertyValue::Float)
            }
            (PropertyType::Bool, PropertyValue::Bool(v)) => Some(PropertyValue::Bool(*v)),
            (PropertyType::Bool, PropertyValue::Integer(v)) if *v == 0 || *v == 1 => {
                Some(PropertyValue::Bool(*v == 1))
            }
            (PropertyType::Bool, PropertyValue::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => Some(PropertyValue::Bool(true)),
                "false" | "0" | "no" => Some(PropertyValue::Bool(false)),
                _ => None,
            },
            (PropertyType::String, PropertyValue::String(s)) => Some(PropertyValue::String(s.clone())),
            (PropertyType::String, PropertyValue::Integer(v)) => Some(PropertyValue::String(v.to_string())),
            (PropertyType::String, PropertyValue::Float(v)) => Some(PropertyValue::String(v.to_string())),
            (PropertyType::String, PropertyValue::Bool(v)) => Some(PropertyValue::String(v.to_string())),
            _ => None,
        }
    }
}

impl From<PropertyDefault> for PropertyValue {
    fn from(default: PropertyDefault) -> Self {
        match default {
            PropertyDefault::Integer(v) => PropertyValue::Integer(v),
            PropertyDefault::Float(v) => PropertyValue::Float(v),
            PropertyDefault::Bool(v) => PropertyValue::Bool(v),
            PropertyDefault::String(v) => PropertyValue::String(v.to_string()),
        }
    }
}

/// Conversion from a resolved value to a property's Rust type.
pub trait FromPropertyValue: Sized {
    fn from_property_value(value: &PropertyValue) -> Option<Self>;
}

impl FromPropertyValue for i64 {
    fn from_property_value(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Integer(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromPropertyValue for u64 {
    fn from_property_value(value: &PropertyValue) -> Option<Self> {
        i64::from_property_value(value).and_then(|v| u64::try_from(v).ok())
    }
}

impl FromPropertyValue for u32 {
    fn from_property_value(value: &PropertyValue) -> Option<Self> {
        i64::from_property_value(value).and_then(|v| u32::try_from(v).ok())
    }
}

impl FromPropertyValue for usize {
    fn from_property_value(value: &PropertyValue) -> Option<Self> {
        i64::from_property_value(value).and_then(|v| usize::try_from(v).ok())
    }
}

impl FromPropertyValue for f64 {
    fn from_property_value(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Float(v) => Some(*v),
            PropertyValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }
}

impl FromPropertyValue for bool {
    fn from_property_value(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromPropertyValue for String {
    fn from_property_value(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::String(v) => Some(v.clone()),
            _ => None,
        }
    }
}

// ============================================================================
// Definitions
// ============================================================================

/// Untyped metadata of one property.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PropertyDef {
    /// Key in the configuration file.
    pub name: &'static str,
    /// User-facing help text, printed by `bansim properties`.
    pub description: &'static str,
    pub default: PropertyDefault,
    pub unit: Option<&'static str>,
    pub value_type: PropertyType,
}

impl PropertyDef {
    /// Default as a value.
    pub fn default_value(&self) -> PropertyValue {
        self.default.into()
    }

    /// Convert a raw value to this property's type.
    pub fn resolve(&self, raw: &PropertyValue) -> Result<PropertyValue, PropertySetError> {
        raw.coerce(self.value_type).ok_or_else(|| PropertySetError::TypeMismatch {
            property: self.name.to_string(),
            expected: self.value_type.to_string(),
            actual: format!("{} {:?}", raw.kind(), raw),
        })
    }
}

/// A property whose value resolves to `T`.
#[derive(Debug)]
pub struct Property<T> {
    pub def: PropertyDef,
    _type: PhantomData<fn() -> T>,
}

impl<T> Property<T> {
    pub const fn new(name: &'static str, description: &'static str, default: PropertyDefault) -> Self {
        Property {
            def: PropertyDef {
                name,
                description,
                default,
                unit: None,
                value_type: default.value_type(),
            },
            _type: PhantomData,
        }
    }

    pub const fn with_unit(self, unit: &'static str) -> Self {
        Property {
            def: PropertyDef {
                name: self.def.name,
                description: self.def.description,
                default: self.def.default,
                unit: Some(unit),
                value_type: self.def.value_type,
            },
            _type: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.def.name
    }
}
