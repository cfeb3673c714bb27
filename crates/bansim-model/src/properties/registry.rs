//! Property registry, lookup functions, and the resolved property set.
//!
//! This module provides:
//! - [`ALL_PROPERTIES`] - Array of all registered property definitions
//! - Lookup functions for finding properties by name
//! - [`ResolvedProperties`] - A complete set of property values with defaults

use std::collections::BTreeMap;
use std::fmt;

use super::definitions::*;
use super::{FromPropertyValue, Property, PropertyDef, PropertyValue};

// ============================================================================
// All Properties Array (for runtime lookup)
// ============================================================================

/// All registered property definitions (for runtime lookup).
pub const ALL_PROPERTIES: &[&PropertyDef] = &[
    // Topology
    &NODE_COUNT.def,
    // Beacon schedule
    &TIME_SLOTS.def,
    &BEACON_INTERVAL.def,
    &SLOT_DURATION.def,
    &PACKET_SIZE.def,
    &ACCESS_MODE.def,
    // Radio
    &ADDITIONAL_TX_LOSS.def,
    &RX_SENSITIVITY.def,
    &LOS_GATING.def,
    // Slot allocation
    &USE_Q_LEARNING.def,
    &LEARNING_RATE.def,
    &DISCOUNT_FACTOR.def,
    &EXPLORATION_RATE.def,
    &USE_UNALLOCATED.def,
    &PRIORITY_WEIGHT.def,
    // Simulation
    &SIMULATION_TIME.def,
    &SEED.def,
    &LOG_LEVEL.def,
];

// ============================================================================
// Lookup Functions
// ============================================================================

/// Check if a property name is registered.
pub fn is_known_property(name: &str) -> bool {
    ALL_PROPERTIES.iter().any(|p| p.name == name)
}

/// Get a property definition by name.
pub fn get_property_def(name: &str) -> Option<&'static PropertyDef> {
    ALL_PROPERTIES.iter().find(|p| p.name == name).copied()
}

/// Get the default value for a property by name.
pub fn default_value(name: &str) -> Option<PropertyValue> {
    get_property_def(name).map(|p| p.default_value())
}

// ============================================================================
// Property Set Errors
// ============================================================================

/// Errors that can occur when manipulating a property set.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertySetError {
    /// Unknown property name.
    UnknownProperty(String),
    /// Value cannot be converted to the property's type.
    TypeMismatch {
        property: String,
        expected: String,
        actual: String,
    },
    /// Value has the right type but does not fit the Rust type it resolves to.
    OutOfRange { property: String, value: String },
}

impl fmt::Display for PropertySetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertySetError::UnknownProperty(name) => {
                write!(f, "Unknown property: {}", name)
            }
            PropertySetError::TypeMismatch {
                property,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Type mismatch for property '{}': expected {}, got {}",
                    property, expected, actual
                )
            }
            PropertySetError::OutOfRange { property, value } => {
                write!(f, "Value {} out of range for property '{}'", value, property)
            }
        }
    }
}

impl std::error::Error for PropertySetError {}

// ============================================================================
// Resolved Property Set
// ============================================================================

/// Every registered property with its resolved value.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedProperties {
    values: BTreeMap<&'static str, PropertyValue>,
}

impl ResolvedProperties {
    /// Create a property set with all defaults.
    pub fn new() -> Self {
        let values = ALL_PROPERTIES
            .iter()
            .map(|p| (p.name, p.default_value()))
            .collect();
        ResolvedProperties { values }
    }

    /// Set a typed property from a raw value, converting it to the property's type.
    pub fn set<T>(&mut self, prop: &Property<T>, value: PropertyValue) -> Result<(), PropertySetError> {
        let resolved = prop.def.resolve(&value)?;
        self.values.insert(prop.def.name, resolved);
        Ok(())
    }

    /// Set a property by name from a raw value.
    pub fn set_by_name(&mut self, name: &str, value: &PropertyValue) -> Result<(), PropertySetError> {
        let def = get_property_def(name).ok_or_else(|| PropertySetError::UnknownProperty(name.to_string()))?;
        let resolved = def.resolve(value)?;
        self.values.insert(def.name, resolved);
        Ok(())
    }

    /// Get a property value, failing when it does not fit `T`.
    pub fn try_get<T: FromPropertyValue>(&self, prop: &Property<T>) -> Result<T, PropertySetError> {
        let value = self.get_raw(prop);
        T::from_property_value(&value).ok_or_else(|| PropertySetError::OutOfRange {
            property: prop.def.name.to_string(),
            value: format!("{:?}", value),
        })
    }

    /// Get a property value, falling back to the built-in default when the
    /// stored value does not fit `T`.
    pub fn get<T: FromPropertyValue + Default>(&self, prop: &Property<T>) -> T {
        self.try_get(prop)
            .ok()
            .or_else(|| T::from_property_value(&prop.def.default_value()))
            .unwrap_or_default()
    }

    /// Get the raw value of a property.
    pub fn get_raw<T>(&self, prop: &Property<T>) -> PropertyValue {
        self.values
            .get(prop.def.name)
            .cloned()
            .unwrap_or_else(|| prop.def.default_value())
    }

    /// Iterate over all values in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &PropertyValue)> {
        self.values.iter().map(|(k, v)| (*k, v))
    }
}

impl Default for ResolvedProperties {
    fn default() -> Self {
        Self::new()
    }
}
