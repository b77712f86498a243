//! Schemaless detail and context bags.
//!
//! Tickets and flows carry two JSON object bags: `details` (inputs, schema
//! enforced per ticket type by its builder) and `context` (outputs, propagated
//! to later stages). Storage is schemaless; the validated form is a typed
//! struct per ticket type that marshals through these helpers.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// A schemaless JSON object bag.
pub type Bag = Map<String, Value>;

/// Append-merges `patch` into `bag`.
///
/// Existing keys are overwritten by the patch; keys absent from the patch are
/// left untouched. This is the only mutation the stores apply to bags.
pub fn merge(bag: &mut Bag, patch: &Bag) {
    for (key, value) in patch {
        bag.insert(key.clone(), value.clone());
    }
}

/// Marshals a typed value into a bag.
///
/// # Errors
///
/// Returns a serialization error if the value does not serialize to a JSON
/// object.
pub fn to_bag<T: Serialize>(value: &T) -> Result<Bag> {
    match serde_json::to_value(value) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(Error::Serialization {
            message: format!("expected a JSON object, got {other}"),
        }),
        Err(e) => Err(Error::Serialization {
            message: format!("failed to serialize bag: {e}"),
        }),
    }
}

/// Unmarshals a bag into a typed value.
///
/// # Errors
///
/// Returns a serialization error if the bag does not match the target schema.
pub fn from_bag<T: DeserializeOwned>(bag: &Bag) -> Result<T> {
    serde_json::from_value(Value::Object(bag.clone())).map_err(|e| Error::Serialization {
        message: format!("failed to deserialize bag: {e}"),
    })
}

/// Returns the string value at `key`, if present and a string.
#[must_use]
pub fn get_str<'a>(bag: &'a Bag, key: &str) -> Option<&'a str> {
    bag.get(key).and_then(Value::as_str)
}

/// Returns the u64 value at `key`, if present and numeric.
#[must_use]
pub fn get_u64(bag: &Bag, key: &str) -> Option<u64> {
    bag.get(key).and_then(Value::as_u64)
}
