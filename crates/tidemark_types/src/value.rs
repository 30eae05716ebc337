//! Field values and payloads.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single field value in an entity payload.
///
/// The set of variants mirrors what a document store can represent
/// without schema knowledge. Floats compare bitwise for equality so
/// that payload comparison stays deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FieldValue {
    /// Absent / null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// Floating point.
    Float(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

// Bitwise on floats: a payload holding NaN still equals itself, and
// conflict detection never sees a field as perpetually changed.
impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FieldValue::Null, FieldValue::Null) => true,
            (FieldValue::Bool(a), FieldValue::Bool(b)) => a == b,
            (FieldValue::Integer(a), FieldValue::Integer(b)) => a == b,
            (FieldValue::Float(a), FieldValue::Float(b)) => a.to_bits() == b.to_bits(),
            (FieldValue::Text(a), FieldValue::Text(b)) => a == b,
            (FieldValue::Bytes(a), FieldValue::Bytes(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for FieldValue {}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::Integer(i)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

/// An ordered mapping of field name to value.
///
/// Field order is deterministic (lexicographic by name), so two
/// payloads holding the same fields compare and encode identically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    fields: BTreeMap<String, FieldValue>,
}

impl Payload {
    /// Creates an empty payload.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a field, returning the payload for chaining.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Sets a field.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Gets a field value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Removes a field.
    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        self.fields.remove(name)
    }

    /// Returns the field names in order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Returns the number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if the payload has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Overlays `other` on top of this payload.
    ///
    /// Fields present in `other` replace fields of the same name;
    /// all other fields are kept.
    pub fn merge_from(&mut self, other: &Payload) {
        for (name, value) in &other.fields {
            self.fields.insert(name.clone(), value.clone());
        }
    }

    /// Returns a copy of this payload with `other` overlaid.
    #[must_use]
    pub fn merged_with(&self, other: &Payload) -> Payload {
        let mut out = self.clone();
        out.merge_from(other);
        out
    }

    /// Returns true if any field name appears in both payloads.
    #[must_use]
    pub fn overlaps(&self, other: &Payload) -> bool {
        self.fields.keys().any(|k| other.fields.contains_key(k))
    }

    /// Returns true if no field name appears in both payloads.
    #[must_use]
    pub fn disjoint_with(&self, other: &Payload) -> bool {
        !self.overlaps(other)
    }
}

impl FromIterator<(String, FieldValue)> for Payload {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}
