//! Record flattening
//!
//! Turns a typed `BackendRecord` into a `FlatRecord` of strings. The rule per
//! value shape, most specific first:
//!
//! 1. aliased value: the underlying value in raw form
//! 2. choice: its label
//! 3. reference: the referenced record id
//! 4. anything else: its text

use std::collections::HashMap;

use crate::record::{BackendRecord, FlatRecord, ENTITY_NAME_KEY, VERSION_KEY};
use crate::value::AttributeValue;

/// Flattens records of one emitted entity label / job version
#[derive(Debug, Clone)]
pub struct RecordFlattener {
    entity_label: String,
    version: String,
}

impl RecordFlattener {
    /// Create a flattener that stamps `EntityName` and `Version` on every record
    pub fn new<E: Into<String>, V: Into<String>>(entity_label: E, version: V) -> Self {
        Self {
            entity_label: entity_label.into(),
            version: version.into(),
        }
    }

    /// Entity label written under `EntityName`
    pub fn entity_label(&self) -> &str {
        &self.entity_label
    }

    /// Flatten one record
    pub fn flatten(&self, record: &BackendRecord) -> FlatRecord {
        let mut properties = HashMap::with_capacity(record.attributes.len() + 2);
        properties.insert(ENTITY_NAME_KEY.to_string(), self.entity_label.clone());
        properties.insert(VERSION_KEY.to_string(), self.version.clone());

        for (key, value) in &record.attributes {
            // metadata keys win over a same-named attribute
            properties
                .entry(key.clone())
                .or_insert_with(|| format_value(value));
        }

        FlatRecord::from_properties(properties)
    }
}

/// Render one attribute value for emission
pub fn format_value(value: &AttributeValue) -> String {
    match value {
        AttributeValue::Aliased { inner, .. } => inner.raw(),
        AttributeValue::Choice { label, .. } => label.clone(),
        AttributeValue::Reference { id, .. } => id.to_string(),
        AttributeValue::Plain(text) => text.clone(),
    }
}
