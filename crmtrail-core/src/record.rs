//! Record types
//!
//! `BackendRecord` is what a query returns; `FlatRecord` is what gets emitted.

use std::collections::HashMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value::AttributeValue;

/// Metadata key holding the emitted entity label
pub const ENTITY_NAME_KEY: &str = "EntityName";

/// Metadata key holding the job version
pub const VERSION_KEY: &str = "Version";

/// A record returned by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendRecord {
    /// Logical name of the entity the record belongs to
    pub entity_name: String,
    /// Attributes keyed by attribute name
    pub attributes: HashMap<String, AttributeValue>,
}

impl BackendRecord {
    /// Create an empty record
    pub fn new<S: Into<String>>(entity_name: S) -> Self {
        Self {
            entity_name: entity_name.into(),
            attributes: HashMap::new(),
        }
    }

    /// Add an attribute
    pub fn with_attribute<K: Into<String>>(mut self, key: K, value: AttributeValue) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    /// Insert or replace an attribute
    pub fn insert<K: Into<String>>(&mut self, key: K, value: AttributeValue) {
        self.attributes.insert(key.into(), value);
    }

    /// Get an attribute
    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    /// Read an attribute as a timestamp
    pub fn timestamp(&self, key: &str) -> Option<DateTime<Utc>> {
        self.get(key).and_then(AttributeValue::as_timestamp)
    }
}

/// A backend record reduced to string properties, ready for emission
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FlatRecord {
    properties: HashMap<String, String>,
}

impl FlatRecord {
    pub(crate) fn from_properties(properties: HashMap<String, String>) -> Self {
        Self { properties }
    }

    /// Get a property
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// All properties
    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    /// Consume the record into its property map
    pub fn into_properties(self) -> HashMap<String, String> {
        self.properties
    }

    /// Number of properties, metadata included
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    /// Whether the record has no properties at all
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_backend_record() {
        let mut record = BackendRecord::new("plugintracelog")
            .with_attribute("createdon", AttributeValue::plain("2024-01-01T00:30:00Z"))
            .with_attribute("mode", AttributeValue::choice(0, "Synchronous"));
        record.insert("depth", AttributeValue::plain("1"));

        assert_eq!(record.entity_name, "plugintracelog");
        assert_eq!(record.attributes.len(), 3);
        assert_eq!(
            record.timestamp("createdon"),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap())
        );
        assert_eq!(record.timestamp("mode"), None);
        assert_eq!(record.timestamp("missing"), None);
    }
}
