//! Attribute values
//!
//! Backend records carry typed attribute values. The set of shapes is closed:
//! plain scalars, choice (option set) values, references to other records, and
//! values aliased in from a joined entity.

use std::fmt;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One attribute value as returned by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AttributeValue {
    /// Any scalar already rendered as text (strings, numbers, dates, booleans)
    Plain(String),
    /// Enumerated value with its numeric code and display label
    Choice {
        /// Numeric option code
        code: i32,
        /// Human readable label
        label: String,
    },
    /// Lookup pointing at another record
    Reference {
        /// Logical name of the referenced entity
        entity: String,
        /// Identifier of the referenced record
        id: Uuid,
    },
    /// Value projected from a joined (linked) entity
    Aliased {
        /// Link alias the value came through
        alias: String,
        /// The underlying typed value
        inner: Box<AttributeValue>,
    },
}

impl AttributeValue {
    /// Create a plain value
    pub fn plain<S: Into<String>>(value: S) -> Self {
        AttributeValue::Plain(value.into())
    }

    /// Create a choice value
    pub fn choice<S: Into<String>>(code: i32, label: S) -> Self {
        AttributeValue::Choice { code, label: label.into() }
    }

    /// Create a reference value
    pub fn reference<S: Into<String>>(entity: S, id: Uuid) -> Self {
        AttributeValue::Reference { entity: entity.into(), id }
    }

    /// Wrap a value as aliased through a link
    pub fn aliased<S: Into<String>>(alias: S, inner: AttributeValue) -> Self {
        AttributeValue::Aliased { alias: alias.into(), inner: Box::new(inner) }
    }

    /// Raw, untranslated representation: codes instead of labels, ids instead
    /// of names, aliases unwrapped.
    pub fn raw(&self) -> String {
        match self {
            AttributeValue::Plain(text) => text.clone(),
            AttributeValue::Choice { code, .. } => code.to_string(),
            AttributeValue::Reference { id, .. } => id.to_string(),
            AttributeValue::Aliased { inner, .. } => inner.raw(),
        }
    }

    /// Interpret the value as a UTC timestamp, if it is one
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            AttributeValue::Plain(text) => parse_backend_timestamp(text),
            AttributeValue::Aliased { inner, .. } => inner.as_timestamp(),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw())
    }
}

/// Parse a timestamp as the backend renders it (RFC 3339, or ISO 8601
/// without offset, which the backend means as UTC).
pub fn parse_backend_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_raw_representation() {
        let id = Uuid::parse_str("6f1c1c2e-9b7a-4f4e-8d0e-1a2b3c4d5e6f").unwrap();

        assert_eq!(AttributeValue::plain("hello").raw(), "hello");
        assert_eq!(AttributeValue::choice(2, "Suspended").raw(), "2");
        assert_eq!(AttributeValue::reference("systemuser", id).raw(), id.to_string());
        assert_eq!(
            AttributeValue::aliased("wf", AttributeValue::choice(1, "Activated")).raw(),
            "1"
        );
    }

    #[test]
    fn test_timestamps() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 2, 0, 0).unwrap();

        assert_eq!(AttributeValue::plain("2024-01-01T02:00:00Z").as_timestamp(), Some(expected));
        assert_eq!(AttributeValue::plain("2024-01-01T02:00:00").as_timestamp(), Some(expected));
        assert_eq!(
            AttributeValue::aliased("ao", AttributeValue::plain("2024-01-01T03:00:00+01:00")).as_timestamp(),
            Some(expected)
        );
        assert_eq!(AttributeValue::plain("not a date").as_timestamp(), None);
        assert_eq!(AttributeValue::choice(0, "Active").as_timestamp(), None);
    }
}
