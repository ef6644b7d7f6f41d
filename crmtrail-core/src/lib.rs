//! # crmtrail Core
//!
//! Core types for crmtrail: typed attribute values, backend and flat records,
//! the declarative query model and the shared error type.

#![warn(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod value;
pub mod record;
pub mod flatten;
pub mod query;

// Re-exports for convenience
pub use error::{CrmTrailError, Result};
pub use value::AttributeValue;
pub use record::{BackendRecord, FlatRecord, ENTITY_NAME_KEY, VERSION_KEY};
pub use flatten::{format_value, RecordFlattener};
pub use query::{
    ColumnSet, Condition, ConditionOperator, FilterExpression, LinkEntity,
    LogicalOperator, QueryExpression,
};

/// Version of the crmtrail core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
