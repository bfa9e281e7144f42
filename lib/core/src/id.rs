//! Strongly-typed ID types for domain entities.
//!
//! Every ID wraps a 64-bit Snowflake value minted by
//! [`IdGenerator`](crate::IdGenerator). On the wire IDs are written as
//! decimal strings so JSON consumers with 53-bit numbers keep full precision;
//! plain JSON numbers are accepted when reading.

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Error returned when parsing an ID from a string fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    /// The type of ID that failed to parse.
    pub id_type: &'static str,
    /// The reason for the parse failure.
    pub reason: String,
}

impl fmt::Display for ParseIdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse {}: {}", self.id_type, self.reason)
    }
}

impl std::error::Error for ParseIdError {}

struct RawIdVisitor;

impl Visitor<'_> for RawIdVisitor {
    type Value = u64;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a non-negative integer or a decimal string")
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<u64, E> {
        Ok(v)
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<u64, E> {
        u64::try_from(v).map_err(|_| E::custom(format!("negative id {v}")))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<u64, E> {
        v.trim()
            .parse()
            .map_err(|e| E::custom(format!("invalid id {v:?}: {e}")))
    }
}

/// Macro to generate a strongly-typed ID wrapper around a Snowflake value.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u64);

        impl $name {
            /// Wraps a raw Snowflake value.
            #[must_use]
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            /// Returns the raw Snowflake value.
            #[must_use]
            pub const fn as_u64(&self) -> u64 {
                self.0
            }

            /// Returns the value as a signed integer for `BIGINT` columns.
            ///
            /// Snowflake values never set the sign bit, so this is lossless.
            #[must_use]
            pub const fn as_i64(&self) -> i64 {
                self.0 as i64
            }

            /// Reads an ID back from a `BIGINT` column.
            ///
            /// # Errors
            ///
            /// Returns an error if the value is negative.
            pub fn from_i64(raw: i64) -> Result<Self, ParseIdError> {
                u64::try_from(raw).map(Self).map_err(|_| ParseIdError {
                    id_type: stringify!($name),
                    reason: format!("negative value {raw}"),
                })
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse::<u64>().map(Self).map_err(|e| ParseIdError {
                    id_type: stringify!($name),
                    reason: e.to_string(),
                })
            }
        }

        impl From<u64> for $name {
            fn from(raw: u64) -> Self {
                Self(raw)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                deserializer.deserialize_any(RawIdVisitor).map(Self)
            }
        }
    };
}

define_id!(
    /// Unique identifier for a workflow definition (one schema version).
    WorkflowDefinitionId
);

define_id!(
    /// Unique identifier for a task definition within a workflow definition.
    TaskDefinitionId
);

define_id!(
    /// Unique identifier for a running or finished workflow instance.
    WorkflowInstanceId
);

define_id!(
    /// Unique identifier for a task instance.
    TaskInstanceId
);

define_id!(
    /// Unique identifier for a message on the bus.
    MessageId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_decimal() {
        let id = TaskInstanceId::new(6_912_345_678_901_234_567);
        assert_eq!(id.to_string(), "6912345678901234567");
    }

    #[test]
    fn parse_roundtrip() {
        let id = WorkflowInstanceId::new(42);
        let parsed: WorkflowInstanceId = id.to_string().parse().expect("should parse");
        assert_eq!(id, parsed);
    }

    #[test]
    fn parse_invalid() {
        let result: Result<TaskDefinitionId, _> = "not-a-number".parse();
        let err = result.unwrap_err();
        assert_eq!(err.id_type, "TaskDefinitionId");
    }

    #[test]
    fn serializes_as_string() {
        let id = MessageId::new(9_007_199_254_740_993);
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "\"9007199254740993\"");
    }

    #[test]
    fn deserializes_from_string_or_number() {
        let from_str: TaskInstanceId = serde_json::from_str("\"17\"").expect("string");
        let from_num: TaskInstanceId = serde_json::from_str("17").expect("number");
        assert_eq!(from_str, from_num);
        assert!(serde_json::from_str::<TaskInstanceId>("-1").is_err());
    }

    #[test]
    fn i64_conversion() {
        let id = WorkflowDefinitionId::new(123);
        assert_eq!(
            WorkflowDefinitionId::from_i64(id.as_i64()).expect("convert"),
            id
        );
        assert!(WorkflowDefinitionId::from_i64(-5).is_err());
    }

    #[test]
    fn ids_order_by_value() {
        let mut ids = vec![TaskInstanceId::new(3), TaskInstanceId::new(1)];
        ids.sort();
        assert_eq!(ids, vec![TaskInstanceId::new(1), TaskInstanceId::new(3)]);
    }
}
