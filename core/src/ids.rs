//! Identifier types for items, buyers and recorded sales.
//!
//! `ItemName` and `BuyerId` are string newtypes: `new()` and `From` accept trusted
//! input as-is, `FromStr` validates external input (rejects empty strings).
//! `SaleId` is assigned by the store when a sale event is appended to an item's
//! audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when parsing an empty identifier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid {kind}: {reason}")]
pub struct ParseIdError {
    kind: &'static str,
    reason: String,
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            #[doc = concat!("Create a new `", stringify!($name), "` without validation.")]
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            #[doc = concat!("Get the ", $kind, " as a string slice.")]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            #[doc = concat!("Convert the ", $kind, " into its inner `String`.")]
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.trim().is_empty() {
                    return Err(ParseIdError {
                        kind: $kind,
                        reason: "cannot be empty".to_string(),
                    });
                }
                Ok(Self(s.to_string()))
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Unique name of a bounded-inventory item (the partition key).
    ///
    /// # Examples
    ///
    /// ```
    /// use vouchers_core::ids::ItemName;
    ///
    /// let item = ItemName::new("free tv");
    /// assert_eq!(item.as_str(), "free tv");
    /// assert!("".parse::<ItemName>().is_err());
    /// ```
    ItemName,
    "item name"
);

string_id!(
    /// Identity of the buyer attempting a sale.
    BuyerId,
    "buyer id"
);

/// Store-assigned identifier of a recorded sale event.
///
/// Ordered by `(timestamp, sequence)`. The store guarantees ids it hands out for
/// one item are strictly increasing, even when its clock stalls or steps back.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SaleId {
    timestamp: DateTime<Utc>,
    sequence: u64,
}

impl SaleId {
    /// Create a sale id from its parts.
    #[must_use]
    pub const fn new(timestamp: DateTime<Utc>, sequence: u64) -> Self {
        Self {
            timestamp,
            sequence,
        }
    }

    /// Time component of the id.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Store-wide sequence number breaking ties between equal timestamps.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl fmt::Display for SaleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.timestamp.timestamp_micros(), self.sequence)
    }
}
