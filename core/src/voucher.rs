//! Voucher manager contract and the sell-attempt outcome taxonomy.
//!
//! A voucher manager sells at most `capacity` units of a named item under
//! concurrent demand. Every sell attempt ends in exactly one of four ways:
//!
//! | Result | Meaning |
//! |---|---|
//! | `Ok(SellOutcome::Sold)` | The store confirmed the unit was sold |
//! | `Ok(SellOutcome::Rejected(_))` | The store confirmed nothing changed |
//! | `Err(SellError::AmbiguousAtCondition)` | Unknown whether the conditional phase committed |
//! | `Err(SellError::AmbiguousAtSecondary)` | The conditional phase committed; a coupled unconditional write's durability is unknown |
//!
//! Any other `SellError` is fatal for the run.

use crate::ids::{BuyerId, ItemName};
use crate::store::{StoreError, WriteType};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by [`VoucherManager`] methods.
pub type VoucherFuture<'a, T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send + 'a>>;

/// Why a sell attempt was rejected.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    /// The count read was already at capacity.
    SoldOut,
    /// Another writer changed the count between our read and our conditional
    /// write. The attempt is not retried.
    Contended,
}

/// Definitive outcome of a sell attempt.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SellOutcome {
    /// One unit was sold.
    Sold,
    /// Nothing changed.
    Rejected(Rejection),
}

impl SellOutcome {
    /// Whether a unit was sold.
    #[must_use]
    pub const fn is_sold(self) -> bool {
        matches!(self, Self::Sold)
    }
}

/// Which phase of a conditional write a timeout belongs to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum WritePhase {
    /// The compare-and-swap phase: unknown whether the condition passed.
    Condition,
    /// The unconditional phase after a committed compare-and-swap.
    Secondary,
    /// A tag the protocol does not expect from a conditional write.
    Unrecognized(WriteType),
}

impl WritePhase {
    /// Map the phase tag of a write timeout to the protocol phase.
    ///
    /// ```
    /// use vouchers_core::store::WriteType;
    /// use vouchers_core::voucher::WritePhase;
    ///
    /// assert_eq!(WritePhase::of(WriteType::Cas), WritePhase::Condition);
    /// assert_eq!(WritePhase::of(WriteType::Simple), WritePhase::Secondary);
    /// assert_eq!(WritePhase::of(WriteType::Batch), WritePhase::Unrecognized(WriteType::Batch));
    /// ```
    #[must_use]
    pub const fn of(write_type: WriteType) -> Self {
        match write_type {
            WriteType::Cas => Self::Condition,
            WriteType::Simple => Self::Secondary,
            other => Self::Unrecognized(other),
        }
    }
}

impl fmt::Display for WritePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Condition => f.write_str("condition"),
            Self::Secondary => f.write_str("secondary"),
            Self::Unrecognized(write_type) => write!(f, "unrecognized ({write_type})"),
        }
    }
}

/// Errors from voucher manager operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SellError {
    /// The conditional write timed out in its compare-and-swap phase. The unit may
    /// or may not have been sold.
    #[error("Sale of {item} is ambiguous: conditional write timed out")]
    AmbiguousAtCondition {
        /// Item being sold
        item: ItemName,
    },

    /// The count update committed but the coupled unconditional write timed out.
    #[error("Sale of {item} committed, but its audit write timed out")]
    AmbiguousAtSecondary {
        /// Item being sold
        item: ItemName,
    },

    /// The store reported a timeout phase the protocol does not recognize.
    ///
    /// This is a contract violation, never an ambiguous sale.
    #[error("Unexpected write type {write_type} while selling {item}")]
    UnexpectedPhaseTag {
        /// Item being sold
        item: ItemName,
        /// Tag reported by the store
        write_type: WriteType,
    },

    /// The item has not been created.
    #[error("Item not found: {0}")]
    ItemNotFound(ItemName),

    /// Any other store failure.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl SellError {
    /// Whether this is one of the two recoverable ambiguous outcomes.
    #[must_use]
    pub const fn is_ambiguous(&self) -> bool {
        matches!(
            self,
            Self::AmbiguousAtCondition { .. } | Self::AmbiguousAtSecondary { .. }
        )
    }

    /// Whether this error must abort the run.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !self.is_ambiguous()
    }

    /// Classify a write timeout of a conditional write.
    ///
    /// `secondary_expected` says whether the submitted statement had an
    /// unconditional phase at all; when it did not, a secondary tag is as
    /// unexpected as any other.
    #[must_use]
    pub fn from_write_timeout(
        item: ItemName,
        write_type: WriteType,
        secondary_expected: bool,
    ) -> Self {
        match WritePhase::of(write_type) {
            WritePhase::Condition => Self::AmbiguousAtCondition { item },
            WritePhase::Secondary if secondary_expected => Self::AmbiguousAtSecondary { item },
            WritePhase::Secondary | WritePhase::Unrecognized(_) => {
                Self::UnexpectedPhaseTag { item, write_type }
            }
        }
    }
}

/// The voucher manager contract, implemented by each consistency strategy.
///
/// # Thread Safety
///
/// One instance is shared by every actor of a run, so implementations must be
/// `Send + Sync` and keep no per-call mutable state.
pub trait VoucherManager: Send + Sync {
    /// Create the item with zero units sold.
    ///
    /// Returns `true` if the item did not exist yet. Calling it again on an
    /// existing item returns `false` and changes nothing.
    ///
    /// # Errors
    ///
    /// Returns `SellError::Store` if the store fails.
    fn create_item(&self, item: ItemName) -> VoucherFuture<'_, bool, SellError>;

    /// Attempt to sell one unit to `buyer`.
    ///
    /// # Errors
    ///
    /// - `AmbiguousAtCondition` / `AmbiguousAtSecondary` when the store cannot
    ///   confirm the outcome (recoverable: count it, do not retry)
    /// - `UnexpectedPhaseTag`, `ItemNotFound`, `Store` (fatal)
    fn sell_unit(&self, item: ItemName, buyer: BuyerId)
    -> VoucherFuture<'_, SellOutcome, SellError>;

    /// Current units sold, read at the strategy's strongest read level.
    ///
    /// # Errors
    ///
    /// Returns `ItemNotFound` if the item does not exist, `Store` if the read fails.
    fn units_sold(&self, item: ItemName) -> VoucherFuture<'_, u32, SellError>;

    /// Remove the item. Deleting a missing item is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `SellError::Store` if the store fails.
    fn delete_item(&self, item: ItemName) -> VoucherFuture<'_, (), SellError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item() -> ItemName {
        ItemName::new("free tv")
    }

    #[test]
    fn cas_timeout_is_ambiguous_at_condition() {
        let error = SellError::from_write_timeout(item(), WriteType::Cas, true);
        assert_eq!(error, SellError::AmbiguousAtCondition { item: item() });
        assert!(error.is_ambiguous());
    }

    #[test]
    fn simple_timeout_in_batch_is_ambiguous_at_secondary() {
        let error = SellError::from_write_timeout(item(), WriteType::Simple, true);
        assert_eq!(error, SellError::AmbiguousAtSecondary { item: item() });
        assert!(error.is_ambiguous());
    }

    #[test]
    fn simple_timeout_without_secondary_phase_is_fatal() {
        let error = SellError::from_write_timeout(item(), WriteType::Simple, false);
        assert!(matches!(
            error,
            SellError::UnexpectedPhaseTag {
                write_type: WriteType::Simple,
                ..
            }
        ));
        assert!(error.is_fatal());
    }

    #[test]
    fn other_tags_are_never_coerced_into_ambiguity() {
        for write_type in [
            WriteType::Batch,
            WriteType::UnloggedBatch,
            WriteType::Counter,
            WriteType::BatchLog,
            WriteType::View,
            WriteType::Cdc,
        ] {
            let error = SellError::from_write_timeout(item(), write_type, true);
            assert!(error.is_fatal(), "{write_type} must be fatal");
        }
    }

    #[test]
    fn store_errors_are_fatal() {
        let error = SellError::from(StoreError::Connection("refused".to_string()));
        assert!(error.is_fatal());
        assert!(!error.is_ambiguous());
    }

    #[test]
    fn outcome_serializes_as_snake_case() {
        let json = serde_json::to_string(&SellOutcome::Rejected(Rejection::SoldOut));
        assert_eq!(json.ok().as_deref(), Some(r#"{"rejected":"sold_out"}"#));
    }
}
