//! Consistency strategies implementing [`VoucherManager`].
//!
//! | Strategy | Write | Race behavior |
//! |---|---|---|
//! | [`UnprotectedVouchers`] | plain read, plain write | lost updates, can oversell |
//! | [`CasVouchers`] | read, compare-and-swap on the count | at most one racer wins |
//! | [`AuditedVouchers`] | read, compare-and-swap batched with a sale event | as above, plus a second ambiguous phase |
//!
//! None of the strategies retries: a lost compare-and-swap race is reported as
//! [`Rejection::Contended`](vouchers_core::voucher::Rejection::Contended) and an
//! ambiguous write is reported as such, so a conditional write is never submitted
//! twice for one attempt.

mod audited;
mod cas;
mod unprotected;

pub use audited::AuditedVouchers;
pub use cas::CasVouchers;
pub use unprotected::UnprotectedVouchers;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use vouchers_core::ids::ItemName;
use vouchers_core::store::{Consistency, Statement, StoreClient, StoreError, Table};
use vouchers_core::voucher::{Rejection, SellError, SellOutcome, VoucherManager};

/// Units each item can sell unless configured otherwise.
pub const DEFAULT_CAPACITY: u32 = 3;

/// Error type for `Strategy` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown strategy: {0} (expected unprotected, single-cas or audited-batch)")]
pub struct ParseStrategyError(String);

/// Which consistency strategy a run uses. Chosen once per run.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Plain read then plain write.
    Unprotected,
    /// Read then a single compare-and-swap.
    #[default]
    SingleCas,
    /// Read then a compare-and-swap batched with an audit insert.
    AuditedBatch,
}

impl Strategy {
    /// Every strategy, weakest first.
    pub const ALL: [Self; 3] = [Self::Unprotected, Self::SingleCas, Self::AuditedBatch];

    /// Whether the strategy protects the count with a conditional write.
    #[must_use]
    pub const fn is_conditional(self) -> bool {
        !matches!(self, Self::Unprotected)
    }

    /// Stable name used in logs, metrics and configuration.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unprotected => "unprotected",
            Self::SingleCas => "single-cas",
            Self::AuditedBatch => "audited-batch",
        }
    }

    /// Build the manager for this strategy.
    ///
    /// `capacity` is ignored by [`Strategy::Unprotected`], which never checks it.
    #[must_use]
    pub fn manager(self, store: Arc<dyn StoreClient>, capacity: u32) -> Arc<dyn VoucherManager> {
        match self {
            Self::Unprotected => Arc::new(UnprotectedVouchers::new(store)),
            Self::SingleCas => Arc::new(CasVouchers::new(store, capacity)),
            Self::AuditedBatch => Arc::new(AuditedVouchers::new(store, capacity)),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = ParseStrategyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "unprotected" => Ok(Self::Unprotected),
            "single-cas" | "cas" => Ok(Self::SingleCas),
            "audited-batch" | "batch" => Ok(Self::AuditedBatch),
            other => Err(ParseStrategyError(other.to_string())),
        }
    }
}

/// Consistency of the plain writes of every strategy.
pub(crate) const WRITE_CONSISTENCY: Consistency = Consistency::LocalQuorum;
/// Serial consistency of every conditional write.
pub(crate) const SERIAL_CONSISTENCY: Consistency = Consistency::LocalSerial;

/// Read the count of `item`, failing if it does not exist.
pub(crate) async fn read_units_sold(
    store: &dyn StoreClient,
    table: Table,
    item: &ItemName,
    consistency: Consistency,
) -> Result<u32, SellError> {
    store
        .read(table, item.clone(), consistency)
        .await?
        .map(|row| row.units_sold)
        .ok_or_else(|| SellError::ItemNotFound(item.clone()))
}

/// Submit the conditional half of a sale and classify the result.
///
/// `secondary_expected` is true when `statement` carries an unconditional member,
/// which is the only case where a secondary-phase timeout is legitimate.
pub(crate) async fn submit_conditional_sale(
    store: &dyn StoreClient,
    item: ItemName,
    statement: Statement,
    secondary_expected: bool,
) -> Result<SellOutcome, SellError> {
    match store
        .execute_conditional(statement, WRITE_CONSISTENCY, SERIAL_CONSISTENCY)
        .await
    {
        Ok(true) => Ok(SellOutcome::Sold),
        Ok(false) => {
            tracing::trace!(item = %item, "Lost compare-and-swap race");
            Ok(SellOutcome::Rejected(Rejection::Contended))
        }
        Err(StoreError::WriteTimeout { write_type, .. }) => {
            let error = SellError::from_write_timeout(item, write_type, secondary_expected);
            if error.is_ambiguous() {
                tracing::debug!(%write_type, error = %error, "Ambiguous sale");
            } else {
                tracing::error!(%write_type, error = %error, "Unexpected write type on timeout");
            }
            Err(error)
        }
        Err(other) => Err(other.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_parses_names_and_aliases() {
        assert_eq!("unprotected".parse(), Ok(Strategy::Unprotected));
        assert_eq!("Single-CAS".parse(), Ok(Strategy::SingleCas));
        assert_eq!("batch".parse(), Ok(Strategy::AuditedBatch));
        assert!("paxos".parse::<Strategy>().is_err());
    }

    #[test]
    fn strategy_display_round_trips() {
        for strategy in Strategy::ALL {
            assert_eq!(strategy.to_string().parse(), Ok(strategy));
        }
    }

    #[test]
    fn only_unprotected_is_unconditional() {
        assert!(!Strategy::Unprotected.is_conditional());
        assert!(Strategy::SingleCas.is_conditional());
        assert!(Strategy::AuditedBatch.is_conditional());
    }
}
