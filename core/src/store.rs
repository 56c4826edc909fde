//! Store client contract consumed by the voucher managers.
//!
//! The store is a replicated, eventually-consistent key/value store that offers a
//! linearizable conditional write (compare-and-swap) per partition. Managers see it
//! only through [`StoreClient`]: a point read, a conditional write reporting whether
//! its condition held, and an unconditional write.
//!
//! # Write ambiguity
//!
//! A coordinator that times out waiting for replica acknowledgement cannot say
//! whether the write took effect. The store reports this as
//! [`StoreError::WriteTimeout`], tagged with the [`WriteType`] that was in flight.
//! For conditional writes the tag distinguishes the compare-and-swap phase
//! ([`WriteType::Cas`]) from the phase applying the statement's unconditional
//! members ([`WriteType::Simple`]).
//!
//! # Example
//!
//! ```no_run
//! use vouchers_core::ids::ItemName;
//! use vouchers_core::store::{Consistency, Mutation, Statement, StoreClient, StoreError, Table};
//!
//! async fn bump<S: StoreClient>(store: &S, item: &ItemName) -> Result<bool, StoreError> {
//!     let Some(row) = store.read(Table::VouchersMutable, item.clone(), Consistency::LocalSerial).await? else {
//!         return Ok(false);
//!     };
//!
//!     let statement = Statement::Single(Mutation::SetUnitsSoldIf {
//!         table: Table::VouchersMutable,
//!         item: item.clone(),
//!         units_sold: row.units_sold + 1,
//!         expected: row.units_sold,
//!     });
//!
//!     store
//!         .execute_conditional(statement, Consistency::LocalQuorum, Consistency::LocalSerial)
//!         .await
//! }
//! ```

use crate::ids::{BuyerId, ItemName, SaleId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by [`StoreClient`] methods.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Replica acknowledgement level requested for a read or write.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    /// A single replica.
    One,
    /// A majority of all replicas.
    Quorum,
    /// A majority of replicas in the local datacenter.
    LocalQuorum,
    /// Every replica.
    All,
    /// Linearizable, across datacenters.
    Serial,
    /// Linearizable within the local datacenter.
    LocalSerial,
}

impl Consistency {
    /// Whether this level is valid as the serial level of a conditional write.
    #[must_use]
    pub const fn is_serial(self) -> bool {
        matches!(self, Self::Serial | Self::LocalSerial)
    }
}

impl fmt::Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::One => "ONE",
            Self::Quorum => "QUORUM",
            Self::LocalQuorum => "LOCAL_QUORUM",
            Self::All => "ALL",
            Self::Serial => "SERIAL",
            Self::LocalSerial => "LOCAL_SERIAL",
        };
        f.write_str(name)
    }
}

/// Statement phase the coordinator was waiting on when a write timed out.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteType {
    /// A plain (non-batched, or unconditional batch member) write.
    Simple,
    /// A logged batch.
    Batch,
    /// An unlogged batch.
    UnloggedBatch,
    /// A counter update.
    Counter,
    /// Writing the batch log itself.
    BatchLog,
    /// The compare-and-swap phase of a conditional write.
    Cas,
    /// A materialized view update.
    View,
    /// A change-data-capture write.
    Cdc,
}

impl fmt::Display for WriteType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Simple => "SIMPLE",
            Self::Batch => "BATCH",
            Self::UnloggedBatch => "UNLOGGED_BATCH",
            Self::Counter => "COUNTER",
            Self::BatchLog => "BATCH_LOG",
            Self::Cas => "CAS",
            Self::View => "VIEW",
            Self::Cdc => "CDC",
        };
        f.write_str(name)
    }
}

/// Logical tables the managers write to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    /// Partition per item: `units_sold` is a static (per-partition) column and each
    /// row is one recorded sale keyed by a store-assigned [`SaleId`].
    Vouchers,
    /// One row per item holding only `units_sold`.
    VouchersMutable,
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vouchers => f.write_str("vouchers"),
            Self::VouchersMutable => f.write_str("vouchers_mutable"),
        }
    }
}

/// One mutation of a single partition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    /// Create the item with the given count, only if it does not exist yet.
    InsertIfNotExists {
        /// Target table
        table: Table,
        /// Item to create
        item: ItemName,
        /// Initial units sold
        units_sold: u32,
    },
    /// Overwrite the count unconditionally (upsert).
    SetUnitsSold {
        /// Target table
        table: Table,
        /// Item to update
        item: ItemName,
        /// New units sold
        units_sold: u32,
    },
    /// Overwrite the count only if it currently equals `expected`.
    SetUnitsSoldIf {
        /// Target table
        table: Table,
        /// Item to update
        item: ItemName,
        /// New units sold
        units_sold: u32,
        /// Value the count must hold for the update to apply
        expected: u32,
    },
    /// Append a sale event to the item's audit trail. The store assigns its id.
    AppendSale {
        /// Item the sale belongs to (always in [`Table::Vouchers`])
        item: ItemName,
        /// Who bought the unit
        buyer: BuyerId,
    },
    /// Remove the whole partition. Deleting a missing item is a no-op.
    Delete {
        /// Target table
        table: Table,
        /// Item to delete
        item: ItemName,
    },
}

impl Mutation {
    /// Whether this mutation carries a condition.
    #[must_use]
    pub const fn is_conditional(&self) -> bool {
        matches!(self, Self::InsertIfNotExists { .. } | Self::SetUnitsSoldIf { .. })
    }

    /// The partition this mutation targets.
    #[must_use]
    pub const fn partition(&self) -> (Table, &ItemName) {
        match self {
            Self::InsertIfNotExists { table, item, .. }
            | Self::SetUnitsSold { table, item, .. }
            | Self::SetUnitsSoldIf { table, item, .. }
            | Self::Delete { table, item } => (*table, item),
            Self::AppendSale { item, .. } => (Table::Vouchers, item),
        }
    }
}

/// A statement submitted to the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Statement {
    /// A single mutation.
    Single(Mutation),
    /// An all-or-nothing (logged) batch.
    ///
    /// A batch carrying a condition must target a single partition; its
    /// unconditional members only apply if every condition holds.
    Batch(Vec<Mutation>),
}

impl Statement {
    /// The statement's mutations, in submission order.
    #[must_use]
    pub fn mutations(&self) -> &[Mutation] {
        match self {
            Self::Single(mutation) => std::slice::from_ref(mutation),
            Self::Batch(mutations) => mutations,
        }
    }

    /// Whether any member carries a condition.
    #[must_use]
    pub fn is_conditional(&self) -> bool {
        self.mutations().iter().any(Mutation::is_conditional)
    }

    /// Whether the statement mixes conditional and unconditional members.
    #[must_use]
    pub fn has_unconditional_member(&self) -> bool {
        self.mutations().iter().any(|m| !m.is_conditional())
    }
}

/// One recorded sale in an item's audit trail.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleEvent {
    /// Store-assigned, increasing id
    pub id: SaleId,
    /// Buyer recorded with the sale
    pub buyer: BuyerId,
}

/// Result of a point read of one item's count.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRow {
    /// Units sold so far
    pub units_sold: u32,
}

/// Errors reported by a store client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The coordinator timed out waiting for replicas. The write may or may not
    /// have been applied.
    #[error("Write timeout during {write_type} write at {consistency}")]
    WriteTimeout {
        /// Phase that was in flight
        write_type: WriteType,
        /// Consistency level of the timed-out phase
        consistency: Consistency,
    },

    /// The coordinator timed out waiting for a read.
    #[error("Read timeout at {consistency}")]
    ReadTimeout {
        /// Consistency level requested
        consistency: Consistency,
    },

    /// Not enough replicas alive to attempt the operation. Nothing was applied.
    #[error("Not enough replicas available for {consistency}")]
    Unavailable {
        /// Consistency level requested
        consistency: Consistency,
    },

    /// The statement was rejected before execution.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Connection to the store failed.
    #[error("Connection error: {0}")]
    Connection(String),
}

impl StoreError {
    /// Whether the outcome of the failed write is unknown.
    #[must_use]
    pub const fn is_ambiguous(&self) -> bool {
        matches!(self, Self::WriteTimeout { .. })
    }

    /// Whether the operation is known not to have taken effect and may be
    /// retried, provided it is idempotent.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::ReadTimeout { .. } | Self::Connection(_)
        )
    }
}

/// Narrow client contract of the replicated store.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so managers can hold an `Arc<dyn StoreClient>`.
pub trait StoreClient: Send + Sync {
    /// Point read of one item's count. The audit trail is not fetched.
    ///
    /// Returns `None` if the item does not exist.
    ///
    /// # Errors
    ///
    /// - `ReadTimeout` / `Unavailable` / `Connection` if the read could not be served
    fn read(
        &self,
        table: Table,
        item: ItemName,
        consistency: Consistency,
    ) -> StoreFuture<'_, Option<ItemRow>>;

    /// Read an item's audit trail from [`Table::Vouchers`], in id order.
    ///
    /// Returns `None` if the item does not exist.
    ///
    /// # Errors
    ///
    /// - `ReadTimeout` / `Unavailable` / `Connection` if the read could not be served
    fn read_sales(
        &self,
        item: ItemName,
        consistency: Consistency,
    ) -> StoreFuture<'_, Option<Vec<SaleEvent>>>;

    /// Submit a statement carrying at least one condition.
    ///
    /// Returns whether the condition held (and the statement was applied).
    ///
    /// # Errors
    ///
    /// - `WriteTimeout` tagged with the in-flight phase if the outcome is unknown
    /// - `InvalidQuery` if the statement carries no condition, spans partitions,
    ///   or `serial_consistency` is not a serial level
    /// - `Unavailable` / `Connection` if nothing was attempted
    fn execute_conditional(
        &self,
        statement: Statement,
        consistency: Consistency,
        serial_consistency: Consistency,
    ) -> StoreFuture<'_, bool>;

    /// Submit an unconditional statement.
    ///
    /// # Errors
    ///
    /// - `InvalidQuery` if the statement carries a condition
    /// - `WriteTimeout` / `Unavailable` / `Connection` on failure
    fn execute(&self, statement: Statement, consistency: Consistency) -> StoreFuture<'_, ()>;
}
