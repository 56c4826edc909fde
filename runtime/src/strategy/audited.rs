//! Compare-and-swap on the count, batched with an audit-trail insert.
//!
//! The batch pairs one conditional statement (the count update) with one
//! unconditional statement (the sale event), so a write timeout can belong to
//! either phase:
//!
//! - `CAS`: unknown whether the condition passed, so unknown whether a unit sold
//! - `SIMPLE`: the count update committed; the sale event's durability is unknown
//!
//! Any other tag is a contract violation and fails the attempt fatally.

use super::{SERIAL_CONSISTENCY, WRITE_CONSISTENCY, read_units_sold, submit_conditional_sale};
use std::sync::Arc;
use vouchers_core::ids::{BuyerId, ItemName};
use vouchers_core::store::{Mutation, SaleEvent, Statement, StoreClient, Table};
use vouchers_core::voucher::{Rejection, SellError, SellOutcome, VoucherFuture, VoucherManager};

const TABLE: Table = Table::Vouchers;

/// Voucher manager recording every sale in the item's audit trail.
pub struct AuditedVouchers {
    store: Arc<dyn StoreClient>,
    capacity: u32,
}

impl AuditedVouchers {
    /// Create a manager over `store` selling at most `capacity` units per item.
    #[must_use]
    pub fn new(store: Arc<dyn StoreClient>, capacity: u32) -> Self {
        Self { store, capacity }
    }

    /// Units each item can sell.
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// The item's recorded sales, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `ItemNotFound` if the item does not exist, `Store` if the read fails.
    pub async fn sales(&self, item: ItemName) -> Result<Vec<SaleEvent>, SellError> {
        self.store
            .read_sales(item.clone(), SERIAL_CONSISTENCY)
            .await?
            .ok_or(SellError::ItemNotFound(item))
    }
}

impl VoucherManager for AuditedVouchers {
    fn create_item(&self, item: ItemName) -> VoucherFuture<'_, bool, SellError> {
        Box::pin(async move {
            let statement = Statement::Single(Mutation::InsertIfNotExists {
                table: TABLE,
                item,
                units_sold: 0,
            });
            Ok(self
                .store
                .execute_conditional(statement, WRITE_CONSISTENCY, SERIAL_CONSISTENCY)
                .await?)
        })
    }

    fn sell_unit(
        &self,
        item: ItemName,
        buyer: BuyerId,
    ) -> VoucherFuture<'_, SellOutcome, SellError> {
        Box::pin(async move {
            let sold =
                read_units_sold(self.store.as_ref(), TABLE, &item, SERIAL_CONSISTENCY).await?;
            if sold >= self.capacity {
                return Ok(SellOutcome::Rejected(Rejection::SoldOut));
            }

            let statement = Statement::Batch(vec![
                Mutation::SetUnitsSoldIf {
                    table: TABLE,
                    item: item.clone(),
                    units_sold: sold + 1,
                    expected: sold,
                },
                Mutation::AppendSale {
                    item: item.clone(),
                    buyer,
                },
            ]);
            submit_conditional_sale(self.store.as_ref(), item, statement, true).await
        })
    }

    fn units_sold(&self, item: ItemName) -> VoucherFuture<'_, u32, SellError> {
        Box::pin(async move {
            read_units_sold(self.store.as_ref(), TABLE, &item, SERIAL_CONSISTENCY).await
        })
    }

    fn delete_item(&self, item: ItemName) -> VoucherFuture<'_, (), SellError> {
        Box::pin(async move {
            let statement = Statement::Single(Mutation::Delete { table: TABLE, item });
            Ok(self.store.execute(statement, WRITE_CONSISTENCY).await?)
        })
    }
}
