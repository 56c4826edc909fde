//! Read, then one compare-and-swap on the count.

use super::{SERIAL_CONSISTENCY, WRITE_CONSISTENCY, read_units_sold, submit_conditional_sale};
use std::sync::Arc;
use vouchers_core::ids::{BuyerId, ItemName};
use vouchers_core::store::{Mutation, Statement, StoreClient, Table};
use vouchers_core::voucher::{Rejection, SellError, SellOutcome, VoucherFuture, VoucherManager};

const TABLE: Table = Table::VouchersMutable;

/// Voucher manager guarding the count with a single conditional update.
///
/// The update is conditioned on the count still holding the value read, so at
/// most one of several concurrent sellers that read the same count succeeds.
/// The losers are rejected as contended, not retried.
pub struct CasVouchers {
    store: Arc<dyn StoreClient>,
    capacity: u32,
}

impl CasVouchers {
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
}

impl VoucherManager for CasVouchers {
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
        _buyer: BuyerId,
    ) -> VoucherFuture<'_, SellOutcome, SellError> {
        Box::pin(async move {
            let sold =
                read_units_sold(self.store.as_ref(), TABLE, &item, SERIAL_CONSISTENCY).await?;
            if sold >= self.capacity {
                return Ok(SellOutcome::Rejected(Rejection::SoldOut));
            }

            let statement = Statement::Single(Mutation::SetUnitsSoldIf {
                table: TABLE,
                item: item.clone(),
                units_sold: sold + 1,
                expected: sold,
            });
            submit_conditional_sale(self.store.as_ref(), item, statement, false).await
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
