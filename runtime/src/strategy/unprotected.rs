//! Plain read-modify-write, the negative control.
//!
//! Two sellers that read the same count both write `count + 1`, so updates are
//! lost, and no capacity check guards the write: every attempt reports `Sold`.

use super::{SERIAL_CONSISTENCY, WRITE_CONSISTENCY, read_units_sold};
use std::sync::Arc;
use vouchers_core::ids::{BuyerId, ItemName};
use vouchers_core::store::{Mutation, Statement, StoreClient, Table};
use vouchers_core::voucher::{SellError, SellOutcome, VoucherFuture, VoucherManager};

const TABLE: Table = Table::VouchersMutable;

/// Voucher manager without any concurrency protection.
pub struct UnprotectedVouchers {
    store: Arc<dyn StoreClient>,
}

impl UnprotectedVouchers {
    /// Create a manager over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self { store }
    }
}

impl VoucherManager for UnprotectedVouchers {
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
            let sold = read_units_sold(self.store.as_ref(), TABLE, &item, WRITE_CONSISTENCY).await?;

            let statement = Statement::Single(Mutation::SetUnitsSold {
                table: TABLE,
                item,
                units_sold: sold.saturating_add(1),
            });
            self.store.execute(statement, WRITE_CONSISTENCY).await?;
            Ok(SellOutcome::Sold)
        })
    }

    fn units_sold(&self, item: ItemName) -> VoucherFuture<'_, u32, SellError> {
        Box::pin(async move {
            read_units_sold(self.store.as_ref(), TABLE, &item, WRITE_CONSISTENCY).await
        })
    }

    fn delete_item(&self, item: ItemName) -> VoucherFuture<'_, (), SellError> {
        Box::pin(async move {
            let statement = Statement::Single(Mutation::Delete { table: TABLE, item });
            Ok(self.store.execute(statement, WRITE_CONSISTENCY).await?)
        })
    }
}
