//! # Vouchers Core
//!
//! Contract and error types for selling a bounded number of units of a named item
//! against a replicated store that offers a linearizable compare-and-swap.
//!
//! ## Core Concepts
//!
//! - **Store client** ([`store::StoreClient`]): point reads, conditional writes that
//!   report whether they applied, and plain writes. A write timeout carries the
//!   phase that was in flight.
//! - **Voucher manager** ([`voucher::VoucherManager`]): create an item, sell one
//!   unit, query units sold, delete an item. Implemented by several consistency
//!   strategies in `vouchers-runtime`.
//! - **Outcome taxonomy** ([`voucher::SellOutcome`], [`voucher::SellError`]): sold,
//!   rejected, ambiguous at the conditional phase, ambiguous at the secondary
//!   phase, or fatal.
//!
//! ## Example
//!
//! ```ignore
//! use vouchers_core::ids::{BuyerId, ItemName};
//! use vouchers_core::voucher::{SellError, SellOutcome, VoucherManager};
//!
//! async fn buy(manager: &dyn VoucherManager) -> Result<(), SellError> {
//!     match manager.sell_unit(ItemName::new("free tv"), BuyerId::new("client 0")).await {
//!         Ok(SellOutcome::Sold) => println!("sold"),
//!         Ok(SellOutcome::Rejected(reason)) => println!("rejected: {reason:?}"),
//!         Err(e) if e.is_ambiguous() => println!("unknown: {e}"),
//!         Err(e) => return Err(e),
//!     }
//!     Ok(())
//! }
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

pub mod ids;
pub mod store;
pub mod voucher;

/// Environment module - Dependency injection traits
///
/// External dependencies the store or the managers need are abstracted behind
/// traits so tests can swap in deterministic implementations.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use vouchers_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let earlier = clock.now();
    /// assert!(clock.now() >= earlier);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

pub use ids::{BuyerId, ItemName, SaleId};
pub use store::{
    Consistency, ItemRow, Mutation, SaleEvent, Statement, StoreClient, StoreError, Table,
    WriteType,
};
pub use voucher::{Rejection, SellError, SellOutcome, VoucherManager, WritePhase};
