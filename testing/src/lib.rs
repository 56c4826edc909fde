//! # Vouchers Testing
//!
//! Testing utilities for the vouchers workspace.
//!
//! This crate provides:
//! - [`InMemoryStore`]: a linearizable, in-process implementation of the store
//!   client contract
//! - [`FaultPlan`] and [`ScriptedFault`]: write timeouts, unavailability and read
//!   delays injected at the store boundary
//! - Deterministic clocks
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use vouchers_testing::{FaultPlan, InMemoryStore};
//!
//! #[tokio::test]
//! async fn sells_under_timeouts() {
//!     let store = Arc::new(InMemoryStore::with_fault_plan(FaultPlan {
//!         cas_timeout_probability: 0.1,
//!         ..FaultPlan::default()
//!     }));
//!     // hand `store` to a voucher manager...
//! }
//! ```

mod faults;
mod in_memory_store;

pub use faults::{FaultPlan, FaultPlanError, ScriptedFault};
pub use in_memory_store::{InMemoryStore, StoreStats};

/// Mock implementations for testing.
pub mod mocks {
    use chrono::{DateTime, Utc};
    use vouchers_core::environment::Clock;

    pub use crate::in_memory_store::InMemoryStore;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use vouchers_testing::mocks::FixedClock;
    /// use vouchers_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2); // Always the same!
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }
}

pub use mocks::{FixedClock, test_clock};
