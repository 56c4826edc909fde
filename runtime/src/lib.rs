//! # Vouchers Runtime
//!
//! Consistency strategies, the concurrent load generator and the post-run
//! correctness checker.
//!
//! ## Core Components
//!
//! - **Strategies** ([`strategy`]): unprotected read-modify-write, a single
//!   compare-and-swap, and a compare-and-swap batched with an audit insert
//! - **Load generator** ([`load`]): `C` actors released together, `K` attempts
//!   each, tallies merged after every actor finishes
//! - **Checker** ([`checker`]): reconciles client-observed outcomes against the
//!   store's final count
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use vouchers_runtime::{LoadGenerator, WorkloadConfig, checker};
//! use vouchers_testing::InMemoryStore;
//!
//! let store = Arc::new(InMemoryStore::new());
//! let generator = LoadGenerator::new(store, WorkloadConfig::default())?;
//! generator.reset().await?;
//! generator.prepare().await?;
//! let report = generator.run().await?;
//! checker::verify(&report, &generator.recorded_units_sold_per_item().await?)?;
//! ```

/// Post-run invariant checks
pub mod checker;

/// Concurrent workload generator
pub mod load;

/// Prometheus metrics for observability
pub mod metrics;

/// Outcome counting and run reports
pub mod report;

/// Retry logic for idempotent setup
pub mod retry;

pub mod strategy;

pub use checker::{Violation, Violations, verify};
pub use load::{ContentionMode, LoadError, LoadGenerator, WorkloadConfig};
pub use report::{ActorTally, AttemptClass, LatencySummary, RunAggregate, RunReport};
pub use strategy::{AuditedVouchers, CasVouchers, DEFAULT_CAPACITY, Strategy, UnprotectedVouchers};
