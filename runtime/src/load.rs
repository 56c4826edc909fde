//! Concurrent workload generator.
//!
//! A run spawns `C` actors that each attempt `K` sales against one shared
//! [`VoucherManager`]. All actors wait on a start barrier so contention begins
//! at a single instant; the orchestrator then drains the actors' join handles
//! and merges their private tallies once every actor has finished.
//!
//! The first fatal actor error aborts every remaining actor and fails the run.
//! Ambiguous outcomes are counted and never retried.

use crate::metrics::SellMetrics;
use crate::report::{ActorTally, AttemptClass, RunReport};
use crate::strategy::{DEFAULT_CAPACITY, Strategy};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::Barrier;
use tokio::task::JoinSet;
use vouchers_core::ids::{BuyerId, ItemName};
use vouchers_core::store::StoreClient;
use vouchers_core::voucher::{SellError, VoucherManager};

/// How actors are assigned to items.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentionMode {
    /// Every actor sells from the same item.
    #[default]
    Shared,
    /// Each actor sells from its own item.
    Disjoint,
}

impl fmt::Display for ContentionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => f.write_str("shared"),
            Self::Disjoint => f.write_str("disjoint"),
        }
    }
}

impl FromStr for ContentionMode {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "shared" => Ok(Self::Shared),
            "disjoint" => Ok(Self::Disjoint),
            other => Err(LoadError::InvalidConfig(format!(
                "unknown contention mode {other:?} (expected shared or disjoint)"
            ))),
        }
    }
}

/// Parameters of one run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Strategy under test
    pub strategy: Strategy,
    /// Number of concurrent actors (`C`)
    pub actors: usize,
    /// Sell attempts per actor (`K`)
    pub attempts_per_actor: usize,
    /// Units each item can sell
    pub capacity: u32,
    /// Shared or disjoint items
    pub contention: ContentionMode,
    /// Item name, or the prefix of per-actor item names in disjoint mode
    pub item: ItemName,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            actors: 10,
            attempts_per_actor: 100,
            capacity: DEFAULT_CAPACITY,
            contention: ContentionMode::default(),
            item: ItemName::new("free tv"),
        }
    }
}

impl WorkloadConfig {
    /// Check that the configuration describes a runnable workload.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if there are no actors, no attempts, or the item
    /// name is blank.
    pub fn validate(&self) -> Result<(), LoadError> {
        if self.actors == 0 {
            return Err(LoadError::InvalidConfig("actors must be at least 1".to_string()));
        }
        if self.attempts_per_actor == 0 {
            return Err(LoadError::InvalidConfig(
                "attempts_per_actor must be at least 1".to_string(),
            ));
        }
        if self.item.as_str().trim().is_empty() {
            return Err(LoadError::InvalidConfig("item name cannot be empty".to_string()));
        }
        Ok(())
    }

    /// Attempts the run makes in total (`C * K`).
    #[must_use]
    pub const fn total_attempts(&self) -> u64 {
        (self.actors as u64) * (self.attempts_per_actor as u64)
    }

    /// Every item the run sells from, without duplicates.
    #[must_use]
    pub fn item_names(&self) -> Vec<ItemName> {
        match self.contention {
            ContentionMode::Shared => vec![self.item.clone()],
            ContentionMode::Disjoint => (0..self.actors).map(|a| self.item_for_actor(a)).collect(),
        }
    }

    /// The item `actor` sells from.
    #[must_use]
    pub fn item_for_actor(&self, actor: usize) -> ItemName {
        match self.contention {
            ContentionMode::Shared => self.item.clone(),
            ContentionMode::Disjoint => ItemName::new(format!("{} {actor}", self.item)),
        }
    }
}

/// Errors from the workload generator.
#[derive(Error, Debug)]
pub enum LoadError {
    /// The workload configuration is not runnable
    #[error("Invalid workload configuration: {0}")]
    InvalidConfig(String),

    /// Creating or deleting the run's items failed
    #[error("Setup failed: {0}")]
    Setup(#[source] SellError),

    /// An actor hit a fatal error; the run was aborted
    #[error("Actor {actor} failed: {source}")]
    ActorFailed {
        /// Index of the failing actor
        actor: usize,
        /// The fatal sell error
        source: SellError,
    },

    /// An actor task panicked or was cancelled
    #[error("Actor task failed: {0}")]
    Join(String),

    /// Reading the recorded count after the run failed
    #[error("Query failed: {0}")]
    Query(#[source] SellError),
}

impl LoadError {
    /// Whether the failure is a setup store error that is safe to retry.
    ///
    /// Setup statements are idempotent, so an ambiguous timeout is as retryable
    /// as a transient error. Nothing else is.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Setup(SellError::Store(error)) if error.is_transient() || error.is_ambiguous()
        )
    }
}

/// Drives concurrent sell attempts against one manager.
pub struct LoadGenerator {
    manager: Arc<dyn VoucherManager>,
    config: WorkloadConfig,
}

impl LoadGenerator {
    /// Build a generator using the configured strategy over `store`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the configuration does not validate.
    pub fn new(store: Arc<dyn StoreClient>, config: WorkloadConfig) -> Result<Self, LoadError> {
        let manager = config.strategy.manager(store, config.capacity);
        Self::with_manager(manager, config)
    }

    /// Build a generator around an existing manager.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the configuration does not validate.
    pub fn with_manager(
        manager: Arc<dyn VoucherManager>,
        config: WorkloadConfig,
    ) -> Result<Self, LoadError> {
        config.validate()?;
        Ok(Self { manager, config })
    }

    /// The run parameters.
    #[must_use]
    pub const fn config(&self) -> &WorkloadConfig {
        &self.config
    }

    /// The manager under test.
    #[must_use]
    pub fn manager(&self) -> Arc<dyn VoucherManager> {
        Arc::clone(&self.manager)
    }

    /// Delete every item of the run. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns `Setup` if any delete fails.
    pub async fn reset(&self) -> Result<(), LoadError> {
        let deletes = self
            .config
            .item_names()
            .into_iter()
            .map(|item| self.manager.delete_item(item));
        try_join_all(deletes).await.map_err(LoadError::Setup)?;
        Ok(())
    }

    /// Create every item of the run. Idempotent.
    ///
    /// Returns how many items were newly created.
    ///
    /// # Errors
    ///
    /// Returns `Setup` if any create fails.
    pub async fn prepare(&self) -> Result<usize, LoadError> {
        let creates = self
            .config
            .item_names()
            .into_iter()
            .map(|item| self.manager.create_item(item));
        let created = try_join_all(creates).await.map_err(LoadError::Setup)?;
        let created = created.into_iter().filter(|created| *created).count();
        tracing::debug!(strategy = %self.config.strategy, created, "Prepared items");
        Ok(created)
    }

    /// Run `C` actors of `K` attempts each and report the outcome split.
    ///
    /// Items must already exist; see [`LoadGenerator::prepare`].
    ///
    /// # Errors
    ///
    /// Returns `ActorFailed` for the first fatal sell error, `Join` if an actor
    /// task panicked. Remaining actors are aborted in both cases.
    #[tracing::instrument(skip(self), name = "load_run", fields(strategy = %self.config.strategy))]
    pub async fn run(&self) -> Result<RunReport, LoadError> {
        let config = &self.config;
        let start = Arc::new(Barrier::new(config.actors));
        let mut actors = JoinSet::new();

        let began = Instant::now();
        for actor in 0..config.actors {
            actors.spawn(run_actor(
                actor,
                config.item_for_actor(actor),
                config.attempts_per_actor,
                config.strategy,
                Arc::clone(&self.manager),
                Arc::clone(&start),
            ));
        }

        let mut tallies = Vec::with_capacity(config.actors);
        while let Some(joined) = actors.join_next().await {
            match joined {
                Ok(Ok(tally)) => tallies.push(tally),
                Ok(Err(error)) => {
                    tracing::error!(error = %error, "Aborting run");
                    actors.abort_all();
                    return Err(error);
                }
                Err(error) => {
                    actors.abort_all();
                    return Err(LoadError::Join(error.to_string()));
                }
            }
        }

        let report = RunReport::from_tallies(config, tallies, began.elapsed());
        SellMetrics::record_run(&report);
        tracing::info!(
            contention = %config.contention,
            aggregate = %report.aggregate,
            elapsed_ms = report.elapsed_ms,
            "Run finished"
        );
        Ok(report)
    }

    /// The store's recorded count of every item of the run, in item order.
    ///
    /// # Errors
    ///
    /// Returns `Query` if any item is missing or a read fails.
    pub async fn recorded_units_sold_per_item(&self) -> Result<Vec<(ItemName, u32)>, LoadError> {
        let items = self.config.item_names();
        let reads = items.iter().map(|item| self.manager.units_sold(item.clone()));
        let counts = try_join_all(reads).await.map_err(LoadError::Query)?;
        Ok(items.into_iter().zip(counts).collect())
    }

    /// Sum of the store's recorded count over every item of the run.
    ///
    /// # Errors
    ///
    /// Returns `Query` if any item is missing or a read fails.
    pub async fn recorded_units_sold(&self) -> Result<u64, LoadError> {
        let counts = self.recorded_units_sold_per_item().await?;
        Ok(counts.into_iter().map(|(_, count)| u64::from(count)).sum())
    }
}

async fn run_actor(
    actor: usize,
    item: ItemName,
    attempts: usize,
    strategy: Strategy,
    manager: Arc<dyn VoucherManager>,
    start: Arc<Barrier>,
) -> Result<ActorTally, LoadError> {
    let buyer = BuyerId::new(format!("client {actor}"));
    let mut tally = ActorTally::new(actor, item.clone(), attempts);

    start.wait().await;
    tracing::debug!(actor, item = %item, "Starting");

    for _ in 0..attempts {
        let attempt_began = Instant::now();
        let result = manager.sell_unit(item.clone(), buyer.clone()).await;
        let latency = attempt_began.elapsed();

        let class = AttemptClass::classify(result).map_err(|source| {
            tracing::error!(actor, item = %item, error = %source, "Fatal sell error");
            LoadError::ActorFailed { actor, source }
        })?;
        SellMetrics::record_attempt(strategy, class, latency);
        tally.record(class, latency);
    }

    tracing::debug!(actor, item = %item, counts = %tally.counts, "Finished");
    Ok(tally)
}
