//! Configuration management for the voucher bench.
//!
//! Loads run parameters and the fault plan from `VOUCHERS_*` environment
//! variables with defaults matching the reference workload.

use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use thiserror::Error;
use vouchers_core::ids::ItemName;
use vouchers_runtime::retry::RetryPolicy;
use vouchers_runtime::{ContentionMode, LoadError, Strategy, WorkloadConfig};
use vouchers_testing::{FaultPlan, FaultPlanError};

/// Errors from loading the bench configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A variable is set but cannot be parsed
    #[error("Invalid value {value:?} for {var}: {reason}")]
    Invalid {
        /// Variable name
        var: &'static str,
        /// Raw value
        value: String,
        /// Parse failure
        reason: String,
    },

    /// The workload parameters do not validate
    #[error(transparent)]
    Workload(#[from] LoadError),

    /// The fault plan does not validate
    #[error(transparent)]
    Faults(#[from] FaultPlanError),
}

/// Bench configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Strategies to run, in order
    pub strategies: Vec<Strategy>,
    /// Run parameters shared by every strategy
    pub workload: WorkloadConfig,
    /// Faults injected by the in-memory store
    pub faults: FaultPlan,
    /// Retries of idempotent setup on retryable store errors
    pub setup_retries: usize,
    /// Print Prometheus metrics after the runs
    pub metrics: bool,
}

impl BenchConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `Invalid` for a variable that does not parse, `Workload` or
    /// `Faults` if the resulting configuration does not validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// See [`BenchConfig::from_env`].
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let defaults = WorkloadConfig::default();
        let fault_defaults = FaultPlan::default();

        let strategies = match lookup("VOUCHERS_STRATEGIES") {
            Some(value) => parse_strategies(&value)?,
            None => Strategy::ALL.to_vec(),
        };

        let workload = WorkloadConfig {
            strategy: strategies.first().copied().unwrap_or_default(),
            actors: parse_var(&lookup, "VOUCHERS_ACTORS", defaults.actors)?,
            attempts_per_actor: parse_var(
                &lookup,
                "VOUCHERS_ATTEMPTS",
                defaults.attempts_per_actor,
            )?,
            capacity: parse_var(&lookup, "VOUCHERS_CAPACITY", defaults.capacity)?,
            contention: parse_var(&lookup, "VOUCHERS_CONTENTION", ContentionMode::default())?,
            item: lookup("VOUCHERS_ITEM").map_or(defaults.item, ItemName::from),
        };
        workload.validate()?;

        let faults = FaultPlan {
            cas_timeout_probability: parse_var(
                &lookup,
                "VOUCHERS_CAS_TIMEOUT_P",
                fault_defaults.cas_timeout_probability,
            )?,
            commit_on_cas_timeout_probability: parse_var(
                &lookup,
                "VOUCHERS_COMMIT_ON_TIMEOUT_P",
                fault_defaults.commit_on_cas_timeout_probability,
            )?,
            secondary_timeout_probability: parse_var(
                &lookup,
                "VOUCHERS_SECONDARY_TIMEOUT_P",
                fault_defaults.secondary_timeout_probability,
            )?,
            read_delay_ms: parse_var(
                &lookup,
                "VOUCHERS_READ_DELAY_MS",
                fault_defaults.read_delay_ms,
            )?,
            seed: parse_var(&lookup, "VOUCHERS_SEED", fault_defaults.seed)?,
        };
        faults.validate()?;

        Ok(Self {
            strategies,
            workload,
            faults,
            setup_retries: parse_var(
                &lookup,
                "VOUCHERS_SETUP_RETRIES",
                RetryPolicy::default().max_retries,
            )?,
            metrics: parse_var(&lookup, "VOUCHERS_METRICS", false)?,
        })
    }

    /// Workload for one strategy.
    #[must_use]
    pub fn workload_for(&self, strategy: Strategy) -> WorkloadConfig {
        WorkloadConfig {
            strategy,
            ..self.workload.clone()
        }
    }

    /// Retry policy for idempotent setup.
    #[must_use]
    pub const fn setup_policy(&self) -> RetryPolicy {
        RetryPolicy::builder().max_retries(self.setup_retries).build()
    }
}

fn parse_var<L, T>(lookup: &L, var: &'static str, default: T) -> Result<T, ConfigError>
where
    L: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

fn parse_strategies(value: &str) -> Result<Vec<Strategy>, ConfigError> {
    let strategies = value
        .split(',')
        .filter(|name| !name.trim().is_empty())
        .map(str::parse)
        .collect::<Result<Vec<Strategy>, _>>()
        .map_err(|e| ConfigError::Invalid {
            var: "VOUCHERS_STRATEGIES",
            value: value.to_string(),
            reason: e.to_string(),
        })?;

    if strategies.is_empty() {
        return Err(ConfigError::Invalid {
            var: "VOUCHERS_STRATEGIES",
            value: value.to_string(),
            reason: "no strategy named".to_string(),
        });
    }
    Ok(strategies)
}
