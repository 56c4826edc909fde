//! Voucher bench - runs each strategy under contention and reconciles it
//!
//! Every configured strategy gets a fresh in-memory store with the configured
//! fault plan. Each run prints one JSON report on stdout; the process exits
//! non-zero when a compare-and-swap strategy breaks an invariant.
//!
//! # Running
//!
//! ```bash
//! cargo run -p voucher-bench
//!
//! # Lost updates in the unprotected strategy
//! VOUCHERS_STRATEGIES=unprotected VOUCHERS_READ_DELAY_MS=1 cargo run -p voucher-bench
//!
//! # Ambiguous outcomes in the audited batch
//! VOUCHERS_STRATEGIES=audited-batch VOUCHERS_CAS_TIMEOUT_P=0.05 \
//!     VOUCHERS_SECONDARY_TIMEOUT_P=0.05 VOUCHERS_SETUP_RETRIES=5 cargo run -p voucher-bench
//! ```

mod config;

use anyhow::Context;
use config::BenchConfig;
use serde::Serialize;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vouchers_runtime::checker;
use vouchers_runtime::metrics::MetricsRecorder;
use vouchers_runtime::retry::retry_with_predicate;
use vouchers_runtime::{LoadError, LoadGenerator, RunReport, Strategy};
use vouchers_testing::InMemoryStore;

/// One strategy's report plus its reconciliation against the store.
#[derive(Serialize)]
struct StrategyResult {
    #[serde(flatten)]
    report: RunReport,
    units_sold: u64,
    oversold: bool,
    violations: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voucher_bench=info,vouchers_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = BenchConfig::from_env().context("Failed to load configuration")?;
    tracing::info!(
        strategies = ?config.strategies,
        actors = config.workload.actors,
        attempts = config.workload.attempts_per_actor,
        capacity = config.workload.capacity,
        contention = %config.workload.contention,
        "Starting voucher bench"
    );

    let recorder = if config.metrics {
        Some(MetricsRecorder::install()?)
    } else {
        None
    };

    let mut failed = false;
    for &strategy in &config.strategies {
        let result = run_strategy(&config, strategy)
            .await
            .with_context(|| format!("{strategy} run failed"))?;

        if strategy.is_conditional() && !result.violations.is_empty() {
            tracing::error!(%strategy, violations = ?result.violations, "Invariant violated");
            failed = true;
        }
        println!("{}", serde_json::to_string(&result)?);
    }

    if let Some(recorder) = recorder {
        println!("{}", recorder.render());
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

async fn run_strategy(config: &BenchConfig, strategy: Strategy) -> anyhow::Result<StrategyResult> {
    let store = Arc::new(InMemoryStore::with_fault_plan(config.faults.clone()));
    let generator = LoadGenerator::new(store, config.workload_for(strategy))?;
    let policy = config.setup_policy();

    retry_with_predicate("reset", &policy, || generator.reset(), LoadError::is_retryable).await?;
    let created =
        retry_with_predicate("prepare", &policy, || generator.prepare(), LoadError::is_retryable)
            .await?;
    tracing::debug!(%strategy, created, "Items ready");

    let report = generator.run().await?;
    let recorded = generator.recorded_units_sold_per_item().await?;
    let units_sold = recorded.iter().map(|(_, count)| u64::from(*count)).sum();

    let mut oversold = false;
    for (item, count) in &recorded {
        if checker::check_capacity(item, *count, report.capacity).is_err() {
            oversold = true;
            if !strategy.is_conditional() {
                tracing::warn!(
                    %strategy,
                    %item,
                    units_sold = *count,
                    capacity = report.capacity,
                    "Oversold"
                );
            }
        }
    }
    let violations = match checker::verify(&report, &recorded) {
        Ok(()) => Vec::new(),
        Err(violations) => violations.0.iter().map(ToString::to_string).collect(),
    };

    Ok(StrategyResult {
        report,
        units_sold,
        oversold,
        violations,
    })
}
