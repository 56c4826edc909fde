//! Outcome counting and run reports.
//!
//! Each actor owns an [`ActorTally`]; tallies are merged into a [`RunReport`]
//! only after every actor has finished.

use crate::load::{ContentionMode, WorkloadConfig};
use crate::strategy::Strategy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::time::Duration;
use vouchers_core::ids::ItemName;
use vouchers_core::voucher::{Rejection, SellError, SellOutcome};

/// Recoverable classification of one sell attempt.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum AttemptClass {
    /// A unit was sold.
    Sold,
    /// Rejected: the item was sold out.
    SoldOut,
    /// Rejected: lost a compare-and-swap race.
    Contended,
    /// Unknown whether the conditional phase committed.
    AmbiguousAtCondition,
    /// The conditional phase committed, the secondary phase is unknown.
    AmbiguousAtSecondary,
}

impl AttemptClass {
    /// Classify an attempt result, handing back the error if it is fatal.
    ///
    /// # Errors
    ///
    /// Returns the attempt's error unless it is one of the two ambiguous outcomes.
    pub fn classify(result: Result<SellOutcome, SellError>) -> Result<Self, SellError> {
        match result {
            Ok(SellOutcome::Sold) => Ok(Self::Sold),
            Ok(SellOutcome::Rejected(Rejection::SoldOut)) => Ok(Self::SoldOut),
            Ok(SellOutcome::Rejected(Rejection::Contended)) => Ok(Self::Contended),
            Err(SellError::AmbiguousAtCondition { .. }) => Ok(Self::AmbiguousAtCondition),
            Err(SellError::AmbiguousAtSecondary { .. }) => Ok(Self::AmbiguousAtSecondary),
            Err(fatal) => Err(fatal),
        }
    }

    /// Metric label for this class.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Sold => "sold",
            Self::SoldOut => "sold_out",
            Self::Contended => "contended",
            Self::AmbiguousAtCondition => "ambiguous_at_condition",
            Self::AmbiguousAtSecondary => "ambiguous_at_secondary",
        }
    }
}

/// Four-way outcome split of a set of attempts.
///
/// `contended` is the subset of `rejected` caused by lost races.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAggregate {
    /// Attempts confirmed sold
    pub bought: u64,
    /// Attempts confirmed to have changed nothing
    pub rejected: u64,
    /// Rejected attempts that lost a compare-and-swap race
    pub contended: u64,
    /// Attempts whose conditional phase outcome is unknown
    pub ambiguous_at_condition: u64,
    /// Attempts whose secondary phase outcome is unknown
    pub ambiguous_at_secondary: u64,
}

impl RunAggregate {
    /// Count one classified attempt.
    pub const fn record(&mut self, class: AttemptClass) {
        match class {
            AttemptClass::Sold => self.bought += 1,
            AttemptClass::SoldOut => self.rejected += 1,
            AttemptClass::Contended => {
                self.rejected += 1;
                self.contended += 1;
            }
            AttemptClass::AmbiguousAtCondition => self.ambiguous_at_condition += 1,
            AttemptClass::AmbiguousAtSecondary => self.ambiguous_at_secondary += 1,
        }
    }

    /// Attempts counted in any of the four outcomes.
    #[must_use]
    pub const fn total_attempts(&self) -> u64 {
        self.bought + self.rejected + self.ambiguous_at_condition + self.ambiguous_at_secondary
    }

    /// Attempts with an unknown outcome.
    #[must_use]
    pub const fn ambiguous(&self) -> u64 {
        self.ambiguous_at_condition + self.ambiguous_at_secondary
    }

    /// Most units the store can have recorded: confirmed plus possibly sold.
    #[must_use]
    pub const fn upper_bound(&self) -> u64 {
        self.bought + self.ambiguous()
    }
}

impl Add for RunAggregate {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self::Output {
        self += rhs;
        self
    }
}

impl AddAssign for RunAggregate {
    fn add_assign(&mut self, rhs: Self) {
        self.bought += rhs.bought;
        self.rejected += rhs.rejected;
        self.contended += rhs.contended;
        self.ambiguous_at_condition += rhs.ambiguous_at_condition;
        self.ambiguous_at_secondary += rhs.ambiguous_at_secondary;
    }
}

impl Sum for RunAggregate {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

impl fmt::Display for RunAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bought {} Failed {} (contended {}) Commit Failed {} Unknown {}",
            self.bought,
            self.rejected,
            self.contended,
            self.ambiguous_at_secondary,
            self.ambiguous_at_condition
        )
    }
}

/// Counts and latencies collected by one actor.
#[derive(Clone, Debug, Serialize)]
pub struct ActorTally {
    /// Actor index
    pub actor: usize,
    /// Item the actor sold from
    pub item: ItemName,
    /// The actor's outcome split
    pub counts: RunAggregate,
    #[serde(skip)]
    latencies: Vec<Duration>,
}

impl ActorTally {
    /// Empty tally for `actor` selling from `item`.
    #[must_use]
    pub fn new(actor: usize, item: ItemName, expected_attempts: usize) -> Self {
        Self {
            actor,
            item,
            counts: RunAggregate::default(),
            latencies: Vec::with_capacity(expected_attempts),
        }
    }

    /// Count one attempt and its latency.
    pub fn record(&mut self, class: AttemptClass, latency: Duration) {
        self.counts.record(class);
        self.latencies.push(latency);
    }

    /// Latencies recorded so far, in attempt order.
    #[must_use]
    pub fn latencies(&self) -> &[Duration] {
        &self.latencies
    }
}

/// Summary of a latency distribution, in microseconds.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatencySummary {
    /// Number of samples
    pub count: u64,
    /// Fastest sample
    pub min_us: u64,
    /// Arithmetic mean
    pub mean_us: u64,
    /// Median (nearest rank)
    pub p50_us: u64,
    /// 90th percentile (nearest rank)
    pub p90_us: u64,
    /// 99th percentile (nearest rank)
    pub p99_us: u64,
    /// Slowest sample
    pub max_us: u64,
}

impl LatencySummary {
    /// Summarize `samples`. An empty input yields all zeros.
    #[must_use]
    pub fn from_samples(mut samples: Vec<Duration>) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_unstable();

        let micros = |d: Duration| u64::try_from(d.as_micros()).unwrap_or(u64::MAX);
        let rank = |percentile: usize| {
            let index = (percentile * samples.len()).div_ceil(100).saturating_sub(1);
            micros(samples[index.min(samples.len() - 1)])
        };
        let total: Duration = samples.iter().sum();
        let count = samples.len() as u64;

        Self {
            count,
            min_us: micros(samples[0]),
            mean_us: micros(total) / count,
            p50_us: rank(50),
            p90_us: rank(90),
            p99_us: rank(99),
            max_us: micros(samples[samples.len() - 1]),
        }
    }
}

/// Result of one run of the load generator.
#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    /// Strategy under test
    pub strategy: Strategy,
    /// Shared or disjoint items
    pub contention: ContentionMode,
    /// Number of concurrent actors
    pub actors: usize,
    /// Sell attempts per actor
    pub attempts_per_actor: usize,
    /// Units each item can sell
    pub capacity: u32,
    /// Items sold from during the run
    pub items: Vec<ItemName>,
    /// Outcome split summed over all actors
    pub aggregate: RunAggregate,
    /// Per-actor outcome splits, by actor index
    pub per_actor: Vec<ActorTally>,
    /// Latency of every attempt, across actors
    pub latency: LatencySummary,
    /// Wall-clock duration of the run, in milliseconds
    pub elapsed_ms: u64,
}

impl RunReport {
    /// Merge finished actor tallies into a report.
    #[must_use]
    pub fn from_tallies(
        config: &WorkloadConfig,
        mut tallies: Vec<ActorTally>,
        elapsed: Duration,
    ) -> Self {
        tallies.sort_by_key(|tally| tally.actor);
        let aggregate = tallies.iter().map(|tally| tally.counts).sum();
        let samples = tallies
            .iter()
            .flat_map(|tally| tally.latencies.iter().copied())
            .collect();

        Self {
            strategy: config.strategy,
            contention: config.contention,
            actors: config.actors,
            attempts_per_actor: config.attempts_per_actor,
            capacity: config.capacity,
            items: config.item_names(),
            aggregate,
            per_actor: tallies,
            latency: LatencySummary::from_samples(samples),
            elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Number of attempts the run was configured to make (`C * K`).
    #[must_use]
    pub const fn expected_attempts(&self) -> u64 {
        (self.actors as u64) * (self.attempts_per_actor as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vouchers_core::store::StoreError;

    fn millis(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_millis).collect()
    }

    #[test]
    fn classify_maps_every_recoverable_result() {
        let item = ItemName::new("free tv");
        assert_eq!(
            AttemptClass::classify(Ok(SellOutcome::Sold)),
            Ok(AttemptClass::Sold)
        );
        assert_eq!(
            AttemptClass::classify(Ok(SellOutcome::Rejected(Rejection::Contended))),
            Ok(AttemptClass::Contended)
        );
        assert_eq!(
            AttemptClass::classify(Err(SellError::AmbiguousAtSecondary { item: item.clone() })),
            Ok(AttemptClass::AmbiguousAtSecondary)
        );
        assert_eq!(
            AttemptClass::classify(Err(SellError::ItemNotFound(item.clone()))),
            Err(SellError::ItemNotFound(item))
        );
        assert!(
            AttemptClass::classify(Err(SellError::Store(StoreError::Connection(
                "reset".to_string()
            ))))
            .is_err()
        );
    }

    #[test]
    fn contended_counts_as_rejected() {
        let mut aggregate = RunAggregate::default();
        aggregate.record(AttemptClass::Contended);
        aggregate.record(AttemptClass::SoldOut);
        aggregate.record(AttemptClass::Sold);
        aggregate.record(AttemptClass::AmbiguousAtCondition);

        assert_eq!(aggregate.rejected, 2);
        assert_eq!(aggregate.contended, 1);
        assert_eq!(aggregate.total_attempts(), 4);
        assert_eq!(aggregate.upper_bound(), 2);
    }

    #[test]
    fn aggregates_sum_field_by_field() {
        let a = RunAggregate {
            bought: 1,
            rejected: 2,
            contended: 1,
            ambiguous_at_condition: 3,
            ambiguous_at_secondary: 0,
        };
        let b = RunAggregate {
            bought: 2,
            ambiguous_at_secondary: 4,
            ..RunAggregate::default()
        };

        let total: RunAggregate = [a, b].into_iter().sum();
        assert_eq!(total.bought, 3);
        assert_eq!(total.ambiguous(), 7);
        assert_eq!(total.total_attempts(), 12);
    }

    #[test]
    fn latency_summary_uses_nearest_rank() {
        let samples = millis(&(1..=100).collect::<Vec<_>>());
        let summary = LatencySummary::from_samples(samples);

        assert_eq!(summary.count, 100);
        assert_eq!(summary.min_us, 1_000);
        assert_eq!(summary.p50_us, 50_000);
        assert_eq!(summary.p90_us, 90_000);
        assert_eq!(summary.p99_us, 99_000);
        assert_eq!(summary.max_us, 100_000);
        assert_eq!(summary.mean_us, 50_500);
    }

    #[test]
    fn latency_summary_of_single_sample() {
        let summary = LatencySummary::from_samples(millis(&[7]));
        assert_eq!(summary.p50_us, 7_000);
        assert_eq!(summary.p99_us, 7_000);
    }

    #[test]
    fn empty_latency_summary_is_zero() {
        assert_eq!(LatencySummary::from_samples(Vec::new()), LatencySummary::default());
    }

    #[test]
    fn report_merges_tallies_in_actor_order() {
        let config = WorkloadConfig {
            actors: 2,
            attempts_per_actor: 2,
            ..WorkloadConfig::default()
        };
        let mut second = ActorTally::new(1, ItemName::new("free tv"), 2);
        second.record(AttemptClass::Sold, Duration::from_millis(3));
        second.record(AttemptClass::SoldOut, Duration::from_millis(1));
        let mut first = ActorTally::new(0, ItemName::new("free tv"), 2);
        first.record(AttemptClass::Contended, Duration::from_millis(2));
        first.record(AttemptClass::SoldOut, Duration::from_millis(2));

        let report = RunReport::from_tallies(&config, vec![second, first], Duration::from_secs(1));

        assert_eq!(report.per_actor[0].actor, 0);
        assert_eq!(report.aggregate.bought, 1);
        assert_eq!(report.aggregate.rejected, 3);
        assert_eq!(report.expected_attempts(), 4);
        assert_eq!(report.latency.count, 4);
        assert_eq!(report.items, vec![ItemName::new("free tv")]);
        assert_eq!(report.elapsed_ms, 1_000);
    }
}
