//! Post-run reconciliation of client-observed outcomes against the store.
//!
//! Ambiguous attempts may or may not have committed, so the store's count is
//! checked against a range rather than an exact value:
//!
//! ```text
//! bought <= units_sold <= bought + ambiguous_at_condition + ambiguous_at_secondary
//! ```
//!
//! The range is checked against the count summed over the run's items; capacity
//! is checked item by item. The accounting check holds for every strategy. The
//! range and capacity checks only hold for strategies guarded by a conditional
//! write.

use crate::report::{RunAggregate, RunReport};
use thiserror::Error;
use vouchers_core::ids::ItemName;

/// One broken invariant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    /// Some attempts were not counted in any outcome.
    #[error("Counted {counted} attempts, expected {expected}")]
    LostAttempts {
        /// Attempts the run was configured to make
        expected: u64,
        /// Attempts present in the aggregate
        counted: u64,
    },

    /// The store recorded fewer units than clients saw confirmed.
    #[error("Store recorded {units_sold} units but {bought} sales were confirmed")]
    BelowConfirmed {
        /// Confirmed sales
        bought: u64,
        /// Units recorded by the store
        units_sold: u64,
    },

    /// The store recorded more units than could possibly have been sold.
    #[error("Store recorded {units_sold} units but at most {upper_bound} could have sold")]
    AboveUpperBound {
        /// Confirmed plus ambiguous sales
        upper_bound: u64,
        /// Units recorded by the store
        units_sold: u64,
    },

    /// The store recorded more units of one item than its capacity.
    #[error("Store recorded {units_sold} units of {item} against a capacity of {capacity}")]
    Oversold {
        /// Item over capacity
        item: ItemName,
        /// Units the item may sell
        capacity: u32,
        /// Units of the item recorded by the store
        units_sold: u32,
    },
}

/// Every violation found in one run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{}", summarize(.0))]
pub struct Violations(pub Vec<Violation>);

fn summarize(violations: &[Violation]) -> String {
    let mut summary = format!("{} invariant violation(s)", violations.len());
    for violation in violations {
        summary.push_str("; ");
        summary.push_str(&violation.to_string());
    }
    summary
}

/// Every attempt lands in exactly one outcome.
///
/// # Errors
///
/// Returns `LostAttempts` if the four outcomes do not sum to `expected`.
pub const fn check_accounting(aggregate: &RunAggregate, expected: u64) -> Result<(), Violation> {
    let counted = aggregate.total_attempts();
    if counted == expected {
        Ok(())
    } else {
        Err(Violation::LostAttempts { expected, counted })
    }
}

/// The store's count lies between the confirmed and the possible sales.
///
/// # Errors
///
/// Returns `BelowConfirmed` or `AboveUpperBound` when `units_sold` is outside
/// the range.
pub const fn check_reconciliation(
    aggregate: &RunAggregate,
    units_sold: u64,
) -> Result<(), Violation> {
    if units_sold < aggregate.bought {
        return Err(Violation::BelowConfirmed {
            bought: aggregate.bought,
            units_sold,
        });
    }
    let upper_bound = aggregate.upper_bound();
    if units_sold > upper_bound {
        return Err(Violation::AboveUpperBound {
            upper_bound,
            units_sold,
        });
    }
    Ok(())
}

/// The store never holds more units of an item than it can sell.
///
/// # Errors
///
/// Returns `Oversold` if `units_sold` exceeds `capacity`.
pub fn check_capacity(item: &ItemName, units_sold: u32, capacity: u32) -> Result<(), Violation> {
    if units_sold > capacity {
        Err(Violation::Oversold {
            item: item.clone(),
            capacity,
            units_sold,
        })
    } else {
        Ok(())
    }
}

/// Check a finished run against the store's final count of every item.
///
/// # Errors
///
/// Returns every violation found, not just the first.
pub fn verify(report: &RunReport, recorded: &[(ItemName, u32)]) -> Result<(), Violations> {
    let mut violations = Vec::new();
    let units_sold: u64 = recorded.iter().map(|(_, count)| u64::from(*count)).sum();

    if let Err(violation) = check_accounting(&report.aggregate, report.expected_attempts()) {
        violations.push(violation);
    }
    if report.strategy.is_conditional() {
        if let Err(violation) = check_reconciliation(&report.aggregate, units_sold) {
            violations.push(violation);
        }
        violations.extend(
            recorded
                .iter()
                .filter_map(|(item, count)| check_capacity(item, *count, report.capacity).err()),
        );
    }

    if violations.is_empty() {
        tracing::debug!(strategy = %report.strategy, units_sold, "Run verified");
        Ok(())
    } else {
        for violation in &violations {
            tracing::warn!(strategy = %report.strategy, %violation, "Invariant violated");
        }
        Err(Violations(violations))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::load::{ContentionMode, WorkloadConfig};
    use crate::report::LatencySummary;
    use crate::strategy::Strategy as SellStrategy;
    use proptest::prelude::*;

    fn report(strategy: SellStrategy, aggregate: RunAggregate) -> RunReport {
        report_for(
            WorkloadConfig {
                strategy,
                ..WorkloadConfig::default()
            },
            aggregate,
        )
    }

    fn report_for(config: WorkloadConfig, aggregate: RunAggregate) -> RunReport {
        RunReport {
            strategy: config.strategy,
            contention: config.contention,
            actors: config.actors,
            attempts_per_actor: config.attempts_per_actor,
            capacity: config.capacity,
            items: config.item_names(),
            aggregate,
            per_actor: Vec::new(),
            latency: LatencySummary::default(),
            elapsed_ms: 0,
        }
    }

    fn recorded(units_sold: u32) -> Vec<(ItemName, u32)> {
        vec![(ItemName::new("free tv"), units_sold)]
    }

    fn fault_free(bought: u64) -> RunAggregate {
        RunAggregate {
            bought,
            rejected: 1_000 - bought,
            ..RunAggregate::default()
        }
    }

    #[test]
    fn fault_free_cas_run_verifies() {
        let report = report(SellStrategy::SingleCas, fault_free(3));
        assert_eq!(verify(&report, &recorded(3)), Ok(()));
    }

    #[test]
    fn missing_attempts_are_reported() {
        let aggregate = RunAggregate {
            bought: 3,
            rejected: 990,
            ..RunAggregate::default()
        };
        let report = report(SellStrategy::SingleCas, aggregate);

        let violations = verify(&report, &recorded(3)).unwrap_err();
        assert_eq!(
            violations.0,
            vec![Violation::LostAttempts {
                expected: 1_000,
                counted: 993,
            }]
        );
    }

    #[test]
    fn unprotected_run_skips_store_bounds() {
        let report = report(SellStrategy::Unprotected, fault_free(1_000));
        assert_eq!(verify(&report, &recorded(17)), Ok(()));
    }

    #[test]
    fn every_violation_is_collected() {
        let report = report(SellStrategy::AuditedBatch, fault_free(3));

        let violations = verify(&report, &recorded(5)).unwrap_err();
        assert_eq!(
            violations.0,
            vec![
                Violation::AboveUpperBound {
                    upper_bound: 3,
                    units_sold: 5,
                },
                Violation::Oversold {
                    item: ItemName::new("free tv"),
                    capacity: 3,
                    units_sold: 5,
                },
            ]
        );
        assert!(violations.to_string().starts_with("2 invariant violation(s)"));
    }

    #[test]
    fn ambiguous_attempts_widen_the_range() {
        let aggregate = RunAggregate {
            bought: 1,
            rejected: 996,
            ambiguous_at_condition: 2,
            ambiguous_at_secondary: 1,
            ..RunAggregate::default()
        };
        let report = report(SellStrategy::AuditedBatch, aggregate);

        assert_eq!(verify(&report, &recorded(1)), Ok(()));
        assert_eq!(verify(&report, &recorded(3)), Ok(()));
        assert!(verify(&report, &recorded(0)).is_err());
    }

    #[test]
    fn capacity_is_checked_per_item() {
        let config = WorkloadConfig {
            actors: 2,
            attempts_per_actor: 5,
            contention: ContentionMode::Disjoint,
            ..WorkloadConfig::default()
        };
        let report = report_for(
            config,
            RunAggregate {
                bought: 6,
                rejected: 4,
                ..RunAggregate::default()
            },
        );
        let counts = vec![
            (ItemName::new("free tv 0"), 4),
            (ItemName::new("free tv 1"), 2),
        ];

        let violations = verify(&report, &counts).unwrap_err();
        assert_eq!(
            violations.0,
            vec![Violation::Oversold {
                item: ItemName::new("free tv 0"),
                capacity: 3,
                units_sold: 4,
            }]
        );

        let within = vec![
            (ItemName::new("free tv 0"), 3),
            (ItemName::new("free tv 1"), 3),
        ];
        assert_eq!(verify(&report, &within), Ok(()));
    }

    proptest! {
        #[test]
        fn reconciliation_accepts_exactly_the_range(
            bought in 0u64..50,
            ambiguous in 0u64..50,
            units_sold in 0u64..150,
        ) {
            let aggregate = RunAggregate {
                bought,
                ambiguous_at_condition: ambiguous,
                ..RunAggregate::default()
            };
            let in_range = bought <= units_sold && units_sold <= bought + ambiguous;
            prop_assert_eq!(check_reconciliation(&aggregate, units_sold).is_ok(), in_range);
        }

        #[test]
        fn accounting_holds_for_any_split(
            bought in 0u64..500,
            rejected in 0u64..500,
            at_condition in 0u64..500,
            at_secondary in 0u64..500,
        ) {
            let aggregate = RunAggregate {
                bought,
                rejected,
                contended: rejected / 2,
                ambiguous_at_condition: at_condition,
                ambiguous_at_secondary: at_secondary,
            };
            let total = bought + rejected + at_condition + at_secondary;
            prop_assert!(check_accounting(&aggregate, total).is_ok());
            prop_assert!(check_accounting(&aggregate, total + 1).is_err());
        }
    }
}
