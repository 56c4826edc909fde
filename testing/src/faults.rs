//! Fault injection for the in-memory store.
//!
//! Faults happen at the store boundary only; managers under test are unchanged.
//! Two sources are supported:
//!
//! - [`FaultPlan`]: seeded random timeouts plus an optional artificial read delay
//! - [`ScriptedFault`]: an exact fault for the next conditional write, queued with
//!   [`InMemoryStore::push_fault`](crate::InMemoryStore::push_fault)

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use vouchers_core::store::WriteType;

/// Invalid fault plan.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Invalid fault plan: {field} must be a probability in [0, 1], got {value}")]
pub struct FaultPlanError {
    field: &'static str,
    value: f64,
}

/// Random fault configuration for [`InMemoryStore`](crate::InMemoryStore).
///
/// All probabilities are per conditional write.
///
/// # Examples
///
/// ```
/// use vouchers_testing::FaultPlan;
///
/// let plan = FaultPlan {
///     cas_timeout_probability: 0.05,
///     secondary_timeout_probability: 0.05,
///     ..FaultPlan::default()
/// };
/// assert!(plan.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultPlan {
    /// Probability that a conditional write times out in its CAS phase.
    pub cas_timeout_probability: f64,
    /// Probability that a CAS-phase timeout still committed (when the condition held).
    pub commit_on_cas_timeout_probability: f64,
    /// Probability that an applied conditional write with an unconditional member
    /// times out in its secondary phase.
    pub secondary_timeout_probability: f64,
    /// Delay added after every read returns its value, widening the window
    /// between a manager's read and its write.
    pub read_delay_ms: u64,
    /// Seed of the fault generator.
    pub seed: u64,
}

impl Default for FaultPlan {
    fn default() -> Self {
        Self {
            cas_timeout_probability: 0.0,
            commit_on_cas_timeout_probability: 0.5,
            secondary_timeout_probability: 0.0,
            read_delay_ms: 0,
            seed: 0,
        }
    }
}

impl FaultPlan {
    /// A plan that never injects anything.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// A plan that only delays reads.
    #[must_use]
    pub fn delayed_reads(delay: Duration) -> Self {
        Self {
            read_delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            ..Self::default()
        }
    }

    /// The configured read delay, if any.
    #[must_use]
    pub const fn read_delay(&self) -> Option<Duration> {
        if self.read_delay_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.read_delay_ms))
        }
    }

    /// Check that every probability lies in `[0, 1]`.
    ///
    /// # Errors
    ///
    /// Returns the first field holding an invalid probability.
    pub fn validate(&self) -> Result<(), FaultPlanError> {
        for (field, value) in [
            ("cas_timeout_probability", self.cas_timeout_probability),
            (
                "commit_on_cas_timeout_probability",
                self.commit_on_cas_timeout_probability,
            ),
            (
                "secondary_timeout_probability",
                self.secondary_timeout_probability,
            ),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(FaultPlanError { field, value });
            }
        }
        Ok(())
    }

    /// Copy of the plan with every probability forced into `[0, 1]` (NaN becomes 0).
    #[must_use]
    pub(crate) fn sanitized(&self) -> Self {
        let clamp = |p: f64| if p.is_nan() { 0.0 } else { p.clamp(0.0, 1.0) };
        Self {
            cas_timeout_probability: clamp(self.cas_timeout_probability),
            commit_on_cas_timeout_probability: clamp(self.commit_on_cas_timeout_probability),
            secondary_timeout_probability: clamp(self.secondary_timeout_probability),
            ..self.clone()
        }
    }
}

/// A fault applied to the next conditional write, ahead of any random fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFault {
    /// Report a write timeout with this phase tag.
    ///
    /// If `applied` is true and the statement's condition holds, the statement is
    /// applied before the timeout is reported. A [`WriteType::Simple`] tag on a
    /// batch whose condition fails is consumed and the write reports `Ok(false)`:
    /// the secondary phase is never reached.
    WriteTimeout {
        /// Phase tag to report
        write_type: WriteType,
        /// Whether the write takes effect anyway
        applied: bool,
    },
    /// Refuse the write; nothing is applied.
    Unavailable,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_plan_is_fault_free() {
        let plan = FaultPlan::default();
        assert!(plan.validate().is_ok());
        assert_eq!(plan.read_delay(), None);
        assert!(plan.cas_timeout_probability.abs() < f64::EPSILON);
    }

    #[test]
    fn out_of_range_probability_is_rejected() {
        let plan = FaultPlan {
            secondary_timeout_probability: 1.5,
            ..FaultPlan::default()
        };
        let error = plan.validate();
        assert!(error.is_err());
        assert!(
            error
                .err()
                .map(|e| e.to_string())
                .unwrap_or_default()
                .contains("secondary_timeout_probability")
        );
    }

    #[test]
    fn sanitized_clamps_and_zeroes_nan() {
        let plan = FaultPlan {
            cas_timeout_probability: f64::NAN,
            secondary_timeout_probability: 7.0,
            ..FaultPlan::default()
        }
        .sanitized();

        assert!(plan.cas_timeout_probability.abs() < f64::EPSILON);
        assert!((plan.secondary_timeout_probability - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn delayed_reads_plan() {
        let plan = FaultPlan::delayed_reads(Duration::from_millis(2));
        assert_eq!(plan.read_delay(), Some(Duration::from_millis(2)));
    }

    #[test]
    fn plan_deserializes_with_defaults() {
        let plan: FaultPlan =
            serde_json::from_str(r#"{"cas_timeout_probability":0.1}"#).unwrap();
        assert!((plan.cas_timeout_probability - 0.1).abs() < f64::EPSILON);
        assert!((plan.commit_on_cas_timeout_probability - 0.5).abs() < f64::EPSILON);
    }
}
