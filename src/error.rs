//! Error taxonomy for the decision pipeline
//!
//! Admission rejections are not errors: the risk gate returns them as values.

use thiserror::Error;

/// Failure surfaced by a single signal producer. Always isolated to that producer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProducerError {
    #[error("missing input: {0}")]
    MissingInput(String),

    #[error("malformed signal: {0}")]
    Malformed(String),

    #[error("producer failed: {0}")]
    Failed(String),
}

/// Errors crossing component boundaries inside one cycle.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("producer {strategy} failed: {source}")]
    Producer {
        strategy: String,
        #[source]
        source: ProducerError,
    },

    #[error("producer {strategy} timed out after {timeout_ms}ms")]
    ProducerTimeout { strategy: String, timeout_ms: u64 },

    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),

    #[error("insufficient balance: requested ${requested:.2}, available ${available:.2}")]
    InsufficientBalance { requested: f64, available: f64 },

    #[error("exposure limit for {key}: ${existing:.2} open + ${requested:.2} requested > ${max:.2}")]
    ExposureLimit {
        key: String,
        existing: f64,
        requested: f64,
        max: f64,
    },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl PipelineError {
    /// Only invariant violations abort the current cycle.
    pub fn aborts_cycle(&self) -> bool {
        matches!(self, PipelineError::InvariantViolation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_invariant_violation_aborts() {
        assert!(PipelineError::InvariantViolation("equity".into()).aborts_cycle());
        assert!(!PipelineError::PersistenceUnavailable("disk".into()).aborts_cycle());
        assert!(!PipelineError::InsufficientBalance {
            requested: 10.0,
            available: 1.0
        }
        .aborts_cycle());
    }

    #[test]
    fn producer_error_message_names_strategy() {
        let err = PipelineError::Producer {
            strategy: "overreaction".into(),
            source: ProducerError::Failed("feed gap".into()),
        };
        assert_eq!(
            err.to_string(),
            "producer overreaction failed: producer failed: feed gap"
        );
    }
}
