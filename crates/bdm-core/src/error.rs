//! Error types for the likelihood engine.
//!
//! Three kinds of failure leave the engine, and an outer sampler treats them
//! differently:
//! - fatal configuration/structure errors (a malformed tree or rate table is
//!   a bug in the caller's setup, not a bad parameter proposal),
//! - recoverable numerical exhaustion (the solver ran out of its evaluation
//!   budget for this one proposal; the sampler usually rejects the proposal),
//! - model rejections, which are *not* errors: those return `Ok(-inf)` from
//!   the engine instead.

use thiserror::Error;

/// Result type alias for likelihood-engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for grouping and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Engine configuration and input-validation errors.
    Config,
    /// Tree-structure and type-assignment errors.
    Structure,
    /// Numerical integration errors.
    Numerics,
    /// Worker-pool errors.
    Concurrency,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Structure => write!(f, "structure"),
            ErrorCategory::Numerics => write!(f, "numerics"),
            ErrorCategory::Concurrency => write!(f, "concurrency"),
        }
    }
}

/// Unified error type for the likelihood engine.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid parameterization: {0}")]
    InvalidParameterization(String),

    #[error("invalid type frequencies: {0}")]
    InvalidFrequencies(String),

    // Structural errors
    #[error("malformed tree: {0}")]
    MalformedTree(String),

    #[error("type assignment failed for node {node}: {reason}")]
    TypeAssignment { node: usize, reason: String },

    // Numerical errors
    #[error("ODE evaluation budget of {budget} exceeded at t = {t}")]
    EvaluationBudgetExceeded { budget: usize, t: f64 },

    #[error("numerical instability: {0}")]
    NumericalInstability(String),

    // Concurrency errors
    #[error("worker pool unavailable: {0}")]
    WorkerPool(String),
}

impl Error {
    /// Returns the error category for grouping and filtering.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_)
            | Error::InvalidParameterization(_)
            | Error::InvalidFrequencies(_) => ErrorCategory::Config,

            Error::MalformedTree(_) | Error::TypeAssignment { .. } => ErrorCategory::Structure,

            Error::EvaluationBudgetExceeded { .. } | Error::NumericalInstability(_) => {
                ErrorCategory::Numerics
            }

            Error::WorkerPool(_) => ErrorCategory::Concurrency,
        }
    }

    /// Whether a caller can sensibly continue after this error.
    ///
    /// Numerical exhaustion is per-proposal: an outer sampler typically maps
    /// it to a rejected proposal (log-likelihood `-inf`) and moves on.
    /// Configuration and structure errors will fail identically on every
    /// retry until the caller fixes its inputs.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::EvaluationBudgetExceeded { .. } | Error::NumericalInstability(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories() {
        assert_eq!(
            Error::MalformedTree("x".into()).category(),
            ErrorCategory::Structure
        );
        assert_eq!(
            Error::EvaluationBudgetExceeded { budget: 10, t: 0.5 }.category(),
            ErrorCategory::Numerics
        );
        assert_eq!(
            Error::InvalidFrequencies("x".into()).category(),
            ErrorCategory::Config
        );
    }

    #[test]
    fn recoverability() {
        assert!(Error::EvaluationBudgetExceeded { budget: 10, t: 0.5 }.is_recoverable());
        assert!(Error::NumericalInstability("underflow".into()).is_recoverable());
        assert!(!Error::MalformedTree("single child".into()).is_recoverable());
        assert!(!Error::Config("bad tolerance".into()).is_recoverable());
    }
}
