//! Engine configuration.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Numeric and scheduling knobs for a [`crate::LikelihoodEngine`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Ceiling on right-hand-side evaluations per solver call before the
    /// evaluation fails with a recoverable error.
    pub max_evaluations: usize,
    /// Relative tolerance of the adaptive solver.
    pub relative_tolerance: f64,
    /// Baseline absolute tolerance of the adaptive solver. The safe
    /// integrator adapts this per g-component to the component's current
    /// magnitude.
    pub absolute_tolerance: f64,
    /// Evaluate eligible sibling subtrees on a worker pool.
    pub parallelize: bool,
    /// Minimal relative subtree weight (fraction of total tree weight) both
    /// children must carry before a birth node forks. With many cores a
    /// smaller value pays off; with 2-4 cores something around 1/5 to 1/8
    /// tends to be faster.
    pub parallelization_factor: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_evaluations: 1_000_000,
            relative_tolerance: 1e-7,
            absolute_tolerance: 1e-100,
            parallelize: true,
            parallelization_factor: 1.0 / 10.0,
        }
    }
}

impl EngineConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_evaluations == 0 {
            return Err(Error::Config("max_evaluations must be > 0".into()));
        }
        if !self.relative_tolerance.is_finite() || self.relative_tolerance <= 0.0 {
            return Err(Error::Config("relative_tolerance must be finite and > 0".into()));
        }
        if !self.absolute_tolerance.is_finite() || self.absolute_tolerance <= 0.0 {
            return Err(Error::Config("absolute_tolerance must be finite and > 0".into()));
        }
        if !self.parallelization_factor.is_finite()
            || self.parallelization_factor <= 0.0
            || self.parallelization_factor > 1.0
        {
            return Err(Error::Config(
                "parallelization_factor must be in (0, 1]".into(),
            ));
        }
        Ok(())
    }
}
