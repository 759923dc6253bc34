//! Magnitude-safe integration of the joint (p, g) system.
//!
//! The g components shrink by orders of magnitude per edge, so before each
//! solver call the state is passed through the scaled representation: all g
//! values are shifted by a common decimal factor so the largest lands near
//! 1, the solver runs on plain doubles, and the factor is re-applied
//! afterwards. Long spans are bisected before solving — one solver call
//! never covers more than a sixth of the process duration, which keeps the
//! adaptive stepper out of the divergence regime on stiff stretches.

use bdm_math::ScaledNumber;

use crate::error::{Error, Result};
use crate::ode::solver::{self, StepControl};
use crate::ode::{EdgeState, JointOde};
use crate::PRECISION_THRESHOLD;

/// Floor for the magnitude-adapted absolute tolerance of a g component.
const ATOL_FLOOR: f64 = 1e-310;

/// An [`EdgeState`] flattened to raw doubles plus the decimal shift that
/// was taken out of the g components.
#[derive(Debug, Clone)]
pub struct ScaledState {
    raw: Vec<f64>,
    factor: i32,
}

impl ScaledState {
    /// Normalize a state: shift all g components so the largest magnitude
    /// sits near 10^0. g values more than ~600 orders below the largest
    /// underflow to zero here, which the addition threshold has already
    /// rendered negligible.
    pub fn scale(state: &EdgeState) -> Self {
        let n = state.n_types();
        let factor = state
            .g
            .iter()
            .filter(|g| !g.is_zero())
            .map(ScaledNumber::exponent)
            .max()
            .unwrap_or(0);
        let mut raw = Vec::with_capacity(2 * n);
        raw.extend_from_slice(&state.p);
        for g in &state.g {
            let mut shifted = *g;
            shifted.add_exponent(-factor);
            raw.push(shifted.revert());
        }
        Self { raw, factor }
    }

    /// Reconstruct the scaled-number state, re-applying the factor.
    ///
    /// A non-finite component means the solve diverged; that surfaces as a
    /// recoverable numerical error (the engine rejects the proposal).
    pub fn unscale(&self, n_types: usize) -> Result<EdgeState> {
        let (p_raw, g_raw) = self.raw.split_at(n_types);
        let mut state = EdgeState::zero(n_types);
        for (i, &v) in p_raw.iter().enumerate() {
            if !v.is_finite() {
                return Err(Error::NumericalInstability(format!(
                    "non-finite extinction probability for type {i}"
                )));
            }
            state.p[i] = v;
        }
        for (i, &v) in g_raw.iter().enumerate() {
            let mut g = ScaledNumber::new(v).map_err(|_| {
                Error::NumericalInstability(format!("non-finite density for type {i}"))
            })?;
            g.add_exponent(self.factor);
            state.g[i] = g;
        }
        Ok(state)
    }

    pub fn factor(&self) -> i32 {
        self.factor
    }
}

/// Joint-system integrator holding the numeric policy for one evaluation.
pub struct SafeIntegrator<'a> {
    sys: JointOde<'a>,
    origin: f64,
    atol: f64,
    ctl: StepControl,
}

impl<'a> SafeIntegrator<'a> {
    pub fn new(sys: JointOde<'a>, origin: f64, atol: f64, ctl: StepControl) -> Self {
        Self { sys, origin, atol, ctl }
    }

    /// Integrate from `to` (younger, larger t) back to `from` (older).
    ///
    /// Degenerate intervals pass through unchanged; spans longer than a
    /// sixth of the process duration are bisected, chaining the midpoint
    /// state (and its accumulated scale factor) between the halves.
    pub fn integrate(&self, to: f64, state: ScaledState, from: f64) -> Result<ScaledState> {
        if (from - to).abs() < PRECISION_THRESHOLD {
            return Ok(state);
        }

        if self.origin > 0.0 && (from - to).abs() > self.origin / 6.0 {
            let mid = from + (to - from) / 2.0;
            let half = self.integrate(to, state, mid)?;
            return self.integrate(mid, half, from);
        }

        let n = self.sys.n_types();
        let mut atol = vec![self.atol; 2 * n];
        for i in 0..n {
            let g = state.raw[n + i];
            if g > 0.0 {
                atol[n + i] = (g * self.atol).max(ATOL_FLOOR);
            }
        }

        let carried = state.factor;
        let mut raw = state.raw;
        solver::integrate(&self.sys, &mut raw, to, from, &atol, &self.ctl)?;

        // Re-normalize so the next chunk starts from magnitudes near 1.
        let edge = ScaledState { raw, factor: carried }.unscale(n)?;
        Ok(ScaledState::scale(&edge))
    }
}
