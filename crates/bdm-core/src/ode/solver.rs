//! Embedded Dormand–Prince 5(4) solver with adaptive step control.
//!
//! Integrates `dy/dt = f(t, y)` in either time direction (the likelihood
//! recursion always runs toward the root, i.e. with t decreasing). Error
//! control is per-component: `scale_i = atol_i + rtol · max(|y_i|, |y'_i|)`,
//! with the absolute tolerances supplied by the caller so the safe
//! integrator can adapt them to each density component's magnitude.
//!
//! The total number of right-hand-side evaluations is bounded; exhausting
//! the budget is a recoverable error, not a panic, so one bad parameter
//! proposal cannot take the whole sampler down.

use crate::error::{Error, Result};
use crate::ode::OdeSystem;

/// Step bounds and budgets for one integration.
#[derive(Debug, Clone)]
pub struct StepControl {
    /// Relative tolerance.
    pub rtol: f64,
    /// Smallest permitted step magnitude.
    pub h_min: f64,
    /// Largest permitted step magnitude.
    pub h_max: f64,
    /// Ceiling on right-hand-side evaluations.
    pub max_evaluations: usize,
}

impl StepControl {
    /// Step bounds scaled to a process of the given total duration, with
    /// tolerances and budget from the engine configuration.
    pub fn for_process(origin: f64, rtol: f64, max_evaluations: usize) -> Self {
        Self {
            rtol,
            h_min: origin * 1e-100,
            h_max: origin / 10.0,
            max_evaluations,
        }
    }
}

// Dormand–Prince coefficients.
const A21: f64 = 1.0 / 5.0;
const A31: f64 = 3.0 / 40.0;
const A32: f64 = 9.0 / 40.0;
const A41: f64 = 44.0 / 45.0;
const A42: f64 = -56.0 / 15.0;
const A43: f64 = 32.0 / 9.0;
const A51: f64 = 19372.0 / 6561.0;
const A52: f64 = -25360.0 / 2187.0;
const A53: f64 = 64448.0 / 6561.0;
const A54: f64 = -212.0 / 729.0;
const A61: f64 = 9017.0 / 3168.0;
const A62: f64 = -355.0 / 33.0;
const A63: f64 = 46732.0 / 5247.0;
const A64: f64 = 49.0 / 176.0;
const A65: f64 = -5103.0 / 18656.0;

// 5th-order weights (advancing solution, local extrapolation).
const B1: f64 = 35.0 / 384.0;
const B3: f64 = 500.0 / 1113.0;
const B4: f64 = 125.0 / 192.0;
const B5: f64 = -2187.0 / 6784.0;
const B6: f64 = 11.0 / 84.0;

// 4th-order embedded weights.
const BH1: f64 = 5179.0 / 57600.0;
const BH3: f64 = 7571.0 / 16695.0;
const BH4: f64 = 393.0 / 640.0;
const BH5: f64 = -92097.0 / 339200.0;
const BH6: f64 = 187.0 / 2100.0;
const BH7: f64 = 1.0 / 40.0;

// Error = y5 - y4.
const E1: f64 = B1 - BH1;
const E3: f64 = B3 - BH3;
const E4: f64 = B4 - BH4;
const E5: f64 = B5 - BH5;
const E6: f64 = B6 - BH6;
const E7: f64 = -BH7;

/// Advance `y` from `t0` to `t1` in place. `t1 < t0` integrates backward.
pub fn integrate<S: OdeSystem>(
    sys: &S,
    y: &mut [f64],
    t0: f64,
    t1: f64,
    atol: &[f64],
    ctl: &StepControl,
) -> Result<()> {
    let n = sys.ndim();
    debug_assert_eq!(y.len(), n);
    debug_assert_eq!(atol.len(), n);

    let span = t1 - t0;
    if span == 0.0 {
        return Ok(());
    }
    let dir = span.signum();
    let span = span.abs();

    let mut evals = 0usize;
    // Substituted time: tau runs 0..span regardless of direction, and the
    // wrapped right-hand side absorbs the sign.
    let mut eval = |tau: f64, y: &[f64], k: &mut [f64]| -> Result<()> {
        evals += 1;
        if evals > ctl.max_evaluations {
            return Err(Error::EvaluationBudgetExceeded {
                budget: ctl.max_evaluations,
                t: t0 + dir * tau,
            });
        }
        sys.rhs(t0 + dir * tau, y, k);
        if dir < 0.0 {
            for v in k.iter_mut() {
                *v = -*v;
            }
        }
        Ok(())
    };

    let mut tau = 0.0;
    let mut h = (span * 1e-3).clamp(ctl.h_min, ctl.h_max).min(span);

    let mut k1 = vec![0.0; n];
    let mut k2 = vec![0.0; n];
    let mut k3 = vec![0.0; n];
    let mut k4 = vec![0.0; n];
    let mut k5 = vec![0.0; n];
    let mut k6 = vec![0.0; n];
    let mut k7 = vec![0.0; n];
    let mut y_tmp = vec![0.0; n];
    let mut y_new = vec![0.0; n];

    eval(tau, y, &mut k1)?;

    while tau < span {
        h = h.min(span - tau).max(ctl.h_min).min(ctl.h_max);

        for i in 0..n {
            y_tmp[i] = y[i] + h * A21 * k1[i];
        }
        eval(tau + h / 5.0, &y_tmp, &mut k2)?;

        for i in 0..n {
            y_tmp[i] = y[i] + h * (A31 * k1[i] + A32 * k2[i]);
        }
        eval(tau + 3.0 * h / 10.0, &y_tmp, &mut k3)?;

        for i in 0..n {
            y_tmp[i] = y[i] + h * (A41 * k1[i] + A42 * k2[i] + A43 * k3[i]);
        }
        eval(tau + 4.0 * h / 5.0, &y_tmp, &mut k4)?;

        for i in 0..n {
            y_tmp[i] = y[i] + h * (A51 * k1[i] + A52 * k2[i] + A53 * k3[i] + A54 * k4[i]);
        }
        eval(tau + 8.0 * h / 9.0, &y_tmp, &mut k5)?;

        for i in 0..n {
            y_tmp[i] =
                y[i] + h * (A61 * k1[i] + A62 * k2[i] + A63 * k3[i] + A64 * k4[i] + A65 * k5[i]);
        }
        eval(tau + h, &y_tmp, &mut k6)?;

        for i in 0..n {
            y_new[i] =
                y[i] + h * (B1 * k1[i] + B3 * k3[i] + B4 * k4[i] + B5 * k5[i] + B6 * k6[i]);
        }

        // FSAL stage: slope at the candidate end point.
        eval(tau + h, &y_new, &mut k7)?;

        let mut err_norm = 0.0;
        for i in 0..n {
            let ei = h
                * (E1 * k1[i] + E3 * k3[i] + E4 * k4[i] + E5 * k5[i] + E6 * k6[i] + E7 * k7[i]);
            let sc = atol[i] + ctl.rtol * y[i].abs().max(y_new[i].abs());
            err_norm += (ei / sc) * (ei / sc);
        }
        err_norm = (err_norm / n as f64).sqrt();

        if err_norm <= 1.0 {
            tau += h;
            y.copy_from_slice(&y_new);
            k1.copy_from_slice(&k7);
            if tau >= span {
                break;
            }
        }

        let factor = if err_norm == 0.0 {
            5.0
        } else if err_norm.is_finite() {
            (0.9 * err_norm.powf(-0.2)).clamp(0.2, 5.0)
        } else {
            // A non-finite error estimate means the step blew up; retreat
            // hard and let the evaluation budget bound the retries.
            0.2
        };
        h = (h * factor).max(ctl.h_min).min(ctl.h_max);
    }

    Ok(())
}
