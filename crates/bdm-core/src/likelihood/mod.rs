//! Likelihood engine: entry point, leaf pre-pass and root aggregation.
//!
//! One [`LikelihoodEngine`] owns the numeric configuration and (when
//! parallel dispatch is enabled) the worker pool, and is reused across the
//! many evaluations of an outer sampling loop. Each call recomputes
//! everything from the current tree and parameterization; the only state
//! kept on the engine between calls is the per-type root posterior of the
//! most recent successful evaluation, exposed for ancestral-state logging.
//!
//! Infeasible parameter regions (origin younger than the root, survival
//! probability outside [0, 1], non-finite densities) are model rejections:
//! the call returns `Ok(-inf)` and the sampler moves on. Structural errors
//! and an exhausted integration budget surface as typed errors instead.

mod traversal;

use bdm_math::ScaledNumber;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::ode::safe::SafeIntegrator;
use crate::ode::solver::{self, StepControl};
use crate::ode::{ExtinctionOde, JointOde};
use crate::params::Parameterization;
use crate::tree::Tree;
use crate::PRECISION_THRESHOLD;

use traversal::{crossed_boundaries, landing_boundary, TraversalCtx};

/// Reusable evaluation context for the multi-type birth-death likelihood.
pub struct LikelihoodEngine {
    config: EngineConfig,
    pool: Option<rayon::ThreadPool>,
    root_type_probs: Vec<f64>,
}

impl LikelihoodEngine {
    /// Build an engine, creating the worker pool if parallel dispatch is on.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let pool = if config.parallelize {
            let pool = rayon::ThreadPoolBuilder::new()
                .build()
                .map_err(|e| Error::WorkerPool(e.to_string()))?;
            Some(pool)
        } else {
            None
        };
        Ok(Self { config, pool, root_type_probs: Vec::new() })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(EngineConfig::default())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Per-type root posterior of the most recent successful evaluation,
    /// normalized to sum to 1. Used for ancestral-state reporting.
    pub fn root_type_probs(&self) -> &[f64] {
        &self.root_type_probs
    }

    /// Log-likelihood of `tree` under `params`, with root type frequencies
    /// `frequencies`, optionally conditioned on at least one sample.
    pub fn compute_log_likelihood(
        &mut self,
        tree: &Tree,
        params: &Parameterization,
        frequencies: &[f64],
        condition_on_survival: bool,
    ) -> Result<f64> {
        let n = params.n_types();
        validate_frequencies(frequencies, n)?;

        let root = tree.root();
        let root_time = params.origin() - tree.height(root);
        if root_time < 0.0 {
            // The proposed origin is younger than the root: reject.
            return self.reject(n);
        }

        let kinds = tree.resolve_node_kinds(n)?;
        let weights = tree.subtree_weights();
        let threshold = weights[root] * self.config.parallelization_factor;

        let ctl = StepControl::for_process(
            params.origin(),
            self.config.relative_tolerance,
            self.config.max_evaluations,
        );

        let (leaf_p, p_origin) = match self.leaf_extinction_pass(tree, params, &ctl) {
            Ok(v) => v,
            Err(e @ Error::NumericalInstability(_)) => {
                debug!(error = %e, "rejecting proposal on unstable pre-pass");
                return self.reject(n);
            }
            Err(e) => return Err(e),
        };

        let mut no_sample = 0.0;
        if condition_on_survival {
            for k in 0..n {
                no_sample += frequencies[k] * p_origin[k];
            }
            if !(0.0..=1.0).contains(&no_sample) || 1.0 - no_sample <= 0.0 {
                return self.reject(n);
            }
        }

        let mut is_rho_tip = vec![false; tree.n_nodes()];
        for leaf in tree.leaves() {
            is_rho_tip[leaf] = params.is_rho_sampling_time(params.origin() - tree.height(leaf));
        }

        let ctx = TraversalCtx {
            tree,
            params,
            kinds: &kinds,
            leaf_p: &leaf_p,
            is_rho_tip: &is_rho_tip,
            weights: &weights,
            threshold,
            parallel: self.pool.is_some(),
            integrator: SafeIntegrator::new(
                JointOde::new(params),
                params.origin(),
                self.config.absolute_tolerance,
                ctl,
            ),
        };

        let result = match &self.pool {
            Some(pool) => pool.install(|| ctx.evaluate(root, 0.0, root_time)),
            None => ctx.evaluate(root, 0.0, root_time),
        };
        let state = match result {
            Ok(state) => state,
            Err(e @ Error::NumericalInstability(_)) => {
                debug!(error = %e, "rejecting proposal on unstable traversal");
                return self.reject(n);
            }
            Err(e) => return Err(e),
        };

        // Root aggregation: weight each type's density by its frequency and
        // accumulate in scaled arithmetic.
        let mut total = ScaledNumber::ZERO;
        let mut joint_logs = vec![f64::NEG_INFINITY; n];
        for k in 0..n {
            let joint = match state.g[k].scalar_multiply(frequencies[k]) {
                Ok(j) => j,
                Err(_) => return self.reject(n),
            };
            if joint.mantissa() > 0.0 {
                joint_logs[k] = joint.log();
                total = total + joint;
            }
        }
        if total.is_zero() || total.mantissa() < 0.0 {
            return self.reject(n);
        }

        let log_total = total.log();
        self.root_type_probs = joint_logs.iter().map(|&l| (l - log_total).exp()).collect();

        if condition_on_survival {
            total = match total.scalar_multiply(1.0 / (1.0 - no_sample)) {
                Ok(t) => t,
                Err(_) => return self.reject(n),
            };
        }

        let log_likelihood = total.log();
        debug!(log_likelihood, no_sample, "likelihood evaluation complete");
        if log_likelihood.is_finite() {
            Ok(log_likelihood)
        } else {
            Ok(f64::NEG_INFINITY)
        }
    }

    fn reject(&mut self, n_types: usize) -> Result<f64> {
        self.root_type_probs = vec![0.0; n_types];
        Ok(f64::NEG_INFINITY)
    }

    /// Pre-pass: extinction probabilities at every leaf age, plus the
    /// vector at the origin used for survival conditioning.
    ///
    /// Leaves are walked youngest first and each integration reuses the
    /// previous leaf's result, so the whole pass solves the p system once
    /// over the contiguous span from the present to the origin.
    fn leaf_extinction_pass(
        &self,
        tree: &Tree,
        params: &Parameterization,
        ctl: &StepControl,
    ) -> Result<(Vec<Vec<f64>>, Vec<f64>)> {
        let n = params.n_types();
        let last = params.n_intervals() - 1;
        let mut p: Vec<f64> = (0..n).map(|i| 1.0 - params.rho(last)[i]).collect();
        let ode = ExtinctionOde::new(params);
        let atol = vec![self.config.absolute_tolerance; n];

        let mut leaves: Vec<usize> = tree.leaves().collect();
        leaves.sort_by(|&a, &b| tree.height(a).total_cmp(&tree.height(b)));

        let mut out = vec![Vec::new(); tree.n_nodes()];
        let mut t_prev = params.origin();
        let mut prev_leaf: Option<usize> = None;
        for &leaf in &leaves {
            let t = params.origin() - tree.height(leaf);
            if let Some(prev) = prev_leaf {
                if (t_prev - t).abs() < PRECISION_THRESHOLD {
                    out[leaf] = out[prev].clone();
                    continue;
                }
            }
            self.extinction_segment(&ode, params, &mut p, t_prev, t, &atol, ctl)?;
            out[leaf] = p.clone();
            t_prev = t;
            prev_leaf = Some(leaf);
        }

        self.extinction_segment(&ode, params, &mut p, t_prev, 0.0, &atol, ctl)?;
        Ok((out, p))
    }

    /// One chained p-only integration from `to` (younger) down to `from`,
    /// with the (1 − rho) drop at every mass-sampling boundary met.
    #[allow(clippy::too_many_arguments)]
    fn extinction_segment(
        &self,
        ode: &ExtinctionOde<'_>,
        params: &Parameterization,
        p: &mut [f64],
        to: f64,
        from: f64,
        atol: &[f64],
        ctl: &StepControl,
    ) -> Result<()> {
        if (to - from).abs() < PRECISION_THRESHOLD {
            return Ok(());
        }
        let mut cur_to = to;
        for j in crossed_boundaries(params, from, to) {
            let boundary = params.interval_start_times()[j];
            solver::integrate(ode, p, cur_to, boundary, atol, ctl)?;
            for (pi, &rho) in p.iter_mut().zip(params.rho(j - 1)) {
                *pi *= 1.0 - rho;
            }
            cur_to = boundary;
        }
        solver::integrate(ode, p, cur_to, from, atol, ctl)?;
        if let Some(j) = landing_boundary(params, from) {
            for (pi, &rho) in p.iter_mut().zip(params.rho(j - 1)) {
                *pi *= 1.0 - rho;
            }
        }
        if p.iter().any(|v| !v.is_finite()) {
            return Err(Error::NumericalInstability(
                "non-finite extinction probability in pre-pass".into(),
            ));
        }
        Ok(())
    }
}

fn validate_frequencies(frequencies: &[f64], n_types: usize) -> Result<()> {
    if frequencies.len() != n_types {
        return Err(Error::InvalidFrequencies(format!(
            "expected {n_types} frequencies, got {}",
            frequencies.len()
        )));
    }
    if frequencies.iter().any(|f| !f.is_finite() || *f < 0.0) {
        return Err(Error::InvalidFrequencies(
            "frequencies must be finite and non-negative".into(),
        ));
    }
    let sum: f64 = frequencies.iter().sum();
    if (sum - 1.0).abs() > 1e-10 {
        return Err(Error::InvalidFrequencies(format!(
            "frequencies must add up to 1, got {sum}"
        )));
    }
    Ok(())
}
