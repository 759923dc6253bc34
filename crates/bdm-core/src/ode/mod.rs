//! Coupled extinction/density ODE systems for the multi-type process.
//!
//! Both systems are written in forward process time (t = 0 at the origin);
//! the engine integrates them backward, from a lineage's younger end where
//! the state is known toward its older end. Rates are piecewise constant:
//! every derivative evaluation re-resolves the interval containing t.
//!
//! # Equations
//!
//! Extinction probabilities, one per type:
//! ```text
//! dp_i/dt = (b_i + d_i + s_i) p_i − b_i p_i² − d_i
//!           + Σ_{j≠i} [ b_ij p_i (1 − p_j) + M_ij (p_i − p_j) ]
//! ```
//!
//! Subtree densities, coupled to p:
//! ```text
//! dg_i/dt = (b_i + d_i + s_i − 2 b_i p_i) g_i
//!           + Σ_{j≠i} [ b_ij (g_i − p_i g_j − p_j g_i) + M_ij (g_i − g_j) ]
//! ```
//!
//! Inside the solver g components are magnitude-normalized raw doubles; the
//! scaled representation lives outside (see [`safe`]).

pub mod safe;
pub mod solver;

use bdm_math::ScaledNumber;

use crate::params::Parameterization;

/// Right-hand side of an ODE system `dy/dt = f(t, y)`.
pub trait OdeSystem {
    /// Number of state variables.
    fn ndim(&self) -> usize;

    /// Evaluate `f(t, y)` and write into `dydt`. Both slices have length
    /// `ndim()`.
    fn rhs(&self, t: f64, y: &[f64], dydt: &mut [f64]);
}

/// ODE state at one point on the tree: extinction probabilities and
/// subtree densities, one entry per type.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeState {
    /// Probability a lineage of each type leaves no sampled descendants.
    pub p: Vec<f64>,
    /// Un-normalized density of producing exactly the observed subtree.
    pub g: Vec<ScaledNumber>,
}

impl EdgeState {
    pub fn zero(n_types: usize) -> Self {
        Self { p: vec![0.0; n_types], g: vec![ScaledNumber::ZERO; n_types] }
    }

    pub fn n_types(&self) -> usize {
        self.p.len()
    }
}

/// The p-only system, dimension `n_types`.
pub struct ExtinctionOde<'a> {
    params: &'a Parameterization,
}

impl<'a> ExtinctionOde<'a> {
    pub fn new(params: &'a Parameterization) -> Self {
        Self { params }
    }
}

impl OdeSystem for ExtinctionOde<'_> {
    fn ndim(&self) -> usize {
        self.params.n_types()
    }

    fn rhs(&self, t: f64, y: &[f64], dydt: &mut [f64]) {
        let iv = self.params.interval_index(t);
        extinction_derivatives(self.params, iv, y, dydt);
    }
}

/// The combined (p, g) system, dimension `2 × n_types`; p occupies the
/// first half of the state vector, g the second.
pub struct JointOde<'a> {
    params: &'a Parameterization,
}

impl<'a> JointOde<'a> {
    pub fn new(params: &'a Parameterization) -> Self {
        Self { params }
    }

    pub fn n_types(&self) -> usize {
        self.params.n_types()
    }
}

impl OdeSystem for JointOde<'_> {
    fn ndim(&self) -> usize {
        2 * self.params.n_types()
    }

    fn rhs(&self, t: f64, y: &[f64], dydt: &mut [f64]) {
        let n = self.params.n_types();
        let iv = self.params.interval_index(t);
        let (p, g) = y.split_at(n);
        let (dp, dg) = dydt.split_at_mut(n);

        extinction_derivatives(self.params, iv, p, dp);

        let b = self.params.birth(iv);
        let d = self.params.death(iv);
        let s = self.params.sampling(iv);
        let m = self.params.migration(iv);
        let bij = self.params.cross_birth(iv);

        for i in 0..n {
            let mut dgi = (b[i] + d[i] + s[i] - 2.0 * b[i] * p[i]) * g[i];
            for j in 0..n {
                if j == i {
                    continue;
                }
                dgi += bij[i][j] * (g[i] - p[i] * g[j] - p[j] * g[i]);
                dgi += m[i][j] * (g[i] - g[j]);
            }
            dg[i] = dgi;
        }
    }
}

fn extinction_derivatives(params: &Parameterization, iv: usize, p: &[f64], dp: &mut [f64]) {
    let b = params.birth(iv);
    let d = params.death(iv);
    let s = params.sampling(iv);
    let m = params.migration(iv);
    let bij = params.cross_birth(iv);

    for i in 0..p.len() {
        let mut dpi = (b[i] + d[i] + s[i]) * p[i] - b[i] * p[i] * p[i] - d[i];
        for j in 0..p.len() {
            if j == i {
                continue;
            }
            dpi += bij[i][j] * p[i] * (1.0 - p[j]);
            dpi += m[i][j] * (p[i] - p[j]);
        }
        dp[i] = dpi;
    }
}
