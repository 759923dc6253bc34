//! Post-order subtree traversal and per-node combination rules.
//!
//! `evaluate(node, t_start, t_end)` returns the (p, g) state at the *top*
//! of the edge above `node`: the node's own event supplies the state at
//! `t_end`, which is then integrated back to `t_start`. Birth nodes visit
//! the lower-numbered child first and carry its p vector, a fixed tie-break
//! so results do not depend on child storage order; when both children's
//! subtree weights clear the fork threshold the two evaluations run as a
//! rayon fork/join instead of sequentially, which must not change any
//! numeric result.

use bdm_math::ScaledNumber;
use tracing::trace;

use crate::error::{Error, Result};
use crate::ode::safe::{SafeIntegrator, ScaledState};
use crate::ode::EdgeState;
use crate::params::Parameterization;
use crate::tree::{NodeKind, TipType, Tree};
use crate::PRECISION_THRESHOLD;

/// Read-only traversal context, shared across worker threads.
pub(crate) struct TraversalCtx<'a> {
    pub tree: &'a Tree,
    pub params: &'a Parameterization,
    pub kinds: &'a [NodeKind],
    /// Memoized extinction probabilities at each leaf's age, by node id.
    pub leaf_p: &'a [Vec<f64>],
    /// Whether each leaf sits exactly on a rho-sampling time, by node id.
    pub is_rho_tip: &'a [bool],
    /// Subtree weights, by node id.
    pub weights: &'a [f64],
    /// Fork threshold: total tree weight × parallelization factor.
    pub threshold: f64,
    pub parallel: bool,
    pub integrator: SafeIntegrator<'a>,
}

impl TraversalCtx<'_> {
    /// State at the top (`t_start`) of the edge above `node`, whose own age
    /// is `t_end`.
    pub fn evaluate(&self, node: usize, t_start: f64, t_end: f64) -> Result<EdgeState> {
        let state = match self.kinds[node] {
            NodeKind::Leaf { tip } => self.leaf_state(node, tip, t_end)?,
            NodeKind::SampledAncestor { child, ancestor } => {
                self.sampled_ancestor_state(child, ancestor, t_end)?
            }
            NodeKind::Birth { first, second } => self.birth_state(first, second, t_end)?,
        };
        self.integrate_edge(state, t_start, t_end)
    }

    fn node_time(&self, node: usize) -> f64 {
        self.params.origin() - self.tree.height(node)
    }

    /// Sampling event. A tip on a rho boundary takes the mass-sampling
    /// branch; its memoized p already contains that boundary's (1 − rho)
    /// drop, which the formula divides back out.
    fn leaf_state(&self, node: usize, tip: TipType, t_end: f64) -> Result<EdgeState> {
        let iv = self.params.interval_index(t_end);
        let n = self.params.n_types();
        let p_leaf = &self.leaf_p[node];
        let r = self.params.removal_prob(iv);

        let contribution = |k: usize| -> f64 {
            if self.is_rho_tip[node] {
                let rho = self.params.rho(iv)[k];
                (r[k] + p_leaf[k] / (1.0 - rho) * (1.0 - r[k])) * rho
            } else {
                (r[k] + p_leaf[k] * (1.0 - r[k])) * self.params.sampling(iv)[k]
            }
        };

        let mut state = EdgeState::zero(n);
        state.p.copy_from_slice(p_leaf);
        match tip {
            TipType::Known(k) => state.g[k] = scaled(contribution(k))?,
            TipType::Unknown => {
                for k in 0..n {
                    state.g[k] = scaled(contribution(k))?;
                }
            }
        }
        trace!(node, time = t_end, "sampling event");
        Ok(state)
    }

    /// Sampled-ancestor event: the ordinary child's state passes through
    /// with the ancestor's type component rescaled by its sampling term.
    fn sampled_ancestor_state(
        &self,
        child: usize,
        ancestor: usize,
        t_end: f64,
    ) -> Result<EdgeState> {
        let mut state = self.evaluate(child, t_end, self.node_time(child))?;

        let tip = match self.kinds[ancestor] {
            NodeKind::Leaf { tip } => tip,
            _ => {
                return Err(Error::MalformedTree(format!(
                    "direct ancestor {ancestor} is not a leaf"
                )))
            }
        };
        let iv = self.params.interval_index(t_end);
        let r = self.params.removal_prob(iv);

        let scale_type = |state: &mut EdgeState, k: usize| -> Result<()> {
            if self.is_rho_tip[ancestor] {
                let rho = self.params.rho(iv)[k];
                state.g[k] = mult(state.g[k], rho * (1.0 - r[k]))?;
                state.p[k] *= 1.0 - rho;
            } else {
                state.g[k] = mult(state.g[k], self.params.sampling(iv)[k] * (1.0 - r[k]))?;
            }
            Ok(())
        };
        match tip {
            TipType::Known(k) => scale_type(&mut state, k)?,
            TipType::Unknown => {
                for k in 0..self.params.n_types() {
                    scale_type(&mut state, k)?;
                }
            }
        }
        trace!(ancestor, time = t_end, "sampled ancestor");
        Ok(state)
    }

    /// Birth event: recurse into both children, then combine densities over
    /// ordered type pairs.
    fn birth_state(&self, first: usize, second: usize, t_end: f64) -> Result<EdgeState> {
        let t_first = self.node_time(first);
        let t_second = self.node_time(second);

        let fork = self.parallel
            && self.weights[first] > self.threshold
            && self.weights[second] > self.threshold;

        let (g0, g1) = if fork {
            let (left, right) = rayon::join(
                || self.evaluate(first, t_end, t_first),
                || self.evaluate(second, t_end, t_second),
            );
            (left?, right?)
        } else {
            (
                self.evaluate(first, t_end, t_first)?,
                self.evaluate(second, t_end, t_second)?,
            )
        };

        let iv = self.params.interval_index(t_end);
        let b = self.params.birth(iv);
        let bij = self.params.cross_birth(iv);
        let n = self.params.n_types();

        let mut state = EdgeState::zero(n);
        for i in 0..n {
            if !g0.p[i].is_finite() || !g1.p[i].is_finite() {
                return Err(Error::NumericalInstability(format!(
                    "non-finite extinction probability for type {i} at a birth node"
                )));
            }
            // p is carried from the canonical (lower-index) child.
            state.p[i] = g0.p[i];

            let mut gi = mult(g0.g[i] * g1.g[i], b[i])?;
            for j in 0..n {
                if j == i {
                    continue;
                }
                let cross = g0.g[i] * g1.g[j] + g0.g[j] * g1.g[i];
                gi = gi + mult(cross, 0.5 * bij[i][j])?;
            }
            state.g[i] = gi;
        }
        trace!(time = t_end, forked = fork, "birth event");
        Ok(state)
    }

    /// Integrate an edge from its younger end `t_end` back to `t_start`,
    /// applying the deterministic (1 − rho) drop at every mass-sampling
    /// boundary crossed on the way.
    fn integrate_edge(&self, state: EdgeState, t_start: f64, t_end: f64) -> Result<EdgeState> {
        if (t_end - t_start).abs() < PRECISION_THRESHOLD {
            return Ok(state);
        }
        let n = state.n_types();
        let mut scaled_state = ScaledState::scale(&state);
        let mut cur_to = t_end;

        for j in crossed_boundaries(self.params, t_start, t_end) {
            let boundary = self.params.interval_start_times()[j];
            scaled_state = self.integrator.integrate(cur_to, scaled_state, boundary)?;
            let rho = self.params.rho(j - 1);
            if rho.iter().any(|&r| r > 0.0) {
                let mut edge = scaled_state.unscale(n)?;
                apply_rho(&mut edge, rho)?;
                scaled_state = ScaledState::scale(&edge);
            }
            cur_to = boundary;
        }

        scaled_state = self.integrator.integrate(cur_to, scaled_state, t_start)?;
        let mut edge = scaled_state.unscale(n)?;

        // Landing exactly on a boundary counts as crossing it.
        if let Some(j) = landing_boundary(self.params, t_start) {
            let rho = self.params.rho(j - 1);
            if rho.iter().any(|&r| r > 0.0) {
                apply_rho(&mut edge, rho)?;
            }
        }
        Ok(edge)
    }
}

/// Interval indices whose start boundary lies strictly inside `(from, to)`,
/// in descending order (the order a backward integration meets them).
pub(crate) fn crossed_boundaries(params: &Parameterization, from: f64, to: f64) -> Vec<usize> {
    let starts = params.interval_start_times();
    (1..starts.len())
        .rev()
        .filter(|&j| {
            starts[j] > from + PRECISION_THRESHOLD && starts[j] < to - PRECISION_THRESHOLD
        })
        .collect()
}

/// The boundary index `t` sits on, if any. Index 0 (the origin itself) is
/// not a crossable boundary.
pub(crate) fn landing_boundary(params: &Parameterization, t: f64) -> Option<usize> {
    let starts = params.interval_start_times();
    (1..starts.len()).find(|&j| (starts[j] - t).abs() < PRECISION_THRESHOLD)
}

/// Deterministic removal of the rho-sampled fraction of unseen lineages.
pub(crate) fn apply_rho(state: &mut EdgeState, rho: &[f64]) -> Result<()> {
    for i in 0..state.n_types() {
        let keep = 1.0 - rho[i];
        state.p[i] *= keep;
        state.g[i] = mult(state.g[i], keep)?;
    }
    Ok(())
}

fn scaled(value: f64) -> Result<ScaledNumber> {
    ScaledNumber::new(value)
        .map_err(|_| Error::NumericalInstability(format!("non-finite combination value {value}")))
}

fn mult(g: ScaledNumber, factor: f64) -> Result<ScaledNumber> {
    g.scalar_multiply(factor)
        .map_err(|_| Error::NumericalInstability(format!("non-finite combination factor {factor}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::ode::solver::StepControl;
    use crate::ode::JointOde;
    use crate::params::RateTables;
    use crate::tree::NodeSpec;

    fn single_type_params(origin: f64, rho_present: f64) -> Parameterization {
        Parameterization::constant_rates(
            origin,
            RateTables {
                birth: vec![vec![2.0]],
                death: vec![vec![1.0]],
                sampling: vec![vec![0.5]],
                removal_prob: vec![vec![0.8]],
                rho: vec![vec![rho_present]],
                migration: vec![vec![vec![0.0]]],
                cross_birth: vec![vec![vec![0.0]]],
            },
        )
        .unwrap()
    }

    struct Fixture {
        tree: Tree,
        params: Parameterization,
        kinds: Vec<NodeKind>,
        leaf_p: Vec<Vec<f64>>,
        is_rho_tip: Vec<bool>,
        weights: Vec<f64>,
    }

    impl Fixture {
        fn new(tree: Tree, params: Parameterization, leaf_p: Vec<Vec<f64>>, rho_tips: bool) -> Self {
            let kinds = tree.resolve_node_kinds(params.n_types()).unwrap();
            let is_rho_tip = (0..tree.n_nodes())
                .map(|i| rho_tips && tree.is_leaf(i))
                .collect();
            let weights = tree.subtree_weights();
            Self { tree, params, kinds, leaf_p, is_rho_tip, weights }
        }

        fn ctx(&self) -> TraversalCtx<'_> {
            let cfg = EngineConfig::default();
            let ctl = StepControl::for_process(
                self.params.origin(),
                cfg.relative_tolerance,
                cfg.max_evaluations,
            );
            TraversalCtx {
                tree: &self.tree,
                params: &self.params,
                kinds: &self.kinds,
                leaf_p: &self.leaf_p,
                is_rho_tip: &self.is_rho_tip,
                weights: &self.weights,
                threshold: f64::INFINITY,
                parallel: false,
                integrator: SafeIntegrator::new(
                    JointOde::new(&self.params),
                    self.params.origin(),
                    cfg.absolute_tolerance,
                    ctl,
                ),
            }
        }
    }

    fn single_tip_tree() -> Tree {
        Tree::from_nodes(vec![NodeSpec {
            height: 0.0,
            parent: None,
            tip_type: Some(TipType::Known(0)),
            direct_ancestor: false,
        }])
        .unwrap()
    }

    #[test]
    fn leaf_uses_continuous_sampling_branch() {
        let params = single_type_params(5.0, 0.0);
        let fx = Fixture::new(single_tip_tree(), params, vec![vec![0.6]], false);
        let ctx = fx.ctx();
        // Degenerate edge: the leaf state comes back unchanged.
        let state = ctx.evaluate(0, 5.0, 5.0).unwrap();
        // (r + p (1 - r)) s = (0.8 + 0.6 * 0.2) * 0.5
        let expected = (0.8 + 0.6 * 0.2) * 0.5;
        assert!((state.g[0].revert() - expected).abs() < 1e-12);
        assert!((state.p[0] - 0.6).abs() < 1e-15);
    }

    #[test]
    fn leaf_on_rho_boundary_uses_rho_branch() {
        let params = single_type_params(5.0, 0.25);
        // Memoized p at the leaf already includes the (1 - rho) drop.
        let p_leaf = 0.6 * (1.0 - 0.25);
        let fx = Fixture::new(single_tip_tree(), params, vec![vec![p_leaf]], true);
        let ctx = fx.ctx();
        let state = ctx.evaluate(0, 5.0, 5.0).unwrap();
        // (r + p/(1-rho) (1 - r)) rho with the division recovering 0.6.
        let expected = (0.8 + 0.6 * 0.2) * 0.25;
        assert!((state.g[0].revert() - expected).abs() < 1e-12);
    }

    #[test]
    fn unknown_leaf_fills_every_type() {
        let tables = RateTables {
            birth: vec![vec![2.0, 3.0]],
            death: vec![vec![1.0, 1.0]],
            sampling: vec![vec![0.5, 0.7]],
            removal_prob: vec![vec![1.0, 1.0]],
            rho: vec![vec![0.0, 0.0]],
            migration: vec![vec![vec![0.0, 0.1], vec![0.1, 0.0]]],
            cross_birth: vec![vec![vec![0.0, 0.0], vec![0.0, 0.0]]],
        };
        let params = Parameterization::constant_rates(5.0, tables).unwrap();
        let tree = Tree::from_nodes(vec![NodeSpec {
            height: 0.0,
            parent: None,
            tip_type: Some(TipType::Unknown),
            direct_ancestor: false,
        }])
        .unwrap();
        let fx = Fixture::new(tree, params, vec![vec![0.5, 0.4]], false);
        let state = fx.ctx().evaluate(0, 5.0, 5.0).unwrap();
        assert!((state.g[0].revert() - 0.5 * 0.5).abs() < 1e-12);
        assert!((state.g[1].revert() - 0.4 * 0.7).abs() < 1e-12);
    }

    #[test]
    fn birth_combination_single_type() {
        // Cherry with both tips at the present and the root at height 1.
        let tree = Tree::from_nodes(vec![
            NodeSpec::leaf(0.0, 2, 0),
            NodeSpec::leaf(0.0, 2, 0),
            NodeSpec::internal(1.0, None),
        ])
        .unwrap();
        let params = single_type_params(5.0, 0.0);
        let fx = Fixture::new(tree, params, vec![vec![0.6], vec![0.6], vec![]], false);
        let ctx = fx.ctx();

        let tip_g = (0.8 + 0.6 * 0.2) * 0.5;
        // Evaluate the root with a degenerate top edge so only the subtree
        // below it is scored.
        let state = ctx.evaluate(2, 4.0, 4.0).unwrap();
        // Each tip edge integrates over one unit of time; bound the result
        // loosely and check the b·g0·g1 structure via monotonicity instead
        // of duplicating the integral here.
        assert!(state.g[0].revert() > 0.0);
        assert!(state.g[0].revert() < 2.0 * tip_g * tip_g);
    }

    #[test]
    fn boundary_helpers_respect_endpoints() {
        let tables = RateTables {
            birth: vec![vec![2.0]; 3],
            death: vec![vec![1.0]; 3],
            sampling: vec![vec![0.5]; 3],
            removal_prob: vec![vec![1.0]; 3],
            rho: vec![vec![0.0]; 3],
            migration: vec![vec![vec![0.0]]; 3],
            cross_birth: vec![vec![vec![0.0]]; 3],
        };
        let params = Parameterization::new(12.0, vec![0.0, 4.0, 8.0], tables).unwrap();

        assert_eq!(crossed_boundaries(&params, 1.0, 11.0), vec![2, 1]);
        assert_eq!(crossed_boundaries(&params, 4.0, 8.0), Vec::<usize>::new());
        assert_eq!(crossed_boundaries(&params, 1.0, 8.0), vec![1]);
        assert_eq!(landing_boundary(&params, 4.0), Some(1));
        assert_eq!(landing_boundary(&params, 0.0), None);
        assert_eq!(landing_boundary(&params, 5.0), None);
    }
}
