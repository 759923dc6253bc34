//! Piecewise-constant rate schedule for the multi-type birth-death process.
//!
//! Time runs forward from the process origin: t = 0 at the origin, t =
//! `origin` at the present. The schedule is a sequence of half-open
//! intervals `[start[i], start[i+1])` (the last one closed at the present);
//! every rate is constant inside an interval. A time exactly on a boundary
//! belongs to the earlier interval.
//!
//! `rho[i][type]` is the instantaneous mass-sampling fraction fired at the
//! *end* boundary of interval i; for the last interval that boundary is the
//! present. Most schedules leave all rho entries at zero.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::PRECISION_THRESHOLD;

/// Per-interval rate tables, outer index interval, inner index type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateTables {
    /// Within-type birth rate.
    pub birth: Vec<Vec<f64>>,
    /// Death rate.
    pub death: Vec<Vec<f64>>,
    /// Continuous sampling rate.
    pub sampling: Vec<Vec<f64>>,
    /// Probability a sampled lineage is removed from the process.
    pub removal_prob: Vec<Vec<f64>>,
    /// Mass-sampling fraction at the interval's end boundary.
    pub rho: Vec<Vec<f64>>,
    /// Migration rate, `[interval][from][to]`, diagonal unused.
    pub migration: Vec<Vec<Vec<f64>>>,
    /// Cross-type birth rate, `[interval][parent][child]`, diagonal unused.
    pub cross_birth: Vec<Vec<Vec<f64>>>,
}

/// Validated, immutable rate schedule consumed by the likelihood engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameterization {
    n_types: usize,
    origin: f64,
    interval_start_times: Vec<f64>,
    tables: RateTables,
    rho_sampling_times: Vec<f64>,
}

impl Parameterization {
    /// Build and validate a schedule.
    ///
    /// `interval_start_times` must start at 0, increase strictly, and stay
    /// below `origin`. Every table must have one row per interval and one
    /// column per type.
    pub fn new(origin: f64, interval_start_times: Vec<f64>, tables: RateTables) -> Result<Self> {
        if !origin.is_finite() || origin <= 0.0 {
            return Err(Error::InvalidParameterization(format!(
                "origin must be finite and positive, got {origin}"
            )));
        }
        if interval_start_times.is_empty() {
            return Err(Error::InvalidParameterization(
                "at least one interval is required".into(),
            ));
        }
        if interval_start_times[0] != 0.0 {
            return Err(Error::InvalidParameterization(format!(
                "first interval must start at the origin (t = 0), got {}",
                interval_start_times[0]
            )));
        }
        for w in interval_start_times.windows(2) {
            if !(w[1].is_finite() && w[1] > w[0]) {
                return Err(Error::InvalidParameterization(format!(
                    "interval start times must increase strictly, got {} then {}",
                    w[0], w[1]
                )));
            }
        }
        if *interval_start_times.last().unwrap() >= origin {
            return Err(Error::InvalidParameterization(
                "interval start times must lie before the present".into(),
            ));
        }

        let n_intervals = interval_start_times.len();
        let n_types = tables.birth.first().map_or(0, Vec::len);
        if n_types == 0 {
            return Err(Error::InvalidParameterization(
                "at least one type is required".into(),
            ));
        }

        check_table("birth", &tables.birth, n_intervals, n_types, 0.0, f64::INFINITY)?;
        check_table("death", &tables.death, n_intervals, n_types, 0.0, f64::INFINITY)?;
        check_table("sampling", &tables.sampling, n_intervals, n_types, 0.0, f64::INFINITY)?;
        check_table("removal_prob", &tables.removal_prob, n_intervals, n_types, 0.0, 1.0)?;
        check_table("rho", &tables.rho, n_intervals, n_types, 0.0, 1.0)?;
        check_matrix_table("migration", &tables.migration, n_intervals, n_types)?;
        check_matrix_table("cross_birth", &tables.cross_birth, n_intervals, n_types)?;

        let mut rho_sampling_times = Vec::new();
        for (i, row) in tables.rho.iter().enumerate() {
            if row.iter().any(|&r| r > 0.0) {
                let end = if i + 1 < n_intervals {
                    interval_start_times[i + 1]
                } else {
                    origin
                };
                rho_sampling_times.push(end);
            }
        }

        Ok(Self { n_types, origin, interval_start_times, tables, rho_sampling_times })
    }

    /// Single-interval schedule holding the same rates from origin to present.
    pub fn constant_rates(origin: f64, tables: RateTables) -> Result<Self> {
        Self::new(origin, vec![0.0], tables)
    }

    pub fn n_types(&self) -> usize {
        self.n_types
    }

    pub fn n_intervals(&self) -> usize {
        self.interval_start_times.len()
    }

    /// Total process time from origin to present.
    pub fn origin(&self) -> f64 {
        self.origin
    }

    pub fn interval_start_times(&self) -> &[f64] {
        &self.interval_start_times
    }

    /// End boundary of an interval; the present for the last one.
    pub fn interval_end_time(&self, interval: usize) -> f64 {
        if interval + 1 < self.interval_start_times.len() {
            self.interval_start_times[interval + 1]
        } else {
            self.origin
        }
    }

    /// Boundary times at which a mass-sampling event fires.
    pub fn rho_sampling_times(&self) -> &[f64] {
        &self.rho_sampling_times
    }

    /// Whether `t` coincides with a mass-sampling time.
    pub fn is_rho_sampling_time(&self, t: f64) -> bool {
        self.rho_sampling_times
            .iter()
            .any(|&rt| (rt - t).abs() < PRECISION_THRESHOLD)
    }

    /// Index of the interval containing `t`.
    ///
    /// A time exactly on a boundary belongs to the earlier interval; times
    /// outside the schedule clamp to the first/last interval.
    #[inline]
    pub fn interval_index(&self, t: f64) -> usize {
        let insertion = self.interval_start_times.partition_point(|&start| start < t);
        insertion.saturating_sub(1)
    }

    #[inline]
    pub fn birth(&self, interval: usize) -> &[f64] {
        &self.tables.birth[interval]
    }

    #[inline]
    pub fn death(&self, interval: usize) -> &[f64] {
        &self.tables.death[interval]
    }

    #[inline]
    pub fn sampling(&self, interval: usize) -> &[f64] {
        &self.tables.sampling[interval]
    }

    #[inline]
    pub fn removal_prob(&self, interval: usize) -> &[f64] {
        &self.tables.removal_prob[interval]
    }

    #[inline]
    pub fn rho(&self, interval: usize) -> &[f64] {
        &self.tables.rho[interval]
    }

    #[inline]
    pub fn migration(&self, interval: usize) -> &[Vec<f64>] {
        &self.tables.migration[interval]
    }

    #[inline]
    pub fn cross_birth(&self, interval: usize) -> &[Vec<f64>] {
        &self.tables.cross_birth[interval]
    }
}

fn check_table(
    name: &str,
    table: &[Vec<f64>],
    n_intervals: usize,
    n_types: usize,
    min: f64,
    max: f64,
) -> Result<()> {
    if table.len() != n_intervals {
        return Err(Error::InvalidParameterization(format!(
            "{name}: expected {n_intervals} interval rows, got {}",
            table.len()
        )));
    }
    for (i, row) in table.iter().enumerate() {
        if row.len() != n_types {
            return Err(Error::InvalidParameterization(format!(
                "{name}[{i}]: expected {n_types} entries, got {}",
                row.len()
            )));
        }
        for (k, &v) in row.iter().enumerate() {
            if !v.is_finite() || v < min || v > max {
                return Err(Error::InvalidParameterization(format!(
                    "{name}[{i}][{k}] = {v} is outside [{min}, {max}]"
                )));
            }
        }
    }
    Ok(())
}

fn check_matrix_table(
    name: &str,
    table: &[Vec<Vec<f64>>],
    n_intervals: usize,
    n_types: usize,
) -> Result<()> {
    if table.len() != n_intervals {
        return Err(Error::InvalidParameterization(format!(
            "{name}: expected {n_intervals} interval matrices, got {}",
            table.len()
        )));
    }
    for (i, matrix) in table.iter().enumerate() {
        if matrix.len() != n_types {
            return Err(Error::InvalidParameterization(format!(
                "{name}[{i}]: expected {n_types} rows, got {}",
                matrix.len()
            )));
        }
        for (a, row) in matrix.iter().enumerate() {
            if row.len() != n_types {
                return Err(Error::InvalidParameterization(format!(
                    "{name}[{i}][{a}]: expected {n_types} entries, got {}",
                    row.len()
                )));
            }
            for (b, &v) in row.iter().enumerate() {
                if a != b && (!v.is_finite() || v < 0.0) {
                    return Err(Error::InvalidParameterization(format!(
                        "{name}[{i}][{a}][{b}] = {v} must be finite and non-negative"
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_interval_schedule() -> Parameterization {
        let tables = RateTables {
            birth: vec![vec![2.0], vec![1.5]],
            death: vec![vec![1.0], vec![1.0]],
            sampling: vec![vec![0.5], vec![0.25]],
            removal_prob: vec![vec![1.0], vec![1.0]],
            rho: vec![vec![0.0], vec![0.1]],
            migration: vec![vec![vec![0.0]], vec![vec![0.0]]],
            cross_birth: vec![vec![vec![0.0]], vec![vec![0.0]]],
        };
        Parameterization::new(10.0, vec![0.0, 4.0], tables).unwrap()
    }

    #[test]
    fn interval_lookup_boundary_belongs_to_earlier() {
        let p = two_interval_schedule();
        assert_eq!(p.interval_index(0.0), 0);
        assert_eq!(p.interval_index(3.9), 0);
        assert_eq!(p.interval_index(4.0), 0);
        assert_eq!(p.interval_index(4.1), 1);
        assert_eq!(p.interval_index(10.0), 1);
        assert_eq!(p.interval_index(12.0), 1);
        assert_eq!(p.interval_index(-1.0), 0);
    }

    #[test]
    fn interval_end_times() {
        let p = two_interval_schedule();
        assert_eq!(p.interval_end_time(0), 4.0);
        assert_eq!(p.interval_end_time(1), 10.0);
    }

    #[test]
    fn rho_times_derived_from_tables() {
        let p = two_interval_schedule();
        assert_eq!(p.rho_sampling_times(), &[10.0]);
        assert!(p.is_rho_sampling_time(10.0));
        assert!(p.is_rho_sampling_time(10.0 + 1e-12));
        assert!(!p.is_rho_sampling_time(4.0));
    }

    #[test]
    fn rejects_unsorted_boundaries() {
        let tables = RateTables {
            birth: vec![vec![2.0], vec![1.5]],
            death: vec![vec![1.0], vec![1.0]],
            sampling: vec![vec![0.5], vec![0.25]],
            removal_prob: vec![vec![1.0], vec![1.0]],
            rho: vec![vec![0.0], vec![0.0]],
            migration: vec![vec![vec![0.0]], vec![vec![0.0]]],
            cross_birth: vec![vec![vec![0.0]], vec![vec![0.0]]],
        };
        assert!(Parameterization::new(10.0, vec![0.0, 0.0], tables.clone()).is_err());
        assert!(Parameterization::new(10.0, vec![4.0, 8.0], tables.clone()).is_err());
        assert!(Parameterization::new(3.0, vec![0.0, 4.0], tables).is_err());
    }

    #[test]
    fn rejects_out_of_range_rates() {
        let mut tables = RateTables {
            birth: vec![vec![2.0]],
            death: vec![vec![1.0]],
            sampling: vec![vec![0.5]],
            removal_prob: vec![vec![1.0]],
            rho: vec![vec![0.0]],
            migration: vec![vec![vec![0.0]]],
            cross_birth: vec![vec![vec![0.0]]],
        };
        tables.removal_prob[0][0] = 1.5;
        assert!(Parameterization::constant_rates(5.0, tables.clone()).is_err());
        tables.removal_prob[0][0] = 1.0;
        tables.birth[0][0] = f64::NAN;
        assert!(Parameterization::constant_rates(5.0, tables).is_err());
    }

    #[test]
    fn rejects_dimension_mismatch() {
        let tables = RateTables {
            birth: vec![vec![2.0, 2.0]],
            death: vec![vec![1.0]],
            sampling: vec![vec![0.5, 0.5]],
            removal_prob: vec![vec![1.0, 1.0]],
            rho: vec![vec![0.0, 0.0]],
            migration: vec![vec![vec![0.0, 0.1], vec![0.1, 0.0]]],
            cross_birth: vec![vec![vec![0.0, 0.0], vec![0.0, 0.0]]],
        };
        assert!(Parameterization::constant_rates(5.0, tables).is_err());
    }
}
