//! Frequency grid and per-row executor.
//!
//! Cells of one illumination row are independent: each starts from the same
//! prepared steady state and owns its simulations. They run on rayon's pool
//! unless the serial strategy is chosen; results come back in grid order.

use super::gate::{self, CellContext, GateReport};
use super::SweepParams;
use crate::device::{Collaborators, DeviceSolution};
use crate::error::{IsweepError, Result};
use rayon::prelude::*;

/// Log-spaced frequencies, strictly decreasing from start to end.
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyGrid(Vec<f64>);

impl FrequencyGrid {
    /// `points` frequencies spaced evenly in log10 from `start` down to `end`.
    /// Both endpoints are exact.
    pub fn log_spaced(start: f64, end: f64, points: usize) -> Result<Self> {
        if points == 0 {
            return Err(IsweepError::Config("frequency grid needs at least 1 point".into()));
        }
        if !(start.is_finite() && start > 0.0 && end.is_finite() && end > 0.0) {
            return Err(IsweepError::Config(format!(
                "frequencies must be positive and finite, got {start} .. {end}"
            )));
        }
        if points == 1 {
            if start != end {
                return Err(IsweepError::Config(format!(
                    "a single-point grid needs start == end, got {start} .. {end}"
                )));
            }
            return Ok(Self(vec![start]));
        }
        if start <= end {
            return Err(IsweepError::Config(format!(
                "start frequency {start} must exceed end frequency {end}"
            )));
        }

        let (a, b) = (start.log10(), end.log10());
        let step = (b - a) / (points - 1) as f64;
        let grid: Vec<f64> = (0..points)
            .map(|i| match i {
                0 => start,
                i if i == points - 1 => end,
                i => 10f64.powf(a + step * i as f64),
            })
            .collect();
        // Bounds too close for the point count round to repeated frequencies.
        if !grid.windows(2).all(|w| w[0] > w[1]) {
            return Err(IsweepError::Config(format!(
                "{points} points between {start} and {end} are not strictly decreasing"
            )));
        }
        Ok(Self(grid))
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, f64> {
        self.0.iter()
    }
}

/// How the cells of a row are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStrategy {
    Serial,
    /// Rayon work stealing; `threads` builds a dedicated pool, `None` uses
    /// the global one.
    Parallel { threads: Option<usize> },
}

impl Default for ExecutionStrategy {
    fn default() -> Self {
        ExecutionStrategy::Parallel { threads: None }
    }
}

/// Row of the sweep being evaluated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RowContext {
    pub intensity: f64,
    pub vdc: f64,
}

pub struct Executor {
    strategy: ExecutionStrategy,
    pool: Option<rayon::ThreadPool>,
}

impl Executor {
    pub fn new(strategy: ExecutionStrategy) -> Result<Self> {
        let pool = match strategy {
            ExecutionStrategy::Parallel { threads: Some(0) } => {
                return Err(IsweepError::Config("thread count must be at least 1".into()));
            }
            ExecutionStrategy::Parallel { threads: Some(n) } => Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .build()
                    .map_err(|e| IsweepError::Config(format!("failed to build thread pool: {e}")))?,
            ),
            _ => None,
        };
        Ok(Self { strategy, pool })
    }

    pub fn strategy(&self) -> ExecutionStrategy {
        self.strategy
    }

    /// Run the gate for every frequency of one row. The first failing cell
    /// aborts the row.
    pub fn run_row<S: DeviceSolution>(
        &self,
        tools: &Collaborators<'_, S>,
        prepared: &S,
        grid: &FrequencyGrid,
        row: RowContext,
        params: &SweepParams,
    ) -> Result<Vec<GateReport>> {
        let cell = |&frequency: &f64| {
            let ctx = CellContext {
                intensity: row.intensity,
                vdc: row.vdc,
                frequency,
            };
            gate::extract(tools, prepared, &ctx, params)
        };

        match (self.strategy, &self.pool) {
            (ExecutionStrategy::Serial, _) => grid.iter().map(cell).collect(),
            (ExecutionStrategy::Parallel { .. }, Some(pool)) => {
                pool.install(|| grid.as_slice().par_iter().map(cell).collect())
            }
            (ExecutionStrategy::Parallel { .. }, None) => {
                grid.as_slice().par_iter().map(cell).collect()
            }
        }
    }
}
