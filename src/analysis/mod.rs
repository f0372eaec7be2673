//! Impedance spectroscopy sweep over illumination and frequency.
//!
//! Illumination rows are handled by [`illumination`], the frequency columns of
//! a row by [`frequency`], each cell by the extraction [`gate`]. Once every
//! cell is filled, [`derive`] turns the harmonic matrices into impedance and
//! capacitance.

pub mod derive;
pub mod frequency;
pub mod gate;
pub mod illumination;

use crate::error::{IsweepError, Result};
use crate::ir::{Channel, Channels, ExtractionMethod};
use frequency::ExecutionStrategy;

/// Default phase distance (rad) from 0 or π/2 below which an extraction is
/// considered numerically marginal.
pub const PHASE_EPSILON: f64 = 0.006;

/// Smallest accepted initial tolerance. Escalations still tighten below it,
/// from a warm oscillating state.
pub const MIN_TOLERANCE: f64 = 1e-10;

/// Parameters of one impedance sweep, fixed for every cell.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepParams {
    /// Highest frequency (Hz), first column.
    pub start_freq: f64,
    /// Lowest frequency (Hz), last column.
    pub end_freq: f64,
    /// Number of log-spaced frequency points.
    pub points: usize,
    /// Voltage oscillation amplitude (V).
    pub delta_v: f64,
    /// Zero the ionic mobility before perturbing.
    pub freeze_ions: bool,
    /// Preferred harmonic extraction method.
    pub method: ExtractionMethod,
    pub periods: usize,
    pub samples_per_period: usize,
    /// Initial integrator tolerance, at least [`MIN_TOLERANCE`].
    pub tolerance: f64,
    pub phase_epsilon: f64,
    pub strategy: ExecutionStrategy,
}

impl Default for SweepParams {
    fn default() -> Self {
        Self {
            start_freq: 1e6,
            end_freq: 1e-1,
            points: 29,
            delta_v: 2e-3,
            freeze_ions: false,
            method: ExtractionMethod::Demodulation,
            periods: 20,
            samples_per_period: 40,
            tolerance: 1e-8,
            phase_epsilon: PHASE_EPSILON,
            strategy: ExecutionStrategy::default(),
        }
    }
}

impl SweepParams {
    /// Reject malformed parameters before any simulation starts.
    pub fn validate(&self) -> Result<()> {
        if !(self.delta_v.is_finite() && self.delta_v != 0.0) {
            return Err(IsweepError::Config(format!(
                "oscillation amplitude must be finite and non-zero, got {}",
                self.delta_v
            )));
        }
        if self.periods == 0 {
            return Err(IsweepError::Config("periods must be at least 1".into()));
        }
        if self.samples_per_period < 4 {
            return Err(IsweepError::Config(format!(
                "samples_per_period must be at least 4, got {}",
                self.samples_per_period
            )));
        }
        if !(self.tolerance.is_finite() && self.tolerance > 0.0) {
            return Err(IsweepError::Config(format!(
                "tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        // A cold start from the steady state cannot hold a tighter bound at
        // low frequency.
        if self.tolerance < MIN_TOLERANCE {
            return Err(IsweepError::Config(format!(
                "tolerance must be at least {MIN_TOLERANCE:e}, got {:e}",
                self.tolerance
            )));
        }
        if !(self.phase_epsilon.is_finite() && self.phase_epsilon >= 0.0) {
            return Err(IsweepError::Config(format!(
                "phase_epsilon must be non-negative, got {}",
                self.phase_epsilon
            )));
        }
        // Grid bounds are checked when the grid is built.
        frequency::FrequencyGrid::log_spaced(self.start_freq, self.end_freq, self.points)?;
        Ok(())
    }

    /// Recorded samples per run, both endpoints included.
    pub fn time_points(&self) -> usize {
        self.periods * self.samples_per_period + 1
    }
}

/// Dense (illumination × frequency) matrix whose cells are written once.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultMatrix {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
    written: Vec<bool>,
}

impl ResultMatrix {
    /// Preallocate an unwritten matrix.
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![f64::NAN; rows * cols],
            written: vec![false; rows * cols],
        }
    }

    /// Build a fully written matrix from a cell function.
    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> f64) -> Self {
        let mut m = Self::new(rows, cols);
        for i in 0..rows {
            for j in 0..cols {
                m.set(i, j, f(i, j));
            }
        }
        m
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.cols + col]
    }

    /// Write a cell. Writing a cell twice is a bug; it panics in debug builds
    /// and overwrites in release builds.
    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        let idx = row * self.cols + col;
        debug_assert!(!self.written[idx], "cell ({row}, {col}) written twice");
        self.data[idx] = value;
        self.written[idx] = true;
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[row * self.cols..(row + 1) * self.cols]
    }

    /// Row-major cell values.
    pub fn values(&self) -> &[f64] {
        &self.data
    }

    /// Every cell has been written.
    pub fn is_complete(&self) -> bool {
        self.written.iter().all(|&w| w)
    }
}

/// Raw harmonic matrices of one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct HarmonicMatrices {
    pub bias: ResultMatrix,
    pub amplitude: ResultMatrix,
    /// Phase in radians.
    pub phase: ResultMatrix,
}

impl HarmonicMatrices {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            bias: ResultMatrix::new(rows, cols),
            amplitude: ResultMatrix::new(rows, cols),
            phase: ResultMatrix::new(rows, cols),
        }
    }
}

/// Impedance and capacitance of one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ImpedanceMatrices {
    pub impedance_abs: ResultMatrix,
    pub impedance_re: ResultMatrix,
    pub impedance_im: ResultMatrix,
    pub capacitance: ResultMatrix,
}

/// A cell whose channel amplitude was zero or not finite. Its impedance and
/// capacitance are NaN.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DegenerateCell {
    pub channel: Channel,
    pub illumination: usize,
    pub frequency: usize,
}

/// Output of a full illumination × frequency sweep.
#[derive(Debug, Clone)]
pub struct SweepResult {
    /// Light intensity of each row (suns).
    pub intensities: Vec<f64>,
    /// DC bias voltage of each row (V).
    pub vdc: Vec<f64>,
    /// Frequency of each cell (Hz), identical across rows.
    pub frequencies: ResultMatrix,
    /// Simulated time span of the final run of each cell (s).
    pub max_time: ResultMatrix,
    pub harmonics: Channels<HarmonicMatrices>,
    pub impedance: Channels<ImpedanceMatrices>,
    pub periods: usize,
    pub samples_per_period: usize,
    /// Samples per run, both endpoints included.
    pub time_points: usize,
    /// 0-based row positions whose intensity is exactly 1 sun. Intensities
    /// `[0, 0.1, 1, 1]` give `[2, 3]`; add one for 1-based row numbers.
    pub sun_index: Vec<usize>,
    pub delta_v: f64,
    pub tolerance: f64,
    pub method: ExtractionMethod,
    pub frozen_ions: bool,
    pub degenerate_cells: Vec<DegenerateCell>,
}

impl SweepResult {
    pub fn n_illuminations(&self) -> usize {
        self.intensities.len()
    }

    pub fn n_frequencies(&self) -> usize {
        self.frequencies.shape().1
    }

    /// Frequency grid (the first row of `frequencies`).
    pub fn frequency_grid(&self) -> &[f64] {
        self.frequencies.row(0)
    }

    /// All matrices in the record, labelled, for shape checks and reports.
    pub fn matrices(&self) -> Vec<(String, &ResultMatrix)> {
        let mut out = vec![
            ("frequency".to_string(), &self.frequencies),
            ("max_time".to_string(), &self.max_time),
        ];
        for (ch, h) in self.harmonics.iter() {
            out.push((format!("{}_bias", ch.name()), &h.bias));
            out.push((format!("{}_amplitude", ch.name()), &h.amplitude));
            out.push((format!("{}_phase", ch.name()), &h.phase));
        }
        for (ch, z) in self.impedance.iter() {
            out.push((format!("{}_impedance_abs", ch.name()), &z.impedance_abs));
            out.push((format!("{}_impedance_re", ch.name()), &z.impedance_re));
            out.push((format!("{}_impedance_im", ch.name()), &z.impedance_im));
            out.push((format!("{}_capacitance", ch.name()), &z.capacitance));
        }
        out
    }
}
