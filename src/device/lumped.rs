//! Lumped equivalent-circuit model of a perovskite solar cell.
//!
//! Two state variables: the junction voltage `v` across the geometric
//! capacitance and the voltage `q` across the ionic capacitance.
//!
//!   J        = (V(t) - v) / Rs                 terminal current
//!   J_ion    = μ (v - q) / R_ion               ionic drift
//!   J_rec    = J0 (exp(v / n·Vt) - 1)          recombination
//!   Cg dv/dt = J - J_ion - J_rec + J_ph        accumulation
//!   C_ion dq/dt = J_ion
//!
//! Oscillating runs are integrated with Backward Euler (BE) and adaptive
//! timestep control from a local truncation error (LTE) estimate. Implicit
//! steps are solved with a 2×2 Newton iteration.

use super::{Asymmetrizer, BiasExtractor, DeviceSimulator, DeviceSolution};
use crate::error::{IsweepError, Result};
use crate::harmonic::{Trace, TraceSource};
use crate::ir::{Channels, Perturbation};
use serde::Deserialize;
use std::f64::consts::PI;

/// Per-area device parameters (Ω·cm², F/cm², A/cm²).
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct LumpedParams {
    pub series_resistance: f64,
    pub geometric_capacitance: f64,
    pub saturation_current: f64,
    pub ideality: f64,
    pub thermal_voltage: f64,
    /// Photocurrent at 1 sun.
    pub photocurrent: f64,
    /// Ionic branch resistance at unit mobility.
    pub ionic_resistance: f64,
    pub ionic_capacitance: f64,
    /// Relative ion mobility; 0 freezes the ionic branch.
    pub ion_mobility: f64,
}

impl Default for LumpedParams {
    fn default() -> Self {
        Self {
            series_resistance: 1.0,
            geometric_capacitance: 1e-7,
            saturation_current: 1e-12,
            ideality: 1.5,
            thermal_voltage: 0.025_85,
            photocurrent: 0.02,
            ionic_resistance: 1e3,
            ionic_capacitance: 1e-5,
            ion_mobility: 1.0,
        }
    }
}

impl LumpedParams {
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("series_resistance", self.series_resistance),
            ("geometric_capacitance", self.geometric_capacitance),
            ("saturation_current", self.saturation_current),
            ("ideality", self.ideality),
            ("thermal_voltage", self.thermal_voltage),
            ("ionic_resistance", self.ionic_resistance),
            ("ionic_capacitance", self.ionic_capacitance),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(IsweepError::Config(format!(
                    "device parameter {name} must be positive, got {value}"
                )));
            }
        }
        for (name, value) in [("photocurrent", self.photocurrent), ("ion_mobility", self.ion_mobility)] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(IsweepError::Config(format!(
                    "device parameter {name} must be non-negative, got {value}"
                )));
            }
        }
        Ok(())
    }

    fn photocurrent_at(&self, intensity: f64) -> f64 {
        self.photocurrent * intensity
    }

    fn recombination(&self, v: f64) -> f64 {
        self.saturation_current * ((v / self.slope_voltage()).exp() - 1.0)
    }

    fn recombination_slope(&self, v: f64) -> f64 {
        self.saturation_current * (v / self.slope_voltage()).exp() / self.slope_voltage()
    }

    fn slope_voltage(&self) -> f64 {
        self.ideality * self.thermal_voltage
    }

    fn ionic_conductance(&self) -> f64 {
        self.ion_mobility / self.ionic_resistance
    }

    /// Junction voltage with zero terminal current.
    pub fn open_circuit_voltage(&self, intensity: f64) -> f64 {
        self.slope_voltage() * (self.photocurrent_at(intensity) / self.saturation_current).ln_1p()
    }

    /// Junction voltage where `(V - v)/Rs = J_rec(v) - J_ph`.
    ///
    /// The residual is strictly decreasing in `v`, so bisection on a wide
    /// bracket always converges.
    fn junction_at_bias(&self, applied: f64, jph: f64) -> f64 {
        let residual = |v: f64| (applied - v) / self.series_resistance - self.recombination(v) + jph;
        let mut lo = -(applied.abs() + 10.0);
        let mut hi = applied.abs() + 10.0;
        for _ in 0..200 {
            let mid = 0.5 * (lo + hi);
            if hi - lo <= 1e-15 * (1.0 + mid.abs()) {
                break;
            }
            if residual(mid) > 0.0 {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        0.5 * (lo + hi)
    }

    /// Parameters of the mirrored stack: two half devices back to back.
    fn mirrored(&self) -> Self {
        Self {
            series_resistance: 2.0 * self.series_resistance,
            geometric_capacitance: 0.5 * self.geometric_capacitance,
            ionic_resistance: 2.0 * self.ionic_resistance,
            ionic_capacitance: 0.5 * self.ionic_capacitance,
            ..*self
        }
    }

    fn halved(&self) -> Self {
        Self {
            series_resistance: 0.5 * self.series_resistance,
            geometric_capacitance: 2.0 * self.geometric_capacitance,
            ionic_resistance: 0.5 * self.ionic_resistance,
            ionic_capacitance: 2.0 * self.ionic_capacitance,
            ..*self
        }
    }

    /// Time derivative of `[v, q]` at terminal voltage `applied`.
    fn rhs(&self, jph: f64, applied: f64, x: [f64; 2]) -> [f64; 2] {
        let j = (applied - x[0]) / self.series_resistance;
        let j_ion = self.ionic_conductance() * (x[0] - x[1]);
        [
            (j - j_ion - self.recombination(x[0]) + jph) / self.geometric_capacitance,
            j_ion / self.ionic_capacitance,
        ]
    }

    fn jacobian(&self, x: [f64; 2]) -> [[f64; 2]; 2] {
        let g_ion = self.ionic_conductance();
        let cg = self.geometric_capacitance;
        let ci = self.ionic_capacitance;
        [
            [
                (-1.0 / self.series_resistance - g_ion - self.recombination_slope(x[0])) / cg,
                g_ion / cg,
            ],
            [g_ion / ci, -g_ion / ci],
        ]
    }

    /// Channel currents at terminal voltage `applied`.
    fn currents(&self, jph: f64, applied: f64, x: [f64; 2]) -> [f64; 4] {
        let j = (applied - x[0]) / self.series_resistance;
        let j_ion = self.ionic_conductance() * (x[0] - x[1]);
        let j_rec = self.recombination(x[0]);
        [j, j_ion, j_rec, j - j_ion - j_rec + jph]
    }
}

/// Steady-state or oscillating solution of the lumped device.
#[derive(Debug, Clone)]
pub struct LumpedSolution {
    pub params: LumpedParams,
    /// Light intensity in suns.
    pub intensity: f64,
    /// DC terminal voltage the drive oscillates around.
    pub applied_voltage: f64,
    pub junction_voltage: f64,
    pub ionic_voltage: f64,
    /// Mirrored open-circuit representation (see [`LumpedSolution::mirrored_open_circuit`]).
    pub mirrored: bool,
    /// Samples of the last oscillating run.
    pub trace: Option<Trace>,
}

impl LumpedSolution {
    /// Steady state at a fixed terminal voltage.
    pub fn at_bias(params: LumpedParams, intensity: f64, applied_voltage: f64) -> Result<Self> {
        params.validate()?;
        check_intensity(intensity)?;
        if !applied_voltage.is_finite() {
            return Err(IsweepError::Config(format!(
                "applied voltage must be finite, got {applied_voltage}"
            )));
        }
        let v = params.junction_at_bias(applied_voltage, params.photocurrent_at(intensity));
        Ok(Self {
            params,
            intensity,
            applied_voltage,
            junction_voltage: v,
            ionic_voltage: v,
            mirrored: false,
            trace: None,
        })
    }

    /// Steady state with zero terminal current.
    pub fn open_circuit(params: LumpedParams, intensity: f64) -> Result<Self> {
        params.validate()?;
        check_intensity(intensity)?;
        let voc = params.open_circuit_voltage(intensity);
        Ok(Self {
            params,
            intensity,
            applied_voltage: voc,
            junction_voltage: voc,
            ionic_voltage: voc,
            mirrored: false,
            trace: None,
        })
    }

    /// Open circuit expressed as a symmetric stack of two mirrored half
    /// devices. The contacts are equivalent, so the terminal voltage is zero
    /// and each half sits at Voc.
    pub fn mirrored_open_circuit(params: LumpedParams, intensity: f64) -> Result<Self> {
        let half = Self::open_circuit(params, intensity)?;
        Ok(Self {
            params: params.mirrored(),
            applied_voltage: 0.0,
            mirrored: true,
            ..half
        })
    }

    /// Steady-state terminal current `J_rec - J_ph`.
    pub fn terminal_current(&self) -> f64 {
        self.params.recombination(self.junction_voltage)
            - self.params.photocurrent_at(self.intensity)
    }
}

fn check_intensity(intensity: f64) -> Result<()> {
    if intensity.is_finite() && intensity >= 0.0 {
        Ok(())
    } else {
        Err(IsweepError::Config(format!(
            "light intensity must be non-negative, got {intensity}"
        )))
    }
}

impl DeviceSolution for LumpedSolution {
    fn freeze_ions(&mut self) {
        self.params.ion_mobility = 0.0;
    }

    fn max_time(&self) -> f64 {
        self.trace.as_ref().map_or(0.0, Trace::max_time)
    }
}

impl TraceSource for LumpedSolution {
    fn trace(&self) -> Option<&Trace> {
        self.trace.as_ref()
    }
}

/// Simulator, bias extractor and asymmetrizer for [`LumpedSolution`].
#[derive(Debug, Clone, Copy)]
pub struct LumpedDevice {
    pub max_newton_iterations: usize,
    pub max_consecutive_failures: usize,
}

impl Default for LumpedDevice {
    fn default() -> Self {
        Self {
            max_newton_iterations: 50,
            max_consecutive_failures: 10,
        }
    }
}

impl LumpedDevice {
    /// Solve `x1 = x0 + h f(x1)` by Newton iteration.
    ///
    /// Returns `None` when Newton fails; the caller shrinks the step.
    fn backward_euler(
        &self,
        p: &LumpedParams,
        jph: f64,
        applied: f64,
        x0: [f64; 2],
        h: f64,
    ) -> Option<[f64; 2]> {
        let mut x = x0;
        for _ in 0..self.max_newton_iterations {
            let f = p.rhs(jph, applied, x);
            let g = [x[0] - x0[0] - h * f[0], x[1] - x0[1] - h * f[1]];
            let jac = p.jacobian(x);
            let m = [
                [1.0 - h * jac[0][0], -h * jac[0][1]],
                [-h * jac[1][0], 1.0 - h * jac[1][1]],
            ];
            let det = m[0][0] * m[1][1] - m[0][1] * m[1][0];
            if !det.is_finite() || det.abs() < 1e-300 {
                return None;
            }
            // Limit junction voltage updates so exp() stays in range.
            let dv = ((g[0] * m[1][1] - m[0][1] * g[1]) / det).clamp(-0.1, 0.1);
            let dq = (m[0][0] * g[1] - m[1][0] * g[0]) / det;
            x = [x[0] - dv, x[1] - dq];
            if !(x[0].is_finite() && x[1].is_finite()) {
                return None;
            }
            if dv.abs().max(dq.abs()) <= 1e-13 * (1.0 + x[0].abs().max(x[1].abs())) {
                return Some(x);
            }
        }
        None
    }
}

impl DeviceSimulator<LumpedSolution> for LumpedDevice {
    /// Integrate with step-doubled Backward Euler.
    ///
    /// Each step solves one full BE step and two half steps. Their difference
    /// is the LTE estimate; the accepted state is the Richardson extrapolation
    /// `2·x_half - x_full`, which is second order and keeps BE's damping of
    /// the stiff junction mode.
    fn simulate(&self, start: &LumpedSolution, drive: &Perturbation) -> Result<LumpedSolution> {
        if start.mirrored {
            return Err(IsweepError::Simulation(
                "mirrored solution must be halved before perturbation".into(),
            ));
        }
        if !(drive.frequency.is_finite() && drive.frequency > 0.0) {
            return Err(IsweepError::Simulation(format!(
                "drive frequency must be positive, got {}",
                drive.frequency
            )));
        }
        if drive.periods == 0 || drive.samples_per_period == 0 || drive.tolerance.is_nan() || drive.tolerance <= 0.0 {
            return Err(IsweepError::Simulation(format!(
                "invalid drive: {} periods, {} samples per period, tolerance {}",
                drive.periods, drive.samples_per_period, drive.tolerance
            )));
        }
        let _span = tracing::debug_span!("lumped_transient", frequency = drive.frequency).entered();

        let p = &start.params;
        let jph = p.photocurrent_at(start.intensity);
        let omega = 2.0 * PI * drive.frequency;
        let vdc = start.applied_voltage;
        let applied = |t: f64| vdc + drive.amplitude * (omega * t).sin();

        let dt_sample = 1.0 / (drive.frequency * drive.samples_per_period as f64);
        let n_samples = drive.time_points();
        let h_max = dt_sample;
        let h_min = dt_sample * 1e-6;

        let mut times = Vec::with_capacity(n_samples);
        let mut series: [Vec<f64>; 4] = std::array::from_fn(|_| Vec::with_capacity(n_samples));
        let mut record = |t: f64, x: [f64; 2], times: &mut Vec<f64>| {
            times.push(t);
            for (s, value) in series.iter_mut().zip(p.currents(jph, applied(t), x)) {
                s.push(value);
            }
        };

        let mut x = [start.junction_voltage, start.ionic_voltage];
        let mut t = 0.0;
        let mut h = h_max * 1e-2;
        let mut consecutive_failures = 0;
        record(0.0, x, &mut times);

        for k in 1..n_samples {
            let t_target = k as f64 * dt_sample;
            while t < t_target {
                let remaining = t_target - t;
                let clamped = h >= remaining;
                let h_step = if clamped { remaining } else { h };
                let half = 0.5 * h_step;

                let attempt = self
                    .backward_euler(p, jph, applied(t + h_step), x, h_step)
                    .and_then(|full| {
                        let mid = self.backward_euler(p, jph, applied(t + half), x, half)?;
                        let fine = self.backward_euler(p, jph, applied(t + h_step), mid, half)?;
                        Some((full, fine, compute_lte(&full, &fine)))
                    });
                let lte_tol = drive.tolerance * (1.0 + x[0].abs().max(x[1].abs()));

                match attempt {
                    Some((full, fine, lte)) if lte <= lte_tol => {
                        consecutive_failures = 0;
                        x = [2.0 * fine[0] - full[0], 2.0 * fine[1] - full[1]];
                        t = if clamped { t_target } else { t + h_step };
                        let proposal =
                            (h_step * step_factor(lte_tol, lte).clamp(0.5, 2.0)).clamp(h_min, h_max);
                        h = if clamped { h.max(proposal).min(h_max) } else { proposal };
                    }
                    rejected => {
                        consecutive_failures += 1;
                        if consecutive_failures >= self.max_consecutive_failures
                            && h_step <= h_min * 1.01
                        {
                            return Err(IsweepError::Simulation(format!(
                                "{consecutive_failures} consecutive failures at minimum timestep h_min={h_min:.2e} near t={t:.2e}"
                            )));
                        }
                        let factor = rejected
                            .map_or(0.25, |(_, _, lte)| step_factor(lte_tol, lte).clamp(0.1, 0.5));
                        h = (h_step * factor).max(h_min);
                    }
                }
            }
            record(t_target, x, &mut times);
        }

        let [total, ionic, recombination, accumulation] = series;
        Ok(LumpedSolution {
            junction_voltage: x[0],
            ionic_voltage: x[1],
            trace: Some(Trace {
                frequency: drive.frequency,
                periods: drive.periods,
                samples_per_period: drive.samples_per_period,
                times,
                currents: Channels {
                    total,
                    ionic,
                    recombination,
                    accumulation,
                },
            }),
            ..start.clone()
        })
    }
}

impl BiasExtractor<LumpedSolution> for LumpedDevice {
    /// Terminal voltage `v + Rs·J` of a steady state; zero for a mirrored stack.
    fn bias(&self, state: &LumpedSolution) -> Result<f64> {
        if state.mirrored {
            return Ok(0.0);
        }
        Ok(state.junction_voltage + state.params.series_resistance * state.terminal_current())
    }
}

impl Asymmetrizer<LumpedSolution> for LumpedDevice {
    fn halve(&self, state: &LumpedSolution) -> Result<LumpedSolution> {
        if !state.mirrored {
            return Err(IsweepError::Simulation(
                "halve called on a solution that is not mirrored".into(),
            ));
        }
        let params = state.params.halved();
        let mut half = LumpedSolution {
            params,
            mirrored: false,
            trace: None,
            ..state.clone()
        };
        half.applied_voltage =
            half.junction_voltage + params.series_resistance * half.terminal_current();
        Ok(half)
    }
}

/// LTE = ||x_full - x_half||_inf
fn compute_lte(x_full: &[f64; 2], x_half: &[f64; 2]) -> f64 {
    x_full
        .iter()
        .zip(x_half.iter())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0f64, f64::max)
}

/// Step scale for a first-order error estimate; infinite when `lte == 0`.
fn step_factor(lte_tol: f64, lte: f64) -> f64 {
    0.9 * (lte_tol / lte).sqrt()
}
