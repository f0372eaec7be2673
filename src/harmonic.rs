//! Harmonic analysis of sampled current traces.
//!
//! Recovers (bias, amplitude, phase) of each current channel at the drive
//! frequency, modelling every channel as `bias + A sin(ωt + φ)`:
//!   - Demodulation: remove the mean, project onto sin(ωt) and cos(ωt) over
//!     whole periods.
//!   - Fit: linear least squares of offset + linear drift + sin + cos.
//!
//! Only the trailing part of the run is analysed so the start-up transient
//! does not leak into the result.

use crate::device::HarmonicAnalyzer;
use crate::error::{IsweepError, Result};
use crate::ir::{Channel, ChannelTriples, Channels, ExtractionMethod, HarmonicTriple};
use std::f64::consts::PI;

/// Current samples recorded by an oscillating run.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    /// Drive frequency (Hz).
    pub frequency: f64,
    pub periods: usize,
    pub samples_per_period: usize,
    /// `periods * samples_per_period + 1` sample times starting at 0.
    pub times: Vec<f64>,
    /// Per-channel current at each sample time.
    pub currents: Channels<Vec<f64>>,
}

impl Trace {
    pub fn max_time(&self) -> f64 {
        self.times.last().copied().unwrap_or(0.0)
    }
}

/// Solutions that carry a recorded current trace.
pub trait TraceSource {
    fn trace(&self) -> Option<&Trace>;
}

/// Reference analyzer working on any [`TraceSource`].
#[derive(Debug, Clone, Copy)]
pub struct TraceAnalyzer {
    /// Fraction of the simulated periods (from the end) that is analysed.
    pub window_fraction: f64,
}

impl Default for TraceAnalyzer {
    fn default() -> Self {
        Self {
            window_fraction: 0.5,
        }
    }
}

impl TraceAnalyzer {
    /// Sample range `[start, end)` covering the analysed whole periods.
    fn window(&self, trace: &Trace) -> Result<(usize, usize)> {
        let m = trace.samples_per_period;
        let p = trace.periods;
        if p == 0 || m < 4 {
            return Err(IsweepError::Analysis(format!(
                "trace too short: {p} periods of {m} samples"
            )));
        }
        let expected = p * m + 1;
        if trace.times.len() != expected {
            return Err(IsweepError::Analysis(format!(
                "trace has {} samples, expected {expected}",
                trace.times.len()
            )));
        }
        for (ch, series) in trace.currents.iter() {
            if series.len() != expected {
                return Err(IsweepError::Analysis(format!(
                    "{} current has {} samples, expected {expected}",
                    ch.name(),
                    series.len()
                )));
            }
        }
        let k = ((p as f64 * self.window_fraction).ceil() as usize).clamp(1, p);
        Ok(((p - k) * m, p * m))
    }
}

impl<S: TraceSource + Sync> HarmonicAnalyzer<S> for TraceAnalyzer {
    fn extract(
        &self,
        oscillation: &S,
        minimal: bool,
        method: ExtractionMethod,
    ) -> Result<ChannelTriples> {
        let trace = oscillation
            .trace()
            .ok_or_else(|| IsweepError::Analysis("solution has no current trace".into()))?;
        let (start, end) = self.window(trace)?;

        Channels::try_from_fn(|ch: Channel| -> Result<HarmonicTriple> {
            let values = &trace.currents.get(ch)[..];
            let triple = match method {
                // The trailing endpoint duplicates the first sample of a period.
                ExtractionMethod::Demodulation => {
                    demodulate(&trace.times[start..end], &values[start..end], trace.frequency)
                }
                ExtractionMethod::Fit => {
                    fit(&trace.times[start..=end], &values[start..=end], trace.frequency)?
                }
            };
            if !minimal {
                let rms = residual_rms(
                    &trace.times[start..=end],
                    &values[start..=end],
                    trace.frequency,
                    &triple,
                );
                tracing::debug!(channel = ch.name(), %method, rms, "harmonic residual");
            }
            Ok(triple)
        })
    }
}

/// Demodulate a signal sampled uniformly over whole periods.
pub fn demodulate(times: &[f64], values: &[f64], frequency: f64) -> HarmonicTriple {
    let omega = 2.0 * PI * frequency;
    let n = values.len() as f64;
    let bias = values.iter().sum::<f64>() / n;

    let (mut s, mut c) = (0.0, 0.0);
    for (&t, &y) in times.iter().zip(values) {
        let (sin, cos) = (omega * t).sin_cos();
        s += (y - bias) * sin;
        c += (y - bias) * cos;
    }
    s *= 2.0 / n;
    c *= 2.0 / n;

    HarmonicTriple::new(bias, s.hypot(c), c.atan2(s))
}

/// Least-squares fit of `b + d·τ + s·sin(ωt) + c·cos(ωt)`.
///
/// τ is time normalised to [-1/2, 1/2] over the window, so the reported bias
/// is the offset at the window midpoint.
pub fn fit(times: &[f64], values: &[f64], frequency: f64) -> Result<HarmonicTriple> {
    if times.len() < 4 {
        return Err(IsweepError::Analysis(format!(
            "fit needs at least 4 samples, got {}",
            times.len()
        )));
    }
    let t0 = times[0];
    let t1 = times[times.len() - 1];
    let span = t1 - t0;
    if span <= 0.0 {
        return Err(IsweepError::Analysis("fit window has zero duration".into()));
    }
    let mid = 0.5 * (t0 + t1);
    let omega = 2.0 * PI * frequency;

    let mut ata = [[0.0_f64; 4]; 4];
    let mut atb = [0.0_f64; 4];
    for (&t, &y) in times.iter().zip(values) {
        let (sin, cos) = (omega * t).sin_cos();
        let row = [1.0, (t - mid) / span, sin, cos];
        for i in 0..4 {
            atb[i] += row[i] * y;
            for j in 0..4 {
                ata[i][j] += row[i] * row[j];
            }
        }
    }

    let [b, _drift, s, c] = solve_dense(ata, atb)?;
    Ok(HarmonicTriple::new(b, s.hypot(c), c.atan2(s)))
}

/// Gaussian elimination with partial pivoting on a small dense system.
fn solve_dense<const N: usize>(mut a: [[f64; N]; N], mut b: [f64; N]) -> Result<[f64; N]> {
    for k in 0..N {
        let mut max_val = a[k][k].abs();
        let mut max_row = k;
        for i in (k + 1)..N {
            if a[i][k].abs() > max_val {
                max_val = a[i][k].abs();
                max_row = i;
            }
        }

        if max_val < 1e-300 {
            return Err(IsweepError::Analysis("singular fit matrix".into()));
        }

        if max_row != k {
            a.swap(k, max_row);
            b.swap(k, max_row);
        }

        for i in (k + 1)..N {
            let factor = a[i][k] / a[k][k];
            a[i][k] = 0.0;
            for j in (k + 1)..N {
                let akj = a[k][j];
                a[i][j] -= factor * akj;
            }
            let bk = b[k];
            b[i] -= factor * bk;
        }
    }

    let mut x = [0.0; N];
    for i in (0..N).rev() {
        let mut sum = b[i];
        for j in (i + 1)..N {
            sum -= a[i][j] * x[j];
        }
        x[i] = sum / a[i][i];
    }
    Ok(x)
}

fn residual_rms(times: &[f64], values: &[f64], frequency: f64, triple: &HarmonicTriple) -> f64 {
    let omega = 2.0 * PI * frequency;
    let sum: f64 = times
        .iter()
        .zip(values)
        .map(|(&t, &y)| {
            let model = triple.bias + triple.amplitude * (omega * t + triple.phase).sin();
            (y - model).powi(2)
        })
        .sum();
    (sum / values.len() as f64).sqrt()
}
