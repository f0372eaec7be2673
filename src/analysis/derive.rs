//! Impedance and capacitance derived from the harmonic matrices.
//!
//!   |Z| = |ΔV / A|
//!   Z   = |Z| · e^{-iφ}
//!   C   = sin φ / (2π f |Z|)
//!
//! A phase of +π/2 is a purely capacitive response. A zero or non-finite
//! amplitude has no impedance, nor does one so small that |Z| overflows;
//! such cells are NaN and reported.

use super::{DegenerateCell, HarmonicMatrices, ImpedanceMatrices, ResultMatrix};
use crate::ir::{Channel, Channels, HarmonicTriple};
use num_complex::Complex64;
use std::f64::consts::PI;

/// Impedance of a single cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellImpedance {
    pub abs: f64,
    pub re: f64,
    pub im: f64,
    pub capacitance: f64,
}

impl CellImpedance {
    const UNDEFINED: CellImpedance = CellImpedance {
        abs: f64::NAN,
        re: f64::NAN,
        im: f64::NAN,
        capacitance: f64::NAN,
    };

    /// `None` when the current amplitude is zero or not finite, or when it is
    /// small enough that `|ΔV / A|` overflows.
    pub fn from_harmonic(triple: &HarmonicTriple, frequency: f64, delta_v: f64) -> Option<Self> {
        if !(triple.amplitude.is_finite() && triple.amplitude != 0.0) {
            return None;
        }
        let abs = (delta_v / triple.amplitude).abs();
        if !abs.is_finite() {
            return None;
        }
        let z = Complex64::from_polar(abs, -triple.phase);
        Some(Self {
            abs,
            re: z.re,
            im: z.im,
            capacitance: triple.phase.sin() / (2.0 * PI * frequency * abs),
        })
    }
}

/// Derive the impedance matrices of every channel.
///
/// `frequencies` is the grid shared by all rows.
pub fn derive_all(
    harmonics: &Channels<HarmonicMatrices>,
    frequencies: &[f64],
    delta_v: f64,
) -> (Channels<ImpedanceMatrices>, Vec<DegenerateCell>) {
    let mut degenerate = Vec::new();
    let impedance =
        harmonics.map(|ch, h| derive_channel(ch, h, frequencies, delta_v, &mut degenerate));
    (impedance, degenerate)
}

fn derive_channel(
    channel: Channel,
    harmonics: &HarmonicMatrices,
    frequencies: &[f64],
    delta_v: f64,
    degenerate: &mut Vec<DegenerateCell>,
) -> ImpedanceMatrices {
    let (rows, cols) = harmonics.amplitude.shape();
    let mut cells = Vec::with_capacity(rows * cols);
    for i in 0..rows {
        for (j, &frequency) in frequencies.iter().enumerate().take(cols) {
            let triple = HarmonicTriple::new(
                harmonics.bias.get(i, j),
                harmonics.amplitude.get(i, j),
                harmonics.phase.get(i, j),
            );
            let cell = CellImpedance::from_harmonic(&triple, frequency, delta_v)
                .unwrap_or_else(|| {
                    tracing::warn!(
                        channel = channel.name(),
                        illumination = i,
                        frequency,
                        amplitude = triple.amplitude,
                        "zero current amplitude, impedance undefined"
                    );
                    degenerate.push(DegenerateCell {
                        channel,
                        illumination: i,
                        frequency: j,
                    });
                    CellImpedance::UNDEFINED
                });
            cells.push(cell);
        }
    }

    let pick = |f: fn(&CellImpedance) -> f64| {
        ResultMatrix::from_fn(rows, cols, |i, j| f(&cells[i * cols + j]))
    };
    ImpedanceMatrices {
        impedance_abs: pick(|c| c.abs),
        impedance_re: pick(|c| c.re),
        impedance_im: pick(|c| c.im),
        capacitance: pick(|c| c.capacitance),
    }
}
