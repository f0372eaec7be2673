//! Sweep intermediate representation.
//!
//! Plain data passed between the illumination controller, the frequency
//! executor, the extraction gate and the device collaborators.

use serde::Deserialize;
use std::fmt;

/// Strategy the harmonic analyzer uses to recover (bias, amplitude, phase).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMethod {
    /// Project the signal onto reference sine/cosine waves.
    Demodulation,
    /// Least-squares fit of offset, drift and a sinusoid.
    Fit,
}

impl ExtractionMethod {
    /// The other method (fit ↔ demodulation).
    pub fn opposite(self) -> Self {
        match self {
            ExtractionMethod::Demodulation => ExtractionMethod::Fit,
            ExtractionMethod::Fit => ExtractionMethod::Demodulation,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExtractionMethod::Demodulation => "demodulation",
            ExtractionMethod::Fit => "fit",
        }
    }
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// (bias, amplitude, phase) of a quasi-sinusoidal current at the drive frequency.
///
/// The signal is `bias + amplitude * sin(ωt + phase)` with phase in radians,
/// positive when the current leads the driving voltage.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HarmonicTriple {
    pub bias: f64,
    pub amplitude: f64,
    pub phase: f64,
}

impl HarmonicTriple {
    pub fn new(bias: f64, amplitude: f64, phase: f64) -> Self {
        Self {
            bias,
            amplitude,
            phase,
        }
    }
}

/// Current decomposition tracked through the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Terminal current.
    Total,
    /// Ionic drift current.
    Ionic,
    /// Recombination current.
    Recombination,
    /// Rate of accumulated charge (displacement current).
    Accumulation,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Total,
        Channel::Ionic,
        Channel::Recombination,
        Channel::Accumulation,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Channel::Total => "total",
            Channel::Ionic => "ionic",
            Channel::Recombination => "recombination",
            Channel::Accumulation => "accumulation",
        }
    }
}

/// One value per current channel.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Channels<T> {
    pub total: T,
    pub ionic: T,
    pub recombination: T,
    pub accumulation: T,
}

impl<T> Channels<T> {
    pub fn from_fn(mut f: impl FnMut(Channel) -> T) -> Self {
        Self {
            total: f(Channel::Total),
            ionic: f(Channel::Ionic),
            recombination: f(Channel::Recombination),
            accumulation: f(Channel::Accumulation),
        }
    }

    /// Like [`Channels::from_fn`], stopping at the first error.
    pub fn try_from_fn<E>(mut f: impl FnMut(Channel) -> Result<T, E>) -> Result<Self, E> {
        Ok(Self {
            total: f(Channel::Total)?,
            ionic: f(Channel::Ionic)?,
            recombination: f(Channel::Recombination)?,
            accumulation: f(Channel::Accumulation)?,
        })
    }

    pub fn get(&self, channel: Channel) -> &T {
        match channel {
            Channel::Total => &self.total,
            Channel::Ionic => &self.ionic,
            Channel::Recombination => &self.recombination,
            Channel::Accumulation => &self.accumulation,
        }
    }

    pub fn get_mut(&mut self, channel: Channel) -> &mut T {
        match channel {
            Channel::Total => &mut self.total,
            Channel::Ionic => &mut self.ionic,
            Channel::Recombination => &mut self.recombination,
            Channel::Accumulation => &mut self.accumulation,
        }
    }

    pub fn map<U>(&self, mut f: impl FnMut(Channel, &T) -> U) -> Channels<U> {
        Channels::from_fn(|ch| f(ch, self.get(ch)))
    }

    /// (channel, value) pairs in [`Channel::ALL`] order.
    pub fn iter(&self) -> impl Iterator<Item = (Channel, &T)> {
        Channel::ALL.into_iter().map(move |ch| (ch, self.get(ch)))
    }
}

/// Harmonic triples of all four channels for one (illumination, frequency) cell.
pub type ChannelTriples = Channels<HarmonicTriple>;

/// Small-signal drive handed to the device simulator for one run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Perturbation {
    /// Voltage oscillation amplitude (V).
    pub amplitude: f64,
    /// Drive frequency (Hz).
    pub frequency: f64,
    /// Number of whole oscillation periods to simulate.
    pub periods: usize,
    /// Output samples per period.
    pub samples_per_period: usize,
    /// Integrator tolerance.
    pub tolerance: f64,
}

impl Perturbation {
    /// Simulated time span: `periods / frequency`.
    pub fn max_time(&self) -> f64 {
        self.periods as f64 / self.frequency
    }

    /// Number of recorded samples, both endpoints included.
    pub fn time_points(&self) -> usize {
        self.periods * self.samples_per_period + 1
    }
}

/// A steady-state device solution under a given background light intensity.
#[derive(Debug, Clone)]
pub struct IlluminationCondition<S> {
    pub solution: S,
    /// Light intensity in suns (0 = dark).
    pub intensity: f64,
    /// Solution is a mirrored (symmetric) open-circuit representation that
    /// must be halved before perturbation.
    pub symmetric: bool,
}

impl<S> IlluminationCondition<S> {
    pub fn new(solution: S, intensity: f64) -> Self {
        Self {
            solution,
            intensity,
            symmetric: false,
        }
    }

    pub fn symmetric(solution: S, intensity: f64) -> Self {
        Self {
            solution,
            intensity,
            symmetric: true,
        }
    }
}

/// Ordered illumination conditions for one sweep.
///
/// Built from a single condition or from a `Vec`; both go through the same path.
#[derive(Debug, Clone)]
pub struct IlluminationSet<S>(Vec<IlluminationCondition<S>>);

impl<S> IlluminationSet<S> {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, IlluminationCondition<S>> {
        self.0.iter()
    }

    pub fn intensities(&self) -> Vec<f64> {
        self.0.iter().map(|c| c.intensity).collect()
    }
}

impl<S> From<IlluminationCondition<S>> for IlluminationSet<S> {
    fn from(condition: IlluminationCondition<S>) -> Self {
        Self(vec![condition])
    }
}

impl<S> From<Vec<IlluminationCondition<S>>> for IlluminationSet<S> {
    fn from(conditions: Vec<IlluminationCondition<S>>) -> Self {
        Self(conditions)
    }
}
