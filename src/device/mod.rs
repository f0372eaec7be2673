//! Device collaborators consumed by the sweep.
//!
//! The sweep never integrates the device equations itself. It drives four
//! collaborators through trait objects, the same way analyses drive a
//! `LinearSolver`: a transient simulator, a harmonic analyzer, a steady-state
//! bias extractor and an asymmetrizer for mirrored open-circuit solutions.

pub mod lumped;
#[cfg(test)]
pub(crate) mod stub;

use crate::error::Result;
use crate::ir::{ChannelTriples, ExtractionMethod, Perturbation};

/// A device solution: either a steady state or an oscillating run that can
/// serve as the warm start of the next run.
pub trait DeviceSolution: Clone + Send + Sync {
    /// Zero the ionic mobility of this copy.
    fn freeze_ions(&mut self);

    /// Final simulated time (0 for a steady state).
    fn max_time(&self) -> f64;
}

/// Integrates the device under an oscillating boundary voltage.
pub trait DeviceSimulator<S>: Sync {
    /// Simulate `drive.periods` periods starting from `start`.
    fn simulate(&self, start: &S, drive: &Perturbation) -> Result<S>;
}

/// Extracts per-channel harmonic triples from an oscillating solution.
pub trait HarmonicAnalyzer<S>: Sync {
    /// `minimal` skips diagnostics that the sweep does not consume.
    fn extract(&self, oscillation: &S, minimal: bool, method: ExtractionMethod)
        -> Result<ChannelTriples>;
}

/// Reads the DC bias voltage of a steady state.
pub trait BiasExtractor<S>: Sync {
    fn bias(&self, state: &S) -> Result<f64>;
}

/// Turns a mirrored open-circuit solution into its asymmetric half device.
pub trait Asymmetrizer<S>: Sync {
    fn halve(&self, state: &S) -> Result<S>;
}

/// The four collaborators a sweep runs against.
pub struct Collaborators<'a, S> {
    pub simulator: &'a dyn DeviceSimulator<S>,
    pub analyzer: &'a dyn HarmonicAnalyzer<S>,
    pub bias: &'a dyn BiasExtractor<S>,
    pub asymmetrizer: &'a dyn Asymmetrizer<S>,
}

impl<'a, S> Collaborators<'a, S> {
    pub fn new(
        simulator: &'a dyn DeviceSimulator<S>,
        analyzer: &'a dyn HarmonicAnalyzer<S>,
        bias: &'a dyn BiasExtractor<S>,
        asymmetrizer: &'a dyn Asymmetrizer<S>,
    ) -> Self {
        Self {
            simulator,
            analyzer,
            bias,
            asymmetrizer,
        }
    }
}
