//! Counting collaborators for unit tests.

use super::{Asymmetrizer, BiasExtractor, DeviceSimulator, DeviceSolution, HarmonicAnalyzer};
use crate::error::{IsweepError, Result};
use crate::ir::{ChannelTriples, Channels, ExtractionMethod, HarmonicTriple, Perturbation};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StubSolution {
    pub intensity: f64,
    /// Simulations chained since the steady state.
    pub runs: usize,
    pub frequency: f64,
    pub max_time: f64,
    pub mirrored: bool,
    pub ions_frozen: bool,
}

impl StubSolution {
    pub fn steady(intensity: f64) -> Self {
        Self {
            intensity,
            ..Self::default()
        }
    }
}

impl DeviceSolution for StubSolution {
    fn freeze_ions(&mut self) {
        self.ions_frozen = true;
    }

    fn max_time(&self) -> f64 {
        self.max_time
    }
}

/// Simulator, bias extractor and asymmetrizer in one.
#[derive(Debug, Default)]
pub struct StubDevice {
    /// Zero-based simulate call that fails.
    pub fail_on_run: Option<usize>,
    pub(crate) calls: AtomicUsize,
    pub(crate) halvings: AtomicUsize,
    /// (runs of the start state, tolerance) per call.
    pub(crate) log: Mutex<Vec<(usize, f64)>>,
}

impl StubDevice {
    pub fn simulations(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn halvings(&self) -> usize {
        self.halvings.load(Ordering::SeqCst)
    }

    pub fn start_runs(&self) -> Vec<usize> {
        self.log.lock().unwrap().iter().map(|&(r, _)| r).collect()
    }

    pub fn tolerances(&self) -> Vec<f64> {
        self.log.lock().unwrap().iter().map(|&(_, t)| t).collect()
    }
}

impl DeviceSimulator<StubSolution> for StubDevice {
    fn simulate(&self, start: &StubSolution, drive: &Perturbation) -> Result<StubSolution> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on_run == Some(call) {
            return Err(IsweepError::Simulation(format!("stub failure on call {call}")));
        }
        self.log.lock().unwrap().push((start.runs, drive.tolerance));
        Ok(StubSolution {
            runs: start.runs + 1,
            frequency: drive.frequency,
            max_time: drive.max_time(),
            ..start.clone()
        })
    }
}

impl BiasExtractor<StubSolution> for StubDevice {
    fn bias(&self, state: &StubSolution) -> Result<f64> {
        Ok(0.5 * state.intensity)
    }
}

impl Asymmetrizer<StubSolution> for StubDevice {
    fn halve(&self, state: &StubSolution) -> Result<StubSolution> {
        if !state.mirrored {
            return Err(IsweepError::Simulation("not a mirrored solution".into()));
        }
        self.halvings.fetch_add(1, Ordering::SeqCst);
        Ok(StubSolution {
            mirrored: false,
            ..state.clone()
        })
    }
}

/// Returns total-current phases from a script, one per call; the last entry
/// repeats once the script runs out.
#[derive(Debug)]
pub struct ScriptedAnalyzer {
    script: Vec<f64>,
    calls: AtomicUsize,
    methods: Mutex<Vec<ExtractionMethod>>,
}

impl ScriptedAnalyzer {
    pub fn new(script: &[f64]) -> Self {
        Self {
            script: script.to_vec(),
            calls: AtomicUsize::new(0),
            methods: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn methods(&self) -> Vec<ExtractionMethod> {
        self.methods.lock().unwrap().clone()
    }
}

impl HarmonicAnalyzer<StubSolution> for ScriptedAnalyzer {
    fn extract(
        &self,
        _oscillation: &StubSolution,
        _minimal: bool,
        method: ExtractionMethod,
    ) -> Result<ChannelTriples> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.methods.lock().unwrap().push(method);
        let phase = self.script[call.min(self.script.len() - 1)];
        Ok(Channels::from_fn(|_| HarmonicTriple::new(0.0, 1e-3, phase)))
    }
}

/// Deterministic response derived from the oscillating solution, so results
/// do not depend on call order.
#[derive(Debug, Default)]
pub struct ResponseAnalyzer;

impl ResponseAnalyzer {
    pub fn amplitude(frequency: f64) -> f64 {
        1e-3 * (1.0 + frequency.log10().abs())
    }
}

impl HarmonicAnalyzer<StubSolution> for ResponseAnalyzer {
    fn extract(
        &self,
        oscillation: &StubSolution,
        _minimal: bool,
        _method: ExtractionMethod,
    ) -> Result<ChannelTriples> {
        let amplitude = Self::amplitude(oscillation.frequency);
        let phase = 0.3 + 0.05 * oscillation.frequency.log10();
        let mut triples = Channels::from_fn(|_| {
            HarmonicTriple::new(oscillation.intensity, amplitude, phase)
        });
        if oscillation.ions_frozen {
            triples.ionic = HarmonicTriple::new(0.0, 0.0, 0.0);
        }
        Ok(triples)
    }
}
