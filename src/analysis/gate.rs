//! Harmonic extraction gate for a single (illumination, frequency) cell.
//!
//! One simulate-and-analyze attempt followed by a bounded cascade of checks
//! on the total-current phase:
//!
//!   Initial                 simulate at the sweep tolerance, analyze with
//!                           the preferred method
//!   EscalateTolerance       phase within ε of 0 or π/2: re-simulate from the
//!                           oscillating state at tolerance / 100
//!   SwapMethod              phase < 0 or > π/2: re-analyze the same trace
//!                           with the opposite method, no new simulation
//!   EscalateToleranceAgain  still out of range: re-simulate from the current
//!                           oscillating state at a further tolerance / 100
//!   Done
//!
//! At most three extra passes run. An implausible phase is never an error:
//! the last triple is returned and every escalation is logged.

use super::SweepParams;
use crate::device::{Collaborators, DeviceSolution};
use crate::error::Result;
use crate::ir::{ChannelTriples, ExtractionMethod, Perturbation};
use std::f64::consts::FRAC_PI_2;

/// Tolerance divisor applied by each re-simulation.
pub const TOLERANCE_REDUCTION: f64 = 100.0;

/// Position in the escalation cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateStage {
    Initial,
    EscalateTolerance,
    SwapMethod,
    EscalateToleranceAgain,
    Done,
}

impl GateStage {
    /// Stage that follows `self` given the phase it produced.
    pub fn next(self, phase: f64, epsilon: f64) -> GateStage {
        match self {
            GateStage::Initial if near_boundary(phase, epsilon) => GateStage::EscalateTolerance,
            GateStage::Initial | GateStage::EscalateTolerance if out_of_range(phase) => {
                GateStage::SwapMethod
            }
            GateStage::SwapMethod if out_of_range(phase) => GateStage::EscalateToleranceAgain,
            _ => GateStage::Done,
        }
    }
}

/// Guard that moved the gate into an escalation stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    NearBoundary,
    OutOfRange,
    StillOutOfRange,
}

impl Check {
    pub fn as_str(self) -> &'static str {
        match self {
            Check::NearBoundary => "near_boundary",
            Check::OutOfRange => "out_of_range",
            Check::StillOutOfRange => "still_out_of_range",
        }
    }
}

/// Phase within `epsilon` of 0 or π/2.
pub fn near_boundary(phase: f64, epsilon: f64) -> bool {
    phase.abs() < epsilon || (phase - FRAC_PI_2).abs() < epsilon
}

/// Phase outside [0, π/2]; NaN counts as outside.
pub fn out_of_range(phase: f64) -> bool {
    !(0.0..=FRAC_PI_2).contains(&phase)
}

/// Where a cell sits in the sweep, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellContext {
    pub intensity: f64,
    pub vdc: f64,
    pub frequency: f64,
}

/// One escalation step taken by the gate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Escalation {
    pub check: Check,
    /// Total-current phase that triggered the check (rad).
    pub phase: f64,
    /// Method used for the re-analysis.
    pub method: ExtractionMethod,
    /// Simulation tolerance after the step.
    pub tolerance: f64,
}

/// Validated outcome of one cell.
#[derive(Debug, Clone, PartialEq)]
pub struct GateReport {
    pub triples: ChannelTriples,
    /// Simulated time span of the final run.
    pub max_time: f64,
    /// Tolerance of the final run.
    pub tolerance: f64,
    /// Method that produced `triples`.
    pub method: ExtractionMethod,
    pub simulations: usize,
    pub analyses: usize,
    pub escalations: Vec<Escalation>,
}

/// Run the cascade for one cell, starting from the prepared steady state.
pub fn extract<S: DeviceSolution>(
    tools: &Collaborators<'_, S>,
    start: &S,
    cell: &CellContext,
    params: &SweepParams,
) -> Result<GateReport> {
    let mut drive = Perturbation {
        amplitude: params.delta_v,
        frequency: cell.frequency,
        periods: params.periods,
        samples_per_period: params.samples_per_period,
        tolerance: params.tolerance,
    };

    let mut oscillation = tools.simulator.simulate(start, &drive)?;
    let mut method = params.method;
    let mut triples = tools.analyzer.extract(&oscillation, true, method)?;
    let mut simulations = 1;
    let mut analyses = 1;
    let mut escalations = Vec::new();

    let mut stage = GateStage::Initial;
    loop {
        let phase = triples.total.phase;
        stage = stage.next(phase, params.phase_epsilon);
        let check = match stage {
            GateStage::EscalateTolerance => Check::NearBoundary,
            GateStage::SwapMethod => Check::OutOfRange,
            GateStage::EscalateToleranceAgain => Check::StillOutOfRange,
            GateStage::Initial | GateStage::Done => break,
        };

        let resimulate = stage != GateStage::SwapMethod;
        if resimulate {
            drive.tolerance /= TOLERANCE_REDUCTION;
            method = params.method;
        } else {
            method = params.method.opposite();
        }

        tracing::warn!(
            intensity = cell.intensity,
            vdc = cell.vdc,
            frequency = cell.frequency,
            phase_deg = phase.to_degrees(),
            check = check.as_str(),
            method = method.as_str(),
            tolerance = drive.tolerance,
            "implausible phase, escalating"
        );

        if resimulate {
            // Warm start from the oscillating state, closer to the periodic
            // steady state than the original solution.
            oscillation = tools.simulator.simulate(&oscillation, &drive)?;
            simulations += 1;
        }
        triples = tools.analyzer.extract(&oscillation, true, method)?;
        analyses += 1;
        escalations.push(Escalation {
            check,
            phase,
            method,
            tolerance: drive.tolerance,
        });
    }

    tracing::debug!(
        frequency = cell.frequency,
        phase_deg = triples.total.phase.to_degrees(),
        simulations,
        "cell extracted"
    );

    Ok(GateReport {
        triples,
        max_time: oscillation.max_time(),
        tolerance: drive.tolerance,
        method,
        simulations,
        analyses,
        escalations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::stub::{ScriptedAnalyzer, StubDevice, StubSolution};
    use crate::error::IsweepError;
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn cell() -> CellContext {
        CellContext {
            intensity: 1.0,
            vdc: 1.05,
            frequency: 1e3,
        }
    }

    fn run(script: &[f64], params: &SweepParams) -> (GateReport, StubDevice, ScriptedAnalyzer) {
        let device = StubDevice::default();
        let analyzer = ScriptedAnalyzer::new(script);
        let report = {
            let tools = Collaborators::<StubSolution>::new(&device, &analyzer, &device, &device);
            extract(&tools, &StubSolution::default(), &cell(), params).unwrap()
        };
        (report, device, analyzer)
    }

    #[test]
    fn plausible_phase_needs_one_pass() {
        let (report, device, analyzer) = run(&[0.7], &SweepParams::default());
        assert_eq!(device.simulations(), 1);
        assert_eq!(analyzer.calls(), 1);
        assert!(report.escalations.is_empty());
        assert_eq!(report.tolerance, 1e-8);
        assert_abs_diff_eq!(report.triples.total.phase, 0.7);
    }

    #[test]
    fn swap_then_escalate_scenario() {
        let params = SweepParams::default();
        let (report, device, analyzer) = run(&[-0.1, 1.6, 0.5], &params);

        assert_eq!(device.simulations(), 2);
        assert_eq!(analyzer.calls(), 3);
        assert_eq!(report.simulations, 2);
        assert_eq!(report.analyses, 3);
        assert_abs_diff_eq!(report.triples.total.phase, 0.5);

        let checks: Vec<_> = report.escalations.iter().map(|e| e.check).collect();
        assert_eq!(checks, [Check::OutOfRange, Check::StillOutOfRange]);
        assert_eq!(
            analyzer.methods(),
            [ExtractionMethod::Demodulation, ExtractionMethod::Fit, ExtractionMethod::Demodulation]
        );
        assert_abs_diff_eq!(report.tolerance, 1e-10, epsilon = 1e-24);
        assert_eq!(report.method, ExtractionMethod::Demodulation);
    }

    #[test]
    fn near_boundary_resimulates_from_oscillating_state() {
        let (report, device, _) = run(&[0.003, 0.4], &SweepParams::default());
        assert_eq!(device.simulations(), 2);
        assert_eq!(report.escalations[0].check, Check::NearBoundary);
        // Second run starts from the first run's output, not the steady state.
        assert_eq!(device.start_runs(), [0, 1]);
        let tolerances = device.tolerances();
        assert_eq!(tolerances[0], 1e-8);
        assert_relative_eq!(tolerances[1], 1e-10, max_relative = 1e-12);
    }

    #[test]
    fn full_cascade_is_bounded() {
        let (report, device, analyzer) =
            run(&[FRAC_PI_2 - 3e-4, -0.2, -0.3, 0.7, 0.9], &SweepParams::default());
        assert_eq!(device.simulations(), 3);
        assert_eq!(analyzer.calls(), 4);
        let checks: Vec<_> = report.escalations.iter().map(|e| e.check).collect();
        assert_eq!(
            checks,
            [Check::NearBoundary, Check::OutOfRange, Check::StillOutOfRange]
        );
        assert_eq!(device.start_runs(), [0, 1, 2]);
        assert_abs_diff_eq!(report.tolerance, 1e-12, epsilon = 1e-26);
        assert_abs_diff_eq!(report.triples.total.phase, 0.7);
    }

    #[test]
    fn implausible_phase_is_returned_not_raised() {
        let (report, _, _) = run(&[-0.1, -0.2, -0.3], &SweepParams::default());
        assert_abs_diff_eq!(report.triples.total.phase, -0.3);
        assert_eq!(report.escalations.len(), 2);
    }

    #[test]
    fn fit_preference_swaps_to_demodulation() {
        let params = SweepParams {
            method: ExtractionMethod::Fit,
            ..SweepParams::default()
        };
        let (_, _, analyzer) = run(&[1.7, 0.3], &params);
        assert_eq!(
            analyzer.methods(),
            [ExtractionMethod::Fit, ExtractionMethod::Demodulation]
        );
    }

    #[test]
    fn simulator_failure_propagates() {
        let device = StubDevice {
            fail_on_run: Some(1),
            ..StubDevice::default()
        };
        let analyzer = ScriptedAnalyzer::new(&[0.001]);
        let tools = Collaborators::<StubSolution>::new(&device, &analyzer, &device, &device);
        let err = extract(&tools, &StubSolution::default(), &cell(), &SweepParams::default())
            .unwrap_err();
        assert!(matches!(err, IsweepError::Simulation(_)));
    }

    #[test]
    fn stage_transitions() {
        let eps = 0.006;
        assert_eq!(GateStage::Initial.next(0.3, eps), GateStage::Done);
        assert_eq!(GateStage::Initial.next(0.001, eps), GateStage::EscalateTolerance);
        assert_eq!(GateStage::Initial.next(FRAC_PI_2, eps), GateStage::EscalateTolerance);
        assert_eq!(GateStage::Initial.next(-0.5, eps), GateStage::SwapMethod);
        assert_eq!(GateStage::EscalateTolerance.next(-1e-4, eps), GateStage::SwapMethod);
        assert_eq!(GateStage::EscalateTolerance.next(0.2, eps), GateStage::Done);
        assert_eq!(GateStage::SwapMethod.next(2.0, eps), GateStage::EscalateToleranceAgain);
        assert_eq!(GateStage::SwapMethod.next(1.0, eps), GateStage::Done);
        assert_eq!(GateStage::EscalateToleranceAgain.next(-3.0, eps), GateStage::Done);
        assert_eq!(GateStage::Done.next(f64::NAN, eps), GateStage::Done);
    }

    #[test]
    fn nan_phase_is_out_of_range() {
        assert!(out_of_range(f64::NAN));
        assert!(!out_of_range(0.0));
        assert!(!out_of_range(FRAC_PI_2));
    }
}
