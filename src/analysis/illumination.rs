//! Illumination controller: the outer loop of the sweep.
//!
//! For each illumination condition, in order:
//!   1. Halve a mirrored open-circuit solution into its asymmetric device
//!   2. Read the DC bias of the steady state
//!   3. Freeze the ions of the working copy if requested
//!   4. Evaluate every frequency of the row
//!
//! Rows run one after another; the cells inside a row are parallel.

use super::derive::derive_all;
use super::frequency::{Executor, FrequencyGrid, RowContext};
use super::{HarmonicMatrices, ResultMatrix, SweepParams, SweepResult};
use crate::device::{Collaborators, DeviceSolution};
use crate::error::{IsweepError, Result};
use crate::ir::{Channels, IlluminationCondition, IlluminationSet};
use crate::stats::Stats;
use std::time::Instant;

/// Run the full illumination × frequency sweep.
///
/// Accepts a single [`IlluminationCondition`] or a `Vec` of them. Inputs are
/// checked before any simulation; the first collaborator error aborts the
/// sweep.
pub fn run<S: DeviceSolution>(
    tools: &Collaborators<'_, S>,
    illuminations: impl Into<IlluminationSet<S>>,
    params: &SweepParams,
    mut stats: Option<&mut Stats>,
) -> Result<SweepResult> {
    let set = illuminations.into();
    validate(&set, params)?;
    let grid = FrequencyGrid::log_spaced(params.start_freq, params.end_freq, params.points)?;
    let executor = Executor::new(params.strategy)?;

    let (rows, cols) = (set.len(), grid.len());
    let _span = tracing::info_span!(
        "impedance_sweep",
        n_illuminations = rows,
        n_frequencies = cols,
        method = params.method.as_str()
    )
    .entered();

    let mut harmonics = Channels::from_fn(|_| HarmonicMatrices::new(rows, cols));
    let mut max_time = ResultMatrix::new(rows, cols);
    let mut vdc = Vec::with_capacity(rows);

    for (i, condition) in set.iter().enumerate() {
        let _row_span =
            tracing::info_span!("illumination", index = i, intensity = condition.intensity)
                .entered();
        let started = stats.is_some().then(Instant::now);

        let (prepared, row_vdc) = prepare(tools, condition, params.freeze_ions)?;
        let row = RowContext {
            intensity: condition.intensity,
            vdc: row_vdc,
        };
        let reports = executor.run_row(tools, &prepared, &grid, row, params)?;

        for (j, report) in reports.iter().enumerate() {
            for (ch, triple) in report.triples.iter() {
                let h = harmonics.get_mut(ch);
                h.bias.set(i, j, triple.bias);
                h.amplitude.set(i, j, triple.amplitude);
                h.phase.set(i, j, triple.phase);
            }
            max_time.set(i, j, report.max_time);
            if let Some(s) = stats.as_deref_mut() {
                s.record_gate(report);
            }
        }

        tracing::info!(vdc = row_vdc, "illumination row complete");
        if let (Some(s), Some(t)) = (stats.as_deref_mut(), started) {
            s.add_phase(format!("Row {i} ({} sun)", condition.intensity), t.elapsed());
        }
        vdc.push(row_vdc);
    }

    let (impedance, degenerate_cells) = derive_all(&harmonics, grid.as_slice(), params.delta_v);
    if let Some(s) = stats {
        s.degenerate_cells += degenerate_cells.len() as u32;
    }

    let intensities = set.intensities();
    let sun_index = sun_indices(&intensities);
    let frequencies = ResultMatrix::from_fn(rows, cols, |_, j| grid.as_slice()[j]);

    Ok(SweepResult {
        intensities,
        vdc,
        frequencies,
        max_time,
        harmonics,
        impedance,
        periods: params.periods,
        samples_per_period: params.samples_per_period,
        time_points: params.time_points(),
        sun_index,
        delta_v: params.delta_v,
        tolerance: params.tolerance,
        method: params.method,
        frozen_ions: params.freeze_ions,
        degenerate_cells,
    })
}

/// 0-based positions of the rows whose intensity is exactly 1 sun.
pub fn sun_indices(intensities: &[f64]) -> Vec<usize> {
    intensities
        .iter()
        .enumerate()
        .filter(|&(_, &x)| x == 1.0)
        .map(|(i, _)| i)
        .collect()
}

fn validate<S>(set: &IlluminationSet<S>, params: &SweepParams) -> Result<()> {
    if set.is_empty() {
        return Err(IsweepError::Config("no illumination conditions given".into()));
    }
    for (i, condition) in set.iter().enumerate() {
        if !(condition.intensity.is_finite() && condition.intensity >= 0.0) {
            return Err(IsweepError::Config(format!(
                "illumination {i} has invalid intensity {}",
                condition.intensity
            )));
        }
    }
    params.validate()
}

/// Working copy of a condition's steady state, ready for perturbation, and
/// its DC bias. The caller's solution is left untouched.
fn prepare<S: DeviceSolution>(
    tools: &Collaborators<'_, S>,
    condition: &IlluminationCondition<S>,
    freeze_ions: bool,
) -> Result<(S, f64)> {
    let mut state = if condition.symmetric {
        tools.asymmetrizer.halve(&condition.solution)?
    } else {
        condition.solution.clone()
    };
    let vdc = tools.bias.bias(&state)?;
    if freeze_ions {
        state.freeze_ions();
    }
    Ok((state, vdc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::frequency::ExecutionStrategy;
    use crate::device::stub::{ResponseAnalyzer, ScriptedAnalyzer, StubDevice, StubSolution};
    use crate::ir::Channel;
    use approx::assert_relative_eq;

    fn small_params() -> SweepParams {
        SweepParams {
            start_freq: 1e3,
            end_freq: 1.0,
            points: 4,
            ..SweepParams::default()
        }
    }

    fn conditions(intensities: &[f64]) -> Vec<IlluminationCondition<StubSolution>> {
        intensities
            .iter()
            .map(|&x| IlluminationCondition::new(StubSolution::steady(x), x))
            .collect()
    }

    #[test]
    fn sun_index_matches_exact_one_sun() {
        assert_eq!(sun_indices(&[0.0, 0.1, 1.0, 1.0]), vec![2, 3]);
        assert!(sun_indices(&[0.0, 0.999_999, 1.5]).is_empty());
    }

    #[test]
    fn fills_every_matrix() {
        let device = StubDevice::default();
        let analyzer = ResponseAnalyzer;
        let tools = Collaborators::<StubSolution>::new(&device, &analyzer, &device, &device);
        let mut stats = Stats::new();

        let result = run(
            &tools,
            conditions(&[0.0, 0.1, 1.0, 1.0]),
            &small_params(),
            Some(&mut stats),
        )
        .unwrap();

        assert_eq!(result.sun_index, vec![2, 3]);
        assert_eq!(result.intensities, vec![0.0, 0.1, 1.0, 1.0]);
        assert_eq!(result.vdc, vec![0.0, 0.05, 0.5, 0.5]);
        for (name, m) in result.matrices() {
            assert_eq!(m.shape(), (4, 4), "{name}");
            assert!(m.is_complete(), "{name}");
        }
        for i in 0..4 {
            assert_eq!(result.frequencies.row(i), result.frequency_grid());
        }
        assert_relative_eq!(result.max_time.get(3, 3), 20.0, max_relative = 1e-12);
        assert_eq!(result.harmonics.total.bias.get(1, 0), 0.1);
        assert!(result.degenerate_cells.is_empty());
        assert_eq!(result.time_points, 801);

        assert_eq!(device.simulations(), 16);
        assert_eq!(stats.cells, 16);
        assert_eq!(stats.simulations, 16);
        assert_eq!(stats.escalations(), 0);
    }

    #[test]
    fn single_condition_equals_one_element_list() {
        let device = StubDevice::default();
        let analyzer = ResponseAnalyzer;
        let tools = Collaborators::<StubSolution>::new(&device, &analyzer, &device, &device);
        let params = SweepParams {
            strategy: ExecutionStrategy::Serial,
            ..small_params()
        };

        let single = IlluminationCondition::new(StubSolution::steady(1.0), 1.0);
        let a = run(&tools, single.clone(), &params, None).unwrap();
        let b = run(&tools, vec![single], &params, None).unwrap();
        assert_eq!(a.matrices(), b.matrices());
        assert_eq!(a.sun_index, vec![0]);
        assert_eq!(a.vdc, b.vdc);
    }

    #[test]
    fn symmetric_condition_is_halved_once() {
        let device = StubDevice::default();
        let analyzer = ResponseAnalyzer;
        let tools = Collaborators::<StubSolution>::new(&device, &analyzer, &device, &device);
        let mirrored = StubSolution {
            mirrored: true,
            ..StubSolution::steady(1.0)
        };
        let set = vec![
            IlluminationCondition::symmetric(mirrored, 1.0),
            IlluminationCondition::new(StubSolution::steady(0.5), 0.5),
        ];
        run(&tools, set, &small_params(), None).unwrap();
        assert_eq!(device.halvings(), 1);
    }

    #[test]
    fn frozen_ions_leave_ionic_impedance_undefined() {
        let device = StubDevice::default();
        let analyzer = ResponseAnalyzer;
        let tools = Collaborators::<StubSolution>::new(&device, &analyzer, &device, &device);
        let params = SweepParams {
            freeze_ions: true,
            ..small_params()
        };
        let mut stats = Stats::new();
        let result = run(&tools, conditions(&[1.0]), &params, Some(&mut stats)).unwrap();

        assert!(result.frozen_ions);
        assert_eq!(result.harmonics.ionic.amplitude.row(0), &[0.0; 4]);
        assert!(result.impedance.ionic.impedance_abs.get(0, 0).is_nan());
        assert!(result.impedance.total.impedance_abs.get(0, 0).is_finite());
        assert_eq!(result.degenerate_cells.len(), 4);
        assert!(result
            .degenerate_cells
            .iter()
            .all(|c| c.channel == Channel::Ionic));
        assert_eq!(stats.degenerate_cells, 4);
    }

    #[test]
    fn escalations_are_counted() {
        let device = StubDevice::default();
        let analyzer = ScriptedAnalyzer::new(&[-0.1, 1.6, 0.5]);
        let tools = Collaborators::<StubSolution>::new(&device, &analyzer, &device, &device);
        let params = SweepParams {
            start_freq: 10.0,
            end_freq: 10.0,
            points: 1,
            ..SweepParams::default()
        };
        let mut stats = Stats::new();
        let result = run(&tools, conditions(&[1.0]), &params, Some(&mut stats)).unwrap();

        assert_relative_eq!(result.harmonics.total.phase.get(0, 0), 0.5);
        assert_eq!(stats.simulations, 2);
        assert_eq!(stats.analyses, 3);
        assert_eq!(stats.out_of_range, 1);
        assert_eq!(stats.still_out_of_range, 1);
    }

    #[test]
    fn invalid_inputs_fail_before_simulation() {
        let device = StubDevice::default();
        let analyzer = ResponseAnalyzer;
        let tools = Collaborators::<StubSolution>::new(&device, &analyzer, &device, &device);

        let empty: Vec<IlluminationCondition<StubSolution>> = Vec::new();
        let err = run(&tools, empty, &small_params(), None).unwrap_err();
        assert!(matches!(err, IsweepError::Config(_)));

        let err = run(&tools, conditions(&[1.0, -0.5]), &small_params(), None).unwrap_err();
        assert!(matches!(err, IsweepError::Config(_)));

        let backwards = SweepParams {
            start_freq: 1.0,
            end_freq: 1e3,
            ..small_params()
        };
        assert!(run(&tools, conditions(&[1.0]), &backwards, None).is_err());

        assert_eq!(device.simulations(), 0);
    }

    #[test]
    fn collaborator_error_aborts_sweep() {
        let device = StubDevice {
            fail_on_run: Some(5),
            ..StubDevice::default()
        };
        let analyzer = ResponseAnalyzer;
        let tools = Collaborators::<StubSolution>::new(&device, &analyzer, &device, &device);
        let err = run(&tools, conditions(&[0.0, 1.0]), &small_params(), None).unwrap_err();
        assert!(matches!(err, IsweepError::Simulation(_)));
    }
}
