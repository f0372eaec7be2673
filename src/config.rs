//! TOML sweep configuration.
//!
//! ```toml
//! [sweep]
//! start_freq = 1e6
//! end_freq = 0.1
//! points = 29
//! delta_v = 2e-3
//! method = "demodulation"
//!
//! [device]
//! ionic_resistance = 2e3
//!
//! [illumination]
//! intensities = [0.0, 0.1, 1.0]
//! open_circuit = true
//! ```

use crate::analysis::frequency::ExecutionStrategy;
use crate::analysis::{SweepParams, PHASE_EPSILON};
use crate::device::lumped::{LumpedParams, LumpedSolution};
use crate::error::{IsweepError, Result};
use crate::ir::{ExtractionMethod, IlluminationCondition};
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepConfig {
    #[serde(default)]
    pub sweep: SweepSection,
    /// Lumped reference device parameters.
    #[serde(default)]
    pub device: LumpedParams,
    pub illumination: IlluminationSection,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweepSection {
    pub start_freq: f64,
    pub end_freq: f64,
    pub points: usize,
    pub delta_v: f64,
    pub freeze_ions: bool,
    pub method: ExtractionMethod,
    pub periods: usize,
    pub samples_per_period: usize,
    pub tolerance: f64,
    pub phase_epsilon: f64,
    pub parallel: bool,
    /// Dedicated pool size; the global rayon pool when absent.
    pub threads: Option<usize>,
    /// Also export Nyquist data.
    pub graphics: bool,
}

impl Default for SweepSection {
    fn default() -> Self {
        let p = SweepParams::default();
        Self {
            start_freq: p.start_freq,
            end_freq: p.end_freq,
            points: p.points,
            delta_v: p.delta_v,
            freeze_ions: p.freeze_ions,
            method: p.method,
            periods: p.periods,
            samples_per_period: p.samples_per_period,
            tolerance: p.tolerance,
            phase_epsilon: PHASE_EPSILON,
            parallel: true,
            threads: None,
            graphics: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IlluminationSection {
    /// Light intensities in suns, one sweep row each.
    pub intensities: Vec<f64>,
    #[serde(default = "default_open_circuit")]
    pub open_circuit: bool,
    /// Represent open circuit as a mirrored symmetric device.
    #[serde(default)]
    pub symmetric: bool,
    /// Terminal voltage when not at open circuit.
    #[serde(default)]
    pub applied_voltage: Option<f64>,
}

fn default_open_circuit() -> bool {
    true
}

impl FromStr for SweepConfig {
    type Err = IsweepError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }
}

impl SweepConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        std::fs::read_to_string(path)?.parse()
    }

    pub fn sweep_params(&self) -> SweepParams {
        let s = &self.sweep;
        SweepParams {
            start_freq: s.start_freq,
            end_freq: s.end_freq,
            points: s.points,
            delta_v: s.delta_v,
            freeze_ions: s.freeze_ions,
            method: s.method,
            periods: s.periods,
            samples_per_period: s.samples_per_period,
            tolerance: s.tolerance,
            phase_epsilon: s.phase_epsilon,
            strategy: if s.parallel {
                ExecutionStrategy::Parallel { threads: s.threads }
            } else {
                ExecutionStrategy::Serial
            },
        }
    }

    /// Steady states of the lumped device, one per intensity.
    pub fn build_conditions(&self) -> Result<Vec<IlluminationCondition<LumpedSolution>>> {
        let ill = &self.illumination;
        if ill.symmetric && !ill.open_circuit {
            return Err(IsweepError::Config(
                "symmetric illumination requires open_circuit = true".into(),
            ));
        }
        let applied = match (ill.open_circuit, ill.applied_voltage) {
            (true, _) => None,
            (false, Some(v)) => Some(v),
            (false, None) => {
                return Err(IsweepError::Config(
                    "applied_voltage is required when open_circuit = false".into(),
                ))
            }
        };

        ill.intensities
            .iter()
            .map(|&intensity| -> Result<IlluminationCondition<LumpedSolution>> {
                Ok(match applied {
                    Some(v) => IlluminationCondition::new(
                        LumpedSolution::at_bias(self.device, intensity, v)?,
                        intensity,
                    ),
                    None if ill.symmetric => IlluminationCondition::symmetric(
                        LumpedSolution::mirrored_open_circuit(self.device, intensity)?,
                        intensity,
                    ),
                    None => IlluminationCondition::new(
                        LumpedSolution::open_circuit(self.device, intensity)?,
                        intensity,
                    ),
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg: SweepConfig = "[illumination]\nintensities = [1.0]\n".parse().unwrap();
        assert_eq!(cfg.sweep_params(), SweepParams::default());
        assert_eq!(cfg.device, LumpedParams::default());
        assert!(cfg.illumination.open_circuit);
        assert!(!cfg.sweep.graphics);
    }

    #[test]
    fn full_config_round_trips_into_params() {
        let cfg: SweepConfig = r#"
            [sweep]
            start_freq = 1e5
            end_freq = 10.0
            points = 9
            delta_v = 1e-3
            freeze_ions = true
            method = "fit"
            periods = 10
            samples_per_period = 32
            tolerance = 1e-6
            parallel = true
            threads = 2
            graphics = true

            [device]
            ionic_resistance = 2e3

            [illumination]
            intensities = [0.0, 1.0]
            open_circuit = false
            applied_voltage = 0.9
        "#
        .parse()
        .unwrap();

        let p = cfg.sweep_params();
        assert_eq!(p.points, 9);
        assert_eq!(p.method, ExtractionMethod::Fit);
        assert!(p.freeze_ions);
        assert_eq!(p.strategy, ExecutionStrategy::Parallel { threads: Some(2) });
        assert_eq!(p.phase_epsilon, PHASE_EPSILON);
        assert_eq!(cfg.device.ionic_resistance, 2e3);
        assert_eq!(cfg.device.series_resistance, 1.0);
        assert!(cfg.sweep.graphics);

        let conditions = cfg.build_conditions().unwrap();
        assert_eq!(conditions.len(), 2);
        assert!(conditions.iter().all(|c| c.solution.applied_voltage == 0.9));
    }

    #[test]
    fn serial_flag_selects_serial_strategy() {
        let cfg: SweepConfig = "[sweep]\nparallel = false\n[illumination]\nintensities = [1.0]\n"
            .parse()
            .unwrap();
        assert_eq!(cfg.sweep_params().strategy, ExecutionStrategy::Serial);
    }

    #[test]
    fn symmetric_conditions_are_mirrored() {
        let cfg: SweepConfig = "[illumination]\nintensities = [1.0]\nsymmetric = true\n"
            .parse()
            .unwrap();
        let conditions = cfg.build_conditions().unwrap();
        assert!(conditions[0].symmetric);
        assert!(conditions[0].solution.mirrored);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = "[sweep]\nfrequencies = 3\n[illumination]\nintensities = []\n"
            .parse::<SweepConfig>()
            .unwrap_err();
        assert!(matches!(err, IsweepError::Toml(_)));
    }

    #[test]
    fn bad_method_is_rejected() {
        let err = "[sweep]\nmethod = \"fourier\"\n[illumination]\nintensities = [1.0]\n"
            .parse::<SweepConfig>()
            .unwrap_err();
        assert!(matches!(err, IsweepError::Toml(_)));
    }

    #[test]
    fn missing_applied_voltage_is_a_config_error() {
        let cfg: SweepConfig = "[illumination]\nintensities = [1.0]\nopen_circuit = false\n"
            .parse()
            .unwrap();
        assert!(matches!(cfg.build_conditions(), Err(IsweepError::Config(_))));
    }

    #[test]
    fn negative_intensity_is_a_config_error() {
        let cfg: SweepConfig = "[illumination]\nintensities = [-1.0]\n".parse().unwrap();
        assert!(matches!(cfg.build_conditions(), Err(IsweepError::Config(_))));
    }
}
