//! Impedance spectroscopy sweeps over perturbed steady-state device solutions.

pub mod analysis;
pub mod config;
pub mod device;
pub mod error;
pub mod harmonic;
pub mod ir;
pub mod output;
pub mod stats;
