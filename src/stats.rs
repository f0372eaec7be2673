//! Sweep statistics collection for `--stats` output.

use crate::analysis::gate::{Check, GateReport};
use std::time::{Duration, Instant};

/// Collects sweep counters and phase timings.
///
/// Created when `--stats` is passed, threaded as `Option<&mut Stats>`.
/// Zero cost when `None`: no timing calls, no counter increments.
pub struct Stats {
    total_start: Instant,
    phases: Vec<(String, Duration)>,
    pub cells: u32,
    pub simulations: u32,
    pub analyses: u32,
    // Escalations by triggering check
    pub near_boundary: u32,
    pub out_of_range: u32,
    pub still_out_of_range: u32,
    pub degenerate_cells: u32,
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            total_start: Instant::now(),
            phases: Vec::new(),
            cells: 0,
            simulations: 0,
            analyses: 0,
            near_boundary: 0,
            out_of_range: 0,
            still_out_of_range: 0,
            degenerate_cells: 0,
        }
    }

    /// Record a completed phase with its duration.
    pub fn add_phase(&mut self, name: impl Into<String>, duration: Duration) {
        self.phases.push((name.into(), duration));
    }

    /// Fold one cell's gate report into the counters.
    pub fn record_gate(&mut self, report: &GateReport) {
        self.cells += 1;
        self.simulations += report.simulations as u32;
        self.analyses += report.analyses as u32;
        for escalation in &report.escalations {
            match escalation.check {
                Check::NearBoundary => self.near_boundary += 1,
                Check::OutOfRange => self.out_of_range += 1,
                Check::StillOutOfRange => self.still_out_of_range += 1,
            }
        }
    }

    pub fn escalations(&self) -> u32 {
        self.near_boundary + self.out_of_range + self.still_out_of_range
    }

    /// Print the stats table to stderr.
    pub fn display(&self) {
        let total = self.total_start.elapsed();
        eprintln!();
        eprintln!("=== Impedance Sweep Stats ===");

        for (name, dur) in &self.phases {
            eprintln!("  {:<24} {:>8.3}s", name, dur.as_secs_f64());
        }

        eprintln!("  Cells:                  {}", self.cells);
        eprintln!("  Simulations:            {}", self.simulations);
        eprintln!("  Analyses:               {}", self.analyses);

        if self.escalations() > 0 {
            eprintln!(
                "  Escalations:            near_boundary={}  out_of_range={}  still_out_of_range={}",
                self.near_boundary, self.out_of_range, self.still_out_of_range
            );
        }

        if self.degenerate_cells > 0 {
            eprintln!("  Degenerate cells:       {}", self.degenerate_cells);
        }

        eprintln!("  ─────────────────────────────────");
        eprintln!("  Total:                  {:>8.3}s", total.as_secs_f64());
    }
}
