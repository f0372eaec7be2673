use clap::Parser;
use isweep::analysis::frequency::ExecutionStrategy;
use isweep::analysis::illumination;
use isweep::config::SweepConfig;
use isweep::device::lumped::{LumpedDevice, LumpedSolution};
use isweep::device::Collaborators;
use isweep::error::IsweepError;
use isweep::harmonic::TraceAnalyzer;
use isweep::output;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Instant;

/// Impedance spectroscopy sweep of a lumped solar cell model
#[derive(Parser)]
#[command(name = "isweep", version)]
struct Cli {
    /// TOML sweep configuration
    config: String,

    /// Print sweep stats to stderr
    #[arg(long)]
    stats: bool,

    /// Evaluate frequencies one at a time
    #[arg(long)]
    serial: bool,

    /// Worker threads for the frequency loop
    #[arg(long, conflicts_with = "serial")]
    threads: Option<usize>,

    /// Also write Nyquist data to <config stem>.nyquist.csv
    #[arg(long)]
    graphics: bool,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let mut stats = if cli.stats { Some(isweep::stats::Stats::new()) } else { None };

    let config = SweepConfig::from_file(&cli.config).unwrap_or_else(|e| {
        eprintln!("Error reading {}: {}", cli.config, e);
        std::process::exit(1);
    });

    let mut params = config.sweep_params();
    if cli.serial {
        params.strategy = ExecutionStrategy::Serial;
    } else if let Some(threads) = cli.threads {
        params.strategy = ExecutionStrategy::Parallel { threads: Some(threads) };
    }

    let setup_start = Instant::now();
    let conditions = config.build_conditions().unwrap_or_else(|e| {
        eprintln!("Setup error: {}", e);
        std::process::exit(1);
    });
    if let Some(ref mut s) = stats {
        s.add_phase("Steady states", setup_start.elapsed());
    }

    let device = LumpedDevice::default();
    let analyzer = TraceAnalyzer::default();
    let tools = Collaborators::<LumpedSolution>::new(&device, &analyzer, &device, &device);

    let sweep_start = Instant::now();
    let result = illumination::run(&tools, conditions, &params, stats.as_mut()).unwrap_or_else(|e| {
        eprintln!("Sweep error: {}", e);
        std::process::exit(1);
    });
    if let Some(ref mut s) = stats {
        s.add_phase("Sweep", sweep_start.elapsed());
    }

    let mut stdout = io::stdout();
    output::write_sweep_csv(&result, &mut stdout).unwrap_or_else(|e| {
        eprintln!("Output error: {}", e);
        std::process::exit(1);
    });

    if cli.graphics || config.sweep.graphics {
        let path = Path::new(&cli.config).with_extension("nyquist.csv");
        let written = File::create(&path).map_err(IsweepError::from).and_then(|f| {
            let mut writer = BufWriter::new(f);
            output::write_nyquist_csv(&result, &mut writer)?;
            writer.flush().map_err(IsweepError::from)
        });
        if let Err(e) = written {
            eprintln!("Error writing {}: {}", path.display(), e);
            std::process::exit(1);
        }
        tracing::info!(path = %path.display(), "wrote Nyquist data");
    }

    if let Some(ref stats) = stats {
        stats.display();
    }
}
