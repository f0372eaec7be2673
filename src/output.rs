//! Results output formatting (CSV).

use crate::analysis::SweepResult;
use crate::error::Result;
use std::io::Write;

/// Write the sweep as CSV, one line per (illumination, frequency) cell.
///
/// Format:
/// ```csv
/// Intensity,Vdc,Frequency,MaxTime,total_bias,total_amplitude,total_phase_deg,total_Z_abs,total_Z_re,total_Z_im,total_C,ionic_bias,...
/// 1,1.05,1000000,0.00002,...
/// ```
pub fn write_sweep_csv<W: Write>(result: &SweepResult, writer: &mut W) -> Result<()> {
    // Header row
    write!(writer, "Intensity,Vdc,Frequency,MaxTime")?;
    for (ch, _) in result.harmonics.iter() {
        let n = ch.name();
        write!(
            writer,
            ",{n}_bias,{n}_amplitude,{n}_phase_deg,{n}_Z_abs,{n}_Z_re,{n}_Z_im,{n}_C"
        )?;
    }
    writeln!(writer)?;

    // Data rows
    for (i, (intensity, vdc)) in result.intensities.iter().zip(&result.vdc).enumerate() {
        for j in 0..result.n_frequencies() {
            write!(
                writer,
                "{},{},{},{}",
                intensity,
                vdc,
                result.frequencies.get(i, j),
                result.max_time.get(i, j)
            )?;
            for ((_, h), (_, z)) in result.harmonics.iter().zip(result.impedance.iter()) {
                write!(
                    writer,
                    ",{},{},{},{},{},{},{}",
                    h.bias.get(i, j),
                    h.amplitude.get(i, j),
                    h.phase.get(i, j).to_degrees(),
                    z.impedance_abs.get(i, j),
                    z.impedance_re.get(i, j),
                    z.impedance_im.get(i, j),
                    z.capacitance.get(i, j)
                )?;
            }
            writeln!(writer)?;
        }
    }
    Ok(())
}

/// Write total-current Nyquist data (Z' against -Z'') as CSV.
///
/// Format:
/// ```csv
/// Intensity,Frequency,Z_re,neg_Z_im
/// 1,1000000,12.5,3.1
/// ```
pub fn write_nyquist_csv<W: Write>(result: &SweepResult, writer: &mut W) -> Result<()> {
    let z = &result.impedance.total;
    writeln!(writer, "Intensity,Frequency,Z_re,neg_Z_im")?;
    for (i, intensity) in result.intensities.iter().enumerate() {
        for j in 0..result.n_frequencies() {
            writeln!(
                writer,
                "{},{},{},{}",
                intensity,
                result.frequencies.get(i, j),
                z.impedance_re.get(i, j),
                -z.impedance_im.get(i, j)
            )?;
        }
    }
    Ok(())
}
