//! The line-oriented scan data file shared by the acquisition side and the analysis side.
//!
//! ```text
//! comment
//! <plate length> <plate gap>
//! beam energy
//! motor start (mm)
//! motor step (mm)
//! voltage start (supply volts; x100 at the plates)
//! voltage step (supply volts)
//! voltage steps - 1
//! position steps - 1
//! one row per position, one value per voltage step
//! ```
//! Existing data sets depend on this exact layout, including the steps-minus-one encoding.
#![warn(clippy::pedantic)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::module_name_repetitions)]

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use thiserror::Error;

/// Gain of the high-voltage amplifier between the analog output and the deflection plates.
pub const VOLTAGE_SCALE: f64 = 100.0;

#[derive(Debug, Error)]
pub enum DataFormatError {
    #[error("failed to read scan file: {0}")]
    Io(#[from] io::Error),
    #[error("scan file ends before the {field} header line (line {line})")]
    MissingLine { line: usize, field: &'static str },
    #[error("line {line}: cannot parse {text:?} as a number")]
    BadNumber { line: usize, text: String },
    #[error("line {line}: expected {expected} values, found {found}")]
    RowLength {
        line: usize,
        expected: usize,
        found: usize,
    },
    #[error("expected {expected} data rows, found {found}")]
    RowCount { expected: usize, found: usize },
    #[error("{field} must be at least 1, header gives {value}")]
    InvalidSteps { field: &'static str, value: i64 },
}

/// The header record exactly as stored: voltages in supply volts, step counts as counts.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanHeader {
    pub comment: String,
    pub plate_length: f64,
    pub plate_gap: f64,
    pub beam_energy: f64,
    pub motor_start_mm: f64,
    pub motor_step_mm: f64,
    pub voltage_start: f64,
    pub voltage_step: f64,
    pub voltage_steps: usize,
    pub position_steps: usize,
}

/// Physical axes of a scan: plate geometry, beam energy, slit positions in mm and plate
/// voltages in volts.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisCalibration {
    pub plate_length: f64,
    pub plate_gap: f64,
    pub beam_energy: f64,
    pub motor_start: f64,
    pub motor_step_size: f64,
    pub voltage_min: f64,
    pub voltage_step_size: f64,
    pub voltage_steps: usize,
    pub position_steps: usize,
}

impl AxisCalibration {
    /// # Errors
    /// Returns `InvalidSteps` if either step count is zero.
    pub fn from_header(header: &ScanHeader) -> Result<Self, DataFormatError> {
        check_steps("voltage steps", header.voltage_steps)?;
        check_steps("position steps", header.position_steps)?;
        Ok(AxisCalibration {
            plate_length: header.plate_length,
            plate_gap: header.plate_gap,
            beam_energy: header.beam_energy,
            motor_start: header.motor_start_mm,
            motor_step_size: header.motor_step_mm,
            voltage_min: header.voltage_start * VOLTAGE_SCALE,
            voltage_step_size: header.voltage_step * VOLTAGE_SCALE,
            voltage_steps: header.voltage_steps,
            position_steps: header.position_steps,
        })
    }

    #[must_use]
    pub fn motor_end(&self) -> f64 {
        self.motor_start + self.motor_step_size * (self.position_steps - 1) as f64
    }

    #[must_use]
    pub fn voltage_max(&self) -> f64 {
        self.voltage_min + self.voltage_step_size * (self.voltage_steps - 1) as f64
    }

    /// mrad per plate volt.
    #[must_use]
    pub fn theta_conversion(&self) -> f64 {
        self.plate_length * 1000.0 / (self.beam_energy * 4.0 * self.plate_gap)
    }

    /// Slit positions in mm. Spaced by `(end - start) / steps`, so the nominal end is never
    /// reached; results on archived data sets depend on this spacing.
    #[must_use]
    pub fn position_axis(&self) -> Array1<f64> {
        open_axis(self.motor_start, self.motor_end(), self.position_steps)
    }

    /// Plate voltages converted to angle (mrad), with the same spacing as [`Self::position_axis`].
    #[must_use]
    pub fn theta_axis(&self) -> Array1<f64> {
        open_axis(self.voltage_min, self.voltage_max(), self.voltage_steps)
            * self.theta_conversion()
    }
}

fn open_axis(start: f64, end: f64, steps: usize) -> Array1<f64> {
    let step = (end - start) / steps as f64;
    Array1::from_iter((0..steps).map(|i| start + i as f64 * step))
}

fn check_steps(field: &'static str, steps: usize) -> Result<(), DataFormatError> {
    if steps == 0 {
        Err(DataFormatError::InvalidSteps { field, value: 0 })
    } else {
        Ok(())
    }
}

/// Raw readings, one row per slit position and one column per voltage step. Rows are only ever
/// appended.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanGrid {
    data: Array2<f64>,
}

impl ScanGrid {
    #[must_use]
    pub fn new(voltage_steps: usize) -> Self {
        ScanGrid {
            data: Array2::zeros((0, voltage_steps)),
        }
    }

    #[must_use]
    pub fn from_array(data: Array2<f64>) -> Self {
        ScanGrid { data }
    }

    /// # Errors
    /// Rejects a row whose length differs from the voltage step count.
    pub fn push_row(&mut self, row: &[f64]) -> Result<(), DataFormatError> {
        let expected = self.voltage_steps();
        if row.len() != expected {
            return Err(DataFormatError::RowLength {
                line: self.position_rows() + 1,
                expected,
                found: row.len(),
            });
        }
        self.data
            .push_row(ArrayView1::from(row))
            .map_err(|_| DataFormatError::RowLength {
                line: self.data.nrows() + 1,
                expected,
                found: row.len(),
            })
    }

    #[inline]
    #[must_use]
    pub fn position_rows(&self) -> usize {
        self.data.nrows()
    }

    #[inline]
    #[must_use]
    pub fn voltage_steps(&self) -> usize {
        self.data.ncols()
    }

    #[must_use]
    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }
}

/// Writes a scan file as the scan runs. Every row is flushed as soon as it is complete, so an
/// interrupted run leaves every finished position on disk.
pub struct ScanRecorder<W: Write> {
    out: W,
    rows_written: usize,
}

impl ScanRecorder<File> {
    /// # Errors
    /// Propagates file creation and header write failures.
    pub fn create(path: &Path, header: &ScanHeader) -> io::Result<Self> {
        ScanRecorder::new(File::create(path)?, header)
    }
}

impl<W: Write> ScanRecorder<W> {
    /// # Errors
    /// Propagates write failures, and refuses zero step counts since those cannot be encoded.
    pub fn new(mut out: W, header: &ScanHeader) -> io::Result<Self> {
        if header.voltage_steps == 0 || header.position_steps == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "scan header needs at least one voltage and one position step",
            ));
        }
        writeln!(out, "{}", header.comment.replace('\n', " "))?;
        writeln!(out, "{} {}", header.plate_length, header.plate_gap)?;
        writeln!(out, "{}", header.beam_energy)?;
        writeln!(out, "{}", header.motor_start_mm)?;
        writeln!(out, "{}", header.motor_step_mm)?;
        writeln!(out, "{}", header.voltage_start)?;
        writeln!(out, "{}", header.voltage_step)?;
        writeln!(out, "{}", header.voltage_steps - 1)?;
        writeln!(out, "{}", header.position_steps - 1)?;
        out.flush()?;
        Ok(ScanRecorder {
            out,
            rows_written: 0,
        })
    }

    /// # Errors
    /// Propagates write failures.
    pub fn write_row(&mut self, row: &[f64]) -> io::Result<()> {
        let line = row
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        writeln!(self.out, "{line}")?;
        self.out.flush()?;
        self.rows_written += 1;
        Ok(())
    }

    #[must_use]
    pub fn rows_written(&self) -> usize {
        self.rows_written
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

struct LineSource<R: BufRead> {
    lines: io::Lines<R>,
    line_no: usize,
}

impl<R: BufRead> LineSource<R> {
    fn next_line(&mut self, field: &'static str) -> Result<String, DataFormatError> {
        self.line_no += 1;
        match self.lines.next() {
            Some(line) => Ok(line?.trim().to_string()),
            None => Err(DataFormatError::MissingLine {
                line: self.line_no,
                field,
            }),
        }
    }

    fn next_f64(&mut self, field: &'static str) -> Result<f64, DataFormatError> {
        let line = self.next_line(field)?;
        parse_f64(&line, self.line_no)
    }

    fn next_steps(&mut self, field: &'static str) -> Result<usize, DataFormatError> {
        let line = self.next_line(field)?;
        let stored = line
            .parse::<i64>()
            .map_err(|_| DataFormatError::BadNumber {
                line: self.line_no,
                text: line.clone(),
            })?;
        let count = stored.saturating_add(1);
        usize::try_from(count)
            .ok()
            .filter(|&n| (1..=MAX_STEPS).contains(&n))
            .ok_or(DataFormatError::InvalidSteps {
                field,
                value: count,
            })
    }
}

/// Largest step count accepted from a file header.
pub const MAX_STEPS: usize = 1 << 20;

fn parse_f64(text: &str, line: usize) -> Result<f64, DataFormatError> {
    text.parse::<f64>().map_err(|_| DataFormatError::BadNumber {
        line,
        text: text.to_string(),
    })
}

/// Parse a complete scan file.
/// # Errors
/// Any short header, unparseable value, ragged row or missing row is a `DataFormatError`.
pub fn read_scan<R: BufRead>(reader: R) -> Result<(ScanHeader, ScanGrid), DataFormatError> {
    let mut src = LineSource {
        lines: reader.lines(),
        line_no: 0,
    };
    let comment = src.next_line("comment")?;
    let geometry = src.next_line("plate geometry")?;
    let mut parts = geometry.split_whitespace();
    let (plate_length, plate_gap) = match (parts.next(), parts.next()) {
        (Some(l), Some(g)) => (parse_f64(l, 2)?, parse_f64(g, 2)?),
        _ => {
            return Err(DataFormatError::BadNumber {
                line: 2,
                text: geometry.clone(),
            })
        }
    };
    let beam_energy = src.next_f64("beam energy")?;
    let motor_start_mm = src.next_f64("motor start")?;
    let motor_step_mm = src.next_f64("motor step")?;
    let voltage_start = src.next_f64("voltage start")?;
    let voltage_step = src.next_f64("voltage step")?;
    let voltage_steps = src.next_steps("voltage steps")?;
    let position_steps = src.next_steps("position steps")?;

    let header = ScanHeader {
        comment,
        plate_length,
        plate_gap,
        beam_energy,
        motor_start_mm,
        motor_step_mm,
        voltage_start,
        voltage_step,
        voltage_steps,
        position_steps,
    };

    let mut grid = ScanGrid::new(voltage_steps);
    let mut row = Vec::new();
    for line in src.lines {
        src.line_no += 1;
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        row.clear();
        for text in line.split_whitespace() {
            row.push(parse_f64(text, src.line_no)?);
        }
        if row.len() != voltage_steps {
            return Err(DataFormatError::RowLength {
                line: src.line_no,
                expected: voltage_steps,
                found: row.len(),
            });
        }
        grid.push_row(&row)?;
    }
    if grid.position_rows() != position_steps {
        return Err(DataFormatError::RowCount {
            expected: position_steps,
            found: grid.position_rows(),
        });
    }
    Ok((header, grid))
}

/// # Errors
/// See [`read_scan`].
pub fn load_scan_file(path: &Path) -> Result<(ScanHeader, ScanGrid), DataFormatError> {
    read_scan(BufReader::new(File::open(path)?))
}
