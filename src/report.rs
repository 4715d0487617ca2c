use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets};
use ndarray::{ArrayView2, ArrayView3};

use crate::learn::StageError;

/// One row of the learning trace: the objective after each half-step.
#[derive(Debug, Clone)]
pub struct IterationReport {
    pub iteration: usize,
    /// Objective after the sparse-code stage.
    pub objective_z: f64,
    /// Objective after the dictionary stage.
    pub objective_d: f64,
    /// Seconds spent in the sparse-code stage.
    pub time_z: f64,
    /// Seconds spent in the dictionary stage.
    pub time_d: f64,
    /// Fraction of non-zero activations.
    pub sparsity: f64,
}

pub(crate) fn emit_line(line: &str) {
    if log::log_enabled!(log::Level::Info) {
        log::info!("{line}");
    } else {
        println!("{line}");
    }
}

pub trait Reporter {
    fn on_iteration(&mut self, report: &IterationReport);
    fn on_finish(&mut self) {}
}

/// Collects reports and prints them as a table when the run finishes.
pub struct StdoutReporter {
    rows: Vec<IterationReport>,
}

impl StdoutReporter {
    pub fn new() -> Self {
        Self { rows: Vec::new() }
    }
}

impl Default for StdoutReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for StdoutReporter {
    fn on_iteration(&mut self, report: &IterationReport) {
        self.rows.push(report.clone());
    }

    fn on_finish(&mut self) {
        if self.rows.is_empty() {
            return;
        }
        if !log::log_enabled!(log::Level::Info) {
            println!();
        }
        let mut table = Table::new();
        table.load_preset(presets::UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec![
            Cell::new("iter").set_alignment(CellAlignment::Right),
            Cell::new("obj (z)").set_alignment(CellAlignment::Right),
            Cell::new("obj (d)").set_alignment(CellAlignment::Right),
            Cell::new("time z").set_alignment(CellAlignment::Right),
            Cell::new("time d").set_alignment(CellAlignment::Right),
            Cell::new("nnz").set_alignment(CellAlignment::Right),
        ]);
        for row in &self.rows {
            table.add_row(vec![
                Cell::new(row.iteration).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.6e}", row.objective_z)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.6e}", row.objective_d)).set_alignment(CellAlignment::Right),
                Cell::new(format_seconds(row.time_z)).set_alignment(CellAlignment::Right),
                Cell::new(format_seconds(row.time_d)).set_alignment(CellAlignment::Right),
                Cell::new(format!("{:.3}", row.sparsity)).set_alignment(CellAlignment::Right),
            ]);
        }

        for line in table.to_string().lines() {
            emit_line(line);
        }
        self.rows.clear();
    }
}

pub(crate) fn format_seconds(secs: f64) -> String {
    if secs >= 1.0 {
        format!("{:.3} s", secs)
    } else if secs >= 1e-3 {
        format!("{:.3} ms", secs * 1e3)
    } else if secs >= 1e-6 {
        format!("{:.3} us", secs * 1e6)
    } else {
        format!("{:.0} ns", secs * 1e9)
    }
}

/// Observer invoked after every complete outer iteration.
///
/// Returning an error aborts the run; the error is surfaced as
/// [`LearnError::Callback`](crate::LearnError::Callback).
pub trait Callback {
    fn on_iteration(
        &mut self,
        x: ArrayView3<'_, f64>,
        uv: ArrayView2<'_, f64>,
        z: ArrayView3<'_, f64>,
        reg: f64,
    ) -> Result<(), StageError>;
}

impl<F> Callback for F
where
    F: FnMut(ArrayView3<'_, f64>, ArrayView2<'_, f64>, ArrayView3<'_, f64>, f64) -> Result<(), StageError>,
{
    fn on_iteration(
        &mut self,
        x: ArrayView3<'_, f64>,
        uv: ArrayView2<'_, f64>,
        z: ArrayView3<'_, f64>,
        reg: f64,
    ) -> Result<(), StageError> {
        self(x, uv, z, reg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_seconds_by_magnitude() {
        assert_eq!(format_seconds(2.5), "2.500 s");
        assert_eq!(format_seconds(0.004), "4.000 ms");
        assert_eq!(format_seconds(3e-6), "3.000 us");
    }

    #[test]
    fn reporter_clears_rows_on_finish() {
        let mut reporter = StdoutReporter::new();
        reporter.on_iteration(&IterationReport {
            iteration: 0,
            objective_z: 2.0,
            objective_d: 1.5,
            time_z: 0.01,
            time_d: 0.02,
            sparsity: 0.1,
        });
        assert_eq!(reporter.rows.len(), 1);
        reporter.on_finish();
        assert!(reporter.rows.is_empty());
    }
}
