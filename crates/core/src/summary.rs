use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::human::{bits_to_human, bytes_to_human};

/// End-of-run totals. Derived once from the scan and the wall-clock duration of the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferSummary {
    pub files: u64,
    pub total_bytes: u64,
    pub elapsed_secs: f64,
    pub average_bps: f64,
    pub tasks: u64,
    pub failed_tasks: u64,
}

impl TransferSummary {
    /// A zero duration is treated as one second so the average stays finite.
    pub fn new(files: u64, total_bytes: u64, elapsed: Duration, exit_codes: &[i32]) -> Self {
        let secs = elapsed.as_secs_f64();
        let elapsed_secs = if secs > 0.0 { secs } else { 1.0 };
        Self {
            files,
            total_bytes,
            elapsed_secs,
            average_bps: total_bytes as f64 * 8.0 / elapsed_secs,
            tasks: exit_codes.len() as u64,
            failed_tasks: exit_codes.iter().filter(|c| **c != 0).count() as u64,
        }
    }
}

impl fmt::Display for TransferSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "transferred {} files ({}) in {:.1}s, average {}",
            self.files,
            bytes_to_human(self.total_bytes),
            self.elapsed_secs,
            bits_to_human(self.average_bps),
        )?;
        if self.failed_tasks > 0 {
            write!(f, "; {}/{} tasks failed", self.failed_tasks, self.tasks)?;
        }
        Ok(())
    }
}

/// Outcome of a full parallel transfer: the summary plus one exit code per task, in task order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferReport {
    pub summary: TransferSummary,
    pub exit_codes: Vec<i32>,
}

impl TransferReport {
    pub fn succeeded(&self) -> bool {
        self.exit_codes.iter().all(|c| *c == 0)
    }
}
