use std::io::Write;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::cpu::{CpuSampler, SystemCpuSampler};
use crate::human::{bits_to_human, bytes_to_human};
use crate::progress::ProgressTable;

pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusSample {
    pub transferred: u64,
    pub total: u64,
    pub bits_per_second: f64,
    pub cpu_percent: f32,
}

impl StatusSample {
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.transferred as f64 / self.total as f64 * 100.0
        }
    }
}

pub fn render_status_line(sample: &StatusSample) -> String {
    format!(
        "[progress] {}/{} ({:.1}%) rate: {}  cpu: {:.1}%",
        bytes_to_human(sample.transferred),
        bytes_to_human(sample.total),
        sample.percent(),
        bits_to_human(sample.bits_per_second),
        sample.cpu_percent,
    )
}

/// Periodically rewrites a single status line from the shared [`ProgressTable`].
///
/// The rate is measured against the wall-clock time since the previous render, so a late wake-up
/// does not inflate it. The first render happens immediately and reports a rate of zero.
pub struct ProgressAggregator<W> {
    table: ProgressTable,
    total_bytes: u64,
    interval: Duration,
    sampler: Box<dyn CpuSampler>,
    out: W,
}

impl<W: Write + Send + 'static> ProgressAggregator<W> {
    pub fn new(table: ProgressTable, total_bytes: u64, out: W) -> Self {
        Self {
            table,
            total_bytes,
            interval: DEFAULT_REPORT_INTERVAL,
            sampler: Box::new(SystemCpuSampler::new()),
            out,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_cpu_sampler(mut self, sampler: Box<dyn CpuSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<std::io::Result<W>> {
        tokio::spawn(self.run(cancel))
    }

    /// Renders until `cancel` fires, then ends the line and hands the writer back.
    pub async fn run(mut self, cancel: CancellationToken) -> std::io::Result<W> {
        let mut prev: Option<(Instant, u64)> = None;
        let mut last_width = 0;

        loop {
            let now = Instant::now();
            let transferred = self.table.total();
            let bits_per_second = match prev {
                Some((at, bytes)) => {
                    let dt = now.duration_since(at).as_secs_f64();
                    if dt > 0.0 {
                        transferred.saturating_sub(bytes) as f64 / dt * 8.0
                    } else {
                        0.0
                    }
                }
                None => 0.0,
            };
            let sample = StatusSample {
                transferred,
                total: self.total_bytes,
                bits_per_second,
                cpu_percent: self.sampler.sample(),
            };

            let line = render_status_line(&sample);
            // Pad so a shorter line fully covers the previous one.
            write!(self.out, "\r{line:<last_width$}")?;
            self.out.flush()?;
            last_width = line.len();
            prev = Some((now, transferred));

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.interval) => {}
            }
        }

        writeln!(self.out)?;
        self.out.flush()?;
        Ok(self.out)
    }
}
