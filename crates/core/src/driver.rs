use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::{DEFAULT_REPORT_INTERVAL, ProgressAggregator};
use crate::config::default_max_procs;
use crate::cpu::SystemCpuSampler;
use crate::executor::ParallelExecutor;
use crate::logging::new_run_id;
use crate::partition::split_by_capacity;
use crate::progress::ProgressTable;
use crate::scan::scan_dir;
use crate::summary::{TransferReport, TransferSummary};
use crate::task::{TransferOptions, TransferTask};
use crate::throttle::{CpuThrottle, ProcessRegistry, ThrottleConfig};
use crate::{DESTINATION_SCHEME, Error, Result};

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub source_dir: PathBuf,
    pub destination: String,
    /// Transfer executable; `None` means `rsync` from `PATH`.
    pub program: Option<PathBuf>,
    pub max_procs: usize,
    pub options: TransferOptions,
    pub progress_interval: Duration,
    /// `None` leaves running transfers alone regardless of CPU load.
    pub throttle: Option<ThrottleConfig>,
    pub run_id: String,
}

impl TransferConfig {
    pub fn new(source_dir: impl Into<PathBuf>, destination: impl Into<String>) -> Self {
        Self {
            source_dir: source_dir.into(),
            destination: destination.into(),
            program: None,
            max_procs: default_max_procs(),
            options: TransferOptions::default(),
            progress_interval: DEFAULT_REPORT_INTERVAL,
            throttle: None,
            run_id: new_run_id(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.source_dir.is_dir() {
            return Err(Error::SourceNotFound {
                path: self.source_dir.clone(),
            });
        }
        validate_destination(&self.destination)?;
        if self.max_procs == 0 {
            return Err(Error::InvalidConfig {
                message: "max_procs must be >= 1".to_string(),
            });
        }
        if self.progress_interval.is_zero() {
            return Err(Error::InvalidConfig {
                message: "progress interval must be > 0".to_string(),
            });
        }
        if let Some(throttle) = &self.throttle {
            throttle.validate()?;
        }
        Ok(())
    }
}

pub fn validate_destination(destination: &str) -> Result<()> {
    if destination.starts_with(DESTINATION_SCHEME) {
        Ok(())
    } else {
        Err(Error::InvalidDestination {
            destination: destination.to_string(),
        })
    }
}

/// [`run_parallel_transfer_with`] rendering progress to stdout.
pub async fn run_parallel_transfer(config: TransferConfig) -> Result<TransferReport> {
    run_parallel_transfer_with(config, std::io::stdout()).await
}

/// Scans `source_dir`, splits it into at most `max_procs` size-balanced groups and transfers
/// every group concurrently.
///
/// Configuration problems fail before anything is spawned. Task failures do not: they are
/// reported through [`TransferReport::exit_codes`] once every task has finished.
pub async fn run_parallel_transfer_with<W>(config: TransferConfig, out: W) -> Result<TransferReport>
where
    W: Write + Send + 'static,
{
    config.validate()?;

    let scan = scan_dir(&config.source_dir)?;
    if scan.entries.is_empty() {
        return Err(Error::NoFiles {
            path: config.source_dir.clone(),
        });
    }
    let files = scan.entries.len() as u64;
    let total_bytes = scan.total_bytes;

    let groups = split_by_capacity(&scan.entries, scan.entries.len().min(config.max_procs));
    info!(
        event = "run.start",
        run_id = %config.run_id,
        source = %config.source_dir.display(),
        destination = %config.destination,
        files,
        total_bytes,
        tasks = groups.len(),
        "run.start"
    );

    let tasks: Vec<TransferTask> = groups
        .into_iter()
        .map(|group| {
            let task = TransferTask::new(
                group,
                config.destination.clone(),
                config.source_dir.clone(),
                config.options,
            );
            match &config.program {
                Some(program) => task.with_program(program),
                None => task,
            }
        })
        .collect();

    let started = Instant::now();
    let table = ProgressTable::new();
    let cancel = CancellationToken::new();
    let mut executor = ParallelExecutor::new(tasks).with_progress(Arc::new(table.clone()));

    let aggregator = config.options.progress.then(|| {
        ProgressAggregator::new(table.clone(), total_bytes, out)
            .with_interval(config.progress_interval)
            .spawn(cancel.clone())
    });

    let throttle = match config.throttle {
        Some(throttle_config) => {
            let registry = ProcessRegistry::new();
            executor = executor.with_process_registry(registry.clone());
            let sampler = Box::new(SystemCpuSampler::new());
            Some(CpuThrottle::new(throttle_config, registry, sampler).spawn(cancel.clone()))
        }
        None => {
            debug!(event = "throttle.disabled", "throttle.disabled");
            None
        }
    };

    let exit_codes = executor.run_all().await;
    let elapsed = started.elapsed();

    cancel.cancel();
    if let Some(handle) = aggregator {
        match handle.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(event = "progress.write_failed", error = %e, "progress.write_failed"),
            Err(e) => warn!(event = "progress.aborted", error = %e, "progress.aborted"),
        }
    }
    if let Some(handle) = throttle {
        if let Err(e) = handle.await {
            warn!(event = "throttle.aborted", error = %e, "throttle.aborted");
        }
    }

    let summary = TransferSummary::new(files, total_bytes, elapsed, &exit_codes);
    info!(
        event = "run.finish",
        run_id = %config.run_id,
        tasks = summary.tasks,
        failed = summary.failed_tasks,
        elapsed_secs = summary.elapsed_secs,
        "run.finish"
    );

    Ok(TransferReport {
        summary,
        exit_codes,
    })
}
