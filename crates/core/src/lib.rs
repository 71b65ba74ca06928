mod aggregator;
mod config;
mod cpu;
mod driver;
mod error;
mod executor;
mod human;
mod logging;
mod partition;
mod progress;
mod scan;
mod summary;
mod task;
mod throttle;

pub const APP_NAME: &str = "parsync";
/// Every destination must use the rsync daemon protocol.
pub const DESTINATION_SCHEME: &str = "rsync://";

pub use aggregator::{DEFAULT_REPORT_INTERVAL, ProgressAggregator, StatusSample, render_status_line};
pub use config::{
    CONFIG_ENV_VAR, ProgressSettings, Settings, ThrottleSettings, TransferSettings,
    default_max_procs, load_settings, parse_settings, resolve_config_path,
};
pub use cpu::{CpuSampler, FixedCpuSampler, SystemCpuSampler};
pub use driver::{
    TransferConfig, run_parallel_transfer, run_parallel_transfer_with, validate_destination,
};
pub use error::{Error, Result};
pub use executor::{ABNORMAL_EXIT_CODE, ParallelExecutor, SPAWN_FAILED_EXIT_CODE};
pub use human::{bits_to_human, bytes_to_human};
pub use logging::{LOG_ENV_VAR, RunLogGuard, init_logging, new_run_id, start_run_log};
pub use partition::{Group, split_by_capacity};
pub use progress::{ProgressSink, ProgressTable, TaskProgress};
pub use scan::{FileEntry, ScanResult, scan_dir};
pub use summary::{TransferReport, TransferSummary};
pub use task::{
    DEFAULT_PROGRAM, ProgressLineCodec, RunContext, TransferJob, TransferOptions, TransferTask,
    parse_progress_bytes, read_progress,
};
pub use throttle::{
    CpuThrottle, ProcessRegistry, ProcessSignal, ThrottleConfig, validate_thresholds,
};
