//! Tracing setup: human-readable events on stdout plus an optional NDJSON run log.
//!
//! The subscriber is installed once per process. The JSON layer always exists but writes into a
//! sink until [`start_run_log`] opens a file, and goes back to the sink when the returned guard
//! is dropped.

use std::fs::OpenOptions;
use std::io::{BufWriter, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};

use chrono::Utc;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV_VAR: &str = "PARSYNC_LOG";
const DEFAULT_DIRECTIVE: &str = "info";

static RUN_LOGGER: OnceLock<RunLogger> = OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();

#[derive(Debug, Default)]
struct RunLogger {
    writer: Mutex<Option<BufWriter<std::fs::File>>>,
}

impl RunLogger {
    fn lock(&self) -> MutexGuard<'_, Option<BufWriter<std::fs::File>>> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn open(&self, path: &Path) -> std::io::Result<()> {
        let mut guard = self.lock();
        if guard.is_some() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "run log already active",
            ));
        }
        let file = OpenOptions::new().create_new(true).write(true).open(path)?;
        *guard = Some(BufWriter::new(file));
        Ok(())
    }

    fn close(&self) -> std::io::Result<()> {
        let Some(mut writer) = self.lock().take() else {
            return Ok(());
        };
        writer.flush()?;
        writer.get_ref().sync_all()
    }
}

struct RunLogWriter<'a> {
    guard: MutexGuard<'a, Option<BufWriter<std::fs::File>>>,
}

impl Write for RunLogWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.guard.as_mut() {
            Some(w) => w.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.guard.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for RunLogger {
    type Writer = RunLogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        RunLogWriter { guard: self.lock() }
    }
}

impl<'a> MakeWriter<'a> for &RunLogger {
    type Writer = RunLogWriter<'a>;

    fn make_writer(&'a self) -> Self::Writer {
        (**self).make_writer()
    }
}

fn build_env_filter_from(parsync_log: Option<&str>, rust_log: Option<&str>) -> EnvFilter {
    let default = || EnvFilter::new(DEFAULT_DIRECTIVE);

    match parsync_log.or(rust_log) {
        Some(v) => EnvFilter::try_new(v).unwrap_or_else(|_| default()),
        None => default(),
    }
}

fn build_env_filter() -> EnvFilter {
    build_env_filter_from(
        std::env::var(LOG_ENV_VAR).ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
    )
}

/// Plain-text event layer. Colour codes are only written when `ansi` is set.
fn human_layer<S, W>(make_writer: W, ansi: bool) -> impl Layer<S>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_ansi(ansi)
        .with_writer(make_writer)
}

/// Installs the global subscriber. Later calls are no-ops, as is losing the race to another
/// subscriber (e.g. one installed by a test harness).
pub fn init_logging() {
    TRACING_INIT.get_or_init(|| {
        let logger = RUN_LOGGER.get_or_init(RunLogger::default);

        let stdout = human_layer(std::io::stdout, std::io::stdout().is_terminal());
        let json = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(logger);

        let _ = tracing_subscriber::registry()
            .with(build_env_filter())
            .with(stdout)
            .with(json)
            .try_init();
    });
}

pub fn new_run_id() -> String {
    format!("run_{}", uuid::Uuid::new_v4())
}

/// Closes the run log file when dropped.
pub struct RunLogGuard {
    path: PathBuf,
}

impl RunLogGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLogGuard {
    fn drop(&mut self) {
        if let Some(logger) = RUN_LOGGER.get() {
            let _ = logger.close();
        }
    }
}

/// Starts mirroring every event into `log_dir/parsync-<UTC timestamp>-<run_id>.ndjson`.
pub fn start_run_log(run_id: &str, log_dir: &Path) -> std::io::Result<RunLogGuard> {
    init_logging();
    std::fs::create_dir_all(log_dir)?;

    let file_name = format!(
        "parsync-{}-{}.ndjson",
        Utc::now().format("%Y%m%dT%H%M%SZ"),
        sanitize_filename_component(run_id)
    );
    let path = log_dir.join(file_name);

    RUN_LOGGER.get_or_init(RunLogger::default).open(&path)?;
    Ok(RunLogGuard { path })
}

fn sanitize_filename_component(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect()
}
