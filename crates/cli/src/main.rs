use std::io::Write;
use std::path::{Path, PathBuf};

use clap::Parser;
use parsync_core::{
    Settings, TransferConfig, TransferOptions, init_logging, load_settings, new_run_id,
    resolve_config_path, run_parallel_transfer, start_run_log,
};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "parsync")]
#[command(
    about = "Copy a directory tree to an rsync daemon using several rsync processes at once",
    long_about = None
)]
struct Cli {
    /// Directory whose contents are transferred.
    source: PathBuf,

    /// Target, e.g. rsync://host/module/path.
    destination: String,

    /// Number of concurrent rsync processes [default: cores - 1].
    #[arg(long)]
    max_procs: Option<usize>,

    /// Host CPU percentage above which transfers are paused (with --throttle).
    #[arg(long)]
    suspend_threshold: Option<f32>,

    /// Host CPU percentage below which paused transfers continue (with --throttle).
    #[arg(long)]
    resume_threshold: Option<f32>,

    #[arg(short = 'z', long)]
    compress: bool,

    /// Show an aggregated progress line.
    #[arg(long)]
    progress: bool,

    /// Pause transfers while host CPU usage is above the suspend threshold.
    #[arg(long)]
    throttle: bool,

    /// Settings file [env: PARSYNC_CONFIG].
    #[arg(long)]
    config: Option<PathBuf>,

    /// Transfer executable to run instead of `rsync`.
    #[arg(long)]
    program: Option<PathBuf>,

    /// Print the final summary (and errors) as JSON.
    #[arg(long)]
    json: bool,

    /// Directory for an NDJSON log of this run.
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let json = cli.json;
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e, json);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let mut settings = match resolve_config_path(cli.config.as_deref()) {
        Some(path) => load_settings(&path).map_err(map_core_err)?,
        None => Settings::default(),
    };
    apply_overrides(&mut settings, &cli);
    settings.validate().map_err(map_core_err)?;

    init_logging();
    let run_id = new_run_id();
    let _run_log = match &cli.log_dir {
        Some(dir) => Some(
            start_run_log(&run_id, dir)
                .map_err(|e| CliError::new("log.open_failed", e.to_string()))?,
        ),
        None => None,
    };
    if !settings.throttle.enabled {
        tracing::debug!(
            event = "throttle.thresholds_ignored",
            suspend_threshold = settings.throttle.suspend_threshold,
            resume_threshold = settings.throttle.resume_threshold,
            "throttle.thresholds_ignored"
        );
    }

    let config = TransferConfig {
        source_dir: cli.source,
        destination: cli.destination,
        program: settings.transfer.program.as_deref().map(resolve_program),
        max_procs: settings.max_procs(),
        options: TransferOptions {
            progress: settings.progress.enabled,
            compress: settings.transfer.compress,
        },
        progress_interval: settings.progress.interval(),
        throttle: settings
            .throttle
            .enabled
            .then(|| settings.throttle.to_config()),
        run_id,
    };

    let report = run_parallel_transfer(config).await.map_err(map_core_err)?;

    if cli.json {
        println!(
            "{}",
            serde_json::json!({
                "summary": report.summary,
                "exitCodes": report.exit_codes,
            })
        );
    } else {
        println!("{}", report.summary);
    }

    if report.succeeded() {
        Ok(())
    } else {
        Err(CliError::new(
            "transfer.failed",
            format!(
                "{} of {} tasks failed (exit codes: {:?})",
                report.summary.failed_tasks, report.summary.tasks, report.exit_codes
            ),
        ))
    }
}

/// Command-line flags win over the settings file. Boolean flags can only switch features on.
fn apply_overrides(settings: &mut Settings, cli: &Cli) {
    if let Some(n) = cli.max_procs {
        settings.transfer.max_procs = Some(n);
    }
    if let Some(program) = &cli.program {
        settings.transfer.program = Some(program.clone());
    }
    if let Some(v) = cli.suspend_threshold {
        settings.throttle.suspend_threshold = v;
    }
    if let Some(v) = cli.resume_threshold {
        settings.throttle.resume_threshold = v;
    }
    settings.transfer.compress |= cli.compress;
    settings.progress.enabled |= cli.progress;
    settings.throttle.enabled |= cli.throttle;
}

/// Tasks run with the source directory as cwd, so a relative path like `./bin/rsync` is pinned to
/// the invocation directory here. A bare name is left for `PATH` lookup.
fn resolve_program(program: &Path) -> PathBuf {
    let has_dir = program
        .parent()
        .is_some_and(|dir| !dir.as_os_str().is_empty());
    if has_dir && program.is_relative() {
        std::path::absolute(program).unwrap_or_else(|_| program.to_path_buf())
    } else {
        program.to_path_buf()
    }
}

fn map_core_err(e: parsync_core::Error) -> CliError {
    use parsync_core::Error;

    let code = match &e {
        Error::InvalidConfig { .. } => "config.invalid",
        Error::Settings { .. } => "config.unreadable",
        Error::SourceNotFound { .. } => "source.not_found",
        Error::InvalidDestination { .. } => "destination.invalid",
        Error::NoFiles { .. } => "source.empty",
        Error::Spawn { .. } => "transfer.spawn_failed",
        Error::Io(_) | Error::Walkdir(_) => "io",
    };
    CliError::new(code, e.to_string())
}

fn emit_error(e: &CliError, json: bool) {
    let line = if json {
        serde_json::to_string(e).unwrap_or_else(|_| {
            "{\"code\":\"unknown\",\"message\":\"json encode failed\"}".to_string()
        })
    } else {
        format!("error: {} ({})", e.message, e.code)
    };
    let _ = writeln!(std::io::stderr(), "{line}");
}
