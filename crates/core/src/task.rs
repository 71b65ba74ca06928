use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};

use bytes::BytesMut;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, error, info, warn};

use crate::throttle::ProcessRegistry;
use crate::{Error, Result};

pub const DEFAULT_PROGRAM: &str = "rsync";

const ARCHIVE_FLAGS: &str = "-av";
const RELATIVE_PATHS_FLAG: &str = "-R";
const PROGRESS_FLAG: &str = "--info=progress2";
const COMPRESS_FLAG: &str = "-z";

const MAX_LINE_BYTES: usize = 64 * 1024;

/// Hooks a running job reports through. All fields are optional.
#[derive(Default, Clone, Copy)]
pub struct RunContext<'a> {
    pub slot: usize,
    pub on_progress: Option<&'a (dyn Fn(u64) + Send + Sync)>,
    pub processes: Option<&'a ProcessRegistry>,
}

/// A unit of work the executor can run: one external invocation returning an exit code.
pub trait TransferJob: Send + Sync {
    fn execute<'a>(
        &'a self,
        ctx: RunContext<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<i32>> + Send + 'a>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferOptions {
    pub progress: bool,
    pub compress: bool,
}

#[derive(Debug, Clone)]
pub struct TransferTask {
    program: PathBuf,
    sources: Vec<PathBuf>,
    destination: String,
    base_dir: PathBuf,
    options: TransferOptions,
}

impl TransferTask {
    pub fn new(
        sources: Vec<PathBuf>,
        destination: impl Into<String>,
        base_dir: impl Into<PathBuf>,
        options: TransferOptions,
    ) -> Self {
        Self {
            program: PathBuf::from(DEFAULT_PROGRAM),
            sources,
            destination: destination.into(),
            base_dir: base_dir.into(),
            options,
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    /// Arguments after the program name: flags, `./`-prefixed relative sources, destination.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![ARCHIVE_FLAGS.to_string(), RELATIVE_PATHS_FLAG.to_string()];
        if self.options.progress {
            args.push(PROGRESS_FLAG.to_string());
        }
        if self.options.compress {
            args.push(COMPRESS_FLAG.to_string());
        }
        args.extend(
            self.sources
                .iter()
                .map(|src| relative_source(src, &self.base_dir).display().to_string()),
        );
        args.push(self.destination.clone());
        args
    }

    pub fn command_line(&self) -> String {
        render_command(&self.program, &self.args())
    }

    /// Runs the transfer once, calling `on_progress` with every cumulative byte count parsed
    /// from the program's output. Returns the program's exit code.
    pub async fn run(&self, on_progress: Option<&(dyn Fn(u64) + Send + Sync)>) -> Result<i32> {
        self.run_with(RunContext {
            on_progress,
            ..RunContext::default()
        })
        .await
    }

    pub async fn run_with(&self, ctx: RunContext<'_>) -> Result<i32> {
        if self.sources.is_empty() {
            debug!(event = "task.skip_empty", slot = ctx.slot, "task.skip_empty");
            return Ok(0);
        }

        let args = self.args();
        let command_line = render_command(&self.program, &args);
        info!(
            event = "task.start",
            slot = ctx.slot,
            files = self.sources.len(),
            cwd = %self.base_dir.display(),
            command = %command_line,
            "task.start"
        );

        let mut child = Command::new(&self.program)
            .args(&args)
            .current_dir(&self.base_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|source| Error::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if let (Some(processes), Some(pid)) = (ctx.processes, child.id()) {
            processes.register(ctx.slot, pid);
        }

        if let Some(stdout) = child.stdout.take() {
            let report = |bytes: u64| {
                if let Some(cb) = ctx.on_progress {
                    cb(bytes);
                }
            };
            if let Err(e) = read_progress(stdout, report).await {
                warn!(
                    event = "task.output_read_failed",
                    slot = ctx.slot,
                    error = %e,
                    "task.output_read_failed"
                );
            }
        }

        // The PID stays reserved until wait() reaps it, so dropping it from the registry first keeps
        // the throttle from ever signalling a recycled PID. A child that closes stdout early stops
        // being throttled from that point on.
        if let Some(processes) = ctx.processes {
            processes.unregister(ctx.slot);
        }
        let code = exit_code(child.wait().await?);

        if code == 0 {
            info!(
                event = "task.finish",
                slot = ctx.slot,
                command = %command_line,
                "task.finish"
            );
        } else {
            error!(
                event = "task.failed",
                slot = ctx.slot,
                exit_code = code,
                command = %command_line,
                "task.failed"
            );
        }
        Ok(code)
    }
}

impl TransferJob for TransferTask {
    fn execute<'a>(
        &'a self,
        ctx: RunContext<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<i32>> + Send + 'a>> {
        Box::pin(self.run_with(ctx))
    }
}

fn render_command(program: &Path, args: &[String]) -> String {
    let mut parts = vec![program.display().to_string()];
    parts.extend(args.iter().cloned());
    parts.join(" ")
}

/// `./`-prefixed path of `source` relative to `base_dir`, or `source` itself if it lies elsewhere.
fn relative_source(source: &Path, base_dir: &Path) -> PathBuf {
    match source.strip_prefix(base_dir) {
        Ok(rel) => Path::new(".").join(rel),
        Err(e) => {
            error!(
                event = "task.relative_path_failed",
                source = %source.display(),
                base_dir = %base_dir.display(),
                error = %e,
                "task.relative_path_failed"
            );
            source.to_path_buf()
        }
    }
}

#[cfg(unix)]
fn exit_code(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Streams `reader` line by line and reports every parsed progress value. Returns the number of
/// progress lines seen once the stream ends.
pub async fn read_progress<R, F>(reader: R, mut on_progress: F) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    F: FnMut(u64),
{
    let mut lines = FramedRead::new(reader, ProgressLineCodec::new());
    let mut seen = 0u64;
    while let Some(line) = lines.next().await {
        if let Some(bytes) = parse_progress_bytes(&line?) {
            seen += 1;
            on_progress(bytes);
        }
    }
    Ok(seen)
}

/// Reads the cumulative byte count at the start of a progress line such as
/// `"  1,234,567  10%  1.23MB/s  0:00:12"`.
///
/// The leading token may contain `,` separators and must be followed by whitespace or the end of
/// the line, so names like `2024.txt` in the program's file listing are not mistaken for progress.
pub fn parse_progress_bytes(line: &str) -> Option<u64> {
    let line = line.trim_start();
    let end = line
        .find(|c: char| !(c.is_ascii_digit() || c == ','))
        .unwrap_or(line.len());
    let (token, rest) = line.split_at(end);
    if !(rest.is_empty() || rest.starts_with(char::is_whitespace)) {
        return None;
    }
    let digits: String = token.chars().filter(|c| *c != ',').collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Splits output on either `\r` or `\n`, since progress updates rewrite the line with `\r`.
///
/// Lines longer than the limit are dropped whole rather than split into fragments.
#[derive(Debug, Clone)]
pub struct ProgressLineCodec {
    max_length: usize,
    discarding: bool,
}

impl ProgressLineCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            discarding: false,
        }
    }
}

impl Default for ProgressLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for ProgressLineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::io::Result<Option<String>> {
        loop {
            let Some(pos) = src.iter().position(|b| *b == b'\r' || *b == b'\n') else {
                if src.len() > self.max_length {
                    src.clear();
                    self.discarding = true;
                }
                return Ok(None);
            };

            let line = src.split_to(pos + 1);
            if self.discarding {
                self.discarding = false;
                continue;
            }
            return Ok(Some(String::from_utf8_lossy(&line[..pos]).into_owned()));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> std::io::Result<Option<String>> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() || self.discarding {
            src.clear();
            return Ok(None);
        }
        let line = src.split();
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }
}
