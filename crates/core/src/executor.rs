use std::sync::Arc;

use tracing::{debug, error};

use crate::Error;
use crate::progress::{ProgressSink, TaskProgress};
use crate::task::{RunContext, TransferJob};
use crate::throttle::ProcessRegistry;

/// Recorded when the transfer program could not be started (shell "command not found").
pub const SPAWN_FAILED_EXIT_CODE: i32 = 127;
/// Recorded when a job failed without an exit status, e.g. it panicked.
pub const ABNORMAL_EXIT_CODE: i32 = -1;

/// Runs every job at once, one tokio task each, and collects exit codes in input order.
///
/// Failures are recorded, never retried, and never cancel sibling jobs.
pub struct ParallelExecutor<T> {
    tasks: Vec<T>,
    progress: Option<Arc<dyn ProgressSink>>,
    processes: Option<ProcessRegistry>,
}

impl<T: TransferJob + 'static> ParallelExecutor<T> {
    pub fn new(tasks: Vec<T>) -> Self {
        Self {
            tasks,
            progress: None,
            processes: None,
        }
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn with_process_registry(mut self, processes: ProcessRegistry) -> Self {
        self.processes = Some(processes);
        self
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub async fn run_all(self) -> Vec<i32> {
        let mut handles = Vec::with_capacity(self.tasks.len());

        for (slot, task) in self.tasks.into_iter().enumerate() {
            let sink = self.progress.clone();
            let processes = self.processes.clone();
            handles.push(tokio::spawn(async move {
                let report = move |bytes_transferred: u64| {
                    if let Some(sink) = &sink {
                        sink.on_progress(TaskProgress {
                            slot,
                            bytes_transferred,
                        });
                    }
                };
                let ctx = RunContext {
                    slot,
                    on_progress: Some(&report),
                    processes: processes.as_ref(),
                };
                match task.execute(ctx).await {
                    Ok(code) => code,
                    Err(e) => {
                        error!(event = "task.error", slot, error = %e, "task.error");
                        match e {
                            Error::Spawn { .. } => SPAWN_FAILED_EXIT_CODE,
                            _ => ABNORMAL_EXIT_CODE,
                        }
                    }
                }
            }));
        }
        debug!(event = "executor.started", tasks = handles.len(), "executor.started");

        let mut results = Vec::with_capacity(handles.len());
        for (slot, handle) in handles.into_iter().enumerate() {
            let code = match handle.await {
                Ok(code) => code,
                Err(e) => {
                    error!(event = "task.aborted", slot, error = %e, "task.aborted");
                    ABNORMAL_EXIT_CODE
                }
            };
            results.push(code);
        }
        results
    }
}
