//! Pauses running transfer processes while the host CPU is saturated.
//!
//! Every spawned transfer process registers its PID in a [`ProcessRegistry`]. A [`CpuThrottle`]
//! samples host CPU usage on a fixed cadence; above `suspend_threshold` all registered processes
//! are stopped (`SIGSTOP`), and once usage falls below `resume_threshold` they are continued
//! (`SIGCONT`). The gap between the two thresholds keeps the throttle from flapping.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cpu::CpuSampler;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Suspend,
    Resume,
}

#[derive(Debug, Default)]
struct RegistryState {
    pids: HashMap<usize, u32>,
    suspended: bool,
}

/// PIDs of the transfer processes currently running, keyed by slot.
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<RegistryState>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a process. If the registry is currently suspended, the process is stopped right away.
    pub fn register(&self, slot: usize, pid: u32) {
        let mut st = self.lock();
        if st.suspended {
            signal_one(slot, pid, ProcessSignal::Suspend);
        }
        st.pids.insert(slot, pid);
    }

    pub fn unregister(&self, slot: usize) {
        self.lock().pids.remove(&slot);
    }

    pub fn len(&self) -> usize {
        self.lock().pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_suspended(&self) -> bool {
        self.lock().suspended
    }

    /// Sends `signal` to every registered process and returns how many accepted it.
    pub fn signal_all(&self, signal: ProcessSignal) -> usize {
        let mut st = self.lock();
        st.suspended = signal == ProcessSignal::Suspend;
        st.pids
            .iter()
            .filter(|(slot, pid)| signal_one(**slot, **pid, signal))
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn signal_one(slot: usize, pid: u32, signal: ProcessSignal) -> bool {
    match send_signal(pid, signal) {
        Ok(()) => true,
        Err(e) => {
            // ESRCH is expected when the process exited between wait() and unregister().
            debug!(
                event = "throttle.signal_failed",
                slot,
                pid,
                signal = ?signal,
                error = %e,
                "throttle.signal_failed"
            );
            false
        }
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: ProcessSignal) -> std::io::Result<()> {
    let sig = match signal {
        ProcessSignal::Suspend => libc::SIGSTOP,
        ProcessSignal::Resume => libc::SIGCONT,
    };
    let pid = libc::pid_t::try_from(pid).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range")
    })?;
    // SAFETY: kill(2) takes plain integers and touches no memory owned by this process.
    let rc = unsafe { libc::kill(pid, sig) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _signal: ProcessSignal) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process suspension requires a unix host",
    ))
}

pub fn validate_thresholds(suspend_threshold: f32, resume_threshold: f32) -> Result<()> {
    if !(suspend_threshold > 0.0 && suspend_threshold <= 100.0) {
        return Err(Error::InvalidConfig {
            message: format!("suspend threshold must be in (0, 100], got {suspend_threshold}"),
        });
    }
    if !(resume_threshold > 0.0 && resume_threshold < suspend_threshold) {
        return Err(Error::InvalidConfig {
            message: format!(
                "resume threshold must be in (0, {suspend_threshold}), got {resume_threshold}"
            ),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleConfig {
    pub suspend_threshold: f32,
    pub resume_threshold: f32,
    pub interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            suspend_threshold: 80.0,
            resume_threshold: 60.0,
            interval: Duration::from_secs(1),
        }
    }
}

impl ThrottleConfig {
    pub fn validate(&self) -> Result<()> {
        validate_thresholds(self.suspend_threshold, self.resume_threshold)?;
        if self.interval.is_zero() {
            return Err(Error::InvalidConfig {
                message: "throttle interval must be > 0".to_string(),
            });
        }
        Ok(())
    }
}

pub struct CpuThrottle {
    config: ThrottleConfig,
    registry: ProcessRegistry,
    sampler: Box<dyn CpuSampler>,
    suspended: bool,
}

impl CpuThrottle {
    pub fn new(
        config: ThrottleConfig,
        registry: ProcessRegistry,
        sampler: Box<dyn CpuSampler>,
    ) -> Self {
        Self {
            config,
            registry,
            sampler,
            suspended: false,
        }
    }

    /// Feeds one CPU sample through the hysteresis and returns the transition it causes, if any.
    pub fn observe(&mut self, cpu: f32) -> Option<ProcessSignal> {
        if !self.suspended && cpu > self.config.suspend_threshold {
            self.suspended = true;
            Some(ProcessSignal::Suspend)
        } else if self.suspended && cpu < self.config.resume_threshold {
            self.suspended = false;
            Some(ProcessSignal::Resume)
        } else {
            None
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    /// Samples until `cancel` fires. Suspended processes are always resumed before returning.
    pub async fn run(mut self, cancel: CancellationToken) {
        if cfg!(not(unix)) {
            warn!(event = "throttle.unsupported", "throttle.unsupported");
            return;
        }
        debug!(
            event = "throttle.start",
            suspend_threshold = self.config.suspend_threshold,
            resume_threshold = self.config.resume_threshold,
            "throttle.start"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.config.interval) => {}
            }

            let cpu = self.sampler.sample();
            if let Some(signal) = self.observe(cpu) {
                let processes = self.registry.signal_all(signal);
                let event = match signal {
                    ProcessSignal::Suspend => "throttle.suspend",
                    ProcessSignal::Resume => "throttle.resume",
                };
                info!(event, cpu, processes, "{event}");
            }
        }

        if self.suspended || self.registry.is_suspended() {
            let processes = self.registry.signal_all(ProcessSignal::Resume);
            info!(event = "throttle.resume", processes, "throttle.resume");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::FixedCpuSampler;

    fn throttle() -> CpuThrottle {
        CpuThrottle::new(
            ThrottleConfig::default(),
            ProcessRegistry::new(),
            Box::new(FixedCpuSampler(0.0)),
        )
    }

    #[test]
    fn hysteresis_between_thresholds() {
        let mut t = throttle();
        assert_eq!(t.observe(50.0), None);
        assert_eq!(t.observe(80.0), None);
        assert_eq!(t.observe(85.0), Some(ProcessSignal::Suspend));
        assert_eq!(t.observe(95.0), None);
        assert_eq!(t.observe(70.0), None);
        assert_eq!(t.observe(60.0), None);
        assert_eq!(t.observe(59.9), Some(ProcessSignal::Resume));
        assert_eq!(t.observe(10.0), None);
    }

    #[test]
    fn threshold_validation() {
        assert!(validate_thresholds(80.0, 60.0).is_ok());
        assert!(validate_thresholds(100.0, 99.0).is_ok());
        assert!(validate_thresholds(60.0, 80.0).is_err());
        assert!(validate_thresholds(80.0, 80.0).is_err());
        assert!(validate_thresholds(120.0, 60.0).is_err());
        assert!(validate_thresholds(80.0, 0.0).is_err());
        assert!(validate_thresholds(f32::NAN, 60.0).is_err());
    }

    #[test]
    fn registry_tracks_slots() {
        let reg = ProcessRegistry::new();
        assert!(reg.is_empty());
        reg.register(0, u32::MAX);
        reg.register(1, u32::MAX);
        assert_eq!(reg.len(), 2);
        reg.unregister(0);
        assert_eq!(reg.len(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn suspends_and_resumes_a_real_child() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        let reg = ProcessRegistry::new();
        reg.register(0, pid);
        assert_eq!(reg.signal_all(ProcessSignal::Suspend), 1);
        assert!(reg.is_suspended());
        assert_eq!(reg.signal_all(ProcessSignal::Resume), 1);
        assert!(!reg.is_suspended());

        child.kill().await.unwrap();
        reg.unregister(0);
    }

    /// Scheduler state letter from `/proc/<pid>/stat`: `T` while stopped.
    #[cfg(target_os = "linux")]
    fn process_state(pid: u32) -> char {
        let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).unwrap();
        let rest = &stat[stat.rfind(')').unwrap() + 1..];
        rest.trim_start().chars().next().unwrap()
    }

    #[cfg(target_os = "linux")]
    async fn wait_for_state(pid: u32, wanted: impl Fn(char) -> bool) -> char {
        for _ in 0..200 {
            let state = process_state(pid);
            if wanted(state) {
                return state;
            }
            sleep(Duration::from_millis(10)).await;
        }
        process_state(pid)
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn high_cpu_stops_children_until_cancelled() {
        let mut first = tokio::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .unwrap();
        let mut late = tokio::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .unwrap();
        let first_pid = first.id().unwrap();
        let late_pid = late.id().unwrap();

        let registry = ProcessRegistry::new();
        registry.register(0, first_pid);

        let cancel = CancellationToken::new();
        let handle = CpuThrottle::new(
            ThrottleConfig {
                interval: Duration::from_millis(10),
                ..ThrottleConfig::default()
            },
            registry.clone(),
            Box::new(FixedCpuSampler(99.0)),
        )
        .spawn(cancel.clone());

        assert_eq!(wait_for_state(first_pid, |s| s == 'T').await, 'T');
        assert!(registry.is_suspended());

        // Joining while suspended stops the newcomer without waiting for the next tick.
        registry.register(1, late_pid);
        assert_eq!(wait_for_state(late_pid, |s| s == 'T').await, 'T');

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("throttle did not stop")
            .unwrap();
        assert_ne!(wait_for_state(first_pid, |s| s != 'T').await, 'T');
        assert_ne!(wait_for_state(late_pid, |s| s != 'T').await, 'T');
        assert!(!registry.is_suspended());

        first.kill().await.unwrap();
        late.kill().await.unwrap();
    }

    #[tokio::test]
    async fn run_returns_promptly_on_cancel() {
        let cancel = CancellationToken::new();
        let handle = CpuThrottle::new(
            ThrottleConfig {
                interval: Duration::from_millis(10),
                ..ThrottleConfig::default()
            },
            ProcessRegistry::new(),
            Box::new(FixedCpuSampler(99.0)),
        )
        .spawn(cancel.clone());

        sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("throttle did not stop")
            .unwrap();
    }
}
