use sysinfo::System;

/// Source of host-wide CPU utilization, in percent (0-100).
pub trait CpuSampler: Send {
    fn sample(&mut self) -> f32;
}

/// Host CPU usage since the previous call.
///
/// The first sample after construction reflects the interval since `new`, which can read as 0.
pub struct SystemCpuSampler {
    system: System,
}

impl SystemCpuSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self { system }
    }
}

impl Default for SystemCpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuSampler for SystemCpuSampler {
    fn sample(&mut self) -> f32 {
        self.system.refresh_cpu_usage();
        self.system.global_cpu_usage()
    }
}

/// A sampler that always reports the same value.
#[derive(Debug, Clone, Copy)]
pub struct FixedCpuSampler(pub f32);

impl CpuSampler for FixedCpuSampler {
    fn sample(&mut self) -> f32 {
        self.0
    }
}
