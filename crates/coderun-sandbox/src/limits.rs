//! Resource limits for a single run

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Resource limits enforced on a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in bytes (default: 256MB)
    pub memory_bytes: u64,
    /// CPU quota (percentage of one core, default: 50%)
    pub cpu_percent: u32,
    /// Wall-clock budget for the running program
    pub timeout: Duration,
    /// Wall-clock budget for the build step
    pub compile_timeout: Duration,
    /// Output bytes forwarded before the stream is truncated
    pub max_output_bytes: usize,
    /// Maximum number of processes inside the sandbox
    pub max_pids: u32,
    /// Disable swap
    pub no_swap: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_bytes: 256 * 1024 * 1024,
            cpu_percent: 50,
            timeout: Duration::from_secs(30),
            compile_timeout: Duration::from_secs(20),
            max_output_bytes: 256 * 1024,
            max_pids: 64,
            no_swap: true,
        }
    }
}

impl ResourceLimits {
    /// Set the memory limit in megabytes
    #[must_use]
    pub fn with_memory_mb(mut self, mb: u64) -> Self {
        self.memory_bytes = mb * 1024 * 1024;
        self
    }

    /// Set the CPU quota (clamped to 100%)
    #[must_use]
    pub fn with_cpu_percent(mut self, percent: u32) -> Self {
        self.cpu_percent = percent.clamp(1, 100);
        self
    }

    /// Set the run timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the build step timeout
    #[must_use]
    pub fn with_compile_timeout(mut self, timeout: Duration) -> Self {
        self.compile_timeout = timeout;
        self
    }

    /// Set the output cap
    #[must_use]
    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    /// Docker `run` resource arguments
    #[must_use]
    pub fn to_docker_args(&self) -> Vec<String> {
        let mut args = vec![format!("--memory={}b", self.memory_bytes)];

        if self.no_swap {
            args.push(format!("--memory-swap={}b", self.memory_bytes));
        }

        // quota in microseconds per 100ms period
        let cpu_quota = u64::from(self.cpu_percent) * 1000;
        args.push(format!("--cpu-quota={}", cpu_quota));
        args.push("--cpu-period=100000".to_string());
        args.push(format!("--pids-limit={}", self.max_pids));

        args
    }

    /// Apple Container `run` resource arguments
    #[must_use]
    pub fn to_apple_container_args(&self) -> Vec<String> {
        let memory_mb = (self.memory_bytes / (1024 * 1024)).max(64);
        let cpu_cores = (self.cpu_percent as f32 / 100.0).max(0.1);
        vec![
            format!("--memory={}m", memory_mb),
            format!("--cpus={:.1}", cpu_cores),
        ]
    }
}
