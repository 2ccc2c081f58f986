use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AgentError, Result};
use crate::process::stats::ProcessStatistics;

/// Kernel ticks (USER_HZ) to milliseconds.
const TICK_MS: u64 = 10;

/// One per-task control group under the cpu,cpuacct and memory controllers.
///
/// The group is the unit of termination: its `tasks` file enumerates every
/// descendant of the task, and an empty file means the whole group exited.
#[derive(Debug)]
pub struct CgroupDriver {
    cpu_path: PathBuf,
    memory_path: PathBuf,
}

impl CgroupDriver {
    /// Create `nmgroup`-style directories for `name` under both controllers.
    pub fn create(root: &Path, name: &str) -> Result<Self> {
        let cpu_path = root.join("cpu,cpuacct").join(name);
        let memory_path = root.join("memory").join(name);
        fs::create_dir_all(&cpu_path)
            .and_then(|_| fs::create_dir_all(&memory_path))
            .map_err(|e| AgentError::Cgroup(format!("create {}: {}", name, e)))?;
        Ok(Self {
            cpu_path,
            memory_path,
        })
    }

    /// Enroll a pid; its future children stay in the group.
    pub fn add_pid(&self, pid: i32) -> Result<()> {
        for dir in [&self.cpu_path, &self.memory_path] {
            fs::write(dir.join("tasks"), format!("{}\n", pid))
                .map_err(|e| AgentError::Cgroup(format!("enroll pid {}: {}", pid, e)))?;
        }
        Ok(())
    }

    /// Pids currently in the group. Missing group reads as empty.
    pub fn pids(&self) -> Vec<i32> {
        fs::read_to_string(self.cpu_path.join("tasks"))
            .map(|body| {
                body.lines()
                    .filter_map(|line| line.trim().parse().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn statistics(&self) -> ProcessStatistics {
        let (user_cpu_ms, kernel_cpu_ms) = self.cpu_times();
        let process_ids = self.pids();
        ProcessStatistics {
            kernel_cpu_ms,
            user_cpu_ms,
            memory_kb: self.memory_high_water_kb(),
            terminated: process_ids.is_empty(),
            process_ids,
        }
    }

    fn cpu_times(&self) -> (u64, u64) {
        let mut user = 0;
        let mut system = 0;
        if let Ok(body) = fs::read_to_string(self.cpu_path.join("cpuacct.stat")) {
            for line in body.lines() {
                let mut parts = line.split_whitespace();
                match (parts.next(), parts.next().and_then(|v| v.parse::<u64>().ok())) {
                    (Some("user"), Some(ticks)) => user = ticks * TICK_MS,
                    (Some("system"), Some(ticks)) => system = ticks * TICK_MS,
                    _ => {}
                }
            }
        }
        (user, system)
    }

    fn memory_high_water_kb(&self) -> u64 {
        fs::read_to_string(self.memory_path.join("memory.max_usage_in_bytes"))
            .ok()
            .and_then(|body| body.trim().parse::<u64>().ok())
            .map(|bytes| bytes / 1024)
            .unwrap_or(0)
    }

    /// Unlink the group directories. Fails silently while pids remain; callers
    /// kill the group first.
    pub fn remove(&self) {
        for dir in [&self.cpu_path, &self.memory_path] {
            if let Err(e) = fs::remove_dir(dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::debug!(path = %dir.display(), error = %e, "Cgroup removal deferred");
                }
            }
        }
    }
}
