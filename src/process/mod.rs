//! Per-task process supervision.
//!
//! A [`Process`] runs one task command inside a per-task control group,
//! redirects stdio to the configured files, and drives an exit callback
//! exactly once when the group is known to have ended. Termination is a
//! two-step protocol: a graceful SIGTERM to the leader, or a forced SIGKILL
//! sweep over every pid in the group followed by cgroup removal.

pub mod cgroup;
pub mod stats;

pub use cgroup::CgroupDriver;
pub use stats::ProcessStatistics;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use nix::sys::signal::Signal;

use crate::error::{AgentError, Result};

/// Bound on `peek_output` reads.
const PEEK_OUTPUT_MAX: u64 = 4096;

/// Invoked exactly once per process with the final exit code, a diagnostic
/// message and the last statistics snapshot of the group.
pub type ExitCallback =
    Box<dyn FnOnce(i32, String, ProcessStatistics) -> BoxFuture<'static, ()> + Send>;

/// Construction inputs for one supervised command.
#[derive(Debug)]
pub struct ProcessSpec {
    pub job_id: i32,
    pub task_id: i32,
    pub requeue_count: i32,
    /// Label embedded in the cgroup name, e.g. `Task`.
    pub label: String,
    pub command_line: String,
    pub stdout_file: PathBuf,
    pub stderr_file: PathBuf,
    pub stdin_file: Option<PathBuf>,
    pub work_directory: Option<PathBuf>,
    /// uid/gid to run as; `None` keeps the agent's identity.
    pub run_as: Option<(u32, u32)>,
    pub cgroup_required: bool,
    pub affinity: Vec<usize>,
    pub environment: HashMap<String, String>,
}

struct ProcessInner {
    leader: Option<i32>,
    leader_exited: bool,
    requested_exit_code: Option<i32>,
    cgroup: Option<Arc<CgroupDriver>>,
    callback: Option<ExitCallback>,
}

/// Supervisor for one task command and its descendants.
pub struct Process {
    spec: ProcessSpec,
    cgroup_root: PathBuf,
    inner: Mutex<ProcessInner>,
}

impl Process {
    pub fn new(spec: ProcessSpec, cgroup_root: PathBuf, callback: ExitCallback) -> Self {
        Self {
            spec,
            cgroup_root,
            inner: Mutex::new(ProcessInner {
                leader: None,
                leader_exited: false,
                requested_exit_code: None,
                cgroup: None,
                callback: Some(callback),
            }),
        }
    }

    fn group_name(&self) -> String {
        format!(
            "nmgroup_{}_{}_{}",
            self.spec.label, self.spec.task_id, self.spec.requeue_count
        )
    }

    /// Launch the command and spawn the waiter that fires the exit callback.
    ///
    /// Resolves as soon as the leader pid is known; the callback fires later,
    /// when the group has ended.
    pub async fn start(self: &Arc<Self>) -> Result<i32> {
        let cgroup = if self.spec.cgroup_required {
            match CgroupDriver::create(&self.cgroup_root, &self.group_name()) {
                Ok(driver) => Some(Arc::new(driver)),
                Err(e) => {
                    tracing::warn!(
                        job_id = self.spec.job_id,
                        task_id = self.spec.task_id,
                        error = %e,
                        "Cgroup unavailable, tracking the leader pid only"
                    );
                    None
                }
            }
        } else {
            None
        };

        let mut command = self.build_command()?;
        let mut child = command
            .spawn()
            .map_err(|e| AgentError::ProcessStart(e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| AgentError::ProcessStart("leader exited before pid was known".into()))?
            as i32;

        if let Some(driver) = &cgroup {
            if let Err(e) = driver.add_pid(pid) {
                tracing::warn!(
                    job_id = self.spec.job_id,
                    task_id = self.spec.task_id,
                    pid,
                    error = %e,
                    "Failed to enroll leader in cgroup"
                );
            }
        }
        apply_affinity(pid, &self.spec.affinity);

        {
            let mut inner = self.inner.lock().expect("process state poisoned");
            inner.leader = Some(pid);
            inner.cgroup = cgroup;
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.wait_for_exit(child, pid).await;
        });

        Ok(pid)
    }

    fn build_command(&self) -> Result<tokio::process::Command> {
        let stdout = open_log_file(&self.spec.stdout_file)?;
        let stderr = open_log_file(&self.spec.stderr_file)?;
        let stdin = match &self.spec.stdin_file {
            Some(path) => Stdio::from(File::open(path)?),
            None => Stdio::null(),
        };

        let mut command = tokio::process::Command::new("/bin/sh");
        command
            .arg("-c")
            .arg(&self.spec.command_line)
            .envs(&self.spec.environment)
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .stdin(stdin);
        if let Some(dir) = &self.spec.work_directory {
            command.current_dir(dir);
        }
        if let Some((uid, gid)) = self.spec.run_as {
            command.uid(uid);
            command.gid(gid);
        }
        Ok(command)
    }

    async fn wait_for_exit(self: Arc<Self>, mut child: tokio::process::Child, pid: i32) {
        let (natural_code, message) = match child.wait().await {
            Ok(status) => (exit_code_of(status), String::new()),
            Err(e) => (-1, format!("wait for leader failed: {}", e)),
        };

        let (callback, cgroup, requested) = {
            let mut inner = self.inner.lock().expect("process state poisoned");
            inner.leader_exited = true;
            (
                inner.callback.take(),
                inner.cgroup.clone(),
                inner.requested_exit_code,
            )
        };

        let stats = match &cgroup {
            Some(driver) => {
                // The leader is gone; sweep the stragglers and unlink the
                // group before reporting completion.
                let mut stats = driver.statistics();
                for straggler in &stats.process_ids {
                    send_signal(*straggler, Signal::SIGKILL);
                }
                stats.process_ids = driver.pids();
                stats.terminated = stats.process_ids.is_empty();
                driver.remove();
                stats
            }
            None => ProcessStatistics {
                terminated: true,
                ..Default::default()
            },
        };

        let exit_code = requested.unwrap_or(natural_code);
        tracing::debug!(
            job_id = self.spec.job_id,
            task_id = self.spec.task_id,
            pid,
            exit_code,
            "Task process group ended"
        );

        if let Some(callback) = callback {
            callback(exit_code, message, stats).await;
        }
    }

    /// Request termination. Forced kills every pid in the group and unlinks
    /// the cgroup; graceful sends SIGTERM to the leader only. Idempotent.
    pub fn kill(&self, exit_code: i32, forced: bool) {
        let (leader, cgroup, already_exited) = {
            let mut inner = self.inner.lock().expect("process state poisoned");
            if !inner.leader_exited {
                inner.requested_exit_code = Some(exit_code);
            }
            (inner.leader, inner.cgroup.clone(), inner.leader_exited)
        };

        if already_exited {
            return;
        }

        if forced {
            match &cgroup {
                Some(driver) => {
                    for pid in driver.pids() {
                        send_signal(pid, Signal::SIGKILL);
                    }
                    driver.remove();
                }
                None => {
                    if let Some(pid) = leader {
                        send_signal(pid, Signal::SIGKILL);
                    }
                }
            }
        } else if let Some(pid) = leader {
            send_signal(pid, Signal::SIGTERM);
        }
    }

    /// Snapshot of the group's resource usage. Cheap enough for the short
    /// polling loop during termination.
    pub fn statistics(&self) -> ProcessStatistics {
        let inner = self.inner.lock().expect("process state poisoned");
        match &inner.cgroup {
            Some(driver) => driver.statistics(),
            None => {
                let exited = inner.leader_exited || inner.leader.is_none();
                ProcessStatistics {
                    process_ids: if exited {
                        Vec::new()
                    } else {
                        inner.leader.into_iter().collect()
                    },
                    terminated: exited,
                    ..Default::default()
                }
            }
        }
    }

    /// Current tail of the task's stdout file, bounded to 4 KiB.
    pub fn peek_output(&self) -> Result<String> {
        let mut file = File::open(&self.spec.stdout_file)?;
        let len = file.metadata()?.len();
        if len > PEEK_OUTPUT_MAX {
            file.seek(SeekFrom::Start(len - PEEK_OUTPUT_MAX))?;
        }
        let mut buffer = Vec::with_capacity(PEEK_OUTPUT_MAX as usize);
        file.read_to_end(&mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| status.signal().map(|s| 128 + s).unwrap_or(-1))
}

fn apply_affinity(pid: i32, cpus: &[usize]) {
    if cpus.is_empty() {
        return;
    }
    let mut set = nix::sched::CpuSet::new();
    for &cpu in cpus {
        if let Err(e) = set.set(cpu) {
            tracing::warn!(pid, cpu, error = %e, "Invalid CPU index in affinity");
            return;
        }
    }
    if let Err(e) = nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(pid), &set) {
        tracing::warn!(pid, error = %e, "Failed to apply CPU affinity");
    }
}

fn send_signal(pid: i32, signal: Signal) {
    match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), signal) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => {
            tracing::warn!(pid, signal = %signal, error = %e, "Failed to signal process");
        }
    }
}
