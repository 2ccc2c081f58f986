use std::fmt;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::process::ProcessStatistics;

pub type JobId = i32;
pub type TaskId = i32;

/// Identifier of a supervised process, derived from the task attempt it
/// belongs to. At most one live process exists per key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessKey {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub requeue_count: i32,
}

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.job_id, self.task_id, self.requeue_count)
    }
}

/// State of one task attempt on this node.
///
/// Mutated only under the executor write lock. `exited = true` is terminal
/// for the attempt; a requeue bumps the attempt id and reuses the slot.
#[derive(Debug)]
pub struct TaskInfo {
    pub job_id: JobId,
    pub task_id: TaskId,
    requeue_count: i32,
    attempt_id: u64,
    pub exited: bool,
    pub exit_code: Option<i32>,
    pub message: String,
    pub affinity: Vec<usize>,
    pub is_primary_task: bool,
    pub kernel_cpu_ms: u64,
    pub user_cpu_ms: u64,
    pub memory_kb: u64,
    pub process_ids: Vec<i32>,
    /// Cancellation handle of a pending grace-period timer, if any.
    pub grace_cancel: Option<CancellationToken>,
}

impl TaskInfo {
    pub(crate) fn new(job_id: JobId, task_id: TaskId, requeue_count: i32) -> Self {
        Self {
            job_id,
            task_id,
            requeue_count,
            attempt_id: requeue_count.max(0) as u64,
            exited: false,
            exit_code: None,
            message: String::new(),
            affinity: Vec::new(),
            is_primary_task: true,
            kernel_cpu_ms: 0,
            user_cpu_ms: 0,
            memory_kb: 0,
            process_ids: Vec::new(),
            grace_cancel: None,
        }
    }

    pub fn requeue_count(&self) -> i32 {
        self.requeue_count
    }

    pub fn attempt_id(&self) -> u64 {
        self.attempt_id
    }

    /// Record a requeue. The attempt id strictly increases whenever the
    /// requeue count advances; stale completions compare against it.
    pub(crate) fn advance_requeue(&mut self, requeue_count: i32) -> bool {
        if requeue_count > self.requeue_count {
            self.requeue_count = requeue_count;
            self.attempt_id += 1;
            self.exited = false;
            self.exit_code = None;
            self.message.clear();
            true
        } else {
            false
        }
    }

    pub fn process_key(&self) -> ProcessKey {
        ProcessKey {
            job_id: self.job_id,
            task_id: self.task_id,
            requeue_count: self.requeue_count,
        }
    }

    pub fn assign_stats(&mut self, stats: &ProcessStatistics) {
        self.kernel_cpu_ms = stats.kernel_cpu_ms;
        self.user_cpu_ms = stats.user_cpu_ms;
        self.memory_kb = stats.memory_kb;
        self.process_ids = stats.process_ids.clone();
    }

    /// Cancel a pending grace-period timer, if one was armed.
    pub fn cancel_grace_timer(&mut self) {
        if let Some(token) = self.grace_cancel.take() {
            token.cancel();
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "JobId": self.job_id,
            "TaskId": self.task_id,
            "TaskRequeueCount": self.requeue_count,
            "Exited": self.exited,
            "ExitCode": self.exit_code,
            "Message": self.message,
            "PrimaryTask": self.is_primary_task,
            "KernelProcessorTimeMs": self.kernel_cpu_ms,
            "UserProcessorTimeMs": self.user_cpu_ms,
            "WorkingSetKb": self.memory_kb,
            "ProcessIds": self.process_ids,
            "NumberOfProcesses": self.process_ids.len(),
        })
    }

    /// Body POSTed to the head service when this attempt completes.
    pub fn to_completion_json(&self) -> Value {
        json!({
            "JobId": self.job_id,
            "TaskId": self.task_id,
            "TaskRequeueCount": self.requeue_count,
            "ExitCode": self.exit_code,
            "Message": self.message,
            "KernelProcessorTimeMs": self.kernel_cpu_ms,
            "UserProcessorTimeMs": self.user_cpu_ms,
            "WorkingSetKb": self.memory_kb,
            "ProcessIds": self.process_ids,
        })
    }
}
