use std::collections::HashMap;

use serde_json::{json, Value};

use crate::registry::task::{JobId, TaskId, TaskInfo};

/// Tasks of one job known to this node.
#[derive(Debug, Default)]
pub struct JobInfo {
    pub tasks: HashMap<TaskId, TaskInfo>,
}

impl JobInfo {
    pub fn to_json(&self, job_id: JobId) -> Value {
        let tasks: Vec<Value> = self.tasks.values().map(TaskInfo::to_json).collect();
        json!({ "JobId": job_id, "Tasks": tasks })
    }
}

/// In-memory registry of jobs → tasks with a resync marker.
///
/// Not internally locked: every mutation happens under the executor write
/// lock, because invariants span table entries and the user-reference map.
#[derive(Debug, Default)]
pub struct JobTaskTable {
    jobs: HashMap<JobId, JobInfo>,
    need_resync: bool,
}

impl JobTaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up or create the task slot for `(job_id, task_id)`.
    ///
    /// Returns `is_new = true` only when a fresh attempt now owns the slot:
    /// either the `TaskInfo` was just inserted, or `requeue_count` advanced
    /// past the recorded one and bumped the attempt id.
    pub fn add_job_and_task(
        &mut self,
        job_id: JobId,
        task_id: TaskId,
        requeue_count: i32,
    ) -> (&mut TaskInfo, bool) {
        let job = self.jobs.entry(job_id).or_default();
        match job.tasks.entry(task_id) {
            std::collections::hash_map::Entry::Occupied(entry) => {
                let task = entry.into_mut();
                let advanced = task.advance_requeue(requeue_count);
                (task, advanced)
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                let task = entry.insert(TaskInfo::new(job_id, task_id, requeue_count));
                (task, true)
            }
        }
    }

    pub fn get_task(&self, job_id: JobId, task_id: TaskId) -> Option<&TaskInfo> {
        self.jobs.get(&job_id)?.tasks.get(&task_id)
    }

    pub fn get_task_mut(&mut self, job_id: JobId, task_id: TaskId) -> Option<&mut TaskInfo> {
        self.jobs.get_mut(&job_id)?.tasks.get_mut(&task_id)
    }

    /// Remove the task only while `attempt_id` still owns the slot, so a late
    /// completion cannot erase the attempt created by a requeue.
    pub fn remove_task(&mut self, job_id: JobId, task_id: TaskId, attempt_id: u64) -> bool {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return false;
        };
        match job.tasks.get(&task_id) {
            Some(task) if task.attempt_id() == attempt_id => {
                job.tasks.remove(&task_id);
                true
            }
            _ => false,
        }
    }

    pub fn remove_job(&mut self, job_id: JobId) -> Option<JobInfo> {
        self.jobs.remove(&job_id)
    }

    /// Ask the head service to re-push its view of running jobs with the
    /// next heartbeat.
    pub fn request_resync(&mut self) {
        self.need_resync = true;
    }

    pub fn need_resync(&self) -> bool {
        self.need_resync
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    /// Serialize the table for a heartbeat. Observing the resync flag in a
    /// snapshot clears it, so it is carried by exactly one heartbeat.
    pub fn snapshot(&mut self) -> Value {
        let jobs: Vec<Value> = self
            .jobs
            .iter()
            .map(|(job_id, job)| job.to_json(*job_id))
            .collect();
        let body = json!({ "Jobs": jobs, "NeedResync": self.need_resync });
        self.need_resync = false;
        body
    }
}
