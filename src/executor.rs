//! Remote-call orchestrator.
//!
//! [`RemoteExecutor`] is the public surface of the agent core: it maps user
//! accounts, installs SSH material, starts and supervises task processes,
//! drives graceful termination with grace-period timers, and owns the
//! lifecycle of the periodic reporters. All registry and process-table
//! mutations happen under its single write lock, because the invariants span
//! the job table, the process table and the user bookkeeping.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{AgentConfig, EndpointStore};
use crate::error::{AgentError, Result};
use crate::hosts::HostsManager;
use crate::monitor::{MetricCountersConfig, NodeMonitor};
use crate::naming::{resolve_uri_ref, ServiceResolver};
use crate::process::{ExitCallback, Process, ProcessSpec, ProcessStatistics};
use crate::registry::{JobId, JobTaskTable, ProcessKey, TaskId};
use crate::reporter::{HttpTransport, Reporter, ReportSource, UdpTransport};
use crate::system::{SystemOps, USER_ALREADY_EXISTS};

/// Exit code assigned to tasks terminated by EndJob.
pub const END_JOB_EXIT_CODE: i32 = -3;
/// Exit code assigned to tasks terminated by EndTask.
pub const END_TASK_EXIT_CODE: i32 = -2;

const WINDOWS_SYSTEM_USER: &str = "NT AUTHORITY\\SYSTEM";
const REGISTER_HOLD_SECS: u64 = 3;
const PEEK_OUTPUT_ERROR: &str = "Failed to get the task output.";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ProcessStartInfo {
    pub command_line: String,
    pub work_directory: String,
    pub std_out_file: String,
    pub std_err_file: String,
    pub std_in_file: String,
    pub environment_variables: HashMap<String, String>,
    pub affinity: Vec<usize>,
    pub task_requeue_count: i32,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StartJobAndTaskArgs {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub user_name: String,
    pub password: String,
    pub private_key: String,
    pub public_key: String,
    pub start_info: ProcessStartInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct StartTaskArgs {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub start_info: ProcessStartInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EndJobArgs {
    pub job_id: JobId,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EndTaskArgs {
    pub job_id: JobId,
    pub task_id: TaskId,
    pub task_cancel_grace_period_seconds: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PeekTaskOutputArgs {
    pub job_id: JobId,
    pub task_id: TaskId,
}

/// SSH/user bookkeeping for one job. Cleanup undoes exactly the steps that
/// were recorded as installed.
#[derive(Debug, Clone)]
struct JobUserRecord {
    user_name: String,
    #[allow(dead_code)]
    pre_existing: bool,
    private_key_added: bool,
    public_key_added: bool,
    auth_key_added: bool,
    public_key: String,
}

/// Everything guarded by the executor write lock.
#[derive(Default)]
struct ExecutorState {
    table: JobTaskTable,
    processes: HashMap<ProcessKey, Arc<Process>>,
    job_users: HashMap<JobId, JobUserRecord>,
    user_jobs: HashMap<String, HashSet<JobId>>,
}

#[derive(Default)]
struct ReporterSet {
    register: Option<Reporter>,
    heartbeat: Option<Reporter>,
    metric: Option<Reporter>,
    hosts: Option<HostsManager>,
}

pub struct RemoteExecutor {
    config: Arc<AgentConfig>,
    endpoints: Arc<EndpointStore>,
    resolver: Arc<ServiceResolver>,
    system: Arc<dyn SystemOps>,
    monitor: Arc<NodeMonitor>,
    client: reqwest::Client,
    cancel: CancellationToken,
    state: RwLock<ExecutorState>,
    reporters: tokio::sync::Mutex<ReporterSet>,
    weak_self: Weak<RemoteExecutor>,
}

impl RemoteExecutor {
    pub fn new(
        config: Arc<AgentConfig>,
        endpoints: Arc<EndpointStore>,
        resolver: Arc<ServiceResolver>,
        system: Arc<dyn SystemOps>,
        monitor: Arc<NodeMonitor>,
        client: reqwest::Client,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            endpoints,
            resolver,
            system,
            monitor,
            client,
            cancel,
            state: RwLock::new(ExecutorState::default()),
            reporters: tokio::sync::Mutex::new(ReporterSet::default()),
            weak_self: weak.clone(),
        })
    }

    /// Bring up the periodic reporters and the hosts manager.
    pub async fn start(&self) {
        self.start_register().await;
        self.start_heartbeat().await;
        self.start_metric().await;
        self.start_hosts_manager().await;
    }

    /// Cancel everything and join the reporter workers.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut reporters = self.reporters.lock().await;
        for reporter in [
            reporters.register.take(),
            reporters.heartbeat.take(),
            reporters.metric.take(),
        ]
        .into_iter()
        .flatten()
        {
            reporter.stop().await;
        }
        if let Some(hosts) = reporters.hosts.take() {
            hosts.stop().await;
        }
    }

    pub async fn start_job_and_task(
        &self,
        args: StartJobAndTaskArgs,
        callback_uri: String,
    ) -> Result<Value> {
        {
            let mut state = self.state.write().await;

            let env = &args.start_info.environment_variables;
            let is_admin = env_flag(env, "CCP_ISADMIN");
            let map_admin_user = env_flag(env, "CCP_MAP_ADMIN_USER");
            let map_admin_to_root = is_admin && !map_admin_user;
            let map_admin_to_user = is_admin && map_admin_user;
            let is_windows_system = args.user_name.eq_ignore_ascii_case(WINDOWS_SYSTEM_USER);

            // Root runs the task when the head sent no user, when an admin is
            // not mapped to a real account, and for the Windows SYSTEM account.
            let (user_name, pre_existing) =
                if args.user_name.is_empty() || map_admin_to_root || is_windows_system {
                    ("root".to_string(), true)
                } else {
                    let preserve_domain = env_flag(env, "CCP_PRESERVE_DOMAIN");
                    let mut name = if preserve_domain {
                        args.user_name.clone()
                    } else {
                        strip_domain(&args.user_name).to_string()
                    };
                    if name == "root" {
                        name = "hpc_faked_root".to_string();
                    }
                    let code = self
                        .system
                        .create_user(&name, &args.password, is_admin)
                        .await?;
                    tracing::debug!(
                        job_id = args.job_id,
                        task_id = args.task_id,
                        user = %name,
                        code,
                        "Create user returned"
                    );
                    if code != 0 && code != USER_ALREADY_EXISTS {
                        return Err(AgentError::UserSetup { user: name, code });
                    }
                    (name, code == USER_ALREADY_EXISTS)
                };

            let mut private_key_added = false;
            let mut public_key_added = false;
            let mut auth_key_added = false;
            let mut public_key = args.public_key.clone();

            // Unmapped admins keep no SSH material; everyone else gets the
            // key pair plus an authorized_keys entry for mutual node access.
            if !is_admin || map_admin_to_user || is_windows_system {
                match self
                    .system
                    .add_ssh_key(&user_name, &args.private_key, "id_rsa", 0o600)
                    .await
                {
                    Ok(private_key_file) => {
                        private_key_added = true;
                        if public_key.is_empty() {
                            match self.system.derive_public_key(&private_key_file).await {
                                Ok(derived) => public_key = derived,
                                Err(e) => {
                                    tracing::error!(
                                        job_id = args.job_id,
                                        task_id = args.task_id,
                                        error = %e,
                                        "Deriving public key failed"
                                    );
                                }
                            }
                        }
                        if !public_key.is_empty() {
                            public_key_added = match self
                                .system
                                .add_ssh_key(&user_name, &public_key, "id_rsa.pub", 0o644)
                                .await
                            {
                                Ok(_) => true,
                                Err(e) => {
                                    tracing::warn!(user = %user_name, error = %e, "Installing public key failed");
                                    false
                                }
                            };
                            auth_key_added = public_key_added
                                && match self
                                    .system
                                    .add_authorized_key(&user_name, &public_key)
                                    .await
                                {
                                    Ok(()) => true,
                                    Err(e) => {
                                        tracing::warn!(user = %user_name, error = %e, "Installing authorized key failed");
                                        false
                                    }
                                };
                        }
                    }
                    Err(e) => {
                        tracing::warn!(user = %user_name, error = %e, "Installing private key failed");
                    }
                }
                tracing::debug!(
                    user = %user_name,
                    private_key_added,
                    public_key_added,
                    auth_key_added,
                    "SSH material result"
                );
            }

            state
                .job_users
                .entry(args.job_id)
                .or_insert_with(|| JobUserRecord {
                    user_name: user_name.clone(),
                    pre_existing,
                    private_key_added,
                    public_key_added,
                    auth_key_added,
                    public_key,
                });
            state
                .user_jobs
                .entry(user_name)
                .or_default()
                .insert(args.job_id);
        }

        self.start_task(
            StartTaskArgs {
                job_id: args.job_id,
                task_id: args.task_id,
                start_info: args.start_info,
            },
            callback_uri,
        )
        .await
    }

    pub async fn start_task(&self, args: StartTaskArgs, callback_uri: String) -> Result<Value> {
        let mut state_guard = self.state.write().await;
        let state = &mut *state_guard;

        let (process_key, attempt_id, requeue_count, is_new) = {
            let (task, is_new) = state.table.add_job_and_task(
                args.job_id,
                args.task_id,
                args.start_info.task_requeue_count,
            );
            task.affinity = args.start_info.affinity.clone();
            (task.process_key(), task.attempt_id(), task.requeue_count(), is_new)
        };

        let user_name = match state.job_users.get(&args.job_id) {
            Some(record) => record.user_name.clone(),
            None => {
                state.table.remove_job(args.job_id);
                return Err(AgentError::JobNotStarted(args.job_id));
            }
        };

        if args.start_info.command_line.is_empty() {
            let env = &args.start_info.environment_variables;
            let docker_image = env.get("CCP_DOCKER_IMAGE").cloned().unwrap_or_default();
            tracing::info!(
                job_id = args.job_id,
                task_id = args.task_id,
                requeue_count,
                "MPI non-master task found, skipping process creation"
            );
            if !docker_image.is_empty() {
                if let Some(task) = state.table.get_task_mut(args.job_id, args.task_id) {
                    task.is_primary_task = false;
                }
                let nvidia = env.get("CCP_DOCKER_NVIDIA").cloned().unwrap_or_default();
                let script_args = vec![
                    args.task_id.to_string(),
                    user_name.clone(),
                    docker_image,
                    nvidia,
                ];
                match self
                    .system
                    .run_script("StartMpiContainer.sh", &script_args)
                    .await
                {
                    Ok((0, _)) => {
                        tracing::info!(
                            job_id = args.job_id,
                            task_id = args.task_id,
                            "Started MPI container"
                        );
                    }
                    Ok((code, output)) => {
                        tracing::error!(
                            job_id = args.job_id,
                            task_id = args.task_id,
                            code,
                            output = %output,
                            "Starting MPI container failed"
                        );
                    }
                    Err(e) => {
                        tracing::error!(
                            job_id = args.job_id,
                            task_id = args.task_id,
                            error = %e,
                            "Starting MPI container failed"
                        );
                    }
                }
            }
        } else if is_new && !state.processes.contains_key(&process_key) {
            let run_as = match self.system.lookup_user(&user_name) {
                Ok(run_as) => run_as,
                Err(e) => {
                    state
                        .table
                        .remove_task(args.job_id, args.task_id, attempt_id);
                    return Err(e);
                }
            };

            let spec = ProcessSpec {
                job_id: args.job_id,
                task_id: args.task_id,
                requeue_count,
                label: "Task".to_string(),
                command_line: args.start_info.command_line.clone(),
                stdout_file: stdio_path(&args.start_info.std_out_file, args.job_id, args.task_id, "out"),
                stderr_file: stdio_path(&args.start_info.std_err_file, args.job_id, args.task_id, "err"),
                stdin_file: non_empty(&args.start_info.std_in_file).map(PathBuf::from),
                work_directory: non_empty(&args.start_info.work_directory).map(PathBuf::from),
                run_as,
                cgroup_required: self.config.use_cgroups,
                affinity: args.start_info.affinity.clone(),
                environment: args.start_info.environment_variables.clone(),
            };
            let callback = self.exit_callback(
                args.job_id,
                args.task_id,
                requeue_count,
                attempt_id,
                process_key,
                callback_uri,
            );
            let process = Arc::new(Process::new(
                spec,
                self.config.cgroup_root.clone(),
                callback,
            ));
            state.processes.insert(process_key, Arc::clone(&process));
            tracing::debug!(
                job_id = args.job_id,
                task_id = args.task_id,
                %process_key,
                process_count = state.processes.len(),
                "Starting task process"
            );

            match process.start().await {
                Ok(pid) => {
                    tracing::debug!(
                        job_id = args.job_id,
                        task_id = args.task_id,
                        pid,
                        "Task process started"
                    );
                }
                Err(e) => {
                    state.processes.remove(&process_key);
                    state
                        .table
                        .remove_task(args.job_id, args.task_id, attempt_id);
                    return Err(e);
                }
            }
        } else {
            tracing::warn!(
                job_id = args.job_id,
                task_id = args.task_id,
                requeue_count,
                "The task has started already"
            );
        }

        Ok(Value::Null)
    }

    pub async fn end_job(&self, args: EndJobArgs) -> Result<Value> {
        let mut state_guard = self.state.write().await;
        let state = &mut *state_guard;
        tracing::info!(job_id = args.job_id, "EndJob starting");

        let mut body = Value::Null;
        if let Some(mut job) = state.table.remove_job(args.job_id) {
            for (task_id, task) in job.tasks.iter_mut() {
                tracing::debug!(job_id = args.job_id, task_id, "EndJob terminating task");
                let stats = self
                    .terminate_task(
                        state,
                        args.job_id,
                        *task_id,
                        task.requeue_count(),
                        task.process_key(),
                        END_JOB_EXIT_CODE,
                        true,
                        !task.is_primary_task,
                    )
                    .await;
                if let Some(stats) = stats {
                    task.exited = stats.is_terminated();
                    task.exit_code = Some(END_JOB_EXIT_CODE);
                    task.assign_stats(&stats);
                    task.cancel_grace_timer();
                }
            }
            body = job.to_json(args.job_id);
            tracing::info!(job_id = args.job_id, "EndJob ended");
        } else {
            tracing::warn!(job_id = args.job_id, "EndJob: job is already finished");
        }

        if let Some(record) = state.job_users.remove(&args.job_id) {
            tracing::info!(job_id = args.job_id, user = %record.user_name, "EndJob cleaning up job user");
            let cleanup = match state.user_jobs.get_mut(&record.user_name) {
                None => true,
                Some(jobs) => {
                    jobs.remove(&args.job_id);
                    tracing::info!(
                        job_id = args.job_id,
                        user = %record.user_name,
                        remaining = jobs.len(),
                        "Jobs still associated with the user"
                    );
                    if jobs.is_empty() {
                        state.user_jobs.remove(&record.user_name);
                        true
                    } else {
                        false
                    }
                }
            };

            // Accounts are retained across jobs; only SSH material recorded
            // as installed by this job is undone, once no job uses the user.
            if cleanup {
                if record.private_key_added {
                    self.system.remove_ssh_key(&record.user_name, "id_rsa").await;
                }
                if record.public_key_added {
                    self.system
                        .remove_ssh_key(&record.user_name, "id_rsa.pub")
                        .await;
                }
                if record.auth_key_added {
                    self.system
                        .remove_authorized_key(&record.user_name, &record.public_key)
                        .await;
                }
            }
        }

        Ok(body)
    }

    pub async fn end_task(&self, args: EndTaskArgs, callback_uri: String) -> Result<Value> {
        let mut state_guard = self.state.write().await;
        let state = &mut *state_guard;
        tracing::info!(job_id = args.job_id, task_id = args.task_id, "EndTask starting");

        let Some((requeue_count, attempt_id, process_key, is_primary)) = state
            .table
            .get_task(args.job_id, args.task_id)
            .map(|task| {
                (
                    task.requeue_count(),
                    task.attempt_id(),
                    task.process_key(),
                    task.is_primary_task,
                )
            })
        else {
            tracing::warn!(
                job_id = args.job_id,
                task_id = args.task_id,
                "EndTask: task is already finished"
            );
            return Ok(Value::Null);
        };

        let forced = args.task_cancel_grace_period_seconds == 0;
        let stats = self
            .terminate_task(
                state,
                args.job_id,
                args.task_id,
                requeue_count,
                process_key,
                END_TASK_EXIT_CODE,
                forced,
                !is_primary,
            )
            .await;

        let finished = stats.as_ref().map(|s| s.is_terminated()).unwrap_or(true);
        let Some(task) = state.table.get_task_mut(args.job_id, args.task_id) else {
            return Ok(Value::Null);
        };
        task.exit_code = Some(END_TASK_EXIT_CODE);

        let body;
        if finished {
            task.exited = true;
            task.cancel_grace_timer();
            if let Some(stats) = &stats {
                task.assign_stats(stats);
            }
            body = task.to_json();
            state
                .table
                .remove_task(args.job_id, args.task_id, attempt_id);
        } else {
            task.exited = false;
            if let Some(stats) = &stats {
                task.assign_stats(stats);
            }

            // Arm the one-shot grace-period timer; natural exit before the
            // deadline cancels it through the token stored on the task.
            task.cancel_grace_timer();
            let token = self.cancel.child_token();
            task.grace_cancel = Some(token.clone());
            body = task.to_json();

            let executor = self.weak_self.clone();
            let grace = Duration::from_secs(args.task_cancel_grace_period_seconds);
            let (job_id, task_id) = (args.job_id, args.task_id);
            let uri = callback_uri;
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(grace) => {}
                }
                let Some(executor) = executor.upgrade() else {
                    return;
                };
                executor
                    .grace_period_elapsed(job_id, task_id, requeue_count, attempt_id, process_key, uri)
                    .await;
            });
        }

        tracing::info!(job_id = args.job_id, task_id = args.task_id, "EndTask ended");
        Ok(body)
    }

    async fn grace_period_elapsed(
        &self,
        job_id: JobId,
        task_id: TaskId,
        requeue_count: i32,
        attempt_id: u64,
        process_key: ProcessKey,
        callback_uri: String,
    ) {
        let body = {
            let mut state_guard = self.state.write().await;
            let state = &mut *state_guard;
            tracing::info!(job_id, task_id, "Grace period elapsed");

            match state.table.get_task(job_id, task_id) {
                Some(task) if task.attempt_id() == attempt_id => {}
                _ => {
                    tracing::warn!(job_id, task_id, "Grace period: task is already finished");
                    return;
                }
            }

            let stats = self
                .terminate_task(
                    state,
                    job_id,
                    task_id,
                    requeue_count,
                    process_key,
                    END_TASK_EXIT_CODE,
                    true,
                    false,
                )
                .await;

            // A missing process means the main task exited on its own and the
            // natural completion path already reported it.
            let Some(stats) = stats else {
                return;
            };

            tracing::debug!(job_id, task_id, remaining = stats.process_ids.len(), "Grace period kill done");
            if self.config.debug && !stats.process_ids.is_empty() {
                self.dump_undead(task_id, requeue_count, &stats).await;
            }

            let Some(task) = state.table.get_task_mut(job_id, task_id) else {
                return;
            };
            task.exited = true;
            task.exit_code = Some(END_TASK_EXIT_CODE);
            task.assign_stats(&stats);
            task.process_ids.clear();
            let body = task.to_completion_json();
            state.table.remove_task(job_id, task_id, attempt_id);
            body
        };

        self.report_task_completion(job_id, task_id, requeue_count, body, &callback_uri)
            .await;
    }

    /// Kill a task's process group and wait briefly for it to drain.
    ///
    /// Deliberately runs under the caller's write guard: concurrent
    /// termination and state changes are serialised for the duration of the
    /// poll (at most one second).
    #[allow(clippy::too_many_arguments)]
    async fn terminate_task(
        &self,
        state: &mut ExecutorState,
        job_id: JobId,
        task_id: TaskId,
        requeue_count: i32,
        process_key: ProcessKey,
        exit_code: i32,
        forced: bool,
        mpi_docker_task: bool,
    ) -> Option<ProcessStatistics> {
        if mpi_docker_task {
            match self
                .system
                .run_script("StopMpiContainer.sh", &[task_id.to_string()])
                .await
            {
                Ok((0, _)) => {
                    tracing::info!(job_id, task_id, requeue_count, "Stopped MPI container");
                }
                Ok((code, output)) => {
                    tracing::error!(job_id, task_id, code, output = %output, "Stopping MPI container failed");
                }
                Err(e) => {
                    tracing::error!(job_id, task_id, error = %e, "Stopping MPI container failed");
                }
            }
            return None;
        }

        let Some(process) = state.processes.get(&process_key).cloned() else {
            tracing::warn!(job_id, task_id, %process_key, "No process object found");
            return None;
        };

        tracing::debug!(job_id, task_id, forced, "About to kill the task");
        process.kill(exit_code, forced);

        let mut stats = process.statistics();
        let mut polls_left = 10;
        while !stats.is_terminated() && polls_left > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stats = process.statistics();
            polls_left -= 1;
        }

        if !stats.is_terminated() {
            tracing::warn!(
                job_id,
                task_id,
                pids = ?stats.process_ids,
                "The task did not exit within 1s"
            );
        }

        Some(stats)
    }

    async fn dump_undead(&self, task_id: TaskId, requeue_count: i32, stats: &ProcessStatistics) {
        for pid in &stats.process_ids {
            if let Ok(output) = tokio::process::Command::new("ps")
                .arg("-p")
                .arg(pid.to_string())
                .output()
                .await
            {
                tracing::debug!(pid, output = %String::from_utf8_lossy(&output.stdout), "Undead process");
            }
        }
        let tasks_file = self
            .config
            .cgroup_root
            .join("cpu,cpuacct")
            .join(format!("nmgroup_Task_{}_{}", task_id, requeue_count))
            .join("tasks");
        if let Ok(contents) = tokio::fs::read_to_string(&tasks_file).await {
            tracing::debug!(file = %tasks_file.display(), contents = %contents, "Cgroup tasks file");
        }
    }

    fn exit_callback(
        &self,
        job_id: JobId,
        task_id: TaskId,
        requeue_count: i32,
        attempt_id: u64,
        process_key: ProcessKey,
        callback_uri: String,
    ) -> ExitCallback {
        let executor = self.weak_self.clone();
        Box::new(move |exit_code, message, stats| {
            Box::pin(async move {
                let Some(executor) = executor.upgrade() else {
                    return;
                };
                executor
                    .on_process_exit(
                        job_id,
                        task_id,
                        requeue_count,
                        attempt_id,
                        process_key,
                        callback_uri,
                        exit_code,
                        message,
                        stats,
                    )
                    .await;
            })
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn on_process_exit(
        &self,
        job_id: JobId,
        task_id: TaskId,
        requeue_count: i32,
        attempt_id: u64,
        process_key: ProcessKey,
        callback_uri: String,
        exit_code: i32,
        message: String,
        stats: ProcessStatistics,
    ) {
        let body = {
            let mut state = self.state.write().await;

            let body = match state.table.get_task_mut(job_id, task_id) {
                Some(task) if task.attempt_id() == attempt_id => {
                    task.cancel_grace_timer();
                    if task.exited {
                        tracing::debug!(job_id, task_id, "Task ended already by EndTask");
                        Value::Null
                    } else {
                        task.exited = true;
                        task.exit_code = Some(exit_code);
                        task.message = message;
                        task.assign_stats(&stats);
                        task.to_completion_json()
                    }
                }
                _ => {
                    // A requeue advanced the attempt; the new attempt owns
                    // the slot and this completion is dropped.
                    tracing::debug!(job_id, task_id, attempt_id, "Completion for a stale attempt");
                    Value::Null
                }
            };

            state.table.remove_task(job_id, task_id, attempt_id);
            tracing::debug!(job_id, task_id, attempt_id, %process_key, "Erasing process");
            state.processes.remove(&process_key);
            body
        };

        self.report_task_completion(job_id, task_id, requeue_count, body, &callback_uri)
            .await;
    }

    async fn report_task_completion(
        &self,
        job_id: JobId,
        task_id: TaskId,
        requeue_count: i32,
        body: Value,
        callback_uri: &str,
    ) {
        if body.is_null() || callback_uri.is_empty() {
            return;
        }

        let uri = match resolve_uri_ref(&self.resolver, callback_uri, &self.cancel).await {
            Ok(uri) => uri,
            Err(AgentError::Cancelled) => return,
            Err(e) => {
                tracing::error!(job_id, task_id, error = %e, "Resolving completion callback failed");
                self.resync_and_invalidate().await;
                return;
            }
        };

        tracing::debug!(job_id, task_id, requeue_count, uri = %uri, "Reporting task completion");
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return,
            r = self.client.post(&uri).json(&body).send() => r,
        };

        match response {
            Ok(response) if response.status().is_success() => {
                tracing::info!(job_id, task_id, status = %response.status(), "Task completion reported");
            }
            Ok(response) => {
                tracing::warn!(job_id, task_id, status = %response.status(), "Task completion rejected");
                self.resync_and_invalidate().await;
            }
            Err(e) => {
                tracing::error!(job_id, task_id, error = %e, "Sending task completion failed");
                self.resync_and_invalidate().await;
            }
        }
    }

    /// Mark the table dirty and flush the resolver, so the next heartbeat
    /// requests a re-push and every endpoint is re-fetched.
    pub async fn resync_and_invalidate(&self) {
        self.state.write().await.table.request_resync();
        self.resolver.invalidate().await;
    }

    pub async fn ping(&self, callback_uri: String) -> Result<Value> {
        if self.endpoints.set_heartbeat_uri(&callback_uri) {
            tracing::info!(uri = %callback_uri, "Heartbeat endpoint changed, restarting reporter");
            self.start_heartbeat().await;
        }
        Ok(Value::Null)
    }

    pub async fn metric(&self, callback_uri: String) -> Result<Value> {
        if self.endpoints.set_metric_uri(&callback_uri) {
            tracing::info!(uri = %callback_uri, "Metric endpoint changed, restarting reporter");
            self.start_metric().await;
        }
        Ok(Value::Null)
    }

    pub async fn metric_config(
        &self,
        config: MetricCountersConfig,
        callback_uri: String,
    ) -> Result<Value> {
        self.metric(callback_uri).await?;
        self.monitor.apply_metric_config(config);
        Ok(Value::Null)
    }

    pub async fn peek_task_output(&self, args: PeekTaskOutputArgs) -> Result<Value> {
        tracing::info!(job_id = args.job_id, task_id = args.task_id, "Peeking task output");
        let state = self.state.read().await;
        let output = state
            .table
            .get_task(args.job_id, args.task_id)
            .and_then(|task| state.processes.get(&task.process_key()))
            .map(|process| process.peek_output());
        let text = match output {
            Some(Ok(text)) => text,
            Some(Err(e)) => {
                tracing::warn!(
                    job_id = args.job_id,
                    task_id = args.task_id,
                    error = %e,
                    "Peeking task output failed"
                );
                PEEK_OUTPUT_ERROR.to_string()
            }
            None => String::new(),
        };
        Ok(Value::String(text))
    }

    /// Current heartbeat document. Observing it clears the resync flag.
    pub async fn heartbeat_payload(&self) -> Value {
        self.state.write().await.table.snapshot()
    }

    /// Report view of a task, if it is still registered.
    pub async fn query_task(&self, job_id: JobId, task_id: TaskId) -> Option<Value> {
        let state = self.state.read().await;
        state.table.get_task(job_id, task_id).map(|task| task.to_json())
    }

    pub async fn process_count(&self) -> usize {
        self.state.read().await.processes.len()
    }

    pub fn resolver(&self) -> &ServiceResolver {
        &self.resolver
    }

    async fn start_register(&self) {
        let uri = self.endpoints.get().register_uri;
        if uri.is_empty() {
            tracing::debug!("Register endpoint not configured");
            return;
        }
        let mut reporters = self.reporters.lock().await;
        if let Some(old) = reporters.register.take() {
            old.stop().await;
        }
        reporters.register = Some(Reporter::start(
            "register",
            Duration::from_secs(REGISTER_HOLD_SECS),
            Duration::from_secs(self.config.register_interval_secs),
            RegisterSource {
                executor: self.weak_self.clone(),
            },
            HttpTransport::new(self.client.clone()),
            &self.cancel,
        ));
    }

    async fn start_heartbeat(&self) {
        let uri = self.endpoints.get().heartbeat_uri;
        if uri.is_empty() {
            tracing::debug!("Heartbeat endpoint not configured");
            return;
        }
        let mut reporters = self.reporters.lock().await;
        if let Some(old) = reporters.heartbeat.take() {
            old.stop().await;
        }
        reporters.heartbeat = Some(Reporter::start(
            "heartbeat",
            Duration::ZERO,
            Duration::from_secs(self.config.heartbeat_interval_secs),
            HeartbeatSource {
                executor: self.weak_self.clone(),
            },
            HttpTransport::new(self.client.clone()),
            &self.cancel,
        ));
    }

    async fn start_metric(&self) {
        let uri = self.endpoints.get().metric_uri;
        if uri.is_empty() {
            tracing::debug!("Metric endpoint not configured");
            return;
        }
        match parse_node_uuid(&uri) {
            Some(id) => self.monitor.set_node_uuid(id),
            None => tracing::warn!(uri = %uri, "Metric URI carries no node uuid"),
        }
        let mut reporters = self.reporters.lock().await;
        if let Some(old) = reporters.metric.take() {
            old.stop().await;
        }
        reporters.metric = Some(Reporter::start(
            "metric",
            Duration::ZERO,
            Duration::from_secs(self.config.metric_interval_secs),
            MetricSource {
                executor: self.weak_self.clone(),
            },
            UdpTransport,
            &self.cancel,
        ));
    }

    async fn start_hosts_manager(&self) {
        let uri = self.endpoints.get().hosts_file_uri;
        if uri.is_empty() {
            tracing::warn!("Hosts file URI not configured, hosts manager not started");
            return;
        }
        let mut reporters = self.reporters.lock().await;
        if let Some(old) = reporters.hosts.take() {
            old.stop().await;
        }
        reporters.hosts = Some(HostsManager::start(
            Arc::clone(&self.resolver),
            uri,
            Duration::from_secs(self.config.hosts_fetch_interval_secs),
            self.config.hosts_file_path.clone(),
            self.client.clone(),
            &self.cancel,
        ));
    }
}

struct HeartbeatSource {
    executor: Weak<RemoteExecutor>,
}

#[async_trait]
impl ReportSource for HeartbeatSource {
    type Payload = Value;

    async fn resolve_uri(&self, cancel: &CancellationToken) -> Option<String> {
        let executor = self.executor.upgrade()?;
        let uri = executor.endpoints.get().heartbeat_uri;
        if uri.is_empty() {
            return None;
        }
        resolve_uri_ref(&executor.resolver, &uri, cancel).await.ok()
    }

    async fn fetch(&self) -> Option<Value> {
        Some(self.executor.upgrade()?.heartbeat_payload().await)
    }

    async fn on_failure(&self) {
        if let Some(executor) = self.executor.upgrade() {
            executor.resync_and_invalidate().await;
        }
    }
}

struct RegisterSource {
    executor: Weak<RemoteExecutor>,
}

#[async_trait]
impl ReportSource for RegisterSource {
    type Payload = Value;

    async fn resolve_uri(&self, cancel: &CancellationToken) -> Option<String> {
        let executor = self.executor.upgrade()?;
        let uri = executor.endpoints.get().register_uri;
        if uri.is_empty() {
            return None;
        }
        resolve_uri_ref(&executor.resolver, &uri, cancel).await.ok()
    }

    async fn fetch(&self) -> Option<Value> {
        Some(self.executor.upgrade()?.monitor.register_info().await)
    }

    async fn on_failure(&self) {
        if let Some(executor) = self.executor.upgrade() {
            executor.resync_and_invalidate().await;
        }
    }
}

struct MetricSource {
    executor: Weak<RemoteExecutor>,
}

#[async_trait]
impl ReportSource for MetricSource {
    type Payload = Vec<u8>;

    async fn resolve_uri(&self, cancel: &CancellationToken) -> Option<String> {
        let executor = self.executor.upgrade()?;
        let uri = executor.endpoints.get().metric_uri;
        if uri.is_empty() {
            return None;
        }
        resolve_uri_ref(&executor.resolver, &uri, cancel).await.ok()
    }

    async fn fetch(&self) -> Option<Vec<u8>> {
        Some(self.executor.upgrade()?.monitor.metric_packet().await)
    }

    async fn on_failure(&self) {
        if let Some(executor) = self.executor.upgrade() {
            executor.resolver.invalidate().await;
        }
    }
}

fn env_flag(env: &HashMap<String, String>, key: &str) -> bool {
    env.get(key).map(|v| v == "1").unwrap_or(false)
}

/// Strip a Windows-style `DOMAIN\user` prefix.
fn strip_domain(user_name: &str) -> &str {
    user_name.rsplit('\\').next().unwrap_or(user_name)
}

fn non_empty(value: &str) -> Option<&str> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

fn stdio_path(configured: &str, job_id: JobId, task_id: TaskId, suffix: &str) -> PathBuf {
    match non_empty(configured) {
        Some(path) => PathBuf::from(path),
        None => PathBuf::from(format!("/tmp/hpc_task_{}_{}.{}", job_id, task_id, suffix)),
    }
}

fn parse_node_uuid(uri: &str) -> Option<Uuid> {
    uri.split('/').nth(4).and_then(|s| Uuid::parse_str(s).ok())
}
