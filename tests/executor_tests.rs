use std::time::Duration;

use serde_json::Value;

use hpc_agent::config::Endpoints;
use hpc_agent::executor::{
    EndJobArgs, EndTaskArgs, PeekTaskOutputArgs, StartTaskArgs, END_TASK_EXIT_CODE,
};

use harness::{build_agent, build_agent_with, spawn_head_stub, start_args, MockSystem};

async fn wait_for_requests(stub: &harness::HeadStub, at_least: usize, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if stub.request_count() >= at_least {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn test_plain_task_lifecycle_reports_completion() {
    let stub = spawn_head_stub(200).await;
    let agent = build_agent(MockSystem::new()).await;

    agent
        .executor
        .start_job_and_task(start_args(1, 1, "alice", "/bin/echo hi"), stub.uri("/callback"))
        .await
        .unwrap();

    let task = agent.executor.query_task(1, 1).await.unwrap();
    assert_eq!(task["Exited"], false);

    assert!(wait_for_requests(&stub, 1, Duration::from_secs(5)).await);
    let completion = &stub.requests()[0];
    assert_eq!(completion["JobId"], 1);
    assert_eq!(completion["TaskId"], 1);
    assert_eq!(completion["ExitCode"], 0);
    assert_eq!(completion["Message"], "");

    // The attempt is deregistered once its completion is reported.
    assert!(agent.executor.query_task(1, 1).await.is_none());
    assert_eq!(agent.executor.process_count().await, 0);
}

#[tokio::test]
async fn test_admin_maps_to_root_without_user_setup() {
    let stub = spawn_head_stub(200).await;
    let agent = build_agent(MockSystem::new()).await;

    let mut args = start_args(2, 1, "DOMAIN\\admin", "/bin/true");
    args.start_info
        .environment_variables
        .insert("CCP_ISADMIN".to_string(), "1".to_string());

    agent
        .executor
        .start_job_and_task(args, stub.uri("/callback"))
        .await
        .unwrap();

    assert!(!agent.system.called("create_user"));
    assert!(!agent.system.called("add_ssh_key"));
    assert!(wait_for_requests(&stub, 1, Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_mapped_admin_gets_user_and_keys() {
    let stub = spawn_head_stub(200).await;
    let agent = build_agent(MockSystem::new()).await;

    let mut args = start_args(3, 1, "DOMAIN\\admin", "/bin/true");
    let env = &mut args.start_info.environment_variables;
    env.insert("CCP_ISADMIN".to_string(), "1".to_string());
    env.insert("CCP_MAP_ADMIN_USER".to_string(), "1".to_string());

    agent
        .executor
        .start_job_and_task(args, stub.uri("/callback"))
        .await
        .unwrap();

    // Domain prefix is stripped by default.
    assert!(agent.system.called("create_user admin admin=true"));
    assert!(agent.system.called("add_ssh_key admin id_rsa"));
}

#[tokio::test]
async fn test_requested_root_is_renamed() {
    let stub = spawn_head_stub(200).await;
    let agent = build_agent(MockSystem::new()).await;

    agent
        .executor
        .start_job_and_task(start_args(4, 1, "DOMAIN\\root", "/bin/true"), stub.uri("/callback"))
        .await
        .unwrap();

    assert!(agent.system.called("create_user hpc_faked_root"));
}

#[tokio::test]
async fn test_preserve_domain_keeps_the_prefix() {
    let stub = spawn_head_stub(200).await;
    let agent = build_agent(MockSystem::new()).await;

    let mut args = start_args(5, 1, "DOMAIN\\bob", "/bin/true");
    args.start_info
        .environment_variables
        .insert("CCP_PRESERVE_DOMAIN".to_string(), "1".to_string());

    agent
        .executor
        .start_job_and_task(args, stub.uri("/callback"))
        .await
        .unwrap();

    assert!(agent.system.called("create_user DOMAIN\\bob"));
}

#[tokio::test]
async fn test_user_setup_failure_aborts_and_rolls_back() {
    let stub = spawn_head_stub(200).await;
    let agent = build_agent(MockSystem::with_create_user_code(4)).await;

    let result = agent
        .executor
        .start_job_and_task(start_args(6, 1, "carol", "/bin/true"), stub.uri("/callback"))
        .await;

    assert!(result.is_err());
    assert!(agent.executor.query_task(6, 1).await.is_none());
}

#[tokio::test]
async fn test_start_task_without_job_is_fatal() {
    let agent = build_agent(MockSystem::new()).await;

    let result = agent
        .executor
        .start_task(
            StartTaskArgs {
                job_id: 9,
                task_id: 1,
                ..StartTaskArgs::default()
            },
            String::new(),
        )
        .await;

    assert!(result.is_err());
    assert!(agent.executor.query_task(9, 1).await.is_none());
}

#[tokio::test]
async fn test_empty_command_creates_no_process() {
    let stub = spawn_head_stub(200).await;
    let agent = build_agent(MockSystem::new()).await;

    agent
        .executor
        .start_job_and_task(start_args(10, 1, "dave", ""), stub.uri("/callback"))
        .await
        .unwrap();

    assert_eq!(agent.executor.process_count().await, 0);
    let task = agent.executor.query_task(10, 1).await.unwrap();
    assert_eq!(task["PrimaryTask"], true);
    assert!(!agent.system.called("run_script StartMpiContainer.sh"));
}

#[tokio::test]
async fn test_mpi_non_master_starts_container_instead_of_process() {
    let stub = spawn_head_stub(200).await;
    let agent = build_agent(MockSystem::new()).await;

    let mut args = start_args(11, 1, "erin", "");
    args.start_info
        .environment_variables
        .insert("CCP_DOCKER_IMAGE".to_string(), "mpi-image".to_string());

    agent
        .executor
        .start_job_and_task(args, stub.uri("/callback"))
        .await
        .unwrap();

    assert!(agent.system.called("run_script StartMpiContainer.sh 1 erin mpi-image"));
    assert_eq!(agent.executor.process_count().await, 0);
    let task = agent.executor.query_task(11, 1).await.unwrap();
    assert_eq!(task["PrimaryTask"], false);
}

#[tokio::test]
async fn test_end_task_forced_removes_immediately() {
    let stub = spawn_head_stub(200).await;
    let agent = build_agent(MockSystem::new()).await;

    agent
        .executor
        .start_job_and_task(start_args(12, 1, "frank", "sleep 60"), stub.uri("/callback"))
        .await
        .unwrap();

    let body = agent
        .executor
        .end_task(
            EndTaskArgs {
                job_id: 12,
                task_id: 1,
                task_cancel_grace_period_seconds: 0,
            },
            stub.uri("/callback"),
        )
        .await
        .unwrap();

    assert_eq!(body["Exited"], true);
    assert_eq!(body["ExitCode"], END_TASK_EXIT_CODE);
    assert!(agent.executor.query_task(12, 1).await.is_none());
}

#[tokio::test]
async fn test_end_task_grace_period_escalates() {
    let stub = spawn_head_stub(200).await;
    let agent = build_agent(MockSystem::new()).await;

    // The leader shell ignores SIGTERM, so only the forced follow-up after
    // the grace period can end it.
    agent
        .executor
        .start_job_and_task(
            start_args(13, 1, "grace", "trap '' TERM; sleep 60"),
            stub.uri("/callback"),
        )
        .await
        .unwrap();

    let body = agent
        .executor
        .end_task(
            EndTaskArgs {
                job_id: 13,
                task_id: 1,
                task_cancel_grace_period_seconds: 2,
            },
            stub.uri("/callback"),
        )
        .await
        .unwrap();

    // Still running when EndTask returns.
    assert_eq!(body["Exited"], false);
    assert!(agent.executor.query_task(13, 1).await.is_some());

    assert!(wait_for_requests(&stub, 1, Duration::from_secs(10)).await);
    let completion = &stub.requests()[0];
    assert_eq!(completion["ExitCode"], END_TASK_EXIT_CODE);
    assert!(agent.executor.query_task(13, 1).await.is_none());
}

#[tokio::test]
async fn test_natural_exit_cancels_grace_timer() {
    let stub = spawn_head_stub(200).await;
    let agent = build_agent(MockSystem::new()).await;

    agent
        .executor
        .start_job_and_task(
            start_args(14, 1, "heidi", "trap '' TERM; sleep 3"),
            stub.uri("/callback"),
        )
        .await
        .unwrap();

    let body = agent
        .executor
        .end_task(
            EndTaskArgs {
                job_id: 14,
                task_id: 1,
                task_cancel_grace_period_seconds: 30,
            },
            stub.uri("/callback"),
        )
        .await
        .unwrap();
    assert_eq!(body["Exited"], false);

    // The task drains on its own well before the 30 s deadline.
    assert!(wait_for_requests(&stub, 1, Duration::from_secs(10)).await);
    assert!(agent.executor.query_task(14, 1).await.is_none());

    // Exactly one completion arrives; the timer never fires a second one.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(stub.request_count(), 1);
}

#[tokio::test]
async fn test_completion_race_with_requeue_keeps_new_attempt() {
    let stub = spawn_head_stub(200).await;
    let agent = build_agent(MockSystem::new()).await;

    agent
        .executor
        .start_job_and_task(start_args(15, 1, "ivan", "sleep 0.3"), stub.uri("/callback"))
        .await
        .unwrap();

    // Requeue the task while the first attempt is still exiting.
    let mut requeued = start_args(15, 1, "ivan", "sleep 60");
    requeued.start_info.task_requeue_count = 1;
    agent
        .executor
        .start_job_and_task(requeued, stub.uri("/callback"))
        .await
        .unwrap();

    // Old attempt exits after the requeue; its completion must be dropped.
    tokio::time::sleep(Duration::from_millis(800)).await;

    let task = agent
        .executor
        .query_task(15, 1)
        .await
        .expect("requeued attempt must survive the stale completion");
    assert_eq!(task["Exited"], false);
    assert_eq!(task["TaskRequeueCount"], 1);
    // No completion was reported for the stale attempt.
    assert_eq!(stub.request_count(), 0);
}

#[tokio::test]
async fn test_heartbeat_failure_requests_resync_and_flushes_cache() {
    let stub = spawn_head_stub(500).await;
    let naming = vec![stub.uri("/locate")];
    let agent = build_agent_with(
        MockSystem::new(),
        Endpoints {
            heartbeat_uri: stub.uri("/heartbeat"),
            ..Endpoints::default()
        },
        naming,
        3600,
    )
    .await;

    // Seed the resolver cache, then let the first heartbeat fail.
    agent
        .executor
        .resolver()
        .resolve("scheduler", &agent.cancel)
        .await
        .unwrap();
    assert!(agent.executor.resolver().cached("scheduler").await.is_some());

    agent.executor.start().await;
    assert!(wait_for_requests(&stub, 1, Duration::from_secs(5)).await);
    // Give the failure hook a beat to run.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let payload = agent.executor.heartbeat_payload().await;
    assert_eq!(payload["NeedResync"], true);
    assert!(agent.executor.resolver().cached("scheduler").await.is_none());

    agent.executor.shutdown().await;
}

#[tokio::test]
async fn test_end_job_terminates_tasks_and_cleans_up_keys() {
    let stub = spawn_head_stub(200).await;
    let agent = build_agent(MockSystem::new()).await;

    agent
        .executor
        .start_job_and_task(start_args(16, 1, "judy", "sleep 60"), stub.uri("/callback"))
        .await
        .unwrap();
    let mut second = start_args(16, 2, "judy", "sleep 60");
    second.start_info.task_requeue_count = 0;
    agent
        .executor
        .start_job_and_task(second, stub.uri("/callback"))
        .await
        .unwrap();

    let body = agent.executor.end_job(EndJobArgs { job_id: 16 }).await.unwrap();

    let tasks = body["Tasks"].as_array().unwrap();
    assert_eq!(tasks.len(), 2);
    assert!(agent.executor.query_task(16, 1).await.is_none());

    // Last job of the user: exactly the installed material is removed.
    assert!(agent.system.called("remove_ssh_key judy id_rsa"));
    assert!(agent.system.called("remove_ssh_key judy id_rsa.pub"));
    assert!(agent.system.called("remove_authorized_key judy"));
}

#[tokio::test]
async fn test_end_job_keeps_keys_while_user_has_other_jobs() {
    let stub = spawn_head_stub(200).await;
    let agent = build_agent(MockSystem::new()).await;

    agent
        .executor
        .start_job_and_task(start_args(17, 1, "kate", "sleep 60"), stub.uri("/callback"))
        .await
        .unwrap();
    agent
        .executor
        .start_job_and_task(start_args(18, 1, "kate", "sleep 60"), stub.uri("/callback"))
        .await
        .unwrap();

    agent.executor.end_job(EndJobArgs { job_id: 17 }).await.unwrap();
    assert!(!agent.system.called("remove_ssh_key kate"));

    agent.executor.end_job(EndJobArgs { job_id: 18 }).await.unwrap();
    assert!(agent.system.called("remove_ssh_key kate id_rsa"));
}

#[tokio::test]
async fn test_end_job_on_unknown_job_returns_empty_body() {
    let agent = build_agent(MockSystem::new()).await;

    let body = agent.executor.end_job(EndJobArgs { job_id: 99 }).await.unwrap();

    assert_eq!(body, Value::Null);
}

#[tokio::test]
async fn test_peek_task_output_returns_stdout_tail() {
    let stub = spawn_head_stub(200).await;
    let agent = build_agent(MockSystem::new()).await;

    agent
        .executor
        .start_job_and_task(
            start_args(19, 1, "leo", "echo peeked-marker && sleep 60"),
            stub.uri("/callback"),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    let output = agent
        .executor
        .peek_task_output(PeekTaskOutputArgs {
            job_id: 19,
            task_id: 1,
        })
        .await
        .unwrap();

    assert!(output.as_str().unwrap().contains("peeked-marker"));
}

#[tokio::test]
async fn test_peek_output_of_unknown_task_is_empty() {
    let agent = build_agent(MockSystem::new()).await;

    let output = agent
        .executor
        .peek_task_output(PeekTaskOutputArgs {
            job_id: 42,
            task_id: 7,
        })
        .await
        .unwrap();

    assert_eq!(output.as_str().unwrap(), "");
}

#[tokio::test]
async fn test_duplicate_start_task_is_ignored() {
    let stub = spawn_head_stub(200).await;
    let agent = build_agent(MockSystem::new()).await;

    agent
        .executor
        .start_job_and_task(start_args(20, 1, "mia", "sleep 60"), stub.uri("/callback"))
        .await
        .unwrap();
    agent
        .executor
        .start_job_and_task(start_args(20, 1, "mia", "sleep 60"), stub.uri("/callback"))
        .await
        .unwrap();

    assert_eq!(agent.executor.process_count().await, 1);
}

#[tokio::test]
async fn test_ping_restarts_heartbeat_on_new_uri() {
    let stub = spawn_head_stub(200).await;
    let agent = build_agent_with(MockSystem::new(), Endpoints::default(), Vec::new(), 3600).await;

    agent.executor.ping(stub.uri("/heartbeat")).await.unwrap();

    // The freshly started reporter posts the first heartbeat right away.
    assert!(wait_for_requests(&stub, 1, Duration::from_secs(5)).await);
    let heartbeat = &stub.requests()[0];
    assert!(heartbeat.get("Jobs").is_some());
    assert_eq!(heartbeat["NeedResync"], false);

    agent.executor.shutdown().await;
}
