mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use common::{
    at, execution, finished, harness, harness_with_options, seed, FakeRunner, UnavailableStore,
};
use orchestrator_core::execution::{ExecutionId, ExecutionStatus, RunRequest};
use orchestrator_core::log_event::{LogEvent, RawLogLine};
use orchestrator_core::runner::{RunnerRegistry, TaskState};
use orchestrator_core::service::{Orchestrator, OrchestratorOptions};
use orchestrator_core::store::{ExecutionStore, ListFilter, LogEventStore, MemoryLogEventStore};
use orchestrator_core::{ErrorKind, RequestContext, WarningCode};

fn ctx() -> RequestContext {
    RequestContext::new("tester").with_request_id("req-1")
}

fn stored_event(id: &str, index: u64, timestamp: i64, event_id: &str) -> LogEvent {
    LogEvent {
        execution_id: ExecutionId::from(id),
        index,
        timestamp,
        message: format!("line {}", index),
        event_id: Some(event_id.to_string()),
        sequence: 0,
        origin_timestamp: None,
    }
}

#[tokio::test]
async fn test_run_rejects_empty_command_without_calling_runner() {
    let h = harness();
    let err = h
        .orchestrator
        .run_command(&ctx(), RunRequest::new("   "))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert_eq!(FakeRunner::calls(&h.runner.start_calls), 0);
    assert!(h.executions.is_empty());
}

#[tokio::test]
async fn test_run_then_status_reports_running() {
    let h = harness();
    h.runner.queue_id("exec-1");
    let mut request = RunRequest::new("make test");
    request.env = BTreeMap::from([
        ("GITHUB_TOKEN".to_string(), "ghp_x".to_string()),
        ("RUST_LOG".to_string(), "debug".to_string()),
    ]);
    let response = h.orchestrator.run_command(&ctx(), request).await.unwrap();
    assert_eq!(response.execution_id, ExecutionId::from("exec-1"));
    assert_eq!(response.status, ExecutionStatus::Running);
    assert!(response.warnings.is_empty());

    // The runner receives the real values; only log output is redacted.
    let spec = h.runner.last_spec.lock().unwrap().clone().unwrap();
    assert_eq!(spec.env.get("GITHUB_TOKEN").map(String::as_str), Some("ghp_x"));
    assert_eq!(spec.caller, "tester");

    let status = h
        .orchestrator
        .get_execution_status(&ctx(), &response.execution_id)
        .await
        .unwrap();
    assert_eq!(status.status, ExecutionStatus::Running);
    assert_eq!(status.exit_code, None);
    assert_eq!(status.completed_at, None);
    assert_eq!(status.created_by, "tester");
    assert!(status.owned_by.contains("tester"));
    assert_eq!(status.created_by_request_id.as_deref(), Some("req-1"));
    assert_eq!(status.image_id.as_deref(), Some("fake:latest"));
    assert_eq!(FakeRunner::calls(&h.runner.status_calls), 0);
}

#[tokio::test]
async fn test_run_with_unknown_runner_is_rejected() {
    let h = harness();
    let mut request = RunRequest::new("true");
    request.runner = Some("nowhere".into());
    let err = h.orchestrator.run_command(&ctx(), request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(FakeRunner::calls(&h.runner.start_calls), 0);
}

#[tokio::test]
async fn test_run_surfaces_runner_failure() {
    let h = harness();
    h.runner.fail_next_start("daemon not reachable");
    let err = h
        .orchestrator
        .run_command(&ctx(), RunRequest::new("true"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    assert!(h.executions.is_empty());
}

#[tokio::test]
async fn test_run_reports_degraded_tracking_when_store_fails() {
    let runner = Arc::new(FakeRunner::new("fake"));
    let orchestrator = Orchestrator::new(
        Arc::new(UnavailableStore),
        Arc::new(MemoryLogEventStore::new()),
        RunnerRegistry::single(runner.clone()),
        OrchestratorOptions::default(),
    );
    runner.queue_id("exec-degraded");
    let response = orchestrator
        .run_command(&ctx(), RunRequest::new("sleep 1"))
        .await
        .unwrap();
    assert_eq!(response.execution_id, ExecutionId::from("exec-degraded"));
    assert_eq!(response.status, ExecutionStatus::Running);
    assert_eq!(response.warnings.len(), 1);
    assert_eq!(response.warnings[0].code, WarningCode::DegradedTracking);
    assert_eq!(FakeRunner::calls(&runner.start_calls), 1);
}

#[tokio::test]
async fn test_run_surfaces_duplicate_id_conflict() {
    let h = harness();
    seed(&*h.executions, &[execution("exec-dup", at(0))]).await;
    h.runner.queue_id("exec-dup");
    let err = h
        .orchestrator
        .run_command(&ctx(), RunRequest::new("true"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_status_of_unknown_execution_is_not_found() {
    let h = harness();
    let err = h
        .orchestrator
        .get_execution_status(&ctx(), &ExecutionId::from("missing"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = h
        .orchestrator
        .get_execution_status(&ctx(), &ExecutionId::from(""))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}

#[tokio::test]
async fn test_list_filters_by_status_newest_first() {
    let h = harness();
    seed(
        &*h.executions,
        &[
            finished("old", at(0), ExecutionStatus::Succeeded),
            finished("failed", at(10), ExecutionStatus::Failed),
            execution("running", at(20)),
            finished("new", at(30), ExecutionStatus::Succeeded),
        ],
    )
    .await;

    let listed = h
        .orchestrator
        .list_executions(
            &ctx(),
            &ListFilter::all().with_statuses(vec![ExecutionStatus::Succeeded]),
        )
        .await
        .unwrap();
    let ids: Vec<&str> = listed.iter().map(|e| e.execution_id.as_str()).collect();
    assert_eq!(ids, vec!["new", "old"]);
    assert!(listed.iter().all(|e| e.exit_code == Some(0)));

    let all = h
        .orchestrator
        .list_executions(&ctx(), &ListFilter::all().with_limit(2))
        .await
        .unwrap();
    let ids: Vec<&str> = all.iter().map(|e| e.execution_id.as_str()).collect();
    assert_eq!(ids, vec!["new", "running"]);
}

#[tokio::test]
async fn test_kill_of_finished_execution_never_reaches_runner() {
    let h = harness();
    seed(
        &*h.executions,
        &[finished("done", at(0), ExecutionStatus::Succeeded)],
    )
    .await;
    let err = h
        .orchestrator
        .kill_execution(&ctx(), &ExecutionId::from("done"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert!(err.to_string().contains("already terminated"));
    assert_eq!(FakeRunner::calls(&h.runner.stop_calls), 0);
}

#[tokio::test]
async fn test_kill_requests_stop_and_leaves_record_running() {
    let h = harness();
    h.runner.queue_id("exec-kill");
    let run = h
        .orchestrator
        .run_command(&ctx(), RunRequest::new("sleep 60"))
        .await
        .unwrap();
    h.orchestrator
        .kill_execution(&ctx(), &run.execution_id)
        .await
        .unwrap();
    assert_eq!(FakeRunner::calls(&h.runner.stop_calls), 1);

    let record = h.executions.get(&run.execution_id).await.unwrap().unwrap();
    assert_eq!(record.status, ExecutionStatus::Running);
    assert_eq!(record.completed_at, None);
}

#[tokio::test]
async fn test_kill_unknown_execution_is_not_found() {
    let h = harness();
    let err = h
        .orchestrator
        .kill_execution(&ctx(), &ExecutionId::from("missing"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(FakeRunner::calls(&h.runner.stop_calls), 0);
}

#[tokio::test]
async fn test_kill_with_empty_id_is_invalid() {
    let h = harness();
    let err = h
        .orchestrator
        .kill_execution(&ctx(), &ExecutionId::from(""))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    assert_eq!(FakeRunner::calls(&h.runner.stop_calls), 0);
}

#[tokio::test]
async fn test_logs_reject_empty_and_unknown_ids() {
    let h = harness();
    let err = h
        .orchestrator
        .get_logs(&ctx(), &ExecutionId::from(""))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);

    let err = h
        .orchestrator
        .get_logs(&ctx(), &ExecutionId::from("missing"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(err.to_string().contains("missing"));
    assert_eq!(FakeRunner::calls(&h.runner.fetch_calls), 0);
}

#[tokio::test]
async fn test_running_logs_continue_from_stored_max_index() {
    let h = harness();
    seed(&*h.executions, &[execution("exec-logs", at(0))]).await;
    let id = ExecutionId::from("exec-logs");
    h.logs
        .append(
            &id,
            &[
                stored_event("exec-logs", 1, 100, "e1"),
                stored_event("exec-logs", 2, 200, "e2"),
                stored_event("exec-logs", 3, 300, "e3"),
            ],
        )
        .await
        .unwrap();
    h.runner.set_logs(
        "exec-logs",
        vec![
            RawLogLine::new(100, "line 1").with_event_id("e1"),
            RawLogLine::new(200, "line 2").with_event_id("e2"),
            RawLogLine::new(300, "line 3").with_event_id("e3"),
            RawLogLine::new(400, "fourth").with_event_id("e4"),
            RawLogLine::new(500, "fifth").with_event_id("e5"),
        ],
    );

    let logs = h.orchestrator.get_logs(&ctx(), &id).await.unwrap();
    let indices: Vec<u64> = logs.events.iter().map(|e| e.index).collect();
    assert_eq!(indices, vec![1, 2, 3, 4, 5]);
    assert_eq!(logs.last_index, 5);
    assert_eq!(logs.events[3].message, "fourth");
    assert_eq!(logs.events[4].message, "fifth");
    assert_eq!(logs.events_after(3).len(), 2);
    assert_eq!(logs.status, ExecutionStatus::Running);

    // A second read with no new lines changes nothing.
    let again = h.orchestrator.get_logs(&ctx(), &id).await.unwrap();
    assert_eq!(again.last_index, 5);
    assert_eq!(h.logs.max_index(&id).await.unwrap(), 5);
}

#[tokio::test]
async fn test_running_logs_before_stream_exists_are_empty() {
    let h = harness_with_options(OrchestratorOptions {
        log_push_endpoint: Some("wss://logs.example.test/live".into()),
        ..Default::default()
    });
    seed(&*h.executions, &[execution("exec-new", at(0))]).await;
    let logs = h
        .orchestrator
        .get_logs(&ctx(), &ExecutionId::from("exec-new"))
        .await
        .unwrap();
    assert!(logs.events.is_empty());
    assert_eq!(logs.last_index, 0);
    assert_eq!(
        logs.live_channel.as_deref(),
        Some("wss://logs.example.test/live?execution_id=exec-new")
    );
}

#[tokio::test]
async fn test_finished_logs_come_from_store_only() {
    let h = harness_with_options(OrchestratorOptions {
        log_push_endpoint: Some("wss://logs.example.test/{execution_id}".into()),
        ..Default::default()
    });
    seed(
        &*h.executions,
        &[finished("exec-done", at(0), ExecutionStatus::Failed)],
    )
    .await;
    let id = ExecutionId::from("exec-done");
    h.logs
        .append(&id, &[stored_event("exec-done", 1, 100, "e1")])
        .await
        .unwrap();
    h.runner.set_logs(
        "exec-done",
        vec![RawLogLine::new(900, "never merged").with_event_id("late")],
    );

    let logs = h.orchestrator.get_logs(&ctx(), &id).await.unwrap();
    assert_eq!(logs.events.len(), 1);
    assert_eq!(logs.last_index, 1);
    assert_eq!(logs.live_channel, None);
    assert_eq!(FakeRunner::calls(&h.runner.fetch_calls), 0);
}

#[tokio::test]
async fn test_concurrent_log_reads_do_not_duplicate_lines() {
    let h = harness();
    seed(&*h.executions, &[execution("exec-race", at(0))]).await;
    let lines: Vec<RawLogLine> = (1..=40)
        .map(|i| RawLogLine::new(1_000 + i, format!("line {}", i)))
        .collect();
    h.runner.set_logs("exec-race", lines);

    let id = ExecutionId::from("exec-race");
    let mut handles = Vec::new();
    for _ in 0..8 {
        let orchestrator = h.orchestrator.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move {
            orchestrator.get_logs(&ctx(), &id).await
        }));
    }
    for handle in handles {
        let logs = handle.await.unwrap().unwrap();
        assert_eq!(logs.last_index, 40);
    }

    let stored = h.logs.list_all(&id).await.unwrap();
    assert_eq!(stored.len(), 40);
    let indices: Vec<u64> = stored.iter().map(|e| e.index).collect();
    assert_eq!(indices, (1..=40).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_cleanup_requires_finished_execution() {
    let h = harness();
    seed(&*h.executions, &[execution("exec-live", at(0))]).await;
    let err = h
        .orchestrator
        .cleanup_execution(&ctx(), &ExecutionId::from("exec-live"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}

#[tokio::test]
async fn test_cleanup_removes_record_and_schedules_log_expiry() {
    let h = harness();
    seed(
        &*h.executions,
        &[finished("exec-old", at(0), ExecutionStatus::Succeeded)],
    )
    .await;
    let id = ExecutionId::from("exec-old");
    h.logs
        .append(&id, &[stored_event("exec-old", 1, 100, "e1")])
        .await
        .unwrap();

    let warnings = h.orchestrator.cleanup_execution(&ctx(), &id).await.unwrap();
    assert!(warnings.is_empty());
    assert!(h.executions.get(&id).await.unwrap().is_none());
    assert!(h.logs.expires_at(&id).is_some());
    // Logs stay readable until the grace window passes.
    assert_eq!(h.logs.list_all(&id).await.unwrap().len(), 1);
    assert!(h.orchestrator.prune_expired_logs().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_kill_after_runner_finished_reports_runner_error() {
    let h = harness();
    seed(&*h.executions, &[execution("exec-raced", at(0))]).await;
    h.runner.set_state(
        "exec-raced",
        TaskState::Succeeded { finished_at: None },
    );
    let err = h
        .orchestrator
        .kill_execution(&ctx(), &ExecutionId::from("exec-raced"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already terminated"));
    assert_eq!(FakeRunner::calls(&h.runner.stop_calls), 1);
}
