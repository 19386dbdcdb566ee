//! Coordination Service Integration Tests
//!
//! Binds a real service on an OS-assigned loopback port and drives it
//! through the typed client.

use std::time::Duration;

use lectern::client::{ClientError, CoordinationClient};
use lectern::domain::{LogFilter, NewLogRecord, NewTask, Stage, StageStatus, StageUpdate, TaskStatus};
use lectern::service::{CoordinationService, ServiceConfig};
use lectern::store::TaskStore;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct Running {
    client: CoordinationClient,
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
    _dir: TempDir,
}

async fn start_service() -> Running {
    let dir = TempDir::new().unwrap();
    let store = TaskStore::open(dir.path().join("lectern.db")).unwrap();
    let config = ServiceConfig {
        port: 0,
        idle_timeout: Duration::from_secs(5),
        ..ServiceConfig::default()
    };
    let service = CoordinationService::bind(store, config).await.unwrap();
    let port = service.port().unwrap();

    let (stop, stopped) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        service
            .run_until(async {
                let _ = stopped.await;
            })
            .await
            .unwrap();
    });

    Running {
        client: CoordinationClient::new(port),
        stop,
        handle,
        _dir: dir,
    }
}

impl Running {
    async fn stop(self) {
        let _ = self.stop.send(());
        self.handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_task_lifecycle_over_the_wire() {
    let running = start_service().await;
    let client = &running.client;

    assert!(client.ping().await.unwrap());
    let task = NewTask::new("download", json!({"url": "u"}));
    assert!(client.add_task(&task).await.unwrap());
    assert!(!client.add_task(&task).await.unwrap());

    let claimed = client.fetch_and_lock_task().await.unwrap().unwrap();
    assert_eq!(claimed.task_id, task.task_id);
    assert!(client.fetch_and_lock_task().await.unwrap().is_none());

    client
        .update_task_status(&task.task_id, TaskStatus::Completed, Some(&json!({"ok": 1})))
        .await
        .unwrap();
    let done = client.get_task_status(&task.task_id).await.unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.result, Some(json!({"ok": 1})));
    assert!(!client.are_tasks_active().await.unwrap());

    running.stop().await;
}

#[tokio::test]
async fn test_state_logs_and_analysis() {
    let running = start_service().await;
    let client = &running.client;

    client.set_app_state("http_port", "8123").await.unwrap();
    assert_eq!(client.get_app_state("http_port").await.unwrap().as_deref(), Some("8123"));
    assert!(client.get_app_state("missing").await.unwrap().is_none());

    let written = client
        .add_system_logs(&[
            NewLogRecord::new("worker", "info", "started"),
            NewLogRecord::new("orchestrator", "ERROR", "child died"),
        ])
        .await
        .unwrap();
    assert_eq!(written, 2);
    let errors = client
        .get_system_logs(&LogFilter {
            levels: vec!["ERROR".to_string()],
            sources: Vec::new(),
        })
        .await
        .unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].message, "child died");

    let analysis = client.create_or_get_analysis_task(7, Some("talk.txt")).await.unwrap();
    let again = client.create_or_get_analysis_task(7, None).await.unwrap();
    assert_eq!(analysis.id, again.id);

    client
        .update_analysis_task(analysis.id, &StageUpdate::completed(Stage::One, "/out/s1.json"))
        .await
        .unwrap();
    let updated = client.get_analysis_task(analysis.id).await.unwrap().unwrap();
    assert_eq!(updated.stage_status(Stage::One), StageStatus::Completed);
    assert_eq!(updated.stage_status(Stage::Two), StageStatus::Pending);
    assert_eq!(updated.stage1_output_path.as_deref(), Some("/out/s1.json"));

    running.stop().await;
}

#[tokio::test]
async fn test_unknown_action_is_a_server_error_and_session_survives() {
    let running = start_service().await;

    let err = running.client.call("explode", json!({})).await.unwrap_err();
    match err {
        ClientError::Server(message) => assert_eq!(message, "Unknown action: explode"),
        other => panic!("unexpected error {other:?}"),
    }

    let mut session = running.client.session().await.unwrap();
    assert!(session.call("explode", json!({})).await.is_err());
    let pong = session.call("ping", json!({})).await.unwrap();
    assert!(!pong.is_null());
    let tasks = session.call("get_all_tasks", json!({})).await.unwrap();
    assert_eq!(tasks, json!([]));
    drop(session);

    running.stop().await;
}

#[tokio::test]
async fn test_client_frame_limit_rejects_oversized_response() {
    let running = start_service().await;
    let big = "x".repeat(4096);
    running
        .client
        .add_task(&NewTask::new("transcribe", json!({"transcript": big})))
        .await
        .unwrap();

    let limited = running.client.clone().with_max_frame_bytes(256);
    let err = limited.get_all_tasks().await.unwrap_err();
    match err {
        ClientError::Protocol(message) => assert!(message.contains("exceeds limit")),
        other => panic!("unexpected error {other:?}"),
    }
    // small responses still fit
    assert!(limited.ping().await.unwrap());

    running.stop().await;
}
