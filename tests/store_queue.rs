//! Task Store Integration Tests
//!
//! Exercises the file-backed store the way several processes would:
//! separate connections racing on one database file.

use std::sync::{Arc, Barrier};
use std::thread;

use lectern::domain::{NewTask, TaskStatus};
use lectern::store::TaskStore;
use serde_json::json;
use tempfile::TempDir;

const WORKERS: usize = 8;

#[test]
fn test_concurrent_claim_hands_each_task_out_once() {
    let temp_dir = TempDir::new().unwrap();
    let db = temp_dir.path().join("lectern.db");

    let seed = TaskStore::open(&db).unwrap();
    assert!(seed.add_task(&NewTask::new("download", json!({"url": "a"})).with_id("only")).unwrap());

    // open up front so schema setup does not race
    let stores: Vec<TaskStore> = (0..WORKERS).map(|_| TaskStore::open(&db).unwrap()).collect();
    let barrier = Arc::new(Barrier::new(WORKERS));

    let handles: Vec<_> = stores
        .into_iter()
        .map(|mut store| {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                store.fetch_and_lock_task().unwrap()
            })
        })
        .collect();

    let winners: Vec<_> = handles
        .into_iter()
        .filter_map(|h| h.join().unwrap())
        .collect();

    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].task_id, "only");
    assert_eq!(winners[0].status, TaskStatus::Processing);

    let stored = seed.get_task_status("only").unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Processing);
}

#[test]
fn test_dependent_task_waits_for_parent() {
    let temp_dir = TempDir::new().unwrap();
    let mut store = TaskStore::open(temp_dir.path().join("lectern.db")).unwrap();

    store
        .add_task(&NewTask::new("download", json!({"url": "u"})).with_id("parent"))
        .unwrap();
    store
        .add_task(
            &NewTask::new("transcribe", json!({}))
                .with_id("child")
                .depends_on("parent"),
        )
        .unwrap();

    let first = store.fetch_and_lock_task().unwrap().unwrap();
    assert_eq!(first.task_id, "parent");
    // parent is processing, child not yet eligible
    assert!(store.fetch_and_lock_task().unwrap().is_none());
    assert_eq!(store.find_dependent_task("parent").unwrap().as_deref(), Some("child"));

    store
        .update_task_status("parent", TaskStatus::Completed, Some(&json!({"path": "/tmp/a.mp3"})))
        .unwrap();

    let second = store.fetch_and_lock_task().unwrap().unwrap();
    assert_eq!(second.task_id, "child");
    assert!(store.are_tasks_active().unwrap());

    store.update_task_status("child", TaskStatus::Failed, None).unwrap();
    assert!(!store.are_tasks_active().unwrap());
}

#[test]
fn test_failed_parent_blocks_child_forever() {
    let temp_dir = TempDir::new().unwrap();
    let mut store = TaskStore::open(temp_dir.path().join("lectern.db")).unwrap();

    store.add_task(&NewTask::new("download", json!({})).with_id("p")).unwrap();
    store
        .add_task(&NewTask::new("transcribe", json!({})).with_id("c").depends_on("p"))
        .unwrap();

    store.fetch_and_lock_task().unwrap().unwrap();
    store.update_task_status("p", TaskStatus::Failed, None).unwrap();

    assert!(store.fetch_and_lock_task().unwrap().is_none());
    assert!(store.are_tasks_active().unwrap());
}

#[test]
fn test_payload_and_result_survive_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let db = temp_dir.path().join("lectern.db");
    let payload = json!({"url": "https://example.com/v", "options": {"lang": "zh", "n": [1, 2]}});

    {
        let store = TaskStore::open(&db).unwrap();
        store.add_task(&NewTask::new("download", payload.clone()).with_id("t")).unwrap();
        store.update_task_progress("t", 140, &json!({"partial": true})).unwrap();
    }

    let store = TaskStore::open(&db).unwrap();
    let task = store.get_task_status("t").unwrap().unwrap();
    assert_eq!(task.payload, payload);
    assert_eq!(task.progress, 100);
    assert_eq!(task.result, Some(json!({"partial": true})));
    assert_eq!(task.status, TaskStatus::Queued);
}

/// `tasks` table as written by the earlier Python service, keyed by `id`
const LEGACY_TASKS_DDL: &str = r#"
CREATE TABLE tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL UNIQUE,
    status TEXT NOT NULL DEFAULT '處理中',
    progress INTEGER DEFAULT 0,
    payload TEXT,
    result TEXT,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    type TEXT DEFAULT 'transcribe',
    depends_on TEXT
);
CREATE TRIGGER update_tasks_updated_at
AFTER UPDATE ON tasks
FOR EACH ROW
BEGIN
    UPDATE tasks SET updated_at = CURRENT_TIMESTAMP WHERE id = OLD.id;
END;
"#;

#[test]
fn test_legacy_id_keyed_database_is_fully_usable() {
    let temp_dir = TempDir::new().unwrap();
    let db = temp_dir.path().join("lectern.db");
    {
        let conn = rusqlite::Connection::open(&db).unwrap();
        conn.execute_batch(LEGACY_TASKS_DDL).unwrap();
        conn.execute(
            "INSERT INTO tasks (task_id, payload) VALUES ('old', '{\"url\": \"u\"}')",
            [],
        )
        .unwrap();
    }

    let mut store = TaskStore::open(&db).unwrap();
    let old = store.get_task_status("old").unwrap().unwrap();
    assert_eq!(old.status, TaskStatus::Queued);
    assert_eq!(old.task_type, "transcribe");

    assert!(store.add_task(&NewTask::new("download", json!({})).with_id("new")).unwrap());

    let claimed = store.fetch_and_lock_task().unwrap().unwrap();
    assert_eq!(claimed.task_id, "old");
    assert_eq!(claimed.payload, json!({"url": "u"}));

    let ids: Vec<String> = store
        .get_all_tasks()
        .unwrap()
        .into_iter()
        .map(|t| t.task_id)
        .collect();
    assert_eq!(ids, vec!["new", "old"]);
    assert_eq!(
        store.get_task_status("old").unwrap().unwrap().status,
        TaskStatus::Processing
    );
}

#[test]
fn test_columns_missing_from_oldest_schema_are_added() {
    let temp_dir = TempDir::new().unwrap();
    let db = temp_dir.path().join("lectern.db");
    {
        let conn = rusqlite::Connection::open(&db).unwrap();
        conn.execute_batch(
            "CREATE TABLE tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL UNIQUE,
                status TEXT NOT NULL DEFAULT '處理中',
                payload TEXT,
                result TEXT,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            );
            INSERT INTO tasks (task_id, status, payload) VALUES ('a', '已完成', 'null');",
        )
        .unwrap();
    }

    let store = TaskStore::open(&db).unwrap();
    let task = store.get_task_status("a").unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.task_type, "transcribe");
    assert_eq!(task.progress, 0);
    assert!(task.depends_on.is_none());

    store
        .add_task(&NewTask::new("transcribe", json!({})).with_id("b").depends_on("a"))
        .unwrap();
    assert_eq!(store.find_dependent_task("a").unwrap().as_deref(), Some("b"));
}
