//! End-to-end runs of the whole service against scripted and SQLite sinks.
//!
//! These use real time: a file needs three scanner passes (about two seconds)
//! before it is dispatched.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use inflow::config::{ScanEntry, Settings, StatementEntry, WeekSchedule};
use inflow::{HoldState, Service, CONFIG_FILE_NAME};
use inflow_db::{
    MemoryConnector, MemoryScript, SinkConnector, SinkError, SinkValue, UrlConnector,
};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(20);

fn base_settings(url: &str) -> Settings {
    let mut settings = Settings::default();
    settings.sink.url = url.to_string();
    settings.sink.workers = 2;
    settings.sink.max_streams = 2;
    settings.sink.error_statement = String::new();
    settings.sink.digest_statement = String::new();
    settings.service.stop = WeekSchedule::default();
    settings.service.pause = WeekSchedule::default();
    settings.scan = vec![ScanEntry {
        mask: "in/*.txt".into(),
        mode: "utf8_text".into(),
        statement: "default".into(),
        success_path: "ok".into(),
        error_path: "err".into(),
    }];
    settings
}

fn prepare(settings: &Settings) -> TempDir {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir_all(temp.path().join("in")).unwrap();
    settings.save(&temp.path().join(CONFIG_FILE_NAME)).unwrap();
    temp
}

fn today_dir(root: &Path) -> PathBuf {
    root.join(Local::now().date_naive().format("%Y%m%d").to_string())
}

async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    check()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stable_file_is_loaded_once_and_moved() {
    let settings = base_settings("memory://");
    let temp = prepare(&settings);
    let script = MemoryScript::default();
    let handle = Service::start(
        temp.path().to_path_buf(),
        settings,
        Arc::new(MemoryConnector::new(script.clone())),
    );

    std::fs::write(temp.path().join("in/a.txt"), "alpha").unwrap();
    let moved = today_dir(&temp.path().join("ok")).join("a.txt");
    assert!(wait_for(|| moved.exists()).await, "file was not moved");
    assert!(!temp.path().join("in/a.txt").exists());

    // Give the scanner a few more passes; nothing is loaded twice.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let loads: Vec<String> = script
        .executed()
        .into_iter()
        .filter(|s| s.contains("'alpha' AS data"))
        .collect();
    assert_eq!(loads.len(), 1);
    assert!(loads[0].contains("INSERT INTO file_storage"));

    assert_eq!(handle.hold_state(), HoldState::Running);
    assert_eq!(handle.shutdown(Duration::from_secs(5)).await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exec_error_leaves_ticket_in_error_folder() {
    let settings = base_settings("memory://");
    let temp = prepare(&settings);
    let script = MemoryScript::default();
    script.push_response(Err(SinkError::exec("Invalid column name 'x'")));
    let handle = Service::start(
        temp.path().to_path_buf(),
        settings,
        Arc::new(MemoryConnector::new(script.clone())),
    );

    std::fs::write(temp.path().join("in/b.txt"), "1,2").unwrap();
    let dated = today_dir(&temp.path().join("err"));
    assert!(wait_for(|| dated.join("b.txt").exists()).await, "file was not moved");

    let ticket = std::fs::read_to_string(dated.join("b.txt.ticket.txt")).unwrap();
    assert!(ticket.contains("Invalid column name 'x'"));
    assert!(ticket.contains("INSERT INTO file_storage"));
    assert!(!today_dir(&temp.path().join("ok")).join("b.txt").exists());

    handle.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_failure_retries_without_losing_file() {
    let mut settings = base_settings("memory://");
    settings.sink.workers = 1;
    let temp = prepare(&settings);
    let script = MemoryScript::default();
    script.fail_next_connect(SinkError::connect("login failed"));
    let handle = Service::start(
        temp.path().to_path_buf(),
        settings,
        Arc::new(MemoryConnector::new(script.clone())),
    );

    std::fs::write(temp.path().join("in/c.txt"), "gamma").unwrap();
    // The only worker backs off for two minutes; the file stays put.
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(temp.path().join("in/c.txt").exists());
    assert_eq!(script.connect_count(), 0);
    assert!(!temp.path().join("err").exists());

    handle.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_manual_hold_keeps_files_in_place() {
    let mut settings = base_settings("memory://");
    settings.service.hold = true;
    let temp = prepare(&settings);
    let script = MemoryScript::default();
    let mut handle = Service::start(
        temp.path().to_path_buf(),
        settings,
        Arc::new(MemoryConnector::new(script.clone())),
    );

    let mut state = handle.subscribe_state();
    // Keep only the outcome; a live `watch::Ref` would block the calendar's send.
    let held = tokio::time::timeout(WAIT, state.wait_for(|s| *s == HoldState::HoldManual))
        .await
        .map(|seen| seen.is_ok())
        .unwrap_or(false);
    assert!(held, "hold was not announced");

    std::fs::write(temp.path().join("in/d.txt"), "delta").unwrap();
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(temp.path().join("in/d.txt").exists());
    assert!(script.executed().iter().all(|s| !s.contains("'delta'")));

    // Lifting the hold through the settings file lets the file through.
    let mut lifted = (*handle.settings()).clone();
    lifted.service.hold = false;
    lifted.save(&temp.path().join(CONFIG_FILE_NAME)).unwrap();
    let moved = today_dir(&temp.path().join("ok")).join("d.txt");
    assert!(wait_for(|| moved.exists()).await, "file was not loaded after the hold");

    let stop = tokio::time::timeout(Duration::from_millis(200), handle.wait_for_stop()).await;
    assert!(stop.is_err());
    handle.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sqlite_sink_receives_file_rows() {
    let temp_db = TempDir::new().unwrap();
    let url = format!(
        "sqlite://{}?mode=rwc",
        temp_db.path().join("sink.db").display()
    );
    let mut settings = base_settings(&url);
    settings.sink.statements = vec![StatementEntry {
        key: "default".into(),
        text: vec![
            "CREATE TABLE IF NOT EXISTS file_storage (file_path TEXT, file_name_without_ext TEXT, file_ext TEXT, data TEXT);".into(),
            "INSERT INTO file_storage (file_path, file_name_without_ext, file_ext, data)".into(),
            "SELECT file_path, file_name_without_ext, file_ext, data FROM inflow_file;".into(),
        ],
    }];
    let temp = prepare(&settings);
    let handle = Service::start(temp.path().to_path_buf(), settings, Arc::new(UrlConnector));

    std::fs::write(temp.path().join("in/o'neil.txt"), "it's fine").unwrap();
    let moved = today_dir(&temp.path().join("ok")).join("o'neil.txt");
    assert!(wait_for(|| moved.exists()).await, "file was not moved");
    handle.shutdown(Duration::from_secs(5)).await;

    let mut sink = UrlConnector.connect(&url).await.unwrap();
    let response = sink
        .execute("SELECT file_name_without_ext, file_ext, data FROM file_storage")
        .await
        .unwrap();
    assert_eq!(response.row_count(), 1);
    assert_eq!(
        response.tables[0].rows[0],
        vec![
            SinkValue::Text("o'neil".into()),
            SinkValue::Text(".txt".into()),
            SinkValue::Text("it's fine".into()),
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_sqlite_hold_seconds_reschedules_file() {
    let temp_db = TempDir::new().unwrap();
    let url = format!(
        "sqlite://{}?mode=rwc",
        temp_db.path().join("sink.db").display()
    );
    let mut settings = base_settings(&url);
    settings.sink.statements = vec![StatementEntry {
        key: "default".into(),
        text: vec!["SELECT 600 AS hold_seconds FROM inflow_file;".into()],
    }];
    let temp = prepare(&settings);
    let handle = Service::start(temp.path().to_path_buf(), settings, Arc::new(UrlConnector));

    std::fs::write(temp.path().join("in/e.txt"), "epsilon").unwrap();
    tokio::time::sleep(Duration::from_secs(6)).await;

    // Loaded, then left in place for a later retry.
    assert!(temp.path().join("in/e.txt").exists());
    assert!(!temp.path().join("ok").exists());
    handle.shutdown(Duration::from_secs(5)).await;
}
