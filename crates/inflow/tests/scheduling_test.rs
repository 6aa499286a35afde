//! Dispatcher and writers driven together by hand, without the actor loops.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use inflow::calendar::HoldState;
use inflow::config::Settings;
use inflow::dispatch::{DispatchEvent, Dispatcher, LoadOutcome};
use inflow::mover::MoverCommand;
use inflow::telemetry::Telemetry;
use inflow::types::{FileSignature, FileStamp, PendingItem};
use inflow::writer::{LoadMode, Writer, WriterWork, CONNECT_BACKOFF};
use inflow_db::{MemoryConnector, MemoryScript, SinkError};
use tempfile::TempDir;
use tokio::sync::mpsc;

struct Pool {
    writers: Vec<Writer>,
    scripts: Vec<MemoryScript>,
    events: mpsc::UnboundedReceiver<DispatchEvent>,
    _mover: mpsc::UnboundedReceiver<MoverCommand>,
}

fn pool(count: usize) -> Pool {
    let mut settings = Settings::default();
    settings.sink.url = "memory://".into();
    let settings = Arc::new(settings);
    let (dispatch_tx, events) = mpsc::unbounded_channel();
    let (mover_tx, mover_rx) = mpsc::unbounded_channel();

    let mut writers = Vec::new();
    let mut scripts = Vec::new();
    for index in 0..count {
        let script = MemoryScript::default();
        writers.push(Writer::new(
            index,
            Arc::new(MemoryConnector::new(script.clone())),
            settings.clone(),
            dispatch_tx.clone(),
            mover_tx.clone(),
            Telemetry::disabled(),
        ));
        scripts.push(script);
    }
    Pool {
        writers,
        scripts,
        events,
        _mover: mover_rx,
    }
}

async fn item(dir: &Path, name: &str) -> PendingItem {
    let path = dir.join(name);
    std::fs::write(&path, name).unwrap();
    PendingItem {
        stamp: FileStamp::new(dir, name),
        signature: FileSignature::read(&path).await.unwrap(),
        mode: LoadMode::Utf8Text,
        statement: Arc::from("INSERT INTO t SELECT data FROM inflow_file"),
        success_path: None,
        error_path: None,
    }
}

/// Feed writer events back into the dispatcher. Returns the results seen.
fn settle(dispatcher: &mut Dispatcher, events: &mut mpsc::UnboundedReceiver<DispatchEvent>) -> Vec<(usize, LoadOutcome)> {
    let mut results = Vec::new();
    while let Ok(event) = events.try_recv() {
        match event {
            DispatchEvent::Result {
                worker, outcome, ..
            } => {
                dispatcher.on_result(worker, outcome);
                results.push((worker, outcome));
            }
            DispatchEvent::Paused { worker, until } => dispatcher.on_paused(worker, until),
            other => panic!("unexpected event {other:?}"),
        }
    }
    results
}

#[tokio::test]
async fn test_connect_failure_on_one_worker_keeps_others_busy() {
    let temp = TempDir::new().unwrap();
    let mut pool = pool(3);
    pool.scripts[2].fail_next_connect(SinkError::connect("login failed for user"));
    let mut dispatcher = Dispatcher::new(3, 3);

    for name in ["x.txt", "y.txt", "a.txt"] {
        dispatcher.enqueue(item(temp.path(), name).await);
    }
    let now = Instant::now();
    for (worker, item) in dispatcher.assign(HoldState::Running, now) {
        pool.writers[worker].push(WriterWork::FileLoad(item));
    }
    for writer in pool.writers.iter_mut() {
        writer.process_next(HoldState::Running, now).await;
    }

    let results = settle(&mut dispatcher, &mut pool.events);
    assert_eq!(
        results,
        vec![(0, LoadOutcome::Success), (1, LoadOutcome::Success)]
    );
    // a.txt stays with worker #2, which is paused and still counts it.
    assert_eq!(pool.writers[2].queue_len(), 1);
    assert_eq!(dispatcher.slots()[2].in_flight, 1);
    assert_eq!(dispatcher.slots()[2].paused_until, Some(now + CONNECT_BACKOFF));

    for name in ["p.txt", "q.txt", "r.txt", "s.txt"] {
        dispatcher.enqueue(item(temp.path(), name).await);
    }
    let later = now + Duration::from_secs(30);
    let assigned = dispatcher.assign(HoldState::Running, later);
    assert_eq!(assigned.len(), 2);
    assert!(assigned.iter().all(|(worker, _)| *worker != 2));
    assert_eq!(dispatcher.pending_len(), 2);

    // Worker #2 retries its own item once the pause is over.
    assert!(
        !pool.writers[2]
            .process_next(HoldState::Running, later)
            .await
    );
    assert!(
        pool.writers[2]
            .process_next(HoldState::Running, now + CONNECT_BACKOFF)
            .await
    );
    let results = settle(&mut dispatcher, &mut pool.events);
    assert_eq!(results, vec![(2, LoadOutcome::Success)]);
    assert!(pool.scripts[2].executed()[0].contains("'a.txt' AS data"));
}

#[tokio::test]
async fn test_stream_ceiling_holds_while_results_trickle_in() {
    let temp = TempDir::new().unwrap();
    let mut pool = pool(8);
    let mut dispatcher = Dispatcher::new(8, 4);
    for idx in 0..10 {
        dispatcher.enqueue(item(temp.path(), &format!("f{idx}.txt")).await);
    }

    let now = Instant::now();
    let mut loaded = 0;
    while loaded < 10 {
        for (worker, item) in dispatcher.assign(HoldState::Running, now) {
            pool.writers[worker].push(WriterWork::FileLoad(item));
        }
        assert!(dispatcher.total_in_flight() <= 4);
        assert_eq!(
            dispatcher.total_in_flight(),
            (10 - loaded).min(4),
            "ceiling not filled"
        );

        // Exactly one writer finishes per round.
        let busy = pool
            .writers
            .iter()
            .position(|writer| writer.queue_len() > 0)
            .unwrap();
        assert!(pool.writers[busy].process_next(HoldState::Running, now).await);
        loaded += settle(&mut dispatcher, &mut pool.events).len();
    }
    assert_eq!(dispatcher.pending_len(), 0);
    assert_eq!(dispatcher.total_in_flight(), 0);
    assert_eq!(dispatcher.take_digest().success, 10);
}
