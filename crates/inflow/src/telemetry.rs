//! Operational telemetry.
//!
//! Every actor holds a cheap [`Telemetry`] handle. Records flow to a single
//! [`TelemetryAggregator`], which appends them to daily level files and ships
//! errors and digests to the sink through the writer pool. A record is retired
//! once it has reached every destination it is meant for.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate, NaiveDateTime};
use inflow_logging::{purge_older_than, DailyFile};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use crate::calendar::HoldState;
use crate::config::Settings;
use crate::dispatch::DispatchEvent;
use crate::types::DigestCounts;
use crate::writer::WriterWork;

pub const FILE_FLUSH_INTERVAL: Duration = Duration::from_secs(2);
pub const SINK_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Most error lines shipped in one sink batch.
pub const MAX_SINK_BATCH: usize = 100;

/// Records kept in memory before the oldest are dropped.
pub const MAX_RECORDS: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Trace,
    Debug,
    Error,
}

/// Message from a [`Telemetry`] handle to the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Log {
        level: Level,
        subsystem: &'static str,
        text: String,
        /// Keep out of the sink (used for failures of the sink itself).
        local: bool,
    },
    Digest(DigestCounts),
    /// Records that the sink has accepted or permanently refused.
    SinkAck(Vec<u64>),
}

/// Sending half used by every actor. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct Telemetry {
    tx: Option<mpsc::UnboundedSender<TelemetryEvent>>,
}

impl Telemetry {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A handle that only emits tracing events.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    fn send(&self, event: TelemetryEvent) {
        if let Some(tx) = &self.tx {
            // The aggregator outlives every other actor; a closed channel only
            // happens during shutdown.
            let _ = tx.send(event);
        }
    }

    fn log(&self, level: Level, subsystem: &'static str, text: String, local: bool) {
        match level {
            Level::Trace => trace!(subsystem, "{}", text),
            Level::Debug => debug!(subsystem, "{}", text),
            Level::Error => error!(subsystem, "{}", text),
        }
        self.send(TelemetryEvent::Log {
            level,
            subsystem,
            text,
            local,
        });
    }

    pub fn trace(&self, subsystem: &'static str, text: impl Into<String>) {
        self.log(Level::Trace, subsystem, text.into(), false);
    }

    pub fn debug(&self, subsystem: &'static str, text: impl Into<String>) {
        self.log(Level::Debug, subsystem, text.into(), false);
    }

    pub fn error(&self, subsystem: &'static str, text: impl Into<String>) {
        self.log(Level::Error, subsystem, text.into(), false);
    }

    /// An error that is written to the log files but never sent to the sink.
    pub fn error_local(&self, subsystem: &'static str, text: impl Into<String>) {
        self.log(Level::Error, subsystem, text.into(), true);
    }

    pub fn digest(&self, counts: DigestCounts) {
        info!(
            success = counts.success,
            error = counts.error,
            queue = counts.queue,
            "digest"
        );
        self.send(TelemetryEvent::Digest(counts));
    }

    pub fn sink_ack(&self, ids: Vec<u64>) {
        if !ids.is_empty() {
            self.send(TelemetryEvent::SinkAck(ids));
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum RecordKind {
    Log(Level),
    Digest(DigestCounts),
}

#[derive(Debug)]
struct Record {
    id: u64,
    at: NaiveDateTime,
    kind: RecordKind,
    subsystem: &'static str,
    text: String,
    in_file: bool,
    in_sink: bool,
    /// Handed to a writer, waiting for the ack.
    sink_sent: bool,
}

impl Record {
    fn line(&self) -> String {
        format!(
            "{} [{}] {}",
            self.at.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.subsystem,
            self.text
        )
    }

    fn retired(&self) -> bool {
        self.in_file && self.in_sink
    }
}

struct LevelFiles {
    dir: PathBuf,
    error: DailyFile,
    debug: DailyFile,
    trace: DailyFile,
}

impl LevelFiles {
    fn new(dir: PathBuf) -> Self {
        Self {
            error: DailyFile::new(&dir, "error"),
            debug: DailyFile::new(&dir, "debug"),
            trace: DailyFile::new(&dir, "trace"),
            dir,
        }
    }

    fn flush(&mut self) {
        for file in [&mut self.error, &mut self.debug, &mut self.trace] {
            if let Err(e) = file.flush() {
                warn!(dir = %self.dir.display(), "failed to flush log file: {}", e);
            }
        }
    }
}

/// Collects telemetry records and persists them.
pub struct TelemetryAggregator {
    app_dir: PathBuf,
    settings: Arc<Settings>,
    records: VecDeque<Record>,
    next_id: u64,
    files: LevelFiles,
    last_purge: Option<NaiveDate>,
    dispatch_tx: mpsc::UnboundedSender<DispatchEvent>,
}

impl TelemetryAggregator {
    pub fn new(
        app_dir: PathBuf,
        settings: Arc<Settings>,
        dispatch_tx: mpsc::UnboundedSender<DispatchEvent>,
    ) -> Self {
        let files = LevelFiles::new(settings.log_dir(&app_dir));
        Self {
            app_dir,
            settings,
            records: VecDeque::new(),
            next_id: 1,
            files,
            last_purge: None,
            dispatch_tx,
        }
    }

    pub fn apply_settings(&mut self, settings: Arc<Settings>) {
        let dir = settings.log_dir(&self.app_dir);
        if dir != self.files.dir {
            self.files.flush();
            self.files = LevelFiles::new(dir);
        }
        self.settings = settings;
    }

    pub fn pending(&self) -> usize {
        self.records.len()
    }

    pub fn handle(&mut self, event: TelemetryEvent, now: NaiveDateTime) {
        match event {
            TelemetryEvent::Log {
                level,
                subsystem,
                text,
                local,
            } => {
                if level == Level::Trace && !self.settings.log.allow_trace {
                    return;
                }
                let to_sink = level == Level::Error
                    && !local
                    && !self.settings.sink.error_statement.trim().is_empty();
                self.push(now, RecordKind::Log(level), subsystem, text, to_sink);
            }
            TelemetryEvent::Digest(counts) => {
                let to_sink = !self.settings.sink.digest_statement.trim().is_empty();
                self.push(now, RecordKind::Digest(counts), "digest", counts.to_string(), to_sink);
            }
            TelemetryEvent::SinkAck(ids) => {
                for record in self.records.iter_mut() {
                    if ids.contains(&record.id) {
                        record.in_sink = true;
                    }
                }
            }
        }
    }

    fn push(
        &mut self,
        at: NaiveDateTime,
        kind: RecordKind,
        subsystem: &'static str,
        text: String,
        to_sink: bool,
    ) {
        let id = self.next_id;
        self.next_id += 1;
        self.records.push_back(Record {
            id,
            at,
            kind,
            subsystem,
            text,
            in_file: false,
            in_sink: !to_sink,
            sink_sent: false,
        });
    }

    /// Append every unwritten record to its level files.
    ///
    /// Errors land in the error, debug and trace files; debug records and
    /// digests in debug and trace; trace records only in trace.
    pub fn flush_files(&mut self) {
        for record in self.records.iter_mut().filter(|r| !r.in_file) {
            let date = record.at.date();
            let line = record.line();
            let mut targets: Vec<&mut DailyFile> = Vec::with_capacity(3);
            match record.kind {
                RecordKind::Log(Level::Error) => {
                    targets.push(&mut self.files.error);
                    targets.push(&mut self.files.debug);
                    targets.push(&mut self.files.trace);
                }
                RecordKind::Log(Level::Debug) | RecordKind::Digest(_) => {
                    targets.push(&mut self.files.debug);
                    targets.push(&mut self.files.trace);
                }
                RecordKind::Log(Level::Trace) => targets.push(&mut self.files.trace),
            }

            let mut written = true;
            for file in targets {
                if let Err(e) = file.append(date, &line) {
                    warn!("failed to write log record {}: {}", record.id, e);
                    written = false;
                }
            }
            record.in_file = written;
        }
        self.files.flush();
    }

    /// Hand unsent errors (in batches) and digests to the writer pool.
    pub fn flush_sink(&mut self) {
        let mut ids = Vec::new();
        let mut lines = Vec::new();
        let mut work = Vec::new();

        for record in self
            .records
            .iter_mut()
            .filter(|r| !r.in_sink && !r.sink_sent)
        {
            match record.kind {
                RecordKind::Log(_) => {
                    ids.push(record.id);
                    lines.push(record.line());
                    record.sink_sent = true;
                    if ids.len() == MAX_SINK_BATCH {
                        work.push(WriterWork::ErrorBatch {
                            ids: std::mem::take(&mut ids),
                            lines: std::mem::take(&mut lines),
                        });
                    }
                }
                RecordKind::Digest(counts) => {
                    work.push(WriterWork::Digest {
                        id: record.id,
                        counts,
                        message: record.text.clone(),
                    });
                    record.sink_sent = true;
                }
            }
        }
        if !ids.is_empty() {
            work.push(WriterWork::ErrorBatch { ids, lines });
        }

        for item in work {
            if self.dispatch_tx.send(DispatchEvent::Telemetry(item)).is_err() {
                debug!("dispatcher gone, telemetry stays local");
                break;
            }
        }
    }

    /// Retire fully persisted records, bound memory and purge old log files.
    pub fn sweep(&mut self, now: NaiveDateTime) {
        self.records.retain(|r| !r.retired());

        if self.records.len() > MAX_RECORDS {
            let excess = self.records.len() - MAX_RECORDS;
            self.records.drain(..excess);
            warn!(dropped = excess, "telemetry backlog over limit, oldest records dropped");
        }

        let today = now.date();
        if self.last_purge != Some(today) {
            self.last_purge = Some(today);
            match purge_older_than(&self.files.dir, today, self.settings.log.life_days) {
                Ok(0) => {}
                Ok(removed) => debug!(removed, "purged old log files"),
                Err(e) => warn!(dir = %self.files.dir.display(), "failed to purge log files: {}", e),
            }
        }
    }

    pub async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<TelemetryEvent>,
        mut settings_rx: watch::Receiver<Arc<Settings>>,
        mut state_rx: watch::Receiver<HoldState>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut file_tick = tokio::time::interval(FILE_FLUSH_INTERVAL);
        let mut sink_tick = tokio::time::interval(SINK_FLUSH_INTERVAL);
        let mut sweep_tick = tokio::time::interval(SWEEP_INTERVAL);
        for ticker in [&mut file_tick, &mut sink_tick, &mut sweep_tick] {
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        }

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(event) = rx.recv() => self.handle(event, Local::now().naive_local()),
                Ok(()) = settings_rx.changed() => {
                    let settings = settings_rx.borrow_and_update().clone();
                    self.apply_settings(settings);
                }
                Ok(()) = state_rx.changed() => {
                    if *state_rx.borrow_and_update() == HoldState::Stop {
                        self.flush_files();
                        self.flush_sink();
                    }
                }
                _ = file_tick.tick() => self.flush_files(),
                _ = sink_tick.tick() => self.flush_sink(),
                _ = sweep_tick.tick() => self.sweep(Local::now().naive_local()),
            }
        }

        // Drain whatever the other actors managed to report on their way out.
        while let Ok(event) = rx.try_recv() {
            self.handle(event, Local::now().naive_local());
        }
        self.flush_files();
        debug!(pending = self.pending(), "telemetry stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 3)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap()
    }

    fn aggregator(
        temp: &TempDir,
        settings: Settings,
    ) -> (TelemetryAggregator, mpsc::UnboundedReceiver<DispatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let aggregator = TelemetryAggregator::new(temp.path().to_path_buf(), Arc::new(settings), tx);
        (aggregator, rx)
    }

    fn log(level: Level, text: &str) -> TelemetryEvent {
        TelemetryEvent::Log {
            level,
            subsystem: "test",
            text: text.into(),
            local: false,
        }
    }

    fn read(temp: &TempDir, prefix: &str) -> String {
        let path = temp.path().join("log").join(format!("{}.20250303.log", prefix));
        std::fs::read_to_string(path).unwrap_or_default()
    }

    #[test]
    fn test_records_fan_out_to_level_files() {
        let temp = TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.log.allow_trace = true;
        let (mut agg, _rx) = aggregator(&temp, settings);

        agg.handle(log(Level::Error, "broken"), now());
        agg.handle(log(Level::Debug, "started"), now());
        agg.handle(log(Level::Trace, "scanned"), now());
        agg.flush_files();

        let error = read(&temp, "error");
        let debug = read(&temp, "debug");
        let trace = read(&temp, "trace");
        assert!(error.contains("[test] broken"));
        assert!(!error.contains("started"));
        assert!(debug.contains("broken") && debug.contains("started"));
        assert!(!debug.contains("scanned"));
        assert_eq!(trace.lines().count(), 3);
    }

    #[test]
    fn test_trace_dropped_unless_allowed() {
        let temp = TempDir::new().unwrap();
        let (mut agg, _rx) = aggregator(&temp, Settings::default());
        agg.handle(log(Level::Trace, "noise"), now());
        assert_eq!(agg.pending(), 0);
    }

    #[test]
    fn test_errors_batched_to_sink_and_retired_after_ack() {
        let temp = TempDir::new().unwrap();
        let (mut agg, mut rx) = aggregator(&temp, Settings::default());

        for i in 0..(MAX_SINK_BATCH + 5) {
            agg.handle(log(Level::Error, &format!("error {i}")), now());
        }
        agg.handle(log(Level::Debug, "debug only"), now());
        agg.flush_files();
        agg.flush_sink();

        let mut batches = Vec::new();
        while let Ok(DispatchEvent::Telemetry(WriterWork::ErrorBatch { ids, lines })) = rx.try_recv() {
            assert_eq!(ids.len(), lines.len());
            batches.push(ids);
        }
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), MAX_SINK_BATCH);
        assert_eq!(batches[1].len(), 5);

        // Sent but not acked: nothing resent, nothing retired.
        agg.flush_sink();
        assert!(rx.try_recv().is_err());
        agg.sweep(now());
        assert_eq!(agg.pending(), MAX_SINK_BATCH + 5);

        for ids in batches {
            agg.handle(TelemetryEvent::SinkAck(ids), now());
        }
        agg.sweep(now());
        assert_eq!(agg.pending(), 0);
    }

    #[test]
    fn test_local_errors_and_disabled_sink_keys_stay_local() {
        let temp = TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.sink.digest_statement = String::new();
        let (mut agg, mut rx) = aggregator(&temp, settings);

        agg.handle(
            TelemetryEvent::Log {
                level: Level::Error,
                subsystem: "sink",
                text: "statement failed".into(),
                local: true,
            },
            now(),
        );
        agg.handle(TelemetryEvent::Digest(DigestCounts::default()), now());
        agg.flush_sink();
        assert!(rx.try_recv().is_err());

        agg.flush_files();
        agg.sweep(now());
        assert_eq!(agg.pending(), 0);
        assert!(read(&temp, "debug").contains("success load 0 file(s)"));
    }

    #[test]
    fn test_digest_goes_to_sink() {
        let temp = TempDir::new().unwrap();
        let (mut agg, mut rx) = aggregator(&temp, Settings::default());
        let counts = DigestCounts {
            success: 2,
            error: 1,
            queue: 0,
        };
        agg.handle(TelemetryEvent::Digest(counts), now());
        agg.flush_sink();

        match rx.try_recv().unwrap() {
            DispatchEvent::Telemetry(WriterWork::Digest {
                counts: sent,
                message,
                ..
            }) => {
                assert_eq!(sent, counts);
                assert_eq!(message, counts.to_string());
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_backlog_is_capped() {
        let temp = TempDir::new().unwrap();
        let (mut agg, _rx) = aggregator(&temp, Settings::default());
        for _ in 0..(MAX_RECORDS + 10) {
            agg.handle(log(Level::Error, "x"), now());
        }
        agg.sweep(now());
        assert_eq!(agg.pending(), MAX_RECORDS);
    }

    #[tokio::test]
    async fn test_handle_forwards_events() {
        let (telemetry, mut rx) = Telemetry::channel();
        telemetry.error("scan", "dir missing");
        telemetry.sink_ack(Vec::new());
        telemetry.sink_ack(vec![3]);

        assert_eq!(
            rx.recv().await,
            Some(TelemetryEvent::Log {
                level: Level::Error,
                subsystem: "scan",
                text: "dir missing".into(),
                local: false,
            })
        );
        assert_eq!(rx.recv().await, Some(TelemetryEvent::SinkAck(vec![3])));
    }
}
