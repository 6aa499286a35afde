//! Sink writers.
//!
//! Each writer owns one sink connection and a private FIFO of work handed to it
//! by the dispatcher: file loads plus error and digest batches from telemetry.
//! A connect-class failure puts the work back at the head of the writer's own
//! queue and pauses that kind of work for [`CONNECT_BACKOFF`]; an exec-class
//! failure is terminal for the item.

mod binder;
mod transform;
pub mod xlsx;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use inflow_db::{SinkConnector, SinkError, SinkResponse};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

pub use binder::{compose, escape, Binder};
pub use transform::{transform, LoadMode, Payload, StructuredFormat, TransformError};

use crate::calendar::HoldState;
use crate::config::Settings;
use crate::dispatch::{DispatchEvent, LoadOutcome};
use crate::mover::MoverCommand;
use crate::telemetry::Telemetry;
use crate::types::{DigestCounts, FileSignature, PendingItem};

/// Pause after a connect-class failure.
pub const CONNECT_BACKOFF: Duration = Duration::from_secs(120);

pub const WRITER_TICK: Duration = Duration::from_millis(250);

/// Longest retry delay a sink may ask for with `hold_seconds`.
pub const MAX_HOLD: Duration = Duration::from_secs(24 * 3600);

/// Work assigned to one writer.
#[derive(Debug, Clone)]
pub enum WriterWork {
    FileLoad(PendingItem),
    ErrorBatch { ids: Vec<u64>, lines: Vec<String> },
    Digest {
        id: u64,
        counts: DigestCounts,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    File,
    Telemetry,
}

impl WriterWork {
    pub fn kind(&self) -> WorkKind {
        match self {
            WriterWork::FileLoad(_) => WorkKind::File,
            WriterWork::ErrorBatch { .. } | WriterWork::Digest { .. } => WorkKind::Telemetry,
        }
    }
}

enum Connection {
    Unset,
    Ready(Box<dyn inflow_db::Sink>),
}

pub struct Writer {
    index: usize,
    connector: Arc<dyn SinkConnector>,
    settings: Arc<Settings>,
    connection: Connection,
    queue: VecDeque<WriterWork>,
    file_paused_until: Option<Instant>,
    telemetry_paused_until: Option<Instant>,
    dispatch_tx: mpsc::UnboundedSender<DispatchEvent>,
    mover_tx: mpsc::UnboundedSender<MoverCommand>,
    telemetry: Telemetry,
}

impl Writer {
    pub fn new(
        index: usize,
        connector: Arc<dyn SinkConnector>,
        settings: Arc<Settings>,
        dispatch_tx: mpsc::UnboundedSender<DispatchEvent>,
        mover_tx: mpsc::UnboundedSender<MoverCommand>,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            index,
            connector,
            settings,
            connection: Connection::Unset,
            queue: VecDeque::new(),
            file_paused_until: None,
            telemetry_paused_until: None,
            dispatch_tx,
            mover_tx,
            telemetry,
        }
    }

    pub fn push(&mut self, work: WriterWork) {
        self.queue.push_back(work);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.connection, Connection::Ready(_))
    }

    pub fn paused_until(&self, kind: WorkKind) -> Option<Instant> {
        match kind {
            WorkKind::File => self.file_paused_until,
            WorkKind::Telemetry => self.telemetry_paused_until,
        }
    }

    /// Take a new settings snapshot. A changed sink URL drops the connection and
    /// lifts any connect backoff.
    pub fn apply_settings(&mut self, settings: Arc<Settings>) {
        if settings.sink.url != self.settings.sink.url {
            self.connection = Connection::Unset;
            self.file_paused_until = None;
            self.telemetry_paused_until = None;
            let _ = self.dispatch_tx.send(DispatchEvent::Paused {
                worker: self.index,
                until: Instant::now(),
            });
            self.telemetry.debug(
                "sql",
                format!("worker #{}: sink settings changed, reconnect", self.index),
            );
        }
        self.settings = settings;
    }

    fn runnable(&self, work: &WriterWork, state: HoldState, now: Instant) -> bool {
        let kind = work.kind();
        if self.paused_until(kind).is_some_and(|until| until > now) {
            return false;
        }
        kind == WorkKind::Telemetry || state.is_running()
    }

    /// Process the first runnable item. Returns false when nothing could run.
    pub async fn process_next(&mut self, state: HoldState, now: Instant) -> bool {
        let Some(idx) = self
            .queue
            .iter()
            .position(|work| self.runnable(work, state, now))
        else {
            return false;
        };
        let Some(work) = self.queue.remove(idx) else {
            return false;
        };

        match work {
            WriterWork::FileLoad(item) => self.load_file(item, now).await,
            WriterWork::ErrorBatch { ids, lines } => self.store_errors(ids, lines, now).await,
            WriterWork::Digest {
                id,
                counts,
                message,
            } => self.store_digest(id, counts, message, now).await,
        }
        true
    }

    async fn connect(&mut self) -> Result<Binder, SinkError> {
        if let Connection::Ready(sink) = &self.connection {
            return Ok(Binder::for_database(sink.database_type()));
        }
        let sink = self
            .connector
            .connect(&self.settings.sink.url)
            .await
            .map_err(|e| match e {
                SinkError::Connect(_) => e,
                other => SinkError::on_connect(other),
            })?;
        let binder = Binder::for_database(sink.database_type());
        self.telemetry.trace(
            "sql",
            format!("worker #{}: connected ({})", self.index, sink.database_type()),
        );
        self.connection = Connection::Ready(sink);
        Ok(binder)
    }

    async fn execute(&mut self, statement: &str) -> Result<SinkResponse, SinkError> {
        let Connection::Ready(sink) = &mut self.connection else {
            return Err(SinkError::connect("sink connection is not established"));
        };
        let result = sink.execute(statement).await;
        if matches!(result, Err(SinkError::Connect(_))) {
            self.connection = Connection::Unset;
        }
        result
    }

    /// Arm the connect backoff for `kind` (both kinds with shared backoff).
    fn pause(&mut self, kind: WorkKind, error: &SinkError, now: Instant) {
        let until = now + CONNECT_BACKOFF;
        let shared = self.settings.sink.shared_backoff;
        if kind == WorkKind::Telemetry || shared {
            self.telemetry_paused_until = Some(until);
        }
        if kind == WorkKind::File || shared {
            self.file_paused_until = Some(until);
            let _ = self.dispatch_tx.send(DispatchEvent::Paused {
                worker: self.index,
                until,
            });
        }
        self.telemetry.error(
            "sql",
            format!(
                "worker #{}: {}, pause {} sec",
                self.index,
                error,
                CONNECT_BACKOFF.as_secs()
            ),
        );
    }

    fn report(&self, item: &PendingItem, outcome: LoadOutcome) {
        let _ = self.dispatch_tx.send(DispatchEvent::Result {
            worker: self.index,
            stamp: item.stamp.clone(),
            outcome,
        });
    }

    fn mover(&self, command: MoverCommand) {
        let _ = self.mover_tx.send(command);
    }

    async fn load_file(&mut self, item: PendingItem, now: Instant) {
        let path = item.stamp.path();

        match FileSignature::read(&path).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.telemetry
                    .trace("sql", format!("file \"{}\" is gone, skip", item.stamp));
                self.report(&item, LoadOutcome::Skipped);
                self.mover(MoverCommand::Forget {
                    stamp: item.stamp,
                    hold_until: None,
                });
                return;
            }
            Err(e) => {
                let message = format!("error check file \"{}\": {}", item.stamp, e);
                self.fail_file(&item, &message, None);
                return;
            }
            Ok(signature) if signature != item.signature => {
                self.telemetry.trace(
                    "sql",
                    format!("file \"{}\" changed after it was queued, rescan", item.stamp),
                );
                self.report(&item, LoadOutcome::Success);
                self.mover(MoverCommand::Forget {
                    stamp: item.stamp,
                    hold_until: None,
                });
                return;
            }
            Ok(_) => {}
        }

        let binder = match self.connect().await {
            Ok(binder) => binder,
            Err(e) => {
                self.queue.push_front(WriterWork::FileLoad(item));
                self.pause(WorkKind::File, &e, now);
                return;
            }
        };

        let payload = match transform(item.mode, &path).await {
            Ok(payload) => payload,
            Err(e) => {
                let message = format!("error load file \"{}\": {}", item.stamp, e);
                self.fail_file(&item, &message, None);
                return;
            }
        };

        let statement = compose(&binder.file(&item.stamp, &payload), &item.statement);
        match self.execute(&statement).await {
            Err(e @ SinkError::Connect(_)) => {
                self.queue.push_front(WriterWork::FileLoad(item));
                self.pause(WorkKind::File, &e, now);
            }
            Err(e) => {
                let message = format!("error load file \"{}\": {}", item.stamp, e);
                self.fail_file(&item, &message, Some(&statement));
            }
            Ok(response) => {
                self.report(&item, LoadOutcome::Success);
                match response.hold_seconds() {
                    Some(seconds) => {
                        let mut hold = Duration::from_secs(seconds);
                        if hold > MAX_HOLD {
                            warn!(
                                worker = self.index,
                                file = %item.stamp,
                                requested = seconds,
                                "hold_seconds clamped to {} sec",
                                MAX_HOLD.as_secs()
                            );
                            hold = MAX_HOLD;
                        }
                        self.telemetry.trace(
                            "sql",
                            format!(
                                "file \"{}\" loaded, sink asks to retry in {} sec",
                                item.stamp,
                                hold.as_secs()
                            ),
                        );
                        self.mover(MoverCommand::Forget {
                            stamp: item.stamp,
                            hold_until: Some(now.checked_add(hold).unwrap_or(now)),
                        });
                    }
                    None => {
                        self.telemetry
                            .trace("sql", format!("file \"{}\" loaded", item.stamp));
                        self.mover(MoverCommand::MoveFile {
                            stamp: item.stamp,
                            destination: item.success_path,
                        });
                    }
                }
            }
        }
    }

    /// Terminal failure: report it, leave a ticket and route the file to the
    /// error root (or delete it when none is configured).
    fn fail_file(&self, item: &PendingItem, message: &str, statement: Option<&str>) {
        self.report(item, LoadOutcome::Error);

        let mut text = message.to_string();
        if let Some(statement) = statement {
            text.push_str("\n\n");
            text.push_str(statement);
        }
        self.telemetry.error("sql", text.clone());

        if let Some(root) = &item.error_path {
            self.mover(MoverCommand::CreateFile {
                destination: root.clone(),
                file: format!("{}.ticket.txt", item.stamp.file),
                text,
            });
        }
        self.mover(MoverCommand::MoveFile {
            stamp: item.stamp.clone(),
            destination: item.error_path.clone(),
        });
    }

    /// Run a telemetry statement. Connect failures requeue the work.
    async fn store_telemetry(
        &mut self,
        work: WriterWork,
        ids: Vec<u64>,
        key: &str,
        bind: impl FnOnce(Binder) -> String,
        now: Instant,
    ) {
        let Some(template) = self.settings.sink.statement(key) else {
            debug!(key, "no statement for telemetry, batch dropped");
            self.telemetry.sink_ack(ids);
            return;
        };

        let binder = match self.connect().await {
            Ok(binder) => binder,
            Err(e) => {
                self.queue.push_front(work);
                self.pause(WorkKind::Telemetry, &e, now);
                return;
            }
        };

        let statement = compose(&bind(binder), &template);
        match self.execute(&statement).await {
            Err(e @ SinkError::Connect(_)) => {
                self.queue.push_front(work);
                self.pause(WorkKind::Telemetry, &e, now);
            }
            Err(e) => {
                self.telemetry.error_local(
                    "sql",
                    format!("worker #{}: error store \"{}\": {}\n\n{}", self.index, key, e, statement),
                );
                self.telemetry.sink_ack(ids);
            }
            Ok(_) => self.telemetry.sink_ack(ids),
        }
    }

    async fn store_errors(&mut self, ids: Vec<u64>, lines: Vec<String>, now: Instant) {
        let key = self.settings.sink.error_statement.clone();
        let preamble = |binder: Binder| binder.errors(&lines);
        let work = WriterWork::ErrorBatch {
            ids: ids.clone(),
            lines: lines.clone(),
        };
        self.store_telemetry(work, ids, &key, preamble, now).await;
    }

    async fn store_digest(&mut self, id: u64, counts: DigestCounts, message: String, now: Instant) {
        let key = self.settings.sink.digest_statement.clone();
        let preamble = |binder: Binder| binder.digest(counts, &message);
        let work = WriterWork::Digest {
            id,
            counts,
            message: message.clone(),
        };
        self.store_telemetry(work, vec![id], &key, preamble, now).await;
    }

    pub async fn run(
        mut self,
        mut work_rx: mpsc::UnboundedReceiver<WriterWork>,
        mut settings_rx: watch::Receiver<Arc<Settings>>,
        state_rx: watch::Receiver<HoldState>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(WRITER_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(work) = work_rx.recv() => self.push(work),
                Ok(()) = settings_rx.changed() => {
                    let settings = settings_rx.borrow_and_update().clone();
                    self.apply_settings(settings);
                }
                _ = ticker.tick() => {
                    while let Ok(work) = work_rx.try_recv() {
                        self.push(work);
                    }
                    loop {
                        if *shutdown.borrow() {
                            break;
                        }
                        let state = *state_rx.borrow();
                        if !self.process_next(state, Instant::now()).await {
                            break;
                        }
                    }
                }
            }
        }
        debug!(worker = self.index, queued = self.queue.len(), "writer stopped");
    }
}
