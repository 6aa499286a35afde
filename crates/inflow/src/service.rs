//! Actor wiring.
//!
//! Every stage runs as its own tokio task. Stages talk over unbounded mpsc
//! channels; settings snapshots and the calendar state are broadcast through
//! `watch` channels, and one more `watch<bool>` tells every loop to exit.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use inflow_db::SinkConnector;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::calendar::{CalendarActor, HoldState};
use crate::config::{ConfigWatcher, Settings, CONFIG_FILE_NAME};
use crate::dispatch::DispatchActor;
use crate::mover::Mover;
use crate::scanner::Scanner;
use crate::telemetry::{Telemetry, TelemetryAggregator};
use crate::writer::Writer;

/// Time the binary leaves the actors after a `Stop` before shutting down, so
/// queued telemetry can still reach the sink.
pub const STOP_GRACE: Duration = Duration::from_secs(10);

pub struct Service;

impl Service {
    /// Spawn every actor on the current runtime.
    ///
    /// The worker count is taken from `settings` once; the rest of the settings
    /// follow `<app_dir>/inflow.toml` while the service runs.
    pub fn start(
        app_dir: PathBuf,
        mut settings: Settings,
        connector: Arc<dyn SinkConnector>,
    ) -> ServiceHandle {
        for note in settings.sink.normalize() {
            warn!("{}", note);
        }
        let settings = Arc::new(settings);
        let (telemetry, telemetry_rx) = Telemetry::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (watcher, settings_rx) = ConfigWatcher::new(
            app_dir.join(CONFIG_FILE_NAME),
            settings.clone(),
            telemetry.clone(),
        );
        let (calendar, state_rx) = CalendarActor::new(settings_rx.clone(), telemetry.clone());

        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (scanner_tx, scanner_rx) = mpsc::unbounded_channel();
        let (mover_tx, mover_rx) = mpsc::unbounded_channel();

        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        let worker_count = settings.sink.workers;
        let mut worker_txs = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let (work_tx, work_rx) = mpsc::unbounded_channel();
            worker_txs.push(work_tx);
            let writer = Writer::new(
                index,
                connector.clone(),
                settings.clone(),
                dispatch_tx.clone(),
                mover_tx.clone(),
                telemetry.clone(),
            );
            tasks.push((
                "writer",
                tokio::spawn(writer.run(
                    work_rx,
                    settings_rx.clone(),
                    state_rx.clone(),
                    shutdown_rx.clone(),
                )),
            ));
        }

        let dispatcher = DispatchActor::new(
            worker_txs,
            settings.sink.max_streams,
            scanner_tx.clone(),
            telemetry.clone(),
        );
        tasks.push((
            "dispatch",
            tokio::spawn(dispatcher.run(
                dispatch_rx,
                settings_rx.clone(),
                state_rx.clone(),
                shutdown_rx.clone(),
            )),
        ));

        let scanner = Scanner::new(app_dir.clone(), telemetry.clone());
        tasks.push((
            "scanner",
            tokio::spawn(scanner.run(
                settings_rx.clone(),
                state_rx.clone(),
                scanner_rx,
                dispatch_tx.clone(),
                shutdown_rx.clone(),
            )),
        ));

        let mover = Mover::new(app_dir.clone(), scanner_tx, telemetry.clone());
        tasks.push((
            "mover",
            tokio::spawn(mover.run(mover_rx, settings_rx.clone(), shutdown_rx.clone())),
        ));

        let aggregator = TelemetryAggregator::new(app_dir, settings.clone(), dispatch_tx);
        tasks.push((
            "telemetry",
            tokio::spawn(aggregator.run(
                telemetry_rx,
                settings_rx.clone(),
                state_rx.clone(),
                shutdown_rx.clone(),
            )),
        ));

        tasks.push(("calendar", tokio::spawn(calendar.run(shutdown_rx.clone()))));
        tasks.push(("config", tokio::spawn(watcher.run(shutdown_rx))));

        info!(
            workers = worker_count,
            max_streams = settings.sink.max_streams,
            "service started"
        );
        telemetry.debug(
            "service",
            format!("service started with {} worker(s)", worker_count),
        );

        ServiceHandle {
            shutdown_tx,
            state_rx,
            settings_rx,
            telemetry,
            tasks,
        }
    }
}

/// Control handle for a running [`Service`].
pub struct ServiceHandle {
    shutdown_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<HoldState>,
    settings_rx: watch::Receiver<Arc<Settings>>,
    telemetry: Telemetry,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl ServiceHandle {
    pub fn hold_state(&self) -> HoldState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<HoldState> {
        self.state_rx.clone()
    }

    /// Latest settings snapshot.
    pub fn settings(&self) -> Arc<Settings> {
        self.settings_rx.borrow().clone()
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Resolves once the calendar announces [`HoldState::Stop`].
    pub async fn wait_for_stop(&mut self) {
        loop {
            if *self.state_rx.borrow_and_update() == HoldState::Stop {
                return;
            }
            if self.state_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Signal every actor to exit and wait up to `timeout` for them.
    ///
    /// Returns how many tasks had to be aborted.
    pub async fn shutdown(self, timeout: Duration) -> usize {
        let _ = self.shutdown_tx.send(true);
        let deadline = tokio::time::Instant::now() + timeout;
        let mut aborted = 0;

        for (name, mut task) in self.tasks {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = name, error = %e, "actor task failed"),
                Err(_) => {
                    warn!(task = name, "actor did not stop in time, aborting");
                    task.abort();
                    aborted += 1;
                }
            }
        }
        info!(aborted, "service stopped");
        aborted
    }
}
