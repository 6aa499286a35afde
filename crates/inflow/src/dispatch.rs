//! Dispatch scheduler.
//!
//! Ready files wait in one FIFO. While the service is running and fewer than
//! `max_streams` files are in flight, the head item goes to the least loaded
//! writer that is not paused. Holding the service drains the FIFO and tells the
//! scanner to forget the drained files so they are rediscovered after resume.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::calendar::HoldState;
use crate::config::Settings;
use crate::scanner::ScannerCommand;
use crate::telemetry::Telemetry;
use crate::types::{DigestCounts, FileStamp, PendingItem};
use crate::writer::WriterWork;

pub const ACTIVE_TICK: Duration = Duration::from_millis(200);
pub const IDLE_TICK: Duration = Duration::from_secs(1);
pub const TRACE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Success,
    Error,
    /// The file vanished before it was loaded; frees the slot without counting.
    Skipped,
}

/// Everything the dispatcher reacts to.
#[derive(Debug)]
pub enum DispatchEvent {
    Ready(PendingItem),
    Result {
        worker: usize,
        stamp: FileStamp,
        outcome: LoadOutcome,
    },
    /// A writer hit a connect failure and takes no new files until `until`.
    Paused { worker: usize, until: Instant },
    Telemetry(WriterWork),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub success: u64,
    pub error: u64,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerSlot {
    pub in_flight: usize,
    pub paused_until: Option<Instant>,
    trace: Counters,
    digest: Counters,
}

impl WorkerSlot {
    fn available(&self, now: Instant) -> bool {
        self.paused_until.map_or(true, |until| until <= now)
    }
}

#[derive(Debug)]
pub struct Dispatcher {
    pending: VecDeque<PendingItem>,
    slots: Vec<WorkerSlot>,
    max_streams: usize,
}

impl Dispatcher {
    pub fn new(workers: usize, max_streams: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            slots: vec![WorkerSlot::default(); workers.max(1)],
            max_streams,
        }
    }

    pub fn set_max_streams(&mut self, max_streams: usize) {
        self.max_streams = max_streams;
    }

    pub fn enqueue(&mut self, item: PendingItem) {
        self.pending.push_back(item);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn slots(&self) -> &[WorkerSlot] {
        &self.slots
    }

    pub fn total_in_flight(&self) -> usize {
        self.slots.iter().map(|s| s.in_flight).sum()
    }

    /// Least loaded available worker; ties go to the lowest index.
    pub fn pick_worker(&self, now: Instant) -> Option<usize> {
        let mut best: Option<(usize, usize)> = None;
        for (idx, slot) in self.slots.iter().enumerate() {
            if !slot.available(now) {
                continue;
            }
            if slot.in_flight == 0 {
                return Some(idx);
            }
            if best.map_or(true, |(_, load)| slot.in_flight < load) {
                best = Some((idx, slot.in_flight));
            }
        }
        best.map(|(idx, _)| idx)
    }

    /// Hand out as many pending items as the ceiling allows.
    pub fn assign(&mut self, state: HoldState, now: Instant) -> Vec<(usize, PendingItem)> {
        let mut assigned = Vec::new();
        if !state.is_running() {
            return assigned;
        }
        while !self.pending.is_empty() && self.total_in_flight() < self.max_streams {
            let Some(worker) = self.pick_worker(now) else {
                break;
            };
            let Some(item) = self.pending.pop_front() else {
                break;
            };
            self.slots[worker].in_flight += 1;
            assigned.push((worker, item));
        }
        assigned
    }

    pub fn drain(&mut self) -> Vec<PendingItem> {
        self.pending.drain(..).collect()
    }

    pub fn on_result(&mut self, worker: usize, outcome: LoadOutcome) {
        let Some(slot) = self.slots.get_mut(worker) else {
            return;
        };
        slot.in_flight = slot.in_flight.saturating_sub(1);
        match outcome {
            LoadOutcome::Success => {
                slot.trace.success += 1;
                slot.digest.success += 1;
            }
            LoadOutcome::Error => {
                slot.trace.error += 1;
                slot.digest.error += 1;
            }
            LoadOutcome::Skipped => {}
        }
    }

    pub fn on_paused(&mut self, worker: usize, until: Instant) {
        if let Some(slot) = self.slots.get_mut(worker) {
            slot.paused_until = Some(until);
        }
    }

    /// Writer that should flush a telemetry batch. Falls back to the least
    /// loaded writer when every one is paused.
    pub fn telemetry_target(&self, now: Instant) -> usize {
        self.pick_worker(now).unwrap_or_else(|| {
            self.slots
                .iter()
                .enumerate()
                .min_by_key(|(_, slot)| slot.in_flight)
                .map_or(0, |(idx, _)| idx)
        })
    }

    pub fn take_trace_counters(&mut self) -> Vec<Counters> {
        self.slots
            .iter_mut()
            .map(|slot| std::mem::take(&mut slot.trace))
            .collect()
    }

    /// Counters since the previous digest plus the current queue depth.
    pub fn take_digest(&mut self) -> DigestCounts {
        let mut counts = DigestCounts {
            queue: (self.pending.len() + self.total_in_flight()) as u64,
            ..DigestCounts::default()
        };
        for slot in self.slots.iter_mut() {
            let taken = std::mem::take(&mut slot.digest);
            counts.success += taken.success;
            counts.error += taken.error;
        }
        counts
    }
}

pub struct DispatchActor {
    dispatcher: Dispatcher,
    workers: Vec<mpsc::UnboundedSender<WriterWork>>,
    scanner_tx: mpsc::UnboundedSender<ScannerCommand>,
    telemetry: Telemetry,
}

impl DispatchActor {
    pub fn new(
        workers: Vec<mpsc::UnboundedSender<WriterWork>>,
        max_streams: usize,
        scanner_tx: mpsc::UnboundedSender<ScannerCommand>,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            dispatcher: Dispatcher::new(workers.len(), max_streams),
            workers,
            scanner_tx,
            telemetry,
        }
    }

    fn handle(&mut self, event: DispatchEvent) {
        match event {
            DispatchEvent::Ready(item) => self.dispatcher.enqueue(item),
            DispatchEvent::Result {
                worker,
                stamp,
                outcome,
            } => {
                debug!(worker, file = %stamp, ?outcome, "load result");
                self.dispatcher.on_result(worker, outcome);
            }
            DispatchEvent::Paused { worker, until } => {
                self.dispatcher.on_paused(worker, until);
            }
            DispatchEvent::Telemetry(work) => {
                let target = self.dispatcher.telemetry_target(Instant::now());
                if let Some(tx) = self.workers.get(target) {
                    let _ = tx.send(work);
                }
            }
        }
    }

    fn tick(&mut self, state: HoldState) {
        if !state.is_running() {
            let drained = self.dispatcher.drain();
            if !drained.is_empty() {
                self.telemetry.trace(
                    "dispatch",
                    format!("service is \"{}\", {} queued file(s) returned to scan", state, drained.len()),
                );
            }
            for item in drained {
                let _ = self.scanner_tx.send(ScannerCommand::Forget(item.stamp));
            }
            return;
        }

        for (worker, item) in self.dispatcher.assign(state, Instant::now()) {
            let stamp = item.stamp.clone();
            if self.workers[worker].send(WriterWork::FileLoad(item)).is_err() {
                // Writer gone: release the slot and let the scanner retry.
                self.dispatcher.on_result(worker, LoadOutcome::Skipped);
                let _ = self.scanner_tx.send(ScannerCommand::Forget(stamp));
            }
        }
    }

    fn report_workers(&mut self) {
        let in_flight: Vec<usize> = self.dispatcher.slots().iter().map(|s| s.in_flight).collect();
        for (idx, counters) in self.dispatcher.take_trace_counters().into_iter().enumerate() {
            if counters == Counters::default() && in_flight[idx] == 0 {
                continue;
            }
            self.telemetry.trace(
                "dispatch",
                format!(
                    "worker #{}: success {}, error {}, in flight {}",
                    idx, counters.success, counters.error, in_flight[idx]
                ),
            );
        }
    }

    fn next_delay(&self) -> Duration {
        if self.dispatcher.pending_len() == 0 {
            IDLE_TICK
        } else {
            ACTIVE_TICK
        }
    }

    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<DispatchEvent>,
        mut settings_rx: watch::Receiver<Arc<Settings>>,
        mut state_rx: watch::Receiver<HoldState>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut digest_every = settings_rx.borrow_and_update().sink.digest_interval();
        let mut digest_tick = tokio::time::interval_at(
            tokio::time::Instant::now() + digest_every,
            digest_every,
        );
        let mut trace_tick =
            tokio::time::interval_at(tokio::time::Instant::now() + TRACE_INTERVAL, TRACE_INTERVAL);
        let assign_sleep = tokio::time::sleep(ACTIVE_TICK);
        tokio::pin!(assign_sleep);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(event) = events.recv() => {
                    let was_idle = self.dispatcher.pending_len() == 0;
                    self.handle(event);
                    if was_idle && self.dispatcher.pending_len() > 0 {
                        let soon = tokio::time::Instant::now() + ACTIVE_TICK;
                        if assign_sleep.deadline() > soon {
                            assign_sleep.as_mut().reset(soon);
                        }
                    }
                }
                Ok(()) = state_rx.changed() => {
                    let state = *state_rx.borrow_and_update();
                    if !state.is_running() {
                        self.tick(state);
                    }
                }
                Ok(()) = settings_rx.changed() => {
                    let settings = settings_rx.borrow_and_update().clone();
                    self.dispatcher.set_max_streams(settings.sink.max_streams);
                    let every = settings.sink.digest_interval();
                    if every != digest_every {
                        digest_every = every;
                        digest_tick = tokio::time::interval_at(
                            tokio::time::Instant::now() + every,
                            every,
                        );
                    }
                }
                _ = &mut assign_sleep => {
                    let state = *state_rx.borrow();
                    self.tick(state);
                    assign_sleep
                        .as_mut()
                        .reset(tokio::time::Instant::now() + self.next_delay());
                }
                _ = trace_tick.tick() => self.report_workers(),
                _ = digest_tick.tick() => {
                    let counts = self.dispatcher.take_digest();
                    self.telemetry.digest(counts);
                }
            }
        }
        debug!(
            pending = self.dispatcher.pending_len(),
            in_flight = self.dispatcher.total_in_flight(),
            "dispatcher stopped"
        );
    }
}
