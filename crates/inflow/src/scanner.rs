//! Stability scanner.
//!
//! Lists every watched directory once per tick and tracks each file matching a
//! mask. A file becomes ready after [`STABLE_SCANS`] consecutive sightings with
//! the same size and timestamps, and is then handed to the dispatcher exactly
//! once until the writer's outcome makes the mover forget or reschedule it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use globset::{Glob, GlobMatcher};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::calendar::HoldState;
use crate::config::{resolve_path, ScanEntry, Settings, StatementEntry};
use crate::dispatch::DispatchEvent;
use crate::telemetry::Telemetry;
use crate::types::{FileSignature, FileStamp, PendingItem};
use crate::writer::LoadMode;

/// Consecutive identical sightings needed before a file is ready.
pub const STABLE_SCANS: u32 = 3;

/// Sighting counts at which a submitted file is reported as stuck.
pub const STUCK_MARKS: [u32; 3] = [100, 1000, 10000];

/// Backoff after a watched directory could not be created.
pub const DIR_RETRY: Duration = Duration::from_secs(300);

pub const SCAN_TICK: Duration = Duration::from_secs(1);

/// Commands the scanner accepts from the rest of the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScannerCommand {
    /// Stop tracking; the next sighting starts over at count 1.
    Forget(FileStamp),
    /// Clear the ready mark and ignore the file until `until`.
    Reschedule { stamp: FileStamp, until: Instant },
}

/// One file mask inside a watched directory.
#[derive(Debug, Clone)]
pub struct ScanMask {
    pub pattern: String,
    matcher: GlobMatcher,
    pub mode: LoadMode,
    pub statement: Arc<str>,
    pub success_path: Option<PathBuf>,
    pub error_path: Option<PathBuf>,
}

impl ScanMask {
    pub fn is_match(&self, file_name: &str) -> bool {
        self.matcher.is_match(file_name)
    }
}

/// A watched directory and the masks that apply to it.
#[derive(Debug, Clone)]
pub struct ScanDir {
    pub dir: PathBuf,
    pub masks: Vec<ScanMask>,
    retry_after: Option<Instant>,
    failing: bool,
}

impl ScanDir {
    /// First mask matching `file_name`, in settings order.
    pub fn mask_for(&self, file_name: &str) -> Option<&ScanMask> {
        self.masks.iter().find(|m| m.is_match(file_name))
    }
}

fn build_mask(
    entry: &ScanEntry,
    settings: &Settings,
    app_dir: &Path,
) -> Result<(PathBuf, ScanMask), String> {
    let path = resolve_path(app_dir, &entry.mask)
        .ok_or_else(|| "scan entry has an empty mask".to_string())?;
    let pattern = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| format!("scan mask \"{}\" has no file pattern", entry.mask))?
        .to_string();
    let dir = path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| format!("scan mask \"{}\" has no directory", entry.mask))?;

    let mode: LoadMode = entry
        .mode
        .parse()
        .map_err(|e| format!("scan mask \"{}\": {}", entry.mask, e))?;
    let statement = settings.sink.statement(&entry.statement).ok_or_else(|| {
        format!(
            "scan mask \"{}\" refers to unknown statement \"{}\"",
            entry.mask, entry.statement
        )
    })?;
    let matcher = Glob::new(&pattern)
        .map_err(|e| format!("scan mask \"{}\": {}", entry.mask, e))?
        .compile_matcher();

    Ok((
        dir,
        ScanMask {
            pattern,
            matcher,
            mode,
            statement: Arc::from(statement),
            success_path: resolve_path(app_dir, &entry.success_path),
            error_path: resolve_path(app_dir, &entry.error_path),
        },
    ))
}

/// Resolve scan entries into watched directories. Invalid entries are dropped
/// and described in the returned messages.
pub fn build_scan_dirs(settings: &Settings, app_dir: &Path) -> (Vec<ScanDir>, Vec<String>) {
    let mut dirs: Vec<ScanDir> = Vec::new();
    let mut errors = Vec::new();

    for entry in &settings.scan {
        match build_mask(entry, settings, app_dir) {
            Ok((dir, mask)) => match dirs.iter_mut().find(|d| d.dir == dir) {
                Some(existing) => existing.masks.push(mask),
                None => dirs.push(ScanDir {
                    dir,
                    masks: vec![mask],
                    retry_after: None,
                    failing: false,
                }),
            },
            Err(message) => errors.push(message),
        }
    }
    (dirs, errors)
}

#[derive(Debug, Clone)]
struct Candidate {
    signature: FileSignature,
    count: u32,
    submitted_at: Option<Instant>,
    hold_until: Option<Instant>,
}

/// Per-file stability bookkeeping.
#[derive(Debug, Default)]
pub struct Tracker {
    candidates: HashMap<FileStamp, Candidate>,
}

/// What a sighting did to a candidate.
#[derive(Debug)]
pub enum Sighting {
    Ignored,
    Counted(u32),
    /// Submitted and seen again this many times.
    Stuck(u32),
    Ready(PendingItem),
}

impl Tracker {
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn count(&self, stamp: &FileStamp) -> Option<u32> {
        self.candidates.get(stamp).map(|c| c.count)
    }

    pub fn is_submitted(&self, stamp: &FileStamp) -> bool {
        self.candidates
            .get(stamp)
            .is_some_and(|c| c.submitted_at.is_some())
    }

    /// Record one sighting of `stamp` with `signature`.
    pub fn observe(
        &mut self,
        stamp: &FileStamp,
        signature: FileSignature,
        mask: &ScanMask,
        state: HoldState,
        now: Instant,
    ) -> Sighting {
        let Some(candidate) = self.candidates.get_mut(stamp) else {
            if !state.is_running() {
                return Sighting::Ignored;
            }
            self.candidates.insert(
                stamp.clone(),
                Candidate {
                    signature,
                    count: 1,
                    submitted_at: None,
                    hold_until: None,
                },
            );
            return Sighting::Counted(1);
        };

        if candidate.submitted_at.is_some() {
            if candidate.signature == signature {
                candidate.count = candidate.count.saturating_add(1);
                if STUCK_MARKS.contains(&candidate.count) {
                    return Sighting::Stuck(candidate.count);
                }
            }
            return Sighting::Ignored;
        }

        let held = candidate.hold_until.is_some_and(|until| until > now);
        if candidate.signature != signature {
            candidate.signature = signature;
            candidate.count = 1;
        } else if !held {
            candidate.count = candidate.count.saturating_add(1);
        }

        if candidate.count >= STABLE_SCANS && state.is_running() && !held {
            candidate.submitted_at = Some(now);
            candidate.hold_until = None;
            return Sighting::Ready(PendingItem {
                stamp: stamp.clone(),
                signature: candidate.signature,
                mode: mask.mode,
                statement: Arc::clone(&mask.statement),
                success_path: mask.success_path.clone(),
                error_path: mask.error_path.clone(),
            });
        }
        Sighting::Counted(candidate.count)
    }

    pub fn forget(&mut self, stamp: &FileStamp) -> bool {
        self.candidates.remove(stamp).is_some()
    }

    /// Returns false when the file is not tracked.
    pub fn reschedule(&mut self, stamp: &FileStamp, until: Instant) -> bool {
        match self.candidates.get_mut(stamp) {
            Some(candidate) => {
                candidate.submitted_at = None;
                candidate.hold_until = Some(until);
                true
            }
            None => false,
        }
    }

    /// Keep only candidates the rest of the pipeline still refers to.
    fn retain_owned(&mut self) {
        self.candidates
            .retain(|_, c| c.submitted_at.is_some() || c.hold_until.is_some());
    }
}

pub struct Scanner {
    app_dir: PathBuf,
    dirs: Vec<ScanDir>,
    applied: Option<(Vec<ScanEntry>, Vec<StatementEntry>)>,
    tracker: Tracker,
    telemetry: Telemetry,
}

impl Scanner {
    pub fn new(app_dir: PathBuf, telemetry: Telemetry) -> Self {
        Self {
            app_dir,
            dirs: Vec::new(),
            applied: None,
            tracker: Tracker::default(),
            telemetry,
        }
    }

    pub fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    pub fn dirs(&self) -> &[ScanDir] {
        &self.dirs
    }

    /// Rebuild the watched directories when the scan table or statements changed.
    pub fn apply_settings(&mut self, settings: &Settings) {
        let key = (settings.scan.clone(), settings.sink.statements.clone());
        if self.applied.as_ref() == Some(&key) {
            return;
        }
        let (dirs, errors) = build_scan_dirs(settings, &self.app_dir);
        for error in errors {
            self.telemetry.error("scan", error);
        }
        if self.applied.is_some() {
            self.tracker.retain_owned();
        }
        let masks: usize = dirs.iter().map(|d| d.masks.len()).sum();
        self.telemetry.debug(
            "scan",
            format!("watching {} folder(s) with {} mask(s)", dirs.len(), masks),
        );
        self.dirs = dirs;
        self.applied = Some(key);
    }

    pub fn handle_command(&mut self, command: ScannerCommand) {
        match command {
            ScannerCommand::Forget(stamp) => {
                self.tracker.forget(&stamp);
            }
            ScannerCommand::Reschedule { stamp, until } => {
                if !self.tracker.reschedule(&stamp, until) {
                    debug!(file = %stamp, "reschedule for untracked file ignored");
                }
            }
        }
    }

    /// One pass over every watched directory. Returns the files that became ready.
    pub async fn scan(&mut self, state: HoldState, now: Instant) -> Vec<PendingItem> {
        let mut ready = Vec::new();
        if state == HoldState::Stop {
            return ready;
        }

        for dir in self.dirs.iter_mut() {
            if dir.retry_after.is_some_and(|at| at > now) {
                continue;
            }
            if let Err(e) = tokio::fs::create_dir_all(&dir.dir).await {
                if !dir.failing {
                    self.telemetry.error(
                        "scan",
                        format!("error create folder \"{}\": {}", dir.dir.display(), e),
                    );
                }
                dir.failing = true;
                dir.retry_after = Some(now + DIR_RETRY);
                continue;
            }
            if dir.failing {
                self.telemetry
                    .debug("scan", format!("folder \"{}\" is available again", dir.dir.display()));
                dir.failing = false;
            }
            dir.retry_after = None;

            let mut entries = match tokio::fs::read_dir(&dir.dir).await {
                Ok(entries) => entries,
                Err(e) => {
                    self.telemetry.error(
                        "scan",
                        format!("error read folder \"{}\": {}", dir.dir.display(), e),
                    );
                    continue;
                }
            };

            loop {
                let entry = match entries.next_entry().await {
                    Ok(Some(entry)) => entry,
                    Ok(None) => break,
                    Err(e) => {
                        self.telemetry.error(
                            "scan",
                            format!("error read folder \"{}\": {}", dir.dir.display(), e),
                        );
                        break;
                    }
                };
                let Ok(name) = entry.file_name().into_string() else {
                    continue;
                };
                let meta = match entry.metadata().await {
                    Ok(meta) if meta.is_file() => meta,
                    Ok(_) => continue,
                    // Removed between listing and stat.
                    Err(_) => continue,
                };
                let Some(mask) = dir.mask_for(&name) else {
                    self.telemetry.trace(
                        "scan",
                        format!("file \"{}\" matches no mask in \"{}\"", name, dir.dir.display()),
                    );
                    continue;
                };

                let stamp = FileStamp::new(&dir.dir, name);
                let signature = FileSignature::from_metadata(&meta);
                match self.tracker.observe(&stamp, signature, mask, state, now) {
                    Sighting::Ready(item) => {
                        self.telemetry
                            .trace("scan", format!("file \"{}\" is ready ({})", stamp, mask.mode));
                        ready.push(item);
                    }
                    Sighting::Stuck(count) => self.telemetry.trace(
                        "scan",
                        format!("file \"{}\" waits in buffer, seen {} times", stamp, count),
                    ),
                    Sighting::Counted(_) | Sighting::Ignored => {}
                }
            }
        }
        ready
    }

    pub async fn run(
        mut self,
        mut settings_rx: watch::Receiver<Arc<Settings>>,
        state_rx: watch::Receiver<HoldState>,
        mut commands: mpsc::UnboundedReceiver<ScannerCommand>,
        dispatch_tx: mpsc::UnboundedSender<DispatchEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let settings = settings_rx.borrow_and_update().clone();
        self.apply_settings(&settings);

        let mut ticker = tokio::time::interval(SCAN_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(command) = commands.recv() => self.handle_command(command),
                Ok(()) = settings_rx.changed() => {
                    let settings = settings_rx.borrow_and_update().clone();
                    self.apply_settings(&settings);
                }
                _ = ticker.tick() => {
                    // Apply commands that arrived during the previous pass first.
                    while let Ok(command) = commands.try_recv() {
                        self.handle_command(command);
                    }
                    let state = *state_rx.borrow();
                    for item in self.scan(state, Instant::now()).await {
                        if dispatch_tx.send(DispatchEvent::Ready(item)).is_err() {
                            break;
                        }
                    }
                }
            }
        }
        debug!(tracked = self.tracker.len(), "scanner stopped");
    }
}
