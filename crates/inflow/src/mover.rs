//! Filesystem side effects of finished loads.
//!
//! Writers never touch the filesystem beyond reading the file they load; they
//! queue [`MoverCommand`]s here instead. Commands run one at a time, in order,
//! so a ticket is always written before its file is moved. The mover also
//! tells the scanner when a file is done with, and prunes old dated folders.

use std::collections::{BTreeSet, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDate};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::config::{resolve_path, Settings};
use crate::scanner::ScannerCommand;
use crate::telemetry::Telemetry;
use crate::types::FileStamp;

pub const MOVER_TICK: Duration = Duration::from_millis(250);
pub const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);
/// How long a file that could be neither moved nor deleted is left alone.
pub const DELETE_RETRY: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoverCommand {
    /// Write `text` to `<destination>/<YYYYMMDD>/<file>`.
    CreateFile {
        destination: PathBuf,
        file: String,
        text: String,
    },
    /// Move to `<destination>/<YYYYMMDD>/`, or delete when there is no destination.
    MoveFile {
        stamp: FileStamp,
        destination: Option<PathBuf>,
    },
    /// Release the scanner's hold on the file, optionally not before `hold_until`.
    Forget {
        stamp: FileStamp,
        hold_until: Option<Instant>,
    },
}

pub fn dated_dir(root: &Path, date: NaiveDate) -> PathBuf {
    root.join(date.format("%Y%m%d").to_string())
}

/// Rename into `dir`, falling back to copy and remove across filesystems.
async fn move_into(source: &Path, dir: &Path, file: &str) -> io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let target = dir.join(file);
    if tokio::fs::rename(source, &target).await.is_ok() {
        return Ok(target);
    }
    tokio::fs::copy(source, &target).await?;
    tokio::fs::remove_file(source).await?;
    Ok(target)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RetentionRoot {
    root: PathBuf,
    days: u32,
}

pub struct Mover {
    app_dir: PathBuf,
    queue: VecDeque<MoverCommand>,
    retention: Vec<RetentionRoot>,
    scanner_tx: mpsc::UnboundedSender<ScannerCommand>,
    telemetry: Telemetry,
}

impl Mover {
    pub fn new(
        app_dir: impl Into<PathBuf>,
        scanner_tx: mpsc::UnboundedSender<ScannerCommand>,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            app_dir: app_dir.into(),
            queue: VecDeque::new(),
            retention: Vec::new(),
            scanner_tx,
            telemetry,
        }
    }

    /// Collect the success and error roots named by the scan entries.
    pub fn apply_settings(&mut self, settings: &Settings) {
        let mut success = BTreeSet::new();
        let mut error = BTreeSet::new();
        for entry in &settings.scan {
            success.extend(resolve_path(&self.app_dir, &entry.success_path));
            error.extend(resolve_path(&self.app_dir, &entry.error_path));
        }

        let mut retention: Vec<RetentionRoot> = success
            .into_iter()
            .map(|root| RetentionRoot {
                root,
                days: settings.log.success_life_days,
            })
            .collect();
        retention.extend(error.into_iter().map(|root| RetentionRoot {
            root,
            days: settings.log.error_life_days,
        }));
        self.retention = retention;
    }

    pub fn push(&mut self, command: MoverCommand) {
        self.queue.push_back(command);
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn scanner(&self, command: ScannerCommand) {
        let _ = self.scanner_tx.send(command);
    }

    /// Run the oldest command. Returns false when the queue is empty.
    pub async fn process_next(&mut self, today: NaiveDate, now: Instant) -> bool {
        let Some(command) = self.queue.pop_front() else {
            return false;
        };

        match command {
            MoverCommand::CreateFile {
                destination,
                file,
                text,
            } => {
                let dir = dated_dir(&destination, today);
                let path = dir.join(&file);
                let written = match tokio::fs::create_dir_all(&dir).await {
                    Ok(()) => tokio::fs::write(&path, text).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    self.telemetry.error(
                        "mover",
                        format!("error create file \"{}\": {}", path.display(), e),
                    );
                }
            }
            MoverCommand::MoveFile {
                stamp,
                destination: Some(root),
            } => {
                let dir = dated_dir(&root, today);
                match move_into(&stamp.path(), &dir, &stamp.file).await {
                    Ok(target) => {
                        self.telemetry.trace(
                            "mover",
                            format!("file \"{}\" moved to \"{}\"", stamp, target.display()),
                        );
                        self.scanner(ScannerCommand::Forget(stamp));
                    }
                    Err(e) => {
                        self.telemetry.error(
                            "mover",
                            format!(
                                "error move file \"{}\" to \"{}\": {}, the file will be deleted",
                                stamp,
                                dir.display(),
                                e
                            ),
                        );
                        self.queue.push_front(MoverCommand::MoveFile {
                            stamp,
                            destination: None,
                        });
                    }
                }
            }
            MoverCommand::MoveFile {
                stamp,
                destination: None,
            } => match tokio::fs::remove_file(stamp.path()).await {
                Ok(()) => {
                    self.telemetry
                        .trace("mover", format!("file \"{}\" deleted", stamp));
                    self.scanner(ScannerCommand::Forget(stamp));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    self.scanner(ScannerCommand::Forget(stamp));
                }
                Err(e) => {
                    self.telemetry
                        .error("mover", format!("error delete file \"{}\": {}", stamp, e));
                    self.scanner(ScannerCommand::Reschedule {
                        stamp,
                        until: now + DELETE_RETRY,
                    });
                }
            },
            MoverCommand::Forget {
                stamp,
                hold_until: Some(until),
            } => self.scanner(ScannerCommand::Reschedule { stamp, until }),
            MoverCommand::Forget {
                stamp,
                hold_until: None,
            } => self.scanner(ScannerCommand::Forget(stamp)),
        }
        true
    }

    /// Delete dated folders past their root's retention. Returns how many went.
    pub async fn purge(&self, today: NaiveDate) -> usize {
        let mut removed = 0;
        for RetentionRoot { root, days } in &self.retention {
            if *days == 0 {
                continue;
            }
            let Some(cutoff) = today.checked_sub_days(chrono::Days::new(u64::from(*days))) else {
                continue;
            };
            let mut entries = match tokio::fs::read_dir(root).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    self.telemetry.error(
                        "mover",
                        format!("error read folder \"{}\": {}", root.display(), e),
                    );
                    continue;
                }
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name();
                let Some(date) = name
                    .to_str()
                    .filter(|name| name.len() == 8)
                    .and_then(|name| NaiveDate::parse_from_str(name, "%Y%m%d").ok())
                else {
                    continue;
                };
                if date >= cutoff {
                    continue;
                }
                let path = entry.path();
                match tokio::fs::remove_dir_all(&path).await {
                    Ok(()) => {
                        removed += 1;
                        self.telemetry
                            .trace("mover", format!("old folder \"{}\" deleted", path.display()));
                    }
                    Err(e) => self.telemetry.error(
                        "mover",
                        format!("error delete folder \"{}\": {}", path.display(), e),
                    ),
                }
            }
        }
        removed
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<MoverCommand>,
        mut settings_rx: watch::Receiver<Arc<Settings>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let settings = settings_rx.borrow_and_update().clone();
        self.apply_settings(&settings);

        let mut ticker = tokio::time::interval(MOVER_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut retention = tokio::time::interval(RETENTION_INTERVAL);
        retention.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Some(command) = commands.recv() => self.push(command),
                Ok(()) = settings_rx.changed() => {
                    let settings = settings_rx.borrow_and_update().clone();
                    self.apply_settings(&settings);
                }
                _ = retention.tick() => {
                    let removed = self.purge(Local::now().date_naive()).await;
                    if removed > 0 {
                        debug!(removed, "retention purge");
                    }
                }
                _ = ticker.tick() => {
                    while let Ok(command) = commands.try_recv() {
                        self.push(command);
                    }
                    let today = Local::now().date_naive();
                    while self.process_next(today, Instant::now()).await {}
                }
            }
        }

        // Moves already decided are cheap; finish them so files are not
        // reloaded on the next start.
        while let Ok(command) = commands.try_recv() {
            self.push(command);
        }
        let today = Local::now().date_naive();
        while self.process_next(today, Instant::now()).await {}
        debug!("mover stopped");
    }
}
