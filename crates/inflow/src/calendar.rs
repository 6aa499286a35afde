//! Hold/pause/stop calendar.
//!
//! [`Calendar`] turns the weekly schedule from `[service]` into a [`HoldState`]
//! for a given wall-clock time. [`CalendarActor`] evaluates it every 500ms and
//! publishes the result on a `watch` channel that the other actors read.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Local, NaiveDateTime, NaiveTime, Timelike, Weekday};
use tokio::sync::watch;
use tracing::debug;

use crate::config::{weekday_name, ServiceSettings, Settings, WEEK};
use crate::telemetry::Telemetry;

/// Fixed delay between entering stop-prepare and stopping. Cannot be cancelled.
pub const STOP_FUSE_MINUTES: i64 = 5;

/// Longest allowed pause window.
pub const MAX_PAUSE_MINUTES: i64 = 1440;

pub const CALENDAR_TICK: Duration = Duration::from_millis(500);

/// Operational state, highest precedence first: stop, stop-prepare, automatic
/// hold, manual hold, running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HoldState {
    #[default]
    Running,
    HoldManual,
    HoldAuto,
    StopPrepare,
    Stop,
}

impl HoldState {
    pub fn is_running(self) -> bool {
        self == HoldState::Running
    }

    pub fn is_stopping(self) -> bool {
        matches!(self, HoldState::StopPrepare | HoldState::Stop)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HoldState::Running => "running",
            HoldState::HoldManual => "holdManual",
            HoldState::HoldAuto => "holdAuto",
            HoldState::StopPrepare => "stopPrepare",
            HoldState::Stop => "stop",
        }
    }
}

impl fmt::Display for HoldState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a strict `HH:MM` time of day: exactly two hour and two minute digits.
pub fn parse_time_of_day(raw: &str) -> Option<NaiveTime> {
    let (hour, minute) = raw.trim().split_once(':')?;
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(hour) || hour.len() != 2 || !digits(minute) || minute.len() != 2 {
        return None;
    }
    let hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// A pause rule as configured for one weekday.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PauseEntry {
    start: NaiveTime,
    minutes: i64,
}

/// One weekday's share of a pause rule. A missing start means the window began
/// the previous day; a missing end means it runs past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PauseWindow {
    weekday: Weekday,
    start: Option<NaiveTime>,
    end: Option<NaiveTime>,
}

impl PauseWindow {
    fn contains(&self, time: NaiveTime) -> bool {
        match (self.start, self.end) {
            (Some(start), Some(end)) => start <= time && time < end,
            (Some(start), None) => start <= time,
            (None, Some(end)) => time < end,
            (None, None) => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct Calendar {
    stops: HashMap<Weekday, NaiveTime>,
    pauses: HashMap<Weekday, PauseEntry>,
    windows: Vec<PauseWindow>,
    manual: bool,
    applied: Option<ServiceSettings>,
    /// Armed stop fuse.
    stop_at: Option<NaiveDateTime>,
}

impl Calendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a schedule and return warnings for the entries that were rejected.
    ///
    /// A rejected entry keeps that weekday's previous rule. Nothing changes once
    /// the stop fuse is armed, or when the schedule equals the one applied last.
    pub fn set_schedule(&mut self, service: &ServiceSettings) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.stop_at.is_some() || self.applied.as_ref() == Some(service) {
            return warnings;
        }

        self.manual = service.hold;

        for day in WEEK {
            let Some(raw) = service.stop.get(day) else {
                self.stops.remove(&day);
                continue;
            };
            if raw.trim().is_empty() {
                self.stops.remove(&day);
                continue;
            }
            match parse_time_of_day(raw) {
                Some(time) => {
                    self.stops.insert(day, time);
                }
                None => warnings.push(format!(
                    "setting has bad param \"service.stop.{}\" = \"{}\"",
                    weekday_name(day),
                    raw
                )),
            }
        }

        for day in WEEK {
            let Some(rule) = service.pause.get(day) else {
                self.pauses.remove(&day);
                continue;
            };
            if rule.time.trim().is_empty() || rule.duration <= 0 {
                self.pauses.remove(&day);
                continue;
            }
            if rule.duration > MAX_PAUSE_MINUTES {
                warnings.push(format!(
                    "setting has bad param \"service.pause.{}.duration\" = \"{}\"",
                    weekday_name(day),
                    rule.duration
                ));
                continue;
            }
            match parse_time_of_day(&rule.time) {
                Some(start) => {
                    self.pauses.insert(
                        day,
                        PauseEntry {
                            start,
                            minutes: rule.duration,
                        },
                    );
                }
                None => warnings.push(format!(
                    "setting has bad param \"service.pause.{}.time\" = \"{}\"",
                    weekday_name(day),
                    rule.time
                )),
            }
        }

        self.windows = build_windows(&self.pauses);
        self.applied = Some(service.clone());
        warnings
    }

    /// Compute the state at `now`, arming the stop fuse when a stop time is near.
    pub fn evaluate(&mut self, now: NaiveDateTime) -> HoldState {
        if let Some(stop_at) = self.stop_at {
            return if now >= stop_at {
                HoldState::Stop
            } else {
                HoldState::StopPrepare
            };
        }

        if let Some(stop_time) = self.stops.get(&now.weekday()) {
            let until_stop = now.date().and_time(*stop_time) - now;
            if until_stop > chrono::Duration::zero()
                && until_stop < chrono::Duration::minutes(STOP_FUSE_MINUTES)
            {
                self.stop_at = Some(now + chrono::Duration::minutes(STOP_FUSE_MINUTES));
                return HoldState::StopPrepare;
            }
        }

        let weekday = now.weekday();
        let time = now.time();
        if self
            .windows
            .iter()
            .any(|w| w.weekday == weekday && w.contains(time))
        {
            return HoldState::HoldAuto;
        }

        if self.manual {
            HoldState::HoldManual
        } else {
            HoldState::Running
        }
    }

    /// When the armed fuse fires, if any.
    pub fn stop_at(&self) -> Option<NaiveDateTime> {
        self.stop_at
    }
}

fn build_windows(pauses: &HashMap<Weekday, PauseEntry>) -> Vec<PauseWindow> {
    let mut windows = Vec::new();
    for day in WEEK {
        let Some(entry) = pauses.get(&day) else {
            continue;
        };
        let start_minutes = i64::from(entry.start.hour() * 60 + entry.start.minute());
        let end_minutes = start_minutes + entry.minutes;
        if end_minutes < MAX_PAUSE_MINUTES {
            windows.push(PauseWindow {
                weekday: day,
                start: Some(entry.start),
                end: time_from_minutes(end_minutes),
            });
        } else {
            windows.push(PauseWindow {
                weekday: day,
                start: Some(entry.start),
                end: None,
            });
            windows.push(PauseWindow {
                weekday: day.succ(),
                start: None,
                end: time_from_minutes(end_minutes - MAX_PAUSE_MINUTES),
            });
        }
    }
    windows
}

fn time_from_minutes(minutes: i64) -> Option<NaiveTime> {
    let minutes = u32::try_from(minutes).ok()?;
    NaiveTime::from_hms_opt(minutes / 60, minutes % 60, 0)
}

/// Drives a [`Calendar`] from the wall clock and publishes state changes.
pub struct CalendarActor {
    calendar: Calendar,
    settings_rx: watch::Receiver<Arc<Settings>>,
    state_tx: watch::Sender<HoldState>,
    telemetry: Telemetry,
    announced: Option<HoldState>,
}

impl CalendarActor {
    pub fn new(
        settings_rx: watch::Receiver<Arc<Settings>>,
        telemetry: Telemetry,
    ) -> (Self, watch::Receiver<HoldState>) {
        let (state_tx, state_rx) = watch::channel(HoldState::Running);
        let actor = Self {
            calendar: Calendar::new(),
            settings_rx,
            state_tx,
            telemetry,
            announced: None,
        };
        (actor, state_rx)
    }

    fn apply_settings(&mut self) {
        let settings = self.settings_rx.borrow_and_update().clone();
        for warning in self.calendar.set_schedule(&settings.service) {
            self.telemetry.error("hold", warning);
        }
    }

    /// Evaluate once and publish. Stop is re-published on every tick so that a
    /// subscriber that missed it still shuts down.
    pub fn tick(&mut self, now: NaiveDateTime) -> HoldState {
        let state = self.calendar.evaluate(now);
        let changed = self.announced != Some(state);
        if changed || state == HoldState::Stop {
            self.state_tx.send_replace(state);
        }
        if changed {
            match (state, self.calendar.stop_at()) {
                (HoldState::StopPrepare, Some(at)) => self.telemetry.debug(
                    "hold",
                    format!("service state \"{}\", stop at {}", state, at.format("%H:%M:%S")),
                ),
                _ => self
                    .telemetry
                    .debug("hold", format!("service state \"{}\"", state)),
            }
            self.announced = Some(state);
        }
        state
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.apply_settings();
        let mut ticker = tokio::time::interval(CALENDAR_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                Ok(()) = self.settings_rx.changed() => self.apply_settings(),
                _ = ticker.tick() => {
                    self.tick(Local::now().naive_local());
                }
            }
        }
        debug!("calendar stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PauseRule, WeekSchedule};
    use chrono::NaiveDate;

    /// 2025-03-02 is a Sunday.
    fn at(day_offset: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 2 + day_offset)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn service() -> ServiceSettings {
        ServiceSettings {
            hold: false,
            stop: WeekSchedule::default(),
            pause: WeekSchedule::default(),
        }
    }

    fn pause(time: &str, duration: i64) -> Option<PauseRule> {
        Some(PauseRule {
            time: time.into(),
            duration,
        })
    }

    #[test]
    fn test_parse_time_of_day() {
        assert_eq!(parse_time_of_day("03:45"), NaiveTime::from_hms_opt(3, 45, 0));
        assert_eq!(parse_time_of_day("23:59"), NaiveTime::from_hms_opt(23, 59, 0));
        for bad in ["3:45", "24:00", "12:60", "12:5", "1245", "ab:cd", "", "12:30:00", "-1:30"] {
            assert_eq!(parse_time_of_day(bad), None, "{bad}");
        }
    }

    #[test]
    fn test_stop_prepare_then_stop_after_fuse() {
        let mut settings = service();
        settings.stop.sunday = Some("03:45".into());
        let mut calendar = Calendar::new();
        assert!(calendar.set_schedule(&settings).is_empty());

        assert_eq!(calendar.evaluate(at(0, 3, 30)), HoldState::Running);
        assert_eq!(calendar.evaluate(at(0, 3, 41)), HoldState::StopPrepare);
        assert_eq!(calendar.stop_at(), Some(at(0, 3, 46)));
        assert_eq!(calendar.evaluate(at(0, 3, 45)), HoldState::StopPrepare);
        assert_eq!(calendar.evaluate(at(0, 3, 46)), HoldState::Stop);
        assert_eq!(calendar.evaluate(at(0, 3, 50)), HoldState::Stop);
    }

    #[test]
    fn test_stop_fuse_ignores_schedule_changes() {
        let mut settings = service();
        settings.stop.sunday = Some("03:45".into());
        let mut calendar = Calendar::new();
        calendar.set_schedule(&settings);
        assert_eq!(calendar.evaluate(at(0, 3, 41)), HoldState::StopPrepare);

        let mut cleared = service();
        cleared.hold = true;
        calendar.set_schedule(&cleared);
        assert_eq!(calendar.evaluate(at(0, 3, 44)), HoldState::StopPrepare);
        assert_eq!(calendar.evaluate(at(0, 3, 46)), HoldState::Stop);
    }

    #[test]
    fn test_stop_only_on_configured_weekday() {
        let mut settings = service();
        settings.stop.sunday = Some("03:45".into());
        let mut calendar = Calendar::new();
        calendar.set_schedule(&settings);
        // Monday at the same time.
        assert_eq!(calendar.evaluate(at(1, 3, 41)), HoldState::Running);
        // Exactly at or past the stop time does not arm the fuse.
        assert_eq!(calendar.evaluate(at(0, 3, 45)), HoldState::Running);
    }

    #[test]
    fn test_stop_beats_pause_window() {
        let mut settings = service();
        settings.stop.sunday = Some("03:45".into());
        settings.pause.sunday = pause("03:00", 120);
        let mut calendar = Calendar::new();
        calendar.set_schedule(&settings);

        assert_eq!(calendar.evaluate(at(0, 3, 30)), HoldState::HoldAuto);
        assert_eq!(calendar.evaluate(at(0, 3, 42)), HoldState::StopPrepare);
        assert_eq!(calendar.evaluate(at(0, 3, 47)), HoldState::Stop);
    }

    #[test]
    fn test_same_day_pause_window() {
        let mut settings = service();
        settings.pause.tuesday = pause("12:00", 30);
        let mut calendar = Calendar::new();
        calendar.set_schedule(&settings);

        assert_eq!(calendar.evaluate(at(2, 11, 59)), HoldState::Running);
        assert_eq!(calendar.evaluate(at(2, 12, 0)), HoldState::HoldAuto);
        assert_eq!(calendar.evaluate(at(2, 12, 29)), HoldState::HoldAuto);
        assert_eq!(calendar.evaluate(at(2, 12, 30)), HoldState::Running);
        // Same time on Wednesday.
        assert_eq!(calendar.evaluate(at(3, 12, 10)), HoldState::Running);
    }

    #[test]
    fn test_pause_window_rolls_into_next_weekday() {
        let mut settings = service();
        settings.pause.saturday = pause("23:00", 120);
        let mut calendar = Calendar::new();
        calendar.set_schedule(&settings);

        // Saturday 2025-03-08, then Sunday 2025-03-09.
        assert_eq!(calendar.evaluate(at(6, 22, 59)), HoldState::Running);
        assert_eq!(calendar.evaluate(at(6, 23, 30)), HoldState::HoldAuto);
        assert_eq!(calendar.evaluate(at(7, 0, 30)), HoldState::HoldAuto);
        assert_eq!(calendar.evaluate(at(7, 1, 0)), HoldState::Running);
    }

    #[test]
    fn test_manual_hold_below_auto_hold() {
        let mut settings = service();
        settings.hold = true;
        settings.pause.monday = pause("08:00", 60);
        let mut calendar = Calendar::new();
        calendar.set_schedule(&settings);

        assert_eq!(calendar.evaluate(at(1, 7, 0)), HoldState::HoldManual);
        assert_eq!(calendar.evaluate(at(1, 8, 30)), HoldState::HoldAuto);
    }

    #[test]
    fn test_invalid_entries_warn_and_keep_previous_rule() {
        let mut settings = service();
        settings.stop.monday = Some("04:00".into());
        settings.pause.monday = pause("10:00", 30);
        let mut calendar = Calendar::new();
        assert!(calendar.set_schedule(&settings).is_empty());

        let mut broken = settings.clone();
        broken.stop.monday = Some("4:30".into());
        broken.pause.monday = pause("10:00", 1441);
        broken.pause.friday = pause("xx", 10);
        let warnings = calendar.set_schedule(&broken);

        assert_eq!(warnings.len(), 3);
        assert!(warnings[0].contains("service.stop.monday"));
        assert!(warnings.iter().any(|w| w.contains("service.pause.monday.duration")));
        assert!(warnings.iter().any(|w| w.contains("service.pause.friday.time")));
        // Monday keeps its previous pause window.
        assert_eq!(calendar.evaluate(at(1, 10, 10)), HoldState::HoldAuto);
        // And its previous stop time.
        assert_eq!(calendar.evaluate(at(1, 3, 58)), HoldState::StopPrepare);
    }

    #[test]
    fn test_non_positive_duration_is_skipped_silently() {
        let mut settings = service();
        settings.pause.monday = pause("10:00", 0);
        let mut calendar = Calendar::new();
        assert!(calendar.set_schedule(&settings).is_empty());
        assert_eq!(calendar.evaluate(at(1, 10, 0)), HoldState::Running);
    }

    #[test]
    fn test_actor_announces_changes_and_repeats_stop() {
        let mut settings = Settings::default();
        settings.service = service();
        settings.service.stop.sunday = Some("03:45".into());
        let (_settings_tx, settings_rx) = watch::channel(Arc::new(settings));
        let (mut actor, mut state_rx) = CalendarActor::new(settings_rx, Telemetry::disabled());
        actor.apply_settings();

        actor.tick(at(0, 3, 0));
        assert!(state_rx.has_changed().unwrap());
        assert_eq!(*state_rx.borrow_and_update(), HoldState::Running);

        actor.tick(at(0, 3, 1));
        assert!(!state_rx.has_changed().unwrap());

        actor.tick(at(0, 3, 41));
        assert_eq!(*state_rx.borrow_and_update(), HoldState::StopPrepare);

        actor.tick(at(0, 3, 46));
        assert_eq!(*state_rx.borrow_and_update(), HoldState::Stop);
        actor.tick(at(0, 3, 47));
        assert!(state_rx.has_changed().unwrap());
        assert_eq!(*state_rx.borrow_and_update(), HoldState::Stop);
    }
}
