use chrono::NaiveDateTime;
use regex::{Captures, Regex};
use std::io::BufRead;
use thiserror::Error;

mod profiles;
#[cfg(test)]
mod profiles_test;

/// External programs whose log streams the pipeline can classify.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Program {
    Geogrid,
    Ungrib,
    Metgrid,
    Real,
    Wrfda,
    Wrf,
}

impl Program {
    pub fn name(self) -> &'static str {
        match self {
            Program::Geogrid => "geogrid",
            Program::Ungrib => "ungrib",
            Program::Metgrid => "metgrid",
            Program::Real => "real",
            Program::Wrfda => "da_wrfvar",
            Program::Wrf => "wrf",
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MonitorError {
    #[error("malformed {label} line `{line}`")]
    Malformed { label: &'static str, line: String },
    #[error("completion marker not found")]
    MissingCompletion,
    #[error("cannot read log stream: {0}")]
    Stream(String),
}

/// One normalized happening in a program log: a percentage change, a
/// produced artifact, or the terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub percent: i32,
    pub artifact: Option<String>,
    pub error: Option<MonitorError>,
    pub completed: bool,
}

/// Span covered by a program run. Timestamped log lines are scaled
/// against it to obtain a percentage.
#[derive(Debug, Clone, Copy)]
pub struct TimeWindow {
    pub start: NaiveDateTime,
    pub duration_hours: i64,
}

impl TimeWindow {
    pub fn new(start: NaiveDateTime, duration_hours: i64) -> Self {
        Self {
            start,
            duration_hours,
        }
    }

    fn elapsed_ratio(&self, instant: NaiveDateTime, span: i64) -> i64 {
        let total = self.duration_hours * 3600;
        if total == 0 {
            return 0;
        }
        (instant - self.start).num_seconds() * span / total
    }
}

// How a rule recognizes its line before the detail regex runs.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Trigger {
    Contains(&'static str),
    Prefix(&'static str),
    // the detail regex itself is the trigger; a non-match just skips
    // to the next rule instead of being malformed
    Pattern,
}

// Timestamp layouts found in the supported logs.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Stamp {
    /// `2023-08-24 06:00:00`
    DateTime,
    /// `2023-08-24_06`
    DateHour,
    /// `2023-08-24_06:00:00` with an optional fraction
    DateTimeUnderscore,
}

impl Stamp {
    fn parse(self, text: &str) -> Option<NaiveDateTime> {
        match self {
            Stamp::DateTime => NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S").ok(),
            Stamp::DateHour => {
                NaiveDateTime::parse_from_str(&format!("{text}:00"), "%Y-%m-%d_%H:%M").ok()
            }
            Stamp::DateTimeUnderscore => {
                NaiveDateTime::parse_from_str(text, "%Y-%m-%d_%H:%M:%S%.f").ok()
            }
        }
    }
}

// How the timestamp of a TimeMark line turns into a percentage.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Scale {
    /// plain ratio over the whole window
    Full,
    /// half the window, offset by the half mark once it was seen
    Half,
    /// ratio over the window, scaled into the current domain's share
    PerDomain,
}

pub(crate) enum RuleKind {
    /// `curr of tot` domain header: completed domains move the floor
    DomainChange,
    /// `curr of tot` unit counter within the current domain
    UnitProgress,
    /// timestamped progress line
    TimeMark {
        stamp: Stamp,
        group: usize,
        scale: Scale,
    },
    /// the program announced its second half
    HalfMark,
    /// recognized but contributes no event
    InputMark,
    /// an output artifact was closed
    Artifact,
    /// terminal success marker
    Success,
}

pub(crate) struct LineRule {
    pub(crate) trigger: Trigger,
    pub(crate) detail: Option<Regex>,
    pub(crate) label: &'static str,
    pub(crate) kind: RuleKind,
}

// Per-stream classification state. One per followed log.
struct Monitor {
    rules: &'static [LineRule],
    window: TimeWindow,
    domains_done: i64,
    total_domains: i64,
    base: i64,
    last_percent: i64,
    finished: bool,
}

impl Monitor {
    fn new(program: Program, window: TimeWindow) -> Self {
        Self {
            rules: profiles::rules(program),
            window,
            domains_done: 0,
            total_domains: 1,
            base: 0,
            last_percent: 0,
            finished: false,
        }
    }

    fn feed(&mut self, line: &str) -> Option<ProgressEvent> {
        for i in 0..self.rules.len() {
            let rule = &self.rules[i];
            let triggered = match rule.trigger {
                Trigger::Contains(text) => line.contains(text),
                Trigger::Prefix(text) => line.starts_with(text),
                Trigger::Pattern => true,
            };
            if !triggered {
                continue;
            }
            match &rule.detail {
                Some(detail) => match detail.captures(line) {
                    Some(captures) => return self.apply(i, Some(&captures), line),
                    None => {
                        if matches!(rule.trigger, Trigger::Pattern) {
                            continue;
                        }
                        return Some(self.fail(rule.label, line));
                    }
                },
                None => return self.apply(i, None, line),
            }
        }
        None
    }

    fn apply(
        &mut self,
        rule: usize,
        captures: Option<&Captures>,
        line: &str,
    ) -> Option<ProgressEvent> {
        let label = self.rules[rule].label;
        match self.rules[rule].kind {
            RuleKind::DomainChange => {
                let (curr, tot) = match two_numbers(captures) {
                    Some(pair) if pair.1 > 0 => pair,
                    _ => return Some(self.fail(label, line)),
                };
                self.domains_done = curr - 1;
                self.total_domains = tot;
                None
            }
            RuleKind::UnitProgress => {
                let (curr, tot) = match two_numbers(captures) {
                    Some(pair) if pair.1 > 0 => pair,
                    _ => return Some(self.fail(label, line)),
                };
                let percent =
                    self.domains_done * 100 / self.total_domains + (curr * 100 / tot) / self.total_domains;
                self.percent_event(percent)
            }
            RuleKind::TimeMark { stamp, group, scale } => {
                let text = captures
                    .and_then(|c| c.get(group))
                    .map(|m| m.as_str().trim());
                let instant = match text.and_then(|t| stamp.parse(t)) {
                    Some(instant) => instant,
                    None => return Some(self.fail(label, line)),
                };
                let percent = match scale {
                    Scale::Full => self.window.elapsed_ratio(instant, 100),
                    Scale::Half => self.base + self.window.elapsed_ratio(instant, 50),
                    Scale::PerDomain => {
                        self.domains_done * 100 / self.total_domains
                            + self.window.elapsed_ratio(instant, 100) / self.total_domains
                    }
                };
                self.percent_event(percent)
            }
            RuleKind::HalfMark => {
                self.base = 50;
                None
            }
            RuleKind::InputMark => None,
            RuleKind::Artifact => match captures.and_then(|c| c.get(1)) {
                Some(name) => Some(ProgressEvent {
                    percent: self.last_percent as i32,
                    artifact: Some(name.as_str().to_owned()),
                    error: None,
                    completed: false,
                }),
                None => Some(self.fail(label, line)),
            },
            RuleKind::Success => {
                self.finished = true;
                Some(ProgressEvent {
                    percent: 100,
                    artifact: None,
                    error: None,
                    completed: true,
                })
            }
        }
    }

    // percentages are only reported when they change
    fn percent_event(&mut self, percent: i64) -> Option<ProgressEvent> {
        if percent == self.last_percent {
            return None;
        }
        self.last_percent = percent;
        Some(ProgressEvent {
            percent: percent as i32,
            artifact: None,
            error: None,
            completed: false,
        })
    }

    fn fail(&mut self, label: &'static str, line: &str) -> ProgressEvent {
        self.finished = true;
        ProgressEvent {
            percent: self.last_percent as i32,
            artifact: None,
            error: Some(MonitorError::Malformed {
                label,
                line: line.to_owned(),
            }),
            completed: true,
        }
    }
}

fn two_numbers(captures: Option<&Captures>) -> Option<(i64, i64)> {
    let captures = captures?;
    let curr = captures.get(1)?.as_str().parse().ok()?;
    let tot = captures.get(2)?.as_str().parse().ok()?;
    Some((curr, tot))
}

/// Pull-based stream of [`ProgressEvent`]s classified from a program
/// log. The stream ends right after its terminal event: the success
/// marker, a fatal parse error, or end of input without either.
pub struct ProgressStream<R> {
    reader: R,
    monitor: Monitor,
    line: String,
}

impl<R: BufRead> ProgressStream<R> {
    pub fn new(program: Program, window: TimeWindow, reader: R) -> Self {
        Self {
            reader,
            monitor: Monitor::new(program, window),
            line: String::new(),
        }
    }
}

impl<R: BufRead> Iterator for ProgressStream<R> {
    type Item = ProgressEvent;

    fn next(&mut self) -> Option<ProgressEvent> {
        loop {
            if self.monitor.finished {
                return None;
            }
            self.line.clear();
            match self.reader.read_line(&mut self.line) {
                Ok(0) => {
                    self.monitor.finished = true;
                    return Some(ProgressEvent {
                        percent: self.monitor.last_percent as i32,
                        artifact: None,
                        error: Some(MonitorError::MissingCompletion),
                        completed: true,
                    });
                }
                Ok(_) => {
                    if let Some(event) = self.monitor.feed(self.line.trim_end()) {
                        return Some(event);
                    }
                }
                Err(error) => {
                    self.monitor.finished = true;
                    return Some(ProgressEvent {
                        percent: self.monitor.last_percent as i32,
                        artifact: None,
                        error: Some(MonitorError::Stream(error.to_string())),
                        completed: true,
                    });
                }
            }
        }
    }
}
