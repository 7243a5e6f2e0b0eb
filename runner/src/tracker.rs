use crate::exec::ExecError;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{self, Write},
    path::Path,
};
use tracing::{debug, error, info, warn};

/// Longest forecast window the fixed tracking arrays can hold.
pub const MAX_FORECAST_HOURS: i64 = 48;

const HOUR_SLOTS: usize = MAX_FORECAST_HOURS as usize + 1;
const PHASE_SLOTS: usize = (MAX_FORECAST_HOURS / 12) as usize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    RawOutput,
    AuxOutput,
    RawAuxOutput,
    #[serde(rename = "Phase")]
    PhaseMarker,
    #[serde(rename = "Completed")]
    AllCompleted,
    #[serde(other)]
    Unknown,
}

impl FileKind {
    pub fn name(self) -> &'static str {
        match self {
            FileKind::RawOutput => "RawOutput",
            FileKind::AuxOutput => "AuxOutput",
            FileKind::RawAuxOutput => "RawAuxOutput",
            FileKind::PhaseMarker => "Phase",
            FileKind::AllCompleted => "Completed",
            FileKind::Unknown => "Unknown",
        }
    }
}

/// One milestone produced by post-processing, in journal line layout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostProcessCompleted {
    pub domain: i32,
    #[serde(rename = "progr")]
    pub progr_hour: i64,
    pub kind: FileKind,
    #[serde(rename = "file")]
    pub file_path: String,
}

/// Append-only journal of post-processing milestones. Downstream
/// delivery tails this file and parses every line as JSON, so each
/// line is written with a single `write` call, byte-stable.
pub struct Journal {
    file: File,
}

impl Journal {
    pub fn create(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: File::create(path)?,
        })
    }

    pub fn record(&mut self, event: &PostProcessCompleted) -> io::Result<()> {
        self.write_line(format!(
            r#"{{"domain": {}, "progr": {}, "kind": "{}", "file": "{}"}}"#,
            event.domain,
            event.progr_hour,
            event.kind.name(),
            event.file_path,
        ))
    }

    pub fn phase(&mut self, phase: i64) -> io::Result<()> {
        self.write_line(format!(
            r#"{{"progr": {phase}, "kind": "{}"}}"#,
            FileKind::PhaseMarker.name()
        ))
    }

    pub fn completed(&mut self) -> io::Result<()> {
        self.write_line(format!(r#"{{"kind": "{}"}}"#, FileKind::AllCompleted.name()))
    }

    fn write_line(&mut self, mut line: String) -> io::Result<()> {
        line.push('\n');
        self.file.write_all(line.as_bytes())
    }
}

/// Which parts of the run already finished post-processing. Mutated by
/// the tracker only, queried at end of run.
pub struct CompletionState {
    out_done: [bool; HOUR_SLOTS],
    aux_d1_done: [bool; HOUR_SLOTS],
    aux_d3_done: [bool; HOUR_SLOTS],
    phases_done: [bool; PHASE_SLOTS],
    final_aux_attempted: bool,
    final_aux_done: bool,
    all_done: bool,
    tot_hours: i64,
}

impl CompletionState {
    fn new(tot_hours: i64) -> Self {
        let bounded = tot_hours.clamp(0, MAX_FORECAST_HOURS);
        if bounded != tot_hours {
            warn!("Forecast duration of {tot_hours}h exceeds the tracked window, completion is checked over {bounded}h");
        }
        Self {
            out_done: [false; HOUR_SLOTS],
            aux_d1_done: [false; HOUR_SLOTS],
            aux_d3_done: [false; HOUR_SLOTS],
            phases_done: [false; PHASE_SLOTS],
            final_aux_attempted: false,
            final_aux_done: false,
            all_done: false,
            tot_hours: bounded,
        }
    }

    fn aux_complete(&self) -> bool {
        (0..=self.tot_hours as usize).all(|h| self.aux_d1_done[h] && self.aux_d3_done[h])
    }

    fn phase_count(&self) -> i64 {
        self.tot_hours / 12
    }
}

/// Sole consumer of [`PostProcessCompleted`] events: journals every one
/// of them and derives the phase, final-auxiliary and overall-completion
/// milestones. Producers may run concurrently; this type is driven by a
/// single task so journal writes keep a total order.
pub struct CompletionTracker<F> {
    journal: Journal,
    state: CompletionState,
    final_aux: F,
}

impl<F> CompletionTracker<F>
where
    F: FnMut() -> Result<(), ExecError>,
{
    pub fn new(journal: Journal, tot_hours: i64, final_aux: F) -> Self {
        Self {
            journal,
            state: CompletionState::new(tot_hours),
            final_aux,
        }
    }

    pub fn all_done(&self) -> bool {
        self.state.all_done
    }

    pub fn handle(&mut self, event: &PostProcessCompleted) -> io::Result<()> {
        self.journal.record(event)?;

        let hour = event.progr_hour;
        if !(0..=MAX_FORECAST_HOURS).contains(&hour) {
            warn!(
                "File {} reports forecast hour {hour}, outside the run window",
                event.file_path
            );
            return Ok(());
        }

        match event.kind {
            FileKind::AuxOutput => {
                match event.domain {
                    1 => self.state.aux_d1_done[hour as usize] = true,
                    3 => self.state.aux_d3_done[hour as usize] = true,
                    other => {
                        debug!("Auxiliary file for domain {other} is journaled but not tracked")
                    }
                }
                self.check_aux_completed();
            }
            FileKind::RawOutput => {
                self.state.out_done[hour as usize] = true;
                self.check_phase_completed(hour)?;
            }
            _ => {}
        }

        self.check_all_completed()
    }

    // runs the downstream step at most once, the first time every hour
    // of the window has both assimilation-domain aux files done
    fn check_aux_completed(&mut self) {
        if self.state.final_aux_attempted || !self.state.aux_complete() {
            return;
        }
        self.state.final_aux_attempted = true;

        info!("All auxiliary files post-processed, running the final auxiliary step");
        match (self.final_aux)() {
            Ok(()) => self.state.final_aux_done = true,
            Err(e) => error!("Final auxiliary step failed: {e}"),
        }
    }

    fn check_phase_completed(&mut self, hour: i64) -> io::Result<()> {
        // hour 0 belongs to phase 1 alone
        let (phase, first) = if hour == 0 {
            (1, 0)
        } else {
            let phase = (hour + 11) / 12;
            (phase, (phase - 1) * 12 + 1)
        };
        let last = phase * 12;

        if phase > self.state.phase_count() || self.state.phases_done[(phase - 1) as usize] {
            return Ok(());
        }
        if (first..=last).any(|h| !self.state.out_done[h as usize]) {
            return Ok(());
        }

        self.state.phases_done[(phase - 1) as usize] = true;
        info!("Forecast phase {phase} is fully post-processed");
        self.journal.phase(phase)
    }

    fn check_all_completed(&mut self) -> io::Result<()> {
        if self.state.all_done || !self.state.final_aux_done {
            return Ok(());
        }
        let phases = self.state.phase_count();
        if (1..=phases).any(|p| !self.state.phases_done[(p - 1) as usize]) {
            return Ok(());
        }

        self.state.all_done = true;
        info!("Simulation post-processing is complete");
        self.journal.completed()
    }
}
