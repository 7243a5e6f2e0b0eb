use crate::{
    config::format_short_date,
    exec,
    tracker::{FileKind, PostProcessCompleted},
};
use chrono::NaiveDateTime;
use crossbeam::channel::{bounded, Receiver, Sender};
use itertools::Itertools;
use once_cell::sync::Lazy;
use regex::Regex;
use std::{collections::BTreeMap, io::BufRead, path::Path, path::PathBuf, thread};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Retry sweeps each worker runs over its private failure list once
/// the input queue is exhausted.
pub const RETRY_SWEEPS: u32 = 5;

// one slot per forecast hour and output kind, ample for a 48h run
const QUEUE_CAPACITY: usize = 49 * 6;

static DOMAIN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"_d(\d\d)_").unwrap());
static INSTANT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\d\d\d\d-\d\d-\d\d_\d\d:\d\d:\d\d").unwrap());

#[derive(Error, Debug)]
pub enum PostProcErrors {
    #[error("Invalid postprocess rule `{rule}`: {source}")]
    InvalidRule { rule: String, source: regex::Error },
    #[error("No domain found in file name {file}")]
    MissingDomain { file: String },
    #[error("No timestamp found in file name {file}")]
    MissingInstant { file: String },
    #[error("Unparseable timestamp in file name {file}: {source}")]
    BadInstant {
        file: String,
        source: chrono::ParseError,
    },
    #[error("Unknown file kind for {file}")]
    UnknownKind { file: String },
}

/// Compiled postprocess rule table. Rules are tried in the config
/// map's key order, first match wins.
pub struct RuleSet {
    rules: Vec<(Regex, String)>,
}

impl RuleSet {
    pub fn compile(table: &BTreeMap<String, String>) -> Result<Self, PostProcErrors> {
        let mut rules = Vec::with_capacity(table.len());
        for (pattern, command) in table {
            let regex = Regex::new(pattern).map_err(|source| PostProcErrors::InvalidRule {
                rule: pattern.clone(),
                source,
            })?;
            rules.push((regex, command.clone()));
        }
        Ok(Self { rules })
    }

    pub fn match_command(&self, file_name: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|(regex, _)| regex.is_match(file_name))
            .map(|(_, command)| command.as_str())
    }
}

/// One produced file matched to the shell command that processes it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PostProcessCommand {
    pub file_path: String,
    pub command: String,
}

enum ProducedKind {
    MainOutput,
    Auxiliary,
}

// everything derivable from a produced file's name, extracted before
// the command runs so a misnamed file fails fast instead of cycling
// through the retry sweeps
struct Classified {
    file: String,
    dir: String,
    domain: i64,
    domain_digits: String,
    instant: NaiveDateTime,
    instant_text: String,
    kind: ProducedKind,
}

fn classify(file_path: &str) -> Result<Classified, PostProcErrors> {
    let path = Path::new(file_path);
    let file = match path.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => file_path.to_owned(),
    };
    let dir = path
        .parent()
        .map(|dir| dir.to_string_lossy().into_owned())
        .unwrap_or_default();

    let kind = if file.starts_with("wrfout") {
        ProducedKind::MainOutput
    } else if file.starts_with("aux") {
        ProducedKind::Auxiliary
    } else {
        return Err(PostProcErrors::UnknownKind { file });
    };

    let domain_digits = match DOMAIN_RE.captures(&file).and_then(|c| c.get(1)) {
        Some(digits) => digits.as_str().to_owned(),
        None => return Err(PostProcErrors::MissingDomain { file }),
    };
    let domain = match domain_digits.parse() {
        Ok(domain) => domain,
        Err(_) => return Err(PostProcErrors::MissingDomain { file }),
    };

    let instant_text = match INSTANT_RE.find(&file) {
        Some(found) => found.as_str().to_owned(),
        None => return Err(PostProcErrors::MissingInstant { file }),
    };
    let instant = NaiveDateTime::parse_from_str(&instant_text, "%Y-%m-%d_%H:%M:%S").map_err(
        |source| PostProcErrors::BadInstant {
            file: file.clone(),
            source,
        },
    )?;

    Ok(Classified {
        file,
        dir,
        domain,
        domain_digits,
        instant,
        instant_text,
        kind,
    })
}

fn base_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(path)
}

#[derive(Default)]
struct WorkerReport {
    failures: Vec<PostProcessCommand>,
    fatal: Vec<(PostProcessCommand, PostProcErrors)>,
}

/// What survived the run: transient failures that outlived every retry
/// sweep, and classification errors that were never retried at all.
pub struct DispatchReport {
    pub failures: Vec<PostProcessCommand>,
    pub fatal: Vec<(PostProcessCommand, PostProcErrors)>,
}

impl DispatchReport {
    pub fn log_summary(&self) {
        if !self.fatal.is_empty() {
            let files = self
                .fatal
                .iter()
                .map(|(item, error)| format!("{}: {error}", base_name(&item.file_path)))
                .join("\n\t");
            error!("Some produced files could not be classified:\n\t{files}");
        }
        if self.failures.is_empty() {
            info!("Postprocessing completed, all files successfully postprocessed.");
        } else {
            let files = self
                .failures
                .iter()
                .map(|item| base_name(&item.file_path))
                .join("\n\t");
            error!(
                "Postprocessing completed, some processes failed after {RETRY_SWEEPS} retries. Failed files: \n\t{files}"
            );
        }
    }
}

/// Fixed pool of workers running the configured shell command on every
/// produced file and feeding milestone events to the completion
/// tracker.
pub struct PostProcessDispatcher {
    rules: RuleSet,
    workers: usize,
    sim_workdir: PathBuf,
    start: NaiveDateTime,
}

impl PostProcessDispatcher {
    pub fn new(rules: RuleSet, workers: usize, sim_workdir: PathBuf, start: NaiveDateTime) -> Self {
        Self {
            rules,
            workers,
            sim_workdir,
            start,
        }
    }

    /// Consumes produced-file lines until the `COMPLETED` sentinel,
    /// running matching commands across the worker pool. Returns once
    /// every item is done and all retry sweeps are over.
    pub fn run<R: BufRead>(
        &self,
        produced: R,
        completed: &Sender<PostProcessCompleted>,
    ) -> std::io::Result<DispatchReport> {
        let (cmd_tx, cmd_rx) = bounded::<PostProcessCommand>(QUEUE_CAPACITY);

        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(self.workers);
            for index in 0..self.workers {
                let cmd_rx = cmd_rx.clone();
                let completed = completed.clone();
                handles.push(scope.spawn(move || self.worker_loop(index, cmd_rx, completed)));
            }
            drop(cmd_rx);

            let fed = self.feed(produced, &cmd_tx);
            drop(cmd_tx);

            let mut report = DispatchReport {
                failures: Vec::new(),
                fatal: Vec::new(),
            };
            for handle in handles {
                match handle.join() {
                    Ok(worker_report) => {
                        report.failures.extend(worker_report.failures);
                        report.fatal.extend(worker_report.fatal);
                    }
                    Err(_) => error!("A postprocess worker panicked"),
                }
            }
            fed.map(|()| report)
        })
    }

    fn feed<R: BufRead>(
        &self,
        produced: R,
        cmds: &Sender<PostProcessCommand>,
    ) -> std::io::Result<()> {
        for line in produced.lines() {
            let line = line?;
            if line == "COMPLETED" {
                break;
            }

            let file = base_name(&line);
            let command = match self.rules.match_command(file) {
                Some(command) => command,
                None => {
                    debug!("No postprocess rule found for {file}");
                    continue;
                }
            };

            let item = PostProcessCommand {
                file_path: line.clone(),
                command: command.to_owned(),
            };
            if cmds.send(item).is_err() {
                break;
            }
            info!("Postprocess enqueued for {}", base_name(&line));
        }
        Ok(())
    }

    fn worker_loop(
        &self,
        index: usize,
        cmds: Receiver<PostProcessCommand>,
        completed: Sender<PostProcessCompleted>,
    ) -> WorkerReport {
        let mut report = WorkerReport::default();
        for item in cmds {
            self.run_command(index, item, &mut report, &completed);
        }

        for sweep in 1..=RETRY_SWEEPS {
            if report.failures.is_empty() {
                break;
            }
            info!("WORKER {index}: Retrying failed processes. Iteration {sweep}");
            let failures = std::mem::take(&mut report.failures);
            for item in failures {
                self.run_command(index, item, &mut report, &completed);
            }
        }

        report
    }

    fn run_command(
        &self,
        index: usize,
        item: PostProcessCommand,
        report: &mut WorkerReport,
        completed: &Sender<PostProcessCompleted>,
    ) {
        let info = match classify(&item.file_path) {
            Ok(info) => info,
            Err(error) => {
                error!("WORKER {index}: {error}, dropped without retry");
                report.fatal.push((item, error));
                return;
            }
        };

        info!("Running postprocessing for file {}", info.file);
        debug!("\t Command for file {}: `{}` ", info.file, item.command);

        let env = [
            ("FILE_PATH", item.file_path.clone()),
            ("FILE", info.file.clone()),
            ("DIR", info.dir.clone()),
            ("DOMAIN", info.domain_digits.clone()),
            ("INSTANT", info.instant_text.clone()),
            ("START_FORECAST", format_short_date(&self.start)),
            ("SIM_WORKDIR", self.sim_workdir.display().to_string()),
        ];
        if let Err(error) = exec::run(&item.command, &self.sim_workdir, None, &env) {
            warn!(
                "WORKER {index}: postprocess failed for file {}. Will be retried at end. Error: {error}",
                info.file
            );
            report.failures.push(item);
            return;
        }
        info!("Postprocess completed for {}", info.file);

        let progr_hour = (info.instant - self.start).num_hours();
        match info.kind {
            ProducedKind::MainOutput => {
                self.send_completed(
                    completed,
                    PostProcessCompleted {
                        domain: info.domain as i32,
                        progr_hour,
                        kind: FileKind::RawOutput,
                        file_path: self
                            .sim_workdir
                            .join(format!("results/out/out_regr_{}.grb", info.instant_text))
                            .display()
                            .to_string(),
                    },
                );
            }
            ProducedKind::Auxiliary => {
                // the untouched sibling goes out first, then the
                // regridded aux product
                self.send_completed(
                    completed,
                    PostProcessCompleted {
                        domain: info.domain as i32,
                        progr_hour,
                        kind: FileKind::RawAuxOutput,
                        file_path: self
                            .sim_workdir
                            .join("results/rawaux")
                            .join(&info.file)
                            .display()
                            .to_string(),
                    },
                );
                self.send_completed(
                    completed,
                    PostProcessCompleted {
                        domain: info.domain as i32,
                        progr_hour,
                        kind: FileKind::AuxOutput,
                        file_path: self
                            .sim_workdir
                            .join(format!(
                                "results/aux/aux-regr-d{:02}-{}.nc",
                                info.domain, info.instant_text
                            ))
                            .display()
                            .to_string(),
                    },
                );
            }
        }
    }

    fn send_completed(&self, completed: &Sender<PostProcessCompleted>, event: PostProcessCompleted) {
        if completed.send(event).is_err() {
            error!("Completion tracker is gone, milestone event dropped");
        }
    }
}
