use crate::{
    config::{format_short_date, PipelineConfig, RunEnvironment},
    exec::{self, ExecError},
    hosts::{NodeList, NodePool},
    parallel::Batch,
    postproc::{DispatchReport, PostProcErrors, PostProcessDispatcher, RuleSet},
    progress::{MonitorError, Program, ProgressStream, TimeWindow},
    tail::TailReader,
    tracker::{CompletionTracker, Journal},
};
use chrono::{NaiveDateTime, Timelike};
use crossbeam::channel::unbounded;
use parking_lot::Mutex;
use rayon::ThreadPoolBuildError;
use std::{
    fs::{File, OpenOptions},
    io::{BufReader, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

// shared between every member's monitor and the postprocess feeder
const PRODUCED_LOG_NAME: &str = "output_files.log";
const JOURNAL_NAME: &str = "postprocd_files.log";
const FINAL_AUX_SCRIPT: &str = "scripts/postproc-aux-end.sh";
const FINAL_AUX_LOG: &str = "postproc-aux-end.log";

const WRF_LOG_POLL: Duration = Duration::from_secs(5);
const PRODUCED_LOG_POLL: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ForecastErrors {
    #[error("Not enough free nodes to run WRF")]
    NoFreeNodes,
    #[error("{step} process failed: {source}")]
    StepFailed { step: String, source: ExecError },
    #[error("{step} process failed: {source}")]
    BrokenLog { step: String, source: MonitorError },
    #[error("cannot read log file {}: {source}", path.display())]
    Log {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot update produced files log {}: {source}", path.display())]
    Produced {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot create completion journal {}: {source}", path.display())]
    Journal {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Rules(#[from] PostProcErrors),
    #[error("cannot start the member pool: {0}")]
    Pool(#[from] ThreadPoolBuildError),
    #[error("{failed} of {total} forecast members failed")]
    MembersFailed { failed: usize, total: usize },
    #[error("the postprocessing pipeline aborted")]
    Aborted,
}

/// One forecast run: the control member, its perturbed ensemble
/// siblings, and the postprocessing that follows their output files.
///
/// Directory preparation, namelists and input staging belong to the
/// surrounding tooling; everything here happens inside an already
/// prepared simulation working directory.
pub struct Forecast<'a> {
    config: &'a PipelineConfig,
    start: NaiveDateTime,
    duration_hours: i64,
    sim_workdir: PathBuf,
    pool: NodePool,
}

impl<'a> Forecast<'a> {
    pub fn new(config: &'a PipelineConfig, env: &RunEnvironment) -> Self {
        Self {
            config,
            start: env.start,
            duration_hours: env.duration_hours,
            sim_workdir: config.simulation_workdir(&env.start),
            pool: NodePool::new(env.nodes.iter().cloned()),
        }
    }

    /// Runs every member with bounded parallelism while the dispatcher
    /// postprocesses their output files as they appear. Returns after
    /// both sides have drained.
    pub fn run(&self) -> Result<(), ForecastErrors> {
        info!(
            "Starting forecast from {} for {} hours",
            format_short_date(&self.start),
            self.duration_hours
        );

        let produced_log = self.sim_workdir.join(PRODUCED_LOG_NAME);
        // the postprocess side tails this file, create it up front so
        // the tail does not wait for the first member to produce output
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&produced_log)
            .map_err(|source| ForecastErrors::Produced {
                path: produced_log.clone(),
                source,
            })?;

        let stop_tail = Arc::new(AtomicBool::new(false));

        let (members, postproc) = thread::scope(|scope| {
            let postproc = {
                let stop_tail = Arc::clone(&stop_tail);
                let produced_log = produced_log.clone();
                scope.spawn(move || self.run_post_processing(&produced_log, stop_tail))
            };

            let members = self.run_members();

            // one sentinel for the whole run, even when members failed,
            // so the dispatcher drains whatever was produced and returns
            if let Err(error) = append_line(&produced_log, "COMPLETED") {
                error!("Cannot finalize {}: {error}", produced_log.display());
                stop_tail.store(true, Ordering::Release);
            }

            let postproc = match postproc.join() {
                Ok(result) => result,
                Err(_) => Err(ForecastErrors::Aborted),
            };
            (members, postproc)
        });

        match (members, postproc) {
            (Ok(()), Ok(_)) => {
                info!("Forecast completed successfully.");
                Ok(())
            }
            (Err(error), postproc) => {
                if let Err(other) = postproc {
                    error!("Postprocessing also failed: {other}");
                }
                Err(error)
            }
            (Ok(()), Err(error)) => Err(error),
        }
    }

    fn run_members(&self) -> Result<(), ForecastErrors> {
        let total = self.config.ensemble_members + 1;
        let mut batch = Batch::new();
        for member in 0..total {
            batch.add(member);
        }

        let failures: Mutex<Vec<usize>> = Mutex::new(Vec::new());
        batch.run(self.config.ensemble_parallelism, |member| {
            if let Err(error) = self.run_member(member) {
                error!("Member {member} failed: {error}");
                failures.lock().push(member);
            }
        })?;

        let failed = failures.into_inner();
        if !failed.is_empty() {
            warn!("One or more members of the forecast failed to run.");
            return Err(ForecastErrors::MembersFailed {
                failed: failed.len(),
                total,
            });
        }
        Ok(())
    }

    /// Runs one WRF member to completion: allocate nodes when an
    /// ensemble is configured, follow `rsl.out.0000` on a side thread,
    /// execute mpirun with retries, give the nodes back.
    pub(crate) fn run_member(&self, member: usize) -> Result<(), ForecastErrors> {
        let (rel_dir, descr) = self.member_workdir(member);
        let member_dir = self.sim_workdir.join(&rel_dir);

        info!(
            "Running WRF {descr} for {:02}:00 DIR: $WORKDIR/{rel_dir} LOGS: wrf.detail.log rsl.out.* rsl.error.*",
            self.start.hour()
        );

        let nodes = if self.config.ensemble_members > 0 {
            match self.pool.find_free(self.nodes_needed()) {
                Some(nodes) => nodes,
                None => return Err(ForecastErrors::NoFreeNodes),
            }
        } else {
            NodeList::default()
        };

        let log_path = member_dir.join("rsl.out.0000");
        let produced_log = self.sim_workdir.join(PRODUCED_LOG_NAME);
        let stop = Arc::new(AtomicBool::new(false));

        let ran = thread::scope(|scope| {
            let monitor = {
                let stop = Arc::clone(&stop);
                let descr = descr.clone();
                let member_dir = member_dir.clone();
                let log_path = log_path.clone();
                let produced_log = produced_log.clone();
                scope.spawn(move || {
                    self.monitor_member(&descr, &member_dir, &log_path, &produced_log, stop)
                })
            };

            let cmd = self.wrf_command(&nodes);
            debug!("Running command: {cmd}");
            let ran = exec::run_with_retries(
                &cmd,
                &member_dir,
                Some("wrf.detail.log"),
                Some("{wrf.detail.log,rsl.out.????,rsl.error.????}"),
                &[],
                &self.config.retry_policy(),
            );
            self.pool.dispose(&nodes);

            stop.store(true, Ordering::Release);
            let end_line_found = match monitor.join() {
                Ok(found) => found,
                Err(_) => {
                    error!("The WRF {descr} monitor thread panicked");
                    true
                }
            };
            if !end_line_found {
                warn!("log file is malformed: completion line not found.");
            }
            ran
        });

        ran.map_err(|source| ForecastErrors::StepFailed {
            step: format!("WRF {descr}"),
            source,
        })
    }

    pub(crate) fn member_workdir(&self, member: usize) -> (String, String) {
        if member == 0 {
            (format!("wrf{:02}", self.start.hour()), "control".to_owned())
        } else {
            (
                format!("wrf{:02}_ens{member:02}", self.start.hour()),
                format!("ensemble n. {member}"),
            )
        }
    }

    pub(crate) fn nodes_needed(&self) -> usize {
        self.config.wrf_procs.div_ceil(self.config.cores_per_node)
    }

    pub(crate) fn wrf_command(&self, nodes: &NodeList) -> String {
        format!(
            "mpirun {} {nodes} -n {} ./wrf.exe",
            self.config.mpi_options, self.config.wrf_procs
        )
    }

    /// Follows a member's log until its terminal event, appending every
    /// produced artifact to the shared produced-files log. Returns
    /// whether the completion line was seen.
    pub(crate) fn monitor_member(
        &self,
        descr: &str,
        member_dir: &Path,
        log_path: &Path,
        produced_log: &Path,
        stop: Arc<AtomicBool>,
    ) -> bool {
        let tail = match TailReader::open(log_path, WRF_LOG_POLL, stop) {
            Ok(tail) => tail,
            Err(error) => {
                // never appeared, so the command itself must have failed
                debug!("WRF {descr} log {} never appeared: {error}", log_path.display());
                return false;
            }
        };

        let window = TimeWindow::new(self.start, self.duration_hours);
        let mut end_line_found = false;
        for event in ProgressStream::new(Program::Wrf, window, BufReader::new(tail)) {
            if event.completed {
                match &event.error {
                    None => {
                        end_line_found = true;
                        info!("  - WRF {descr} process completed successfully.");
                    }
                    // the caller warns about this one after joining
                    Some(MonitorError::MissingCompletion) => {}
                    Some(error) => {
                        end_line_found = true;
                        error!("WRF {descr} process failed: {error}");
                    }
                }
                continue;
            }

            if let Some(artifact) = event.artifact {
                // restart files stay local to the member directory
                if artifact == "restart" {
                    continue;
                }
                let path = member_dir.join(&artifact);
                match append_line(produced_log, &path.display().to_string()) {
                    Ok(()) => info!("File produced by {descr}: {artifact}"),
                    Err(error) => {
                        error!("Cannot record produced file {}: {error}", path.display())
                    }
                }
            }
        }
        end_line_found
    }

    /// Feeds the produced-files log through the postprocess dispatcher
    /// and its completion events into the tracker, then reports. The
    /// final-auxiliary script runs from the tracker once every
    /// assimilation-domain auxiliary file is done.
    pub(crate) fn run_post_processing(
        &self,
        produced_log: &Path,
        stop: Arc<AtomicBool>,
    ) -> Result<DispatchReport, ForecastErrors> {
        let journal_path = self.sim_workdir.join(JOURNAL_NAME);
        let journal = Journal::create(&journal_path).map_err(|source| ForecastErrors::Journal {
            path: journal_path.clone(),
            source,
        })?;

        let rules = RuleSet::compile(&self.config.postproc_rules)?;
        let dispatcher = PostProcessDispatcher::new(
            rules,
            self.config.postproc_workers,
            self.sim_workdir.clone(),
            self.start,
        );

        let script = self.config.root_dir.join(FINAL_AUX_SCRIPT);
        let sim_workdir = self.sim_workdir.clone();
        let rundate = format_short_date(&self.start);
        let policy = self.config.retry_policy();
        let final_aux = move || {
            let env = [
                ("SIM_WORKDIR", sim_workdir.display().to_string()),
                ("RUNDATE", rundate.clone()),
            ];
            exec::run_with_retries(
                &script.display().to_string(),
                &sim_workdir,
                Some(FINAL_AUX_LOG),
                None,
                &env,
                &policy,
            )
        };

        let tot_hours = self.duration_hours;
        let (event_tx, event_rx) = unbounded();

        let report = thread::scope(|scope| {
            let consumer = scope.spawn(move || {
                let mut tracker = CompletionTracker::new(journal, tot_hours, final_aux);
                let mut broken = false;
                for event in event_rx {
                    if broken {
                        continue;
                    }
                    if let Err(error) = tracker.handle(&event) {
                        error!("Cannot update completion journal: {error}");
                        broken = true;
                    }
                }
                tracker.all_done()
            });

            let report = match TailReader::open(produced_log, PRODUCED_LOG_POLL, stop) {
                Ok(tail) => dispatcher
                    .run(BufReader::new(tail), &event_tx)
                    .map_err(|source| ForecastErrors::Produced {
                        path: produced_log.to_owned(),
                        source,
                    }),
                Err(source) => Err(ForecastErrors::Produced {
                    path: produced_log.to_owned(),
                    source,
                }),
            };
            drop(event_tx);

            match consumer.join() {
                Ok(true) => {}
                Ok(false) => {
                    warn!("Postprocessing finished without reaching the all-completed milestone")
                }
                Err(_) => error!("The completion tracker thread panicked"),
            }
            report
        })?;

        report.log_summary();
        Ok(report)
    }

    /// Runs one already-prepared pipeline step: execute with retries,
    /// then classify the log it left behind. A fatal classification
    /// error fails the step; a missing completion line is only a
    /// warning since the process itself exited cleanly.
    pub(crate) fn run_step(
        &self,
        program: Program,
        dir: &Path,
        cmd: &str,
        monitor_log: &str,
        preserve: &str,
    ) -> Result<(), ForecastErrors> {
        let name = program.name();
        let detail_log = format!("{name}.detail.log");
        exec::run_with_retries(
            cmd,
            dir,
            Some(&detail_log),
            Some(preserve),
            &[],
            &self.config.retry_policy(),
        )
        .map_err(|source| ForecastErrors::StepFailed {
            step: name.to_owned(),
            source,
        })?;

        let log_path = dir.join(monitor_log);
        let log = File::open(&log_path).map_err(|source| ForecastErrors::Log {
            path: log_path.clone(),
            source,
        })?;

        let window = TimeWindow::new(self.start, self.duration_hours);
        let mut end_line_found = false;
        for event in ProgressStream::new(program, window, BufReader::new(log)) {
            if event.completed {
                match event.error {
                    None => {
                        end_line_found = true;
                        info!("  - {} process completed successfully.", capitalize(name));
                    }
                    Some(MonitorError::MissingCompletion) => {}
                    Some(source) => {
                        return Err(ForecastErrors::BrokenLog {
                            step: name.to_owned(),
                            source,
                        })
                    }
                }
                continue;
            }
            debug!("{name} progress: {}%", event.percent);
        }
        if !end_line_found {
            warn!(
                "log file {} is malformed: completion line not found.",
                log_path.display()
            );
        }
        Ok(())
    }

    pub fn run_geogrid(&self) -> Result<(), ForecastErrors> {
        info!("Running geogrid. DIR: $WORKDIR/wps LOGS: geogrid.detail.log geogrid.log.*");
        let cmd = format!(
            "mpiexec {} -n {} ./geogrid.exe",
            self.config.mpi_options, self.config.geogrid_procs
        );
        self.run_step(
            Program::Geogrid,
            &self.sim_workdir.join("wps"),
            &cmd,
            "geogrid.log.0000",
            "{geogrid.detail.log,geogrid.log.????}",
        )
    }

    pub fn run_ungrib(&self) -> Result<(), ForecastErrors> {
        info!("Running ungrib. DIR: $WORKDIR/wps LOGS: ungrib.detail.log ungrib.log");
        self.run_step(
            Program::Ungrib,
            &self.sim_workdir.join("wps"),
            "./ungrib.exe",
            "ungrib.log",
            "{ungrib.detail.log,ungrib.log}",
        )
    }

    pub fn run_metgrid(&self) -> Result<(), ForecastErrors> {
        info!("Running metgrid. DIR: $WORKDIR/wps LOGS: metgrid.detail.log metgrid.log.*");
        let cmd = format!(
            "mpiexec {} -n {} ./metgrid.exe",
            self.config.mpi_options, self.config.metgrid_procs
        );
        self.run_step(
            Program::Metgrid,
            &self.sim_workdir.join("wps"),
            &cmd,
            "metgrid.log.0000",
            "{metgrid.detail.log,metgrid.log.????}",
        )
    }

    pub fn run_real(&self) -> Result<(), ForecastErrors> {
        info!(
            "Running real for {:02}:00 DIR: $WORKDIR/wps LOGS: real.detail.log rsl.out.* rsl.error.*",
            self.start.hour()
        );
        let cmd = format!(
            "mpiexec {} -n {} ./real.exe",
            self.config.mpi_options, self.config.real_procs
        );
        self.run_step(
            Program::Real,
            &self.sim_workdir.join("wps"),
            &cmd,
            "rsl.out.0000",
            "{real.detail.log,rsl.out.????,rsl.error.????}",
        )
    }

    /// Runs data assimilation for one cycle and domain. Cycles run at
    /// the forecast start and at three and six hours before it.
    pub fn run_wrfda(&self, cycle: &NaiveDateTime, domain: i32) -> Result<(), ForecastErrors> {
        let rel_dir = format!("da{:02}_d{domain:02}", cycle.hour());
        info!(
            "Running da_wrfvar for {:02}:00 (domain {domain}) DIR: $WORKDIR/{rel_dir} LOGS: da_wrfvar.detail.log rsl.out.* rsl.error.*",
            cycle.hour()
        );
        let cmd = format!(
            "mpirun {} -n {} ./da_wrfvar.exe",
            self.config.mpi_options, self.config.wrfda_procs
        );
        self.run_step(
            Program::Wrfda,
            &self.sim_workdir.join(&rel_dir),
            &cmd,
            "rsl.out.0000",
            "{da_wrfvar.detail.log,rsl.out.????,rsl.error.????}",
        )
    }
}

// single write per line so concurrent members never interleave
fn append_line(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(format!("{line}\n").as_bytes())
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
