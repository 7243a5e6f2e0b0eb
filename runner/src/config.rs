use crate::{
    exec::{RetryPolicy, RETRY_ATTEMPTS},
    hosts,
};
use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, env, fs::File, path::Path, path::PathBuf, time::Duration};
use thiserror::Error;
use tracing::error;

/// Format of forecast start instants wherever they cross a process
/// boundary: `$START_FORECAST`, `$RUNDATE`, simulation directory names.
pub const SHORT_DATE_FORMAT: &str = "%Y-%m-%d-%H";

// chrono cannot parse a format that stops at the hour, so parsing goes
// through a minutes-bearing variant of SHORT_DATE_FORMAT
pub fn parse_short_date(text: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(&format!("{text}:00"), "%Y-%m-%d-%H:%M")
}

pub fn format_short_date(instant: &NaiveDateTime) -> String {
    instant.format(SHORT_DATE_FORMAT).to_string()
}

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Unable to read config file {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Unable to parse config file {}: {source}", path.display())]
    Unparseable {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("${0} is not set")]
    MissingEnv(&'static str),
    #[error("cannot parse ${variable}: {detail}")]
    InvalidEnv {
        variable: &'static str,
        detail: String,
    },
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    // mpirun process counts, one per pipeline step
    pub geogrid_procs: usize,
    pub metgrid_procs: usize,
    pub real_procs: usize,
    pub wrfda_procs: usize,
    pub wrf_procs: usize,

    // extra options prepended to every mpirun invocation
    #[serde(default)]
    pub mpi_options: String,

    // how many MPI ranks fit on one allocated node
    pub cores_per_node: usize,

    // perturbed members besides the control run; 0 disables the
    // ensemble and the node gating that goes with it
    #[serde(default)]
    pub ensemble_members: usize,
    // members running at once
    #[serde(default = "default_ensemble_parallelism")]
    pub ensemble_parallelism: usize,

    // simulation working directories are created below this
    pub workdir: PathBuf,
    // installation root holding the scripts/ directory
    pub root_dir: PathBuf,

    #[serde(default = "default_postproc_workers")]
    pub postproc_workers: usize,
    #[serde(default = "default_retry_pause_secs")]
    pub retry_pause_secs: u64,

    // base-filename pattern -> shell command run on each produced file
    #[serde(default)]
    pub postproc_rules: BTreeMap<String, String>,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        let file = File::open(path).map_err(|source| ConfigErrors::Unreadable {
            path: path.to_owned(),
            source,
        })?;
        serde_yaml::from_reader(file).map_err(|source| ConfigErrors::Unparseable {
            path: path.to_owned(),
            source,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: RETRY_ATTEMPTS,
            pause: Duration::from_secs(self.retry_pause_secs),
        }
    }

    /// Working directory of the simulation starting at `start`.
    pub fn simulation_workdir(&self, start: &NaiveDateTime) -> PathBuf {
        self.workdir.join(format_short_date(start))
    }

    pub fn preflight_checks(&mut self) -> bool {
        // attempt to catch all errors instead of piece-by-piece to make
        // debugging easier for users
        let mut contains_error = false;

        for (name, count) in [
            ("geogrid_procs", self.geogrid_procs),
            ("metgrid_procs", self.metgrid_procs),
            ("real_procs", self.real_procs),
            ("wrfda_procs", self.wrfda_procs),
            ("wrf_procs", self.wrf_procs),
        ] {
            if count == 0 {
                error!("{name} cannot be 0, mpirun needs at least one process");
                contains_error = true;
            }
        }

        if self.cores_per_node == 0 {
            error!("cores_per_node cannot be 0");
            contains_error = true;
        }

        if self.ensemble_members > 0 && self.ensemble_parallelism == 0 {
            error!("ensemble_parallelism cannot be 0 when an ensemble is configured");
            contains_error = true;
        }

        if self.postproc_workers == 0 {
            error!("postproc_workers cannot be 0");
            contains_error = true;
        }

        for (name, pattern) in self.postproc_rules.iter() {
            if let Err(e) = Regex::new(pattern) {
                error!("postproc_rules.{name} is not a valid pattern: {e}");
                contains_error = true;
            }
        }

        // relative directories are anchored to the invocation directory
        // once, so every later join is unambiguous
        for dir in [&mut self.workdir, &mut self.root_dir] {
            if dir.is_relative() {
                match env::current_dir() {
                    Ok(cwd) => *dir = cwd.join(&dir),
                    Err(e) => {
                        error!(
                            "Cannot resolve relative directory {}: {e}",
                            dir.to_string_lossy()
                        );
                        contains_error = true;
                    }
                }
            }
        }

        contains_error
    }
}

/// Per-run inputs arriving from the scheduler environment rather than
/// the config file.
#[derive(Debug, Clone)]
pub struct RunEnvironment {
    pub start: NaiveDateTime,
    pub duration_hours: i64,
    pub nodes: Vec<String>,
}

impl RunEnvironment {
    pub fn from_env() -> Result<Self, ConfigErrors> {
        let start_text =
            env::var("START_FORECAST").map_err(|_| ConfigErrors::MissingEnv("START_FORECAST"))?;
        let start = parse_short_date(&start_text).map_err(|e| ConfigErrors::InvalidEnv {
            variable: "START_FORECAST",
            detail: e.to_string(),
        })?;

        let duration_text =
            env::var("DURATION_HOURS").map_err(|_| ConfigErrors::MissingEnv("DURATION_HOURS"))?;
        let duration_hours = duration_text.trim().parse().map_err(|e: std::num::ParseIntError| {
            ConfigErrors::InvalidEnv {
                variable: "DURATION_HOURS",
                detail: e.to_string(),
            }
        })?;

        let nodes_text =
            env::var("SLURM_NODELIST").map_err(|_| ConfigErrors::MissingEnv("SLURM_NODELIST"))?;
        let nodes = hosts::parse_hosts(&nodes_text).map_err(|e| ConfigErrors::InvalidEnv {
            variable: "SLURM_NODELIST",
            detail: e.to_string(),
        })?;

        Ok(Self {
            start,
            duration_hours,
            nodes,
        })
    }
}

fn default_ensemble_parallelism() -> usize {
    1
}

fn default_postproc_workers() -> usize {
    5
}

fn default_retry_pause_secs() -> u64 {
    60
}
