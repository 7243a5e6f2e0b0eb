mod config;
mod exec;
mod forecast;
mod hosts;
mod parallel;
mod postproc;
mod progress;
mod tail;
mod tracker;

#[cfg(test)]
mod forecast_test;
#[cfg(test)]
mod hosts_test;
#[cfg(test)]
mod parallel_test;

use crate::config::{PipelineConfig, RunEnvironment};
use crate::forecast::Forecast;
use clap::{Parser, Subcommand, ValueEnum};
use std::env;
use std::path::{Path, PathBuf};
use std::process::exit;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tempest")]
#[command(version)]
#[command(about = "WRF ensemble forecast runner")]
struct Cli {
    /// Pipeline configuration file
    #[arg(long, short, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run every forecast member and postprocess their outputs
    Run,
    /// Run one monitored pipeline step in its prepared directory
    Step {
        #[arg(value_enum)]
        program: StepProgram,

        /// Assimilation domain, da-wrfvar only
        #[arg(long, default_value_t = 3)]
        domain: i32,
    },
    /// Expand a cluster host-range expression; `slurm` reads $SLURM_NODELIST
    Hosts { expr: String },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum StepProgram {
    Geogrid,
    Ungrib,
    Metgrid,
    Real,
    Wrfda,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    exit(match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_forecast(&cli.config),
        Command::Step { program, domain } => run_single_step(&cli.config, program, domain),
        Command::Hosts { expr } => expand_hosts(&expr),
    });
}

fn load(config_path: &Path) -> Option<(PipelineConfig, RunEnvironment)> {
    let mut config = match PipelineConfig::load(config_path) {
        Ok(config) => config,
        Err(error) => {
            error!("{error}");
            return None;
        }
    };
    if config.preflight_checks() {
        return None;
    }
    let run_env = match RunEnvironment::from_env() {
        Ok(run_env) => run_env,
        Err(error) => {
            error!("{error}");
            return None;
        }
    };
    Some((config, run_env))
}

fn run_forecast(config_path: &Path) -> i32 {
    let (config, run_env) = match load(config_path) {
        Some(loaded) => loaded,
        None => return 1,
    };
    let forecast = Forecast::new(&config, &run_env);
    match forecast.run() {
        Ok(()) => 0,
        Err(error) => {
            error!("The forecast failed: {error}");
            1
        }
    }
}

fn run_single_step(config_path: &Path, program: StepProgram, domain: i32) -> i32 {
    let (config, run_env) = match load(config_path) {
        Some(loaded) => loaded,
        None => return 1,
    };
    let forecast = Forecast::new(&config, &run_env);
    let result = match program {
        StepProgram::Geogrid => forecast.run_geogrid(),
        StepProgram::Ungrib => forecast.run_ungrib(),
        StepProgram::Metgrid => forecast.run_metgrid(),
        StepProgram::Real => forecast.run_real(),
        StepProgram::Wrfda => forecast.run_wrfda(&run_env.start, domain),
    };
    match result {
        Ok(()) => 0,
        Err(error) => {
            error!("{error}");
            1
        }
    }
}

fn expand_hosts(expr: &str) -> i32 {
    let src = if expr == "slurm" {
        match env::var("SLURM_NODELIST") {
            Ok(src) => src,
            Err(_) => {
                eprintln!("$SLURM_NODELIST not set");
                return 1;
            }
        }
    } else {
        expr.to_owned()
    };
    match hosts::parse_hosts(&src) {
        Ok(hosts) => {
            for host in hosts {
                println!("{host}");
            }
            0
        }
        Err(error) => {
            eprintln!("{}", error.pretty());
            1
        }
    }
}
