use crate::config::{parse_short_date, PipelineConfig, RunEnvironment};
use crate::forecast::{Forecast, ForecastErrors};
use crate::hosts::NodeList;
use crate::progress::Program;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tempfile::TempDir;

fn config(workdir: &Path) -> PipelineConfig {
    PipelineConfig {
        geogrid_procs: 4,
        metgrid_procs: 4,
        real_procs: 8,
        wrfda_procs: 8,
        wrf_procs: 36,
        mpi_options: "--oversubscribe".to_string(),
        cores_per_node: 16,
        ensemble_members: 2,
        ensemble_parallelism: 2,
        workdir: workdir.to_owned(),
        root_dir: workdir.to_owned(),
        postproc_workers: 2,
        retry_pause_secs: 0,
        postproc_rules: BTreeMap::new(),
    }
}

fn environment(nodes: Vec<String>) -> RunEnvironment {
    RunEnvironment {
        start: parse_short_date("2023-08-24-12").unwrap(),
        duration_hours: 48,
        nodes,
    }
}

#[test]
pub fn member_directories_follow_the_start_hour() {
    let config = config(Path::new("/work"));
    let env = environment(vec!["n1".to_string()]);
    let forecast = Forecast::new(&config, &env);

    assert_eq!(
        forecast.member_workdir(0),
        ("wrf12".to_string(), "control".to_string())
    );
    assert_eq!(
        forecast.member_workdir(3),
        ("wrf12_ens03".to_string(), "ensemble n. 3".to_string())
    );
}

#[test]
pub fn node_demand_rounds_up_to_whole_nodes() {
    let mut config = config(Path::new("/work"));
    let env = environment(vec![]);

    config.wrf_procs = 36;
    assert_eq!(Forecast::new(&config, &env).nodes_needed(), 3);
    config.wrf_procs = 32;
    assert_eq!(Forecast::new(&config, &env).nodes_needed(), 2);
    config.wrf_procs = 1;
    assert_eq!(Forecast::new(&config, &env).nodes_needed(), 1);
}

#[test]
pub fn wrf_command_lists_the_allocated_nodes() {
    let config = config(Path::new("/work"));
    let env = environment(vec![]);
    let forecast = Forecast::new(&config, &env);

    let nodes = NodeList(vec!["a".to_string(), "b".to_string()]);
    assert_eq!(
        forecast.wrf_command(&nodes),
        "mpirun --oversubscribe -hosts a,b -n 36 ./wrf.exe"
    );
    assert_eq!(
        forecast.wrf_command(&NodeList::default()),
        "mpirun --oversubscribe  -n 36 ./wrf.exe"
    );
}

#[test]
pub fn members_fail_fast_without_free_nodes() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path());
    let env = environment(vec![]);
    let forecast = Forecast::new(&config, &env);

    let error = forecast.run_member(1).unwrap_err();
    assert!(matches!(error, ForecastErrors::NoFreeNodes));
    assert_eq!(error.to_string(), "Not enough free nodes to run WRF");
}

#[test]
pub fn step_reads_the_log_left_by_the_command() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path());
    let env = environment(vec![]);
    let forecast = Forecast::new(&config, &env);

    let cmd = "printf 'Processing domain 1 of 1\\n\
               Processing field 1 of 2\\n\
               Processing field 2 of 2\\n\
               Successful completion of program geogrid.exe\\n' > geogrid.log.0000";
    forecast
        .run_step(
            Program::Geogrid,
            tmp.path(),
            cmd,
            "geogrid.log.0000",
            "{geogrid.detail.log,geogrid.log.????}",
        )
        .unwrap();
}

#[test]
pub fn step_without_completion_line_still_succeeds() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path());
    let env = environment(vec![]);
    let forecast = Forecast::new(&config, &env);

    let cmd = "printf 'Processing domain 1 of 1\\n\
               Processing field 1 of 2\\n' > geogrid.log.0000";
    forecast
        .run_step(
            Program::Geogrid,
            tmp.path(),
            cmd,
            "geogrid.log.0000",
            "{geogrid.detail.log,geogrid.log.????}",
        )
        .unwrap();
}

#[test]
pub fn malformed_step_logs_fail_the_step() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path());
    let env = environment(vec![]);
    let forecast = Forecast::new(&config, &env);

    let cmd =
        "printf 'Preparing to process output time whenever\\n' > metgrid.log.0000";
    let error = forecast
        .run_step(
            Program::Metgrid,
            tmp.path(),
            cmd,
            "metgrid.log.0000",
            "{metgrid.detail.log,metgrid.log.????}",
        )
        .unwrap_err();

    assert!(matches!(error, ForecastErrors::BrokenLog { .. }));
    assert_eq!(
        error.to_string(),
        "metgrid process failed: malformed output time line `Preparing to process output time whenever`"
    );
}

#[test]
pub fn monitor_records_artifacts_without_restarts() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path());
    let env = environment(vec![]);
    let forecast = Forecast::new(&config, &env);

    let member_dir = tmp.path().join("wrf12");
    fs::create_dir_all(&member_dir).unwrap();
    let log_path = member_dir.join("rsl.out.0000");
    fs::write(
        &log_path,
        "Timing for Writing wrfout_d01_2023-08-24_12:00:00 for domain    1:    1.20 elapsed seconds\n\
         Timing for Writing restart for domain    1:    9.01 elapsed seconds\n\
         wrf: SUCCESS COMPLETE WRF\n",
    )
    .unwrap();
    let produced = tmp.path().join("output_files.log");

    // flag already raised: one pass over the log, then end of stream
    let stop = Arc::new(AtomicBool::new(true));
    let found = forecast.monitor_member("control", &member_dir, &log_path, &produced, stop);

    assert!(found);
    let recorded = fs::read_to_string(&produced).unwrap();
    assert_eq!(
        recorded,
        format!(
            "{}\n",
            member_dir.join("wrfout_d01_2023-08-24_12:00:00").display()
        )
    );
}

#[test]
pub fn monitor_gives_up_when_the_log_never_appears() {
    let tmp = TempDir::new().unwrap();
    let config = config(tmp.path());
    let env = environment(vec![]);
    let forecast = Forecast::new(&config, &env);

    let member_dir = tmp.path().join("wrf12");
    let log_path = member_dir.join("rsl.out.0000");
    let produced = tmp.path().join("output_files.log");

    let stop = Arc::new(AtomicBool::new(true));
    let found = forecast.monitor_member("control", &member_dir, &log_path, &produced, stop);

    assert!(!found);
    assert!(!produced.exists());
}

#[test]
pub fn postprocessing_pipeline_journals_completions() {
    let tmp = TempDir::new().unwrap();
    let mut config = config(tmp.path());
    config.postproc_rules = BTreeMap::from([("^wrfout".to_string(), "true".to_string())]);
    let env = environment(vec![]);
    let forecast = Forecast::new(&config, &env);

    let sim = config.simulation_workdir(&env.start);
    fs::create_dir_all(&sim).unwrap();
    let produced = sim.join("output_files.log");
    fs::write(
        &produced,
        format!(
            "{}\nCOMPLETED\n",
            sim.join("wrf12/wrfout_d03_2023-08-24_13:00:00").display()
        ),
    )
    .unwrap();

    let report = forecast
        .run_post_processing(&produced, Arc::new(AtomicBool::new(false)))
        .unwrap();

    assert!(report.failures.is_empty());
    assert!(report.fatal.is_empty());
    let journal = fs::read_to_string(sim.join("postprocd_files.log")).unwrap();
    assert_eq!(
        journal,
        format!(
            "{{\"domain\": 3, \"progr\": 1, \"kind\": \"RawOutput\", \"file\": \"{}\"}}\n",
            sim.join("results/out/out_regr_2023-08-24_13:00:00.grb").display()
        )
    );
}
