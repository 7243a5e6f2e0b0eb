use chrono::NaiveDateTime;
use std::io::Cursor;

use super::{MonitorError, Program, ProgressEvent, ProgressStream, TimeWindow};

fn window(start: &str, duration_hours: i64) -> TimeWindow {
    TimeWindow::new(
        NaiveDateTime::parse_from_str(start, "%Y-%m-%d %H:%M:%S").unwrap(),
        duration_hours,
    )
}

fn events(program: Program, window: TimeWindow, log: &str) -> Vec<ProgressEvent> {
    ProgressStream::new(program, window, Cursor::new(log)).collect()
}

fn percents(events: &[ProgressEvent]) -> Vec<i32> {
    events
        .iter()
        .filter(|e| !e.completed && e.artifact.is_none())
        .map(|e| e.percent)
        .collect()
}

const GEOGRID_LOG: &str = "\
Parsed 37 entries in GEOGRID.TBL
Processing domain 1 of 2
 Processing field 1 of 4
 Processing field 2 of 4
 Processing field 4 of 4
Processing domain 2 of 2
 Processing field 2 of 4
 Processing field 4 of 4
Successful completion of program geogrid.exe
";

#[test]
pub fn geogrid_two_domain_run() {
    let all = events(Program::Geogrid, window("2023-08-24 00:00:00", 48), GEOGRID_LOG);

    assert_eq!(percents(&all), vec![12, 25, 50, 75, 100]);

    let last = all.last().unwrap();
    assert!(last.completed);
    assert_eq!(last.percent, 100);
    assert_eq!(last.error, None);
    assert_eq!(all.iter().filter(|e| e.completed).count(), 1);
}

#[test]
pub fn percentages_never_go_backwards() {
    let all = events(Program::Geogrid, window("2023-08-24 00:00:00", 48), GEOGRID_LOG);

    let reported = percents(&all);
    for pair in reported.windows(2) {
        assert!(pair[0] < pair[1], "{} then {}", pair[0], pair[1]);
    }
}

#[test]
pub fn missing_success_marker_ends_the_stream_with_an_error() {
    let log = "\
Processing domain 1 of 2
 Processing field 1 of 4
 Processing field 2 of 4
";
    let all = events(Program::Geogrid, window("2023-08-24 00:00:00", 48), log);

    assert_eq!(percents(&all), vec![12, 25]);

    let last = all.last().unwrap();
    assert!(last.completed);
    assert_eq!(last.error, Some(MonitorError::MissingCompletion));
    assert_eq!(
        last.error.as_ref().unwrap().to_string(),
        "completion marker not found"
    );
    assert_eq!(all.iter().filter(|e| e.completed).count(), 1);
}

#[test]
pub fn ungrib_reprocess_offsets_the_second_half() {
    let log = "\
Inventory for date = 2023-08-24 06:00:00
Inventory for date = 2023-08-24 18:00:00
First pass done, doing a reprocess
Inventory for date = 2023-08-24 06:00:00
Inventory for date = 2023-08-24 18:00:00
Successful completion of program ungrib.exe
";
    let all = events(Program::Ungrib, window("2023-08-24 00:00:00", 24), log);

    // ungrib logs never print a 100% line, the success marker carries it
    assert_eq!(percents(&all), vec![12, 37, 62, 87]);
    let last = all.last().unwrap();
    assert!(last.completed);
    assert_eq!(last.percent, 100);
}

#[test]
pub fn ungrib_rejects_unparseable_inventory_dates() {
    let log = "Inventory for date = whenever\n";
    let all = events(Program::Ungrib, window("2023-08-24 00:00:00", 24), log);

    assert_eq!(all.len(), 1);
    let only = &all[0];
    assert!(only.completed);
    assert_eq!(
        only.error.as_ref().unwrap().to_string(),
        "malformed inventory line `Inventory for date = whenever`"
    );
}

#[test]
pub fn metgrid_scales_progress_by_domain() {
    let log = "\
Processing domain 1 of 2
Preparing to process output time 2023-08-24_06
Preparing to process output time 2023-08-24_18
Processing domain 2 of 2
Preparing to process output time 2023-08-24_06
Preparing to process output time 2023-08-24_18
Successful completion of program metgrid.exe
";
    let all = events(Program::Metgrid, window("2023-08-24 00:00:00", 24), log);

    assert_eq!(percents(&all), vec![12, 37, 62, 87]);
    let last = all.last().unwrap();
    assert!(last.completed);
    assert_eq!(last.percent, 100);
}

#[test]
pub fn repeated_output_times_emit_once() {
    let log = "\
Preparing to process output time 2023-08-24_06
Preparing to process output time 2023-08-24_06
Successful completion of program metgrid.exe
";
    let all = events(Program::Metgrid, window("2023-08-24 00:00:00", 24), log);

    assert_eq!(all.len(), 2);
    assert_eq!(percents(&all), vec![25]);
}

#[test]
pub fn real_tracks_loop_timestamps() {
    let log = "\
Domain  1: Current date being processed: 2023-08-24_12:00:00.0000, which is loop # 13 out of 49
Domain  1: Current date being processed: 2023-08-25_00:00:00.0000, which is loop # 25 out of 49
Domain  1: Current date being processed: 2023-08-26_00:00:00.0000, which is loop # 49 out of 49
SUCCESS COMPLETE REAL_EM INIT
";
    let all = events(Program::Real, window("2023-08-24 00:00:00", 48), log);

    assert_eq!(percents(&all), vec![25, 50, 100]);
    let last = all.last().unwrap();
    assert!(last.completed);
    assert_eq!(last.percent, 100);
}

#[test]
pub fn wrfda_reports_success_only() {
    let log = "\
 Set up observations (ob)
 WRF-Var completed successfully
";
    let all = events(Program::Wrfda, window("2023-08-24 00:00:00", 3), log);

    assert_eq!(all.len(), 1);
    assert_eq!(all[0].percent, 100);
    assert!(all[0].completed);
    assert_eq!(all[0].error, None);
}

const WRF_LOG: &str = "\
 Ntasks in X            2 , ntasks in Y            2
Timing for Writing wrfout_d01_2023-08-24_00:00:00 for domain    1:    0.96753 elapsed seconds
Timing for main (dt= 27.00): time 2023-08-24_06:00:00 on domain   1:    1.89038 elapsed seconds
Timing for main: time 2023-08-24_12:00:00 on domain   1:    1.50421 elapsed seconds
Timing for processing lateral boundary for domain        1:    0.50421 elapsed seconds
Timing for Writing wrfout_d01_2023-08-24_12:00:00 for domain    1:    1.06753 elapsed seconds
Timing for Writing restart for domain    1:   10.45000 elapsed seconds
wrf: SUCCESS COMPLETE WRF
";

#[test]
pub fn wrf_reports_artifacts_with_the_current_percentage() {
    let all = events(Program::Wrf, window("2023-08-24 00:00:00", 48), WRF_LOG);

    let artifacts: Vec<(&str, i32)> = all
        .iter()
        .filter_map(|e| e.artifact.as_deref().map(|name| (name, e.percent)))
        .collect();
    assert_eq!(
        artifacts,
        vec![
            ("wrfout_d01_2023-08-24_00:00:00", 0),
            ("wrfout_d01_2023-08-24_12:00:00", 25),
            ("restart", 25),
        ]
    );

    // the plain calc line counts just like the `dt=` one
    assert_eq!(percents(&all), vec![12, 25]);

    let last = all.last().unwrap();
    assert!(last.completed);
    assert_eq!(last.percent, 100);
    assert_eq!(last.error, None);
}

#[test]
pub fn wrf_malformed_calc_line_is_fatal() {
    let log = "\
Timing for main (dt= 27.00): time 2023-08-24_06:00:00 on domain   1:    1.89038 elapsed seconds
Timing for main: time later on domain 1
";
    let mut stream = ProgressStream::new(
        Program::Wrf,
        window("2023-08-24 00:00:00", 48),
        Cursor::new(log),
    );

    assert_eq!(stream.next().unwrap().percent, 12);

    let last = stream.next().unwrap();
    assert!(last.completed);
    assert_eq!(last.percent, 12);
    assert_eq!(
        last.error.as_ref().unwrap().to_string(),
        "malformed calculation line `Timing for main: time later on domain 1`"
    );

    assert_eq!(stream.next(), None);
}

#[test]
pub fn wrf_malformed_io_line_is_fatal() {
    let log = "Timing for Writing nothing in particular\n";
    let all = events(Program::Wrf, window("2023-08-24 00:00:00", 48), log);

    assert_eq!(all.len(), 1);
    assert_eq!(
        all[0].error.as_ref().unwrap().to_string(),
        "malformed I/O line `Timing for Writing nothing in particular`"
    );
}
