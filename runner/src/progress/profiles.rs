use once_cell::sync::Lazy;
use regex::Regex;

use super::{LineRule, Program, RuleKind, Scale, Stamp, Trigger};

pub(crate) fn rules(program: Program) -> &'static [LineRule] {
    match program {
        Program::Geogrid => GEOGRID.as_slice(),
        Program::Ungrib => UNGRIB.as_slice(),
        Program::Metgrid => METGRID.as_slice(),
        Program::Real => REAL.as_slice(),
        Program::Wrfda => WRFDA.as_slice(),
        Program::Wrf => WRF.as_slice(),
    }
}

fn re(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap()
}

static GEOGRID: Lazy<Vec<LineRule>> = Lazy::new(|| {
    vec![
        LineRule {
            trigger: Trigger::Pattern,
            detail: Some(re(r"Processing field (\d+) of (\d+)")),
            label: "field",
            kind: RuleKind::UnitProgress,
        },
        LineRule {
            trigger: Trigger::Pattern,
            detail: Some(re(r"Processing domain (\d+) of (\d+)")),
            label: "domain",
            kind: RuleKind::DomainChange,
        },
        LineRule {
            trigger: Trigger::Contains("Successful completion of program geogrid.exe"),
            detail: None,
            label: "success",
            kind: RuleKind::Success,
        },
    ]
});

static UNGRIB: Lazy<Vec<LineRule>> = Lazy::new(|| {
    vec![
        LineRule {
            trigger: Trigger::Pattern,
            detail: Some(re(r"Inventory for date = (.+)")),
            label: "inventory",
            kind: RuleKind::TimeMark {
                stamp: Stamp::DateTime,
                group: 1,
                scale: Scale::Half,
            },
        },
        LineRule {
            trigger: Trigger::Contains("First pass done, doing a reprocess"),
            detail: None,
            label: "reprocess",
            kind: RuleKind::HalfMark,
        },
        LineRule {
            trigger: Trigger::Contains("Successful completion of program ungrib.exe"),
            detail: None,
            label: "success",
            kind: RuleKind::Success,
        },
    ]
});

static METGRID: Lazy<Vec<LineRule>> = Lazy::new(|| {
    vec![
        LineRule {
            trigger: Trigger::Pattern,
            detail: Some(re(r"Preparing to process output time (.+)")),
            label: "output time",
            kind: RuleKind::TimeMark {
                stamp: Stamp::DateHour,
                group: 1,
                scale: Scale::PerDomain,
            },
        },
        LineRule {
            trigger: Trigger::Pattern,
            detail: Some(re(r"Processing domain (\d+) of (\d+)")),
            label: "domain",
            kind: RuleKind::DomainChange,
        },
        LineRule {
            trigger: Trigger::Contains("Successful completion of program metgrid.exe"),
            detail: None,
            label: "success",
            kind: RuleKind::Success,
        },
    ]
});

static REAL: Lazy<Vec<LineRule>> = Lazy::new(|| {
    vec![
        LineRule {
            trigger: Trigger::Pattern,
            detail: Some(re(
                r"Domain  1: Current date being processed: (\S.+), which is loop #\s*(\d+)\s*out of\s*(\d+)",
            )),
            label: "process",
            kind: RuleKind::TimeMark {
                stamp: Stamp::DateTimeUnderscore,
                group: 1,
                scale: Scale::Full,
            },
        },
        LineRule {
            trigger: Trigger::Contains("SUCCESS COMPLETE REAL_EM INIT"),
            detail: None,
            label: "success",
            kind: RuleKind::Success,
        },
    ]
});

static WRFDA: Lazy<Vec<LineRule>> = Lazy::new(|| {
    vec![LineRule {
        trigger: Trigger::Contains("WRF-Var completed successfully"),
        detail: None,
        label: "success",
        kind: RuleKind::Success,
    }]
});

static WRF: Lazy<Vec<LineRule>> = Lazy::new(|| {
    vec![
        // with the timestep variant first: a calc line missing the
        // `dt=` part falls through to the plain form below
        LineRule {
            trigger: Trigger::Pattern,
            detail: Some(re(
                r"Timing for main \(dt= *([\d|\.]+)\): time (\d{4}-\d{2}-\d{2}_\d{2}:\d{2}:\d{2}) on domain +(\d+): +([\d|\.]+) elapsed seconds",
            )),
            label: "calculation",
            kind: RuleKind::TimeMark {
                stamp: Stamp::DateTimeUnderscore,
                group: 2,
                scale: Scale::Full,
            },
        },
        LineRule {
            trigger: Trigger::Prefix("Timing for main"),
            detail: Some(re(
                r"Timing for main: time (\d{4}-\d{2}-\d{2}_\d{2}:\d{2}:\d{2}) on domain +(\d+): +([\d|\.]+) elapsed seconds",
            )),
            label: "calculation",
            kind: RuleKind::TimeMark {
                stamp: Stamp::DateTimeUnderscore,
                group: 1,
                scale: Scale::Full,
            },
        },
        LineRule {
            trigger: Trigger::Prefix("Timing for Writing"),
            detail: Some(re(
                r"Timing for Writing (\S+|filter output) for domain +(\d+): +([\d|\.]+) elapsed seconds",
            )),
            label: "I/O",
            kind: RuleKind::Artifact,
        },
        LineRule {
            trigger: Trigger::Prefix("Timing for processing"),
            detail: Some(re(
                r"Timing for processing (.+) for domain +(\d+): +([\d|\.]+) elapsed seconds",
            )),
            label: "I/O",
            kind: RuleKind::InputMark,
        },
        LineRule {
            trigger: Trigger::Contains("wrf: SUCCESS COMPLETE WRF"),
            detail: None,
            label: "success",
            kind: RuleKind::Success,
        },
    ]
});
