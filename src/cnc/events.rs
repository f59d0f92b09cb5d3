use std::time::Duration;

use chrono::{DateTime, Local};

use super::{
    grbl::machine::{DetectedIssue, MachineStatus},
    overrides::Overrides,
};

// Everything observers can follow, machine state and the raw traffic alike.
#[derive(Debug, Clone, PartialEq)]
pub enum MachineEvent {
    StatusChanged(MachineStatus),
    // Only issues the firmware or the link caused; operator actions are not alarms.
    IssueDetected(DetectedIssue),
    OverridesChanged(Overrides),
    LoopCountChanged(u32),
    ProgramLoading,
    ProgramLoaded {
        lines: usize,
        estimated_time: Duration,
    },
    ProgramEnded {
        summary: String,
        restarting: bool,
    },
    Sent(DateTime<Local>, Vec<u8>),
    Received(DateTime<Local>, String),
    Warning(DateTime<Local>, String),
}
