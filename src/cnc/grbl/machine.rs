use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MachineStatus {
    Unknown,
    Disconnected,
    Connecting,
    Idle,
    Run,
    Hold,
    Door,
    Home,
    Alarm,
    Check,
    Jog,
    Queue,
    Cooling,
}

impl MachineStatus {
    // Name as reported by Grbl, substate suffix ("Hold:0") already removed.
    pub fn from_report(name: &str) -> Option<MachineStatus> {
        Some(match name {
            "Idle" => MachineStatus::Idle,
            "Run" => MachineStatus::Run,
            "Hold" => MachineStatus::Hold,
            "Door" => MachineStatus::Door,
            "Home" => MachineStatus::Home,
            "Alarm" => MachineStatus::Alarm,
            "Check" => MachineStatus::Check,
            "Jog" => MachineStatus::Jog,
            "Queue" => MachineStatus::Queue,
            _ => return None,
        })
    }
    // Time spent in any of these counts as pause for the job clock.
    pub fn is_paused(self) -> bool {
        !matches!(self, MachineStatus::Run | MachineStatus::Idle)
    }
}

/*
    Why a job was interrupted. Negative codes are caused by the operator and are never
raised as alarms; positive ones come from the firmware or the link.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DetectedIssue {
    Unknown,
    ManualReset,
    ManualDisconnect,
    ManualAbort,
    StopResponding,
    UnexpectedReset,
    UnexpectedDisconnect,
}

impl DetectedIssue {
    pub fn code(self) -> i8 {
        match self {
            DetectedIssue::Unknown => 0,
            DetectedIssue::ManualReset => -1,
            DetectedIssue::ManualDisconnect => -2,
            DetectedIssue::ManualAbort => -3,
            DetectedIssue::StopResponding => 1,
            DetectedIssue::UnexpectedReset => 3,
            DetectedIssue::UnexpectedDisconnect => 4,
        }
    }
    pub fn is_user_caused(self) -> bool {
        self.code() < 0
    }
    pub fn is_alarm(self) -> bool {
        self.code() > 0
    }
}
