use thiserror::Error;

use crate::cnc::grbl::machine::MachineStatus;

#[derive(Debug, Error)]
pub enum StreamerError {
    #[error("machine is not connected")]
    NotConnected,
    #[error("{operation} is not possible while the machine is {status:?}")]
    InvalidState {
        operation: &'static str,
        status: MachineStatus,
    },
    #[error("no program loaded")]
    NoProgram,
    #[error("resume position {position} is past the end of the program ({len} lines)")]
    ResumePosition { position: usize, len: usize },
    #[error("a diagnostic session is already active")]
    SessionBusy,
    #[error("diagnostic session ended before completion")]
    SessionClosed,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("grbl rejected the configuration request ({0})")]
    ConfigRejected(String),
    #[error("wrong number of config parameters found ({found}/{expected})")]
    ConfigIncomplete { found: usize, expected: usize },
    #[error("grbl rejected {} configuration line(s): {}", .0.len(), .0.join(", "))]
    WriteConfig(Vec<String>),
    #[error("the machine thread has stopped")]
    EngineStopped,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("settings serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StreamerResult<T> = Result<T, StreamerError>;
