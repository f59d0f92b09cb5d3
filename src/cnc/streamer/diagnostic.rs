use std::{mem::replace, time::Duration};

use tokio::time::Instant;
use tracing::{info, warn};

use super::Streamer;
use crate::{
    cnc::{
        command::Command,
        grbl::machine::MachineStatus,
        scheduler::{HistoryRow, Queues},
    },
    error::{StreamerError, StreamerResult},
};

// A session still open after this long is closed by the engine itself.
pub const DIAGNOSTIC_DEADLINE: Duration = Duration::from_secs(30);

pub(super) struct DiagnosticState {
    pub(super) saved: Queues,
    deadline: Instant,
}

// What a diagnostic session has seen so far.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiagnosticProgress {
    pub rows: Vec<HistoryRow>,
    // Every line of the session was sent and answered.
    pub drained: bool,
    pub active: bool,
}

impl Streamer {
    /*
        Swaps in a private pair of queues so the lines and answers of a config exchange
    stay out of the operator's history. Lines still in flight from the normal queues
    keep updating their own rows.
    */
    pub fn begin_diagnostic(&mut self, lines: &[String], now: Instant) -> StreamerResult<()> {
        if !self.is_open() {
            return Err(StreamerError::NotConnected);
        }
        if self.diagnostic.is_some() {
            return Err(StreamerError::SessionBusy);
        }
        if self.status != MachineStatus::Idle {
            return Err(self.invalid("diagnostic session"));
        }
        let id = self.next_queues_id;
        self.next_queues_id += 1;
        let saved = replace(&mut self.queues, Queues::new(id));
        self.diagnostic = Some(DiagnosticState {
            saved,
            deadline: now + DIAGNOSTIC_DEADLINE,
        });
        for line in lines {
            self.queues.enqueue(Command::new(line.as_str()));
        }
        info!("diagnostic session {} started with {} lines", id, lines.len());
        Ok(())
    }

    pub fn end_diagnostic(&mut self) {
        if let Some(state) = self.diagnostic.take() {
            info!("diagnostic session {} ended", self.queues.id());
            self.queues = state.saved;
        }
    }

    pub fn diagnostic_active(&self) -> bool {
        self.diagnostic.is_some()
    }

    pub fn diagnostic_progress(&self) -> DiagnosticProgress {
        if self.diagnostic.is_none() {
            return DiagnosticProgress::default();
        }
        DiagnosticProgress {
            rows: self.queues.history().to_vec(),
            drained: self.queues.to_send().is_empty() && self.scheduler.is_drained(),
            active: true,
        }
    }

    pub(super) fn check_diagnostic_deadline(&mut self, now: Instant) {
        if let Some(state) = &self.diagnostic {
            if now >= state.deadline {
                warn!("diagnostic session expired");
                self.end_diagnostic();
            }
        }
    }
}
