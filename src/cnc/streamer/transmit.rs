use std::time::Duration;

use chrono::Local;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{JogDirection, PendingJog, Streamer, CONNECT_TIMEOUT};
use crate::cnc::{
    events::MachineEvent,
    grbl::{
        machine::{DetectedIssue, MachineStatus},
        realtime::RealtimeCommand,
    },
};

impl Streamer {
    /*
        One pass of the transmit loop. Returns how long to wait before the next pass:
    short while the buffer has room for another line, long otherwise.
    */
    pub fn tick(&mut self, now: Instant) -> Duration {
        self.check_connect_timeout(now);
        let profile = self.threading.profile();
        if !self.is_open() {
            self.check_diagnostic_deadline(now);
            return profile.tx_long;
        }
        self.push_jog();
        self.send_lines();
        self.manage_cooling(now);
        self.query_status(now);
        self.detect_hang(now);
        self.check_diagnostic_deadline(now);
        if self.scheduler.can_send(&self.queues) {
            profile.tx_short
        } else {
            profile.tx_long
        }
    }

    fn check_connect_timeout(&mut self, now: Instant) {
        let Some(started) = self.connect_started else {
            return;
        };
        if self.status == MachineStatus::Connecting
            && now.saturating_duration_since(started) > CONNECT_TIMEOUT
        {
            warn!("no answer from the board after {:?}, closing", CONNECT_TIMEOUT);
            self.connect_started = None;
            self.close_requested = true;
        }
    }

    fn send_lines(&mut self) {
        while let Some(data) = self.scheduler.send_next(&mut self.queues) {
            self.projection.job_sent();
            self.outbox.extend_from_slice(&data);
            self.emit(MachineEvent::Sent(Local::now(), data));
        }
    }

    // Jogs wait for everything in flight so they never queue behind program lines.
    fn push_jog(&mut self) {
        if !self.capabilities().true_jogging || self.scheduler.pending_len() != 0 {
            return;
        }
        let continuous = self.settings.continuous_jog();
        match self.pending_jog.take() {
            None => {}
            Some(PendingJog::Cancel) => {
                if continuous {
                    self.send_immediate(RealtimeCommand::JogCancel.byte());
                }
            }
            Some(PendingJog::Toward(direction)) => {
                let command = self.jog_command(direction, continuous && direction != JogDirection::Home);
                self.queues.enqueue_front(command);
            }
        }
    }

    fn query_status(&mut self, now: Instant) {
        let period = self.threading.profile().status_query;
        let due = self
            .last_query
            .map_or(true, |last| now.saturating_duration_since(last) >= period);
        if due {
            self.last_query = Some(now);
            self.send_immediate(RealtimeCommand::StatusReport.byte());
        }
    }

    fn detect_hang(&mut self, now: Instant) {
        let silence = now.saturating_duration_since(self.last_status_report);
        if silence > self.threading.hang_threshold()
            && self.projection.last_issue() == DetectedIssue::Unknown
            && self.status == MachineStatus::Run
            && self.in_program()
        {
            warn!("no status report for {:?}", silence);
            self.raise_issue_if_running(DetectedIssue::StopResponding);
        }
    }

    /*
        Pauses a long laser job periodically: `on` of work, then `off` of hold. Only
    done when the firmware and the configuration allow an immediate hold.
    */
    fn manage_cooling(&mut self, now: Instant) {
        if !self.settings.auto_cooling() || !self.in_program() || self.hold_by_user {
            return;
        }
        let on = self.settings.auto_cooling_on();
        let cycle = (on + self.settings.auto_cooling_off()).as_nanos();
        if cycle == 0 {
            return;
        }
        let phase = self.projection.total_job_time(now).as_nanos() % cycle;
        let cooling = phase > on.as_nanos();
        if cooling == self.now_cooling {
            return;
        }
        self.now_cooling = cooling;
        if !(self.capabilities().laser_mode && self.config.laser_mode()) {
            debug!("cooling cycle skipped, laser mode not available");
            return;
        }
        let result = if cooling {
            info!("cooling pause");
            self.feed_hold(true)
        } else {
            info!("cooling pause over");
            self.cycle_start()
        };
        if let Err(e) = result {
            debug!("cooling cycle: {}", e);
        }
    }
}
