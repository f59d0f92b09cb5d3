use std::time::Duration;

use ndarray::Array1;
use tokio::time::Instant;

use super::grbl::machine::DetectedIssue;

/*
    Job clock and counters. Counts are kept raw; lines queued ahead of the program (the
header on a fresh start, the rebuilt state on a resume) are subtracted again
(`continue_correction`) so that sent/executed refer to program lines only.
*/
#[derive(Debug, Clone)]
pub struct TimeProjection {
    estimated_target: Duration,
    estimated_progress: Duration,
    start: Option<Instant>,
    end: Option<Instant>,
    pause_begin: Option<Instant>,
    cumulated_pause: Duration,
    started: bool,
    completed: bool,
    target_count: usize,
    executed_count: usize,
    sent_count: usize,
    error_count: usize,
    continue_correction: usize,
    last_issue: DetectedIssue,
    last_known_wco: Array1<f64>,
}

impl Default for TimeProjection {
    fn default() -> Self {
        TimeProjection {
            estimated_target: Duration::ZERO,
            estimated_progress: Duration::ZERO,
            start: None,
            end: None,
            pause_begin: None,
            cumulated_pause: Duration::ZERO,
            started: false,
            completed: false,
            target_count: 0,
            executed_count: 0,
            sent_count: 0,
            error_count: 0,
            continue_correction: 0,
            last_issue: DetectedIssue::Unknown,
            last_known_wco: Array1::zeros(3),
        }
    }
}

impl TimeProjection {
    pub fn new() -> Self {
        TimeProjection::default()
    }
    pub fn reset(&mut self) {
        *self = TimeProjection::default();
    }
    pub fn in_program(&self) -> bool {
        self.started && !self.completed
    }
    pub fn target(&self) -> usize {
        self.target_count
    }
    pub fn sent(&self) -> usize {
        self.sent_count.saturating_sub(self.continue_correction)
    }
    pub fn executed(&self) -> usize {
        self.executed_count.saturating_sub(self.continue_correction)
    }
    pub fn error_count(&self) -> usize {
        self.error_count
    }
    pub fn estimated_target(&self) -> Duration {
        self.estimated_target
    }
    pub fn last_issue(&self) -> DetectedIssue {
        self.last_issue
    }
    pub fn set_issue(&mut self, issue: DetectedIssue) {
        self.last_issue = issue;
    }
    pub fn last_known_wco(&self) -> &Array1<f64> {
        &self.last_known_wco
    }
    // Remembered only while a job runs, so a resume can restore the offset.
    pub fn set_last_known_wco(&mut self, wco: &Array1<f64>) {
        if self.in_program() {
            self.last_known_wco = wco.clone();
        }
    }

    pub fn total_job_time(&self, now: Instant) -> Duration {
        match (self.start, self.end) {
            (Some(start), Some(end)) if self.completed => end.saturating_duration_since(start),
            (Some(start), _) if self.started => now.saturating_duration_since(start),
            _ => Duration::ZERO,
        }
    }
    fn total_pauses(&self, now: Instant) -> Duration {
        match self.pause_begin {
            Some(begin) => self.cumulated_pause + now.saturating_duration_since(begin),
            None => self.cumulated_pause,
        }
    }
    // Total time scaled by how far real time runs ahead of or behind the estimate.
    pub fn projected_target(&self, now: Instant) -> Duration {
        if !self.started {
            return Duration::ZERO;
        }
        let done = self.estimated_progress.as_secs_f64();
        if done == 0.0 {
            return self.estimated_target;
        }
        let pauses = self.total_pauses(now);
        let real = self.total_job_time(now).saturating_sub(pauses).as_secs_f64();
        let target = self.estimated_target.as_secs_f64();
        Duration::from_secs_f64(real * target / done) + pauses
    }

    // `added` counts the lines queued ahead of the program (homing, header, passes).
    pub fn job_start(&mut self, estimated: Duration, target_count: usize, added: usize, now: Instant) {
        if self.started {
            return;
        }
        *self = TimeProjection {
            estimated_target: estimated,
            target_count,
            start: Some(now),
            started: true,
            continue_correction: added,
            ..TimeProjection::default()
        };
    }
    /*
        Picks the clock back up for a resume from `position`. `added` is the number of
    lines queued in front of the program to rebuild its state.
    */
    pub fn job_continue(
        &mut self,
        estimated: Duration,
        program_len: usize,
        position: usize,
        added: usize,
        now: Instant,
    ) {
        if self.started {
            return;
        }
        if self.estimated_target.is_zero() {
            self.estimated_target = estimated;
        }
        if self.target_count == 0 {
            self.target_count = program_len;
        }
        if self.start.is_none() {
            self.start = Some(now);
        }
        self.pause_begin = None;
        self.completed = false;
        self.started = true;
        self.executed_count = position;
        self.sent_count = position;
        self.last_issue = DetectedIssue::Unknown;
        self.continue_correction = added;
    }
    pub fn job_sent(&mut self) {
        if self.in_program() {
            self.sent_count += 1;
        }
    }
    pub fn job_error(&mut self) {
        if self.in_program() {
            self.error_count += 1;
        }
    }
    pub fn job_executed(&mut self, progress: Duration) {
        if self.in_program() {
            self.executed_count += 1;
            self.estimated_progress = progress;
        }
    }
    pub fn job_pause(&mut self, now: Instant) {
        if self.in_program() && self.pause_begin.is_none() {
            self.pause_begin = Some(now);
        }
    }
    pub fn job_resume(&mut self, now: Instant) {
        if self.in_program() {
            if let Some(begin) = self.pause_begin.take() {
                self.cumulated_pause += now.saturating_duration_since(begin);
            }
        }
    }
    // True only for the call that actually ended a running job.
    pub fn job_end(&mut self, now: Instant) -> bool {
        if !self.in_program() {
            return false;
        }
        self.job_resume(now);
        self.end = Some(now);
        self.completed = true;
        self.started = false;
        true
    }
}
