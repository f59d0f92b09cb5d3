mod diagnostic;
mod receive;
mod transmit;

use std::{mem::take, time::Duration};

use chrono::Local;
use itertools::Itertools;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

pub use self::diagnostic::{DiagnosticProgress, DIAGNOSTIC_DEADLINE};
use self::diagnostic::DiagnosticState;
use super::{
    command::{Command, CommandStatus},
    events::MachineEvent,
    gcode::format_number,
    grbl::{
        config::GrblConfig,
        machine::{DetectedIssue, MachineStatus},
        realtime::{parse_immediate, RealtimeCommand},
        version::{Capabilities, GrblVersion},
    },
    overrides::Overrides,
    program::Program,
    scheduler::{HistoryRow, HistorySlot, Queues, Scheduler},
    state_builder::build_continuation,
    threading::{StreamingMode, ThreadingMode},
    time_projection::TimeProjection,
};
use crate::{
    error::{StreamerError, StreamerResult},
    settings::{self, Settings},
    util::format_bytes::format_byte_string,
};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JogDirection {
    N,
    NE,
    E,
    SE,
    S,
    SW,
    W,
    NW,
    Up,
    Down,
    Home,
}

impl JogDirection {
    fn x_sign(self) -> Option<f64> {
        match self {
            JogDirection::NE | JogDirection::E | JogDirection::SE => Some(1.0),
            JogDirection::NW | JogDirection::W | JogDirection::SW => Some(-1.0),
            _ => None,
        }
    }
    fn y_sign(self) -> Option<f64> {
        match self {
            JogDirection::NW | JogDirection::N | JogDirection::NE => Some(1.0),
            JogDirection::SW | JogDirection::S | JogDirection::SE => Some(-1.0),
            _ => None,
        }
    }
    fn z_sign(self) -> Option<f64> {
        match self {
            JogDirection::Up => Some(1.0),
            JogDirection::Down => Some(-1.0),
            _ => None,
        }
    }
    fn is_z(self) -> bool {
        self.z_sign().is_some()
    }
    // "X10.0Y-10.0" for a relative move of `step` in this direction.
    fn relative_words(self, step: f64) -> String {
        [("X", self.x_sign()), ("Y", self.y_sign()), ("Z", self.z_sign())]
            .into_iter()
            .filter_map(|(axis, sign)| sign.map(|sign| format!("{}{:.1}", axis, sign * step)))
            .join("")
    }
}

// A jog waiting for the pending queue to drain before it goes out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingJog {
    Toward(JogDirection),
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineSnapshot {
    pub status: MachineStatus,
    pub version: Option<GrblVersion>,
    pub capabilities: Capabilities,
    pub machine_position: Array1<f64>,
    pub work_offset: Array1<f64>,
    pub work_position: Array1<f64>,
    pub feed: f64,
    pub spindle: f64,
    pub buffer_size: usize,
    pub buffer_used: usize,
    pub overrides: Overrides,
    pub issue: DetectedIssue,
    pub in_program: bool,
    pub program_lines: usize,
    pub program_target: usize,
    pub program_sent: usize,
    pub program_executed: usize,
    pub program_errors: usize,
    pub job_time: Duration,
    pub projected_time: Duration,
    pub loop_count: u32,
    pub history_len: usize,
    pub streaming_mode: StreamingMode,
    pub threading_mode: ThreadingMode,
}

/*
    The whole streaming engine as a plain state machine. It never touches the transport:
callers feed it received lines, the passage of time and operator requests, then drain
the bytes to write and the events to publish. All of it runs on one task, so every
transition here is atomic with respect to the others.
*/
pub struct Streamer {
    settings: Settings,
    status: MachineStatus,
    version: Option<GrblVersion>,
    config: GrblConfig,
    machine_position: Array1<f64>,
    work_offset: Array1<f64>,
    feed: f64,
    spindle: f64,
    overrides: Overrides,
    scheduler: Scheduler,
    queues: Queues,
    next_queues_id: u64,
    diagnostic: Option<DiagnosticState>,
    program: Option<Program>,
    projection: TimeProjection,
    loop_count: u32,
    threading: ThreadingMode,
    hold_by_user: bool,
    now_cooling: bool,
    pending_jog: Option<PendingJog>,
    connect_started: Option<Instant>,
    close_requested: bool,
    last_query: Option<Instant>,
    last_status_report: Instant,
    outbox: Vec<u8>,
    events: Vec<MachineEvent>,
}

impl Streamer {
    pub fn new(settings: Settings, now: Instant) -> Streamer {
        let version = settings.last_grbl_version();
        let config = settings.grbl_configuration();
        let threading = settings.threading_mode();
        let scheduler = Scheduler::new(settings.streaming_mode());
        Streamer {
            settings,
            status: MachineStatus::Disconnected,
            version,
            config,
            machine_position: Array1::zeros(3),
            work_offset: Array1::zeros(3),
            feed: 0.0,
            spindle: 0.0,
            overrides: Overrides::default(),
            scheduler,
            queues: Queues::new(0),
            next_queues_id: 1,
            diagnostic: None,
            program: None,
            projection: TimeProjection::new(),
            loop_count: 1,
            threading,
            hold_by_user: false,
            now_cooling: false,
            pending_jog: None,
            connect_started: None,
            close_requested: false,
            last_query: None,
            last_status_report: now,
            outbox: Vec::new(),
            events: Vec::new(),
        }
    }

    /*
        Accessors
    */
    pub fn status(&self) -> MachineStatus {
        self.status
    }
    pub fn is_open(&self) -> bool {
        self.status != MachineStatus::Disconnected
    }
    pub fn version(&self) -> Option<GrblVersion> {
        self.version
    }
    pub fn capabilities(&self) -> Capabilities {
        self.version.into()
    }
    pub fn config(&self) -> &GrblConfig {
        &self.config
    }
    pub fn settings(&self) -> &Settings {
        &self.settings
    }
    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }
    pub fn overrides(&self) -> Overrides {
        self.overrides
    }
    pub fn in_program(&self) -> bool {
        self.projection.in_program()
    }
    pub fn projection(&self) -> &TimeProjection {
        &self.projection
    }
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }
    pub fn program(&self) -> Option<&Program> {
        self.program.as_ref()
    }
    pub fn machine_position(&self) -> &Array1<f64> {
        &self.machine_position
    }
    pub fn work_offset(&self) -> &Array1<f64> {
        &self.work_offset
    }
    // The operator's queues, even while a diagnostic session has swapped its own in.
    fn main_queues(&self) -> &Queues {
        match &self.diagnostic {
            Some(state) => &state.saved,
            None => &self.queues,
        }
    }
    fn main_queues_mut(&mut self) -> &mut Queues {
        match &mut self.diagnostic {
            Some(state) => &mut state.saved,
            None => &mut self.queues,
        }
    }
    pub fn history(&self) -> &[HistoryRow] {
        self.main_queues().history()
    }
    pub fn history_range(&self, start: usize, count: usize) -> Vec<HistoryRow> {
        self.main_queues().history_range(start, count)
    }
    pub fn clear_history(&mut self) {
        self.main_queues_mut().clear_history();
    }
    pub fn snapshot(&self, now: Instant) -> MachineSnapshot {
        MachineSnapshot {
            status: self.status,
            version: self.version,
            capabilities: self.capabilities(),
            machine_position: self.machine_position.clone(),
            work_offset: self.work_offset.clone(),
            work_position: &self.machine_position - &self.work_offset,
            feed: self.feed,
            spindle: self.spindle,
            buffer_size: self.scheduler.buffer_size(),
            buffer_used: self.scheduler.used(),
            overrides: self.overrides,
            issue: self.projection.last_issue(),
            in_program: self.in_program(),
            program_lines: self.program.as_ref().map_or(0, Program::len),
            program_target: self.projection.target(),
            program_sent: self.projection.sent(),
            program_executed: self.projection.executed(),
            program_errors: self.projection.error_count(),
            job_time: self.projection.total_job_time(now),
            projected_time: self.projection.projected_target(now),
            loop_count: self.loop_count,
            history_len: self.history().len(),
            streaming_mode: self.scheduler.mode(),
            threading_mode: self.threading,
        }
    }

    /*
        Output draining, for whoever owns the transport
    */
    pub fn take_outbox(&mut self) -> Vec<u8> {
        take(&mut self.outbox)
    }
    pub fn take_events(&mut self) -> Vec<MachineEvent> {
        take(&mut self.events)
    }
    // Set when the engine wants the link closed (connect timeout).
    pub fn take_close_request(&mut self) -> bool {
        take(&mut self.close_requested)
    }
    // The bytes taken from the outbox reached the transport.
    pub fn mark_written(&mut self) {
        for slot in self.scheduler.mark_written() {
            self.update_history_row(slot, |command| {
                command.set_status(CommandStatus::WaitingResponse)
            });
        }
    }

    /*
        Internal helpers shared by the submodules
    */
    fn emit(&mut self, event: MachineEvent) {
        self.events.push(event);
    }
    fn warn_event(&mut self, message: String) {
        warn!("{}", message);
        self.emit(MachineEvent::Warning(Local::now(), message));
    }
    fn send_immediate(&mut self, byte: u8) {
        if !self.is_open() {
            return;
        }
        if byte != RealtimeCommand::StatusReport.byte() {
            info!("immediate command {}", format_byte_string([byte]));
            self.emit(MachineEvent::Sent(Local::now(), vec![byte]));
        }
        self.outbox.push(byte);
    }
    fn set_status(&mut self, status: MachineStatus, now: Instant) {
        if self.status == status {
            return;
        }
        info!("machine status {:?} -> {:?}", self.status, status);
        self.status = status;
        self.emit(MachineEvent::StatusChanged(status));
        if self.in_program() {
            if status.is_paused() {
                self.projection.job_pause(now);
            } else {
                self.projection.job_resume(now);
            }
        }
    }
    fn set_issue(&mut self, issue: DetectedIssue) {
        self.projection.set_issue(issue);
        info!(
            "issue detected: {:?} [free {}, used {}]",
            issue,
            self.scheduler.free(),
            self.scheduler.used()
        );
        if issue.is_alarm() {
            self.emit(MachineEvent::IssueDetected(issue));
        }
    }
    // The first thing to go wrong during a run is the one that counts.
    fn raise_issue_if_running(&mut self, issue: DetectedIssue) {
        if self.projection.last_issue() == DetectedIssue::Unknown
            && self.status == MachineStatus::Run
            && self.in_program()
        {
            self.set_issue(issue);
        }
    }
    fn update_history_row(
        &mut self,
        slot: HistorySlot,
        update: impl FnOnce(&mut Command),
    ) {
        if self.queues.id() == slot.list {
            self.queues.update_row(slot, update);
        } else if let Some(state) = &mut self.diagnostic {
            state.saved.update_row(slot, update);
        }
    }
    fn reset_overrides(&mut self) {
        self.overrides.reset();
        self.emit(MachineEvent::OverridesChanged(self.overrides));
    }
    // Drops everything queued or in flight. History goes too when `history` is set.
    fn clear_queues(&mut self, history: bool) {
        self.queues.clear_to_send();
        if history {
            self.queues.clear_history();
        }
        self.scheduler.clear();
    }
    /*
        Runs a user sequence (header, footer, passes, manual input). Realtime words go out
    at once, everything else is queued.
    */
    fn execute_sequence(&mut self, text: &str) {
        for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
            match parse_immediate(line) {
                Some(byte) => self.send_immediate(byte),
                None => self.queues.enqueue(Command::new(line)),
            }
        }
    }
    fn invalid(&self, operation: &'static str) -> StreamerError {
        StreamerError::InvalidState {
            operation,
            status: self.status,
        }
    }

    /*
        Connection lifecycle
    */
    pub fn begin_connect(&mut self, now: Instant) -> StreamerResult<()> {
        if self.is_open() {
            return Err(self.invalid("connect"));
        }
        self.scheduler.on_connect();
        self.connect_started = Some(now);
        self.close_requested = false;
        self.set_status(MachineStatus::Connecting, now);
        Ok(())
    }
    // The transport is open: reset the board if configured to and start polling.
    pub fn on_connected(&mut self, now: Instant) {
        let reset = self.settings.reset_on_connect();
        self.internal_reset(reset, now);
        self.last_status_report = now;
        self.last_query = Some(now);
        self.send_immediate(RealtimeCommand::StatusReport.byte());
    }
    pub fn on_disconnected(&mut self, user: bool, now: Instant) {
        if !self.is_open() {
            return;
        }
        self.raise_issue_if_running(if user {
            DetectedIssue::ManualDisconnect
        } else {
            DetectedIssue::UnexpectedDisconnect
        });
        self.end_diagnostic();
        self.scheduler.clear();
        self.projection.job_end(now);
        self.queues.clear_to_send();
        self.pending_jog = None;
        self.connect_started = None;
        self.now_cooling = false;
        self.outbox.clear();
        self.set_status(MachineStatus::Disconnected, now);
    }
    fn internal_reset(&mut self, send_reset: bool, now: Instant) {
        self.end_diagnostic();
        self.clear_queues(true);
        self.projection.job_end(now);
        self.reset_overrides();
        if send_reset {
            self.send_immediate(RealtimeCommand::Reset.byte());
        }
    }

    /*
        Immediate operator commands
    */
    pub fn feed_hold(&mut self, auto: bool) -> StreamerResult<()> {
        if self.status != MachineStatus::Run {
            return Err(self.invalid("feed hold"));
        }
        self.hold_by_user = !auto;
        self.send_immediate(RealtimeCommand::FeedHold.byte());
        Ok(())
    }
    pub fn cycle_start(&mut self) -> StreamerResult<()> {
        if !matches!(
            self.status,
            MachineStatus::Door | MachineStatus::Hold | MachineStatus::Cooling
        ) {
            return Err(self.invalid("cycle start"));
        }
        self.hold_by_user = false;
        self.send_immediate(RealtimeCommand::CycleStart.byte());
        Ok(())
    }
    pub fn reset(&mut self, now: Instant) -> StreamerResult<()> {
        if !self.is_open() {
            return Err(StreamerError::NotConnected);
        }
        self.raise_issue_if_running(DetectedIssue::ManualReset);
        self.internal_reset(true, now);
        Ok(())
    }
    pub fn set_override_targets(&mut self, feed: Option<u16>, rapid: Option<u16>, spindle: Option<u16>) {
        if let Some(feed) = feed {
            self.overrides.set_feed_target(feed);
        }
        if let Some(rapid) = rapid {
            self.overrides.set_rapid_target(rapid);
        }
        if let Some(spindle) = spindle {
            self.overrides.set_spindle_target(spindle);
        }
        self.emit(MachineEvent::OverridesChanged(self.overrides));
    }
    pub fn send_manual(&mut self, text: &str) -> StreamerResult<()> {
        if !self.is_open() {
            return Err(StreamerError::NotConnected);
        }
        if self.in_program() {
            return Err(self.invalid("manual command"));
        }
        if self.diagnostic.is_some() {
            return Err(StreamerError::SessionBusy);
        }
        self.execute_sequence(text);
        Ok(())
    }
    pub fn set_streaming_mode(&mut self, mode: StreamingMode) -> StreamerResult<()> {
        self.scheduler.set_mode(mode);
        self.settings.set(settings::STREAMING_MODE, mode)
    }
    pub fn set_threading_mode(&mut self, mode: ThreadingMode) -> StreamerResult<()> {
        self.threading = mode;
        self.settings.set(settings::THREADING_MODE, mode)
    }
    pub fn threading_mode(&self) -> ThreadingMode {
        self.threading
    }
    pub fn set_loop_count(&mut self, count: u32) {
        self.loop_count = count.max(1);
        self.emit(MachineEvent::LoopCountChanged(self.loop_count));
    }
    pub fn store_config(&mut self, config: GrblConfig) -> StreamerResult<()> {
        if config.is_empty() || config.version.is_none() {
            return Ok(());
        }
        self.settings.set(settings::GRBL_CONFIGURATION, &config)?;
        self.config = config;
        Ok(())
    }

    /*
        Program control
    */
    pub fn set_program(&mut self, program: Program) -> StreamerResult<()> {
        if self.in_program() {
            return Err(self.invalid("load program"));
        }
        info!(
            "program loaded: {} lines, estimated {:?}",
            program.len(),
            program.estimated_time()
        );
        self.emit(MachineEvent::ProgramLoaded {
            lines: program.len(),
            estimated_time: program.estimated_time(),
        });
        self.projection.reset();
        self.program = Some(program);
        Ok(())
    }
    // Announces a load and returns the rapid rate the time estimate should use.
    pub fn begin_program_load(&mut self) -> StreamerResult<f64> {
        if self.in_program() {
            return Err(self.invalid("load program"));
        }
        self.emit(MachineEvent::ProgramLoading);
        Ok(self.rapid_rate())
    }
    pub fn rapid_rate(&self) -> f64 {
        self.config.max_rate_x().min(self.config.max_rate_y())
    }
    fn check_can_run(&self) -> StreamerResult<&Program> {
        if !self.is_open() {
            return Err(StreamerError::NotConnected);
        }
        if !matches!(self.status, MachineStatus::Idle | MachineStatus::Check) || self.diagnostic.is_some() {
            return Err(self.invalid("run program"));
        }
        match &self.program {
            Some(program) if !program.is_empty() => Ok(program),
            _ => Err(StreamerError::NoProgram),
        }
    }
    /*
        Starts the loaded program. A program never started, or run to its end, starts over
    with the header; a program that was interrupted resumes from the last executed line.
    */
    pub fn run_program(&mut self, now: Instant) -> StreamerResult<()> {
        self.check_can_run()?;
        let executed = self.projection.executed();
        if executed == 0 || executed == self.projection.target() {
            self.run_from_start(false, true, false, now);
            return Ok(());
        }
        let zero = Array1::<f64>::zeros(3);
        let set_wco = self.work_offset == zero && *self.projection.last_known_wco() != zero;
        let homing = self.config.homing_enabled()
            && self.machine_position == zero
            && !matches!(
                self.projection.last_issue(),
                DetectedIssue::ManualAbort | DetectedIssue::ManualReset
            );
        self.continue_from(executed, homing, set_wco, now)
    }
    pub fn run_from(&mut self, position: usize, homing: bool, now: Instant) -> StreamerResult<()> {
        self.check_can_run()?;
        self.continue_from(position, homing, false, now)
    }
    fn run_from_start(&mut self, homing: bool, first: bool, pass: bool, now: Instant) {
        let Some(program) = self.program.take() else {
            return;
        };
        self.clear_queues(true);
        self.projection.reset();
        if homing {
            info!("push homing ($H)");
            self.queues.enqueue(Command::new("$H"));
        }
        if first {
            let header = self.settings.gcode_header();
            self.execute_sequence(&header);
        }
        if pass {
            let passes = self.settings.gcode_passes();
            self.execute_sequence(&passes);
        }
        let added = self.queues.to_send().len();
        for command in program.commands() {
            self.queues.enqueue(command.queued_copy());
        }
        self.projection
            .job_start(program.estimated_time(), program.len(), added, now);
        info!("running program, {} lines", program.len());
        self.program = Some(program);
    }
    fn continue_from(&mut self, position: usize, homing: bool, set_wco: bool, now: Instant) -> StreamerResult<()> {
        let program = self.program.take().ok_or(StreamerError::NoProgram)?;
        if position > program.len() {
            let len = program.len();
            self.program = Some(program);
            return Err(StreamerError::ResumePosition { position, len });
        }
        self.queues.clear_to_send();
        self.scheduler.clear();
        self.queues.push_message(format!("[resume from #{}]", position + 1));
        info!("resume program from #{}", position + 1);

        let offset = set_wco.then(|| {
            let origin = if homing {
                Array1::zeros(3)
            } else {
                self.machine_position.clone()
            };
            &origin - self.projection.last_known_wco()
        });
        let (prefix, remaining) = build_continuation(program.commands(), position, homing, offset.as_ref());
        let added = prefix.len();
        for command in prefix {
            self.queues.enqueue(command);
        }
        self.projection
            .job_continue(program.estimated_time(), program.len(), position, added, now);
        for command in remaining {
            self.queues.enqueue(command);
        }
        self.program = Some(program);
        Ok(())
    }
    pub fn abort(&mut self, now: Instant) -> StreamerResult<()> {
        let running = matches!(
            self.status,
            MachineStatus::Run | MachineStatus::Hold | MachineStatus::Cooling
        );
        if !self.is_open() || self.program.is_none() || !running {
            return Err(self.invalid("abort"));
        }
        info!("program aborted by user");
        if self.in_program() && self.projection.last_issue() == DetectedIssue::Unknown {
            self.set_issue(DetectedIssue::ManualAbort);
        }
        self.projection.job_end(now);
        self.queues.clear_to_send();
        self.scheduler.clear_retry();
        self.queues.enqueue(Command::new("M5"));
        Ok(())
    }

    /*
        Jogging
    */
    pub fn jog_enabled(&self) -> bool {
        if self.capabilities().true_jogging {
            self.is_open() && matches!(self.status, MachineStatus::Idle | MachineStatus::Jog)
        } else {
            self.is_open()
                && matches!(self.status, MachineStatus::Idle | MachineStatus::Run)
                && !self.in_program()
        }
    }
    pub fn begin_jog(&mut self, direction: JogDirection) -> StreamerResult<()> {
        if !self.jog_enabled() {
            return Err(self.invalid("jog"));
        }
        let speed = self.settings.jog_speed();
        let step = self.settings.jog_step();
        if !self.capabilities().true_jogging {
            // Plain G-code stands in for $J on old firmware.
            if direction == JogDirection::Home {
                self.queues.enqueue(Command::new("G90"));
                self.queues
                    .enqueue(Command::new(format!("G0X0Y0F{}", format_number(speed))));
            } else {
                self.queues.enqueue(Command::new("G91"));
                self.queues.enqueue(Command::new(format!(
                    "G0{}F{}",
                    direction.relative_words(step),
                    format_number(speed)
                )));
                self.queues.enqueue(Command::new("G90"));
            }
            return Ok(());
        }
        if self.settings.continuous_jog() && !direction.is_z() {
            self.pending_jog = Some(PendingJog::Toward(direction));
        } else {
            self.pending_jog = None;
            let command = self.jog_command(direction, false);
            self.queues.enqueue(command);
        }
        Ok(())
    }
    pub fn end_jog(&mut self) {
        if self.capabilities().true_jogging {
            self.pending_jog = Some(PendingJog::Cancel);
        }
    }
    fn jog_command(&self, direction: JogDirection, continuous: bool) -> Command {
        let speed = format_number(self.settings.jog_speed());
        if direction == JogDirection::Home {
            return Command::new(format!("$J=G90X0Y0F{}", speed));
        }
        if continuous {
            let width = self.config.table_width();
            let height = self.config.table_height();
            let x = direction.x_sign().map(|sign| if sign > 0.0 { width } else { 0.0 });
            let y = direction.y_sign().map(|sign| if sign > 0.0 { height } else { 0.0 });
            let words = [("X", x), ("Y", y)]
                .into_iter()
                .filter_map(|(axis, value)| value.map(|value| format!("{}{:.1}", axis, value)))
                .join("");
            return Command::new(format!("$J=G53{}F{}", words, speed));
        }
        Command::new(format!(
            "$J=G91{}F{}",
            direction.relative_words(self.settings.jog_step()),
            speed
        ))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn connected(now: Instant) -> Streamer {
        let mut streamer = Streamer::new(Settings::in_memory(), now);
        streamer.begin_connect(now).unwrap();
        streamer.on_connected(now);
        streamer.receive_line("Grbl 1.1h ['$' for help]", now);
        streamer.receive_line("<Idle|MPos:0.000,0.000,0.000|FS:0,0>", now);
        streamer.take_outbox();
        streamer.take_events();
        streamer
    }

    pub(crate) fn load(streamer: &mut Streamer, text: &str) {
        streamer
            .set_program(Program::from_text(text, 1000.0))
            .unwrap();
    }

    // Sends everything currently sendable, as the tick would over a few rounds.
    pub(crate) fn pump(streamer: &mut Streamer, now: Instant) -> Vec<String> {
        let mut lines = Vec::new();
        while streamer.scheduler.can_send(&streamer.queues) {
            streamer.tick(now);
        }
        let bytes = streamer.take_outbox();
        streamer.mark_written();
        for line in String::from_utf8_lossy(&bytes).split('\n') {
            let line = line.trim_matches('?');
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    #[test]
    fn test_connect_resets_board() {
        let now = Instant::now();
        let mut streamer = Streamer::new(Settings::in_memory(), now);
        streamer.begin_connect(now).unwrap();
        assert_eq!(streamer.status(), MachineStatus::Connecting);
        assert!(streamer.begin_connect(now).is_err());
        streamer.on_connected(now);
        assert_eq!(streamer.take_outbox(), vec![0x18, b'?']);
        assert!(streamer
            .take_events()
            .contains(&MachineEvent::StatusChanged(MachineStatus::Connecting)));
    }

    #[test]
    fn test_run_sends_header_then_program() {
        let now = Instant::now();
        let mut streamer = connected(now);
        load(&mut streamer, "G1 X1 F100\nG1 X2");
        streamer.run_program(now).unwrap();
        assert!(streamer.in_program());
        assert_eq!(streamer.projection().target(), 2);
        assert_eq!(
            pump(&mut streamer, now),
            vec!["G90 (use absolute coordinates)", "G1 X1 F100", "G1 X2"]
        );
        assert_eq!(streamer.projection().sent(), 2);
        match &streamer.history()[0] {
            HistoryRow::Command(command) => assert_eq!(command.status(), CommandStatus::WaitingResponse),
            row => panic!("unexpected row {:?}", row),
        }
    }

    #[test]
    fn test_run_requires_idle_and_program() {
        let now = Instant::now();
        let mut streamer = connected(now);
        assert!(matches!(streamer.run_program(now), Err(StreamerError::NoProgram)));
        load(&mut streamer, "G0 X1");
        streamer.receive_line("<Alarm|MPos:0.000,0.000,0.000>", now);
        assert!(matches!(
            streamer.run_program(now),
            Err(StreamerError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_abort_keeps_pending_and_queues_m5() {
        let now = Instant::now();
        let mut streamer = connected(now);
        load(&mut streamer, "G1 X1 F100\nG1 X2\nG1 X3");
        streamer.run_program(now).unwrap();
        pump(&mut streamer, now);
        streamer.receive_line("<Run|MPos:0.500,0.000,0.000>", now);
        streamer.abort(now).unwrap();
        assert!(!streamer.in_program());
        assert_eq!(streamer.projection().last_issue(), DetectedIssue::ManualAbort);
        assert_eq!(streamer.scheduler().pending_len(), 4);
        assert_eq!(streamer.queues.to_send().len(), 1);
        assert_eq!(streamer.queues.to_send()[0].text(), "M5");
        // Manual abort is not an alarm.
        assert!(!streamer
            .take_events()
            .iter()
            .any(|event| matches!(event, MachineEvent::IssueDetected(_))));
    }

    #[test]
    fn test_disconnect_keeps_history() {
        let now = Instant::now();
        let mut streamer = connected(now);
        load(&mut streamer, "G1 X1 F100\nG1 X2");
        streamer.run_program(now).unwrap();
        pump(&mut streamer, now);
        streamer.receive_line("<Run|MPos:0.500,0.000,0.000>", now);
        streamer.on_disconnected(false, now);
        assert_eq!(streamer.status(), MachineStatus::Disconnected);
        assert_eq!(streamer.scheduler().used(), 0);
        assert_eq!(streamer.history().len(), 3);
        assert_eq!(
            streamer.projection().last_issue(),
            DetectedIssue::UnexpectedDisconnect
        );
        assert!(streamer
            .take_events()
            .contains(&MachineEvent::IssueDetected(DetectedIssue::UnexpectedDisconnect)));
    }

    #[test]
    fn test_user_reset_flags_manual_reset() {
        let now = Instant::now();
        let mut streamer = connected(now);
        load(&mut streamer, "G1 X1 F100\nG1 X2");
        streamer.run_program(now).unwrap();
        pump(&mut streamer, now);
        streamer.receive_line("<Run|MPos:0.500,0.000,0.000>", now);
        streamer.reset(now).unwrap();
        assert_eq!(streamer.projection().last_issue(), DetectedIssue::ManualReset);
        assert_eq!(streamer.take_outbox(), vec![0x18]);
        assert_eq!(streamer.scheduler().used(), 0);
        assert!(streamer.history().is_empty());
    }

    #[test]
    fn test_resume_after_interruption() {
        let now = Instant::now();
        let mut streamer = connected(now);
        load(&mut streamer, "G90\nG0 X1 Y1\nG1 X2 F800 S100\nX3\nY2\nX4\nG0 X0 Y0");
        streamer.run_program(now).unwrap();
        pump(&mut streamer, now);
        streamer.receive_line("<Run|MPos:0.000,0.000,0.000|WCO:1.000,2.000,0.000>", now);
        // Header plus six program lines acknowledged.
        for _ in 0..7 {
            streamer.receive_line("ok", now);
        }
        streamer.receive_line("Grbl 1.1h ['$' for help]", now);
        assert!(!streamer.in_program());
        assert_eq!(
            streamer.projection().last_issue(),
            DetectedIssue::UnexpectedReset
        );
        streamer.receive_line("<Idle|MPos:5.000,5.000,0.000|WCO:0.000,0.000,0.000>", now);
        streamer.run_program(now).unwrap();
        assert_eq!(
            pump(&mut streamer, now),
            vec![
                "G92 X4 Y3 Z0",
                "G90",
                "M5 G0 X4 Y2",
                "G1 F800 S100",
                "G0 X0 Y0"
            ]
        );
        assert!(streamer.history().iter().any(|row| matches!(
            row,
            HistoryRow::Message { text, .. } if text == "[resume from #7]"
        )));
        for _ in 0..4 {
            streamer.receive_line("ok", now);
        }
        assert_eq!(streamer.projection().executed(), 6);
        assert!(streamer.in_program());
    }

    #[test]
    fn test_run_from_rejects_position_past_end() {
        let now = Instant::now();
        let mut streamer = connected(now);
        load(&mut streamer, "G0 X1");
        assert!(matches!(
            streamer.run_from(5, false, now),
            Err(StreamerError::ResumePosition { position: 5, len: 1 })
        ));
        assert!(streamer.program().is_some());
    }

    #[test]
    fn test_true_jog_commands() {
        let now = Instant::now();
        let mut streamer = connected(now);
        streamer.settings_mut().set(settings::JOG_STEP, 2.5).unwrap();
        streamer.settings_mut().set(settings::JOG_SPEED, 500.0).unwrap();
        streamer.begin_jog(JogDirection::NE).unwrap();
        streamer.begin_jog(JogDirection::Home).unwrap();
        assert_eq!(
            pump(&mut streamer, now),
            vec!["$J=G91X2.5Y2.5F500", "$J=G90X0Y0F500"]
        );
    }

    #[test]
    fn test_continuous_jog_goes_first_and_cancels() {
        let now = Instant::now();
        let mut streamer = connected(now);
        streamer.settings_mut().set(settings::CONTINUOUS_JOG, true).unwrap();
        streamer.send_manual("G4 P0").unwrap();
        streamer.begin_jog(JogDirection::W).unwrap();
        streamer.tick(now);
        assert_eq!(streamer.take_outbox(), b"$J=G53X0.0F1000\nG4 P0\n".to_vec());
        streamer.mark_written();
        streamer.receive_line("<Jog|MPos:0.000,0.000,0.000>", now);
        streamer.end_jog();
        streamer.tick(now);
        // Cancel waits until nothing is in flight.
        assert!(streamer.take_outbox().is_empty());
        streamer.receive_line("ok", now);
        streamer.receive_line("ok", now);
        streamer.tick(now);
        assert_eq!(streamer.take_outbox(), vec![RealtimeCommand::JogCancel.byte()]);
    }

    #[test]
    fn test_emulated_jog_on_old_firmware() {
        let now = Instant::now();
        let mut streamer = Streamer::new(Settings::in_memory(), now);
        streamer.begin_connect(now).unwrap();
        streamer.on_connected(now);
        streamer.receive_line("Grbl 0.9j ['$' for help]", now);
        streamer.receive_line("<Idle,MPos:0.000,0.000,0.000,WPos:0.000,0.000,0.000>", now);
        streamer.take_outbox();
        streamer.begin_jog(JogDirection::Down).unwrap();
        assert_eq!(pump(&mut streamer, now), vec!["G91", "G0Z-10.0F1000", "G90"]);
    }

    #[test]
    fn test_override_targets_emit_event() {
        let now = Instant::now();
        let mut streamer = connected(now);
        streamer.set_override_targets(Some(250), None, Some(50));
        let overrides = streamer.overrides();
        assert_eq!(overrides.target.feed, 200);
        assert!(streamer
            .take_events()
            .contains(&MachineEvent::OverridesChanged(overrides)));
        streamer.receive_line("<Idle|MPos:0.000,0.000,0.000|Ov:100,100,100>", now);
        assert_eq!(
            streamer.take_outbox(),
            vec![
                RealtimeCommand::FeedOverridePlusTen.byte(),
                RealtimeCommand::SpindleOverrideMinusTen.byte()
            ]
        );
    }
}
