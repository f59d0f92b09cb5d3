use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use super::{
    gcode::{
        parser::parse_words, CoordinateMode, CoordinateSystem, GCode, MotionMode, SpindleMode,
        Unit, Word,
    },
    grbl::messages::CommandResponse,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CommandStatus {
    Queued,
    Sending,
    WaitingResponse,
    ResponseGood,
    ResponseBad,
}
impl CommandStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, CommandStatus::ResponseGood | CommandStatus::ResponseBad)
    }
}

/*
    One line of program text on its way to the machine. The text never changes; status
and response follow the line through the queues. Each queue holds its own copy.
*/
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    text: String,
    status: CommandStatus,
    response: Option<CommandResponse>,
    repeat_count: u8,
    time_offset: Duration,
}

impl Command {
    pub fn new(text: impl Into<String>) -> Self {
        Command::with_time_offset(text, Duration::ZERO)
    }
    // `time_offset` is the estimated job time once this line has executed.
    pub fn with_time_offset(text: impl Into<String>, time_offset: Duration) -> Self {
        Command {
            text: text.into(),
            status: CommandStatus::Queued,
            response: None,
            repeat_count: 0,
            time_offset,
        }
    }
    pub fn text(&self) -> &str {
        &self.text
    }
    pub fn status(&self) -> CommandStatus {
        self.status
    }
    pub fn response(&self) -> Option<CommandResponse> {
        self.response
    }
    pub fn repeat_count(&self) -> u8 {
        self.repeat_count
    }
    pub fn time_offset(&self) -> Duration {
        self.time_offset
    }
    pub fn serial_data(&self) -> Vec<u8> {
        let mut data = self.text.trim().as_bytes().to_vec();
        data.push(b'\n');
        data
    }
    pub fn serial_len(&self) -> usize {
        self.text.trim().len() + 1
    }
    pub(crate) fn set_status(&mut self, status: CommandStatus) {
        self.status = status;
    }
    pub(crate) fn set_response(&mut self, response: CommandResponse) {
        self.response = Some(response);
        self.status = if response.is_good() {
            CommandStatus::ResponseGood
        } else {
            CommandStatus::ResponseBad
        };
    }
    // Fresh copy for another run queue.
    pub fn queued_copy(&self) -> Command {
        Command::with_time_offset(self.text.clone(), self.time_offset)
    }
    pub fn retry(&self) -> Command {
        Command {
            repeat_count: self.repeat_count + 1,
            ..self.queued_copy()
        }
    }
    // Same line with an explicit motion word in front, e.g. "X10" -> "G1 X10".
    pub fn with_motion_mode(&self, mode: MotionMode) -> Command {
        Command::with_time_offset(
            format!("{} {}", mode.as_str(), self.text.trim()),
            self.time_offset,
        )
    }
    pub fn info(&self) -> CommandInfo {
        CommandInfo::analyze(&self.text)
    }
    pub fn is_movement(&self) -> bool {
        self.info().is_movement()
    }
    pub fn is_pause(&self) -> bool {
        self.info().is_pause()
    }
    pub fn is_write_eeprom(&self) -> bool {
        self.info().is_write_eeprom()
    }
}

const DWELL: GCode = GCode::new(4, 0);
const SET_COORDINATE_DATA: GCode = GCode::new(10, 0);
const STORE_HOME: GCode = GCode::new(28, 1);
const STORE_SECONDARY_HOME: GCode = GCode::new(30, 1);
// Codes after which axis words are not a move in the current motion mode.
const AXIS_CONSUMERS: [GCode; 8] = [
    GCode::new(10, 0),
    GCode::new(28, 0),
    GCode::new(28, 1),
    GCode::new(30, 0),
    GCode::new(30, 1),
    GCode::new(92, 0),
    GCode::new(43, 1),
    GCode::new(4, 0),
];

/*
    What a line means to the streamer. Computed on demand and dropped after use; lines
that fail to parse yield an empty analysis.
*/
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandInfo {
    pub system_command: Option<String>,
    pub motion: Option<MotionMode>,
    pub coordinate_mode: Option<CoordinateMode>,
    pub unit: Option<Unit>,
    pub coordinate_system: Option<CoordinateSystem>,
    pub spindle: Option<SpindleMode>,
    pub other_codes: Vec<GCode>,
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub f: Option<f64>,
    pub s: Option<f64>,
    pub p: Option<f64>,
    pub l: Option<f64>,
}

impl CommandInfo {
    pub fn analyze(text: &str) -> CommandInfo {
        let trimmed = text.trim();
        let mut info = CommandInfo::default();
        if trimmed.starts_with('$') {
            info.system_command = Some(trimmed.to_ascii_uppercase());
            return info;
        }
        let words = match parse_words(trimmed) {
            Ok(words) => words,
            Err(error) => {
                debug!("unparsed line {:?}: {:?}", trimmed, error.remaining);
                return info;
            }
        };
        for word in words {
            match word {
                Word::G(code) => {
                    if let Some(motion) = MotionMode::from_code(code) {
                        info.motion = Some(motion);
                        continue;
                    }
                    match (code.major, code.minor) {
                        (90, 0) => info.coordinate_mode = Some(CoordinateMode::Absolute),
                        (91, 0) => info.coordinate_mode = Some(CoordinateMode::Incremental),
                        (20, 0) => info.unit = Some(Unit::Inch),
                        (21, 0) => info.unit = Some(Unit::Millimeter),
                        (54..=59, 0) => {
                            info.coordinate_system =
                                Some(CoordinateSystem((code.major - 54) as u8))
                        }
                        _ => info.other_codes.push(code),
                    }
                }
                Word::M(code) => match (code.major, code.minor) {
                    (3, 0) => info.spindle = Some(SpindleMode::Clockwise),
                    (4, 0) => info.spindle = Some(SpindleMode::Counterclockwise),
                    (5, 0) => info.spindle = Some(SpindleMode::Off),
                    _ => info.other_codes.push(code),
                },
                Word::Value('X', value) => info.x = Some(value),
                Word::Value('Y', value) => info.y = Some(value),
                Word::Value('Z', value) => info.z = Some(value),
                Word::Value('F', value) => info.f = Some(value),
                Word::Value('S', value) => info.s = Some(value),
                Word::Value('P', value) => info.p = Some(value),
                Word::Value('L', value) => info.l = Some(value),
                Word::Value(..) => {}
            }
        }
        info
    }
    pub fn has_axis_words(&self) -> bool {
        self.x.is_some() || self.y.is_some() || self.z.is_some()
    }
    fn has_code(&self, code: GCode) -> bool {
        self.other_codes.contains(&code)
    }
    // Axis words here describe a move rather than feeding some other command.
    pub fn is_motion_block(&self) -> bool {
        self.system_command.is_none()
            && !AXIS_CONSUMERS.iter().any(|code| self.has_code(*code))
    }
    pub fn is_movement(&self) -> bool {
        self.is_motion_block() && (self.motion.is_some() || self.has_axis_words())
    }
    pub fn is_pause(&self) -> bool {
        self.has_code(DWELL)
    }
    // Lines Grbl stores in EEPROM; it stops processing the serial buffer while writing.
    pub fn is_write_eeprom(&self) -> bool {
        if let Some(system) = &self.system_command {
            let setting = system
                .strip_prefix('$')
                .map_or(false, |rest| rest.starts_with(|c: char| c.is_ascii_digit()) && rest.contains('='));
            return setting
                || system.starts_with("$N")
                || system.starts_with("$RST=")
                || system.starts_with("$I=");
        }
        let coordinate_data = self.has_code(SET_COORDINATE_DATA)
            && matches!(self.l.map(|l| l.round() as i64), Some(2) | Some(20));
        coordinate_data || self.has_code(STORE_HOME) || self.has_code(STORE_SECONDARY_HOME)
    }
}
