use std::borrow::Cow;

use ndarray::Array1;

use super::version::GrblVersion;

// Acknowledgment of one queued line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandResponse {
    Ok,
    Error(Option<u64>),
}
impl CommandResponse {
    pub fn is_good(self) -> bool {
        matches!(self, CommandResponse::Ok)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusField {
    Overrides { feed: u16, rapid: u16, spindle: u16 },
    Buffer { blocks: u64, bytes: u64 },
    WorkPosition(Array1<f64>),
    MachinePosition(Array1<f64>),
    WorkCoordinateOffset(Array1<f64>),
    FeedSpindle(f64, f64),
    Feed(f64),
}

// One decoded `<...>` report. Fields keep their wire order.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub state: String,
    pub fields: Vec<StatusField>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GrblMessage {
    Response(CommandResponse),
    // Contents between the angle brackets; decoding needs the firmware version.
    Status(String),
    Banner(Option<GrblVersion>),
    Unrecognized(String),
}

impl GrblMessage {
    pub fn get_alarm_text(index: u64) -> Cow<'static, str> {
        match index {
            1 => "Hard limit triggered. Machine position is likely lost due to sudden and immediate halt. Re-homing is highly recommended.".into(),
            2 => "G-code motion target exceeds machine travel. Machine position safely retained. Alarm may be unlocked.".into(),
            3 => "Reset while in motion. Grbl cannot guarantee position. Lost steps are likely. Re-homing is highly recommended.".into(),
            4 => "Probe fail. The probe is not in the expected initial state before starting probe cycle.".into(),
            5 => "Probe fail. Probe did not contact the workpiece within the programmed travel.".into(),
            6 => "Homing fail. Reset during active homing cycle.".into(),
            7 => "Homing fail. Safety door was opened during active homing cycle.".into(),
            8 => "Homing fail. Cycle failed to clear limit switch when pulling off.".into(),
            9 => "Homing fail. Could not find limit switch within search distance.".into(),
            _ => Cow::Owned(format!("Unknown ALARM:{}", index)),
        }
    }
    pub fn get_error_text(index: u64) -> Cow<'static, str> {
        match index {
            1 => "G-code words consist of a letter and a value. Letter was not found.".into(),
            2 => "Numeric value format is not valid or missing an expected value.".into(),
            3 => "Grbl '$' system command was not recognized or supported.".into(),
            4 => "Negative value received for an expected positive value.".into(),
            5 => "Homing cycle is not enabled via settings.".into(),
            6 => "Minimum step pulse time must be greater than 3usec".into(),
            7 => "EEPROM read failed. Reset and restored to default values.".into(),
            8 => "Grbl '$' command cannot be used unless Grbl is IDLE.".into(),
            9 => "G-code locked out during alarm or jog state".into(),
            10 => "Soft limits cannot be enabled without homing also enabled.".into(),
            11 => "Max characters per line exceeded. Line was not processed and executed.".into(),
            12 => "Grbl '$' setting value exceeds the maximum step rate supported.".into(),
            13 => "Safety door detected as opened and door state initiated.".into(),
            14 => "Build info or startup line exceeded EEPROM line length limit.".into(),
            15 => "Jog target exceeds machine travel. Command ignored.".into(),
            16 => "Jog command with no '=' or contains prohibited g-code.".into(),
            17 => "Laser mode disabled. Requires PWM output.".into(),
            20 => "Unsupported or invalid g-code command found in block.".into(),
            21 => "More than one g-code command from same modal group found in block.".into(),
            22 => "Feed rate has not yet been set or is undefined.".into(),
            23 => "G-code command in block requires an integer value.".into(),
            24 => "Two G-code commands that both require the use of the XYZ axis words were detected in the block.".into(),
            25 => "A G-code word was repeated in the block.".into(),
            26 => "A G-code command implicitly or explicitly requires XYZ axis words in the block, but none were detected.".into(),
            27 => "N line number value is not within the valid range of 1 - 9,999,999.".into(),
            28 => "A G-code command was sent, but is missing some required P or L value words in the line.".into(),
            29 => "Grbl supports six work coordinate systems G54-G59. G59.1, G59.2, and G59.3 are not supported.".into(),
            30 => "The G53 G-code command requires either a G0 seek or G1 feed motion mode to be active.".into(),
            31 => "There are unused axis words in the block and G80 motion mode cancel is active.".into(),
            32 => "A G2 or G3 arc was commanded but there are no XYZ axis words in the selected plane to trace the arc.".into(),
            33 => "The motion command has an invalid target.".into(),
            34 => "A G2 or G3 arc, traced with the radius definition, had a mathematical error when computing the arc geometry.".into(),
            35 => "A G2 or G3 arc, traced with the offset definition, is missing the IJK offset word in the selected plane.".into(),
            36 => "There are unused, leftover G-code words that aren't used by any command in the block.".into(),
            37 => "The G43.1 dynamic tool length offset command cannot apply an offset to an axis other than its configured axis.".into(),
            38 => "Tool number greater than max supported value.".into(),
            _ => Cow::Owned(format!("Unknown error:{}", index)),
        }
    }
}
