pub mod parser;

use std::fmt;

// Modal motion group. Only the motions a sender replays are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionMode {
    Rapid,
    Linear,
    ArcClockwise,
    ArcCounterclockwise,
}
impl MotionMode {
    pub fn from_code(code: GCode) -> Option<MotionMode> {
        match (code.major, code.minor) {
            (0, 0) => Some(MotionMode::Rapid),
            (1, 0) => Some(MotionMode::Linear),
            (2, 0) => Some(MotionMode::ArcClockwise),
            (3, 0) => Some(MotionMode::ArcCounterclockwise),
            _ => None,
        }
    }
    pub fn as_str(self) -> &'static str {
        match self {
            MotionMode::Rapid => "G0",
            MotionMode::Linear => "G1",
            MotionMode::ArcClockwise => "G2",
            MotionMode::ArcCounterclockwise => "G3",
        }
    }
}
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateMode {
    Absolute,
    Incremental,
}
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Inch,
    Millimeter,
}
impl Unit {
    pub fn as_str(self) -> &'static str {
        match self {
            Unit::Inch => "G20",
            Unit::Millimeter => "G21",
        }
    }
}
// G54 through G59.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinateSystem(pub u8);
impl CoordinateSystem {
    pub fn as_string(self) -> String {
        format!("G{}", 54 + u16::from(self.0))
    }
}
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpindleMode {
    Clockwise,
    Counterclockwise,
    Off,
}
impl SpindleMode {
    pub fn as_str(self) -> &'static str {
        match self {
            SpindleMode::Clockwise => "M3",
            SpindleMode::Counterclockwise => "M4",
            SpindleMode::Off => "M5",
        }
    }
}

// A G or M number such as 28.1, split so it compares exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GCode {
    pub major: u16,
    pub minor: u8,
}
impl GCode {
    pub const fn new(major: u16, minor: u8) -> Self {
        GCode { major, minor }
    }
}
impl fmt::Display for GCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.minor == 0 {
            write!(f, "{}", self.major)
        } else {
            write!(f, "{}.{}", self.major, self.minor)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Word {
    G(GCode),
    M(GCode),
    // Any other letter, upper-cased, with its value.
    Value(char, f64),
}

// Shortest decimal form with at most three fractional digits, as Grbl reads them back.
pub fn format_number(value: f64) -> String {
    let text = format!("{:.3}", value);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    match text {
        "-0" | "" => "0".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(10.0), "10");
        assert_eq!(format_number(-1.5), "-1.5");
        assert_eq!(format_number(0.12345), "0.123");
        assert_eq!(format_number(-0.0001), "0");
    }

    #[test]
    fn test_codes() {
        assert_eq!(MotionMode::from_code(GCode::new(1, 0)), Some(MotionMode::Linear));
        assert_eq!(MotionMode::from_code(GCode::new(28, 1)), None);
        assert_eq!(GCode::new(28, 1).to_string(), "28.1");
        assert_eq!(CoordinateSystem(1).as_string(), "G55");
    }
}
