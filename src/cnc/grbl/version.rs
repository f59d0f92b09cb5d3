use std::fmt;

use serde::{Deserialize, Serialize};

// Ordered field by field: major, minor, then build letter (none sorts first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GrblVersion {
    pub major: u8,
    pub minor: u8,
    pub build: Option<char>,
}

impl GrblVersion {
    pub const V0_9: GrblVersion = GrblVersion::new(0, 9, None);
    pub const V1_0C: GrblVersion = GrblVersion::new(1, 0, Some('c'));
    pub const V1_1: GrblVersion = GrblVersion::new(1, 1, None);

    pub const fn new(major: u8, minor: u8, build: Option<char>) -> Self {
        GrblVersion { major, minor, build }
    }

    /*
        Guess from the shape of a status report (brackets already stripped). Only
    meaningful before a banner told us the real version; 1.0c and 1.1 are hard to
    tell apart.
    */
    pub fn guess_from_status(report: &str) -> GrblVersion {
        match (report.contains('|'), report.contains("Pin:")) {
            (true, false) => GrblVersion::V1_1,
            (true, true) => GrblVersion::V1_0C,
            (false, _) => GrblVersion::V0_9,
        }
    }
}

impl fmt::Display for GrblVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)?;
        if let Some(build) = self.build {
            write!(f, "{}", build)?;
        }
        Ok(())
    }
}

/*
    Feature gates derived from the firmware version. Everything interesting arrived
with 1.1; with no known version we assume the oldest firmware.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Capabilities {
    pub true_jogging: bool,
    pub overrides: bool,
    pub config_table: bool,
    pub buffer_report: bool,
    pub laser_mode: bool,
    pub pipe_status: bool,
}

impl From<Option<GrblVersion>> for Capabilities {
    fn from(version: Option<GrblVersion>) -> Self {
        let modern = version.map_or(false, |version| version >= GrblVersion::V1_1);
        Capabilities {
            true_jogging: modern,
            overrides: modern,
            config_table: modern,
            buffer_report: modern,
            laser_mode: modern,
            pipe_status: modern,
        }
    }
}
