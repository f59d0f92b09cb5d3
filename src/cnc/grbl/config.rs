use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::version::GrblVersion;

/*
    The `$$` settings table as last read from the firmware. Setting numbers moved
between 0.8 and 0.9, so lookups depend on the version the table was read from.
*/
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GrblConfig {
    pub version: Option<GrblVersion>,
    pub values: BTreeMap<u32, f64>,
}

impl GrblConfig {
    pub fn new(version: Option<GrblVersion>) -> Self {
        GrblConfig {
            version,
            values: BTreeMap::new(),
        }
    }
    fn is_v11(&self) -> bool {
        self.version.map_or(false, |v| v >= GrblVersion::V1_1)
    }
    fn is_v09(&self) -> bool {
        self.version.map_or(false, |v| v >= GrblVersion::V0_9)
    }
    // How many parameters a complete `$$` dump has for this firmware.
    pub fn expected_count(&self) -> usize {
        if self.is_v11() {
            34
        } else if self.is_v09() {
            31
        } else {
            23
        }
    }
    pub fn len(&self) -> usize {
        self.values.len()
    }
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
    pub fn insert(&mut self, number: u32, value: f64) {
        self.values.insert(number, value);
    }
    fn read_with_default(&self, number: Option<u32>, default: f64) -> f64 {
        match (self.version, number) {
            (Some(_), Some(number)) => self.values.get(&number).copied().unwrap_or(default),
            _ => default,
        }
    }
    pub fn homing_enabled(&self) -> bool {
        self.read_with_default(Some(if self.is_v09() { 22 } else { 17 }), 1.0) != 0.0
    }
    pub fn laser_mode(&self) -> bool {
        if self.version.is_none() {
            return true;
        }
        self.read_with_default(self.is_v11().then_some(32), 0.0) != 0.0
    }
    pub fn max_rate_x(&self) -> f64 {
        self.read_with_default(Some(if self.is_v09() { 110 } else { 4 }), 4000.0)
    }
    pub fn max_rate_y(&self) -> f64 {
        self.read_with_default(Some(if self.is_v09() { 111 } else { 5 }), 4000.0)
    }
    pub fn resolution_x(&self) -> f64 {
        self.read_with_default(Some(if self.is_v09() { 100 } else { 0 }), 250.0)
    }
    pub fn resolution_y(&self) -> f64 {
        self.read_with_default(Some(if self.is_v09() { 101 } else { 1 }), 250.0)
    }
    pub fn table_width(&self) -> f64 {
        self.read_with_default(self.is_v09().then_some(130), 3000.0)
    }
    pub fn table_height(&self) -> f64 {
        self.read_with_default(self.is_v09().then_some(131), 2000.0)
    }
    // Lines that write this table back, in setting order.
    pub fn to_commands(&self) -> Vec<String> {
        self.values
            .iter()
            .map(|(number, value)| format!("${}={}", number, value))
            .collect()
    }
}
