use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::{
    cnc::{
        grbl::{config::GrblConfig, version::GrblVersion},
        threading::{StreamingMode, ThreadingMode},
    },
    error::StreamerResult,
    util::file_backed_json::FileBackedValue,
};

pub const LAST_GRBL_VERSION: &str = "last_grbl_version";
pub const GRBL_CONFIGURATION: &str = "grbl_configuration";
pub const THREADING_MODE: &str = "threading_mode";
pub const STREAMING_MODE: &str = "streaming_mode";
pub const AUTO_COOLING: &str = "auto_cooling";
pub const AUTO_COOLING_ON: &str = "auto_cooling_on";
pub const AUTO_COOLING_OFF: &str = "auto_cooling_off";
pub const JOG_SPEED: &str = "jog_speed";
pub const JOG_STEP: &str = "jog_step";
pub const CONTINUOUS_JOG: &str = "continuous_jog";
pub const RESET_ON_CONNECT: &str = "reset_on_connect";
pub const GCODE_HEADER: &str = "gcode_header";
pub const GCODE_PASSES: &str = "gcode_passes";
pub const GCODE_FOOTER: &str = "gcode_footer";

pub const DEFAULT_HEADER: &str = "G90 (use absolute coordinates)";
pub const DEFAULT_PASSES: &str = "G91\nG0 Z-1 (sinks the Z axis)\nG90";
pub const DEFAULT_FOOTER: &str = "G0 X0 Y0 Z0 (move back to origin)";

/*
    Keyed JSON settings. Values that are missing or do not deserialize fall back to the
default for that key. Writes stay in memory until `flush`.
*/
pub struct Settings {
    store: FileBackedValue<BTreeMap<String, Value>>,
}

impl Settings {
    pub async fn open(path: PathBuf) -> StreamerResult<Settings> {
        Ok(Settings {
            store: FileBackedValue::new(path, BTreeMap::new).await?,
        })
    }
    pub fn in_memory() -> Settings {
        Settings {
            store: FileBackedValue::in_memory(BTreeMap::new()),
        }
    }
    pub fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        match self.store.get().get(key) {
            Some(value) => match serde_json::from_value(value.clone()) {
                Ok(value) => value,
                Err(e) => {
                    warn!("setting {} has an unexpected shape: {}", key, e);
                    default
                }
            },
            None => default,
        }
    }
    pub fn set<T: Serialize>(&mut self, key: &str, value: T) -> StreamerResult<()> {
        let value = serde_json::to_value(value)?;
        if self.store.get().get(key) != Some(&value) {
            self.store.mutate(|map| map.insert(key.to_string(), value));
        }
        Ok(())
    }
    pub fn is_dirty(&self) -> bool {
        self.store.is_dirty()
    }
    pub async fn flush(&mut self) -> StreamerResult<()> {
        self.store.flush().await
    }

    pub fn last_grbl_version(&self) -> Option<GrblVersion> {
        self.get(LAST_GRBL_VERSION, None)
    }
    pub fn grbl_configuration(&self) -> GrblConfig {
        self.get(GRBL_CONFIGURATION, GrblConfig::default())
    }
    pub fn threading_mode(&self) -> ThreadingMode {
        self.get(THREADING_MODE, ThreadingMode::default())
    }
    pub fn streaming_mode(&self) -> StreamingMode {
        self.get(STREAMING_MODE, StreamingMode::default())
    }
    pub fn auto_cooling(&self) -> bool {
        self.get(AUTO_COOLING, false)
    }
    // Stored in seconds.
    pub fn auto_cooling_on(&self) -> Duration {
        Duration::from_secs(self.get(AUTO_COOLING_ON, 10 * 60))
    }
    pub fn auto_cooling_off(&self) -> Duration {
        Duration::from_secs(self.get(AUTO_COOLING_OFF, 60))
    }
    pub fn jog_speed(&self) -> f64 {
        self.get(JOG_SPEED, 1000.0)
    }
    pub fn jog_step(&self) -> f64 {
        self.get(JOG_STEP, 10.0)
    }
    pub fn continuous_jog(&self) -> bool {
        self.get(CONTINUOUS_JOG, false)
    }
    pub fn reset_on_connect(&self) -> bool {
        self.get(RESET_ON_CONNECT, true)
    }
    pub fn gcode_header(&self) -> String {
        self.get(GCODE_HEADER, DEFAULT_HEADER.to_string())
    }
    pub fn gcode_passes(&self) -> String {
        self.get(GCODE_PASSES, DEFAULT_PASSES.to_string())
    }
    pub fn gcode_footer(&self) -> String {
        self.get(GCODE_FOOTER, DEFAULT_FOOTER.to_string())
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::in_memory();
        assert_eq!(settings.last_grbl_version(), None);
        assert_eq!(settings.threading_mode(), ThreadingMode::UltraFast);
        assert_eq!(settings.streaming_mode(), StreamingMode::Buffered);
        assert_eq!(settings.auto_cooling_on(), Duration::from_secs(600));
        assert_eq!(settings.auto_cooling_off(), Duration::from_secs(60));
        assert!(settings.reset_on_connect());
        assert_eq!(settings.gcode_footer(), DEFAULT_FOOTER);
    }

    #[test]
    fn test_wrong_shape_falls_back() {
        let mut settings = Settings::in_memory();
        settings.set(JOG_SPEED, "fast").unwrap();
        assert_eq!(settings.jog_speed(), 1000.0);
    }

    #[tokio::test]
    async fn test_persisted_values() {
        let dir = TempDir::new("settings").unwrap();
        let path = dir.path().join("settings.json");
        let mut settings = Settings::open(path.clone()).await.unwrap();
        settings.set(STREAMING_MODE, StreamingMode::RepeatOnError).unwrap();
        settings
            .set(LAST_GRBL_VERSION, Some(GrblVersion::new(1, 1, Some('h'))))
            .unwrap();
        assert!(settings.is_dirty());
        settings.flush().await.unwrap();

        let reloaded = Settings::open(path).await.unwrap();
        assert_eq!(reloaded.streaming_mode(), StreamingMode::RepeatOnError);
        assert_eq!(
            reloaded.last_grbl_version(),
            Some(GrblVersion::new(1, 1, Some('h')))
        );
    }

    #[tokio::test]
    async fn test_unchanged_value_stays_clean() {
        let dir = TempDir::new("settings").unwrap();
        let mut settings = Settings::open(dir.path().join("settings.json")).await.unwrap();
        settings.set(AUTO_COOLING, true).unwrap();
        settings.flush().await.unwrap();
        settings.set(AUTO_COOLING, true).unwrap();
        assert!(!settings.is_dirty());
        assert!(settings.auto_cooling());
    }
}
