use std::{path::Path, time::Duration};

use tokio::fs::{read_to_string, write};

use super::{
    command::Command,
    gcode::MotionMode,
    state_builder::{StateBuilder, Step},
};
use crate::error::StreamerResult;

// Used for G0 moves and for feed moves before any F word.
pub const DEFAULT_RAPID_RATE: f64 = 4000.0;

/*
    A loaded G-code program: the master list of commands, each carrying the estimated
job time after it executes. Streaming only ever clones out of this list.
*/
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    commands: Vec<Command>,
    estimated_time: Duration,
    rapid_rate: f64,
}

impl Default for Program {
    fn default() -> Self {
        Program::new(DEFAULT_RAPID_RATE)
    }
}

impl Program {
    pub fn new(rapid_rate: f64) -> Self {
        Program {
            commands: Vec::new(),
            estimated_time: Duration::ZERO,
            rapid_rate: if rapid_rate > 0.0 { rapid_rate } else { DEFAULT_RAPID_RATE },
        }
    }
    pub fn from_text(text: &str, rapid_rate: f64) -> Self {
        let mut program = Program::new(rapid_rate);
        program.append_text(text);
        program
    }
    pub async fn load_file(path: impl AsRef<Path>, rapid_rate: f64) -> StreamerResult<Self> {
        let text = read_to_string(path).await?;
        Ok(Program::from_text(&text, rapid_rate))
    }
    pub async fn save_file(&self, path: impl AsRef<Path>) -> StreamerResult<()> {
        let mut text = String::new();
        for command in &self.commands {
            text.push_str(command.text());
            text.push('\n');
        }
        write(path, text).await?;
        Ok(())
    }
    pub fn append_text(&mut self, text: &str) {
        let lines: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect();
        for line in lines {
            self.commands.push(Command::new(line));
        }
        self.estimate();
    }
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }
    pub fn len(&self) -> usize {
        self.commands.len()
    }
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
    pub fn estimated_time(&self) -> Duration {
        self.estimated_time
    }
    fn estimate(&mut self) {
        let mut builder = StateBuilder::new();
        let mut elapsed = Duration::ZERO;
        let rapid_rate = self.rapid_rate;
        let estimated: Vec<Command> = self
            .commands
            .iter()
            .map(|command| {
                elapsed += match builder.analyze(command) {
                    Step::Move {
                        motion,
                        distance,
                        feed,
                    } => {
                        let rate = match motion {
                            MotionMode::Rapid => rapid_rate,
                            _ => feed.filter(|f| *f > 0.0).unwrap_or(rapid_rate),
                        };
                        // Rates are per minute.
                        Duration::try_from_secs_f64(distance * 60.0 / rate).unwrap_or(Duration::ZERO)
                    }
                    Step::Dwell(duration) => duration,
                    Step::Other => Duration::ZERO,
                };
                Command::with_time_offset(command.text(), elapsed)
            })
            .collect();
        self.commands = estimated;
        self.estimated_time = elapsed;
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    #[test]
    fn test_estimate() {
        let program = Program::from_text("G90\n\nG1 X100 F600\nG4 P2\nG0 X0\n", 6000.0);
        assert_eq!(program.len(), 4);
        let offsets: Vec<Duration> = program.commands().iter().map(Command::time_offset).collect();
        assert_eq!(
            offsets,
            vec![
                Duration::ZERO,
                Duration::from_secs(10),
                Duration::from_secs(12),
                Duration::from_secs(13),
            ]
        );
        assert_eq!(program.estimated_time(), Duration::from_secs(13));
    }

    #[test]
    fn test_append_keeps_offsets_cumulative() {
        let mut program = Program::from_text("G1 X10 F60", DEFAULT_RAPID_RATE);
        program.append_text("G1 X20");
        assert_eq!(program.commands()[1].time_offset(), Duration::from_secs(20));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new("program").unwrap();
        let path = dir.path().join("job.nc");
        let program = Program::from_text("G0 X1\nG1 X2 F100", DEFAULT_RAPID_RATE);
        program.save_file(&path).await.unwrap();
        let loaded = Program::load_file(&path, DEFAULT_RAPID_RATE).await.unwrap();
        assert_eq!(loaded, program);
    }
}
