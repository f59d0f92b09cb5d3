use std::time::Duration;

use ndarray::Array1;

use super::{
    command::Command,
    gcode::{format_number, CoordinateMode, CoordinateSystem, MotionMode, SpindleMode, Unit},
};

/*
    Replays program lines without sending them, keeping the modal state Grbl would
have after them: coordinate mode, motion mode, feed, power and the last point
reached. Used to resume a job mid-file and to estimate run time.
*/
#[derive(Debug, Clone, PartialEq)]
pub struct StateBuilder {
    coordinate_mode: CoordinateMode,
    motion: MotionMode,
    unit: Option<Unit>,
    coordinate_system: Option<CoordinateSystem>,
    spindle: Option<SpindleMode>,
    position: [f64; 3],
    // Axes some replayed motion named; the others are left where they are.
    referenced: [bool; 3],
    feed: Option<f64>,
    power: Option<f64>,
}

// What one analyzed line asks the machine to do, for time estimates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    Move {
        motion: MotionMode,
        distance: f64,
        feed: Option<f64>,
    },
    Dwell(Duration),
    Other,
}

impl Default for StateBuilder {
    fn default() -> Self {
        StateBuilder {
            coordinate_mode: CoordinateMode::Absolute,
            motion: MotionMode::Rapid,
            unit: None,
            coordinate_system: None,
            spindle: None,
            position: [0.0; 3],
            referenced: [false; 3],
            feed: None,
            power: None,
        }
    }
}

impl StateBuilder {
    pub fn new() -> Self {
        StateBuilder::default()
    }
    pub fn motion(&self) -> MotionMode {
        self.motion
    }
    pub fn position(&self) -> Array1<f64> {
        Array1::from(self.position.to_vec())
    }
    pub fn analyze(&mut self, command: &Command) -> Step {
        let info = command.info();
        if let Some(mode) = info.coordinate_mode {
            self.coordinate_mode = mode;
        }
        if let Some(unit) = info.unit {
            self.unit = Some(unit);
        }
        if let Some(system) = info.coordinate_system {
            self.coordinate_system = Some(system);
        }
        if let Some(spindle) = info.spindle {
            self.spindle = Some(spindle);
        }
        if let Some(feed) = info.f {
            self.feed = Some(feed);
        }
        if let Some(power) = info.s {
            self.power = Some(power);
        }
        if info.is_pause() {
            let seconds = info.p.unwrap_or(0.0).max(0.0);
            return Step::Dwell(Duration::try_from_secs_f64(seconds).unwrap_or(Duration::ZERO));
        }
        if !info.is_motion_block() {
            return Step::Other;
        }
        if let Some(motion) = info.motion {
            self.motion = motion;
        }
        if !info.has_axis_words() {
            return Step::Other;
        }
        let previous = self.position;
        for (axis, value) in [info.x, info.y, info.z].into_iter().enumerate() {
            if let Some(value) = value {
                self.position[axis] = match self.coordinate_mode {
                    CoordinateMode::Absolute => value,
                    CoordinateMode::Incremental => self.position[axis] + value,
                };
                self.referenced[axis] = true;
            }
        }
        let distance = previous
            .iter()
            .zip(self.position.iter())
            .map(|(from, to)| (to - from).powi(2))
            .sum::<f64>()
            .sqrt();
        Step::Move {
            motion: self.motion,
            distance,
            feed: self.feed,
        }
    }
    // Fast move to the rebuilt point with the laser or spindle off.
    pub fn positioning_command(&self) -> String {
        let mut command = "M5 G0".to_string();
        for (letter, (value, referenced)) in ['X', 'Y', 'Z']
            .into_iter()
            .zip(self.position.iter().zip(self.referenced))
        {
            if referenced {
                command.push_str(&format!(" {}{}", letter, format_number(*value)));
            }
        }
        command
    }
    // Re-asserts everything modal that the replayed lines set.
    pub fn settled_modals(&self) -> String {
        let mut words: Vec<String> = Vec::new();
        if let Some(system) = self.coordinate_system {
            words.push(system.as_string());
        }
        if let Some(unit) = self.unit {
            words.push(unit.as_str().to_string());
        }
        words.push(self.motion.as_str().to_string());
        if let Some(feed) = self.feed {
            words.push(format!("F{}", format_number(feed)));
        }
        if let Some(power) = self.power {
            words.push(format!("S{}", format_number(power)));
        }
        if let Some(spindle) = self.spindle {
            words.push(spindle.as_str().to_string());
        }
        words.join(" ")
    }
}

/*
    The lines that bring a machine from an unknown state to where `program` would be
just before line `position`, followed by the rest of the program.
`work_offset` is the value to re-anchor with G92, when asked for.
*/
pub fn build_continuation(
    program: &[Command],
    position: usize,
    homing: bool,
    work_offset: Option<&Array1<f64>>,
) -> (Vec<Command>, Vec<Command>) {
    let position = position.min(program.len());
    let mut prefix = Vec::new();
    if homing {
        prefix.push(Command::new("$H"));
    }
    if let Some(offset) = work_offset {
        let axis = |i: usize| format_number(offset.get(i).copied().unwrap_or(0.0));
        prefix.push(Command::new(format!(
            "G92 X{} Y{} Z{}",
            axis(0),
            axis(1),
            axis(2)
        )));
    }
    let mut builder = StateBuilder::new();
    for command in &program[..position] {
        builder.analyze(command);
    }
    prefix.push(Command::new("G90"));
    prefix.push(Command::new(builder.positioning_command()));
    prefix.push(Command::new(builder.settled_modals()));

    let mut patch_pending = true;
    let remaining = program[position..]
        .iter()
        .map(|command| {
            if patch_pending && command.is_movement() {
                patch_pending = false;
                if command.info().motion.is_none() {
                    return command.with_motion_mode(builder.motion());
                }
            }
            command.queued_copy()
        })
        .collect();
    (prefix, remaining)
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    fn program(lines: &[&str]) -> Vec<Command> {
        lines.iter().map(|line| Command::new(*line)).collect()
    }

    fn texts(commands: &[Command]) -> Vec<String> {
        commands.iter().map(|c| c.text().to_string()).collect()
    }

    #[test]
    fn test_tracks_absolute_and_relative() {
        let mut builder = StateBuilder::new();
        for line in ["G21 G90", "G1 X10 Y10 F500", "G91", "X5", "Y-2.5 S300 M3"] {
            builder.analyze(&Command::new(line));
        }
        assert_eq!(builder.position(), array![15.0, 7.5, 0.0]);
        assert_eq!(builder.motion(), MotionMode::Linear);
        assert_eq!(builder.positioning_command(), "M5 G0 X15 Y7.5");
        assert_eq!(builder.settled_modals(), "G21 G1 F500 S300 M3");
    }

    #[test]
    fn test_non_motion_axis_words_ignored() {
        let mut builder = StateBuilder::new();
        builder.analyze(&Command::new("G0 X1 Y1"));
        assert_eq!(builder.analyze(&Command::new("G92 X0 Y0")), Step::Other);
        assert_eq!(builder.position(), array![1.0, 1.0, 0.0]);
        assert_eq!(
            builder.analyze(&Command::new("G4 P1.5")),
            Step::Dwell(Duration::from_millis(1500))
        );
    }

    #[test]
    fn test_move_distance() {
        let mut builder = StateBuilder::new();
        let step = builder.analyze(&Command::new("G1 X3 Y4 F60"));
        assert_eq!(
            step,
            Step::Move {
                motion: MotionMode::Linear,
                distance: 5.0,
                feed: Some(60.0)
            }
        );
    }

    #[test]
    fn test_continuation_from_line_five() {
        let program = program(&[
            "G90",
            "G0 X1 Y1",
            "G1 X2 F800 S100",
            "X3",
            "Y2",
            "X4",
            "G0 X0 Y0",
            "G1 X5",
            "X6",
            "Y7",
        ]);
        let (prefix, remaining) = build_continuation(&program, 5, false, None);
        assert_eq!(
            texts(&prefix),
            vec!["G90", "M5 G0 X3 Y2", "G1 F800 S100"]
        );
        assert_eq!(remaining.len(), 5);
        assert_eq!(remaining[0].text(), "G1 X4");
        assert_eq!(remaining[1].text(), "G0 X0 Y0");
        // Only the first movement gets patched.
        assert_eq!(remaining[3].text(), "X6");
    }

    #[test]
    fn test_continuation_with_homing_and_offset() {
        let program = program(&["G0 X1", "G1 X2 F100"]);
        let offset = array![-10.0, -20.5, 0.0];
        let (prefix, _) = build_continuation(&program, 1, true, Some(&offset));
        assert_eq!(
            texts(&prefix),
            vec!["$H", "G92 X-10 Y-20.5 Z0", "G90", "M5 G0 X1", "G0"]
        );
    }

    #[test]
    fn test_positioning_skips_unnamed_axes() {
        let program = program(&["G0 X1 Y1", "G1 X2 F100 S50"]);
        let (prefix, _) = build_continuation(&program, 2, false, None);
        assert_eq!(texts(&prefix), vec!["G90", "M5 G0 X2 Y1", "G1 F100 S50"]);

        let mut builder = StateBuilder::new();
        builder.analyze(&Command::new("G91"));
        builder.analyze(&Command::new("G0 Z-1"));
        assert_eq!(builder.positioning_command(), "M5 G0 Z-1");
        assert_eq!(StateBuilder::new().positioning_command(), "M5 G0");
    }

    #[test]
    fn test_continuation_is_repeatable() {
        let program = program(&["G1 X1 F10", "G2 X2 Y2 I1", "X3"]);
        let first = build_continuation(&program, 2, false, None);
        let second = build_continuation(&program, 2, false, None);
        assert_eq!(first, second);
    }
}
