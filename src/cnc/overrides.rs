use serde::Serialize;

use super::grbl::realtime::RealtimeCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OverrideValues {
    pub feed: u16,
    pub rapid: u16,
    pub spindle: u16,
}

impl Default for OverrideValues {
    fn default() -> Self {
        OverrideValues {
            feed: 100,
            rapid: 100,
            spindle: 100,
        }
    }
}

/*
    Grbl only accepts override changes as relative step bytes, so the operator sets a
target and we walk the reported value toward it, one step per channel per `Ov:` report.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Overrides {
    pub current: OverrideValues,
    pub target: OverrideValues,
}

impl Overrides {
    pub fn reset(&mut self) {
        *self = Overrides::default();
    }
    pub fn set_feed_target(&mut self, value: u16) {
        self.target.feed = value.clamp(10, 200);
    }
    pub fn set_spindle_target(&mut self, value: u16) {
        self.target.spindle = value.clamp(10, 200);
    }
    // Rapids only come in three sizes.
    pub fn set_rapid_target(&mut self, value: u16) {
        self.target.rapid = match value {
            100.. => 100,
            50..=99 => 50,
            _ => 25,
        };
    }
    // Returns whether the reported values differ from the last ones.
    pub fn update_current(&mut self, current: OverrideValues) -> bool {
        let changed = self.current != current;
        self.current = current;
        changed
    }
    pub fn next_steps(&self) -> Vec<RealtimeCommand> {
        use RealtimeCommand::*;
        let mut steps = Vec::new();
        steps.extend(linear_step(
            self.current.feed,
            self.target.feed,
            [
                FeedOverrideReset,
                FeedOverridePlusTen,
                FeedOverrideMinusTen,
                FeedOverridePlusOne,
                FeedOverrideMinusOne,
            ],
        ));
        steps.extend(linear_step(
            self.current.spindle,
            self.target.spindle,
            [
                SpindleOverrideReset,
                SpindleOverridePlusTen,
                SpindleOverrideMinusTen,
                SpindleOverridePlusOne,
                SpindleOverrideMinusOne,
            ],
        ));
        if self.current.rapid != self.target.rapid {
            steps.extend(match self.target.rapid {
                100 => Some(RapidOverrideReset),
                50 => Some(RapidOverrideHalf),
                25 => Some(RapidOverrideQuarter),
                _ => None,
            });
        }
        steps
    }
}

// `bytes` is [reset, +10, -10, +1, -1].
fn linear_step(current: u16, target: u16, bytes: [RealtimeCommand; 5]) -> Option<RealtimeCommand> {
    let [reset, plus_ten, minus_ten, plus_one, minus_one] = bytes;
    let gap = i32::from(target) - i32::from(current);
    if target == 100 && current != 100 {
        Some(reset)
    } else if gap >= 10 {
        Some(plus_ten)
    } else if gap <= -10 {
        Some(minus_ten)
    } else if gap >= 1 {
        Some(plus_one)
    } else if gap <= -1 {
        Some(minus_one)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_targets_clamped() {
        let mut overrides = Overrides::default();
        overrides.set_feed_target(500);
        overrides.set_spindle_target(1);
        overrides.set_rapid_target(70);
        assert_eq!(overrides.target.feed, 200);
        assert_eq!(overrides.target.spindle, 10);
        assert_eq!(overrides.target.rapid, 50);
        overrides.set_rapid_target(0);
        assert_eq!(overrides.target.rapid, 25);
    }

    #[test]
    fn test_walks_toward_target() {
        let mut overrides = Overrides::default();
        overrides.set_feed_target(123);
        overrides.set_spindle_target(95);
        overrides.set_rapid_target(25);
        assert_eq!(
            overrides.next_steps(),
            vec![
                RealtimeCommand::FeedOverridePlusTen,
                RealtimeCommand::SpindleOverrideMinusOne,
                RealtimeCommand::RapidOverrideQuarter
            ]
        );
        overrides.update_current(OverrideValues {
            feed: 120,
            rapid: 25,
            spindle: 95,
        });
        assert_eq!(overrides.next_steps(), vec![RealtimeCommand::FeedOverridePlusOne]);
        overrides.update_current(OverrideValues {
            feed: 123,
            rapid: 25,
            spindle: 95,
        });
        assert!(overrides.next_steps().is_empty());
    }

    #[test]
    fn test_back_to_hundred_uses_reset() {
        let mut overrides = Overrides::default();
        assert!(overrides.update_current(OverrideValues {
            feed: 150,
            rapid: 50,
            spindle: 40,
        }));
        assert_eq!(
            overrides.next_steps(),
            vec![
                RealtimeCommand::FeedOverrideReset,
                RealtimeCommand::SpindleOverrideReset,
                RealtimeCommand::RapidOverrideReset
            ]
        );
        assert!(!overrides.update_current(overrides.current));
    }
}
