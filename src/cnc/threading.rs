use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/*
    Pacing profiles for the two loops. Slower profiles poll the board less often and
sleep longer between sends and reads.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
pub enum ThreadingMode {
    Slow,
    Quiet,
    Fast,
    #[default]
    UltraFast,
    Insane,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadingProfile {
    pub status_query: Duration,
    pub tx_long: Duration,
    pub tx_short: Duration,
    pub rx_long: Duration,
    pub rx_short: Duration,
}

const fn profile(query: u64, tx_long: u64, tx_short: u64, rx_long: u64, rx_short: u64) -> ThreadingProfile {
    ThreadingProfile {
        status_query: Duration::from_millis(query),
        tx_long: Duration::from_millis(tx_long),
        tx_short: Duration::from_millis(tx_short),
        rx_long: Duration::from_millis(rx_long),
        rx_short: Duration::from_millis(rx_short),
    }
}

impl ThreadingMode {
    pub fn profile(self) -> ThreadingProfile {
        match self {
            ThreadingMode::Slow => profile(2000, 15, 4, 2, 1),
            ThreadingMode::Quiet => profile(1000, 10, 2, 1, 1),
            ThreadingMode::Fast => profile(500, 5, 1, 1, 0),
            ThreadingMode::UltraFast => profile(200, 1, 0, 0, 0),
            ThreadingMode::Insane => profile(100, 1, 0, 0, 0),
        }
    }
    // No status report for this long during a run means the board stopped answering.
    pub fn hang_threshold(self) -> Duration {
        (self.profile().status_query * 10).max(Duration::from_secs(5))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
pub enum StreamingMode {
    // Fill the firmware's serial buffer as far as it goes.
    #[default]
    Buffered,
    // One line at a time, next only after the previous ack.
    Synchronous,
    // Synchronous, and a rejected program line is sent again up to three times.
    RepeatOnError,
}

impl StreamingMode {
    pub fn is_synchronous(self) -> bool {
        self != StreamingMode::Buffered
    }
}
