// Single-byte commands Grbl acts on as soon as they arrive, outside the line buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RealtimeCommand {
    Reset = 0x18,
    StatusReport = b'?',
    CycleStart = b'~',
    FeedHold = b'!',
    JogCancel = 0x85,
    FeedOverrideReset = 0x90,
    FeedOverridePlusTen = 0x91,
    FeedOverrideMinusTen = 0x92,
    FeedOverridePlusOne = 0x93,
    FeedOverrideMinusOne = 0x94,
    RapidOverrideReset = 0x95,
    RapidOverrideHalf = 0x96,
    RapidOverrideQuarter = 0x97,
    SpindleOverrideReset = 0x99,
    SpindleOverridePlusTen = 0x9A,
    SpindleOverrideMinusTen = 0x9B,
    SpindleOverridePlusOne = 0x9C,
    SpindleOverrideMinusOne = 0x9D,
}

impl RealtimeCommand {
    pub fn byte(self) -> u8 {
        self as u8
    }
}

/*
    Words accepted in user sequences (header, footer, buttons) that must go out as
realtime bytes rather than as queued lines: "ctrl-x", "?", "!", "~" and raw "0xNN".
*/
pub fn parse_immediate(line: &str) -> Option<u8> {
    let line = line.trim();
    match line.to_ascii_lowercase().as_str() {
        "ctrl-x" => Some(RealtimeCommand::Reset.byte()),
        "?" => Some(RealtimeCommand::StatusReport.byte()),
        "!" => Some(RealtimeCommand::FeedHold.byte()),
        "~" => Some(RealtimeCommand::CycleStart.byte()),
        lower => lower
            .strip_prefix("0x")
            .filter(|hex| !hex.is_empty() && hex.len() <= 2)
            .and_then(|hex| u8::from_str_radix(hex, 16).ok()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes() {
        assert_eq!(RealtimeCommand::Reset.byte(), 0x18);
        assert_eq!(RealtimeCommand::JogCancel.byte(), 0x85);
        assert_eq!(RealtimeCommand::SpindleOverrideMinusOne.byte(), 0x9D);
    }

    #[test]
    fn test_parse_immediate() {
        assert_eq!(parse_immediate("Ctrl-X"), Some(0x18));
        assert_eq!(parse_immediate(" ! "), Some(b'!'));
        assert_eq!(parse_immediate("0x85"), Some(0x85));
        assert_eq!(parse_immediate("0x"), None);
        assert_eq!(parse_immediate("0x1234"), None);
        assert_eq!(parse_immediate("G0 X0"), None);
    }
}
