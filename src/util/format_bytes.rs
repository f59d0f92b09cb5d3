use std::ascii;

// Printable form of bytes written to the machine; realtime bytes show up as `\x85` and so on.
pub fn format_byte_string<Bytes: IntoIterator<Item = u8>>(bytes: Bytes) -> String {
    bytes
        .into_iter()
        .flat_map(ascii::escape_default)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escapes_realtime_bytes() {
        assert_eq!(format_byte_string(b"G0 X1\n".to_vec()), "G0 X1\\n");
        assert_eq!(format_byte_string([0x18, b'?']), "\\x18?");
    }
}
