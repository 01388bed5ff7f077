//! The byte-format decoder (spec.md §4.8): turns a block's raw bytes into the text
//! representation requested by a Stream Reader query. An unrecognized format name
//! falls back to `default`.

/// Decodes `bytes` per `format`, falling back to `Default` for anything unrecognized.
pub fn decode(format: &str, bytes: &[u8]) -> String {
    match Format::parse(format) {
        Format::Default => default_escape(bytes),
        Format::Hex => hex::encode(bytes),
        Format::HexDump => hexdump(bytes),
        Format::Base32 => base32::encode(base32::Alphabet::RFC4648 { padding: true }, bytes),
        Format::Base64 => base64::encode(bytes),
        Format::Ascii => bytes.iter().map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' }).collect(),
        Format::Binary => bytes.iter().map(|b| format!("{b:08b}")).collect::<Vec<_>>().join(" "),
        Format::Decimal => bytes.iter().map(|b| b.to_string()).collect::<Vec<_>>().join(" "),
        Format::Octal => bytes.iter().map(|b| format!("{b:03o}")).collect::<Vec<_>>().join(" "),
    }
}

enum Format {
    Default,
    Hex,
    HexDump,
    Base32,
    Base64,
    Ascii,
    Binary,
    Decimal,
    Octal,
}

impl Format {
    fn parse(s: &str) -> Format {
        match s {
            "hex" => Format::Hex,
            "hexdump" => Format::HexDump,
            "base32" => Format::Base32,
            "base64" => Format::Base64,
            "ascii" => Format::Ascii,
            "binary" => Format::Binary,
            "decimal" => Format::Decimal,
            "octal" => Format::Octal,
            _ => Format::Default,
        }
    }
}

/// UTF-8-ish pass-through: valid UTF-8 is kept as-is, non-printable or invalid bytes
/// are escaped as `\xNN` so the result is always a displayable string.
fn default_escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    let mut rest = bytes;
    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                escape_non_printable(valid, &mut out);
                break;
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                escape_non_printable(std::str::from_utf8(valid).unwrap(), &mut out);
                let bad_len = e.error_len().unwrap_or(after.len()).max(1);
                for b in &after[..bad_len] {
                    out.push_str(&format!("\\x{b:02x}"));
                }
                rest = &after[bad_len..];
                if rest.is_empty() {
                    break;
                }
            }
        }
    }
    out
}

fn escape_non_printable(s: &str, out: &mut String) {
    for c in s.chars() {
        if c == '\n' || c == '\r' || c == '\t' || (!c.is_control()) {
            out.push(c);
        } else {
            out.push_str(&format!("\\x{:02x}", c as u32));
        }
    }
}

fn hexdump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in bytes.chunks(16).enumerate() {
        out.push_str(&format!("{:08x}  ", row * 16));
        for (i, b) in chunk.iter().enumerate() {
            out.push_str(&format!("{b:02x} "));
            if i == 7 {
                out.push(' ');
            }
        }
        for _ in chunk.len()..16 {
            out.push_str("   ");
        }
        out.push_str(" |");
        for &b in chunk {
            out.push(if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' });
        }
        out.push_str("|\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_format_escapes_control_bytes() {
        assert_eq!(decode("default", b"a\x01b"), "a\\x01b");
    }

    #[test]
    fn hex_format_round_trips_readable_bytes() {
        assert_eq!(decode("hex", b"\xde\xad\xbe\xef"), "deadbeef");
    }

    #[test]
    fn unrecognized_format_falls_back_to_default() {
        assert_eq!(decode("not-a-real-format", b"hi"), "hi");
    }

    #[test]
    fn ascii_format_replaces_non_printables_with_dots() {
        assert_eq!(decode("ascii", b"a\x00b"), "a.b");
    }
}
