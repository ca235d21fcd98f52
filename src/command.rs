//! # Command Processor
//!
//! Pure assembly of on-wire bytes from command text. No configuration or
//! global state is consulted; prefix and suffix arrive as arguments so the
//! same function serves manual sends, macro steps, and tests.

use crate::error::CommandError;

/// Resolve the escape sequences `\r`, `\n`, `\t`, `\0`, and `\\` to their
/// byte values. Unrecognized escapes are kept verbatim, backslash included.
pub fn resolve_escapes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('0') => out.push('\0'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Parse hex text into raw bytes.
///
/// Whitespace and commas are separators; each group may carry an optional
/// `0x`/`0X` prefix. The offset in [`CommandError::InvalidHex`] indexes the
/// cleaned digit string (separators and prefixes removed), with a dangling
/// nibble reported one past the final digit.
pub fn parse_hex(text: &str) -> Result<Vec<u8>, CommandError> {
    let mut digits = String::new();
    for raw_group in text.split(|c: char| c.is_whitespace() || c == ',') {
        let group = raw_group
            .strip_prefix("0x")
            .or_else(|| raw_group.strip_prefix("0X"))
            .unwrap_or(raw_group);
        for c in group.chars() {
            if !c.is_ascii_hexdigit() {
                return Err(CommandError::InvalidHex {
                    offset: digits.len(),
                });
            }
            digits.push(c);
        }
    }
    if digits.len() % 2 != 0 {
        return Err(CommandError::InvalidHex {
            offset: digits.len(),
        });
    }
    let mut bytes = Vec::with_capacity(digits.len() / 2);
    for pair in digits.as_bytes().chunks_exact(2) {
        bytes.push((nibble(pair[0]) << 4) | nibble(pair[1]));
    }
    Ok(bytes)
}

/// Digit value of a validated ASCII hex character.
fn nibble(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => digit - b'A' + 10,
    }
}

/// Render bytes as canonical hex text: uppercase pairs, space separated.
/// `parse_hex(to_canonical_hex(b)) == b` for any byte sequence.
pub fn to_canonical_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{:02X}", b));
    }
    out
}

/// Assemble the on-wire bytes for one command.
///
/// In hex mode the text is parsed as hex and emitted raw; prefix and suffix
/// do not apply. In text mode the command is UTF-8 encoded after optionally
/// prepending `prefix` and appending `suffix`, with escape sequences resolved
/// in all three parts.
pub fn format(
    text: &str,
    hex_mode: bool,
    use_prefix: bool,
    use_suffix: bool,
    prefix: &str,
    suffix: &str,
) -> Result<Vec<u8>, CommandError> {
    if hex_mode {
        return parse_hex(text);
    }
    let mut assembled = String::new();
    if use_prefix {
        assembled.push_str(&resolve_escapes(prefix));
    }
    assembled.push_str(&resolve_escapes(text));
    if use_suffix {
        assembled.push_str(&resolve_escapes(suffix));
    }
    Ok(assembled.into_bytes())
}
