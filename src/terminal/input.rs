//! Input decoders for the three terminal input channels. Pure functions
//! over strings: no PTY involvement, tested in isolation.

use crate::error::BosunError;

/// Decode the control-code input syntax: `^X` caret codes plus the standard
/// escape sequences (`\n`, `\r`, `\t`, `\0`, `\e`, `\\`, `\xNN`, `\uNNNN`).
/// Unrecognised caret pairs pass through literally; a malformed escape is an
/// error.
pub fn decode_control_codes(input: &str) -> Result<Vec<u8>, BosunError> {
    let mut out = Vec::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '^' => match chars.peek().copied() {
                Some(next) if is_caret_code(next) => {
                    chars.next();
                    out.push(caret_byte(next));
                }
                _ => out.push(b'^'),
            },
            '\\' => {
                let Some(esc) = chars.next() else {
                    return Err(BosunError::InvalidArgument(
                        "dangling backslash in control_codes input".to_string(),
                    ));
                };
                match esc {
                    'n' => out.push(b'\n'),
                    'r' => out.push(b'\r'),
                    't' => out.push(b'\t'),
                    '0' => out.push(0x00),
                    'e' => out.push(0x1b),
                    '\\' => out.push(b'\\'),
                    'x' => {
                        let hi = chars.next();
                        let lo = chars.next();
                        let byte = match (hi.and_then(hex_val), lo.and_then(hex_val)) {
                             (Some(hi), Some(lo)) => (hi << 4) | lo,
                            _ => {
                                return Err(BosunError::InvalidArgument(
                                    "\\x escape requires two hex digits".to_string(),
                                ));
                            }
                        };
                        out.push(byte);
                    }
                    'u' => {
                        let mut code = 0u32;
                        for _ in 0..4 {
                            let digit = chars.next().and_then(hex_val).ok_or_else(|| {
                                BosunError::InvalidArgument(
                                    "\\u escape requires four hex digits".to_string(),
                                )
                            })?;
                             code = (code << 4) | digit as u32;
                        }
                        let ch = char::from_u32(code).ok_or_else(|| {
                            BosunError::InvalidArgument(format!(
                                "\\u{code:04x} is not a valid character"
                            ))
                        })?;
                        let mut buf = [0u8; 4];
                        out.extend_from_slice(ch.encode_utf8(&mut buf).as_bytes());
                    }
                    other => {
                        return Err(BosunError::InvalidArgument(format!(
                            "unknown escape sequence: \\{other}"
                        )));
                    }
                }
            }
            _ => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }

    Ok(out)
}

fn is_caret_code(c: char) -> bool {
    matches!(c, '@'..='_' | 'a'..='z' | '?')
}

fn caret_byte(c: char) -> u8 {
    match c {
        '?' => 0x7f,
        'a'..='z' => (c as u8 - b'a' + b'A') ^ 0x40,
        _ => c as u8 ^ 0x40,
    }
}

/// Decode a hexadecimal string into raw bytes. Whitespace is tolerated
/// between pairs; anything else is an error.
pub fn decode_hex(input: &str) -> Result<Vec<u8>, BosunError> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() % 2 != 0 {
        return Err(BosunError::InvalidArgument(
            "raw_bytes hex string must have an even number of digits".to_string(),
        ));
    }
    let mut out = Vec::with_capacity(compact.len() / 2);
    let bytes = compact.as_bytes();
    for pair in bytes.chunks_exact(2) {
        let hi = hex_val(pair[0] as char);
        let lo = hex_val(pair[1] as char);
        match (hi, lo) {
            (Some(hi), Some(lo)) => out.push((hi << 4) | lo),
            _ => {
                return Err(BosunError::InvalidArgument(format!(
                    "invalid hex digits in raw_bytes: {}{}",
                    pair[0] as char, pair[1] as char
                )));
            }
        }
    }
    Ok(out)
}

fn hex_val(c: char) -> Option<u8> {
    c.to_digit(16).map(|d| d as u8)
}
