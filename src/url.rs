use std::fmt::{self, Write};

use crate::error::{Error, Result};

/// Decode `%XX` escapes in place and return the decoded length.
///
/// Decoding never grows its input. An escape that is not followed by two hex digits is kept
/// literally. An escape decoding to NUL is rejected.
pub fn url_decode(buf: &mut [u8]) -> Result<usize> {
    let mut read = 0;
    let mut write = 0;
    while read < buf.len() {
        let c = buf[read];
        if c == b'%'
            && read + 2 < buf.len()
            && buf[read + 1].is_ascii_hexdigit()
            && buf[read + 2].is_ascii_hexdigit()
        {
            let decoded = hex_to_digit(buf[read + 1]) * 16 + hex_to_digit(buf[read + 2]);
            if decoded == 0 {
                return Err(Error::Decode);
            }
            buf[write] = decoded;
            read += 3;
        } else {
            buf[write] = c;
            read += 1;
        }
        write += 1;
    }
    Ok(write)
}

/// Convert hex digit to integer.
fn hex_to_digit(hex: u8) -> u8 {
    if (b'A'..=b'F').contains(&hex) {
        hex - b'A' + 10
    } else if (b'a'..=b'f').contains(&hex) {
        hex - b'a' + 10
    } else {
        hex - b'0'
    }
}

fn write_escaped(f: &mut fmt::Formatter<'_>, b: u8) -> fmt::Result {
    write!(f, "%{:02X}", b)
}

/// Encode bytes to be an RFC3986-compliant URL part.
pub struct UrlEncoded<'a>(pub &'a [u8]);

impl<'a> fmt::Display for UrlEncoded<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.0 {
            if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
                f.write_char(b as char)?;
            } else {
                write_escaped(f, b)?;
            }
        }
        Ok(())
    }
}

/// Encode client-supplied bytes for logging. Logs should not contain control characters or
/// double quotes.
pub struct LogEncoded<'a>(pub &'a [u8]);

impl<'a> fmt::Display for LogEncoded<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.0 {
            if !b.is_ascii() || b.is_ascii_control() || b == b'"' {
                write_escaped(f, b)?;
            } else {
                f.write_char(b as char)?;
            }
        }
        Ok(())
    }
}
