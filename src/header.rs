//! Incremental request header parser.
//!
//! Bytes are received into a caller-owned stream buffer and split into CRLF-terminated lines, one
//! registry entry per line. Whatever follows the blank line stays at the front of the stream
//! buffer: it is the start of a request body, or the next pipelined request.

use std::io::Read;

use crate::arena::Arena;
use crate::error::{Error, Result};
use crate::registry::Registry;
use crate::transfer::receive;

/// Read one header section from `socket` into `headers`.
///
/// Bytes already in `buffer` are parsed before anything is received. Returns the number of
/// recorded lines; zero means the section had no request line.
///
/// A line that does not fit is fatal only for the request line. Later lines that overflow the
/// registry are dropped, and a later line longer than the whole buffer is discarded as it
/// arrives.
pub fn parse_header<R: Read, const N: usize, const B: usize, const E: usize>(
    socket: &mut R,
    buffer: &mut Arena<N>,
    headers: &mut Registry<B, E>,
) -> Result<usize> {
    headers.reset();
    let mut cursor = 0;
    let mut rejecting = false;
    loop {
        if rejecting {
            match buffer.find_line_break(0) {
                Some(pos) => {
                    buffer.consume(pos + 2);
                    rejecting = false;
                    continue;
                }
                None => {
                    // A trailing '\r' may be the first half of the terminator.
                    let keep = if buffer.as_bytes().last() == Some(&b'\r') {
                        1
                    } else {
                        0
                    };
                    buffer.consume(buffer.len() - keep);
                }
            }
        } else {
            match buffer.find_line_break(cursor) {
                Some(pos) if pos == cursor => {
                    buffer.consume(pos + 2);
                    return Ok(headers.len());
                }
                Some(pos) => {
                    if headers.add(buffer.range(cursor, pos)).is_err() && headers.is_empty() {
                        return Err(Error::Parse);
                    }
                    cursor = pos + 2;
                    continue;
                }
                None if cursor > 0 => {
                    buffer.consume(cursor);
                    cursor = 0;
                }
                None if buffer.is_full() => {
                    if headers.is_empty() {
                        return Err(Error::HeaderTooLarge);
                    }
                    rejecting = true;
                    continue;
                }
                None => {}
            }
        }
        let n = receive(socket, buffer.spare_mut())?;
        buffer.commit(n);
    }
}
