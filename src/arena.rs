//! Fixed-capacity byte arena.
//!
//! An `Arena` is the only memory a request handler writes into. Strings are stored back to back,
//! each followed by a `TERMINATOR` byte, and the arena never grows: every write either fits
//! completely or fails with `Error::CapacityExceeded` and leaves the arena untouched.
//!
//! The same type doubles as a raw receive buffer (`spare_mut`, `commit`, `consume`), where no
//! terminators are written and the contents are whatever the socket delivered.

use crate::error::{Error, Result};

/// Byte written after every appended string.
pub const TERMINATOR: u8 = 0;

pub struct Arena<const N: usize> {
    storage: [u8; N],
    length: usize,
}

impl<const N: usize> Arena<N> {
    pub const fn new() -> Self {
        Self {
            storage: [0; N],
            length: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn is_full(&self) -> bool {
        self.length == N
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Valid bytes, terminators included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.storage[..self.length]
    }

    pub fn reset(&mut self) {
        self.length = 0;
    }

    /// Current cursor, for a later `reset_to`.
    pub fn mark(&self) -> usize {
        self.length
    }

    /// Truncate back to a cursor returned by `mark`.
    ///
    /// The byte before the mark becomes a terminator again, so a string that was extended after
    /// the mark was taken is restored to its earlier contents.
    pub fn reset_to(&mut self, mark: usize) {
        if mark > self.length {
            return;
        }
        self.length = mark;
        if mark > 0 {
            self.storage[mark - 1] = TERMINATOR;
        }
    }

    /// Store `s` as a new terminated string. Returns its start offset.
    pub fn append(&mut self, s: &[u8]) -> Result<usize> {
        let start = self.length;
        self.write_at(start, s)?;
        Ok(start)
    }

    /// Grow the most recently appended string by `s`.
    pub fn extend(&mut self, s: &[u8]) -> Result<()> {
        let at = self.length.saturating_sub(1);
        self.write_at(at, s)
    }

    pub fn extend_char(&mut self, c: u8) -> Result<()> {
        self.extend(&[c])
    }

    /// Grow the most recent string by the decimal rendering of `n`.
    pub fn extend_number(&mut self, n: u64) -> Result<()> {
        let mark = self.mark();
        self.extend_digits(n).map_err(|e| {
            self.reset_to(mark);
            e
        })
    }

    fn extend_digits(&mut self, n: u64) -> Result<()> {
        if n >= 10 {
            self.extend_digits(n / 10)?;
        }
        self.extend_char(b'0' + (n % 10) as u8)
    }

    fn write_at(&mut self, at: usize, s: &[u8]) -> Result<()> {
        let end = at + s.len();
        if end + 1 > N {
            return Err(Error::CapacityExceeded);
        }
        self.storage[at..end].copy_from_slice(s);
        self.storage[end] = TERMINATOR;
        self.length = end + 1;
        Ok(())
    }

    /// Substitute every `from` byte in the valid range with `to`.
    pub fn replace(&mut self, from: u8, to: u8) {
        for b in self.storage[..self.length].iter_mut() {
            if *b == from {
                *b = to;
            }
        }
    }

    /// Offset of the next `\r\n` at or after `start`.
    pub fn find_line_break(&self, start: usize) -> Option<usize> {
        if start >= self.length {
            return None;
        }
        self.storage[start..self.length]
            .windows(2)
            .position(|pair| pair == b"\r\n")
            .map(|pos| start + pos)
    }

    /// The terminated string starting at `start`, without its terminator.
    pub fn string(&self, start: usize) -> &[u8] {
        let bytes = &self.storage[start.min(self.length)..self.length];
        let end = bytes
            .iter()
            .position(|&b| b == TERMINATOR)
            .unwrap_or(bytes.len());
        &bytes[..end]
    }

    pub(crate) fn range(&self, start: usize, end: usize) -> &[u8] {
        &self.storage[start..end]
    }

    pub(crate) fn range_mut(&mut self, start: usize, end: usize) -> &mut [u8] {
        &mut self.storage[start..end]
    }

    /// Unused tail, for receiving into.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.length..]
    }

    /// Account for `n` bytes written into `spare_mut`.
    pub fn commit(&mut self, n: usize) {
        self.length = (self.length + n).min(N);
    }

    /// Drop the first `n` bytes, moving the rest to the front.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.length);
        self.storage.copy_within(n..self.length, 0);
        self.length -= n;
    }
}

impl<const N: usize> Default for Arena<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> std::fmt::Debug for Arena<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("capacity", &N)
            .field("length", &self.length)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    #[test]
    fn append_terminates_each_string() {
        let mut arena = Arena::<16>::new();
        assert_eq!(arena.append(b"ab").unwrap(), 0);
        assert_eq!(arena.append(b"cde").unwrap(), 3);
        assert_eq!(arena.as_bytes(), b"ab\0cde\0");
        assert_eq!(arena.string(3), b"cde");
    }

    #[test_case(b"1234567", true ; "exactly fits")]
    #[test_case(b"12345678", false ; "one over")]
    fn append_checks_capacity(s: &[u8], fits: bool) {
        let mut arena = Arena::<8>::new();
        assert_eq!(arena.append(s).is_ok(), fits);
        if !fits {
            assert_eq!(arena.len(), 0);
        }
    }

    #[test]
    fn failed_writes_leave_arena_unchanged() {
        let mut arena = Arena::<8>::new();
        arena.append(b"abc").unwrap();
        let before = arena.as_bytes().to_vec();
        assert!(matches!(
            arena.append(b"defgh"),
            Err(Error::CapacityExceeded)
        ));
        assert!(matches!(
            arena.extend(b"defgh"),
            Err(Error::CapacityExceeded)
        ));
        assert!(arena.extend_number(123_456).is_err());
        assert_eq!(arena.as_bytes(), before.as_slice());
    }

    #[test]
    fn extend_grows_last_string() {
        let mut arena = Arena::<32>::new();
        arena.append(b"first").unwrap();
        let start = arena.append(b"Content-Length: ").unwrap();
        arena.extend_number(4096).unwrap();
        arena.extend_char(b'\r').unwrap();
        assert_eq!(arena.string(start), b"Content-Length: 4096\r");
        assert_eq!(arena.string(0), b"first");
    }

    #[test_case(0, "0" ; "zero")]
    #[test_case(7, "7" ; "one digit")]
    #[test_case(10, "10" ; "two digits")]
    #[test_case(18_446_744_073_709_551_615, "18446744073709551615" ; "max")]
    fn extend_number_renders_decimal(n: u64, expected: &str) {
        let mut arena = Arena::<32>::new();
        arena.append(b"").unwrap();
        arena.extend_number(n).unwrap();
        assert_eq!(arena.string(0), expected.as_bytes());
    }

    #[test]
    fn reset_to_rolls_back_speculative_writes() {
        let mut arena = Arena::<64>::new();
        let start = arena.append(b"/srv/www/dir/").unwrap();
        let mark = arena.mark();
        arena.extend(b"index.html").unwrap();
        assert_eq!(arena.string(start), b"/srv/www/dir/index.html");
        arena.reset_to(mark);
        assert_eq!(arena.string(start), b"/srv/www/dir/");
        assert_eq!(arena.len(), mark);
    }

    #[test]
    fn reset_reproduces_fresh_output() {
        let fill = |arena: &mut Arena<24>| {
            arena.append(b"HTTP/1.1 200 OK\r").unwrap();
            arena.extend_number(42).unwrap();
            arena.append(b"x").unwrap();
        };
        let mut reused = Arena::<24>::new();
        reused.append(b"zzzzzzzzzzzzzzzzzzzzzzz").unwrap();
        reused.reset();
        fill(&mut reused);
        let mut fresh = Arena::<24>::new();
        fill(&mut fresh);
        assert_eq!(reused.as_bytes(), fresh.as_bytes());
    }

    #[test]
    fn replace_rewrites_terminators() {
        let mut arena = Arena::<16>::new();
        arena.append(b"a\r").unwrap();
        arena.append(b"\r").unwrap();
        arena.replace(TERMINATOR, b'\n');
        assert_eq!(arena.as_bytes(), b"a\r\n\r\n");
    }

    #[test_case(b"GET / HTTP/1.1\r\nHost: x\r\n", 0, Some(14) ; "first")]
    #[test_case(b"GET / HTTP/1.1\r\nHost: x\r\n", 15, Some(23) ; "second")]
    #[test_case(b"partial\r", 0, None ; "split terminator")]
    #[test_case(b"", 0, None ; "empty")]
    fn find_line_break_works(data: &[u8], start: usize, expected: Option<usize>) {
        let mut arena = Arena::<64>::new();
        arena.spare_mut()[..data.len()].copy_from_slice(data);
        arena.commit(data.len());
        assert_eq!(arena.find_line_break(start), expected);
    }

    #[test]
    fn consume_compacts_to_front() {
        let mut arena = Arena::<8>::new();
        arena.spare_mut()[..6].copy_from_slice(b"abcdef");
        arena.commit(6);
        arena.consume(4);
        assert_eq!(arena.as_bytes(), b"ef");
        arena.spare_mut()[..6].copy_from_slice(b"ghijkl");
        arena.commit(6);
        assert!(arena.is_full());
    }
}
