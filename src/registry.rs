//! Fixed-capacity string registry.
//!
//! A `Registry` owns an `Arena` and an array of start offsets into it, so every stored string is
//! addressable by index without allocating. Request headers, reply headers and program
//! environments are all registries of different sizes.

use crate::arena::Arena;
use crate::error::{Error, Result};

pub struct Registry<const BYTES: usize, const ENTRIES: usize> {
    arena: Arena<BYTES>,
    offsets: [usize; ENTRIES],
    count: usize,
}

impl<const BYTES: usize, const ENTRIES: usize> Registry<BYTES, ENTRIES> {
    pub const fn new() -> Self {
        Self {
            arena: Arena::new(),
            offsets: [0; ENTRIES],
            count: 0,
        }
    }

    pub fn reset(&mut self) {
        self.arena.reset();
        self.count = 0;
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn arena(&self) -> &Arena<BYTES> {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut Arena<BYTES> {
        &mut self.arena
    }

    /// Store `s` as a new entry.
    pub fn add(&mut self, s: &[u8]) -> Result<()> {
        if self.count == ENTRIES {
            return Err(Error::RegistryFull);
        }
        let start = self.arena.append(s)?;
        self.offsets[self.count] = start;
        self.count += 1;
        Ok(())
    }

    /// Grow the last entry. Must follow an `add`.
    pub fn extend(&mut self, s: &[u8]) -> Result<()> {
        self.arena.extend(s)
    }

    pub fn extend_char(&mut self, c: u8) -> Result<()> {
        self.arena.extend_char(c)
    }

    pub fn extend_number(&mut self, n: u64) -> Result<()> {
        self.arena.extend_number(n)
    }

    /// Add a `name=value` entry.
    pub fn add_variable(&mut self, name: &str, value: &[u8]) -> Result<()> {
        self.add(name.as_bytes())?;
        self.extend(b"=")?;
        self.extend(value)
    }

    pub fn add_variable_number(&mut self, name: &str, n: u64) -> Result<()> {
        self.add(name.as_bytes())?;
        self.extend(b"=")?;
        self.extend_number(n)
    }

    /// Entry `index`, up to its first terminator.
    pub fn get(&self, index: usize) -> Option<&[u8]> {
        if index >= self.count {
            return None;
        }
        Some(self.arena.string(self.offsets[index]))
    }

    /// Entry `index` including any bytes left behind by an in-place shrink, without terminator.
    pub fn get_raw(&self, index: usize) -> Option<&[u8]> {
        if index >= self.count {
            return None;
        }
        Some(self.arena.range(self.offsets[index], self.end_of(index)))
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut [u8]> {
        if index >= self.count {
            return None;
        }
        let start = self.offsets[index];
        let end = self.end_of(index);
        Some(self.arena.range_mut(start, end))
    }

    fn end_of(&self, index: usize) -> usize {
        match self.offsets.get(index + 1) {
            Some(&next) if index + 1 < self.count => next - 1,
            _ => self.arena.len() - 1,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.count).map(move |index| self.arena.string(self.offsets[index]))
    }

    /// Value of the first `name: value` entry whose name matches `name` case-insensitively.
    ///
    /// Leading blanks and control characters are stripped from the value.
    pub fn read_header(&self, name: &str) -> Option<&[u8]> {
        let name = name.as_bytes();
        self.iter().find_map(|entry| {
            if entry.len() <= name.len() || !entry[..name.len()].eq_ignore_ascii_case(name) {
                return None;
            }
            let rest = &entry[name.len()..];
            if rest[0] != b':' {
                return None;
            }
            let value = &rest[1..];
            let skip = value
                .iter()
                .position(|b| b.is_ascii_graphic())
                .unwrap_or(value.len());
            Some(&value[skip..])
        })
    }

    /// Project every `name: value` entry into `dest` as `PREFIX` + upper-cased name `=` value.
    ///
    /// Entries without a colon, or whose name is empty or contains whitespace (such as a request
    /// line), are skipped.
    pub fn copy_with_prefix<const B: usize, const E: usize>(
        &self,
        dest: &mut Registry<B, E>,
        prefix: &str,
    ) -> Result<()> {
        for entry in self.iter() {
            let colon = match entry.iter().position(|&b| b == b':') {
                Some(colon) => colon,
                None => continue,
            };
            let (name, value) = (&entry[..colon], &entry[colon + 1..]);
            if name.is_empty() || name.iter().any(|b| b.is_ascii_whitespace()) {
                continue;
            }
            dest.add(prefix.as_bytes())?;
            for &b in name {
                dest.extend_char(b.to_ascii_uppercase())?;
            }
            dest.extend(b"=")?;
            let skip = value
                .iter()
                .position(|b| b.is_ascii_graphic())
                .unwrap_or(value.len());
            dest.extend(&value[skip..])?;
        }
        Ok(())
    }
}

impl<const BYTES: usize, const ENTRIES: usize> Default for Registry<BYTES, ENTRIES> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    fn headers(lines: &[&str]) -> Registry<512, 8> {
        let mut registry = Registry::new();
        for line in lines {
            registry.add(line.as_bytes()).unwrap();
        }
        registry
    }

    #[test]
    fn add_reports_full_registry() {
        let mut registry = Registry::<64, 2>::new();
        registry.add(b"a").unwrap();
        registry.add(b"b").unwrap();
        assert!(matches!(registry.add(b"c"), Err(Error::RegistryFull)));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn add_reports_exhausted_arena() {
        let mut registry = Registry::<8, 4>::new();
        registry.add(b"abcd").unwrap();
        assert!(matches!(
            registry.add(b"efgh"),
            Err(Error::CapacityExceeded)
        ));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(1), None);
    }

    #[test]
    fn entries_are_independently_addressable() {
        let registry = headers(&["GET / HTTP/1.1", "Host: example.com", "Accept: */*"]);
        assert_eq!(registry.get(0), Some(&b"GET / HTTP/1.1"[..]));
        assert_eq!(registry.get(2), Some(&b"Accept: */*"[..]));
        assert_eq!(registry.iter().count(), 3);
    }

    #[test]
    fn variables_are_joined_with_equals() {
        let mut env = Registry::<128, 4>::new();
        env.add_variable("REQUEST_METHOD", b"GET").unwrap();
        env.add_variable_number("SERVER_PORT", 8080).unwrap();
        assert_eq!(env.get(0), Some(&b"REQUEST_METHOD=GET"[..]));
        assert_eq!(env.get(1), Some(&b"SERVER_PORT=8080"[..]));
    }

    #[test_case("connection", Some("close") ; "lower case")]
    #[test_case("CONNECTION", Some("close") ; "upper case")]
    #[test_case("Content-Length", Some("10") ; "tab before value")]
    #[test_case("Content", None ; "prefix only")]
    #[test_case("Authorization", None ; "absent")]
    fn read_header_works(name: &str, expected: Option<&str>) {
        let registry = headers(&[
            "GET / HTTP/1.1",
            "Connection:   close",
            "Content-Length:\t10",
        ]);
        assert_eq!(registry.read_header(name), expected.map(str::as_bytes));
    }

    #[test]
    fn copy_with_prefix_projects_headers() {
        let registry = headers(&[
            "GET http://host:80/ HTTP/1.1",
            "Host: example.com",
            "User-Agent: test",
            "malformed",
        ]);
        let mut env = Registry::<256, 8>::new();
        env.add_variable("SERVER_NAME", b"stackhttpd").unwrap();
        registry.copy_with_prefix(&mut env, "HTTP_").unwrap();
        let entries: Vec<&[u8]> = env.iter().collect();
        assert_eq!(
            entries,
            vec![
                &b"SERVER_NAME=stackhttpd"[..],
                &b"HTTP_HOST=example.com"[..],
                &b"HTTP_USER-AGENT=test"[..],
            ]
        );
    }

    #[test]
    fn copy_with_prefix_reports_exhaustion() {
        let registry = headers(&["Host: example.com", "Accept: */*"]);
        let mut env = Registry::<256, 1>::new();
        assert!(matches!(
            registry.copy_with_prefix(&mut env, "HTTP_"),
            Err(Error::RegistryFull)
        ));
    }

    #[test]
    fn get_mut_allows_in_place_shrink() {
        let mut registry = headers(&["GET /a%20b HTTP/1.1", "Host: x"]);
        let line = registry.get_mut(0).unwrap();
        assert_eq!(line.len(), 19);
        line[6..].copy_from_slice(b" b HTTP/1.1\0\0");
        assert_eq!(registry.get(0), Some(&b"GET /a b HTTP/1.1"[..]));
        assert_eq!(registry.get(1), Some(&b"Host: x"[..]));
    }

    #[test]
    fn reset_empties_registry() {
        let mut registry = headers(&["a", "b"]);
        registry.reset();
        assert!(registry.is_empty());
        assert_eq!(registry.arena().len(), 0);
    }
}
