//! Directory listings, written to an anonymous temporary file so they can be sent like any other
//! file.

use std::fs::{self, File, Metadata};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::config::SERVER_SOFTWARE;
use crate::mime::MimeMap;
use crate::url::UrlEncoded;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListingFormat {
    Json,
    Xml,
}

impl ListingFormat {
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Xml => "application/xml",
        }
    }
}

#[derive(Debug, Serialize)]
struct Listing<'a> {
    path: &'a str,
    timestamp: String,
    server: &'static str,
    entries: Vec<Entry>,
}

#[derive(Debug, Serialize)]
struct Entry {
    name: String,
    href: String,
    #[serde(rename = "type")]
    kind: String,
    size: String,
    modified: String,
}

impl Entry {
    fn new(name: &[u8], metadata: &Metadata, mime_map: &MimeMap) -> Self {
        let is_dir = metadata.is_dir();
        let mut href = UrlEncoded(name).to_string();
        if is_dir {
            href.push('/');
        }
        let modified = metadata
            .modified()
            .map(|modified| {
                DateTime::<Local>::from(modified)
                    .format("%Y-%m-%d %H:%M:%S")
                    .to_string()
            })
            .unwrap_or_default();
        Self {
            name: String::from_utf8_lossy(name).into_owned(),
            href,
            kind: if is_dir {
                "dir".to_string()
            } else {
                mime_map.content_type(name).to_string()
            },
            size: metadata.len().to_string(),
            modified,
        }
    }
}

impl<'a> Listing<'a> {
    /// Read `dir`. `..` comes first, then directories and regular files by name.
    fn read(dir: &Path, path: &'a str, mime_map: &MimeMap) -> io::Result<Self> {
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(dir)? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name();
            // Follows symlinks; dangling links and special files are left out.
            match fs::metadata(dir_entry.path()) {
                Ok(metadata) if metadata.is_dir() || metadata.is_file() => {
                    entries.push(Entry::new(name.as_bytes(), &metadata, mime_map))
                }
                _ => {}
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        if let Ok(metadata) = fs::metadata(dir.join("..")) {
            entries.insert(0, Entry::new(b"..", &metadata, mime_map));
        }
        Ok(Self {
            path,
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            server: SERVER_SOFTWARE,
            entries,
        })
    }

    fn write_xml<W: Write>(&self, out: &mut W) -> io::Result<()> {
        write!(
            out,
            "<?xml version=\"1.0\"?><directory><path>{}</path><timestamp>{}</timestamp>\
            <server>{}</server>",
            XmlEscaped(self.path),
            self.timestamp,
            self.server
        )?;
        for entry in &self.entries {
            write!(
                out,
                "<entry><name>{}</name><href>{}</href><type>{}</type><size>{}</size>\
                <modified>{}</modified></entry>",
                XmlEscaped(&entry.name),
                XmlEscaped(&entry.href),
                XmlEscaped(&entry.kind),
                entry.size,
                entry.modified
            )?;
        }
        write!(out, "</directory>")
    }
}

/// Escape < > & ' " into XML entities.
struct XmlEscaped<'a>(&'a str);

impl<'a> std::fmt::Display for XmlEscaped<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => write!(f, "&lt;")?,
                '>' => write!(f, "&gt;")?,
                '&' => write!(f, "&amp;")?,
                '\'' => write!(f, "&apos;")?,
                '"' => write!(f, "&quot;")?,
                c => write!(f, "{}", c)?,
            }
        }
        Ok(())
    }
}

/// Write the listing of `dir`, shown to clients as `path`, to `out`.
pub fn write_listing<W: Write>(
    out: &mut W,
    dir: &Path,
    path: &str,
    format: ListingFormat,
    mime_map: &MimeMap,
) -> io::Result<()> {
    let listing = Listing::read(dir, path, mime_map)?;
    match format {
        ListingFormat::Json => serde_json::to_writer(&mut *out, &listing).map_err(io::Error::from),
        ListingFormat::Xml => listing.write_xml(out),
    }
}

/// Write the listing into an anonymous temporary file, rewound and ready to send.
pub fn listing_file(
    dir: &Path,
    path: &str,
    format: ListingFormat,
    mime_map: &MimeMap,
) -> io::Result<File> {
    let mut file = tempfile::tempfile()?;
    let mut out = BufWriter::new(&mut file);
    write_listing(&mut out, dir, path, format, mime_map)?;
    out.flush()?;
    drop(out);
    file.seek(SeekFrom::Start(0))?;
    Ok(file)
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Read;

    fn populate() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("sub dir")).unwrap();
        fs::write(root.path().join("b.html"), b"<html></html>").unwrap();
        fs::write(root.path().join("a.txt"), b"hello").unwrap();
        root
    }

    #[test]
    fn json_listing_describes_entries() {
        let root = populate();
        let mut out = Vec::new();
        write_listing(
            &mut out,
            root.path(),
            "/files/",
            ListingFormat::Json,
            &MimeMap::default(),
        )
        .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["path"], "/files/");
        assert_eq!(value["server"], SERVER_SOFTWARE);
        let entries = value["entries"].as_array().unwrap();
        let names: Vec<&str> = entries
            .iter()
            .map(|entry| entry["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["..", "a.txt", "b.html", "sub dir"]);
        assert_eq!(entries[1]["type"], "text/plain");
        assert_eq!(entries[1]["size"], "5");
        assert_eq!(entries[2]["type"], "text/html");
        assert_eq!(entries[3]["type"], "dir");
        assert_eq!(entries[3]["href"], "sub%20dir/");
    }

    #[test]
    fn xml_listing_is_escaped() {
        let root = populate();
        fs::write(root.path().join("x&y.txt"), b"").unwrap();
        let mut out = Vec::new();
        write_listing(
            &mut out,
            root.path(),
            "/",
            ListingFormat::Xml,
            &MimeMap::default(),
        )
        .unwrap();
        let xml = String::from_utf8(out).unwrap();
        assert!(xml.starts_with("<?xml version=\"1.0\"?><directory><path>/</path>"));
        assert!(xml.contains("<entry><name>x&amp;y.txt</name><href>x%26y.txt</href>"));
        assert!(xml.contains("<name>sub dir</name><href>sub%20dir/</href><type>dir</type>"));
        assert!(xml.ends_with("</directory>"));
    }

    #[test]
    fn listing_file_is_rewound() {
        let root = populate();
        let mut file = listing_file(
            root.path(),
            "/",
            ListingFormat::Json,
            &MimeMap::default(),
        )
        .unwrap();
        let mut contents = String::new();
        file.read_to_string(&mut contents).unwrap();
        assert!(contents.starts_with("{\"path\":\"/\""));
    }

    #[test]
    fn missing_directory_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let mut out = Vec::new();
        assert!(write_listing(
            &mut out,
            &root.path().join("missing"),
            "/missing/",
            ListingFormat::Json,
            &MimeMap::default(),
        )
        .is_err());
    }
}
