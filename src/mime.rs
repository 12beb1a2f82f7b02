use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs::File;
use std::io::BufRead;

use anyhow::{Context, Result};

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

const DEFAULT_EXTENSIONS_MAP: &[&str] = &[
    "text/html                  html htm",
    "text/plain                 txt",
    "text/css                   css",
    "image/png                  png",
    "image/gif                  gif",
    "image/jpeg                 jpg jpeg",
    "image/vnd.microsoft.icon   ico",
    "application/x-javascript   js",
    "text/yaml                  yml yaml",
    "text/markdown              md",
    "image/bmp                  bmp",
    "audio/mpeg                 mp3 mp2 mpga",
    "audio/x-wav                wav",
    "audio/midi                 mid midi",
    "video/mpeg                 mpeg mpg",
    "video/mp4                  mp4",
    "video/3gpp                 3gp",
    "video/quicktime            mov",
    "video/x-ms-wmv             wmv",
    "video/x-msvideo            avi",
    "application/json           json",
    "application/xml            xml xsl",
    "application/xslt-xml       xslt",
    "application/xhtml+xml      xhtml xht",
    "application/xml-dtd        dtd",
    "application/x-tar          tar",
    "application/x-zip          zip",
];

/// Extension to content type associations. Read-only once the server starts.
#[derive(Debug)]
pub struct MimeMap {
    mimetypes: HashMap<String, String>,
    pub default_mimetype: String,
}

impl MimeMap {
    /// Add extension map from a file.
    pub fn parse_extension_map_file(&mut self, filename: &OsStr) -> Result<()> {
        let file = File::open(filename)
            .with_context(|| format!("failed to open {}", filename.to_string_lossy()))?;
        for line in std::io::BufReader::new(file).lines() {
            let line =
                line.with_context(|| format!("failed to read {}", filename.to_string_lossy()))?;
            self.add_mimetype_line(&line);
        }
        Ok(())
    }

    /// Add line from an extension map: a content type followed by its extensions.
    fn add_mimetype_line(&mut self, line: &str) {
        let mut fields = line
            .split(|c| matches!(c, ' ' | '\t' | '\r'))
            .filter(|field| !field.is_empty());
        let mimetype = match fields.next() {
            Some(mimetype) => mimetype,
            None => return, // empty line
        };
        if mimetype.starts_with('#') {
            return; // comment
        }
        for extension in fields {
            self.mimetypes
                .insert(extension.to_string(), mimetype.to_string());
        }
    }

    /// Content type for a file name, by the text after its last dot.
    pub fn content_type(&self, file_name: &[u8]) -> &str {
        file_name
            .iter()
            .rposition(|&b| b == b'.')
            .and_then(|dot| std::str::from_utf8(&file_name[dot + 1..]).ok())
            .and_then(|extension| self.mimetypes.get(extension))
            .unwrap_or(&self.default_mimetype)
    }
}

impl Default for MimeMap {
    /// Create MimeMap using the default extension map.
    fn default() -> Self {
        let mut mime_map = Self {
            mimetypes: HashMap::new(),
            default_mimetype: DEFAULT_MIME_TYPE.to_string(),
        };
        for line in DEFAULT_EXTENSIONS_MAP {
            mime_map.add_mimetype_line(line);
        }
        mime_map
    }
}
