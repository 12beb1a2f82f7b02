#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::{create_dir, File};
use std::io;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

#[macro_export]
macro_rules! map {
    ($($k:expr => $v:expr),* $(,)?) => {
        std::iter::Iterator::collect(std::array::IntoIter::new([$(($k, $v),)*]))
    };
}

fn get_unused_port() -> Option<u16> {
    TcpListener::bind(("localhost", 0))
        .ok()
        .map(|listener| listener.local_addr().unwrap().port())
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..1000 {
        if let Ok(_) = TcpStream::connect(("localhost", port)) {
            return true;
        }
        sleep(Duration::from_millis(1));
    }
    false
}

struct ScopedChild(Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

impl From<Child> for ScopedChild {
    fn from(child: Child) -> Self {
        ScopedChild(child)
    }
}

/// A running server binary with its own document root.
pub struct Server {
    _child: ScopedChild,
    port: u16,
    root: TempDir,
}

impl Server {
    pub fn with_args(args: &[&str]) -> Self {
        let root = tempdir().expect("failed to create tempdir");
        Self::with_root(root, args)
    }

    /// Start the server on `root`. Files created in it before this call exist from the first
    /// request on.
    pub fn with_root(root: TempDir, args: &[&str]) -> Self {
        // Get an unused port. Assumes the port won't be reused before the server binds it.
        let port = get_unused_port().expect("failed to get unused port");

        let child = Command::new(env!("CARGO_BIN_EXE_stackhttpd"))
            .args(&[
                root.path().to_str().expect("path is not valid UTF-8"),
                "--port",
                &format!("{}", port),
                "--addr",
                "127.0.0.1",
            ])
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn server")
            .into();

        // Wait until the socket is open.
        assert!(wait_for_port(port), "failed to connect to server");

        Self {
            _child: child,
            port,
            root,
        }
    }
    pub fn root(&self) -> &Path {
        self.root.path()
    }
    pub fn create_dir(&self, name: &str) {
        let mut path = self.root().to_path_buf();
        path.push(name);
        create_dir(path).expect("failed to create directory");
    }
    pub fn create_file(&self, name: &str) -> File {
        let mut path = self.root().to_path_buf();
        path.push(name);
        File::create(path).expect("failed to create file")
    }
    /// Connect if the server is still listening.
    pub fn try_stream(&self) -> Option<TcpStream> {
        TcpStream::connect(("localhost", self.port)).ok()
    }
    pub fn stream(&self) -> TcpStream {
        let stream =
            TcpStream::connect(("localhost", self.port)).expect("failed to connect to server");
        // Set timeouts to prevent tests from hanging
        stream
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        stream
    }
    /// Send one request and read its response. The connection is closed afterwards.
    pub fn request(
        &self,
        method: &str,
        path: &str,
        headers: HashMap<&str, &str>,
        body: &[u8],
    ) -> Response {
        let mut stream = self.stream();
        write!(stream, "{} {} HTTP/1.1\r\n", method, path).unwrap();
        write!(stream, "Connection: close\r\n").unwrap();
        for (header_name, header_value) in headers {
            write!(stream, "{}: {}\r\n", header_name, header_value).unwrap();
        }
        write!(stream, "\r\n").unwrap();
        stream.write_all(body).unwrap();
        Response::from_reader(&mut stream).expect("failed to read response")
    }
    pub fn get(&self, path: &str, headers: HashMap<&str, &str>) -> Response {
        self.request("GET", path, headers, b"")
    }
}

/// HTTP response read off the wire.
pub struct Response {
    response_line: String,
    headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl Response {
    pub fn from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let response_line = Self::read_header(reader)?;
        let headers = Self::read_headers(reader)?;
        let body = headers
            .get("Content-Length")
            .map(|length| length.parse::<usize>().expect("invalid content length"))
            .map(|length| Self::read_body(reader, length))
            .transpose()?;
        Ok(Self {
            response_line,
            headers,
            body,
        })
    }
    fn read_headers<R: Read>(reader: &mut R) -> io::Result<HashMap<String, String>> {
        let mut headers = HashMap::new();
        loop {
            let header_line = Self::read_header(reader)?;
            if header_line.is_empty() {
                break;
            }
            let mut header = header_line.splitn(2, ": ");
            let key = header.next().expect("invalid header").to_string();
            let value = header.next().expect("invalid header").to_string();
            headers.insert(key, value);
        }
        Ok(headers)
    }
    fn read_header<R: Read>(reader: &mut R) -> io::Result<String> {
        read_until_slice(reader, b"\r\n")
            .map(|vec| String::from_utf8(vec).expect("response header is not valid UTF-8"))
    }
    fn read_body<R: Read>(reader: &mut R, content_length: usize) -> io::Result<Vec<u8>> {
        let mut body = Vec::new();
        body.resize(content_length, 0);
        reader.read_exact(&mut body)?;
        Ok(body)
    }
    pub fn protocol(&self) -> &str {
        self.response_line
            .splitn(2, " ")
            .next()
            .expect("invalid response line")
    }
    pub fn status(&self) -> &str {
        self.response_line
            .splitn(2, " ")
            .nth(1)
            .expect("invalid response line")
    }
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|name| name.as_str())
    }
    pub fn text(&self) -> Option<&str> {
        self.body
            .as_ref()
            .map(|body| std::str::from_utf8(body).expect("body is not valid UTF-8"))
    }
}

fn read_until_slice<R: Read>(reader: &mut R, separator: &[u8]) -> io::Result<Vec<u8>> {
    let mut byte = [0; 1];
    let mut buf = Vec::new();
    loop {
        reader.read_exact(&mut byte)?;
        buf.push(byte[0]);
        if buf.as_slice().ends_with(separator) {
            buf.truncate(buf.len() - separator.len());
            return Ok(buf);
        }
    }
}
