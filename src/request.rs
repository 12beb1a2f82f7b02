//! One request/response exchange on an open connection.
//!
//! Every buffer used here lives in the stack frame of `handle_request` (or, for the stream
//! buffer, of the connection loop calling it). Each stage either advances or returns the `Status`
//! of the error response to send; all error responses go through `Exchange::send_error`, which
//! never re-enters itself.

use std::cmp::min;
use std::ffi::OsStr;
use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::ops::Range;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use crate::arena::{Arena, TERMINATOR};
use crate::autoindex;
use crate::config::{Server, SERVER_SOFTWARE};
use crate::error::Error;
use crate::header::parse_header;
use crate::http::{ConnectionState, Method, Protocol, Status};
use crate::logger::Level;
use crate::program;
use crate::registry::Registry;
use crate::transfer::{receive_to_file, send_all, send_file, set_cork};
use crate::upload;
use crate::url::{url_decode, LogEncoded};

pub const HTTP_HEADER_LENGTH: usize = 4096;

/// Receive buffer that outlives a single request, so pipelined bytes are kept.
pub type StreamBuffer = Arena<HTTP_HEADER_LENGTH>;
type HeaderPool = Registry<HTTP_HEADER_LENGTH, 64>;
type ReplyPool = Registry<512, 16>;
type FileName = Arena<512>;
type EnvPool = Registry<4096, 96>;

const CHALLENGE: &[u8] = b"WWW-Authenticate: Basic realm=\"Realm\"\r";

/// Client address as it appears in log lines.
#[derive(Clone, Copy)]
struct Client(Option<SocketAddr>);

impl fmt::Display for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(addr) => write!(f, "{:>15}", addr.ip()),
            None => write!(f, "{:>15}", "-"),
        }
    }
}

/// Byte ranges of the request line fields.
#[derive(Debug, PartialEq)]
struct RequestLine {
    method: Range<usize>,
    resource: Option<Range<usize>>,
    protocol: Option<Range<usize>>,
}

impl RequestLine {
    /// Split on single spaces: method, resource, protocol. Anything after the protocol is
    /// ignored.
    fn split(line: &[u8]) -> Self {
        let mut next = Some(0);
        let mut field = || {
            let start = next?;
            match line[start..].iter().position(|&b| b == b' ') {
                Some(space) => {
                    next = Some(start + space + 1);
                    Some(start..start + space)
                }
                None => {
                    next = None;
                    Some(start..line.len())
                }
            }
        };
        let method = field().unwrap_or(0..0);
        let resource = field();
        let protocol = field();
        Self {
            method,
            resource,
            protocol,
        }
    }
}

/// A request whose resource and query have been decoded.
struct Request<'h> {
    method: Method,
    resource: &'h [u8],
    query: &'h [u8],
    headers: &'h HeaderPool,
}

/// Leading decimal digits of `value`, as `atoi` reads them.
fn leading_number(value: &[u8]) -> u64 {
    value
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .fold(0u64, |n, b| n.saturating_mul(10).saturating_add((b - b'0') as u64))
}

fn path_of<const N: usize>(file_name: &Arena<N>) -> &Path {
    Path::new(OsStr::from_bytes(file_name.string(0)))
}

/// Handle one request on `socket`, reading from `stream` first.
///
/// Returns `KeepAlive` only if the request was answered completely and the client negotiated a
/// persistent connection.
pub fn handle_request<S: Read + Write + AsRawFd>(
    server: &Server,
    socket: &mut S,
    peer: Option<SocketAddr>,
    stream: &mut StreamBuffer,
) -> ConnectionState {
    let fd = socket.as_raw_fd();
    let client = Client(peer);
    let mut headers = HeaderPool::new();
    match parse_header(socket, stream, &mut headers) {
        Ok(count) if count > 0 => {}
        Ok(_) | Err(Error::Parse) | Err(Error::HeaderTooLarge) => {
            log!(
                server.logger,
                Level::Warn,
                fd,
                "{}  FAIL \"Header broken or too large\"",
                client
            );
            return ConnectionState::Close;
        }
        Err(e) => {
            log!(server.logger, Level::Debug, fd, "{}  DROP \"{}\"", client, e);
            return ConnectionState::Close;
        }
    }

    let mut exchange = Exchange {
        server,
        socket,
        fd,
        client,
        protocol: Protocol::Http11,
        connection: ConnectionState::Close,
        challenge: false,
        head_only: false,
        reply: ReplyPool::new(),
    };
    match exchange.dispatch(&mut headers, stream) {
        Ok(state) => state,
        Err(status) => exchange.send_error(status),
    }
}

struct Exchange<'a, S> {
    server: &'a Server,
    socket: &'a mut S,
    fd: RawFd,
    client: Client,
    /// Protocol of the status line.
    protocol: Protocol,
    connection: ConnectionState,
    /// Whether replies carry a `WWW-Authenticate` challenge.
    challenge: bool,
    head_only: bool,
    reply: ReplyPool,
}

impl<'a, S: Read + Write + AsRawFd> Exchange<'a, S> {
    fn dispatch(
        &mut self,
        headers: &mut HeaderPool,
        stream: &mut StreamBuffer,
    ) -> Result<ConnectionState, Status> {
        let server = self.server;
        let (fd, client) = (self.fd, self.client);

        let line = headers.get(0).unwrap_or_default();
        let fields = RequestLine::split(line);
        let token = &line[fields.method.clone()];
        let method = match Method::parse(token, server.writes_enabled()) {
            Some(method) => method,
            None => {
                log!(server.logger, Level::Warn, fd, "{}  501  \"{}\"", client, LogEncoded(token));
                return Err(Status::NotImplemented);
            }
        };
        let resource = match fields.resource {
            Some(resource) => resource,
            None => {
                log!(server.logger, Level::Warn, fd, "{}  400  Missing resource", client);
                return Err(Status::BadRequest);
            }
        };
        let protocol = match fields.protocol {
            Some(protocol) if line[resource.clone()].first() == Some(&b'/') => protocol,
            _ => {
                log!(
                    server.logger,
                    Level::Warn,
                    fd,
                    "{}  400  \"{}  {}\"",
                    client,
                    method,
                    LogEncoded(&line[resource])
                );
                return Err(Status::BadRequest);
            }
        };
        log!(
            server.logger,
            Level::Info,
            fd,
            "{}  OK   \"{} {} {}\"",
            client,
            method,
            LogEncoded(&line[resource.clone()]),
            LogEncoded(&line[protocol.clone()])
        );

        self.protocol = match Protocol::parse(&line[protocol]) {
            Some(protocol) => protocol,
            None => return Err(Status::NotImplemented),
        };
        self.connection = if server.want_no_keepalive {
            ConnectionState::Close
        } else {
            ConnectionState::negotiate(self.protocol, headers.read_header("connection"))
        };
        self.head_only = method == Method::Head;

        let (path, query) = match line[resource.clone()].iter().position(|&b| b == b'?') {
            Some(mark) => (
                resource.start..resource.start + mark,
                Some(resource.start + mark + 1..resource.end),
            ),
            None => (resource, None),
        };
        let (path_len, query_len) = {
            let raw = headers.get_mut(0).ok_or(Status::BadRequest)?;
            let decode = |field: &mut [u8]| {
                url_decode(field).map_err(|e| {
                    log!(server.logger, Level::Warn, fd, "{}  500  \"{}\"", client, e);
                    Status::InternalServerError
                })
            };
            let path_len = decode(&mut raw[path.clone()])?;
            let query_len = match &query {
                Some(query) => decode(&mut raw[query.clone()])?,
                None => 0,
            };
            (path_len, query_len)
        };

        let headers: &HeaderPool = headers;
        let raw = headers.get_raw(0).unwrap_or_default();
        let request = Request {
            method,
            resource: &raw[path.start..path.start + path_len],
            query: query.map_or(&[][..], |query| &raw[query.start..query.start + query_len]),
            headers,
        };

        if request.resource.windows(3).any(|w| w == b"/..") {
            log!(
                server.logger,
                Level::Warn,
                fd,
                "{}  403  \"SEC {}\"",
                client,
                LogEncoded(request.resource)
            );
            return Err(Status::Forbidden);
        }

        if let Some(expected) = server.requires_auth(method) {
            match headers.read_header("authorization") {
                Some(credentials) if credentials == expected.as_bytes() => {}
                credentials => {
                    let reason = if credentials.is_some() {
                        "AUTH wrong credentials"
                    } else {
                        "AUTH header missing"
                    };
                    log!(server.logger, Level::Warn, fd, "{}  401  \"{}\"", client, reason);
                    self.challenge = true;
                    return Err(Status::Unauthorized);
                }
            }
        }

        if let Some((prefix, dir)) = &server.cgi {
            if request.resource.starts_with(prefix.as_bytes()) {
                return self.run_program(&request, prefix, dir);
            }
        }
        if method.is_write() {
            return self.write_upload(&request, stream);
        }
        self.serve_static(&request)
    }

    fn internal_error(&self, what: &str) -> Status {
        log!(self.server.logger, Level::Warn, self.fd, "Memory Error {}", what);
        Status::InternalServerError
    }

    fn run_program(
        &mut self,
        request: &Request<'_>,
        prefix: &str,
        dir: &str,
    ) -> Result<ConnectionState, Status> {
        let server = self.server;
        let (fd, client) = (self.fd, self.client);
        let query = LogEncoded(request.query);

        let remainder = &request.resource[prefix.len()..];
        let mut file_name = FileName::new();
        file_name
            .append(dir.as_bytes())
            .and_then(|_| match remainder.first() {
                Some(b'/') => Ok(()),
                _ => file_name.extend_char(b'/'),
            })
            .and_then(|_| file_name.extend(remainder))
            .map_err(|_| self.internal_error("composing program name"))?;
        let program = path_of(&file_name);
        let name = LogEncoded(file_name.string(0));

        let metadata = fs::metadata(program).map_err(|_| {
            log!(server.logger, Level::Detail, fd, "{}  404  \"CGI {} {}\"", client, name, query);
            Status::NotFound
        })?;
        if !metadata.is_file() {
            log!(server.logger, Level::Detail, fd, "{}  403  \"CGI {} {}\"", client, name, query);
            return Err(Status::Forbidden);
        }
        if !program::is_executable(program) {
            log!(server.logger, Level::Detail, fd, "{}  503  \"CGI {} {}\"", client, name, query);
            return Err(Status::ServiceUnavailable);
        }
        log!(server.logger, Level::Debug, fd, "{}  000  \"CGI {} {}\"", client, name, query);

        let mut env = EnvPool::new();
        let mut address = [0u8; 46];
        let address_len = match self.client.0 {
            Some(peer) => {
                let mut cursor = &mut address[..];
                write!(cursor, "{}", peer.ip())
                    .map_err(|_| self.internal_error("formatting address"))?;
                let left = cursor.len();
                address.len() - left
            }
            None => 0,
        };
        let prepared = env
            .add_variable("SERVER_NAME", env!("CARGO_PKG_NAME").as_bytes())
            .and_then(|_| env.add_variable_number("SERVER_PORT", server.port as u64))
            .and_then(|_| env.add_variable("SERVER_SOFTWARE", SERVER_SOFTWARE.as_bytes()))
            .and_then(|_| env.add_variable("SERVER_PROTOCOL", self.protocol.as_str().as_bytes()))
            .and_then(|_| env.add_variable("REQUEST_METHOD", request.method.as_str().as_bytes()))
            .and_then(|_| env.add_variable("SCRIPT_FILENAME", file_name.string(0)))
            .and_then(|_| env.add_variable("QUERY_STRING", request.query))
            .and_then(|_| env.add_variable("REMOTE_ADDR", &address[..address_len]))
            .and_then(|_| {
                env.add_variable_number(
                    "REMOTE_PORT",
                    self.client.0.map_or(0, |peer| peer.port()) as u64,
                )
            })
            .and_then(|_| request.headers.copy_with_prefix(&mut env, "HTTP_"))
            .and_then(|_| self.compose_program_header());
        if prepared.is_err() {
            return Err(self.internal_error("preparing program header"));
        }

        // The program writes the rest of the header.
        self.reply.arena_mut().replace(TERMINATOR, b'\n');
        if let Err(e) = send_all(self.socket, self.reply.arena().as_bytes()) {
            log!(server.logger, Level::Debug, fd, "{}  DROP \"{}\"", client, e);
            return Ok(ConnectionState::Close);
        }
        match program::run(program, Path::new(dir), &env, &*self.socket) {
            Ok(status) if !status.success() => {
                log!(
                    server.logger,
                    Level::Detail,
                    fd,
                    "{}  000  \"CGI {} {}\"",
                    client,
                    name,
                    status
                );
            }
            Ok(_) => {}
            Err(e) => {
                log!(server.logger, Level::Warn, fd, "{}  500  \"CGI {} {}\"", client, name, e);
            }
        }
        Ok(ConnectionState::Close)
    }

    fn write_upload(
        &mut self,
        request: &Request<'_>,
        stream: &mut StreamBuffer,
    ) -> Result<ConnectionState, Status> {
        let server = self.server;
        let (fd, client) = (self.fd, self.client);

        let inside = server
            .put_path
            .as_deref()
            .map_or(false, |prefix| request.resource.starts_with(prefix.as_bytes()));
        if !inside {
            log!(server.logger, Level::Detail, fd, "{}  403  \"PATH not allowed\"", client);
            return Err(Status::Forbidden);
        }

        if request.method == Method::Delete {
            let mut file_name = FileName::new();
            file_name
                .append(server.public_dir.as_bytes())
                .and_then(|_| file_name.extend(request.resource))
                .map_err(|_| self.internal_error("composing file name"))?;
            if let Err(e) = upload::delete_tree(path_of(&file_name)) {
                log!(
                    server.logger,
                    Level::Detail,
                    fd,
                    "{}  500  \"DELETE {} {}\"",
                    client,
                    LogEncoded(file_name.string(0)),
                    e
                );
                return Err(Status::InternalServerError);
            }
            return Ok(self.send_empty(Status::Ok));
        }

        let put_error = |what: &str, e: &dyn fmt::Display| {
            log!(server.logger, Level::Detail, fd, "{}  500  \"PUT {} {}\"", client, what, e);
            Status::InternalServerError
        };
        let content_length = request
            .headers
            .read_header("content-length")
            .map_or(0, leading_number);
        let root = Path::new(OsStr::new(&server.public_dir));
        let mut file = upload::open_for_writing(root, request.resource)
            .map_err(|e| put_error("file error", &e))?;
        let mut remaining = content_length;
        if remaining > 0 && !stream.is_empty() {
            let size = min(remaining, stream.len() as u64) as usize;
            file.write_all(&stream.as_bytes()[..size])
                .map_err(|e| put_error("overspill error", &e))?;
            stream.consume(size);
            remaining -= size as u64;
        }
        if remaining > 0 {
            let received = receive_to_file(self.socket, &mut file, remaining)
                .map_err(|e| put_error("pipe error", &e))?;
            if received < remaining {
                return Err(put_error("pipe error", &"body ended early"));
            }
        }
        file.sync_data().map_err(|e| put_error("close error", &e))?;
        Ok(self.send_empty(Status::Ok))
    }

    fn serve_static(&mut self, request: &Request<'_>) -> Result<ConnectionState, Status> {
        let server = self.server;
        let (fd, client) = (self.fd, self.client);

        let mut file_name = FileName::new();
        file_name
            .append(server.public_dir.as_bytes())
            .and_then(|_| file_name.extend(request.resource))
            .map_err(|_| self.internal_error("composing file name"))?;
        let resource_offset = server.public_dir.len();
        let not_found = |stage: &str, file_name: &FileName| {
            log!(
                server.logger,
                Level::Detail,
                fd,
                "{}  404  \"{} {}\"",
                client,
                stage,
                LogEncoded(file_name.string(0))
            );
            Status::NotFound
        };

        let mut metadata =
            fs::metadata(path_of(&file_name)).map_err(|_| not_found("STAT", &file_name))?;
        if metadata.is_dir() {
            if file_name.string(0).last() != Some(&b'/') {
                file_name
                    .extend_char(b'/')
                    .map_err(|_| self.internal_error("composing file name"))?;
            }
            let mut index = None;
            if let Some(index_name) = &server.index_name {
                let mark = file_name.mark();
                file_name
                    .extend(index_name.as_bytes())
                    .map_err(|_| self.internal_error("composing file name"))?;
                match fs::metadata(path_of(&file_name)) {
                    Ok(found) => index = Some(found),
                    Err(_) => file_name.reset_to(mark),
                }
            }
            match index {
                Some(found) => metadata = found,
                None => return self.serve_listing(&file_name, resource_offset),
            }
        }

        if !metadata.is_file() {
            return Err(not_found("REGF", &file_name));
        }
        let file = File::open(path_of(&file_name)).map_err(|_| not_found("OPEN", &file_name))?;
        log!(
            server.logger,
            Level::Debug,
            fd,
            "{}  000  \"OPEN {}\"",
            client,
            LogEncoded(file_name.string(0))
        );
        let content_type = server.mime_map.content_type(file_name.string(0));
        self.send_file(Status::Ok, file, metadata.len(), content_type)
    }

    fn serve_listing(
        &mut self,
        dir: &FileName,
        resource_offset: usize,
    ) -> Result<ConnectionState, Status> {
        let server = self.server;
        let (fd, client) = (self.fd, self.client);
        let format = match server.autoindex {
            Some(format) => format,
            None => {
                log!(
                    server.logger,
                    Level::Detail,
                    fd,
                    "{}  404  \"FAIL {}\"",
                    client,
                    LogEncoded(dir.string(0))
                );
                return Err(Status::NotFound);
            }
        };
        let path = String::from_utf8_lossy(&dir.string(0)[resource_offset..]);
        let listing = autoindex::listing_file(path_of(dir), &path, format, &server.mime_map)
            .and_then(|file| Ok((file.metadata()?.len(), file)));
        match listing {
            Ok((len, file)) => self.send_file(Status::Ok, file, len, format.content_type()),
            Err(e) => {
                log!(server.logger, Level::Detail, fd, "{}  500  \"AUTODIR {}\"", client, e);
                Err(Status::InternalServerError)
            }
        }
    }

    /// Compose a complete reply header into the reply pool.
    fn compose(
        &mut self,
        status: Status,
        content_length: u64,
        content_type: Option<&str>,
    ) -> crate::error::Result<()> {
        let reply = &mut self.reply;
        reply.reset();
        reply.add(self.protocol.as_str().as_bytes())?;
        reply.extend_char(b' ')?;
        reply.extend_number(status.code() as u64)?;
        reply.extend_char(b' ')?;
        reply.extend(status.reason().as_bytes())?;
        reply.extend_char(b'\r')?;
        reply.add(b"Server: ")?;
        reply.extend(SERVER_SOFTWARE.as_bytes())?;
        reply.extend_char(b'\r')?;
        reply.add(b"Content-Length: ")?;
        reply.extend_number(content_length)?;
        reply.extend_char(b'\r')?;
        if let Some(content_type) = content_type {
            reply.add(b"Content-Type: ")?;
            reply.extend(content_type.as_bytes())?;
            reply.extend_char(b'\r')?;
        }
        if let Some(pragma) = &self.server.pragma {
            reply.add(b"Pragma: ")?;
            reply.extend(pragma.as_bytes())?;
            reply.extend_char(b'\r')?;
        }
        if self.challenge {
            reply.add(CHALLENGE)?;
        }
        reply.add(self.connection.header())?;
        reply.add(b"\r")
    }

    /// Status line, `Server` and `Connection: close`; the program supplies the rest.
    fn compose_program_header(&mut self) -> crate::error::Result<()> {
        let reply = &mut self.reply;
        reply.reset();
        reply.add(self.protocol.as_str().as_bytes())?;
        reply.extend(b" 200 OK\r")?;
        reply.add(b"Server: ")?;
        reply.extend(SERVER_SOFTWARE.as_bytes())?;
        reply.extend_char(b'\r')?;
        reply.add(ConnectionState::Close.header())
    }

    /// Send the composed header, then `body` unless this is a HEAD request.
    fn transmit(&mut self, body: Option<(File, u64)>) -> ConnectionState {
        self.reply.arena_mut().replace(TERMINATOR, b'\n');
        set_cork(self.fd, true).ok();
        let result = send_all(self.socket, self.reply.arena().as_bytes()).and_then(|_| match body {
            Some((mut file, len)) if !self.head_only => {
                let sent = send_file(self.socket, &mut file, len, self.server.want_sendfile)?;
                Ok(sent == len)
            }
            _ => Ok(true),
        });
        set_cork(self.fd, false).ok();
        match result {
            Ok(true) => self.connection,
            Ok(false) => {
                log!(
                    self.server.logger,
                    Level::Debug,
                    self.fd,
                    "{}  DROP \"file shrank while sending\"",
                    self.client
                );
                ConnectionState::Close
            }
            Err(e) => {
                log!(self.server.logger, Level::Debug, self.fd, "{}  DROP \"{}\"", self.client, e);
                ConnectionState::Close
            }
        }
    }

    fn send_file(
        &mut self,
        status: Status,
        file: File,
        len: u64,
        content_type: &str,
    ) -> Result<ConnectionState, Status> {
        if self.compose(status, len, Some(content_type)).is_err() {
            return Err(self.internal_error("preparing response header"));
        }
        Ok(self.transmit(Some((file, len))))
    }

    /// Headers only. The last resort: a failure to compose closes without a reply.
    fn send_empty(&mut self, status: Status) -> ConnectionState {
        if self.compose(status, 0, None).is_err() {
            log!(self.server.logger, Level::Warn, self.fd, "Memory Error preparing empty response");
            return ConnectionState::Close;
        }
        self.transmit(None)
    }

    /// Answer with `status` and close, using the private error document if there is one.
    fn send_error(&mut self, status: Status) -> ConnectionState {
        self.connection = ConnectionState::Close;
        let server = self.server;
        let private_dir = match &server.private_dir {
            Some(private_dir) => private_dir,
            None => return self.send_empty(status),
        };

        let mut doc_name = FileName::new();
        let composed = doc_name
            .append(private_dir.as_bytes())
            .and_then(|_| doc_name.extend_char(b'/'))
            .and_then(|_| doc_name.extend_number(status.code() as u64))
            .and_then(|_| doc_name.extend(b".html"));
        if composed.is_err() {
            log!(server.logger, Level::Warn, self.fd, "Memory Error preparing error document name");
            return self.send_empty(status);
        }
        let doc = File::open(path_of(&doc_name)).and_then(|file| {
            let metadata = file.metadata()?;
            Ok((file, metadata))
        });
        let (file, len) = match doc {
            Ok((file, metadata)) if metadata.is_file() => (file, metadata.len()),
            _ => {
                log!(
                    server.logger,
                    Level::Warn,
                    self.fd,
                    "Server Doc Error \"OPEN {}\"",
                    LogEncoded(doc_name.string(0))
                );
                return self.send_empty(status);
            }
        };
        if self.compose(status, len, Some("text/html")).is_err() {
            log!(server.logger, Level::Warn, self.fd, "Memory Error preparing error response");
            return self.send_empty(Status::InternalServerError);
        }
        self.transmit(Some((file, len)))
    }
}
