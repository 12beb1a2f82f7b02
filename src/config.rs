use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io::BufWriter;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use nix::unistd::{getuid, Gid, Group, Uid, User};

use crate::autoindex::ListingFormat;
use crate::http::Method;
use crate::logger::{LogSink, Logger, DEFAULT_LEVEL};
use crate::mime::{MimeMap, DEFAULT_MIME_TYPE};

/// Product token sent in the `Server` header and written into listings.
pub const SERVER_SOFTWARE: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
pub const DEFAULT_INDEX_NAME: &str = "index.html";
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a worker needs to know about the server. Immutable once the listener is up.
#[derive(Debug)]
pub struct Server {
    pub public_dir: String,
    pub bindaddr: Option<String>,
    pub port: u16,
    pub logger: Logger,
    pub receive_timeout: Duration,
    pub send_timeout: Duration,
    pub index_name: Option<String>,
    pub autoindex: Option<ListingFormat>,
    /// URL prefix and directory of external programs.
    pub cgi: Option<(String, String)>,
    /// URL prefix under which PUT and DELETE are accepted.
    pub put_path: Option<String>,
    pub private_dir: Option<String>,
    pub pragma: Option<String>,
    pub auth_key: Option<String>,
    pub auth_methods: Vec<Method>,
    pub mime_map: MimeMap,
    pub want_no_keepalive: bool,
    pub want_sendfile: bool,
    pub want_chroot: bool,
    pub want_daemon: bool,
    pub drop_uid: Option<Uid>,
    pub drop_gid: Option<Gid>,
}

impl Server {
    /// Server for `public_dir` with every optional feature off.
    pub fn new(public_dir: &str) -> Self {
        Self {
            public_dir: public_dir.trim_end_matches('/').to_string(),
            bindaddr: None,
            port: if getuid().is_root() { 80 } else { 8080 },
            logger: Logger::default(),
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            index_name: Some(DEFAULT_INDEX_NAME.to_string()),
            autoindex: None,
            cgi: None,
            put_path: None,
            private_dir: None,
            pragma: None,
            auth_key: None,
            auth_methods: vec![Method::Get, Method::Head, Method::Put, Method::Delete],
            mime_map: MimeMap::default(),
            want_no_keepalive: false,
            want_sendfile: true,
            want_chroot: false,
            want_daemon: false,
            drop_uid: None,
            drop_gid: None,
        }
    }

    /// Build the configuration from command line arguments, including `argv[0]`.
    ///
    /// Returns `None` after printing usage.
    pub fn from_args<I: IntoIterator<Item = String>>(args: I) -> Result<Option<Self>> {
        let mut args = args.into_iter();
        let name = args.next().unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
        let mut server = match args.next().as_deref() {
            None | Some("--help") => {
                usage(&name); // no public_dir given
                return Ok(None);
            }
            Some(public_dir) => Self::new(public_dir),
        };
        let mut log_sink = LogSink::Stdout;
        let mut log_level = DEFAULT_LEVEL;
        while let Some(arg) = args.next().as_deref() {
            match arg {
                "--port" => {
                    let number = args.next().context("missing number after --port")?;
                    server.port = number
                        .parse()
                        .with_context(|| format!("port number {} is invalid", number))?;
                }
                "--addr" => {
                    server.bindaddr = Some(args.next().context("missing ip after --addr")?);
                }
                "--log" => {
                    let filename = args.next().context("missing filename after --log")?;
                    log_sink = LogSink::File(BufWriter::new(
                        OpenOptions::new()
                            .append(true)
                            .create(true)
                            .open(&filename)
                            .with_context(|| format!("failed to open log file {}", filename))?,
                    ))
                }
                "--syslog" => log_sink = LogSink::Syslog,
                "--log-level" => {
                    let number = args.next().context("missing number after --log-level")?;
                    log_level = number
                        .parse()
                        .ok()
                        .filter(|level| *level <= 4)
                        .with_context(|| format!("log level {} is invalid", number))?;
                }
                "--timeout" => {
                    server.receive_timeout = parse_seconds(args.next(), "--timeout")?;
                }
                "--send-timeout" => {
                    server.send_timeout = parse_seconds(args.next(), "--send-timeout")?;
                }
                "--index" => {
                    server.index_name =
                        Some(args.next().context("missing filename after --index")?);
                }
                "--no-index" => server.index_name = None,
                "--autoindex" => {
                    let format = args.next().context("missing format after --autoindex")?;
                    server.autoindex = Some(match format.as_str() {
                        "json" => ListingFormat::Json,
                        "xml" => ListingFormat::Xml,
                        _ => return Err(anyhow!("unknown listing format `{}'", format)),
                    });
                }
                "--cgi" => {
                    let prefix = args.next().context("missing prefix after --cgi")?;
                    let dir = args.next().context("missing directory after --cgi")?;
                    if !prefix.starts_with('/') {
                        return Err(anyhow!("cgi prefix `{}' must start with /", prefix));
                    }
                    server.cgi = Some((prefix, dir.trim_end_matches('/').to_string()));
                }
                "--put-path" => {
                    let prefix = args.next().context("missing prefix after --put-path")?;
                    if !prefix.starts_with('/') {
                        return Err(anyhow!("put prefix `{}' must start with /", prefix));
                    }
                    server.put_path = Some(prefix);
                }
                "--private-dir" => {
                    let dir = args.next().context("missing directory after --private-dir")?;
                    server.private_dir = Some(dir.trim_end_matches('/').to_string());
                }
                "--pragma" => {
                    server.pragma = Some(args.next().context("missing value after --pragma")?);
                }
                "--auth" => {
                    let user_pass = args.next().context("missing user:pass after --auth")?;
                    if !user_pass.contains(':') {
                        return Err(anyhow!("expected user:pass after --auth"));
                    }
                    server.auth_key =
                        Some(format!("Basic {}", Base64Encoded(user_pass.as_bytes())));
                }
                "--auth-methods" => {
                    let list = args.next().context("missing list after --auth-methods")?;
                    server.auth_methods = list
                        .split(',')
                        .map(|token| {
                            Method::parse(token.as_bytes(), true)
                                .with_context(|| format!("unknown method `{}'", token))
                        })
                        .collect::<Result<_>>()?;
                }
                "--mimetypes" => {
                    let filename = args.next().context("missing filename after --mimetypes")?;
                    server
                        .mime_map
                        .parse_extension_map_file(&OsString::from(filename))?;
                }
                "--default-mimetype" => {
                    server.mime_map.default_mimetype = args
                        .next()
                        .context("missing string after --default-mimetype")?;
                }
                "--no-keepalive" => server.want_no_keepalive = true,
                "--no-sendfile" => server.want_sendfile = false,
                "--chroot" => server.want_chroot = true,
                "--daemon" => server.want_daemon = true,
                "--uid" => {
                    let uid = args.next().context("missing uid after --uid")?;
                    let user1 = User::from_name(&uid).context("getpwnam failed")?;
                    let user2 = uid
                        .parse()
                        .ok()
                        .and_then(|uid| User::from_uid(Uid::from_raw(uid)).transpose())
                        .transpose()
                        .context("getpwuid failed")?;
                    let user = user1
                        .or(user2)
                        .with_context(|| format!("no such uid: `{}'", uid))?;
                    server.drop_uid = Some(user.uid)
                }
                "--gid" => {
                    let gid = args.next().context("missing gid after --gid")?;
                    let group1 = Group::from_name(&gid).context("getgrnam failed")?;
                    let group2 = gid
                        .parse()
                        .ok()
                        .and_then(|gid| Group::from_gid(Gid::from_raw(gid)).transpose())
                        .transpose()
                        .context("getgrgid failed")?;
                    let group = group1
                        .or(group2)
                        .with_context(|| format!("no such gid: `{}'", gid))?;
                    server.drop_gid = Some(group.gid)
                }
                _ => {
                    return Err(anyhow!("unknown argument `{}'", arg));
                }
            }
        }
        server.logger = Logger::new(log_sink, log_level);
        Ok(Some(server))
    }

    /// Whether PUT and DELETE are recognized at all.
    pub fn writes_enabled(&self) -> bool {
        self.put_path.is_some()
    }

    pub fn requires_auth(&self, method: Method) -> Option<&str> {
        self.auth_key
            .as_deref()
            .filter(|_| self.auth_methods.contains(&method))
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let addr = match self.bindaddr.as_deref() {
            Some(addr) => IpAddr::from_str(addr).context("malformed --addr argument")?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        Ok(SocketAddr::new(addr, self.port))
    }

    /// Initialize the TcpListener. This is the socket that we accept connections from.
    pub fn create_listener(&mut self) -> Result<TcpListener> {
        let socket_addr = self.socket_addr()?;
        // Sets `SO_REUSEADDR` implicitly.
        let listener = TcpListener::bind(socket_addr)
            .with_context(|| format!("failed to create listening socket for {}", socket_addr))?;
        // Port 0 asks the system for any free port.
        self.port = listener
            .local_addr()
            .context("failed to read listening address")?
            .port();
        println!("listening on: http://{}:{}/", socket_addr.ip(), self.port);
        Ok(listener)
    }
}

fn parse_seconds(arg: Option<String>, flag: &str) -> Result<Duration> {
    let number = arg.with_context(|| format!("missing number after {}", flag))?;
    let secs = number
        .parse::<u64>()
        .ok()
        .filter(|secs| *secs > 0)
        .with_context(|| format!("{} number {} is invalid", flag, number))?;
    Ok(Duration::from_secs(secs))
}

fn usage(argv0: &str) {
    print!(
        "usage:\t{} /path/to/wwwroot [flags]\n\n\
        flags:\t--port number (default: 8080, or 80 if running as root)\n\
        \t\tSpecifies which port to listen on for connections.\n\
        \t\tPass 0 to let the system choose any free port for you.\n\n\
        \t--addr ip (default: all)\n\
        \t\tIf multiple interfaces are present, specifies\n\
        \t\twhich one to bind the listening port to.\n\n\
        \t--log filename (default: stdout)\n\
        \t\tSpecifies which file to append the log to.\n\n\
        \t--syslog\n\
        \t\tUse syslog for the log.\n\n\
        \t--log-level number (default: {})\n\
        \t\t0 disables logging, 1 warnings only, up to 4 for debugging.\n\n\
        \t--timeout secs (default: {})\n\
        \t\tHow long a connection may stay silent while a request is read.\n\n\
        \t--send-timeout secs (default: {})\n\
        \t\tHow long a send may block before the connection is dropped.\n\n\
        \t--index filename (default: {})\n\
        \t\tDefault file to serve when a directory is requested.\n\n\
        \t--no-index\n\
        \t\tNever look for a default file in directories.\n\n\
        \t--autoindex json|xml (default: off)\n\
        \t\tServe a listing if a directory has no default file.\n\n\
        \t--cgi prefix dir\n\
        \t\tRun programs from dir for URLs starting with prefix.\n\n\
        \t--put-path prefix\n\
        \t\tAccept PUT and DELETE for URLs starting with prefix.\n\n\
        \t--private-dir dir\n\
        \t\tServe dir/<code>.html as the body of error responses.\n\n\
        \t--pragma value\n\
        \t\tAdd a Pragma header to every response.\n\n\
        \t--auth username:password\n\
        \t\tEnable basic authentication.\n\n\
        \t--auth-methods list (default: GET,HEAD,PUT,DELETE)\n\
        \t\tComma separated methods that require authentication.\n\n\
        \t--mimetypes filename (optional)\n\
        \t\tParses specified file for extension-MIME associations.\n\n\
        \t--default-mimetype string (optional, default: {})\n\
        \t\tFiles with unknown extensions are served as this mimetype.\n\n\
        \t--no-keepalive\n\
        \t\tDisables HTTP Keep-Alive functionality.\n\n\
        \t--no-sendfile\n\
        \t\tCopy files through user space instead of using sendfile.\n\n\
        \t--chroot (default: don't chroot)\n\
        \t\tLocks server into wwwroot directory for added security.\n\n\
        \t--daemon (default: don't daemonize)\n\
        \t\tDetach from the controlling terminal and run in the background.\n\n\
        \t--uid uid/uname, --gid gid/gname (default: don't privdrop)\n\
        \t\tDrops privileges to given uid:gid after initialization.\n\n",
        argv0,
        DEFAULT_LEVEL,
        DEFAULT_RECEIVE_TIMEOUT.as_secs(),
        DEFAULT_SEND_TIMEOUT.as_secs(),
        DEFAULT_INDEX_NAME,
        DEFAULT_MIME_TYPE,
    );
}

const BASE64_TABLE: &[char] = &[
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S',
    'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l',
    'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4',
    '5', '6', '7', '8', '9', '+', '/',
];

/// Encode data as base64.
struct Base64Encoded<'a>(&'a [u8]);

impl<'a> std::fmt::Display for Base64Encoded<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for chunk in self.0.chunks(3) {
            let mut triple: u32 = 0;
            for i in 0..3 {
                triple <<= 8;
                triple += *chunk.get(i).unwrap_or(&0) as u32;
            }
            for i in (0..4).rev().take(chunk.len() + 1) {
                write!(f, "{}", BASE64_TABLE[(triple as usize >> (i * 6)) & 0x3F])?;
            }
            for _ in 0..(3 - chunk.len()) {
                write!(f, "=")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("stackhttpd")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test_case(b"", "" ; "zero bytes")]
    #[test_case(b"M", "TQ==" ; "one byte")]
    #[test_case(b"Ma", "TWE=" ; "two bytes")]
    #[test_case(b"Man", "TWFu" ; "three bytes")]
    #[test_case(b"myuser:mypass", "bXl1c2VyOm15cGFzcw==" ; "credentials")]
    fn base_64_encoded_works(data: &[u8], output: &str) {
        assert_eq!(Base64Encoded(data).to_string(), output);
    }

    #[test]
    fn no_arguments_prints_usage() {
        assert!(Server::from_args(args(&[])).unwrap().is_none());
        assert!(Server::from_args(args(&["--help"])).unwrap().is_none());
    }

    #[test]
    fn flags_are_applied() {
        let server = Server::from_args(args(&[
            "/srv/www/",
            "--port",
            "8081",
            "--addr",
            "127.0.0.1",
            "--timeout",
            "10",
            "--autoindex",
            "xml",
            "--cgi",
            "/cgi-bin/",
            "/usr/lib/cgi-bin/",
            "--put-path",
            "/upload/",
            "--auth",
            "myuser:mypass",
            "--auth-methods",
            "PUT,DELETE",
            "--no-index",
            "--no-keepalive",
            "--log-level",
            "0",
        ]))
        .unwrap()
        .unwrap();
        assert_eq!(server.public_dir, "/srv/www");
        assert_eq!(server.port, 8081);
        assert_eq!(server.receive_timeout, Duration::from_secs(10));
        assert_eq!(server.send_timeout, DEFAULT_SEND_TIMEOUT);
        assert_eq!(server.autoindex, Some(ListingFormat::Xml));
        assert_eq!(
            server.cgi,
            Some(("/cgi-bin/".to_string(), "/usr/lib/cgi-bin".to_string()))
        );
        assert!(server.writes_enabled());
        assert_eq!(server.index_name, None);
        assert!(server.want_no_keepalive);
        assert_eq!(server.requires_auth(Method::Get), None);
        assert_eq!(
            server.requires_auth(Method::Put),
            Some("Basic bXl1c2VyOm15cGFzcw==")
        );
        assert_eq!(
            server.socket_addr().unwrap(),
            "127.0.0.1:8081".parse().unwrap()
        );
    }

    #[test_case(&["/srv", "--port"] ; "missing value")]
    #[test_case(&["/srv", "--port", "http"] ; "bad port")]
    #[test_case(&["/srv", "--bogus"] ; "unknown flag")]
    #[test_case(&["/srv", "--auth", "nocolon"] ; "bad credentials")]
    #[test_case(&["/srv", "--auth-methods", "GET,POST"] ; "bad method")]
    #[test_case(&["/srv", "--autoindex", "html"] ; "bad listing format")]
    #[test_case(&["/srv", "--timeout", "0"] ; "zero timeout")]
    #[test_case(&["/srv", "--log-level", "5"] ; "bad log level")]
    fn invalid_arguments_are_rejected(list: &[&str]) {
        assert!(Server::from_args(args(list)).is_err());
    }
}
