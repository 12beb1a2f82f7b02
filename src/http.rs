//! Wire vocabulary shared by the request handler and its collaborators.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Put,
    Delete,
}

impl Method {
    /// Recognize a method token. Write methods exist only when uploads are enabled.
    pub fn parse(token: &[u8], writes_enabled: bool) -> Option<Self> {
        match token {
            b"GET" => Some(Self::Get),
            b"HEAD" => Some(Self::Head),
            b"PUT" if writes_enabled => Some(Self::Put),
            b"DELETE" if writes_enabled => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        }
    }

    pub fn is_write(self) -> bool {
        matches!(self, Self::Put | Self::Delete)
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http10,
    Http11,
}

impl Protocol {
    pub fn parse(token: &[u8]) -> Option<Self> {
        match token {
            b"HTTP/1.0" => Some(Self::Http10),
            b"HTTP/1.1" => Some(Self::Http11),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

/// Response status codes the server emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    InternalServerError,
    NotImplemented,
    ServiceUnavailable,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::InternalServerError => 500,
            Self::NotImplemented => 501,
            Self::ServiceUnavailable => 503,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::InternalServerError => "Internal Server Error",
            Self::NotImplemented => "Not Implemented",
            Self::ServiceUnavailable => "Service Unavailable",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    KeepAlive,
    Close,
}

impl ConnectionState {
    /// Default for the protocol, overridden by an explicit `Connection` header.
    pub fn negotiate(protocol: Protocol, connection: Option<&[u8]>) -> Self {
        let token = |name: &[u8]| connection.map_or(false, |value| value.eq_ignore_ascii_case(name));
        match protocol {
            Protocol::Http11 if token(b"close") => Self::Close,
            Protocol::Http11 => Self::KeepAlive,
            Protocol::Http10 if token(b"keep-alive") => Self::KeepAlive,
            Protocol::Http10 => Self::Close,
        }
    }

    pub fn header(self) -> &'static [u8] {
        match self {
            Self::KeepAlive => b"Connection: keep-alive\r",
            Self::Close => b"Connection: close\r",
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    #[test_case(b"GET", false, Some(Method::Get) ; "get")]
    #[test_case(b"HEAD", false, Some(Method::Head) ; "head")]
    #[test_case(b"PUT", false, None ; "put without uploads")]
    #[test_case(b"PUT", true, Some(Method::Put) ; "put with uploads")]
    #[test_case(b"DELETE", true, Some(Method::Delete) ; "delete")]
    #[test_case(b"get", true, None ; "lower case")]
    #[test_case(b"POST", true, None ; "post")]
    fn method_parse_works(token: &[u8], writes_enabled: bool, expected: Option<Method>) {
        assert_eq!(Method::parse(token, writes_enabled), expected);
    }

    #[test_case(Protocol::Http11, None, ConnectionState::KeepAlive ; "1.1 default")]
    #[test_case(Protocol::Http11, Some("close"), ConnectionState::Close ; "1.1 close")]
    #[test_case(Protocol::Http11, Some("Keep-Alive"), ConnectionState::KeepAlive ; "1.1 keep")]
    #[test_case(Protocol::Http10, None, ConnectionState::Close ; "1.0 default")]
    #[test_case(Protocol::Http10, Some("keep-alive"), ConnectionState::KeepAlive ; "1.0 keep")]
    #[test_case(Protocol::Http10, Some("Close"), ConnectionState::Close ; "1.0 close")]
    fn negotiate_works(protocol: Protocol, header: Option<&str>, expected: ConnectionState) {
        assert_eq!(
            ConnectionState::negotiate(protocol, header.map(str::as_bytes)),
            expected
        );
    }

    #[test]
    fn status_line_text() {
        assert_eq!(Status::Ok.to_string(), "200 OK");
        assert_eq!(Status::NotImplemented.to_string(), "501 Not Implemented");
        assert_eq!(Status::ServiceUnavailable.code(), 503);
    }
}
