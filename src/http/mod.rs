//! HTTP/1.1 types and request parsing

use std::fmt::Display;

pub mod request;
pub mod response;

/// Request methods the server recognizes.
///
/// Anything else parses as [`Method::Unknown`] and is answered by the
/// router rather than rejected by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// RFC 9110 9.3.1
    Get,
    /// RFC 9110 9.3.3
    Post,
    /// RFC 9110 9.3.7
    Options,
    /// A syntactically valid token the server does not serve.
    Unknown,
}

impl Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Options => "OPTIONS",
            Self::Unknown => "UNKNOWN",
        })
    }
}

/// Status codes this server emits.
/// [RFC 9110 Section 15](https://www.rfc-editor.org/rfc/rfc9110#section-15)
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// 15.3.1
    Ok = 200,
    /// 15.3.7
    PartialContent = 206,
    /// 15.5.1
    BadRequest = 400,
    /// 15.5.2
    Unauthorized = 401,
    /// 15.5.4
    Forbidden = 403,
    /// 15.5.5
    NotFound = 404,
    /// 15.5.6
    MethodNotAllowed = 405,
    /// 15.5.10
    Conflict = 409,
    /// 15.5.17
    RangeNotSatisfiable = 416,
    /// 15.6.1
    InternalServerError = 500,
    /// 15.6.4
    ServiceUnavailable = 503,
}

impl Status {
    /// The reason phrase sent on the status line.
    pub fn reason(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::PartialContent => "Partial Content",
            Status::BadRequest => "Bad Request",
            Status::Unauthorized => "Unauthorized",
            Status::Forbidden => "Forbidden",
            Status::NotFound => "Not Found",
            Status::MethodNotAllowed => "Method Not Allowed",
            Status::Conflict => "Conflict",
            Status::RangeNotSatisfiable => "Range Not Satisfiable",
            Status::InternalServerError => "Internal Server Error",
            Status::ServiceUnavailable => "Service Unavailable",
        }
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}", *self as u16))
    }
}

/// Represents possible failures while parsing a request head.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseError {
    /// The request line is missing pieces or is not valid text.
    RequestLine,
    /// The target is unreasonably long or malformed.
    Target,
    /// The version token does not name an HTTP version.
    Version,
}

impl ParseError {
    fn description_str(&self) -> &'static str {
        match *self {
            ParseError::RequestLine => "Malformed request line",
            ParseError::Target => "Invalid request target",
            ParseError::Version => "Invalid HTTP version",
        }
    }
}

impl Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.description_str())
    }
}

impl std::error::Error for ParseError {}

/// Result whose Err variant is `ParseError`
pub type ParseResult<T> = std::result::Result<T, ParseError>;
