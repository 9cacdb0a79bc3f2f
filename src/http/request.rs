//! Incremental request-head parser
//!
//! Requests arrive in arbitrary fragments; the connection accumulates them
//! in its fixed 4 KiB buffer and re-runs the parser whenever more bytes
//! land. Until the `\r\n\r\n` terminator is present the parse reports
//! [`ParseStatus::Partial`] and costs nothing but the scan.

use std::ops::Range;

use super::{Method, ParseError, ParseResult};

/// Longest accepted request target, in bytes.
pub const MAX_TARGET_LEN: usize = 1024;

/// Longest session id copied out of a `Cookie` header.
pub const MAX_SESSION_ID_LEN: usize = 32;

/// A fully parsed request head.
///
/// `body` is a span into the connection buffer rather than a copy: POST
/// bodies are only ever scanned for form parameters, in place.
#[derive(Debug, PartialEq, Eq)]
pub struct Request {
    /// Recognized request method.
    pub method: Method,
    /// The request target exactly as sent.
    pub target: String,
    /// First byte of the requested range. Defaults to 0 without a `Range`.
    pub range_start: i64,
    /// Last byte of the requested range, `-1` for open-ended.
    pub range_end: i64,
    /// Session id carried in the `Cookie` header, if any.
    pub session_id: Option<String>,
    /// Span of the body bytes within the receive buffer.
    pub body: Range<usize>,
}

/// Outcome of a parse attempt over the bytes received so far.
#[derive(Debug, PartialEq, Eq)]
pub enum ParseStatus {
    /// The head was complete and well-formed.
    Complete(Request),
    /// No `\r\n\r\n` yet; read more and try again.
    Partial,
}

/// Parses the request head out of `buf`.
///
/// # Example
/// ```
/// # use kino::http::request::{parse, ParseStatus};
/// # use kino::http::Method;
/// let status = parse(b"GET /intro.mp4 HTTP/1.1\r\nRange: bytes=0-99\r\n\r\n").unwrap();
/// let ParseStatus::Complete(req) = status else { panic!("complete") };
/// assert_eq!(Method::Get, req.method);
/// assert_eq!("/intro.mp4", req.target);
/// assert_eq!((0, 99), (req.range_start, req.range_end));
/// ```
pub fn parse(buf: &[u8]) -> ParseResult<ParseStatus> {
    let Some(head_end) = find_terminator(buf) else {
        return Ok(ParseStatus::Partial);
    };

    let head = &buf[..head_end];
    let mut lines = head.split(|&b| b == b'\n').map(|l| l.strip_suffix(b"\r").unwrap_or(l));

    let request_line = lines.next().ok_or(ParseError::RequestLine)?;
    let (method, target) = parse_request_line(request_line)?;

    let mut request = Request {
        method,
        target,
        range_start: 0,
        range_end: -1,
        session_id: None,
        body: head_end + 4..buf.len(),
    };

    for line in lines {
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        let name = &line[..colon];
        let value = trim_ascii(&line[colon + 1..]);

        if name.eq_ignore_ascii_case(b"range") {
            if let Some((start, end)) = parse_range(value) {
                request.range_start = start;
                request.range_end = end;
            }
        } else if name.eq_ignore_ascii_case(b"cookie") {
            request.session_id = session_from_cookie(value);
        }
        // Every other header is irrelevant to this server.
    }

    Ok(ParseStatus::Complete(request))
}

/// Looks up a `key=value` form parameter in an
/// `application/x-www-form-urlencoded` body.
///
/// The key must be preceded by `&` or start-of-string and followed
/// immediately by `=`, so looking up `id` in `user_id=5&id=7` yields `7`
/// rather than a slice of `user_id`'s value.
pub fn form_param<'a>(body: &'a str, key: &str) -> Option<&'a str> {
    let bytes = body.as_bytes();
    let mut from = 0;

    while let Some(pos) = body[from..].find(key) {
        let at = from + pos;
        let after = at + key.len();

        let bounded = at == 0 || bytes[at - 1] == b'&';
        if bounded && bytes.get(after) == Some(&b'=') {
            let value = &body[after + 1..];
            let end = value.find('&').unwrap_or(value.len());
            return Some(&value[..end]);
        }

        from = after;
    }

    None
}

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_request_line(line: &[u8]) -> ParseResult<(Method, String)> {
    let line = std::str::from_utf8(line).map_err(|_| ParseError::RequestLine)?;
    let mut parts = line.split_ascii_whitespace();

    let method = parts.next().ok_or(ParseError::RequestLine)?;
    let target = parts.next().ok_or(ParseError::RequestLine)?;
    let version = parts.next().ok_or(ParseError::RequestLine)?;
    if parts.next().is_some() {
        return Err(ParseError::RequestLine);
    }

    if !version.starts_with("HTTP/") {
        return Err(ParseError::Version);
    }
    if target.len() > MAX_TARGET_LEN {
        return Err(ParseError::Target);
    }

    let method = match method {
        "GET" => Method::Get,
        "POST" => Method::Post,
        "OPTIONS" => Method::Options,
        _ => Method::Unknown,
    };

    Ok((method, target.to_string()))
}

// `bytes=<start>-[<end>]`. A value in any other shape is ignored and the
// whole-resource default stands.
fn parse_range(value: &[u8]) -> Option<(i64, i64)> {
    let value = std::str::from_utf8(value).ok()?;
    let range = value.strip_prefix("bytes=")?;
    let (start, end) = range.split_once('-')?;

    let start: i64 = start.parse().ok()?;
    if start < 0 {
        return None;
    }

    let end = end.trim();
    if end.is_empty() {
        return Some((start, -1));
    }

    let end: i64 = end.parse().ok()?;
    if end < start {
        return None;
    }
    Some((start, end))
}

// Finds `session_id=` anywhere in the cookie string and copies at most 32
// bytes of the value, stopping at the delimiters a cookie jar can produce.
fn session_from_cookie(value: &[u8]) -> Option<String> {
    const KEY: &[u8] = b"session_id=";

    let at = value.windows(KEY.len()).position(|w| w == KEY)?;
    let raw = &value[at + KEY.len()..];

    let end = raw
        .iter()
        .position(|&b| matches!(b, b';' | b'\r' | b'\n' | b' ' | 0))
        .unwrap_or(raw.len())
        .min(MAX_SESSION_ID_LEN);

    if end == 0 {
        return None;
    }
    String::from_utf8(raw[..end].to_vec()).ok()
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}
