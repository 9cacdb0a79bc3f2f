//! Response-header composition
//!
//! Headers are rendered directly into the connection's fixed 4 KiB buffer.
//! Bodies never pass through that buffer: files go through `sendfile`,
//! JSON replies are heap-owned and written separately.

use std::io::{self, Cursor, Write};

use super::Status;
use crate::sessions::SESSION_TTL;

/// A `Set-Cookie` value under construction.
///
/// Attribute order matches what the server has always sent:
/// `name=value; Path=/; HttpOnly; Max-Age=n`.
#[derive(Debug)]
pub struct SetCookie {
    name: &'static str,
    value: String,
    max_age: Option<u64>,
}

impl SetCookie {
    /// Starts a cookie with `Path=/` and `HttpOnly` implied.
    pub fn new(name: &'static str, value: &str) -> Self {
        Self {
            name,
            value: value.to_string(),
            max_age: None,
        }
    }

    /// Sets `Max-Age`.
    pub fn max_age(mut self, seconds: u64) -> Self {
        self.max_age = Some(seconds);
        self
    }

    /// Renders the header value.
    pub fn to_header(&self) -> String {
        let mut header = format!("{}={}; Path=/; HttpOnly", self.name, self.value);
        if let Some(age) = self.max_age {
            header.push_str(&format!("; Max-Age={age}"));
        }
        header
    }
}

/// Cookie set on a successful login.
pub fn session_cookie(id: &str) -> String {
    SetCookie::new("session_id", id)
        .max_age(SESSION_TTL.as_secs())
        .to_header()
}

/// Cookie that clears the session on logout.
pub fn clear_session_cookie() -> String {
    SetCookie::new("session_id", "").max_age(0).to_header()
}

/// Renders a `200 OK` file-response header. Returns the rendered length.
pub fn file_header(buf: &mut [u8], content_type: &str, content_length: u64) -> io::Result<usize> {
    let mut cursor = Cursor::new(buf);
    write!(
        cursor,
        "HTTP/1.1 200 OK\r\n\
         Content-Type: {content_type}\r\n\
         Content-Length: {content_length}\r\n\
         Connection: keep-alive\r\n\
         \r\n"
    )?;
    Ok(cursor.position() as usize)
}

/// Renders a `206 Partial Content` header for a resolved byte range.
pub fn partial_header(
    buf: &mut [u8],
    start: u64,
    end: u64,
    total: u64,
    content_length: u64,
) -> io::Result<usize> {
    let mut cursor = Cursor::new(buf);
    write!(
        cursor,
        "HTTP/1.1 206 Partial Content\r\n\
         Content-Type: video/mp4\r\n\
         Content-Range: bytes {start}-{end}/{total}\r\n\
         Content-Length: {content_length}\r\n\
         Connection: keep-alive\r\n\
         \r\n"
    )?;
    Ok(cursor.position() as usize)
}

/// Renders a JSON-reply header, optionally carrying a `Set-Cookie`.
pub fn json_header(
    buf: &mut [u8],
    status: Status,
    content_length: usize,
    set_cookie: Option<&str>,
) -> io::Result<usize> {
    let mut cursor = Cursor::new(buf);
    write!(
        cursor,
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {content_length}\r\n",
        status,
        status.reason()
    )?;
    if let Some(cookie) = set_cookie {
        write!(cursor, "Set-Cookie: {cookie}\r\n")?;
    }
    write!(cursor, "Connection: keep-alive\r\n\r\n")?;
    Ok(cursor.position() as usize)
}

/// Renders a bodyless error response. Error responses always close.
pub fn error_header(buf: &mut [u8], status: Status) -> io::Result<usize> {
    let mut cursor = Cursor::new(buf);
    write!(
        cursor,
        "HTTP/1.1 {} {}\r\n\
         Content-Length: 0\r\n\
         Connection: close\r\n\
         \r\n",
        status,
        status.reason()
    )?;
    Ok(cursor.position() as usize)
}

#[cfg(test)]
mod test {
    use super::{clear_session_cookie, error_header, file_header, json_header, partial_header, session_cookie};
    use crate::http::Status;

    fn rendered(buf: &[u8], len: usize) -> &str {
        std::str::from_utf8(&buf[..len]).unwrap()
    }

    #[test]
    fn file_header_matches_the_wire_format() {
        let mut buf = [0u8; 4096];
        let len = file_header(&mut buf, "text/html", 42).unwrap();
        assert_eq!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 42\r\nConnection: keep-alive\r\n\r\n",
            rendered(&buf, len)
        );
    }

    #[test]
    fn partial_header_reports_the_resolved_range() {
        let mut buf = [0u8; 4096];
        let len = partial_header(&mut buf, 0, 1023, 10_000, 1024).unwrap();
        let text = rendered(&buf, len);
        assert!(text.starts_with("HTTP/1.1 206 Partial Content\r\n"));
        assert!(text.contains("Content-Range: bytes 0-1023/10000\r\n"));
        assert!(text.contains("Content-Length: 1024\r\n"));
        assert!(text.contains("Content-Type: video/mp4\r\n"));
    }

    #[test]
    fn json_header_carries_an_optional_cookie() {
        let mut buf = [0u8; 4096];
        let len = json_header(&mut buf, Status::Ok, 17, Some("session_id=abc; Path=/; HttpOnly")).unwrap();
        let text = rendered(&buf, len);
        assert!(text.contains("Set-Cookie: session_id=abc; Path=/; HttpOnly\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));

        let len = json_header(&mut buf, Status::Unauthorized, 5, None).unwrap();
        let text = rendered(&buf, len);
        assert!(text.starts_with("HTTP/1.1 401 Unauthorized\r\n"));
        assert!(!text.contains("Set-Cookie"));
    }

    #[test]
    fn error_header_is_bodyless_and_closes() {
        let mut buf = [0u8; 4096];
        let len = error_header(&mut buf, Status::NotFound).unwrap();
        assert_eq!(
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            rendered(&buf, len)
        );
    }

    #[test]
    fn session_cookies_round_trip_login_and_logout() {
        let set = session_cookie("AbC123");
        assert_eq!("session_id=AbC123; Path=/; HttpOnly; Max-Age=1800", set);
        assert_eq!("session_id=; Path=/; HttpOnly; Max-Age=0", clear_session_cookie());
    }
}
