//! MP4 byte-range streaming
//!
//! The streaming responder resolves a `Range` request against the file on
//! disk, answers `206 Partial Content`, and hands the file to the
//! connection's body loop for zero-copy transfer. Transfers of any size
//! ride the worker pool without starving other clients: the body loop
//! yields after [`MAX_TURN_BYTES`](crate::connection::MAX_TURN_BYTES).

use std::fs::File;
use std::io::{self, ErrorKind};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use log::info;
use mio::net::TcpStream;

use crate::connection::{Body, Connection, StepContext, StepError};
use crate::http::request::Request;
use crate::http::{response, Status};

/// Opens `path` and stages a 206 response for the request's byte range.
///
/// Range resolution:
/// - `range_start` past the end of the file is `416 Range Not Satisfiable`,
///   and no descriptor is kept open for transfer.
/// - an absent or oversized `range_end` clamps to the last byte.
pub fn start(
    conn: &mut Connection,
    req: &Request,
    path: &Path,
    ctx: &StepContext,
) -> Result<(), StepError> {
    let full = ctx.config.root_dir.join(path);
    let file = open_for_response(&full)?;

    let meta = file.metadata().map_err(StepError::Io)?;
    if meta.is_dir() {
        return Err(StepError::Http(Status::Forbidden));
    }

    let total = meta.len();
    let start = req.range_start as u64;
    if start >= total {
        return Err(StepError::Http(Status::RangeNotSatisfiable));
    }

    let end = if req.range_end < 0 || req.range_end as u64 >= total {
        total - 1
    } else {
        req.range_end as u64
    };
    let content_length = end - start + 1;

    info!(
        "streaming {} bytes {start}-{end}/{total} to {}",
        full.display(),
        conn.peer()
    );

    conn.stage_response(
        |buf| response::partial_header(buf, start, end, total, content_length),
        Body::File(file),
        content_length,
        start,
        ctx,
    )
}

/// Maps open failures onto the statuses clients see.
pub(crate) fn open_for_response(path: &Path) -> Result<File, StepError> {
    File::open(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => StepError::Http(Status::NotFound),
        ErrorKind::PermissionDenied => StepError::Http(Status::Forbidden),
        _ => StepError::Io(e),
    })
}

/// One `sendfile(2)` call: moves up to `max` bytes from `file` at
/// `*offset` straight into the socket, advancing the offset by however
/// much the kernel accepted.
pub(crate) fn send_file_chunk(
    stream: &TcpStream,
    file: &File,
    offset: &mut u64,
    max: u64,
) -> io::Result<u64> {
    let mut off = *offset as libc::off_t;
    let count = max.min(isize::MAX as u64) as usize;

    let sent = unsafe { libc::sendfile(stream.as_raw_fd(), file.as_raw_fd(), &mut off, count) };
    if sent < 0 {
        return Err(io::Error::last_os_error());
    }

    *offset = off as u64;
    Ok(sent as u64)
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use super::open_for_response;
    use crate::connection::StepError;
    use crate::http::Status;

    #[test]
    fn open_maps_missing_files_to_404() {
        let dir = tempfile::tempdir().unwrap();
        match open_for_response(&dir.path().join("absent.mp4")) {
            Err(StepError::Http(Status::NotFound)) => {}
            other => panic!("expected 404, got {other:?}"),
        }
    }

    #[test]
    fn open_succeeds_for_readable_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"mp4!").unwrap();
        assert!(open_for_response(file.path()).is_ok());
    }
}
