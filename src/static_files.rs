//! Static asset responder

use std::path::Path;

use crate::connection::{Body, Connection, StepContext, StepError};
use crate::http::{response, Status};
use crate::streaming;

/// Opens `path` under the document root and stages a whole-file 200
/// response. The body rides the same zero-copy loop the streamer uses.
pub fn start(conn: &mut Connection, path: &Path, ctx: &StepContext) -> Result<(), StepError> {
    let full = ctx.config.root_dir.join(path);
    let file = streaming::open_for_response(&full)?;

    let meta = file.metadata().map_err(StepError::Io)?;
    if meta.is_dir() {
        return Err(StepError::Http(Status::Forbidden));
    }

    let size = meta.len();
    let mime = mime_type(path);

    conn.stage_response(
        |buf| response::file_header(buf, mime, size),
        Body::File(file),
        size,
        0,
        ctx,
    )
}

/// Content type by file extension; unknown extensions download as opaque
/// bytes.
pub fn mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();

    match ext {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "ico" => "image/x-icon",
        "svg" => "image/svg+xml",
        "txt" => "text/plain",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use super::mime_type;

    #[test]
    fn mime_types_cover_the_served_set() {
        assert_eq!("text/html", mime_type(Path::new("static/index.html")));
        assert_eq!("text/css", mime_type(Path::new("style.css")));
        assert_eq!("application/javascript", mime_type(Path::new("app.js")));
        assert_eq!("image/png", mime_type(Path::new("logo.png")));
        assert_eq!("image/jpeg", mime_type(Path::new("thumb.jpeg")));
        assert_eq!("image/x-icon", mime_type(Path::new("favicon.ico")));
        assert_eq!("video/mp4", mime_type(Path::new("intro.mp4")));
    }

    #[test]
    fn unknown_extensions_fall_back_to_octet_stream() {
        assert_eq!("application/octet-stream", mime_type(Path::new("data.bin")));
        assert_eq!("application/octet-stream", mime_type(Path::new("no_ext")));
    }
}
