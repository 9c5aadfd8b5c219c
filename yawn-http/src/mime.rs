//! Content-type lookup by file extension.

use std::path::Path;

/// Map a path's extension to a content type. Unknown or missing
/// extensions fall back to `text/html`.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("html") => "text/html",
        Some("xml") => "text/xml",
        Some("xhtml") => "application/xhtml+xml",
        Some("txt") => "text/plain",
        Some("rtf") => "application/rtf",
        Some("pdf") => "application/pdf",
        Some("word") => "application/msword",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("ico") => "image/x-icon",
        Some("svg") => "image/svg+xml",
        Some("au") => "audio/basic",
        Some("mpeg") | Some("mpg") => "video/mpeg",
        Some("avi") => "video/x-msvideo",
        Some("gz") => "application/x-gzip",
        Some("tar") => "application/x-tar",
        Some("css") => "text/css",
        Some("js") => "text/javascript",
        Some("json") => "application/json",
        _ => "text/html",
    }
}
