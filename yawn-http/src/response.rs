//! Static-file resolution and response composition.
//!
//! A [`Response`] starts from a parsed request (or a bare error status),
//! resolves the target under the document root, and composes the status
//! line and headers into the connection's write buffer. File bodies are
//! memory-mapped and kept out of the buffer: the connection points the
//! second slot of its gather-write at the [`FileRegion`], which unmaps on
//! drop. Error statuses serve a per-code page from the root when one
//! exists (`/404.html`, …) and otherwise a generated stub.
//!
//! Conditional GET: the entity tag is `hex(mtime)-hex(size)`; a matching
//! `If-None-Match` short-circuits to 304 with no body.

use std::fs::{self, File, Metadata};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use memmap2::Mmap;
use yawn::Buffer;

use crate::request::Request;
use crate::{date, mime};

/// The `Server` header value and the signature line of generated error
/// pages.
pub const SERVER_NAME: &str = concat!("yawn/", env!("CARGO_PKG_VERSION"));

const RECOGNIZED: [u16; 7] = [200, 304, 400, 403, 404, 500, 505];

/// An open, read-only, privately mapped file. Dropping the region unmaps.
pub struct FileRegion {
    map: Mmap,
}

impl FileRegion {
    fn map(path: &Path, len: u64) -> io::Result<Option<FileRegion>> {
        // A zero-length mapping is invalid; empty files have no region.
        if len == 0 {
            return Ok(None);
        }
        let file = File::open(path)?;
        let map = unsafe { Mmap::map(&file)? };
        Ok(Some(FileRegion { map }))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

pub struct Response {
    status: u16,
    keep_alive: bool,
    src_dir: PathBuf,
    path: String,
    if_none_match: Option<String>,
    content_type: &'static str,
    etag: Option<String>,
    last_modified: Option<String>,
    file: Option<FileRegion>,
    body_len: u64,
    content_length: u64,
}

impl Default for Response {
    fn default() -> Self {
        Response {
            status: 200,
            keep_alive: false,
            src_dir: PathBuf::new(),
            path: String::new(),
            if_none_match: None,
            content_type: "text/html",
            etag: None,
            last_modified: None,
            file: None,
            body_len: 0,
            content_length: 0,
        }
    }
}

impl Response {
    /// A response for a successfully parsed request. Unsupported protocol
    /// versions short-circuit to 505.
    pub fn for_request(src_dir: &Path, req: &Request) -> Response {
        let supported = matches!(req.version(), "1.0" | "1.1");
        Response {
            status: if supported { 200 } else { 505 },
            keep_alive: supported && req.is_keep_alive(),
            src_dir: src_dir.to_path_buf(),
            path: req.path().to_string(),
            if_none_match: req.header("if-none-match").map(str::to_string),
            ..Response::default()
        }
    }

    /// A bare error response, e.g. 400 for an unparseable request. Always
    /// closes the connection.
    pub fn for_status(src_dir: &Path, status: u16) -> Response {
        Response {
            status,
            keep_alive: false,
            src_dir: src_dir.to_path_buf(),
            ..Response::default()
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// The mapped body, if any, for the second gather-write slot.
    pub fn file(&self) -> Option<&FileRegion> {
        self.file.as_ref()
    }

    /// Drop the mapped body (unmaps). Called when the connection closes.
    pub fn release_file(&mut self) {
        self.file = None;
    }

    /// The `Content-Length` of the composed response.
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// Resolve the target and write the status line, headers, and any
    /// in-buffer body into `buf`. The mapped body, when present, is left in
    /// [`Response::file`].
    pub fn build(&mut self, buf: &mut Buffer) {
        if self.status == 200 {
            self.resolve_target();
        }
        if !RECOGNIZED.contains(&self.status) {
            self.status = 400;
        }
        if self.status >= 500 {
            self.keep_alive = false;
        }

        let mut stub = None;
        if self.status != 200 && self.status != 304 {
            self.file = None;
            self.etag = None;
            self.last_modified = None;
            self.body_len = 0;
            self.content_type = "text/html";
            if !self.load_error_page() {
                stub = Some(stub_body(self.status));
            }
        }

        let reason = reason_phrase(self.status);
        buf.append(format!("HTTP/1.1 {} {}\r\n", self.status, reason).as_bytes());

        let connection = if self.keep_alive { "Keep-Alive" } else { "Close" };
        buf.append(format!("Connection: {connection}\r\n").as_bytes());
        buf.append(format!("Date: {}\r\n", date::http_date_now()).as_bytes());
        buf.append(format!("Server: {SERVER_NAME}\r\n").as_bytes());
        if let (Some(etag), Some(lm)) = (&self.etag, &self.last_modified) {
            buf.append(format!("ETag: {etag}\r\n").as_bytes());
            buf.append(format!("Last-Modified: {lm}\r\n").as_bytes());
        }

        if self.status == 304 {
            self.content_length = 0;
            buf.append(b"\r\n");
            return;
        }

        self.content_length = stub.as_ref().map(|s| s.len() as u64).unwrap_or(self.body_len);
        buf.append(format!("Content-Type: {}\r\n", self.content_type).as_bytes());
        buf.append(format!("Content-Length: {}\r\n", self.content_length).as_bytes());
        buf.append(b"\r\n");
        if let Some(stub) = stub {
            buf.append(stub.as_bytes());
        }
    }

    /// Stat and map the requested file, downgrading `status` on any
    /// failure. On success fills the entity metadata; on an `If-None-Match`
    /// hit leaves a bodyless 304.
    fn resolve_target(&mut self) {
        if self.path.split('/').any(|seg| seg == "..") {
            self.status = 403;
            return;
        }
        let full = self.src_dir.join(self.path.trim_start_matches('/'));
        let meta = match fs::metadata(&full) {
            Ok(meta) => meta,
            Err(e) => {
                self.status = match e.kind() {
                    io::ErrorKind::NotFound => 404,
                    io::ErrorKind::PermissionDenied => 403,
                    _ => 500,
                };
                return;
            }
        };
        if meta.is_dir() {
            self.status = 404;
            return;
        }
        if meta.mode() & 0o004 == 0 {
            self.status = 403;
            return;
        }

        let etag = entity_tag(&meta);
        let last_modified = date::http_date(meta.modified().unwrap_or(SystemTime::UNIX_EPOCH));
        if self.if_none_match.as_deref() == Some(etag.as_str()) {
            self.status = 304;
            self.etag = Some(etag);
            self.last_modified = Some(last_modified);
            return;
        }

        match FileRegion::map(&full, meta.len()) {
            Ok(region) => {
                self.file = region;
                self.body_len = meta.len();
                self.content_type = mime::content_type_for(&full);
                self.etag = Some(etag);
                self.last_modified = Some(last_modified);
            }
            Err(e) => {
                log::error!("mmap {} failed: {e}", full.display());
                self.status = 500;
            }
        }
    }

    /// Try the configured per-code page (`<root>/<code>.html`). Returns
    /// whether one was mapped.
    fn load_error_page(&mut self) -> bool {
        let full = self.src_dir.join(format!("{}.html", self.status));
        let meta = match fs::metadata(&full) {
            Ok(meta) if meta.is_file() => meta,
            _ => return false,
        };
        match FileRegion::map(&full, meta.len()) {
            Ok(Some(region)) => {
                self.body_len = meta.len();
                self.etag = Some(entity_tag(&meta));
                self.last_modified =
                    Some(date::http_date(meta.modified().unwrap_or(SystemTime::UNIX_EPOCH)));
                self.file = Some(region);
                true
            }
            _ => false,
        }
    }
}

/// Weak entity tag: `hex(mtime seconds)-hex(size)`.
fn entity_tag(meta: &Metadata) -> String {
    format!("{:x}-{:x}", meta.mtime(), meta.len())
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        505 => "HTTP Version Not Supported",
        _ => "Bad Request",
    }
}

fn stub_body(status: u16) -> String {
    let reason = reason_phrase(status);
    format!(
        "<html><head><title>{status} {reason}</title></head>\
         <body><center><h1>{status} {reason}</h1></center>\
         <hr><center>{SERVER_NAME}</center></body></html>"
    )
}
