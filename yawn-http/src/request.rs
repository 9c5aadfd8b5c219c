//! Incremental HTTP/1.1 request parser.
//!
//! Runs directly over the connection's read buffer. A CRLF-framed line is
//! only consumed once its terminator is present; otherwise the parser
//! reports [`ParseStatus::Incomplete`] and resumes from the same sub-state
//! after the next read. The sub-state therefore survives across readiness
//! events — a request split over many TCP segments parses exactly once.
//!
//! Header names are lowercased on storage, later occurrences overwriting
//! earlier ones. Bodies are framed by `content-length`; form fields are
//! extracted when a POST carries `application/x-www-form-urlencoded`.

use std::collections::HashMap;

use yawn::Buffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    RequestLine,
    Headers,
    Body,
    Finish,
}

/// Outcome of one [`Request::parse`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// A full request has been parsed.
    Complete,
    /// More bytes are needed; call again after the next read.
    Incomplete,
    /// The buffer held nothing to parse.
    Empty,
    /// The request is malformed.
    Error,
}

#[derive(Debug)]
pub struct Request {
    state: ParseState,
    method: String,
    uri: String,
    path: String,
    version: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    form: HashMap<String, String>,
}

impl Default for Request {
    fn default() -> Self {
        Request {
            state: ParseState::RequestLine,
            method: String::new(),
            uri: String::new(),
            path: String::new(),
            version: String::new(),
            headers: HashMap::new(),
            body: Vec::new(),
            form: HashMap::new(),
        }
    }
}

impl Request {
    pub fn new() -> Self {
        Request::default()
    }

    /// Reset to a pristine state, ready for the next request on a
    /// keep-alive connection.
    pub fn reset(&mut self) {
        *self = Request::default();
    }

    /// Advance the parser with whatever the buffer currently holds.
    pub fn parse(&mut self, buf: &mut Buffer) -> ParseStatus {
        if buf.readable_bytes() == 0 && self.state == ParseState::RequestLine {
            return ParseStatus::Empty;
        }
        loop {
            match self.state {
                ParseState::RequestLine => {
                    let line = match take_line(buf) {
                        Some(line) => line,
                        None => return ParseStatus::Incomplete,
                    };
                    if !self.parse_request_line(&line) {
                        return ParseStatus::Error;
                    }
                }
                ParseState::Headers => {
                    let line = match take_line(buf) {
                        Some(line) => line,
                        None => return ParseStatus::Incomplete,
                    };
                    if line.is_empty() {
                        self.state = ParseState::Body;
                    } else {
                        self.parse_header(&line);
                    }
                }
                ParseState::Body => {
                    let need = self.content_length();
                    if need > 0 {
                        if buf.readable_bytes() < need {
                            return ParseStatus::Incomplete;
                        }
                        self.body = buf.retrieve_as_bytes(need);
                        self.parse_form();
                    }
                    self.state = ParseState::Finish;
                }
                ParseState::Finish => return ParseStatus::Complete,
            }
        }
    }

    /// Whether a full request has been parsed since the last reset.
    pub fn is_finished(&self) -> bool {
        self.state == ParseState::Finish
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The percent-decoded, query-stripped absolute path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The numeric part of the protocol version, e.g. `1.1`.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Look up a header by its lowercase name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Look up a decoded form field from an urlencoded POST body.
    pub fn form_value(&self, key: &str) -> Option<&str> {
        self.form.get(key).map(String::as_str)
    }

    pub fn content_length(&self) -> usize {
        self.headers
            .get("content-length")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0)
    }

    /// `connection: keep-alive` (any case) keeps the connection open; any
    /// other value closes it; absence follows the protocol default —
    /// persistent for HTTP/1.1.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(v) => v.eq_ignore_ascii_case("keep-alive"),
            None => self.version == "1.1",
        }
    }

    fn parse_request_line(&mut self, line: &str) -> bool {
        // <method> SP <request-uri> SP HTTP/<major>.<minor>, nothing more.
        let mut parts = line.split(' ');
        let (method, uri, proto) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(method), Some(uri), Some(proto), None) => (method, uri, proto),
            _ => {
                log::warn!("Invalid request line: \"{line}\"");
                return false;
            }
        };
        let version = match proto.strip_prefix("HTTP/") {
            Some(version) if is_version(version) => version,
            _ => {
                log::warn!("Invalid request line: \"{line}\"");
                return false;
            }
        };
        self.method = method.to_string();
        self.uri = uri.to_string();
        self.version = version.to_string();
        self.parse_path();
        self.state = ParseState::Headers;
        log::debug!("{line}");
        true
    }

    fn parse_path(&mut self) {
        let raw = self.uri.splitn(2, '?').next().unwrap_or("");
        let decoded = percent_decode(raw);
        self.path = if decoded == "/" {
            "/index.html".to_string()
        } else {
            decoded
        };
    }

    fn parse_header(&mut self, line: &str) {
        // <name>:<LWS><value>; lines without a colon are skipped.
        let colon = match line.find(':') {
            Some(pos) => pos,
            None => return,
        };
        let name = line[..colon].to_ascii_lowercase();
        let value = line[colon + 1..].trim_start_matches([' ', '\t']);
        self.headers.insert(name, value.to_string());
    }

    fn parse_form(&mut self) {
        if self.method != "POST" {
            return;
        }
        if self.headers.get("content-type").map(String::as_str)
            != Some("application/x-www-form-urlencoded")
        {
            return;
        }
        let mut key = String::new();
        let mut cur: Vec<u8> = Vec::new();
        let mut i = 0;
        while i < self.body.len() {
            match self.body[i] {
                b'+' => cur.push(b' '),
                b'=' => {
                    key = String::from_utf8_lossy(&cur).into_owned();
                    cur.clear();
                }
                b'&' => {
                    self.form.insert(
                        std::mem::take(&mut key),
                        String::from_utf8_lossy(&cur).into_owned(),
                    );
                    cur.clear();
                }
                b'%' => {
                    let decoded = (i + 2 < self.body.len())
                        .then(|| {
                            hex_val(self.body[i + 1])
                                .zip(hex_val(self.body[i + 2]))
                                .map(|(hi, lo)| hi * 16 + lo)
                        })
                        .flatten();
                    match decoded {
                        Some(byte) => {
                            cur.push(byte);
                            i += 2;
                        }
                        None => cur.push(b'%'),
                    }
                }
                byte => cur.push(byte),
            }
            i += 1;
        }
        if !key.is_empty() || !cur.is_empty() {
            self.form
                .insert(key, String::from_utf8_lossy(&cur).into_owned());
        }
    }
}

/// Consume one CRLF-terminated line from the buffer, or `None` if the
/// terminator has not arrived yet.
fn take_line(buf: &mut Buffer) -> Option<String> {
    let (line, consumed) = {
        let data = buf.peek();
        let pos = data.windows(2).position(|w| w == b"\r\n")?;
        (String::from_utf8_lossy(&data[..pos]).into_owned(), pos + 2)
    };
    buf.retrieve_until(consumed);
    Some(line)
}

fn is_version(v: &str) -> bool {
    let mut parts = v.splitn(2, '.');
    match (parts.next(), parts.next()) {
        (Some(major), Some(minor)) => {
            !major.is_empty()
                && !minor.is_empty()
                && major.bytes().all(|b| b.is_ascii_digit())
                && minor.bytes().all(|b| b.is_ascii_digit())
        }
        _ => false,
    }
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decode `%HH` escapes; invalid escapes pass through literally.
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Some((hi, lo)) = hex_val(bytes[i + 1]).zip(hex_val(bytes[i + 2])) {
                out.push(hi * 16 + lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf_with(bytes: &[u8]) -> Buffer {
        let mut buf = Buffer::default();
        buf.append(bytes);
        buf
    }

    #[test]
    fn parses_simple_get() {
        let mut buf = buf_with(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n");
        let mut req = Request::new();
        assert_eq!(req.parse(&mut buf), ParseStatus::Complete);
        assert_eq!(req.method(), "GET");
        assert_eq!(req.path(), "/index.html");
        assert_eq!(req.version(), "1.1");
        assert_eq!(req.header("host"), Some("x"));
        assert!(req.is_keep_alive());
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn root_path_maps_to_index() {
        let mut buf = buf_with(b"GET / HTTP/1.1\r\n\r\n");
        let mut req = Request::new();
        assert_eq!(req.parse(&mut buf), ParseStatus::Complete);
        assert_eq!(req.path(), "/index.html");
    }

    #[test]
    fn query_is_stripped_and_path_decoded() {
        let mut buf = buf_with(b"GET /a%20dir/b.txt?x=1&y=2 HTTP/1.1\r\n\r\n");
        let mut req = Request::new();
        assert_eq!(req.parse(&mut buf), ParseStatus::Complete);
        assert_eq!(req.path(), "/a dir/b.txt");
        assert_eq!(req.uri(), "/a%20dir/b.txt?x=1&y=2");
    }

    #[test]
    fn empty_buffer_reports_empty() {
        let mut buf = Buffer::default();
        let mut req = Request::new();
        assert_eq!(req.parse(&mut buf), ParseStatus::Empty);
    }

    #[test]
    fn prefixes_report_incomplete() {
        let full = b"GET /index.html HTTP/1.1\r\nHost: x\r\nAccept: */*\r\n\r\n";
        // Any strict prefix must leave the parser waiting, never erroring.
        for cut in 1..full.len() {
            let mut buf = buf_with(&full[..cut]);
            let mut req = Request::new();
            assert_eq!(
                req.parse(&mut buf),
                ParseStatus::Incomplete,
                "prefix of {cut} bytes"
            );
        }
    }

    #[test]
    fn resumes_across_split_reads() {
        let mut req = Request::new();
        let mut buf = buf_with(b"GET /x HTTP/1.1\r\nHo");
        assert_eq!(req.parse(&mut buf), ParseStatus::Incomplete);
        buf.append(b"st: y\r\n\r\n");
        assert_eq!(req.parse(&mut buf), ParseStatus::Complete);
        assert_eq!(req.header("host"), Some("y"));
    }

    #[test]
    fn malformed_request_lines_error() {
        for line in [
            &b"NOT A REQUEST\r\n\r\n"[..],
            b"GET /\r\n\r\n",
            b"GET / HTTP/11\r\n\r\n",
            b"GET / HTTP/1.x\r\n\r\n",
            b"GET / HTTP/1.1 extra\r\n\r\n",
        ] {
            let mut buf = buf_with(line);
            let mut req = Request::new();
            assert_eq!(req.parse(&mut buf), ParseStatus::Error, "line: {line:?}");
        }
    }

    #[test]
    fn header_names_lowercase_and_overwrite() {
        let mut buf = buf_with(
            b"GET / HTTP/1.1\r\nX-Tag: one\r\nx-tag: two\r\nno colon here\r\n\r\n",
        );
        let mut req = Request::new();
        assert_eq!(req.parse(&mut buf), ParseStatus::Complete);
        assert_eq!(req.header("x-tag"), Some("two"));
    }

    #[test]
    fn body_waits_for_content_length() {
        let mut req = Request::new();
        let mut buf = buf_with(b"POST /p HTTP/1.1\r\nContent-Length: 5\r\n\r\nab");
        assert_eq!(req.parse(&mut buf), ParseStatus::Incomplete);
        buf.append(b"cde");
        assert_eq!(req.parse(&mut buf), ParseStatus::Complete);
        assert_eq!(req.body(), b"abcde");
    }

    #[test]
    fn pipelined_request_leaves_remainder() {
        let mut buf = buf_with(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");
        let mut req = Request::new();
        assert_eq!(req.parse(&mut buf), ParseStatus::Complete);
        assert_eq!(req.path(), "/a");
        req.reset();
        assert_eq!(req.parse(&mut buf), ParseStatus::Complete);
        assert_eq!(req.path(), "/b");
    }

    #[test]
    fn form_fields_decode() {
        let body = b"name=rick&city=C-137&q=hello%20world&empty=";
        let head = format!(
            "POST /submit HTTP/1.1\r\ncontent-type: application/x-www-form-urlencoded\r\ncontent-length: {}\r\n\r\n",
            body.len()
        );
        let mut buf = buf_with(head.as_bytes());
        buf.append(body);
        let mut req = Request::new();
        assert_eq!(req.parse(&mut buf), ParseStatus::Complete);
        assert_eq!(req.form_value("name"), Some("rick"));
        assert_eq!(req.form_value("city"), Some("C-137"));
        assert_eq!(req.form_value("q"), Some("hello world"));
        assert_eq!(req.form_value("empty"), Some(""));
        assert_eq!(req.form_value("missing"), None);
    }

    #[test]
    fn form_plus_becomes_space_and_bad_escape_is_literal() {
        let body = b"a=1%2&b=x+y";
        let head = format!(
            "POST / HTTP/1.1\r\ncontent-type: application/x-www-form-urlencoded\r\ncontent-length: {}\r\n\r\n",
            body.len()
        );
        let mut buf = buf_with(head.as_bytes());
        buf.append(body);
        let mut req = Request::new();
        assert_eq!(req.parse(&mut buf), ParseStatus::Complete);
        assert_eq!(req.form_value("a"), Some("1%2"));
        assert_eq!(req.form_value("b"), Some("x y"));
    }

    #[test]
    fn form_requires_urlencoded_content_type() {
        let body = b"a=1";
        let head = format!(
            "POST / HTTP/1.1\r\ncontent-type: text/plain\r\ncontent-length: {}\r\n\r\n",
            body.len()
        );
        let mut buf = buf_with(head.as_bytes());
        buf.append(body);
        let mut req = Request::new();
        assert_eq!(req.parse(&mut buf), ParseStatus::Complete);
        assert_eq!(req.form_value("a"), None);
        assert_eq!(req.body(), b"a=1");
    }

    #[test]
    fn keep_alive_policy() {
        let cases: &[(&[u8], bool)] = &[
            (b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n", true),
            (b"GET / HTTP/1.1\r\nConnection: Keep-Alive\r\n\r\n", true),
            (b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n", false),
            (b"GET / HTTP/1.1\r\n\r\n", true),
            (b"GET / HTTP/1.0\r\n\r\n", false),
            (b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n", true),
        ];
        for (bytes, expect) in cases {
            let mut buf = buf_with(bytes);
            let mut req = Request::new();
            assert_eq!(req.parse(&mut buf), ParseStatus::Complete);
            assert_eq!(req.is_keep_alive(), *expect, "case: {bytes:?}");
        }
    }

    #[test]
    fn percent_decode_edge_cases() {
        assert_eq!(percent_decode("%41%62c"), "Abc");
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%4"), "%4");
        assert_eq!(percent_decode("%zz"), "%zz");
    }
}
