//! RFC-1123 date formatting for `Date` and `Last-Modified` headers.

use std::time::SystemTime;

/// Format a timestamp as an IMF-fixdate, e.g.
/// `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date(t: SystemTime) -> String {
    httpdate::fmt_http_date(t)
}

/// The current time as an IMF-fixdate.
pub fn http_date_now() -> String {
    http_date(SystemTime::now())
}
