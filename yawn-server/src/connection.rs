//! Per-connection protocol engine.
//!
//! A [`Connection`] owns its socket fd, the read and write buffers, the
//! request parser, and the response builder. Worker tasks drive it through
//! `read` → `process` → `write`; the reactor's one-shot arming guarantees
//! at most one task touches a connection at a time, so the internal mutex
//! is uncontended and exists only to serialize a timer-fired close against
//! an in-flight task.
//!
//! The gather-write spans two regions: the composed head (and any stub
//! body) in the write buffer, and the memory-mapped file body. The slices
//! are rebuilt from `(write_buf, file_region, file_written)` on every
//! `writev`, so partial-write advancement is plain arithmetic over the two
//! lengths.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use yawn::metrics;
use yawn::Buffer;
use yawn_http::{ParseStatus, Request, Response};

pub struct Connection {
    fd: RawFd,
    peer: SocketAddr,
    et_mode: bool,
    closed: AtomicBool,
    state: Mutex<ConnState>,
}

struct ConnState {
    read_buf: Buffer,
    write_buf: Buffer,
    request: Request,
    response: Response,
    /// Bytes of the mapped file body already written to the socket.
    file_written: usize,
}

impl ConnState {
    fn remaining(&self) -> usize {
        let file_left = self
            .response
            .file()
            .map(|region| region.len() - self.file_written)
            .unwrap_or(0);
        self.write_buf.readable_bytes() + file_left
    }
}

/// Split `written` bytes across the head and the file slice: everything
/// the head can account for comes off the head, the rest off the file.
fn advance_split(head_len: usize, written: usize) -> (usize, usize) {
    let from_head = written.min(head_len);
    (from_head, written - from_head)
}

impl Connection {
    pub fn new(fd: RawFd, peer: SocketAddr, et_mode: bool) -> Connection {
        metrics::CONNECTIONS_ACCEPTED.increment();
        metrics::CONNECTIONS_ACTIVE.increment();
        log::info!(
            "<client {fd}, {peer}> connected. Active connections: {}",
            metrics::CONNECTIONS_ACTIVE.value()
        );
        Connection {
            fd,
            peer,
            et_mode,
            closed: AtomicBool::new(false),
            state: Mutex::new(ConnState {
                read_buf: Buffer::default(),
                write_buf: Buffer::default(),
                request: Request::new(),
                response: Response::default(),
                file_written: 0,
            }),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn lock_state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drain the socket into the read buffer. Under edge-triggered mode
    /// reads loop until `EAGAIN`; under level-triggered, one read per
    /// readiness. `Ok(0)` means the peer closed the stream;
    /// `WouldBlock` with no data means a spurious wakeup.
    pub fn read(&self) -> io::Result<usize> {
        let mut guard = self.lock_state();
        let mut total = 0;
        loop {
            match guard.read_buf.read_from(self.fd) {
                Ok(0) => break,
                Ok(n) => {
                    total += n;
                    metrics::BYTES_RECEIVED.add(n as u64);
                    if !self.et_mode {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if total == 0 {
                        return Err(e);
                    }
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Run the parser over buffered bytes and, when a request completes
    /// (or is malformed), compose the response. Returns whether a response
    /// is ready to write.
    pub fn process(&self, src_dir: &Path) -> bool {
        let mut guard = self.lock_state();
        let st = &mut *guard;
        if st.request.is_finished() {
            st.request.reset();
        }
        if st.read_buf.readable_bytes() == 0 {
            return false;
        }
        let response = match st.request.parse(&mut st.read_buf) {
            ParseStatus::Complete => Response::for_request(src_dir, &st.request),
            ParseStatus::Error => Response::for_status(src_dir, 400),
            ParseStatus::Incomplete | ParseStatus::Empty => return false,
        };
        st.response = response;
        st.write_buf.retrieve_all();
        st.response.build(&mut st.write_buf);
        st.file_written = 0;

        metrics::REQUESTS_SERVED.increment();
        log::info!(
            "\"{} {} HTTP/{}\" {} {}",
            st.request.method(),
            st.request.path(),
            st.request.version(),
            st.response.status(),
            st.response.content_length()
        );
        true
    }

    /// Gather-write the response until it is fully drained or the socket
    /// stops accepting bytes (`WouldBlock`; partial progress is recorded
    /// either way). Returns the bytes written by this call.
    pub fn write(&self) -> io::Result<usize> {
        let mut guard = self.lock_state();
        let st = &mut *guard;
        let mut total = 0;
        loop {
            let head = st.write_buf.peek();
            let file_rest: &[u8] = st
                .response
                .file()
                .map(|region| &region.as_slice()[st.file_written..])
                .unwrap_or(&[]);
            if head.is_empty() && file_rest.is_empty() {
                break;
            }
            let iov = [
                libc::iovec {
                    iov_base: head.as_ptr() as *mut libc::c_void,
                    iov_len: head.len(),
                },
                libc::iovec {
                    iov_base: file_rest.as_ptr() as *mut libc::c_void,
                    iov_len: file_rest.len(),
                },
            ];
            let iov_count = if file_rest.is_empty() { 1 } else { 2 };
            let head_len = head.len();

            let n = unsafe { libc::writev(self.fd, iov.as_ptr(), iov_count) };
            if n < 0 {
                return Err(io::Error::last_os_error());
            }
            if n == 0 {
                break;
            }
            let n = n as usize;
            total += n;
            metrics::BYTES_SENT.add(n as u64);

            let (from_head, from_file) = advance_split(head_len, n);
            st.write_buf.retrieve(from_head);
            st.file_written += from_file;
        }
        Ok(total)
    }

    /// Unwritten response bytes, head and file body combined.
    pub fn to_write_bytes(&self) -> usize {
        self.lock_state().remaining()
    }

    /// Whether the connection persists after the current response.
    pub fn is_keep_alive(&self) -> bool {
        self.lock_state().response.is_keep_alive()
    }

    /// Unmap any file body, close the fd, and drop out of the connection
    /// count. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.lock_state().response.release_file();
        unsafe {
            libc::close(self.fd);
        }
        metrics::CONNECTIONS_ACTIVE.decrement();
        metrics::CONNECTIONS_CLOSED.increment();
        log::info!(
            "<client {}, {}> disconnected. Active connections: {}",
            self.fd,
            self.peer,
            metrics::CONNECTIONS_ACTIVE.value()
        );
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::path::PathBuf;

    #[test]
    fn advance_split_accounts_for_both_slots() {
        assert_eq!(advance_split(10, 4), (4, 0));
        assert_eq!(advance_split(10, 10), (10, 0));
        assert_eq!(advance_split(10, 17), (10, 7));
        assert_eq!(advance_split(0, 5), (0, 5));
        assert_eq!(advance_split(3, 0), (0, 0));
    }

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn set_nonblocking(fd: RawFd) {
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }

    fn docroot() -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let dir = std::env::temp_dir().join(format!("yawn-conn-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("index.html");
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(b"<h1>ok</h1>").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        dir
    }

    fn peer() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 54321))
    }

    #[test]
    fn read_process_write_roundtrip() {
        let root = docroot();
        let (server_fd, client_fd) = socketpair();
        set_nonblocking(server_fd);
        let conn = Connection::new(server_fd, peer(), true);

        let request = b"GET /index.html HTTP/1.1\r\nHost: t\r\n\r\n";
        let n = unsafe {
            libc::write(
                client_fd,
                request.as_ptr() as *const libc::c_void,
                request.len(),
            )
        };
        assert_eq!(n as usize, request.len());

        assert!(conn.read().unwrap() > 0);
        assert!(conn.process(&root));
        assert!(conn.is_keep_alive());
        assert!(conn.to_write_bytes() > 11);

        conn.write().unwrap();
        assert_eq!(conn.to_write_bytes(), 0);

        let mut out = vec![0u8; 4096];
        let n = unsafe {
            libc::read(client_fd, out.as_mut_ptr() as *mut libc::c_void, out.len())
        };
        let text = String::from_utf8_lossy(&out[..n as usize]).into_owned();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "got: {text}");
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(text.ends_with("<h1>ok</h1>"), "got: {text}");

        conn.close();
        conn.close(); // idempotent
        unsafe { libc::close(client_fd) };
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn spurious_readiness_reports_wouldblock() {
        let root = docroot();
        let (server_fd, client_fd) = socketpair();
        set_nonblocking(server_fd);
        let conn = Connection::new(server_fd, peer(), true);

        let err = conn.read().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(!conn.process(&root));

        conn.close();
        unsafe { libc::close(client_fd) };
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn peer_shutdown_reads_as_zero() {
        let (server_fd, client_fd) = socketpair();
        set_nonblocking(server_fd);
        let conn = Connection::new(server_fd, peer(), true);

        unsafe { libc::close(client_fd) };
        assert_eq!(conn.read().unwrap(), 0);
        conn.close();
    }
}
