//! Byte buffer backing per-connection I/O.
//!
//! Layout over one contiguous allocation:
//!
//! ```text
//! | prependable | readable | writable |
//! 0          read_pos   write_pos   len
//! ```
//!
//! Consumed bytes leave slack at the front; when writable space runs short
//! the readable window slides left to reclaim it before the allocation
//! grows. [`Buffer::read_from`] scatter-reads into the writable region plus
//! a 64 KiB stack spillover so a single `readv` can pull a large burst
//! without pre-growing the buffer.

use std::io;
use std::os::fd::RawFd;

const INITIAL_SIZE: usize = 1024;
const EXTRA_BUF_SIZE: usize = 65536;

pub struct Buffer {
    buf: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new(INITIAL_SIZE)
    }
}

impl Buffer {
    /// Create a buffer with `size` bytes of initial capacity.
    pub fn new(size: usize) -> Self {
        Buffer {
            buf: vec![0; size],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// Number of bytes available to read.
    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    /// Number of bytes that can be written without growing.
    pub fn writable_bytes(&self) -> usize {
        self.buf.len() - self.write_pos
    }

    /// Slack at the front reclaimable by compaction.
    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    /// The readable region.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.read_pos..self.write_pos]
    }

    /// Consume `len` readable bytes. Consuming everything resets both
    /// positions to the start of the allocation.
    pub fn retrieve(&mut self, len: usize) {
        if len < self.readable_bytes() {
            self.read_pos += len;
        } else {
            self.retrieve_all();
        }
    }

    /// Consume readable bytes up to offset `end` into [`peek`](Self::peek),
    /// clamped to the readable window.
    pub fn retrieve_until(&mut self, end: usize) {
        self.retrieve(end.min(self.readable_bytes()));
    }

    /// Discard everything and reset to empty.
    pub fn retrieve_all(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }

    /// Copy out and consume up to `len` bytes.
    pub fn retrieve_as_bytes(&mut self, len: usize) -> Vec<u8> {
        let len = len.min(self.readable_bytes());
        let out = self.peek()[..len].to_vec();
        self.retrieve(len);
        out
    }

    /// Copy out and consume up to `len` bytes as a (lossy) string.
    pub fn retrieve_as_string(&mut self, len: usize) -> String {
        String::from_utf8_lossy(&self.retrieve_as_bytes(len)).into_owned()
    }

    /// Append bytes, growing or compacting as needed.
    pub fn append(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.ensure_writable(data.len());
        self.buf[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    /// Make room for at least `len` writable bytes.
    ///
    /// Prefers sliding the readable window to the front over growing; grows
    /// to `write_pos + len` so the readable bytes survive intact.
    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() >= len {
            return;
        }
        if self.prependable_bytes() + self.writable_bytes() >= len {
            let readable = self.readable_bytes();
            self.buf.copy_within(self.read_pos..self.write_pos, 0);
            self.read_pos = 0;
            self.write_pos = readable;
        } else {
            self.buf.resize(self.write_pos + len, 0);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    /// Scatter-read from `fd` into the writable region plus a stack
    /// spillover. Returns the total bytes read; 0 means end of stream.
    pub fn read_from(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_SIZE];
        let writable = self.writable_bytes();
        let iov = [
            libc::iovec {
                iov_base: self.buf[self.write_pos..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: extra.len(),
            },
        ];
        let n = unsafe { libc::readv(fd, iov.as_ptr(), iov.len() as libc::c_int) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.buf.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// Write the readable region to `fd` in one shot, consuming whatever
    /// the kernel accepted.
    pub fn write_to(&mut self, fd: RawFd) -> io::Result<usize> {
        let readable = self.readable_bytes();
        let n = unsafe {
            libc::write(
                fd,
                self.buf[self.read_pos..].as_ptr() as *const libc::c_void,
                readable,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        self.read_pos += n as usize;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::RawFd;

    #[test]
    fn append_then_retrieve_accounting() {
        let mut buf = Buffer::default();
        assert_eq!(buf.readable_bytes(), 0);

        buf.append(b"hello");
        assert_eq!(buf.readable_bytes(), 5);
        buf.append(b" world");
        assert_eq!(buf.readable_bytes(), 11);
        assert_eq!(buf.peek(), b"hello world");

        buf.retrieve(6);
        assert_eq!(buf.readable_bytes(), 5);
        assert_eq!(buf.prependable_bytes(), 6);
        assert_eq!(buf.peek(), b"world");

        // Over-consuming clamps and resets.
        buf.retrieve(100);
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.prependable_bytes(), 0);
    }

    #[test]
    fn retrieve_until_clamps() {
        let mut buf = Buffer::default();
        buf.append(b"abcdef");
        buf.retrieve_until(4);
        assert_eq!(buf.peek(), b"ef");
        buf.retrieve_until(999);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn retrieve_as_string_clamps() {
        let mut buf = Buffer::default();
        buf.append(b"abc");
        assert_eq!(buf.retrieve_as_string(2), "ab");
        assert_eq!(buf.retrieve_as_string(99), "c");
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn compaction_reclaims_prependable_space() {
        let mut buf = Buffer::new(16);
        buf.append(b"0123456789");
        buf.retrieve(8);
        // 6 writable + 8 prependable; 10 fits only after compaction.
        buf.append(b"abcdefghij");
        assert_eq!(buf.peek(), b"89abcdefghij");
        assert_eq!(buf.prependable_bytes(), 0);
    }

    #[test]
    fn growth_preserves_readable_bytes() {
        let mut buf = Buffer::new(8);
        buf.append(b"12345678");
        buf.append(b"abcdefgh");
        assert_eq!(buf.readable_bytes(), 16);
        assert_eq!(buf.peek(), b"12345678abcdefgh");
    }

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn read_from_and_write_to_fd() {
        let (rx, tx) = pipe();
        let payload = b"the quick brown fox";
        let n = unsafe {
            libc::write(tx, payload.as_ptr() as *const libc::c_void, payload.len())
        };
        assert_eq!(n as usize, payload.len());

        let mut buf = Buffer::new(4); // smaller than the payload: spillover path
        let got = buf.read_from(rx).unwrap();
        assert_eq!(got, payload.len());
        assert_eq!(buf.peek(), payload);

        let (rx2, tx2) = pipe();
        let written = buf.write_to(tx2).unwrap();
        assert_eq!(written, payload.len());
        assert_eq!(buf.readable_bytes(), 0);

        let mut out = [0u8; 64];
        let n = unsafe { libc::read(rx2, out.as_mut_ptr() as *mut libc::c_void, out.len()) };
        assert_eq!(&out[..n as usize], payload);

        for fd in [rx, tx, rx2, tx2] {
            unsafe { libc::close(fd) };
        }
    }
}
