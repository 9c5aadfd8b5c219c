//! Server orchestration: the reactor loop.
//!
//! One thread owns the epoll instance, the timer heap, and the connection
//! table. It accepts clients, arms per-connection idle deadlines, and hands
//! the actual socket work (read/parse/build, gather-write) to the worker
//! pool. Connections are registered one-shot, so a single readiness event
//! is in flight per connection; the finishing worker re-arms interest
//! through the shared epoll handle.

use std::collections::HashMap;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use yawn::metrics;
use yawn::{Config, Epoller, EventList, TimerHeap, WorkerPool};

use crate::connection::Connection;

const LISTEN_BACKLOG: i32 = 6;
const MAX_CONNECTIONS: i64 = 65536;
const MAX_EVENTS: usize = 1024;
const TASK_QUEUE_CAPACITY: usize = 1024;
const BUSY_MESSAGE: &[u8] = b"Server busy!";

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid listen address \"{0}\"")]
    InvalidAddress(String),
    #[error("invalid port number {0} (1024 <= port <= 65535)")]
    InvalidPort(i64),
    #[error("socket setup failed: {0}")]
    Socket(#[source] io::Error),
    #[error("epoll setup failed: {0}")]
    Epoll(#[source] io::Error),
}

/// Wakes the reactor out of `epoll_wait` and asks it to stop.
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    wake_fd: RawFd,
}

impl ShutdownHandle {
    /// Request a graceful stop: close every connection, drain the worker
    /// pool, return from [`Server::run`].
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        let val: u64 = 1;
        unsafe {
            libc::write(self.wake_fd, &val as *const u64 as *const libc::c_void, 8);
        }
    }
}

pub struct Server {
    listen_fd: RawFd,
    wake_fd: RawFd,
    epoller: Arc<Epoller>,
    events: EventList,
    timer: TimerHeap,
    pool: WorkerPool,
    conns: HashMap<RawFd, Arc<Connection>>,
    src_dir: Arc<PathBuf>,
    timeout_ms: u64,
    listen_events: u32,
    conn_events: u32,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn new(cfg: &Config) -> Result<Server, ServerError> {
        log::info!("====== Server initialization ======");

        let ip_raw = cfg.get_string("listen_ip", "0.0.0.0");
        let ip: Ipv4Addr = ip_raw
            .parse()
            .map_err(|_| ServerError::InvalidAddress(ip_raw.clone()))?;
        let port = cfg.get_integer("listen_port", 6789);
        if !(1024..=65535).contains(&port) {
            return Err(ServerError::InvalidPort(port));
        }
        let timeout_ms = cfg.get_integer("timeout", 60000).max(0) as u64;
        let open_linger = cfg.get_bool("open_linger", true);
        let trig_mode = cfg.get_integer("trig_mode", 3);
        let threads = cfg.get_integer("thread_pool_num", 8).max(1) as usize;
        let src_dir = PathBuf::from(cfg.get_string("src_dir", "/var/www/html"));

        let (listen_events, conn_events) = event_mode(trig_mode);

        let addr = SocketAddrV4::new(ip, port as u16);
        let listen_fd = create_listener(addr, open_linger)?;

        let epoller = Arc::new(Epoller::new().map_err(ServerError::Epoll)?);
        epoller
            .add(listen_fd, listen_events | libc::EPOLLIN as u32)
            .map_err(|e| {
                unsafe { libc::close(listen_fd) };
                ServerError::Epoll(e)
            })?;

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(listen_fd) };
            return Err(ServerError::Socket(err));
        }
        epoller
            .add(wake_fd, libc::EPOLLIN as u32)
            .map_err(|e| {
                unsafe {
                    libc::close(listen_fd);
                    libc::close(wake_fd);
                }
                ServerError::Epoll(e)
            })?;

        let pool = WorkerPool::new(threads, TASK_QUEUE_CAPACITY);

        log::info!("Listening on {addr}, open-linger: {open_linger}");
        log::info!(
            "Listen mode: {}, connection mode: {}",
            trigger_name(listen_events),
            trigger_name(conn_events)
        );
        log::info!("Worker threads: {}", pool.thread_count());
        log::info!("Resource directory: {}", src_dir.display());

        Ok(Server {
            listen_fd,
            wake_fd,
            epoller,
            events: EventList::new(MAX_EVENTS),
            timer: TimerHeap::new(),
            pool,
            conns: HashMap::new(),
            src_dir: Arc::new(src_dir),
            timeout_ms,
            listen_events,
            conn_events,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// A handle that stops [`Server::run`] from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown),
            wake_fd: self.wake_fd,
        }
    }

    /// The reactor loop. Returns after a shutdown request or an
    /// unrecoverable epoll failure.
    pub fn run(&mut self) {
        log::info!("====== Server started ======");
        while !self.shutdown.load(Ordering::Acquire) {
            let wait_ms = if self.timeout_ms > 0 {
                self.timer.next_tick()
            } else {
                -1
            };
            let ready = match self.epoller.wait(&mut self.events, wait_ms) {
                Ok(n) => n,
                Err(e) => {
                    log::error!("epoll wait failed: {e}");
                    break;
                }
            };
            for i in 0..ready {
                let fd = self.events.fd(i);
                let mask = self.events.mask(i);
                if fd == self.listen_fd {
                    self.accept_clients();
                } else if fd == self.wake_fd {
                    drain_eventfd(self.wake_fd);
                } else if mask
                    & (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32
                    != 0
                {
                    self.close_client(fd);
                } else if mask & libc::EPOLLIN as u32 != 0 {
                    self.dispatch(fd, Interest::Read);
                } else if mask & libc::EPOLLOUT as u32 != 0 {
                    self.dispatch(fd, Interest::Write);
                } else {
                    log::error!("Unexpected event {mask:#x} on fd {fd}");
                }
            }
        }
        self.teardown();
    }

    fn teardown(&mut self) {
        for (fd, conn) in self.conns.drain() {
            let _ = self.epoller.delete(fd);
            conn.close();
        }
        self.timer.clear();
        self.pool.shutdown();
        log::info!("====== Server stopped ======");
    }

    fn accept_clients(&mut self) {
        loop {
            let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
            let mut addr_len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
            let fd = unsafe {
                libc::accept4(
                    self.listen_fd,
                    &mut addr as *mut _ as *mut libc::sockaddr,
                    &mut addr_len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::EAGAIN) => {}
                    _ => log::warn!("accept failed: {err}"),
                }
                break;
            }
            if metrics::CONNECTIONS_ACTIVE.value() >= MAX_CONNECTIONS {
                metrics::CONNECTIONS_REFUSED.increment();
                log::warn!("Connection limit reached, refusing client");
                send_busy(fd);
                break;
            }
            let peer = SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
                u16::from_be(addr.sin_port),
            ));
            self.add_client(fd, peer);
            if self.listen_events & libc::EPOLLET as u32 == 0 {
                break;
            }
        }
    }

    fn add_client(&mut self, fd: RawFd, peer: SocketAddr) {
        let et = self.conn_events & libc::EPOLLET as u32 != 0;
        let conn = Arc::new(Connection::new(fd, peer, et));
        if self.timeout_ms > 0 {
            let cb_conn = Arc::clone(&conn);
            let cb_epoller = Arc::clone(&self.epoller);
            self.timer
                .add(fd as u64, Duration::from_millis(self.timeout_ms), move || {
                    log::debug!("<client {}> idle timeout", cb_conn.fd());
                    let _ = cb_epoller.delete(cb_conn.fd());
                    cb_conn.close();
                });
        }
        if let Err(e) = self
            .epoller
            .add(fd, self.conn_events | libc::EPOLLIN as u32)
        {
            log::error!("Failed to register client fd {fd}: {e}");
            self.timer.remove(fd as u64);
            conn.close();
            return;
        }
        self.conns.insert(fd, conn);
    }

    fn close_client(&mut self, fd: RawFd) {
        self.timer.remove(fd as u64);
        if let Some(conn) = self.conns.remove(&fd) {
            let _ = self.epoller.delete(fd);
            conn.close();
        }
    }

    fn dispatch(&mut self, fd: RawFd, interest: Interest) {
        let conn = match self.conns.get(&fd) {
            Some(conn) => Arc::clone(conn),
            None => return,
        };
        if conn.is_closed() {
            self.close_client(fd);
            return;
        }
        if self.timeout_ms > 0 {
            self.timer
                .adjust(fd as u64, Duration::from_millis(self.timeout_ms));
        }
        let epoller = Arc::clone(&self.epoller);
        let src_dir = Arc::clone(&self.src_dir);
        let conn_events = self.conn_events;
        let submitted = self.pool.submit(move || match interest {
            Interest::Read => handle_read(&conn, &epoller, &src_dir, conn_events),
            Interest::Write => handle_write(&conn, &epoller, &src_dir, conn_events),
        });
        if !submitted {
            log::error!("Worker pool is shut down; dropping client fd {fd}");
            self.close_client(fd);
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.listen_fd);
            libc::close(self.wake_fd);
        }
    }
}

#[derive(Clone, Copy)]
enum Interest {
    Read,
    Write,
}

/// Worker continuation for a readable connection: drain the socket, parse,
/// and re-arm for the response write (or more reads).
fn handle_read(conn: &Connection, epoller: &Epoller, src_dir: &Path, conn_events: u32) {
    match conn.read() {
        Ok(0) => teardown_conn(epoller, conn),
        Ok(_) => rearm_after_process(conn, epoller, src_dir, conn_events),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            rearm_after_process(conn, epoller, src_dir, conn_events)
        }
        Err(e) => {
            log::debug!("read error on fd {}: {e}", conn.fd());
            teardown_conn(epoller, conn);
        }
    }
}

/// Worker continuation for a writable connection: drain the response, then
/// either recycle the connection for keep-alive or close it.
fn handle_write(conn: &Connection, epoller: &Epoller, src_dir: &Path, conn_events: u32) {
    match conn.write() {
        Ok(_) => {
            if conn.to_write_bytes() == 0 {
                if conn.is_keep_alive() {
                    rearm_after_process(conn, epoller, src_dir, conn_events);
                } else {
                    teardown_conn(epoller, conn);
                }
            } else {
                rearm(conn, epoller, conn_events | libc::EPOLLOUT as u32);
            }
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            rearm(conn, epoller, conn_events | libc::EPOLLOUT as u32);
        }
        Err(e) => {
            log::debug!("write error on fd {}: {e}", conn.fd());
            teardown_conn(epoller, conn);
        }
    }
}

fn rearm_after_process(conn: &Connection, epoller: &Epoller, src_dir: &Path, conn_events: u32) {
    let interest = if conn.process(src_dir) {
        libc::EPOLLOUT as u32
    } else {
        libc::EPOLLIN as u32
    };
    rearm(conn, epoller, conn_events | interest);
}

fn rearm(conn: &Connection, epoller: &Epoller, events: u32) {
    if conn.is_closed() {
        return;
    }
    if let Err(e) = epoller.modify(conn.fd(), events) {
        log::debug!("re-arm of fd {} failed: {e}", conn.fd());
    }
}

fn teardown_conn(epoller: &Epoller, conn: &Connection) {
    let _ = epoller.delete(conn.fd());
    conn.close();
}

/// Decode the `trig_mode` knob: bit 0 selects edge-triggered connections,
/// bit 1 edge-triggered listening; unknown values mean both edge-triggered.
fn event_mode(trig_mode: i64) -> (u32, u32) {
    let et = libc::EPOLLET as u32;
    let mut listen_events = libc::EPOLLRDHUP as u32;
    let mut conn_events = (libc::EPOLLONESHOT | libc::EPOLLRDHUP) as u32;
    match trig_mode {
        0 => {}
        1 => conn_events |= et,
        2 => listen_events |= et,
        _ => {
            conn_events |= et;
            listen_events |= et;
        }
    }
    (listen_events, conn_events)
}

fn trigger_name(events: u32) -> &'static str {
    if events & libc::EPOLLET as u32 != 0 {
        "ET"
    } else {
        "LT"
    }
}

fn create_listener(addr: SocketAddrV4, open_linger: bool) -> Result<RawFd, ServerError> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(ServerError::Socket(io::Error::last_os_error()));
    }
    let close_with = |e: io::Error| {
        unsafe { libc::close(fd) };
        ServerError::Socket(e)
    };

    // Lingering close flushes pending data for up to a second.
    let lin = libc::linger {
        l_onoff: open_linger as libc::c_int,
        l_linger: open_linger as libc::c_int,
    };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &lin as *const _ as *const libc::c_void,
            mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(close_with(io::Error::last_os_error()));
    }

    let optval: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &optval as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(close_with(io::Error::last_os_error()));
    }

    let sockaddr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.ip().octets()),
        },
        sin_zero: [0; 8],
    };
    let ret = unsafe {
        libc::bind(
            fd,
            &sockaddr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(close_with(io::Error::last_os_error()));
    }

    let ret = unsafe { libc::listen(fd, LISTEN_BACKLOG) };
    if ret < 0 {
        return Err(close_with(io::Error::last_os_error()));
    }

    set_nonblocking(fd);
    Ok(fd)
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
    }
}

fn drain_eventfd(fd: RawFd) {
    let mut val: u64 = 0;
    unsafe {
        libc::read(fd, &mut val as *mut u64 as *mut libc::c_void, 8);
    }
}

fn send_busy(fd: RawFd) {
    let ret = unsafe {
        libc::send(
            fd,
            BUSY_MESSAGE.as_ptr() as *const libc::c_void,
            BUSY_MESSAGE.len(),
            0,
        )
    };
    if ret < 0 {
        log::warn!("Failed to send busy notice: {}", io::Error::last_os_error());
    }
    unsafe {
        libc::close(fd);
    }
}
