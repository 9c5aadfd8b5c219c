//! Asynchronous log sink behind the `log` facade.
//!
//! `log::info!` and friends format on the calling thread and push one
//! finished line onto a bounded queue; a dedicated `yawn-log` thread drains
//! the queue and writes to stdout and/or rotating files. A full queue
//! back-pressures the producer rather than dropping lines.
//!
//! Line format:
//!
//! ```text
//! [LEVEL] [YYYY-MM-DD HH:MM:SS.uuuuuu] [pid:tid] [file:line] <message>
//! ```
//!
//! File segments are named `<filename>_<YYYYMMDD>_<seq>.log`; when the
//! current segment reaches `max_file_size` bytes the writer rolls to the
//! next sequence number.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread::{self, JoinHandle};

use chrono::Local;
use log::{LevelFilter, Log, Metadata, Record};

use crate::queue::BlockingQueue;

/// Sink mask bit: mirror lines to stdout.
pub const SINK_STDOUT: u8 = 0b01;
/// Sink mask bit: write lines to rotating files.
pub const SINK_FILE: u8 = 0b10;

#[derive(Debug, thiserror::Error)]
pub enum LoggerError {
    #[error("failed to create log directory: {0}")]
    CreateDir(#[source] std::io::Error),
    #[error("failed to open log file: {0}")]
    OpenFile(#[source] std::io::Error),
    #[error("failed to start log writer thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("a logger is already installed")]
    AlreadyInstalled,
}

static GLOBAL: OnceLock<&'static AsyncLogger> = OnceLock::new();

pub struct AsyncLogger {
    level: LevelFilter,
    mask: u8,
    queue: BlockingQueue<String>,
    sink: Mutex<Option<FileSink>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

struct FileSink {
    dir: PathBuf,
    filename: String,
    max_file_size: u64,
    seq: u32,
    written: u64,
    file: File,
}

impl FileSink {
    fn open(dir: &Path, filename: &str, max_file_size: u64, seq: u32) -> Result<Self, LoggerError> {
        fs::create_dir_all(dir).map_err(LoggerError::CreateDir)?;
        let (file, written) = Self::open_segment(dir, filename, seq)?;
        Ok(FileSink {
            dir: dir.to_path_buf(),
            filename: filename.to_string(),
            max_file_size: max_file_size.max(1),
            seq,
            written,
            file,
        })
    }

    fn open_segment(dir: &Path, filename: &str, seq: u32) -> Result<(File, u64), LoggerError> {
        let date = Local::now().format("%Y%m%d").to_string();
        let path = dir.join(segment_name(filename, &date, seq));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(LoggerError::OpenFile)?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);
        Ok((file, written))
    }

    fn write(&mut self, msg: &str) {
        while self.written >= self.max_file_size {
            match Self::open_segment(&self.dir, &self.filename, self.seq + 1) {
                Ok((file, written)) => {
                    self.seq += 1;
                    self.file = file;
                    self.written = written;
                }
                Err(_) => break,
            }
        }
        if self.file.write_all(msg.as_bytes()).is_ok() {
            self.written += msg.len() as u64;
        }
        let _ = self.file.flush();
    }
}

/// `<filename>_<YYYYMMDD>_<seq>.log`
fn segment_name(filename: &str, date: &str, seq: u32) -> String {
    format!("{filename}_{date}_{seq}.log")
}

/// Format one record the way the writer expects it, trailing newline
/// included.
fn format_record(record: &Record) -> String {
    let now = Local::now();
    let pid = std::process::id();
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    let file = record
        .file()
        .and_then(|f| Path::new(f).file_name())
        .and_then(|f| f.to_str())
        .unwrap_or("?");
    format!(
        "[{:<5}] [{}] [{}:{}] [{}:{}] {}\n",
        record.level(),
        now.format("%Y-%m-%d %H:%M:%S%.6f"),
        pid,
        tid,
        file,
        record.line().unwrap_or(0),
        record.args()
    )
}

/// Parse a configured level: a name (any case) or the original numeric
/// form, 0=debug through 3=error. Unknown values fall back to info.
pub fn parse_level(raw: &str) -> LevelFilter {
    match raw.to_ascii_lowercase().as_str() {
        "debug" | "0" => LevelFilter::Debug,
        "info" | "1" => LevelFilter::Info,
        "warn" | "2" => LevelFilter::Warn,
        "error" | "3" => LevelFilter::Error,
        _ => LevelFilter::Info,
    }
}

impl AsyncLogger {
    /// Install the process-wide async logger. Idempotent: a second call is
    /// a no-op. Can only be done once per process; re-initializing after
    /// [`AsyncLogger::close`] reports [`LoggerError::AlreadyInstalled`].
    pub fn init(
        mask: u8,
        dir: &Path,
        filename: &str,
        max_file_size: u64,
        level: LevelFilter,
        queue_size: usize,
    ) -> Result<(), LoggerError> {
        if GLOBAL.get().is_some() {
            return Ok(());
        }

        let sink = if mask & SINK_FILE != 0 {
            Some(FileSink::open(dir, filename, max_file_size, 1)?)
        } else {
            None
        };

        let logger: &'static AsyncLogger = Box::leak(Box::new(AsyncLogger {
            level,
            mask,
            queue: BlockingQueue::new(queue_size.max(1)),
            sink: Mutex::new(sink),
            writer: Mutex::new(None),
            closed: AtomicBool::new(false),
        }));

        if GLOBAL.set(logger).is_err() {
            // Lost an init race; the winner's logger is installed.
            return Ok(());
        }
        log::set_logger(logger).map_err(|_| LoggerError::AlreadyInstalled)?;
        log::set_max_level(level);

        let handle = thread::Builder::new()
            .name("yawn-log".to_string())
            .spawn(move || logger.write_loop())
            .map_err(LoggerError::Spawn)?;
        *logger.writer.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Close the sink: stop accepting lines, drain the queue, join the
    /// writer, close the file. Idempotent; safe to call without init.
    pub fn close() {
        let logger = match GLOBAL.get() {
            Some(logger) => *logger,
            None => return,
        };
        if logger.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        logger.queue.close();
        let handle = logger
            .writer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        logger.sink.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    fn write_loop(&self) {
        while let Some(msg) = self.queue.pop() {
            if self.mask & SINK_STDOUT != 0 {
                print!("{msg}");
            }
            if let Some(sink) = self
                .sink
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .as_mut()
            {
                sink.write(&msg);
            }
        }
    }
}

impl Log for AsyncLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.closed.load(Ordering::Acquire) || !self.enabled(record.metadata()) {
            return;
        }
        self.queue.push(format_record(record));
    }

    fn flush(&self) {
        if let Some(sink) = self
            .sink
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_mut()
        {
            let _ = sink.file.flush();
        }
    }
}
