use std::ffi::CString;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Mutex;

use chrono::Local;

/// Append a line to a `Logger` if `level` is enabled. Arguments are only formatted when the line
/// is written.
#[macro_export]
macro_rules! log {
    ($logger:expr, $level:expr, $socket:expr, $($arg:tt)*) => {
        if $logger.enabled($level) {
            $logger.log($socket, format_args!($($arg)*));
        }
    };
}

/// Verbosity of a log line. A logger at level N writes every line at level N or below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Rejected requests, internal failures, startup and shutdown.
    Warn = 1,
    /// Accepted request lines.
    Info = 2,
    /// Routing failures with file names.
    Detail = 3,
    /// Successful opens, worker start and stop, dropped connections.
    Debug = 4,
}

pub const DEFAULT_LEVEL: u8 = Level::Info as u8;

/// Where to put the log.
#[derive(Debug)]
pub enum LogSink {
    Stdout,
    Syslog,
    File(BufWriter<File>),
}
impl LogSink {
    fn log(&mut self, message: &str) -> std::io::Result<()> {
        match self {
            Self::Stdout => {
                print!("{}", message);
            }
            Self::Syslog => {
                if let Ok(message) = CString::new(message) {
                    unsafe {
                        libc::syslog(
                            libc::LOG_INFO,
                            b"%s\0".as_ptr() as *const libc::c_char,
                            message.as_ptr(),
                        )
                    };
                }
            }
            Self::File(file) => {
                write!(file, "{}", message)?;
                file.flush()?;
            }
        }
        Ok(())
    }
}
impl Default for LogSink {
    fn default() -> Self {
        Self::Stdout
    }
}

/// Timestamped log shared by every worker.
#[derive(Debug)]
pub struct Logger {
    level: u8,
    sink: Mutex<LogSink>,
}

impl Logger {
    pub fn new(sink: LogSink, level: u8) -> Self {
        Self {
            level,
            sink: Mutex::new(sink),
        }
    }

    pub fn enabled(&self, level: Level) -> bool {
        level as u8 <= self.level
    }

    /// Write one line tagged with the socket descriptor it concerns. Failures are ignored.
    pub fn log(&self, socket: i32, args: fmt::Arguments<'_>) {
        let line = format!(
            "{}  <{:08}>  {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S%.6f"),
            socket,
            args
        );
        if let Ok(mut sink) = self.sink.lock() {
            sink.log(&line).ok();
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(LogSink::default(), DEFAULT_LEVEL)
    }
}
