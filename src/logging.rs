//! Diagnostics setup.
//!
//! Foreground runs log to stderr. A detached process has its standard
//! streams on `/dev/null`, so there events go to the local syslog daemon
//! instead (facility `user`, tagged `logecho`), one message per event.

use crate::config::Config;
use std::borrow::Cow;
use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use syslog::{Facility, Formatter3164, Logger, LoggerBackend};
use tracing::{warn, Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

const SYSLOG_IDENT: &str = "logecho";

/// Install the global subscriber. Must run before the process detaches.
pub fn init(config: &Config) {
    if config.daemon {
        match SyslogMakeWriter::connect() {
            Ok(writer) => {
                // syslog stamps time and severity itself.
                tracing_subscriber::fmt()
                    .with_env_filter(env_filter(&config.log_level))
                    .with_target(false)
                    .with_ansi(false)
                    .with_level(false)
                    .without_time()
                    .with_writer(writer)
                    .init();
                return;
            }
            Err(e) => {
                init_stderr(&config.log_level);
                warn!(error = %e, "Syslog unavailable, diagnostics will be lost once detached");
                return;
            }
        }
    }

    init_stderr(&config.log_level);
}

fn init_stderr(level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_target(false)
        .init();
}

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Syslog severities used for tracing levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Severity {
    Err,
    Warning,
    Info,
    Debug,
}

impl From<&Level> for Severity {
    fn from(level: &Level) -> Self {
        match *level {
            Level::ERROR => Severity::Err,
            Level::WARN => Severity::Warning,
            Level::INFO => Severity::Info,
            _ => Severity::Debug,
        }
    }
}

type SyslogLogger = Logger<LoggerBackend, Formatter3164>;

/// Hands the fmt layer one writer per event, tagged with that event's severity.
#[derive(Clone)]
struct SyslogMakeWriter {
    logger: Arc<Mutex<SyslogLogger>>,
}

impl SyslogMakeWriter {
    /// Connect to the local syslog socket. The connection survives forking.
    fn connect() -> Result<Self, syslog::Error> {
        let formatter = Formatter3164 {
            facility: Facility::LOG_USER,
            hostname: None,
            process: SYSLOG_IDENT.to_string(),
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter)?;
        Ok(Self {
            logger: Arc::new(Mutex::new(logger)),
        })
    }

    fn writer(&self, severity: Severity) -> SyslogWriter {
        SyslogWriter {
            logger: Arc::clone(&self.logger),
            severity,
        }
    }
}

impl<'a> MakeWriter<'a> for SyslogMakeWriter {
    type Writer = SyslogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.writer(Severity::Info)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        self.writer(Severity::from(meta.level()))
    }
}

struct SyslogWriter {
    logger: Arc<Mutex<SyslogLogger>>,
    severity: Severity,
}

impl io::Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(text) = event_text(buf) else {
            return Ok(buf.len());
        };

        let mut logger = self.logger.lock().unwrap_or_else(PoisonError::into_inner);
        // The pid changes when the process detaches.
        logger.formatter.pid = std::process::id();
        let sent = match self.severity {
            Severity::Err => logger.err(text),
            Severity::Warning => logger.warning(text),
            Severity::Info => logger.info(text),
            Severity::Debug => logger.debug(text),
        };
        sent.map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One formatted event, without its trailing newline. `None` if blank.
fn event_text(buf: &[u8]) -> Option<Cow<'_, str>> {
    let text = String::from_utf8_lossy(buf);
    if text.trim().is_empty() {
        return None;
    }
    match text {
        Cow::Borrowed(s) => Some(Cow::Borrowed(s.trim_end())),
        Cow::Owned(s) => Some(Cow::Owned(s.trim_end().to_string())),
    }
}
