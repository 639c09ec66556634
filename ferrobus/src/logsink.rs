//! Pluggable log sink.
//!
//! All transports report failures through this module instead of returning
//! errors to the caller. A single process-wide sink can be registered; when
//! none is set, messages are forwarded to `tracing` at the mapped level.
//! Messages with severity [`LogSeverity::Error`] or above also bump a
//! process-wide counter which tests use to assert clean runs.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Log severity level.
///
/// The numeric values are identical to the standard syslog severities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogSeverity {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Notice = 3,
    Warning = 4,
    Error = 5,
    Critical = 6,
    Alert = 7,
    Emergency = 8,
}

impl fmt::Display for LogSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Notice => "NOTICE",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
            Self::Alert => "ALERT",
            Self::Emergency => "EMERGENCY",
        };
        f.write_str(text)
    }
}

/// Source location attached to every log call.
#[derive(Debug, Clone, Copy)]
pub struct LogLocation {
    pub file: &'static str,
    pub line: u32,
    pub module: &'static str,
}

/// Signature of a registered log sink.
pub type LogSinkFn = dyn Fn(&LogLocation, LogSeverity, &str) + Send + Sync;

static LOG_SINK: RwLock<Option<Box<LogSinkFn>>> = RwLock::new(None);
static ERROR_COUNT: AtomicU64 = AtomicU64::new(0);

/// Register the process-wide log sink, replacing any previous one.
pub fn set_log_sink<F>(sink: F)
where
    F: Fn(&LogLocation, LogSeverity, &str) + Send + Sync + 'static,
{
    *LOG_SINK.write() = Some(Box::new(sink));
}

/// Remove the registered sink. Messages fall back to `tracing`.
pub fn clear_log_sink() {
    *LOG_SINK.write() = None;
}

/// Install a sink that writes every message to stderr.
pub fn install_console_sink() {
    set_log_sink(|location, severity, text| {
        eprintln!(
            "[{severity}] {}:{} {text}",
            location.file, location.line
        );
    });
}

/// Install a sink that discards every message.
pub fn install_null_sink() {
    set_log_sink(|_, _, _| {});
}

/// Number of messages logged at severity `Error` or above since the last
/// [`reset_error_count`].
pub fn error_count() -> u64 {
    ERROR_COUNT.load(Ordering::Relaxed)
}

/// Reset the error counter to zero.
pub fn reset_error_count() {
    ERROR_COUNT.store(0, Ordering::Relaxed);
}

pub(crate) fn log(location: &LogLocation, severity: LogSeverity, text: &str) {
    if severity >= LogSeverity::Error {
        ERROR_COUNT.fetch_add(1, Ordering::Relaxed);
    }

    let sink = LOG_SINK.read();
    if let Some(sink) = sink.as_ref() {
        sink(location, severity, text);
        return;
    }

    match severity {
        LogSeverity::Trace => {
            tracing::trace!(file = location.file, line = location.line, "{text}")
        }
        LogSeverity::Debug => {
            tracing::debug!(file = location.file, line = location.line, "{text}")
        }
        LogSeverity::Info | LogSeverity::Notice => {
            tracing::info!(file = location.file, line = location.line, "{text}")
        }
        LogSeverity::Warning => {
            tracing::warn!(file = location.file, line = location.line, "{text}")
        }
        _ => tracing::error!(file = location.file, line = location.line, "{text}"),
    }
}

macro_rules! bus_log {
    ($severity:expr, $($arg:tt)*) => {
        $crate::logsink::log(
            &$crate::logsink::LogLocation {
                file: file!(),
                line: line!(),
                module: module_path!(),
            },
            $severity,
            &format!($($arg)*),
        )
    };
}

macro_rules! bus_trace {
    ($($arg:tt)*) => { $crate::logsink::bus_log!($crate::logsink::LogSeverity::Trace, $($arg)*) };
}

macro_rules! bus_debug {
    ($($arg:tt)*) => { $crate::logsink::bus_log!($crate::logsink::LogSeverity::Debug, $($arg)*) };
}

macro_rules! bus_info {
    ($($arg:tt)*) => { $crate::logsink::bus_log!($crate::logsink::LogSeverity::Info, $($arg)*) };
}

macro_rules! bus_warning {
    ($($arg:tt)*) => { $crate::logsink::bus_log!($crate::logsink::LogSeverity::Warning, $($arg)*) };
}

macro_rules! bus_error {
    ($($arg:tt)*) => { $crate::logsink::bus_log!($crate::logsink::LogSeverity::Error, $($arg)*) };
}

#[allow(unused_imports)]
pub(crate) use {bus_debug, bus_error, bus_info, bus_log, bus_trace, bus_warning};

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    #[serial(log_sink)]
    fn test_error_counter() {
        install_null_sink();
        reset_error_count();

        bus_info!("informational, not counted");
        assert_eq!(error_count(), 0);

        bus_error!("counted");
        bus_error!("counted again");
        assert_eq!(error_count(), 2);

        reset_error_count();
        assert_eq!(error_count(), 0);
        clear_log_sink();
    }

    #[test]
    #[serial(log_sink)]
    fn test_custom_sink_receives_location() {
        let hits = Arc::new(AtomicUsize::new(0));
        let sink_hits = hits.clone();
        set_log_sink(move |location, severity, text| {
            assert!(location.file.ends_with("logsink.rs"));
            assert_eq!(severity, LogSeverity::Warning);
            assert_eq!(text, "watch out: 42");
            sink_hits.fetch_add(1, Ordering::SeqCst);
        });

        bus_warning!("watch out: {}", 42);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        clear_log_sink();
    }
}
