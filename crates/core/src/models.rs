use std::{
    fmt,
    str::FromStr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use time::UtcDateTime;

/// Identifies one accepted triggering event.
///
/// Derived from the wall clock in milliseconds, but strictly increasing within
/// a process so two events never share a timestamp.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TimeStamp(u64);

static LAST_TIMESTAMP: AtomicU64 = AtomicU64::new(0);

impl TimeStamp {
    pub fn now() -> Self {
        let wall = (UtcDateTime::now().unix_timestamp_nanos() / 1_000_000).max(0) as u64;
        let mut last = LAST_TIMESTAMP.load(Ordering::Relaxed);
        loop {
            let next = wall.max(last + 1);
            match LAST_TIMESTAMP.compare_exchange_weak(
                last,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Self(next),
                Err(actual) => last = actual,
            }
        }
    }

    pub const fn from_millis(millis: u64) -> Self { Self(millis) }

    pub const fn as_millis(self) -> u64 { self.0 }

    pub fn to_datetime(self) -> UtcDateTime {
        UtcDateTime::from_unix_timestamp_nanos(self.0 as i128 * 1_000_000)
            .unwrap_or(UtcDateTime::UNIX_EPOCH)
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.0) }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum LogLevel {
    Info,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Self::Info),
            "error" => Ok(Self::Error),
            _ => Err(()),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

/// Append-only record of what happened while handling one triggering event.
///
/// Clones share the same entries, so the request handler and the job body it
/// starts append to one log. A log holding an `error` entry must end up at the
/// escalation path; it is never dropped quietly.
#[derive(Debug, Clone, Default)]
pub struct RunLog {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl RunLog {
    pub fn new() -> Self { Self::default() }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{message}");
        self.push(LogLevel::Info, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{message}");
        self.push(LogLevel::Error, message);
    }

    fn push(&self, level: LogLevel, message: String) {
        self.lock().push(LogEntry { level, message });
    }

    fn lock(&self) -> MutexGuard<'_, Vec<LogEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the entries in the order they were appended.
    pub fn entries(&self) -> Vec<LogEntry> { self.lock().clone() }

    pub fn len(&self) -> usize { self.lock().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamps_strictly_increase() {
        let mut last = TimeStamp::now();
        for _ in 0..1000 {
            let next = TimeStamp::now();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn test_timestamp_datetime() {
        let ts = TimeStamp::from_millis(1_700_000_000_123);
        assert_eq!(ts.to_datetime().unix_timestamp(), 1_700_000_000);
        assert_eq!(ts.to_string(), "1700000000123");
    }

    #[test]
    fn test_run_log_shared_between_clones() {
        let log = RunLog::new();
        let job_log = log.clone();
        log.info("accepted");
        job_log.error("step failed");
        assert_eq!(log.entries(), vec![
            LogEntry { level: LogLevel::Info, message: "accepted".into() },
            LogEntry { level: LogLevel::Error, message: "step failed".into() },
        ]);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_log_level_round_trip() {
        for level in [LogLevel::Info, LogLevel::Error] {
            assert_eq!(level.as_str().parse::<LogLevel>(), Ok(level));
        }
        assert!("warn".parse::<LogLevel>().is_err());
    }
}
