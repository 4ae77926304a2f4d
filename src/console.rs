use std::fmt::{self, Display};

use chrono::{DateTime, Local, NaiveTime, TimeZone, Utc};
use regex::Regex;
use uuid::Uuid;

/// Identifies which process stream produced a line of output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Stdout,
    Stderr,
}

/// A single line of server console output along with its origin stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleLine {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub line: String,
    pub source: StreamSource,
}

impl ConsoleLine {
    pub fn new<S: Into<String>>(line: S, source: StreamSource) -> Self {
        let line = line.into();
        let timestamp = extract_timestamp(&line).unwrap_or_else(Utc::now);
        Self {
            id: Uuid::new_v4(),
            timestamp,
            line,
            source,
        }
    }

    pub fn stdout<S: Into<String>>(line: S) -> Self {
        Self::new(line, StreamSource::Stdout)
    }

    pub fn stderr<S: Into<String>>(line: S) -> Self {
        Self::new(line, StreamSource::Stderr)
    }
}

impl Display for ConsoleLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.line)
    }
}

/// Lifts the `[HH:MM:SS]` prefix the vanilla server prints into a wall-clock
/// timestamp, assuming today's date in the local zone.
fn extract_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let re = Regex::new(r"^\[(\d{2}:\d{2}:\d{2})\]").unwrap();
    let time_s = re.captures(input).map(|v| v[1].to_string())?;
    let time = NaiveTime::parse_from_str(&time_s, "%H:%M:%S").ok()?;

    let today = Local::now().date_naive();
    let local_dt = Local.from_local_datetime(&today.and_time(time)).single()?;

    Some(local_dt.with_timezone(&Utc))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Other,
}

/// Structured form of a vanilla server log line:
/// `[12:34:56] [Server thread/INFO]: message`.
#[derive(Debug, Clone)]
pub struct LogMeta {
    pub time: String,
    pub thread: String,
    pub level: LogLevel,
    pub msg: String,
}

impl LogMeta {
    /// Returns `None` for lines that do not match the vanilla log shape
    /// (stack traces, mod output, blank lines).
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();

        if !line.starts_with('[') {
            return None;
        }

        let time_end = line.find(']')?;
        let time = line[1..time_end].to_string();

        let meta_start = time_end + 1 + line[time_end + 1..].find('[')?;
        let msg_sep = meta_start + line[meta_start..].find("]: ")?;

        let meta = &line[(meta_start + 1)..msg_sep];
        let msg = line[(msg_sep + 3)..].to_string();

        let (thread, level_str) = meta.split_once('/')?;

        let level = match level_str {
            "INFO" => LogLevel::Info,
            "WARN" => LogLevel::Warn,
            "ERROR" => LogLevel::Error,
            _ => LogLevel::Other,
        };

        Some(LogMeta {
            time,
            thread: thread.to_string(),
            level,
            msg,
        })
    }

    /// True once the server reports `Done (x.xs)!` on its main thread, which
    /// is the earliest point it accepts connections.
    pub fn is_ready_marker(&self) -> bool {
        if self.thread != "Server thread" || self.level != LogLevel::Info {
            return false;
        }
        let re = Regex::new(r"^Done \([0-9.]+s\)!").unwrap();
        re.is_match(&self.msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vanilla_log_line() {
        let meta =
            LogMeta::parse("[12:34:56] [Server thread/INFO]: Preparing level \"world\"").unwrap();
        assert_eq!(meta.time, "12:34:56");
        assert_eq!(meta.thread, "Server thread");
        assert_eq!(meta.level, LogLevel::Info);
        assert_eq!(meta.msg, "Preparing level \"world\"");
    }

    #[test]
    fn detects_ready_marker() {
        let meta = LogMeta::parse(
            "[12:34:56] [Server thread/INFO]: Done (12.345s)! For help, type \"help\"",
        )
        .unwrap();
        assert!(meta.is_ready_marker());
    }

    #[test]
    fn done_on_other_thread_is_not_ready() {
        let meta = LogMeta::parse("[12:34:56] [Worker-1/INFO]: Done (1.0s)!").unwrap();
        assert!(!meta.is_ready_marker());
    }

    #[test]
    fn non_log_lines_are_skipped() {
        assert!(LogMeta::parse("at net.minecraft.server.MinecraftServer.run").is_none());
        assert!(LogMeta::parse("").is_none());
    }

    #[test]
    fn console_line_keeps_text() {
        let line = ConsoleLine::stdout("[00:00:01] [Server thread/INFO]: hello");
        assert_eq!(line.source, StreamSource::Stdout);
        assert!(line.line.contains("hello"));
    }
}
