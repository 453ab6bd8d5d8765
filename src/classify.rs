use crate::models::{LogLevel, LogSource};

/// Severity of one output line. First matching rule wins:
/// stderr, then "error"/"fail", then "warn", then "debug", else info.
pub fn classify(line: &str, source: LogSource) -> LogLevel {
    if source == LogSource::Stderr {
        return LogLevel::Error;
    }

    let lower = line.trim().to_lowercase();
    if lower.contains("error") || lower.contains("fail") {
        LogLevel::Error
    } else if lower.contains("warn") {
        LogLevel::Warn
    } else if lower.contains("debug") {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Trimmed, non-empty lines of an output chunk.
pub fn split_lines(chunk: &str) -> impl Iterator<Item = &str> {
    chunk.lines().map(str::trim).filter(|line| !line.is_empty())
}
