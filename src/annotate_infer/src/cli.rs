//! Command line helpers shared by the binaries.

use std::time::Duration;

/// Logs to stderr; stdout carries protocol frames in the worker processes.
pub fn init_logger() {
    let mut builder = env_logger::Builder::from_default_env();
    builder
        .format_timestamp_micros()
        .target(env_logger::Target::Stderr)
        .init();
}

/// Parses `value[s|ms|us|ns]`, e.g. `250ms`.
pub fn parse_duration(s: &str) -> Option<Duration> {
    if let Some(idx) = s.find("ns") {
        s[..idx].parse().ok().map(Duration::from_nanos)
    } else if let Some(idx) = s.find("us") {
        s[..idx].parse().ok().map(Duration::from_micros)
    } else if let Some(idx) = s.find("ms") {
        s[..idx].parse().ok().map(Duration::from_millis)
    } else if let Some(idx) = s.find('s') {
        s[..idx].parse().ok().map(Duration::from_secs)
    } else {
        None
    }
}
