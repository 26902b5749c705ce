//! Parser for the encoder's `-progress pipe:1` key=value protocol.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProgressEvent {
    Elapsed(Duration),
    End,
}

/// `out_time_ms` carries microseconds despite its name.
pub fn parse_line(line: &str) -> Option<ProgressEvent> {
    let (key, value) = line.trim().split_once('=')?;
    match key.trim() {
        "out_time_ms" => value
            .trim()
            .parse::<u64>()
            .ok()
            .map(|micros| ProgressEvent::Elapsed(Duration::from_micros(micros))),
        "progress" if value.trim() == "end" => Some(ProgressEvent::End),
        _ => None,
    }
}

/// Percentage of `total` covered by `elapsed`, capped at 100.
pub fn percent(elapsed: Duration, total: Duration) -> f64 {
    if total.is_zero() {
        return 0.0;
    }
    (elapsed.as_secs_f64() / total.as_secs_f64() * 100.0).min(100.0)
}
