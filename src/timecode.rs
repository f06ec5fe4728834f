//! Timestamp and duration parsing for model-produced analysis documents.
//!
//! The Analysis Service is asked for `MM:SS` / `HH:MM:SS` timestamps, but in
//! practice its duration fields drift into prose ("12 minutes", "~5 min",
//! bare numbers, "Unknown"). Everything here is total: unparseable input maps
//! to `None` or zero rather than an error, because a single sloppy field must
//! not sink a merge.

/// Parse `MM:SS` or `HH:MM:SS` into seconds.
pub fn parse_timestamp(raw: &str) -> Option<u64> {
    let parts: Vec<&str> = raw.trim().split(':').collect();
    match parts.as_slice() {
        [m, s] => {
            let minutes: u64 = m.trim().parse().ok()?;
            let seconds: u64 = s.trim().parse().ok()?;
            (seconds < 60).then_some(minutes * 60 + seconds)
        }
        [h, m, s] => {
            let hours: u64 = h.trim().parse().ok()?;
            let minutes: u64 = m.trim().parse().ok()?;
            let seconds: u64 = s.trim().parse().ok()?;
            (seconds < 60 && minutes < 60).then_some(hours * 3600 + minutes * 60 + seconds)
        }
        _ => None,
    }
}

/// Format seconds as `HH:MM:SS`.
pub fn format_timestamp(total_secs: u64) -> String {
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Parse a loosely-formatted duration into seconds.
///
/// Accepts timestamp forms (`MM:SS`, `HH:MM:SS`), minute prose
/// (`"12 minutes"`, `"~5 min"`), bare numbers treated as minutes, and the
/// literal `"Unknown"`, which is zero.
pub fn parse_duration_secs(raw: &str) -> u64 {
    let cleaned = raw.trim().trim_start_matches('~').trim();
    if cleaned.is_empty() || cleaned.eq_ignore_ascii_case("unknown") {
        return 0;
    }

    if cleaned.contains(':') {
        return parse_timestamp(cleaned).unwrap_or(0);
    }

    let numeric = cleaned
        .trim_end_matches("minutes")
        .trim_end_matches("minute")
        .trim_end_matches("mins")
        .trim_end_matches("min")
        .trim();

    match numeric.parse::<f64>() {
        Ok(minutes) if minutes.is_finite() && minutes >= 0.0 => (minutes * 60.0).round() as u64,
        _ => 0,
    }
}

/// Shift a relative `MM:SS`/`HH:MM:SS` timestamp by an absolute offset.
///
/// Unparseable input is passed through unchanged so the caller keeps whatever
/// the model said instead of fabricating `00:00:00`.
pub fn translate_timestamp(raw: &str, offset_secs: u64) -> String {
    match parse_timestamp(raw) {
        Some(relative) => format_timestamp(relative + offset_secs),
        None => raw.to_string(),
    }
}
