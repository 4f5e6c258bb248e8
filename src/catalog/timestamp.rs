use crate::remote::RemoteStat;
use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

static NAME_TIMESTAMP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<stamp>\d{8}_\d{6})").expect("filename timestamp pattern is valid")
});

/// Where an entry's capture time came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CaptureTimeSource {
    BirthTime,
    ModifiedTime,
    FileName,
    Fallback,
}

/// Reads a `YYYYMMDD_HHMMSS` token out of a file name as UTC.
pub fn timestamp_from_file_name(name: &str) -> Option<DateTime<Utc>> {
    NAME_TIMESTAMP
        .captures_iter(name)
        .filter_map(|caps| caps.name("stamp"))
        .find_map(|stamp| NaiveDateTime::parse_from_str(stamp.as_str(), "%Y%m%d_%H%M%S").ok())
        .map(|naive| naive.and_utc())
}

/// Best-effort capture time: birth time, then modification time, then the
/// file name, then `now`.
pub fn resolve_capture_time(
    stat: &RemoteStat,
    file_name: &str,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, CaptureTimeSource) {
    if let Some(birth) = stat.birth_time {
        return (birth, CaptureTimeSource::BirthTime);
    }
    if let Some(modified) = stat.modified {
        return (modified, CaptureTimeSource::ModifiedTime);
    }
    if let Some(named) = timestamp_from_file_name(file_name) {
        return (named, CaptureTimeSource::FileName);
    }
    (now, CaptureTimeSource::Fallback)
}
