use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone};

use crate::models::recording_type::RecordingType;

/// Timestamp layout used in output file names.
pub const FILE_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Deterministic file name for a session: `{type}_{YYYYmmdd_HHMMSS}.{ext}`.
pub fn file_name<Tz: TimeZone>(recording_type: RecordingType, started: &DateTime<Tz>, extension: &str) -> String
where
    Tz::Offset: std::fmt::Display,
{
    format!(
        "{}_{}.{}",
        recording_type.label(),
        started.format(FILE_TIMESTAMP_FORMAT),
        extension
    )
}

/// Pick a path in `dir` that does not exist yet.
///
/// Two sessions of the same type started within one second would share a
/// name; the later one gets `_2`, `_3`, … appended to the stem. The writer
/// opens with `create_new`, so a file that appears between this check and the
/// open is never overwritten.
pub fn allocate_output_path<Tz: TimeZone>(
    dir: &Path,
    recording_type: RecordingType,
    started: &DateTime<Tz>,
    extension: &str,
) -> PathBuf
where
    Tz::Offset: std::fmt::Display,
{
    let first = dir.join(file_name(recording_type, started, extension));
    if !first.exists() {
        return first;
    }

    let stem = format!("{}_{}", recording_type.label(), started.format(FILE_TIMESTAMP_FORMAT));
    let mut suffix = 2u32;
    loop {
        let candidate = dir.join(format!("{stem}_{suffix}.{extension}"));
        if !candidate.exists() {
            log::debug!("{} taken, using {}", first.display(), candidate.display());
            return candidate;
        }
        suffix += 1;
    }
}
