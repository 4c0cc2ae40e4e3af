//! Human readable elapsed-time strings for job listings.

use chrono::{DateTime, Utc};

/// Formats the time elapsed between `reference` and now.
///
/// See [`display_duration_at`].
pub fn display_duration(reference: DateTime<Utc>) -> String {
    display_duration_at(reference, Utc::now())
}

/// Formats `|now - reference|` rounded to whole seconds as `MM:SSs`, or
/// `HH:MM:SSs` once it reaches an hour. Hours are padded to two digits but
/// never truncated.
pub fn display_duration_at(reference: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed_millis = (now - reference).num_milliseconds().unsigned_abs();
    let total_seconds = (elapsed_millis + 500) / 1000;

    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours == 0 {
        format!("{:02}:{:02}s", minutes, seconds)
    } else {
        format!("{:02}:{:02}:{:02}s", hours, minutes, seconds)
    }
}
